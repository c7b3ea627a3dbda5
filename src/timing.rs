//! Monotonic timing of blocking group operations.
//!
//! Every send, receive, probe and gather that feeds the statistics is wrapped
//! by [`timed`]: one `Instant` right before the call, one right after.
//! `Instant` is monotonic and `elapsed` saturates, so a sample can never be
//! negative.

use std::fmt;
use std::future::Future;
use std::time::{Duration, Instant};

/// Await `operation` and return its output together with the elapsed time
pub async fn timed<F>(operation: F) -> (F::Output, Duration)
where
    F: Future,
{
    let start = Instant::now();
    let output = operation.await;
    (output, start.elapsed())
}

/// Share of a delay left to the loop in [`precise_sleep`]; the tokio timer
/// fires on millisecond ticks and may overshoot by one
const TIMER_SLACK: Duration = Duration::from_millis(2);

/// Sleep for `delay` with microsecond resolution
///
/// The bulk of a long delay is spent on the tokio timer. The remainder is a
/// loop that yields to other tasks until the deadline, so ranks sharing a
/// runtime keep making progress.
pub async fn precise_sleep(delay: Duration) {
    let deadline = Instant::now() + delay;
    if delay > TIMER_SLACK {
        tokio::time::sleep(delay - TIMER_SLACK).await;
    }
    while Instant::now() < deadline {
        tokio::task::yield_now().await;
    }
}

/// Split a duration into whole seconds and the nanosecond remainder
pub fn split(duration: Duration) -> (u64, u32) {
    (duration.as_secs(), duration.subsec_nanos())
}

/// Duration as floating point seconds, the unit of every statistic
pub fn seconds(duration: Duration) -> f64 {
    duration.as_secs_f64()
}

/// `seconds.nanoseconds` rendering used by the informational report lines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecNanos(pub Duration);

impl fmt::Display for SecNanos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (secs, nanos) = split(self.0);
        write!(f, "{}.{:09}", secs, nanos)
    }
}
