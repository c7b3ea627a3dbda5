//! # Round-Trip Engine
//!
//! One trial moves the envelope once around the ring:
//!
//! ```text
//!   rank 0 ──send──▶ rank 1 ──send──▶ ... ──send──▶ rank n-1
//!     ▲                                                │
//!     └──────────────────── receive ◀──────────────────┘
//! ```
//!
//! Rank 0 (the originator) stamps the envelope, sends it to its successor and
//! blocks until the last rank hands it back, so its receive time covers the
//! full ring. Every other rank (a relay) receives from its predecessor and
//! forwards the same buffer to its successor. A group of `size` ranks makes
//! exactly `size` transfers per trial.
//!
//! The four run modes wrap this traversal. Each mode has its own
//! [`TrialHandler`], picked once per run by [`handler_for`].

use crate::cli::RunMode;
use crate::envelope::{Envelope, RING_TAG};
use crate::error::{RingError, RingResult};
use crate::ipc::{GroupComm, Topology};
use crate::timing::{precise_sleep, timed};
use async_trait::async_trait;
use std::time::Duration;
use tracing::trace;

/// Per-leg timing of one trial on one rank
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LegTimes {
    pub send: Duration,
    pub receive: Duration,
    /// Zero when the mode does not probe
    pub probe: Duration,
}

/// Executes ring traversals for one rank
#[derive(Debug, Clone, Copy)]
pub struct RoundTrip {
    topology: Topology,
}

impl RoundTrip {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Move `envelope` once around the ring
    ///
    /// With `probe` set, the incoming length is probed (and timed) before the
    /// receive and must equal the envelope length.
    pub async fn traverse(
        &self,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
        probe: bool,
    ) -> RingResult<LegTimes> {
        if self.topology.is_coordinator() {
            self.originate(comm, envelope, sequence, probe).await
        } else {
            self.relay(comm, envelope, probe).await
        }
    }

    async fn originate(
        &self,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
        probe: bool,
    ) -> RingResult<LegTimes> {
        let mut legs = LegTimes::default();
        envelope.stamp(sequence);

        let (sent, elapsed) = timed(comm.send(
            self.topology.successor(),
            RING_TAG,
            envelope.as_slice(),
        ))
        .await;
        sent?;
        legs.send = elapsed;

        let source = self.topology.last_rank();
        if probe {
            legs.probe = self.probe_length(comm, source, envelope.len()).await?;
        }

        let (received, elapsed) =
            timed(comm.receive(source, RING_TAG, envelope.as_mut_slice())).await;
        received?;
        legs.receive = elapsed;

        envelope.verify(self.topology.rank(), sequence)?;
        trace!("Trial {} completed the ring", sequence);
        Ok(legs)
    }

    async fn relay(
        &self,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        probe: bool,
    ) -> RingResult<LegTimes> {
        let mut legs = LegTimes::default();
        let source = self.topology.predecessor();

        if probe {
            legs.probe = self.probe_length(comm, source, envelope.len()).await?;
        }

        let (received, elapsed) =
            timed(comm.receive(source, RING_TAG, envelope.as_mut_slice())).await;
        received?;
        legs.receive = elapsed;

        let (sent, elapsed) = timed(comm.send(
            self.topology.successor(),
            RING_TAG,
            envelope.as_slice(),
        ))
        .await;
        sent?;
        legs.send = elapsed;

        Ok(legs)
    }

    async fn probe_length(
        &self,
        comm: &mut dyn GroupComm,
        source: usize,
        expected: usize,
    ) -> RingResult<Duration> {
        let (probed, elapsed) = timed(comm.probe_size(source, RING_TAG)).await;
        let probed = probed?;
        if probed != expected {
            return Err(RingError::SizeMismatch {
                rank: self.topology.rank(),
                probed,
                expected,
            });
        }
        Ok(elapsed)
    }
}

/// Per-mode behaviour wrapped around one traversal
#[async_trait]
pub trait TrialHandler: Send + Sync {
    fn mode(&self) -> RunMode;

    async fn run_trial(
        &self,
        engine: &RoundTrip,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
    ) -> RingResult<LegTimes>;
}

/// Traversal with nothing added
pub struct PlainTrial;

/// Traversal with a length probe before every receive
pub struct SizeProbedTrial;

/// Barrier, then a size-probed traversal
pub struct SynchronizedTrial;

/// Sleep, then a plain traversal
pub struct DelayPrefixedTrial {
    pub delay: Duration,
}

#[async_trait]
impl TrialHandler for PlainTrial {
    fn mode(&self) -> RunMode {
        RunMode::Plain
    }

    async fn run_trial(
        &self,
        engine: &RoundTrip,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
    ) -> RingResult<LegTimes> {
        engine.traverse(comm, envelope, sequence, self.mode().probes()).await
    }
}

#[async_trait]
impl TrialHandler for SizeProbedTrial {
    fn mode(&self) -> RunMode {
        RunMode::SizeProbed
    }

    async fn run_trial(
        &self,
        engine: &RoundTrip,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
    ) -> RingResult<LegTimes> {
        engine.traverse(comm, envelope, sequence, self.mode().probes()).await
    }
}

#[async_trait]
impl TrialHandler for SynchronizedTrial {
    fn mode(&self) -> RunMode {
        RunMode::Synchronized
    }

    async fn run_trial(
        &self,
        engine: &RoundTrip,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
    ) -> RingResult<LegTimes> {
        comm.barrier().await?;
        engine.traverse(comm, envelope, sequence, self.mode().probes()).await
    }
}

#[async_trait]
impl TrialHandler for DelayPrefixedTrial {
    fn mode(&self) -> RunMode {
        RunMode::DelayPrefixed
    }

    async fn run_trial(
        &self,
        engine: &RoundTrip,
        comm: &mut dyn GroupComm,
        envelope: &mut Envelope,
        sequence: i32,
    ) -> RingResult<LegTimes> {
        precise_sleep(self.delay).await;
        engine.traverse(comm, envelope, sequence, self.mode().probes()).await
    }
}

/// Pick the handler for a run
pub fn handler_for(mode: RunMode, delay: Duration) -> Box<dyn TrialHandler> {
    match mode {
        RunMode::Plain => Box::new(PlainTrial),
        RunMode::SizeProbed => Box::new(SizeProbedTrial),
        RunMode::Synchronized => Box::new(SynchronizedTrial),
        RunMode::DelayPrefixed => Box::new(DelayPrefixedTrial { delay }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{END_SENTINEL, START_SENTINEL};
    use crate::ipc::local_group;
    use std::time::Instant;

    #[tokio::test]
    async fn test_delay_prefixed_waits_microseconds_not_timer_ticks() {
        let mut comm = local_group(1).unwrap().pop().unwrap();
        let engine = RoundTrip::new(comm.topology());
        let delay = Duration::from_micros(20);
        let handler = handler_for(RunMode::DelayPrefixed, delay);
        let mut envelope = Envelope::new(16);

        let trials = 100;
        let start = Instant::now();
        for sequence in 0..trials {
            handler
                .run_trial(&engine, &mut comm, &mut envelope, sequence)
                .await
                .unwrap();
        }
        let per_trial = start.elapsed() / trials as u32;
        assert!(per_trial >= delay);
        assert!(per_trial < Duration::from_micros(500), "{:?}", per_trial);
    }

    async fn run_ring(size: usize, len: usize, mode: RunMode) -> Vec<(LegTimes, Envelope)> {
        let group = local_group(size).unwrap();
        let handles: Vec<_> = group
            .into_iter()
            .map(|mut comm| {
                tokio::spawn(async move {
                    let engine = RoundTrip::new(comm.topology());
                    let handler = handler_for(mode, Duration::from_micros(10));
                    let mut envelope = Envelope::new(len);
                    let legs = handler
                        .run_trial(&engine, &mut comm, &mut envelope, 5)
                        .await
                        .unwrap();
                    (legs, envelope)
                })
            })
            .collect();

        let mut out = Vec::new();
        for handle in handles {
            out.push(handle.await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_envelope_returns_intact_in_every_mode() {
        for mode in [
            RunMode::Plain,
            RunMode::SizeProbed,
            RunMode::Synchronized,
            RunMode::DelayPrefixed,
        ] {
            let results = run_ring(4, 16, mode).await;
            let (_, returned) = &results[0];
            assert_eq!(returned.as_slice()[0], START_SENTINEL, "{:?}", mode);
            assert_eq!(returned.as_slice()[15], END_SENTINEL, "{:?}", mode);
            assert_eq!(returned.sequence(), 5, "{:?}", mode);

            // Relays forward exactly what the originator sent
            for (_, relayed) in &results[1..] {
                assert_eq!(relayed, returned, "{:?}", mode);
            }
        }
    }

    #[tokio::test]
    async fn test_probe_time_only_recorded_when_probing() {
        let results = run_ring(3, 8, RunMode::Plain).await;
        assert!(results.iter().all(|(legs, _)| legs.probe == Duration::ZERO));
    }

    #[tokio::test]
    async fn test_single_rank_ring_talks_to_itself() {
        let results = run_ring(1, 3, RunMode::SizeProbed).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.verify(0, 5).is_ok());
    }

    #[tokio::test]
    async fn test_relay_detects_size_mismatch() {
        let mut group = local_group(2).unwrap();
        let mut relay = group.pop().unwrap();
        let mut origin = group.pop().unwrap();

        origin.send(1, RING_TAG, &[START_SENTINEL, 0, 0, END_SENTINEL]).await.unwrap();

        let engine = RoundTrip::new(relay.topology());
        let mut envelope = Envelope::new(6);
        match engine.traverse(&mut relay, &mut envelope, 0, true).await {
            Err(RingError::SizeMismatch {
                rank,
                probed,
                expected,
            }) => {
                assert_eq!(rank, 1);
                assert_eq!(probed, 4);
                assert_eq!(expected, 6);
            }
            other => panic!("expected size mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_handler_for_matches_mode() {
        for mode in [
            RunMode::Plain,
            RunMode::SizeProbed,
            RunMode::Synchronized,
            RunMode::DelayPrefixed,
        ] {
            assert_eq!(handler_for(mode, Duration::ZERO).mode(), mode);
        }
    }
}
