//! # Sweep Driver
//!
//! Runs the configured number of trials for every message size of the sweep
//! and turns them into one cluster record per size.
//!
//! ## Phase Lifecycle
//!
//! 1. **Allocate**: one envelope of the phase size, random-filled once by the
//!    originator when requested
//! 2. **Measure**: every trial goes through the run mode's [`TrialHandler`]
//!    and its legs are recorded
//! 3. **Reduce**: each rank reduces its own samples into a [`RankSummary`]
//! 4. **Aggregate**: the summaries are gathered at rank 0 (timed) and combined
//!    into a [`ClusterRecord`]
//!
//! The envelope is dropped at the end of the phase. The trial sequence tag
//! keeps increasing across phases for the whole run.
//!
//! ## Message Sizes
//!
//! Sizes are `i32` element counts: every power of two from `2^min_exp` to
//! `2^max_exp`, each followed by the midpoint to the next power
//! (16, 24, 32, 48, 64, 96, ...).

use crate::cli::Settings;
use crate::envelope::{Envelope, MIN_LEN};
use crate::error::RingResult;
use crate::ipc::{gather_value, GroupComm, Topology};
use crate::metrics::{PhaseSamples, RankSummary};
use crate::results::{ClusterRecord, ResultsManager};
use crate::ring::{handler_for, RoundTrip, TrialHandler};
use crate::timing::{timed, SecNanos};
use crate::utils::{format_bytes, format_duration};
use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Message sizes of a sweep, strictly increasing
///
/// Returns an empty sweep when `min_exp > max_exp`.
pub fn message_sizes(min_exp: u32, max_exp: u32) -> Vec<usize> {
    let mut sizes = Vec::new();
    for exp in min_exp..=max_exp {
        let power = 1usize << exp;
        sizes.push(power);
        if exp < max_exp {
            sizes.push(power + power / 2);
        }
    }
    sizes.retain(|&size| size >= MIN_LEN);
    sizes.dedup();
    sizes
}

/// Outcome of one phase at the coordinator
#[derive(Debug, Clone)]
pub struct PhaseReport {
    pub record: ClusterRecord,
    /// Time the coordinator spent gathering every rank's summary
    pub gather_time: Duration,
}

/// Drives the message-size sweep on one rank
pub struct SweepRunner {
    settings: Settings,
    engine: RoundTrip,
    handler: Box<dyn TrialHandler>,
    rng: StdRng,
    sequence: i32,
}

impl SweepRunner {
    pub fn new(settings: &Settings, topology: Topology) -> Self {
        Self {
            settings: settings.clone(),
            engine: RoundTrip::new(topology),
            handler: handler_for(settings.mode, settings.wait()),
            rng: StdRng::seed_from_u64(settings.seed),
            sequence: 0,
        }
    }

    pub fn topology(&self) -> Topology {
        self.engine.topology()
    }

    /// Sequence tag the next trial will carry
    pub fn next_sequence(&self) -> i32 {
        self.sequence
    }

    /// Run every trial of one message size on this rank
    ///
    /// Returns this rank's reduced summary. Fails on the first fatal error;
    /// no samples of the phase are kept in that case.
    pub async fn measure_phase(
        &mut self,
        comm: &mut dyn GroupComm,
        size: usize,
    ) -> RingResult<RankSummary> {
        let mut envelope = Envelope::new(size);
        if self.settings.random_fill && self.topology().is_coordinator() {
            envelope.fill_random(&mut self.rng);
        }

        let mut samples = PhaseSamples::with_capacity(self.settings.trials);
        for _ in 0..self.settings.trials {
            let legs = self
                .handler
                .run_trial(&self.engine, comm, &mut envelope, self.sequence)
                .await?;
            samples.record(&legs);
            self.sequence = self.sequence.wrapping_add(1);
        }
        Ok(samples.reduce())
    }

    /// Measure, reduce and aggregate one message size
    ///
    /// Returns `Some` at the coordinator and `None` on every other rank.
    pub async fn run_phase(
        &mut self,
        comm: &mut dyn GroupComm,
        size: usize,
    ) -> Result<Option<PhaseReport>> {
        let started = Instant::now();
        let summary = self.measure_phase(comm, size).await?;
        debug!(
            "Size {} ({}): {} trials in {}",
            size,
            format_bytes(size * std::mem::size_of::<i32>()),
            self.settings.trials,
            format_duration(started.elapsed())
        );

        let (gathered, gather_time) = timed(gather_value(comm, &summary)).await;
        match gathered? {
            Some(summaries) => {
                let record = ClusterRecord::aggregate(size, &summaries)?;
                Ok(Some(PhaseReport {
                    record,
                    gather_time,
                }))
            }
            None => Ok(None),
        }
    }

    /// Run the whole sweep
    ///
    /// At the coordinator every record is reported through `results` (when
    /// given) and returned; other ranks return an empty list.
    pub async fn run(
        &mut self,
        comm: &mut dyn GroupComm,
        mut results: Option<&mut ResultsManager>,
    ) -> Result<Vec<ClusterRecord>> {
        let sizes = message_sizes(self.settings.min_exp, self.settings.max_exp);
        let rank = self.topology().rank();
        if self.topology().is_coordinator() {
            info!(
                "Sweeping {} message sizes ({}..={}) with {} trials each in {} mode",
                sizes.len(),
                sizes.first().copied().unwrap_or(0),
                sizes.last().copied().unwrap_or(0),
                self.settings.trials,
                self.settings.mode
            );
        }

        let mut records = Vec::new();
        for size in sizes {
            let report = self
                .run_phase(comm, size)
                .await
                .with_context(|| format!("Rank {} failed at message size {}", rank, size))?;

            if let Some(report) = report {
                if let Some(results) = results.as_deref_mut() {
                    results.note(format_args!(
                        "Time for gather {}",
                        SecNanos(report.gather_time)
                    ))?;
                    results.add_record(report.record.clone())?;
                }
                records.push(report.record);
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::RunMode;
    use crate::ipc::local_group;

    #[test]
    fn test_default_sweep() {
        let sizes = message_sizes(4, 14);
        assert_eq!(&sizes[..6], &[16, 24, 32, 48, 64, 96]);
        assert_eq!(sizes.last(), Some(&16384));
        assert_eq!(sizes.len(), 21);
        assert!(sizes.windows(2).all(|w| w[0] < w[1]));
        for exp in 4..=14 {
            assert!(sizes.contains(&(1 << exp)));
        }
    }

    #[test]
    fn test_sweep_edges() {
        assert_eq!(message_sizes(5, 5), vec![32]);
        assert!(message_sizes(6, 5).is_empty());
        // 1 and 2 are shorter than the smallest envelope
        assert_eq!(message_sizes(0, 2), vec![3, 4]);
    }

    async fn run_local(settings: Settings) -> Vec<Vec<ClusterRecord>> {
        let handles: Vec<_> = local_group(settings.ranks)
            .unwrap()
            .into_iter()
            .map(|mut comm| {
                let settings = settings.clone();
                tokio::spawn(async move {
                    let mut runner = SweepRunner::new(&settings, comm.topology());
                    let records = runner.run(&mut comm, None).await.unwrap();
                    let expected = settings.trials
                        * message_sizes(settings.min_exp, settings.max_exp).len();
                    assert_eq!(runner.next_sequence() as usize, expected);
                    records
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
    async fn test_sweep_produces_one_record_per_size_at_coordinator() {
        let settings = Settings {
            trials: 5,
            ranks: 3,
            min_exp: 4,
            max_exp: 6,
            mode: RunMode::SizeProbed,
            random_fill: true,
            ..Settings::default()
        };
        let per_rank = run_local(settings).await;

        let sizes: Vec<usize> = per_rank[0].iter().map(|r| r.message_size).collect();
        assert_eq!(sizes, vec![16, 24, 32, 48, 64]);
        assert!(per_rank[1..].iter().all(Vec::is_empty));

        for record in &per_rank[0] {
            assert!(record.probe.max > 0.0);
            assert!(record.outlier_ranks().iter().all(|&r| r < 3));
        }
    }

    #[tokio::test]
    async fn test_plain_mode_never_probes() {
        let settings = Settings {
            trials: 3,
            ranks: 2,
            min_exp: 4,
            max_exp: 4,
            ..Settings::default()
        };
        let per_rank = run_local(settings).await;
        let record = &per_rank[0][0];
        assert_eq!(record.probe.max, 0.0);
        assert_eq!(record.probe.mean, 0.0);
        assert!(record.receive.max >= record.receive.min);
    }
}
