use crate::ring::LegTimes;
use crate::timing::seconds;
use serde::{Deserialize, Serialize};

/// Timed operation of a trial
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Send,
    Receive,
    Probe,
}

impl Operation {
    /// Report order of the operation groups
    pub const ALL: [Operation; 3] = [Operation::Send, Operation::Receive, Operation::Probe];
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Send => write!(f, "send"),
            Operation::Receive => write!(f, "receive"),
            Operation::Probe => write!(f, "probe"),
        }
    }
}

/// Summary of one operation's samples, in seconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SummaryStats {
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub median: f64,
    pub variance: f64,
}

impl SummaryStats {
    /// Reduce samples (seconds) to max, min, mean, median and sample variance
    ///
    /// Sorts `samples` in place. An empty slice reduces to all zeros and a
    /// single sample has zero variance.
    pub fn from_samples(samples: &mut [f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        samples.sort_by(|a, b| a.total_cmp(b));

        let n = samples.len();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let median = if n % 2 == 0 {
            (samples[n / 2 - 1] + samples[n / 2]) / 2.0
        } else {
            samples[n / 2]
        };
        let variance = if n > 1 {
            samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (n - 1) as f64
        } else {
            0.0
        };

        Self {
            max: samples[n - 1],
            min: samples[0],
            mean,
            median,
            variance,
        }
    }

    /// (max, min, mean, median, variance)
    pub fn to_array(&self) -> [f64; 5] {
        [self.max, self.min, self.mean, self.median, self.variance]
    }
}

/// One rank's summaries for one message size
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RankSummary {
    pub send: SummaryStats,
    pub receive: SummaryStats,
    pub probe: SummaryStats,
}

impl RankSummary {
    pub fn get(&self, operation: Operation) -> &SummaryStats {
        match operation {
            Operation::Send => &self.send,
            Operation::Receive => &self.receive,
            Operation::Probe => &self.probe,
        }
    }

    /// The 15 scalars gathered to the coordinator: send, receive, probe groups
    /// of (max, min, mean, median, variance)
    pub fn to_vector(&self) -> [f64; 15] {
        let mut out = [0.0; 15];
        for (i, op) in Operation::ALL.iter().enumerate() {
            out[i * 5..i * 5 + 5].copy_from_slice(&self.get(*op).to_array());
        }
        out
    }
}

/// Duration samples of every trial of one phase on one rank
#[derive(Debug, Clone, Default)]
pub struct PhaseSamples {
    send: Vec<f64>,
    receive: Vec<f64>,
    probe: Vec<f64>,
}

impl PhaseSamples {
    pub fn with_capacity(trials: usize) -> Self {
        Self {
            send: Vec::with_capacity(trials),
            receive: Vec::with_capacity(trials),
            probe: Vec::with_capacity(trials),
        }
    }

    /// Record the legs of one trial
    pub fn record(&mut self, legs: &LegTimes) {
        self.send.push(seconds(legs.send));
        self.receive.push(seconds(legs.receive));
        self.probe.push(seconds(legs.probe));
    }

    pub fn len(&self) -> usize {
        self.send.len()
    }

    pub fn is_empty(&self) -> bool {
        self.send.is_empty()
    }

    /// Reduce every operation's samples into a [`RankSummary`]
    pub fn reduce(mut self) -> RankSummary {
        RankSummary {
            send: SummaryStats::from_samples(&mut self.send),
            receive: SummaryStats::from_samples(&mut self.receive),
            probe: SummaryStats::from_samples(&mut self.probe),
        }
    }
}

impl Extend<LegTimes> for PhaseSamples {
    fn extend<I: IntoIterator<Item = LegTimes>>(&mut self, iter: I) {
        for legs in iter {
            self.record(&legs);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_odd_sample_count() {
        let mut samples = vec![5.0, 1.0, 3.0];
        let stats = SummaryStats::from_samples(&mut samples);
        assert_eq!(samples, vec![1.0, 3.0, 5.0]);
        assert_eq!(stats.max, 5.0);
        assert_eq!(stats.min, 1.0);
        assert!(close(stats.mean, 3.0));
        assert_eq!(stats.median, 3.0);
        assert!(close(stats.variance, 4.0));
    }

    #[test]
    fn test_even_sample_count_median_averages_middle() {
        let mut samples = vec![4.0, 1.0, 2.0, 3.0];
        let stats = SummaryStats::from_samples(&mut samples);
        assert!(close(stats.median, 2.5));
        assert!(close(stats.mean, 2.5));
        // sum of squared deviations 5.0 over n-1 = 3
        assert!(close(stats.variance, 5.0 / 3.0));
    }

    #[test]
    fn test_single_sample_has_zero_variance() {
        let stats = SummaryStats::from_samples(&mut [0.25]);
        assert_eq!(stats.max, 0.25);
        assert_eq!(stats.min, 0.25);
        assert_eq!(stats.median, 0.25);
        assert_eq!(stats.variance, 0.0);
    }

    #[test]
    fn test_empty_samples_reduce_to_zero() {
        assert_eq!(SummaryStats::from_samples(&mut []), SummaryStats::default());
    }

    #[test]
    fn test_ordering_holds_for_random_samples() {
        let mut rng = StdRng::seed_from_u64(7);
        for trials in 1..64 {
            let mut samples: Vec<f64> = (0..trials).map(|_| rng.gen_range(0.0..1e-3)).collect();
            let stats = SummaryStats::from_samples(&mut samples);

            assert!(samples.windows(2).all(|w| w[0] <= w[1]));
            assert!(stats.min <= stats.median && stats.median <= stats.max);
            assert!(stats.min <= stats.mean + 1e-15 && stats.mean <= stats.max + 1e-15);
            assert!(stats.variance >= 0.0);
        }
    }

    #[test]
    fn test_phase_samples_vector_layout() {
        let mut phase = PhaseSamples::with_capacity(2);
        phase.extend([
            LegTimes {
                send: Duration::from_micros(1),
                receive: Duration::from_micros(10),
                probe: Duration::ZERO,
            },
            LegTimes {
                send: Duration::from_micros(3),
                receive: Duration::from_micros(30),
                probe: Duration::ZERO,
            },
        ]);
        assert_eq!(phase.len(), 2);

        let vector = phase.reduce().to_vector();
        assert!(close(vector[0], 3e-6)); // send max
        assert!(close(vector[1], 1e-6)); // send min
        assert!(close(vector[2], 2e-6)); // send mean
        assert!(close(vector[5], 30e-6)); // receive max
        assert!(close(vector[8], 20e-6)); // receive median
        assert!(vector[10..].iter().all(|&v| v == 0.0));
    }
}
