use crate::cli::Settings;
use crate::metrics::{Operation, RankSummary, SummaryStats};
use crate::utils::format_g;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// One operation's statistics across every rank
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CrossRankStats {
    /// Max of the per-rank maxima
    pub max: f64,
    /// Min of the per-rank minima
    pub min: f64,
    /// Mean of the per-rank means
    pub mean: f64,
    /// Mean of the per-rank medians
    pub median: f64,
    /// Mean of the per-rank variances
    pub variance: f64,
    /// Rank with the largest mean; the lowest such rank on ties
    pub outlier_rank: usize,
}

impl CrossRankStats {
    fn from_ranks<'a, I>(stats: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a SummaryStats>,
    {
        let mut iter = stats.into_iter();
        let first = iter.next()?;
        let mut out = Self {
            max: first.max,
            min: first.min,
            mean: first.mean,
            median: first.median,
            variance: first.variance,
            outlier_rank: 0,
        };
        let mut worst_mean = first.mean;
        let mut count = 1usize;

        for (rank, s) in iter.enumerate().map(|(i, s)| (i + 1, s)) {
            out.max = out.max.max(s.max);
            out.min = out.min.min(s.min);
            out.mean += s.mean;
            out.median += s.median;
            out.variance += s.variance;
            if s.mean > worst_mean {
                worst_mean = s.mean;
                out.outlier_rank = rank;
            }
            count += 1;
        }

        let n = count as f64;
        out.mean /= n;
        out.median /= n;
        out.variance /= n;
        Some(out)
    }

    /// (max, min, mean, median, variance)
    pub fn to_array(&self) -> [f64; 5] {
        [self.max, self.min, self.mean, self.median, self.variance]
    }
}

/// Cluster-wide record of one message size
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRecord {
    /// Envelope length in `i32` elements
    pub message_size: usize,
    pub send: CrossRankStats,
    pub receive: CrossRankStats,
    pub probe: CrossRankStats,
}

impl ClusterRecord {
    /// Combine every rank's summary (indexed by rank) into one record
    pub fn aggregate(message_size: usize, summaries: &[RankSummary]) -> Result<Self> {
        let across = |op: Operation| {
            CrossRankStats::from_ranks(summaries.iter().map(|s| s.get(op)))
                .with_context(|| format!("No rank summaries to aggregate for size {}", message_size))
        };

        Ok(Self {
            message_size,
            send: across(Operation::Send)?,
            receive: across(Operation::Receive)?,
            probe: across(Operation::Probe)?,
        })
    }

    pub fn get(&self, operation: Operation) -> &CrossRankStats {
        match operation {
            Operation::Send => &self.send,
            Operation::Receive => &self.receive,
            Operation::Probe => &self.probe,
        }
    }

    /// Outlier ranks in send, receive, probe order
    pub fn outlier_ranks(&self) -> [usize; 3] {
        [
            self.send.outlier_rank,
            self.receive.outlier_rank,
            self.probe.outlier_rank,
        ]
    }
}

/// Report data line: size, 15 statistics, 3 outlier ranks
impl fmt::Display for ClusterRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message_size)?;
        for op in Operation::ALL {
            for value in self.get(op).to_array() {
                write!(f, " {}", format_g(value))?;
            }
        }
        for rank in self.outlier_ranks() {
            write!(f, " {}", rank)?;
        }
        Ok(())
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub hostname: String,
    pub rust_version: String,
    pub benchmark_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            hostname: crate::utils::hostname(),
            rust_version: env!("CARGO_PKG_RUST_VERSION").to_string(),
            benchmark_version: crate::VERSION.to_string(),
        }
    }
}

/// Run metadata stored alongside the records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub total_records: usize,
    pub system_info: SystemInfo,
    pub settings: Settings,
    /// Host name to the ranks running on it
    pub membership: BTreeMap<String, Vec<usize>>,
}

/// Contents of the JSON results file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResults {
    pub metadata: RunMetadata,
    pub records: Vec<ClusterRecord>,
}

/// Coordinator-side report: informational lines, data lines and JSON output
pub struct ResultsManager {
    writer: Box<dyn Write + Send>,
    output_file: Option<PathBuf>,
    settings: Settings,
    run_id: String,
    membership: BTreeMap<String, Vec<usize>>,
    records: Vec<ClusterRecord>,
}

impl ResultsManager {
    /// Create a results manager reporting on stdout
    pub fn new(settings: &Settings) -> Self {
        Self::with_writer(settings, Box::new(std::io::stdout()))
    }

    /// Create a results manager reporting to `writer`
    pub fn with_writer(settings: &Settings, writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer,
            output_file: settings.output_file.clone(),
            settings: settings.clone(),
            run_id: crate::utils::generate_run_id(),
            membership: BTreeMap::new(),
            records: Vec::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn records(&self) -> &[ClusterRecord] {
        &self.records
    }

    /// Write an informational `# ` line
    pub fn note(&mut self, line: impl fmt::Display) -> Result<()> {
        writeln!(self.writer, "# {}", line).context("Failed to write report line")?;
        self.writer.flush()?;
        Ok(())
    }

    /// Record which ranks run on which host and report one line per host
    pub fn set_membership(&mut self, membership: BTreeMap<String, Vec<usize>>) -> Result<()> {
        for (host, ranks) in &membership {
            let ranks: Vec<String> = ranks.iter().map(|r| r.to_string()).collect();
            self.note(format_args!("{}: {}", host, ranks.join(" ")))?;
        }
        self.membership = membership;
        Ok(())
    }

    /// Report a record's data line and keep it for the results file
    pub fn add_record(&mut self, record: ClusterRecord) -> Result<()> {
        writeln!(self.writer, "{}", record).context("Failed to write report line")?;
        self.writer.flush()?;
        debug!("Recorded message size {}", record.message_size);
        self.records.push(record);
        Ok(())
    }

    /// Write the JSON results file if one was requested
    pub fn finalize(&mut self) -> Result<()> {
        self.writer.flush()?;
        let path = match self.output_file.clone() {
            Some(path) => path,
            None => return Ok(()),
        };
        self.write_final_results(&path)?;
        info!("Results written to {}", path.display());
        Ok(())
    }

    fn write_final_results(&self, path: &Path) -> Result<()> {
        let results = FinalResults {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                run_id: self.run_id.clone(),
                timestamp: chrono::Utc::now(),
                total_records: self.records.len(),
                system_info: SystemInfo::default(),
                settings: self.settings.clone(),
                membership: self.membership.clone(),
            },
            records: self.records.clone(),
        };

        let file = File::create(path)
            .with_context(|| format!("Failed to create results file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &results)
            .context("Failed to serialize results")?;
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }
}
