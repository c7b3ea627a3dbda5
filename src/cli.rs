//! Command-line interface and run settings.
//!
//! Malformed input (an unknown flag, a missing or unparsable value) never stops
//! the run. [`Args::parse_lenient`] drops only the option clap rejects, so the
//! matching setting keeps its default while every other option and mode token
//! still applies.

use clap::error::ErrorKind;
use clap::{ArgAction, Command, CommandFactory, Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Ring Latency Benchmark - round-trip latency of a message traversing a ring of ranks
#[derive(Parser, Debug, Default)]
#[clap(name = "ring-latency", version, about, long_about = None)]
pub struct Args {
    /// Fill the message payload with pseudorandom integers
    #[clap(short = 'r', long = "random", action = ArgAction::SetTrue, help_heading = "Core Options")]
    pub random_fill: Option<bool>,

    /// Seed for the payload generator
    #[clap(short = 's', long, help_heading = "Core Options")]
    pub seed: Option<u64>,

    /// Number of trials per message size
    #[clap(short = 't', long = "times", help_heading = "Core Options")]
    pub trials: Option<usize>,

    /// Delay before each trial in round_trip_wait mode, in microseconds
    #[clap(short = 'w', long = "wait", help_heading = "Core Options")]
    pub wait_us: Option<u64>,

    /// Measurement mode: round_trip, round_trip_msg_size, round_trip_wait or round_trip_sync
    #[clap(value_name = "MODE", help_heading = "Core Options")]
    pub mode_tokens: Vec<String>,

    /// Number of ranks in the ring
    #[clap(short = 'n', long, help_heading = "Group Options")]
    pub ranks: Option<usize>,

    /// Group communication transport
    #[clap(long, value_enum, help_heading = "Group Options")]
    pub transport: Option<TransportKind>,

    /// Host address for the TCP transport
    #[clap(long, help_heading = "Group Options")]
    pub host: Option<String>,

    /// Base port for the TCP transport; rank r listens on port + r
    #[clap(long, help_heading = "Group Options")]
    pub port: Option<u16>,

    /// Run as this rank of an already launched TCP group
    #[clap(long, hide = true)]
    pub rank: Option<usize>,

    /// Smallest message size as a power of two
    #[clap(long, help_heading = "Sweep Options")]
    pub min_exp: Option<u32>,

    /// Largest message size as a power of two
    #[clap(long, help_heading = "Sweep Options")]
    pub max_exp: Option<u32>,

    /// Output file for results (JSON format)
    #[clap(short = 'o', long, help_heading = "Output Options")]
    pub output_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[clap(short = 'v', long, action = ArgAction::Count, help_heading = "Output Options")]
    pub verbose: Option<u8>,

    /// Only log errors
    #[clap(short = 'q', long, action = ArgAction::SetTrue, help_heading = "Output Options")]
    pub quiet: Option<bool>,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output Options")]
    pub log_file: Option<PathBuf>,
}

impl Args {
    /// Parse `argv` (program name first), dropping only the options clap rejects
    ///
    /// Each option is tried together with its value. Options are accepted from
    /// the last one backwards, so a repeated option keeps its final occurrence.
    /// Returns the parsed arguments and the rejected options as written. Help
    /// and version requests come back as errors for the caller to print.
    pub fn parse_lenient<I, T>(argv: I) -> Result<(Args, Vec<String>), clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let bin = argv.next().unwrap_or_else(|| "ring-latency".to_string());
        let tokens: Vec<String> = argv.collect();

        let mut accepted: Vec<String> = Vec::new();
        let mut rejected = Vec::new();
        for mut chunk in split_options(&Args::command(), &tokens).into_iter().rev() {
            let candidate = std::iter::once(&bin).chain(&chunk).chain(&accepted);
            match Args::try_parse_from(candidate) {
                Ok(_) => {
                    chunk.append(&mut accepted);
                    accepted = chunk;
                }
                Err(e) if is_info_request(&e) => return Err(e),
                Err(_) => rejected.push(chunk.join(" ")),
            }
        }
        rejected.reverse();

        let args = Args::try_parse_from(std::iter::once(&bin).chain(&accepted))?;
        Ok((args, rejected))
    }
}

/// Whether clap stopped to print help or version text
pub fn is_info_request(err: &clap::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
    )
}

/// Group tokens into options with their values and lone positionals
fn split_options(command: &Command, tokens: &[String]) -> Vec<Vec<String>> {
    let mut chunks = Vec::new();
    let mut rest = tokens.iter();
    while let Some(token) = rest.next() {
        let mut chunk = vec![token.clone()];
        if option_takes_value(command, token) {
            if let Some(value) = rest.next() {
                chunk.push(value.clone());
            }
        }
        chunks.push(chunk);
    }
    chunks
}

/// `--name` or `-x` naming an option whose value is the next token
fn option_takes_value(command: &Command, token: &str) -> bool {
    let option = if let Some(long) = token.strip_prefix("--") {
        if long.is_empty() || long.contains('=') {
            return false;
        }
        command
            .get_arguments()
            .find(|arg| arg.get_long() == Some(long))
    } else {
        let mut chars = token.chars();
        match (chars.next(), chars.next(), chars.next()) {
            (Some('-'), Some(short), None) => command
                .get_arguments()
                .find(|arg| arg.get_short() == Some(short)),
            _ => None,
        }
    };
    option.map_or(false, |arg| arg.get_action().takes_values())
}

/// Synchronization discipline applied to every trial
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Traversal with nothing added
    #[default]
    Plain,
    /// Probe the incoming length before every receive
    SizeProbed,
    /// Barrier before a size-probed traversal
    Synchronized,
    /// Fixed sleep before a plain traversal
    DelayPrefixed,
}

impl RunMode {
    pub const ALL: [RunMode; 4] = [
        RunMode::Plain,
        RunMode::SizeProbed,
        RunMode::DelayPrefixed,
        RunMode::Synchronized,
    ];

    /// Command-line token selecting this mode
    pub fn token(&self) -> &'static str {
        match self {
            RunMode::Plain => "round_trip",
            RunMode::SizeProbed => "round_trip_msg_size",
            RunMode::Synchronized => "round_trip_sync",
            RunMode::DelayPrefixed => "round_trip_wait",
        }
    }

    pub fn from_token(token: &str) -> Option<RunMode> {
        Self::ALL.into_iter().find(|mode| mode.token() == token)
    }

    /// Last recognized token wins; unrecognized tokens are skipped
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Option<RunMode> {
        tokens
            .iter()
            .filter_map(|token| Self::from_token(token.as_ref()))
            .last()
    }

    /// Whether every receive is preceded by a timed size probe
    pub fn probes(&self) -> bool {
        matches!(self, RunMode::SizeProbed | RunMode::Synchronized)
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// How the ranks of a run reach each other
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Every rank is a task of this process
    #[default]
    #[clap(name = "local")]
    Local,

    /// Every rank is a process, linked over TCP
    #[clap(name = "tcp")]
    Tcp,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Local => write!(f, "local"),
            TransportKind::Tcp => write!(f, "tcp"),
        }
    }
}

/// Immutable settings of one run
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub trials: usize,
    pub random_fill: bool,
    pub seed: u64,
    pub mode: RunMode,
    pub wait_us: u64,
    pub ranks: usize,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub min_exp: u32,
    pub max_exp: u32,
    #[serde(skip)]
    pub rank: Option<usize>,
    #[serde(skip)]
    pub output_file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from(&Args::default())
    }
}

impl From<&Args> for Settings {
    fn from(args: &Args) -> Self {
        use crate::defaults;

        Self {
            trials: args
                .trials
                .filter(|&t| t > 0)
                .unwrap_or(defaults::TRIALS),
            random_fill: args.random_fill.unwrap_or(false),
            seed: args.seed.unwrap_or(defaults::SEED),
            mode: RunMode::from_tokens(&args.mode_tokens).unwrap_or_default(),
            wait_us: args.wait_us.unwrap_or(defaults::WAIT_US),
            ranks: args.ranks.filter(|&n| n > 0).unwrap_or(defaults::RANKS),
            transport: args.transport.unwrap_or_default(),
            host: args
                .host
                .clone()
                .unwrap_or_else(|| defaults::HOST.to_string()),
            port: args.port.unwrap_or(defaults::PORT),
            min_exp: args.min_exp.unwrap_or(defaults::MIN_EXP),
            max_exp: args.max_exp.unwrap_or(defaults::MAX_EXP),
            rank: args.rank,
            output_file: args.output_file.clone(),
        }
    }
}

impl Settings {
    pub fn wait(&self) -> Duration {
        Duration::from_micros(self.wait_us)
    }

    /// Check the sweep bounds before any rank starts
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min_exp > self.max_exp {
            anyhow::bail!(
                "--min-exp ({}) must not exceed --max-exp ({})",
                self.min_exp,
                self.max_exp
            );
        }
        if self.max_exp > crate::defaults::MAX_EXP_LIMIT {
            anyhow::bail!(
                "--max-exp {} exceeds the largest supported exponent {}",
                self.max_exp,
                crate::defaults::MAX_EXP_LIMIT
            );
        }
        Ok(())
    }

    /// Arguments that reproduce these settings in a spawned rank
    ///
    /// The output file is left out: only the coordinator writes results.
    pub fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            self.trials.to_string(),
            "-s".to_string(),
            self.seed.to_string(),
            "-w".to_string(),
            self.wait_us.to_string(),
            "-n".to_string(),
            self.ranks.to_string(),
            "--transport".to_string(),
            self.transport.to_string(),
            "--host".to_string(),
            self.host.clone(),
            "--port".to_string(),
            self.port.to_string(),
            "--min-exp".to_string(),
            self.min_exp.to_string(),
            "--max-exp".to_string(),
            self.max_exp.to_string(),
        ];
        if self.random_fill {
            args.push("-r".to_string());
        }
        args.push(self.mode.token().to_string());
        args
    }
}
