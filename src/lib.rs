//! # Ring Latency Benchmark Library
//!
//! Measures point-to-point message latency across a fixed-size group of
//! cooperating ranks arranged in a logical ring. Rank 0 sends an envelope to
//! rank 1, every rank forwards it to its successor and the last rank hands it
//! back to rank 0. Every send, receive and size probe is timed on every rank.
//!
//! ## Measurement Modes
//!
//! - **round_trip**: plain traversal
//! - **round_trip_msg_size**: the incoming length is probed before each receive
//! - **round_trip_sync**: a group barrier precedes each size-probed traversal
//! - **round_trip_wait**: a fixed sleep precedes each plain traversal
//!
//! ## Architecture Overview
//!
//! - `ipc`: the group-communication capability set and its local/TCP transports
//! - `envelope`: the sentinel-framed ring message
//! - `ring`: one traversal of the ring and the per-mode trial handlers
//! - `timing`: monotonic timing of blocking operations
//! - `metrics`: per-rank reduction of trial samples into summary statistics
//! - `results`: cross-rank aggregation, report lines and JSON output
//! - `benchmark`: the message-size sweep
//! - `coordination`: launching the ranks of a run and driving each one
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use ring_latency::{ipc::local_group, GroupComm, RunMode, Settings, SweepRunner};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let settings = Settings {
//!         trials: 100,
//!         mode: RunMode::SizeProbed,
//!         ..Settings::default()
//!     };
//!
//!     let mut handles = Vec::new();
//!     for mut comm in local_group(settings.ranks)? {
//!         let settings = settings.clone();
//!         handles.push(tokio::spawn(async move {
//!             let mut runner = SweepRunner::new(&settings, comm.topology());
//!             runner.run(&mut comm, None).await
//!         }));
//!     }
//!     for handle in handles {
//!         for record in handle.await?? {
//!             println!("{}", record);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Message-size sweep driving trials, reduction and aggregation
pub mod benchmark;

/// Command-line interface and run settings
///
/// Converts the forgiving clap `Args` into immutable `Settings` and maps mode
/// tokens onto `RunMode`.
pub mod cli;

/// Launching ranks and running each rank from bootstrap to finalize
pub mod coordination;

/// Sentinel-framed ring message
pub mod envelope;

/// Typed errors of the ring protocol
pub mod error;

/// Group communication: topology, capability trait and transports
///
/// Contains the `GroupComm` trait consumed by the ring protocol and two
/// implementations:
/// - in-process ranks over tokio mpsc channels
/// - one process per rank over TCP with bincode framing
pub mod ipc;

/// Console and file logging setup
pub mod logging;

/// Per-rank statistical reduction
pub mod metrics;

/// Cluster aggregation, report formatting and JSON results
pub mod results;

/// Round-trip engine and trial handlers
pub mod ring;

/// Monotonic timing helpers
pub mod timing;

pub mod utils;

pub use benchmark::{message_sizes, SweepRunner};
pub use cli::{Args, RunMode, Settings, TransportKind};
pub use envelope::Envelope;
pub use error::{RingError, RingResult};
pub use ipc::{GroupComm, Topology};
pub use metrics::{RankSummary, SummaryStats};
pub use results::{ClusterRecord, ResultsManager};
pub use ring::{LegTimes, RoundTrip, TrialHandler};

/// The current version of the ring latency benchmark
///
/// Reported in the run preamble and in the JSON results.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Trials per message size
    pub const TRIALS: usize = 1000;

    /// Seed of the payload generator
    pub const SEED: u64 = 42;

    /// Delay before each trial in `round_trip_wait` mode, in microseconds
    pub const WAIT_US: u64 = 20;

    /// Ranks launched when `-n` is not given
    pub const RANKS: usize = 4;

    /// The sweep starts at 2^MIN_EXP elements
    pub const MIN_EXP: u32 = 4;

    /// The sweep ends at 2^MAX_EXP elements
    pub const MAX_EXP: u32 = 14;

    /// Largest accepted sweep exponent
    ///
    /// 2^22 `i32` elements is a 16 MiB envelope, well inside the TCP frame
    /// limit.
    pub const MAX_EXP_LIMIT: u32 = 22;

    /// Host address of the TCP transport
    pub const HOST: &str = "127.0.0.1";

    /// Base port of the TCP transport; rank r listens on PORT + r
    pub const PORT: u16 = 18080;

    /// Socket send/receive buffer size for the TCP transport
    pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

    /// Connection attempts per peer while the group starts up
    pub const CONNECT_RETRIES: usize = 100;

    /// Pause between connection attempts
    pub const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(50);

    /// How long spawned ranks get to exit after the run failed
    pub const CHILD_EXIT_GRACE: Duration = Duration::from_secs(5);
}
