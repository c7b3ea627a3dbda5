//! # Ring Latency Benchmark - Main Entry Point
//!
//! 1. **Parse arguments**: forgiving clap parsing into immutable `Settings`
//! 2. **Initialize logging**: colorized stderr output, optional log file
//! 3. **Launch**: start every rank over the selected transport, or run a
//!    single rank when started with `--rank` by a TCP launcher
//!
//! Any fatal error is printed with its full context chain and the process
//! exits with status 1.

use anyhow::Result;
use ring_latency::cli::{is_info_request, Args};
use ring_latency::{coordination, logging, Settings};
use tracing::{debug, info, warn};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let (args, rejected) = parse_args();
    let verbosity = args.verbose.unwrap_or(0);
    let quiet = args.quiet.unwrap_or(false);
    let _guard = logging::init_logging(verbosity, quiet, args.log_file.as_deref())?;
    for option in &rejected {
        warn!("Ignoring malformed argument: {}", option);
    }

    let settings = Settings::from(&args);
    settings.validate()?;
    debug!("Configuration: {:?}", settings);

    let mut log_args = vec!["-v".to_string(); verbosity as usize];
    if quiet {
        log_args.push("-q".to_string());
    }

    let records = coordination::launch(&settings, &log_args).await?;
    if settings.rank.is_none() {
        info!("Completed {} message sizes", records.len());
    }
    Ok(())
}

/// Parse the command line, keeping defaults for malformed options
///
/// Help and version requests print and exit successfully.
fn parse_args() -> (Args, Vec<String>) {
    let argv = std::env::args_os().map(|arg| arg.to_string_lossy().into_owned());
    match Args::parse_lenient(argv) {
        Ok(parsed) => parsed,
        Err(e) if is_info_request(&e) => e.exit(),
        Err(e) => {
            eprintln!("Ignoring malformed arguments: {}", e.kind());
            (Args::default(), Vec::new())
        }
    }
}
