//! # Rank Coordination
//!
//! Starts every rank of a run and drives each one from bootstrap to finalize.
//!
//! ```text
//!  launch ──┬── local: one tokio task per rank, one process
//!           └── tcp:   rank 0 in this process, ranks 1..n as child processes
//!                      of the same executable started with `--rank i`
//!
//!  run_rank:  bootstrap info ─▶ gather ─▶ preamble (rank 0)
//!             sweep ─▶ records (rank 0)
//!             finalize barrier ─▶ "# Finalize[r]" / "# Total run time [r]"
//! ```
//!
//! A rank that hits a fatal error tells every peer through
//! [`GroupComm::abort`] before returning it, so the whole group stops instead
//! of waiting forever on the failed rank. Ranks that were woken by an abort do
//! not forward it again.

use crate::benchmark::SweepRunner;
use crate::cli::{Settings, TransportKind};
use crate::error::RingError;
use crate::ipc::tcp::{self, TcpGroupConfig};
use crate::ipc::{gather_value, local_group, GroupComm, LocalComm};
use crate::results::{ClusterRecord, ResultsManager};
use crate::timing::{timed, SecNanos};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn, Instrument};

/// What every rank reports about itself before the sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankInfo {
    pub rank: usize,
    pub host: String,
    /// Time this rank spent joining the group
    pub bootstrap: Duration,
}

/// Start every rank of a run and return the coordinator's records
///
/// `log_args` are forwarded to spawned ranks so they log like this process.
pub async fn launch(settings: &Settings, log_args: &[String]) -> Result<Vec<ClusterRecord>> {
    info!(
        "Starting {} ranks over the {} transport",
        settings.ranks, settings.transport
    );
    match settings.transport {
        TransportKind::Local => launch_local(settings).await,
        TransportKind::Tcp => launch_tcp(settings, log_args).await,
    }
}

/// Run every rank as a task of this process
pub async fn launch_local(settings: &Settings) -> Result<Vec<ClusterRecord>> {
    launch_local_with(settings, ResultsManager::new(settings)).await
}

/// [`launch_local`] with a caller-provided results manager for the coordinator
pub async fn launch_local_with(
    settings: &Settings,
    results: ResultsManager,
) -> Result<Vec<ClusterRecord>> {
    let group = local_group(settings.ranks)?;

    let mut results = Some(results);
    let mut handles = Vec::with_capacity(settings.ranks);
    for mut comm in group {
        let settings = settings.clone();
        let results = if comm.topology().is_coordinator() {
            results.take()
        } else {
            None
        };
        handles.push(tokio::spawn(async move {
            let started = Instant::now();
            let bootstrap = join_local(&mut comm).await?;
            run_rank(comm, &settings, started, bootstrap, results).await
        }));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for handle in handles {
        outcomes.push(handle.await.context("Rank task panicked")?);
    }
    first_failure(outcomes)
}

/// Wait until every local rank is up and return how long this rank waited
async fn join_local(comm: &mut LocalComm) -> Result<Duration> {
    let rank = comm.topology().rank();
    let (joined, bootstrap) = timed(comm.barrier()).await;
    joined.with_context(|| format!("Rank {} failed to join the local group", rank))?;
    Ok(bootstrap)
}

/// Keep the coordinator's records, or report the error that started the abort
///
/// Errors caused by a peer's abort are only reported when nothing better is
/// available.
fn first_failure(outcomes: Vec<Result<Vec<ClusterRecord>>>) -> Result<Vec<ClusterRecord>> {
    let mut records = Vec::new();
    let mut remote = None;
    for (rank, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok(r) if rank == 0 => records = r,
            Ok(_) => {}
            Err(e) if is_remote(&e) => {
                remote.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    match remote {
        Some(e) => Err(e),
        None => Ok(records),
    }
}

fn is_remote(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<RingError>())
        .any(RingError::is_remote)
}

/// Run the TCP transport: a single rank with `--rank`, the whole group otherwise
pub async fn launch_tcp(settings: &Settings, log_args: &[String]) -> Result<Vec<ClusterRecord>> {
    if let Some(rank) = settings.rank {
        return run_tcp_rank(settings, rank).await;
    }

    let exe = rank_binary()?;
    let mut children = Vec::with_capacity(settings.ranks.saturating_sub(1));
    for rank in 1..settings.ranks {
        children.push((rank, spawn_rank_process(&exe, settings, log_args, rank)?));
    }

    let outcome = run_tcp_rank(settings, 0).await;
    let grace = if outcome.is_ok() {
        None
    } else {
        Some(crate::defaults::CHILD_EXIT_GRACE)
    };

    let mut failed = Vec::new();
    for (rank, child) in children {
        if let Err(e) = wait_rank_process(rank, child, grace).await {
            error!("{:#}", e);
            failed.push(rank);
        }
    }

    let records = outcome?;
    if !failed.is_empty() {
        return Err(anyhow!("Ranks {:?} did not finish cleanly", failed));
    }
    Ok(records)
}

async fn run_tcp_rank(settings: &Settings, rank: usize) -> Result<Vec<ClusterRecord>> {
    let started = Instant::now();
    let config = TcpGroupConfig::new(settings.host.clone(), settings.port, rank, settings.ranks);
    let (comm, bootstrap) = timed(tcp::connect(&config)).await;
    let comm = comm.with_context(|| format!("Rank {} failed to join the TCP group", rank))?;

    let results = comm
        .topology()
        .is_coordinator()
        .then(|| ResultsManager::new(settings));
    run_rank(comm, settings, started, bootstrap, results).await
}

/// Executable used for spawned ranks
///
/// `CARGO_BIN_EXE_ring-latency` wins when set, otherwise this executable.
fn rank_binary() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_ring-latency") {
        let path = PathBuf::from(path);
        if path.exists() {
            return Ok(path);
        }
    }
    std::env::current_exe().context("Could not resolve the ring-latency executable")
}

fn spawn_rank_process(
    exe: &Path,
    settings: &Settings,
    log_args: &[String],
    rank: usize,
) -> Result<Child> {
    let mut cmd = Command::new(exe);
    cmd.args(settings.to_cli_args())
        .arg("--rank")
        .arg(rank.to_string())
        .args(log_args)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    debug!("Spawning rank {}: {} {:?}", rank, exe.display(), cmd.as_std().get_args());
    cmd.spawn()
        .with_context(|| format!("Failed to spawn rank {} process", rank))
}

async fn wait_rank_process(rank: usize, mut child: Child, grace: Option<Duration>) -> Result<()> {
    let status = match grace {
        None => child.wait().await?,
        Some(grace) => {
            let waited = tokio::time::timeout(grace, child.wait()).await;
            match waited {
                Ok(status) => status?,
                Err(_) => {
                    warn!("Rank {} still running after the run failed; killing it", rank);
                    child.kill().await?;
                    return Err(anyhow!("Rank {} was killed", rank));
                }
            }
        }
    };

    if status.success() {
        debug!("Rank {} process exited cleanly", rank);
        Ok(())
    } else {
        Err(anyhow!("Rank {} process exited with {}", rank, status))
    }
}

/// Drive one rank from bootstrap to finalize
///
/// `started` is when this rank's run began and `bootstrap` how long joining
/// the group took. The coordinator passes a results manager and gets every
/// record back; other ranks pass `None` and get an empty list.
pub async fn run_rank<C>(
    mut comm: C,
    settings: &Settings,
    started: Instant,
    bootstrap: Duration,
    results: Option<ResultsManager>,
) -> Result<Vec<ClusterRecord>>
where
    C: GroupComm,
{
    let rank = comm.topology().rank();
    let span = tracing::info_span!("rank", rank);
    async move {
        let mut results = results;
        match drive_rank(&mut comm, settings, bootstrap, results.as_mut()).await {
            Ok(records) => {
                let (finalized, finalize_time) = timed(comm.barrier()).await;
                finalized.context("Finalize barrier failed")?;

                print_line(&mut results, format!("Finalize[{}]: {}", rank, SecNanos(finalize_time)))?;
                print_line(
                    &mut results,
                    format!("Total run time [{}]: {}", rank, SecNanos(started.elapsed())),
                )?;
                if let Some(results) = results.as_mut() {
                    results.finalize()?;
                }
                debug!("Rank finished");
                Ok(records)
            }
            Err(e) => {
                if !is_remote(&e) {
                    error!("{:#}", e);
                    comm.abort(&format!("{:#}", e)).await;
                } else {
                    debug!("Stopping after abort: {:#}", e);
                }
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

async fn drive_rank(
    comm: &mut dyn GroupComm,
    settings: &Settings,
    bootstrap: Duration,
    mut results: Option<&mut ResultsManager>,
) -> Result<Vec<ClusterRecord>> {
    let topology = comm.topology();
    let me = RankInfo {
        rank: topology.rank(),
        host: crate::utils::hostname(),
        bootstrap,
    };

    if let Some(infos) = gather_value(comm, &me).await? {
        if let Some(results) = results.as_deref_mut() {
            write_preamble(results, comm.name(), &infos)?;
        }
    }

    let mut runner = SweepRunner::new(settings, topology);
    runner.run(comm, results).await
}

fn write_preamble(results: &mut ResultsManager, transport: &str, infos: &[RankInfo]) -> Result<()> {
    results.note(format_args!("Version: ring-latency {} ({})", crate::VERSION, transport))?;
    results.note(format_args!("Nr of ranks: {}", infos.len()))?;

    let mut membership: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for info in infos {
        membership.entry(info.host.clone()).or_default().push(info.rank);
    }
    results.set_membership(membership)?;

    results.note("Bootstrap times for ranks")?;
    for info in infos {
        results.note(SecNanos(info.bootstrap))?;
    }
    Ok(())
}

/// Coordinator lines go through the report, other ranks print directly
fn print_line(results: &mut Option<ResultsManager>, line: String) -> Result<()> {
    match results.as_mut() {
        Some(results) => results.note(line),
        None => {
            println!("# {}", line);
            Ok(())
        }
    }
}
