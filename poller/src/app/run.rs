//! Main application run

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::options::AppOptions;
use crate::deploy::compose::ComposeCli;
use crate::deploy::git::GitCli;
use crate::errors::PollerError;
use crate::storage::lease::{Lease, LeaseFile};
use crate::storage::pending::{PendingMarker, PendingRebuild};
use crate::workers::poller::{PollOutcome, Poller};

/// Exit status for an interrupted run, as a shell reports SIGINT
pub const EXIT_INTERRUPTED: u8 = 130;

/// How a run of the application ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunResult {
    /// A single poll reached a decision
    Completed(PollOutcome),

    /// Watch mode ran until shutdown was requested
    Watched,

    /// A single poll was interrupted by a shutdown signal
    Interrupted,
}

impl RunResult {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunResult::Completed(_) | RunResult::Watched => 0,
            RunResult::Interrupted => EXIT_INTERRUPTED,
        }
    }
}

/// Build the poller with the real git and compose collaborators
pub fn build_poller(options: &AppOptions) -> Poller<GitCli, ComposeCli> {
    Poller::new(
        options.poller.clone(),
        GitCli::new(&options.repo_dir),
        ComposeCli::new(&options.repo_dir).with_compose_file(options.compose_file.clone()),
    )
}

/// Run the poller once, or repeatedly in watch mode
pub async fn run(
    options: &AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<RunResult, PollerError> {
    info!(
        "Polling {} for service {}",
        options.repo_dir.display(),
        options.poller.service
    );
    let poller = build_poller(options);
    let shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(shutdown_signal);

    if let Some(interval) = options.watch_interval {
        poller
            .run_watch(interval, tokio::time::sleep, shutdown_signal)
            .await;
        return Ok(RunResult::Watched);
    }

    run_single(&poller, shutdown_signal).await
}

/// Run one poll, abandoning it if `shutdown_signal` resolves first.
/// Abandoning kills any git or compose command still running and drops the
/// lock guard, which releases the lock.
pub async fn run_single<V, O>(
    poller: &Poller<V, O>,
    shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) -> Result<RunResult, PollerError>
where
    V: crate::deploy::git::Vcs,
    O: crate::deploy::compose::Orchestrator,
{
    tokio::select! {
        _ = shutdown_signal => {
            warn!("Interrupted, lock released");
            Ok(RunResult::Interrupted)
        }
        result = poller.run_once() => {
            match &result {
                Ok(outcome) => info!("Poll finished: {}", outcome),
                Err(e) => error!("Poll failed: {}", e),
            }
            result.map(RunResult::Completed)
        }
    }
}

/// Lock holder as reported by `--status`
#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub lease: Option<Lease>,
    pub age_secs: Option<u64>,
    pub stale: bool,
}

/// Snapshot of the poller's own state
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub repo_dir: PathBuf,
    pub service: String,
    pub lock_file: PathBuf,
    pub lock: Option<LockStatus>,
    pub pending_file: PathBuf,
    pub pending_rebuild: Option<PendingRebuild>,
}

/// Inspect the lock and pending-rebuild markers without modifying them
pub async fn status(options: &AppOptions) -> Result<StatusReport, PollerError> {
    let poller_options = &options.poller;
    let lease_file = LeaseFile::new(&poller_options.lock_file, poller_options.lock_timeout);
    let pending = PendingMarker::new(&poller_options.pending_file);

    let lock = lease_file
        .inspect(Utc::now())
        .await?
        .map(|holder| LockStatus {
            stale: holder.is_stale(lease_file.timeout()),
            age_secs: holder.age.map(|age| age.as_secs()),
            lease: holder.lease,
        });

    Ok(StatusReport {
        repo_dir: options.repo_dir.clone(),
        service: poller_options.service.clone(),
        lock_file: poller_options.lock_file.clone(),
        lock,
        pending_file: poller_options.pending_file.clone(),
        pending_rebuild: pending.load().await?,
    })
}
