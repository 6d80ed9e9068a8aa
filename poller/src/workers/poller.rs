//! Lock-guarded update check and redeploy

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::deploy::compose::Orchestrator;
use crate::deploy::git::{CommitId, Vcs};
use crate::errors::PollerError;
use crate::storage::lease::{Acquisition, LeaseFile, LeaseHolder};
use crate::storage::pending::PendingMarker;

/// Source of the current time, replaceable in tests
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Poller options
#[derive(Debug, Clone)]
pub struct Options {
    /// Compose service to bring up
    pub service: String,

    /// Git remote to fetch from
    pub remote: String,

    /// Remote branch to track
    pub branch: String,

    /// Lock marker path
    pub lock_file: PathBuf,

    /// Age after which a lock marker is considered abandoned
    pub lock_timeout: Duration,

    /// Pending-rebuild marker path
    pub pending_file: PathBuf,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            service: "meri".to_string(),
            remote: "origin".to_string(),
            branch: "main".to_string(),
            lock_file: PathBuf::from("/tmp/meri-cron.lock"),
            lock_timeout: Duration::from_secs(300),
            pending_file: PathBuf::from("/tmp/meri-cron.lock.pending"),
        }
    }
}

/// What a single poll decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    /// Another run holds the lock; nothing was done
    Skipped { holder: LeaseHolder },

    /// Local and remote agree; the service was brought up without a rebuild
    UpToDate { commit: CommitId },

    /// New commits were pulled and the service rebuilt
    Updated { from: CommitId, to: CommitId },

    /// No new commits, but a rebuild interrupted by an earlier failure was
    /// completed
    Rebuilt { commit: CommitId },
}

impl PollOutcome {
    /// Whether the service image was rebuilt
    pub fn rebuilt(&self) -> bool {
        matches!(self, PollOutcome::Updated { .. } | PollOutcome::Rebuilt { .. })
    }
}

impl fmt::Display for PollOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PollOutcome::Skipped { holder } => write!(f, "skipped, lock held by {}", holder),
            PollOutcome::UpToDate { commit } => write!(f, "up to date at {}", commit.short()),
            PollOutcome::Updated { from, to } => {
                write!(f, "updated {} -> {}", from.short(), to.short())
            }
            PollOutcome::Rebuilt { commit } => write!(f, "rebuilt {}", commit.short()),
        }
    }
}

/// Deployment poller over a working copy and an orchestrator
pub struct Poller<V, O> {
    options: Options,
    vcs: V,
    orchestrator: O,
    lease: LeaseFile,
    pending: PendingMarker,
    clock: Clock,
}

impl<V: Vcs, O: Orchestrator> Poller<V, O> {
    pub fn new(options: Options, vcs: V, orchestrator: O) -> Self {
        let lease = LeaseFile::new(&options.lock_file, options.lock_timeout);
        let pending = PendingMarker::new(&options.pending_file);
        Self {
            options,
            vcs,
            orchestrator,
            lease,
            pending,
            clock: Arc::new(Utc::now),
        }
    }

    /// Replace the wall clock
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Fn() -> DateTime<Utc> + Send + Sync + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn vcs(&self) -> &V {
        &self.vcs
    }

    pub fn orchestrator(&self) -> &O {
        &self.orchestrator
    }

    /// Run one poll: take the lock, update and redeploy if needed, release
    /// the lock. The lock is released on every path, including errors.
    pub async fn run_once(&self) -> Result<PollOutcome, PollerError> {
        let guard = match self.lease.try_acquire((self.clock)()).await? {
            Acquisition::Busy(holder) => {
                info!("Another deployment is in progress ({}), skipping", holder);
                return Ok(PollOutcome::Skipped { holder });
            }
            Acquisition::Acquired(guard) => guard,
        };

        let result = self.deploy().await;
        let released = guard.release().await;

        match (result, released) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("Failed to release lock after error: {}", release_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn deploy(&self) -> Result<PollOutcome, PollerError> {
        let Options {
            service,
            remote,
            branch,
            ..
        } = &self.options;

        let before = self.vcs.current_commit().await?;
        debug!("Local HEAD is {}", before);

        info!("Fetching from {}...", remote);
        self.vcs.fetch(remote).await?;
        let target = self.vcs.remote_commit(remote, branch).await?;

        let pending = self.pending.load().await?;

        let pulled = if before == target {
            info!("Already up to date ({})", before.short());
            false
        } else {
            info!(
                "Updating {} -> {} from {}/{}",
                before.short(),
                target.short(),
                remote,
                branch
            );
            // Recorded first so a pull that is interrupted after moving HEAD
            // still gets its rebuild on the next run
            self.pending.record(&target, (self.clock)()).await?;
            if let Err(e) = self.vcs.pull(remote, branch).await {
                if pending.is_none() {
                    if let Err(clear_err) = self.pending.clear().await {
                        warn!("Failed to clear pending-rebuild marker: {}", clear_err);
                    }
                }
                return Err(e);
            }
            true
        };

        let recovering = !pulled && pending.is_some();
        if let Some(pending) = pending.as_ref().filter(|_| recovering) {
            warn!(
                "Rebuild of {} recorded at {} never completed, rebuilding now",
                pending.commit.short(),
                pending.recorded_at
            );
        }

        let rebuild = pulled || recovering;
        if rebuild {
            self.vcs.update_submodules().await?;
        }

        info!("Bringing up {} (rebuild: {})", service, rebuild);
        self.orchestrator.up(service, rebuild).await?;

        info!("Deployment complete at {}", target);

        if rebuild {
            if let Err(e) = self.pending.clear().await {
                warn!("Failed to clear pending-rebuild marker: {}", e);
            }
            if let Err(e) = self.orchestrator.prune_images().await {
                warn!("Image prune failed, continuing: {}", e);
            }
        }

        Ok(if pulled {
            PollOutcome::Updated {
                from: before,
                to: target,
            }
        } else if recovering {
            PollOutcome::Rebuilt { commit: target }
        } else {
            PollOutcome::UpToDate { commit: target }
        })
    }

    /// Poll on a fixed interval until `shutdown_signal` resolves.
    ///
    /// A failed poll is logged and the next one is attempted after the
    /// interval. A poll in progress when the signal arrives is abandoned and
    /// its lock released.
    pub async fn run_watch<S, F>(
        &self,
        interval: Duration,
        sleep_fn: S,
        mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
    ) where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        info!(
            "Poller starting, checking {}/{} every {}s",
            self.options.remote,
            self.options.branch,
            interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Poller shutting down...");
                    return;
                }
                result = self.run_once() => {
                    match result {
                        Ok(outcome) => info!("Poll finished: {}", outcome),
                        Err(e) => error!("Poll failed: {}", e),
                    }
                }
            }

            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Poller shutting down...");
                    return;
                }
                _ = sleep_fn(interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_rebuilt_flag() {
        let up_to_date = PollOutcome::UpToDate {
            commit: CommitId::new("abc123"),
        };
        let updated = PollOutcome::Updated {
            from: CommitId::new("abc123"),
            to: CommitId::new("def456"),
        };
        assert!(!up_to_date.rebuilt());
        assert!(updated.rebuilt());
        assert_eq!(updated.to_string(), "updated abc123 -> def456");
    }
}
