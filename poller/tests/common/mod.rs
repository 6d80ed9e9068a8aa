//! Shared fakes for poller integration tests

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use meri_poller::deploy::compose::Orchestrator;
use meri_poller::deploy::git::{CommitId, Vcs};
use meri_poller::errors::PollerError;
use meri_poller::workers::poller::Options;

/// Ordered record of collaborator calls, shared between fakes
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.starts_with(prefix))
            .count()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c == call)
    }
}

/// Kind of collaborator failure to inject
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Network,
    Conflict,
    Build,
    Command,
}

impl Failure {
    fn error(self, what: &str) -> PollerError {
        let message = format!("simulated {} failure", what);
        match self {
            Failure::Network => PollerError::NetworkError(message),
            Failure::Conflict => PollerError::ConflictError(message),
            Failure::Build => PollerError::BuildError(message),
            Failure::Command => PollerError::CommandError(message),
        }
    }
}

/// In-memory working copy: pulling moves HEAD to the remote commit
pub struct FakeVcs {
    log: CallLog,
    head: Mutex<CommitId>,
    remote: Mutex<CommitId>,
    fail_fetch: Option<Failure>,
    fail_pull: Option<Failure>,
    pull_hangs: bool,
}

impl FakeVcs {
    pub fn new(log: &CallLog, head: &str, remote: &str) -> Self {
        Self {
            log: log.clone(),
            head: Mutex::new(CommitId::new(head)),
            remote: Mutex::new(CommitId::new(remote)),
            fail_fetch: None,
            fail_pull: None,
            pull_hangs: false,
        }
    }

    pub fn failing_fetch(mut self, failure: Failure) -> Self {
        self.fail_fetch = Some(failure);
        self
    }

    pub fn failing_pull(mut self, failure: Failure) -> Self {
        self.fail_pull = Some(failure);
        self
    }

    /// Pull moves HEAD to the remote commit and then never returns
    pub fn hanging_pull(mut self) -> Self {
        self.pull_hangs = true;
        self
    }

    pub fn head(&self) -> CommitId {
        self.head.lock().unwrap().clone()
    }

    pub fn push_remote(&self, commit: &str) {
        *self.remote.lock().unwrap() = CommitId::new(commit);
    }
}

#[async_trait]
impl Vcs for FakeVcs {
    async fn current_commit(&self) -> Result<CommitId, PollerError> {
        self.log.push("current_commit");
        Ok(self.head())
    }

    async fn fetch(&self, remote: &str) -> Result<(), PollerError> {
        self.log.push(format!("fetch {}", remote));
        match self.fail_fetch {
            Some(failure) => Err(failure.error("fetch")),
            None => Ok(()),
        }
    }

    async fn remote_commit(&self, remote: &str, branch: &str) -> Result<CommitId, PollerError> {
        self.log.push(format!("remote_commit {}/{}", remote, branch));
        Ok(self.remote.lock().unwrap().clone())
    }

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), PollerError> {
        self.log.push(format!("pull {} {}", remote, branch));
        if let Some(failure) = self.fail_pull {
            return Err(failure.error("pull"));
        }
        let remote = self.remote.lock().unwrap().clone();
        *self.head.lock().unwrap() = remote;
        if self.pull_hangs {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn update_submodules(&self) -> Result<(), PollerError> {
        self.log.push("update_submodules");
        Ok(())
    }
}

/// Orchestrator that records calls and can fail or stall on demand
pub struct FakeOrchestrator {
    log: CallLog,
    fail_up: AtomicBool,
    fail_prune: bool,
    up_delay: Option<Duration>,
    up_hangs: bool,
}

impl FakeOrchestrator {
    pub fn new(log: &CallLog) -> Self {
        Self {
            log: log.clone(),
            fail_up: AtomicBool::new(false),
            fail_prune: false,
            up_delay: None,
            up_hangs: false,
        }
    }

    pub fn failing_prune(mut self) -> Self {
        self.fail_prune = true;
        self
    }

    pub fn with_up_delay(mut self, delay: Duration) -> Self {
        self.up_delay = Some(delay);
        self
    }

    pub fn hanging_up(mut self) -> Self {
        self.up_hangs = true;
        self
    }

    pub fn set_fail_up(&self, fail: bool) {
        self.fail_up.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn up(&self, service: &str, rebuild: bool) -> Result<(), PollerError> {
        self.log.push(format!("up {} rebuild={}", service, rebuild));
        if self.up_hangs {
            std::future::pending::<()>().await;
        }
        if let Some(delay) = self.up_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_up.load(Ordering::SeqCst) {
            return Err(Failure::Build.error("up"));
        }
        Ok(())
    }

    async fn prune_images(&self) -> Result<(), PollerError> {
        self.log.push("prune_images");
        if self.fail_prune {
            return Err(Failure::Command.error("prune"));
        }
        Ok(())
    }
}

/// Poller options with lock and pending markers inside `dir`
pub fn options_in(dir: &Path) -> Options {
    Options {
        lock_file: dir.join("meri-cron.lock"),
        pending_file: dir.join("meri-cron.lock.pending"),
        ..Default::default()
    }
}
