//! Git working copy operations

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::command;
use crate::errors::PollerError;

/// Stderr fragments git prints when a pull cannot be applied cleanly
const CONFLICT_MARKERS: &[&str] = &[
    "conflict",
    "diverg",
    "not possible to fast-forward",
    "would be overwritten",
    "unmerged",
];

/// Commit identifier as printed by `git rev-parse`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommitId(String);

impl CommitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into().trim().to_string())
    }

    /// Placeholder for a commit that could not be determined
    pub fn unknown() -> Self {
        Self("unknown".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Abbreviated form for log lines
    pub fn short(&self) -> &str {
        self.0.get(..7).unwrap_or(&self.0)
    }
}

impl fmt::Display for CommitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version-control operations the poller needs from a working copy
#[async_trait]
pub trait Vcs: Send + Sync {
    /// Commit currently checked out
    async fn current_commit(&self) -> Result<CommitId, PollerError>;

    /// Fetch updates from the remote
    async fn fetch(&self, remote: &str) -> Result<(), PollerError>;

    /// Latest fetched commit of `remote/branch`
    async fn remote_commit(&self, remote: &str, branch: &str) -> Result<CommitId, PollerError>;

    /// Pull `branch` from `remote` into the working copy
    async fn pull(&self, remote: &str, branch: &str) -> Result<(), PollerError>;

    /// Bring nested repositories in line with the checked out commit
    async fn update_submodules(&self) -> Result<(), PollerError>;
}

/// [`Vcs`] backed by the `git` command line client
#[derive(Debug, Clone)]
pub struct GitCli {
    repo_dir: PathBuf,
}

impl GitCli {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    pub fn repo_dir(&self) -> &Path {
        &self.repo_dir
    }

    async fn git(&self, args: &[&str]) -> Result<Output, PollerError> {
        debug!("Running git {}", args.join(" "));
        command("git", &self.repo_dir)
            .args(args)
            .output()
            .await
            .map_err(|e| PollerError::CommandError(format!("Failed to run git {}: {}", args[0], e)))
    }

    async fn rev_parse(&self, rev: &str) -> Result<CommitId, PollerError> {
        let output = self.git(&["rev-parse", rev]).await?;
        if !output.status.success() {
            return Err(PollerError::CommandError(format!(
                "git rev-parse {} failed: {}",
                rev,
                describe_failure(&output)
            )));
        }
        let id = String::from_utf8_lossy(&output.stdout);
        if id.trim().is_empty() {
            return Err(PollerError::CommandError(format!(
                "git rev-parse {} printed no commit",
                rev
            )));
        }
        Ok(CommitId::new(id))
    }
}

#[async_trait]
impl Vcs for GitCli {
    async fn current_commit(&self) -> Result<CommitId, PollerError> {
        self.rev_parse("HEAD").await
    }

    async fn fetch(&self, remote: &str) -> Result<(), PollerError> {
        let output = self.git(&["fetch", remote]).await?;
        if !output.status.success() {
            return Err(PollerError::NetworkError(format!(
                "git fetch {} failed: {}",
                remote,
                describe_failure(&output)
            )));
        }
        Ok(())
    }

    async fn remote_commit(&self, remote: &str, branch: &str) -> Result<CommitId, PollerError> {
        self.rev_parse(&format!("{}/{}", remote, branch)).await
    }

    async fn pull(&self, remote: &str, branch: &str) -> Result<(), PollerError> {
        let output = self.git(&["pull", remote, branch]).await?;
        if !output.status.success() {
            return Err(classify_pull_failure(remote, branch, &output));
        }
        Ok(())
    }

    async fn update_submodules(&self) -> Result<(), PollerError> {
        let output = self
            .git(&["submodule", "update", "--init", "--recursive"])
            .await?;
        if !output.status.success() {
            return Err(PollerError::CommandError(format!(
                "git submodule update failed: {}",
                describe_failure(&output)
            )));
        }
        Ok(())
    }
}

fn classify_pull_failure(remote: &str, branch: &str, output: &Output) -> PollerError {
    let message = format!(
        "git pull {} {} failed: {}",
        remote,
        branch,
        describe_failure(output)
    );
    if is_conflict(&String::from_utf8_lossy(&output.stderr))
        || is_conflict(&String::from_utf8_lossy(&output.stdout))
    {
        PollerError::ConflictError(message)
    } else {
        PollerError::NetworkError(message)
    }
}

fn is_conflict(text: &str) -> bool {
    let text = text.to_lowercase();
    CONFLICT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Exit status plus the last non-empty stderr line
pub(crate) fn describe_failure(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    match stderr.lines().rev().find(|line| !line.trim().is_empty()) {
        Some(line) => format!("{} ({})", output.status, line.trim()),
        None => output.status.to_string(),
    }
}
