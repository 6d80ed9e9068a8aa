//! Pending-rebuild marker
//!
//! Written just before new commits are pulled and removed once the service
//! was rebuilt from them, or when the pull fails outright. A marker that
//! survives a run means the working copy may be ahead of the running image,
//! and the next run rebuilds even when the repository is already up to date.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::deploy::git::CommitId;
use crate::errors::PollerError;
use crate::filesys::file::File;

/// Contents of the pending-rebuild marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRebuild {
    /// Commit the working copy is being updated to
    pub commit: CommitId,

    /// When the pull started
    pub recorded_at: DateTime<Utc>,
}

/// Pending-rebuild marker at a fixed path
#[derive(Debug, Clone)]
pub struct PendingMarker {
    file: File,
}

impl PendingMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            file: File::new(path),
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Record that `commit` is about to be pulled and is not yet deployed
    pub async fn record(&self, commit: &CommitId, now: DateTime<Utc>) -> Result<(), PollerError> {
        let pending = PendingRebuild {
            commit: commit.clone(),
            recorded_at: now,
        };
        self.file.write_json(&pending).await
    }

    /// Read the marker. A corrupt marker still signals a pending rebuild,
    /// with the commit unknown.
    pub async fn load(&self) -> Result<Option<PendingRebuild>, PollerError> {
        if !self.file.exists().await {
            return Ok(None);
        }
        match self.file.read_json::<PendingRebuild>().await {
            Ok(pending) => Ok(Some(pending)),
            Err(PollerError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => {
                warn!(
                    "Pending-rebuild marker {} is unreadable ({}), treating it as set",
                    self.path().display(),
                    e
                );
                Ok(Some(PendingRebuild {
                    commit: CommitId::unknown(),
                    recorded_at: DateTime::<Utc>::MIN_UTC,
                }))
            }
        }
    }

    /// Remove the marker after a successful rebuild
    pub async fn clear(&self) -> Result<(), PollerError> {
        self.file.delete().await
    }
}
