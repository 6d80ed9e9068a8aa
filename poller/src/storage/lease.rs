//! Lock marker as a lease record
//!
//! The lock marker is a small JSON file naming its owner and when it was
//! taken. It is created with an exclusive open, so two invocations racing
//! for a free lock cannot both win. A marker older than the staleness
//! timeout belongs to a run that died without cleaning up and is reclaimed.
//!
//! Plain empty markers left by the old shell poller are understood too:
//! their age comes from the file's modification time.
//!
//! Deleting a marker, whether reclaiming a stale one or releasing our own,
//! happens under an advisory lock on a `<lock>.takeover` sidecar file. A
//! marker judged stale under that lock is therefore still the same marker
//! when it is removed.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::PollerError;
use crate::filesys::file::File;

/// Lease record stored in the lock marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Unique id of the run holding the lease
    pub owner_id: Uuid,

    /// Process id of the holder
    pub pid: u32,

    /// Host the holder runs on
    pub hostname: Option<String>,

    /// When the lease was taken
    pub acquired_at: DateTime<Utc>,

    /// When the lease becomes reclaimable by other runs
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    /// Create a lease for the current process
    pub fn new(now: DateTime<Utc>, timeout: Duration) -> Self {
        let expires_at = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Self {
            owner_id: Uuid::new_v4(),
            pid: std::process::id(),
            hostname: sysinfo::System::host_name(),
            acquired_at: now,
            expires_at,
        }
    }

    /// Time elapsed since the lease was taken. Timestamps in the future
    /// count as zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        age_since(self.acquired_at, now)
    }

    /// Whether the lease ran past its own expiry, or was stamped further in
    /// the future than `timeout` allows (the clock was stepped back since).
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        let ahead = (self.acquired_at - now).to_std().unwrap_or(Duration::ZERO);
        now >= self.expires_at || ahead > timeout
    }
}

fn age_since(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

/// Whoever currently holds the lock marker, as seen by another run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseHolder {
    /// The lease record, `None` for a legacy or unparseable marker
    pub lease: Option<Lease>,

    /// Age of the marker, `None` when it could not be determined
    pub age: Option<Duration>,

    /// The lease record itself says it has expired
    pub expired: bool,
}

impl LeaseHolder {
    /// Whether the holder is presumed dead.
    ///
    /// An undeterminable age counts as stale, so a marker whose timestamp
    /// cannot be read never blocks deployments forever.
    pub fn is_stale(&self, timeout: Duration) -> bool {
        if self.expired {
            return true;
        }
        match self.age {
            Some(age) => age >= timeout,
            None => true,
        }
    }
}

impl fmt::Display for LeaseHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.lease {
            Some(lease) => write!(
                f,
                "lease {} (pid {} on {})",
                lease.owner_id,
                lease.pid,
                lease.hostname.as_deref().unwrap_or("unknown host")
            )?,
            None => write!(f, "legacy lock marker")?,
        }
        match self.age {
            Some(age) => write!(f, ", age {}s", age.as_secs()),
            None => write!(f, ", age unknown"),
        }
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug)]
pub enum Acquisition {
    /// This run owns the lock until the guard is released or dropped
    Acquired(LeaseGuard),

    /// Another live run owns the lock
    Busy(LeaseHolder),
}

/// Lock marker at a fixed path with a staleness timeout
#[derive(Debug, Clone)]
pub struct LeaseFile {
    file: File,
    takeover: PathBuf,
    timeout: Duration,
}

impl LeaseFile {
    pub fn new(path: impl Into<PathBuf>, timeout: Duration) -> Self {
        let file = File::new(path);
        let takeover = takeover_path(file.path());
        Self {
            file,
            takeover,
            timeout,
        }
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Describe the current holder of the marker, if any
    pub async fn inspect(&self, now: DateTime<Utc>) -> Result<Option<LeaseHolder>, PollerError> {
        if !self.file.exists().await {
            return Ok(None);
        }

        match self.file.read_json::<Lease>().await {
            Ok(lease) => {
                let age = Some(lease.age(now));
                let expired = lease.is_expired(now, self.timeout);
                return Ok(Some(LeaseHolder {
                    lease: Some(lease),
                    age,
                    expired,
                }));
            }
            Err(PollerError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => {
                debug!(
                    "Lock marker {} is not a lease record ({}), using its mtime",
                    self.path().display(),
                    e
                );
            }
        }

        let age = match self.file.modified().await {
            Ok(modified) => Some(age_since(DateTime::<Utc>::from(modified), now)),
            Err(PollerError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(None);
            }
            Err(e) => {
                warn!(
                    "Unable to read timestamp of lock marker {}: {}",
                    self.path().display(),
                    e
                );
                None
            }
        };

        Ok(Some(LeaseHolder {
            lease: None,
            age,
            expired: false,
        }))
    }

    /// Try to take the lock.
    ///
    /// A live marker yields [`Acquisition::Busy`] and is left untouched. A
    /// stale marker is removed under the takeover lock and the exclusive
    /// create is retried once; losing that retry to a concurrent run is
    /// also `Busy`.
    pub async fn try_acquire(&self, now: DateTime<Utc>) -> Result<Acquisition, PollerError> {
        let lease = Lease::new(now, self.timeout);

        if self.create(&lease).await? {
            return Ok(self.acquired(lease));
        }

        let _takeover = TakeoverLock::acquire(&self.takeover).await?;
        match self.inspect(now).await? {
            Some(holder) if !holder.is_stale(self.timeout) => {
                info!("Lock {} is held by {}", self.path().display(), holder);
                return Ok(Acquisition::Busy(holder));
            }
            Some(holder) => {
                warn!(
                    "Removing stale lock {} held by {} (timeout {}s)",
                    self.path().display(),
                    holder,
                    self.timeout.as_secs()
                );
                self.file.delete().await.map_err(|e| {
                    PollerError::LockError(format!(
                        "Unable to remove stale lock {}: {}",
                        self.path().display(),
                        e
                    ))
                })?;
            }
            None => {
                debug!("Lock marker vanished before it could be inspected, retrying");
            }
        }

        if self.create(&lease).await? {
            Ok(self.acquired(lease))
        } else {
            self.busy_after_race(now).await
        }
    }

    async fn create(&self, lease: &Lease) -> Result<bool, PollerError> {
        self.file.create_new_json(lease).await.map_err(|e| {
            PollerError::LockError(format!(
                "Unable to create lock {}: {}",
                self.path().display(),
                e
            ))
        })
    }

    async fn busy_after_race(&self, now: DateTime<Utc>) -> Result<Acquisition, PollerError> {
        let holder = self.inspect(now).await?.unwrap_or(LeaseHolder {
            lease: None,
            age: Some(Duration::ZERO),
            expired: false,
        });
        info!(
            "Lost the race for lock {} to {}",
            self.path().display(),
            holder
        );
        Ok(Acquisition::Busy(holder))
    }

    fn acquired(&self, lease: Lease) -> Acquisition {
        debug!(
            "Acquired lock {} as {}",
            self.path().display(),
            lease.owner_id
        );
        Acquisition::Acquired(LeaseGuard {
            file: self.file.clone(),
            takeover: self.takeover.clone(),
            lease,
            released: false,
        })
    }
}

/// Ownership of the lock marker for the duration of a run.
///
/// Dropping the guard releases the lock, so every exit path of a run,
/// including `?` propagation and task cancellation, cleans up.
#[derive(Debug)]
pub struct LeaseGuard {
    file: File,
    takeover: PathBuf,
    lease: Lease,
    released: bool,
}

impl LeaseGuard {
    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Release the lock. The marker is only removed while it still carries
    /// this guard's owner id.
    pub async fn release(mut self) -> Result<(), PollerError> {
        // Cancelled mid-way, `released` stays false and `Drop` finishes the job
        let result = self.release_owned().await;
        self.released = true;
        result
    }

    async fn release_owned(&self) -> Result<(), PollerError> {
        let _takeover = TakeoverLock::acquire(&self.takeover).await?;
        let on_disk = match self.file.read_json::<Lease>().await {
            Ok(lease) => lease,
            Err(PollerError::IoError(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("Lock {} was already removed", self.path().display());
                return Ok(());
            }
            Err(e) => {
                warn!(
                    "Lock {} no longer holds our lease ({}), leaving it",
                    self.path().display(),
                    e
                );
                return Ok(());
            }
        };

        if on_disk.owner_id != self.lease.owner_id {
            warn!(
                "Lock {} was taken over by {}, leaving it",
                self.path().display(),
                on_disk.owner_id
            );
            return Ok(());
        }

        self.file.delete().await.map_err(|e| {
            PollerError::LockError(format!(
                "Unable to release lock {}: {}",
                self.path().display(),
                e
            ))
        })?;
        debug!("Released lock {}", self.path().display());
        Ok(())
    }

    fn release_blocking(&self) -> std::io::Result<()> {
        let _takeover = TakeoverLock::acquire_blocking(&self.takeover)?;
        let contents = match std::fs::read_to_string(self.file.path()) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let owned = serde_json::from_str::<Lease>(&contents)
            .map(|lease| lease.owner_id == self.lease.owner_id)
            .unwrap_or(false);
        if owned {
            std::fs::remove_file(self.file.path())?;
        }
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match self.release_blocking() {
            Ok(()) => debug!("Released lock {} on drop", self.path().display()),
            Err(e) => warn!("Failed to release lock {}: {}", self.path().display(), e),
        }
    }
}

/// Sidecar path of the takeover lock for a lock marker
fn takeover_path(lock: &Path) -> PathBuf {
    let mut name = lock.as_os_str().to_os_string();
    name.push(".takeover");
    PathBuf::from(name)
}

/// Exclusive advisory lock on the takeover sidecar, held until dropped
struct TakeoverLock {
    file: std::fs::File,
}

impl TakeoverLock {
    fn acquire_blocking(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }

    async fn acquire(path: &Path) -> Result<Self, PollerError> {
        let owned = path.to_path_buf();
        tokio::task::spawn_blocking(move || Self::acquire_blocking(&owned))
            .await
            .map_err(|e| PollerError::Internal(format!("Takeover lock task failed: {}", e)))?
            .map_err(|e| {
                PollerError::LockError(format!(
                    "Unable to lock {}: {}",
                    path.display(),
                    e
                ))
            })
    }
}

impl Drop for TakeoverLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
