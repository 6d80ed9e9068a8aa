//! File operations

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::errors::PollerError;

/// A file wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Last modification time of the file
    pub async fn modified(&self) -> Result<SystemTime, PollerError> {
        let meta = fs::metadata(&self.path).await?;
        Ok(meta.modified()?)
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, PollerError> {
        let mut file = fs::File::open(&self.path).await?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).await?;
        Ok(contents)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, PollerError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write JSON to file, replacing any previous contents atomically
    pub async fn write_json<T: Serialize>(&self, value: &T) -> Result<(), PollerError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.ensure_parent().await?;
        self.write_atomic(contents.as_bytes()).await
    }

    /// Create the file with JSON contents only if it does not exist yet.
    ///
    /// Returns `false` when another writer already created the file. The
    /// existence check and the creation are a single `O_EXCL` open.
    pub async fn create_new_json<T: Serialize>(&self, value: &T) -> Result<bool, PollerError> {
        let contents = serde_json::to_string_pretty(value)?;
        self.ensure_parent().await?;

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(true)
    }

    /// Delete the file. Deleting a missing file is not an error.
    pub async fn delete(&self) -> Result<(), PollerError> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_parent(&self) -> Result<(), PollerError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    /// Atomic write using a temporary file
    async fn write_atomic(&self, contents: &[u8]) -> Result<(), PollerError> {
        let temp_path = self.path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}
