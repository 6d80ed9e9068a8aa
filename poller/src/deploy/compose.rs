//! Docker Compose operations

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tracing::debug;

use crate::deploy::command;
use crate::deploy::git::describe_failure;
use crate::errors::PollerError;

/// Container orchestration operations the poller needs
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Bring `service` up, rebuilding its image first when `rebuild` is set
    async fn up(&self, service: &str, rebuild: bool) -> Result<(), PollerError>;

    /// Remove dangling images left behind by a rebuild
    async fn prune_images(&self) -> Result<(), PollerError>;
}

/// [`Orchestrator`] backed by `docker compose`, or the legacy
/// `docker-compose` binary when `docker` is not installed
#[derive(Debug, Clone)]
pub struct ComposeCli {
    project_dir: PathBuf,
    compose_file: Option<PathBuf>,
}

impl ComposeCli {
    pub fn new(project_dir: impl Into<PathBuf>) -> Self {
        Self {
            project_dir: project_dir.into(),
            compose_file: None,
        }
    }

    pub fn with_compose_file(mut self, compose_file: Option<PathBuf>) -> Self {
        self.compose_file = compose_file;
        self
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    fn up_args(&self, service: &str, rebuild: bool) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(file) = &self.compose_file {
            args.push("-f".to_string());
            args.push(file.display().to_string());
        }
        args.push("up".to_string());
        args.push("-d".to_string());
        if rebuild {
            args.push("--build".to_string());
        }
        args.push(service.to_string());
        args
    }

    async fn compose(&self, args: &[String]) -> Result<Output, PollerError> {
        debug!("Running docker compose {}", args.join(" "));
        let result = command("docker", &self.project_dir)
            .arg("compose")
            .args(args)
            .output()
            .await;

        match result {
            Ok(output) => Ok(output),
            Err(e) if e.kind() == ErrorKind::NotFound && self.project_dir.exists() => {
                debug!("docker not found, trying docker-compose...");
                command("docker-compose", &self.project_dir)
                    .args(args)
                    .output()
                    .await
                    .map_err(|e| {
                        PollerError::CommandError(format!("Failed to run docker-compose: {}", e))
                    })
            }
            Err(e) => Err(PollerError::CommandError(format!(
                "Failed to run docker compose: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl Orchestrator for ComposeCli {
    async fn up(&self, service: &str, rebuild: bool) -> Result<(), PollerError> {
        let output = self.compose(&self.up_args(service, rebuild)).await?;
        if !output.status.success() {
            return Err(PollerError::BuildError(format!(
                "docker compose up {} failed: {}",
                service,
                describe_failure(&output)
            )));
        }
        Ok(())
    }

    async fn prune_images(&self) -> Result<(), PollerError> {
        debug!("Running docker image prune -f");
        let output = command("docker", &self.project_dir)
            .args(["image", "prune", "-f"])
            .output()
            .await
            .map_err(|e| PollerError::CommandError(format!("Failed to run docker image prune: {}", e)))?;

        if !output.status.success() {
            return Err(PollerError::CommandError(format!(
                "docker image prune failed: {}",
                describe_failure(&output)
            )));
        }
        Ok(())
    }
}
