//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::logs::LogOptions;
use crate::storage::settings::Settings;
use crate::workers::poller;

/// Watch-mode interval used when `--watch` is given without
/// `poll_interval_secs`
pub const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(60);

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Logging configuration
    pub log: LogOptions,

    /// Working copy the poller operates on
    pub repo_dir: PathBuf,

    /// Explicit compose file
    pub compose_file: Option<PathBuf>,

    /// Poller options
    pub poller: poller::Options,

    /// Poll repeatedly on this interval instead of once
    pub watch_interval: Option<Duration>,
}

impl AppOptions {
    /// Build options from resolved settings. `watch` forces watch mode even
    /// without a configured interval.
    pub fn from_settings(settings: &Settings, watch: bool) -> Self {
        let watch_interval = match settings.poll_interval_secs {
            Some(secs) => Some(Duration::from_secs(secs)),
            None if watch => Some(DEFAULT_WATCH_INTERVAL),
            None => None,
        };

        Self {
            log: LogOptions {
                log_level: settings.log_level.clone(),
                stdout: true,
                log_dir: settings.log_dir.clone(),
                format: settings.log_format,
            },
            repo_dir: settings.repo_dir.clone(),
            compose_file: settings.compose_file.clone(),
            poller: poller::Options {
                service: settings.compose_service.clone(),
                remote: settings.remote.clone(),
                branch: settings.branch.clone(),
                lock_file: settings.lock_file.clone(),
                lock_timeout: settings.lock_timeout(),
                pending_file: settings.pending_file(),
            },
            watch_interval,
        }
    }
}
