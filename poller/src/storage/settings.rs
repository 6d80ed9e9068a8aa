//! Settings management
//!
//! Settings are layered: built-in defaults, then an optional JSON settings
//! file, then environment variables, then `--key=value` command-line
//! overrides. Every field has a default so a bare cron entry works.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PollerError;
use crate::filesys::file::File;
use crate::logs::{LogFormat, LogLevel};

/// Environment variable names and the settings keys they map to
pub const ENV_KEYS: &[(&str, &str)] = &[
    ("REPO_DIR", "repo_dir"),
    ("COMPOSE_SERVICE", "compose_service"),
    ("COMPOSE_FILE_PATH", "compose_file"),
    ("LOCK_FILE", "lock_file"),
    ("LOCK_TIMEOUT", "lock_timeout_secs"),
    ("PENDING_FILE", "pending_file"),
    ("GIT_REMOTE", "remote"),
    ("GIT_BRANCH", "branch"),
    ("LOG_LEVEL", "log_level"),
    ("LOG_FORMAT", "log_format"),
    ("LOG_DIR", "log_dir"),
    ("POLL_INTERVAL", "poll_interval_secs"),
];

/// Poller settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Working copy to keep in sync with the remote
    #[serde(default = "default_repo_dir")]
    pub repo_dir: PathBuf,

    /// Compose service to rebuild and restart
    #[serde(default = "default_compose_service")]
    pub compose_service: String,

    /// Explicit compose file, otherwise compose discovers one in `repo_dir`
    #[serde(default)]
    pub compose_file: Option<PathBuf>,

    /// Path of the lock marker
    #[serde(default = "default_lock_file")]
    pub lock_file: PathBuf,

    /// Age in seconds after which an unreleased lock is considered abandoned
    #[serde(default = "default_lock_timeout")]
    pub lock_timeout_secs: u64,

    /// Path of the pending-rebuild marker; derived from `lock_file` when unset
    #[serde(default)]
    pub pending_file: Option<PathBuf>,

    /// Git remote to fetch from
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Remote branch to track
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Log level
    #[serde(default)]
    pub log_level: LogLevel,

    /// Log line format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Directory for rolling log files
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    /// Interval between polls in watch mode
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
}

/// Directory containing the running executable, the way the cron script
/// defaulted to its own directory.
fn default_repo_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_compose_service() -> String {
    "meri".to_string()
}

fn default_lock_file() -> PathBuf {
    PathBuf::from("/tmp/meri-cron.lock")
}

fn default_lock_timeout() -> u64 {
    300
}

fn default_remote() -> String {
    "origin".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            repo_dir: default_repo_dir(),
            compose_service: default_compose_service(),
            compose_file: None,
            lock_file: default_lock_file(),
            lock_timeout_secs: default_lock_timeout(),
            pending_file: None,
            remote: default_remote(),
            branch: default_branch(),
            log_level: LogLevel::Info,
            log_format: LogFormat::Text,
            log_dir: None,
            poll_interval_secs: None,
        }
    }
}

impl Settings {
    /// Load settings from a JSON file, defaulting every missing field
    pub async fn from_file(file: &File) -> Result<Self, PollerError> {
        file.read_json().await.map_err(|e| {
            PollerError::ConfigError(format!(
                "Unable to read settings file {}: {}",
                file.path().display(),
                e
            ))
        })
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), PollerError> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Empty values are
    /// treated as unset.
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), PollerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        for &(var, key) in ENV_KEYS {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                self.set(key, value.trim())?;
            }
        }
        Ok(())
    }

    /// Apply `--key=value` command-line overrides. Keys that are not
    /// settings fields are left for the caller.
    pub fn apply_overrides(&mut self, args: &HashMap<String, String>) -> Result<(), PollerError> {
        for (key, value) in args {
            let key = key.replace('-', "_");
            if ENV_KEYS.iter().any(|(_, k)| *k == key) {
                self.set(&key, value)?;
            }
        }
        Ok(())
    }

    /// Set a single field by its settings key
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), PollerError> {
        match key {
            "repo_dir" => self.repo_dir = PathBuf::from(value),
            "compose_service" => self.compose_service = value.to_string(),
            "compose_file" => self.compose_file = Some(PathBuf::from(value)),
            "lock_file" => self.lock_file = PathBuf::from(value),
            "lock_timeout_secs" => self.lock_timeout_secs = parse_secs(key, value)?,
            "pending_file" => self.pending_file = Some(PathBuf::from(value)),
            "remote" => self.remote = value.to_string(),
            "branch" => self.branch = value.to_string(),
            "log_level" => {
                self.log_level = value.parse().map_err(PollerError::ConfigError)?;
            }
            "log_format" => {
                self.log_format = value.parse().map_err(PollerError::ConfigError)?;
            }
            "log_dir" => self.log_dir = Some(PathBuf::from(value)),
            "poll_interval_secs" => {
                let secs = parse_secs(key, value)?;
                if secs == 0 {
                    return Err(PollerError::ConfigError(
                        "poll_interval_secs must be greater than zero".to_string(),
                    ));
                }
                self.poll_interval_secs = Some(secs);
            }
            _ => {
                return Err(PollerError::ConfigError(format!(
                    "Unknown setting: {}",
                    key
                )))
            }
        }
        Ok(())
    }

    /// Stale-lock timeout
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Pending-rebuild marker path, next to the lock marker by default
    pub fn pending_file(&self) -> PathBuf {
        self.pending_file.clone().unwrap_or_else(|| {
            let mut name = self.lock_file.as_os_str().to_os_string();
            name.push(".pending");
            PathBuf::from(name)
        })
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, PollerError> {
    value.parse::<u64>().map_err(|_| {
        PollerError::ConfigError(format!(
            "{} must be a whole number of seconds, got '{}'",
            key, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.compose_service, "meri");
        assert_eq!(settings.lock_file, PathBuf::from("/tmp/meri-cron.lock"));
        assert_eq!(settings.lock_timeout(), Duration::from_secs(300));
        assert_eq!(
            settings.pending_file(),
            PathBuf::from("/tmp/meri-cron.lock.pending")
        );
        assert!(settings.poll_interval_secs.is_none());
    }

    #[test]
    fn test_env_overrides_defaults() {
        let mut settings = Settings::default();
        settings
            .apply_env_with(lookup_from(&[
                ("REPO_DIR", "/srv/meri"),
                ("COMPOSE_SERVICE", "laituri"),
                ("LOCK_FILE", "/run/laituri.lock"),
                ("LOCK_TIMEOUT", "60"),
                ("LOG_LEVEL", "debug"),
                ("GIT_BRANCH", ""),
            ]))
            .unwrap();

        assert_eq!(settings.repo_dir, PathBuf::from("/srv/meri"));
        assert_eq!(settings.compose_service, "laituri");
        assert_eq!(settings.lock_timeout_secs, 60);
        assert_eq!(settings.log_level, LogLevel::Debug);
        // Empty values fall back to the default
        assert_eq!(settings.branch, "main");
        assert_eq!(
            settings.pending_file(),
            PathBuf::from("/run/laituri.lock.pending")
        );
    }

    #[test]
    fn test_invalid_timeout_is_config_error() {
        let mut settings = Settings::default();
        let result = settings.apply_env_with(lookup_from(&[("LOCK_TIMEOUT", "five minutes")]));
        assert!(matches!(result, Err(PollerError::ConfigError(_))));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut settings = Settings::default();
        assert!(settings.set("poll_interval_secs", "0").is_err());
        settings.set("poll_interval_secs", "120").unwrap();
        assert_eq!(settings.poll_interval_secs, Some(120));
    }

    #[test]
    fn test_cli_overrides_ignore_unknown_flags() {
        let mut settings = Settings::default();
        let mut args = HashMap::new();
        args.insert("compose-service".to_string(), "suola".to_string());
        args.insert("watch".to_string(), "true".to_string());
        settings.apply_overrides(&args).unwrap();
        assert_eq!(settings.compose_service, "suola");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"compose_service": "lautta", "log_format": "json"}"#).unwrap();
        assert_eq!(settings.compose_service, "lautta");
        assert_eq!(settings.log_format, LogFormat::Json);
        assert_eq!(settings.remote, "origin");
        assert_eq!(settings.lock_timeout_secs, 300);
    }
}
