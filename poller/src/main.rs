//! Meri Poller - Entry Point
//!
//! Meant to be run from cron or a systemd timer. Exits 0 whenever a poll
//! reaches a decision, including when another run holds the lock.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;

use meri_poller::app::options::AppOptions;
use meri_poller::app::run::{run, status};
use meri_poller::errors::PollerError;
use meri_poller::filesys::file::File;
use meri_poller::logs::init_logging;
use meri_poller::storage::settings::Settings;
use meri_poller::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        return print_json(&version_info());
    }

    let settings = match load_settings(&cli_args).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let options = AppOptions::from_settings(&settings, cli_args.contains_key("watch"));

    // Initialize logging
    let _log_guard = match init_logging(options.log.clone()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    if cli_args.contains_key("status") {
        return match status(&options).await {
            Ok(report) => print_json(&report),
            Err(e) => {
                error!("Unable to read poller state: {}", e);
                ExitCode::FAILURE
            }
        };
    }

    match run(&options, await_shutdown_signal()).await {
        Ok(result) => ExitCode::from(result.exit_code()),
        Err(e) => {
            error!("Deployment poll failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// Defaults, then the settings file, then the environment, then flags
async fn load_settings(cli_args: &HashMap<String, String>) -> Result<Settings, PollerError> {
    let mut settings = match cli_args.get("settings") {
        Some(path) => Settings::from_file(&File::new(path)).await?,
        None => Settings::default(),
    };
    settings.apply_env()?;
    settings.apply_overrides(cli_args)?;
    Ok(settings)
}

fn print_json<T: serde::Serialize>(value: &T) -> ExitCode {
    match serde_json::to_string_pretty(value) {
        Ok(json) => {
            println!("{}", json);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to serialize output: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, shutting down...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, shutting down...");
                    }
                }
                return;
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to install signal handlers: {}", e);
            }
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Ctrl+C received, shutting down..."),
        Err(e) => {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
