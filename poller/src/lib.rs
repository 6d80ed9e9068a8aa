//! Meri deployment poller
//!
//! Keeps a docker compose service in step with a git remote: takes a lock,
//! pulls new commits, rebuilds and restarts the service, releases the lock.

pub mod app;
pub mod deploy;
pub mod errors;
pub mod filesys;
pub mod logs;
pub mod storage;
pub mod utils;
pub mod workers;
