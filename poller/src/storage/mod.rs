//! Persistent state owned by the poller: settings, the lock lease and the
//! pending-rebuild marker

pub mod lease;
pub mod pending;
pub mod settings;
