//! Workers

pub mod poller;
