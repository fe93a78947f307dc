//! Side-effecting pieces: persistence, configuration, event log, background work.

pub mod artifacts;
pub mod checkpoint;
pub mod config;
pub mod event_log;
pub mod postprocess;
pub mod repository;
pub mod retry;
pub mod store;
