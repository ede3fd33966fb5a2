//! backup-server: a per-user file backup service
//!
//! Clients connect over TCP and issue fixed-layout binary requests to
//! store, restore, delete and list files. Each user id gets its own
//! directory under a configured base directory.

pub mod config;
pub mod protocols;
pub mod server;
pub mod storage;
