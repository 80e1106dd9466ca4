//! plugfleet library
//!
//! Safe plugin deployment across a small fleet of game servers: version
//! resolution, infrastructure compatibility gating, verified downloads,
//! backup-before-overwrite and deterministic rollback.

pub mod app;
pub mod audit;
pub mod deploy;
pub mod errors;
pub mod fetch;
pub mod filesys;
pub mod gate;
pub mod http;
pub mod logs;
pub mod models;
pub mod remote;
pub mod state;
pub mod storage;
pub mod utils;
pub mod version;
