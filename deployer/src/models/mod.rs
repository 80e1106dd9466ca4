//! Data models

pub mod artifact;
pub mod record;
pub mod server;
