//! Deployed state and backups

pub mod deployment;
