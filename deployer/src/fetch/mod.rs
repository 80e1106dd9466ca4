//! Artifact retrieval and integrity

pub mod digest;
pub mod fetcher;
