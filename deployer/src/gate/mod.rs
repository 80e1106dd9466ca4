//! Compatibility gate

pub mod compat;
