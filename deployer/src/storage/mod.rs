//! Local storage

pub mod layout;
pub mod lease;
pub mod settings;
pub mod store;
