//! Registry HTTP clients

pub mod client;
pub mod geyser;
pub mod modrinth;
pub mod registry;
