//! Version catalog

pub mod catalog;

pub use catalog::{
    channel, compare, is_update_available, normalize, Channel, NormalizedVersion, UpdatePolicy,
    VersionString,
};
