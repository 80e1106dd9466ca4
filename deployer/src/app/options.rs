//! Application options

use std::path::PathBuf;

use crate::deploy::orchestrator::BatchRequest;
use crate::filesys::file::File;
use crate::logs::LogLevel;
use crate::storage::layout::StorageLayout;
use crate::version::UpdatePolicy;

/// Operation requested on the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Report available updates
    Check,
    /// Fetch and verify candidates into the staging area
    Download,
    /// Run a deployment batch
    Deploy,
    /// Restore pairs from their backups
    Rollback,
    /// Report version drift
    Audit,
    /// Show installed versions
    Status,
    /// Show recent records
    History { limit: usize },
}

impl Command {
    /// Whether the command mutates servers and needs the store lease
    pub fn mutates(&self) -> bool {
        matches!(self, Command::Deploy | Command::Rollback)
    }
}

/// Main application options
#[derive(Debug, Clone, Default)]
pub struct AppOptions {
    /// Storage layout paths
    pub layout: StorageLayout,

    /// Settings file override
    pub config: Option<PathBuf>,

    /// Plugin filter
    pub artifacts: Vec<String>,

    /// Server filter
    pub servers: Vec<String>,

    pub policy: UpdatePolicy,
    pub dry_run: bool,

    /// Print reports as JSON
    pub json: bool,

    /// Log level override
    pub log_level: Option<LogLevel>,
}

impl AppOptions {
    pub fn settings_file(&self) -> File {
        match &self.config {
            Some(path) => File::new(path),
            None => self.layout.settings_file(),
        }
    }

    pub fn batch_request(&self) -> BatchRequest {
        BatchRequest {
            artifacts: self.artifacts.clone(),
            servers: self.servers.clone(),
            policy: self.policy,
            dry_run: self.dry_run,
        }
    }
}
