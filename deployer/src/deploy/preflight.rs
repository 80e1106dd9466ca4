//! Preflight checks run before any server is touched

use std::path::Path;

use serde::{Deserialize, Serialize};
use sysinfo::Disks;
use tracing::{debug, warn};

use crate::filesys::dir::Dir;
use crate::models::server::ServerConfig;
use crate::remote::executor::RemoteExecutor;

/// Severity level for issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Informational only
    Info,
    /// May cause problems
    Warning,
    /// Fails the batch
    Error,
}

/// An issue found during preflight checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightIssue {
    pub severity: Severity,

    /// Which check found the issue
    pub check: String,

    /// Server concerned, `None` for local checks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    pub message: String,
}

/// Result of preflight checks across the targeted servers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreflightResult {
    pub issues: Vec<PreflightIssue>,
}

impl PreflightResult {
    pub fn passed(&self) -> bool {
        !self.issues.iter().any(|i| i.severity == Severity::Error)
    }

    fn error(&mut self, check: &str, server: Option<&str>, message: String) {
        self.issues.push(PreflightIssue {
            severity: Severity::Error,
            check: check.to_string(),
            server: server.map(str::to_string),
            message,
        });
    }

    fn warning(&mut self, check: &str, server: Option<&str>, message: String) {
        self.issues.push(PreflightIssue {
            severity: Severity::Warning,
            check: check.to_string(),
            server: server.map(str::to_string),
            message,
        });
    }

    /// Errors joined into one line
    pub fn describe(&self) -> String {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .map(|i| match &i.server {
                Some(server) => format!("{} ({}): {}", i.check, server, i.message),
                None => format!("{}: {}", i.check, i.message),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Thresholds applied by [`run_preflight`]
#[derive(Debug, Clone, Copy)]
pub struct PreflightLimits {
    pub min_free_space_mb: u64,
    /// Zero disables the local disk check
    pub min_local_free_space_mb: u64,
}

/// Free space in MB of the local filesystem holding `path`
pub fn local_free_space_mb(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space() / (1024 * 1024))
}

/// Check every server is reachable with enough free space, and that the staging
/// area is writable
pub async fn run_preflight(
    remote: &dyn RemoteExecutor,
    servers: &[ServerConfig],
    staging: &Dir,
    limits: PreflightLimits,
) -> PreflightResult {
    let mut result = PreflightResult::default();

    if let Err(e) = staging.assert_writable().await {
        result.error("staging", None, e.to_string());
    }

    if limits.min_local_free_space_mb > 0 {
        match local_free_space_mb(staging.path()) {
            Some(mb) if mb < limits.min_local_free_space_mb => result.error(
                "local_disk_space",
                None,
                format!(
                    "Low disk space: {}MB (need {}MB)",
                    mb, limits.min_local_free_space_mb
                ),
            ),
            Some(mb) => debug!("Local staging area has {}MB free", mb),
            None => result.warning(
                "local_disk_space",
                None,
                format!("Could not determine free space of {:?}", staging.path()),
            ),
        }
    }

    for server in servers {
        if let Err(e) = remote.ping(server).await {
            result.error("ssh", Some(&server.name), format!("Cannot reach server: {}", e));
            continue;
        }

        match remote.free_space_mb(server).await {
            Ok(mb) if mb < limits.min_free_space_mb => result.error(
                "disk_space",
                Some(&server.name),
                format!("Low disk space: {}MB (need {}MB)", mb, limits.min_free_space_mb),
            ),
            Ok(mb) => debug!("{} has {}MB free", server.name, mb),
            Err(e) => result.error(
                "disk_space",
                Some(&server.name),
                format!("Could not check disk space: {}", e),
            ),
        }
    }

    for issue in result.issues.iter().filter(|i| i.severity == Severity::Warning) {
        warn!("Preflight {}: {}", issue.check, issue.message);
    }
    result
}
