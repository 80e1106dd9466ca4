//! Exclusive lease on the state store
//!
//! Only one batch may run against a state store at a time. The lease is an
//! exclusive OS lock on a lock file, held for as long as the `StoreLease` lives.
//! The file also carries the owner's pid for diagnostics. The lock itself decides
//! ownership, so a lock file left behind by a dead process is simply reused.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::errors::DeployerError;

/// Held for the duration of one batch. Released on drop.
#[derive(Debug)]
pub struct StoreLease {
    path: PathBuf,
    file: File,
}

impl StoreLease {
    /// Acquire the lease, failing with `LeaseHeld` while another process owns it
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, DeployerError> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // Never removed: a process waiting on an unlinked inode would hold a lock
        // nobody else can see
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                DeployerError::StorageError(format!(
                    "Failed to open lease file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(DeployerError::LeaseHeld(describe_owner(read_owner(&path))));
        }

        if let Some(pid) = read_owner(&path) {
            if pid != std::process::id() && !is_process_running(pid) {
                warn!("Reclaiming stale lease left by pid {}", pid);
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.sync_all()?;

        debug!("Acquired lease {}", path.display());
        Ok(Self { path, file })
    }

    /// Pid of the current owner, if the lease is held
    pub fn holder(path: &Path) -> Option<u32> {
        let file = OpenOptions::new().read(true).write(true).open(path).ok()?;
        if file.try_lock_exclusive().is_ok() {
            let _ = FileExt::unlock(&file);
            return None;
        }
        read_owner(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for StoreLease {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = FileExt::unlock(&self.file);
    }
}

fn describe_owner(pid: Option<u32>) -> String {
    match pid {
        Some(pid) => format!("pid {}", pid),
        None => "another process".to_string(),
    }
}

fn read_owner(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path).ok()?.trim().parse().ok()
}

fn is_process_running(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid).is_some()
}
