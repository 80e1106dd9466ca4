//! Deployment state
//!
//! Durable record of what is deployed where, and of the backups needed to undo it.
//! Every mutation of a server's files happens under that server's lock, and is
//! followed by a compare-and-swap of the pair's entry against the value read before
//! the file was touched. Readers take the same lock.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::errors::DeployerError;
use crate::models::record::{BackupRecord, DeploymentRecord, InstalledEntry, RollbackResult};
use crate::models::server::ServerConfig;
use crate::remote::executor::RemoteExecutor;
use crate::storage::store::KvStore;
use crate::utils::utc_stamp;
use crate::version::VersionString;

fn installed_key(server: &str, artifact: &str) -> String {
    format!("installed/{}/{}", server, artifact)
}

fn backup_key(server: &str, artifact: &str) -> String {
    format!("backups/{}/{}", server, artifact)
}

/// A managed file on a server: artifact name plus its fixed file name
#[derive(Debug, Clone, Copy)]
pub struct Placement<'a> {
    pub artifact: &'a str,
    pub file_name: &'a str,
}

pub struct DeploymentState {
    store: Arc<dyn KvStore>,
    remote: Arc<dyn RemoteExecutor>,
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl DeploymentState {
    pub fn new(store: Arc<dyn KvStore>, remote: Arc<dyn RemoteExecutor>) -> Self {
        Self {
            store,
            remote,
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn server_lock(&self, server: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(server.to_string()).or_default().clone()
    }

    async fn read<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, DeployerError> {
        match self.store.get(key).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Installed entries of one server, keyed by artifact
    pub async fn installed(
        &self,
        server: &ServerConfig,
    ) -> Result<BTreeMap<String, InstalledEntry>, DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;

        let prefix = format!("installed/{}/", server.name);
        let mut entries = BTreeMap::new();
        for (key, value) in self.store.list(&prefix).await? {
            let artifact = key.trim_start_matches(&prefix).to_string();
            entries.insert(artifact, serde_json::from_value(value)?);
        }
        Ok(entries)
    }

    pub async fn installed_version(
        &self,
        artifact: &str,
        server: &ServerConfig,
    ) -> Result<Option<InstalledEntry>, DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;
        self.read(&installed_key(&server.name, artifact)).await
    }

    /// Live backup of a pair, if any
    pub async fn backup_of(
        &self,
        artifact: &str,
        server: &ServerConfig,
    ) -> Result<Option<BackupRecord>, DeployerError> {
        self.read(&backup_key(&server.name, artifact)).await
    }

    /// Every live backup across the fleet
    pub async fn backups(&self) -> Result<Vec<BackupRecord>, DeployerError> {
        self.store
            .list("backups/")
            .await?
            .into_iter()
            .map(|(_, value)| serde_json::from_value(value).map_err(DeployerError::from))
            .collect()
    }

    /// Copy the installed file aside. Returns `None` when there is nothing to back up.
    ///
    /// The new record supersedes the previous backup of the pair, whose file is
    /// removed.
    pub async fn backup(
        &self,
        placement: Placement<'_>,
        server: &ServerConfig,
    ) -> Result<Option<BackupRecord>, DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;

        let path = server.artifact_path(placement.file_name);
        let original: Option<InstalledEntry> =
            self.read(&installed_key(&server.name, placement.artifact)).await?;

        if !self.remote.file_exists(server, &path).await? {
            if original.is_some() {
                warn!(
                    "{} is recorded on {} but {} does not exist",
                    placement.artifact, server.name, path
                );
            }
            debug!("Nothing to back up for {} on {}", placement.artifact, server.name);
            return Ok(None);
        }

        let location = format!("{}.{}.BAK", path, utc_stamp());
        self.remote.copy_file(server, &path, &location).await?;
        if !self.remote.file_exists(server, &location).await? {
            return Err(DeployerError::remote(
                &server.name,
                format!("backup {} was not created", location),
            ));
        }

        let record = BackupRecord {
            artifact: placement.artifact.to_string(),
            server: server.name.clone(),
            original,
            location,
            created_at: Utc::now(),
        };

        let key = backup_key(&server.name, placement.artifact);
        let prior: Option<BackupRecord> = self.read(&key).await?;
        self.store.put(&key, serde_json::to_value(&record)?).await?;

        if let Some(prior) = prior.filter(|p| p.location != record.location) {
            if let Err(e) = self.remote.remove_file(server, &prior.location).await {
                warn!("Failed to prune superseded backup {}: {}", prior.location, e);
            }
        }

        info!("Backed up {} on {} to {}", placement.artifact, server.name, record.location);
        Ok(Some(record))
    }

    /// Replace the pair's file with verified bytes and record the new version
    pub async fn apply(
        &self,
        placement: Placement<'_>,
        server: &ServerConfig,
        bytes: &[u8],
        version: &VersionString,
        sha256: &str,
    ) -> Result<InstalledEntry, DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;

        let key = installed_key(&server.name, placement.artifact);
        let before = self.store.get(&key).await?;

        let path = server.artifact_path(placement.file_name);
        self.remote.replace_file(server, &path, bytes).await?;

        let entry = InstalledEntry {
            version: version.clone(),
            deployed_at: Utc::now(),
            sha256: Some(sha256.to_string()),
        };
        self.store
            .compare_and_swap(&key, before, Some(serde_json::to_value(&entry)?))
            .await?;

        info!("Applied {} {} on {}", placement.artifact, version, server.name);
        Ok(entry)
    }

    /// Put the backed-up file back and revert the pair's entry. Consumes the backup.
    pub async fn rollback(
        &self,
        placement: Placement<'_>,
        server: &ServerConfig,
    ) -> Result<RollbackResult, DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;

        let bkey = backup_key(&server.name, placement.artifact);
        let Some(backup) = self.read::<BackupRecord>(&bkey).await? else {
            return Ok(RollbackResult::NoBackupAvailable);
        };

        let key = installed_key(&server.name, placement.artifact);
        let current = self.store.get(&key).await?;

        let path = server.artifact_path(placement.file_name);
        self.remote.rename_file(server, &backup.location, &path).await?;

        let restored = match &backup.original {
            Some(entry) => Some(serde_json::to_value(entry)?),
            None => None,
        };
        self.store.compare_and_swap(&key, current, restored).await?;
        self.store.delete(&bkey).await?;

        info!(
            "Restored {} on {} to {}",
            placement.artifact,
            server.name,
            backup
                .original_version()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "its unmanaged file".to_string())
        );
        Ok(RollbackResult::Restored {
            version: backup.original_version().cloned(),
        })
    }

    /// Remove a pair's file and entry
    pub async fn uninstall(
        &self,
        placement: Placement<'_>,
        server: &ServerConfig,
    ) -> Result<(), DeployerError> {
        let lock = self.server_lock(&server.name);
        let _guard = lock.lock().await;

        let key = installed_key(&server.name, placement.artifact);
        let current = self.store.get(&key).await?;

        let path = server.artifact_path(placement.file_name);
        self.remote.remove_file(server, &path).await?;
        self.store.compare_and_swap(&key, current, None).await?;

        info!("Uninstalled {} from {}", placement.artifact, server.name);
        Ok(())
    }

    /// Persist a concluded operation
    pub async fn record(&self, record: &DeploymentRecord) -> Result<(), DeployerError> {
        self.store
            .put(&record.key(), serde_json::to_value(record)?)
            .await
    }

    /// Most recent records, newest first
    pub async fn records(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployerError> {
        let all = self.store.list("records/").await?;
        all.into_iter()
            .rev()
            .take(limit)
            .map(|(_, value)| serde_json::from_value(value).map_err(DeployerError::from))
            .collect()
    }
}
