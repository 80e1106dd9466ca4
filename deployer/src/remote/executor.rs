//! Remote execution capability

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::errors::DeployerError;
use crate::models::server::ServerConfig;

/// Operations the deployer performs against a fleet server, independent of transport
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Prove the server's host is reachable
    async fn ping(&self, server: &ServerConfig) -> Result<(), DeployerError>;

    /// Free space on the volume holding the server's plugins, in megabytes
    async fn free_space_mb(&self, server: &ServerConfig) -> Result<u64, DeployerError>;

    /// Build number of an infrastructure component running on the server, `None`
    /// when it cannot be determined
    async fn read_infrastructure_version(
        &self,
        server: &ServerConfig,
        component: &str,
    ) -> Result<Option<u64>, DeployerError>;

    async fn file_exists(&self, server: &ServerConfig, path: &str) -> Result<bool, DeployerError>;

    /// Copy a file on the server. Returns only once the copy is on durable storage.
    async fn copy_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError>;

    async fn remove_file(&self, server: &ServerConfig, path: &str) -> Result<(), DeployerError>;

    /// Move a file over another on the same volume, replacing it atomically
    async fn rename_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError>;

    /// Replace the file at `path` with `bytes`. Readers of `path` see either the old or
    /// the new contents.
    async fn replace_file(
        &self,
        server: &ServerConfig,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), DeployerError>;

    async fn restart_service(&self, server: &ServerConfig) -> Result<(), DeployerError>;

    async fn is_service_healthy(&self, server: &ServerConfig) -> Result<bool, DeployerError>;

    /// Whether the server reports the plugin as loaded since its last start
    async fn is_plugin_loaded(
        &self,
        server: &ServerConfig,
        artifact: &str,
    ) -> Result<bool, DeployerError>;
}

/// Poll `is_service_healthy` until it reports healthy or `timeout` elapses.
///
/// Probe errors count as "not yet healthy".
pub async fn wait_until_healthy(
    remote: &dyn RemoteExecutor,
    server: &ServerConfig,
    timeout: Duration,
    poll_interval: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match remote.is_service_healthy(server).await {
            Ok(true) => return true,
            Ok(false) => debug!("{} not healthy yet", server.name),
            Err(e) => debug!("Health probe on {} failed: {}", server.name, e),
        }
        if Instant::now() + poll_interval > deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}
