//! Application state

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::app::options::AppOptions;
use crate::audit::git::GitAuditSink;
use crate::audit::{AuditSink, NoopAuditSink};
use crate::deploy::orchestrator::Orchestrator;
use crate::errors::DeployerError;
use crate::filesys::file::File;
use crate::http::registry::HttpRegistry;
use crate::remote::ssh::SshExecutor;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::storage::store::FileKvStore;

/// Read and validate the settings file
pub async fn load_settings(file: &File) -> Result<Settings, DeployerError> {
    if !file.exists().await {
        return Err(DeployerError::ConfigError(format!(
            "Settings file {:?} does not exist",
            file.path()
        )));
    }
    let settings: Settings = file.read_json().await?;
    settings.validate()?;
    Ok(settings)
}

/// Main application state
pub struct AppState {
    pub settings: Settings,
    pub layout: StorageLayout,
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wire the registry, SSH executor, state store and audit sink together
    pub async fn init(
        options: &AppOptions,
        settings: Settings,
        cancel: watch::Receiver<bool>,
    ) -> Result<Self, DeployerError> {
        let layout = options.layout.clone();
        layout.setup().await?;

        let registry = Arc::new(HttpRegistry::new(&settings.registry)?);
        let remote = Arc::new(SshExecutor::new(
            settings.ssh.clone(),
            settings.probes.clone(),
        ));
        let state_file = layout.state_file();
        let store = Arc::new(FileKvStore::open(state_file.clone()).await?);
        debug!("State store at {:?}", state_file.path());

        let audit: Arc<dyn AuditSink> = if settings.audit.git {
            let repo_dir = settings
                .audit
                .repo_dir
                .clone()
                .unwrap_or_else(|| layout.base_dir.clone());
            info!("Committing records to git in {:?}", repo_dir);
            Arc::new(GitAuditSink::new(
                repo_dir,
                vec![state_file.path().to_path_buf()],
            ))
        } else {
            Arc::new(NoopAuditSink)
        };

        let orchestrator =
            Orchestrator::new(&settings, registry, remote, store, layout.staging_dir())
                .with_audit(audit)
                .with_cancellation(cancel);

        Ok(Self {
            settings,
            layout,
            orchestrator,
        })
    }
}
