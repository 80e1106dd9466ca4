//! Shared fixture: a two-server fleet with an in-memory registry

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use plugfleet::deploy::orchestrator::Orchestrator;
use plugfleet::errors::DeployerError;
use plugfleet::fetch::digest::{sha256_hash, DigestAlgorithm, ExpectedDigest};
use plugfleet::filesys::dir::Dir;
use plugfleet::gate::compat::CompatibilityRule;
use plugfleet::http::registry::{DownloadDescriptor, RegistryClient};
use plugfleet::models::artifact::{ArtifactIdentity, ArtifactSource, ManagedArtifact, Platform};
use plugfleet::models::server::ServerConfig;
use plugfleet::remote::memory::MemoryRemote;
use plugfleet::storage::settings::{DeploySettings, Settings};
use plugfleet::storage::store::{KvStore, MemoryKvStore};
use plugfleet::utils::CooldownOptions;
use plugfleet::version::VersionString;

pub const GEYSER: &str = "Geyser-Velocity";
pub const VIA: &str = "ViaVersion";
pub const LUCKPERMS: &str = "LuckPerms";

pub const PROXY: &str = "proxy";
pub const LOBBY: &str = "lobby";

#[derive(Debug, Clone)]
struct Release {
    version: String,
    bytes: Vec<u8>,
    digests: ExpectedDigest,
}

/// Registry serving one release per source
#[derive(Debug, Default)]
pub struct FakeRegistry {
    releases: Mutex<HashMap<String, Release>>,
    flaky_downloads: Mutex<HashMap<String, u32>>,
    downloads: Mutex<Vec<String>>,
    download_signal: Mutex<Option<watch::Sender<bool>>>,
}

impl FakeRegistry {
    /// Publish `version` of `source` with a correct sha256
    pub fn publish(&self, source: &ArtifactSource, version: &str, bytes: &[u8]) {
        let digests = ExpectedDigest::new().with(DigestAlgorithm::Sha256, sha256_hash(bytes));
        self.publish_with(source, version, bytes, digests);
    }

    pub fn publish_with(
        &self,
        source: &ArtifactSource,
        version: &str,
        bytes: &[u8],
        digests: ExpectedDigest,
    ) {
        self.releases.lock().unwrap().insert(
            source.to_string(),
            Release {
                version: version.to_string(),
                bytes: bytes.to_vec(),
                digests,
            },
        );
    }

    /// Fail the next `times` downloads of `source` with a network error
    pub fn flaky(&self, source: &ArtifactSource, times: u32) {
        self.flaky_downloads
            .lock()
            .unwrap()
            .insert(source.to_string(), times);
    }

    /// Send `true` on `signal` once a download has been served
    pub fn signal_on_download(&self, signal: watch::Sender<bool>) {
        *self.download_signal.lock().unwrap() = Some(signal);
    }

    pub fn downloads(&self) -> Vec<String> {
        self.downloads.lock().unwrap().clone()
    }

    fn release(&self, key: &str) -> Result<Release, DeployerError> {
        self.releases
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| DeployerError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl RegistryClient for FakeRegistry {
    async fn latest_version(
        &self,
        source: &ArtifactSource,
        _include_prerelease: bool,
    ) -> Result<Option<VersionString>, DeployerError> {
        Ok(self
            .releases
            .lock()
            .unwrap()
            .get(&source.to_string())
            .map(|r| VersionString::new(r.version.clone())))
    }

    async fn download_descriptor(
        &self,
        source: &ArtifactSource,
        version: &VersionString,
    ) -> Result<DownloadDescriptor, DeployerError> {
        let release = self.release(&source.to_string())?;
        if release.version != version.raw() {
            return Err(DeployerError::NotFound(format!("{} {}", source, version)));
        }
        Ok(DownloadDescriptor {
            url: source.to_string(),
            file_name: format!("{}.jar", version),
            digests: release.digests,
        })
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, DeployerError> {
        {
            let mut flaky = self.flaky_downloads.lock().unwrap();
            if let Some(left) = flaky.get_mut(url).filter(|left| **left > 0) {
                *left -= 1;
                return Err(DeployerError::RegistryError("connection reset".to_string()));
            }
        }
        self.downloads.lock().unwrap().push(url.to_string());
        let bytes = self.release(url)?.bytes;
        if let Some(signal) = self.download_signal.lock().unwrap().as_ref() {
            let _ = signal.send(true);
        }
        Ok(bytes)
    }
}

pub fn geyser_source() -> ArtifactSource {
    ArtifactSource::Geyser {
        project: "geyser".to_string(),
        artifact: "velocity".to_string(),
    }
}

pub fn via_source() -> ArtifactSource {
    ArtifactSource::Modrinth {
        project_id: "viaversion".to_string(),
        loader: None,
    }
}

pub fn luckperms_source() -> ArtifactSource {
    ArtifactSource::Modrinth {
        project_id: "luckperms".to_string(),
        loader: None,
    }
}

fn plugin(
    name: &str,
    platforms: Vec<Platform>,
    critical: bool,
    source: ArtifactSource,
) -> ManagedArtifact {
    ManagedArtifact {
        identity: ArtifactIdentity {
            name: name.to_string(),
            platforms,
            tier: "default".to_string(),
            critical,
        },
        source,
        file_name: None,
    }
}

fn server(name: &str, platform: Platform) -> ServerConfig {
    ServerConfig {
        name: name.to_string(),
        uuid: format!("{}-uuid", name),
        platform,
        component: None,
        host: None,
        plugins_dir: Some(format!("/srv/{}/plugins", name)),
        log_path: None,
    }
}

pub fn plugin_path(server: &str, artifact: &str) -> String {
    format!("/srv/{}/plugins/{}.jar", server, artifact)
}

/// Velocity proxy plus a Paper lobby, three managed plugins and a Geyser
/// requirement of Velocity build 500
pub struct Fleet {
    pub remote: Arc<MemoryRemote>,
    pub store: Arc<MemoryKvStore>,
    pub registry: Arc<FakeRegistry>,
    pub settings: Settings,
    pub staging: tempfile::TempDir,
}

impl Fleet {
    pub fn new() -> Self {
        let settings = Settings {
            servers: vec![server(PROXY, Platform::Velocity), server(LOBBY, Platform::Paper)],
            plugins: vec![
                plugin(GEYSER, vec![Platform::Velocity], true, geyser_source()),
                plugin(VIA, vec![Platform::Velocity, Platform::Paper], false, via_source()),
                plugin(LUCKPERMS, vec![Platform::Paper], false, luckperms_source()),
            ],
            compatibility: vec![CompatibilityRule {
                artifact: GEYSER.to_string(),
                component: "velocity".to_string(),
                min_build: 500,
                reason: "Geyser 2.9.0+ requires Adventure library API".to_string(),
            }],
            deploy: DeploySettings {
                fetch_attempts: 3,
                cooldown: CooldownOptions {
                    base_delay: Duration::from_millis(1),
                    max_delay: Duration::from_millis(5),
                    multiplier: 2.0,
                },
                health_timeout_secs: 0,
                health_poll_interval_ms: 1,
                plugin_load_delay_ms: 0,
                min_local_free_space_mb: 0,
                ..Default::default()
            },
            ..Default::default()
        };

        let remote = Arc::new(MemoryRemote::new());
        remote.set_build(PROXY, "velocity", 557);
        remote.set_build(LOBBY, "paper", 140);

        Self {
            remote,
            store: Arc::new(MemoryKvStore::new()),
            registry: Arc::new(FakeRegistry::default()),
            settings,
            staging: tempfile::tempdir().unwrap(),
        }
    }

    pub fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            &self.settings,
            self.registry.clone(),
            self.remote.clone(),
            self.store.clone(),
            Dir::new(self.staging.path()),
        )
    }

    pub fn server(&self, name: &str) -> ServerConfig {
        self.settings.server(name).unwrap().clone()
    }

    /// Seed a file and its installed entry without going through the executor
    pub async fn install(&self, server: &str, artifact: &str, version: &str, bytes: &[u8]) {
        self.remote
            .set_file(server, &plugin_path(server, artifact), bytes);
        self.store
            .put(
                &format!("installed/{}/{}", server, artifact),
                json!({
                    "version": version,
                    "deployed_at": "2026-01-01T00:00:00Z",
                    "sha256": sha256_hash(bytes),
                }),
            )
            .await
            .unwrap();
    }

    pub fn file(&self, server: &str, artifact: &str) -> Option<Vec<u8>> {
        self.remote.file(server, &plugin_path(server, artifact))
    }

    /// Files left in the staging directory
    pub fn staged(&self) -> Vec<String> {
        std::fs::read_dir(self.staging.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}
