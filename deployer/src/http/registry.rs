//! Upstream artifact registries

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::DeployerError;
use crate::fetch::digest::{DigestAlgorithm, ExpectedDigest};
use crate::http::client::HttpClient;
use crate::http::{geyser, modrinth};
use crate::models::artifact::ArtifactSource;
use crate::storage::settings::RegistrySettings;
use crate::version::VersionString;

/// Where to download a specific artifact version and how to verify it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadDescriptor {
    pub url: String,
    pub file_name: String,
    pub digests: ExpectedDigest,
}

/// Registry capability used by the deployer
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Newest version published for `source`, `None` when nothing eligible exists
    async fn latest_version(
        &self,
        source: &ArtifactSource,
        include_prerelease: bool,
    ) -> Result<Option<VersionString>, DeployerError>;

    async fn download_descriptor(
        &self,
        source: &ArtifactSource,
        version: &VersionString,
    ) -> Result<DownloadDescriptor, DeployerError>;

    async fn download(&self, url: &str) -> Result<Vec<u8>, DeployerError>;
}

/// Registry backed by the Modrinth and GeyserMC HTTP APIs
pub struct HttpRegistry {
    modrinth: HttpClient,
    geyser: HttpClient,
    downloads: HttpClient,
}

impl HttpRegistry {
    pub fn new(settings: &RegistrySettings) -> Result<Self, DeployerError> {
        let api_timeout = Duration::from_secs(settings.api_timeout_secs);
        let download_timeout = Duration::from_secs(settings.download_timeout_secs);
        Ok(Self {
            modrinth: HttpClient::new(&settings.modrinth_url, api_timeout)?,
            geyser: HttpClient::new(&settings.geyser_url, api_timeout)?,
            downloads: HttpClient::new("", download_timeout)?,
        })
    }
}

#[async_trait]
impl RegistryClient for HttpRegistry {
    async fn latest_version(
        &self,
        source: &ArtifactSource,
        include_prerelease: bool,
    ) -> Result<Option<VersionString>, DeployerError> {
        info!("Checking {} for updates", source);
        match source {
            ArtifactSource::Modrinth { project_id, loader } => {
                let versions = self.modrinth.modrinth_versions(project_id).await?;
                let latest =
                    modrinth::select_latest(&versions, loader.as_deref(), include_prerelease);
                if latest.is_none() {
                    warn!("No eligible version found for {}", source);
                }
                Ok(latest.map(|v| VersionString::new(v.version_number.clone())))
            }
            ArtifactSource::Geyser { project, .. } => {
                let build = self.geyser.geyser_latest_build(project).await?;
                Ok(Some(build.version_string()))
            }
        }
    }

    async fn download_descriptor(
        &self,
        source: &ArtifactSource,
        version: &VersionString,
    ) -> Result<DownloadDescriptor, DeployerError> {
        match source {
            ArtifactSource::Modrinth { project_id, .. } => {
                let versions = self.modrinth.modrinth_versions(project_id).await?;
                let found = versions
                    .iter()
                    .find(|v| v.version_number == version.raw())
                    .ok_or_else(|| DeployerError::NotFound(format!("{} {}", source, version)))?;
                let file = found.primary_file().ok_or_else(|| {
                    DeployerError::RegistryError(format!("{} {} has no files", source, version))
                })?;
                Ok(DownloadDescriptor {
                    url: file.url.clone(),
                    file_name: file.filename.clone(),
                    digests: file.digests(),
                })
            }
            ArtifactSource::Geyser { project, artifact } => {
                let (release, build_number) = geyser::split_version(version).ok_or_else(|| {
                    DeployerError::RegistryError(format!(
                        "'{}' is not a Geyser build version",
                        version
                    ))
                })?;
                let build = self
                    .geyser
                    .geyser_build(project, &release, build_number)
                    .await?;
                let download = build.downloads.get(artifact).ok_or_else(|| {
                    DeployerError::NotFound(format!("{} {}", source, version))
                })?;
                Ok(DownloadDescriptor {
                    url: self
                        .geyser
                        .geyser_download_url(project, &release, build_number, artifact),
                    file_name: download.name.clone(),
                    digests: ExpectedDigest::new()
                        .with(DigestAlgorithm::Sha256, download.sha256.as_str()),
                })
            }
        }
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, DeployerError> {
        self.downloads.get_bytes(url).await
    }
}
