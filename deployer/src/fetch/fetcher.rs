//! Artifact fetcher
//!
//! Bytes only leave this module once their digest has been checked. Downloads are
//! staged as `<artifact>.part` and promoted to `<artifact>-<version>.jar` after
//! verification; a failed verification deletes the part file.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info};

use crate::errors::DeployerError;
use crate::fetch::digest::{self, sha256_hash, ExpectedDigest};
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::http::registry::RegistryClient;
use crate::models::artifact::{ArtifactSource, ManagedArtifact};
use crate::models::record::FailureKind;
use crate::utils::{retry_with_backoff, CooldownOptions};
use crate::version::VersionString;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("network failure: {0}")]
    NetworkFailure(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{algorithm} mismatch for {artifact}: expected {expected}, got {actual}")]
    IntegrityFailure {
        artifact: String,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("registry publishes no digest for {0}")]
    MissingDigest(String),

    #[error("staging failed: {0}")]
    Staging(String),
}

impl FetchError {
    pub fn kind(&self) -> FailureKind {
        match self {
            FetchError::NetworkFailure(_) => FailureKind::NetworkFailure,
            FetchError::NotFound(_) => FailureKind::NotFound,
            FetchError::IntegrityFailure { .. } => FailureKind::IntegrityFailure,
            FetchError::MissingDigest(_) => FailureKind::MissingDigest,
            FetchError::Staging(_) => FailureKind::StagingFailure,
        }
    }
}

impl From<DeployerError> for FetchError {
    fn from(err: DeployerError) -> Self {
        match err {
            DeployerError::NotFound(what) => FetchError::NotFound(what),
            other => FetchError::NetworkFailure(other.to_string()),
        }
    }
}

/// Verified artifact bytes, staged locally
#[derive(Debug, Clone)]
pub struct VerifiedArtifact {
    pub artifact: String,
    pub version: VersionString,
    pub path: PathBuf,
    pub bytes: Arc<Vec<u8>>,
    pub sha256: String,
}

/// Downloads artifacts from a registry and proves their integrity
pub struct ArtifactFetcher {
    registry: Arc<dyn RegistryClient>,
    staging: Dir,
    attempts: u32,
    cooldown: CooldownOptions,
}

impl ArtifactFetcher {
    pub fn new(
        registry: Arc<dyn RegistryClient>,
        staging: Dir,
        attempts: u32,
        cooldown: CooldownOptions,
    ) -> Self {
        Self {
            registry,
            staging,
            attempts,
            cooldown,
        }
    }

    pub fn staging(&self) -> &Dir {
        &self.staging
    }

    /// Download `version` of `source`. Network failures are retried with backoff;
    /// a missing artifact is not.
    pub async fn fetch(
        &self,
        source: &ArtifactSource,
        version: &VersionString,
    ) -> Result<(Vec<u8>, ExpectedDigest), FetchError> {
        let what = format!("fetch {} {}", source, version);
        let descriptor = retry_with_backoff(
            &what,
            self.attempts,
            &self.cooldown,
            is_retryable,
            || self.registry.download_descriptor(source, version),
        )
        .await?;

        if descriptor.digests.is_empty() {
            return Err(FetchError::MissingDigest(format!("{} {}", source, version)));
        }

        let bytes = retry_with_backoff(
            &what,
            self.attempts,
            &self.cooldown,
            is_retryable,
            || self.registry.download(&descriptor.url),
        )
        .await?;

        info!("Downloaded {} {} ({} bytes)", source, version, bytes.len());
        Ok((bytes, descriptor.digests))
    }

    /// Check bytes against the strongest published digest
    pub fn verify(bytes: &[u8], expected: &ExpectedDigest) -> bool {
        digest::verify(bytes, expected)
    }

    /// Fetch, stage, verify and promote an artifact
    pub async fn fetch_verified(
        &self,
        artifact: &ManagedArtifact,
        version: &VersionString,
    ) -> Result<VerifiedArtifact, FetchError> {
        let (bytes, expected) = self.fetch(&artifact.source, version).await?;

        let part = self
            .staging
            .file(&format!("{}.part", file_component(artifact.name())));
        part.write_bytes(&bytes).await.map_err(staging_error)?;

        if !Self::verify(&bytes, &expected) {
            part.delete().await.map_err(staging_error)?;
            let (algorithm, expected, actual) = match expected.strongest() {
                Some((a, v)) => (a.to_string(), v.to_string(), a.compute(&bytes)),
                None => Default::default(),
            };
            error!(
                "{} mismatch for {} {}: expected {}, got {}",
                algorithm,
                artifact.name(),
                version,
                expected,
                actual
            );
            return Err(FetchError::IntegrityFailure {
                artifact: artifact.name().to_string(),
                algorithm,
                expected,
                actual,
            });
        }

        let target = self
            .staging
            .path()
            .join(format!(
                "{}-{}.jar",
                file_component(artifact.name()),
                file_component(version.raw())
            ));
        let staged = part.rename_to(&target).await.map_err(staging_error)?;
        info!("Verified {} {} -> {}", artifact.name(), version, target.display());

        Ok(VerifiedArtifact {
            artifact: artifact.name().to_string(),
            version: version.clone(),
            path: staged.path().to_path_buf(),
            sha256: sha256_hash(&bytes),
            bytes: Arc::new(bytes),
        })
    }

    /// Remove a staged artifact that will not be deployed
    pub async fn discard(&self, verified: &VerifiedArtifact) -> Result<(), DeployerError> {
        File::new(&verified.path).delete().await
    }
}

/// Registry text made safe to use as a single file name inside staging
fn file_component(text: &str) -> String {
    let mut cleaned: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '+') {
                c
            } else {
                '_'
            }
        })
        .collect();
    while cleaned.contains("..") {
        cleaned = cleaned.replace("..", "_");
    }
    cleaned
}

fn is_retryable(err: &DeployerError) -> bool {
    !matches!(err, DeployerError::NotFound(_))
}

fn staging_error(err: DeployerError) -> FetchError {
    FetchError::Staging(err.to_string())
}
