//! Modrinth API client

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::DeployerError;
use crate::fetch::digest::ExpectedDigest;
use crate::http::client::HttpClient;

/// A published project version
#[derive(Debug, Clone, Deserialize)]
pub struct ModrinthVersion {
    pub version_number: String,

    /// `release`, `beta` or `alpha`
    pub version_type: String,

    #[serde(default)]
    pub loaders: Vec<String>,

    pub files: Vec<ModrinthFile>,

    #[serde(default)]
    pub date_published: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModrinthFile {
    pub url: String,
    pub filename: String,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl ModrinthVersion {
    pub fn is_release(&self) -> bool {
        self.version_type == "release"
    }

    pub fn supports_loader(&self, loader: Option<&str>) -> bool {
        match loader {
            Some(loader) => self.loaders.iter().any(|l| l.eq_ignore_ascii_case(loader)),
            None => true,
        }
    }

    /// The file flagged primary, or the first file
    pub fn primary_file(&self) -> Option<&ModrinthFile> {
        self.files
            .iter()
            .find(|f| f.primary)
            .or_else(|| self.files.first())
    }
}

impl ModrinthFile {
    pub fn digests(&self) -> ExpectedDigest {
        ExpectedDigest::from_named(&self.hashes)
    }
}

/// Newest version matching the loader. Modrinth lists versions newest first.
pub fn select_latest<'a>(
    versions: &'a [ModrinthVersion],
    loader: Option<&str>,
    include_prerelease: bool,
) -> Option<&'a ModrinthVersion> {
    versions
        .iter()
        .filter(|v| v.supports_loader(loader))
        .find(|v| include_prerelease || v.is_release())
}

impl HttpClient {
    /// List every version of a project
    pub async fn modrinth_versions(
        &self,
        project_id: &str,
    ) -> Result<Vec<ModrinthVersion>, DeployerError> {
        let path = format!("/project/{}/version", project_id);
        self.get_json(&path).await
    }
}
