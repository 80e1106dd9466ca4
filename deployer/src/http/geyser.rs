//! GeyserMC download API client

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::errors::DeployerError;
use crate::http::client::HttpClient;
use crate::version::VersionString;

/// A build of a Geyser project version
#[derive(Debug, Clone, Deserialize)]
pub struct GeyserBuild {
    pub version: String,
    pub build: u64,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub downloads: BTreeMap<String, GeyserDownload>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeyserDownload {
    pub name: String,
    pub sha256: String,
}

impl GeyserBuild {
    /// Version text as published by this tool, e.g. `2.9.0-b981`
    pub fn version_string(&self) -> VersionString {
        VersionString::new(format!("{}-b{}", self.version, self.build))
    }
}

/// Split a Geyser version string into project version and build number
pub fn split_version(version: &VersionString) -> Option<(String, u64)> {
    let normalized = version.normalized();
    let (release, build) = normalized.as_str().rsplit_once("-b")?;
    let build = build.parse().ok()?;
    Some((release.to_string(), build))
}

impl HttpClient {
    /// Latest build of the latest project version
    pub async fn geyser_latest_build(&self, project: &str) -> Result<GeyserBuild, DeployerError> {
        let path = format!("/{}/versions/latest/builds/latest", project);
        self.get_json(&path).await
    }

    /// A specific build
    pub async fn geyser_build(
        &self,
        project: &str,
        version: &str,
        build: u64,
    ) -> Result<GeyserBuild, DeployerError> {
        let path = format!("/{}/versions/{}/builds/{}", project, version, build);
        self.get_json(&path).await
    }

    /// Download URL of one artifact of a build
    pub fn geyser_download_url(&self, project: &str, version: &str, build: u64, artifact: &str) -> String {
        self.url(&format!(
            "/{}/versions/{}/builds/{}/downloads/{}",
            project, version, build, artifact
        ))
    }
}
