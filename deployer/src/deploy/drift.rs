//! Consistency audit across servers of the same platform

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;
use crate::models::artifact::{ManagedArtifact, Platform};
use crate::models::server::ServerConfig;
use crate::state::deployment::DeploymentState;
use crate::version::VersionString;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactDrift {
    pub artifact: String,

    /// Installed version per server, `None` when missing
    pub versions: BTreeMap<String, Option<VersionString>>,

    /// Servers disagree on the normalized version
    pub drifted: bool,

    /// Servers where the plugin is not installed
    pub missing: Vec<String>,
}

impl ArtifactDrift {
    pub fn is_consistent(&self) -> bool {
        !self.drifted && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformDrift {
    pub platform: Platform,
    pub servers: Vec<String>,
    pub artifacts: Vec<ArtifactDrift>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub platforms: Vec<PlatformDrift>,
}

impl DriftReport {
    pub fn is_consistent(&self) -> bool {
        self.platforms
            .iter()
            .flat_map(|p| p.artifacts.iter())
            .all(ArtifactDrift::is_consistent)
    }

    /// Plugins that drift or are missing somewhere
    pub fn inconsistencies(&self) -> impl Iterator<Item = (Platform, &ArtifactDrift)> {
        self.platforms.iter().flat_map(|p| {
            p.artifacts
                .iter()
                .filter(|a| !a.is_consistent())
                .map(move |a| (p.platform, a))
        })
    }
}

/// Compare deployed versions of every managed plugin across the servers of each
/// platform it targets
pub async fn audit_drift(
    plugins: &[ManagedArtifact],
    servers: &[ServerConfig],
    state: &DeploymentState,
) -> Result<DriftReport, DeployerError> {
    let mut by_platform: BTreeMap<Platform, Vec<&ServerConfig>> = BTreeMap::new();
    for server in servers {
        by_platform.entry(server.platform).or_default().push(server);
    }

    let mut report = DriftReport::default();
    for (platform, members) in by_platform {
        let mut installed = BTreeMap::new();
        for server in &members {
            installed.insert(server.name.clone(), state.installed(server).await?);
        }

        let artifacts = plugins
            .iter()
            .filter(|p| p.identity.targets(platform))
            .map(|plugin| {
                let versions: BTreeMap<String, Option<VersionString>> = members
                    .iter()
                    .map(|s| {
                        let version = installed
                            .get(&s.name)
                            .and_then(|entries| entries.get(plugin.name()))
                            .map(|entry| entry.version.clone());
                        (s.name.clone(), version)
                    })
                    .collect();
                let distinct: BTreeSet<_> = versions
                    .values()
                    .flatten()
                    .map(|v| v.normalized())
                    .collect();
                ArtifactDrift {
                    artifact: plugin.name().to_string(),
                    drifted: distinct.len() > 1,
                    missing: versions
                        .iter()
                        .filter(|(_, v)| v.is_none())
                        .map(|(s, _)| s.clone())
                        .collect(),
                    versions,
                }
            })
            .collect();

        report.platforms.push(PlatformDrift {
            platform,
            servers: members.iter().map(|s| s.name.clone()).collect(),
            artifacts,
        });
    }
    Ok(report)
}
