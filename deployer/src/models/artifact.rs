//! Managed artifact models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Deployment target runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    /// Velocity proxy
    Velocity,
    /// Paper game server
    Paper,
    /// Spigot game server
    Spigot,
    /// BungeeCord proxy
    Bungeecord,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Velocity => "velocity",
            Platform::Paper => "paper",
            Platform::Spigot => "spigot",
            Platform::Bungeecord => "bungeecord",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a managed artifact. Defined by configuration, never created at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactIdentity {
    /// Unique artifact name, e.g. `Geyser-Velocity`
    pub name: String,

    /// Platforms the artifact is installed on
    pub platforms: Vec<Platform>,

    /// Priority class, e.g. `bedrock` or `tier1`
    #[serde(default = "default_tier")]
    pub tier: String,

    /// Whether a blocked compatibility gate aborts the whole batch
    #[serde(default)]
    pub critical: bool,
}

fn default_tier() -> String {
    "default".to_string()
}

impl ArtifactIdentity {
    pub fn targets(&self, platform: Platform) -> bool {
        self.platforms.contains(&platform)
    }
}

/// Where the artifact is published upstream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum ArtifactSource {
    /// Modrinth project
    Modrinth {
        project_id: String,
        /// Restrict to files for this loader (e.g. `velocity`, `paper`)
        #[serde(default)]
        loader: Option<String>,
    },
    /// GeyserMC download API
    Geyser { project: String, artifact: String },
}

impl fmt::Display for ArtifactSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArtifactSource::Modrinth { project_id, .. } => write!(f, "modrinth:{}", project_id),
            ArtifactSource::Geyser { project, artifact } => {
                write!(f, "geyser:{}/{}", project, artifact)
            }
        }
    }
}

/// A manifest entry: artifact identity plus where it comes from and where it lands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedArtifact {
    #[serde(flatten)]
    pub identity: ArtifactIdentity,

    #[serde(flatten)]
    pub source: ArtifactSource,

    /// Fixed file name on the server. Defaults to `<name>.jar`.
    #[serde(default)]
    pub file_name: Option<String>,
}

impl ManagedArtifact {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn file_name(&self) -> String {
        self.file_name
            .clone()
            .unwrap_or_else(|| format!("{}.jar", self.identity.name))
    }
}
