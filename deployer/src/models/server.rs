//! Fleet server models

use serde::{Deserialize, Serialize};

use crate::models::artifact::Platform;

/// Root of the Pterodactyl server volumes on a node
pub const DEFAULT_VOLUMES_ROOT: &str = "/var/lib/pterodactyl/volumes";

/// A game server in the fleet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server name, e.g. `minecraft-proxy-0`
    pub name: String,

    /// Container identifier on the node
    pub uuid: String,

    /// Runtime platform
    pub platform: Platform,

    /// Infrastructure component this server runs. Defaults to the platform name.
    #[serde(default)]
    pub component: Option<String>,

    /// SSH host override. Defaults to the configured node host.
    #[serde(default)]
    pub host: Option<String>,

    /// Plugins directory override
    #[serde(default)]
    pub plugins_dir: Option<String>,

    /// Server log override
    #[serde(default)]
    pub log_path: Option<String>,
}

impl ServerConfig {
    pub fn component(&self) -> &str {
        self.component
            .as_deref()
            .unwrap_or_else(|| self.platform.as_str())
    }

    pub fn plugins_dir(&self) -> String {
        self.plugins_dir
            .clone()
            .unwrap_or_else(|| format!("{}/{}/plugins", DEFAULT_VOLUMES_ROOT, self.uuid))
    }

    pub fn log_path(&self) -> String {
        self.log_path
            .clone()
            .unwrap_or_else(|| format!("{}/{}/logs/latest.log", DEFAULT_VOLUMES_ROOT, self.uuid))
    }

    /// Remote path of an artifact's file on this server
    pub fn artifact_path(&self, file_name: &str) -> String {
        format!("{}/{}", self.plugins_dir().trim_end_matches('/'), file_name)
    }
}
