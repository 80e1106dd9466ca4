//! Settings file management

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::DeployerError;
use crate::gate::compat::CompatibilityRule;
use crate::logs::LogLevel;
use crate::models::artifact::ManagedArtifact;
use crate::models::server::ServerConfig;
use crate::utils::CooldownOptions;

/// Deployer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Logging configuration
    #[serde(default)]
    pub log: LogSettings,

    /// Upstream registries
    #[serde(default)]
    pub registry: RegistrySettings,

    /// SSH access to the node hosting the servers
    #[serde(default)]
    pub ssh: SshSettings,

    /// Deployment tuning
    #[serde(default)]
    pub deploy: DeploySettings,

    /// Where concluded records are committed
    #[serde(default)]
    pub audit: AuditSettings,

    /// Fleet servers
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Managed plugins
    #[serde(default)]
    pub plugins: Vec<ManagedArtifact>,

    /// Infrastructure requirements of plugins
    #[serde(default)]
    pub compatibility: Vec<CompatibilityRule>,

    /// How to read the build of each infrastructure component
    #[serde(default = "default_probes")]
    pub probes: Vec<InfrastructureProbe>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log: LogSettings::default(),
            registry: RegistrySettings::default(),
            ssh: SshSettings::default(),
            deploy: DeploySettings::default(),
            audit: AuditSettings::default(),
            servers: Vec::new(),
            plugins: Vec::new(),
            compatibility: Vec::new(),
            probes: default_probes(),
        }
    }
}

impl Settings {
    /// Reject configurations the deployer cannot act on safely
    pub fn validate(&self) -> Result<(), DeployerError> {
        let mut names = BTreeSet::new();
        for plugin in &self.plugins {
            if !names.insert(plugin.name()) {
                return Err(DeployerError::ConfigError(format!(
                    "Duplicate plugin '{}'",
                    plugin.name()
                )));
            }
            if plugin.identity.platforms.is_empty() {
                return Err(DeployerError::ConfigError(format!(
                    "Plugin '{}' targets no platform",
                    plugin.name()
                )));
            }
        }

        let mut servers = BTreeSet::new();
        for server in &self.servers {
            if !servers.insert(server.name.as_str()) {
                return Err(DeployerError::ConfigError(format!(
                    "Duplicate server '{}'",
                    server.name
                )));
            }
        }

        for rule in &self.compatibility {
            if !names.contains(rule.artifact.as_str()) {
                return Err(DeployerError::ConfigError(format!(
                    "Compatibility rule references unknown plugin '{}'",
                    rule.artifact
                )));
            }
        }

        for (name, base) in [
            ("registry.modrinth_url", &self.registry.modrinth_url),
            ("registry.geyser_url", &self.registry.geyser_url),
        ] {
            Url::parse(base)
                .map_err(|e| DeployerError::ConfigError(format!("{} '{}': {}", name, base, e)))?;
        }

        if self.deploy.parallelism == 0 {
            return Err(DeployerError::ConfigError(
                "deploy.parallelism must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn plugin(&self, name: &str) -> Option<&ManagedArtifact> {
        self.plugins.iter().find(|p| p.name() == name)
    }

    pub fn server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| s.name == name)
    }

    pub fn probe(&self, component: &str) -> Option<&InfrastructureProbe> {
        self.probes.iter().find(|p| p.component == component)
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    /// Log level
    #[serde(default)]
    pub level: LogLevel,

    /// Directory for the daily log file. Defaults to the storage logs directory.
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Write a log file in addition to stdout
    #[serde(default = "default_true")]
    pub to_file: bool,

    /// Emit JSON lines instead of plain text
    #[serde(default)]
    pub json: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            dir: None,
            to_file: true,
            json: false,
        }
    }
}

/// Registry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySettings {
    /// Base URL of the Modrinth API
    #[serde(default = "default_modrinth_url")]
    pub modrinth_url: String,

    /// Base URL of the GeyserMC download API
    #[serde(default = "default_geyser_url")]
    pub geyser_url: String,

    #[serde(default = "default_api_timeout")]
    pub api_timeout_secs: u64,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_modrinth_url() -> String {
    "https://api.modrinth.com/v2".to_string()
}

fn default_geyser_url() -> String {
    "https://download.geysermc.org/v2/projects".to_string()
}

fn default_api_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    30
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            modrinth_url: default_modrinth_url(),
            geyser_url: default_geyser_url(),
            api_timeout_secs: default_api_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

/// SSH settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Node host, used when a server has no host override
    #[serde(default = "default_ssh_host")]
    pub host: String,

    #[serde(default = "default_ssh_user")]
    pub user: String,

    /// Private key. Defaults to the ssh agent / config.
    #[serde(default)]
    pub key_path: Option<PathBuf>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout of a single remote command
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,

    /// `user:group` given to deployed files. Pterodactyl containers run as 988.
    #[serde(default = "default_file_owner")]
    pub file_owner: Option<String>,
}

fn default_ssh_host() -> String {
    "localhost".to_string()
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_command_timeout() -> u64 {
    60
}

fn default_file_owner() -> Option<String> {
    Some("988:988".to_string())
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host: default_ssh_host(),
            user: default_ssh_user(),
            key_path: None,
            connect_timeout_secs: default_connect_timeout(),
            command_timeout_secs: default_command_timeout(),
            file_owner: default_file_owner(),
        }
    }
}

/// Deployment tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploySettings {
    /// Servers (and fetches) processed concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,

    /// Attempts per network operation
    #[serde(default = "default_fetch_attempts")]
    pub fetch_attempts: u32,

    /// Backoff between attempts
    #[serde(default)]
    pub cooldown: CooldownOptions,

    /// How long a restarted server may take to become healthy
    #[serde(default = "default_health_timeout")]
    pub health_timeout_secs: u64,

    #[serde(default = "default_health_poll_interval")]
    pub health_poll_interval_ms: u64,

    /// Wait after a server is healthy before checking plugins loaded
    #[serde(default = "default_plugin_load_delay")]
    pub plugin_load_delay_ms: u64,

    /// Minimum free space on each server's volume
    #[serde(default = "default_min_free_space")]
    pub min_free_space_mb: u64,

    /// Minimum free space on the local staging disk
    #[serde(default = "default_min_free_space")]
    pub min_local_free_space_mb: u64,
}

fn default_parallelism() -> usize {
    4
}

fn default_fetch_attempts() -> u32 {
    3
}

fn default_health_timeout() -> u64 {
    120
}

fn default_health_poll_interval() -> u64 {
    2000
}

fn default_plugin_load_delay() -> u64 {
    3000
}

fn default_min_free_space() -> u64 {
    500
}

impl DeploySettings {
    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms)
    }

    pub fn plugin_load_delay(&self) -> Duration {
        Duration::from_millis(self.plugin_load_delay_ms)
    }
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            fetch_attempts: default_fetch_attempts(),
            cooldown: CooldownOptions::default(),
            health_timeout_secs: default_health_timeout(),
            health_poll_interval_ms: default_health_poll_interval(),
            plugin_load_delay_ms: default_plugin_load_delay(),
            min_free_space_mb: default_min_free_space(),
            min_local_free_space_mb: default_min_free_space(),
        }
    }
}

/// Audit trail settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditSettings {
    /// Commit the state store to git after every batch
    #[serde(default)]
    pub git: bool,

    /// Repository holding the state store. Defaults to the storage base directory.
    #[serde(default)]
    pub repo_dir: Option<PathBuf>,
}

/// Reads an infrastructure component's build from the server log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureProbe {
    /// Component name, matched against `ServerConfig::component`
    pub component: String,

    /// Fixed text identifying the boot line
    pub marker: String,

    /// Regex whose first capture group is the build number
    #[serde(default = "default_build_pattern")]
    pub build_pattern: String,
}

fn default_build_pattern() -> String {
    r"-b(\d+)".to_string()
}

fn default_probes() -> Vec<InfrastructureProbe> {
    vec![
        InfrastructureProbe {
            component: "velocity".to_string(),
            marker: "Booting up Velocity".to_string(),
            build_pattern: default_build_pattern(),
        },
        InfrastructureProbe {
            component: "paper".to_string(),
            marker: "This server is running Paper version".to_string(),
            build_pattern: r"-(\d+)-".to_string(),
        },
    ]
}
