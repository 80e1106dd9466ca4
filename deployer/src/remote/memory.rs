//! In-memory fleet
//!
//! Simulates servers, their plugin files and their runtime behaviour. Faults can be
//! injected per server to exercise abort and rollback paths.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::watch;

use crate::errors::DeployerError;
use crate::models::server::ServerConfig;
use crate::remote::executor::RemoteExecutor;

#[derive(Debug, Clone)]
struct SimulatedServer {
    files: BTreeMap<String, Vec<u8>>,
    builds: HashMap<String, u64>,
    reachable: bool,
    free_space_mb: u64,
    healthy: bool,
    fail_replace: bool,
    unloadable: BTreeSet<String>,
    restarts: u32,
}

impl Default for SimulatedServer {
    fn default() -> Self {
        Self {
            files: BTreeMap::new(),
            builds: HashMap::new(),
            reachable: true,
            free_space_mb: 10_000,
            healthy: true,
            fail_replace: false,
            unloadable: BTreeSet::new(),
            restarts: 0,
        }
    }
}

#[derive(Debug, Default)]
struct Fleet {
    servers: HashMap<String, SimulatedServer>,
    /// Mutating operations, in order, as `<op> <server> <path>`
    journal: Vec<String>,
}

/// Remote executor over simulated servers
#[derive(Debug, Default)]
pub struct MemoryRemote {
    fleet: Mutex<Fleet>,
    /// Raised whenever a server is restarted
    restart_signal: Mutex<Option<watch::Sender<bool>>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn fleet(&self) -> MutexGuard<'_, Fleet> {
        self.fleet.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_server<T>(&self, server: &str, f: impl FnOnce(&mut SimulatedServer) -> T) -> T {
        let mut fleet = self.fleet();
        f(fleet.servers.entry(server.to_string()).or_default())
    }

    pub fn set_file(&self, server: &str, path: &str, bytes: &[u8]) {
        self.with_server(server, |s| {
            s.files.insert(path.to_string(), bytes.to_vec());
        });
    }

    pub fn file(&self, server: &str, path: &str) -> Option<Vec<u8>> {
        self.with_server(server, |s| s.files.get(path).cloned())
    }

    pub fn paths(&self, server: &str) -> Vec<String> {
        self.with_server(server, |s| s.files.keys().cloned().collect())
    }

    pub fn set_build(&self, server: &str, component: &str, build: u64) {
        self.with_server(server, |s| {
            s.builds.insert(component.to_string(), build);
        });
    }

    pub fn set_unreachable(&self, server: &str) {
        self.with_server(server, |s| s.reachable = false);
    }

    pub fn set_free_space(&self, server: &str, mb: u64) {
        self.with_server(server, |s| s.free_space_mb = mb);
    }

    pub fn set_healthy(&self, server: &str, healthy: bool) {
        self.with_server(server, |s| s.healthy = healthy);
    }

    pub fn fail_replace(&self, server: &str) {
        self.with_server(server, |s| s.fail_replace = true);
    }

    pub fn fail_plugin_load(&self, server: &str, artifact: &str) {
        self.with_server(server, |s| {
            s.unloadable.insert(artifact.to_string());
        });
    }

    /// Send `true` on `signal` each time any server restarts
    pub fn signal_on_restart(&self, signal: watch::Sender<bool>) {
        *self
            .restart_signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(signal);
    }

    pub fn restarts(&self, server: &str) -> u32 {
        self.with_server(server, |s| s.restarts)
    }

    /// Mutating operations performed so far
    pub fn journal(&self) -> Vec<String> {
        self.fleet().journal.clone()
    }

    fn mutate<T>(
        &self,
        server: &ServerConfig,
        entry: String,
        f: impl FnOnce(&mut SimulatedServer) -> Result<T, DeployerError>,
    ) -> Result<T, DeployerError> {
        let mut fleet = self.fleet();
        let sim = fleet.servers.entry(server.name.clone()).or_default();
        if !sim.reachable {
            return Err(DeployerError::remote(&server.name, "host unreachable"));
        }
        let result = f(sim)?;
        fleet.journal.push(entry);
        Ok(result)
    }

    fn read<T>(
        &self,
        server: &ServerConfig,
        f: impl FnOnce(&SimulatedServer) -> T,
    ) -> Result<T, DeployerError> {
        let mut fleet = self.fleet();
        let sim = fleet.servers.entry(server.name.clone()).or_default();
        if !sim.reachable {
            return Err(DeployerError::remote(&server.name, "host unreachable"));
        }
        Ok(f(sim))
    }
}

#[async_trait]
impl RemoteExecutor for MemoryRemote {
    async fn ping(&self, server: &ServerConfig) -> Result<(), DeployerError> {
        self.read(server, |_| ())
    }

    async fn free_space_mb(&self, server: &ServerConfig) -> Result<u64, DeployerError> {
        self.read(server, |s| s.free_space_mb)
    }

    async fn read_infrastructure_version(
        &self,
        server: &ServerConfig,
        component: &str,
    ) -> Result<Option<u64>, DeployerError> {
        self.read(server, |s| s.builds.get(component).copied())
    }

    async fn file_exists(&self, server: &ServerConfig, path: &str) -> Result<bool, DeployerError> {
        self.read(server, |s| s.files.contains_key(path))
    }

    async fn copy_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError> {
        self.mutate(server, format!("copy {} {}", server.name, to), |s| {
            let bytes = s
                .files
                .get(from)
                .cloned()
                .ok_or_else(|| DeployerError::remote(&server.name, format!("{} missing", from)))?;
            s.files.insert(to.to_string(), bytes);
            Ok(())
        })
    }

    async fn remove_file(&self, server: &ServerConfig, path: &str) -> Result<(), DeployerError> {
        self.mutate(server, format!("remove {} {}", server.name, path), |s| {
            s.files.remove(path);
            Ok(())
        })
    }

    async fn rename_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError> {
        self.mutate(server, format!("rename {} {}", server.name, to), |s| {
            let bytes = s
                .files
                .remove(from)
                .ok_or_else(|| DeployerError::remote(&server.name, format!("{} missing", from)))?;
            s.files.insert(to.to_string(), bytes);
            Ok(())
        })
    }

    async fn replace_file(
        &self,
        server: &ServerConfig,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), DeployerError> {
        self.mutate(server, format!("replace {} {}", server.name, path), |s| {
            if s.fail_replace {
                return Err(DeployerError::remote(&server.name, "no space left on device"));
            }
            s.files.insert(path.to_string(), bytes.to_vec());
            Ok(())
        })
    }

    async fn restart_service(&self, server: &ServerConfig) -> Result<(), DeployerError> {
        self.mutate(server, format!("restart {}", server.name), |s| {
            s.restarts += 1;
            Ok(())
        })?;
        if let Some(signal) = self
            .restart_signal
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
        {
            let _ = signal.send(true);
        }
        Ok(())
    }

    async fn is_service_healthy(&self, server: &ServerConfig) -> Result<bool, DeployerError> {
        self.read(server, |s| s.healthy)
    }

    async fn is_plugin_loaded(
        &self,
        server: &ServerConfig,
        artifact: &str,
    ) -> Result<bool, DeployerError> {
        self.read(server, |s| !s.unloadable.contains(artifact))
    }
}
