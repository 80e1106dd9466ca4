//! SSH remote executor
//!
//! Every operation is one `ssh` invocation running a short POSIX shell script on the
//! node. Servers are Pterodactyl containers identified by their uuid.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::errors::DeployerError;
use crate::models::server::ServerConfig;
use crate::remote::executor::RemoteExecutor;
use crate::storage::settings::{InfrastructureProbe, SshSettings};

/// Output of a remote command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

fn quote(value: &str) -> String {
    shell_escape::escape(value.into()).into_owned()
}

/// `docker ps` lookup of a server's container id
fn container_of(server: &ServerConfig) -> String {
    format!("$(docker ps --filter name={} -q)", quote(&server.uuid))
}

/// Last "loaded plugin" log line mentioning `artifact`, matched as fixed strings
fn plugin_load_script(artifact: &str, log_path: &str) -> String {
    format!(
        "grep -i -F -e 'loaded plugin' {} | grep -i -F -e {} | tail -1",
        quote(log_path),
        quote(artifact)
    )
}

/// Parse a build number out of a boot line
pub fn parse_build(line: &str, pattern: &str) -> Result<Option<u64>, DeployerError> {
    let regex = Regex::new(pattern).map_err(|e| {
        DeployerError::ConfigError(format!("Invalid build pattern '{}': {}", pattern, e))
    })?;
    Ok(regex
        .captures(line)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok()))
}

pub struct SshExecutor {
    settings: SshSettings,
    probes: Vec<InfrastructureProbe>,
}

impl SshExecutor {
    pub fn new(settings: SshSettings, probes: Vec<InfrastructureProbe>) -> Self {
        Self { settings, probes }
    }

    fn destination(&self, server: &ServerConfig) -> String {
        let host = server.host.as_deref().unwrap_or(&self.settings.host);
        format!("{}@{}", self.settings.user, host)
    }

    fn command(&self, server: &ServerConfig, script: &str) -> Command {
        let mut command = Command::new("ssh");
        command
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.settings.connect_timeout_secs));
        if let Some(key) = &self.settings.key_path {
            command.arg("-i").arg(key);
        }
        command
            .arg(self.destination(server))
            .arg(script)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    /// Run a script on the server's node, optionally feeding `stdin`
    pub async fn run(
        &self,
        server: &ServerConfig,
        script: &str,
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, DeployerError> {
        debug!("[{}] ssh {}", server.name, script);

        let mut command = self.command(server, script);
        command.stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let timeout = Duration::from_secs(self.settings.command_timeout_secs);
        let run = async {
            let mut child = command.spawn()?;
            if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
                pipe.write_all(bytes).await?;
                pipe.shutdown().await?;
            }
            child.wait_with_output().await
        };

        let output = tokio::time::timeout(timeout, run)
            .await
            .map_err(|_| {
                DeployerError::remote(&server.name, format!("timed out after {:?}", timeout))
            })?
            .map_err(|e| DeployerError::remote(&server.name, format!("failed to run ssh: {}", e)))?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run a script and fail unless it exits successfully
    async fn run_checked(
        &self,
        server: &ServerConfig,
        script: &str,
        stdin: Option<&[u8]>,
    ) -> Result<String, DeployerError> {
        let output = self.run(server, script, stdin).await?;
        if !output.success {
            return Err(DeployerError::remote(
                &server.name,
                format!("`{}` failed: {}", script, output.stderr.trim()),
            ));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn ping(&self, server: &ServerConfig) -> Result<(), DeployerError> {
        let stdout = self.run_checked(server, "echo ok", None).await?;
        if stdout.trim() != "ok" {
            return Err(DeployerError::remote(&server.name, "unexpected ping reply"));
        }
        Ok(())
    }

    async fn free_space_mb(&self, server: &ServerConfig) -> Result<u64, DeployerError> {
        let script = format!(
            "df -Pm {} | tail -1 | awk '{{print $4}}'",
            quote(&server.plugins_dir())
        );
        let stdout = self.run_checked(server, &script, None).await?;
        stdout.trim().parse().map_err(|_| {
            DeployerError::remote(
                &server.name,
                format!("unexpected df output '{}'", stdout.trim()),
            )
        })
    }

    async fn read_infrastructure_version(
        &self,
        server: &ServerConfig,
        component: &str,
    ) -> Result<Option<u64>, DeployerError> {
        let Some(probe) = self.probes.iter().find(|p| p.component == component) else {
            return Ok(None);
        };

        let script = format!(
            "grep -F {} {} | tail -1",
            quote(&probe.marker),
            quote(&server.log_path())
        );
        let output = self.run(server, &script, None).await?;
        let line = output.stdout.trim();
        if line.is_empty() {
            return Ok(None);
        }
        parse_build(line, &probe.build_pattern)
    }

    async fn file_exists(&self, server: &ServerConfig, path: &str) -> Result<bool, DeployerError> {
        let script = format!("test -f {} && echo exists || echo missing", quote(path));
        let stdout = self.run_checked(server, &script, None).await?;
        Ok(stdout.trim() == "exists")
    }

    async fn copy_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError> {
        let script = format!("cp -p {} {} && sync {}", quote(from), quote(to), quote(to));
        self.run_checked(server, &script, None).await?;
        Ok(())
    }

    async fn remove_file(&self, server: &ServerConfig, path: &str) -> Result<(), DeployerError> {
        self.run_checked(server, &format!("rm -f {}", quote(path)), None)
            .await?;
        Ok(())
    }

    async fn rename_file(
        &self,
        server: &ServerConfig,
        from: &str,
        to: &str,
    ) -> Result<(), DeployerError> {
        let script = format!("mv -f {} {}", quote(from), quote(to));
        self.run_checked(server, &script, None).await?;
        Ok(())
    }

    async fn replace_file(
        &self,
        server: &ServerConfig,
        path: &str,
        bytes: &[u8],
    ) -> Result<(), DeployerError> {
        let tmp = quote(&format!("{}.plugfleet-{}.tmp", path, uuid::Uuid::new_v4()));
        let chown = match &self.settings.file_owner {
            Some(owner) => format!("chown {} {} && ", quote(owner), tmp),
            None => String::new(),
        };
        let script = format!(
            "cat > {tmp} && {chown}chmod 644 {tmp} && sync {tmp} && mv -f {tmp} {path} || {{ rm -f {tmp}; exit 1; }}",
            tmp = tmp,
            chown = chown,
            path = quote(path)
        );
        self.run_checked(server, &script, Some(bytes)).await?;
        Ok(())
    }

    async fn restart_service(&self, server: &ServerConfig) -> Result<(), DeployerError> {
        let script = format!("docker restart {}", container_of(server));
        self.run_checked(server, &script, None).await?;
        info!("Restarted {}", server.name);
        Ok(())
    }

    async fn is_service_healthy(&self, server: &ServerConfig) -> Result<bool, DeployerError> {
        let script = format!(
            "docker inspect --format '{{{{if .State.Health}}}}{{{{.State.Health.Status}}}}{{{{else}}}}{{{{.State.Status}}}}{{{{end}}}}' {}",
            container_of(server)
        );
        let output = self.run(server, &script, None).await?;
        Ok(output.success && matches!(output.stdout.trim(), "healthy" | "running"))
    }

    async fn is_plugin_loaded(
        &self,
        server: &ServerConfig,
        artifact: &str,
    ) -> Result<bool, DeployerError> {
        let script = plugin_load_script(artifact, &server.log_path());
        let output = self.run(server, &script, None).await?;
        Ok(output
            .stdout
            .to_lowercase()
            .contains(&artifact.to_lowercase()))
    }
}
