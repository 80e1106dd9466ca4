//! Git audit sink
//!
//! Stages the state store and commits it with the record's summary as subject.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::audit::AuditSink;
use crate::errors::DeployerError;
use crate::models::record::DeploymentRecord;

/// Outcome of a git invocation
#[derive(Debug)]
struct GitOutput {
    success: bool,
    text: String,
}

fn nothing_to_commit(text: &str) -> bool {
    text.contains("nothing to commit") || text.contains("no changes added to commit")
}

/// Commit message: summary subject, then one line per reason
pub fn commit_message(record: &DeploymentRecord) -> String {
    let mut message = record.summary();
    if !record.reasons.is_empty() {
        message.push_str("\n\n");
        message.push_str(&record.reasons.join("\n"));
    }
    message.push_str(&format!("\n\nRecord: {}", record.id));
    message
}

pub struct GitAuditSink {
    repo_dir: PathBuf,
    paths: Vec<PathBuf>,
}

impl GitAuditSink {
    /// Commit `paths` (relative to `repo_dir` or absolute) after every operation
    pub fn new(repo_dir: impl Into<PathBuf>, paths: Vec<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            paths,
        }
    }

    async fn git(&self, args: &[&str]) -> Result<GitOutput, DeployerError> {
        debug!("git {}", args.join(" "));
        let output = Command::new("git")
            .current_dir(&self.repo_dir)
            .args(args)
            .output()
            .await
            .map_err(|e| DeployerError::AuditError(format!("Failed to run git: {}", e)))?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(GitOutput {
            success: output.status.success(),
            text,
        })
    }
}

#[async_trait]
impl AuditSink for GitAuditSink {
    async fn record_deployment(&self, record: &DeploymentRecord) -> Result<(), DeployerError> {
        let inside = self.git(&["rev-parse", "--is-inside-work-tree"]).await?;
        if !inside.success {
            warn!("{:?} is not a git repository, skipping commit", self.repo_dir);
            return Ok(());
        }

        let mut add = vec!["add", "--"];
        let paths: Vec<String> = self
            .paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect();
        add.extend(paths.iter().map(String::as_str));
        let staged = self.git(&add).await?;
        if !staged.success {
            return Err(DeployerError::AuditError(format!(
                "git add failed: {}",
                staged.text.trim()
            )));
        }

        let message = commit_message(record);
        let commit = self.git(&["commit", "-m", &message]).await?;
        if commit.success {
            info!("Committed record {}", record.id);
            Ok(())
        } else if nothing_to_commit(&commit.text) {
            debug!("Nothing to commit for record {}", record.id);
            Ok(())
        } else {
            Err(DeployerError::AuditError(format!(
                "git commit failed: {}",
                commit.text.trim()
            )))
        }
    }
}
