//! Deployment state and audit trail models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::deploy::fsm::{DeployPhase, Transition};
use crate::version::VersionString;

/// What is deployed for one (artifact, server) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledEntry {
    pub version: VersionString,

    /// When the file was put in place by this tool
    pub deployed_at: DateTime<Utc>,

    /// Hex sha256 of the deployed bytes
    #[serde(default)]
    pub sha256: Option<String>,
}

/// A copy of an installed file taken right before it was overwritten
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub artifact: String,
    pub server: String,

    /// State of the pair when the backup was taken. `None` when the file existed
    /// but was not deployed by this tool.
    pub original: Option<InstalledEntry>,

    /// Remote path of the backup file
    pub location: String,

    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    pub fn original_version(&self) -> Option<&VersionString> {
        self.original.as_ref().map(|e| &e.version)
    }
}

/// Result of rolling back one pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackResult {
    Restored { version: Option<VersionString> },
    NoBackupAvailable,
}

/// Classification of a failure, attached to per-artifact outcomes and events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PreflightFailure,
    NoUpdateAvailable,
    CompatibilityBlocked,
    NetworkFailure,
    NotFound,
    IntegrityFailure,
    MissingDigest,
    StagingFailure,
    ApplyFailure,
    VerifyFailure,
    NoBackupAvailable,
    AuditSinkFailure,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Rollback,
}

/// Final outcome of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    /// Deployed, but some targeted plugin was skipped or failed
    Partial,
    Aborted,
    RolledBack,
    NothingToDo,
}

/// What happened at one point of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Transition { from: DeployPhase, to: DeployPhase },
    BackedUp,
    Applied,
    Restarted,
    Verified,
    Restored,
    Uninstalled,
    Skipped,
    Failed { failure: FailureKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent {
    pub at: DateTime<Utc>,

    #[serde(flatten)]
    pub kind: EventKind,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
}

impl RecordEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
            artifact: None,
            server: None,
            detail: String::new(),
        }
    }

    pub fn transition(transition: &Transition) -> Self {
        Self::new(EventKind::Transition {
            from: transition.from,
            to: transition.to,
        })
    }

    pub fn artifact(mut self, artifact: impl Into<String>) -> Self {
        self.artifact = Some(artifact.into());
        self
    }

    pub fn server(mut self, server: impl Into<String>) -> Self {
        self.server = Some(server.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    /// Whether this event concerns the given pair
    pub fn is_for(&self, artifact: &str, server: &str) -> bool {
        self.artifact.as_deref() == Some(artifact) && self.server.as_deref() == Some(server)
    }
}

/// Audit trail of one apply or rollback operation. Persisted once, when the
/// operation concludes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: Uuid,
    pub operation: Operation,
    pub dry_run: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    pub artifacts: Vec<String>,
    pub servers: Vec<String>,
    pub outcome: Outcome,
    pub reasons: Vec<String>,
    pub events: Vec<RecordEvent>,
}

impl DeploymentRecord {
    pub fn new(operation: Operation, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            dry_run,
            started_at: Utc::now(),
            finished_at: None,
            artifacts: Vec::new(),
            servers: Vec::new(),
            outcome: Outcome::Aborted,
            reasons: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: RecordEvent) {
        if let Some(artifact) = &event.artifact {
            if !self.artifacts.contains(artifact) {
                self.artifacts.push(artifact.clone());
            }
        }
        if let Some(server) = &event.server {
            if !self.servers.contains(server) {
                self.servers.push(server.clone());
            }
        }
        self.events.push(event);
    }

    pub fn reason(&mut self, reason: impl Into<String>) {
        self.reasons.push(reason.into());
    }

    pub fn conclude(&mut self, outcome: Outcome) {
        self.outcome = outcome;
        self.finished_at = Some(Utc::now());
    }

    /// Store key, ordered chronologically
    pub fn key(&self) -> String {
        format!(
            "records/{}-{}",
            self.started_at.format("%Y%m%d%H%M%S%3f"),
            self.id
        )
    }

    /// One-line summary, used as a commit subject
    pub fn summary(&self) -> String {
        let op = match self.operation {
            Operation::Deploy => "deploy",
            Operation::Rollback => "rollback",
        };
        let outcome = match self.outcome {
            Outcome::Success => "success",
            Outcome::Partial => "partial",
            Outcome::Aborted => "aborted",
            Outcome::RolledBack => "rolled back",
            Outcome::NothingToDo => "nothing to do",
        };
        if self.artifacts.is_empty() {
            format!("plugfleet {}: {}", op, outcome)
        } else {
            format!(
                "plugfleet {} {}: {}",
                op,
                self.artifacts.join(", "),
                outcome
            )
        }
    }
}
