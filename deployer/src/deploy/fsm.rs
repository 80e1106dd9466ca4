//! Finite state machine for a deployment batch
//!
//! The same machine is tracked for the batch as a whole and for every artifact in
//! it. Each accepted transition is returned to the caller so it can be appended to
//! the batch's record trail.

use serde::{Deserialize, Serialize};

use crate::errors::DeployerError;

/// Deployment phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployPhase {
    /// Nothing started yet
    Idle,

    /// Probing servers and the local staging area
    PreflightChecking,

    /// Asking registries for candidate versions
    ResolvingVersions,

    /// Evaluating compatibility rules against observed infrastructure
    GatingCompatibility,

    /// Downloading and verifying artifacts
    Fetching,

    /// Copying installed files aside
    BackingUp,

    /// Replacing files, restarting and waiting for health
    Applying,

    /// Confirming plugins loaded
    Verifying,

    /// Batch succeeded
    Committed,

    /// Every touched pair was restored
    RolledBack,

    /// Stopped before touching anything
    Aborted,
}

impl DeployPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeployPhase::Committed | DeployPhase::RolledBack | DeployPhase::Aborted
        )
    }

    /// Whether server files may have been mutated once this phase was entered
    pub fn touches_servers(&self) -> bool {
        matches!(
            self,
            DeployPhase::BackingUp | DeployPhase::Applying | DeployPhase::Verifying
        )
    }
}

/// Deployment event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployEvent {
    /// Begin preflight
    Start,

    PreflightPassed,
    PreflightFailed(String),

    /// At least one candidate needs an update
    Resolved,

    /// No candidate needs an update
    NothingToDo,

    /// The registry could not be queried
    ResolveFailed(String),

    GatePassed,
    GateBlocked(String),

    Fetched,
    FetchFailed(String),

    BackedUp,
    Applied,

    /// Every pair verified and the batch is complete
    Commit,

    /// Touched pairs were restored after a failure
    RolledBack(String),

    /// Operator cancelled before any server was touched
    Cancelled(String),
}

/// A transition that was accepted by the machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: DeployPhase,
    pub to: DeployPhase,
}

/// Deployment FSM
#[derive(Debug, Clone)]
pub struct DeployFsm {
    phase: DeployPhase,
    reason: Option<String>,
}

impl DeployFsm {
    /// Create a new FSM in idle state
    pub fn new() -> Self {
        Self {
            phase: DeployPhase::Idle,
            reason: None,
        }
    }

    /// Get current phase
    pub fn phase(&self) -> DeployPhase {
        self.phase
    }

    /// Reason recorded by the last failing event, if any
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Process an event and transition phase
    pub fn process(&mut self, event: DeployEvent) -> Result<Transition, DeployerError> {
        use DeployEvent as E;
        use DeployPhase as P;

        let new_phase = match (self.phase, &event) {
            (P::Idle, E::Start) => P::PreflightChecking,

            (P::PreflightChecking, E::PreflightPassed) => P::ResolvingVersions,
            (P::PreflightChecking, E::PreflightFailed(reason)) => {
                self.reason = Some(reason.clone());
                P::Aborted
            }

            (P::ResolvingVersions, E::Resolved) => P::GatingCompatibility,
            (P::ResolvingVersions, E::NothingToDo) => {
                self.reason = Some("nothing to do".to_string());
                P::Aborted
            }
            (P::ResolvingVersions, E::ResolveFailed(reason)) => {
                self.reason = Some(reason.clone());
                P::Aborted
            }

            (P::GatingCompatibility, E::GatePassed) => P::Fetching,
            (P::GatingCompatibility, E::GateBlocked(reason)) => {
                self.reason = Some(reason.clone());
                P::Aborted
            }

            (P::Fetching, E::Fetched) => P::BackingUp,
            (P::Fetching, E::FetchFailed(reason)) => {
                self.reason = Some(reason.clone());
                P::Aborted
            }

            (P::BackingUp, E::BackedUp) => P::Applying,
            (P::Applying, E::Applied) => P::Verifying,
            (P::Verifying, E::Commit) => P::Committed,

            (P::BackingUp | P::Applying | P::Verifying, E::RolledBack(reason)) => {
                self.reason = Some(reason.clone());
                P::RolledBack
            }

            (phase, E::Cancelled(reason)) if !phase.is_terminal() && !phase.touches_servers() => {
                self.reason = Some(reason.clone());
                P::Aborted
            }

            // Invalid transitions
            (phase, event) => {
                return Err(DeployerError::InvalidTransition(format!(
                    "{:?} -> {:?}",
                    phase, event
                )));
            }
        };

        let transition = Transition {
            from: self.phase,
            to: new_phase,
        };
        self.phase = new_phase;
        Ok(transition)
    }
}

impl Default for DeployFsm {
    fn default() -> Self {
        Self::new()
    }
}
