//! Infrastructure compatibility gate
//!
//! Some plugins only work on top of a minimum build of the proxy or server runtime.
//! The gate is evaluated against facts observed from the live fleet immediately
//! before a batch touches anything, and fails closed when a fact is missing.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::models::server::ServerConfig;
use crate::remote::executor::RemoteExecutor;

/// Static requirement of an artifact on an infrastructure component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompatibilityRule {
    /// Artifact name the rule applies to
    pub artifact: String,

    /// Required infrastructure component, e.g. `velocity`
    pub component: String,

    /// Minimum build number of the component
    pub min_build: u64,

    /// Operator-facing explanation, reported verbatim when the rule blocks
    pub reason: String,
}

/// Observed build of an infrastructure component
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureFact {
    pub component: String,
    pub build: u64,
}

/// Facts observed for one deployment decision. Not reused across batches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfrastructureFacts {
    facts: BTreeMap<String, u64>,
    pub observed_at: DateTime<Utc>,
}

impl InfrastructureFacts {
    pub fn new(facts: impl IntoIterator<Item = InfrastructureFact>) -> Self {
        Self {
            facts: facts.into_iter().map(|f| (f.component, f.build)).collect(),
            observed_at: Utc::now(),
        }
    }

    pub fn build_of(&self, component: &str) -> Option<u64> {
        self.facts.get(component).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = InfrastructureFact> + '_ {
        self.facts.iter().map(|(component, build)| InfrastructureFact {
            component: component.clone(),
            build: *build,
        })
    }
}

/// Result of evaluating an artifact against the observed infrastructure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum GateResult {
    Compatible,
    Blocked {
        rule: CompatibilityRule,
        /// Observed build, `None` when the component could not be inspected
        detected: Option<u64>,
        required: u64,
        reason: String,
    },
}

impl GateResult {
    pub fn is_blocked(&self) -> bool {
        matches!(self, GateResult::Blocked { .. })
    }

    /// One-line explanation for reports
    pub fn describe(&self) -> String {
        match self {
            GateResult::Compatible => "compatible".to_string(),
            GateResult::Blocked {
                rule,
                detected: Some(detected),
                required,
                reason,
            } => format!(
                "requires {} build {}+, detected build {}: {}",
                rule.component, required, detected, reason
            ),
            GateResult::Blocked {
                rule,
                detected: None,
                required,
                reason,
            } => format!(
                "requires {} build {}+, but its build could not be determined: {}",
                rule.component, required, reason
            ),
        }
    }
}

/// Evaluates compatibility rules
#[derive(Debug, Clone, Default)]
pub struct CompatibilityGate {
    rules: Vec<CompatibilityRule>,
}

impl CompatibilityGate {
    pub fn new(rules: Vec<CompatibilityRule>) -> Self {
        Self { rules }
    }

    pub fn rules_for<'a>(&'a self, artifact: &'a str) -> impl Iterator<Item = &'a CompatibilityRule> {
        self.rules.iter().filter(move |r| r.artifact == artifact)
    }

    /// Components referenced by any rule of the given artifacts
    pub fn components_for<'a>(&self, artifacts: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
        let artifacts: BTreeSet<&str> = artifacts.into_iter().collect();
        self.rules
            .iter()
            .filter(|r| artifacts.contains(r.artifact.as_str()))
            .map(|r| r.component.clone())
            .collect()
    }

    /// Evaluate every rule referencing `artifact`. The first rule that is not
    /// satisfied blocks; an artifact without rules is always compatible.
    pub fn evaluate(&self, artifact: &str, facts: &InfrastructureFacts) -> GateResult {
        for rule in self.rules_for(artifact) {
            match facts.build_of(&rule.component) {
                None => {
                    return GateResult::Blocked {
                        rule: rule.clone(),
                        detected: None,
                        required: rule.min_build,
                        reason: rule.reason.clone(),
                    };
                }
                Some(build) if build < rule.min_build => {
                    return GateResult::Blocked {
                        rule: rule.clone(),
                        detected: Some(build),
                        required: rule.min_build,
                        reason: rule.reason.clone(),
                    };
                }
                Some(_) => {}
            }
        }
        GateResult::Compatible
    }
}

/// Inspect the fleet for the current build of each component.
///
/// A component's fact is the lowest build observed across the servers running it.
/// If any of those servers cannot be inspected, the fact is left out so the gate
/// blocks.
pub async fn observe_facts(
    remote: &dyn RemoteExecutor,
    servers: &[ServerConfig],
    components: &BTreeSet<String>,
) -> InfrastructureFacts {
    let mut facts = Vec::new();

    for component in components {
        let hosts: Vec<&ServerConfig> = servers
            .iter()
            .filter(|s| s.component() == component)
            .collect();
        if hosts.is_empty() {
            warn!("No server runs infrastructure component '{}'", component);
            continue;
        }

        let mut lowest: Option<u64> = None;
        let mut complete = true;
        for server in hosts {
            match remote.read_infrastructure_version(server, component).await {
                Ok(Some(build)) => {
                    info!("Detected {} build {} on {}", component, build, server.name);
                    lowest = Some(lowest.map_or(build, |l| l.min(build)));
                }
                Ok(None) => {
                    warn!("Could not determine {} build on {}", component, server.name);
                    complete = false;
                }
                Err(e) => {
                    warn!("Failed to inspect {} on {}: {}", component, server.name, e);
                    complete = false;
                }
            }
        }

        if let (true, Some(build)) = (complete, lowest) {
            facts.push(InfrastructureFact {
                component: component.clone(),
                build,
            });
        }
    }

    InfrastructureFacts::new(facts)
}
