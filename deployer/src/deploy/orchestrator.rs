//! Deployment orchestrator
//!
//! Drives a batch through preflight, version resolution, compatibility gating and
//! fetching, then through a per-server backup/apply/verify stage. Servers are
//! processed concurrently and each server sequentially. When any server fails,
//! every pair touched by the batch is restored before the batch returns.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::audit::{AuditSink, NoopAuditSink};
use crate::deploy::drift::{audit_drift, DriftReport};
use crate::deploy::fsm::{DeployEvent, DeployFsm, DeployPhase};
use crate::deploy::preflight::{run_preflight, PreflightLimits, PreflightResult};
use crate::errors::DeployerError;
use crate::fetch::fetcher::{ArtifactFetcher, FetchError, VerifiedArtifact};
use crate::filesys::dir::Dir;
use crate::gate::compat::{observe_facts, CompatibilityGate, GateResult};
use crate::http::registry::RegistryClient;
use crate::models::artifact::{ManagedArtifact, Platform};
use crate::models::record::{
    BackupRecord, DeploymentRecord, EventKind, FailureKind, InstalledEntry, Operation, Outcome,
    RecordEvent, RollbackResult,
};
use crate::models::server::ServerConfig;
use crate::remote::executor::{wait_until_healthy, RemoteExecutor};
use crate::state::deployment::{DeploymentState, Placement};
use crate::storage::settings::{DeploySettings, Settings};
use crate::storage::store::KvStore;
use crate::utils::retry_with_backoff;
use crate::version::{UpdatePolicy, VersionString};

/// What a batch should deploy
#[derive(Debug, Clone, Default)]
pub struct BatchRequest {
    /// Plugin names to consider. Empty means every managed plugin.
    pub artifacts: Vec<String>,

    /// Server names to consider. Empty means the whole fleet.
    pub servers: Vec<String>,

    pub policy: UpdatePolicy,

    /// Stop after gating and persist nothing
    pub dry_run: bool,
}

/// Where an artifact ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Still moving through the batch
    Pending,
    UpToDate,
    /// Dry run or check: would be deployed
    WouldUpdate,
    /// Downloaded and verified, not deployed
    Staged,
    /// Left out of the batch, siblings continued
    Skipped,
    Failed,
    Aborted,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactReport {
    pub artifact: String,
    pub phase: DeployPhase,
    pub status: ArtifactStatus,

    /// Installed version per targeted server
    pub installed: BTreeMap<String, Option<VersionString>>,

    pub candidate: Option<VersionString>,

    /// Servers the candidate is (or would be) deployed to
    pub servers: Vec<String>,

    /// Of those, servers currently running a newer release than the candidate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub downgrades: Vec<String>,

    pub failure: Option<FailureKind>,
    pub reason: Option<String>,
}

/// A problem that did not change the outcome
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportWarning {
    pub failure: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchReport {
    pub id: Uuid,
    pub dry_run: bool,

    /// Final phase of the batch. A dry run halts in `GatingCompatibility`.
    pub phase: DeployPhase,

    /// Outcome, or the would-be outcome of a dry run
    pub outcome: Outcome,

    pub reasons: Vec<String>,
    pub preflight: PreflightResult,
    pub artifacts: Vec<ArtifactReport>,
    pub warnings: Vec<ReportWarning>,
}

impl BatchReport {
    pub fn artifact(&self, name: &str) -> Option<&ArtifactReport> {
        self.artifacts.iter().find(|a| a.artifact == name)
    }
}

/// Result of restoring one pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairRollback {
    pub artifact: String,
    pub server: String,
    pub result: Option<RollbackResult>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub id: Uuid,
    pub dry_run: bool,
    pub outcome: Outcome,
    pub pairs: Vec<PairRollback>,
    pub warnings: Vec<ReportWarning>,
}

/// Installed versions of one server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub server: String,
    pub platform: Platform,
    pub installed: BTreeMap<String, InstalledEntry>,
    pub backups: Vec<BackupRecord>,
}

/// An artifact's progress through a batch
struct Tracked<'a> {
    artifact: &'a ManagedArtifact,
    servers: Vec<&'a ServerConfig>,
    fsm: DeployFsm,
    installed: BTreeMap<String, Option<VersionString>>,
    candidate: Option<VersionString>,
    pending: Vec<&'a ServerConfig>,
    verified: Option<VerifiedArtifact>,
    status: ArtifactStatus,
    failure: Option<FailureKind>,
    reason: Option<String>,
}

impl<'a> Tracked<'a> {
    fn new(artifact: &'a ManagedArtifact, servers: Vec<&'a ServerConfig>) -> Self {
        Self {
            artifact,
            servers,
            fsm: DeployFsm::new(),
            installed: BTreeMap::new(),
            candidate: None,
            pending: Vec::new(),
            verified: None,
            status: ArtifactStatus::Pending,
            failure: None,
            reason: None,
        }
    }

    fn name(&self) -> &'a str {
        self.artifact.name()
    }

    fn in_phase(&self, phase: DeployPhase) -> bool {
        self.fsm.phase() == phase
    }

    /// Pending servers whose installed release orders above the candidate
    fn downgrades(&self) -> Vec<String> {
        let Some(candidate) = &self.candidate else {
            return Vec::new();
        };
        let candidate = candidate.normalized();
        self.pending
            .iter()
            .filter(|s| {
                self.installed
                    .get(&s.name)
                    .and_then(|v| v.as_ref())
                    .is_some_and(|installed| installed.normalized() > candidate)
            })
            .map(|s| s.name.clone())
            .collect()
    }

    fn report(&self) -> ArtifactReport {
        ArtifactReport {
            artifact: self.name().to_string(),
            phase: self.fsm.phase(),
            status: self.status,
            installed: self.installed.clone(),
            candidate: self.candidate.clone(),
            servers: self.pending.iter().map(|s| s.name.clone()).collect(),
            downgrades: self.downgrades(),
            failure: self.failure,
            reason: self.reason.clone(),
        }
    }
}

/// How version resolution went for one artifact
enum Resolution {
    Update,
    UpToDate(String),
    Failed(FailureKind, String),
}

/// Batch-level machine plus its record trail
struct Batch {
    fsm: DeployFsm,
    record: DeploymentRecord,
}

impl Batch {
    fn new(operation: Operation, dry_run: bool) -> Self {
        Self {
            fsm: DeployFsm::new(),
            record: DeploymentRecord::new(operation, dry_run),
        }
    }

    fn advance(&mut self, event: DeployEvent) -> Result<(), DeployerError> {
        let transition = self.fsm.process(event)?;
        info!("Batch {:?} -> {:?}", transition.from, transition.to);
        self.record.push(RecordEvent::transition(&transition));
        Ok(())
    }

    fn advance_artifact(
        &mut self,
        tracked: &mut Tracked<'_>,
        event: DeployEvent,
    ) -> Result<(), DeployerError> {
        let transition = tracked.fsm.process(event)?;
        debug!(
            "{} {:?} -> {:?}",
            tracked.name(),
            transition.from,
            transition.to
        );
        self.record
            .push(RecordEvent::transition(&transition).artifact(tracked.name()));
        Ok(())
    }

    /// Move every artifact currently in `phase` along with `event`
    fn advance_all(
        &mut self,
        tracked: &mut [Tracked<'_>],
        phase: DeployPhase,
        event: &DeployEvent,
    ) -> Result<(), DeployerError> {
        for t in tracked.iter_mut().filter(|t| t.in_phase(phase)) {
            self.advance_artifact(t, event.clone())?;
        }
        Ok(())
    }

    /// Drive an artifact to a terminal phase and keep the reason
    fn settle(
        &mut self,
        tracked: &mut Tracked<'_>,
        event: DeployEvent,
        status: ArtifactStatus,
        failure: Option<FailureKind>,
        reason: String,
    ) -> Result<(), DeployerError> {
        self.advance_artifact(tracked, event)?;
        if status != ArtifactStatus::UpToDate {
            self.record.reason(format!("{}: {}", tracked.name(), reason));
        }
        tracked.status = status;
        tracked.failure = failure;
        tracked.reason = Some(reason);
        Ok(())
    }

    fn note(&mut self, kind: EventKind, artifact: &str, detail: impl Into<String>) {
        self.record
            .push(RecordEvent::new(kind).artifact(artifact).detail(detail));
    }
}

/// What happened on one server during the backup/apply/verify stage
struct ServerRun<'a> {
    server: &'a ServerConfig,
    reached: DeployPhase,
    events: Vec<(DeployPhase, RecordEvent)>,
    backed_up: BTreeSet<String>,
    attempted: Vec<&'a ManagedArtifact>,
    restarted: bool,
    failure: Option<(FailureKind, String)>,
}

impl<'a> ServerRun<'a> {
    fn new(server: &'a ServerConfig) -> Self {
        Self {
            server,
            reached: DeployPhase::BackingUp,
            events: Vec::new(),
            backed_up: BTreeSet::new(),
            attempted: Vec::new(),
            restarted: false,
            failure: None,
        }
    }

    fn event(&mut self, kind: EventKind, artifact: Option<&str>, detail: impl Into<String>) {
        let mut event = RecordEvent::new(kind).server(&self.server.name).detail(detail);
        if let Some(artifact) = artifact {
            event = event.artifact(artifact);
        }
        self.events.push((self.reached, event));
    }

    fn fail(mut self, failure: FailureKind, artifact: Option<&str>, reason: String) -> Self {
        error!("{}: {}", self.server.name, reason);
        self.event(EventKind::Failed { failure }, artifact, reason.clone());
        self.failure = Some((failure, reason));
        self
    }
}

fn stage_rank(phase: DeployPhase) -> usize {
    match phase {
        DeployPhase::Applying => 1,
        DeployPhase::Verifying => 2,
        _ => 0,
    }
}

/// Success only when every targeted plugin ended deployed (or would be, in a dry
/// run) or had nothing to update
fn settled_outcome(tracked: &[Tracked<'_>]) -> Outcome {
    let complete = tracked.iter().all(|t| {
        matches!(
            t.status,
            ArtifactStatus::Committed | ArtifactStatus::WouldUpdate | ArtifactStatus::UpToDate
        )
    });
    if complete {
        Outcome::Success
    } else {
        Outcome::Partial
    }
}

fn placement<'p>(artifact: &'p ManagedArtifact, file_name: &'p str) -> Placement<'p> {
    Placement {
        artifact: artifact.name(),
        file_name,
    }
}

pub struct Orchestrator {
    plugins: Vec<ManagedArtifact>,
    servers: Vec<ServerConfig>,
    gate: CompatibilityGate,
    tuning: DeploySettings,
    registry: Arc<dyn RegistryClient>,
    remote: Arc<dyn RemoteExecutor>,
    fetcher: ArtifactFetcher,
    state: Arc<DeploymentState>,
    audit: Arc<dyn AuditSink>,
    cancel: watch::Receiver<bool>,
}

impl Orchestrator {
    pub fn new(
        settings: &Settings,
        registry: Arc<dyn RegistryClient>,
        remote: Arc<dyn RemoteExecutor>,
        store: Arc<dyn KvStore>,
        staging: Dir,
    ) -> Self {
        let fetcher = ArtifactFetcher::new(
            registry.clone(),
            staging,
            settings.deploy.fetch_attempts,
            settings.deploy.cooldown.clone(),
        );
        let (_, cancel) = watch::channel(false);

        Self {
            plugins: settings.plugins.clone(),
            servers: settings.servers.clone(),
            gate: CompatibilityGate::new(settings.compatibility.clone()),
            tuning: settings.deploy.clone(),
            state: Arc::new(DeploymentState::new(store, remote.clone())),
            registry,
            remote,
            fetcher,
            audit: Arc::new(NoopAuditSink),
            cancel,
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Stop starting new work once `cancel` turns true
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> &DeploymentState {
        &self.state
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn select_servers(&self, names: &[String]) -> Result<Vec<&ServerConfig>, DeployerError> {
        for name in names {
            if !self.servers.iter().any(|s| &s.name == name) {
                return Err(DeployerError::ConfigError(format!("Unknown server '{}'", name)));
            }
        }
        Ok(self
            .servers
            .iter()
            .filter(|s| names.is_empty() || names.contains(&s.name))
            .collect())
    }

    /// Pair every selected artifact with the selected servers running its platforms
    fn select(
        &self,
        artifacts: &[String],
        servers: &[String],
    ) -> Result<Vec<Tracked<'_>>, DeployerError> {
        for name in artifacts {
            if !self.plugins.iter().any(|p| p.name() == name) {
                return Err(DeployerError::ConfigError(format!("Unknown plugin '{}'", name)));
            }
        }
        let servers = self.select_servers(servers)?;

        let mut tracked = Vec::new();
        for artifact in self
            .plugins
            .iter()
            .filter(|p| artifacts.is_empty() || artifacts.iter().any(|a| a == p.name()))
        {
            let targets: Vec<&ServerConfig> = servers
                .iter()
                .copied()
                .filter(|s| artifact.identity.targets(s.platform))
                .collect();
            if targets.is_empty() {
                debug!("No selected server runs {}", artifact.name());
                continue;
            }
            tracked.push(Tracked::new(artifact, targets));
        }
        Ok(tracked)
    }

    /// Read installed versions and ask the registry for the newest candidate
    async fn resolve(&self, tracked: &mut Tracked<'_>, policy: &UpdatePolicy) -> Resolution {
        for server in &tracked.servers {
            match self.state.installed_version(tracked.name(), server).await {
                Ok(entry) => {
                    tracked
                        .installed
                        .insert(server.name.clone(), entry.map(|e| e.version));
                }
                Err(e) => {
                    return Resolution::Failed(
                        FailureKind::PreflightFailure,
                        format!("cannot read deployed state of {}: {}", server.name, e),
                    )
                }
            }
        }

        let source = &tracked.artifact.source;
        let latest = retry_with_backoff(
            &format!("resolve {}", source),
            self.tuning.fetch_attempts,
            &self.tuning.cooldown,
            |e: &DeployerError| !matches!(e, DeployerError::NotFound(_)),
            || self.registry.latest_version(source, policy.include_prerelease),
        )
        .await;

        let candidate = match latest {
            Ok(Some(candidate)) => candidate,
            Ok(None) => return Resolution::UpToDate("no eligible release published".to_string()),
            Err(e) => {
                let err = FetchError::from(e);
                return Resolution::Failed(err.kind(), err.to_string());
            }
        };

        let pending: Vec<&ServerConfig> = tracked
            .servers
            .iter()
            .copied()
            .filter(|s| {
                policy.needs_update(
                    tracked.installed.get(&s.name).and_then(|v| v.as_ref()),
                    &candidate,
                )
            })
            .collect();
        tracked.candidate = Some(candidate.clone());
        tracked.pending = pending;

        if tracked.pending.is_empty() {
            Resolution::UpToDate(format!("already at {}", candidate))
        } else {
            for server in tracked.downgrades() {
                warn!(
                    "{}: {} is older than the release installed on {}",
                    tracked.name(),
                    candidate,
                    server
                );
            }
            info!(
                "{}: {} pending on {}",
                tracked.name(),
                candidate,
                tracked
                    .pending
                    .iter()
                    .map(|s| s.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            Resolution::Update
        }
    }

    /// Run one deployment batch. The caller holds the store lease.
    pub async fn run_batch(&self, request: &BatchRequest) -> Result<BatchReport, DeployerError> {
        let mut tracked = self.select(&request.artifacts, &request.servers)?;
        let mut batch = Batch::new(Operation::Deploy, request.dry_run);
        info!(
            "Starting {}batch {} over {} plugin(s)",
            if request.dry_run { "dry-run " } else { "" },
            batch.record.id,
            tracked.len()
        );

        batch.advance(DeployEvent::Start)?;
        batch.advance_all(&mut tracked, DeployPhase::Idle, &DeployEvent::Start)?;

        // Preflight
        let mut fleet: Vec<ServerConfig> = Vec::new();
        for server in tracked.iter().flat_map(|t| t.servers.iter()) {
            if !fleet.iter().any(|s| s.name == server.name) {
                fleet.push((*server).clone());
            }
        }
        let limits = PreflightLimits {
            min_free_space_mb: self.tuning.min_free_space_mb,
            min_local_free_space_mb: self.tuning.min_local_free_space_mb,
        };
        let preflight =
            run_preflight(self.remote.as_ref(), &fleet, self.fetcher.staging(), limits).await;

        if !preflight.passed() {
            let reason = format!("preflight failed: {}", preflight.describe());
            error!("{}", reason);
            batch.record.push(
                RecordEvent::new(EventKind::Failed {
                    failure: FailureKind::PreflightFailure,
                })
                .detail(reason.clone()),
            );
            for t in tracked.iter_mut() {
                batch.settle(
                    t,
                    DeployEvent::PreflightFailed(reason.clone()),
                    ArtifactStatus::Aborted,
                    Some(FailureKind::PreflightFailure),
                    reason.clone(),
                )?;
            }
            batch.advance(DeployEvent::PreflightFailed(reason))?;
            return self.conclude(batch, tracked, Outcome::Aborted, preflight).await;
        }
        batch.advance(DeployEvent::PreflightPassed)?;
        batch.advance_all(
            &mut tracked,
            DeployPhase::PreflightChecking,
            &DeployEvent::PreflightPassed,
        )?;

        // Resolution
        for t in tracked.iter_mut() {
            if self.cancelled() {
                batch.settle(
                    t,
                    DeployEvent::Cancelled("cancelled".to_string()),
                    ArtifactStatus::Aborted,
                    Some(FailureKind::Cancelled),
                    "cancelled before resolution".to_string(),
                )?;
                continue;
            }
            match self.resolve(t, &request.policy).await {
                Resolution::Update => batch.advance_artifact(t, DeployEvent::Resolved)?,
                Resolution::UpToDate(reason) => {
                    info!("{}: {}", t.name(), reason);
                    batch.note(EventKind::Skipped, t.name(), reason.clone());
                    batch.settle(
                        t,
                        DeployEvent::NothingToDo,
                        ArtifactStatus::UpToDate,
                        Some(FailureKind::NoUpdateAvailable),
                        reason,
                    )?;
                }
                Resolution::Failed(kind, reason) => {
                    error!("{}: {}", t.name(), reason);
                    batch.note(EventKind::Failed { failure: kind }, t.name(), reason.clone());
                    batch.settle(
                        t,
                        DeployEvent::ResolveFailed(reason.clone()),
                        ArtifactStatus::Failed,
                        Some(kind),
                        reason,
                    )?;
                }
            }
        }

        if self.cancelled() {
            return self.cancel_batch(batch, tracked, preflight).await;
        }
        if !tracked
            .iter()
            .any(|t| t.in_phase(DeployPhase::GatingCompatibility))
        {
            let all_current = tracked
                .iter()
                .all(|t| t.status == ArtifactStatus::UpToDate);
            if all_current {
                info!("Nothing to do");
                batch.advance(DeployEvent::NothingToDo)?;
                return self
                    .conclude(batch, tracked, Outcome::NothingToDo, preflight)
                    .await;
            }
            batch.advance(DeployEvent::ResolveFailed(
                "no plugin could be resolved".to_string(),
            ))?;
            return self.conclude(batch, tracked, Outcome::Aborted, preflight).await;
        }
        batch.advance(DeployEvent::Resolved)?;

        // Compatibility gate, against facts observed now
        let candidates: Vec<&str> = tracked
            .iter()
            .filter(|t| t.in_phase(DeployPhase::GatingCompatibility))
            .map(|t| t.name())
            .collect();
        let components = self.gate.components_for(candidates);
        let facts = observe_facts(self.remote.as_ref(), &self.servers, &components).await;

        let mut critical_block: Option<String> = None;
        for t in tracked
            .iter_mut()
            .filter(|t| t.in_phase(DeployPhase::GatingCompatibility))
        {
            let result = self.gate.evaluate(t.name(), &facts);
            if let GateResult::Blocked { .. } = &result {
                let reason = result.describe();
                batch.note(
                    EventKind::Failed {
                        failure: FailureKind::CompatibilityBlocked,
                    },
                    t.name(),
                    reason.clone(),
                );
                if t.artifact.identity.critical {
                    error!("Critical plugin {} is blocked: {}", t.name(), reason);
                    critical_block.get_or_insert_with(|| format!("{}: {}", t.name(), reason));
                    batch.settle(
                        t,
                        DeployEvent::GateBlocked(reason.clone()),
                        ArtifactStatus::Aborted,
                        Some(FailureKind::CompatibilityBlocked),
                        reason,
                    )?;
                } else {
                    warn!("Skipping {}: {}", t.name(), reason);
                    batch.settle(
                        t,
                        DeployEvent::GateBlocked(reason.clone()),
                        ArtifactStatus::Skipped,
                        Some(FailureKind::CompatibilityBlocked),
                        reason,
                    )?;
                }
            }
        }

        if let Some(blocker) = critical_block {
            let reason = format!("batch aborted, critical plugin blocked ({})", blocker);
            for t in tracked
                .iter_mut()
                .filter(|t| t.in_phase(DeployPhase::GatingCompatibility))
            {
                batch.settle(
                    t,
                    DeployEvent::GateBlocked(reason.clone()),
                    ArtifactStatus::Aborted,
                    Some(FailureKind::CompatibilityBlocked),
                    reason.clone(),
                )?;
            }
            batch.advance(DeployEvent::GateBlocked(reason))?;
            return self.conclude(batch, tracked, Outcome::Aborted, preflight).await;
        }
        if !tracked
            .iter()
            .any(|t| t.in_phase(DeployPhase::GatingCompatibility))
        {
            batch.advance(DeployEvent::GateBlocked(
                "every candidate is blocked".to_string(),
            ))?;
            return self.conclude(batch, tracked, Outcome::Aborted, preflight).await;
        }

        if request.dry_run {
            for t in tracked
                .iter_mut()
                .filter(|t| t.in_phase(DeployPhase::GatingCompatibility))
            {
                info!("Dry run: would deploy {}", t.name());
                t.status = ArtifactStatus::WouldUpdate;
            }
            let outcome = settled_outcome(&tracked);
            return self.conclude(batch, tracked, outcome, preflight).await;
        }

        batch.advance(DeployEvent::GatePassed)?;
        batch.advance_all(
            &mut tracked,
            DeployPhase::GatingCompatibility,
            &DeployEvent::GatePassed,
        )?;

        // Fetch and verify
        let jobs: Vec<(usize, &ManagedArtifact, VersionString)> = tracked
            .iter()
            .enumerate()
            .filter(|(_, t)| t.in_phase(DeployPhase::Fetching))
            .filter_map(|(i, t)| t.candidate.clone().map(|c| (i, t.artifact, c)))
            .collect();
        let mut results: Vec<(usize, Option<Result<VerifiedArtifact, FetchError>>)> =
            stream::iter(jobs)
                .map(|(i, artifact, version)| async move {
                    if self.cancelled() {
                        return (i, None);
                    }
                    (i, Some(self.fetcher.fetch_verified(artifact, &version).await))
                })
                .buffer_unordered(self.tuning.parallelism.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _)| *i);

        let cancelled = self.cancelled();
        for (i, result) in results {
            let t = &mut tracked[i];
            match result {
                Some(Ok(verified)) if !cancelled => t.verified = Some(verified),
                Some(Err(e)) => {
                    error!("Fetching {} failed: {}", t.name(), e);
                    batch.note(
                        EventKind::Failed { failure: e.kind() },
                        t.name(),
                        e.to_string(),
                    );
                    batch.settle(
                        t,
                        DeployEvent::FetchFailed(e.to_string()),
                        ArtifactStatus::Failed,
                        Some(e.kind()),
                        e.to_string(),
                    )?;
                }
                staged => {
                    if let Some(Ok(verified)) = staged {
                        if let Err(e) = self.fetcher.discard(&verified).await {
                            warn!("Failed to discard {:?}: {}", verified.path, e);
                        }
                    }
                    batch.settle(
                        t,
                        DeployEvent::Cancelled("cancelled".to_string()),
                        ArtifactStatus::Aborted,
                        Some(FailureKind::Cancelled),
                        "cancelled before deployment".to_string(),
                    )?;
                }
            }
        }

        if cancelled {
            return self.cancel_batch(batch, tracked, preflight).await;
        }
        if !tracked.iter().any(|t| t.verified.is_some()) {
            batch.advance(DeployEvent::FetchFailed(
                "no plugin could be fetched".to_string(),
            ))?;
            return self.conclude(batch, tracked, Outcome::Aborted, preflight).await;
        }
        batch.advance(DeployEvent::Fetched)?;
        for t in tracked.iter_mut().filter(|t| t.verified.is_some()) {
            batch.advance_artifact(t, DeployEvent::Fetched)?;
        }

        // Backup, apply and verify, one task per server
        let mut plans: Vec<(&ServerConfig, Vec<(&ManagedArtifact, VerifiedArtifact)>)> = Vec::new();
        for server in &self.servers {
            let items: Vec<(&ManagedArtifact, VerifiedArtifact)> = tracked
                .iter()
                .filter(|t| t.pending.iter().any(|s| s.name == server.name))
                .filter_map(|t| t.verified.clone().map(|v| (t.artifact, v)))
                .collect();
            if !items.is_empty() {
                plans.push((server, items));
            }
        }

        let mut runs: Vec<ServerRun<'_>> = stream::iter(plans)
            .map(|(server, items)| self.deploy_server(server, items))
            .buffer_unordered(self.tuning.parallelism.max(1))
            .collect()
            .await;
        runs.sort_by_key(|run| {
            self.servers
                .iter()
                .position(|s| s.name == run.server.name)
        });

        let failed = runs.iter().any(|run| run.failure.is_some());
        let furthest = if failed {
            runs.iter().map(|run| stage_rank(run.reached)).max().unwrap_or(0)
        } else {
            stage_rank(DeployPhase::Verifying)
        };

        let stages = [
            (DeployPhase::BackingUp, DeployEvent::BackedUp),
            (DeployPhase::Applying, DeployEvent::Applied),
            (DeployPhase::Verifying, DeployEvent::Commit),
        ];
        for (phase, next) in stages {
            for run in runs.iter() {
                for (stage, event) in run.events.iter() {
                    if *stage == phase {
                        batch.record.push(event.clone());
                    }
                }
            }
            let rank = stage_rank(phase);
            if rank < furthest || (!failed && phase == DeployPhase::Verifying) {
                batch.advance(next.clone())?;
                batch.advance_all(&mut tracked, phase, &next)?;
            }
        }

        if !failed {
            for t in tracked.iter_mut() {
                if let Some(verified) = t.verified.take() {
                    t.status = ArtifactStatus::Committed;
                    if let Err(e) = self.fetcher.discard(&verified).await {
                        warn!("Failed to discard {:?}: {}", verified.path, e);
                    }
                }
            }
            let outcome = settled_outcome(&tracked);
            info!("Batch {} committed ({:?})", batch.record.id, outcome);
            return self.conclude(batch, tracked, outcome, preflight).await;
        }

        // Restore every pair the batch touched
        let (failure, reason) = runs
            .iter()
            .filter_map(|run| {
                run.failure
                    .as_ref()
                    .map(|(kind, reason)| (*kind, format!("{}: {}", run.server.name, reason)))
            })
            .fold((None, Vec::new()), |(kind, mut reasons), (k, r)| {
                reasons.push(r);
                (kind.or(Some(k)), reasons)
            });
        let failure = failure.unwrap_or(FailureKind::ApplyFailure);
        let reason = reason.join("; ");
        error!("Rolling back batch {}: {}", batch.record.id, reason);

        let restores: Vec<(Vec<RecordEvent>, Vec<String>)> = stream::iter(runs.iter())
            .map(|run| self.restore_server(run))
            .buffer_unordered(self.tuning.parallelism.max(1))
            .collect()
            .await;
        for (events, errors) in restores {
            for event in events {
                batch.record.push(event);
            }
            for e in errors {
                batch.record.reason(format!("rollback incomplete: {}", e));
            }
        }

        for t in tracked
            .iter_mut()
            .filter(|t| t.fsm.phase().touches_servers())
        {
            if let Some(verified) = t.verified.take() {
                if let Err(e) = self.fetcher.discard(&verified).await {
                    warn!("Failed to discard {:?}: {}", verified.path, e);
                }
            }
            batch.settle(
                t,
                DeployEvent::RolledBack(reason.clone()),
                ArtifactStatus::RolledBack,
                Some(failure),
                reason.clone(),
            )?;
        }
        batch.advance(DeployEvent::RolledBack(reason))?;
        self.conclude(batch, tracked, Outcome::RolledBack, preflight)
            .await
    }

    /// Back up, apply, restart and verify every artifact planned for one server
    async fn deploy_server<'a>(
        &'a self,
        server: &'a ServerConfig,
        items: Vec<(&'a ManagedArtifact, VerifiedArtifact)>,
    ) -> ServerRun<'a> {
        let mut run = ServerRun::new(server);

        for (artifact, _) in &items {
            let file_name = artifact.file_name();
            match self.state.backup(placement(artifact, &file_name), server).await {
                Ok(Some(backup)) => {
                    run.backed_up.insert(artifact.name().to_string());
                    run.event(EventKind::BackedUp, Some(artifact.name()), backup.location);
                }
                Ok(None) => run.event(
                    EventKind::Skipped,
                    Some(artifact.name()),
                    "nothing installed to back up",
                ),
                Err(e) => {
                    return run.fail(
                        FailureKind::ApplyFailure,
                        Some(artifact.name()),
                        format!("backup of {} failed: {}", artifact.name(), e),
                    )
                }
            }
        }

        run.reached = DeployPhase::Applying;
        for (artifact, verified) in &items {
            let file_name = artifact.file_name();
            run.attempted.push(*artifact);
            if let Err(e) = self
                .state
                .apply(
                    placement(artifact, &file_name),
                    server,
                    verified.bytes.as_slice(),
                    &verified.version,
                    &verified.sha256,
                )
                .await
            {
                return run.fail(
                    FailureKind::ApplyFailure,
                    Some(artifact.name()),
                    format!("replacing {} failed: {}", file_name, e),
                );
            }
            run.event(
                EventKind::Applied,
                Some(artifact.name()),
                verified.version.to_string(),
            );
        }

        run.restarted = true;
        if let Err(e) = self.remote.restart_service(server).await {
            return run.fail(FailureKind::ApplyFailure, None, format!("restart failed: {}", e));
        }
        run.event(EventKind::Restarted, None, "");

        let timeout = self.tuning.health_timeout();
        if !wait_until_healthy(
            self.remote.as_ref(),
            server,
            timeout,
            self.tuning.health_poll_interval(),
        )
        .await
        {
            return run.fail(
                FailureKind::ApplyFailure,
                None,
                format!("health check failed: not healthy within {:?}", timeout),
            );
        }

        run.reached = DeployPhase::Verifying;
        tokio::time::sleep(self.tuning.plugin_load_delay()).await;
        for (artifact, _) in &items {
            match self.remote.is_plugin_loaded(server, artifact.name()).await {
                Ok(true) => run.event(EventKind::Verified, Some(artifact.name()), ""),
                Ok(false) => {
                    return run.fail(
                        FailureKind::VerifyFailure,
                        Some(artifact.name()),
                        format!("{} did not load", artifact.name()),
                    )
                }
                Err(e) => {
                    return run.fail(
                        FailureKind::VerifyFailure,
                        Some(artifact.name()),
                        format!("could not confirm {} loaded: {}", artifact.name(), e),
                    )
                }
            }
        }

        info!("{} deployed and verified", server.name);
        run
    }

    /// Undo everything a server run changed. Returns the events and any errors.
    async fn restore_server(&self, run: &ServerRun<'_>) -> (Vec<RecordEvent>, Vec<String>) {
        let server = run.server;
        let mut events = Vec::new();
        let mut errors = Vec::new();

        for artifact in run.attempted.iter().rev() {
            let file_name = artifact.file_name();
            let target = placement(artifact, &file_name);
            let event = if run.backed_up.contains(artifact.name()) {
                match self.state.rollback(target, server).await {
                    Ok(RollbackResult::Restored { version }) => RecordEvent::new(EventKind::Restored)
                        .detail(
                            version
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "unmanaged file".to_string()),
                        ),
                    Ok(RollbackResult::NoBackupAvailable) => RecordEvent::new(EventKind::Failed {
                        failure: FailureKind::NoBackupAvailable,
                    }),
                    Err(e) => {
                        let message = format!("{} on {}: {}", artifact.name(), server.name, e);
                        error!("Rollback failed: {}", message);
                        errors.push(message.clone());
                        RecordEvent::new(EventKind::Failed {
                            failure: FailureKind::ApplyFailure,
                        })
                        .detail(message)
                    }
                }
            } else {
                match self.state.uninstall(target, server).await {
                    Ok(()) => RecordEvent::new(EventKind::Uninstalled),
                    Err(e) => {
                        let message = format!("{} on {}: {}", artifact.name(), server.name, e);
                        error!("Uninstall failed: {}", message);
                        errors.push(message.clone());
                        RecordEvent::new(EventKind::Failed {
                            failure: FailureKind::ApplyFailure,
                        })
                        .detail(message)
                    }
                }
            };
            events.push(event.artifact(artifact.name()).server(&server.name));
        }

        if !run.attempted.is_empty() || run.restarted {
            match self.restart_and_wait(server).await {
                Ok(()) => events.push(RecordEvent::new(EventKind::Restarted).server(&server.name)),
                Err(e) => {
                    errors.push(e.clone());
                    events.push(
                        RecordEvent::new(EventKind::Failed {
                            failure: FailureKind::ApplyFailure,
                        })
                        .server(&server.name)
                        .detail(e),
                    );
                }
            }
        }
        (events, errors)
    }

    async fn restart_and_wait(&self, server: &ServerConfig) -> Result<(), String> {
        self.remote
            .restart_service(server)
            .await
            .map_err(|e| format!("restart of {} failed: {}", server.name, e))?;
        if wait_until_healthy(
            self.remote.as_ref(),
            server,
            self.tuning.health_timeout(),
            self.tuning.health_poll_interval(),
        )
        .await
        {
            Ok(())
        } else {
            Err(format!("{} is not healthy after restart", server.name))
        }
    }

    async fn cancel_batch(
        &self,
        mut batch: Batch,
        mut tracked: Vec<Tracked<'_>>,
        preflight: PreflightResult,
    ) -> Result<BatchReport, DeployerError> {
        warn!("Batch {} cancelled", batch.record.id);
        for t in tracked.iter_mut().filter(|t| !t.fsm.phase().is_terminal()) {
            batch.settle(
                t,
                DeployEvent::Cancelled("cancelled".to_string()),
                ArtifactStatus::Aborted,
                Some(FailureKind::Cancelled),
                "cancelled".to_string(),
            )?;
        }
        batch.advance(DeployEvent::Cancelled("cancelled by operator".to_string()))?;
        self.conclude(batch, tracked, Outcome::Aborted, preflight)
            .await
    }

    /// Freeze the record, persist it and hand it to the audit sink
    async fn conclude(
        &self,
        mut batch: Batch,
        tracked: Vec<Tracked<'_>>,
        outcome: Outcome,
        preflight: PreflightResult,
    ) -> Result<BatchReport, DeployerError> {
        batch.record.conclude(outcome);
        let warnings = self.persist(&batch.record).await?;

        Ok(BatchReport {
            id: batch.record.id,
            dry_run: batch.record.dry_run,
            phase: batch.fsm.phase(),
            outcome,
            reasons: batch.record.reasons.clone(),
            preflight,
            artifacts: tracked.iter().map(Tracked::report).collect(),
            warnings,
        })
    }

    async fn persist(&self, record: &DeploymentRecord) -> Result<Vec<ReportWarning>, DeployerError> {
        if record.dry_run {
            return Ok(Vec::new());
        }
        self.state.record(record).await?;

        let mut warnings = Vec::new();
        if let Err(e) = self.audit.record_deployment(record).await {
            warn!("Audit sink failed for record {}: {}", record.id, e);
            warnings.push(ReportWarning {
                failure: FailureKind::AuditSinkFailure,
                message: e.to_string(),
            });
        }
        Ok(warnings)
    }

    /// Compare installed versions with the newest candidates, touching nothing
    pub async fn check(&self, request: &BatchRequest) -> Result<Vec<ArtifactReport>, DeployerError> {
        let mut tracked = self.select(&request.artifacts, &request.servers)?;
        for t in tracked.iter_mut() {
            match self.resolve(t, &request.policy).await {
                Resolution::Update => t.status = ArtifactStatus::WouldUpdate,
                Resolution::UpToDate(reason) => {
                    t.status = ArtifactStatus::UpToDate;
                    t.failure = Some(FailureKind::NoUpdateAvailable);
                    t.reason = Some(reason);
                }
                Resolution::Failed(kind, reason) => {
                    t.status = ArtifactStatus::Failed;
                    t.failure = Some(kind);
                    t.reason = Some(reason);
                }
            }
        }
        Ok(tracked.iter().map(Tracked::report).collect())
    }

    /// Fetch and verify the newest candidate of each selected plugin into staging
    pub async fn download(
        &self,
        request: &BatchRequest,
    ) -> Result<Vec<ArtifactReport>, DeployerError> {
        let mut tracked = self.select(&request.artifacts, &request.servers)?;
        for t in tracked.iter_mut() {
            if self.cancelled() {
                t.status = ArtifactStatus::Aborted;
                t.failure = Some(FailureKind::Cancelled);
                continue;
            }
            if let Resolution::Failed(kind, reason) = self.resolve(t, &request.policy).await {
                t.status = ArtifactStatus::Failed;
                t.failure = Some(kind);
                t.reason = Some(reason);
                continue;
            }
            let Some(candidate) = t.candidate.clone() else {
                t.status = ArtifactStatus::UpToDate;
                t.failure = Some(FailureKind::NoUpdateAvailable);
                continue;
            };
            match self.fetcher.fetch_verified(t.artifact, &candidate).await {
                Ok(verified) => {
                    t.status = ArtifactStatus::Staged;
                    t.reason = Some(verified.path.display().to_string());
                }
                Err(e) => {
                    t.status = ArtifactStatus::Failed;
                    t.failure = Some(e.kind());
                    t.reason = Some(e.to_string());
                }
            }
        }
        Ok(tracked.iter().map(Tracked::report).collect())
    }

    /// Restore every selected pair that has a backup, then restart affected
    /// servers. The caller holds the store lease.
    pub async fn rollback(
        &self,
        artifacts: &[String],
        servers: &[String],
        dry_run: bool,
    ) -> Result<RollbackReport, DeployerError> {
        let tracked = self.select(artifacts, servers)?;
        let mut record = DeploymentRecord::new(Operation::Rollback, dry_run);
        info!("Starting rollback {}", record.id);

        let mut per_server: Vec<(&ServerConfig, Vec<&ManagedArtifact>)> = Vec::new();
        for server in &self.servers {
            let on_server: Vec<&ManagedArtifact> = tracked
                .iter()
                .filter(|t| t.servers.iter().any(|s| s.name == server.name))
                .map(|t| t.artifact)
                .collect();
            if !on_server.is_empty() {
                per_server.push((server, on_server));
            }
        }

        let mut results: Vec<(usize, Vec<PairRollback>, Vec<RecordEvent>)> =
            stream::iter(per_server.into_iter().enumerate())
                .map(|(i, (server, on_server))| async move {
                    let (pairs, events) = self.rollback_server(server, on_server, dry_run).await;
                    (i, pairs, events)
                })
                .buffer_unordered(self.tuning.parallelism.max(1))
                .collect()
                .await;
        results.sort_by_key(|(i, _, _)| *i);

        let mut pairs = Vec::new();
        for (_, server_pairs, events) in results {
            pairs.extend(server_pairs);
            for event in events {
                record.push(event);
            }
        }

        let errors: Vec<String> = pairs
            .iter()
            .filter_map(|p| {
                p.error
                    .as_ref()
                    .map(|e| format!("{} on {}: {}", p.artifact, p.server, e))
            })
            .collect();
        let restored = pairs
            .iter()
            .any(|p| matches!(p.result, Some(RollbackResult::Restored { .. })));
        let outcome = if !errors.is_empty() {
            Outcome::Aborted
        } else if restored {
            Outcome::Success
        } else {
            Outcome::NothingToDo
        };
        for e in errors {
            record.reason(e);
        }
        record.conclude(outcome);
        let warnings = self.persist(&record).await?;

        Ok(RollbackReport {
            id: record.id,
            dry_run,
            outcome,
            pairs,
            warnings,
        })
    }

    async fn rollback_server(
        &self,
        server: &ServerConfig,
        artifacts: Vec<&ManagedArtifact>,
        dry_run: bool,
    ) -> (Vec<PairRollback>, Vec<RecordEvent>) {
        let mut pairs = Vec::new();
        let mut events = Vec::new();

        for artifact in artifacts {
            let mut pair = PairRollback {
                artifact: artifact.name().to_string(),
                server: server.name.clone(),
                result: None,
                error: None,
            };
            let event = RecordEvent::new(EventKind::Restored)
                .artifact(artifact.name())
                .server(&server.name);

            if dry_run {
                match self.state.backup_of(artifact.name(), server).await {
                    Ok(Some(backup)) => {
                        pair.result = Some(RollbackResult::Restored {
                            version: backup.original_version().cloned(),
                        })
                    }
                    Ok(None) => pair.result = Some(RollbackResult::NoBackupAvailable),
                    Err(e) => pair.error = Some(e.to_string()),
                }
                pairs.push(pair);
                continue;
            }

            let file_name = artifact.file_name();
            match self.state.rollback(placement(artifact, &file_name), server).await {
                Ok(result) => {
                    match &result {
                        RollbackResult::Restored { version } => events.push(event.detail(
                            version
                                .as_ref()
                                .map(|v| v.to_string())
                                .unwrap_or_else(|| "unmanaged file".to_string()),
                        )),
                        RollbackResult::NoBackupAvailable => {
                            debug!("No backup of {} on {}", artifact.name(), server.name);
                            events.push(
                                RecordEvent::new(EventKind::Failed {
                                    failure: FailureKind::NoBackupAvailable,
                                })
                                .artifact(artifact.name())
                                .server(&server.name),
                            );
                        }
                    }
                    pair.result = Some(result);
                }
                Err(e) => {
                    error!("Rollback of {} on {} failed: {}", artifact.name(), server.name, e);
                    events.push(
                        RecordEvent::new(EventKind::Failed {
                            failure: FailureKind::ApplyFailure,
                        })
                        .artifact(artifact.name())
                        .server(&server.name)
                        .detail(e.to_string()),
                    );
                    pair.error = Some(e.to_string());
                }
            }
            pairs.push(pair);
        }

        let restored = pairs
            .iter()
            .any(|p| matches!(p.result, Some(RollbackResult::Restored { .. })));
        if restored && !dry_run {
            match self.restart_and_wait(server).await {
                Ok(()) => events.push(RecordEvent::new(EventKind::Restarted).server(&server.name)),
                Err(e) => {
                    events.push(
                        RecordEvent::new(EventKind::Failed {
                            failure: FailureKind::ApplyFailure,
                        })
                        .server(&server.name)
                        .detail(e.clone()),
                    );
                    if let Some(pair) = pairs.iter_mut().find(|p| p.error.is_none()) {
                        pair.error = Some(e);
                    }
                }
            }
        }
        (pairs, events)
    }

    /// Installed versions and live backups per server
    pub async fn status(&self, servers: &[String]) -> Result<Vec<ServerStatus>, DeployerError> {
        let backups = self.state.backups().await?;
        let mut statuses = Vec::new();
        for server in self.select_servers(servers)? {
            statuses.push(ServerStatus {
                server: server.name.clone(),
                platform: server.platform,
                installed: self.state.installed(server).await?,
                backups: backups
                    .iter()
                    .filter(|b| b.server == server.name)
                    .cloned()
                    .collect(),
            });
        }
        Ok(statuses)
    }

    /// Most recent records, newest first
    pub async fn history(&self, limit: usize) -> Result<Vec<DeploymentRecord>, DeployerError> {
        self.state.records(limit).await
    }

    /// Version drift between servers of the same platform
    pub async fn audit(&self, servers: &[String]) -> Result<DriftReport, DeployerError> {
        let selected: Vec<ServerConfig> = self
            .select_servers(servers)?
            .into_iter()
            .cloned()
            .collect();
        audit_drift(&self.plugins, &selected, &self.state).await
    }
}
