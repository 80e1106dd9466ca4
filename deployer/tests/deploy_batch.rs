//! Deployment batch tests against an in-memory fleet

mod common;

use std::sync::Arc;

use common::*;

use plugfleet::deploy::fsm::DeployPhase;
use plugfleet::deploy::orchestrator::{ArtifactStatus, BatchRequest, Orchestrator};
use plugfleet::errors::DeployerError;
use plugfleet::fetch::digest::{sha256_hash, DigestAlgorithm, ExpectedDigest};
use plugfleet::gate::compat::CompatibilityRule;
use plugfleet::models::record::{FailureKind, Outcome};
use plugfleet::remote::memory::MemoryRemote;
use plugfleet::version::{UpdatePolicy, VersionString};

fn only(artifacts: &[&str]) -> BatchRequest {
    BatchRequest {
        artifacts: artifacts.iter().map(|a| a.to_string()).collect(),
        ..Default::default()
    }
}

fn publish_all(fleet: &Fleet) {
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    fleet.registry.publish(&via_source(), "5.2.1", b"via 5.2.1");
    fleet
        .registry
        .publish(&luckperms_source(), "5.4.141", b"luckperms 5.4.141");
}

async fn installed(
    fleet: &Fleet,
    orchestrator: &Orchestrator,
    artifact: &str,
    server: &str,
) -> Option<String> {
    orchestrator
        .state()
        .installed_version(artifact, &fleet.server(server))
        .await
        .unwrap()
        .map(|e| e.version.raw().to_string())
}

#[tokio::test]
async fn test_first_install_commits_on_every_target() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.phase, DeployPhase::Committed);
    for artifact in [GEYSER, VIA, LUCKPERMS] {
        assert_eq!(
            report.artifact(artifact).unwrap().status,
            ArtifactStatus::Committed,
            "{}",
            artifact
        );
    }

    assert_eq!(fleet.file(PROXY, GEYSER), Some(b"geyser 2.9.0-b981".to_vec()));
    assert_eq!(fleet.file(PROXY, VIA), Some(b"via 5.2.1".to_vec()));
    assert_eq!(fleet.file(LOBBY, VIA), Some(b"via 5.2.1".to_vec()));
    assert_eq!(fleet.file(LOBBY, LUCKPERMS), Some(b"luckperms 5.4.141".to_vec()));
    assert_eq!(fleet.file(LOBBY, GEYSER), None);

    assert_eq!(
        installed(&fleet, &orchestrator, VIA, LOBBY).await.as_deref(),
        Some("5.2.1")
    );
    assert_eq!(fleet.remote.restarts(PROXY), 1);
    assert_eq!(fleet.remote.restarts(LOBBY), 1);
    assert!(fleet.staged().is_empty());

    let history = orchestrator.history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].outcome, Outcome::Success);
    assert_eq!(history[0].id, report.id);
}

#[tokio::test]
async fn test_cosmetic_version_difference_is_nothing_to_do() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.9.0-build981", b"geyser").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert_eq!(report.outcome, Outcome::NothingToDo);
    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.status, ArtifactStatus::UpToDate);
    assert_eq!(geyser.failure, Some(FailureKind::NoUpdateAvailable));
    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
}

#[tokio::test]
async fn test_bypass_treats_different_spelling_as_update() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.9.0-build981", b"geyser").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    let orchestrator = fleet.orchestrator();

    let request = BatchRequest {
        policy: UpdatePolicy {
            bypass_noop_suppression: true,
            ..Default::default()
        },
        dry_run: true,
        ..only(&[GEYSER])
    };
    let report = orchestrator.run_batch(&request).await.unwrap();

    assert_eq!(
        report.artifact(GEYSER).unwrap().status,
        ArtifactStatus::WouldUpdate
    );
}

#[tokio::test]
async fn test_blocked_critical_plugin_aborts_whole_batch() {
    let fleet = Fleet::new();
    fleet.remote.set_build(PROXY, "velocity", 459);
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.phase, DeployPhase::Aborted);

    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.status, ArtifactStatus::Aborted);
    assert_eq!(geyser.failure, Some(FailureKind::CompatibilityBlocked));
    let reason = geyser.reason.as_deref().unwrap();
    assert!(reason.contains("Geyser 2.9.0+ requires Adventure library API"));
    assert!(reason.contains("459"));

    for sibling in [VIA, LUCKPERMS] {
        let report = report.artifact(sibling).unwrap();
        assert_eq!(report.status, ArtifactStatus::Aborted);
        assert_eq!(report.failure, Some(FailureKind::CompatibilityBlocked));
    }

    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
    assert!(orchestrator.state().backups().await.unwrap().is_empty());

    let history = orchestrator.history(1).await.unwrap();
    assert_eq!(history[0].outcome, Outcome::Aborted);
}

#[tokio::test]
async fn test_unknown_infrastructure_build_fails_closed() {
    let mut fleet = Fleet::new();
    // A proxy whose boot line carries no build number
    fleet.remote = Arc::new(MemoryRemote::new());
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.failure, Some(FailureKind::CompatibilityBlocked));
    assert!(geyser
        .reason
        .as_deref()
        .unwrap()
        .contains("could not be determined"));
    assert!(fleet.remote.journal().is_empty());
}

#[tokio::test]
async fn test_integrity_failure_is_isolated_to_its_artifact() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    fleet.registry.publish_with(
        &via_source(),
        "5.2.1",
        b"via 5.2.1 tampered",
        ExpectedDigest::new().with(DigestAlgorithm::Sha256, sha256_hash(b"via 5.2.1")),
    );
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    // Siblings commit, but the batch as a whole did not succeed
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.phase, DeployPhase::Committed);
    let via = report.artifact(VIA).unwrap();
    assert_eq!(via.status, ArtifactStatus::Failed);
    assert_eq!(via.failure, Some(FailureKind::IntegrityFailure));
    assert_eq!(
        report.artifact(GEYSER).unwrap().status,
        ArtifactStatus::Committed
    );
    assert_eq!(
        report.artifact(LUCKPERMS).unwrap().status,
        ArtifactStatus::Committed
    );

    assert_eq!(fleet.file(PROXY, VIA), None);
    assert_eq!(fleet.file(LOBBY, VIA), None);
    assert!(fleet.staged().is_empty());

    let history = orchestrator.history(1).await.unwrap();
    assert_eq!(history[0].outcome, Outcome::Partial);
}

#[tokio::test]
async fn test_missing_digest_is_refused() {
    let fleet = Fleet::new();
    fleet.registry.publish_with(
        &via_source(),
        "5.2.1",
        b"via 5.2.1",
        ExpectedDigest::new(),
    );
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[VIA])).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(
        report.artifact(VIA).unwrap().failure,
        Some(FailureKind::MissingDigest)
    );
    assert!(fleet.remote.journal().is_empty());
}

#[tokio::test]
async fn test_flaky_download_is_retried() {
    let fleet = Fleet::new();
    fleet.registry.publish(&via_source(), "5.2.1", b"via 5.2.1");
    fleet.registry.flaky(&via_source(), 2);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[VIA])).await.unwrap();

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(fleet.registry.downloads().len(), 1);
    assert_eq!(fleet.file(LOBBY, VIA), Some(b"via 5.2.1".to_vec()));
}

#[tokio::test]
async fn test_failed_health_check_rolls_back_to_prior_version() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    fleet.remote.set_healthy(PROXY, false);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert_eq!(report.outcome, Outcome::RolledBack);
    assert_eq!(report.phase, DeployPhase::RolledBack);
    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.status, ArtifactStatus::RolledBack);
    assert_eq!(geyser.failure, Some(FailureKind::ApplyFailure));

    assert_eq!(fleet.file(PROXY, GEYSER), Some(b"geyser 2.8.0-b700".to_vec()));
    assert_eq!(
        installed(&fleet, &orchestrator, GEYSER, PROXY).await.as_deref(),
        Some("2.8.0-b700")
    );
    assert!(orchestrator.state().backups().await.unwrap().is_empty());
    assert_eq!(
        fleet.remote.paths(PROXY),
        vec![plugin_path(PROXY, GEYSER)]
    );
    assert!(fleet.staged().is_empty());
}

#[tokio::test]
async fn test_failure_on_one_server_restores_every_server() {
    let fleet = Fleet::new();
    fleet.install(LOBBY, VIA, "5.2.0", b"via 5.2.0").await;
    fleet.registry.publish(&via_source(), "5.2.1", b"via 5.2.1");
    fleet.remote.fail_plugin_load(LOBBY, VIA);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[VIA])).await.unwrap();

    assert_eq!(report.outcome, Outcome::RolledBack);
    let via = report.artifact(VIA).unwrap();
    assert_eq!(via.failure, Some(FailureKind::VerifyFailure));

    // Lobby gets its previous file back, the proxy's first install is removed
    assert_eq!(fleet.file(LOBBY, VIA), Some(b"via 5.2.0".to_vec()));
    assert_eq!(fleet.file(PROXY, VIA), None);
    assert_eq!(
        installed(&fleet, &orchestrator, VIA, LOBBY).await.as_deref(),
        Some("5.2.0")
    );
    assert_eq!(installed(&fleet, &orchestrator, VIA, PROXY).await, None);

    // Deploy restart plus restore restart on both
    assert_eq!(fleet.remote.restarts(PROXY), 2);
    assert_eq!(fleet.remote.restarts(LOBBY), 2);
}

#[tokio::test]
async fn test_failed_replace_rolls_back_batch() {
    let fleet = Fleet::new();
    fleet.install(PROXY, VIA, "5.2.0", b"via 5.2.0").await;
    fleet.registry.publish(&via_source(), "5.2.1", b"via 5.2.1");
    fleet.remote.fail_replace(LOBBY);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[VIA])).await.unwrap();

    assert_eq!(report.outcome, Outcome::RolledBack);
    assert_eq!(
        report.artifact(VIA).unwrap().failure,
        Some(FailureKind::ApplyFailure)
    );
    assert_eq!(fleet.file(PROXY, VIA), Some(b"via 5.2.0".to_vec()));
    assert_eq!(fleet.file(LOBBY, VIA), None);
}

#[tokio::test]
async fn test_backup_is_taken_before_apply() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();
    assert_eq!(report.outcome, Outcome::Success);

    let journal = fleet.remote.journal();
    let path = plugin_path(PROXY, GEYSER);
    let backup_at = journal
        .iter()
        .position(|e| e.starts_with(&format!("copy proxy {}.", path)) && e.ends_with(".BAK"))
        .expect("backup copy");
    let apply_at = journal
        .iter()
        .position(|e| e == &format!("replace proxy {}", path))
        .expect("replace");
    assert!(backup_at < apply_at, "{:?}", journal);

    let backup = orchestrator
        .state()
        .backup_of(GEYSER, &fleet.server(PROXY))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        backup.original_version(),
        Some(&VersionString::new("2.8.0-b700"))
    );
    assert_eq!(
        fleet.remote.file(PROXY, &backup.location),
        Some(b"geyser 2.8.0-b700".to_vec())
    );
}

#[tokio::test]
async fn test_dry_run_reports_blocked_and_eligible_without_touching_anything() {
    let mut fleet = Fleet::new();
    fleet.settings.compatibility.push(CompatibilityRule {
        artifact: VIA.to_string(),
        component: "velocity".to_string(),
        min_build: 600,
        reason: "needs the new chat API".to_string(),
    });
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let request = BatchRequest {
        dry_run: true,
        ..only(&[GEYSER, VIA])
    };
    let report = orchestrator.run_batch(&request).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.outcome, Outcome::Partial);
    assert_eq!(report.phase, DeployPhase::GatingCompatibility);

    let via = report.artifact(VIA).unwrap();
    assert_eq!(via.status, ArtifactStatus::Skipped);
    assert_eq!(via.failure, Some(FailureKind::CompatibilityBlocked));
    assert!(via.reason.as_deref().unwrap().contains("needs the new chat API"));

    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.status, ArtifactStatus::WouldUpdate);
    assert_eq!(geyser.candidate, Some(VersionString::new("2.9.0-b981")));
    assert_eq!(geyser.servers, vec![PROXY.to_string()]);

    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
    assert!(orchestrator.state().backups().await.unwrap().is_empty());
    assert!(orchestrator.history(10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dry_run_with_blocked_critical_plugin_reports_both_and_aborts() {
    let fleet = Fleet::new();
    fleet.remote.set_build(PROXY, "velocity", 459);
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let request = BatchRequest {
        dry_run: true,
        ..only(&[GEYSER, VIA])
    };
    let report = orchestrator.run_batch(&request).await.unwrap();

    assert!(report.dry_run);
    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.phase, DeployPhase::Aborted);
    assert_eq!(report.artifacts.len(), 2);

    let geyser = report.artifact(GEYSER).unwrap();
    assert_eq!(geyser.status, ArtifactStatus::Aborted);
    assert_eq!(geyser.failure, Some(FailureKind::CompatibilityBlocked));
    assert!(geyser.reason.as_deref().unwrap().contains("459"));

    let via = report.artifact(VIA).unwrap();
    assert_eq!(via.status, ArtifactStatus::Aborted);
    assert_eq!(via.failure, Some(FailureKind::CompatibilityBlocked));
    assert_eq!(via.candidate, Some(VersionString::new("5.2.1")));
    assert!(via.reason.as_deref().unwrap().contains(GEYSER));

    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
    assert!(orchestrator.state().backups().await.unwrap().is_empty());
    assert!(orchestrator.history(10).await.unwrap().is_empty());
    assert_eq!(fleet.file(PROXY, GEYSER), Some(b"geyser 2.8.0-b700".to_vec()));
}

#[tokio::test]
async fn test_preflight_failure_aborts_before_resolution() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    fleet.remote.set_unreachable(LOBBY);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert!(!report.preflight.passed());
    for artifact in &report.artifacts {
        assert_eq!(artifact.status, ArtifactStatus::Aborted);
        assert_eq!(artifact.failure, Some(FailureKind::PreflightFailure));
        assert_eq!(artifact.candidate, None);
    }
    assert!(fleet.remote.journal().is_empty());
}

#[tokio::test]
async fn test_low_disk_space_fails_preflight() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    fleet.remote.set_free_space(PROXY, 10);
    let orchestrator = fleet.orchestrator();

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert!(report.preflight.describe().contains(PROXY));
}

#[tokio::test]
async fn test_cancelled_batch_touches_nothing() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let orchestrator = fleet.orchestrator().with_cancellation(cancel_rx);
    cancel_tx.send(true).unwrap();

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    for artifact in &report.artifacts {
        assert_eq!(artifact.failure, Some(FailureKind::Cancelled));
    }
    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
}

#[tokio::test]
async fn test_unknown_names_are_config_errors() {
    let fleet = Fleet::new();
    let orchestrator = fleet.orchestrator();

    let err = orchestrator
        .run_batch(&only(&["NoSuchPlugin"]))
        .await
        .unwrap_err();
    assert!(matches!(err, DeployerError::ConfigError(_)));

    let request = BatchRequest {
        servers: vec!["nowhere".to_string()],
        ..Default::default()
    };
    assert!(matches!(
        orchestrator.check(&request).await,
        Err(DeployerError::ConfigError(_))
    ));
}

#[tokio::test]
async fn test_check_reports_without_side_effects() {
    let fleet = Fleet::new();
    fleet.install(PROXY, VIA, "5.2.1", b"via 5.2.1").await;
    fleet.install(LOBBY, VIA, "5.2.0", b"via 5.2.0").await;
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let reports = orchestrator.check(&only(&[VIA])).await.unwrap();

    assert_eq!(reports.len(), 1);
    let via = &reports[0];
    assert_eq!(via.status, ArtifactStatus::WouldUpdate);
    assert_eq!(via.servers, vec![LOBBY.to_string()]);
    assert_eq!(
        via.installed.get(PROXY).cloned().flatten(),
        Some(VersionString::new("5.2.1"))
    );
    assert!(fleet.remote.journal().is_empty());
    assert!(fleet.registry.downloads().is_empty());
}

#[tokio::test]
async fn test_download_stages_verified_jar() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    let orchestrator = fleet.orchestrator();

    let reports = orchestrator.download(&only(&[LUCKPERMS])).await.unwrap();

    assert_eq!(reports[0].status, ArtifactStatus::Staged);
    assert_eq!(fleet.staged(), vec!["LuckPerms-5.4.141.jar".to_string()]);
    assert!(fleet.remote.journal().is_empty());
}

#[tokio::test]
async fn test_cancel_during_fetch_discards_staged_jars() {
    let fleet = Fleet::new();
    publish_all(&fleet);
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    fleet.registry.signal_on_download(cancel_tx);
    let orchestrator = fleet.orchestrator().with_cancellation(cancel_rx);

    let report = orchestrator.run_batch(&BatchRequest::default()).await.unwrap();

    assert_eq!(report.outcome, Outcome::Aborted);
    assert_eq!(report.phase, DeployPhase::Aborted);
    for artifact in &report.artifacts {
        assert_eq!(artifact.status, ArtifactStatus::Aborted, "{}", artifact.artifact);
        assert_eq!(artifact.failure, Some(FailureKind::Cancelled));
    }

    assert!(!fleet.registry.downloads().is_empty());
    assert!(fleet.staged().is_empty());
    assert!(fleet.remote.journal().is_empty());
    assert!(orchestrator.state().backups().await.unwrap().is_empty());

    let history = orchestrator.history(1).await.unwrap();
    assert_eq!(history[0].outcome, Outcome::Aborted);
}

#[tokio::test]
async fn test_cancel_after_apply_started_still_commits() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    fleet.remote.signal_on_restart(cancel_tx);
    let orchestrator = fleet.orchestrator().with_cancellation(cancel_rx.clone());

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert!(*cancel_rx.borrow());
    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.phase, DeployPhase::Committed);
    assert_eq!(
        report.artifact(GEYSER).unwrap().status,
        ArtifactStatus::Committed
    );
    assert_eq!(fleet.file(PROXY, GEYSER), Some(b"geyser 2.9.0-b981".to_vec()));
    assert_eq!(
        installed(&fleet, &orchestrator, GEYSER, PROXY).await.as_deref(),
        Some("2.9.0-b981")
    );
    assert!(fleet.staged().is_empty());
}

#[tokio::test]
async fn test_cancel_after_apply_started_still_rolls_back() {
    let fleet = Fleet::new();
    fleet.install(PROXY, GEYSER, "2.8.0-b700", b"geyser 2.8.0-b700").await;
    fleet
        .registry
        .publish(&geyser_source(), "2.9.0-b981", b"geyser 2.9.0-b981");
    fleet.remote.set_healthy(PROXY, false);
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    fleet.remote.signal_on_restart(cancel_tx);
    let orchestrator = fleet.orchestrator().with_cancellation(cancel_rx.clone());

    let report = orchestrator.run_batch(&only(&[GEYSER])).await.unwrap();

    assert!(*cancel_rx.borrow());
    assert_eq!(report.outcome, Outcome::RolledBack);
    assert_eq!(report.phase, DeployPhase::RolledBack);
    assert_eq!(fleet.file(PROXY, GEYSER), Some(b"geyser 2.8.0-b700".to_vec()));
    assert_eq!(
        installed(&fleet, &orchestrator, GEYSER, PROXY).await.as_deref(),
        Some("2.8.0-b700")
    );
}

#[tokio::test]
async fn test_check_flags_older_candidate_as_downgrade() {
    let fleet = Fleet::new();
    fleet.install(LOBBY, VIA, "5.3.0", b"via 5.3.0").await;
    fleet.install(PROXY, VIA, "5.2.0-build12", b"via 5.2.0").await;
    fleet.registry.publish(&via_source(), "5.2.1", b"via 5.2.1");
    let orchestrator = fleet.orchestrator();

    let reports = orchestrator.check(&only(&[VIA])).await.unwrap();

    let via = &reports[0];
    assert_eq!(via.status, ArtifactStatus::WouldUpdate);
    assert_eq!(via.servers, vec![PROXY.to_string(), LOBBY.to_string()]);
    assert_eq!(via.downgrades, vec![LOBBY.to_string()]);
}
