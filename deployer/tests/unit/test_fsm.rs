//! FSM unit tests

use plugfleet::deploy::fsm::{DeployEvent, DeployFsm, DeployPhase};

fn advance(fsm: &mut DeployFsm, events: impl IntoIterator<Item = DeployEvent>) {
    for event in events {
        fsm.process(event).unwrap();
    }
}

#[test]
fn test_fsm_initial_state() {
    let fsm = DeployFsm::new();
    assert_eq!(fsm.phase(), DeployPhase::Idle);
    assert!(fsm.reason().is_none());
    assert!(!fsm.phase().is_terminal());
}

#[test]
fn test_fsm_deploy_success_flow() {
    let mut fsm = DeployFsm::new();

    // Idle -> PreflightChecking -> ResolvingVersions
    advance(&mut fsm, [DeployEvent::Start, DeployEvent::PreflightPassed]);
    assert_eq!(fsm.phase(), DeployPhase::ResolvingVersions);

    // ResolvingVersions -> GatingCompatibility -> Fetching
    advance(&mut fsm, [DeployEvent::Resolved, DeployEvent::GatePassed]);
    assert_eq!(fsm.phase(), DeployPhase::Fetching);
    assert!(!fsm.phase().touches_servers());

    // Fetching -> BackingUp -> Applying -> Verifying
    advance(
        &mut fsm,
        [DeployEvent::Fetched, DeployEvent::BackedUp, DeployEvent::Applied],
    );
    assert_eq!(fsm.phase(), DeployPhase::Verifying);
    assert!(fsm.phase().touches_servers());

    fsm.process(DeployEvent::Commit).unwrap();
    assert_eq!(fsm.phase(), DeployPhase::Committed);
    assert!(fsm.phase().is_terminal());
}

#[test]
fn test_fsm_gate_blocked_aborts_with_reason() {
    let mut fsm = DeployFsm::new();
    advance(
        &mut fsm,
        [
            DeployEvent::Start,
            DeployEvent::PreflightPassed,
            DeployEvent::Resolved,
        ],
    );

    fsm.process(DeployEvent::GateBlocked("velocity build 459 < 500".to_string()))
        .unwrap();

    assert_eq!(fsm.phase(), DeployPhase::Aborted);
    assert_eq!(fsm.reason(), Some("velocity build 459 < 500"));
}

#[test]
fn test_fsm_rollback_from_verifying() {
    let mut fsm = DeployFsm::new();
    advance(
        &mut fsm,
        [
            DeployEvent::Start,
            DeployEvent::PreflightPassed,
            DeployEvent::Resolved,
            DeployEvent::GatePassed,
            DeployEvent::Fetched,
            DeployEvent::BackedUp,
            DeployEvent::Applied,
        ],
    );

    fsm.process(DeployEvent::RolledBack("plugin did not load".to_string()))
        .unwrap();

    assert_eq!(fsm.phase(), DeployPhase::RolledBack);
    assert_eq!(fsm.reason(), Some("plugin did not load"));
}

#[test]
fn test_fsm_cancel_only_before_servers_are_touched() {
    let mut fsm = DeployFsm::new();
    advance(
        &mut fsm,
        [
            DeployEvent::Start,
            DeployEvent::PreflightPassed,
            DeployEvent::Resolved,
            DeployEvent::GatePassed,
        ],
    );
    let mut cancelled = fsm.clone();
    cancelled
        .process(DeployEvent::Cancelled("operator".to_string()))
        .unwrap();
    assert_eq!(cancelled.phase(), DeployPhase::Aborted);

    advance(&mut fsm, [DeployEvent::Fetched]);
    assert!(fsm
        .process(DeployEvent::Cancelled("operator".to_string()))
        .is_err());
    assert_eq!(fsm.phase(), DeployPhase::BackingUp);
}

#[test]
fn test_fsm_invalid_transition() {
    let mut fsm = DeployFsm::new();

    // Cannot commit from Idle
    assert!(fsm.process(DeployEvent::Commit).is_err());
    assert_eq!(fsm.phase(), DeployPhase::Idle);

    // Cannot roll back before anything was touched
    advance(&mut fsm, [DeployEvent::Start, DeployEvent::PreflightPassed]);
    assert!(fsm
        .process(DeployEvent::RolledBack("x".to_string()))
        .is_err());
}

#[test]
fn test_fsm_terminal_phases_accept_nothing() {
    let mut fsm = DeployFsm::new();
    advance(
        &mut fsm,
        [
            DeployEvent::Start,
            DeployEvent::PreflightFailed("ssh".to_string()),
        ],
    );
    assert_eq!(fsm.phase(), DeployPhase::Aborted);

    for event in [
        DeployEvent::Start,
        DeployEvent::PreflightPassed,
        DeployEvent::Cancelled("late".to_string()),
        DeployEvent::Commit,
    ] {
        assert!(fsm.process(event).is_err());
    }
    assert_eq!(fsm.reason(), Some("ssh"));
}
