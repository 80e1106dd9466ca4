//! Version normalization and compatibility gate properties

use proptest::prelude::*;

use plugfleet::gate::compat::{
    CompatibilityGate, CompatibilityRule, GateResult, InfrastructureFact, InfrastructureFacts,
};
use plugfleet::version::{is_update_available, normalize, UpdatePolicy, VersionString};

fn release() -> impl Strategy<Value = String> {
    (0u64..20, 0u64..20, 0u64..40).prop_map(|(a, b, c)| format!("{}.{}.{}", a, b, c))
}

fn build_spelling() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec!["-b", "-build", "_build", "+build.", "build", "+b", ".b"])
}

/// Release with an optional build token, channel suffix and `v` prefix, in any of
/// the spellings registries use
fn spelled_version() -> impl Strategy<Value = String> {
    (
        prop::bool::ANY,
        release(),
        prop::option::of((build_spelling(), 0u64..10_000)),
        prop::sample::select(vec!["", "-SNAPSHOT", ".snapshot", "-beta.2", "-rc1", " "]),
    )
        .prop_map(|(v, release, build, suffix)| {
            let build = build
                .map(|(spelling, n)| format!("{}{}", spelling, n))
                .unwrap_or_default();
            format!("{}{}{}{}", if v { "v" } else { "" }, release, build, suffix)
        })
}

fn gate(min_build: u64) -> CompatibilityGate {
    CompatibilityGate::new(vec![CompatibilityRule {
        artifact: "Geyser-Velocity".to_string(),
        component: "velocity".to_string(),
        min_build,
        reason: "needs Adventure".to_string(),
    }])
}

fn facts(build: u64) -> InfrastructureFacts {
    InfrastructureFacts::new([InfrastructureFact {
        component: "velocity".to_string(),
        build,
    }])
}

proptest! {
    #[test]
    fn normalize_is_idempotent(raw in spelled_version()) {
        let once = normalize(&VersionString::new(raw));
        let twice = normalize(&VersionString::new(once.as_str()));
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn build_spellings_are_equivalent(
        release in release(),
        build in 0u64..100_000,
        a in build_spelling(),
        b in build_spelling(),
    ) {
        let left = VersionString::new(format!("{}{}{}", release, a, build));
        let right = VersionString::new(format!("{}{}{}", release, b, build));
        prop_assert!(left.is_equivalent(&right));
        prop_assert!(!is_update_available(&left, &right, false));
        prop_assert!(!is_update_available(&left, &right, true));
    }

    #[test]
    fn newer_build_is_an_update(release in release(), build in 0u64..100_000) {
        let current = VersionString::new(format!("{}-b{}", release, build));
        let candidate = VersionString::new(format!("{}-b{}", release, build + 1));
        prop_assert!(current.normalized() < candidate.normalized());
        prop_assert!(UpdatePolicy::default().needs_update(Some(&current), &candidate));
    }

    #[test]
    fn default_policy_never_installs_prereleases(release in release(), n in 1u32..10) {
        let candidate = VersionString::new(format!("{}-beta.{}", release, n));
        prop_assert!(!UpdatePolicy::default().needs_update(None, &candidate));
    }

    #[test]
    fn gate_blocks_exactly_below_minimum(min_build in 0u64..1_000, build in 0u64..1_000) {
        let result = gate(min_build).evaluate("Geyser-Velocity", &facts(build));
        prop_assert_eq!(result.is_blocked(), build < min_build);
    }

    #[test]
    fn gate_ignores_artifacts_without_rules(build in 0u64..1_000) {
        prop_assert_eq!(
            gate(500).evaluate("ViaVersion", &facts(build)),
            GateResult::Compatible
        );
    }
}

#[test]
fn gate_fails_closed_without_facts() {
    let no_facts = InfrastructureFacts::new(Vec::<InfrastructureFact>::new());
    let result = gate(500).evaluate("Geyser-Velocity", &no_facts);
    match result {
        GateResult::Blocked {
            detected, reason, ..
        } => {
            assert_eq!(detected, None);
            assert_eq!(reason, "needs Adventure");
        }
        GateResult::Compatible => panic!("expected blocked"),
    }
}
