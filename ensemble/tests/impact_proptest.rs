//! Property-based tests for the restart-impact analyzer.
//!
//! Topologies are generated as role counts plus an optional settings
//! change, and every analysis is checked against the coupling rules.

use ensemble::{ImpactAnalyzer, ImpactConfig, Role, Topology, TopologyDelta};
use proptest::prelude::*;

fn topology(master: u32, data: u32, ingest: u32, coordinator: u32) -> Topology {
    TopologyDelta::new()
        .with_count(Role::Master, i64::from(master))
        .with_count(Role::Data, i64::from(data))
        .with_count(Role::Ingest, i64::from(ingest))
        .with_count(Role::Coordinator, i64::from(coordinator))
        .apply(&Topology::empty())
        .unwrap()
}

fn counts() -> impl Strategy<Value = (u32, u32, u32, u32)> {
    (0u32..6, 0u32..6, 0u32..4, 0u32..4)
}

proptest! {
    #[test]
    fn prop_identical_topologies_are_noop((m, d, i, c) in counts()) {
        let t = topology(m, d, i, c);
        let impact = ImpactAnalyzer::default().analyze(&t, &t.clone());
        prop_assert!(impact.is_noop());
    }

    #[test]
    fn prop_scale_delta_is_count_difference(
        (m1, d1, i1, c1) in counts(),
        (m2, d2, i2, c2) in counts(),
    ) {
        let impact = ImpactAnalyzer::default()
            .analyze(&topology(m1, d1, i1, c1), &topology(m2, d2, i2, c2));
        prop_assert_eq!(impact.get(&Role::Master).scale_delta, i64::from(m2) - i64::from(m1));
        prop_assert_eq!(impact.get(&Role::Data).scale_delta, i64::from(d2) - i64::from(d1));
        prop_assert_eq!(impact.get(&Role::Ingest).scale_delta, i64::from(i2) - i64::from(i1));
        prop_assert_eq!(
            impact.get(&Role::Coordinator).scale_delta,
            i64::from(c2) - i64::from(c1)
        );
    }

    #[test]
    fn prop_restart_requires_surviving_members(
        (m1, d1, i1, c1) in counts(),
        (m2, d2, i2, c2) in counts(),
        secured in any::<bool>(),
    ) {
        let new = TopologyDelta::new()
            .with_security(secured)
            .apply(&topology(m2, d2, i2, c2))
            .unwrap();
        let impact = ImpactAnalyzer::default().analyze(&topology(m1, d1, i1, c1), &new);
        for (role, old, new) in [
            (Role::Master, m1, m2),
            (Role::Data, d1, d2),
            (Role::Ingest, i1, i2),
            (Role::Coordinator, c1, c2),
        ] {
            if impact.get(&role).restart {
                prop_assert!(old > 0 && new > 0, "{} restarted without survivors", role);
            }
        }
    }

    #[test]
    fn prop_ingest_and_coordinator_growth_restarts_nothing(
        (m, d, i, c) in counts(),
        extra_ingest in 0u32..3,
        extra_coordinator in 1u32..3,
    ) {
        let impact = ImpactAnalyzer::default().analyze(
            &topology(m, d, i, c),
            &topology(m, d, i + extra_ingest, c + extra_coordinator),
        );
        prop_assert!(impact.restarted_roles().is_empty());
    }

    #[test]
    fn prop_data_growth_restarts_masters_only((m, d, i, c) in counts(), extra in 1u32..3) {
        let impact = ImpactAnalyzer::default()
            .analyze(&topology(m, d, i, c), &topology(m, d + extra, i, c));
        prop_assert_eq!(impact.get(&Role::Master).restart, m > 0);
        prop_assert!(!impact.get(&Role::Data).restart);
        prop_assert!(!impact.get(&Role::Ingest).restart);
        prop_assert!(!impact.get(&Role::Coordinator).restart);
    }

    #[test]
    fn prop_data_shrink_follows_config((m, d, i, c) in counts(), propagate in any::<bool>()) {
        prop_assume!(d > 0);
        let config = ImpactConfig {
            scale_down_restarts_dependents: propagate,
            ..Default::default()
        };
        let impact = ImpactAnalyzer::new(&config)
            .analyze(&topology(m, d, i, c), &topology(m, d - 1, i, c));
        prop_assert_eq!(impact.get(&Role::Master).restart, propagate && m > 0);
        prop_assert_eq!(impact.get(&Role::Data).scale_delta, -1);
    }
}
