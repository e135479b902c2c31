//! End-to-end scenarios against the simulated cluster.
//!
//! Each test deploys a starting topology through the orchestrator, then
//! applies a change and checks both the plan shape and what the scheduler
//! was actually asked to do.

use ensemble::{
    Credential, ExecutionConfig, ImpactAnalyzer, InstanceId, InstanceLocks, Orchestrator,
    OrchestratorConfig, OrchestratorError, PlanBuilder, PlanHandle, PlanStatusReport,
    RecoveryConfig, Role, SimulatedCluster, Status, StepAction, Topology, TopologyDelta,
    TransitionConfig, TransitionSequence,
};
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(20);

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        execution: ExecutionConfig {
            call_timeout_ms: 500,
            launch_timeout_ms: 2_000,
            observe_interval_ms: 5,
            max_timeout_retries: 1,
            lease_wait_ms: 5_000,
            plan_history: 100,
        },
        recovery: RecoveryConfig {
            tick_interval_ms: 5,
            health_poll_interval_ms: 5,
            settle_timeout_ms: 1_000,
            permanent_failure_threshold: 3,
            max_backoff_ms: 50,
        },
        transition: TransitionConfig {
            plan_wait_ms: 20_000,
        },
        ..Default::default()
    }
}

fn cluster() -> (Arc<SimulatedCluster>, Orchestrator) {
    let sim = Arc::new(SimulatedCluster::new().with_start_delay(Duration::from_millis(2)));
    let orchestrator = Orchestrator::new(fast_config(), sim.clone(), sim.clone(), sim.clone());
    (sim, orchestrator)
}

fn topology(master: u32, data: u32, ingest: u32, coordinator: u32) -> Topology {
    let mut yaml = String::from("pools:\n");
    for (role, count) in [
        ("master", master),
        ("data", data),
        ("ingest", ingest),
        ("coordinator", coordinator),
    ] {
        if count > 0 {
            yaml.push_str(&format!("  - role: {}\n    count: {}\n", role, count));
        }
    }
    Topology::from_yaml(&yaml).unwrap()
}

async fn deploy(orchestrator: &Orchestrator, topology: Topology) -> PlanStatusReport {
    let handle = orchestrator.submit_topology(topology).unwrap();
    finish(orchestrator, handle).await
}

async fn finish(orchestrator: &Orchestrator, handle: PlanHandle) -> PlanStatusReport {
    let report = orchestrator.wait_for_plan(handle, WAIT).await.unwrap();
    assert_eq!(report.status, Status::Complete, "plan {} failed: {:?}", report.name, report);
    report
}

fn phase_names(report: &PlanStatusReport) -> Vec<&str> {
    report.phases.iter().map(|p| p.name.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Deployment
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_adding_ingest_and_coordinator_leaves_master_and_data_alone() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(3, 3, 0, 0)).await;
    let launches_before = sim.total_launches();

    let report = deploy(&orchestrator, topology(3, 3, 1, 1)).await;
    assert_eq!(phase_names(&report), vec!["ingest", "coordinator"]);
    assert_eq!(sim.total_launches(), launches_before + 2);
    for ordinal in 0..3 {
        assert_eq!(sim.launch_count(&InstanceId::new(Role::Master, ordinal)), 1);
        assert_eq!(sim.launch_count(&InstanceId::new(Role::Data, ordinal)), 1);
    }
}

#[tokio::test]
async fn test_adding_data_node_restarts_masters_after_launch() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(3, 3, 0, 0)).await;

    let report = deploy(&orchestrator, topology(3, 4, 0, 0)).await;
    assert_eq!(phase_names(&report), vec!["data", "master"]);
    assert_eq!(report.phases[0].steps.len(), 1);
    assert_eq!(report.phases[0].steps[0].instance, "data-3");
    assert_eq!(report.phases[0].steps[0].action, StepAction::Launch);
    assert!(report.phases[1]
        .steps
        .iter()
        .all(|s| s.action == StepAction::Restart));

    for ordinal in 0..3 {
        let master = InstanceId::new(Role::Master, ordinal);
        assert_eq!(sim.launch_count(&master), 2);
        assert_eq!(orchestrator.inventory().get(&master).unwrap().generation, 2);
    }
    assert_eq!(sim.running().len(), 7);
    assert!(report.settled);
}

#[tokio::test]
async fn test_scale_down_decommissions_highest_ordinal_only() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(3, 3, 0, 0)).await;

    let report = deploy(&orchestrator, topology(3, 2, 0, 0)).await;
    assert_eq!(phase_names(&report), vec!["data"]);
    assert_eq!(report.phases[0].steps[0].instance, "data-2");
    assert_eq!(sim.decommission_count(&InstanceId::new(Role::Data, 2)), 1);
    assert!(!orchestrator
        .inventory()
        .contains(&InstanceId::new(Role::Data, 2)));
    assert_eq!(sim.launch_count(&InstanceId::new(Role::Master, 0)), 1);
    assert_eq!(report.expected_task_count, 5);
}

#[tokio::test]
async fn test_rebuilding_converged_topology_has_no_steps() {
    let (_sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(3, 3, 0, 0)).await;
    deploy(&orchestrator, topology(3, 4, 0, 0)).await;

    let current = orchestrator.topology();
    let analyzer = ImpactAnalyzer::new(&orchestrator.config().impact);
    let impact = analyzer.analyze(&orchestrator.deployed_topology().topology, &current.topology);
    assert!(impact.is_noop());

    let plan = PlanBuilder::new(analyzer.coupling().clone()).build(
        "rebuild",
        &impact,
        &current,
        orchestrator.inventory(),
        &InstanceLocks::new(),
    );
    assert!(plan.is_empty());
}

#[tokio::test]
async fn test_retrying_complete_step_does_not_call_scheduler() {
    let (sim, orchestrator) = cluster();
    let handle = orchestrator.submit_topology(topology(1, 2, 0, 0)).unwrap();
    finish(&orchestrator, handle).await;
    let launches = sim.total_launches();

    for id in [
        InstanceId::new(Role::Master, 0),
        InstanceId::new(Role::Data, 1),
    ] {
        assert!(!orchestrator.retry_step(handle, &id).unwrap());
    }
    let report = finish(&orchestrator, handle).await;
    assert!(report
        .phases
        .iter()
        .flat_map(|p| p.steps.iter())
        .all(|s| s.status == Status::Complete));
    assert_eq!(sim.total_launches(), launches);
}

#[tokio::test]
async fn test_config_change_on_one_role_restarts_only_that_role() {
    let (sim, orchestrator) = cluster();
    let base = topology(3, 2, 0, 0);
    deploy(&orchestrator, base.clone()).await;

    let changed = TopologyDelta::new()
        .with_setting(Role::Data, "heap_mb", "4096")
        .apply(&base)
        .unwrap();
    let report = deploy(&orchestrator, changed.clone()).await;
    assert_eq!(phase_names(&report), vec!["data"]);

    let data_hash = changed.pool(&Role::Data).unwrap().config_hash().to_string();
    for ordinal in 0..2 {
        let id = InstanceId::new(Role::Data, ordinal);
        assert_eq!(sim.running_hash(&id), Some(data_hash.clone()));
    }
    assert_eq!(sim.launch_count(&InstanceId::new(Role::Master, 0)), 1);
}

#[tokio::test]
async fn test_superseding_during_launch_replaces_the_landed_task() {
    let sim = Arc::new(SimulatedCluster::new().with_start_delay(Duration::from_millis(300)));
    let orchestrator = Orchestrator::new(fast_config(), sim.clone(), sim.clone(), sim.clone());
    let base = topology(0, 1, 0, 0);
    let first = orchestrator.submit_topology(base.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let changed = TopologyDelta::new()
        .with_setting(Role::Data, "heap", "2g")
        .apply(&base)
        .unwrap();
    let second = orchestrator.submit_topology(changed.clone()).unwrap();
    finish(&orchestrator, second).await;
    orchestrator.wait_for_plan(first, WAIT).await.unwrap();

    let id = InstanceId::new(Role::Data, 0);
    let data_hash = changed.pool(&Role::Data).unwrap().config_hash().to_string();
    assert!(sim.orphaned_tasks().is_empty());
    assert_eq!(sim.launch_count(&id), 2);
    assert_eq!(sim.decommission_count(&id), 1);
    assert_eq!(sim.max_concurrent(&id), 1);
    assert_eq!(sim.running(), vec![id.clone()]);
    assert_eq!(sim.running_hash(&id), Some(data_hash.clone()));

    let recorded = orchestrator.inventory().get(&id).unwrap();
    assert_eq!(recorded.config_hash, data_hash);
    assert_eq!(sim.host_of(&id), Some(recorded.host));
}

#[tokio::test]
async fn test_late_start_after_launch_timeout_is_not_left_running() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(0, 1, 0, 0)).await;

    let late = InstanceId::new(Role::Data, 1);
    sim.slow_next_starts(&late, 1, Duration::from_millis(2_500));
    deploy(&orchestrator, topology(0, 2, 0, 0)).await;

    // Past the point where the first task would have reported running
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(sim.orphaned_tasks().is_empty());
    assert_eq!(sim.launch_count(&late), 2);
    assert_eq!(sim.decommission_count(&late), 1);
    assert_eq!(sim.max_concurrent(&late), 1);
    assert_eq!(
        sim.running_hash(&late),
        orchestrator.inventory().get(&late).map(|i| i.config_hash)
    );
    assert_eq!(sim.running().len(), 2);
}

// ---------------------------------------------------------------------------
// Recovery and replacement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_recovery_and_deployment_never_overlap() {
    let (sim, orchestrator) = cluster();
    let base = topology(3, 3, 0, 0);
    deploy(&orchestrator, base.clone()).await;
    let recovery = orchestrator.start_recovery();

    let lost = InstanceId::new(Role::Data, 1);
    sim.kill(&lost);
    orchestrator.notify_task_lost(&lost);

    let changed = TopologyDelta::new()
        .with_setting(Role::Data, "refresh_interval", "30s")
        .apply(&base)
        .unwrap();
    let handle = orchestrator.submit_topology(changed.clone()).unwrap();
    finish(&orchestrator, handle).await;

    for _ in 0..400 {
        if orchestrator.recovery().unhealthy_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    orchestrator.stop_recovery();
    recovery.abort();

    assert_eq!(orchestrator.recovery().unhealthy_count(), 0);
    assert!(sim.max_concurrent_any() <= 1);
    let data_hash = changed.pool(&Role::Data).unwrap().config_hash().to_string();
    assert_eq!(sim.running_hash(&lost), Some(data_hash));
    assert_eq!(sim.running().len(), 6);
}

#[tokio::test]
async fn test_lost_task_is_recovered_in_place() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(1, 2, 0, 0)).await;

    let id = InstanceId::new(Role::Data, 0);
    let before = orchestrator.inventory().get(&id).unwrap();
    sim.kill(&id);
    orchestrator.notify_task_lost(&id);

    for _ in 0..400 {
        orchestrator.recovery().tick().await;
        if orchestrator.recovery().unhealthy_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let plans = orchestrator.recovery_plans();
    assert_eq!(plans.len(), 1);
    let report = finish(&orchestrator, plans[0].id).await;
    assert_eq!(report.phases[0].steps[0].action, StepAction::Relaunch);

    let after = orchestrator.inventory().get(&id).unwrap();
    assert_ne!(after.task_id, before.task_id);
    assert_eq!(after.host, before.host);
    assert_eq!(after.volume_id, before.volume_id);
}

#[tokio::test]
async fn test_replace_during_ingest_scale_up() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(1, 2, 0, 0)).await;
    let data0 = InstanceId::new(Role::Data, 0);
    let before = orchestrator.inventory().get(&data0).unwrap();

    let scale_up = orchestrator
        .submit_topology(topology(1, 2, 2, 0))
        .unwrap();
    let replace = orchestrator.replace_node(Role::Data, 0).unwrap();

    finish(&orchestrator, scale_up).await;
    finish(&orchestrator, replace).await;

    let after = orchestrator.inventory().get(&data0).unwrap();
    assert_eq!(after.volume_id, before.volume_id);
    assert_eq!(after.config_hash, before.config_hash);
    assert_eq!(after.generation, before.generation);
    assert_ne!(after.task_id, before.task_id);
    assert_eq!(sim.host_of(&data0), Some(after.host.clone()));
    assert_eq!(sim.running().len(), 5);
}

#[tokio::test]
async fn test_replace_conflicts_with_pending_deployment_step() {
    let sim = Arc::new(SimulatedCluster::new().with_start_delay(Duration::from_millis(50)));
    let orchestrator = Orchestrator::new(fast_config(), sim.clone(), sim.clone(), sim.clone());
    let base = topology(1, 3, 0, 0);
    deploy(&orchestrator, base.clone()).await;

    let changed = TopologyDelta::new()
        .with_setting(Role::Data, "heap_mb", "1024")
        .apply(&base)
        .unwrap();
    let handle = orchestrator.submit_topology(changed).unwrap();

    let err = orchestrator.replace_node(Role::Data, 2).unwrap_err();
    assert!(matches!(err, OrchestratorError::ConflictingOperation { .. }));
    finish(&orchestrator, handle).await;
}

// ---------------------------------------------------------------------------
// Mode transitions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_security_enable_with_failing_rotation_aborts() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(3, 2, 0, 0)).await;
    sim.fail_credential_rotation("security index is red");

    let sequence = TransitionSequence::enable_security(&[
        Credential::new("elastic", "changeme-1"),
        Credential::new("kibana", "changeme-2"),
    ]);
    let err = orchestrator.run_transition(&sequence).await.unwrap_err();

    match err {
        OrchestratorError::SequenceAborted {
            step,
            step_name,
            completed,
            ..
        } => {
            assert_eq!(step, 1);
            assert_eq!(step_name, "rotate-credential-elastic");
            assert_eq!(completed, vec!["enable-security"]);
        }
        other => panic!("expected SequenceAborted, got {:?}", other),
    }
    assert!(sim.rotations().is_empty());
    // Not rolled back
    assert!(orchestrator.deployed_topology().topology.cluster().security_enabled);
}

#[tokio::test]
async fn test_upgrade_with_security() {
    let (sim, orchestrator) = cluster();
    deploy(&orchestrator, topology(1, 2, 0, 0)).await;
    sim.set_pending_migrations(vec![".security-6".to_string()]);

    let sequence =
        TransitionSequence::upgrade_with_security("6.8.0", &Credential::new("elastic", "s3cret"));
    let report = orchestrator.run_transition(&sequence).await.unwrap();

    assert_eq!(
        report.completed,
        vec![
            "set-explicit-password",
            "upgrade-security-disabled",
            "migrate-indices",
            "enable-security"
        ]
    );
    assert_eq!(sim.migrations(), vec![".security-6"]);
    let deployed = orchestrator.deployed_topology();
    assert_eq!(deployed.topology.cluster().version, "6.8.0");
    assert!(deployed.topology.cluster().security_enabled);
    for id in sim.running() {
        let pool = deployed.topology.pool(&id.role).unwrap();
        assert_eq!(sim.running_hash(&id).as_deref(), Some(pool.config_hash()));
    }
}
