//! Recovery of unplanned node loss
//!
//! Runs as its own control loop next to plan execution and watches the same
//! inventory:
//!
//! ```text
//! Instance states: Healthy → Suspect → Recovering → Healthy
//!                                              ↘ Failed
//!
//! Transitions:
//!   healthy → suspect:     task loss reported or observed
//!   suspect → recovering:  single-step recovery plan started, once the
//!                          backoff of the previous failure has passed
//!   suspect → healthy:     a planned step already relaunched the instance
//!   recovering → healthy:  recovery plan complete
//!   recovering → suspect:  relaunch failed; retried after a backoff
//!   recovering → failed:   replacement failed; no further automatic attempts
//!   failed → healthy:      the recorded task is observed running again
//!   failed → suspect:      operator reset
//! ```
//!
//! Recovery relaunches with the instance's recorded config, never the newest
//! topology. Instances targeted by a live deployment step, or leased by any
//! operation, are left alone. After `permanent_failure_threshold` failed
//! attempts the instance is replaced onto any host instead. Only the latest
//! recovery plan of each instance is kept.

use crate::config::RecoveryConfig;
use crate::metrics;
use crate::node::{InstanceId, NodeInstance};
use crate::plan::{
    Phase, Plan, PlanEngine, PlanId, PlanKind, PlanStatusReport, SharedPlan, Status, Step,
    StepAction,
};
use crate::scheduler::{bounded, ClusterHealth, HealthOracle, TaskObservation};
use crate::topology::UpdateStrategy;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Recovery state of a node instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryState {
    #[default]
    Healthy,
    Suspect,
    Recovering,
    /// Replacement failed; waits for an operator
    Failed,
}

impl RecoveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryState::Healthy => "healthy",
            RecoveryState::Suspect => "suspect",
            RecoveryState::Recovering => "recovering",
            RecoveryState::Failed => "failed",
        }
    }
}

/// How a lost instance is brought back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryType {
    /// Relaunch in place on the same host
    Transient,
    /// Replace onto any host, keeping ordinal and volume
    Permanent,
}

impl RecoveryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryType::Transient => "transient",
            RecoveryType::Permanent => "permanent",
        }
    }
}

/// Hook that may substitute the phase used to recover an instance
pub trait RecoveryOverrider: Send + Sync {
    /// Custom phase for `instance`, or `None` to use the default
    fn recovery_phase(&self, instance: &NodeInstance, kind: RecoveryType) -> Option<Phase>;
}

/// Event emitted when an instance changes recovery state
#[derive(Debug, Clone)]
pub struct RecoveryEvent {
    pub instance: InstanceId,
    pub previous: RecoveryState,
    pub new: RecoveryState,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct Tracked {
    state: RecoveryState,

    /// Consecutive failed recovery plans
    failures: u32,

    plan: Option<SharedPlan>,
    kind: Option<RecoveryType>,

    /// No recovery starts before this instant
    retry_at: Option<Instant>,
}

/// Independent control loop reacting to unplanned node loss
pub struct RecoveryManager {
    config: RecoveryConfig,
    engine: Arc<PlanEngine>,
    health: Arc<dyn HealthOracle>,
    tracked: RwLock<HashMap<InstanceId, Tracked>>,
    plans: RwLock<Vec<(InstanceId, SharedPlan)>>,
    overrider: RwLock<Option<Arc<dyn RecoveryOverrider>>>,
    event_tx: broadcast::Sender<RecoveryEvent>,
    running: Arc<RwLock<bool>>,
}

impl RecoveryManager {
    pub fn new(
        config: RecoveryConfig,
        engine: Arc<PlanEngine>,
        health: Arc<dyn HealthOracle>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            config,
            engine,
            health,
            tracked: RwLock::new(HashMap::new()),
            plans: RwLock::new(Vec::new()),
            overrider: RwLock::new(None),
            event_tx,
            running: Arc::new(RwLock::new(false)),
        }
    }

    pub fn set_overrider(&self, overrider: Arc<dyn RecoveryOverrider>) {
        *self.overrider.write() = Some(overrider);
    }

    /// Subscribe to recovery state changes
    pub fn subscribe(&self) -> broadcast::Receiver<RecoveryEvent> {
        self.event_tx.subscribe()
    }

    pub fn state(&self, id: &InstanceId) -> RecoveryState {
        self.tracked
            .read()
            .get(id)
            .map(|t| t.state)
            .unwrap_or_default()
    }

    /// Number of instances not currently healthy
    pub fn unhealthy_count(&self) -> usize {
        self.tracked
            .read()
            .values()
            .filter(|t| t.state != RecoveryState::Healthy)
            .count()
    }

    /// Number of instances with a recovery plan in flight
    pub fn recovering_count(&self) -> usize {
        self.tracked
            .read()
            .values()
            .filter(|t| t.state == RecoveryState::Recovering)
            .count()
    }

    /// Latest recovery plan of each instance, oldest first
    pub fn plans(&self) -> Vec<SharedPlan> {
        self.plans.read().iter().map(|(_, p)| Arc::clone(p)).collect()
    }

    pub fn plan(&self, id: PlanId) -> Option<SharedPlan> {
        self.plans
            .read()
            .iter()
            .find(|(_, p)| p.read().id == id)
            .map(|(_, p)| Arc::clone(p))
    }

    pub fn reports(&self) -> Vec<PlanStatusReport> {
        self.plans
            .read()
            .iter()
            .map(|(_, p)| p.read().report())
            .collect()
    }

    /// Put a FAILED instance back into automatic recovery, starting over
    /// with a relaunch in place. Returns whether the instance was FAILED.
    pub fn reset(&self, id: &InstanceId) -> bool {
        {
            let mut tracked = self.tracked.write();
            match tracked.get_mut(id) {
                Some(entry) if entry.state == RecoveryState::Failed => {
                    entry.state = RecoveryState::Suspect;
                    entry.failures = 0;
                    entry.kind = None;
                    entry.retry_at = None;
                }
                _ => return false,
            }
        }
        info!("Recovery of {} reset by operator", id);
        self.emit_state_change(id, RecoveryState::Failed, RecoveryState::Suspect);
        true
    }

    /// External notification that the task of `id` is gone
    pub fn notify_task_lost(&self, id: &InstanceId) {
        if !self.engine.inventory().contains(id) {
            debug!("Ignoring loss of unknown instance {}", id);
            return;
        }
        self.mark_suspect(id, "task lost");
    }

    /// Start the recovery loop
    pub fn start(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        *self.running.write() = true;

        let manager = Arc::clone(&self);
        tokio::spawn(async move {
            manager.run_loop().await;
        })
    }

    pub fn stop(&self) {
        *self.running.write() = false;
    }

    pub fn is_running(&self) -> bool {
        *self.running.read()
    }

    async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.config.tick_interval());

        info!(
            "Recovery manager started with {}ms interval, permanent failure threshold: {}",
            self.config.tick_interval_ms, self.config.permanent_failure_threshold
        );

        while *self.running.read() {
            ticker.tick().await;

            if !*self.running.read() {
                break;
            }

            self.tick().await;
        }

        info!("Recovery manager stopped");
    }

    /// One pass of the control loop
    pub async fn tick(&self) {
        self.prune();
        self.advance_recovering();
        self.detect_losses().await;
        self.start_recoveries().await;
    }

    /// Forget instances that no longer exist
    fn prune(&self) {
        let inventory = self.engine.inventory();
        self.tracked.write().retain(|id, _| inventory.contains(id));
        self.plans
            .write()
            .retain(|(id, plan)| inventory.contains(id) || !plan.read().status().is_terminal());
    }

    /// Defer to planned work on the instance
    fn is_claimed(&self, id: &InstanceId) -> bool {
        let locks = self.engine.locks();
        locks.deployment_owner(id).is_some() || locks.lease_holder(id).is_some()
    }

    async fn detect_losses(&self) {
        let scheduler = Arc::clone(self.engine.scheduler());
        let timeout = self.engine.config().call_timeout();

        for instance in self.engine.inventory().all() {
            let id = &instance.id;
            let state = self.state(id);
            if matches!(state, RecoveryState::Suspect | RecoveryState::Recovering)
                || self.is_claimed(id)
            {
                continue;
            }
            match bounded("observe", timeout, scheduler.observe(id)).await {
                Ok(TaskObservation::Failed) if state == RecoveryState::Healthy => {
                    self.mark_suspect(id, "task failed")
                }
                Ok(TaskObservation::Running { task_id, .. })
                    if state == RecoveryState::Failed && task_id == instance.task_id =>
                {
                    info!("Instance {} is running again after a failed recovery", id);
                    self.set_state(id, RecoveryState::Healthy, None);
                }
                Ok(_) => {}
                Err(e) => debug!("Could not observe {}: {}", id, e),
            }
        }
    }

    fn mark_suspect(&self, id: &InstanceId, reason: &str) {
        let previous = {
            let mut tracked = self.tracked.write();
            let entry = tracked.entry(id.clone()).or_default();
            if entry.state != RecoveryState::Healthy {
                return;
            }
            entry.state = RecoveryState::Suspect;
            RecoveryState::Healthy
        };
        warn!("Instance {} is now suspect: {}", id, reason);
        self.emit_state_change(id, previous, RecoveryState::Suspect);
    }

    fn advance_recovering(&self) {
        let mut transitions = Vec::new();
        {
            let mut tracked = self.tracked.write();
            for (id, entry) in tracked.iter_mut() {
                if entry.state != RecoveryState::Recovering {
                    continue;
                }
                let Some(status) = entry.plan.as_ref().map(|p| p.read().status()) else {
                    continue;
                };
                match status {
                    Status::Complete => {
                        entry.state = RecoveryState::Healthy;
                        entry.failures = 0;
                        entry.plan = None;
                        info!("Instance {} recovered", id);
                        transitions.push((id.clone(), RecoveryState::Healthy));
                    }
                    Status::Error if entry.kind == Some(RecoveryType::Permanent) => {
                        entry.state = RecoveryState::Failed;
                        entry.failures += 1;
                        entry.plan = None;
                        warn!(
                            "Replacement of {} failed after {} attempts, automatic recovery stopped",
                            id, entry.failures
                        );
                        transitions.push((id.clone(), RecoveryState::Failed));
                    }
                    Status::Error => {
                        entry.state = RecoveryState::Suspect;
                        entry.failures += 1;
                        entry.plan = None;
                        let backoff = self.config.retry_backoff(entry.failures);
                        entry.retry_at = Some(Instant::now() + backoff);
                        warn!(
                            "Recovery of {} failed ({} consecutive failures), retrying in {:?}",
                            id, entry.failures, backoff
                        );
                        transitions.push((id.clone(), RecoveryState::Suspect));
                    }
                    Status::Pending | Status::InProgress => {}
                }
            }
        }

        for (id, new) in transitions {
            self.emit_state_change(&id, RecoveryState::Recovering, new);
        }
    }

    async fn start_recoveries(&self) {
        let now = Instant::now();
        let suspects: Vec<(InstanceId, u32)> = self
            .tracked
            .read()
            .iter()
            .filter(|(_, t)| t.state == RecoveryState::Suspect)
            .filter(|(_, t)| t.retry_at.map_or(true, |at| at <= now))
            .map(|(id, t)| (id.clone(), t.failures))
            .collect();

        let scheduler = Arc::clone(self.engine.scheduler());
        let timeout = self.engine.config().call_timeout();

        for (id, failures) in suspects {
            if self.is_claimed(&id) {
                debug!("Deferring recovery of {} to planned work", id);
                continue;
            }
            let Some(instance) = self.engine.inventory().get(&id) else {
                continue;
            };

            // A planned step may have relaunched it in the meantime
            if let Ok(TaskObservation::Running { task_id, .. }) =
                bounded("observe", timeout, scheduler.observe(&id)).await
            {
                if task_id == instance.task_id {
                    self.set_state(&id, RecoveryState::Healthy, None);
                    info!("Instance {} is running again, no recovery needed", id);
                    continue;
                }
            }

            let kind = if failures >= self.config.permanent_failure_threshold {
                RecoveryType::Permanent
            } else {
                RecoveryType::Transient
            };
            let plan = Arc::new(RwLock::new(self.recovery_plan(&instance, kind)));
            self.engine.register_targets(&plan.read());
            {
                let mut plans = self.plans.write();
                plans.retain(|(other, _)| other != &id);
                plans.push((id.clone(), Arc::clone(&plan)));
            }
            self.begin_recovery(&id, Arc::clone(&plan), kind);

            info!("Starting {} recovery of {}", kind.as_str(), id);
            metrics::record_recovery(kind.as_str());

            let engine = Arc::clone(&self.engine);
            let health = Arc::clone(&self.health);
            let config = self.config.clone();
            tokio::spawn(async move {
                if engine.execute(&plan).await == Status::Complete {
                    let timeout = engine.config().call_timeout();
                    await_settled(health.as_ref(), &plan, &config, timeout).await;
                }
            });
        }
    }

    fn recovery_plan(&self, instance: &NodeInstance, kind: RecoveryType) -> Plan {
        let custom = self
            .overrider
            .read()
            .as_ref()
            .and_then(|o| o.recovery_phase(instance, kind));
        let phase = custom.unwrap_or_else(|| default_phase(instance, kind));
        Plan::new(
            PlanKind::Recovery,
            &format!("recover-{}", instance.id),
            instance.generation,
            self.engine.inventory().len() as u64,
            vec![phase],
        )
    }

    fn begin_recovery(&self, id: &InstanceId, plan: SharedPlan, kind: RecoveryType) {
        {
            let mut tracked = self.tracked.write();
            let entry = tracked.entry(id.clone()).or_default();
            entry.kind = Some(kind);
            entry.retry_at = None;
        }
        self.set_state(id, RecoveryState::Recovering, Some(plan));
    }

    fn set_state(&self, id: &InstanceId, new: RecoveryState, plan: Option<SharedPlan>) {
        let previous = {
            let mut tracked = self.tracked.write();
            let entry = tracked.entry(id.clone()).or_default();
            let previous = entry.state;
            entry.state = new;
            entry.plan = plan;
            if new == RecoveryState::Healthy {
                entry.failures = 0;
                entry.kind = None;
                entry.retry_at = None;
            }
            previous
        };
        if previous != new {
            self.emit_state_change(id, previous, new);
        }
    }

    fn emit_state_change(&self, id: &InstanceId, previous: RecoveryState, new: RecoveryState) {
        let event = RecoveryEvent {
            instance: id.clone(),
            previous,
            new,
            timestamp: Utc::now(),
        };

        metrics::update_recovery_state(&id.to_string(), new.as_str());

        // Broadcast event (ignore if no receivers)
        let _ = self.event_tx.send(event);
    }
}

fn default_phase(instance: &NodeInstance, kind: RecoveryType) -> Phase {
    let (name, action) = match kind {
        RecoveryType::Transient => ("recover", StepAction::Relaunch),
        RecoveryType::Permanent => ("replace", StepAction::Replace),
    };
    Phase::new(
        name,
        Some(instance.id.role.clone()),
        UpdateStrategy::Serial,
        vec![Step::new(instance.id.clone(), action, &instance.config_hash)],
    )
}

/// Poll replication health until GREEN, marking the plan settled.
///
/// YELLOW and RED are tolerated until the settle timeout; returns whether
/// the cluster settled in time.
pub async fn await_settled(
    health: &dyn HealthOracle,
    plan: &SharedPlan,
    config: &RecoveryConfig,
    call_timeout: Duration,
) -> bool {
    let name = plan.read().name.clone();
    let deadline = tokio::time::Instant::now() + config.settle_timeout();
    loop {
        match bounded("health", call_timeout, health.health()).await {
            Ok(ClusterHealth::Green) => {
                metrics::update_cluster_health(ClusterHealth::Green);
                plan.write().settled = true;
                info!("Cluster settled after plan '{}'", name);
                return true;
            }
            Ok(other) => {
                metrics::update_cluster_health(other);
                debug!("Cluster health {} while settling plan '{}'", other, name);
            }
            Err(e) => warn!("Health poll failed while settling plan '{}': {}", name, e),
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                "Cluster did not reach green within {}ms after plan '{}'",
                config.settle_timeout_ms, name
            );
            return false;
        }
        tokio::time::sleep(config.health_poll_interval()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::lease::InstanceLocks;
    use crate::node::NodeInventory;
    use crate::sim::SimulatedCluster;
    use crate::topology::Role;

    fn recovery_config() -> RecoveryConfig {
        RecoveryConfig {
            tick_interval_ms: 10,
            health_poll_interval_ms: 5,
            settle_timeout_ms: 1_000,
            permanent_failure_threshold: 1,
            max_backoff_ms: 40,
        }
    }

    fn setup() -> (Arc<SimulatedCluster>, Arc<PlanEngine>, RecoveryManager) {
        setup_with(recovery_config())
    }

    fn setup_with(config: RecoveryConfig) -> (Arc<SimulatedCluster>, Arc<PlanEngine>, RecoveryManager) {
        let sim = Arc::new(SimulatedCluster::new());
        let engine = Arc::new(PlanEngine::new(
            sim.clone(),
            Arc::new(NodeInventory::new()),
            Arc::new(InstanceLocks::new()),
            ExecutionConfig {
                call_timeout_ms: 200,
                launch_timeout_ms: 1_000,
                observe_interval_ms: 5,
                max_timeout_retries: 1,
                lease_wait_ms: 1_000,
                plan_history: 10,
            },
            "nobody",
        ));
        let manager = RecoveryManager::new(config, engine.clone(), sim.clone());
        (sim, engine, manager)
    }

    async fn launch(engine: &PlanEngine, id: &InstanceId) {
        let plan = Arc::new(RwLock::new(Plan::new(
            PlanKind::Deployment,
            "deploy",
            1,
            1,
            vec![Phase::new(
                "data",
                Some(id.role.clone()),
                UpdateStrategy::Serial,
                vec![Step::new(id.clone(), StepAction::Launch, "h1")],
            )],
        )));
        assert_eq!(engine.execute(&plan).await, Status::Complete);
    }

    async fn run_until_healthy(manager: &RecoveryManager, id: &InstanceId) {
        for _ in 0..200 {
            manager.tick().await;
            if manager.state(id) == RecoveryState::Healthy && manager.unhealthy_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("{} never recovered", id);
    }

    /// Wait until the latest recovery plan stops running
    async fn wait_latest_plan(manager: &RecoveryManager) -> Status {
        for _ in 0..200 {
            if let Some(plan) = manager.plans().last() {
                let status = plan.read().status();
                if status.is_terminal() {
                    return status;
                }
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("recovery plan never finished");
    }

    #[tokio::test]
    async fn test_lost_task_is_relaunched_in_place() {
        let (sim, engine, manager) = setup();
        let id = InstanceId::new(Role::Data, 0);
        launch(&engine, &id).await;
        let before = engine.inventory().get(&id).unwrap();
        let mut events = manager.subscribe();

        sim.kill(&id);
        manager.tick().await;
        assert_ne!(manager.state(&id), RecoveryState::Healthy);
        run_until_healthy(&manager, &id).await;

        let after = engine.inventory().get(&id).unwrap();
        assert_ne!(after.task_id, before.task_id);
        assert_eq!(after.host, before.host);
        assert_eq!(after.volume_id, before.volume_id);
        assert_eq!(after.config_hash, "h1");
        assert_eq!(sim.running_hash(&id).as_deref(), Some("h1"));

        let plans = manager.reports();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].kind, PlanKind::Recovery);
        assert_eq!(plans[0].phases[0].steps[0].action, StepAction::Relaunch);

        let first = events.recv().await.unwrap();
        assert_eq!(first.previous, RecoveryState::Healthy);
        assert_eq!(first.new, RecoveryState::Suspect);
    }

    #[tokio::test]
    async fn test_deployment_target_takes_precedence() {
        let (sim, engine, manager) = setup();
        let id = InstanceId::new(Role::Data, 0);
        launch(&engine, &id).await;
        engine
            .locks()
            .add_target(&id, PlanId::new(), PlanKind::Deployment, 2);

        sim.kill(&id);
        manager.notify_task_lost(&id);
        manager.tick().await;
        manager.tick().await;

        assert_eq!(manager.state(&id), RecoveryState::Suspect);
        assert!(manager.plans().is_empty());
    }

    #[tokio::test]
    async fn test_repeated_failure_escalates_to_replace() {
        let (sim, engine, manager) = setup();
        let id = InstanceId::new(Role::Data, 0);
        launch(&engine, &id).await;
        let before = engine.inventory().get(&id).unwrap();

        sim.break_host(&before.host);
        sim.kill(&id);
        run_until_healthy(&manager, &id).await;

        // Only the latest plan of the instance is kept
        let reports = manager.reports();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, Status::Complete);
        assert_eq!(reports[0].phases[0].steps[0].action, StepAction::Replace);

        let after = engine.inventory().get(&id).unwrap();
        assert_ne!(after.host, before.host);
        assert_eq!(after.volume_id, before.volume_id);
        assert_eq!(after.generation, before.generation);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_relaunch_backs_off() {
        let (sim, engine, manager) = setup_with(RecoveryConfig {
            tick_interval_ms: 1_000,
            permanent_failure_threshold: 10,
            max_backoff_ms: 60_000,
            ..recovery_config()
        });
        let id = InstanceId::new(Role::Data, 0);
        launch(&engine, &id).await;
        sim.break_host(&engine.inventory().get(&id).unwrap().host);
        sim.kill(&id);

        manager.tick().await;
        assert_eq!(wait_latest_plan(&manager).await, Status::Error);
        assert_eq!(sim.launch_count(&id), 2);

        // First failure waits one tick, the second one two
        manager.tick().await;
        manager.tick().await;
        assert_eq!(manager.state(&id), RecoveryState::Suspect);
        assert_eq!(sim.launch_count(&id), 2);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        manager.tick().await;
        assert_eq!(wait_latest_plan(&manager).await, Status::Error);
        assert_eq!(sim.launch_count(&id), 3);

        manager.tick().await;
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        manager.tick().await;
        assert_eq!(sim.launch_count(&id), 3);

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        manager.tick().await;
        wait_latest_plan(&manager).await;
        assert_eq!(sim.launch_count(&id), 4);
        assert_eq!(manager.plans().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_replacement_stops_until_reset() {
        let (sim, engine, manager) = setup();
        let id = InstanceId::new(Role::Data, 0);
        launch(&engine, &id).await;
        let hosts = ["agent-1", "agent-2", "agent-3"];
        for host in hosts {
            sim.break_host(host);
        }
        sim.kill(&id);

        for _ in 0..200 {
            manager.tick().await;
            if manager.state(&id) == RecoveryState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(manager.state(&id), RecoveryState::Failed);
        assert_eq!(manager.unhealthy_count(), 1);
        assert_eq!(manager.recovering_count(), 0);

        let launches = sim.launch_count(&id);
        for _ in 0..5 {
            manager.tick().await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sim.launch_count(&id), launches);
        assert_eq!(manager.reports().len(), 1);
        assert_eq!(manager.reports()[0].status, Status::Error);

        for host in hosts {
            sim.repair_host(host);
        }
        assert!(manager.reset(&id));
        assert!(!manager.reset(&id));
        run_until_healthy(&manager, &id).await;
        assert_eq!(sim.running(), vec![id.clone()]);
        assert_eq!(manager.reports()[0].phases[0].steps[0].action, StepAction::Relaunch);
    }

    struct NamedPhase;

    impl RecoveryOverrider for NamedPhase {
        fn recovery_phase(&self, instance: &NodeInstance, _kind: RecoveryType) -> Option<Phase> {
            Some(Phase::new(
                "custom-recovery",
                None,
                UpdateStrategy::Serial,
                vec![Step::new(
                    instance.id.clone(),
                    StepAction::Replace,
                    &instance.config_hash,
                )],
            ))
        }
    }

    #[tokio::test]
    async fn test_overrider_supplies_phase() {
        let (sim, engine, manager) = setup();
        manager.set_overrider(Arc::new(NamedPhase));
        let id = InstanceId::new(Role::Master, 0);
        launch(&engine, &id).await;

        sim.kill(&id);
        run_until_healthy(&manager, &id).await;
        assert_eq!(manager.reports()[0].phases[0].name, "custom-recovery");
    }

    #[tokio::test]
    async fn test_settle_tolerates_yellow_and_red() {
        let sim = SimulatedCluster::new();
        sim.script_health(vec![
            ClusterHealth::Yellow,
            ClusterHealth::Red,
            ClusterHealth::Yellow,
            ClusterHealth::Green,
        ]);
        let plan = Arc::new(RwLock::new(Plan::new(
            PlanKind::Deployment,
            "deploy",
            1,
            0,
            vec![],
        )));
        let settled = await_settled(&sim, &plan, &recovery_config(), Duration::from_secs(1)).await;
        assert!(settled);
        assert!(plan.read().settled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settle_gives_up_after_timeout() {
        let sim = SimulatedCluster::new();
        sim.script_health(vec![ClusterHealth::Yellow]);
        let plan = Arc::new(RwLock::new(Plan::new(
            PlanKind::Deployment,
            "deploy",
            1,
            0,
            vec![],
        )));
        let settled = await_settled(&sim, &plan, &recovery_config(), Duration::from_secs(1)).await;
        assert!(!settled);
        assert!(!plan.read().settled);
    }
}
