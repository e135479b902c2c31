//! Orchestrator facade
//!
//! Owns the topology store, the plan registry and the recovery manager, and
//! is the only place that spawns plan drivers. Every submitted topology is
//! published first, then reconciled into a deployment plan against the live
//! inventory; the impact is always computed from the last topology that was
//! fully deployed, so a superseded plan's partial work is picked up rather
//! than repeated.
//!
//! Methods that start plans spawn tokio tasks and must be called from within
//! a runtime.

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::impact::{ImpactAnalyzer, RestartImpact};
use crate::lease::InstanceLocks;
use crate::node::{InstanceId, NodeInventory};
use crate::plan::{
    Plan, PlanBuilder, PlanEngine, PlanHandle, PlanId, PlanKind, PlanStatusReport, SharedPlan,
    Status,
};
use crate::recovery::{await_settled, RecoveryManager};
use crate::replace::replace_plan;
use crate::scheduler::{bounded, ClusterHealth, ClusterProtocol, HealthOracle, Scheduler};
use crate::topology::{Role, Topology, TopologyDelta, TopologyStore, UpdateStrategy, VersionedTopology};
use crate::transition::{TopologyDriver, TransitionController, TransitionReport, TransitionSequence};
use crate::metrics;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// A registered plan and its driver bookkeeping
struct PlanEntry {
    plan: SharedPlan,

    /// Topology the plan deploys; `None` for replacements
    target: Option<VersionedTopology>,

    /// Serializes executions of the same plan
    run_lock: tokio::sync::Mutex<()>,

    /// Executions scheduled but not yet finished
    runs: watch::Sender<usize>,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    store: TopologyStore,

    /// Last topology whose deployment plan completed
    deployed: Arc<RwLock<VersionedTopology>>,

    analyzer: ImpactAnalyzer,
    builder: PlanBuilder,
    engine: Arc<PlanEngine>,
    recovery: Arc<RecoveryManager>,
    health: Arc<dyn HealthOracle>,
    protocol: Arc<dyn ClusterProtocol>,
    plans: RwLock<HashMap<PlanId, Arc<PlanEntry>>>,

    /// Deployment plan of the latest submitted topology
    active: Mutex<Option<PlanId>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        scheduler: Arc<dyn Scheduler>,
        health: Arc<dyn HealthOracle>,
        protocol: Arc<dyn ClusterProtocol>,
    ) -> Self {
        let analyzer = ImpactAnalyzer::new(&config.impact);
        let builder = PlanBuilder::new(analyzer.coupling().clone());
        let engine = Arc::new(PlanEngine::new(
            scheduler,
            Arc::new(NodeInventory::new()),
            Arc::new(InstanceLocks::new()),
            config.execution.clone(),
            &config.service.user,
        ));
        let recovery = Arc::new(RecoveryManager::new(
            config.recovery.clone(),
            Arc::clone(&engine),
            Arc::clone(&health),
        ));
        let store = TopologyStore::new(Topology::empty());
        let deployed = Arc::new(RwLock::new(store.current()));

        info!(
            "Orchestrator for service '{}' created (tasks run as '{}')",
            config.service.name, config.service.user
        );

        Self {
            config,
            store,
            deployed,
            analyzer,
            builder,
            engine,
            recovery,
            health,
            protocol,
            plans: RwLock::new(HashMap::new()),
            active: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn inventory(&self) -> &Arc<NodeInventory> {
        self.engine.inventory()
    }

    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Latest published topology
    pub fn topology(&self) -> VersionedTopology {
        self.store.current()
    }

    /// Latest topology whose deployment completed
    pub fn deployed_topology(&self) -> VersionedTopology {
        self.deployed.read().clone()
    }

    /// Impact a submission of `topology` would have right now
    pub fn preview_impact(&self, topology: &Topology) -> RestartImpact {
        self.analyzer
            .analyze(&self.deployed.read().topology, topology)
    }

    /// Publish `topology` and start the plan that converges to it.
    ///
    /// Submitting the topology that is already current returns the existing
    /// plan. Any older plan still running is abandoned.
    pub fn submit_topology(&self, topology: Topology) -> Result<PlanHandle> {
        self.submit_with_strategy(topology, None)
    }

    /// Like [`submit_topology`](Self::submit_topology), with every phase of
    /// the resulting plan forced to `strategy`
    pub fn submit_with_strategy(
        &self,
        topology: Topology,
        strategy: Option<UpdateStrategy>,
    ) -> Result<PlanHandle> {
        let mut active = self.active.lock();

        if let Some(id) = *active {
            if *self.store.current().topology == topology {
                debug!("Topology unchanged, keeping plan {}", id);
                return Ok(id);
            }
            if let Some(previous) = self.entry(id) {
                self.engine.abandon(&previous.plan);
            }
        }

        let base = self.deployed.read().topology.clone();
        let target = self.store.publish(topology);
        let impact = self.analyzer.analyze(&base, &target.topology);

        let mut plan = self.builder.build(
            &format!("deploy-v{}", target.version),
            &impact,
            &target,
            self.engine.inventory(),
            self.engine.locks(),
        );
        if let Some(strategy) = strategy {
            for phase in &mut plan.phases {
                phase.strategy = strategy;
            }
        }

        info!(
            "Topology v{} submitted: restarting {:?}, plan {} with {} steps",
            target.version,
            impact.restarted_roles(),
            plan.id,
            plan.step_count()
        );

        let id = plan.id;
        self.engine.register_targets(&plan);
        let entry = self.register(plan, Some(target));
        *active = Some(id);
        drop(active);
        self.trim_history(&[id]);

        self.spawn_driver(entry);
        Ok(id)
    }

    /// Replace one instance onto any host, keeping its ordinal and volume
    pub fn replace_node(&self, role: Role, ordinal: u32) -> Result<PlanHandle> {
        let plan = replace_plan(
            role,
            ordinal,
            &self.store.current(),
            self.engine.inventory(),
            self.engine.locks(),
        )?;
        let id = plan.id;
        let entry = self.register(plan, None);
        let mut keep = vec![id];
        keep.extend(*self.active.lock());
        self.trim_history(&keep);
        self.spawn_driver(entry);
        Ok(id)
    }

    pub fn plan_status(&self, handle: PlanHandle) -> Result<PlanStatusReport> {
        self.shared_plan(handle)
            .map(|plan| plan.read().report())
            .ok_or_else(|| OrchestratorError::PlanNotFound(handle.to_string()))
    }

    /// Reports of the retained deployment and replacement plans, ordered by
    /// topology version. Recovery plans are listed by
    /// [`recovery_plans`](Self::recovery_plans).
    pub fn plans(&self) -> Vec<PlanStatusReport> {
        let mut reports: Vec<PlanStatusReport> = self
            .plans
            .read()
            .values()
            .map(|e| e.plan.read().report())
            .collect();
        reports.sort_by_key(|r| r.topology_version);
        reports
    }

    pub fn recovery_plans(&self) -> Vec<PlanStatusReport> {
        self.recovery.reports()
    }

    /// Current replication health as reported by the service
    pub async fn cluster_health(&self) -> Result<ClusterHealth> {
        let health = bounded(
            "health",
            self.config.execution.call_timeout(),
            self.health.health(),
        )
        .await?;
        metrics::update_cluster_health(health);
        Ok(health)
    }

    /// Retry the ERROR'd step of `instance` in a deployment plan.
    ///
    /// Returns `false` without side effects when the step is not in ERROR
    /// (a COMPLETE step stays complete) or the plan was superseded.
    pub fn retry_step(&self, handle: PlanHandle, instance: &InstanceId) -> Result<bool> {
        let entry = self
            .entry(handle)
            .ok_or_else(|| OrchestratorError::PlanNotFound(handle.to_string()))?;
        let reset = {
            let mut plan = entry.plan.write();
            if plan.abandoned {
                debug!("Plan {} was superseded, not retrying {}", handle, instance);
                return Ok(false);
            }
            plan.reset_step(instance)?
        };
        if reset {
            info!("Retrying step {} of plan {}", instance, handle);
            self.spawn_driver(entry);
        }
        Ok(reset)
    }

    /// Wait until the plan's driver is idle (and, for a completed plan, the
    /// cluster has been polled for settling); returns its final report
    pub async fn wait_for_plan(
        &self,
        handle: PlanHandle,
        timeout: Duration,
    ) -> Result<PlanStatusReport> {
        let timed_out = || {
            OrchestratorError::ExternalTimeout(format!(
                "plan {} not finished within {}ms",
                handle,
                timeout.as_millis()
            ))
        };

        if let Some(entry) = self.entry(handle) {
            let mut runs = entry.runs.subscribe();
            let idle = tokio::time::timeout(timeout, runs.wait_for(|n| *n == 0))
                .await
                .map(|r| r.map(|_| ()));
            match idle {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(OrchestratorError::Internal(format!(
                        "driver of plan {} went away",
                        handle
                    )))
                }
                Err(_) => return Err(timed_out()),
            }
            return Ok(entry.plan.read().report());
        }

        let plan = self
            .recovery
            .plan(handle)
            .ok_or_else(|| OrchestratorError::PlanNotFound(handle.to_string()))?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if plan.read().status().is_terminal() {
                return Ok(plan.read().report());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(self.config.recovery.health_poll_interval()).await;
        }
    }

    pub fn notify_task_lost(&self, id: &InstanceId) {
        self.recovery.notify_task_lost(id);
    }

    /// Start the recovery control loop
    pub fn start_recovery(&self) -> tokio::task::JoinHandle<()> {
        Arc::clone(&self.recovery).start()
    }

    pub fn stop_recovery(&self) {
        self.recovery.stop();
    }

    /// Run a mode transition against this orchestrator
    pub async fn run_transition(&self, sequence: &TransitionSequence) -> Result<TransitionReport> {
        TransitionController::new(
            Arc::clone(&self.protocol),
            self.config.execution.call_timeout(),
        )
        .run(self, sequence)
        .await
    }

    fn entry(&self, id: PlanId) -> Option<Arc<PlanEntry>> {
        self.plans.read().get(&id).cloned()
    }

    fn shared_plan(&self, id: PlanId) -> Option<SharedPlan> {
        self.entry(id)
            .map(|e| Arc::clone(&e.plan))
            .or_else(|| self.recovery.plan(id))
    }

    fn register(&self, plan: Plan, target: Option<VersionedTopology>) -> Arc<PlanEntry> {
        let (runs, _) = watch::channel(0);
        let entry = Arc::new(PlanEntry {
            plan: Arc::new(RwLock::new(plan)),
            target,
            run_lock: tokio::sync::Mutex::new(()),
            runs,
        });
        let id = entry.plan.read().id;
        self.plans.write().insert(id, Arc::clone(&entry));
        entry
    }

    /// Forget the oldest idle plans that are complete or superseded once the
    /// registry holds more than `plan_history`
    fn trim_history(&self, keep: &[PlanId]) {
        let limit = self.config.execution.plan_history;
        let mut plans = self.plans.write();
        if plans.len() <= limit {
            return;
        }
        let mut finished: Vec<_> = plans
            .iter()
            .filter(|(id, entry)| !keep.contains(*id) && *entry.runs.borrow() == 0)
            .filter_map(|(id, entry)| {
                let plan = entry.plan.read();
                (plan.abandoned || plan.status() == Status::Complete)
                    .then_some((plan.created_at, *id))
            })
            .collect();
        finished.sort_by_key(|(created_at, _)| *created_at);

        let excess = plans.len() - limit;
        for (_, id) in finished.into_iter().take(excess) {
            plans.remove(&id);
            debug!("Dropped finished plan {} from history", id);
        }
    }

    /// Execute the plan on its own task, then promote and settle it
    fn spawn_driver(&self, entry: Arc<PlanEntry>) {
        entry.runs.send_modify(|n| *n += 1);

        let engine = Arc::clone(&self.engine);
        let health = Arc::clone(&self.health);
        let deployed = Arc::clone(&self.deployed);
        let recovery_config = self.config.recovery.clone();
        let call_timeout = self.config.execution.call_timeout();

        tokio::spawn(async move {
            let _running = entry.run_lock.lock().await;
            engine.register_targets(&entry.plan.read());

            let status = engine.execute(&entry.plan).await;
            let (kind, abandoned) = {
                let plan = entry.plan.read();
                (plan.kind, plan.abandoned)
            };

            if status == Status::Complete && !abandoned {
                if let (PlanKind::Deployment, Some(target)) = (kind, &entry.target) {
                    let mut current = deployed.write();
                    if target.version > current.version {
                        info!("Topology v{} fully deployed", target.version);
                        *current = target.clone();
                    }
                }
                await_settled(health.as_ref(), &entry.plan, &recovery_config, call_timeout).await;
            }

            entry.runs.send_modify(|n| *n = n.saturating_sub(1));
        });
    }
}

#[async_trait]
impl TopologyDriver for Orchestrator {
    async fn quiesce(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.config.transition.plan_wait();
        while self.recovery.recovering_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::ExternalTimeout(
                    "recovery still in flight".to_string(),
                ));
            }
            tokio::time::sleep(self.config.recovery.health_poll_interval()).await;
        }
        Ok(())
    }

    async fn drive(&self, delta: &TopologyDelta, strategy: Option<UpdateStrategy>) -> Result<()> {
        let topology = delta.apply(&self.store.current().topology)?;
        let handle = self.submit_with_strategy(topology, strategy)?;
        let report = self
            .wait_for_plan(handle, self.config.transition.plan_wait())
            .await?;

        match (report.status, report.settled) {
            (Status::Complete, true) => Ok(()),
            (Status::Complete, false) => Err(OrchestratorError::ExternalTimeout(format!(
                "cluster did not settle after plan {}",
                handle
            ))),
            (status, _) => Err(OrchestratorError::ExternalFailure(format!(
                "plan {} ended {}",
                handle, status
            ))),
        }
    }
}
