//! Plan execution
//!
//! Phases run one after another. A serial phase runs its steps one at a
//! time and stops at the first ERROR; a parallel phase starts every pending
//! step at once and joins them, so one failure never cancels a sibling.
//!
//! Each step holds the instance lease for its whole duration. External
//! calls are bounded; a timed-out attempt is repeated with the same target
//! up to `max_timeout_retries` times before the step fails for good.

use super::{Plan, PlanKind, SharedPlan, Status, Step, StepAction};
use crate::config::ExecutionConfig;
use crate::error::{OrchestratorError, Result};
use crate::lease::InstanceLocks;
use crate::metrics;
use crate::node::{InstanceId, NodeInstance, NodeInventory, TaskId};
use crate::scheduler::{bounded, HostPreference, LaunchRequest, Scheduler, TaskObservation};
use crate::topology::UpdateStrategy;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Drives plans against the scheduler and keeps the inventory current
pub struct PlanEngine {
    scheduler: Arc<dyn Scheduler>,
    inventory: Arc<NodeInventory>,
    locks: Arc<InstanceLocks>,
    config: ExecutionConfig,

    /// OS user node tasks run as
    user: String,
}

impl PlanEngine {
    pub fn new(
        scheduler: Arc<dyn Scheduler>,
        inventory: Arc<NodeInventory>,
        locks: Arc<InstanceLocks>,
        config: ExecutionConfig,
        user: &str,
    ) -> Self {
        Self {
            scheduler,
            inventory,
            locks,
            config,
            user: user.to_string(),
        }
    }

    pub fn inventory(&self) -> &Arc<NodeInventory> {
        &self.inventory
    }

    pub fn locks(&self) -> &Arc<InstanceLocks> {
        &self.locks
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    /// Declare the intent of every unfinished step of `plan`
    pub fn register_targets(&self, plan: &Plan) {
        if plan.abandoned {
            return;
        }
        for step in plan.steps().filter(|s| !s.status.is_terminal()) {
            self.locks
                .add_target(&step.instance, plan.id, plan.kind, plan.topology_version);
        }
    }

    fn release_pending_targets(&self, plan: &Plan) {
        for step in plan.steps().filter(|s| s.status == Status::Pending) {
            self.locks.release_target(&step.instance, plan.id);
        }
    }

    /// Stop a superseded plan from starting new steps.
    ///
    /// Steps already in flight run to their own completion and release their
    /// targets when they finish.
    pub fn abandon(&self, plan: &SharedPlan) {
        let mut guard = plan.write();
        if guard.abandoned || guard.status() == Status::Complete {
            return;
        }
        guard.abandoned = true;
        info!(
            "Abandoning plan '{}' ({}) at status {}",
            guard.name,
            guard.id,
            guard.status()
        );
        self.release_pending_targets(&guard);
        metrics::record_plan_abandoned();
    }

    /// Run every pending step of the plan; returns the resulting plan status
    pub async fn execute(&self, plan: &SharedPlan) -> Status {
        let started = Instant::now();
        let (id, kind, name, phase_count) = {
            let p = plan.read();
            (p.id, p.kind, p.name.clone(), p.phases.len())
        };

        metrics::record_plan_started(kind);
        info!("Executing {} plan '{}' ({}): {} phases", kind, name, id, phase_count);

        for phase_idx in 0..phase_count {
            let (phase_name, strategy, phase_status, pending) = {
                let p = plan.read();
                if p.abandoned {
                    break;
                }
                let phase = &p.phases[phase_idx];
                let pending: Vec<usize> = phase
                    .steps
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.status == Status::Pending)
                    .map(|(i, _)| i)
                    .collect();
                (phase.name.clone(), phase.strategy, phase.status(), pending)
            };

            if strategy == UpdateStrategy::Serial && phase_status == Status::Error {
                break;
            }

            if !pending.is_empty() {
                info!(
                    "Phase '{}' of plan '{}': {} pending steps ({:?})",
                    phase_name,
                    name,
                    pending.len(),
                    strategy
                );
            }

            match strategy {
                UpdateStrategy::Serial => {
                    for step_idx in pending {
                        if self.run_step(plan, phase_idx, step_idx).await != Status::Complete {
                            break;
                        }
                    }
                }
                UpdateStrategy::Parallel => {
                    join_all(
                        pending
                            .into_iter()
                            .map(|step_idx| self.run_step(plan, phase_idx, step_idx)),
                    )
                    .await;
                }
            }

            let status = plan.read().phases[phase_idx].status();
            if status != Status::Complete {
                if status == Status::Error {
                    warn!("Phase '{}' of plan '{}' halted with errors", phase_name, name);
                }
                break;
            }
        }

        let guard = plan.read();
        let status = guard.status();
        if status == Status::Error || guard.abandoned {
            // Halted plans stop claiming instances until a retry re-registers them
            self.release_pending_targets(&guard);
        }
        if status.is_terminal() {
            metrics::record_plan_finished(kind, status, started.elapsed());
            info!("Plan '{}' ({}) finished: {}", name, id, status);
        } else if guard.abandoned {
            info!("Plan '{}' ({}) stopped after abandonment", name, id);
        }
        status
    }

    async fn run_step(&self, plan: &SharedPlan, phase_idx: usize, step_idx: usize) -> Status {
        let (plan_id, kind, version, step) = {
            let p = plan.read();
            let step = p.phases[phase_idx].steps[step_idx].clone();
            (p.id, p.kind, p.topology_version, step)
        };
        if step.status != Status::Pending {
            return step.status;
        }
        let name = step.name();

        let lease = match self
            .locks
            .wait_lease(&step.instance, plan_id, kind, self.config.lease_wait())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Step {} could not acquire its instance: {}", name, e);
                self.finish_step(plan, phase_idx, step_idx, Err(e));
                return Status::Error;
            }
        };

        {
            let mut p = plan.write();
            if p.abandoned {
                return Status::Pending;
            }
            p.phases[phase_idx].steps[step_idx].start();
        }
        debug!("Step {} started", name);

        let started = Instant::now();
        let mut attempts: u32 = 0;
        let result = loop {
            attempts += 1;
            plan.write().phases[phase_idx].steps[step_idx].attempts += 1;

            match self.perform(&step, kind, version).await {
                Err(e) if e.is_timeout() && attempts <= self.config.max_timeout_retries => {
                    warn!(
                        "Step {} timed out (attempt {}/{}), retrying: {}",
                        name,
                        attempts,
                        self.config.max_timeout_retries + 1,
                        e
                    );
                    self.clear_unrecorded_task(&step).await;
                }
                Err(e) if e.is_timeout() => {
                    self.clear_unrecorded_task(&step).await;
                    break Err(OrchestratorError::ExternalFailure(format!(
                        "{} after {} attempts",
                        e, attempts
                    )));
                }
                other => break other,
            }
        };
        drop(lease);

        let role = step.instance.role.to_string();
        match &result {
            Ok(_) => metrics::record_step_complete(step.action, &role, started.elapsed()),
            Err(e) => metrics::record_step_error(step.action, &role, e.error_type()),
        }
        self.finish_step(plan, phase_idx, step_idx, result)
    }

    /// A timed-out launch may still have created a task the inventory never
    /// recorded; stop it before the next attempt starts another one
    async fn clear_unrecorded_task(&self, step: &Step) {
        if step.action != StepAction::Launch || self.inventory.contains(&step.instance) {
            return;
        }
        if let Err(e) = self.decommission(&step.instance).await {
            warn!("Could not clear stray task of {}: {}", step.instance, e);
        }
    }

    fn finish_step(
        &self,
        plan: &SharedPlan,
        phase_idx: usize,
        step_idx: usize,
        result: Result<Option<TaskId>>,
    ) -> Status {
        let mut p = plan.write();
        let plan_id = p.id;
        let step = &mut p.phases[phase_idx].steps[step_idx];
        match result {
            Ok(task_id) => {
                step.complete(task_id);
                info!("Step {} complete", step.name());
            }
            Err(e) => {
                step.fail(&e);
                warn!("Step {} failed: {}", step.name(), e);
            }
        }
        self.locks.release_target(&step.instance, plan_id);
        step.status
    }

    /// One attempt at a step's action
    async fn perform(&self, step: &Step, kind: PlanKind, version: u64) -> Result<Option<TaskId>> {
        let id = &step.instance;
        let current = self.inventory.get(id);

        if kind == PlanKind::Deployment && self.already_converged(step, current.as_ref(), version) {
            debug!("{} already matches its target, nothing to do", id);
            return Ok(current.map(|c| c.task_id));
        }

        match step.action {
            // A superseded plan's in-flight launch may have landed since this
            // step was planned; its task is replaced in place
            StepAction::Launch if current.is_some() => {
                let current = self.require(id, current)?;
                debug!("{} appeared at {}, replacing its task", id, current.config_hash);
                self.restart(step, current, version).await
            }
            StepAction::Launch => {
                let volume_id = new_volume_id(id);
                let request = self.request(id, &step.target_hash, &volume_id, HostPreference::Any);
                let (task_id, host) = self.launch_and_await(&request).await?;
                self.inventory.upsert(NodeInstance {
                    id: id.clone(),
                    task_id: task_id.clone(),
                    config_hash: step.target_hash.clone(),
                    generation: version,
                    host,
                    volume_id,
                });
                Ok(Some(task_id))
            }
            StepAction::Restart => {
                let current = self.require(id, current)?;
                self.restart(step, current, version).await
            }
            StepAction::Replace => {
                let current = self.require(id, current)?;
                self.decommission(id).await?;
                let request = self.request(
                    id,
                    &current.config_hash,
                    &current.volume_id,
                    HostPreference::Any,
                );
                let (task_id, host) = self.launch_and_await(&request).await?;
                self.inventory.update_task(id, task_id.clone(), host);
                Ok(Some(task_id))
            }
            StepAction::Relaunch => {
                let current = self.require(id, current)?;
                self.decommission(id).await?;
                let request = self.request(
                    id,
                    &step.target_hash,
                    &current.volume_id,
                    HostPreference::Same(current.host.clone()),
                );
                let (task_id, host) = self.launch_and_await(&request).await?;
                self.inventory.update_task(id, task_id.clone(), host);
                Ok(Some(task_id))
            }
            StepAction::Decommission => {
                if current.is_some() {
                    self.decommission(id).await?;
                    self.inventory.remove(id);
                }
                Ok(None)
            }
        }
    }

    /// Stop the instance's task and start it again on the same host and
    /// volume with the step's config
    async fn restart(
        &self,
        step: &Step,
        current: NodeInstance,
        version: u64,
    ) -> Result<Option<TaskId>> {
        let id = &step.instance;
        self.decommission(id).await?;
        let request = self.request(
            id,
            &step.target_hash,
            &current.volume_id,
            HostPreference::Same(current.host.clone()),
        );
        let (task_id, host) = self.launch_and_await(&request).await?;
        self.inventory.upsert(NodeInstance {
            task_id: task_id.clone(),
            config_hash: step.target_hash.clone(),
            generation: version,
            host,
            ..current
        });
        Ok(Some(task_id))
    }

    /// Whether a planned step finds its instance already in the target state,
    /// typically left there by a superseded plan's in-flight step
    fn already_converged(&self, step: &Step, current: Option<&NodeInstance>, version: u64) -> bool {
        match (step.action, current) {
            (StepAction::Launch, Some(c)) => c.config_hash == step.target_hash,
            (StepAction::Restart, Some(c)) => {
                c.config_hash == step.target_hash && c.generation >= version
            }
            _ => false,
        }
    }

    fn require(&self, id: &InstanceId, current: Option<NodeInstance>) -> Result<NodeInstance> {
        current.ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))
    }

    fn request(
        &self,
        id: &InstanceId,
        config_hash: &str,
        volume_id: &str,
        host: HostPreference,
    ) -> LaunchRequest {
        LaunchRequest {
            instance: id.clone(),
            config_hash: config_hash.to_string(),
            volume_id: volume_id.to_string(),
            host,
            user: self.user.clone(),
        }
    }

    async fn decommission(&self, id: &InstanceId) -> Result<()> {
        bounded(
            "decommission",
            self.config.call_timeout(),
            self.scheduler.decommission(id),
        )
        .await
    }

    /// Launch a task and poll until the scheduler reports that task running
    async fn launch_and_await(&self, request: &LaunchRequest) -> Result<(TaskId, String)> {
        let id = &request.instance;
        let task_id = bounded(
            "launch",
            self.config.call_timeout(),
            self.scheduler.launch(request),
        )
        .await?;

        let deadline = tokio::time::Instant::now() + self.config.launch_timeout();
        loop {
            let observation = bounded(
                "observe",
                self.config.call_timeout(),
                self.scheduler.observe(id),
            )
            .await?;
            match observation {
                TaskObservation::Running { task_id: seen, host } if seen == task_id => {
                    return Ok((task_id, host));
                }
                TaskObservation::Failed => {
                    return Err(OrchestratorError::ExternalFailure(format!(
                        "task {} of {} failed to start",
                        task_id, id
                    )));
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(OrchestratorError::ExternalTimeout(format!(
                    "task {} of {} not running within {}ms",
                    task_id, id, self.config.launch_timeout_ms
                )));
            }
            debug!("Waiting for {} to report task {} running", id, task_id);
            tokio::time::sleep(self.config.observe_interval()).await;
        }
    }
}

fn new_volume_id(id: &InstanceId) -> String {
    format!("{}-{}", id, Uuid::new_v4().simple())
}
