//! Deployment and recovery plans
//!
//! A [`Plan`] is an ordered list of [`Phase`]s; each phase holds one [`Step`]
//! per node instance. Plan and phase status are pure functions of the step
//! statuses, so there is no separate state to drift.

mod builder;
mod engine;

pub use builder::PlanBuilder;
pub use engine::PlanEngine;

use crate::error::{OrchestratorError, Result};
use crate::node::{InstanceId, TaskId};
use crate::topology::{Role, UpdateStrategy};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Unique identifier of a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanId(Uuid);

impl PlanId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PlanId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| OrchestratorError::PlanNotFound(s.to_string()))
    }
}

/// Handle returned to callers for status queries
pub type PlanHandle = PlanId;

/// Plan shared between its driver task and status readers
pub type SharedPlan = Arc<RwLock<Plan>>;

/// Planned (deployment) versus unplanned (recovery) work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Deployment,
    Recovery,
}

impl PlanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanKind::Deployment => "deployment",
            PlanKind::Recovery => "recovery",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a step, phase or plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Pending,
    InProgress,
    Complete,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::InProgress => "in_progress",
            Status::Complete => "complete",
            Status::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Complete | Status::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregate child statuses; an empty set is complete
fn aggregate<I: IntoIterator<Item = Status>>(statuses: I) -> Status {
    let mut all_complete = true;
    let mut any_started = false;
    let mut any_error = false;
    for status in statuses {
        match status {
            Status::Complete => any_started = true,
            Status::InProgress => {
                any_started = true;
                all_complete = false;
            }
            Status::Pending => all_complete = false,
            Status::Error => {
                any_error = true;
                all_complete = false;
            }
        }
    }
    if any_error {
        Status::Error
    } else if all_complete {
        Status::Complete
    } else if any_started {
        Status::InProgress
    } else {
        Status::Pending
    }
}

/// Operation a step performs on its instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    /// First launch of a new ordinal
    Launch,
    /// Kill and relaunch in place with the new config
    Restart,
    /// Kill and relaunch on any host, keeping ordinal and volume
    Replace,
    /// Relaunch a lost task in place with its recorded config
    Relaunch,
    /// Kill and free the ordinal
    Decommission,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Launch => "launch",
            StepAction::Restart => "restart",
            StepAction::Replace => "replace",
            StepAction::Relaunch => "relaunch",
            StepAction::Decommission => "decommission",
        }
    }
}

/// One node-level operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub instance: InstanceId,
    pub action: StepAction,

    /// Config hash the instance runs with once the step completes
    pub target_hash: String,

    pub status: Status,

    /// Attempts made, including timed-out ones
    pub attempts: u32,

    /// Task identity reported when the step completed
    pub task_id: Option<TaskId>,

    pub error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(instance: InstanceId, action: StepAction, target_hash: &str) -> Self {
        Self {
            instance,
            action,
            target_hash: target_hash.to_string(),
            status: Status::Pending,
            attempts: 0,
            task_id: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn name(&self) -> String {
        format!("{}:[{}]", self.instance, self.action.as_str())
    }

    fn start(&mut self) {
        self.status = Status::InProgress;
        self.error = None;
        self.started_at = Some(Utc::now());
    }

    fn complete(&mut self, task_id: Option<TaskId>) {
        self.status = Status::Complete;
        self.task_id = task_id;
        self.finished_at = Some(Utc::now());
    }

    fn fail(&mut self, error: &OrchestratorError) {
        self.status = Status::Error;
        self.error = Some(error.to_string());
        self.finished_at = Some(Utc::now());
    }
}

/// A group of steps dispatched under one strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub name: String,
    pub role: Option<Role>,
    pub strategy: UpdateStrategy,
    pub steps: Vec<Step>,
}

impl Phase {
    pub fn new(name: &str, role: Option<Role>, strategy: UpdateStrategy, steps: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            role,
            strategy,
            steps,
        }
    }

    pub fn status(&self) -> Status {
        aggregate(self.steps.iter().map(|s| s.status))
    }

    /// Whether every step only restarts existing members
    pub fn is_restart_only(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.action == StepAction::Restart)
    }

    pub fn launches(&self) -> bool {
        self.steps.iter().any(|s| s.action == StepAction::Launch)
    }
}

/// Ordered phases plus the topology version they converge to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub kind: PlanKind,
    pub name: String,

    /// Version of the topology this plan converges to
    pub topology_version: u64,

    /// Tasks expected to run once this plan completes
    pub expected_task_count: u64,

    pub phases: Vec<Phase>,
    pub created_at: DateTime<Utc>,

    /// Superseded by a newer plan; no new steps start
    pub abandoned: bool,

    /// Replication health observed GREEN after completion
    pub settled: bool,
}

impl Plan {
    pub fn new(
        kind: PlanKind,
        name: &str,
        topology_version: u64,
        expected_task_count: u64,
        phases: Vec<Phase>,
    ) -> Self {
        Self {
            id: PlanId::new(),
            kind,
            name: name.to_string(),
            topology_version,
            expected_task_count,
            phases,
            created_at: Utc::now(),
            abandoned: false,
            settled: false,
        }
    }

    pub fn status(&self) -> Status {
        aggregate(self.steps().map(|s| s.status))
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.phases.iter().flat_map(|p| p.steps.iter())
    }

    pub fn step_count(&self) -> usize {
        self.steps().count()
    }

    pub fn is_empty(&self) -> bool {
        self.step_count() == 0
    }

    pub fn step(&self, instance: &InstanceId) -> Option<&Step> {
        self.steps().find(|s| &s.instance == instance)
    }

    fn step_mut(&mut self, instance: &InstanceId) -> Option<&mut Step> {
        self.phases
            .iter_mut()
            .flat_map(|p| p.steps.iter_mut())
            .find(|s| &s.instance == instance)
    }

    /// Whether a not-yet-finished step of this plan targets `instance`
    pub fn targets(&self, instance: &InstanceId) -> bool {
        self.step(instance)
            .is_some_and(|s| matches!(s.status, Status::Pending | Status::InProgress))
    }

    /// Reset an ERROR'd step to PENDING so the next execution retries it.
    ///
    /// Returns `Ok(false)` for steps in any other state, a COMPLETE step
    /// in particular stays untouched.
    pub fn reset_step(&mut self, instance: &InstanceId) -> Result<bool> {
        let step = self
            .step_mut(instance)
            .ok_or_else(|| OrchestratorError::InstanceNotFound(instance.to_string()))?;
        if step.status != Status::Error {
            return Ok(false);
        }
        step.status = Status::Pending;
        step.error = None;
        step.finished_at = None;
        Ok(true)
    }

    pub fn report(&self) -> PlanStatusReport {
        PlanStatusReport {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            status: self.status(),
            topology_version: self.topology_version,
            expected_task_count: self.expected_task_count,
            abandoned: self.abandoned,
            settled: self.settled,
            phases: self
                .phases
                .iter()
                .map(|p| PhaseReport {
                    name: p.name.clone(),
                    strategy: p.strategy,
                    status: p.status(),
                    steps: p
                        .steps
                        .iter()
                        .map(|s| StepReport {
                            name: s.name(),
                            instance: s.instance.to_string(),
                            action: s.action,
                            status: s.status,
                            attempts: s.attempts,
                            task_id: s.task_id.clone(),
                            error: s.error.clone(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Externally visible plan status with per-step detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStatusReport {
    pub id: PlanId,
    pub kind: PlanKind,
    pub name: String,
    pub status: Status,
    pub topology_version: u64,
    pub expected_task_count: u64,
    pub abandoned: bool,
    pub settled: bool,
    pub phases: Vec<PhaseReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReport {
    pub name: String,
    pub strategy: UpdateStrategy,
    pub status: Status,
    pub steps: Vec<StepReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub instance: String,
    pub action: StepAction,
    pub status: Status,
    pub attempts: u32,
    pub task_id: Option<TaskId>,
    pub error: Option<String>,
}
