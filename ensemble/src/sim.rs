//! In-memory cluster for tests and dry runs
//!
//! Implements [`Scheduler`], [`HealthOracle`] and [`ClusterProtocol`] on top
//! of a single mutex-guarded state. Faults are injected per instance or per
//! host, and every launch is counted so callers can assert what the engine
//! actually did.

use crate::error::{OrchestratorError, Result};
use crate::node::{InstanceId, TaskId};
use crate::scheduler::{
    ClusterHealth, ClusterProtocol, HealthOracle, HostPreference, LaunchRequest, Scheduler,
    TaskObservation,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct SimTask {
    task_id: TaskId,
    host: String,
    config_hash: String,
    ready_at: Instant,
    failed: bool,

    /// Start has been observed (running or failed) by the caller
    acknowledged: bool,
}

#[derive(Debug, Default)]
struct SimState {
    tasks: HashMap<InstanceId, SimTask>,
    next_task: u64,
    next_host: usize,
    broken_hosts: BTreeSet<String>,

    failing_launches: HashMap<InstanceId, u32>,
    hanging_launches: HashMap<InstanceId, u32>,
    slow_starts: HashMap<InstanceId, (u32, Duration)>,

    /// Live tasks that a later launch of the same instance displaced
    orphans: Vec<TaskId>,

    launches: HashMap<InstanceId, u32>,
    decommissions: HashMap<InstanceId, u32>,
    in_flight: HashMap<InstanceId, u32>,
    max_in_flight: HashMap<InstanceId, u32>,

    health_script: VecDeque<ClusterHealth>,
    last_health: Option<ClusterHealth>,

    rotation_failure: Option<String>,
    rotations: Vec<String>,
    pending_migrations: Vec<String>,
    migrations: Vec<String>,
}

/// Deterministic stand-in for the scheduler, health oracle and service
pub struct SimulatedCluster {
    hosts: Vec<String>,
    start_delay: Duration,
    state: Mutex<SimState>,
}

impl Default for SimulatedCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::with_hosts(vec![
            "agent-1".to_string(),
            "agent-2".to_string(),
            "agent-3".to_string(),
        ])
    }

    pub fn with_hosts(hosts: Vec<String>) -> Self {
        Self {
            hosts,
            start_delay: Duration::ZERO,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Time between a launch and the task reporting running
    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = delay;
        self
    }

    /// Reject the next `n` launches of `id`
    pub fn fail_next_launches(&self, id: &InstanceId, n: u32) {
        self.state.lock().failing_launches.insert(id.clone(), n);
    }

    /// Never answer the next `n` launches of `id`
    pub fn hang_next_launches(&self, id: &InstanceId, n: u32) {
        self.state.lock().hanging_launches.insert(id.clone(), n);
    }

    /// The next `n` launches of `id` report running only after `delay`
    pub fn slow_next_starts(&self, id: &InstanceId, n: u32, delay: Duration) {
        self.state.lock().slow_starts.insert(id.clone(), (n, delay));
    }

    /// Reject every launch pinned to `host`; `Any` placements avoid it
    pub fn break_host(&self, host: &str) {
        self.state.lock().broken_hosts.insert(host.to_string());
    }

    /// Kill the running task of `id`; returns the lost task
    pub fn kill(&self, id: &InstanceId) -> Option<TaskId> {
        let mut state = self.state.lock();
        let task = state.tasks.get_mut(id)?;
        task.failed = true;
        task.acknowledged = true;
        debug!("Simulated loss of {} ({})", id, task.task_id);
        Some(task.task_id.clone())
    }

    pub fn repair_host(&self, host: &str) {
        self.state.lock().broken_hosts.remove(host);
    }

    /// Health answers in order; the last one repeats
    pub fn script_health(&self, script: Vec<ClusterHealth>) {
        self.state.lock().health_script = script.into();
    }

    pub fn fail_credential_rotation(&self, reason: &str) {
        self.state.lock().rotation_failure = Some(reason.to_string());
    }

    pub fn set_pending_migrations(&self, indices: Vec<String>) {
        self.state.lock().pending_migrations = indices;
    }

    pub fn launch_count(&self, id: &InstanceId) -> u32 {
        self.state.lock().launches.get(id).copied().unwrap_or(0)
    }

    pub fn total_launches(&self) -> u32 {
        self.state.lock().launches.values().sum()
    }

    pub fn decommission_count(&self, id: &InstanceId) -> u32 {
        self.state.lock().decommissions.get(id).copied().unwrap_or(0)
    }

    /// Highest number of overlapping unfinished launches seen for `id`
    pub fn max_concurrent(&self, id: &InstanceId) -> u32 {
        self.state.lock().max_in_flight.get(id).copied().unwrap_or(0)
    }

    /// Highest overlap seen for any instance
    pub fn max_concurrent_any(&self) -> u32 {
        self.state
            .lock()
            .max_in_flight
            .values()
            .copied()
            .max()
            .unwrap_or(0)
    }

    /// Instances with a live (not failed) task
    pub fn running(&self) -> Vec<InstanceId> {
        let mut ids: Vec<_> = self
            .state
            .lock()
            .tasks
            .iter()
            .filter(|(_, t)| !t.failed)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Config hash the live task of `id` was launched with
    pub fn running_hash(&self, id: &InstanceId) -> Option<String> {
        self.state
            .lock()
            .tasks
            .get(id)
            .filter(|t| !t.failed)
            .map(|t| t.config_hash.clone())
    }

    pub fn host_of(&self, id: &InstanceId) -> Option<String> {
        self.state.lock().tasks.get(id).map(|t| t.host.clone())
    }

    /// Tasks that were still live when another launch of their instance
    /// started. A correct caller decommissions first, so this stays empty.
    pub fn orphaned_tasks(&self) -> Vec<TaskId> {
        self.state.lock().orphans.clone()
    }

    /// Users whose credentials were rotated, in call order
    pub fn rotations(&self) -> Vec<String> {
        self.state.lock().rotations.clone()
    }

    pub fn migrations(&self) -> Vec<String> {
        self.state.lock().migrations.clone()
    }

    fn place(&self, state: &mut SimState, preference: &HostPreference) -> Result<String> {
        match preference {
            HostPreference::Same(host) if state.broken_hosts.contains(host) => Err(
                OrchestratorError::ExternalFailure(format!("host {} rejected the task", host)),
            ),
            HostPreference::Same(host) => Ok(host.clone()),
            HostPreference::Any => {
                for _ in 0..self.hosts.len() {
                    let host = &self.hosts[state.next_host % self.hosts.len()];
                    state.next_host += 1;
                    if !state.broken_hosts.contains(host) {
                        return Ok(host.clone());
                    }
                }
                Err(OrchestratorError::ExternalFailure(
                    "no host has capacity".to_string(),
                ))
            }
        }
    }

    fn settle_in_flight(state: &mut SimState, id: &InstanceId) {
        if let Some(count) = state.in_flight.get_mut(id) {
            *count = count.saturating_sub(1);
        }
    }
}

fn take_one(counts: &mut HashMap<InstanceId, u32>, id: &InstanceId) -> bool {
    match counts.get_mut(id) {
        Some(n) if *n > 0 => {
            *n -= 1;
            true
        }
        _ => false,
    }
}

#[async_trait]
impl Scheduler for SimulatedCluster {
    async fn launch(&self, request: &LaunchRequest) -> Result<TaskId> {
        tokio::task::yield_now().await;
        let id = &request.instance;

        let hang = {
            let mut state = self.state.lock();
            *state.launches.entry(id.clone()).or_default() += 1;
            take_one(&mut state.hanging_launches, id)
        };
        if hang {
            debug!("Simulated launch of {} hangs", id);
            std::future::pending::<()>().await;
        }

        let mut state = self.state.lock();
        if take_one(&mut state.failing_launches, id) {
            return Err(OrchestratorError::ExternalFailure(format!(
                "launch of {} rejected",
                id
            )));
        }
        let host = self.place(&mut state, &request.host)?;

        state.next_task += 1;
        let task_id = TaskId(format!("{}__{}", id, state.next_task));

        let in_flight = state.in_flight.entry(id.clone()).or_default();
        *in_flight += 1;
        let current = *in_flight;
        let max = state.max_in_flight.entry(id.clone()).or_default();
        *max = (*max).max(current);

        if let Some(previous) = state.tasks.get(id).cloned() {
            if !previous.acknowledged {
                Self::settle_in_flight(&mut state, id);
            }
            if !previous.failed {
                debug!("Launch of {} displaced live task {}", id, previous.task_id);
                state.orphans.push(previous.task_id);
            }
        }

        let start_delay = match state.slow_starts.get_mut(id) {
            Some((n, delay)) if *n > 0 => {
                *n -= 1;
                *delay
            }
            _ => self.start_delay,
        };

        state.tasks.insert(
            id.clone(),
            SimTask {
                task_id: task_id.clone(),
                host,
                config_hash: request.config_hash.clone(),
                ready_at: Instant::now() + start_delay,
                failed: false,
                acknowledged: false,
            },
        );
        Ok(task_id)
    }

    async fn decommission(&self, id: &InstanceId) -> Result<()> {
        tokio::task::yield_now().await;
        let mut state = self.state.lock();
        *state.decommissions.entry(id.clone()).or_default() += 1;
        if let Some(task) = state.tasks.remove(id) {
            if !task.acknowledged {
                Self::settle_in_flight(&mut state, id);
            }
        }
        Ok(())
    }

    async fn observe(&self, id: &InstanceId) -> Result<TaskObservation> {
        let mut state = self.state.lock();
        let Some(task) = state.tasks.get_mut(id) else {
            return Ok(TaskObservation::Unknown);
        };
        if task.failed {
            return Ok(TaskObservation::Failed);
        }
        if Instant::now() < task.ready_at {
            return Ok(TaskObservation::Unknown);
        }
        let observation = TaskObservation::Running {
            task_id: task.task_id.clone(),
            host: task.host.clone(),
        };
        if !task.acknowledged {
            task.acknowledged = true;
            Self::settle_in_flight(&mut state, id);
        }
        Ok(observation)
    }
}

#[async_trait]
impl HealthOracle for SimulatedCluster {
    async fn health(&self) -> Result<ClusterHealth> {
        let mut state = self.state.lock();
        let next = state
            .health_script
            .pop_front()
            .or(state.last_health)
            .unwrap_or(ClusterHealth::Green);
        state.last_health = Some(next);
        Ok(next)
    }
}

#[async_trait]
impl ClusterProtocol for SimulatedCluster {
    async fn rotate_credential(&self, user: &str, _password: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.rotation_failure {
            return Err(OrchestratorError::ExternalFailure(format!(
                "rotating credential of {}: {}",
                user, reason
            )));
        }
        state.rotations.push(user.to_string());
        Ok(())
    }

    async fn migrate_index(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.pending_migrations.retain(|n| n != name);
        state.migrations.push(name.to_string());
        Ok(())
    }

    async fn pending_migrations(&self) -> Result<Vec<String>> {
        Ok(self.state.lock().pending_migrations.clone())
    }
}
