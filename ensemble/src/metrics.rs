//! Orchestration metrics
//!
//! Facade-only: the embedding process installs whatever recorder it wants.
//! - Plan lifecycle (started/completed/abandoned)
//! - Step duration, attempts and failures
//! - External call timeouts
//! - Recovery state and escalations

use crate::plan::{PlanKind, Status, StepAction};
use crate::scheduler::ClusterHealth;
use std::time::Duration;

/// Record a plan starting execution
pub fn record_plan_started(kind: PlanKind) {
    metrics::counter!(
        "ensemble_plans_started_total",
        "kind" => kind.as_str(),
    )
    .increment(1);
}

/// Record a plan reaching a terminal status
pub fn record_plan_finished(kind: PlanKind, status: Status, duration: Duration) {
    metrics::counter!(
        "ensemble_plans_finished_total",
        "kind" => kind.as_str(),
        "status" => status.as_str(),
    )
    .increment(1);

    metrics::histogram!(
        "ensemble_plan_duration_seconds",
        "kind" => kind.as_str(),
    )
    .record(duration.as_secs_f64());
}

pub fn record_plan_abandoned() {
    metrics::counter!("ensemble_plans_abandoned_total").increment(1);
}

/// Record a completed step
pub fn record_step_complete(action: StepAction, role: &str, duration: Duration) {
    metrics::counter!(
        "ensemble_steps_total",
        "action" => action.as_str(),
        "role" => role.to_string(),
        "status" => "ok",
    )
    .increment(1);

    metrics::histogram!(
        "ensemble_step_duration_seconds",
        "action" => action.as_str(),
    )
    .record(duration.as_secs_f64());
}

/// Record a step that ended in ERROR
pub fn record_step_error(action: StepAction, role: &str, error_type: &str) {
    metrics::counter!(
        "ensemble_steps_total",
        "action" => action.as_str(),
        "role" => role.to_string(),
        "status" => "error",
    )
    .increment(1);

    metrics::counter!(
        "ensemble_step_errors_total",
        "action" => action.as_str(),
        "error_type" => error_type.to_string(),
    )
    .increment(1);
}

/// Record an external call that exceeded its deadline
pub fn record_external_timeout(call: &str) {
    metrics::counter!(
        "ensemble_external_timeouts_total",
        "call" => call.to_string(),
    )
    .increment(1);
}

/// Update the per-instance recovery state gauge
pub fn update_recovery_state(instance: &str, state: &str) {
    let value = match state {
        "healthy" => 0.0,
        "suspect" => 1.0,
        "recovering" => 2.0,
        "failed" => 3.0,
        _ => -1.0,
    };
    metrics::gauge!(
        "ensemble_recovery_state",
        "instance" => instance.to_string(),
    )
    .set(value);
}

/// Record a recovery plan being created
pub fn record_recovery(kind: &str) {
    metrics::counter!(
        "ensemble_recoveries_total",
        "type" => kind.to_string(),
    )
    .increment(1);
}

pub fn update_cluster_health(health: ClusterHealth) {
    let value = match health {
        ClusterHealth::Green => 0.0,
        ClusterHealth::Yellow => 1.0,
        ClusterHealth::Red => 2.0,
    };
    metrics::gauge!("ensemble_cluster_health").set(value);
}

/// Record the outcome of a single transition step
pub fn record_transition_step(sequence: &str, step: &str, success: bool) {
    let status = if success { "success" } else { "failed" };
    metrics::counter!(
        "ensemble_transition_steps_total",
        "sequence" => sequence.to_string(),
        "step" => step.to_string(),
        "status" => status,
    )
    .increment(1);
}

/// Record a mode transition outcome
pub fn record_transition(sequence: &str, success: bool) {
    let status = if success { "success" } else { "aborted" };
    metrics::counter!(
        "ensemble_transitions_total",
        "sequence" => sequence.to_string(),
        "status" => status,
    )
    .increment(1);
}
