//! Node replacement
//!
//! Moves one instance to another host while it keeps its ordinal, config
//! and persistent volume. This never touches any other role, so it carries
//! no restart impact.

use crate::error::{OrchestratorError, Result};
use crate::lease::InstanceLocks;
use crate::node::{InstanceId, NodeInventory};
use crate::plan::{Phase, Plan, PlanKind, Step, StepAction};
use crate::topology::{Role, UpdateStrategy, VersionedTopology};
use tracing::info;

/// Build a one-step replacement plan and claim its instance.
///
/// Fails with `InstanceNotFound` for an unknown instance and with
/// `ConflictingOperation` when another plan targets or holds it. On success
/// the instance is already claimed for the returned plan.
pub fn replace_plan(
    role: Role,
    ordinal: u32,
    current: &VersionedTopology,
    inventory: &NodeInventory,
    locks: &InstanceLocks,
) -> Result<Plan> {
    let id = InstanceId::new(role, ordinal);
    let instance = inventory
        .get(&id)
        .ok_or_else(|| OrchestratorError::InstanceNotFound(id.to_string()))?;

    let plan = Plan::new(
        PlanKind::Deployment,
        &format!("replace-{}", id),
        current.version,
        current.topology.expected_task_count(),
        vec![Phase::new(
            "replace",
            Some(id.role.clone()),
            UpdateStrategy::Serial,
            vec![Step::new(id.clone(), StepAction::Replace, &instance.config_hash)],
        )],
    );
    locks.claim_target(&id, plan.id, plan.kind, plan.topology_version)?;

    info!(
        "Replacing {} (task {}, host {}, volume {})",
        id, instance.task_id, instance.host, instance.volume_id
    );
    Ok(plan)
}
