//! Deployment plan construction
//!
//! Plans are reconciled, not replayed: every role pool is compared with the
//! live inventory and only instances that differ from the target get a step.
//! Building again for a topology that is already in place, or already being
//! driven by another plan of the same version, yields no steps.

use super::{Phase, Plan, PlanKind, Step, StepAction};
use crate::impact::{CouplingTable, RestartImpact};
use crate::lease::InstanceLocks;
use crate::node::{InstanceId, NodeInventory};
use crate::topology::{Role, VersionedTopology};
use std::collections::BTreeSet;
use tracing::debug;

/// Turns a restart impact into an ordered deployment plan
#[derive(Debug, Clone, Default)]
pub struct PlanBuilder {
    coupling: CouplingTable,
}

impl PlanBuilder {
    pub fn new(coupling: CouplingTable) -> Self {
        Self { coupling }
    }

    pub fn build(
        &self,
        name: &str,
        impact: &RestartImpact,
        target: &VersionedTopology,
        inventory: &NodeInventory,
        locks: &InstanceLocks,
    ) -> Plan {
        let topology = &target.topology;
        let version = target.version;

        let roles: BTreeSet<Role> = topology
            .pools()
            .iter()
            .map(|p| p.role().clone())
            .chain(inventory.roles())
            .collect();

        let mut phases: Vec<Phase> = Vec::new();
        for role in roles {
            let count = topology.count(&role);
            let target_hash = topology
                .pool(&role)
                .map(|p| p.config_hash().to_string())
                .unwrap_or_default();
            let coupled = impact.get(&role).is_coupled();
            let mut steps = Vec::new();

            for ordinal in 0..count {
                let id = InstanceId::new(role.clone(), ordinal);
                if locks.is_targeted_at_version(&id, version) {
                    debug!("Skipping {}: already covered at version {}", id, version);
                    continue;
                }
                match inventory.get(&id) {
                    Some(instance) => {
                        let stale_config = instance.config_hash != target_hash;
                        let stale_peers = coupled && instance.generation < version;
                        if stale_config || stale_peers {
                            steps.push(Step::new(id, StepAction::Restart, &target_hash));
                        }
                    }
                    None => steps.push(Step::new(id, StepAction::Launch, &target_hash)),
                }
            }

            // Highest ordinals go first
            let mut surplus: Vec<_> = inventory
                .role_instances(&role)
                .into_iter()
                .filter(|i| i.id.ordinal >= count)
                .collect();
            surplus.sort_by(|a, b| b.id.ordinal.cmp(&a.id.ordinal));
            for instance in surplus {
                if locks.is_targeted_at_version(&instance.id, version) {
                    continue;
                }
                steps.push(Step::new(
                    instance.id,
                    StepAction::Decommission,
                    &instance.config_hash,
                ));
            }

            // Peer restarts of a coupled role get their own phase so they can
            // wait for the source roles' launches
            let (restarts, others): (Vec<Step>, Vec<Step>) = steps
                .into_iter()
                .partition(|s| s.action == StepAction::Restart);
            let strategy = topology.strategy_for(&role);
            if coupled && !restarts.is_empty() && !others.is_empty() {
                phases.push(Phase::new(role.as_str(), Some(role.clone()), strategy, others));
                phases.push(Phase::new(
                    &format!("{}-restart", role),
                    Some(role.clone()),
                    strategy,
                    restarts,
                ));
            } else {
                let steps: Vec<Step> = restarts.into_iter().chain(others).collect();
                if !steps.is_empty() {
                    phases.push(Phase::new(role.as_str(), Some(role.clone()), strategy, steps));
                }
            }
        }

        phases.sort_by_key(|p| {
            p.role
                .as_ref()
                .map(|r| topology.declaration_rank(r))
                .unwrap_or(usize::MAX)
        });
        self.defer_coupled_restarts(&mut phases, impact);

        let plan = Plan::new(
            PlanKind::Deployment,
            name,
            version,
            topology.expected_task_count(),
            phases,
        );
        debug!(
            "Built plan '{}' for version {}: {} phases, {} steps",
            name,
            version,
            plan.phases.len(),
            plan.step_count()
        );
        plan
    }

    /// Move restart-only phases of coupled roles behind the scale-up phases
    /// of the roles they depend on
    fn defer_coupled_restarts(&self, phases: &mut Vec<Phase>, impact: &RestartImpact) {
        let deferred: Vec<(String, Role)> = phases
            .iter()
            .filter(|p| p.is_restart_only())
            .filter_map(|p| p.role.clone().map(|r| (p.name.clone(), r)))
            .filter(|(_, r)| impact.get(r).is_coupled())
            .collect();

        for (name, role) in deferred {
            let sources = self.coupling.sources_of(&role);
            let Some(position) = phases.iter().position(|p| p.name == name) else {
                continue;
            };
            let last_source = phases
                .iter()
                .enumerate()
                .filter(|(_, p)| p.launches())
                .filter(|(_, p)| p.role.as_ref().is_some_and(|r| sources.contains(r)))
                .map(|(i, _)| i)
                .max();
            if let Some(last) = last_source {
                if last > position {
                    let phase = phases.remove(position);
                    phases.insert(last, phase);
                }
            }
        }
    }
}
