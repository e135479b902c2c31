//! Restart-impact analysis
//!
//! Decides, per role pool, whether existing members must restart and how
//! the pool size changes between two topology snapshots:
//!
//! ```text
//! own config hash changed          -> restart existing members
//! count changed                    -> scale_delta, no restart by itself
//! coupled source count increased   -> restart existing members of targets
//! coupled source count decreased   -> same, only if configured
//! ```
//!
//! Coupling comes from a declarative table (`data -> {master}` by default,
//! masters refresh their discovery hosts when data membership changes).

use crate::config::{CouplingRule, ImpactConfig};
use crate::topology::{Role, Topology};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Why a role has to restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RestartReason {
    /// The pool's own config hash changed
    ConfigChanged,
    /// Membership of a role this pool depends on changed
    DependencyScaled { source: Role, delta: i64 },
}

/// Impact on a single role pool
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RoleImpact {
    pub restart: bool,
    pub scale_delta: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reasons: Vec<RestartReason>,
}

impl RoleImpact {
    pub fn is_noop(&self) -> bool {
        !self.restart && self.scale_delta == 0
    }

    /// Whether the restart comes from another role's membership change
    pub fn is_coupled(&self) -> bool {
        self.reasons
            .iter()
            .any(|r| matches!(r, RestartReason::DependencyScaled { .. }))
    }
}

/// Per-role impact of a topology change; derived, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RestartImpact {
    roles: BTreeMap<Role, RoleImpact>,
}

impl RestartImpact {
    /// Impact of a role; roles absent from both topologies have none
    pub fn get(&self, role: &Role) -> RoleImpact {
        self.roles.get(role).cloned().unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Role, &RoleImpact)> {
        self.roles.iter()
    }

    /// True when nothing restarts and nothing scales
    pub fn is_noop(&self) -> bool {
        self.roles.values().all(RoleImpact::is_noop)
    }

    pub fn restarted_roles(&self) -> Vec<Role> {
        self.roles
            .iter()
            .filter(|(_, i)| i.restart)
            .map(|(r, _)| r.clone())
            .collect()
    }
}

/// Declarative `source role -> roles it restarts` table
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CouplingTable {
    edges: BTreeMap<Role, BTreeSet<Role>>,
}

impl CouplingTable {
    pub fn new(rules: &[CouplingRule]) -> Self {
        let mut edges: BTreeMap<Role, BTreeSet<Role>> = BTreeMap::new();
        for rule in rules {
            edges
                .entry(rule.source.clone())
                .or_default()
                .extend(rule.restarts.iter().filter(|r| **r != rule.source).cloned());
        }
        Self { edges }
    }

    pub fn targets_of(&self, source: &Role) -> impl Iterator<Item = &Role> {
        self.edges.get(source).into_iter().flatten()
    }

    /// Roles whose membership changes restart `target`
    pub fn sources_of(&self, target: &Role) -> Vec<Role> {
        self.edges
            .iter()
            .filter(|(_, targets)| targets.contains(target))
            .map(|(source, _)| source.clone())
            .collect()
    }

    fn edges(&self) -> impl Iterator<Item = (&Role, &BTreeSet<Role>)> {
        self.edges.iter()
    }
}

/// Computes [`RestartImpact`] from a pair of topologies
#[derive(Debug, Clone)]
pub struct ImpactAnalyzer {
    coupling: CouplingTable,
    scale_down_restarts_dependents: bool,
}

impl Default for ImpactAnalyzer {
    fn default() -> Self {
        Self::new(&ImpactConfig::default())
    }
}

impl ImpactAnalyzer {
    pub fn new(config: &ImpactConfig) -> Self {
        Self {
            coupling: CouplingTable::new(&config.couplings),
            scale_down_restarts_dependents: config.scale_down_restarts_dependents,
        }
    }

    pub fn coupling(&self) -> &CouplingTable {
        &self.coupling
    }

    /// Pure function of the two snapshots
    pub fn analyze(&self, old: &Topology, new: &Topology) -> RestartImpact {
        let mut roles: BTreeMap<Role, RoleImpact> = BTreeMap::new();
        if old == new {
            for pool in new.pools() {
                roles.insert(pool.role().clone(), RoleImpact::default());
            }
            return RestartImpact { roles };
        }

        let union: BTreeSet<Role> = old
            .pools()
            .iter()
            .chain(new.pools())
            .map(|p| p.role().clone())
            .collect();

        for role in &union {
            let old_count = old.count(role);
            let new_count = new.count(role);
            let scale_delta = i64::from(new_count) - i64::from(old_count);

            let hash_changed = match (old.pool(role), new.pool(role)) {
                (Some(a), Some(b)) => a.config_hash() != b.config_hash(),
                _ => false,
            };

            let mut impact = RoleImpact {
                restart: false,
                scale_delta,
                reasons: Vec::new(),
            };
            if hash_changed && has_survivors(old_count, new_count) {
                impact.restart = true;
                impact.reasons.push(RestartReason::ConfigChanged);
            }
            roles.insert(role.clone(), impact);
        }

        for (source, targets) in self.coupling.edges() {
            let delta = roles.get(source).map(|i| i.scale_delta).unwrap_or(0);
            let propagates = delta > 0 || (delta < 0 && self.scale_down_restarts_dependents);
            if !propagates {
                continue;
            }
            for target in targets {
                if !has_survivors(old.count(target), new.count(target)) {
                    continue;
                }
                if let Some(impact) = roles.get_mut(target) {
                    impact.restart = true;
                    impact.reasons.push(RestartReason::DependencyScaled {
                        source: source.clone(),
                        delta,
                    });
                }
            }
        }

        for (role, impact) in &roles {
            if !impact.is_noop() {
                debug!(
                    "Impact on {}: restart={}, scale_delta={}",
                    role, impact.restart, impact.scale_delta
                );
            }
        }

        RestartImpact { roles }
    }
}

/// Only members that exist before and after the change can restart
fn has_survivors(old_count: u32, new_count: u32) -> bool {
    old_count > 0 && new_count > 0
}
