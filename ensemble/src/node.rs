//! Node instances and the live inventory
//!
//! The inventory is the engine's view of what is actually running. Plans are
//! built by reconciling a topology against it, never by replaying history.

use crate::error::{OrchestratorError, Result};
use crate::topology::Role;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Stable identity of a node: role plus 0-based ordinal
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub role: Role,
    pub ordinal: u32,
}

impl InstanceId {
    pub fn new(role: Role, ordinal: u32) -> Self {
        Self { role, ordinal }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.role, self.ordinal)
    }
}

impl FromStr for InstanceId {
    type Err = OrchestratorError;

    /// Parse the `role-ordinal` form, e.g. `data-0`
    fn from_str(s: &str) -> Result<Self> {
        let (role, ordinal) = s.rsplit_once('-').ok_or_else(|| {
            OrchestratorError::ConfigRejected(format!("expected <role>-<ordinal>, got '{}'", s))
        })?;
        let ordinal = ordinal.parse::<u32>().map_err(|_| {
            OrchestratorError::ConfigRejected(format!("invalid ordinal in '{}'", s))
        })?;
        if role.is_empty() {
            return Err(OrchestratorError::ConfigRejected(format!(
                "missing role in '{}'",
                s
            )));
        }
        Ok(Self::new(Role::from(role), ordinal))
    }
}

/// Opaque task identity handed out by the scheduler
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A launched node as last seen by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInstance {
    pub id: InstanceId,

    /// Current task, reassigned on every (re)launch
    pub task_id: TaskId,

    /// Pool config hash at the last planned launch
    pub config_hash: String,

    /// Topology version of the last planned launch
    pub generation: u64,

    /// Host the task runs on
    pub host: String,

    /// Persistent volume that follows the instance across replacements
    pub volume_id: String,
}

/// Live population of node instances
#[derive(Debug, Default)]
pub struct NodeInventory {
    instances: RwLock<BTreeMap<InstanceId, NodeInstance>>,
}

impl NodeInventory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &InstanceId) -> Option<NodeInstance> {
        self.instances.read().get(id).cloned()
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.instances.read().contains_key(id)
    }

    /// All instances of a role, ordered by ordinal
    pub fn role_instances(&self, role: &Role) -> Vec<NodeInstance> {
        self.instances
            .read()
            .values()
            .filter(|i| &i.id.role == role)
            .cloned()
            .collect()
    }

    /// Roles that have at least one instance
    pub fn roles(&self) -> Vec<Role> {
        let mut roles: Vec<Role> = self
            .instances
            .read()
            .keys()
            .map(|id| id.role.clone())
            .collect();
        roles.dedup();
        roles
    }

    pub fn all(&self) -> Vec<NodeInstance> {
        self.instances.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.instances.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.read().is_empty()
    }

    /// Insert or replace an instance after a planned launch
    pub fn upsert(&self, instance: NodeInstance) {
        self.instances.write().insert(instance.id.clone(), instance);
    }

    /// Record a relaunch that keeps config and generation
    pub fn update_task(&self, id: &InstanceId, task_id: TaskId, host: String) -> bool {
        if let Some(instance) = self.instances.write().get_mut(id) {
            instance.task_id = task_id;
            instance.host = host;
            true
        } else {
            false
        }
    }

    /// Free an ordinal; only scale-down calls this
    pub fn remove(&self, id: &InstanceId) -> Option<NodeInstance> {
        self.instances.write().remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(role: Role, ordinal: u32, task: &str) -> NodeInstance {
        NodeInstance {
            id: InstanceId::new(role, ordinal),
            task_id: TaskId(task.to_string()),
            config_hash: "h".to_string(),
            generation: 1,
            host: "agent-1".to_string(),
            volume_id: format!("vol-{}", ordinal),
        }
    }

    #[test]
    fn test_instance_id_roundtrip() {
        let id: InstanceId = "data-0".parse().unwrap();
        assert_eq!(id, InstanceId::new(Role::Data, 0));
        assert_eq!(id.to_string(), "data-0");

        let custom: InstanceId = "hot-warm-12".parse().unwrap();
        assert_eq!(custom.role, Role::Custom("hot-warm".to_string()));
        assert_eq!(custom.ordinal, 12);

        assert!("data".parse::<InstanceId>().is_err());
        assert!("data-x".parse::<InstanceId>().is_err());
    }

    #[test]
    fn test_role_instances_are_ordered() {
        let inventory = NodeInventory::new();
        inventory.upsert(instance(Role::Data, 2, "t2"));
        inventory.upsert(instance(Role::Master, 0, "t0"));
        inventory.upsert(instance(Role::Data, 0, "t1"));

        let data = inventory.role_instances(&Role::Data);
        assert_eq!(data.len(), 2);
        assert_eq!(data[0].id.ordinal, 0);
        assert_eq!(data[1].id.ordinal, 2);
        assert_eq!(inventory.roles(), vec![Role::Master, Role::Data]);
    }

    #[test]
    fn test_update_task_keeps_config() {
        let inventory = NodeInventory::new();
        inventory.upsert(instance(Role::Data, 0, "t1"));
        let id = InstanceId::new(Role::Data, 0);

        assert!(inventory.update_task(&id, TaskId("t9".into()), "agent-7".into()));
        let updated = inventory.get(&id).unwrap();
        assert_eq!(updated.task_id, TaskId("t9".into()));
        assert_eq!(updated.host, "agent-7");
        assert_eq!(updated.config_hash, "h");
        assert_eq!(updated.volume_id, "vol-0");
    }
}
