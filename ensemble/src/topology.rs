//! Topology model
//!
//! A [`Topology`] is an immutable snapshot of the desired cluster: one
//! [`RolePool`] per role plus cluster-wide [`ClusterSettings`]. Operators write
//! a [`TopologySpec`] (YAML); validation turns it into a `Topology` and computes
//! each pool's config hash once, so two snapshots can be diffed by value.
//!
//! Snapshots are published through a [`TopologyStore`], which swaps an `Arc`
//! and bumps the version. A published snapshot is never mutated.

use crate::error::{OrchestratorError, Result};
use base64::Engine;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// Role performed by a pool of nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Master,
    Data,
    Ingest,
    Coordinator,
    Custom(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::Master => "master",
            Role::Data => "data",
            Role::Ingest => "ingest",
            Role::Coordinator => "coordinator",
            Role::Custom(name) => name,
        }
    }

    /// Fixed rank of the built-in roles; custom roles follow in topology order
    pub fn builtin_rank(&self) -> Option<usize> {
        match self {
            Role::Master => Some(0),
            Role::Data => Some(1),
            Role::Ingest => Some(2),
            Role::Coordinator => Some(3),
            Role::Custom(_) => None,
        }
    }
}

impl From<String> for Role {
    fn from(name: String) -> Self {
        match name.as_str() {
            "master" => Role::Master,
            "data" => Role::Data,
            "ingest" => Role::Ingest,
            "coordinator" => Role::Coordinator,
            _ => Role::Custom(name),
        }
    }
}

impl From<&str> for Role {
    fn from(name: &str) -> Self {
        Role::from(name.to_string())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the steps of a phase are dispatched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStrategy {
    /// One node at a time, each must be running before the next starts
    #[default]
    Serial,
    /// All nodes of the phase at once
    Parallel,
}

/// Cluster-wide settings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub security_enabled: bool,

    #[serde(default)]
    pub plugins: BTreeSet<String>,

    /// Base64-encoded YAML appended to every node's config
    #[serde(default)]
    pub custom_config: String,

    #[serde(default)]
    pub update_strategy: UpdateStrategy,

    /// Version of the service binaries
    #[serde(default)]
    pub version: String,
}

/// Desired pool of nodes for one role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RolePool {
    role: Role,
    count: u32,
    settings: BTreeMap<String, String>,
    update_strategy: Option<UpdateStrategy>,
    config_hash: String,
}

impl RolePool {
    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn settings(&self) -> &BTreeMap<String, String> {
        &self.settings
    }

    /// Pool override, if any, of the cluster update strategy
    pub fn update_strategy(&self) -> Option<UpdateStrategy> {
        self.update_strategy
    }

    /// Hash of everything that ends up in a node's launch config
    pub fn config_hash(&self) -> &str {
        &self.config_hash
    }
}

fn compute_config_hash(
    role: &Role,
    settings: &BTreeMap<String, String>,
    cluster: &ClusterSettings,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"role\0");
    hasher.update(role.as_str().as_bytes());
    for (key, value) in settings {
        hasher.update(b"\0setting\0");
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
    }
    hasher.update(if cluster.security_enabled {
        b"\0security\0on".as_slice()
    } else {
        b"\0security\0off".as_slice()
    });
    for plugin in &cluster.plugins {
        hasher.update(b"\0plugin\0");
        hasher.update(plugin.as_bytes());
    }
    hasher.update(b"\0custom\0");
    hasher.update(cluster.custom_config.as_bytes());
    hasher.update(b"\0version\0");
    hasher.update(cluster.version.as_bytes());
    hex::encode(hasher.finalize())
}

/// Raw pool as written by an operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolePoolSpec {
    pub role: Role,
    pub count: i64,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<UpdateStrategy>,
}

/// Raw topology as written by an operator
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopologySpec {
    #[serde(default)]
    pub cluster: ClusterSettings,
    #[serde(default)]
    pub pools: Vec<RolePoolSpec>,
}

impl TopologySpec {
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }
}

/// Immutable snapshot of the desired cluster
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct Topology {
    pools: Vec<RolePool>,
    cluster: ClusterSettings,
}

impl Topology {
    /// A topology with no pools, the state before the first deployment
    pub fn empty() -> Self {
        Self::default()
    }

    /// Validate a raw spec into a topology
    pub fn from_spec(spec: TopologySpec) -> Result<Self> {
        validate_cluster(&spec.cluster)?;

        let mut seen = HashSet::new();
        let mut pools = Vec::with_capacity(spec.pools.len());
        for pool in spec.pools {
            if let Role::Custom(name) = &pool.role {
                validate_custom_role(name)?;
            }
            if !seen.insert(pool.role.clone()) {
                return Err(OrchestratorError::ConfigRejected(format!(
                    "role '{}' is declared more than once",
                    pool.role
                )));
            }
            if pool.count < 0 {
                return Err(OrchestratorError::ConfigRejected(format!(
                    "role '{}' has negative count {}",
                    pool.role, pool.count
                )));
            }
            let count = u32::try_from(pool.count).map_err(|_| {
                OrchestratorError::ConfigRejected(format!(
                    "role '{}' count {} is too large",
                    pool.role, pool.count
                ))
            })?;
            let config_hash = compute_config_hash(&pool.role, &pool.settings, &spec.cluster);
            pools.push(RolePool {
                role: pool.role,
                count,
                settings: pool.settings,
                update_strategy: pool.update_strategy,
                config_hash,
            });
        }

        Ok(Self {
            pools,
            cluster: spec.cluster,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Self::from_spec(TopologySpec::from_yaml(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_spec(TopologySpec::load(path)?)
    }

    /// Convert back into the editable raw form
    pub fn to_spec(&self) -> TopologySpec {
        TopologySpec {
            cluster: self.cluster.clone(),
            pools: self
                .pools
                .iter()
                .map(|p| RolePoolSpec {
                    role: p.role.clone(),
                    count: i64::from(p.count),
                    settings: p.settings.clone(),
                    update_strategy: p.update_strategy,
                })
                .collect(),
        }
    }

    pub fn cluster(&self) -> &ClusterSettings {
        &self.cluster
    }

    /// Pools in the order they were declared
    pub fn pools(&self) -> &[RolePool] {
        &self.pools
    }

    pub fn pool(&self, role: &Role) -> Option<&RolePool> {
        self.pools.iter().find(|p| &p.role == role)
    }

    /// Desired count of a role, zero when the role is absent
    pub fn count(&self, role: &Role) -> u32 {
        self.pool(role).map(|p| p.count).unwrap_or(0)
    }

    /// Effective update strategy of a role
    pub fn strategy_for(&self, role: &Role) -> UpdateStrategy {
        self.pool(role)
            .and_then(|p| p.update_strategy)
            .unwrap_or(self.cluster.update_strategy)
    }

    /// Total number of node tasks this topology expects to be running
    pub fn expected_task_count(&self) -> u64 {
        self.pools.iter().map(|p| u64::from(p.count)).sum()
    }

    /// Position of a role in declaration order: built-in roles first by fixed
    /// rank, custom roles after them in the order they appear here
    pub fn declaration_rank(&self, role: &Role) -> usize {
        if let Some(rank) = role.builtin_rank() {
            return rank;
        }
        let position = self
            .pools
            .iter()
            .position(|p| &p.role == role)
            .unwrap_or(self.pools.len());
        4 + position
    }
}

fn validate_custom_role(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(OrchestratorError::ConfigRejected(format!(
            "invalid role name '{}'",
            name
        )))
    }
}

fn validate_cluster(cluster: &ClusterSettings) -> Result<()> {
    for plugin in &cluster.plugins {
        if plugin.is_empty() || plugin.chars().any(char::is_whitespace) {
            return Err(OrchestratorError::ConfigRejected(format!(
                "invalid plugin name '{}'",
                plugin
            )));
        }
    }

    if !cluster.custom_config.is_empty() {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(cluster.custom_config.trim())
            .map_err(|e| {
                OrchestratorError::ConfigRejected(format!("custom config is not base64: {}", e))
            })?;
        let text = String::from_utf8(decoded).map_err(|e| {
            OrchestratorError::ConfigRejected(format!("custom config is not UTF-8: {}", e))
        })?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| {
            OrchestratorError::ConfigRejected(format!("custom config is not YAML: {}", e))
        })?;
        if !value.is_mapping() {
            return Err(OrchestratorError::ConfigRejected(
                "custom config must be a YAML mapping".to_string(),
            ));
        }
    }

    Ok(())
}

/// A change to apply on top of a topology
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TopologyDelta {
    /// New counts per role; a role not yet present is appended
    #[serde(default)]
    pub counts: BTreeMap<Role, i64>,

    /// Settings merged into each role's settings
    #[serde(default)]
    pub settings: BTreeMap<Role, BTreeMap<String, String>>,

    #[serde(default)]
    pub security_enabled: Option<bool>,

    #[serde(default)]
    pub plugins: Option<BTreeSet<String>>,

    #[serde(default)]
    pub custom_config: Option<String>,

    #[serde(default)]
    pub update_strategy: Option<UpdateStrategy>,

    #[serde(default)]
    pub version: Option<String>,
}

impl TopologyDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(mut self, role: Role, count: i64) -> Self {
        self.counts.insert(role, count);
        self
    }

    pub fn with_setting(mut self, role: Role, key: &str, value: &str) -> Self {
        self.settings
            .entry(role)
            .or_default()
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_security(mut self, enabled: bool) -> Self {
        self.security_enabled = Some(enabled);
        self
    }

    pub fn with_plugins<I, S>(mut self, plugins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.plugins = Some(plugins.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_custom_config(mut self, blob: &str) -> Self {
        self.custom_config = Some(blob.to_string());
        self
    }

    pub fn with_update_strategy(mut self, strategy: UpdateStrategy) -> Self {
        self.update_strategy = Some(strategy);
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }

    /// Produce a new validated topology; `base` is left untouched
    pub fn apply(&self, base: &Topology) -> Result<Topology> {
        let mut spec = base.to_spec();

        for (role, count) in &self.counts {
            match spec.pools.iter_mut().find(|p| &p.role == role) {
                Some(pool) => pool.count = *count,
                None => spec.pools.push(RolePoolSpec {
                    role: role.clone(),
                    count: *count,
                    settings: BTreeMap::new(),
                    update_strategy: None,
                }),
            }
        }

        for (role, settings) in &self.settings {
            let pool = spec
                .pools
                .iter_mut()
                .find(|p| &p.role == role)
                .ok_or_else(|| {
                    OrchestratorError::ConfigRejected(format!(
                        "settings given for undeclared role '{}'",
                        role
                    ))
                })?;
            pool.settings
                .extend(settings.iter().map(|(k, v)| (k.clone(), v.clone())));
        }

        if let Some(enabled) = self.security_enabled {
            spec.cluster.security_enabled = enabled;
        }
        if let Some(plugins) = &self.plugins {
            spec.cluster.plugins = plugins.clone();
        }
        if let Some(blob) = &self.custom_config {
            spec.cluster.custom_config = blob.clone();
        }
        if let Some(strategy) = self.update_strategy {
            spec.cluster.update_strategy = strategy;
        }
        if let Some(version) = &self.version {
            spec.cluster.version = version.clone();
        }

        Topology::from_spec(spec)
    }
}

/// A published topology together with its version
#[derive(Debug, Clone)]
pub struct VersionedTopology {
    pub version: u64,
    pub topology: Arc<Topology>,
}

/// Holds the single published topology
///
/// Readers take a cheap clone of the current `Arc`; writers replace it whole.
#[derive(Debug)]
pub struct TopologyStore {
    current: RwLock<VersionedTopology>,
}

impl TopologyStore {
    /// Create a store whose version 0 is `initial`
    pub fn new(initial: Topology) -> Self {
        Self {
            current: RwLock::new(VersionedTopology {
                version: 0,
                topology: Arc::new(initial),
            }),
        }
    }

    pub fn current(&self) -> VersionedTopology {
        self.current.read().clone()
    }

    /// Publish a new snapshot and return it with its assigned version
    pub fn publish(&self, topology: Topology) -> VersionedTopology {
        let mut current = self.current.write();
        let next = VersionedTopology {
            version: current.version + 1,
            topology: Arc::new(topology),
        };
        *current = next.clone();
        next
    }
}
