//! Interfaces to external collaborators
//!
//! The engine never places processes, replicates data or talks to the
//! service itself. It calls into these traits and treats every call as a
//! suspension point bounded by a timeout.

use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::node::{InstanceId, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;

/// Where a (re)launched task may be placed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "host", rename_all = "snake_case")]
pub enum HostPreference {
    /// Keep the instance on its current host
    Same(String),
    /// Any host with capacity
    Any,
}

/// Everything the scheduler needs to launch one node task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub instance: InstanceId,
    pub config_hash: String,
    pub volume_id: String,
    pub host: HostPreference,
    pub user: String,
}

/// What the scheduler knows about an instance's task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskObservation {
    Running { task_id: TaskId, host: String },
    Failed,
    Unknown,
}

/// Replication health of the managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterHealth {
    Green,
    Yellow,
    Red,
}

impl ClusterHealth {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterHealth::Green => "green",
            ClusterHealth::Yellow => "yellow",
            ClusterHealth::Red => "red",
        }
    }
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Places and removes node tasks
#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Ask for a new task for the instance; returns its task identity
    async fn launch(&self, request: &LaunchRequest) -> Result<TaskId>;

    /// Kill the instance's current task, if any
    async fn decommission(&self, instance: &InstanceId) -> Result<()>;

    async fn observe(&self, instance: &InstanceId) -> Result<TaskObservation>;
}

/// Reports replication health of the managed service
#[async_trait]
pub trait HealthOracle: Send + Sync {
    async fn health(&self) -> Result<ClusterHealth>;
}

/// Service-level calls used by mode transitions
#[async_trait]
pub trait ClusterProtocol: Send + Sync {
    async fn rotate_credential(&self, user: &str, password: &str) -> Result<()>;

    async fn migrate_index(&self, name: &str) -> Result<()>;

    /// Indices the service reports as needing a format migration
    async fn pending_migrations(&self) -> Result<Vec<String>>;
}

/// Run one external call under a deadline; overrunning it is `ExternalTimeout`
pub(crate) async fn bounded<T, F>(call: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => {
            metrics::record_external_timeout(call);
            Err(OrchestratorError::ExternalTimeout(format!(
                "{} exceeded {}ms",
                call,
                timeout.as_millis()
            )))
        }
    }
}
