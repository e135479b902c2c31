//! Ensemble - Plan engine for multi-role search clusters
//!
//! Converges a cluster of master, data, ingest, coordinator and custom-role
//! nodes onto a declared topology, one observable step at a time.
//!
//! # Architecture
//!
//! - **Topology**: validated, versioned snapshots of role pools and cluster settings
//! - **Impact**: which roles must restart between two snapshots, including coupled roles
//! - **Plans**: phases of per-instance steps built from an impact, executed serial or parallel
//! - **Locks**: per-instance targets and leases keeping deployment and recovery apart
//! - **Recovery**: independent loop relaunching lost tasks, escalating to replacement
//! - **Replace**: moves one instance to another host while keeping its volume
//! - **Transitions**: ordered topology and service sub-steps (security enable, upgrades)
//!
//! # Key Operations
//!
//! - submit_topology / submit_with_strategy: publish a topology and start its plan
//! - plan_status / wait_for_plan / retry_step: observe and repair plans
//! - replace_node: move one instance off its host
//! - run_transition: drive a mode transition sequence
//! - cluster_health / recovery_plans: operator visibility

pub mod config;
pub mod error;
pub mod impact;
pub mod lease;
pub mod metrics;
pub mod node;
pub mod orchestrator;
pub mod plan;
pub mod recovery;
pub mod replace;
pub mod scheduler;
pub mod sim;
pub mod topology;
pub mod transition;

pub use config::{
    CouplingRule, ExecutionConfig, ImpactConfig, LoggingConfig, OrchestratorConfig,
    RecoveryConfig, ServiceConfig, TransitionConfig,
};
pub use error::{OrchestratorError, Result};
pub use impact::{CouplingTable, ImpactAnalyzer, RestartImpact, RestartReason, RoleImpact};
pub use lease::{InstanceLease, InstanceLocks, LeaseHolder};
pub use node::{InstanceId, NodeInstance, NodeInventory, TaskId};
pub use orchestrator::Orchestrator;
pub use plan::{
    Phase, PhaseReport, Plan, PlanBuilder, PlanEngine, PlanHandle, PlanId, PlanKind,
    PlanStatusReport, Status, Step, StepAction, StepReport,
};
pub use recovery::{
    RecoveryEvent, RecoveryManager, RecoveryOverrider, RecoveryState, RecoveryType,
};
pub use scheduler::{
    ClusterHealth, ClusterProtocol, HealthOracle, HostPreference, LaunchRequest, Scheduler,
    TaskObservation,
};
pub use sim::SimulatedCluster;
pub use topology::{
    ClusterSettings, Role, RolePool, Topology, TopologyDelta, TopologySpec, TopologyStore,
    UpdateStrategy, VersionedTopology,
};
pub use transition::{
    Credential, TopologyDriver, TransitionAction, TransitionController, TransitionReport,
    TransitionSequence, TransitionStep,
};
