//! Mode transitions
//!
//! A transition is a named, strictly ordered list of sub-steps. Each one is
//! either a topology delta, driven until its plan completes and the cluster
//! settles, or a call into the service (credential rotation, index
//! migration). The first failure stops the sequence. Nothing already done is
//! rolled back, since credential rotation in particular cannot be undone.

use crate::error::{OrchestratorError, Result};
use crate::metrics;
use crate::scheduler::{bounded, ClusterProtocol};
use crate::topology::{TopologyDelta, UpdateStrategy};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// A service user and the password to set for it
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user: String,
    pub password: String,
}

impl Credential {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: user.to_string(),
            password: password.to_string(),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransitionAction {
    /// Apply a delta to the current topology and wait for it to settle.
    /// `strategy` overrides the update strategy of the resulting plan only.
    Topology {
        delta: TopologyDelta,
        strategy: Option<UpdateStrategy>,
    },
    RotateCredential(Credential),
    /// Migrate the named indices; an empty list migrates whatever the
    /// service reports as pending
    MigrateIndices(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionStep {
    pub name: String,
    pub action: TransitionAction,
}

/// Named ordered sequence of sub-steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionSequence {
    pub name: String,
    pub steps: Vec<TransitionStep>,
}

impl TransitionSequence {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            steps: Vec::new(),
        }
    }

    pub fn then(mut self, name: &str, action: TransitionAction) -> Self {
        self.steps.push(TransitionStep {
            name: name.to_string(),
            action,
        });
        self
    }

    /// Enable security across all roles at once, then set every credential
    pub fn enable_security(credentials: &[Credential]) -> Self {
        let sequence = Self::new("enable-security").then(
            "enable-security",
            TransitionAction::Topology {
                delta: TopologyDelta::new().with_security(true),
                strategy: Some(UpdateStrategy::Parallel),
            },
        );
        credentials.iter().fold(sequence, |seq, credential| {
            seq.then(
                &format!("rotate-credential-{}", credential.user),
                TransitionAction::RotateCredential(credential.clone()),
            )
        })
    }

    pub fn disable_security() -> Self {
        Self::new("disable-security").then(
            "disable-security",
            TransitionAction::Topology {
                delta: TopologyDelta::new().with_security(false),
                strategy: Some(UpdateStrategy::Parallel),
            },
        )
    }

    /// Upgrade to `version` and end up with security enabled.
    ///
    /// The password is set explicitly first, since the new version refuses
    /// the old default. The upgrade itself runs with security off so the
    /// pending index migrations can be applied before security is enabled.
    pub fn upgrade_with_security(version: &str, credential: &Credential) -> Self {
        Self::new("upgrade-with-security")
            .then(
                "set-explicit-password",
                TransitionAction::RotateCredential(credential.clone()),
            )
            .then(
                "upgrade-security-disabled",
                TransitionAction::Topology {
                    delta: TopologyDelta::new()
                        .with_version(version)
                        .with_security(false),
                    strategy: Some(UpdateStrategy::Parallel),
                },
            )
            .then("migrate-indices", TransitionAction::MigrateIndices(Vec::new()))
            .then(
                "enable-security",
                TransitionAction::Topology {
                    delta: TopologyDelta::new().with_security(true),
                    strategy: Some(UpdateStrategy::Parallel),
                },
            )
    }
}

/// Drives topology sub-steps through the plan engine
#[async_trait]
pub trait TopologyDriver: Send + Sync {
    /// Wait until no recovery is in flight
    async fn quiesce(&self) -> Result<()>;

    /// Apply `delta` to the current topology and wait until the resulting
    /// plan is complete and the cluster has settled
    async fn drive(&self, delta: &TopologyDelta, strategy: Option<UpdateStrategy>) -> Result<()>;
}

/// Outcome of a sequence that ran to the end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionReport {
    pub sequence: String,
    pub completed: Vec<String>,
}

pub struct TransitionController {
    protocol: Arc<dyn ClusterProtocol>,
    call_timeout: Duration,
}

impl TransitionController {
    pub fn new(protocol: Arc<dyn ClusterProtocol>, call_timeout: Duration) -> Self {
        Self {
            protocol,
            call_timeout,
        }
    }

    /// Run every sub-step in order; the first failure aborts the sequence
    pub async fn run(
        &self,
        driver: &dyn TopologyDriver,
        sequence: &TransitionSequence,
    ) -> Result<TransitionReport> {
        let total = sequence.steps.len();
        let mut completed = Vec::with_capacity(total);

        info!("Starting transition '{}' ({} steps)", sequence.name, total);
        for (idx, step) in sequence.steps.iter().enumerate() {
            info!(
                "Transition '{}' step {}/{}: {}",
                sequence.name,
                idx + 1,
                total,
                step.name
            );

            let outcome = self.run_step(driver, &step.action).await;
            metrics::record_transition_step(&sequence.name, &step.name, outcome.is_ok());
            if let Err(e) = outcome {
                warn!(
                    "Transition '{}' aborted at step '{}': {}",
                    sequence.name, step.name, e
                );
                metrics::record_transition(&sequence.name, false);
                return Err(OrchestratorError::SequenceAborted {
                    sequence: sequence.name.clone(),
                    step: idx,
                    step_name: step.name.clone(),
                    completed,
                    reason: e.to_string(),
                });
            }
            completed.push(step.name.clone());
        }

        info!("Transition '{}' complete", sequence.name);
        metrics::record_transition(&sequence.name, true);
        Ok(TransitionReport {
            sequence: sequence.name.clone(),
            completed,
        })
    }

    async fn run_step(&self, driver: &dyn TopologyDriver, action: &TransitionAction) -> Result<()> {
        match action {
            TransitionAction::Topology { delta, strategy } => {
                driver.quiesce().await?;
                driver.drive(delta, *strategy).await
            }
            TransitionAction::RotateCredential(credential) => {
                bounded(
                    "rotate_credential",
                    self.call_timeout,
                    self.protocol
                        .rotate_credential(&credential.user, &credential.password),
                )
                .await
            }
            TransitionAction::MigrateIndices(indices) => {
                let indices = if indices.is_empty() {
                    bounded(
                        "pending_migrations",
                        self.call_timeout,
                        self.protocol.pending_migrations(),
                    )
                    .await?
                } else {
                    indices.clone()
                };
                for index in &indices {
                    info!("Migrating index {}", index);
                    bounded(
                        "migrate_index",
                        self.call_timeout,
                        self.protocol.migrate_index(index),
                    )
                    .await?;
                }
                Ok(())
            }
        }
    }
}
