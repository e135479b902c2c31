//! Instance-identity locking
//!
//! Two records are kept per instance:
//!
//! - **targets**: every live plan step that intends to operate on the
//!   instance (pending or in progress). Recovery consults these so a planned
//!   operation always wins over an unplanned one, and node replacement uses
//!   them to detect conflicts.
//! - **lease**: the single operation currently running against the instance.
//!   At most one lease exists per instance at any time.

use crate::error::{OrchestratorError, Result};
use crate::node::InstanceId;
use crate::plan::{PlanId, PlanKind};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Target {
    plan_id: PlanId,
    kind: PlanKind,
    version: u64,
}

/// Holder of an instance lease
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseHolder {
    pub plan_id: PlanId,
    pub kind: PlanKind,
}

#[derive(Debug, Default)]
pub struct InstanceLocks {
    leases: Mutex<HashMap<InstanceId, LeaseHolder>>,
    targets: Mutex<HashMap<InstanceId, Vec<Target>>>,
    released: Notify,
}

impl InstanceLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plan step's intent to operate on `id`
    pub fn add_target(&self, id: &InstanceId, plan_id: PlanId, kind: PlanKind, version: u64) {
        let mut targets = self.targets.lock();
        let entry = targets.entry(id.clone()).or_default();
        if !entry.iter().any(|t| t.plan_id == plan_id) {
            entry.push(Target {
                plan_id,
                kind,
                version,
            });
        }
    }

    /// Register an intent only if no other plan targets or holds `id`
    pub fn claim_target(
        &self,
        id: &InstanceId,
        plan_id: PlanId,
        kind: PlanKind,
        version: u64,
    ) -> Result<()> {
        let leases = self.leases.lock();
        let mut targets = self.targets.lock();
        let owner = leases
            .get(id)
            .map(|h| h.plan_id)
            .filter(|owner| *owner != plan_id)
            .or_else(|| {
                targets
                    .get(id)
                    .and_then(|entry| entry.iter().find(|t| t.plan_id != plan_id))
                    .map(|t| t.plan_id)
            });
        if let Some(owner) = owner {
            return Err(OrchestratorError::ConflictingOperation {
                instance: id.to_string(),
                owner: owner.to_string(),
            });
        }
        targets.entry(id.clone()).or_default().push(Target {
            plan_id,
            kind,
            version,
        });
        Ok(())
    }

    pub fn release_target(&self, id: &InstanceId, plan_id: PlanId) {
        let mut targets = self.targets.lock();
        if let Some(entry) = targets.get_mut(id) {
            entry.retain(|t| t.plan_id != plan_id);
            if entry.is_empty() {
                targets.remove(id);
            }
        }
    }

    /// Deployment plan that intends to operate on `id`, if any
    pub fn deployment_owner(&self, id: &InstanceId) -> Option<PlanId> {
        self.targets.lock().get(id).and_then(|entry| {
            entry
                .iter()
                .find(|t| t.kind == PlanKind::Deployment)
                .map(|t| t.plan_id)
        })
    }

    /// Whether a deployment plan for topology `version` already covers `id`
    pub fn is_targeted_at_version(&self, id: &InstanceId, version: u64) -> bool {
        self.targets.lock().get(id).is_some_and(|entry| {
            entry
                .iter()
                .any(|t| t.kind == PlanKind::Deployment && t.version == version)
        })
    }

    pub fn lease_holder(&self, id: &InstanceId) -> Option<LeaseHolder> {
        self.leases.lock().get(id).copied()
    }

    /// Take the lease on `id` or fail with `ConflictingOperation`
    pub fn try_lease(
        self: &Arc<Self>,
        id: &InstanceId,
        plan_id: PlanId,
        kind: PlanKind,
    ) -> Result<InstanceLease> {
        let mut leases = self.leases.lock();
        if let Some(holder) = leases.get(id) {
            return Err(OrchestratorError::ConflictingOperation {
                instance: id.to_string(),
                owner: holder.plan_id.to_string(),
            });
        }
        leases.insert(id.clone(), LeaseHolder { plan_id, kind });
        Ok(InstanceLease {
            locks: Arc::clone(self),
            id: id.clone(),
            plan_id,
        })
    }

    /// Take the lease on `id`, waiting up to `wait` for the current holder
    pub async fn wait_lease(
        self: &Arc<Self>,
        id: &InstanceId,
        plan_id: PlanId,
        kind: PlanKind,
        wait: Duration,
    ) -> Result<InstanceLease> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_lease(id, plan_id, kind) {
                Ok(lease) => return Ok(lease),
                Err(e) => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(e);
                    }
                    debug!("Waiting for lease on {} held elsewhere", id);
                    let _ = tokio::time::timeout_at(deadline, notified).await;
                }
            }
        }
    }

    fn release_lease(&self, id: &InstanceId, plan_id: PlanId) {
        let mut leases = self.leases.lock();
        if leases.get(id).is_some_and(|h| h.plan_id == plan_id) {
            leases.remove(id);
        }
        drop(leases);
        self.released.notify_waiters();
    }
}

/// Exclusive right to operate on one instance; released on drop
#[derive(Debug)]
pub struct InstanceLease {
    locks: Arc<InstanceLocks>,
    id: InstanceId,
    plan_id: PlanId,
}

impl InstanceLease {
    pub fn instance(&self) -> &InstanceId {
        &self.id
    }
}

impl Drop for InstanceLease {
    fn drop(&mut self) {
        self.locks.release_lease(&self.id, self.plan_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Role;

    fn data0() -> InstanceId {
        InstanceId::new(Role::Data, 0)
    }

    #[test]
    fn test_lease_is_exclusive() {
        let locks = Arc::new(InstanceLocks::new());
        let a = PlanId::new();
        let b = PlanId::new();

        let lease = locks.try_lease(&data0(), a, PlanKind::Deployment).unwrap();
        let err = locks.try_lease(&data0(), b, PlanKind::Recovery).unwrap_err();
        assert!(matches!(err, OrchestratorError::ConflictingOperation { .. }));

        drop(lease);
        assert!(locks.lease_holder(&data0()).is_none());
        assert!(locks.try_lease(&data0(), b, PlanKind::Recovery).is_ok());
    }

    #[test]
    fn test_targets_track_owners() {
        let locks = InstanceLocks::new();
        let deploy = PlanId::new();

        locks.add_target(&data0(), deploy, PlanKind::Deployment, 3);
        assert_eq!(locks.deployment_owner(&data0()), Some(deploy));
        assert!(locks.is_targeted_at_version(&data0(), 3));
        assert!(!locks.is_targeted_at_version(&data0(), 4));

        locks.release_target(&data0(), deploy);
        assert_eq!(locks.deployment_owner(&data0()), None);
    }

    #[test]
    fn test_claim_target_rejects_other_owners() {
        let locks = Arc::new(InstanceLocks::new());
        let deploy = PlanId::new();
        let replace = PlanId::new();

        locks.add_target(&data0(), deploy, PlanKind::Deployment, 1);
        let err = locks
            .claim_target(&data0(), replace, PlanKind::Deployment, 1)
            .unwrap_err();
        assert_eq!(err.error_type(), "conflicting_operation");

        locks.release_target(&data0(), deploy);
        let lease = locks.try_lease(&data0(), deploy, PlanKind::Recovery).unwrap();
        assert!(locks
            .claim_target(&data0(), replace, PlanKind::Deployment, 1)
            .is_err());

        drop(lease);
        locks
            .claim_target(&data0(), replace, PlanKind::Deployment, 1)
            .unwrap();
        assert_eq!(locks.deployment_owner(&data0()), Some(replace));
    }

    #[tokio::test]
    async fn test_wait_lease_acquires_after_release() {
        let locks = Arc::new(InstanceLocks::new());
        let first = locks
            .try_lease(&data0(), PlanId::new(), PlanKind::Deployment)
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .wait_lease(
                        &data0(),
                        PlanId::new(),
                        PlanKind::Recovery,
                        Duration::from_secs(5),
                    )
                    .await
                    .map(|_| ())
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(first);
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_lease_times_out() {
        let locks = Arc::new(InstanceLocks::new());
        let _held = locks
            .try_lease(&data0(), PlanId::new(), PlanKind::Deployment)
            .unwrap();
        let result = locks
            .wait_lease(
                &data0(),
                PlanId::new(),
                PlanKind::Deployment,
                Duration::from_millis(30),
            )
            .await;
        assert!(matches!(
            result,
            Err(OrchestratorError::ConflictingOperation { .. })
        ));
    }
}
