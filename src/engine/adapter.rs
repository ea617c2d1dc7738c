//! Reconciliation adapter contract
//!
//! A concrete controller plugs into the consistency engine by implementing
//! [`ReconcileAdapter`]: it names the employer resource kind, projects the
//! expected and current employee sets as typed status snapshots, and carries
//! out the batched mutations the engine asks for. The engine never looks
//! inside the adapter-defined extra status; it only compares it.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::core::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Condition type a pod may carry as a readiness gate for service traffic.
/// When present it gates lifecycle readiness; otherwise plain pod readiness
/// is used.
pub const SERVICE_READY_GATE: &str = "consist.dev/ServiceReady";

/// Value snapshot of one employee, compared structurally by the diff engine.
///
/// `extra` is the adapter-defined payload, resolved per adapter at compile
/// time. Equality for convergence purposes is `lifecycle_ready` plus `extra`;
/// identity is `employee_id`.
#[derive(Clone, Debug, PartialEq)]
pub struct EmployeeStatus<X> {
    /// Stable identity of the slot this employee fills
    pub employee_id: String,
    /// Name of the backing object (usually equals the id)
    pub employee_name: String,
    /// Whether the employee is ready to take traffic
    pub lifecycle_ready: bool,
    /// Adapter-defined status facets
    pub extra: X,
}

impl<X> EmployeeStatus<X> {
    pub fn matches(&self, other: &Self) -> bool
    where
        X: PartialEq,
    {
        self.lifecycle_ready == other.lifecycle_ready && self.extra == other.extra
    }
}

/// Value snapshot of employer-side state (e.g. a provisioned VIP).
#[derive(Clone, Debug, PartialEq)]
pub struct EmployerStatus<Y> {
    pub employer_id: String,
    pub extra: Y,
}

/// One successfully mutated employee, with the resource version the write
/// produced when the mutation landed on the employee object itself.
#[derive(Clone, Debug)]
pub struct SyncedItem<X> {
    pub status: EmployeeStatus<X>,
    pub resource_version: Option<String>,
}

/// One failed employee, with the reason kept for events and logs.
#[derive(Clone, Debug)]
pub struct FailedItem<X> {
    pub status: EmployeeStatus<X>,
    pub reason: String,
}

/// Outcome of one batched mutation; succeeded and failed are disjoint.
#[derive(Clone, Debug)]
pub struct BatchResult<X> {
    pub succeeded: Vec<SyncedItem<X>>,
    pub failed: Vec<FailedItem<X>>,
    /// Resource version of the employer after the batch, when the batch
    /// mutated the employer (registration-record style employees).
    pub employer_resource_version: Option<String>,
}

impl<X> Default for BatchResult<X> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            employer_resource_version: None,
        }
    }
}

impl<X> BatchResult<X> {
    /// Every item succeeded, none of them touching the employee objects.
    pub fn all_succeeded(items: Vec<EmployeeStatus<X>>) -> Self {
        Self {
            succeeded: items
                .into_iter()
                .map(|status| SyncedItem {
                    status,
                    resource_version: None,
                })
                .collect(),
            failed: Vec::new(),
            employer_resource_version: None,
        }
    }

    pub fn with_employer_version(mut self, resource_version: Option<String>) -> Self {
        self.employer_resource_version = resource_version;
        self
    }
}

/// Which object a batched employee mutation lands on. Registration-record
/// employees live on the employer (annotation, status list); real child
/// objects live on the employee itself. The executor records expectations
/// against the right object accordingly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationTarget {
    Employer,
    Employee,
}

/// The capability set a concrete controller supplies to the engine.
///
/// All batch operations must be idempotent under retry and must treat each
/// item independently: one failure may not abort the rest of the batch.
#[async_trait]
pub trait ReconcileAdapter: Send + Sync + 'static {
    /// The owning resource kind driving reconciliation.
    type Employer: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static;

    /// Adapter-defined employee status payload.
    type EmployeeExtra: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Adapter-defined employer status payload.
    type EmployerExtra: Clone + PartialEq + Debug + Send + Sync + 'static;

    /// Name used for the controller, finalizers and logs.
    fn controller_name(&self) -> &'static str;

    /// Restricts which employer objects trigger reconciliation.
    fn employer_predicate(&self, employer: &Self::Employer) -> bool;

    /// Maps a pod event to the employer(s) it should trigger.
    fn employee_to_employers(&self, pod: &Pod) -> Vec<kube::runtime::reflector::ObjectRef<Self::Employer>>;

    /// Upper bound on employers reconciled concurrently.
    fn max_concurrent_reconciles(&self) -> usize {
        5
    }

    /// Watch configuration for the employer kind (label filtering keeps the
    /// trigger volume down; the predicate refines it per object).
    fn employer_watch_config(&self) -> kube::runtime::watcher::Config {
        kube::runtime::watcher::Config::default()
    }

    /// Watch configuration for the employee (pod) kind.
    fn employee_watch_config(&self) -> kube::runtime::watcher::Config {
        kube::runtime::watcher::Config::default()
    }

    /// Where each mutation category lands, for expectation bookkeeping.
    fn create_target(&self) -> MutationTarget {
        MutationTarget::Employer
    }
    fn update_target(&self) -> MutationTarget {
        MutationTarget::Employee
    }
    fn delete_target(&self) -> MutationTarget {
        MutationTarget::Employer
    }

    // Employer-side state. Adapters without employer-side resources return
    // empty sets and the engine skips that half of the sync.

    async fn expected_employer_status(
        &self,
        employer: &Self::Employer,
    ) -> Result<Vec<EmployerStatus<Self::EmployerExtra>>>;

    async fn current_employer_status(
        &self,
        employer: &Self::Employer,
    ) -> Result<Vec<EmployerStatus<Self::EmployerExtra>>>;

    async fn create_employer(
        &self,
        employer: &Self::Employer,
        to_create: Vec<EmployerStatus<Self::EmployerExtra>>,
    ) -> Result<Vec<EmployerStatus<Self::EmployerExtra>>>;

    async fn update_employer(
        &self,
        employer: &Self::Employer,
        to_update: Vec<EmployerStatus<Self::EmployerExtra>>,
    ) -> Result<Vec<EmployerStatus<Self::EmployerExtra>>>;

    async fn delete_employer(
        &self,
        employer: &Self::Employer,
        to_delete: Vec<EmployerStatus<Self::EmployerExtra>>,
    ) -> Result<Vec<EmployerStatus<Self::EmployerExtra>>>;

    /// Record the synced employer view on its status surface.
    async fn record_employer(
        &self,
        employer: &Self::Employer,
        synced: Vec<EmployerStatus<Self::EmployerExtra>>,
    ) -> Result<()>;

    // Employee-side state.

    async fn expected_employee_status(
        &self,
        employer: &Self::Employer,
    ) -> Result<Vec<EmployeeStatus<Self::EmployeeExtra>>>;

    async fn current_employee_status(
        &self,
        employer: &Self::Employer,
    ) -> Result<Vec<EmployeeStatus<Self::EmployeeExtra>>>;

    async fn create_employees(
        &self,
        employer: &Self::Employer,
        to_create: Vec<EmployeeStatus<Self::EmployeeExtra>>,
    ) -> Result<BatchResult<Self::EmployeeExtra>>;

    async fn update_employees(
        &self,
        employer: &Self::Employer,
        to_update: Vec<EmployeeStatus<Self::EmployeeExtra>>,
    ) -> Result<BatchResult<Self::EmployeeExtra>>;

    async fn delete_employees(
        &self,
        employer: &Self::Employer,
        to_delete: Vec<EmployeeStatus<Self::EmployeeExtra>>,
    ) -> Result<BatchResult<Self::EmployeeExtra>>;
}

/// Owner ledger key for an employer: `namespace/name`.
pub fn employer_key<K>(employer: &K) -> String
where
    K: Resource<DynamicType = ()>,
{
    format!(
        "{}/{}",
        employer.meta().namespace.as_deref().unwrap_or("default"),
        employer.name_any()
    )
}

/// Lifecycle readiness of a pod: the service-ready readiness gate when the
/// pod declares one, otherwise the plain Ready condition.
pub fn pod_lifecycle_ready(pod: &Pod) -> bool {
    let has_gate = pod
        .spec
        .as_ref()
        .and_then(|s| s.readiness_gates.as_ref())
        .map(|gates| gates.iter().any(|g| g.condition_type == SERVICE_READY_GATE))
        .unwrap_or(false);

    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|c| c.as_slice())
        .unwrap_or(&[]);

    let condition_true = |type_: &str| {
        conditions
            .iter()
            .any(|c| c.type_ == type_ && c.status == "True")
    };

    if has_gate {
        condition_true("Ready") && condition_true(SERVICE_READY_GATE)
    } else {
        condition_true("Ready")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodReadinessGate, PodSpec, PodStatus};

    fn pod_with(conditions: Vec<(&str, &str)>, gate: bool) -> Pod {
        Pod {
            spec: Some(PodSpec {
                readiness_gates: gate.then(|| {
                    vec![PodReadinessGate {
                        condition_type: SERVICE_READY_GATE.to_string(),
                    }]
                }),
                ..Default::default()
            }),
            status: Some(PodStatus {
                conditions: Some(
                    conditions
                        .into_iter()
                        .map(|(t, s)| PodCondition {
                            type_: t.to_string(),
                            status: s.to_string(),
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_ready_without_gate() {
        assert!(pod_lifecycle_ready(&pod_with(vec![("Ready", "True")], false)));
        assert!(!pod_lifecycle_ready(&pod_with(vec![("Ready", "False")], false)));
    }

    #[test]
    fn test_gate_required_when_declared() {
        let ready_only = pod_with(vec![("Ready", "True")], true);
        assert!(!pod_lifecycle_ready(&ready_only));

        let both = pod_with(vec![("Ready", "True"), (SERVICE_READY_GATE, "True")], true);
        assert!(pod_lifecycle_ready(&both));

        let gate_false = pod_with(vec![("Ready", "True"), (SERVICE_READY_GATE, "False")], true);
        assert!(!pod_lifecycle_ready(&gate_false));
    }

    #[test]
    fn test_status_matches_ignores_identity() {
        let a = EmployeeStatus {
            employee_id: "p1".to_string(),
            employee_name: "p1".to_string(),
            lifecycle_ready: true,
            extra: 7,
        };
        let mut b = a.clone();
        b.employee_name = "other".to_string();
        assert!(a.matches(&b));

        b.extra = 8;
        assert!(!a.matches(&b));
    }
}
