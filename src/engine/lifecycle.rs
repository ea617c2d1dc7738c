//! Lifecycle gate: finalizer-token protocol for employees
//!
//! A ready employee carries an employer-scoped finalizer so the cluster
//! cannot physically remove it while it may still be receiving traffic.
//! Removal therefore passes through a deregistration step: the drain side
//! effect (traffic off, backend deregistered) must complete before the
//! token comes off. The transition planner is pure; applying a planned op
//! is a structured patch of the finalizer list, never string templating.

use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tracing::debug;

use crate::error::Result;

/// Prefix of the per-employer lifecycle finalizer attached to employees.
pub const LIFECYCLE_FINALIZER_PREFIX: &str = "prot.consist.dev/";

/// Prefix of the clean finalizer attached to the employer itself, holding
/// employer deletion until every employee has been released.
pub const CLEAN_FINALIZER_PREFIX: &str = "consist.dev/clean-";

/// Employer annotation mirroring the employees that currently carry the
/// lifecycle finalizer.
pub const EXPECTED_FINALIZERS_ANNOTATION: &str = "consist.dev/expected-finalizers-added";

/// Lifecycle finalizer token for employees of the named employer.
pub fn lifecycle_finalizer(employer_name: &str) -> String {
    format!("{}{}", LIFECYCLE_FINALIZER_PREFIX, employer_name)
}

/// Clean finalizer token for the named employer.
pub fn clean_finalizer(employer_name: &str) -> String {
    format!("{}{}", CLEAN_FINALIZER_PREFIX, employer_name)
}

/// Where an employee stands in the traffic-safety protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Known to the controller, not yet carrying the token
    Registered,
    /// Ready and protected: eligible for traffic
    Ready,
    /// Marked for removal; waiting for the drain side effect
    Deregistering,
    /// Token removed, physical deletion permitted
    Released,
}

/// Everything the planner needs to know about one employee.
#[derive(Clone, Copy, Debug, Default)]
pub struct LifecycleView {
    /// Employee is in the desired set
    pub selected: bool,
    /// Readiness signal is true
    pub ready: bool,
    /// Lifecycle finalizer currently present on the object
    pub finalized: bool,
    /// Object has a deletion timestamp
    pub deleting: bool,
    /// Drain side effect has completed (employee deregistered / traffic off)
    pub drained: bool,
}

/// Finalizer operation the gate wants applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FinalizerOp {
    Attach,
    Detach,
}

/// Current state of an employee under the protocol.
pub fn state_of(view: &LifecycleView) -> LifecycleState {
    if view.finalized {
        if view.selected && view.ready && !view.deleting {
            LifecycleState::Ready
        } else {
            LifecycleState::Deregistering
        }
    } else if view.selected && !view.drained {
        LifecycleState::Registered
    } else {
        LifecycleState::Released
    }
}

/// Decide the next finalizer operation, if any.
///
/// Attach only for selected, ready, live employees. Detach only once the
/// drain has completed, so physical deletion can never precede it.
pub fn plan(view: &LifecycleView) -> Option<FinalizerOp> {
    match state_of(view) {
        LifecycleState::Registered => {
            (view.ready && !view.deleting).then_some(FinalizerOp::Attach)
        }
        LifecycleState::Ready => None,
        LifecycleState::Deregistering => view.drained.then_some(FinalizerOp::Detach),
        LifecycleState::Released => None,
    }
}

/// Result of applying a finalizer operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinalizerPatch {
    /// Pod no longer exists; nothing gates its deletion
    Missing,
    /// Token was already in the desired state
    Unchanged,
    /// List was patched; carries the new resource version
    Patched(Option<String>),
}

/// Apply a planned finalizer operation to a pod.
///
/// Reads the live finalizer list and patches the full list back, guarded by
/// the read resource version; a missing pod is treated as already released.
pub async fn apply_finalizer_op(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    token: &str,
    op: FinalizerOp,
) -> Result<FinalizerPatch> {
    let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = match api.get(pod_name).await {
        Ok(pod) => pod,
        Err(kube::Error::Api(ae)) if ae.code == 404 => return Ok(FinalizerPatch::Missing),
        Err(e) => return Err(e.into()),
    };

    let mut finalizers: Vec<String> = pod.finalizers().to_vec();
    let changed = match op {
        FinalizerOp::Attach => {
            if finalizers.iter().any(|f| f == token) {
                false
            } else {
                finalizers.push(token.to_string());
                true
            }
        }
        FinalizerOp::Detach => {
            let before = finalizers.len();
            finalizers.retain(|f| f != token);
            finalizers.len() != before
        }
    };
    if !changed {
        return Ok(FinalizerPatch::Unchanged);
    }

    debug!(pod = pod_name, ?op, token, "patching lifecycle finalizer");
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": pod.resource_version(),
        }
    });
    let patched = api
        .patch(pod_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(FinalizerPatch::Patched(patched.resource_version()))
}
