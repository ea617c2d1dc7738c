//! Shared types used by the WorkSet CRD and the consistency engine

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carried by every employer resource the engine is willing to manage.
/// Employers without `consist.dev/managed: "true"` are ignored.
pub const MANAGED_LABEL: &str = "consist.dev/managed";

/// Groups a claim (or pod) to a logical instance slot of its owner.
pub const INSTANCE_ID_LABEL: &str = "workset.consist.dev/instance-id";

/// Fingerprint of the claim template that produced a claim.
pub const CLAIM_TEMPLATE_HASH_LABEL: &str = "workset.consist.dev/claim-template-hash";

/// Name of the claim template that produced a claim.
pub const CLAIM_TEMPLATE_NAME_LABEL: &str = "workset.consist.dev/claim-template-name";

/// Claim retention policy for superseded or orphaned claims
///
/// Determines whether a stale claim is deleted once its current-generation
/// replacement exists, and whether owned claims are deleted when the owning
/// WorkSet is deleted.
///
/// # Variants
///
/// - `Delete` (default) - stale claims are removed once replaced; owned
///   claims are deleted with the WorkSet
/// - `Retain` - superseded claims persist for manual cleanup or data recovery
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Delete superseded claims once a replacement exists
    #[default]
    Delete,
    /// Keep superseded claims indefinitely
    Retain,
}

/// A named persistent volume claim template
///
/// Each template declares one claim slot per instance. The claim provisioned
/// from a template carries a fingerprint of the template spec, so a template
/// edit makes existing claims stale and triggers replacement provisioning.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTemplate {
    /// Template name; also the volume name the claim is mounted under
    pub name: String,

    /// Extra labels stamped onto provisioned claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    /// Extra annotations stamped onto provisioned claims
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,

    /// Claim spec (storage class, access modes, requested size)
    #[schemars(with = "serde_json::Value")]
    pub spec: PersistentVolumeClaimSpec,
}

/// Status condition following Kubernetes API conventions
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition (e.g., "Ready", "ClaimsProvisioned")
    #[serde(rename = "type")]
    pub type_: String,
    /// Status of the condition: "True", "False", or "Unknown"
    pub status: String,
    /// Last time the condition transitioned
    pub last_transition_time: String,
    /// Machine-readable reason for the condition
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// The .metadata.generation this condition was set from
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a Ready condition
    pub fn ready(status: bool, reason: &str, message: &str) -> Self {
        Self::new("Ready", status, reason, message)
    }

    pub fn new(type_: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        }
    }

    /// Set the observed generation for this condition
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }
}

/// Update or add a condition to a conditions list.
///
/// The transition time only moves when the status actually changes.
pub fn set_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        let status_changed = existing.status != condition.status;
        let previous_time = existing.last_transition_time.clone();
        *existing = condition;
        if !status_changed {
            existing.last_transition_time = previous_time;
        }
    } else {
        conditions.push(condition);
    }
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == "True")
        .unwrap_or(false)
}
