//! WorkSet Custom Resource Definition
//!
//! A WorkSet owns the persistent volume claims of a group of pod instances
//! selected by label. Claims are provisioned from named templates and kept
//! in step with the template generation via a content fingerprint.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ClaimTemplate, Condition, RetentionPolicy};

/// Structured validation error for `WorkSetSpec`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SpecValidationError {
    pub field: String,
    pub message: String,
}

impl SpecValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for SpecValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "consist.dev",
    version = "v1alpha1",
    kind = "WorkSet",
    namespaced,
    status = "WorkSetStatus",
    shortname = "ws",
    printcolumn = r#"{"name":"Instances","type":"integer","jsonPath":".status.matchedInstances"}"#,
    printcolumn = r#"{"name":"Current","type":"integer","jsonPath":".status.currentClaims"}"#,
    printcolumn = r#"{"name":"Stale","type":"integer","jsonPath":".status.staleClaims"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkSetSpec {
    /// Selects the pods (and their claims) this WorkSet manages
    #[schemars(with = "serde_json::Value")]
    pub selector: LabelSelector,

    /// One claim slot per template per instance
    #[serde(default)]
    pub volume_claim_templates: Vec<ClaimTemplate>,

    /// What happens to superseded claims, and to owned claims when the
    /// WorkSet is deleted
    #[serde(default)]
    pub retention_policy: RetentionPolicy,
}

impl WorkSetSpec {
    /// Validate the spec before reconciling it.
    ///
    /// # Errors
    ///
    /// Returns every violation found, not just the first.
    pub fn validate(&self) -> Result<(), Vec<SpecValidationError>> {
        let mut errors = Vec::new();

        let has_match_labels = self
            .selector
            .match_labels
            .as_ref()
            .map(|m| !m.is_empty())
            .unwrap_or(false);
        let has_match_expressions = self
            .selector
            .match_expressions
            .as_ref()
            .map(|e| !e.is_empty())
            .unwrap_or(false);
        if !has_match_labels && !has_match_expressions {
            errors.push(SpecValidationError::new(
                "spec.selector",
                "selector must match at least one label or expression; an empty selector would claim every pod in the namespace",
            ));
        }

        let mut seen = BTreeMap::new();
        for (i, template) in self.volume_claim_templates.iter().enumerate() {
            let field = format!("spec.volumeClaimTemplates[{}]", i);
            if template.name.is_empty() {
                errors.push(SpecValidationError::new(&field, "template name must not be empty"));
            } else if !is_dns1123_label(&template.name) {
                errors.push(SpecValidationError::new(
                    &field,
                    "template name must be a lowercase DNS-1123 label",
                ));
            }
            if let Some(previous) = seen.insert(template.name.clone(), i) {
                errors.push(SpecValidationError::new(
                    &field,
                    format!("duplicate template name (already used at index {})", previous),
                ));
            }
            if template.spec.resources.is_none() {
                errors.push(SpecValidationError::new(
                    format!("{}.spec.resources", field),
                    "claim template must request storage",
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn is_dns1123_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkSetStatus {
    /// Number of pod instances currently selected
    #[serde(default)]
    pub matched_instances: i32,

    /// Claims whose fingerprint matches the live template generation
    #[serde(default)]
    pub current_claims: i32,

    /// Claims superseded by a template edit but not (yet) deleted
    #[serde(default)]
    pub stale_claims: i32,

    /// Generation last acted upon
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}
