//! Serde and validation tests for the WorkSet CRD

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, VolumeResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use super::types::{set_condition, ClaimTemplate, Condition, RetentionPolicy};
use super::work_set::WorkSetSpec;

fn claim_template(name: &str, size: &str) -> ClaimTemplate {
    let mut requests = BTreeMap::new();
    requests.insert("storage".to_string(), Quantity(size.to_string()));
    ClaimTemplate {
        name: name.to_string(),
        labels: None,
        annotations: None,
        spec: PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(requests),
                ..Default::default()
            }),
            storage_class_name: Some("standard".to_string()),
            ..Default::default()
        },
    }
}

fn valid_spec() -> WorkSetSpec {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "db".to_string());
    WorkSetSpec {
        selector: LabelSelector {
            match_labels: Some(labels),
            match_expressions: None,
        },
        volume_claim_templates: vec![claim_template("data", "10Gi")],
        retention_policy: RetentionPolicy::default(),
    }
}

#[test]
fn test_valid_spec_passes() {
    assert!(valid_spec().validate().is_ok());
}

#[test]
fn test_empty_selector_rejected() {
    let mut spec = valid_spec();
    spec.selector = LabelSelector::default();
    let errors = spec.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.field == "spec.selector"));
}

#[test]
fn test_duplicate_template_names_rejected() {
    let mut spec = valid_spec();
    spec.volume_claim_templates.push(claim_template("data", "20Gi"));
    let errors = spec.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.message.contains("duplicate")));
}

#[test]
fn test_template_name_must_be_dns_label() {
    let mut spec = valid_spec();
    spec.volume_claim_templates[0].name = "Data_Volume".to_string();
    assert!(spec.validate().is_err());
}

#[test]
fn test_template_without_storage_request_rejected() {
    let mut spec = valid_spec();
    spec.volume_claim_templates[0].spec.resources = None;
    let errors = spec.validate().unwrap_err();
    assert!(errors.iter().any(|e| e.field.contains("resources")));
}

#[test]
fn test_retention_policy_defaults_to_delete() {
    assert_eq!(RetentionPolicy::default(), RetentionPolicy::Delete);
}

#[test]
fn test_retention_policy_serde_round_trip() {
    let json = serde_json::to_string(&RetentionPolicy::Retain).unwrap();
    assert_eq!(json, "\"Retain\"");
    let parsed: RetentionPolicy = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed, RetentionPolicy::Retain);
}

#[test]
fn test_spec_serde_camel_case() {
    let spec = valid_spec();
    let value = serde_json::to_value(&spec).unwrap();
    assert!(value.get("volumeClaimTemplates").is_some());
    assert!(value.get("retentionPolicy").is_some());
}

#[test]
fn test_set_condition_updates_in_place() {
    let mut conditions = vec![Condition::ready(false, "ClaimsMissing", "provisioning")];
    let old_time = conditions[0].last_transition_time.clone();

    set_condition(
        &mut conditions,
        Condition::ready(true, "ClaimsSynced", "all claims current"),
    );
    assert_eq!(conditions.len(), 1);
    assert_eq!(conditions[0].status, "True");

    // Same status again: transition time must not move
    let time_after_flip = conditions[0].last_transition_time.clone();
    set_condition(
        &mut conditions,
        Condition::ready(true, "ClaimsSynced", "all claims current"),
    );
    assert_eq!(conditions[0].last_transition_time, time_after_flip);
    assert_ne!(old_time, "");
}
