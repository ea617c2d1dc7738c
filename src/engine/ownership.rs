//! Ownership manager: claims and releases candidate child objects
//!
//! Candidates are adjudicated against the owner's label selector and any
//! controller owner reference already present. A candidate owned by a
//! different controller is never touched; a candidate we own that no longer
//! matches the selector is released so another controller may adopt it.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::core::NamespaceResourceScope;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Error, Result};

/// What to do with one candidate object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OwnershipAction {
    /// Add our controller owner reference
    Adopt,
    /// Drop our controller owner reference
    Release,
    /// Already correctly owned, leave as is
    Keep,
    /// Not ours to manage (foreign controller, deleting, no match)
    Skip,
}

/// Evaluate a label selector against a label map.
///
/// Supports matchLabels and the four matchExpressions operators. An invalid
/// operator is a validation error, mirroring apimachinery behavior.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    if let Some(match_labels) = &selector.match_labels {
        for (key, value) in match_labels {
            if labels.get(key) != Some(value) {
                return Ok(false);
            }
        }
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let actual = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let matched = match expr.operator.as_str() {
                "In" => actual.map(|v| values.contains(v)).unwrap_or(false),
                "NotIn" => actual.map(|v| !values.contains(v)).unwrap_or(true),
                "Exists" => actual.is_some(),
                "DoesNotExist" => actual.is_none(),
                other => {
                    return Err(Error::ValidationError(format!(
                        "unknown selector operator {:?}",
                        other
                    )))
                }
            };
            if !matched {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Controller owner reference pointing at `owner`.
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    let uid = owner.meta().uid.clone().ok_or_else(|| {
        Error::AdapterContract("owner has no uid; cannot build owner reference".to_string())
    })?;
    Ok(OwnerReference {
        api_version: K::api_version(&()).into_owned(),
        kind: K::kind(&()).into_owned(),
        name: owner.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

fn controller_ref_of<C>(candidate: &C) -> Option<&OwnerReference>
where
    C: Resource,
{
    candidate
        .meta()
        .owner_references
        .as_ref()
        .and_then(|refs| refs.iter().find(|r| r.controller == Some(true)))
}

/// Decide what to do with a candidate, without mutating anything.
pub fn adjudicate<O, C>(owner: &O, selector: &LabelSelector, candidate: &C) -> Result<OwnershipAction>
where
    O: Resource<DynamicType = ()>,
    C: Resource,
{
    let owner_uid = owner.meta().uid.as_deref().unwrap_or_default();
    let owner_deleting = owner.meta().deletion_timestamp.is_some();
    let candidate_deleting = candidate.meta().deletion_timestamp.is_some();

    let empty = BTreeMap::new();
    let labels = candidate.meta().labels.as_ref().unwrap_or(&empty);
    let matches = selector_matches(selector, labels)?;

    match controller_ref_of(candidate) {
        Some(ctrl) if ctrl.uid == owner_uid => {
            if !matches {
                // Ours, but the selector no longer claims it
                Ok(OwnershipAction::Release)
            } else {
                Ok(OwnershipAction::Keep)
            }
        }
        // Another controller holds it; conflicting controllers never steal
        Some(_) => Ok(OwnershipAction::Skip),
        None => {
            if matches && !owner_deleting && !candidate_deleting {
                Ok(OwnershipAction::Adopt)
            } else {
                Ok(OwnershipAction::Skip)
            }
        }
    }
}

/// Adjudicate a candidate set and apply the resulting adoptions/releases.
/// Returns the candidates we own after the pass.
pub async fn claim_owned<O, C>(
    client: &Client,
    owner: &O,
    selector: &LabelSelector,
    candidates: Vec<C>,
) -> Result<Vec<C>>
where
    O: Resource<DynamicType = ()>,
    C: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let namespace = owner.meta().namespace.clone().unwrap_or_default();
    let api: Api<C> = Api::namespaced(client.clone(), &namespace);
    let owner_uid = owner.meta().uid.as_deref().unwrap_or_default();

    let mut owned = Vec::new();
    for candidate in candidates {
        match adjudicate(owner, selector, &candidate)? {
            OwnershipAction::Keep => owned.push(candidate),
            OwnershipAction::Adopt => {
                let mut refs = candidate.meta().owner_references.clone().unwrap_or_default();
                refs.push(controller_owner_ref(owner)?);
                let patched = patch_owner_refs(&api, &candidate, refs).await?;
                debug!(name = %candidate.name_any(), "adopted candidate");
                owned.push(patched);
            }
            OwnershipAction::Release => {
                let refs: Vec<OwnerReference> = candidate
                    .meta()
                    .owner_references
                    .clone()
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|r| r.uid != owner_uid)
                    .collect();
                patch_owner_refs(&api, &candidate, refs).await?;
                debug!(name = %candidate.name_any(), "released candidate");
            }
            OwnershipAction::Skip => {}
        }
    }
    Ok(owned)
}

/// Drop the owner's controller reference from every candidate, keeping the
/// objects themselves (retention-style orphaning).
pub async fn release_owned<O, C>(client: &Client, owner: &O, candidates: &[C]) -> Result<()>
where
    O: Resource<DynamicType = ()>,
    C: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let namespace = owner.meta().namespace.clone().unwrap_or_default();
    let api: Api<C> = Api::namespaced(client.clone(), &namespace);
    let owner_uid = owner.meta().uid.as_deref().unwrap_or_default();

    for candidate in candidates {
        let has_our_ref = candidate
            .meta()
            .owner_references
            .as_ref()
            .map(|refs| refs.iter().any(|r| r.uid == owner_uid))
            .unwrap_or(false);
        if !has_our_ref {
            continue;
        }
        let refs: Vec<OwnerReference> = candidate
            .meta()
            .owner_references
            .clone()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| r.uid != owner_uid)
            .collect();
        patch_owner_refs(&api, candidate, refs).await?;
        debug!(name = %candidate.name_any(), "released candidate");
    }
    Ok(())
}

async fn patch_owner_refs<C>(api: &Api<C>, candidate: &C, refs: Vec<OwnerReference>) -> Result<C>
where
    C: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "ownerReferences": refs,
            "resourceVersion": candidate.resource_version(),
        }
    });
    Ok(api
        .patch(&candidate.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Service};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelectorRequirement, Time};
    use kube::api::ObjectMeta;

    fn owner(uid: &str) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("owner".to_string()),
                namespace: Some("default".to_string()),
                uid: Some(uid.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn candidate(labels: &[(&str, &str)], controller_uid: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("pvc".to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                owner_references: controller_uid.map(|uid| {
                    vec![OwnerReference {
                        uid: uid.to_string(),
                        controller: Some(true),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn selector(key: &str, value: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some([(key.to_string(), value.to_string())].into()),
            match_expressions: None,
        }
    }

    #[test]
    fn test_match_labels() {
        let sel = selector("app", "db");
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), "db".to_string());
        assert!(selector_matches(&sel, &labels).unwrap());

        labels.insert("app".to_string(), "web".to_string());
        assert!(!selector_matches(&sel, &labels).unwrap());
    }

    #[test]
    fn test_match_expressions() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "tier".to_string(),
                    operator: "In".to_string(),
                    values: Some(vec!["gold".to_string(), "silver".to_string()]),
                },
                LabelSelectorRequirement {
                    key: "legacy".to_string(),
                    operator: "DoesNotExist".to_string(),
                    values: None,
                },
            ]),
        };
        let mut labels = BTreeMap::new();
        labels.insert("tier".to_string(), "gold".to_string());
        assert!(selector_matches(&sel, &labels).unwrap());

        labels.insert("legacy".to_string(), "1".to_string());
        assert!(!selector_matches(&sel, &labels).unwrap());
    }

    #[test]
    fn test_unknown_operator_rejected() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "k".to_string(),
                operator: "Near".to_string(),
                values: None,
            }]),
        };
        assert!(selector_matches(&sel, &BTreeMap::new()).is_err());
    }

    #[test]
    fn test_adopt_unowned_matching_candidate() {
        let o = owner("uid-1");
        let c = candidate(&[("app", "db")], None);
        let action = adjudicate(&o, &selector("app", "db"), &c).unwrap();
        assert_eq!(action, OwnershipAction::Adopt);
    }

    #[test]
    fn test_keep_owned_matching_candidate() {
        let o = owner("uid-1");
        let c = candidate(&[("app", "db")], Some("uid-1"));
        let action = adjudicate(&o, &selector("app", "db"), &c).unwrap();
        assert_eq!(action, OwnershipAction::Keep);
    }

    #[test]
    fn test_release_owned_non_matching_candidate() {
        let o = owner("uid-1");
        let c = candidate(&[("app", "web")], Some("uid-1"));
        let action = adjudicate(&o, &selector("app", "db"), &c).unwrap();
        assert_eq!(action, OwnershipAction::Release);
    }

    #[test]
    fn test_never_steal_from_foreign_controller() {
        let o = owner("uid-1");
        let c = candidate(&[("app", "db")], Some("uid-2"));
        let action = adjudicate(&o, &selector("app", "db"), &c).unwrap();
        assert_eq!(action, OwnershipAction::Skip);
    }

    #[test]
    fn test_no_adoption_while_owner_deleting() {
        let mut o = owner("uid-1");
        o.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let c = candidate(&[("app", "db")], None);
        let action = adjudicate(&o, &selector("app", "db"), &c).unwrap();
        assert_eq!(action, OwnershipAction::Skip);
    }

    #[test]
    fn test_owner_ref_requires_uid() {
        let o = Service::default();
        assert!(controller_owner_ref(&o).is_err());

        let o = owner("uid-1");
        let r = controller_owner_ref(&o).unwrap();
        assert_eq!(r.kind, "Service");
        assert_eq!(r.controller, Some(true));
    }
}
