//! Template-fingerprint claim lifecycle
//!
//! Every claim provisioned from a template carries three identity labels:
//! the instance slot it belongs to, the template name it was built from and
//! a fingerprint of the template spec at build time. A claim is current
//! while its fingerprint matches the live template of the same name; a
//! template edit strands the old claim as stale and a fresh current claim
//! is provisioned next to it. Stale claims are deleted only once their
//! replacement exists and the retention policy allows it; claims whose
//! template is no longer declared at all are deleted unconditionally.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod, Volume,
};
use kube::api::{Api, DeleteParams, ListParams, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::crd::{
    ClaimTemplate, RetentionPolicy, WorkSet, CLAIM_TEMPLATE_HASH_LABEL, CLAIM_TEMPLATE_NAME_LABEL,
    INSTANCE_ID_LABEL,
};
use crate::engine::{controller_owner_ref, employer_key};
use crate::error::Result;
use crate::expectations::ExpectationLedger;

/// Expectation kind recorded for claim mutations.
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Stable fingerprint of a claim template spec.
///
/// Hex-truncated SHA-256 over the canonical JSON of the spec; fits a label
/// value and changes iff the spec changes.
pub fn template_fingerprint(template: &ClaimTemplate) -> Result<String> {
    let canonical = serde_json::to_vec(&template.spec)?;
    let digest = Sha256::digest(&canonical);
    Ok(hex::encode(digest)[..16].to_string())
}

/// Fingerprints of every declared template, keyed by template name.
pub fn template_fingerprints(templates: &[ClaimTemplate]) -> Result<BTreeMap<String, String>> {
    templates
        .iter()
        .map(|t| Ok((t.name.clone(), template_fingerprint(t)?)))
        .collect()
}

/// Deterministic claim name for a (workset, template, instance, generation)
/// slot. Including the fingerprint keeps a stale claim and its current
/// replacement from colliding, and makes re-creation idempotent.
pub fn claim_name(workset_name: &str, template_name: &str, instance_id: &str, hash: &str) -> String {
    format!("{}-{}-{}-{}", workset_name, template_name, instance_id, &hash[..hash.len().min(8)])
}

/// One instance's claims, partitioned against the live template set.
#[derive(Clone, Debug, Default)]
pub struct ClaimClassification {
    /// Fingerprint matches the live template of the same name
    pub current: BTreeMap<String, PersistentVolumeClaim>,
    /// Declared template name, superseded fingerprint
    pub stale: BTreeMap<String, PersistentVolumeClaim>,
    /// Template name no longer declared; nothing claims these
    pub orphaned: Vec<PersistentVolumeClaim>,
}

/// Partition an instance's existing claims by template membership and
/// fingerprint match. Claims of other instances, deleting claims and claims
/// without identity labels are ignored.
pub fn classify_claims(
    templates: &[ClaimTemplate],
    instance_id: &str,
    existing: &[PersistentVolumeClaim],
) -> Result<ClaimClassification> {
    let live = template_fingerprints(templates)?;
    let mut classification = ClaimClassification::default();

    for claim in existing {
        if claim.meta().deletion_timestamp.is_some() {
            continue;
        }
        let labels = match claim.meta().labels.as_ref() {
            Some(labels) => labels,
            None => continue,
        };
        if labels.get(INSTANCE_ID_LABEL).map(String::as_str) != Some(instance_id) {
            continue;
        }
        let (template_name, hash) = match (
            labels.get(CLAIM_TEMPLATE_NAME_LABEL),
            labels.get(CLAIM_TEMPLATE_HASH_LABEL),
        ) {
            (Some(name), Some(hash)) => (name, hash),
            _ => continue,
        };

        match live.get(template_name) {
            None => classification.orphaned.push(claim.clone()),
            Some(live_hash) if live_hash == hash => {
                classification
                    .current
                    .insert(template_name.clone(), claim.clone());
            }
            Some(_) => {
                classification
                    .stale
                    .insert(template_name.clone(), claim.clone());
            }
        }
    }

    Ok(classification)
}

/// Stale and orphaned claims eligible for deletion this pass.
///
/// Orphans go unconditionally. A stale claim goes only when its current
/// replacement already exists and the policy is Delete; under Retain it is
/// kept forever.
pub fn claims_to_prune<'a>(
    policy: &RetentionPolicy,
    classification: &'a ClaimClassification,
) -> Vec<&'a PersistentVolumeClaim> {
    let mut doomed: Vec<&PersistentVolumeClaim> = classification.orphaned.iter().collect();
    if *policy == RetentionPolicy::Delete {
        for (template_name, stale) in &classification.stale {
            if classification.current.contains_key(template_name) {
                doomed.push(stale);
            }
        }
    }
    doomed
}

/// Build the claim a template declares for one instance.
///
/// The claim carries the owner's selector labels (so selector listing finds
/// it again), the three identity labels and a controller owner reference.
pub fn build_claim(
    workset: &WorkSet,
    template: &ClaimTemplate,
    instance_id: &str,
) -> Result<PersistentVolumeClaim> {
    let hash = template_fingerprint(template)?;

    let mut labels: BTreeMap<String, String> = workset
        .spec
        .selector
        .match_labels
        .clone()
        .unwrap_or_default();
    if let Some(extra) = &template.labels {
        labels.extend(extra.clone());
    }
    labels.insert(INSTANCE_ID_LABEL.to_string(), instance_id.to_string());
    labels.insert(CLAIM_TEMPLATE_NAME_LABEL.to_string(), template.name.clone());
    labels.insert(CLAIM_TEMPLATE_HASH_LABEL.to_string(), hash.clone());

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(&workset.name_any(), &template.name, instance_id, &hash)),
            namespace: workset.meta().namespace.clone(),
            labels: Some(labels),
            annotations: template.annotations.clone(),
            owner_references: Some(vec![controller_owner_ref(workset)?]),
            ..Default::default()
        },
        spec: Some(template.spec.clone()),
        status: None,
    })
}

/// Volume list for an instance's pod, one entry per declared template.
///
/// Prefers the current claim; falls back to the stale one while the
/// replacement is not provisioned yet, so a template edit never leaves the
/// pod without its mount in the meantime.
pub fn claim_volumes(
    templates: &[ClaimTemplate],
    classification: &ClaimClassification,
) -> Vec<Volume> {
    let mut volumes = Vec::new();
    for template in templates {
        let claim = classification
            .current
            .get(&template.name)
            .or_else(|| classification.stale.get(&template.name));
        if let Some(claim) = claim {
            volumes.push(Volume {
                name: template.name.clone(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim.name_any(),
                    read_only: Some(false),
                }),
                ..Default::default()
            });
        }
    }
    volumes
}

/// Whether any claim mounted by the pod lags the live template generation.
pub fn instance_claims_changed(
    templates: &[ClaimTemplate],
    pod: &Pod,
    existing: &[PersistentVolumeClaim],
) -> Result<bool> {
    let live = template_fingerprints(templates)?;
    let instance_id = match pod
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(INSTANCE_ID_LABEL))
    {
        Some(id) => id,
        None => return Ok(false),
    };

    let mut mounted_hash: BTreeMap<String, String> = BTreeMap::new();
    for claim in existing {
        let labels = match claim.meta().labels.as_ref() {
            Some(labels) => labels,
            None => continue,
        };
        if labels.get(INSTANCE_ID_LABEL) != Some(instance_id) {
            continue;
        }
        if let Some(hash) = labels.get(CLAIM_TEMPLATE_HASH_LABEL) {
            mounted_hash.insert(claim.name_any(), hash.clone());
        }
    }

    let volumes = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    for volume in volumes {
        let claim_ref = match &volume.persistent_volume_claim {
            Some(source) if !source.claim_name.is_empty() => source,
            _ => continue,
        };
        if live.get(&volume.name) != mounted_hash.get(&claim_ref.claim_name) {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Kube-backed claim provisioning and pruning, with every mutation recorded
/// in the expectation ledger on behalf of the owning WorkSet.
pub struct ClaimControl {
    client: Client,
    ledger: std::sync::Arc<ExpectationLedger>,
}

/// Per-instance provisioning outcome; failures never abort the batch.
#[derive(Clone, Debug, Default)]
pub struct ProvisionOutcome {
    pub created: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ClaimControl {
    pub fn new(client: Client, ledger: std::sync::Arc<ExpectationLedger>) -> Self {
        Self { client, ledger }
    }

    fn api(&self, workset: &WorkSet) -> Api<PersistentVolumeClaim> {
        let namespace = workset.meta().namespace.clone().unwrap_or_default();
        Api::namespaced(self.client.clone(), &namespace)
    }

    /// List the claims the WorkSet's selector captures, skipping any that
    /// are already on their way out.
    pub async fn list_claims(&self, workset: &WorkSet) -> Result<Vec<PersistentVolumeClaim>> {
        let match_labels = workset.spec.selector.match_labels.clone().unwrap_or_default();
        if match_labels.is_empty() {
            return Ok(Vec::new());
        }
        let label_selector = match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let params = ListParams::default().labels(&label_selector);
        let claims = self.api(workset).list(&params).await?;
        Ok(claims
            .items
            .into_iter()
            .filter(|c| c.meta().deletion_timestamp.is_none())
            .collect())
    }

    /// Provision the missing current claim for every declared template of
    /// one instance. Each create is independent; each success is recorded
    /// as a create expectation.
    pub async fn ensure_instance_claims(
        &self,
        workset: &WorkSet,
        instance_id: &str,
        existing: &[PersistentVolumeClaim],
    ) -> Result<ProvisionOutcome> {
        let owner = employer_key(workset);
        let classification =
            classify_claims(&workset.spec.volume_claim_templates, instance_id, existing)?;
        let api = self.api(workset);

        let mut outcome = ProvisionOutcome::default();
        for template in &workset.spec.volume_claim_templates {
            if classification.current.contains_key(&template.name) {
                continue;
            }
            let claim = build_claim(workset, template, instance_id)?;
            let name = claim.name_any();
            match api.create(&PostParams::default(), &claim).await {
                Ok(_) => {
                    self.ledger.expect_create(&owner, CLAIM_KIND, &name);
                    info!(instance = instance_id, claim = %name, "provisioned claim");
                    outcome.created.push(name);
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    // Someone (possibly an earlier pass whose expectation
                    // timed out) beat us to it; converged
                    debug!(claim = %name, "claim already exists");
                }
                Err(e) => {
                    warn!(instance = instance_id, claim = %name, "claim create failed: {:?}", e);
                    outcome.failed.push((name, e.to_string()));
                }
            }
        }
        Ok(outcome)
    }

    /// Delete orphaned claims and, under policy Delete, stale claims whose
    /// current replacement exists. Not-found is converged, not an error.
    pub async fn prune_instance_claims(
        &self,
        workset: &WorkSet,
        instance_id: &str,
        existing: &[PersistentVolumeClaim],
    ) -> Result<()> {
        let owner = employer_key(workset);
        let classification =
            classify_claims(&workset.spec.volume_claim_templates, instance_id, existing)?;
        let doomed = claims_to_prune(&workset.spec.retention_policy, &classification);
        let api = self.api(workset);

        for claim in doomed {
            let name = claim.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    self.ledger.expect_delete(&owner, CLAIM_KIND, &name);
                    info!(instance = instance_id, claim = %name, "deleted superseded claim");
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Employer-deletion cleanup: delete every owned claim under policy
    /// Delete; retain them all otherwise.
    pub async fn cleanup_claims(
        &self,
        workset: &WorkSet,
        existing: &[PersistentVolumeClaim],
    ) -> Result<()> {
        if workset.spec.retention_policy == RetentionPolicy::Retain {
            info!(workset = %workset.name_any(), "retention policy Retain; keeping claims");
            return Ok(());
        }
        let owner = employer_key(workset);
        let api = self.api(workset);
        for claim in existing {
            let name = claim.name_any();
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => {
                    self.ledger.expect_delete(&owner, CLAIM_KIND, &name);
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}
