//! WorkSet reconciler: template-fingerprint claim lifecycle per instance
//!
//! For every pod instance the WorkSet selects, the controller provisions the
//! missing current-generation claims, prunes orphans and superseded claims
//! under the retention policy, and reports the converged view through the
//! status subresource. Every claim mutation goes through the expectation
//! ledger so a reconcile never re-issues work its own cache has not
//! confirmed yet.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        finalizer::{finalizer, Event as FinalizerEvent},
        reflector::ObjectRef,
        watcher,
        WatchStreamExt,
    },
    ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::claims::{
    classify_claims, instance_claims_changed, ClaimControl, CLAIM_KIND,
};
use crate::crd::{
    set_condition, Condition, WorkSet, WorkSetStatus, INSTANCE_ID_LABEL,
};
use crate::engine::{
    calculate_backoff, claim_owned, emit_event, employer_key, release_owned, selector_matches,
};
use crate::error::{Error, Result};
use crate::expectations::ExpectationLedger;

/// Finalizer protecting a WorkSet until its claims are dealt with.
pub const WORKSET_FINALIZER: &str = "workset.consist.dev/finalizer";

/// Pod label naming the owning WorkSet; used to map pod events to triggers.
pub const WORKSET_NAME_LABEL: &str = "workset.consist.dev/name";

const FIELD_MANAGER: &str = "consist-workset";

/// Shared state for the WorkSet controller.
pub struct WorkSetState {
    pub client: Client,
    pub ledger: Arc<ExpectationLedger>,
}

/// Main entry point to start the WorkSet controller.
pub async fn run_workset_controller(state: Arc<WorkSetState>) -> Result<()> {
    let client = state.client.clone();
    let worksets: Api<WorkSet> = Api::all(client.clone());

    info!("starting WorkSet controller");

    // Verify the CRD exists before watching it
    if let Err(e) = worksets.list(&ListParams::default().limit(1)).await {
        error!("WorkSet CRD not found, install it first: {:?}", e);
        return Err(Error::ConfigError("WorkSet CRD not installed".to_string()));
    }

    // Claim events are both triggers and the observations that satisfy
    // expectations, so the stream is tapped before it feeds the controller
    let ledger = state.ledger.clone();
    let claim_stream = watcher(
        Api::<PersistentVolumeClaim>::all(client.clone()),
        watcher::Config::default(),
    )
    .default_backoff()
    .inspect_ok(move |event| match event {
        watcher::Event::Apply(claim) | watcher::Event::InitApply(claim) => ledger.observe_applied(
            CLAIM_KIND,
            &claim.name_any(),
            claim.resource_version().as_deref(),
        ),
        watcher::Event::Delete(claim) => ledger.observe_deleted(CLAIM_KIND, &claim.name_any()),
        watcher::Event::Init | watcher::Event::InitDone => {}
    })
    .touched_objects();

    Controller::new(worksets, watcher::Config::default())
        .owns_stream(claim_stream)
        .watches(
            Api::<Pod>::all(client.clone()),
            watcher::Config::default(),
            pod_to_workset,
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, state)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled: {:?}", obj),
                Err(e) => warn!("reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

fn pod_to_workset(pod: Pod) -> Option<ObjectRef<WorkSet>> {
    let namespace = pod.namespace()?;
    let name = pod.labels().get(WORKSET_NAME_LABEL)?.clone();
    Some(ObjectRef::new(&name).within(&namespace))
}

/// The main reconciliation function for WorkSets.
#[instrument(skip(obj, ctx), fields(name = %obj.name_any(), namespace = obj.namespace()))]
async fn reconcile(obj: Arc<WorkSet>, ctx: Arc<WorkSetState>) -> Result<Action> {
    let owner = employer_key(obj.as_ref());

    // Do not act on a cache that lags our own claim mutations
    if !ctx.ledger.satisfied(&owner) {
        debug!(
            owner = %owner,
            pending = ctx.ledger.pending(&owner),
            "claim expectations unsatisfied; deferring"
        );
        return Ok(Action::requeue(Duration::from_secs(3)));
    }

    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<WorkSet> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, WORKSET_FINALIZER, obj, |event| async {
        match event {
            FinalizerEvent::Apply(ws) => apply_work_set(&ctx, &ws).await,
            FinalizerEvent::Cleanup(ws) => cleanup_work_set(&ctx, &ws).await,
        }
    })
    .await
    .map_err(Error::from)
}

/// Converge claims for every selected instance and write status back.
async fn apply_work_set(ctx: &WorkSetState, workset: &WorkSet) -> Result<Action> {
    let name = workset.name_any();
    let namespace = workset.namespace().unwrap_or_else(|| "default".to_string());

    if let Err(errors) = workset.spec.validate() {
        let message = errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        warn!("validation failed for {}/{}: {}", namespace, name, message);
        update_status(ctx, workset, |status| {
            set_condition(
                &mut status.conditions,
                Condition::ready(false, "InvalidSpec", &message),
            );
            status.message = Some(message.clone());
        })
        .await?;
        return Err(Error::ValidationError(message));
    }

    let control = ClaimControl::new(ctx.client.clone(), ctx.ledger.clone());
    let claims = control.list_claims(workset).await?;
    let claims = claim_owned(&ctx.client, workset, &workset.spec.selector, claims).await?;

    let pods = list_selected_pods(ctx, workset).await?;
    let templates = &workset.spec.volume_claim_templates;

    let mut provision_failures: Vec<String> = Vec::new();
    let mut current_claims = 0;
    let mut stale_claims = 0;
    let mut claims_changed = false;
    let mut instances = 0;

    for pod in &pods {
        let instance_id = match pod.labels().get(INSTANCE_ID_LABEL) {
            Some(id) => id.clone(),
            None => {
                debug!(pod = %pod.name_any(), "pod has no instance id label; skipping");
                continue;
            }
        };
        instances += 1;

        let outcome = control
            .ensure_instance_claims(workset, &instance_id, &claims)
            .await?;
        for (claim, reason) in &outcome.failed {
            provision_failures.push(format!("{}: {}", claim, reason));
        }

        control
            .prune_instance_claims(workset, &instance_id, &claims)
            .await?;

        let classification = classify_claims(templates, &instance_id, &claims)?;
        current_claims += (classification.current.len() + outcome.created.len()) as i32;
        stale_claims += classification.stale.len() as i32;
        claims_changed |= instance_claims_changed(templates, pod, &claims)?;
    }

    let provisioned = provision_failures.is_empty();
    update_status(ctx, workset, |status| {
        status.matched_instances = instances;
        status.current_claims = current_claims;
        status.stale_claims = stale_claims;
        status.observed_generation = workset.metadata.generation;
        status.message = None;
        if provisioned {
            set_condition(
                &mut status.conditions,
                Condition::new("ClaimsProvisioned", true, "AllClaimsExist", "every declared claim slot is provisioned"),
            );
        } else {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "ClaimsProvisioned",
                    false,
                    "ProvisioningFailed",
                    "one or more claim creates failed",
                ),
            );
        }
        if claims_changed {
            set_condition(
                &mut status.conditions,
                Condition::new(
                    "ClaimsUpToDate",
                    false,
                    "TemplateChanged",
                    "a mounted claim lags its template generation",
                ),
            );
        } else {
            set_condition(
                &mut status.conditions,
                Condition::new("ClaimsUpToDate", true, "TemplatesMatch", "all mounted claims are current"),
            );
        }
        set_condition(
            &mut status.conditions,
            Condition::ready(
                provisioned && !claims_changed,
                if provisioned { "Synced" } else { "ProvisioningFailed" },
                "claim state vs. declared templates",
            ),
        );
    })
    .await?;

    if !provisioned {
        let message = provision_failures.join("; ");
        emit_event(&ctx.client, workset, "Warning", "ClaimProvisioningFailed", &message)
            .await
            .unwrap_or_else(|e| warn!("failed to emit event: {:?}", e));
        // Failed creates stay in the classification; back off and retry
        return Ok(Action::requeue(calculate_backoff(1, None, None)));
    }

    let requeue = if claims_changed {
        // Replacement claims were just provisioned; check back soon
        Duration::from_secs(15)
    } else {
        Duration::from_secs(300)
    };
    Ok(Action::requeue(requeue))
}

/// Cleanup when the WorkSet is deleted: claims go or are orphaned according
/// to the retention policy.
async fn cleanup_work_set(ctx: &WorkSetState, workset: &WorkSet) -> Result<Action> {
    let name = workset.name_any();
    let namespace = workset.namespace().unwrap_or_else(|| "default".to_string());
    info!("cleaning up WorkSet {}/{}", namespace, name);

    let control = ClaimControl::new(ctx.client.clone(), ctx.ledger.clone());
    let claims = control.list_claims(workset).await?;

    match workset.spec.retention_policy {
        crate::crd::RetentionPolicy::Delete => {
            control.cleanup_claims(workset, &claims).await?;
        }
        crate::crd::RetentionPolicy::Retain => {
            // Orphan the claims so garbage collection leaves them alone
            release_owned(&ctx.client, workset, &claims).await?;
        }
    }

    ctx.ledger.forget(&employer_key(workset));
    info!("cleanup complete for WorkSet {}/{}", namespace, name);
    Ok(Action::await_change())
}

/// Pods the WorkSet's selector captures, with full matchExpressions
/// evaluation applied client-side on top of the label-filtered list.
async fn list_selected_pods(ctx: &WorkSetState, workset: &WorkSet) -> Result<Vec<Pod>> {
    let namespace = workset.namespace().unwrap_or_else(|| "default".to_string());
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);

    let match_labels = workset.spec.selector.match_labels.clone().unwrap_or_default();
    let params = if match_labels.is_empty() {
        ListParams::default()
    } else {
        let label_selector = match_labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        ListParams::default().labels(&label_selector)
    };

    let list = pods.list(&params).await?;
    let mut selected = Vec::new();
    for pod in list.items {
        if pod.metadata.deletion_timestamp.is_some() {
            continue;
        }
        let empty = BTreeMap::new();
        let labels = pod.metadata.labels.as_ref().unwrap_or(&empty);
        if selector_matches(&workset.spec.selector, labels)? {
            selected.push(pod);
        }
    }
    Ok(selected)
}

/// Patch the status subresource through a mutation closure.
async fn update_status<F>(ctx: &WorkSetState, workset: &WorkSet, mutate: F) -> Result<()>
where
    F: FnOnce(&mut WorkSetStatus),
{
    let namespace = workset.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<WorkSet> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut status = workset.status.clone().unwrap_or_default();
    mutate(&mut status);

    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &workset.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;
    Ok(())
}

/// Error policy: shorter retry for transient store errors.
fn error_policy(workset: Arc<WorkSet>, error: &Error, _ctx: Arc<WorkSetState>) -> Action {
    error!("reconciliation error for {}: {:?}", workset.name_any(), error);

    let retry_duration = if error.is_retriable() {
        Duration::from_secs(15)
    } else {
        Duration::from_secs(60)
    };
    Action::requeue(retry_duration)
}
