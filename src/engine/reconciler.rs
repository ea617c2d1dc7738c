//! Generic reconcile loop driving any [`ReconcileAdapter`]
//!
//! Per trigger: consult the expectation ledger (abort and requeue while the
//! cache lags this controller's own writes), project expected and current
//! state through the adapter, diff, execute the batched mutations, maintain
//! lifecycle finalizers, and write status back. Convergence over time comes
//! from bounded-backoff requeueing, never in-process waiting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::{
    api::{Api, ListParams, Patch, PatchParams, PostParams},
    client::Client,
    runtime::{
        controller::{Action, Controller},
        reflector,
        watcher,
        WatchStreamExt,
    },
    Resource, ResourceExt,
};
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Error, Result};
use crate::expectations::ExpectationLedger;

use super::adapter::{employer_key, EmployeeStatus, ReconcileAdapter};
use super::diff::{diff_employees, diff_employers};
use super::executor::{self, SyncOutcome, EMPLOYEE_KIND};
use super::lifecycle::{
    self, clean_finalizer, lifecycle_finalizer, FinalizerOp, FinalizerPatch, LifecycleView,
    EXPECTED_FINALIZERS_ANNOTATION,
};

/// Requeue delay while expectations are outstanding.
const EXPECTATION_REQUEUE: Duration = Duration::from_secs(3);

/// Steady-state resync period once converged.
const CONVERGED_REQUEUE: Duration = Duration::from_secs(300);

/// Field manager used for engine-issued patches.
const FIELD_MANAGER: &str = "consist-engine";

/// Shared state for one running adapter controller.
pub struct EngineContext<A: ReconcileAdapter> {
    pub client: Client,
    pub adapter: A,
    pub ledger: Arc<ExpectationLedger>,
    retries: Mutex<HashMap<String, u32>>,
}

impl<A: ReconcileAdapter> EngineContext<A> {
    pub fn new(client: Client, adapter: A, ledger: Arc<ExpectationLedger>) -> Self {
        Self {
            client,
            adapter,
            ledger,
            retries: Mutex::new(HashMap::new()),
        }
    }

    fn bump_retry(&self, key: &str) -> u32 {
        let mut retries = self.retries.lock().expect("retry map poisoned");
        let attempt = retries.entry(key.to_string()).or_insert(0);
        let current = *attempt;
        *attempt = attempt.saturating_add(1);
        current
    }

    fn reset_retry(&self, key: &str) {
        self.retries.lock().expect("retry map poisoned").remove(key);
    }
}

/// Exponential backoff with a cap, for requeueing failed reconciles.
pub fn calculate_backoff(
    attempt: u32,
    base_delay_secs: Option<u64>,
    max_delay_secs: Option<u64>,
) -> Duration {
    let base = base_delay_secs.unwrap_or(15);
    let max = max_delay_secs.unwrap_or(300);

    let delay_secs = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay_secs.min(max))
}

/// Start the controller for one adapter and block until shutdown.
///
/// This is the generic registration entry point: any conforming adapter can
/// be handed to it, the engine never looks past the capability set.
pub async fn run_adapter<A>(
    client: Client,
    adapter: A,
    ledger: Arc<ExpectationLedger>,
) -> Result<()>
where
    A: ReconcileAdapter,
{
    let employer_api: Api<A::Employer> = Api::all(client.clone());
    let employer_kind = A::Employer::kind(&()).into_owned();

    info!(controller = adapter.controller_name(), kind = %employer_kind, "starting consist controller");

    // Fail fast when the employer kind is not served
    if let Err(e) = employer_api.list(&ListParams::default().limit(1)).await {
        error!(kind = %employer_kind, "employer resource not listable: {:?}", e);
        return Err(Error::ConfigError(format!(
            "{} is not served by this cluster",
            employer_kind
        )));
    }

    let concurrency = adapter.max_concurrent_reconciles() as u16;
    let employer_cfg = adapter.employer_watch_config();
    let employee_cfg = adapter.employee_watch_config();
    let ctx = Arc::new(EngineContext::new(client.clone(), adapter, ledger.clone()));

    let (reader, writer) = reflector::store::<A::Employer>();

    let tap_ledger = ledger.clone();
    let tap_kind = employer_kind.clone();
    let pred_ctx = ctx.clone();
    let employer_stream = watcher(employer_api, employer_cfg)
        .default_backoff()
        .inspect_ok(move |ev| tap_watch_event(&tap_ledger, &tap_kind, ev))
        .reflect(writer)
        .applied_objects()
        .filter(move |res| {
            let keep = match res {
                Ok(obj) => pred_ctx.adapter.employer_predicate(obj),
                Err(_) => true,
            };
            futures::future::ready(keep)
        });

    let tap_ledger = ledger.clone();
    let pod_stream = watcher(Api::<Pod>::all(client.clone()), employee_cfg)
        .default_backoff()
        .inspect_ok(move |ev| tap_watch_event(&tap_ledger, EMPLOYEE_KIND, ev))
        .touched_objects();

    let map_ctx = ctx.clone();
    Controller::for_stream(employer_stream, reader)
        .with_config(kube::runtime::controller::Config::default().concurrency(concurrency))
        .watches_stream(pod_stream, move |pod| {
            map_ctx.adapter.employee_to_employers(&pod)
        })
        .shutdown_on_signal()
        .run(reconcile::<A>, error_policy::<A>, ctx)
        .for_each(|res| async move {
            match res {
                Ok(obj) => debug!("reconciled: {:?}", obj),
                Err(e) => warn!("reconcile error: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Forward cache observations to the expectation ledger.
fn tap_watch_event<K>(ledger: &ExpectationLedger, kind: &str, event: &watcher::Event<K>)
where
    K: Resource,
{
    match event {
        watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
            ledger.observe_applied(kind, &obj.name_any(), obj.resource_version().as_deref());
        }
        watcher::Event::Delete(obj) => {
            ledger.observe_deleted(kind, &obj.name_any());
        }
        watcher::Event::Init | watcher::Event::InitDone => {}
    }
}

/// One reconcile invocation for one employer.
#[instrument(skip(employer, ctx), fields(name = %employer.name_any(), namespace = employer.namespace()))]
async fn reconcile<A>(employer: Arc<A::Employer>, ctx: Arc<EngineContext<A>>) -> Result<Action>
where
    A: ReconcileAdapter,
{
    let owner = employer_key(employer.as_ref());

    // Refuse to act on a cache that does not yet reflect our own writes
    if !ctx.ledger.satisfied(&owner) {
        debug!(
            owner = %owner,
            pending = ctx.ledger.pending(&owner),
            "expectations unsatisfied; deferring reconcile"
        );
        return Ok(Action::requeue(EXPECTATION_REQUEUE));
    }

    let deleting = employer.meta().deletion_timestamp.is_some();
    if !deleting {
        ensure_clean_finalizer(&ctx, employer.as_ref(), &owner).await?;
    }

    sync_employer_side(&ctx, employer.as_ref(), deleting).await?;

    let expected = if deleting {
        Vec::new()
    } else {
        ctx.adapter.expected_employee_status(employer.as_ref()).await?
    };
    let current = ctx.adapter.current_employee_status(employer.as_ref()).await?;
    let classification = diff_employees(&expected, &current)?;
    let converged = classification.is_converged();
    let unchanged = classification.unchanged.clone();

    let outcome =
        executor::sync_employees(&ctx.adapter, &ctx.ledger, employer.as_ref(), classification)
            .await?;

    maintain_lifecycle_finalizers(&ctx, employer.as_ref(), &owner, &unchanged, &outcome).await?;

    if outcome.has_failures() {
        let summary = outcome.failure_summary();
        emit_event(
            &ctx.client,
            employer.as_ref(),
            "Warning",
            "SyncIncomplete",
            &summary,
        )
        .await
        .unwrap_or_else(|e| warn!("failed to emit event: {:?}", e));

        let attempt = ctx.bump_retry(&owner);
        let delay = calculate_backoff(attempt, None, None);
        info!(owner = %owner, attempt, ?delay, "partial sync failure; requeueing with backoff");
        return Ok(Action::requeue(delay));
    }
    ctx.reset_retry(&owner);

    if deleting {
        return finish_cleanup(&ctx, employer.as_ref(), &owner).await;
    }

    if !converged {
        // Mutations issued this pass; come back quickly once the cache
        // confirms them
        return Ok(Action::requeue(EXPECTATION_REQUEUE));
    }
    Ok(Action::requeue(CONVERGED_REQUEUE))
}

/// Employer-side status sync (provisioned VIPs and the like). Adapters
/// without employer-side state return empty sets and this is a no-op.
async fn sync_employer_side<A>(
    ctx: &EngineContext<A>,
    employer: &A::Employer,
    deleting: bool,
) -> Result<()>
where
    A: ReconcileAdapter,
{
    let expected = if deleting {
        Vec::new()
    } else {
        ctx.adapter.expected_employer_status(employer).await?
    };
    let current = ctx.adapter.current_employer_status(employer).await?;
    if expected.is_empty() && current.is_empty() {
        return Ok(());
    }

    let classification = diff_employers(&expected, &current)?;
    let mut synced = classification.unchanged.clone();
    if !classification.to_create.is_empty() {
        synced.extend(
            ctx.adapter
                .create_employer(employer, classification.to_create)
                .await?,
        );
    }
    if !classification.to_update.is_empty() {
        synced.extend(
            ctx.adapter
                .update_employer(employer, classification.to_update)
                .await?,
        );
    }
    if !classification.to_delete.is_empty() {
        ctx.adapter
            .delete_employer(employer, classification.to_delete)
            .await?;
    }
    ctx.adapter.record_employer(employer, synced).await
}

/// Attach tokens to employees that became ready, detach from employees whose
/// drain completed this pass, and mirror the holder list on the employer.
async fn maintain_lifecycle_finalizers<A>(
    ctx: &EngineContext<A>,
    employer: &A::Employer,
    owner: &str,
    unchanged: &[EmployeeStatus<A::EmployeeExtra>],
    outcome: &SyncOutcome<A::EmployeeExtra>,
) -> Result<()>
where
    A: ReconcileAdapter,
{
    let employer_name = employer.name_any();
    let namespace = employer.meta().namespace.clone().unwrap_or_default();
    let token = lifecycle_finalizer(&employer_name);

    let mut holders = current_finalizer_holders(employer);

    // Selected and ready: unchanged employees plus this pass's successful
    // creates and updates
    let selected_ready = unchanged
        .iter()
        .chain(outcome.create.succeeded.iter().map(|s| &s.status))
        .chain(outcome.update.succeeded.iter().map(|s| &s.status))
        .filter(|s| s.lifecycle_ready);
    for status in selected_ready {
        let view = LifecycleView {
            selected: true,
            ready: true,
            finalized: false,
            deleting: false,
            drained: false,
        };
        if lifecycle::plan(&view) == Some(FinalizerOp::Attach) {
            let patch = lifecycle::apply_finalizer_op(
                &ctx.client,
                &namespace,
                &status.employee_name,
                &token,
                FinalizerOp::Attach,
            )
            .await?;
            if let FinalizerPatch::Patched(rv) = patch {
                ctx.ledger
                    .expect_update(owner, EMPLOYEE_KIND, &status.employee_name, rv.as_deref());
            }
            holders.insert(status.employee_name.clone());
        }
    }

    // Drained this pass: successful deletes (deregistered) and successful
    // updates that took the employee out of readiness (traffic off)
    let drained_deselected = outcome.delete.succeeded.iter().map(|s| (&s.status, false));
    let drained_unready = outcome
        .update
        .succeeded
        .iter()
        .filter(|s| !s.status.lifecycle_ready)
        .map(|s| (&s.status, true));
    for (status, selected) in drained_deselected.chain(drained_unready) {
        let view = LifecycleView {
            selected,
            ready: status.lifecycle_ready,
            finalized: true,
            deleting: false,
            drained: true,
        };
        if lifecycle::plan(&view) == Some(FinalizerOp::Detach) {
            let patch = lifecycle::apply_finalizer_op(
                &ctx.client,
                &namespace,
                &status.employee_name,
                &token,
                FinalizerOp::Detach,
            )
            .await?;
            if let FinalizerPatch::Patched(rv) = patch {
                ctx.ledger
                    .expect_update(owner, EMPLOYEE_KIND, &status.employee_name, rv.as_deref());
            }
            holders.remove(&status.employee_name);
        }
    }

    record_finalizer_holders(ctx, employer, owner, holders).await
}

fn current_finalizer_holders<K>(employer: &K) -> std::collections::BTreeSet<String>
where
    K: Resource,
{
    employer
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPECTED_FINALIZERS_ANNOTATION))
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

async fn record_finalizer_holders<A>(
    ctx: &EngineContext<A>,
    employer: &A::Employer,
    owner: &str,
    holders: std::collections::BTreeSet<String>,
) -> Result<()>
where
    A: ReconcileAdapter,
{
    let serialized = holders.into_iter().collect::<Vec<_>>().join(",");
    let existing = employer
        .meta()
        .annotations
        .as_ref()
        .and_then(|a| a.get(EXPECTED_FINALIZERS_ANNOTATION))
        .cloned()
        .unwrap_or_default();
    if serialized == existing {
        return Ok(());
    }

    let namespace = employer.meta().namespace.clone().unwrap_or_default();
    let api: Api<A::Employer> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({
        "metadata": {
            "annotations": { EXPECTED_FINALIZERS_ANNOTATION: serialized }
        }
    });
    let patched = api
        .patch(
            &employer.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    let kind = A::Employer::kind(&()).into_owned();
    ctx.ledger.expect_update(
        owner,
        &kind,
        &employer.name_any(),
        patched.resource_version().as_deref(),
    );
    Ok(())
}

/// Add the employer's clean finalizer so it cannot vanish while employees
/// are still registered.
async fn ensure_clean_finalizer<A>(
    ctx: &EngineContext<A>,
    employer: &A::Employer,
    owner: &str,
) -> Result<()>
where
    A: ReconcileAdapter,
{
    let token = clean_finalizer(&employer.name_any());
    if employer.finalizers().iter().any(|f| *f == token) {
        return Ok(());
    }

    let mut finalizers = employer.finalizers().to_vec();
    finalizers.push(token);
    let namespace = employer.meta().namespace.clone().unwrap_or_default();
    let api: Api<A::Employer> = Api::namespaced(ctx.client.clone(), &namespace);
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers,
            "resourceVersion": employer.resource_version(),
        }
    });
    let patched = api
        .patch(
            &employer.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
    let kind = A::Employer::kind(&()).into_owned();
    ctx.ledger.expect_update(
        owner,
        &kind,
        &employer.name_any(),
        patched.resource_version().as_deref(),
    );
    info!(owner = %owner, "added clean finalizer");
    Ok(())
}

/// Final stretch of employer deletion: once every employee has been
/// deregistered and released, drop the clean finalizer and let the cluster
/// finish the delete.
async fn finish_cleanup<A>(
    ctx: &EngineContext<A>,
    employer: &A::Employer,
    owner: &str,
) -> Result<Action>
where
    A: ReconcileAdapter,
{
    let remaining = ctx.adapter.current_employee_status(employer).await?;
    let holders = current_finalizer_holders(employer);
    if !remaining.is_empty() || !holders.is_empty() {
        debug!(
            owner = %owner,
            remaining = remaining.len(),
            holders = holders.len(),
            "cleanup still in progress"
        );
        return Ok(Action::requeue(EXPECTATION_REQUEUE));
    }

    let token = clean_finalizer(&employer.name_any());
    if employer.finalizers().iter().any(|f| *f == token) {
        let finalizers: Vec<String> = employer
            .finalizers()
            .iter()
            .filter(|f| **f != token)
            .cloned()
            .collect();
        let namespace = employer.meta().namespace.clone().unwrap_or_default();
        let api: Api<A::Employer> = Api::namespaced(ctx.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": employer.resource_version(),
            }
        });
        api.patch(
            &employer.name_any(),
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(&patch),
        )
        .await?;
        info!(owner = %owner, "removed clean finalizer");
    }

    // The employer is on its way out; nothing left to wait for
    ctx.ledger.forget(owner);
    Ok(Action::await_change())
}

/// Emit a Kubernetes Event attached to the employer.
pub async fn emit_event<K>(
    client: &Client,
    object: &K,
    event_type: &str,
    reason: &str,
    message: &str,
) -> Result<()>
where
    K: Resource<DynamicType = ()>,
{
    let namespace = object.meta().namespace.clone().unwrap_or_default();
    let events: Api<Event> = Api::namespaced(client.clone(), &namespace);

    let time = chrono::Utc::now();
    let event = Event {
        metadata: kube::api::ObjectMeta {
            generate_name: Some(format!("{}-event-", object.name_any())),
            ..Default::default()
        },
        type_: Some(event_type.to_string()),
        reason: Some(reason.to_string()),
        message: Some(message.to_string()),
        involved_object: object.object_ref(&()),
        first_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        last_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(time)),
        count: Some(1),
        ..Default::default()
    };

    events.create(&PostParams::default(), &event).await?;
    Ok(())
}

/// Error policy: transient store errors back off exponentially, everything
/// else waits the long interval before another attempt.
fn error_policy<A>(employer: Arc<A::Employer>, error: &Error, ctx: Arc<EngineContext<A>>) -> Action
where
    A: ReconcileAdapter,
{
    let owner = employer_key(employer.as_ref());
    error!(owner = %owner, "reconciliation error: {:?}", error);

    if error.is_retriable() {
        let attempt = ctx.bump_retry(&owner);
        Action::requeue(calculate_backoff(attempt, None, None))
    } else {
        Action::requeue(Duration::from_secs(60))
    }
}
