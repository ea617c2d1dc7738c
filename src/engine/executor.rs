//! Sync executor: turns a classification into batched mutations
//!
//! Each category (create, update, delete) is issued as one adapter batch;
//! items within a batch are independent and a failed item never aborts the
//! rest. Every issued mutation is recorded with the expectation ledger so
//! the next reconcile refuses to act on a cache that does not yet reflect
//! this one's writes. Failures are not retried here: they surface in the
//! outcome and the reconcile loop requeues with backoff.

use kube::Resource;
use tracing::{debug, warn};

use crate::error::Result;
use crate::expectations::ExpectationLedger;

use super::adapter::{
    employer_key, BatchResult, MutationTarget, ReconcileAdapter,
};
use super::diff::EmployeeClassification;

/// Kind string recorded for employee-object expectations; the engine's
/// employee watch stream feeds observations under the same kind.
pub const EMPLOYEE_KIND: &str = "Pod";

/// Per-category outcome of one employee sync pass.
#[derive(Clone, Debug)]
pub struct SyncOutcome<X> {
    pub create: BatchResult<X>,
    pub update: BatchResult<X>,
    pub delete: BatchResult<X>,
}

impl<X> Default for SyncOutcome<X> {
    fn default() -> Self {
        Self {
            create: BatchResult::default(),
            update: BatchResult::default(),
            delete: BatchResult::default(),
        }
    }
}

impl<X> SyncOutcome<X> {
    pub fn failed_count(&self) -> usize {
        self.create.failed.len() + self.update.failed.len() + self.delete.failed.len()
    }

    pub fn has_failures(&self) -> bool {
        self.failed_count() > 0
    }

    /// Human-readable summary of what went wrong, for events.
    pub fn failure_summary(&self) -> String {
        let mut parts = Vec::new();
        for (category, batch) in [
            ("create", &self.create),
            ("update", &self.update),
            ("delete", &self.delete),
        ] {
            for failed in &batch.failed {
                parts.push(format!(
                    "{} {}: {}",
                    category, failed.status.employee_name, failed.reason
                ));
            }
        }
        parts.join("; ")
    }
}

/// Issue the mutations a classification calls for and record an expectation
/// for every one that succeeded.
pub async fn sync_employees<A>(
    adapter: &A,
    ledger: &ExpectationLedger,
    employer: &A::Employer,
    classification: EmployeeClassification<A::EmployeeExtra>,
) -> Result<SyncOutcome<A::EmployeeExtra>>
where
    A: ReconcileAdapter,
{
    let owner = employer_key(employer);
    let mut outcome = SyncOutcome::default();

    if !classification.to_create.is_empty() {
        debug!(owner = %owner, count = classification.to_create.len(), "creating employees");
        outcome.create = adapter.create_employees(employer, classification.to_create).await?;
        record_batch::<A>(
            ledger,
            &owner,
            employer,
            adapter.create_target(),
            BatchAction::Create,
            &outcome.create,
        );
    }

    if !classification.to_update.is_empty() {
        debug!(owner = %owner, count = classification.to_update.len(), "updating employees");
        outcome.update = adapter.update_employees(employer, classification.to_update).await?;
        record_batch::<A>(
            ledger,
            &owner,
            employer,
            adapter.update_target(),
            BatchAction::Update,
            &outcome.update,
        );
    }

    if !classification.to_delete.is_empty() {
        debug!(owner = %owner, count = classification.to_delete.len(), "deleting employees");
        outcome.delete = adapter.delete_employees(employer, classification.to_delete).await?;
        record_batch::<A>(
            ledger,
            &owner,
            employer,
            adapter.delete_target(),
            BatchAction::Delete,
            &outcome.delete,
        );
    }

    if outcome.has_failures() {
        warn!(owner = %owner, failed = outcome.failed_count(), "employee sync finished with failures");
    }

    Ok(outcome)
}

#[derive(Clone, Copy, Debug)]
enum BatchAction {
    Create,
    Update,
    Delete,
}

fn record_batch<A>(
    ledger: &ExpectationLedger,
    owner: &str,
    employer: &A::Employer,
    target: MutationTarget,
    action: BatchAction,
    batch: &BatchResult<A::EmployeeExtra>,
) where
    A: ReconcileAdapter,
{
    if batch.succeeded.is_empty() {
        return;
    }
    match target {
        MutationTarget::Employee => {
            for item in &batch.succeeded {
                let name = item.status.employee_name.as_str();
                match action {
                    BatchAction::Create => ledger.expect_create(owner, EMPLOYEE_KIND, name),
                    BatchAction::Update => ledger.expect_update(
                        owner,
                        EMPLOYEE_KIND,
                        name,
                        item.resource_version.as_deref(),
                    ),
                    BatchAction::Delete => ledger.expect_delete(owner, EMPLOYEE_KIND, name),
                }
            }
        }
        MutationTarget::Employer => {
            // Registration-record employees: the whole batch landed as one
            // write on the employer object.
            let kind = A::Employer::kind(&()).into_owned();
            let name = employer.meta().name.clone().unwrap_or_default();
            ledger.expect_update(
                owner,
                &kind,
                &name,
                batch.employer_resource_version.as_deref(),
            );
        }
    }
}
