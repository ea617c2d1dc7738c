//! Generic declarative-reconciliation engine
//!
//! The employer/employee consistency pattern: an employer resource declares
//! a selector over employee entities, an adapter projects both sides as
//! typed status snapshots, and the engine converges observed onto expected
//! with batched, partial-failure-tolerant mutations gated by lifecycle
//! finalizers and guarded by the expectation ledger.

pub mod adapter;
pub mod diff;
pub mod executor;
pub mod lifecycle;
pub mod ownership;
mod reconciler;

#[cfg(test)]
mod engine_test;

pub use adapter::{
    employer_key, pod_lifecycle_ready, BatchResult, EmployeeStatus, EmployerStatus, FailedItem,
    MutationTarget, ReconcileAdapter, SyncedItem, SERVICE_READY_GATE,
};
pub use diff::{diff_employees, diff_employers, EmployeeClassification, EmployerClassification};
pub use executor::{sync_employees, SyncOutcome, EMPLOYEE_KIND};
pub use lifecycle::{
    clean_finalizer, lifecycle_finalizer, FinalizerOp, LifecycleState, LifecycleView,
    CLEAN_FINALIZER_PREFIX, EXPECTED_FINALIZERS_ANNOTATION, LIFECYCLE_FINALIZER_PREFIX,
};
pub use ownership::{
    adjudicate, claim_owned, controller_owner_ref, release_owned, selector_matches, OwnershipAction,
};
pub use reconciler::{calculate_backoff, emit_event, run_adapter, EngineContext};
