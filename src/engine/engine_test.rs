//! Engine tests over a scripted in-memory adapter
//!
//! These drive the diff → execute → expectation pipeline the way a real
//! controller would across several reconcile passes, without an API server:
//! the mock adapter keeps its "current" registration state in memory and
//! fails exactly the items a test scripts it to fail.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::ObjectMeta;

use crate::error::Result;
use crate::expectations::ExpectationLedger;

use super::adapter::{
    BatchResult, EmployeeStatus, EmployerStatus, FailedItem, MutationTarget, ReconcileAdapter,
    SyncedItem,
};
use super::diff::diff_employees;
use super::executor::{sync_employees, EMPLOYEE_KIND};

fn employee(id: &str, ready: bool, weight: i32) -> EmployeeStatus<i32> {
    EmployeeStatus {
        employee_id: id.to_string(),
        employee_name: id.to_string(),
        lifecycle_ready: ready,
        extra: weight,
    }
}

fn test_service(name: &str) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some("default".to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        ..Default::default()
    }
}

#[derive(Default)]
struct MockState {
    current: Vec<EmployeeStatus<i32>>,
    fail_create: HashSet<String>,
    fail_delete: HashSet<String>,
    create_calls: usize,
    update_calls: usize,
    delete_calls: usize,
}

struct MockAdapter {
    state: Mutex<MockState>,
    create_target: MutationTarget,
    delete_target: MutationTarget,
}

impl MockAdapter {
    fn new(current: Vec<EmployeeStatus<i32>>) -> Self {
        Self {
            state: Mutex::new(MockState {
                current,
                ..Default::default()
            }),
            create_target: MutationTarget::Employee,
            delete_target: MutationTarget::Employee,
        }
    }

    fn with_targets(mut self, create: MutationTarget, delete: MutationTarget) -> Self {
        self.create_target = create;
        self.delete_target = delete;
        self
    }

    fn fail_create(self, id: &str) -> Self {
        self.state.lock().unwrap().fail_create.insert(id.to_string());
        self
    }

    fn fail_delete(self, id: &str) -> Self {
        self.state.lock().unwrap().fail_delete.insert(id.to_string());
        self
    }

    fn current(&self) -> Vec<EmployeeStatus<i32>> {
        self.state.lock().unwrap().current.clone()
    }

    fn delete_calls(&self) -> usize {
        self.state.lock().unwrap().delete_calls
    }
}

#[async_trait]
impl ReconcileAdapter for MockAdapter {
    type Employer = Service;
    type EmployeeExtra = i32;
    type EmployerExtra = ();

    fn controller_name(&self) -> &'static str {
        "mock"
    }

    fn employer_predicate(&self, _employer: &Service) -> bool {
        true
    }

    fn employee_to_employers(
        &self,
        _pod: &Pod,
    ) -> Vec<kube::runtime::reflector::ObjectRef<Service>> {
        Vec::new()
    }

    fn create_target(&self) -> MutationTarget {
        self.create_target
    }

    fn delete_target(&self) -> MutationTarget {
        self.delete_target
    }

    async fn expected_employer_status(&self, _: &Service) -> Result<Vec<EmployerStatus<()>>> {
        Ok(Vec::new())
    }

    async fn current_employer_status(&self, _: &Service) -> Result<Vec<EmployerStatus<()>>> {
        Ok(Vec::new())
    }

    async fn create_employer(
        &self,
        _: &Service,
        _to_create: Vec<EmployerStatus<()>>,
    ) -> Result<Vec<EmployerStatus<()>>> {
        Ok(Vec::new())
    }

    async fn update_employer(
        &self,
        _: &Service,
        _to_update: Vec<EmployerStatus<()>>,
    ) -> Result<Vec<EmployerStatus<()>>> {
        Ok(Vec::new())
    }

    async fn delete_employer(
        &self,
        _: &Service,
        _to_delete: Vec<EmployerStatus<()>>,
    ) -> Result<Vec<EmployerStatus<()>>> {
        Ok(Vec::new())
    }

    async fn record_employer(&self, _: &Service, _: Vec<EmployerStatus<()>>) -> Result<()> {
        Ok(())
    }

    async fn expected_employee_status(&self, _: &Service) -> Result<Vec<EmployeeStatus<i32>>> {
        unreachable!("tests drive diff explicitly")
    }

    async fn current_employee_status(&self, _: &Service) -> Result<Vec<EmployeeStatus<i32>>> {
        Ok(self.current())
    }

    async fn create_employees(
        &self,
        _: &Service,
        to_create: Vec<EmployeeStatus<i32>>,
    ) -> Result<BatchResult<i32>> {
        let mut state = self.state.lock().unwrap();
        state.create_calls += 1;
        let mut result = BatchResult::default();
        for status in to_create {
            if state.fail_create.contains(&status.employee_id) {
                result.failed.push(FailedItem {
                    status,
                    reason: "scripted create failure".to_string(),
                });
            } else {
                state.current.push(status.clone());
                result.succeeded.push(SyncedItem {
                    status,
                    resource_version: Some("1".to_string()),
                });
            }
        }
        result.employer_resource_version = Some("100".to_string());
        Ok(result)
    }

    async fn update_employees(
        &self,
        _: &Service,
        to_update: Vec<EmployeeStatus<i32>>,
    ) -> Result<BatchResult<i32>> {
        let mut state = self.state.lock().unwrap();
        state.update_calls += 1;
        let mut result = BatchResult::default();
        for status in to_update {
            if let Some(existing) = state
                .current
                .iter_mut()
                .find(|c| c.employee_id == status.employee_id)
            {
                *existing = status.clone();
            }
            result.succeeded.push(SyncedItem {
                status,
                resource_version: Some("2".to_string()),
            });
        }
        Ok(result)
    }

    async fn delete_employees(
        &self,
        _: &Service,
        to_delete: Vec<EmployeeStatus<i32>>,
    ) -> Result<BatchResult<i32>> {
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        let mut result = BatchResult::default();
        for status in to_delete {
            if state.fail_delete.contains(&status.employee_id) {
                result.failed.push(FailedItem {
                    status,
                    reason: "scripted delete failure".to_string(),
                });
            } else {
                state.current.retain(|c| c.employee_id != status.employee_id);
                result.succeeded.push(SyncedItem {
                    status,
                    resource_version: None,
                });
            }
        }
        result.employer_resource_version = Some("101".to_string());
        Ok(result)
    }
}

const OWNER: &str = "default/svc";

#[tokio::test]
async fn test_partial_failure_isolation() {
    let adapter = MockAdapter::new(Vec::new()).fail_create("b");
    let ledger = ExpectationLedger::default();
    let svc = test_service("svc");

    let expected = vec![employee("a", true, 100), employee("b", true, 100), employee("c", true, 100)];
    let classification = diff_employees(&expected, &adapter.current()).unwrap();
    assert_eq!(classification.to_create.len(), 3);

    let outcome = sync_employees(&adapter, &ledger, &svc, classification)
        .await
        .unwrap();

    let succeeded: Vec<_> = outcome
        .create
        .succeeded
        .iter()
        .map(|s| s.status.employee_id.clone())
        .collect();
    assert_eq!(succeeded, vec!["a", "c"]);
    assert_eq!(outcome.create.failed.len(), 1);
    assert_eq!(outcome.create.failed[0].status.employee_id, "b");

    // Next cycle: a and c are converged, only b is retried via the diff
    let next = diff_employees(&expected, &adapter.current()).unwrap();
    let retry_ids: Vec<_> = next.to_create.iter().map(|s| s.employee_id.clone()).collect();
    assert_eq!(retry_ids, vec!["b"]);
    assert_eq!(next.unchanged.len(), 2);
}

#[tokio::test]
async fn test_expectations_recorded_for_succeeded_items_only() {
    let adapter = MockAdapter::new(vec![employee("p1", true, 100), employee("p2", true, 100)])
        .fail_delete("p2");
    let ledger = ExpectationLedger::default();
    let svc = test_service("svc");

    let classification = diff_employees(&[], &adapter.current()).unwrap();
    let outcome = sync_employees(&adapter, &ledger, &svc, classification)
        .await
        .unwrap();

    assert_eq!(outcome.delete.succeeded.len(), 1);
    assert_eq!(outcome.delete.failed.len(), 1);
    // Only the succeeded delete left an expectation behind
    assert_eq!(ledger.pending(OWNER), 1);
    assert!(!ledger.satisfied(OWNER));

    ledger.observe_deleted(EMPLOYEE_KIND, "p1");
    assert!(ledger.satisfied(OWNER));
}

/// The headline anti-flicker scenario: an employer with zero desired
/// employees and two observed ones issues both deletes exactly once. A
/// second reconcile arriving before the cache reflects either deletion is
/// held back by the unsatisfied expectations.
#[tokio::test]
async fn test_second_reconcile_guarded_until_deletes_observed() {
    let adapter = MockAdapter::new(vec![employee("p1", true, 100), employee("p2", true, 100)]);
    let ledger = ExpectationLedger::default();
    let svc = test_service("svc");

    let classification = diff_employees(&[], &adapter.current()).unwrap();
    assert_eq!(classification.to_delete.len(), 2);
    let outcome = sync_employees(&adapter, &ledger, &svc, classification)
        .await
        .unwrap();
    assert_eq!(outcome.delete.succeeded.len(), 2);
    assert_eq!(ledger.pending(OWNER), 2);
    assert_eq!(adapter.delete_calls(), 1);

    // Second trigger before the cache catches up: the loop's guard refuses
    // to sync, so no second delete batch is issued
    if ledger.satisfied(OWNER) {
        panic!("expectations should still be outstanding");
    }
    assert_eq!(adapter.delete_calls(), 1);

    // Cache observations arrive; the guard lifts
    ledger.observe_deleted(EMPLOYEE_KIND, "p1");
    ledger.observe_deleted(EMPLOYEE_KIND, "p2");
    assert!(ledger.satisfied(OWNER));

    // A converged pass has nothing left to delete
    let next = diff_employees(&[], &adapter.current()).unwrap();
    assert!(next.is_converged());
}

#[tokio::test]
async fn test_employer_target_mutations_expect_employer_update() {
    let adapter = MockAdapter::new(Vec::new())
        .with_targets(MutationTarget::Employer, MutationTarget::Employer);
    let ledger = ExpectationLedger::default();
    let svc = test_service("svc");

    let expected = vec![employee("p1", true, 100)];
    let classification = diff_employees(&expected, &adapter.current()).unwrap();
    sync_employees(&adapter, &ledger, &svc, classification)
        .await
        .unwrap();

    // One employer-level update expectation, not a per-pod create
    assert_eq!(ledger.pending(OWNER), 1);
    ledger.observe_applied("Service", "svc", Some("99"));
    assert!(!ledger.satisfied(OWNER), "stale employer version must not clear");
    ledger.observe_applied("Service", "svc", Some("100"));
    assert!(ledger.satisfied(OWNER));
}

#[tokio::test]
async fn test_update_pass_is_idempotent_after_convergence() {
    let adapter = MockAdapter::new(vec![employee("p1", false, 0)]);
    let ledger = ExpectationLedger::default();
    let svc = test_service("svc");

    let expected = vec![employee("p1", true, 100)];
    let classification = diff_employees(&expected, &adapter.current()).unwrap();
    assert_eq!(classification.to_update.len(), 1);

    sync_employees(&adapter, &ledger, &svc, classification)
        .await
        .unwrap();
    ledger.observe_applied(EMPLOYEE_KIND, "p1", Some("2"));
    assert!(ledger.satisfied(OWNER));

    let next = diff_employees(&expected, &adapter.current()).unwrap();
    assert!(next.is_converged());
}
