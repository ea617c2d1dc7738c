//! Built-in traffic adapter: Service employer, Pod employees
//!
//! A managed Service's backends are registration records kept in an
//! annotation on the Service itself; the pods it selects are the employees.
//! Desired state: every lifecycle-ready pod is registered and labeled for
//! full traffic weight, every other pod is off. The engine's lifecycle gate
//! keeps a ready pod's finalizer on until it has been deregistered here.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    client::Client,
    runtime::{reflector::ObjectRef, watcher},
    ResourceExt,
};
use tracing::debug;

use crate::crd::MANAGED_LABEL;
use crate::engine::{
    self, pod_lifecycle_ready, BatchResult, EmployeeStatus, EmployerStatus, FailedItem,
    ReconcileAdapter, SyncedItem,
};
use crate::error::{Error, Result};
use crate::expectations::ExpectationLedger;

/// Annotation on the Service holding the registered backend pod names.
pub const REGISTERED_BACKENDS_ANNOTATION: &str = "consist.dev/registered-backends";

/// Pod label routing traffic to the pod.
pub const TRAFFIC_ON_LABEL: &str = "consist.dev/traffic-on";

/// Pod label carrying the traffic weight.
pub const TRAFFIC_WEIGHT_LABEL: &str = "consist.dev/traffic-weight";

/// Pod label naming the managed Service the pod backs; used to map pod
/// events back to their employer.
pub const SERVICE_NAME_LABEL: &str = "consist.dev/service";

const FIELD_MANAGER: &str = "consist-traffic";

/// Adapter-defined employee extra status: the traffic facet of one pod.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrafficStatus {
    pub traffic_on: bool,
    pub traffic_weight: i32,
}

/// Desired traffic facet for a pod in the given readiness state.
pub fn desired_traffic(lifecycle_ready: bool) -> TrafficStatus {
    if lifecycle_ready {
        TrafficStatus {
            traffic_on: true,
            traffic_weight: 100,
        }
    } else {
        TrafficStatus {
            traffic_on: false,
            traffic_weight: 0,
        }
    }
}

/// Traffic facet a pod currently advertises through its labels.
pub fn traffic_status_from_labels(pod: &Pod) -> TrafficStatus {
    let labels = pod.labels();
    TrafficStatus {
        traffic_on: labels.get(TRAFFIC_ON_LABEL).map(String::as_str) == Some("true"),
        traffic_weight: labels
            .get(TRAFFIC_WEIGHT_LABEL)
            .and_then(|w| w.parse().ok())
            .unwrap_or(0),
    }
}

/// Parse the backend registry annotation.
pub fn parse_backends(service: &Service) -> Vec<String> {
    service
        .annotations()
        .get(REGISTERED_BACKENDS_ANNOTATION)
        .map(|v| {
            v.split(',')
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

fn join_backends(names: &[String]) -> String {
    names.join(",")
}

/// Map a pod event to the managed Service it backs, by convention label.
fn pod_to_service(pod: &Pod) -> Vec<ObjectRef<Service>> {
    let namespace = match pod.namespace() {
        Some(ns) => ns,
        None => return Vec::new(),
    };
    pod.labels()
        .get(SERVICE_NAME_LABEL)
        .map(|name| vec![ObjectRef::new(name).within(&namespace)])
        .unwrap_or_default()
}

pub struct TrafficAdapter {
    client: Client,
}

impl TrafficAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn patch_backends(
        &self,
        service: &Service,
        backends: Vec<String>,
    ) -> Result<Option<String>> {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Service> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "metadata": {
                "annotations": { REGISTERED_BACKENDS_ANNOTATION: join_backends(&backends) }
            }
        });
        let patched = api
            .patch(
                &service.name_any(),
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(patched.resource_version())
    }
}

#[async_trait]
impl ReconcileAdapter for TrafficAdapter {
    type Employer = Service;
    type EmployeeExtra = TrafficStatus;
    type EmployerExtra = ();

    fn controller_name(&self) -> &'static str {
        "traffic-consist"
    }

    fn employer_predicate(&self, service: &Service) -> bool {
        service.labels().get(MANAGED_LABEL).map(String::as_str) == Some("true")
    }

    fn employer_watch_config(&self) -> watcher::Config {
        watcher::Config::default().labels(&format!("{}=true", MANAGED_LABEL))
    }

    fn employee_to_employers(&self, pod: &Pod) -> Vec<ObjectRef<Service>> {
        pod_to_service(pod)
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

    /// Desired employees: the live, non-deleting pods the Service selects,
    /// each wanting the traffic facet its readiness implies.
    async fn expected_employee_status(
        &self,
        service: &Service,
    ) -> Result<Vec<EmployeeStatus<TrafficStatus>>> {
        let selector = service
            .spec
            .as_ref()
            .and_then(|s| s.selector.as_ref())
            .ok_or_else(|| {
                Error::AdapterContract(format!("service {} has no selector", service.name_any()))
            })?;
        if selector.is_empty() {
            return Ok(Vec::new());
        }

        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let label_selector = selector
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",");
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let list = pods
            .list(&ListParams::default().labels(&label_selector))
            .await?;

        let mut expected = Vec::new();
        for pod in &list.items {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            let ready = pod_lifecycle_ready(pod);
            expected.push(EmployeeStatus {
                employee_id: pod.name_any(),
                employee_name: pod.name_any(),
                lifecycle_ready: ready,
                extra: desired_traffic(ready),
            });
        }
        Ok(expected)
    }

    /// Current employees: the pods named in the backend registry, with the
    /// traffic facet their labels advertise. A registered pod that no longer
    /// exists stays in the set as a not-ready record so the diff will still
    /// deregister it.
    async fn current_employee_status(
        &self,
        service: &Service,
    ) -> Result<Vec<EmployeeStatus<TrafficStatus>>> {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let mut current = Vec::new();
        for name in parse_backends(service) {
            let pod = match pods.get(&name).await {
                Ok(pod) => pod,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(pod = %name, "registered backend no longer exists");
                    current.push(EmployeeStatus {
                        employee_id: name.clone(),
                        employee_name: name,
                        lifecycle_ready: false,
                        extra: desired_traffic(false),
                    });
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            current.push(EmployeeStatus {
                employee_id: pod.name_any(),
                employee_name: pod.name_any(),
                lifecycle_ready: pod_lifecycle_ready(&pod),
                extra: traffic_status_from_labels(&pod),
            });
        }
        Ok(current)
    }

    /// Register new backends on the Service.
    async fn create_employees(
        &self,
        service: &Service,
        to_create: Vec<EmployeeStatus<TrafficStatus>>,
    ) -> Result<BatchResult<TrafficStatus>> {
        let mut backends = parse_backends(service);
        for status in &to_create {
            if !backends.contains(&status.employee_name) {
                backends.push(status.employee_name.clone());
            }
        }
        let resource_version = self.patch_backends(service, backends).await?;
        Ok(BatchResult::all_succeeded(to_create).with_employer_version(resource_version))
    }

    /// Push the desired traffic facet onto each pod's labels. Items fail
    /// independently; a pod that vanished mid-batch is dropped (the next
    /// diff no longer expects it).
    async fn update_employees(
        &self,
        service: &Service,
        to_update: Vec<EmployeeStatus<TrafficStatus>>,
    ) -> Result<BatchResult<TrafficStatus>> {
        let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        let mut result = BatchResult::default();
        for status in to_update {
            let patch = serde_json::json!({
                "metadata": {
                    "labels": {
                        TRAFFIC_ON_LABEL: status.extra.traffic_on.to_string(),
                        TRAFFIC_WEIGHT_LABEL: status.extra.traffic_weight.to_string(),
                    }
                }
            });
            match pods
                .patch(
                    &status.employee_name,
                    &PatchParams::apply(FIELD_MANAGER),
                    &Patch::Merge(&patch),
                )
                .await
            {
                Ok(patched) => result.succeeded.push(SyncedItem {
                    resource_version: patched.resource_version(),
                    status,
                }),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(pod = %status.employee_name, "pod gone before traffic update");
                }
                Err(e) => result.failed.push(FailedItem {
                    status,
                    reason: e.to_string(),
                }),
            }
        }
        Ok(result)
    }

    /// Deregister backends from the Service.
    async fn delete_employees(
        &self,
        service: &Service,
        to_delete: Vec<EmployeeStatus<TrafficStatus>>,
    ) -> Result<BatchResult<TrafficStatus>> {
        let backends: Vec<String> = parse_backends(service)
            .into_iter()
            .filter(|name| !to_delete.iter().any(|s| &s.employee_name == name))
            .collect();
        let resource_version = self.patch_backends(service, backends).await?;
        Ok(BatchResult::all_succeeded(to_delete).with_employer_version(resource_version))
    }
}

/// Run the traffic consist controller until shutdown.
pub async fn run_traffic_controller(client: Client, ledger: Arc<ExpectationLedger>) -> Result<()> {
    let adapter = TrafficAdapter::new(client.clone());
    engine::run_adapter(client, adapter, ledger).await
}
