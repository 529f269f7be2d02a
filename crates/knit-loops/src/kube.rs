//! Kubernetes REST backend.
//!
//! Workers are `batch/v1` Jobs, data volumes are PersistentVolumeClaims and
//! data agents are Pods, all in one namespace. Only the fields the loops
//! read are decoded.

use crate::backend::{
    ApiError, JobStatus, Pod, PodBackend, PodError, VolumeBackend, VolumeError, VolumeSpec,
    Worker, WorkerBackend, WorkerError, WorkloadPhase,
};
use async_trait::async_trait;
use knit_core::{Config, Run};
use reqwest::{Certificate, Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Container waiting reasons after which a pod will not start by itself.
const STUCK_REASONS: [&str; 5] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "CreateContainerConfigError",
    "CreateContainerError",
];

const RUN_ID_LABEL: &str = "knitfab/run-id";

/// Authenticated client for one namespace.
#[derive(Clone)]
pub struct KubeClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base: String,
    namespace: String,
    token: String,
    storage_class: Option<String>,
    initial_capacity: String,
}

impl std::fmt::Debug for KubeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClient")
            .field("base", &self.inner.base)
            .field("namespace", &self.inner.namespace)
            .finish_non_exhaustive()
    }
}

impl KubeClient {
    /// Build a client from in-cluster service account credentials.
    pub fn from_config(config: &Config) -> Result<Self, ApiError> {
        let token = std::fs::read_to_string(&config.kube_token_path).map_err(|e| {
            ApiError::Credentials(format!("{}: {e}", config.kube_token_path.display()))
        })?;

        let mut builder = Client::builder().timeout(Duration::from_secs(30));
        if config.kube_insecure {
            builder = builder.danger_accept_invalid_certs(true);
        } else if config.kube_ca_path.exists() {
            let pem = std::fs::read(&config.kube_ca_path).map_err(|e| {
                ApiError::Credentials(format!("{}: {e}", config.kube_ca_path.display()))
            })?;
            builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
        }

        Ok(Self {
            inner: Arc::new(Inner {
                http: builder.build()?,
                base: config.kube_api_url.clone(),
                namespace: config.namespace.clone(),
                token: token.trim().to_string(),
                storage_class: config.storage_class.clone(),
                initial_capacity: config.initial_capacity.clone(),
            }),
        })
    }

    fn url(&self, group: &str, kind: &str, name: Option<&str>) -> String {
        let mut url = format!(
            "{}/{group}/namespaces/{}/{kind}",
            self.inner.base, self.inner.namespace
        );
        if let Some(name) = name {
            url.push('/');
            url.push_str(name);
        }
        url
    }

    async fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<Value, ApiError> {
        let response = self
            .inner
            .http
            .get(url)
            .bearer_auth(&self.inner.token)
            .query(query)
            .send()
            .await?;
        Ok(check(response).await?.json().await?)
    }

    async fn create(&self, url: &str, body: &Value) -> Result<(), ApiError> {
        let response = self
            .inner
            .http
            .post(url)
            .bearer_auth(&self.inner.token)
            .json(body)
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<(), ApiError> {
        let response = self
            .inner
            .http
            .delete(url)
            .bearer_auth(&self.inner.token)
            .json(&json!({"propagationPolicy": "Background"}))
            .send()
            .await?;
        check(response).await?;
        Ok(())
    }
}

async fn check(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ApiError::Status {
        status: status.as_u16(),
        message,
    })
}

fn is_status(err: &ApiError, code: StatusCode) -> bool {
    matches!(err, ApiError::Status { status, .. } if *status == code.as_u16())
}

// --- workers ---

/// A worker job together with what its pod reports.
#[derive(Debug)]
pub struct KubeWorker {
    client: KubeClient,
    name: String,
    status: JobStatus,
}

#[async_trait]
impl Worker for KubeWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn status(&self) -> JobStatus {
        self.status.clone()
    }

    async fn close(&self) -> Result<(), WorkerError> {
        let url = self.client.url("apis/batch/v1", "jobs", Some(&self.name));
        match self.client.delete(&url).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::NOT_FOUND) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl WorkerBackend for KubeClient {
    async fn find(&self, run: &Run) -> Result<Box<dyn Worker>, WorkerError> {
        let name = run
            .worker_name
            .clone()
            .ok_or_else(|| WorkerError::Unassigned(run.id.to_string()))?;

        let job = match self
            .get(&self.url("apis/batch/v1", "jobs", Some(&name)), &[])
            .await
        {
            Ok(job) => job,
            Err(e) if is_status(&e, StatusCode::NOT_FOUND) => {
                return Err(WorkerError::Missing(name))
            }
            Err(e) => return Err(e.into()),
        };
        let selector = format!("job-name={name}");
        let pods = self
            .get(
                &self.url("api/v1", "pods", None),
                &[("labelSelector", selector.as_str())],
            )
            .await?;

        let status = job_status(&job, &pods);
        debug!(worker = %name, phase = ?status.phase, "worker status");
        Ok(Box::new(KubeWorker {
            client: self.clone(),
            name,
            status,
        }))
    }

    async fn spawn(&self, run: &Run, env: &BTreeMap<String, String>) -> Result<(), WorkerError> {
        let name = run
            .worker_name
            .clone()
            .ok_or_else(|| WorkerError::Unassigned(run.id.to_string()))?;
        let body = job_manifest(run, &name, env)
            .ok_or_else(|| WorkerError::Unassigned(run.id.to_string()))?;

        match self
            .create(&self.url("apis/batch/v1", "jobs", None), &body)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::CONFLICT) => Err(WorkerError::AlreadyExists(name)),
            Err(e) => Err(e.into()),
        }
    }
}

/// Job manifest of an image based run. `None` for pseudo plan runs.
fn job_manifest(run: &Run, name: &str, env: &BTreeMap<String, String>) -> Option<Value> {
    let image = match &run.plan.kind {
        knit_core::PlanKind::Image { image } => image,
        knit_core::PlanKind::Pseudo { .. } => return None,
    };

    let mut volumes = Vec::new();
    let mut mounts = Vec::new();
    let inputs = run.inputs.iter().map(|a| (a, true));
    let written = run.written_data().map(|a| (a, false));
    for (index, (assignment, read_only)) in inputs.chain(written).enumerate() {
        let volume = format!("vol-{index}");
        volumes.push(json!({
            "name": volume,
            "persistentVolumeClaim": {"claimName": assignment.volume_ref, "readOnly": read_only},
        }));
        mounts.push(json!({
            "name": volume,
            "mountPath": assignment.path,
            "readOnly": read_only,
        }));
    }
    let env: Vec<Value> = env
        .iter()
        .map(|(name, value)| json!({"name": name, "value": value}))
        .collect();

    Some(json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": name,
            "labels": {RUN_ID_LABEL: run.id.as_ref()},
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {"labels": {RUN_ID_LABEL: run.id.as_ref()}},
                "spec": {
                    "restartPolicy": "Never",
                    "containers": [{
                        "name": "main",
                        "image": image,
                        "env": env,
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                },
            },
        },
    }))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobCounts {
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PodStatus {
    #[serde(default)]
    phase: String,
    #[serde(default)]
    container_statuses: Vec<ContainerStatus>,
}

#[derive(Debug, Default, Deserialize)]
struct ContainerStatus {
    #[serde(default)]
    state: ContainerState,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerState {
    waiting: Option<Waiting>,
    terminated: Option<Terminated>,
}

#[derive(Debug, Deserialize)]
struct Waiting {
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Terminated {
    #[serde(default)]
    exit_code: i32,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    message: String,
}

fn decode<T: Default + serde::de::DeserializeOwned>(value: Option<&Value>) -> T {
    value
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

fn pod_phase(status: &PodStatus) -> WorkloadPhase {
    let stuck = status.container_statuses.iter().any(|c| {
        c.state
            .waiting
            .as_ref()
            .is_some_and(|w| STUCK_REASONS.contains(&w.reason.as_str()))
    });
    if stuck {
        return WorkloadPhase::Stucking;
    }
    match status.phase.as_str() {
        "Pending" => WorkloadPhase::Pending,
        "Running" => WorkloadPhase::Running,
        "Succeeded" => WorkloadPhase::Succeeded,
        "Failed" => WorkloadPhase::Failed,
        _ => WorkloadPhase::Unknown,
    }
}

/// Status of a job from the job itself and the list of its pods.
fn job_status(job: &Value, pods: &Value) -> JobStatus {
    let counts: JobCounts = decode(job.get("status"));
    let pod: PodStatus = decode(
        pods.get("items")
            .and_then(Value::as_array)
            .and_then(|items| items.last())
            .and_then(|pod| pod.get("status")),
    );
    let terminated = pod
        .container_statuses
        .iter()
        .find_map(|c| c.state.terminated.as_ref());
    let (code, message) = terminated.map_or((0, String::new()), |t| {
        let message = if t.message.is_empty() {
            t.reason.clone()
        } else {
            t.message.clone()
        };
        (u8::try_from(t.exit_code).unwrap_or(u8::MAX), message)
    });

    let phase = if counts.succeeded > 0 {
        WorkloadPhase::Succeeded
    } else if counts.failed > 0 {
        WorkloadPhase::Failed
    } else {
        pod_phase(&pod)
    };
    JobStatus {
        phase,
        code,
        message,
    }
}

// --- volumes ---

#[async_trait]
impl VolumeBackend for KubeClient {
    async fn create_volume(&self, volume: &VolumeSpec) -> Result<(), VolumeError> {
        let mut spec = json!({
            "accessModes": ["ReadWriteMany"],
            "resources": {"requests": {"storage": self.inner.initial_capacity}},
        });
        if let Some(class) = &self.inner.storage_class {
            spec["storageClassName"] = json!(class);
        }
        let body = json!({
            "apiVersion": "v1",
            "kind": "PersistentVolumeClaim",
            "metadata": {
                "name": volume.volume_ref,
                "labels": {"knitfab/knit-id": volume.knit_id, RUN_ID_LABEL: volume.run_id},
            },
            "spec": spec,
        });
        match self
            .create(&self.url("api/v1", "persistentvolumeclaims", None), &body)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::CONFLICT) => {
                Err(VolumeError::Conflict(volume.volume_ref.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_volume(&self, volume_ref: &str) -> Result<(), VolumeError> {
        let url = self.url("api/v1", "persistentvolumeclaims", Some(volume_ref));
        match self.delete(&url).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::NOT_FOUND) => {
                Err(VolumeError::Missing(volume_ref.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

// --- pods ---

#[derive(Debug)]
pub struct KubePod {
    client: KubeClient,
    name: String,
    phase: WorkloadPhase,
}

#[async_trait]
impl Pod for KubePod {
    fn name(&self) -> &str {
        &self.name
    }

    fn phase(&self) -> WorkloadPhase {
        self.phase
    }

    async fn close(&self) -> Result<(), PodError> {
        match self.client.delete(&self.client.url("api/v1", "pods", Some(&self.name))).await {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, StatusCode::NOT_FOUND) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PodBackend for KubeClient {
    async fn get_pod(&self, name: &str) -> Result<Box<dyn Pod>, PodError> {
        let pod = match self.get(&self.url("api/v1", "pods", Some(name)), &[]).await {
            Ok(pod) => pod,
            Err(e) if is_status(&e, StatusCode::NOT_FOUND) => {
                return Err(PodError::Missing(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let status: PodStatus = decode(pod.get("status"));
        Ok(Box::new(KubePod {
            client: self.clone(),
            name: name.to_string(),
            phase: pod_phase(&status),
        }))
    }
}
