//! Remote backend — workers on a fleet-management service.
//!
//! ```text
//!   create(worker)
//!     │  POST   {base}/deployments          → { id }
//!     ├─ poll every poll_interval
//!     │  GET    {base}/deployments/{id}     → { status, endpoint, attestationId }
//!     │     creating → keep polling (errors count as "not ready yet")
//!     │     running  → Provisioned
//!     │     failed   → RemoteFailed, deployment deleted
//!     └─ cold-start timeout → deployment deleted, Timeout
//!
//!   destroy(worker)
//!        DELETE {base}/deployments/{id}     (404 counts as gone)
//! ```
//!
//! The POST runs on its own task, so it completes even when the caller
//! gives up on `create`. A `destroy` that arrives while the POST is still
//! in flight marks the worker cancelled and the deployment is deleted as
//! soon as its id is known.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use teepool_core::{RemoteBackendConfig, Resources, WorkerId, WorkerTemplate};

use crate::backend::{ProvisionError, ProvisionFuture, Provisioned, ProvisioningBackend};

// ── Fleet API ─────────────────────────────────────────────────────

/// Body of a deployment request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentRequest {
    pub name: String,
    pub image: String,
    pub port: u16,
    pub health_path: String,
    pub env: HashMap<String, String>,
    pub resources: Resources,
    pub tee_provider: String,
    pub tee_hardware: String,
    pub labels: HashMap<String, String>,
}

impl DeploymentRequest {
    pub fn from_template(worker_id: WorkerId, template: &WorkerTemplate) -> Self {
        let labels = HashMap::from([
            ("teepool.worker".to_string(), worker_id.to_string()),
            ("teepool.capability".to_string(), template.capability.clone()),
        ]);
        Self {
            name: format!("teepool-{worker_id}"),
            image: template.image.clone(),
            port: template.port,
            health_path: template.health_path.clone(),
            env: template.env.clone(),
            resources: template.resources.clone(),
            tee_provider: template.tee_provider.clone(),
            tee_hardware: template.tee_hardware.clone(),
            labels,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Creating,
    Running,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    pub status: DeploymentState,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub attestation_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedDeployment {
    id: String,
}

/// The three calls the remote backend makes against a fleet service.
pub trait FleetApi: Send + Sync {
    /// Returns the deployment id.
    fn create_deployment<'a>(&'a self, request: &'a DeploymentRequest)
    -> ProvisionFuture<'a, String>;

    fn get_deployment<'a>(&'a self, deployment_id: &'a str)
    -> ProvisionFuture<'a, DeploymentStatus>;

    fn delete_deployment<'a>(&'a self, deployment_id: &'a str) -> ProvisionFuture<'a, ()>;
}

/// [`FleetApi`] over HTTP with an optional bearer token.
pub struct HttpFleetApi {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpFleetApi {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self, ProvisionError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProvisionError::Api(format!("building http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn deployment_url(&self, deployment_id: &str) -> String {
        format!("{}/deployments/{deployment_id}", self.base_url)
    }

    async fn post_deployment(&self, request: &DeploymentRequest) -> Result<String, ProvisionError> {
        let url = format!("{}/deployments", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .json(request)
            .send()
            .await
            .map_err(|e| ProvisionError::Api(format!("POST {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProvisionError::Api(format!("POST {url} returned {status}: {body}")));
        }
        let created: CreatedDeployment = response
            .json()
            .await
            .map_err(|e| ProvisionError::Api(format!("decoding create response: {e}")))?;
        Ok(created.id)
    }

    async fn fetch_deployment(&self, deployment_id: &str) -> Result<DeploymentStatus, ProvisionError> {
        let url = self.deployment_url(deployment_id);
        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| ProvisionError::Api(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisionError::Api(format!("GET {url} returned {status}")));
        }
        response
            .json()
            .await
            .map_err(|e| ProvisionError::Api(format!("decoding deployment status: {e}")))
    }

    async fn remove_deployment(&self, deployment_id: &str) -> Result<(), ProvisionError> {
        let url = self.deployment_url(deployment_id);
        let response = self
            .authorized(self.client.delete(&url))
            .send()
            .await
            .map_err(|e| ProvisionError::Api(format!("DELETE {url}: {e}")))?;

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(ProvisionError::Teardown(format!("DELETE {url} returned {status}")))
        }
    }
}

impl FleetApi for HttpFleetApi {
    fn create_deployment<'a>(
        &'a self,
        request: &'a DeploymentRequest,
    ) -> ProvisionFuture<'a, String> {
        Box::pin(self.post_deployment(request))
    }

    fn get_deployment<'a>(
        &'a self,
        deployment_id: &'a str,
    ) -> ProvisionFuture<'a, DeploymentStatus> {
        Box::pin(self.fetch_deployment(deployment_id))
    }

    fn delete_deployment<'a>(&'a self, deployment_id: &'a str) -> ProvisionFuture<'a, ()> {
        Box::pin(self.remove_deployment(deployment_id))
    }
}

// ── Backend ───────────────────────────────────────────────────────

/// What the backend knows about a worker's deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Deployment {
    /// POST in flight, id not known yet.
    Submitting,
    /// Destroyed while submitting; delete on arrival.
    Cancelled,
    Active(String),
}

type Deployments = Arc<Mutex<HashMap<WorkerId, Deployment>>>;

fn lock(deployments: &Deployments) -> std::sync::MutexGuard<'_, HashMap<WorkerId, Deployment>> {
    deployments.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RemoteBackend {
    api: Arc<dyn FleetApi>,
    poll_interval: Duration,
    deployments: Deployments,
}

impl RemoteBackend {
    pub fn new(api: Arc<dyn FleetApi>, poll_interval: Duration) -> Self {
        Self {
            api,
            poll_interval,
            deployments: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Build an HTTP-backed remote backend. The API key is read from the
    /// environment variable named in the config; a missing key means
    /// unauthenticated requests.
    pub fn from_config(config: &RemoteBackendConfig) -> Result<Self, ProvisionError> {
        let api_key = std::env::var(&config.api_key_env).ok().filter(|k| !k.is_empty());
        if api_key.is_none() {
            warn!(var = %config.api_key_env, "no fleet api key set, requests are unauthenticated");
        }
        let api = HttpFleetApi::new(
            config.base_url.clone(),
            api_key,
            Duration::from_millis(config.request_timeout_ms),
        )?;
        Ok(Self::new(
            Arc::new(api),
            Duration::from_millis(config.poll_interval_ms),
        ))
    }

    /// Deployment id tracked for a worker.
    pub fn deployment_of(&self, worker_id: WorkerId) -> Option<String> {
        match self.lock_deployments().get(&worker_id) {
            Some(Deployment::Active(id)) => Some(id.clone()),
            _ => None,
        }
    }

    fn lock_deployments(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerId, Deployment>> {
        lock(&self.deployments)
    }

    /// POST the deployment on a detached task and record its id.
    async fn submit(
        &self,
        worker_id: WorkerId,
        request: DeploymentRequest,
    ) -> Result<String, ProvisionError> {
        self.lock_deployments().insert(worker_id, Deployment::Submitting);

        let api = self.api.clone();
        let deployments = self.deployments.clone();
        let task = tokio::spawn(async move {
            let created = api.create_deployment(&request).await;
            let orphan = {
                let mut map = lock(&deployments);
                let cancelled = map.get(&worker_id) == Some(&Deployment::Cancelled);
                match &created {
                    Ok(id) if cancelled => {
                        map.remove(&worker_id);
                        Some(id.clone())
                    }
                    Ok(id) => {
                        map.insert(worker_id, Deployment::Active(id.clone()));
                        None
                    }
                    Err(_) => {
                        map.remove(&worker_id);
                        None
                    }
                }
            };
            match orphan {
                Some(deployment_id) => {
                    info!(%worker_id, %deployment_id, "deleting deployment destroyed during creation");
                    if let Err(e) = api.delete_deployment(&deployment_id).await {
                        warn!(%worker_id, %deployment_id, error = %e, "cleanup of cancelled deployment");
                    }
                    Err(ProvisionError::Api(format!(
                        "deployment {deployment_id} cancelled during creation"
                    )))
                }
                None => created,
            }
        });

        task.await
            .map_err(|e| ProvisionError::Api(format!("deployment submission task: {e}")))?
    }

    async fn provision(
        &self,
        worker_id: WorkerId,
        template: &WorkerTemplate,
        timeout: Duration,
    ) -> Result<Provisioned, ProvisionError> {
        let deadline = Instant::now() + timeout;
        let request = DeploymentRequest::from_template(worker_id, template);
        let deployment_id = self.submit(worker_id, request).await?;
        info!(%worker_id, %deployment_id, image = %template.image, "remote deployment requested");

        match self.await_running(worker_id, &deployment_id, deadline, timeout).await {
            Ok(provisioned) => Ok(provisioned),
            Err(e) => {
                self.lock_deployments().remove(&worker_id);
                if let Err(del) = self.api.delete_deployment(&deployment_id).await {
                    warn!(%worker_id, %deployment_id, error = %del, "cleanup of failed deployment");
                }
                Err(e)
            }
        }
    }

    async fn await_running(
        &self,
        worker_id: WorkerId,
        deployment_id: &str,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Provisioned, ProvisionError> {
        loop {
            match self.api.get_deployment(deployment_id).await {
                Ok(DeploymentStatus {
                    status: DeploymentState::Running,
                    endpoint: Some(endpoint),
                    attestation_id,
                    ..
                }) => {
                    info!(%worker_id, %deployment_id, %endpoint, "remote worker running");
                    return Ok(Provisioned {
                        endpoint,
                        attestation_id,
                    });
                }
                Ok(DeploymentStatus {
                    status: DeploymentState::Failed,
                    message,
                    ..
                }) => {
                    return Err(ProvisionError::RemoteFailed {
                        deployment_id: deployment_id.to_string(),
                        reason: message.unwrap_or_else(|| "no reason given".to_string()),
                    });
                }
                Ok(status) => {
                    debug!(%worker_id, %deployment_id, state = ?status.status, "deployment not ready");
                }
                Err(e) => {
                    debug!(%worker_id, %deployment_id, error = %e, "deployment poll failed, retrying");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ProvisionError::Timeout(timeout));
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    async fn teardown(&self, worker_id: WorkerId) -> Result<(), ProvisionError> {
        let deployment_id = {
            let mut map = self.lock_deployments();
            match map.remove(&worker_id) {
                Some(Deployment::Active(id)) => id,
                Some(Deployment::Submitting | Deployment::Cancelled) => {
                    map.insert(worker_id, Deployment::Cancelled);
                    debug!(%worker_id, "deployment still being created, deleting once it lands");
                    return Ok(());
                }
                None => return Err(ProvisionError::NotFound(worker_id)),
            }
        };
        self.api.delete_deployment(&deployment_id).await?;
        debug!(%worker_id, %deployment_id, "remote deployment deleted");
        Ok(())
    }
}

impl ProvisioningBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn create<'a>(
        &'a self,
        worker_id: WorkerId,
        template: &'a WorkerTemplate,
        timeout: Duration,
    ) -> ProvisionFuture<'a, Provisioned> {
        Box::pin(self.provision(worker_id, template, timeout))
    }

    fn destroy(&self, worker_id: WorkerId) -> ProvisionFuture<'_, ()> {
        Box::pin(self.teardown(worker_id))
    }
}
