//! Local backend — workers on this host.
//!
//! Each worker gets a free TCP port on the configured host. In container
//! mode the runtime maps that port to the template's container port; in
//! process mode the child is told its port through `PORT`. Either way the
//! worker is only handed back once its health path answers.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use teepool_core::{LocalBackendConfig, LocalLauncher, WorkerId, WorkerTemplate};

use crate::backend::{ProvisionError, ProvisionFuture, Provisioned, ProvisioningBackend};
use crate::probe::wait_until_healthy;

/// What we hold on to in order to stop a worker later.
enum LocalHandle {
    Container { runtime: String, container_id: String },
    Process { child: Child },
}

pub struct LocalProcessBackend {
    config: LocalBackendConfig,
    handles: Mutex<HashMap<WorkerId, LocalHandle>>,
}

impl LocalProcessBackend {
    pub fn new(config: LocalBackendConfig) -> Self {
        Self {
            config,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Number of workers this backend is currently tracking.
    pub fn tracked(&self) -> usize {
        self.lock_handles().len()
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerId, LocalHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn startup_window(&self, timeout: Duration) -> Duration {
        Duration::from_millis(self.config.startup_timeout_ms).min(timeout)
    }

    async fn launch(
        &self,
        worker_id: WorkerId,
        template: &WorkerTemplate,
        port: u16,
    ) -> Result<LocalHandle, ProvisionError> {
        match &self.config.launcher {
            LocalLauncher::Container { runtime } => {
                let args = container_run_args(worker_id, template, &self.config.host, port);
                debug!(%worker_id, %runtime, ?args, "starting container");
                let output = Command::new(runtime)
                    .args(&args)
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| ProvisionError::Launch(format!("{runtime}: {e}")))?;
                if !output.status.success() {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(ProvisionError::Launch(format!(
                        "{runtime} run exited with {}: {}",
                        output.status,
                        stderr.trim()
                    )));
                }
                let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(LocalHandle::Container {
                    runtime: runtime.clone(),
                    container_id,
                })
            }
            LocalLauncher::Process { program, args } => {
                debug!(%worker_id, %program, port, "spawning worker process");
                let child = Command::new(program)
                    .args(args)
                    .envs(&template.env)
                    .env("PORT", port.to_string())
                    .env("HOST", &self.config.host)
                    .env("TEEPOOL_WORKER_ID", worker_id.to_string())
                    .env("TEEPOOL_CAPABILITY", &template.capability)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| ProvisionError::Launch(format!("{program}: {e}")))?;
                Ok(LocalHandle::Process { child })
            }
        }
    }

    async fn provision(
        &self,
        worker_id: WorkerId,
        template: &WorkerTemplate,
        timeout: Duration,
    ) -> Result<Provisioned, ProvisionError> {
        let port = free_port(&self.config.host)?;
        let handle = self.launch(worker_id, template, port).await?;
        self.lock_handles().insert(worker_id, handle);

        let address = format!("{}:{port}", self.config.host);
        let probed = wait_until_healthy(
            &address,
            &template.health_path,
            Duration::from_millis(self.config.probe_interval_ms),
            Duration::from_millis(self.config.probe_timeout_ms),
            self.startup_window(timeout),
        )
        .await;

        match probed {
            Ok(attempts) => {
                info!(%worker_id, %address, attempts, "local worker ready");
                Ok(Provisioned {
                    endpoint: format!("http://{address}"),
                    attestation_id: None,
                })
            }
            Err(e) => {
                warn!(%worker_id, %address, error = %e, "local worker failed readiness, stopping");
                if let Err(stop_err) = self.stop(worker_id).await {
                    warn!(%worker_id, error = %stop_err, "cleanup after failed start");
                }
                Err(e)
            }
        }
    }

    async fn stop(&self, worker_id: WorkerId) -> Result<(), ProvisionError> {
        let handle = self
            .lock_handles()
            .remove(&worker_id)
            .ok_or(ProvisionError::NotFound(worker_id))?;

        match handle {
            LocalHandle::Container {
                runtime,
                container_id,
            } => {
                let target = if container_id.is_empty() {
                    container_name(worker_id)
                } else {
                    container_id
                };
                let output = Command::new(&runtime)
                    .args(["rm", "-f", &target])
                    .stdin(Stdio::null())
                    .output()
                    .await
                    .map_err(|e| ProvisionError::Teardown(format!("{runtime}: {e}")))?;
                if !output.status.success() {
                    return Err(ProvisionError::Teardown(format!(
                        "{runtime} rm exited with {}: {}",
                        output.status,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
            }
            LocalHandle::Process { mut child } => {
                // Already-exited children report an error from kill; that's fine.
                if let Err(e) = child.kill().await {
                    debug!(%worker_id, error = %e, "worker process already gone");
                }
            }
        }
        debug!(%worker_id, "local worker stopped");
        Ok(())
    }
}

impl ProvisioningBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
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
        Box::pin(self.stop(worker_id))
    }
}

fn container_name(worker_id: WorkerId) -> String {
    format!("teepool-{worker_id}")
}

/// Arguments for `<runtime> run`. Env vars are sorted so the command
/// line is stable.
pub(crate) fn container_run_args(
    worker_id: WorkerId,
    template: &WorkerTemplate,
    host: &str,
    port: u16,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container_name(worker_id),
        "-p".to_string(),
        format!("{host}:{port}:{}", template.port),
        "--label".to_string(),
        format!("teepool.worker={worker_id}"),
        "--label".to_string(),
        format!("teepool.capability={}", template.capability),
        "--cpus".to_string(),
        template.resources.vcpu.to_string(),
        "--memory".to_string(),
        format!("{}m", template.resources.memory_mb),
    ];

    let mut env: Vec<_> = template.env.iter().collect();
    env.sort();
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{key}={value}"));
    }
    args.push("-e".to_string());
    args.push(format!("PORT={}", template.port));

    args.push(template.image.clone());
    args
}

/// Ask the OS for an unused port on `host`.
fn free_port(host: &str) -> Result<u16, ProvisionError> {
    let listener = std::net::TcpListener::bind((host, 0))
        .map_err(|e| ProvisionError::Launch(format!("no free port on {host}: {e}")))?;
    listener
        .local_addr()
        .map(|addr| addr.port())
        .map_err(|e| ProvisionError::Launch(format!("no free port on {host}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn template() -> WorkerTemplate {
        let mut template = WorkerTemplate::new("inference", "ghcr.io/teepool/worker:1");
        template.port = 8000;
        template.env.insert("MODEL_ID".to_string(), "llama".to_string());
        template.env.insert("A_FIRST".to_string(), "1".to_string());
        template
    }

    #[test]
    fn container_args_map_port_and_env() {
        let args = container_run_args(WorkerId::new(7), &template(), "127.0.0.1", 41000);
        let joined = args.join(" ");

        assert!(joined.starts_with("run -d --name teepool-tee-7"));
        assert!(joined.contains("-p 127.0.0.1:41000:8000"));
        assert!(joined.contains("--label teepool.capability=inference"));
        assert!(joined.contains("--memory 4096m"));
        assert_eq!(args.last().map(String::as_str), Some("ghcr.io/teepool/worker:1"));

        let a = joined.find("A_FIRST=1").unwrap();
        let m = joined.find("MODEL_ID=llama").unwrap();
        assert!(a < m, "env should be sorted");
    }

    #[test]
    fn free_port_is_nonzero() {
        assert_ne!(free_port("127.0.0.1").unwrap(), 0);
    }

    #[test]
    fn startup_window_is_bounded_by_caller_timeout() {
        let backend = LocalProcessBackend::new(LocalBackendConfig::default());
        assert_eq!(
            backend.startup_window(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
        assert_eq!(
            backend.startup_window(Duration::from_secs(600)),
            Duration::from_millis(60_000)
        );
    }

    #[tokio::test]
    async fn process_that_never_listens_fails_health_check() {
        let backend = LocalProcessBackend::new(LocalBackendConfig {
            launcher: LocalLauncher::Process {
                program: "sleep".to_string(),
                args: vec!["30".to_string()],
            },
            startup_timeout_ms: 300,
            probe_interval_ms: 50,
            probe_timeout_ms: 100,
            ..LocalBackendConfig::default()
        });

        let err = backend
            .create(WorkerId::new(1), &template(), Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.is_health_check(), "unexpected error: {err:?}");
        assert_eq!(backend.tracked(), 0, "failed worker should be cleaned up");
    }

    #[tokio::test]
    async fn missing_program_is_a_launch_error() {
        let backend = LocalProcessBackend::new(LocalBackendConfig {
            launcher: LocalLauncher::Process {
                program: "/nonexistent/teepool-worker".to_string(),
                args: Vec::new(),
            },
            ..LocalBackendConfig::default()
        });

        let err = backend
            .create(WorkerId::new(2), &template(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Launch(_)));
    }

    #[tokio::test]
    async fn destroy_unknown_worker_is_not_found() {
        let backend = LocalProcessBackend::new(LocalBackendConfig::default());
        let err = backend.destroy(WorkerId::new(99)).await.unwrap_err();
        assert_eq!(err, ProvisionError::NotFound(WorkerId::new(99)));
    }
}
