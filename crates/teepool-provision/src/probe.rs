//! HTTP readiness probes for freshly launched workers.
//!
//! A worker is ready once its health path answers 2xx. Probes during
//! startup are retried on a fixed interval until the startup window
//! closes; there is no backoff because a booting worker is expected to
//! refuse connections for a while.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::backend::ProvisionError;

/// Result of a single health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The health endpoint returned 2xx.
    Healthy,
    /// The health endpoint returned non-2xx.
    Unhealthy,
    /// The probe could not be executed (connection error or timeout).
    Failed,
}

/// Perform an HTTP health probe against `address` (`host:port`).
pub async fn http_probe(address: &str, path: &str, timeout: Duration) -> ProbeResult {
    let uri = format!("http://{address}{path}");

    let result = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "health probe connection failed");
                return ProbeResult::Failed;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "health probe handshake failed");
                return ProbeResult::Failed;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = match http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", address)
            .header("user-agent", "teepool-probe/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
        {
            Ok(req) => req,
            Err(e) => {
                debug!(error = %e, %uri, "health probe request invalid");
                return ProbeResult::Failed;
            }
        };

        match sender.send_request(req).await {
            Ok(resp) if resp.status().is_success() => ProbeResult::Healthy,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "health probe non-2xx");
                ProbeResult::Unhealthy
            }
            Err(e) => {
                debug!(error = %e, %uri, "health probe request failed");
                ProbeResult::Failed
            }
        }
    })
    .await;

    result.unwrap_or_else(|_| {
        debug!(%uri, "health probe timed out");
        ProbeResult::Failed
    })
}

/// Probe every `interval` until the worker answers 2xx or `window`
/// elapses. Returns the number of probes it took.
pub async fn wait_until_healthy(
    address: &str,
    path: &str,
    interval: Duration,
    probe_timeout: Duration,
    window: Duration,
) -> Result<u32, ProvisionError> {
    let started = Instant::now();
    let deadline = started + window;
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let result = http_probe(address, path, probe_timeout.min(remaining)).await;
        if result == ProbeResult::Healthy {
            debug!(address, attempts, "worker passed readiness probe");
            return Ok(attempts);
        }

        let now = Instant::now();
        if now + interval >= deadline {
            return Err(ProvisionError::HealthCheck {
                address: address.to_string(),
                path: path.to_string(),
                attempts,
                waited_ms: now.duration_since(started).as_millis() as u64,
            });
        }
        tokio::time::sleep(interval).await;
    }
}
