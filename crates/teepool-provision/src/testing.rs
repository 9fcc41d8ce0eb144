//! In-memory backend for tests of the autoscaler, orchestrator and API.
//!
//! Creation sleeps for a configurable delay (works with paused tokio
//! time) and then succeeds with `http://mock-<id>:8080`, or fails when
//! failure mode is on. [`MockBackend::hold`] parks every creation until
//! [`MockBackend::release`].

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::watch;

use teepool_core::{WorkerId, WorkerTemplate};

use crate::backend::{ProvisionError, ProvisionFuture, Provisioned, ProvisioningBackend};

pub struct MockBackend {
    delay_ms: AtomicU64,
    fail_create: AtomicBool,
    fail_destroy: AtomicBool,
    held: watch::Sender<bool>,
    creates: AtomicUsize,
    live: Mutex<HashSet<WorkerId>>,
    destroyed: Mutex<Vec<WorkerId>>,
}

impl MockBackend {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            fail_create: AtomicBool::new(false),
            fail_destroy: AtomicBool::new(false),
            held: watch::channel(false).0,
            creates: AtomicUsize::new(0),
            live: Mutex::new(HashSet::new()),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Park creations (new and in-flight) after their delay.
    pub fn hold(&self) {
        self.held.send_replace(true);
    }

    pub fn release(&self) {
        self.held.send_replace(false);
    }

    /// Number of `create` calls so far, including ones still running.
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    /// Workers created successfully and not yet destroyed.
    pub fn live(&self) -> usize {
        self.live.lock().map(|l| l.len()).unwrap_or_default()
    }

    pub fn destroyed(&self) -> Vec<WorkerId> {
        self.destroyed.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn endpoint_for(worker_id: WorkerId) -> String {
        format!("http://mock-{worker_id}:8080")
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}

impl ProvisioningBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn create<'a>(
        &'a self,
        worker_id: WorkerId,
        _template: &'a WorkerTemplate,
        _timeout: Duration,
    ) -> ProvisionFuture<'a, Provisioned> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let delay = Duration::from_millis(self.delay_ms.load(Ordering::SeqCst));
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            let mut held = self.held.subscribe();
            let _ = held.wait_for(|held| !held).await;
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(ProvisionError::Launch("mock launch failure".to_string()));
            }
            if let Ok(mut live) = self.live.lock() {
                live.insert(worker_id);
            }
            Ok(Provisioned {
                endpoint: Self::endpoint_for(worker_id),
                attestation_id: Some(format!("mock-att-{}", worker_id.get())),
            })
        })
    }

    fn destroy(&self, worker_id: WorkerId) -> ProvisionFuture<'_, ()> {
        Box::pin(async move {
            if let Ok(mut destroyed) = self.destroyed.lock() {
                destroyed.push(worker_id);
            }
            if let Ok(mut live) = self.live.lock() {
                live.remove(&worker_id);
            }
            if self.fail_destroy.load(Ordering::SeqCst) {
                return Err(ProvisionError::Teardown("mock teardown failure".to_string()));
            }
            Ok(())
        })
    }
}
