//! Claim controller: binds the work queue to the provisioner.
//!
//! Event sources only enqueue claim keys. Workers pop a key, re-read the
//! claim from the cache and hand an owned copy to the provisioner; the event
//! that caused the key to be queued is never looked at.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use cephfs_reconcile::{
    run_workers, split_key, wait_for_shutdown, BackoffPolicy, Enqueuer, Reconcile, WorkQueue,
    WorkerPoolConfig,
};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::provisioner::Provisioner;
use crate::store::ClaimCache;

/// Name of the claim work queue.
pub const QUEUE_NAME: &str = "pvc";

/// Syncs a single claim key.
pub struct ClaimReconciler {
    cache: Arc<dyn ClaimCache>,
    provisioner: Provisioner,
}

impl ClaimReconciler {
    pub fn new(cache: Arc<dyn ClaimCache>, provisioner: Provisioner) -> Self {
        Self { cache, provisioner }
    }
}

#[async_trait]
impl Reconcile for ClaimReconciler {
    type Key = String;
    type Error = SyncError;

    async fn sync(&self, key: &String) -> Result<(), SyncError> {
        let started = Instant::now();

        let object_key = match split_key(key) {
            Ok(object_key) => object_key,
            Err(e) => {
                // Retrying cannot fix a malformed key.
                warn!(key = %key, error = %e, "Dropping invalid claim key");
                return Ok(());
            }
        };

        let cached = self.cache.get(&object_key).map_err(|source| SyncError::Cache {
            key: key.clone(),
            source,
        })?;
        let Some(cached) = cached else {
            debug!(key = %key, "Claim has been deleted");
            return Ok(());
        };

        // The cached snapshot is shared with other readers.
        let claim = cached.as_ref().clone();
        let (namespace, name) = (claim.namespace.clone(), claim.name.clone());

        let outcome = self
            .provisioner
            .handle(claim)
            .await
            .map_err(|source| SyncError::Provision {
                namespace,
                name,
                source,
            })?;

        debug!(
            key = %key,
            outcome = ?outcome,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished syncing claim"
        );
        Ok(())
    }
}

/// Controller configuration.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    pub workers: WorkerPoolConfig,
    pub backoff: BackoffPolicy,
}

/// The claim controller.
pub struct Controller {
    cache: Arc<dyn ClaimCache>,
    reconciler: Arc<ClaimReconciler>,
    queue: WorkQueue<String>,
    workers: WorkerPoolConfig,
}

impl Controller {
    pub fn new(cache: Arc<dyn ClaimCache>, provisioner: Provisioner, config: ControllerConfig) -> Self {
        Self {
            reconciler: Arc::new(ClaimReconciler::new(Arc::clone(&cache), provisioner)),
            cache,
            queue: WorkQueue::new(QUEUE_NAME, config.backoff),
            workers: config.workers,
        }
    }

    /// Capability for event sources to enqueue claim keys.
    pub fn enqueuer(&self) -> Enqueuer<String> {
        self.queue.enqueuer()
    }

    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Run until `shutdown` flips to `true`.
    ///
    /// Workers start only once the cache reports its initial sync.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting claim controller");

        let synced = tokio::select! {
            synced = self.cache.wait_for_sync() => synced,
            _ = wait_for_shutdown(&mut shutdown) => false,
        };

        if synced {
            info!("Claim cache synced");
            run_workers(
                self.queue.clone(),
                Arc::clone(&self.reconciler),
                self.workers.clone(),
                shutdown,
            )
            .await;
        } else {
            warn!("Claim cache never synced");
            self.queue.shut_down();
        }

        info!("Shutting down claim controller");
    }
}
