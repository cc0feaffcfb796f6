//! Worker pool driving a [`Reconcile`] implementation from a [`WorkQueue`].

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::queue::WorkQueue;

/// Level-triggered synchronization of a single key.
///
/// Implementations must re-read current state for the key on every call and
/// must be safe to call again after any failure.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    /// Key type carried by the queue.
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// Error returned by a failed sync; any error causes a rate-limited retry.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Bring the object identified by `key` to its desired state.
    async fn sync(&self, key: &Self::Key) -> Result<(), Self::Error>;
}

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent worker loops.
    pub workers: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { workers: 2 }
    }
}

/// Run `config.workers` worker loops until `shutdown` flips to `true`.
///
/// On shutdown the queue stops handing out keys, in-flight syncs are allowed
/// to finish, and this function returns once every worker has exited.
pub async fn run_workers<R: Reconcile>(
    queue: WorkQueue<R::Key>,
    reconciler: Arc<R>,
    config: WorkerPoolConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let workers = config.workers.max(1);
    info!(queue = %queue.name(), workers, "Starting workers");

    let mut tasks = JoinSet::new();
    for worker in 0..workers {
        let queue = queue.clone();
        let reconciler = Arc::clone(&reconciler);
        tasks.spawn(async move {
            debug!(worker, "Worker started");
            while process_next_item(worker, &queue, reconciler.as_ref()).await {}
            debug!(worker, "Worker exited");
        });
    }

    wait_for_shutdown(&mut shutdown).await;
    info!(queue = %queue.name(), "Shutting down workers");
    queue.shut_down();

    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "Worker task failed");
        }
    }

    info!(queue = %queue.name(), "All workers stopped");
}

/// Dequeue and sync one key. Returns `false` when the queue has shut down.
async fn process_next_item<R: Reconcile>(
    worker: usize,
    queue: &WorkQueue<R::Key>,
    reconciler: &R,
) -> bool {
    let Some(key) = queue.get().await else {
        return false;
    };

    // A panicking sync must not take the worker loop down with it.
    match AssertUnwindSafe(reconciler.sync(&key)).catch_unwind().await {
        Ok(Ok(())) => {
            queue.forget(&key);
        }
        Ok(Err(e)) => {
            warn!(
                worker,
                key = %key,
                error = %e,
                requeues = queue.num_requeues(&key),
                "Sync failed, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
        Err(panic) => {
            error!(
                worker,
                key = %key,
                panic = %panic_message(panic.as_ref()),
                "Sync panicked, requeueing"
            );
            queue.add_rate_limited(key.clone());
        }
    }

    queue.done(&key);
    true
}

/// Resolve once `shutdown` holds `true` or its sender is gone.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic payload"
    }
}
