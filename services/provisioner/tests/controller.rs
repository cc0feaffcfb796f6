//! Integration tests for the claim controller.
//!
//! Runs the full controller (queue, workers, provisioner) against the
//! in-memory store, which feeds claim keys to the queue the way the claim
//! watch does in a cluster.

use std::sync::Arc;
use std::time::Duration;

use cephfs_provisioner::model::{Claim, ClaimPhase};
use cephfs_provisioner::naming::FINALIZER;
use cephfs_provisioner::store::memory::{MemoryLocalStore, MemoryStore, Operation};
use cephfs_provisioner::{Controller, ControllerConfig, Provisioner, ProvisionerSettings};
use cephfs_reconcile::{BackoffPolicy, WorkerPoolConfig};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

fn test_config(workers: usize) -> ControllerConfig {
    ControllerConfig {
        workers: WorkerPoolConfig { workers },
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(50),
            ..BackoffPolicy::default()
        },
    }
}

fn test_claim(name: &str) -> Claim {
    Claim {
        namespace: "default".to_string(),
        name: name.to_string(),
        uid: format!("uid-{name}"),
        resource_version: None,
        storage_class: Some("rook-cephfs".to_string()),
        access_modes: vec!["ReadWriteMany".to_string()],
        requested_storage: Some("1Gi".to_string()),
        phase: ClaimPhase::Pending,
        finalizers: vec![],
        deletion_timestamp: None,
    }
}

struct Running {
    store: Arc<MemoryStore>,
    local: Arc<MemoryLocalStore>,
    queue: cephfs_reconcile::WorkQueue<String>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Running {
    fn start(store: MemoryStore, workers: usize) -> Self {
        let store = Arc::new(store);
        let local = Arc::new(MemoryLocalStore::new());
        let provisioner = Provisioner::new(
            store.clone(),
            store.clone(),
            local.clone(),
            ProvisionerSettings {
                storage_class: "rook-cephfs".to_string(),
                fs_name: "myfs".to_string(),
                cluster_namespace: "rook-ceph".to_string(),
                local_root: "/mnt/cephfs".into(),
            },
        );
        let controller = Controller::new(store.clone(), provisioner, test_config(workers));
        store.subscribe(controller.enqueuer());
        let queue = controller.queue().clone();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(controller.run(shutdown_rx));

        Self {
            store,
            local,
            queue,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        self.shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("controller stops")
            .unwrap();
        assert!(self.queue.is_shutting_down());
    }
}

/// Poll `check` until it holds or a few seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_claim_lifecycle() {
    let running = Running::start(MemoryStore::new(), 2);
    let claim = running.store.put_claim(test_claim("data"));

    eventually(|| running.store.volume("pvc-uid-data").is_some()).await;
    let stored = running.store.claim(&claim.key()).unwrap();
    assert_eq!(stored.finalizers, vec![FINALIZER.to_string()]);
    assert_eq!(running.local.len(), 1);

    let mut deleted = stored;
    deleted.deletion_timestamp = Some(Utc::now());
    running.store.put_claim(deleted);

    eventually(|| running.store.claim(&claim.key()).is_none()).await;
    assert_eq!(running.store.volume_count(), 0);
    assert!(running.local.is_empty());

    running.stop().await;
}

#[tokio::test]
async fn test_existing_claims_are_synced_on_start() {
    let store = MemoryStore::new();
    for name in ["a", "b", "c"] {
        store.put_claim(test_claim(name));
    }
    let mut other = test_claim("other");
    other.storage_class = Some("standard".to_string());
    store.put_claim(other);

    let running = Running::start(store, 2);

    eventually(|| running.store.volume_count() == 3).await;
    assert_eq!(running.local.len(), 3);

    running.stop().await;
}

#[tokio::test]
async fn test_workers_wait_for_cache_sync() {
    let running = Running::start(MemoryStore::unsynced(), 1);
    running.store.put_claim(test_claim("data"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(running.store.calls().total(), 0);
    assert_eq!(running.queue.len(), 1);

    running.store.mark_synced();
    eventually(|| running.store.volume("pvc-uid-data").is_some()).await;

    running.stop().await;
}

#[tokio::test]
async fn test_shutdown_before_sync() {
    let running = Running::start(MemoryStore::unsynced(), 1);
    running.store.put_claim(test_claim("data"));

    running.shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), running.handle)
        .await
        .expect("controller stops")
        .unwrap();

    assert!(running.queue.is_shutting_down());
    assert_eq!(running.store.calls().total(), 0);
}

#[tokio::test]
async fn test_failed_sync_is_retried() {
    let store = MemoryStore::new();
    store.fail_next(Operation::CreateVolume);
    let running = Running::start(store, 1);
    let claim = running.store.put_claim(test_claim("data"));

    eventually(|| running.store.volume("pvc-uid-data").is_some()).await;
    assert!(running.store.calls().create_volume >= 2);
    assert_eq!(running.store.mutations().create_volume, 1);

    // Success resets the retry history.
    let key = claim.key().to_string();
    eventually(|| running.queue.num_requeues(&key) == 0).await;

    running.stop().await;
}

#[tokio::test]
async fn test_invalid_key_is_dropped() {
    let running = Running::start(MemoryStore::new(), 1);
    let enqueuer = running.queue.enqueuer();

    enqueuer.enqueue("too/many/parts".to_string());
    enqueuer.enqueue("default/missing".to_string());
    running.store.put_claim(test_claim("data"));

    eventually(|| running.store.volume("pvc-uid-data").is_some()).await;
    eventually(|| running.queue.is_empty()).await;
    assert_eq!(running.queue.num_requeues(&"too/many/parts".to_string()), 0);
    assert_eq!(running.queue.num_requeues(&"default/missing".to_string()), 0);

    running.stop().await;
}
