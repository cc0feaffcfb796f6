//! In-memory stores for testing and development.
//!
//! [`MemoryStore`] plays the change source, claim store and volume store at
//! once, with the observable behavior of the real API server that the
//! provisioner depends on:
//! - every write bumps the resource version; stale writes fail with `Conflict`
//! - a terminating claim disappears once its finalizer list is empty
//! - subscribed enqueuers receive the key of every claim change
//!
//! Both stores count calls and applied mutations, and can be told to fail the
//! next call of a given operation.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use cephfs_reconcile::{Enqueuer, ObjectKey};
use tokio::sync::watch;
use tracing::debug;

use super::{ClaimCache, ClaimStore, LocalStore, StoreError, VolumeStore};
use crate::model::{Claim, Volume};

/// Operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    UpdateClaim,
    CreateVolume,
    DeleteVolume,
    CreateDir,
    RemoveAll,
}

/// Per-operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub update_claim: usize,
    pub create_volume: usize,
    pub delete_volume: usize,
    pub create_dir: usize,
    pub remove_all: usize,
}

impl OpCounts {
    fn bump(&mut self, op: Operation) {
        let slot = match op {
            Operation::UpdateClaim => &mut self.update_claim,
            Operation::CreateVolume => &mut self.create_volume,
            Operation::DeleteVolume => &mut self.delete_volume,
            Operation::CreateDir => &mut self.create_dir,
            Operation::RemoveAll => &mut self.remove_all,
        };
        *slot += 1;
    }

    /// Sum over all operations.
    pub fn total(&self) -> usize {
        self.update_claim + self.create_volume + self.delete_volume + self.create_dir + self.remove_all
    }
}

#[derive(Debug, Default)]
struct Recorder {
    calls: OpCounts,
    mutations: OpCounts,
    fail_next: HashSet<Operation>,
}

impl Recorder {
    /// Count a call and consume an injected failure, if any.
    fn call(&mut self, op: Operation) -> Result<(), StoreError> {
        self.calls.bump(op);
        if self.fail_next.remove(&op) {
            return Err(StoreError::Backend(
                format!("injected failure for {op:?}").into(),
            ));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Claims and volumes
// =============================================================================

/// In-memory claim cache, claim store and volume store.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    synced: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    claims: BTreeMap<ObjectKey, Arc<Claim>>,
    volumes: BTreeMap<String, Volume>,
    next_version: u64,
    subscribers: Vec<Enqueuer<String>>,
    recorder: Recorder,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }

    /// Store `claim`, or drop it if it is terminating with no finalizers left.
    fn put_claim(&mut self, mut claim: Claim) -> Claim {
        claim.resource_version = Some(self.next_version());
        let key = claim.key();
        if claim.is_terminating() && claim.finalizers.is_empty() {
            debug!(key = %key, "[MEMORY] Claim finalized, removing");
            self.claims.remove(&key);
        } else {
            self.claims.insert(key, Arc::new(claim.clone()));
        }
        claim
    }
}

impl MemoryStore {
    /// Create a store whose cache reports as synced.
    pub fn new() -> Self {
        Self::with_synced(true)
    }

    /// Create a store whose cache is not synced until [`mark_synced`](Self::mark_synced).
    pub fn unsynced() -> Self {
        Self::with_synced(false)
    }

    fn with_synced(synced: bool) -> Self {
        let (synced, _) = watch::channel(synced);
        Self {
            inner: Mutex::new(Inner::default()),
            synced,
        }
    }

    /// Report the initial listing as complete.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Deliver the key of every existing and future claim to `enqueuer`.
    pub fn subscribe(&self, enqueuer: Enqueuer<String>) {
        let keys: Vec<String> = {
            let mut inner = lock(&self.inner);
            inner.subscribers.push(enqueuer.clone());
            inner.claims.keys().map(ToString::to_string).collect()
        };
        for key in keys {
            enqueuer.enqueue(key);
        }
    }

    /// Create or overwrite a claim as an external actor would.
    ///
    /// No version check is made; returns the stored claim.
    pub fn put_claim(&self, claim: Claim) -> Claim {
        let key = claim.key().to_string();
        let (stored, subscribers) = {
            let mut inner = lock(&self.inner);
            let stored = inner.put_claim(claim);
            (stored, inner.subscribers.clone())
        };
        notify(&subscribers, &key);
        stored
    }

    /// Current claim for `key`, if present.
    pub fn claim(&self, key: &ObjectKey) -> Option<Claim> {
        lock(&self.inner)
            .claims
            .get(key)
            .map(|claim| claim.as_ref().clone())
    }

    /// Volume by name, if present.
    pub fn volume(&self, name: &str) -> Option<Volume> {
        lock(&self.inner).volumes.get(name).cloned()
    }

    /// Number of stored volumes.
    pub fn volume_count(&self) -> usize {
        lock(&self.inner).volumes.len()
    }

    /// Make the next call of `op` fail with a backend error.
    pub fn fail_next(&self, op: Operation) {
        lock(&self.inner).recorder.fail_next.insert(op);
    }

    /// Calls made, including failed ones.
    pub fn calls(&self) -> OpCounts {
        lock(&self.inner).recorder.calls
    }

    /// Calls that changed stored state.
    pub fn mutations(&self) -> OpCounts {
        lock(&self.inner).recorder.mutations
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn notify(subscribers: &[Enqueuer<String>], key: &str) {
    for subscriber in subscribers {
        subscriber.enqueue(key.to_string());
    }
}

#[async_trait]
impl ClaimCache for MemoryStore {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Claim>>, StoreError> {
        Ok(lock(&self.inner).claims.get(key).cloned())
    }

    async fn wait_for_sync(&self) -> bool {
        let mut synced = self.synced.subscribe();
        // Bound to a local so the borrowed guard drops before the receiver.
        let ready = synced.wait_for(|synced| *synced).await.is_ok();
        ready
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn update_claim(&self, claim: &Claim) -> Result<Claim, StoreError> {
        let key = claim.key();
        let (stored, subscribers) = {
            let mut inner = lock(&self.inner);
            inner.recorder.call(Operation::UpdateClaim)?;

            let current = inner.claims.get(&key).ok_or_else(|| StoreError::NotFound {
                kind: "claim",
                name: key.to_string(),
            })?;
            if claim.resource_version.is_some()
                && claim.resource_version != current.resource_version
            {
                return Err(StoreError::Conflict {
                    kind: "claim",
                    name: key.to_string(),
                    message: format!(
                        "resource version {:?} is stale, current is {:?}",
                        claim.resource_version, current.resource_version
                    ),
                });
            }

            // Only the finalizer list is writable through this store.
            let mut updated = current.as_ref().clone();
            updated.finalizers = claim.finalizers.clone();

            inner.recorder.mutations.bump(Operation::UpdateClaim);
            let stored = inner.put_claim(updated);
            (stored, inner.subscribers.clone())
        };

        notify(&subscribers, &key.to_string());
        Ok(stored)
    }
}

#[async_trait]
impl VolumeStore for MemoryStore {
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        inner.recorder.call(Operation::CreateVolume)?;

        if inner.volumes.contains_key(&volume.name) {
            return Err(StoreError::AlreadyExists {
                kind: "volume",
                name: volume.name.clone(),
            });
        }

        inner.recorder.mutations.bump(Operation::CreateVolume);
        inner.volumes.insert(volume.name.clone(), volume.clone());
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        inner.recorder.call(Operation::DeleteVolume)?;

        if inner.volumes.remove(name).is_none() {
            return Err(StoreError::NotFound {
                kind: "volume",
                name: name.to_string(),
            });
        }

        inner.recorder.mutations.bump(Operation::DeleteVolume);
        Ok(())
    }
}

// =============================================================================
// Local resources
// =============================================================================

/// In-memory local resource store: a set of directory paths.
#[derive(Default)]
pub struct MemoryLocalStore {
    inner: Mutex<LocalInner>,
}

#[derive(Default)]
struct LocalInner {
    dirs: BTreeSet<PathBuf>,
    recorder: Recorder,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a resource exists at `path`.
    pub fn contains(&self, path: &Path) -> bool {
        lock(&self.inner).dirs.contains(path)
    }

    /// Number of existing resources.
    pub fn len(&self) -> usize {
        lock(&self.inner).dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make the next call of `op` fail with a backend error.
    pub fn fail_next(&self, op: Operation) {
        lock(&self.inner).recorder.fail_next.insert(op);
    }

    /// Calls made, including failed ones.
    pub fn calls(&self) -> OpCounts {
        lock(&self.inner).recorder.calls
    }

    /// Calls that changed stored state.
    pub fn mutations(&self) -> OpCounts {
        lock(&self.inner).recorder.mutations
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn exists(&self, path: &Path) -> Result<bool, StoreError> {
        Ok(self.contains(path))
    }

    async fn create_dir(&self, path: &Path) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        inner.recorder.call(Operation::CreateDir)?;
        if inner.dirs.insert(path.to_path_buf()) {
            inner.recorder.mutations.bump(Operation::CreateDir);
        }
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<(), StoreError> {
        let mut inner = lock(&self.inner);
        inner.recorder.call(Operation::RemoveAll)?;
        let before = inner.dirs.len();
        inner.dirs.retain(|dir| !dir.starts_with(path));
        if inner.dirs.len() != before {
            inner.recorder.mutations.bump(Operation::RemoveAll);
        }
        Ok(())
    }
}
