//! Collaborator interfaces: the claim cache, the record store and the local
//! resource store.
//!
//! Implementations:
//! - `k8s`: Kubernetes API server (reflector-backed cache, typed APIs)
//! - `fs`: local filesystem directories
//! - `memory`: in-process stores for tests

pub mod fs;
pub mod k8s;
pub mod memory;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cephfs_reconcile::ObjectKey;
use thiserror::Error;

use crate::model::{Claim, Volume};

/// Store operation errors.
///
/// `NotFound` and `AlreadyExists` are distinguishable so callers can absorb
/// them where they mean "already done".
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} {name:?} already exists")]
    AlreadyExists { kind: &'static str, name: String },

    /// Optimistic concurrency failure; the caller should re-read and retry.
    #[error("conflict on {kind} {name:?}: {message}")]
    Conflict {
        kind: &'static str,
        name: String,
        message: String,
    },

    /// A record could not be interpreted.
    #[error("invalid {kind}: {message}")]
    Invalid { kind: &'static str, message: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Transport or server failure.
    #[error("backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Point-in-time, read-only view of claims maintained by a watch.
///
/// Returned claims are shared snapshots; callers clone before mutating.
#[async_trait]
pub trait ClaimCache: Send + Sync {
    /// Look up a claim by key. `Ok(None)` means the claim is gone.
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Claim>>, StoreError>;

    /// Resolve once the initial listing has been observed.
    ///
    /// Returns `false` if the cache can never become ready.
    async fn wait_for_sync(&self) -> bool;
}

/// Authoritative claim records.
#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Persist the claim's finalizer list, guarded by its resource version.
    ///
    /// Returns the stored claim.
    async fn update_claim(&self, claim: &Claim) -> Result<Claim, StoreError>;
}

/// Authoritative volume records.
#[async_trait]
pub trait VolumeStore: Send + Sync {
    /// Create a volume; fails with `AlreadyExists` if the name is taken.
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError>;

    /// Delete a volume by name; fails with `NotFound` if it does not exist.
    async fn delete_volume(&self, name: &str) -> Result<(), StoreError>;
}

/// Path-addressed resources backing volumes.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool, StoreError>;

    /// Create a single resource at `path`. Its parent must exist.
    async fn create_dir(&self, path: &Path) -> Result<(), StoreError>;

    /// Recursively remove `path`. Succeeds if nothing is there.
    async fn remove_all(&self, path: &Path) -> Result<(), StoreError>;
}
