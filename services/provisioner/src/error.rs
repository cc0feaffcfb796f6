//! Provisioner error types.

use std::path::PathBuf;

use thiserror::Error;

use crate::store::StoreError;

/// A step of the bind or cleanup sequence failed.
///
/// Nothing is rolled back: every step is idempotent, so the sequence is
/// simply re-run on retry.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("couldn't append finalizer to claim {claim}: {source}")]
    AddFinalizer {
        claim: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't create local path {} for claim {claim}: {source}", .path.display())]
    CreateLocalPath {
        claim: String,
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("couldn't create volume {volume} for claim {claim}: {source}")]
    CreateVolume {
        claim: String,
        volume: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't remove local path {} of claim {claim}: {source}", .path.display())]
    RemoveLocalPath {
        claim: String,
        path: PathBuf,
        #[source]
        source: StoreError,
    },

    #[error("couldn't delete volume {volume} of claim {claim}: {source}")]
    DeleteVolume {
        claim: String,
        volume: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't remove finalizer from claim {claim}: {source}")]
    RemoveFinalizer {
        claim: String,
        #[source]
        source: StoreError,
    },
}

impl ProvisionError {
    /// The store error behind this failure.
    pub fn store_error(&self) -> &StoreError {
        match self {
            Self::AddFinalizer { source, .. }
            | Self::CreateLocalPath { source, .. }
            | Self::CreateVolume { source, .. }
            | Self::RemoveLocalPath { source, .. }
            | Self::DeleteVolume { source, .. }
            | Self::RemoveFinalizer { source, .. } => source,
        }
    }
}

/// Synchronizing a queued claim key failed; the key will be retried.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("couldn't read claim {key} from cache: {source}")]
    Cache {
        key: String,
        #[source]
        source: StoreError,
    },

    #[error("couldn't sync claim `{name}` in namespace `{namespace}`: {source}")]
    Provision {
        namespace: String,
        name: String,
        #[source]
        source: ProvisionError,
    },
}

/// Invalid static configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing {0}")]
    Missing(&'static str),

    #[error("local path must be absolute, got {0}")]
    RelativeLocalPath(String),

    #[error("worker count must be at least 1")]
    NoWorkers,
}
