//! Claim and volume records as seen by the provisioner.
//!
//! These are deliberately narrower than the records held by the store: they
//! carry exactly the fields the provisioner reads or writes.

use std::collections::BTreeMap;

use cephfs_reconcile::ObjectKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind used in volume back-references.
pub const CLAIM_KIND: &str = "PersistentVolumeClaim";

/// Lifecycle phase of a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimPhase {
    /// Not yet bound to a volume.
    Pending,
    /// Bound to a volume.
    Bound,
    /// The bound volume went missing.
    Lost,
    /// A phase this provisioner does not know about.
    Unknown,
}

impl ClaimPhase {
    /// Phase name as stored in claim status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Bound => "Bound",
            Self::Lost => "Lost",
            Self::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for ClaimPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub namespace: String,
    pub name: String,

    /// Immutable unique id assigned by the store.
    pub uid: String,

    /// Opaque version used for optimistic concurrency on update.
    pub resource_version: Option<String>,

    /// Requested storage class, if any.
    pub storage_class: Option<String>,

    pub access_modes: Vec<String>,

    /// Requested capacity as a quantity string (e.g. `10Gi`).
    pub requested_storage: Option<String>,

    pub phase: ClaimPhase,

    /// Ordered finalizer tokens.
    pub finalizers: Vec<String>,

    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl Claim {
    /// Structural identity of this claim.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::namespaced(&self.namespace, &self.name)
    }

    /// Whether `token` is anywhere in the finalizer list.
    pub fn has_finalizer(&self, token: &str) -> bool {
        self.finalizers.iter().any(|f| f == token)
    }

    /// The finalizer that currently has to act first, if any.
    pub fn first_finalizer(&self) -> Option<&str> {
        self.finalizers.first().map(String::as_str)
    }

    /// Whether the claim has been marked for deletion.
    pub fn is_terminating(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

/// Back-reference from a volume to the claim it was provisioned for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimReference {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
    pub resource_version: Option<String>,
}

impl From<&Claim> for ClaimReference {
    fn from(claim: &Claim) -> Self {
        Self {
            kind: CLAIM_KIND.to_string(),
            namespace: claim.namespace.clone(),
            name: claim.name.clone(),
            uid: claim.uid.clone(),
            resource_version: claim.resource_version.clone(),
        }
    }
}

/// Driver-specific volume parameters.
///
/// One variant per storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "driver", rename_all = "camelCase")]
pub enum VolumeSource {
    /// A directory inside a rook-managed CephFS filesystem.
    #[serde(rename_all = "camelCase")]
    RookCephFs {
        cluster_namespace: String,
        fs_name: String,
        /// Path inside the filesystem, rooted at `/`.
        path: String,
    },
}

impl VolumeSource {
    /// Name of the volume driver.
    pub fn driver(&self) -> &'static str {
        match self {
            Self::RookCephFs { .. } => "ceph.rook.io/rook",
        }
    }

    /// Filesystem type passed to the driver.
    pub fn fs_type(&self) -> &'static str {
        match self {
            Self::RookCephFs { .. } => "ceph",
        }
    }

    /// Driver options.
    pub fn options(&self) -> BTreeMap<String, String> {
        match self {
            Self::RookCephFs {
                cluster_namespace,
                fs_name,
                path,
            } => BTreeMap::from([
                ("clusterNamespace".to_string(), cluster_namespace.clone()),
                ("fsName".to_string(), fs_name.clone()),
                ("path".to_string(), path.clone()),
            ]),
        }
    }
}

/// A provisioned volume record. Never mutated once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Derived from the claim uid, see [`crate::naming::volume_name`].
    pub name: String,
    pub storage_class: String,
    pub access_modes: Vec<String>,
    /// Capacity mirrored from the claim request.
    pub capacity: Option<String>,
    pub claim_ref: ClaimReference,
    pub source: VolumeSource,
}
