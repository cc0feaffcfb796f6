//! Deterministic names and paths.
//!
//! Everything here is a pure function of the claim uid (and configuration),
//! so lookups, creates and deletes hit the same objects across retries and
//! restarts.

use std::path::{Path, PathBuf};

/// Finalizer token owned by this controller.
pub const FINALIZER: &str = "nect.com/rook-cephfs-provisioner";

/// Prefix of every provisioned volume name.
pub const VOLUME_NAME_PREFIX: &str = "pvc-";

/// Volume name for the claim with `uid`.
pub fn volume_name(uid: &str) -> String {
    format!("{VOLUME_NAME_PREFIX}{uid}")
}

/// Local directory backing `volume_name` under `root`.
pub fn local_path(root: &Path, volume_name: &str) -> PathBuf {
    root.join(volume_name)
}

/// Path of the volume inside the shared filesystem.
pub fn driver_path(volume_name: &str) -> String {
    format!("/{volume_name}")
}
