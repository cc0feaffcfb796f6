//! Provisioning state machine.
//!
//! The state of a claim is derived from its fields on every call, never
//! stored:
//!
//! ```text
//! Ignored                   storage class unset or not ours
//! PendingUnbound  ──bind──▶ (finalizer, local path, volume exist)
//! Settled                   not pending, not terminating: nothing to do
//! Terminating     ──clean──▶ (local path, volume gone; finalizer removed)
//! Deferred                  terminating, another finalizer goes first
//! ```
//!
//! Every step checks or tolerates its own completion, so a sequence cut
//! short at any point converges when re-run.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::ProvisionError;
use crate::model::{Claim, ClaimPhase, ClaimReference, Volume, VolumeSource};
use crate::naming::{self, FINALIZER};
use crate::store::{ClaimStore, LocalStore, VolumeStore};

/// Static provisioner configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionerSettings {
    /// Only claims requesting this storage class are handled.
    pub storage_class: String,

    /// CephFS filesystem the volumes live in.
    pub fs_name: String,

    /// Namespace of the rook cluster.
    pub cluster_namespace: String,

    /// Where the whole filesystem is mounted locally.
    pub local_root: PathBuf,
}

/// Why a claim is ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    NoStorageClass,
    OtherStorageClass(String),
}

/// State of a claim from the provisioner's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimState {
    /// Not ours; never touched.
    Ignored(IgnoreReason),
    /// Pending and alive: needs a volume.
    PendingUnbound,
    /// Alive but not pending: nothing to do.
    Settled(ClaimPhase),
    /// Marked for deletion and our finalizer is first: clean up.
    Terminating,
    /// Marked for deletion but it is not our turn.
    Deferred { first: Option<String> },
}

impl ClaimState {
    /// Classify `claim` against `settings`.
    pub fn of(claim: &Claim, settings: &ProvisionerSettings) -> Self {
        match claim.storage_class.as_deref() {
            None => return Self::Ignored(IgnoreReason::NoStorageClass),
            Some(class) if class != settings.storage_class => {
                return Self::Ignored(IgnoreReason::OtherStorageClass(class.to_string()))
            }
            Some(_) => {}
        }

        if claim.is_terminating() {
            return match claim.first_finalizer() {
                Some(FINALIZER) => Self::Terminating,
                first => Self::Deferred {
                    first: first.map(str::to_string),
                },
            };
        }

        match claim.phase {
            ClaimPhase::Pending => Self::PendingUnbound,
            phase => Self::Settled(phase),
        }
    }
}

/// What a call to [`Provisioner::handle`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Ignored,
    Skipped,
    Deferred,
    /// The claim has a volume; carries the volume record.
    Provisioned(Box<Volume>),
    CleanedUp,
}

/// Provisions and reclaims CephFS-backed volumes for claims.
#[derive(Clone)]
pub struct Provisioner {
    claims: Arc<dyn ClaimStore>,
    volumes: Arc<dyn VolumeStore>,
    local: Arc<dyn LocalStore>,
    settings: ProvisionerSettings,
}

impl Provisioner {
    pub fn new(
        claims: Arc<dyn ClaimStore>,
        volumes: Arc<dyn VolumeStore>,
        local: Arc<dyn LocalStore>,
        settings: ProvisionerSettings,
    ) -> Self {
        Self {
            claims,
            volumes,
            local,
            settings,
        }
    }

    /// Bring the claim to its desired state. `claim` must be an owned copy.
    pub async fn handle(&self, claim: Claim) -> Result<SyncOutcome, ProvisionError> {
        match ClaimState::of(&claim, &self.settings) {
            ClaimState::Ignored(IgnoreReason::NoStorageClass) => {
                warn!(
                    namespace = %claim.namespace,
                    name = %claim.name,
                    "Ignored claim since its storage class is unset"
                );
                Ok(SyncOutcome::Ignored)
            }
            ClaimState::Ignored(IgnoreReason::OtherStorageClass(class)) => {
                debug!(
                    namespace = %claim.namespace,
                    name = %claim.name,
                    storage_class = %class,
                    expected = %self.settings.storage_class,
                    "Ignored claim with a different storage class"
                );
                Ok(SyncOutcome::Ignored)
            }
            ClaimState::Settled(phase) => {
                debug!(
                    namespace = %claim.namespace,
                    name = %claim.name,
                    phase = %phase,
                    "Skipping claim that is not pending"
                );
                Ok(SyncOutcome::Skipped)
            }
            ClaimState::Deferred { first } => {
                debug!(
                    namespace = %claim.namespace,
                    name = %claim.name,
                    first = ?first,
                    "Skipping cleanup since another finalizer is first"
                );
                Ok(SyncOutcome::Deferred)
            }
            ClaimState::PendingUnbound => self.bind(claim).await,
            ClaimState::Terminating => self.cleanup(claim).await,
        }
    }

    /// Name of the volume for `claim`.
    pub fn volume_name(&self, claim: &Claim) -> String {
        naming::volume_name(&claim.uid)
    }

    /// Local directory backing the volume of `claim`.
    pub fn local_path(&self, claim: &Claim) -> PathBuf {
        naming::local_path(&self.settings.local_root, &self.volume_name(claim))
    }

    /// The volume record `claim` should be bound to.
    pub fn volume_for(&self, claim: &Claim) -> Volume {
        let name = self.volume_name(claim);
        Volume {
            source: VolumeSource::RookCephFs {
                cluster_namespace: self.settings.cluster_namespace.clone(),
                fs_name: self.settings.fs_name.clone(),
                path: naming::driver_path(&name),
            },
            name,
            storage_class: self.settings.storage_class.clone(),
            access_modes: claim.access_modes.clone(),
            capacity: claim.requested_storage.clone(),
            claim_ref: ClaimReference::from(claim),
        }
    }

    // -------------------------------------------------------------------------
    // Bind
    // -------------------------------------------------------------------------

    async fn bind(&self, claim: Claim) -> Result<SyncOutcome, ProvisionError> {
        info!(namespace = %claim.namespace, name = %claim.name, "Started binding of claim");

        let claim = self.ensure_finalizer(claim).await?;
        self.ensure_local_path(&claim).await?;
        let volume = self.ensure_volume(&claim).await?;

        info!(
            namespace = %claim.namespace,
            name = %claim.name,
            volume = %volume.name,
            "Finished binding of claim"
        );
        Ok(SyncOutcome::Provisioned(Box::new(volume)))
    }

    async fn ensure_finalizer(&self, mut claim: Claim) -> Result<Claim, ProvisionError> {
        if claim.has_finalizer(FINALIZER) {
            debug!(namespace = %claim.namespace, name = %claim.name, "Finalizer already present");
            return Ok(claim);
        }

        claim.finalizers.push(FINALIZER.to_string());
        self.claims
            .update_claim(&claim)
            .await
            .map_err(|source| ProvisionError::AddFinalizer {
                claim: claim.key().to_string(),
                source,
            })
    }

    async fn ensure_local_path(&self, claim: &Claim) -> Result<(), ProvisionError> {
        let path = self.local_path(claim);
        let wrap = |source| ProvisionError::CreateLocalPath {
            claim: claim.key().to_string(),
            path: path.clone(),
            source,
        };

        if self.local.exists(&path).await.map_err(wrap)? {
            debug!(path = %path.display(), "Local path already exists");
            return Ok(());
        }

        debug!(path = %path.display(), "Creating local path");
        self.local.create_dir(&path).await.map_err(wrap)?;
        Ok(())
    }

    async fn ensure_volume(&self, claim: &Claim) -> Result<Volume, ProvisionError> {
        let volume = self.volume_for(claim);

        match self.volumes.create_volume(&volume).await {
            Ok(()) => {
                debug!(volume = %volume.name, "Created volume");
                Ok(volume)
            }
            Err(e) if e.is_already_exists() => {
                debug!(volume = %volume.name, "Volume already exists");
                Ok(volume)
            }
            Err(source) => Err(ProvisionError::CreateVolume {
                claim: claim.key().to_string(),
                volume: volume.name,
                source,
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Cleanup
    // -------------------------------------------------------------------------

    // Order matters: the finalizer goes last so that a crash part-way leaves
    // the claim pinned until a retry finishes the job.
    async fn cleanup(&self, claim: Claim) -> Result<SyncOutcome, ProvisionError> {
        info!(namespace = %claim.namespace, name = %claim.name, "Started cleanup of claim");

        self.remove_local_path(&claim).await?;
        self.delete_volume(&claim).await?;
        self.remove_finalizer(claim.clone()).await?;

        info!(namespace = %claim.namespace, name = %claim.name, "Finished cleanup of claim");
        Ok(SyncOutcome::CleanedUp)
    }

    async fn remove_local_path(&self, claim: &Claim) -> Result<(), ProvisionError> {
        let path = self.local_path(claim);
        debug!(path = %path.display(), "Removing local path");

        self.local
            .remove_all(&path)
            .await
            .map_err(|source| ProvisionError::RemoveLocalPath {
                claim: claim.key().to_string(),
                path,
                source,
            })
    }

    async fn delete_volume(&self, claim: &Claim) -> Result<(), ProvisionError> {
        let name = self.volume_name(claim);

        match self.volumes.delete_volume(&name).await {
            Ok(()) => {
                debug!(volume = %name, "Deleted volume");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(volume = %name, "Volume already gone");
                Ok(())
            }
            Err(source) => Err(ProvisionError::DeleteVolume {
                claim: claim.key().to_string(),
                volume: name,
                source,
            }),
        }
    }

    async fn remove_finalizer(&self, mut claim: Claim) -> Result<(), ProvisionError> {
        if claim.first_finalizer() != Some(FINALIZER) {
            return Ok(());
        }
        claim.finalizers.remove(0);

        match self.claims.update_claim(&claim).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(namespace = %claim.namespace, name = %claim.name, "Claim already gone");
                Ok(())
            }
            Err(source) => Err(ProvisionError::RemoveFinalizer {
                claim: claim.key().to_string(),
                source,
            }),
        }
    }
}
