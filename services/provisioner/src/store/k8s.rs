//! Kubernetes-backed stores.
//!
//! - [`KubeClaimCache`] / [`ClaimWatch`]: a reflector over all
//!   PersistentVolumeClaims. The watch feeds the reflector store and hands
//!   the key of every touched claim to the work queue.
//! - [`KubeStore`]: claim updates and PersistentVolume create/delete through
//!   the API server.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use cephfs_reconcile::{wait_for_shutdown, Enqueuer, ObjectKey};
use futures_util::StreamExt;
use k8s_openapi::api::core::v1::{
    FlexPersistentVolumeSource, ObjectReference, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ClaimCache, ClaimStore, StoreError, VolumeStore};
use crate::model::{Claim, ClaimPhase, Volume};

/// Resource name of requested/provisioned storage.
const STORAGE_RESOURCE: &str = "storage";

// =============================================================================
// Change source
// =============================================================================

/// Read side of the claim reflector.
#[derive(Clone)]
pub struct KubeClaimCache {
    reader: Store<PersistentVolumeClaim>,
}

/// Write side of the claim reflector; drives the watch.
pub struct ClaimWatch {
    api: Api<PersistentVolumeClaim>,
    writer: reflector::store::Writer<PersistentVolumeClaim>,
}

/// Set up a cluster-wide claim watch and the cache it maintains.
pub fn claim_watch(client: Client) -> (KubeClaimCache, ClaimWatch) {
    let (reader, writer) = reflector::store();
    (
        KubeClaimCache { reader },
        ClaimWatch {
            api: Api::all(client),
            writer,
        },
    )
}

impl ClaimWatch {
    /// Run the watch until shutdown, enqueueing the key of every added,
    /// updated or deleted claim.
    pub async fn run(self, enqueuer: Enqueuer<String>, mut shutdown: watch::Receiver<bool>) {
        info!("Starting claim watch");

        let stream = watcher(self.api, watcher::Config::default())
            .default_backoff()
            .reflect(self.writer)
            .touched_objects();
        let mut stream = std::pin::pin!(stream);

        loop {
            tokio::select! {
                event = stream.next() => match event {
                    Some(Ok(pvc)) => match claim_key(&pvc) {
                        Some(key) => {
                            debug!(key = %key, "Claim changed");
                            enqueuer.enqueue(key.to_string());
                        }
                        None => warn!("Couldn't get key for claim without name"),
                    },
                    Some(Err(e)) => {
                        warn!(error = %e, "Claim watch error, retrying");
                    }
                    None => {
                        warn!("Claim watch stream ended");
                        break;
                    }
                },
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Claim watch shutting down");
                    break;
                }
            }
        }
    }
}

fn claim_key(pvc: &PersistentVolumeClaim) -> Option<ObjectKey> {
    let name = pvc.metadata.name.clone()?;
    Some(ObjectKey {
        namespace: pvc.metadata.namespace.clone(),
        name,
    })
}

#[async_trait]
impl ClaimCache for KubeClaimCache {
    fn get(&self, key: &ObjectKey) -> Result<Option<Arc<Claim>>, StoreError> {
        let mut obj_ref = ObjectRef::<PersistentVolumeClaim>::new(&key.name);
        if let Some(ns) = &key.namespace {
            obj_ref = obj_ref.within(ns);
        }

        self.reader
            .get(&obj_ref)
            .map(|pvc| claim_from_pvc(&pvc).map(Arc::new))
            .transpose()
    }

    async fn wait_for_sync(&self) -> bool {
        self.reader.wait_until_ready().await.is_ok()
    }
}

// =============================================================================
// Record store
// =============================================================================

/// Claim and volume records in the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClaimStore for KubeStore {
    async fn update_claim(&self, claim: &Claim) -> Result<Claim, StoreError> {
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(self.client.clone(), &claim.namespace);

        // resourceVersion turns the merge patch into a compare-and-swap.
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": claim.finalizers,
                "resourceVersion": claim.resource_version,
            }
        });

        let pvc = api
            .patch(&claim.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_kube_error("claim", &claim.key().to_string(), e))?;

        claim_from_pvc(&pvc)
    }
}

#[async_trait]
impl VolumeStore for KubeStore {
    async fn create_volume(&self, volume: &Volume) -> Result<(), StoreError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.create(&PostParams::default(), &pv_from_volume(volume))
            .await
            .map_err(|e| map_kube_error("volume", &volume.name, e))?;
        Ok(())
    }

    async fn delete_volume(&self, name: &str) -> Result<(), StoreError> {
        let api: Api<PersistentVolume> = Api::all(self.client.clone());
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| map_kube_error("volume", name, e))?;
        Ok(())
    }
}

/// Classify API errors into the store taxonomy.
fn map_kube_error(kind: &'static str, name: &str, err: kube::Error) -> StoreError {
    if let kube::Error::Api(resp) = &err {
        let name = name.to_string();
        if resp.code == 404 {
            return StoreError::NotFound { kind, name };
        }
        if resp.reason == "AlreadyExists" {
            return StoreError::AlreadyExists { kind, name };
        }
        if resp.code == 409 {
            return StoreError::Conflict {
                kind,
                name,
                message: resp.message.clone(),
            };
        }
    }
    StoreError::Backend(Box::new(err))
}

// =============================================================================
// Conversions
// =============================================================================

fn invalid(message: impl Into<String>) -> StoreError {
    StoreError::Invalid {
        kind: "claim",
        message: message.into(),
    }
}

/// Project a PersistentVolumeClaim onto the fields the provisioner uses.
pub fn claim_from_pvc(pvc: &PersistentVolumeClaim) -> Result<Claim, StoreError> {
    let meta = &pvc.metadata;
    let name = meta.name.clone().ok_or_else(|| invalid("missing name"))?;
    let namespace = meta
        .namespace
        .clone()
        .ok_or_else(|| invalid(format!("claim {name} has no namespace")))?;
    let uid = meta
        .uid
        .clone()
        .ok_or_else(|| invalid(format!("claim {namespace}/{name} has no uid")))?;

    let phase = match pvc.status.as_ref().and_then(|s| s.phase.as_deref()) {
        None | Some("Pending") => ClaimPhase::Pending,
        Some("Bound") => ClaimPhase::Bound,
        Some("Lost") => ClaimPhase::Lost,
        Some(other) => {
            debug!(namespace = %namespace, name = %name, phase = %other, "Claim has unknown phase");
            ClaimPhase::Unknown
        }
    };

    let spec = pvc.spec.as_ref();
    let requested_storage = spec
        .and_then(|s| s.resources.as_ref())
        .and_then(|r| r.requests.as_ref())
        .and_then(|r| r.get(STORAGE_RESOURCE))
        .map(|q| q.0.clone());

    Ok(Claim {
        namespace,
        name,
        uid,
        resource_version: meta.resource_version.clone(),
        storage_class: spec.and_then(|s| s.storage_class_name.clone()),
        access_modes: spec
            .and_then(|s| s.access_modes.clone())
            .unwrap_or_default(),
        requested_storage,
        phase,
        finalizers: meta.finalizers.clone().unwrap_or_default(),
        deletion_timestamp: meta.deletion_timestamp.as_ref().map(|t| t.0),
    })
}

/// Render a volume record as a PersistentVolume.
pub fn pv_from_volume(volume: &Volume) -> PersistentVolume {
    let claim_ref = &volume.claim_ref;

    PersistentVolume {
        metadata: ObjectMeta {
            name: Some(volume.name.clone()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeSpec {
            storage_class_name: Some(volume.storage_class.clone()),
            access_modes: Some(volume.access_modes.clone()),
            capacity: volume.capacity.as_ref().map(|capacity| {
                BTreeMap::from([(STORAGE_RESOURCE.to_string(), Quantity(capacity.clone()))])
            }),
            claim_ref: Some(ObjectReference {
                api_version: Some("v1".to_string()),
                kind: Some(claim_ref.kind.clone()),
                namespace: Some(claim_ref.namespace.clone()),
                name: Some(claim_ref.name.clone()),
                uid: Some(claim_ref.uid.clone()),
                resource_version: claim_ref.resource_version.clone(),
                ..Default::default()
            }),
            flex_volume: Some(FlexPersistentVolumeSource {
                driver: volume.source.driver().to_string(),
                fs_type: Some(volume.source.fs_type().to_string()),
                options: Some(volume.source.options()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClaimReference, VolumeSource};
    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimSpec, PersistentVolumeClaimStatus, VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn pvc(phase: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("data".to_string()),
                namespace: Some("default".to_string()),
                uid: Some("1234".to_string()),
                resource_version: Some("42".to_string()),
                finalizers: Some(vec!["kubernetes.io/pvc-protection".to_string()]),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: Some("rook-cephfs".to_string()),
                access_modes: Some(vec!["ReadWriteMany".to_string()]),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity("5Gi".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: phase.map(|p| PersistentVolumeClaimStatus {
                phase: Some(p.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_claim_from_pvc() {
        let claim = claim_from_pvc(&pvc(Some("Pending"))).unwrap();

        assert_eq!(claim.key().to_string(), "default/data");
        assert_eq!(claim.uid, "1234");
        assert_eq!(claim.resource_version.as_deref(), Some("42"));
        assert_eq!(claim.storage_class.as_deref(), Some("rook-cephfs"));
        assert_eq!(claim.requested_storage.as_deref(), Some("5Gi"));
        assert_eq!(claim.phase, ClaimPhase::Pending);
        assert_eq!(claim.finalizers, vec!["kubernetes.io/pvc-protection"]);
        assert!(!claim.is_terminating());
    }

    #[test]
    fn test_claim_from_pvc_phases() {
        assert_eq!(claim_from_pvc(&pvc(None)).unwrap().phase, ClaimPhase::Pending);
        assert_eq!(claim_from_pvc(&pvc(Some("Bound"))).unwrap().phase, ClaimPhase::Bound);
        assert_eq!(claim_from_pvc(&pvc(Some("Lost"))).unwrap().phase, ClaimPhase::Lost);
        assert_eq!(
            claim_from_pvc(&pvc(Some("Exploded"))).unwrap().phase,
            ClaimPhase::Unknown
        );
    }

    #[test]
    fn test_claim_from_terminating_pvc() {
        let mut terminating = pvc(Some("Bound"));
        terminating.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));

        assert!(claim_from_pvc(&terminating).unwrap().is_terminating());
    }

    #[test]
    fn test_claim_from_pvc_requires_uid() {
        let mut no_uid = pvc(None);
        no_uid.metadata.uid = None;

        assert!(matches!(
            claim_from_pvc(&no_uid),
            Err(StoreError::Invalid { .. })
        ));
    }

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} for test"),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_map_kube_error() {
        assert!(map_kube_error("volume", "pvc-1", api_error(404, "NotFound")).is_not_found());
        assert!(
            map_kube_error("volume", "pvc-1", api_error(409, "AlreadyExists")).is_already_exists()
        );
        assert!(map_kube_error("claim", "default/data", api_error(409, "Conflict")).is_conflict());
        assert!(matches!(
            map_kube_error("claim", "default/data", api_error(500, "InternalError")),
            StoreError::Backend(_)
        ));
    }

    #[test]
    fn test_pv_from_volume() {
        let volume = Volume {
            name: "pvc-1234".to_string(),
            storage_class: "rook-cephfs".to_string(),
            access_modes: vec!["ReadWriteMany".to_string()],
            capacity: Some("5Gi".to_string()),
            claim_ref: ClaimReference {
                kind: "PersistentVolumeClaim".to_string(),
                namespace: "default".to_string(),
                name: "data".to_string(),
                uid: "1234".to_string(),
                resource_version: Some("43".to_string()),
            },
            source: VolumeSource::RookCephFs {
                cluster_namespace: "rook-ceph".to_string(),
                fs_name: "myfs".to_string(),
                path: "/pvc-1234".to_string(),
            },
        };

        let pv = pv_from_volume(&volume);
        assert_eq!(pv.metadata.name.as_deref(), Some("pvc-1234"));

        let spec = pv.spec.unwrap();
        assert_eq!(spec.storage_class_name.as_deref(), Some("rook-cephfs"));
        assert_eq!(spec.capacity.unwrap()["storage"], Quantity("5Gi".to_string()));

        let claim_ref = spec.claim_ref.unwrap();
        assert_eq!(claim_ref.uid.as_deref(), Some("1234"));
        assert_eq!(claim_ref.kind.as_deref(), Some("PersistentVolumeClaim"));

        let flex = spec.flex_volume.unwrap();
        assert_eq!(flex.driver, "ceph.rook.io/rook");
        assert_eq!(flex.fs_type.as_deref(), Some("ceph"));
        let options = flex.options.unwrap();
        assert_eq!(options["path"], "/pvc-1234");
        assert_eq!(options["fsName"], "myfs");
        assert_eq!(options["clusterNamespace"], "rook-ceph");
    }
}
