//! cephfs-provisioner
//!
//! Provisions rook CephFS volumes for claims of a single storage class.

use std::sync::Arc;

use anyhow::Result;
use cephfs_provisioner::store::fs::FsLocalStore;
use cephfs_provisioner::store::k8s::{claim_watch, KubeStore};
use cephfs_provisioner::{Config, Controller, Provisioner};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    // Prefer RUST_LOG, fall back to the configured level
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    info!(
        storage_class = %config.storage_class,
        fs_name = %config.fs_name,
        cluster_namespace = %config.cluster_namespace,
        local_path = ?config.local_path,
        workers = config.workers,
        "Starting cephfs provisioner"
    );

    let client = match kube::Client::try_default().await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to create cluster client");
            return Err(e.into());
        }
    };

    let (cache, claim_watcher) = claim_watch(client.clone());
    let store = Arc::new(KubeStore::new(client));
    let provisioner = Provisioner::new(
        store.clone(),
        store,
        Arc::new(FsLocalStore::new()),
        config.provisioner_settings(),
    );
    let controller = Controller::new(Arc::new(cache), provisioner, config.controller_config());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let watch_handle = tokio::spawn({
        let enqueuer = controller.enqueuer();
        let shutdown_rx = shutdown_rx.clone();
        async move { claim_watcher.run(enqueuer, shutdown_rx).await }
    });

    let controller_handle = tokio::spawn(controller.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);

    let _ = watch_handle.await;
    let _ = controller_handle.await;

    info!("cephfs provisioner stopped");
    Ok(())
}
