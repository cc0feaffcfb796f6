//! Dynamic CephFS provisioner.
//!
//! Watches storage claims of one storage class and, for each claim, keeps a
//! finalizer, a directory on the mounted CephFS root and a flex volume in
//! step with the claim's lifecycle. Cleanup of the directory and volume is
//! guarded by the finalizer, so a deleted claim only disappears once both
//! are gone.
//!
//! ## Modules
//!
//! - [`config`]: command line and environment configuration
//! - [`controller`]: work queue and worker pool wired to the provisioner
//! - [`provisioner`]: per-claim state machine with idempotent bind and cleanup
//! - [`store`]: backends for claims, volumes and local directories
//! - [`model`], [`naming`]: domain types and derived names

pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod naming;
pub mod provisioner;
pub mod store;

pub use config::Config;
pub use controller::{ClaimReconciler, Controller, ControllerConfig};
pub use error::{ConfigError, ProvisionError, SyncError};
pub use provisioner::{ClaimState, Provisioner, ProvisionerSettings, SyncOutcome};
