//! Configuration for the provisioner.

use std::path::PathBuf;
use std::time::Duration;

use cephfs_reconcile::{BackoffPolicy, WorkerPoolConfig};
use clap::Parser;

use crate::controller::ControllerConfig;
use crate::error::ConfigError;
use crate::provisioner::ProvisionerSettings;

/// Provisions rook CephFS volumes for storage claims.
#[derive(Debug, Clone, Parser)]
#[command(name = "cephfs-provisioner")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// The name of the storage class whose claims should be provisioned.
    #[arg(long, env = "CEPHFS_PROVISIONER_STORAGE_CLASS", default_value = "")]
    pub storage_class: String,

    /// The name of the CephFS filesystem used for dynamic provisioning.
    #[arg(long, env = "CEPHFS_PROVISIONER_FS_NAME", default_value = "")]
    pub fs_name: String,

    /// The namespace containing the rook cluster.
    #[arg(long, env = "CEPHFS_PROVISIONER_CLUSTER_NAMESPACE", default_value = "")]
    pub cluster_namespace: String,

    /// The local path where the whole filesystem is mounted.
    #[arg(long, env = "CEPHFS_PROVISIONER_LOCAL_PATH")]
    pub local_path: Option<PathBuf>,

    /// Number of concurrent sync workers.
    #[arg(long, env = "CEPHFS_PROVISIONER_WORKERS", default_value_t = 2)]
    pub workers: usize,

    /// Delay before the first retry of a failed claim, in milliseconds.
    #[arg(long, env = "CEPHFS_PROVISIONER_BACKOFF_BASE_MS", default_value_t = 5)]
    pub backoff_base_ms: u64,

    /// Upper bound for retry delays, in seconds.
    #[arg(long, env = "CEPHFS_PROVISIONER_BACKOFF_MAX_SECS", default_value_t = 1000)]
    pub backoff_max_secs: u64,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` takes precedence.
    #[arg(long, env = "CEPHFS_PROVISIONER_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Check required settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_class.is_empty() {
            return Err(ConfigError::Missing("storage class name"));
        }
        if self.fs_name.is_empty() {
            return Err(ConfigError::Missing("fs name"));
        }
        if self.cluster_namespace.is_empty() {
            return Err(ConfigError::Missing("cluster namespace"));
        }
        let Some(local_path) = &self.local_path else {
            return Err(ConfigError::Missing("local path"));
        };
        if !local_path.is_absolute() {
            return Err(ConfigError::RelativeLocalPath(
                local_path.display().to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        Ok(())
    }

    /// Settings for the provisioner. Call after [`validate`](Self::validate).
    pub fn provisioner_settings(&self) -> ProvisionerSettings {
        ProvisionerSettings {
            storage_class: self.storage_class.clone(),
            fs_name: self.fs_name.clone(),
            cluster_namespace: self.cluster_namespace.clone(),
            local_root: self.local_path.clone().unwrap_or_default(),
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            workers: WorkerPoolConfig {
                workers: self.workers,
            },
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                max: Duration::from_secs(self.backoff_max_secs),
                ..BackoffPolicy::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> Config {
        let base = [
            "cephfs-provisioner",
            "--storage-class",
            "rook-cephfs",
            "--fs-name",
            "myfs",
            "--cluster-namespace",
            "rook-ceph",
            "--local-path",
            "/mnt/cephfs",
        ];
        Config::try_parse_from(base.iter().chain(extra).copied()).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]);
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.workers, 2);
        assert_eq!(config.log_level, "info");

        let controller = config.controller_config();
        assert_eq!(controller.backoff.base, Duration::from_millis(5));
        assert_eq!(controller.backoff.max, Duration::from_secs(1000));
    }

    #[test]
    fn test_settings() {
        let settings = parse(&[]).provisioner_settings();
        assert_eq!(settings.storage_class, "rook-cephfs");
        assert_eq!(settings.fs_name, "myfs");
        assert_eq!(settings.cluster_namespace, "rook-ceph");
        assert_eq!(settings.local_root, PathBuf::from("/mnt/cephfs"));
    }

    #[test]
    fn test_validate_rejects_missing_values() {
        let mut config = parse(&[]);
        config.fs_name.clear();
        assert_eq!(config.validate(), Err(ConfigError::Missing("fs name")));

        let mut config = parse(&[]);
        config.local_path = Some(PathBuf::from("relative/dir"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativeLocalPath(_))
        ));

        let mut config = parse(&[]);
        config.local_path = None;
        assert_eq!(config.validate(), Err(ConfigError::Missing("local path")));

        let config = parse(&["--workers", "0"]);
        assert_eq!(config.validate(), Err(ConfigError::NoWorkers));
    }
}
