//! Local resource store backed by directories on a mounted filesystem.

use std::io::ErrorKind;
use std::path::Path;

use async_trait::async_trait;
use tracing::debug;

use super::{LocalStore, StoreError};

/// Creates and removes volume directories below a mounted CephFS root.
#[derive(Debug, Clone, Default)]
pub struct FsLocalStore;

impl FsLocalStore {
    pub fn new() -> Self {
        Self
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl LocalStore for FsLocalStore {
    async fn exists(&self, path: &Path) -> Result<bool, StoreError> {
        tokio::fs::try_exists(path)
            .await
            .map_err(|e| io_error(path, e))
    }

    async fn create_dir(&self, path: &Path) -> Result<(), StoreError> {
        let mut builder = tokio::fs::DirBuilder::new();
        #[cfg(unix)]
        builder.mode(0o777);

        match builder.create(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %path.display(), "Directory appeared concurrently");
                Ok(())
            }
            Err(e) => Err(io_error(path, e)),
        }
    }

    async fn remove_all(&self, path: &Path) -> Result<(), StoreError> {
        let metadata = match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(io_error(path, e)),
        };

        let result = if metadata.is_dir() {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_file(path).await
        };

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error(path, e)),
        }
    }
}
