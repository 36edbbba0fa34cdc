//! Exactly-once release of a session's swarm resources.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{StreamingError, StreamingResult};
use crate::swarm::{SwarmError, SwarmHandle};

/// Owns a transfer and its on-disk artifact for the lifetime of a session.
///
/// [`TransferGuard::release`] removes the transfer from the engine and deletes
/// the artifact. It runs at most once; a guard dropped without being released
/// schedules the release on the current runtime.
pub struct TransferGuard {
    handle: Arc<dyn SwarmHandle>,
    artifact: Mutex<Option<PathBuf>>,
    released: AtomicBool,
}

impl TransferGuard {
    /// Takes ownership of a freshly added transfer.
    pub fn new(handle: Arc<dyn SwarmHandle>) -> Self {
        Self {
            handle,
            artifact: Mutex::new(None),
            released: AtomicBool::new(false),
        }
    }

    /// Records the file or directory to delete on release.
    pub fn set_artifact(&self, path: PathBuf) {
        tracing::debug!("Artifact for {} is {}", self.handle.info_hash(), path.display());
        *self.artifact.lock() = Some(path);
    }

    /// Guarded transfer.
    pub fn handle(&self) -> &Arc<dyn SwarmHandle> {
        &self.handle
    }

    /// Whether release already ran.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Removes the transfer and deletes the artifact.
    ///
    /// Both steps are attempted even if the first one fails. Later calls are
    /// no-ops.
    ///
    /// # Errors
    ///
    /// - `StreamingError::ResourceCleanupFailure` - Removal or deletion failed
    pub async fn release(&self) -> StreamingResult<()> {
        if self.released.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let artifact = self.artifact.lock().take();
        release_resources(Arc::clone(&self.handle), artifact).await
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let handle = Arc::clone(&self.handle);
        let artifact = self.artifact.lock().take();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                tracing::warn!(
                    "Transfer {} dropped without release, cleaning up in background",
                    handle.info_hash()
                );
                runtime.spawn(async move {
                    if let Err(e) = release_resources(handle, artifact).await {
                        tracing::error!("Background cleanup failed: {}", e);
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    "Transfer {} dropped outside a runtime, resources leaked",
                    handle.info_hash()
                );
            }
        }
    }
}

async fn release_resources(
    handle: Arc<dyn SwarmHandle>,
    artifact: Option<PathBuf>,
) -> StreamingResult<()> {
    let mut failures = Vec::new();
    let info_hash = handle.info_hash();

    match handle.remove().await {
        Ok(()) => tracing::info!("Removed transfer {}", info_hash),
        Err(SwarmError::TransferRemoved) => {
            tracing::debug!("Transfer {} was already removed", info_hash);
        }
        Err(e) => failures.push(format!("remove transfer {info_hash}: {e}")),
    }

    if let Some(path) = artifact {
        match remove_artifact(&path).await {
            Ok(()) => tracing::info!("Deleted artifact {}", path.display()),
            Err(e) => failures.push(format!("delete {}: {e}", path.display())),
        }
    }

    if failures.is_empty() {
        return Ok(());
    }
    let reason = failures.join("; ");
    tracing::warn!("Cleanup incomplete: {}", reason);
    Err(StreamingError::ResourceCleanupFailure { reason })
}

async fn remove_artifact(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
