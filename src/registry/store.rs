//! Best-effort durable mirror of the token registry.
//!
//! Mutations only bump a dirty generation. A single writer task waits out the
//! debounce window, then takes one snapshot and writes it.

use super::FileEntry;
use crate::error::RelayError;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, watch};
use tracing::{debug, error, warn};

/// On-disk form: entries plus the eviction order, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub entries: Vec<(String, FileEntry)>,
    pub order: Vec<String>,
}

/// A snapshot tagged with the dirty generation it reflects.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    generation: u64,
    snapshot: RegistrySnapshot,
}

struct StoreInner {
    path: PathBuf,
    debounce: Duration,
    /// Bumped on every mutation.
    dirty: watch::Sender<u64>,
    /// Generation of the last snapshot written to disk.
    written: TokioMutex<u64>,
}

#[derive(Clone)]
pub struct RegistryStore {
    inner: Arc<StoreInner>,
}

impl RegistryStore {
    /// Open a store at `path`. Nothing is written until a writer is started
    /// with [`RegistryStore::spawn_writer`].
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        let (dirty, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                path: path.into(),
                debounce,
                dirty,
                written: TokioMutex::new(0),
            }),
        }
    }

    /// Start the debounced writer. `snapshot` is called once per debounce
    /// window and returns `None` once the registry is gone.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_writer<F>(&self, snapshot: F)
    where
        F: Fn() -> Option<PendingWrite> + Send + 'static,
    {
        let writer = Writer {
            inner: Arc::downgrade(&self.inner),
        };
        tokio::spawn(writer.run(self.inner.dirty.subscribe(), self.inner.debounce, snapshot));
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Read the persisted snapshot. Missing or corrupt files give an empty one.
    pub async fn load(&self) -> RegistrySnapshot {
        let path = &self.inner.path;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No registry file, starting empty");
                return RegistrySnapshot::default();
            }
            Err(error) => {
                warn!(?error, path = %path.display(), "Failed to read registry file");
                return RegistrySnapshot::default();
            }
        };

        serde_json::from_str(&content)
            .inspect_err(|error| {
                warn!(?error, path = %path.display(), "Failed to parse registry file");
            })
            .unwrap_or_default()
    }

    /// Record a mutation for the debounced writer. Callers must hold the
    /// registry lock so that generations follow mutation order.
    pub fn mark_dirty(&self) {
        self.inner.dirty.send_modify(|generation| *generation += 1);
    }

    /// Tag `snapshot` with the current generation. Callers must take the
    /// snapshot under the same registry lock as [`RegistryStore::mark_dirty`].
    pub fn pending(&self, snapshot: RegistrySnapshot) -> PendingWrite {
        PendingWrite {
            generation: *self.inner.dirty.borrow(),
            snapshot,
        }
    }

    /// Write a snapshot right away, bypassing the debounce window.
    pub async fn write_now(&self, pending: PendingWrite) {
        self.inner.write_if_newer(pending).await;
    }
}

impl StoreInner {
    async fn write_if_newer(&self, pending: PendingWrite) {
        let mut written = self.written.lock().await;
        if pending.generation <= *written {
            debug!(
                generation = pending.generation,
                written = *written,
                "Skipping stale registry snapshot"
            );
            return;
        }

        match write_atomic(&self.path, &pending.snapshot).await {
            Ok(()) => {
                *written = pending.generation;
                debug!(
                    path = %self.path.display(),
                    count = pending.snapshot.order.len(),
                    "Saved token registry"
                );
            }
            Err(error) => {
                let error = RelayError::Persistence(format!("{error:#}"));
                error!(%error, path = %self.path.display(), "Failed to save token registry");
            }
        }
    }
}

struct Writer {
    inner: std::sync::Weak<StoreInner>,
}

impl Writer {
    async fn run<F>(self, mut rx: watch::Receiver<u64>, debounce: Duration, snapshot: F)
    where
        F: Fn() -> Option<PendingWrite>,
    {
        while rx.changed().await.is_ok() {
            tokio::time::sleep(debounce).await;
            let _ = rx.borrow_and_update();
            let (Some(inner), Some(pending)) = (self.inner.upgrade(), snapshot()) else {
                break;
            };
            inner.write_if_newer(pending).await;
        }
        debug!("Registry writer finished");
    }
}

async fn write_atomic(path: &Path, snapshot: &RegistrySnapshot) -> anyhow::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }

    let content = serde_json::to_vec(snapshot)?;
    let tmp = path.with_extension("tmp");
    tokio::fs::write(&tmp, content)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}
