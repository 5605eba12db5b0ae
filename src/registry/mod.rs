//! Token → file metadata registry with bounded, insertion-ordered retention.

pub mod store;

pub use store::{PendingWrite, RegistrySnapshot, RegistryStore};

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info};

/// Random bytes per token before base64url encoding.
const TOKEN_BYTES: usize = 16;

/// Metadata for one registered remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub object_id: String,
    pub display_name: String,
    pub size_bytes: u64,
    pub mime_type: String,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: HashMap<String, FileEntry>,
    order: VecDeque<String>,
}

impl RegistryState {
    fn from_snapshot(snapshot: RegistrySnapshot, max_entries: usize) -> Self {
        let mut entries: HashMap<String, FileEntry> = snapshot.entries.into_iter().collect();
        let mut seen = HashSet::with_capacity(entries.len());
        let mut order: VecDeque<String> = snapshot
            .order
            .into_iter()
            .filter(|token| entries.contains_key(token) && seen.insert(token.clone()))
            .collect();

        // Entries missing from the order list are treated as newest.
        for token in entries.keys() {
            if !seen.contains(token) {
                order.push_back(token.clone());
            }
        }

        while order.len() > max_entries {
            if let Some(oldest) = order.pop_front() {
                entries.remove(&oldest);
            }
        }

        Self { entries, order }
    }

    fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            entries: self
                .order
                .iter()
                .filter_map(|token| {
                    self.entries
                        .get(token)
                        .map(|entry| (token.clone(), entry.clone()))
                })
                .collect(),
            order: self.order.iter().cloned().collect(),
        }
    }
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    max_entries: usize,
    store: Option<RegistryStore>,
}

impl RegistryInner {
    /// Snapshot for the store, taken under the registry lock.
    fn pending_write(&self) -> Option<PendingWrite> {
        let store = self.store.as_ref()?;
        let state = self.state.lock();
        Some(store.pending(state.snapshot()))
    }
}

/// Shared, cloneable handle to the token registry.
#[derive(Clone)]
pub struct TokenRegistry {
    inner: Arc<RegistryInner>,
}

impl TokenRegistry {
    /// An in-memory registry holding at most `max_entries` tokens.
    pub fn new(max_entries: usize) -> Self {
        Self::build(RegistryState::default(), max_entries, None)
    }

    /// A registry mirrored to `store`. Previously persisted tokens are reloaded;
    /// unreadable data leaves the registry empty.
    pub async fn with_store(max_entries: usize, store: RegistryStore) -> Self {
        let snapshot = store.load().await;
        let state = RegistryState::from_snapshot(snapshot, max_entries.max(1));
        info!(
            count = state.order.len(),
            path = %store.path().display(),
            "Loaded token registry"
        );
        let registry = Self::build(state, max_entries, Some(store.clone()));
        let inner = Arc::downgrade(&registry.inner);
        store.spawn_writer(move || inner.upgrade().and_then(|inner| inner.pending_write()));
        registry
    }

    fn build(state: RegistryState, max_entries: usize, store: Option<RegistryStore>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(state),
                max_entries: max_entries.max(1),
                store,
            }),
        }
    }

    /// Register `entry` under a freshly generated token, evicting the oldest
    /// token when the registry is full.
    pub fn register(&self, entry: FileEntry) -> String {
        let token = generate_token();
        let mut state = self.inner.state.lock();
        while state.order.len() >= self.inner.max_entries {
            let Some(oldest) = state.order.pop_front() else {
                break;
            };
            state.entries.remove(&oldest);
            debug!(token = %short_token(&oldest), "Evicted oldest token");
        }
        state.entries.insert(token.clone(), entry);
        state.order.push_back(token.clone());

        // Marked under the lock so generations follow mutation order.
        if let Some(store) = &self.inner.store {
            store.mark_dirty();
        }
        token
    }

    pub fn resolve(&self, token: &str) -> Option<FileEntry> {
        self.inner.state.lock().entries.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.max_entries
    }

    /// Write the current state to durable storage immediately.
    pub async fn flush(&self) {
        let (Some(store), Some(pending)) = (&self.inner.store, self.inner.pending_write()) else {
            return;
        };
        store.write_now(pending).await;
    }
}

fn generate_token() -> String {
    let mut raw = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut raw);
    URL_SAFE_NO_PAD.encode(raw)
}

/// Hash a token for logging so that full tokens never reach the logs.
pub fn short_token(token: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    format!("{:016x}", hasher.finish()).chars().take(8).collect()
}
