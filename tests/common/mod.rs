#![allow(dead_code)]

use async_stream::stream;
use bytes::Bytes;
use media_relay::{
    AccessPolicy, AdmissionController, AdmissionLimits, AppState, ChunkStream, FetchRequest,
    FileEntry, RelaySettings, RemoteError, RemoteSource, StreamRelay, TokenRegistry,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio_util::sync::CancellationToken;

/// One `fetch_chunks` call as seen by the source.
#[derive(Debug, Clone)]
pub struct FetchRecord {
    pub object_id: String,
    pub offset: u64,
    pub part_size: u64,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// Wait for cancellation instead of producing part N.
    pub hang_after: Option<usize>,
    /// Fail instead of producing part N.
    pub fail_after: Option<usize>,
}

/// In-memory remote source that serves aligned parts and records every fetch.
#[derive(Clone, Default)]
pub struct ScriptedSource {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    fetches: Arc<Mutex<Vec<FetchRecord>>>,
    parts_read: Arc<AtomicUsize>,
    script: Script,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Script) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn insert(&self, object_id: &str, data: Vec<u8>) {
        self.objects.lock().insert(object_id.to_string(), Bytes::from(data));
    }

    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.fetches.lock().clone()
    }

    pub fn parts_read(&self) -> usize {
        self.parts_read.load(Ordering::SeqCst)
    }
}

impl RemoteSource for ScriptedSource {
    fn fetch_chunks(&self, object_id: &str, request: FetchRequest) -> ChunkStream {
        self.fetches.lock().push(FetchRecord {
            object_id: object_id.to_string(),
            offset: request.offset,
            part_size: request.part_size,
            cancel: request.cancel.clone(),
        });

        let data = self.objects.lock().get(object_id).cloned();
        let object_id = object_id.to_string();
        let parts_read = self.parts_read.clone();
        let script = self.script;

        Box::pin(stream! {
            match data {
                None => yield Err(RemoteError::NotFound(object_id)),
                Some(data) => {
                    let len = data.len() as u64;
                    let mut position = request.offset;
                    let mut part = 0;
                    while position < len && !request.cancel.is_cancelled() {
                        if script.hang_after == Some(part) {
                            request.cancel.cancelled().await;
                            break;
                        }
                        if script.fail_after == Some(part) {
                            yield Err(RemoteError::Read("scripted failure".into()));
                            break;
                        }
                        let end = (position + request.part_size).min(len);
                        parts_read.fetch_add(1, Ordering::SeqCst);
                        yield Ok(data.slice(position as usize..end as usize));
                        position = end;
                        part += 1;
                    }
                }
            }
        })
    }
}

/// Deterministic test content.
pub fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

pub fn entry(object_id: &str, name: &str, size: u64) -> FileEntry {
    FileEntry {
        object_id: object_id.to_string(),
        display_name: name.to_string(),
        size_bytes: size,
        mime_type: "video/mp4".to_string(),
    }
}

pub fn unlimited() -> AdmissionLimits {
    AdmissionLimits {
        max_per_token: 0,
        max_clients: 0,
        max_global: 0,
    }
}

pub fn state_with(
    source: ScriptedSource,
    limits: AdmissionLimits,
    settings: RelaySettings,
) -> AppState {
    AppState::new(
        TokenRegistry::new(100),
        AdmissionController::new(limits),
        StreamRelay::new(Arc::new(source), settings),
        AccessPolicy::default(),
        "http://media.test",
    )
}
