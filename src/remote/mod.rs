//! The upstream object store, seen as a lazy source of aligned chunks.

mod opendal;

pub use self::opendal::{OpendalSource, StorageBackend};

use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub type ChunkStream = BoxStream<'static, Result<Bytes, RemoteError>>;

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote object not found: {0}")]
    NotFound(String),

    #[error("remote offset {offset} is not aligned to {alignment}")]
    Misaligned { offset: u64, alignment: u64 },

    #[error("remote read failed: {0}")]
    Read(String),
}

/// Where to start reading and how much to pull per part.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub offset: u64,
    pub part_size: u64,
    /// Fired when the consumer no longer needs data.
    pub cancel: CancellationToken,
}

pub trait RemoteSource: Send + Sync + 'static {
    /// Stream the object from `request.offset` to its end.
    ///
    /// The stream is lazy: a part is only read when the stream is polled.
    /// Implementations must stop soon after `request.cancel` fires.
    fn fetch_chunks(&self, object_id: &str, request: FetchRequest) -> ChunkStream;

    /// Like [`RemoteSource::fetch_chunks`], but stops at `end_exclusive`
    /// instead of the object end.
    fn fetch_with_known_size(
        &self,
        object_id: &str,
        request: FetchRequest,
        end_exclusive: u64,
    ) -> ChunkStream {
        let offset = request.offset;
        self.fetch_chunks(object_id, request)
            .scan(offset, move |position, item| {
                let item = match item {
                    Ok(_) if *position >= end_exclusive => None,
                    Ok(chunk) => {
                        let keep = (end_exclusive - *position).min(chunk.len() as u64);
                        *position += keep;
                        Some(Ok(chunk.slice(..keep as usize)))
                    }
                    Err(error) => Some(Err(error)),
                };
                futures::future::ready(item)
            })
            .boxed()
    }
}
