use super::{ChunkStream, FetchRequest, RemoteError, RemoteSource};
use anyhow::{Result, anyhow};
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use opendal::services::{Fs, S3};
use opendal::{ErrorKind, Operator, layers::RetryLayer};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub enum StorageBackend {
    Local {
        root: PathBuf,
    },
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
        access_key_id: String,
        secret_access_key: String,
    },
}

/// Remote objects served from an opendal operator. Object ids are paths
/// relative to the operator root.
#[derive(Clone)]
pub struct OpendalSource {
    operator: Operator,
}

impl OpendalSource {
    pub fn new(backend: &StorageBackend) -> Result<Self> {
        let operator = match backend {
            StorageBackend::Local { root } => build_fs_operator(root)?,
            StorageBackend::S3 {
                bucket,
                endpoint,
                region,
                access_key_id,
                secret_access_key,
            } => build_s3_operator(
                bucket,
                endpoint.as_deref(),
                region.as_deref(),
                access_key_id,
                secret_access_key,
            )?,
        };
        Ok(Self { operator })
    }
}

impl RemoteSource for OpendalSource {
    fn fetch_chunks(&self, object_id: &str, request: FetchRequest) -> ChunkStream {
        Box::pin(read_parts(
            self.operator.clone(),
            object_id.to_string(),
            request,
        ))
    }
}

/// Read `path` from `request.offset` one `part_size` range per poll.
fn read_parts(
    operator: Operator,
    path: String,
    request: FetchRequest,
) -> impl Stream<Item = Result<Bytes, RemoteError>> + Send + 'static {
    let FetchRequest {
        offset,
        part_size,
        cancel,
    } = request;
    let part_size = part_size.max(1);

    try_stream! {
        if offset % part_size != 0 {
            Err::<(), _>(RemoteError::Misaligned { offset, alignment: part_size })?;
        }

        let stat = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            stat = operator.stat(&path) => Some(stat),
        };

        if let Some(stat) = stat {
            let size = stat.map_err(|error| storage_error(&path, error))?.content_length();
            let mut position = offset;
            while position < size {
                let end = (position + part_size).min(size);
                let read = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    read = operator.read_with(&path).range(position..end) => Some(read),
                };
                let Some(read) = read else {
                    debug!(%path, position, "Remote read cancelled");
                    break;
                };

                let chunk = read.map_err(|error| storage_error(&path, error))?.to_bytes();
                if chunk.is_empty() {
                    break;
                }
                position += chunk.len() as u64;
                yield chunk;
            }
        }
    }
}

fn storage_error(path: &str, error: opendal::Error) -> RemoteError {
    match error.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(path.to_string()),
        _ => RemoteError::Read(error.to_string()),
    }
}

fn build_fs_operator(root: &Path) -> Result<Operator> {
    info!(root = ?root, "Building filesystem operator");

    let builder = Fs::default().root(
        root.to_str()
            .ok_or_else(|| anyhow!("Invalid root path: {:?}", root))?,
    );

    Ok(Operator::new(builder)?
        .layer(RetryLayer::new().with_max_times(3))
        .finish())
}

fn build_s3_operator(
    bucket: &str,
    endpoint: Option<&str>,
    region: Option<&str>,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    info!(
        bucket = %bucket,
        endpoint = ?endpoint,
        region = ?region,
        "Building S3 operator"
    );

    let mut builder = S3::default()
        .bucket(bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    if let Some(region) = region {
        builder = builder.region(region);
    }

    if let Some(endpoint) = endpoint {
        builder = builder.endpoint(endpoint);
    }

    Ok(Operator::new(builder)?
        .layer(RetryLayer::new().with_max_times(3))
        .finish())
}
