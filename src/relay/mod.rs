//! Turns an admitted request into a byte-exact range response pulled from the
//! remote source.
//!
//! The response body is a pull stream. A remote part is only requested when
//! hyper polls the body for more data, so a slow client slows the remote
//! fetch instead of growing a buffer.

mod session;
mod throttle;

pub use session::Outcome;

use crate::admission::AdmissionPermit;
use crate::error::RelayError;
use crate::range::{AlignmentPolicy, ServingWindow, parse_range, slice_window};
use crate::registry::{FileEntry, short_token};
use crate::remote::{FetchRequest, RemoteSource};
use async_stream::stream;
use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use bytes::Bytes;
use futures::StreamExt;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use session::{Session, SessionGuard, spawn_watchdog};
use std::io::{Error as IoError, ErrorKind};
use std::sync::Arc;
use std::time::Duration;
use throttle::TokenBucket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// `attr-char` from RFC 5987 stays unescaped in `filename*`.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

const EXPOSED_HEADERS: &str = "Content-Length, Content-Range, Accept-Ranges, Content-Disposition";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Inline => "inline",
            Disposition::Attachment => "attachment",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub alignment: AlignmentPolicy,
    pub stall_timeout: Duration,
    pub stall_check_interval: Duration,
    /// Per-session ceiling in KiB/s. Zero disables throttling.
    pub max_kbps: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            alignment: AlignmentPolicy::default(),
            stall_timeout: Duration::from_secs(120),
            stall_check_interval: Duration::from_secs(30),
            max_kbps: 0,
        }
    }
}

/// Closes the HTTP connection a request arrived on. The accept loop puts
/// one into every request's extensions and drops the connection when it
/// fires.
#[derive(Debug, Clone, Default)]
pub struct ConnectionCloser(CancellationToken);

impl ConnectionCloser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.0.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_cancelled()
    }

    pub async fn closed(&self) {
        self.0.cancelled().await
    }
}

/// One admitted request for a registered file.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub token: String,
    pub entry: FileEntry,
    /// Raw `Range` header, if any.
    pub range: Option<String>,
    pub is_head: bool,
    pub disposition: Disposition,
    /// Fired when the session stalls.
    pub connection: Option<ConnectionCloser>,
}

#[derive(Clone)]
pub struct StreamRelay {
    source: Arc<dyn RemoteSource>,
    settings: RelaySettings,
}

impl StreamRelay {
    pub fn new(source: Arc<dyn RemoteSource>, settings: RelaySettings) -> Self {
        Self { source, settings }
    }

    /// Build the response for `request`. The admission slot held by `permit`
    /// is returned when the body finishes, fails or is dropped. On any error
    /// return the slot is returned right away.
    pub fn serve(
        &self,
        request: StreamRequest,
        permit: AdmissionPermit,
    ) -> Result<Response<Body>, RelayError> {
        let StreamRequest {
            token,
            entry,
            range,
            is_head,
            disposition,
            connection,
        } = request;

        let window = parse_range(range.as_deref(), entry.size_bytes);
        let plan = self.settings.alignment.plan(&window);
        let token_hash = short_token(&token);

        let mut response = Response::new(Body::empty());
        *response.status_mut() = if window.partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        };
        write_headers(&mut response, &entry, &window, disposition)?;

        if is_head || window.is_empty() {
            debug!(
                token = %token_hash,
                client = %permit.client(),
                is_head,
                "Serving headers only"
            );
            permit.release();
            return Ok(response);
        }

        debug!(
            token = %token_hash,
            client = %permit.client(),
            start = window.start,
            end = window.end,
            remote_offset = plan.remote_offset,
            skip_bytes = plan.skip_bytes,
            alignment = plan.alignment,
            "Starting stream"
        );

        let session = Session::new(token_hash, entry.object_id, window, plan, permit, connection);
        spawn_watchdog(
            session.clone(),
            self.settings.stall_check_interval,
            self.settings.stall_timeout,
        );
        *response.body_mut() = Body::from_stream(self.body_stream(session));
        Ok(response)
    }

    fn body_stream(
        &self,
        session: Arc<Session>,
    ) -> impl futures::Stream<Item = Result<Bytes, IoError>> + Send + 'static {
        let source = self.source.clone();
        let throttle = TokenBucket::per_second(self.settings.max_kbps * 1024);
        let guard = SessionGuard(session);

        stream! {
            let guard = guard;
            let session = guard.0.clone();
            let plan = session.plan;
            let remote_cancel = session.cancel.child_token();
            let mut throttle = throttle;
            let mut remote = Some(source.fetch_with_known_size(
                &session.object_id,
                FetchRequest {
                    offset: plan.remote_offset,
                    part_size: plan.alignment,
                    cancel: remote_cancel.clone(),
                },
                plan.remote_end(),
            ));
            let mut state = plan.slice_state();

            while let Some(chunks) = remote.as_mut() {
                let next = tokio::select! {
                    biased;
                    _ = session.cancel.cancelled() => None,
                    next = chunks.next() => Some(next),
                };

                let chunk = match next {
                    None => {
                        // Cancelled from outside, by the stall watchdog.
                        yield Err(aborted(&session));
                        break;
                    }
                    Some(None) => {
                        error!(
                            token = %session.token_hash,
                            remaining = state.remaining,
                            "Remote source ended before the window was filled"
                        );
                        session.cleanup(Outcome::Errored);
                        yield Err(IoError::new(ErrorKind::UnexpectedEof, "remote source ended early"));
                        break;
                    }
                    Some(Some(Err(error))) => {
                        error!(token = %session.token_hash, ?error, "Remote source failed");
                        session.cleanup(Outcome::Errored);
                        yield Err(IoError::other(RelayError::RemoteSource(error)));
                        break;
                    }
                    Some(Some(Ok(chunk))) => chunk,
                };

                session.record_seen(chunk.len());
                let (emitted, next_state) = slice_window(chunk, state);
                state = next_state;
                if emitted.is_empty() {
                    continue;
                }

                if let Some(bucket) = throttle.as_mut() {
                    let throttled = tokio::select! {
                        biased;
                        _ = session.cancel.cancelled() => false,
                        _ = bucket.consume(emitted.len()) => true,
                    };
                    if !throttled {
                        yield Err(aborted(&session));
                        break;
                    }
                }

                if state.is_done() {
                    remote_cancel.cancel();
                    remote = None;
                }
                session.record_written(emitted.len());
                yield Ok(emitted);
            }

            drop(remote);
            drop(guard);
        }
    }
}

fn aborted(session: &Session) -> IoError {
    match session.outcome() {
        Some(Outcome::Stalled) => IoError::new(ErrorKind::TimedOut, RelayError::StallTimeout),
        _ => IoError::new(ErrorKind::ConnectionAborted, "stream session aborted"),
    }
}

fn write_headers(
    response: &mut Response<Body>,
    entry: &FileEntry,
    window: &ServingWindow,
    disposition: Disposition,
) -> Result<(), RelayError> {
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&entry.mime_type)
            .map_err(|_| RelayError::Internal(format!("invalid mime type {}", entry.mime_type)))?,
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(window.len()));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    if window.partial {
        headers.insert(
            header::CONTENT_RANGE,
            HeaderValue::from_str(&window.content_range())
                .map_err(|error| RelayError::Internal(error.to_string()))?,
        );
    }
    headers.insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_str(&content_disposition(disposition, &entry.display_name))
            .map_err(|error| RelayError::Internal(error.to_string()))?,
    );
    headers.insert(
        header::ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(EXPOSED_HEADERS),
    );
    Ok(())
}

pub fn content_disposition(disposition: Disposition, file_name: &str) -> String {
    format!(
        "{}; filename*=UTF-8''{}",
        disposition.as_str(),
        utf8_percent_encode(file_name, FILENAME_ESCAPE)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_disposition_encoding() {
        assert_eq!(
            content_disposition(Disposition::Inline, "movie.mp4"),
            "inline; filename*=UTF-8''movie.mp4"
        );
        assert_eq!(
            content_disposition(Disposition::Attachment, "my film é.mkv"),
            "attachment; filename*=UTF-8''my%20film%20%C3%A9.mkv"
        );
        assert_eq!(
            content_disposition(Disposition::Inline, "a\"b;c.txt"),
            "inline; filename*=UTF-8''a%22b%3Bc.txt"
        );
    }
}
