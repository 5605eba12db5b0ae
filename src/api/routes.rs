use crate::error::RelayError;
use crate::registry::short_token;
use crate::relay::{ConnectionCloser, Disposition, StreamRequest};
use crate::AppState;
use axum::body::Body;
use axum::extract::{ConnectInfo, Extension, Path as AxumPath};
use axum::http::{Method, Request, Response, header};
use std::net::SocketAddr;
use tracing::{debug, warn};

const UNKNOWN_CLIENT: &str = "unknown";

pub async fn health() -> &'static str {
    "OK"
}

pub async fn not_found() -> RelayError {
    RelayError::NotFound
}

pub async fn stream_file(
    Extension(state): Extension<AppState>,
    AxumPath(token): AxumPath<String>,
    req: Request<Body>,
) -> Result<Response<Body>, RelayError> {
    relay_file(state, token, req, Disposition::Inline)
}

pub async fn download_file(
    Extension(state): Extension<AppState>,
    AxumPath(token): AxumPath<String>,
    req: Request<Body>,
) -> Result<Response<Body>, RelayError> {
    relay_file(state, token, req, Disposition::Attachment)
}

fn relay_file(
    state: AppState,
    token: String,
    req: Request<Body>,
    disposition: Disposition,
) -> Result<Response<Body>, RelayError> {
    let Some(entry) = state.registry.resolve(&token) else {
        debug!(token = %short_token(&token), "Unknown token");
        return Err(RelayError::TokenNotFound);
    };

    let client = client_id(&req, state.trust_forwarded_for);
    let permit = state
        .admission
        .try_admit(&token, &client)
        .inspect_err(|rejection| {
            warn!(
                token = %short_token(&token),
                %client,
                reason = rejection.code(),
                "Stream rejected"
            );
        })?;

    let range = req
        .headers()
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    state.relay.serve(
        StreamRequest {
            token,
            entry,
            range,
            is_head: req.method() == Method::HEAD,
            disposition,
            connection: req.extensions().get::<ConnectionCloser>().cloned(),
        },
        permit,
    )
}

/// Peer IP of the request, or the first `X-Forwarded-For` hop when trusted.
pub fn client_id<B>(req: &Request<B>, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for
        && let Some(forwarded) = req
            .headers()
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    {
        return forwarded.to_string();
    }

    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}
