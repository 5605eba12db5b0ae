//! Registration endpoints for the front-end. Served on the internal listener
//! only.

use crate::AppState;
use crate::admission::AdmissionSnapshot;
use crate::media::MediaDescriptor;
use crate::registry::short_token;
use axum::extract::{Extension, Json};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterFileRequest {
    pub user: String,
    pub media: MediaDescriptor,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RegisterFileResponse {
    pub token: String,
    pub stream_url: String,
    pub download_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub active_streams: usize,
    pub active_tokens: usize,
    pub active_clients: usize,
    pub registry_entries: usize,
    pub registry_capacity: usize,
    pub open_connections: usize,
}

#[axum::debug_handler]
pub async fn register_file(
    Extension(state): Extension<AppState>,
    Json(request): Json<RegisterFileRequest>,
) -> Response {
    let RegisterFileRequest { user, media } = request;
    if !state.access.is_allowed(&user) {
        warn!(%user, "User is not allowed to register files");
        return (StatusCode::FORBIDDEN, "user not allowed").into_response();
    }

    let kind = media.kind();
    let entry = match media.into_file_entry(&state.mime) {
        Ok(entry) => entry,
        Err(error) => {
            warn!(%user, kind, %error, "Rejected media");
            return (StatusCode::UNPROCESSABLE_ENTITY, error.to_string()).into_response();
        }
    };

    let size_bytes = entry.size_bytes;
    let token = state.registry.register(entry);
    info!(
        token = %short_token(&token),
        %user,
        kind,
        size_bytes,
        "Registered file"
    );

    (
        StatusCode::CREATED,
        Json(RegisterFileResponse {
            stream_url: state.stream_url(&token),
            download_url: state.download_url(&token),
            token,
        }),
    )
        .into_response()
}

#[axum::debug_handler]
pub async fn stats(Extension(state): Extension<AppState>) -> Json<StatsResponse> {
    let AdmissionSnapshot {
        active_streams,
        active_tokens,
        active_clients,
    } = state.admission.snapshot();

    Json(StatsResponse {
        active_streams,
        active_tokens,
        active_clients,
        registry_entries: state.registry.len(),
        registry_capacity: state.registry.capacity(),
        open_connections: state.connections.current(),
    })
}
