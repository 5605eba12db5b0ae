use crate::admission::Rejection;
use crate::remote::RemoteError;
use axum::body::Body;
use axum::http::{HeaderValue, Response, StatusCode, header};
use axum::response::IntoResponse;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("not found")]
    NotFound,

    #[error("link expired or not found")]
    TokenNotFound,

    #[error(transparent)]
    AdmissionRejected(#[from] Rejection),

    #[error("remote source error: {0}")]
    RemoteSource(#[from] RemoteError),

    #[error("stream stalled")]
    StallTimeout,

    #[error("registry persistence failed: {0}")]
    Persistence(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn to_status_code(&self) -> StatusCode {
        match self {
            RelayError::NotFound | RelayError::TokenNotFound => StatusCode::NOT_FOUND,
            RelayError::AdmissionRejected(_) => StatusCode::SERVICE_UNAVAILABLE,
            RelayError::StallTimeout => StatusCode::GATEWAY_TIMEOUT,
            RelayError::RemoteSource(_) | RelayError::Persistence(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Plain-text body sent to the client. Internal details stay in the logs.
    fn client_message(&self) -> String {
        match self {
            RelayError::NotFound => "not found".into(),
            RelayError::TokenNotFound => "link expired or not found".into(),
            RelayError::AdmissionRejected(rejection) => rejection.to_string(),
            RelayError::StallTimeout
            | RelayError::RemoteSource(_)
            | RelayError::Persistence(_)
            | RelayError::Internal(_) => "failed to stream file".into(),
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> axum::response::Response {
        let mut response = Response::new(Body::from(self.client_message()));
        *response.status_mut() = self.to_status_code();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let RelayError::AdmissionRejected(rejection) = &self {
            response.headers_mut().insert(
                "x-rejection-reason",
                HeaderValue::from_static(rejection.code()),
            );
        }
        response
    }
}
