use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, warn};

/// Log every 4xx at warn and every 5xx at error. Stream tokens are masked.
pub async fn log_request_errors(req: Request<Body>, next: Next) -> Response {
    let path = masked_path(req.uri().path());
    let method = req.method().clone();

    let response = next.run(req).await;
    let status = response.status();
    if status.is_client_error() {
        warn!(
            method = %method,
            path = %path,
            status = %status,
            "Client error"
        );
    } else if status.is_server_error() {
        error!(
            method = %method,
            path = %path,
            status = %status,
            "Server error"
        );
    }

    response
}

fn masked_path(path: &str) -> String {
    for prefix in ["/stream/", "/download/"] {
        if let Some(token) = path.strip_prefix(prefix) {
            return format!("{prefix}{}", crate::registry::short_token(token));
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_masked() {
        let masked = masked_path("/stream/abcdefghijklmnopqrstuv");
        assert!(masked.starts_with("/stream/"));
        assert!(!masked.contains("abcdefghijklmnopqrstuv"));
        assert_eq!(masked_path("/health"), "/health");
    }
}
