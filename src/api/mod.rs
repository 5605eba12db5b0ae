pub mod internal;
pub mod middleware;
pub mod routes;

pub use internal::{RegisterFileRequest, RegisterFileResponse, StatsResponse, register_file, stats};
pub use middleware::log_request_errors;
pub use routes::{client_id, download_file, health, not_found, stream_file};
