pub mod delivery;
pub mod middleware;
pub mod routes;

// Re-export public types and functions
pub use delivery::{ByteRange, EXPIRES_IN_HEADER, download_video, parse_range};
pub use middleware::{api_key_auth, log_request_errors};
pub use routes::{
    CompletedResponse, HealthResponse, ProcessingResponse, delivery_health, process_video,
    processing_health, video_status,
};
