pub mod api;
pub mod app_state;
pub mod cache;
pub mod config;
pub mod error;
pub mod job;
pub mod media;
pub mod notify;

use axum::Router;
use axum::extract::{DefaultBodyLimit, Extension};
use axum::http::{HeaderName, header};
use axum::routing::{get, post};
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

//
// Re-export
//
pub use api::{
    CompletedResponse, HealthResponse, ProcessingResponse, api_key_auth, delivery_health,
    download_video, log_request_errors, process_video, processing_health, video_status,
};
pub use app_state::{AppState, Engines};
pub use cache::ResponseCache;
pub use config::Config;
pub use error::{ApiError, EncodeError, ProbeError, StoreError};
pub use job::{CompressJob, JobState, JobStatus, JobStore, Lifecycle, SweepReport};
pub use media::{EncodePlan, Encoder, MediaInfo, Prober};
pub use notify::{CompletionNotice, Notifier};

const CACHE_PURGE_PERIOD: Duration = Duration::from_secs(60);

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            header::CONTENT_DISPOSITION,
            HeaderName::from_static(api::EXPIRES_IN_HEADER),
        ])
}

/// Upload and status API, guarded by the API key.
pub fn processing_router(state: AppState, max_upload_bytes: usize) -> Router {
    let protected = Router::new()
        .route("/process-video", post(process_video))
        .route("/video-status/{id}", get(video_status))
        .route_layer(axum::middleware::from_fn_with_state(
            state.api_key.clone(),
            api::api_key_auth,
        ));

    Router::new()
        .merge(protected)
        .route("/health", get(processing_health))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .layer(Extension(state))
}

/// Public download API.
pub fn delivery_router(state: AppState) -> Router {
    Router::new()
        .route("/download-video/{id}/{filename}", get(download_video))
        .route("/health", get(delivery_health))
        .layer(axum::middleware::from_fn(api::log_request_errors))
        .layer(TraceLayer::new_for_http())
        .layer(cors())
        .layer(Extension(state))
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    let state = AppState::new(&config, Engines::from_config(&config))?;

    Lifecycle::new(state.store.clone(), state.uploads_dir(), state.ttl)
        .start(config.cleanup_interval());
    state.status_cache.start_cleanup_task(CACHE_PURGE_PERIOD);

    let processing_app = processing_router(state.clone(), config.max_upload_bytes());
    let delivery_app = delivery_router(state);

    let processing_addr = format!("0.0.0.0:{}", config.processing_port);
    info!("Processing API listening on {processing_addr}");
    let processing_listener = TcpListener::bind(&processing_addr).await?;

    let delivery_addr = format!("0.0.0.0:{}", config.download_port);
    info!("Delivery API listening on {delivery_addr}");
    let delivery_listener = TcpListener::bind(&delivery_addr).await?;

    // Run both servers concurrently
    tokio::select! {
        result = axum::serve(processing_listener, processing_app) => {
            result.map_err(|error| anyhow::anyhow!("processing API server error: {error}"))?;
        }
        result = axum::serve(delivery_listener, delivery_app) => {
            result.map_err(|error| anyhow::anyhow!("delivery API server error: {error}"))?;
        }
    }

    Ok(())
}
