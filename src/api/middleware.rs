use crate::error::ApiError;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use std::sync::Arc;
use tracing::{error, warn};

pub async fn log_request_errors(req: Request, next: Next) -> Response {
    let uri = req.uri().clone();
    let method = req.method().clone();

    let response = next.run(req).await;
    let status = response.status();
    if status.is_client_error() {
        // 4xx error
        warn!(
            method = %method,
            uri = %uri,
            status = %status,
            "Client error"
        );
    } else if status.is_server_error() {
        // 5xx error
        error!(
            method = %method,
            uri = %uri,
            status = %status,
            "Server error"
        );
    }

    response
}

/// Rejects requests whose `Authorization: Bearer <key>` does not match the API key.
pub async fn api_key_auth(State(api_key): State<Arc<str>>, req: Request, next: Next) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let authorized = match token {
        Some(token) => token == &*api_key,
        None => {
            warn!(uri = %req.uri(), "Missing or invalid Authorization header");
            return ApiError::Unauthorized.into_response();
        }
    };

    if !authorized {
        warn!(uri = %req.uri(), "Invalid API key");
        return ApiError::Unauthorized.into_response();
    }

    next.run(req).await
}
