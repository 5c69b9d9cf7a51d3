//! HTTP endpoint handlers.
//!
//! The send handler does no processing of its own: it takes the JSON body as
//! is, publishes it and reports whether the hand-off succeeded.

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info};

use crate::queue::Publisher;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub publisher: Publisher,
    pub queue: Arc<str>,
}

impl AppState {
    pub fn new(publisher: Publisher, queue: impl Into<Arc<str>>) -> Self {
        Self {
            publisher,
            queue: queue.into(),
        }
    }
}

// =============================================================================
// Health Check
// =============================================================================

/// Health check response.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// =============================================================================
// Send
// =============================================================================

/// Send response.
#[derive(Serialize)]
pub struct SendResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Publish the request body to the configured queue.
pub async fn send(State(state): State<AppState>, Json(message): Json<Value>) -> impl IntoResponse {
    info!(queue = %state.queue, "send_request_received");

    if let Err(e) = state.publisher.publish(&state.queue, &message).await {
        error!(queue = %state.queue, error = %e, "send_publish_failed");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(SendResponse {
                status: "error",
                queue: None,
                error: Some(e.to_string()),
            }),
        );
    }

    info!(queue = %state.queue, "send_enqueued");

    (
        StatusCode::OK,
        Json(SendResponse {
            status: "queued",
            queue: Some(state.queue.to_string()),
            error: None,
        }),
    )
}
