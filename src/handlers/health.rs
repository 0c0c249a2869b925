//! Banner, health and readiness endpoints.
//!
//! - **Health** (`/health`): always 200, details in the body
//! - **Readiness** (`/ready`): 503 once the background consumer has given up

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use chrono::Utc;
use tracing::instrument;

use crate::models::HealthResponse;
use crate::state::AppState;

pub async fn root() -> &'static str {
    "MQTT relay gateway is running"
}

/// Health check endpoint.
///
/// # Response Body
///
/// ```json
/// {
///   "status": "healthy",
///   "broker": "mqtt",
///   "consumer": "subscribed",
///   "active_streams": 2,
///   "version": "0.1.0",
///   "timestamp": "2024-01-15T10:30:00Z"
/// }
/// ```
///
/// `consumer` is `disabled` without a background consumer and `failed` once
/// it ran out of retries, which also turns `status` into `degraded`.
#[instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let (status, consumer) = match &state.consumer {
        None => ("healthy", "disabled".to_string()),
        Some(consumer) => {
            let current = consumer.status();
            if current.terminal {
                ("degraded", "failed".to_string())
            } else {
                ("healthy", current.state.to_string())
            }
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        broker: state.broker.kind().to_string(),
        consumer,
        active_streams: state.streamer.active_streams(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        timestamp: Utc::now(),
    })
}

/// Readiness probe.
#[instrument(skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Result<StatusCode, StatusCode> {
    let failed = state
        .consumer
        .as_ref()
        .is_some_and(|consumer| consumer.status().terminal);

    if failed {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    } else {
        Ok(StatusCode::OK)
    }
}
