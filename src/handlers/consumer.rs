//! Background consumer endpoints.
//!
//! All of them answer 404 when the consumer is disabled.

use axum::Json;
use axum::extract::State;
use tracing::{info, instrument};

use crate::error::{AppError, AppResult};
use crate::models::{BufferedMessagesResponse, ClearResponse, ConsumerStatusResponse};
use crate::services::BackgroundConsumer;
use crate::state::AppState;

fn enabled(state: &AppState) -> AppResult<&BackgroundConsumer> {
    state
        .consumer
        .as_ref()
        .ok_or_else(|| AppError::NotFound("background consumer is disabled".to_string()))
}

/// Buffered messages, oldest first, each as `"[HH:MM:SS] text"`.
#[instrument(skip(state))]
pub async fn list_messages(State(state): State<AppState>) -> AppResult<Json<BufferedMessagesResponse>> {
    let consumer = enabled(&state)?;
    Ok(Json(BufferedMessagesResponse {
        messages: consumer.messages(),
    }))
}

#[instrument(skip(state))]
pub async fn clear_messages(State(state): State<AppState>) -> AppResult<Json<ClearResponse>> {
    let cleared = enabled(&state)?.clear();
    Ok(Json(ClearResponse {
        status: "Messages cleared".to_string(),
        cleared: cleared.count,
    }))
}

#[instrument(skip(state))]
pub async fn consumer_status(State(state): State<AppState>) -> AppResult<Json<ConsumerStatusResponse>> {
    let consumer = enabled(&state)?;
    let status = consumer.status();

    Ok(Json(ConsumerStatusResponse {
        state: status.state.to_string(),
        attempts: status.attempts,
        terminal: status.terminal,
        topic: consumer.topic().to_string(),
        buffered: consumer.buffered(),
        last_error: status.last_error,
    }))
}

/// Start the connector again with a fresh retry budget.
///
/// 409 while a connector task is still running.
#[instrument(skip(state))]
pub async fn restart_consumer(State(state): State<AppState>) -> AppResult<Json<ConsumerStatusResponse>> {
    enabled(&state)?.start()?;
    info!("Background consumer restarted on request");
    consumer_status(State(state)).await
}
