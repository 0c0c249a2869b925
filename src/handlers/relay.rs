//! Relay endpoints: publish over HTTP, stream over SSE.
//!
//! # Endpoints
//!
//! - `POST /sendMessage` - Publish to the relay topic
//! - `GET /messages` - Server-Sent Events stream of the relay topic
//! - `GET /publish/{message}` - Publish to the consumer topic

use axum::Json;
use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use tracing::instrument;

use crate::error::AppResult;
use crate::models::{PublishResponse, SendMessageRequest};
use crate::state::AppState;

/// Publish one message to the relay topic.
///
/// # Request Body
///
/// ```json
/// { "message": "hello" }
/// ```
///
/// A missing `message` publishes `"Default message"`.
///
/// # Response Body
///
/// ```json
/// { "status": "Message sent", "message": "hello" }
/// ```
#[instrument(skip(state, request))]
pub async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> AppResult<Json<PublishResponse>> {
    let response = state.publisher.send_message(&request.message).await?;
    Ok(Json(response))
}

/// Stream relay topic messages as Server-Sent Events.
///
/// The subscription is established before the response starts, so broker
/// problems surface as a 503 instead of an empty stream. Each frame is
///
/// ```text
/// data: {"message":"hello","timestamp":"2024-01-15T10:30:00Z"}
/// ```
///
/// and the first one is always the connected notice. Idle streams receive
/// keep-alive comments.
#[instrument(skip(state))]
pub async fn message_stream(
    State(state): State<AppState>,
) -> AppResult<Sse<impl Stream<Item = Result<Event, axum::Error>>>> {
    let frames = state.streamer.open().await?;
    let events = frames.map(|frame| Event::default().json_data(frame));

    Ok(Sse::new(events).keep_alive(KeepAlive::new().interval(state.config.sse_keep_alive)))
}

/// Publish the path segment to the consumer topic.
#[instrument(skip(state))]
pub async fn publish_message(
    State(state): State<AppState>,
    Path(message): Path<String>,
) -> AppResult<Json<PublishResponse>> {
    let response = state.publisher.publish_message(&message).await?;
    Ok(Json(response))
}
