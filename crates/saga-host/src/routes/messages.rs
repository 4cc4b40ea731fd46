//! Message intake.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::{Message, Resolution};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub message_type: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

#[derive(Serialize)]
pub struct MessageAcceptedResponse {
    pub message_id: String,
    pub correlation: Option<String>,
}

/// POST /messages: validates and enqueues a message for dispatch.
///
/// The message is resolved up front so that unroutable messages are
/// rejected with 400 instead of being dead-lettered.
#[tracing::instrument(skip(state, req), fields(message_type = %req.message_type))]
pub async fn send(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<MessageAcceptedResponse>), ApiError> {
    let mut builder = Message::builder()
        .message_type(req.message_type)
        .payload_raw(req.payload);
    for (key, value) in req.headers {
        builder = builder.header(key, value);
    }
    let message = builder
        .try_build()
        .ok_or_else(|| ApiError::BadRequest("message_type and payload are required".into()))?;

    let correlation = match state.dispatcher.registry().resolve(&message)? {
        Resolution::Correlated(key) => Some(key.to_string()),
        Resolution::NoCorrelation => None,
    };

    let message_id = message.id;
    state
        .queue
        .send(message)
        .map_err(|e| ApiError::Unavailable(e.to_string()))?;
    metrics::counter!("saga_messages_enqueued_total").increment(1);
    tracing::debug!(%message_id, ?correlation, "message enqueued");

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAcceptedResponse {
            message_id: message_id.to_string(),
            correlation,
        }),
    ))
}
