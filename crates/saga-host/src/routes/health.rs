//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub accepting: bool,
    pub pending: usize,
    pub in_flight: usize,
}

/// GET /health: returns host health and queue depth.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let accepting = !state.queue.is_closed();
    Json(HealthResponse {
        status: if accepting { "ok" } else { "draining" },
        accepting,
        pending: state.queue.pending(),
        in_flight: state.queue.in_flight(),
    })
}
