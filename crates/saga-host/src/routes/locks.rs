//! Saga lock diagnostics.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use chrono::Utc;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct LocksResponse {
    pub count: usize,
    pub locks: Vec<LockResponse>,
}

#[derive(Serialize)]
pub struct LockResponse {
    pub saga_type: String,
    pub property: String,
    pub value: String,
    pub holder: String,
    pub acquired_at: String,
    pub held_ms: i64,
}

/// GET /locks: lists the saga locks currently held.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<LocksResponse> {
    let now = Utc::now();
    let locks: Vec<LockResponse> = state
        .locks
        .entries()
        .await
        .into_iter()
        .map(|entry| LockResponse {
            saga_type: entry.key.saga_type().to_string(),
            property: entry.key.property().to_string(),
            value: entry.key.value().to_string(),
            holder: entry.holder.to_string(),
            acquired_at: entry.acquired_at.to_rfc3339(),
            held_ms: (now - entry.acquired_at).num_milliseconds(),
        })
        .collect();

    Json(LocksResponse {
        count: locks.len(),
        locks,
    })
}
