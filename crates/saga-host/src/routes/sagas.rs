//! Saga instance lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use saga::SagaId;
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct SagaResponse {
    pub id: String,
    pub saga_type: String,
    pub correlation: String,
    pub revision: i64,
    pub data: serde_json::Value,
    pub created_at: String,
    pub updated_at: String,
}

/// GET /sagas/{id}: returns the persisted state of one saga instance.
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid saga id: {e}")))?;
    let instance = state
        .store
        .get(SagaId::from_uuid(uuid))
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(SagaResponse {
        id: instance.id().to_string(),
        saga_type: instance.saga_type().to_string(),
        correlation: instance.correlation().to_string(),
        revision: instance.revision().as_i64(),
        data: instance.payload().clone(),
        created_at: instance.created_at().to_rfc3339(),
        updated_at: instance.updated_at().to_rfc3339(),
    }))
}
