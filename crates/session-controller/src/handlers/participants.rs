//! Participant handlers.

use crate::errors::ScError;
use crate::models::Participant;
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub amount: f64,
}

/// Handler for POST /api/v1/participants/:participant_id/top-up
///
/// Credits the balance. A live session's tentative end moves out by what the
/// top-up buys.
///
/// # Response
///
/// - 200 OK: the participant after the credit
/// - 400 Bad Request: amount not a positive number
/// - 404 Not Found: participant not found
#[instrument(skip_all, fields(participant_id = %participant_id))]
pub async fn top_up(
    State(state): State<Arc<AppState>>,
    Path(participant_id): Path<String>,
    Json(request): Json<TopUpRequest>,
) -> Result<Json<Participant>, ScError> {
    let participant = state.engine.top_up(&participant_id, request.amount).await?;
    Ok(Json(participant))
}
