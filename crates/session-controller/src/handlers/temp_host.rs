//! Temp host (occupant) handlers.
//!
//! - `POST  .../temp-host` - admit a candidate (REQUESTED)
//! - `GET   .../temp-host` - current occupant
//! - `PATCH .../temp-host` - accept, reject or terminate

use super::{require_non_empty, ChannelPath};
use crate::engine::AdmitOutcome;
use crate::errors::ScError;
use crate::models::{TempHost, TempHostStatus};
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Deserialize)]
pub struct AdmitRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
pub struct PatchTempHostRequest {
    pub user_id: String,
    pub status: TempHostStatus,
}

/// Handler for POST /api/v1/hosts/:host_id/channels/:session_type/temp-host
///
/// # Response
///
/// - 200 OK: `{"outcome": "admitted" | "requeued" | "queued", ...}`
/// - 404 Not Found: user or host not found
/// - 423 Locked: channel occupied, or the user is on another call
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn admit_temp_host(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
    Json(request): Json<AdmitRequest>,
) -> Result<Json<AdmitOutcome>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let user_id = require_non_empty("user_id", &request.user_id)?;

    let outcome = state
        .controller
        .admit_temp_host(host_id, session_type, user_id)
        .await?;
    Ok(Json(outcome))
}

/// Handler for GET /api/v1/hosts/:host_id/channels/:session_type/temp-host
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn get_temp_host(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
) -> Result<Json<TempHost>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let temp_host = state.engine.get_temp_host(host_id, session_type).await?;
    Ok(Json(temp_host))
}

/// Handler for PATCH /api/v1/hosts/:host_id/channels/:session_type/temp-host
///
/// # Request Body
///
/// ```json
/// { "user_id": "p1", "status": "ACCEPTED" }
/// ```
///
/// # Response
///
/// - 200 OK: the occupant after the transition
/// - 400 Bad Request: transition not allowed, or not enough balance to accept
/// - 404 Not Found: no occupant matching `user_id`
/// - 500: recording could not be started (accept only)
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn patch_temp_host(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
    Json(request): Json<PatchTempHostRequest>,
) -> Result<Json<TempHost>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let user_id = require_non_empty("user_id", &request.user_id)?;

    let temp_host = state
        .controller
        .patch_temp_host(host_id, session_type, user_id, request.status)
        .await?;

    info!(
        target: "sc.handlers.temp_host",
        host_id = %host_id,
        user_id = %user_id,
        status = temp_host.status.as_str(),
        "Temp host status updated"
    );

    Ok(Json(temp_host))
}
