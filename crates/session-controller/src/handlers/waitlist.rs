//! Waitlist handlers.

use super::{require_non_empty, ChannelPath};
use crate::errors::ScError;
use crate::models::{SessionType, WaitlistEntry};
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::instrument;

#[derive(Debug, Deserialize)]
pub struct JoinWaitlistRequest {
    pub user_id: String,
    #[serde(default)]
    pub subtype: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WaitlistMemberPath {
    pub host_id: String,
    pub session_type: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WaitlistResponse {
    pub waitlist: Vec<WaitlistEntry>,
}

/// Handler for GET /api/v1/hosts/:host_id/channels/:session_type/waitlist
///
/// Returns the channel's list while a channel is active, otherwise the
/// host's offline list.
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn get_waitlist(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
) -> Result<Json<WaitlistResponse>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let waitlist = state.engine.get_waitlist(host_id, session_type).await?;
    Ok(Json(WaitlistResponse { waitlist }))
}

/// Handler for POST /api/v1/hosts/:host_id/channels/:session_type/waitlist
///
/// # Response
///
/// - 200 OK: the list the candidate joined
/// - 404 Not Found: user or host not found
/// - 423 Locked: already waiting
/// - 424 Failed Dependency: balance below the channel minimum
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn join_waitlist(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
    Json(request): Json<JoinWaitlistRequest>,
) -> Result<Json<WaitlistResponse>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let user_id = require_non_empty("user_id", &request.user_id)?;

    let waitlist = state
        .controller
        .join_waitlist(host_id, session_type, user_id, request.subtype)
        .await?;
    Ok(Json(WaitlistResponse { waitlist }))
}

/// Handler for DELETE /api/v1/hosts/:host_id/channels/:session_type/waitlist/:user_id
///
/// Idempotent: removing a candidate who is not queued returns the list unchanged.
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn leave_waitlist(
    State(state): State<Arc<AppState>>,
    Path(path): Path<WaitlistMemberPath>,
) -> Result<Json<WaitlistResponse>, ScError> {
    let session_type = path.session_type.parse::<SessionType>()?;
    let waitlist = state
        .controller
        .leave_waitlist(&path.host_id, session_type, &path.user_id)
        .await?;
    Ok(Json(WaitlistResponse { waitlist }))
}
