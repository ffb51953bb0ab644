//! Channel handlers.
//!
//! - `POST /api/v1/hosts/:host_id/channels/:session_type/enable` - open a channel
//! - `POST /api/v1/hosts/:host_id/channels/:session_type/disable` - close it
//! - `GET  /api/v1/hosts/:host_id/channels/:session_type` - active channel

use super::{require_non_empty, ChannelPath};
use crate::errors::ScError;
use crate::models::Channel;
use crate::routes::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{info, instrument};

#[derive(Debug, Deserialize)]
pub struct EnableChannelRequest {
    /// Host device the channel is published from.
    pub device: String,
}

/// Handler for POST /api/v1/hosts/:host_id/channels/:session_type/enable
///
/// # Response
///
/// - 200 OK: the active channel (existing one if already enabled)
/// - 400 Bad Request: unknown session type, empty device, no pricing
/// - 404 Not Found: host not found
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn enable_channel(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
    Json(request): Json<EnableChannelRequest>,
) -> Result<Json<Channel>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let device = require_non_empty("device", &request.device)?;

    let channel = state
        .controller
        .enable_channel(host_id, session_type, device)
        .await?;

    info!(
        target: "sc.handlers.channels",
        host_id = %host_id,
        channel_id = %channel.id,
        "Channel enabled"
    );

    Ok(Json(channel))
}

/// Handler for POST /api/v1/hosts/:host_id/channels/:session_type/disable
///
/// # Response
///
/// - 200 OK: the ended channel
/// - 404 Not Found: host not found or no active channel of this type
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn disable_channel(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
) -> Result<Json<Channel>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let channel = state
        .controller
        .disable_channel(host_id, session_type)
        .await?;
    Ok(Json(channel))
}

/// Handler for GET /api/v1/hosts/:host_id/channels/:session_type
#[instrument(skip_all, fields(host_id = %path.host_id, session_type = %path.session_type))]
pub async fn get_channel(
    State(state): State<Arc<AppState>>,
    Path(path): Path<ChannelPath>,
) -> Result<Json<Channel>, ScError> {
    let (host_id, session_type) = path.parse()?;
    let channel = state.engine.get_channel(host_id, session_type).await?;
    Ok(Json(channel))
}
