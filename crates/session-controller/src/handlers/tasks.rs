//! Scheduled task delivery.
//!
//! The dispatcher POSTs each task back here when its delay has elapsed.
//! Delivery is at-least-once; handlers re-read state and skip stale tasks.

use crate::engine::TaskOutcome;
use crate::errors::ScError;
use crate::routes::AppState;
use crate::services::ScheduledTask;
use axum::{extract::State, Json};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Handler for POST /internal/v1/tasks
///
/// # Request Body
///
/// ```json
/// {
///   "request_type": "balance_check",
///   "payload": { "host_id": "h1", "session_type": "chat", ... }
/// }
/// ```
#[instrument(skip_all, fields(request_type = task.request_type(), host_id = %task.host_id()))]
pub async fn deliver_task(
    State(state): State<Arc<AppState>>,
    Json(task): Json<ScheduledTask>,
) -> Result<Json<TaskOutcome>, ScError> {
    debug!(target: "sc.handlers.tasks", request_type = task.request_type(), "Task delivered");
    let outcome = state.controller.handle_task(task).await?;
    Ok(Json(outcome))
}
