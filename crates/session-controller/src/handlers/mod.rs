//! HTTP request handlers for the Session Controller.
//!
//! Handlers are thin: parse and validate input, hand the operation to the
//! controller (or the engine for reads), serialize the result. Errors render
//! through `ScError`'s `IntoResponse`.

pub mod channels;
pub mod metrics;
pub mod participants;
pub mod tasks;
pub mod temp_host;
pub mod waitlist;

pub use channels::{disable_channel, enable_channel, get_channel};
pub use metrics::metrics_handler;
pub use participants::top_up;
pub use tasks::deliver_task;
pub use temp_host::{admit_temp_host, get_temp_host, patch_temp_host};
pub use waitlist::{get_waitlist, join_waitlist, leave_waitlist};

use crate::errors::ScError;
use crate::models::SessionType;
use serde::Deserialize;

/// Path parameters shared by every channel-scoped route.
#[derive(Debug, Deserialize)]
pub struct ChannelPath {
    pub host_id: String,
    pub session_type: String,
}

impl ChannelPath {
    /// Host id and parsed session type.
    pub fn parse(&self) -> Result<(&str, SessionType), ScError> {
        let session_type = self.session_type.parse::<SessionType>()?;
        Ok((self.host_id.as_str(), session_type))
    }
}

/// Reject empty or whitespace-only identifiers from request bodies.
pub(crate) fn require_non_empty<'a>(field: &str, value: &'a str) -> Result<&'a str, ScError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ScError::Validation(format!("{field} must not be empty")));
    }
    Ok(trimmed)
}
