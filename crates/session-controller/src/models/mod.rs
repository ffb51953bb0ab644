//! Aggregate models for the Session Controller.
//!
//! Channel, Host, Participant, Order, HostOrder and ChatThread are independent
//! aggregates addressed by id. They reference each other by id only and are
//! composed at read time by the engine.
//!
//! All timestamps are Unix epoch milliseconds.

use crate::errors::ScError;
use crate::store::Aggregate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of live offering a host can open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Livestream,
    Chat,
    Call,
}

impl SessionType {
    pub const ALL: [SessionType; 3] = [SessionType::Livestream, SessionType::Chat, SessionType::Call];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            SessionType::Livestream => "livestream",
            SessionType::Chat => "chat",
            SessionType::Call => "call",
        }
    }

    /// Whether two session types may not be active at the same time for one host.
    ///
    /// Livestream is exclusive of every other type; chat and call may coexist.
    #[must_use]
    pub fn conflicts_with(&self, other: SessionType) -> bool {
        *self != other && (*self == SessionType::Livestream || other == SessionType::Livestream)
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = ScError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "livestream" => Ok(SessionType::Livestream),
            "chat" => Ok(SessionType::Chat),
            "call" => Ok(SessionType::Call),
            other => Err(ScError::Validation(format!("unknown session type '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Active,
    Ended,
}

/// Occupant status.
///
/// Transition table (every other edge is invalid):
///
/// | From      | Allowed To                                                   |
/// |-----------|--------------------------------------------------------------|
/// | REQUESTED | ACCEPTED, REJECTED                                           |
/// | ACCEPTED  | TERMINATED_BY_CLIENT, TERMINATED_BY_ASTROLOGER, TERMINATED_BY_SYSTEM |
///
/// REQUESTED is entered only by admission. REJECTED and TERMINATED_* are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TempHostStatus {
    Requested,
    Accepted,
    Rejected,
    TerminatedByClient,
    /// Ended by the host. Keeps the marketplace's wire name.
    #[serde(rename = "TERMINATED_BY_ASTROLOGER", alias = "TERMINATED_BY_HOST")]
    TerminatedByHost,
    TerminatedBySystem,
}

impl TempHostStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            TempHostStatus::Requested => "REQUESTED",
            TempHostStatus::Accepted => "ACCEPTED",
            TempHostStatus::Rejected => "REJECTED",
            TempHostStatus::TerminatedByClient => "TERMINATED_BY_CLIENT",
            TempHostStatus::TerminatedByHost => "TERMINATED_BY_ASTROLOGER",
            TempHostStatus::TerminatedBySystem => "TERMINATED_BY_SYSTEM",
        }
    }

    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, TempHostStatus::Requested | TempHostStatus::Accepted)
    }

    #[must_use]
    pub const fn is_termination(&self) -> bool {
        matches!(
            self,
            TempHostStatus::TerminatedByClient
                | TempHostStatus::TerminatedByHost
                | TempHostStatus::TerminatedBySystem
        )
    }

    #[must_use]
    pub const fn can_transition_to(&self, next: TempHostStatus) -> bool {
        match self {
            TempHostStatus::Requested => {
                matches!(next, TempHostStatus::Accepted | TempHostStatus::Rejected)
            }
            TempHostStatus::Accepted => next.is_termination(),
            _ => false,
        }
    }

    /// Validate an edge against the transition table.
    pub fn validate_transition(&self, next: TempHostStatus) -> Result<(), ScError> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(ScError::InvalidTransition {
                from: self.as_str().to_string(),
                to: next.as_str().to_string(),
            })
        }
    }
}

impl fmt::Display for TempHostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitlistEntry {
    pub id: String,
    pub name: String,
    pub uid: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub joined_at: i64,
}

/// The single active occupant of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempHost {
    pub id: String,
    pub uid: u64,
    pub name: String,
    pub status: TempHostStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    /// Original waitlist join time, carried into rejection records.
    pub joined_at: i64,
    pub requested_at: i64,
    pub accepted_at: Option<i64>,
    pub rejected_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub tentative_end_at: Option<i64>,
    pub chat_id: Option<String>,
    pub order_id: Option<String>,
}

/// Closed occupancy kept on the channel after the occupant is cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempHostRecord {
    pub id: String,
    pub status: TempHostStatus,
    pub requested_at: i64,
    pub ended_at: Option<i64>,
    pub order_id: Option<String>,
}

impl From<&TempHost> for TempHostRecord {
    fn from(temp_host: &TempHost) -> Self {
        Self {
            id: temp_host.id.clone(),
            status: temp_host.status,
            requested_at: temp_host.requested_at,
            ended_at: temp_host.ended_at.or(temp_host.rejected_at),
            order_id: temp_host.order_id.clone(),
        }
    }
}

/// Rejection kept so a rejected candidate keeps queue priority on rejoin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RejectedSession {
    pub user_id: String,
    pub host_id: String,
    pub session_type: SessionType,
    pub rejected_at: i64,
    pub joined_at: i64,
}

/// Session (channel) aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub session_type: SessionType,
    pub host_id: String,
    /// Per-minute rate snapshotted at enable time.
    pub rate: f64,
    /// Discount percentage snapshotted at enable time.
    pub offer: f64,
    pub status: ChannelStatus,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub token: u64,
    pub device_uid: u64,
    pub waitlist: Vec<WaitlistEntry>,
    pub temp_host: Option<TempHost>,
    pub temp_host_history: Vec<TempHostRecord>,
    pub rejected_sessions: Vec<RejectedSession>,
}

impl Channel {
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }

    #[must_use]
    pub fn is_occupied(&self) -> bool {
        self.temp_host.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pricing {
    pub rate: f64,
    pub offer: f64,
}

/// Host aggregate: pricing, offline waitlists and lifetime counters.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub pricing: BTreeMap<SessionType, Pricing>,
    #[serde(default)]
    pub active_channels: BTreeMap<SessionType, String>,
    /// Offline waitlists, used while no channel of the type is active.
    #[serde(default)]
    pub waitlists: BTreeMap<SessionType, Vec<WaitlistEntry>>,
    #[serde(default)]
    pub channel_time_spent: BTreeMap<SessionType, i64>,
    #[serde(default)]
    pub orders: u64,
    /// Recording device-session uid per device.
    #[serde(default)]
    pub device_sessions: BTreeMap<String, u64>,
}

/// Reference to the channel a participant currently occupies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub host_id: String,
    pub session_type: SessionType,
    pub channel_id: String,
}

/// Reference to a waitlist a participant is queued in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitlistRef {
    pub host_id: String,
    pub session_type: SessionType,
}

/// Participant aggregate: prepaid balance and availability.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub name: String,
    pub uid: u64,
    pub balance: f64,
    #[serde(default)]
    pub busy_in: Option<ChannelRef>,
    #[serde(default)]
    pub joined_waitlists: Vec<WaitlistRef>,
    #[serde(default)]
    pub rejected_sessions: Vec<RejectedSession>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Initialized,
    Success,
    Failed,
}

/// Participant-side order, one per accepted occupancy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub participant_id: String,
    pub host_id: String,
    pub channel_id: String,
    pub session_type: SessionType,
    pub started_at: i64,
    pub tentative_end_at: i64,
    pub ended_at: Option<i64>,
    /// Discounted per-minute rate applied to this order.
    pub rate: f64,
    pub amount: f64,
    pub status: OrderStatus,
    pub resource_id: Option<String>,
    pub recording_id: Option<String>,
}

impl Order {
    /// Order ids are derived from participant id and start time so the order
    /// can be located after the occupant record is gone.
    #[must_use]
    pub fn id_for(participant_id: &str, started_at: i64) -> String {
        format!("ord-{participant_id}-{started_at}")
    }
}

/// Host-side ledger row written when an order is finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostOrder {
    pub id: String,
    pub host_id: String,
    pub participant_id: String,
    pub channel_id: String,
    pub session_type: SessionType,
    pub started_at: i64,
    pub ended_at: i64,
    pub duration_ms: i64,
    pub amount: f64,
    /// Usage that could not be collected because the balance ran out.
    pub shortfall: f64,
    pub status: TempHostStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChatStatus {
    Active,
    Inactive,
}

/// Chat thread between a host and a participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatThread {
    pub id: String,
    pub host_id: String,
    pub participant_id: String,
    pub status: ChatStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl ChatThread {
    #[must_use]
    pub fn id_for(host_id: &str, participant_id: &str) -> String {
        format!("chat-{host_id}-{participant_id}")
    }
}

impl Aggregate for Channel {
    const KIND: &'static str = "channel";
}

impl Aggregate for Host {
    const KIND: &'static str = "host";
}

impl Aggregate for Participant {
    const KIND: &'static str = "participant";
}

impl Aggregate for Order {
    const KIND: &'static str = "order";
}

impl Aggregate for HostOrder {
    const KIND: &'static str = "host_order";
}

impl Aggregate for ChatThread {
    const KIND: &'static str = "chat";
}
