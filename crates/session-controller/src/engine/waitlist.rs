//! Waitlist management.
//!
//! A host keeps one waitlist per session type. While a channel of that type
//! is active the list lives on the channel; otherwise it lives on the host.
//! Enable and disable move the whole list between the two, so an entry is
//! only ever in one of them. Lists are ordered by `joined_at` (FIFO), ties by
//! insertion order.

use super::{effective_waitlist, SessionEngine, SideEffect};
use crate::engine::billing;
use crate::errors::ScError;
use crate::models::{
    Channel, Host, Participant, RejectedSession, SessionType, WaitlistEntry, WaitlistRef,
};
use crate::services::events::{channel_topic, EVENT_WAITLIST_UPDATED};
use crate::services::ScheduledTask;
use tracing::{info, instrument};

/// Insert keeping the list ordered by `joined_at`, after any equal entries.
pub(crate) fn insert_fifo(list: &mut Vec<WaitlistEntry>, entry: WaitlistEntry) {
    let position = list.partition_point(|e| e.joined_at <= entry.joined_at);
    list.insert(position, entry);
}

/// Merge `incoming` into `list`, keeping FIFO order.
pub(crate) fn merge_fifo(list: &mut Vec<WaitlistEntry>, incoming: Vec<WaitlistEntry>) {
    for entry in incoming {
        if !contains(list, &entry.id) {
            insert_fifo(list, entry);
        }
    }
}

/// Remove a candidate, returning the removed entry.
pub(crate) fn remove_entry(list: &mut Vec<WaitlistEntry>, user_id: &str) -> Option<WaitlistEntry> {
    let position = list.iter().position(|e| e.id == user_id)?;
    Some(list.remove(position))
}

pub(crate) fn contains(list: &[WaitlistEntry], user_id: &str) -> bool {
    list.iter().any(|e| e.id == user_id)
}

pub(crate) fn add_waitlist_ref(participant: &mut Participant, host_id: &str, session_type: SessionType) {
    let exists = participant
        .joined_waitlists
        .iter()
        .any(|r| r.host_id == host_id && r.session_type == session_type);
    if !exists {
        participant.joined_waitlists.push(WaitlistRef {
            host_id: host_id.to_string(),
            session_type,
        });
    }
}

pub(crate) fn remove_waitlist_ref(
    participant: &mut Participant,
    host_id: &str,
    session_type: SessionType,
) -> bool {
    let before = participant.joined_waitlists.len();
    participant
        .joined_waitlists
        .retain(|r| !(r.host_id == host_id && r.session_type == session_type));
    before != participant.joined_waitlists.len()
}

/// Take the rejection record for (host, type) if the participant has one.
pub(crate) fn take_rejection(
    rejections: &mut Vec<RejectedSession>,
    host_id: &str,
    session_type: SessionType,
) -> Option<RejectedSession> {
    let position = rejections
        .iter()
        .position(|r| r.host_id == host_id && r.session_type == session_type)?;
    Some(rejections.remove(position))
}

/// Effects every waitlist change produces: a wait-time estimate and an update event.
pub(crate) fn waitlist_changed(
    host_id: &str,
    session_type: SessionType,
    waitlist: &[WaitlistEntry],
) -> Vec<SideEffect> {
    vec![
        SideEffect::Schedule {
            task: ScheduledTask::WaitTimeEstimate {
                host_id: host_id.to_string(),
                session_type,
            },
            delay_seconds: 0,
        },
        SideEffect::Publish {
            topic: channel_topic(host_id, session_type),
            event: EVENT_WAITLIST_UPDATED,
            payload: serde_json::json!({ "waitlist": waitlist }),
        },
    ]
}

impl SessionEngine {
    /// Queue a candidate for a host's session type.
    ///
    /// Returns the list the candidate was added to.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id))]
    pub async fn join_waitlist(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        subtype: Option<String>,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.run_operation("join_waitlist", || {
            self.join_once(host_id, session_type, user_id, subtype.clone())
        })
        .await
    }

    async fn join_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        subtype: Option<String>,
    ) -> Result<(Vec<WaitlistEntry>, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut participant: Participant = uow.require(user_id, ScError::UserNotFound).await?;
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut channel = self
            .resolve_active_channel(&mut uow, &host, session_type)
            .await?;

        let in_offline = host
            .waitlists
            .get(&session_type)
            .is_some_and(|list| contains(list, user_id));
        let in_channel = channel
            .as_ref()
            .is_some_and(|c| contains(&c.waitlist, user_id));
        if in_offline || in_channel {
            return Err(ScError::UserAlreadyExist(format!(
                "{user_id} is already waiting for {host_id}"
            )));
        }

        let is_occupant = channel
            .as_ref()
            .and_then(|c| c.temp_host.as_ref())
            .is_some_and(|t| t.id == user_id);
        if is_occupant {
            return Err(ScError::UserAlreadyExist(format!(
                "{user_id} already occupies the {session_type} channel of {host_id}"
            )));
        }

        if let Some(channel) = &channel {
            let required = billing::minimum_balance(
                channel.rate,
                channel.offer,
                self.config.min_balance_minutes,
            );
            if participant.balance < required {
                return Err(ScError::UserLowOnBalance {
                    required,
                    available: participant.balance,
                });
            }
        }

        // A previously rejected candidate keeps their place in line.
        let now = self.now();
        let joined_at = match take_rejection(&mut participant.rejected_sessions, host_id, session_type) {
            Some(rejection) => rejection.joined_at,
            None => now,
        };

        let entry = WaitlistEntry {
            id: participant.id.clone(),
            name: participant.name.clone(),
            uid: participant.uid,
            subtype,
            joined_at,
        };

        let waitlist = match channel.as_mut() {
            Some(channel) => {
                channel.rejected_sessions.retain(|r| r.user_id != user_id);
                insert_fifo(&mut channel.waitlist, entry);
                uow.stage(&channel.id, &*channel)?;
                channel.waitlist.clone()
            }
            None => {
                let list = host.waitlists.entry(session_type).or_default();
                insert_fifo(list, entry);
                let waitlist = list.clone();
                uow.stage(host_id, &host)?;
                waitlist
            }
        };

        add_waitlist_ref(&mut participant, host_id, session_type);
        uow.stage(user_id, &participant)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host_id,
            session_type = %session_type,
            user_id = %user_id,
            online = channel.is_some(),
            position = waitlist.len(),
            "Candidate joined waitlist"
        );

        let effects = waitlist_changed(host_id, session_type, &waitlist);
        Ok((waitlist, effects))
    }

    /// Remove a candidate from a host's waitlist. Absent candidates are a no-op.
    ///
    /// Returns the remaining list.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id))]
    pub async fn leave_waitlist(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.run_operation("leave_waitlist", || {
            self.leave_once(host_id, session_type, user_id)
        })
        .await
    }

    async fn leave_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<(Vec<WaitlistEntry>, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut channel = self.lenient_active_channel(&mut uow, &host, session_type).await?;

        let removed_offline = host
            .waitlists
            .get_mut(&session_type)
            .and_then(|list| remove_entry(list, user_id))
            .is_some();
        if removed_offline {
            uow.stage(host_id, &host)?;
        }

        let mut removed_channel = false;
        if let Some(channel) = channel.as_mut() {
            removed_channel = remove_entry(&mut channel.waitlist, user_id).is_some();
            if removed_channel {
                uow.stage(&channel.id, &*channel)?;
            }
        }

        let mut ref_removed = false;
        if let Some(mut participant) = uow.load::<Participant>(user_id).await? {
            ref_removed = remove_waitlist_ref(&mut participant, host_id, session_type);
            if ref_removed {
                uow.stage(user_id, &participant)?;
            }
        }

        let waitlist = effective_waitlist(&host, channel.as_ref(), session_type);

        if !(removed_offline || removed_channel || ref_removed) {
            return Ok((waitlist, Vec::new()));
        }

        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host_id,
            session_type = %session_type,
            user_id = %user_id,
            "Candidate left waitlist"
        );

        let effects = waitlist_changed(host_id, session_type, &waitlist);
        Ok((waitlist, effects))
    }

    /// Like `resolve_active_channel`, but a dangling reference reads as "no channel".
    async fn lenient_active_channel(
        &self,
        uow: &mut crate::store::UnitOfWork,
        host: &Host,
        session_type: SessionType,
    ) -> Result<Option<Channel>, ScError> {
        match self.resolve_active_channel(uow, host, session_type).await {
            Ok(channel) => Ok(channel),
            Err(ScError::ChannelNotFound(_) | ScError::ChannelRestricted(_)) => Ok(None),
            Err(other) => Err(other),
        }
    }
}
