//! Channel enable / disable.

use super::waitlist::{merge_fifo, waitlist_changed};
use super::{SessionEngine, SideEffect};
use crate::errors::ScError;
use crate::models::{Channel, ChannelStatus, Host, SessionType, TempHostStatus};
use crate::services::events::{channel_topic, EVENT_CHANNEL_UPDATED};
use crate::services::{Notification, NotificationKind};
use crate::store::{UnitOfWork, SEQ_CHANNEL_TOKEN, SEQ_DEVICE_SESSION};
use tracing::{info, instrument};

fn channel_event(channel: &Channel) -> SideEffect {
    SideEffect::Publish {
        topic: channel_topic(&channel.host_id, channel.session_type),
        event: EVENT_CHANNEL_UPDATED,
        payload: serde_json::json!({
            "channel_id": channel.id,
            "status": channel.status,
            "rate": channel.rate,
            "offer": channel.offer,
        }),
    }
}

fn channel_notification(kind: NotificationKind, channel: &Channel) -> SideEffect {
    SideEffect::Notify(Notification {
        kind,
        recipient_id: channel.host_id.clone(),
        host_id: channel.host_id.clone(),
        session_type: channel.session_type,
        data: serde_json::json!({ "channel_id": channel.id }),
    })
}

impl SessionEngine {
    /// Open a channel of `session_type` for a host.
    ///
    /// Livestream is exclusive of chat and call, so enabling one force-disables
    /// the other in the same commit. Enabling a type that is already active
    /// returns the existing channel.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type))]
    pub async fn enable_channel(
        &self,
        host_id: &str,
        session_type: SessionType,
        device: &str,
    ) -> Result<Channel, ScError> {
        self.run_operation("enable_channel", || {
            self.enable_once(host_id, session_type, device)
        })
        .await
    }

    async fn enable_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        device: &str,
    ) -> Result<(Channel, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;

        match self
            .resolve_active_channel(&mut uow, &host, session_type)
            .await
        {
            Ok(Some(existing)) => return Ok((existing, Vec::new())),
            Ok(None) => {}
            // Stale reference: drop it and open a fresh channel.
            Err(ScError::ChannelNotFound(_) | ScError::ChannelRestricted(_)) => {
                host.active_channels.remove(&session_type);
            }
            Err(other) => return Err(other),
        }

        let pricing = host.pricing.get(&session_type).copied().ok_or_else(|| {
            ScError::Validation(format!("host {host_id} has no {session_type} pricing"))
        })?;

        let now = self.now();
        let mut effects = Vec::new();

        for other in SessionType::ALL {
            if !session_type.conflicts_with(other) || !host.active_channels.contains_key(&other) {
                continue;
            }
            match self.disable_in(&mut uow, &mut host, other, now).await {
                Ok((_, disabled_effects)) => effects.extend(disabled_effects),
                Err(ScError::ChannelNotFound(_) | ScError::ChannelRestricted(_)) => {
                    host.active_channels.remove(&other);
                }
                Err(e) => return Err(e),
            }
        }

        let token = self.sequence.next(SEQ_CHANNEL_TOKEN).await?;
        let device_uid = match host.device_sessions.get(device) {
            Some(uid) => *uid,
            None => {
                let uid = self.sequence.next(SEQ_DEVICE_SESSION).await?;
                host.device_sessions.insert(device.to_string(), uid);
                uid
            }
        };

        let waitlist = host.waitlists.remove(&session_type).unwrap_or_default();

        let channel = Channel {
            id: format!("ch-{}", uuid::Uuid::new_v4()),
            session_type,
            host_id: host_id.to_string(),
            rate: pricing.rate,
            offer: pricing.offer,
            status: ChannelStatus::Active,
            created_at: now,
            ended_at: None,
            token,
            device_uid,
            waitlist,
            temp_host: None,
            temp_host_history: Vec::new(),
            rejected_sessions: Vec::new(),
        };
        host.active_channels
            .insert(session_type, channel.id.clone());

        uow.stage(&channel.id, &channel)?;
        uow.stage(host_id, &host)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host_id,
            session_type = %session_type,
            channel_id = %channel.id,
            token,
            device_uid,
            waitlist = channel.waitlist.len(),
            "Channel enabled"
        );

        effects.push(channel_notification(NotificationKind::ChannelStarted, &channel));
        effects.push(channel_event(&channel));
        effects.extend(waitlist_changed(host_id, session_type, &channel.waitlist));
        Ok((channel, effects))
    }

    /// Close the host's active channel of `session_type`.
    ///
    /// An accepted occupant is terminated (and billed) as TERMINATED_BY_ASTROLOGER,
    /// a requested one is rejected. The remaining waitlist moves back to the host.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type))]
    pub async fn disable_channel(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<Channel, ScError> {
        self.run_operation("disable_channel", || {
            self.disable_once(host_id, session_type)
        })
        .await
    }

    async fn disable_once(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<(Channel, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let now = self.now();

        let (channel, effects) = self
            .disable_in(&mut uow, &mut host, session_type, now)
            .await?;
        uow.stage(host_id, &host)?;
        uow.commit().await?;

        Ok((channel, effects))
    }

    /// End the active channel inside `uow`. The caller stages `host`.
    pub(crate) async fn disable_in(
        &self,
        uow: &mut UnitOfWork,
        host: &mut Host,
        session_type: SessionType,
        now: i64,
    ) -> Result<(Channel, Vec<SideEffect>), ScError> {
        let mut channel = self
            .require_active_channel(uow, host, session_type)
            .await?;
        let mut effects = Vec::new();

        if let Some(status) = channel.temp_host.as_ref().map(|t| t.status) {
            let (_, occupant_effects) = match status {
                TempHostStatus::Accepted => {
                    self.terminate_in(uow, &mut channel, host, TempHostStatus::TerminatedByHost, now)
                        .await?
                }
                _ => self.reject_in(uow, &mut channel, now, true).await?,
            };
            effects.extend(occupant_effects);
        }

        let residual = std::mem::take(&mut channel.waitlist);
        let offline = host.waitlists.entry(session_type).or_default();
        merge_fifo(offline, residual);
        let offline_waitlist = offline.clone();

        channel.status = ChannelStatus::Ended;
        channel.ended_at = Some(now);
        host.active_channels.remove(&session_type);
        uow.stage(&channel.id, &channel)?;

        info!(
            target: "sc.engine",
            host_id = %host.id,
            session_type = %session_type,
            channel_id = %channel.id,
            returned_to_host = offline_waitlist.len(),
            "Channel disabled"
        );

        effects.push(channel_notification(NotificationKind::ChannelEnded, &channel));
        effects.push(channel_event(&channel));
        effects.extend(waitlist_changed(&host.id, session_type, &offline_waitlist));
        Ok((channel, effects))
    }
}
