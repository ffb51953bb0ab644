//! Occupant ("temp host") lifecycle: admit, accept, reject, terminate.
//!
//! Edges are validated against [`TempHostStatus::can_transition_to`]; the
//! disable path forces its way through with `force = true`.

use super::waitlist::{
    add_waitlist_ref, insert_fifo, remove_entry, remove_waitlist_ref, take_rejection,
    waitlist_changed,
};
use super::{delay_seconds, AdmitOutcome, SessionEngine, SideEffect};
use crate::engine::billing;
use crate::errors::ScError;
use crate::models::{
    Channel, ChannelRef, ChatStatus, ChatThread, Host, HostOrder, Order, OrderStatus, Participant,
    RejectedSession, SessionType, TempHost, TempHostRecord, TempHostStatus, WaitlistEntry,
};
use crate::services::events::{channel_topic, EVENT_CHANNEL_UPDATED};
use crate::services::{
    Notification, NotificationKind, RecordingIds, ScheduledTask, StartRecordingRequest,
};
use crate::store::UnitOfWork;
use tracing::{info, instrument, warn};

fn channel_updated(channel: &Channel) -> SideEffect {
    SideEffect::Publish {
        topic: channel_topic(&channel.host_id, channel.session_type),
        event: EVENT_CHANNEL_UPDATED,
        payload: serde_json::json!({
            "channel_id": channel.id,
            "status": channel.status,
            "temp_host": channel.temp_host,
            "waitlist_size": channel.waitlist.len(),
        }),
    }
}

fn notify(kind: NotificationKind, recipient_id: &str, channel: &Channel, data: serde_json::Value) -> SideEffect {
    SideEffect::Notify(Notification {
        kind,
        recipient_id: recipient_id.to_string(),
        host_id: channel.host_id.clone(),
        session_type: channel.session_type,
        data,
    })
}

/// Occupant of `channel`, which must be `user_id`.
fn matching_occupant(channel: &Channel, user_id: &str) -> Result<TempHost, ScError> {
    match &channel.temp_host {
        Some(temp_host) if temp_host.id == user_id => Ok(temp_host.clone()),
        Some(_) => Err(ScError::TempHostNotFound(format!(
            "{user_id} is not the occupant of channel {}",
            channel.id
        ))),
        None => Err(ScError::TempHostNotFound(format!(
            "channel {} has no occupant",
            channel.id
        ))),
    }
}

/// Replace any earlier rejection for the same (user, host, type).
fn record_rejection(list: &mut Vec<RejectedSession>, rejection: &RejectedSession) {
    list.retain(|r| {
        !(r.user_id == rejection.user_id
            && r.host_id == rejection.host_id
            && r.session_type == rejection.session_type)
    });
    list.push(rejection.clone());
}

impl SessionEngine {
    /// Move a candidate into the channel's occupant slot (REQUESTED).
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id))]
    pub async fn admit_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<AdmitOutcome, ScError> {
        self.run_operation("admit_temp_host", || {
            self.admit_once(host_id, session_type, user_id)
        })
        .await
    }

    async fn admit_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<(AdmitOutcome, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut participant: Participant = uow.require(user_id, ScError::UserNotFound).await?;
        let now = self.now();

        let Some(mut channel) = self
            .resolve_active_channel(&mut uow, &host, session_type)
            .await?
        else {
            return self
                .queue_offline(uow, &mut host, &mut participant, session_type, now)
                .await;
        };

        if let Some(busy) = &participant.busy_in {
            return Err(ScError::UserOnACall(format!(
                "{user_id} is in a {} session with {}",
                busy.session_type, busy.host_id
            )));
        }

        if channel.is_occupied() {
            return Err(ScError::ChannelRestricted(
                "someone already in session".to_string(),
            ));
        }

        let queued = remove_entry(&mut channel.waitlist, user_id);
        let required =
            billing::minimum_balance(channel.rate, channel.offer, self.config.min_balance_minutes);

        if participant.balance < required {
            // Soft decline for a queued candidate: back of the line, not an error.
            let Some(mut entry) = queued else {
                return Err(ScError::UserLowOnBalance {
                    required,
                    available: participant.balance,
                });
            };
            entry.joined_at = now;
            insert_fifo(&mut channel.waitlist, entry);
            add_waitlist_ref(&mut participant, host_id, session_type);

            uow.stage(&channel.id, &channel)?;
            uow.stage(user_id, &participant)?;
            uow.commit().await?;

            info!(
                target: "sc.engine",
                host_id = %host_id,
                user_id = %user_id,
                balance = participant.balance,
                required,
                "Admission declined for low balance, candidate requeued"
            );

            let effects = waitlist_changed(host_id, session_type, &channel.waitlist);
            return Ok((
                AdmitOutcome::Requeued {
                    waitlist: channel.waitlist,
                },
                effects,
            ));
        }

        let (joined_at, subtype) = match queued {
            Some(entry) => (entry.joined_at, entry.subtype),
            None => (now, None),
        };

        let temp_host = TempHost {
            id: participant.id.clone(),
            uid: participant.uid,
            name: participant.name.clone(),
            status: TempHostStatus::Requested,
            subtype,
            joined_at,
            requested_at: now,
            accepted_at: None,
            rejected_at: None,
            ended_at: None,
            tentative_end_at: None,
            chat_id: None,
            order_id: None,
        };
        channel.temp_host = Some(temp_host.clone());

        remove_waitlist_ref(&mut participant, host_id, session_type);
        participant.busy_in = Some(ChannelRef {
            host_id: host_id.to_string(),
            session_type,
            channel_id: channel.id.clone(),
        });

        uow.stage(&channel.id, &channel)?;
        uow.stage(user_id, &participant)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host_id,
            session_type = %session_type,
            channel_id = %channel.id,
            user_id = %user_id,
            "Candidate admitted"
        );

        let mut effects = vec![
            notify(
                NotificationKind::SessionRequested,
                host_id,
                &channel,
                serde_json::json!({ "user_id": user_id, "name": temp_host.name }),
            ),
            channel_updated(&channel),
        ];
        effects.extend(waitlist_changed(host_id, session_type, &channel.waitlist));

        Ok((AdmitOutcome::Admitted { temp_host }, effects))
    }

    async fn queue_offline(
        &self,
        mut uow: UnitOfWork,
        host: &mut Host,
        participant: &mut Participant,
        session_type: SessionType,
        now: i64,
    ) -> Result<(AdmitOutcome, Vec<SideEffect>), ScError> {
        let list = host.waitlists.entry(session_type).or_default();
        if !list.iter().any(|e| e.id == participant.id) {
            let joined_at = take_rejection(&mut participant.rejected_sessions, &host.id, session_type)
                .map_or(now, |rejection| rejection.joined_at);
            insert_fifo(
                list,
                WaitlistEntry {
                    id: participant.id.clone(),
                    name: participant.name.clone(),
                    uid: participant.uid,
                    subtype: None,
                    joined_at,
                },
            );
        }
        let waitlist = list.clone();

        add_waitlist_ref(participant, &host.id, session_type);
        uow.stage(&host.id, &*host)?;
        uow.stage(&participant.id, &*participant)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host.id,
            session_type = %session_type,
            user_id = %participant.id,
            "No active channel, candidate queued offline"
        );

        let effects = waitlist_changed(&host.id, session_type, &waitlist);
        Ok((AdmitOutcome::Queued { waitlist }, effects))
    }

    /// REQUESTED -> ACCEPTED: open the chat, start recording, create the order.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id))]
    pub async fn accept_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<TempHost, ScError> {
        self.run_operation("accept_temp_host", || {
            self.accept_once(host_id, session_type, user_id)
        })
        .await
    }

    async fn accept_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<(TempHost, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut channel = self
            .require_active_channel(&mut uow, &host, session_type)
            .await?;
        let mut temp_host = matching_occupant(&channel, user_id)?;
        temp_host
            .status
            .validate_transition(TempHostStatus::Accepted)?;

        let participant: Participant = uow.require(user_id, ScError::UserNotFound).await?;
        let now = self.now();
        let rate = billing::discounted_rate(channel.rate, channel.offer);
        let tentative_end = billing::tentative_end(now, participant.balance, rate);
        if tentative_end - now < self.config.min_session_ms {
            return Err(ScError::NotEnoughBalance {
                min_seconds: self.config.min_session_ms / 1000,
            });
        }

        let chat_id = ChatThread::id_for(host_id, user_id);
        let chat = match uow.load::<ChatThread>(&chat_id).await? {
            Some(mut chat) => {
                chat.status = ChatStatus::Active;
                chat.updated_at = now;
                chat
            }
            None => ChatThread {
                id: chat_id.clone(),
                host_id: host_id.to_string(),
                participant_id: user_id.to_string(),
                status: ChatStatus::Active,
                created_at: now,
                updated_at: now,
            },
        };
        uow.stage(&chat_id, &chat)?;

        let order_id = Order::id_for(user_id, now);
        let existing_order = uow.load::<Order>(&order_id).await?;

        let recording = self.start_recording(&channel, &participant).await?;

        if existing_order.is_none() {
            let order = Order {
                id: order_id.clone(),
                participant_id: user_id.to_string(),
                host_id: host_id.to_string(),
                channel_id: channel.id.clone(),
                session_type,
                started_at: now,
                tentative_end_at: tentative_end,
                ended_at: None,
                rate,
                amount: 0.0,
                status: OrderStatus::Initialized,
                resource_id: Some(recording.resource_id.clone()),
                recording_id: Some(recording.recording_id.clone()),
            };
            uow.stage(&order_id, &order)?;
        }

        temp_host.status = TempHostStatus::Accepted;
        temp_host.accepted_at = Some(now);
        temp_host.tentative_end_at = Some(tentative_end);
        temp_host.chat_id = Some(chat_id);
        temp_host.order_id = Some(order_id.clone());
        channel.temp_host = Some(temp_host.clone());
        uow.stage(&channel.id, &channel)?;

        if let Err(e) = uow.commit().await {
            // The recording belongs to a session that never happened.
            if let Err(stop_err) = self.recording.stop(&recording).await {
                warn!(
                    target: "sc.engine",
                    error = %stop_err,
                    recording_id = %recording.recording_id,
                    "Failed to stop recording after aborted accept"
                );
            }
            return Err(e);
        }

        info!(
            target: "sc.engine",
            host_id = %host_id,
            channel_id = %channel.id,
            user_id = %user_id,
            order_id = %order_id,
            tentative_end,
            "Occupant accepted"
        );

        let remaining = tentative_end - now;
        let effects = vec![
            SideEffect::Schedule {
                task: ScheduledTask::BalanceCheck {
                    host_id: host_id.to_string(),
                    session_type,
                    channel_id: channel.id.clone(),
                    user_id: user_id.to_string(),
                    order_id: order_id.clone(),
                },
                delay_seconds: delay_seconds(billing::balance_check_delay(
                    remaining,
                    self.config.balance_check_max_interval_ms,
                )),
            },
            SideEffect::Schedule {
                task: ScheduledTask::RecordingHealthCheck {
                    host_id: host_id.to_string(),
                    session_type,
                    channel_id: channel.id.clone(),
                    order_id,
                },
                delay_seconds: self.config.recording_check_delay_seconds,
            },
            notify(
                NotificationKind::SessionAccepted,
                user_id,
                &channel,
                serde_json::json!({ "tentative_end_at": tentative_end }),
            ),
            channel_updated(&channel),
        ];

        Ok((temp_host, effects))
    }

    /// Acquire and start a recording for the channel's occupancy.
    pub(crate) async fn start_recording(
        &self,
        channel: &Channel,
        participant: &Participant,
    ) -> Result<RecordingIds, ScError> {
        let resource_id = self
            .recording
            .acquire(&channel.id, channel.device_uid)
            .await
            .map_err(|e| {
                warn!(target: "sc.engine", channel_id = %channel.id, error = %e, "Recording acquire failed");
                ScError::FailedToStartRecording(e.to_string())
            })?;

        let request = StartRecordingRequest {
            resource_id,
            channel_id: channel.id.clone(),
            token: channel.token,
            uid: channel.device_uid,
            participants: vec![channel.device_uid, participant.uid],
            storage_bucket: self.config.recording_storage_bucket.clone(),
        };

        self.recording.start(&request).await.map_err(|e| {
            warn!(target: "sc.engine", channel_id = %channel.id, error = %e, "Recording start failed");
            ScError::FailedToStartRecording(e.to_string())
        })
    }

    /// REQUESTED -> REJECTED.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id))]
    pub async fn reject_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<TempHost, ScError> {
        self.run_operation("reject_temp_host", || {
            self.reject_once(host_id, session_type, user_id)
        })
        .await
    }

    async fn reject_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<(TempHost, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut channel = self
            .require_active_channel(&mut uow, &host, session_type)
            .await?;
        matching_occupant(&channel, user_id)?;

        let now = self.now();
        let (rejected, effects) = self.reject_in(&mut uow, &mut channel, now, false).await?;
        uow.stage(&channel.id, &channel)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            host_id = %host_id,
            channel_id = %channel.id,
            user_id = %user_id,
            "Occupant rejected"
        );

        Ok((rejected, effects))
    }

    /// Reject the channel's occupant inside `uow`. The caller stages `channel`.
    pub(crate) async fn reject_in(
        &self,
        uow: &mut UnitOfWork,
        channel: &mut Channel,
        now: i64,
        force: bool,
    ) -> Result<(TempHost, Vec<SideEffect>), ScError> {
        let mut temp_host = channel.temp_host.clone().ok_or_else(|| {
            ScError::TempHostNotFound(format!("channel {} has no occupant", channel.id))
        })?;
        if !force {
            temp_host
                .status
                .validate_transition(TempHostStatus::Rejected)?;
        }

        temp_host.status = TempHostStatus::Rejected;
        temp_host.rejected_at = Some(now);

        let rejection = RejectedSession {
            user_id: temp_host.id.clone(),
            host_id: channel.host_id.clone(),
            session_type: channel.session_type,
            rejected_at: now,
            joined_at: temp_host.joined_at,
        };
        record_rejection(&mut channel.rejected_sessions, &rejection);

        if let Some(mut participant) = uow.load::<Participant>(&temp_host.id).await? {
            record_rejection(&mut participant.rejected_sessions, &rejection);
            participant.busy_in = None;
            uow.stage(&participant.id, &participant)?;
        }

        channel.temp_host_history.push(TempHostRecord::from(&temp_host));
        channel.temp_host = None;

        let effects = vec![
            notify(
                NotificationKind::SessionRejected,
                &temp_host.id,
                channel,
                serde_json::Value::Null,
            ),
            channel_updated(channel),
        ];
        Ok((temp_host, effects))
    }

    /// ACCEPTED -> TERMINATED_*: bill, finalize the order, free the channel.
    #[instrument(skip_all, fields(host_id = %host_id, session_type = %session_type, user_id = %user_id, reason = %reason))]
    pub async fn terminate_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        reason: TempHostStatus,
        force: bool,
    ) -> Result<TempHost, ScError> {
        if !reason.is_termination() {
            return Err(ScError::Validation(format!(
                "{reason} is not a termination status"
            )));
        }

        self.run_operation("terminate_temp_host", || {
            self.terminate_once(host_id, session_type, user_id, reason, force)
        })
        .await
    }

    async fn terminate_once(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        reason: TempHostStatus,
        force: bool,
    ) -> Result<(TempHost, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut host: Host = uow.require(host_id, ScError::HostNotFound).await?;
        let mut channel = self
            .require_active_channel(&mut uow, &host, session_type)
            .await?;

        if force {
            if channel.temp_host.is_none() {
                return Err(ScError::TempHostNotFound(format!(
                    "channel {} has no occupant",
                    channel.id
                )));
            }
        } else {
            let occupant = matching_occupant(&channel, user_id)?;
            occupant.status.validate_transition(reason)?;
        }

        let now = self.now();
        let (ended, effects) = self
            .terminate_in(&mut uow, &mut channel, &mut host, reason, now)
            .await?;
        uow.stage(&channel.id, &channel)?;
        uow.stage(host_id, &host)?;
        uow.commit().await?;

        Ok((ended, effects))
    }

    /// Terminate the channel's occupant inside `uow`.
    ///
    /// Bills the elapsed time against the participant, finalizes the order
    /// and writes the host ledger row when an order was opened. The caller
    /// stages `channel` and `host`.
    pub(crate) async fn terminate_in(
        &self,
        uow: &mut UnitOfWork,
        channel: &mut Channel,
        host: &mut Host,
        reason: TempHostStatus,
        now: i64,
    ) -> Result<(TempHost, Vec<SideEffect>), ScError> {
        let mut temp_host = channel.temp_host.clone().ok_or_else(|| {
            ScError::TempHostNotFound(format!("channel {} has no occupant", channel.id))
        })?;
        let mut participant: Participant =
            uow.require(&temp_host.id, ScError::UserNotFound).await?;

        let elapsed_ms = temp_host.accepted_at.map_or(0, |accepted| now - accepted);
        let rate = billing::discounted_rate(channel.rate, channel.offer);
        let usage = billing::usage(elapsed_ms, rate, participant.balance);

        if usage.shortfall > 0.0 {
            warn!(
                target: "sc.engine",
                user_id = %participant.id,
                channel_id = %channel.id,
                amount = usage.amount,
                shortfall = usage.shortfall,
                "Usage exceeded balance, shortfall written off"
            );
        }
        participant.balance = usage.updated_balance;
        participant.busy_in = None;
        uow.stage(&participant.id, &participant)?;

        let mut effects = Vec::new();

        if let Some(order_id) = temp_host.order_id.clone() {
            let mut order: Order = uow.require(&order_id, ScError::OrderNotFound).await?;
            if order.status == OrderStatus::Initialized {
                order.status = OrderStatus::Success;
                order.amount = usage.amount;
                order.ended_at = Some(now);
                uow.stage(&order_id, &order)?;

                *host
                    .channel_time_spent
                    .entry(channel.session_type)
                    .or_insert(0) += usage.elapsed_ms;
                host.orders += 1;

                let host_order = HostOrder {
                    id: format!("h{order_id}"),
                    host_id: host.id.clone(),
                    participant_id: participant.id.clone(),
                    channel_id: channel.id.clone(),
                    session_type: channel.session_type,
                    started_at: order.started_at,
                    ended_at: now,
                    duration_ms: usage.elapsed_ms,
                    amount: usage.amount,
                    shortfall: usage.shortfall,
                    status: reason,
                };
                uow.stage(&host_order.id, &host_order)?;
            }

            if let (Some(resource_id), Some(recording_id)) =
                (order.resource_id.clone(), order.recording_id.clone())
            {
                effects.push(SideEffect::StopRecording(RecordingIds {
                    resource_id,
                    recording_id,
                }));
            }
        }

        if let Some(chat_id) = &temp_host.chat_id {
            if let Some(mut chat) = uow.load::<ChatThread>(chat_id).await? {
                chat.status = ChatStatus::Inactive;
                chat.updated_at = now;
                uow.stage(chat_id, &chat)?;
            }
        }

        temp_host.status = reason;
        temp_host.ended_at = Some(now);
        channel.temp_host_history.push(TempHostRecord::from(&temp_host));
        channel.temp_host = None;

        info!(
            target: "sc.engine",
            host_id = %host.id,
            channel_id = %channel.id,
            user_id = %participant.id,
            reason = %reason,
            elapsed_ms = usage.elapsed_ms,
            amount = usage.amount,
            balance = usage.updated_balance,
            "Occupancy ended"
        );

        let data = serde_json::json!({
            "reason": reason,
            "elapsed_ms": usage.elapsed_ms,
            "amount": usage.amount,
        });
        effects.push(notify(
            NotificationKind::SessionEnded,
            &participant.id,
            channel,
            data.clone(),
        ));
        effects.push(notify(
            NotificationKind::SessionEnded,
            &host.id,
            channel,
            data,
        ));
        effects.push(channel_updated(channel));

        Ok((temp_host, effects))
    }

    /// Drive the occupant to `status` through accept, reject or terminate.
    pub async fn patch_temp_host_status(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        status: TempHostStatus,
    ) -> Result<TempHost, ScError> {
        match status {
            TempHostStatus::Accepted => self.accept_temp_host(host_id, session_type, user_id).await,
            TempHostStatus::Rejected => self.reject_temp_host(host_id, session_type, user_id).await,
            TempHostStatus::TerminatedByClient
            | TempHostStatus::TerminatedByHost
            | TempHostStatus::TerminatedBySystem => {
                self.terminate_temp_host(host_id, session_type, user_id, status, false)
                    .await
            }
            TempHostStatus::Requested => Err(ScError::Validation(
                "REQUESTED is entered by admission only".to_string(),
            )),
        }
    }
}
