//! Scheduled task handlers and balance top-up.
//!
//! Tasks arrive at-least-once and possibly late. Each handler re-reads state
//! and does nothing unless the occupancy it was scheduled for is still live.

use super::{billing, delay_seconds, effective_waitlist, SessionEngine, SideEffect};
use crate::errors::ScError;
use crate::models::{Channel, Host, Order, OrderStatus, Participant, SessionType, TempHostStatus};
use crate::observability::metrics;
use crate::services::events::{channel_topic, EVENT_BALANCE_LOW, EVENT_WAITTIME_UPDATED};
use crate::services::{RecordingIds, RecordingStatus, ScheduledTask};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

/// Largest single top-up accepted.
pub const MAX_TOP_UP_AMOUNT: f64 = 1_000_000.0;

/// What a task handler did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The occupancy the task was scheduled for is gone.
    Skipped,
    /// Another check was scheduled.
    Rescheduled { delay_seconds: u64 },
    /// Less than a minute left: warning published, final check scheduled.
    LowBalance { delay_seconds: u64 },
    /// Balance exhausted; the occupant was terminated by the system.
    Terminated,
    /// Recording had stopped and was started again.
    RecordingRestarted { recording_id: String },
    /// Estimates were published.
    Published { entries: usize },
}

#[derive(Debug, Serialize)]
struct WaitEstimate<'a> {
    user_id: &'a str,
    wait_seconds: u64,
}

impl SessionEngine {
    /// Handle a task delivered by the dispatcher.
    #[instrument(skip_all, fields(request_type = task.request_type(), host_id = %task.host_id()))]
    pub async fn handle_task(&self, task: ScheduledTask) -> Result<TaskOutcome, ScError> {
        let outcome = match task {
            ScheduledTask::BalanceCheck {
                host_id,
                session_type,
                channel_id,
                user_id,
                order_id,
            } => {
                self.handle_balance_check(&host_id, session_type, &channel_id, &user_id, &order_id)
                    .await
            }
            ScheduledTask::RecordingHealthCheck {
                host_id,
                session_type,
                channel_id,
                order_id,
            } => {
                self.handle_recording_check(&host_id, session_type, &channel_id, &order_id)
                    .await
            }
            ScheduledTask::WaitTimeEstimate {
                host_id,
                session_type,
            } => self.handle_wait_time_estimate(&host_id, session_type).await,
        }?;

        debug!(target: "sc.engine", outcome = ?outcome, "Task handled");
        Ok(outcome)
    }

    /// Live accepted occupancy of `channel_id` matching `order_id`, if any.
    async fn live_channel(&self, channel_id: &str, order_id: &str) -> Result<Option<Channel>, ScError> {
        let mut uow = self.begin();
        let channel = uow.load::<Channel>(channel_id).await?;
        Ok(channel.filter(|c| {
            c.is_active()
                && c.temp_host.as_ref().is_some_and(|t| {
                    t.status == TempHostStatus::Accepted && t.order_id.as_deref() == Some(order_id)
                })
        }))
    }

    async fn handle_balance_check(
        &self,
        host_id: &str,
        session_type: SessionType,
        channel_id: &str,
        user_id: &str,
        order_id: &str,
    ) -> Result<TaskOutcome, ScError> {
        let Some(channel) = self.live_channel(channel_id, order_id).await? else {
            return Ok(TaskOutcome::Skipped);
        };
        let Some(temp_host) = channel.temp_host.as_ref().filter(|t| t.id == user_id) else {
            return Ok(TaskOutcome::Skipped);
        };

        let now = self.now();
        let remaining = temp_host.tentative_end_at.unwrap_or(now) - now;

        if remaining <= 0 {
            info!(
                target: "sc.engine",
                host_id = %host_id,
                channel_id = %channel_id,
                user_id = %user_id,
                "Balance exhausted, ending session"
            );
            self.terminate_temp_host(
                host_id,
                session_type,
                user_id,
                TempHostStatus::TerminatedBySystem,
                false,
            )
            .await?;
            return Ok(TaskOutcome::Terminated);
        }

        let task = ScheduledTask::BalanceCheck {
            host_id: host_id.to_string(),
            session_type,
            channel_id: channel_id.to_string(),
            user_id: user_id.to_string(),
            order_id: order_id.to_string(),
        };

        if remaining <= billing::LOW_BALANCE_WINDOW_MS {
            let delay = delay_seconds(remaining);
            self.run_effects(
                "balance_check",
                vec![
                    SideEffect::Publish {
                        topic: channel_topic(host_id, session_type),
                        event: EVENT_BALANCE_LOW,
                        payload: serde_json::json!({
                            "user_id": user_id,
                            "remaining_seconds": delay,
                        }),
                    },
                    SideEffect::Schedule {
                        task,
                        delay_seconds: delay,
                    },
                ],
            )
            .await;
            return Ok(TaskOutcome::LowBalance {
                delay_seconds: delay,
            });
        }

        let delay = delay_seconds(billing::balance_check_delay(
            remaining,
            self.config.balance_check_max_interval_ms,
        ));
        self.run_effects(
            "balance_check",
            vec![SideEffect::Schedule {
                task,
                delay_seconds: delay,
            }],
        )
        .await;
        Ok(TaskOutcome::Rescheduled {
            delay_seconds: delay,
        })
    }

    async fn handle_recording_check(
        &self,
        host_id: &str,
        session_type: SessionType,
        channel_id: &str,
        order_id: &str,
    ) -> Result<TaskOutcome, ScError> {
        let Some(channel) = self.live_channel(channel_id, order_id).await? else {
            return Ok(TaskOutcome::Skipped);
        };

        let next_check = SideEffect::Schedule {
            task: ScheduledTask::RecordingHealthCheck {
                host_id: host_id.to_string(),
                session_type,
                channel_id: channel_id.to_string(),
                order_id: order_id.to_string(),
            },
            delay_seconds: self.config.recording_check_delay_seconds,
        };
        let rescheduled = TaskOutcome::Rescheduled {
            delay_seconds: self.config.recording_check_delay_seconds,
        };

        let mut uow = self.begin();
        let order: Order = uow.require(order_id, ScError::OrderNotFound).await?;
        let current = match (&order.resource_id, &order.recording_id) {
            (Some(resource_id), Some(recording_id)) => Some(RecordingIds {
                resource_id: resource_id.clone(),
                recording_id: recording_id.clone(),
            }),
            _ => None,
        };

        let status = match &current {
            Some(ids) => match self.recording.query(ids).await {
                Ok(status) => status,
                Err(e) => {
                    metrics::record_recording_failure("query");
                    warn!(target: "sc.engine", order_id = %order_id, error = %e, "Recording query failed");
                    self.run_effects("recording_check", vec![next_check]).await;
                    return Ok(rescheduled);
                }
            },
            None => RecordingStatus::Unknown,
        };

        if status == RecordingStatus::Active {
            self.run_effects("recording_check", vec![next_check]).await;
            return Ok(rescheduled);
        }

        warn!(
            target: "sc.engine",
            channel_id = %channel_id,
            order_id = %order_id,
            status = ?status,
            "Recording not active, restarting"
        );

        let participant: Participant = uow
            .require(&order.participant_id, ScError::UserNotFound)
            .await?;
        let restarted = match self.start_recording(&channel, &participant).await {
            Ok(ids) => ids,
            Err(e) => {
                metrics::record_recording_failure("restart");
                warn!(target: "sc.engine", order_id = %order_id, error = %e, "Recording restart failed");
                self.run_effects("recording_check", vec![next_check]).await;
                return Ok(rescheduled);
            }
        };

        let persisted = self
            .run_operation("recording_check", || {
                self.persist_recording_ids(order_id, &restarted)
            })
            .await;

        match persisted {
            Ok(true) => {
                self.run_effects("recording_check", vec![next_check]).await;
                Ok(TaskOutcome::RecordingRestarted {
                    recording_id: restarted.recording_id,
                })
            }
            Ok(false) => {
                // Order closed while restarting; nobody will stop this one.
                self.run_effects("recording_check", vec![SideEffect::StopRecording(restarted)])
                    .await;
                Ok(TaskOutcome::Skipped)
            }
            Err(e) => {
                self.run_effects("recording_check", vec![SideEffect::StopRecording(restarted)])
                    .await;
                Err(e)
            }
        }
    }

    async fn persist_recording_ids(
        &self,
        order_id: &str,
        ids: &RecordingIds,
    ) -> Result<(bool, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut order: Order = uow.require(order_id, ScError::OrderNotFound).await?;
        if order.status != OrderStatus::Initialized {
            return Ok((false, Vec::new()));
        }

        order.resource_id = Some(ids.resource_id.clone());
        order.recording_id = Some(ids.recording_id.clone());
        uow.stage(order_id, &order)?;
        uow.commit().await?;
        Ok((true, Vec::new()))
    }

    /// Publish estimated waiting time for every queued candidate.
    ///
    /// The first candidate waits for the current occupant's remaining time;
    /// each later one adds the host's average session length.
    async fn handle_wait_time_estimate(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<TaskOutcome, ScError> {
        let mut uow = self.begin();
        let Some(host) = uow.load::<Host>(host_id).await? else {
            return Ok(TaskOutcome::Skipped);
        };
        let channel = match self
            .resolve_active_channel(&mut uow, &host, session_type)
            .await
        {
            Ok(channel) => channel,
            Err(ScError::ChannelNotFound(_) | ScError::ChannelRestricted(_)) => None,
            Err(e) => return Err(e),
        };

        let now = self.now();
        let average_ms = average_session_ms(&host, session_type)
            .unwrap_or(self.config.min_balance_minutes * billing::MS_PER_MINUTE);
        let occupant_ms = match channel.as_ref().and_then(|c| c.temp_host.as_ref()) {
            Some(t) if t.status == TempHostStatus::Accepted => {
                t.tentative_end_at.map_or(average_ms, |end| (end - now).max(0))
            }
            Some(_) => average_ms,
            None => 0,
        };

        let waitlist = effective_waitlist(&host, channel.as_ref(), session_type);
        let estimates: Vec<WaitEstimate<'_>> = waitlist
            .iter()
            .zip(0_i64..)
            .map(|(entry, position)| WaitEstimate {
                user_id: &entry.id,
                wait_seconds: delay_seconds(occupant_ms + position * average_ms),
            })
            .collect();

        self.run_effects(
            "wait_time_estimate",
            vec![SideEffect::Publish {
                topic: channel_topic(host_id, session_type),
                event: EVENT_WAITTIME_UPDATED,
                payload: serde_json::json!({ "estimates": estimates }),
            }],
        )
        .await;

        Ok(TaskOutcome::Published {
            entries: estimates.len(),
        })
    }

    /// Credit a participant's balance.
    ///
    /// When the participant is the accepted occupant somewhere, the session's
    /// tentative end moves out by what the top-up buys and a new balance
    /// check is scheduled.
    #[instrument(skip_all, fields(participant_id = %participant_id))]
    pub async fn top_up(&self, participant_id: &str, amount: f64) -> Result<Participant, ScError> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(ScError::Validation(
                "top-up amount must be a positive number".to_string(),
            ));
        }
        if amount > MAX_TOP_UP_AMOUNT {
            return Err(ScError::Validation(format!(
                "top-up amount must not exceed {MAX_TOP_UP_AMOUNT}"
            )));
        }

        self.run_operation("top_up", || self.top_up_once(participant_id, amount))
            .await
    }

    async fn top_up_once(
        &self,
        participant_id: &str,
        amount: f64,
    ) -> Result<(Participant, Vec<SideEffect>), ScError> {
        let mut uow = self.begin();
        let mut participant: Participant =
            uow.require(participant_id, ScError::UserNotFound).await?;
        participant.balance = billing::round_money(participant.balance + amount);

        let mut effects = Vec::new();

        if let Some(busy) = participant.busy_in.clone() {
            if let Some(mut channel) = uow.load::<Channel>(&busy.channel_id).await? {
                let now = self.now();
                let rate = billing::discounted_rate(channel.rate, channel.offer);
                let active = channel.is_active();

                if let Some(temp_host) = channel.temp_host.as_mut().filter(|t| {
                    active && t.id == participant_id && t.status == TempHostStatus::Accepted
                }) {
                    let base = temp_host.tentative_end_at.unwrap_or(now).max(now);
                    let new_end = base.saturating_add(billing::top_up_extension_ms(amount, rate));
                    temp_host.tentative_end_at = Some(new_end);

                    if let Some(order_id) = temp_host.order_id.clone() {
                        let mut order: Order =
                            uow.require(&order_id, ScError::OrderNotFound).await?;
                        order.tentative_end_at = new_end;
                        uow.stage(&order_id, &order)?;

                        effects.push(SideEffect::Schedule {
                            task: ScheduledTask::BalanceCheck {
                                host_id: channel.host_id.clone(),
                                session_type: channel.session_type,
                                channel_id: channel.id.clone(),
                                user_id: participant_id.to_string(),
                                order_id,
                            },
                            delay_seconds: delay_seconds(billing::balance_check_delay(
                                new_end - now,
                                self.config.balance_check_max_interval_ms,
                            )),
                        });
                    }

                    info!(
                        target: "sc.engine",
                        participant_id = %participant_id,
                        channel_id = %channel.id,
                        tentative_end = new_end,
                        "Top-up extended live session"
                    );
                    uow.stage(&busy.channel_id, &channel)?;
                }
            }
        }

        uow.stage(participant_id, &participant)?;
        uow.commit().await?;

        info!(
            target: "sc.engine",
            participant_id = %participant_id,
            amount,
            balance = participant.balance,
            "Balance topped up"
        );

        Ok((participant, effects))
    }
}

/// Average length of the host's completed sessions of this type.
fn average_session_ms(host: &Host, session_type: SessionType) -> Option<i64> {
    let spent = *host.channel_time_spent.get(&session_type)?;
    let orders = i64::try_from(host.orders).ok().filter(|n| *n > 0)?;
    Some(spent / orders)
}
