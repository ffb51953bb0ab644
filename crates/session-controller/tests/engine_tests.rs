//! Engine integration tests.
//!
//! Drives `SessionEngine` end to end against the in-memory store with mock
//! recording, dispatcher and event bus:
//! - Channel enable / disable and type exclusivity
//! - Waitlist join / leave, minimum balance and rejoin priority
//! - Occupant state machine and single-occupant admission
//! - Billing on terminate, floored balances and order finalization
//! - Scheduled task handling and top-up

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use sc_test_utils::{load, TestEngine, TestHost, TestParticipant, TEST_START_MS};
use session_controller::engine::billing::MAX_AFFORDABLE_MS;
use session_controller::engine::{AdmitOutcome, EngineConfig, TaskOutcome, MAX_TOP_UP_AMOUNT};
use session_controller::errors::ScError;
use session_controller::models::{
    Channel, ChannelStatus, ChatStatus, ChatThread, Host, HostOrder, Order, OrderStatus,
    Participant, SessionType, TempHostStatus, WaitlistEntry,
};
use session_controller::services::recording::mock::MockRecording;
use session_controller::services::{NotificationKind, RecordingStatus, ScheduledTask};
use session_controller::store::Aggregate;

const CHAT: SessionType = SessionType::Chat;

async fn seed(env: &TestEngine) {
    TestHost::new("h1")
        .with_rate(SessionType::Chat, 10.0)
        .with_rate(SessionType::Call, 20.0)
        .with_rate(SessionType::Livestream, 5.0)
        .seed(&env.store)
        .await;
    TestParticipant::new("p1")
        .with_uid(101)
        .with_balance(100.0)
        .seed(&env.store)
        .await;
    TestParticipant::new("p2")
        .with_uid(102)
        .with_balance(100.0)
        .seed(&env.store)
        .await;
    TestParticipant::new("p_low")
        .with_uid(103)
        .with_balance(40.0)
        .seed(&env.store)
        .await;
}

async fn seeded() -> TestEngine {
    let env = TestEngine::new();
    seed(&env).await;
    env
}

fn ids(list: &[WaitlistEntry]) -> Vec<&str> {
    list.iter().map(|e| e.id.as_str()).collect()
}

/// Enable chat, admit and accept `user_id`. Returns the channel id.
async fn accepted(env: &TestEngine, user_id: &str) -> String {
    let channel = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    let outcome = env.engine.admit_temp_host("h1", CHAT, user_id).await.unwrap();
    assert!(matches!(outcome, AdmitOutcome::Admitted { .. }));
    env.engine
        .accept_temp_host("h1", CHAT, user_id)
        .await
        .unwrap();
    channel.id
}

async fn set_balance(env: &TestEngine, user_id: &str, balance: f64) {
    let mut participant: Participant = load(&env.store, user_id).await.unwrap();
    participant.balance = balance;
    env.store
        .put_raw(
            &Participant::key_for(user_id),
            serde_json::to_string(&participant).unwrap(),
        )
        .await;
}

// ============================================================================
// Channel lifecycle
// ============================================================================

#[tokio::test]
async fn test_enable_channel_starts_active_and_empty() {
    let env = seeded().await;

    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert_eq!(channel.status, ChannelStatus::Active);
    assert!(channel.temp_host.is_none());
    assert!(channel.waitlist.is_empty());
    assert!(channel.token > 0, "token should be assigned");
    assert_eq!(channel.rate, 10.0);
    assert_eq!(channel.created_at, TEST_START_MS);

    let notifications = env.events.notifications().await;
    assert!(notifications
        .iter()
        .any(|n| n.kind == NotificationKind::ChannelStarted && n.recipient_id == "h1"));
}

#[tokio::test]
async fn test_enable_active_channel_returns_existing() {
    let env = seeded().await;

    let first = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    let second = env.engine.enable_channel("h1", CHAT, "device-b").await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(first.token, second.token);
}

#[tokio::test]
async fn test_enable_without_pricing_fails_validation() {
    let env = TestEngine::new();
    TestHost::new("bare").seed(&env.store).await;

    let err = env
        .engine
        .enable_channel("bare", CHAT, "device-a")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::Validation(_)));
}

#[tokio::test]
async fn test_enable_unknown_host_is_not_found() {
    let env = seeded().await;

    let err = env
        .engine
        .enable_channel("nobody", CHAT, "device-a")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::HostNotFound(_)));
}

#[tokio::test]
async fn test_chat_and_call_coexist_but_livestream_is_exclusive() {
    let env = seeded().await;

    let chat = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    let call = env
        .engine
        .enable_channel("h1", SessionType::Call, "device-a")
        .await
        .unwrap();

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.active_channels.len(), 2);

    let live = env
        .engine
        .enable_channel("h1", SessionType::Livestream, "device-a")
        .await
        .unwrap();

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.active_channels.len(), 1);
    assert_eq!(host.active_channels[&SessionType::Livestream], live.id);

    for id in [&chat.id, &call.id] {
        let ended: Channel = load(&env.store, id).await.unwrap();
        assert_eq!(ended.status, ChannelStatus::Ended);
    }
}

#[tokio::test]
async fn test_device_uid_is_reused_per_device() {
    let env = seeded().await;

    let first = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.disable_channel("h1", CHAT).await.unwrap();
    let second = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.disable_channel("h1", CHAT).await.unwrap();
    let other = env.engine.enable_channel("h1", CHAT, "device-b").await.unwrap();

    assert_eq!(first.device_uid, second.device_uid);
    assert_ne!(first.device_uid, other.device_uid);
    assert_ne!(first.token, second.token);
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_enable_merges_offline_waitlist_and_disable_returns_it() {
    let env = seeded().await;

    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    env.clock.advance_ms(1_000);
    env.engine
        .join_waitlist("h1", CHAT, "p2", Some("tarot".to_string()))
        .await
        .unwrap();

    let channel = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    assert_eq!(ids(&channel.waitlist), vec!["p1", "p2"]);
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert!(host.waitlists.get(&CHAT).map_or(true, Vec::is_empty));

    let ended = env.engine.disable_channel("h1", CHAT).await.unwrap();
    assert_eq!(ended.status, ChannelStatus::Ended);
    assert!(ended.waitlist.is_empty());

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(ids(&host.waitlists[&CHAT]), vec!["p1", "p2"]);
    assert_eq!(host.waitlists[&CHAT][1].subtype.as_deref(), Some("tarot"));
    assert!(host.active_channels.is_empty());

    let err = env.engine.get_channel("h1", CHAT).await.unwrap_err();
    assert!(matches!(err, ScError::ChannelNotFound(_)));
}

#[tokio::test]
async fn test_disable_without_active_channel_is_not_found() {
    let env = seeded().await;

    let err = env.engine.disable_channel("h1", CHAT).await.unwrap_err();
    assert!(matches!(err, ScError::ChannelNotFound(_)));
}

#[tokio::test]
async fn test_disable_bills_accepted_occupant() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();

    env.advance_minutes(1);
    let ended = env.engine.disable_channel("h1", CHAT).await.unwrap();

    let record = ended.temp_host_history.last().unwrap();
    assert_eq!(record.id, "p1");
    assert_eq!(record.status, TempHostStatus::TerminatedByHost);

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 90.0);
    assert!(p1.busy_in.is_none());

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.orders, 1);
    assert_eq!(ids(&host.waitlists[&CHAT]), vec!["p2"]);
    assert_eq!(env.recording.stopped().await.len(), 1);
}

#[tokio::test]
async fn test_disable_rejects_requested_occupant() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let ended = env.engine.disable_channel("h1", CHAT).await.unwrap();

    assert_eq!(
        ended.temp_host_history.last().map(|r| r.status),
        Some(TempHostStatus::Rejected)
    );
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.orders, 0);

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.busy_in.is_none());
    assert_eq!(p1.rejected_sessions.len(), 1);
    assert_eq!(p1.balance, 100.0);
}

// ============================================================================
// Waitlist
// ============================================================================

#[tokio::test]
async fn test_online_join_enforces_minimum_balance() {
    let env = seeded().await;
    TestParticipant::new("p60")
        .with_balance(60.0)
        .seed(&env.store)
        .await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    // rate 10, no offer: minimum is 50
    let err = env
        .engine
        .join_waitlist("h1", CHAT, "p_low", None)
        .await
        .unwrap_err();
    match err {
        ScError::UserLowOnBalance {
            required,
            available,
        } => {
            assert_eq!(required, 50.0);
            assert_eq!(available, 40.0);
        }
        other => panic!("expected UserLowOnBalance, got {other:?}"),
    }

    let waitlist = env.engine.join_waitlist("h1", CHAT, "p60", None).await.unwrap();
    assert_eq!(ids(&waitlist), vec!["p60"]);

    let p_low: Participant = load(&env.store, "p_low").await.unwrap();
    assert!(p_low.joined_waitlists.is_empty());
}

#[tokio::test]
async fn test_offer_lowers_minimum_balance() {
    let env = TestEngine::new();
    TestHost::new("h2")
        .with_pricing(CHAT, 10.0, 20.0)
        .seed(&env.store)
        .await;
    TestParticipant::new("p40")
        .with_balance(40.0)
        .seed(&env.store)
        .await;
    env.engine.enable_channel("h2", CHAT, "device-a").await.unwrap();

    // 10 * 5 - 0.2 * 10 * 5 = 40
    let waitlist = env.engine.join_waitlist("h2", CHAT, "p40", None).await.unwrap();
    assert_eq!(waitlist.len(), 1);
}

#[tokio::test]
async fn test_offline_join_skips_balance_check() {
    let env = seeded().await;

    let waitlist = env
        .engine
        .join_waitlist("h1", CHAT, "p_low", None)
        .await
        .unwrap();
    assert_eq!(ids(&waitlist), vec!["p_low"]);

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(ids(&host.waitlists[&CHAT]), vec!["p_low"]);

    let participant: Participant = load(&env.store, "p_low").await.unwrap();
    assert_eq!(participant.joined_waitlists.len(), 1);
    assert_eq!(participant.joined_waitlists[0].host_id, "h1");
}

#[tokio::test]
async fn test_join_twice_is_rejected() {
    let env = seeded().await;

    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    let err = env
        .engine
        .join_waitlist("h1", CHAT, "p1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::UserAlreadyExist(_)));
    assert_eq!(err.status_code(), 423);
}

#[tokio::test]
async fn test_occupant_cannot_join_own_waitlist() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .join_waitlist("h1", CHAT, "p1", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::UserAlreadyExist(_)));

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert!(channel.waitlist.is_empty());
    assert_eq!(channel.temp_host.unwrap().id, "p1");
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.joined_waitlists.is_empty());
}

#[tokio::test]
async fn test_join_unknown_user_is_not_found() {
    let env = seeded().await;

    let err = env
        .engine
        .join_waitlist("h1", CHAT, "ghost", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::UserNotFound(_)));
}

#[tokio::test]
async fn test_join_then_leave_restores_offline_waitlist() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    let before: Host = load(&env.store, "h1").await.unwrap();

    env.clock.advance_ms(5_000);
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();
    let remaining = env.engine.leave_waitlist("h1", CHAT, "p2").await.unwrap();

    let after: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(after.waitlists, before.waitlists);
    assert_eq!(ids(&remaining), vec!["p1"]);

    let p2: Participant = load(&env.store, "p2").await.unwrap();
    assert!(p2.joined_waitlists.is_empty());
}

#[tokio::test]
async fn test_join_then_leave_restores_channel_waitlist() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    let channel = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();
    env.engine.leave_waitlist("h1", CHAT, "p2").await.unwrap();

    let after: Channel = load(&env.store, &channel.id).await.unwrap();
    assert_eq!(after.waitlist, channel.waitlist);
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert!(host.waitlists.get(&CHAT).map_or(true, Vec::is_empty));
}

#[tokio::test]
async fn test_leave_when_absent_is_noop() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    let commits = env.store.commit_count();

    let waitlist = env.engine.leave_waitlist("h1", CHAT, "p2").await.unwrap();

    assert_eq!(ids(&waitlist), vec!["p1"]);
    assert_eq!(env.store.commit_count(), commits);
}

#[tokio::test]
async fn test_waitlist_change_schedules_estimate_and_publishes() {
    let env = seeded().await;

    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();

    let enqueued = env.dispatcher.enqueued().await;
    assert!(enqueued.iter().any(|(task, delay)| {
        *delay == 0 && matches!(task, ScheduledTask::WaitTimeEstimate { host_id, .. } if host_id == "h1")
    }));

    let events = env.events.events_named("waitlist.updated").await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].topic, "host:h1:chat");
    assert_eq!(events[0].payload["waitlist"][0]["id"], "p1");
}

#[tokio::test]
async fn test_rejected_candidate_keeps_place_on_rejoin() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    env.clock.advance_ms(1_000);
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();
    let channel = env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();
    let rejected = env.engine.reject_temp_host("h1", CHAT, "p1").await.unwrap();
    assert_eq!(rejected.status, TempHostStatus::Rejected);

    let stored: Channel = load(&env.store, &channel.id).await.unwrap();
    assert!(stored.temp_host.is_none());
    assert_eq!(stored.rejected_sessions.len(), 1);
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.rejected_sessions.len(), 1);

    env.clock.advance_ms(60_000);
    let waitlist = env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    assert_eq!(ids(&waitlist), vec!["p1", "p2"]);
    assert_eq!(waitlist[0].joined_at, TEST_START_MS);

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.rejected_sessions.is_empty());
    let stored: Channel = load(&env.store, &channel.id).await.unwrap();
    assert!(stored.rejected_sessions.is_empty());
}

// ============================================================================
// Admission and state machine
// ============================================================================

#[tokio::test]
async fn test_admit_without_channel_queues_offline() {
    let env = seeded().await;

    let outcome = env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    match outcome {
        AdmitOutcome::Queued { waitlist } => assert_eq!(ids(&waitlist), vec!["p1"]),
        other => panic!("expected Queued, got {other:?}"),
    }
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(ids(&host.waitlists[&CHAT]), vec!["p1"]);

    let err = env.engine.get_temp_host("h1", CHAT).await.unwrap_err();
    assert!(matches!(err, ScError::ChannelNotFound(_)));
}

#[tokio::test]
async fn test_admit_creates_requested_occupant() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", Some("tarot".to_string())).await.unwrap();
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.clock.advance_ms(2_000);

    let outcome = env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();
    let AdmitOutcome::Admitted { temp_host } = outcome else {
        panic!("expected Admitted");
    };
    assert_eq!(temp_host.status, TempHostStatus::Requested);
    assert_eq!(temp_host.joined_at, TEST_START_MS);
    assert_eq!(temp_host.requested_at, TEST_START_MS + 2_000);
    assert_eq!(temp_host.subtype.as_deref(), Some("tarot"));

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert!(channel.waitlist.is_empty());

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.joined_waitlists.is_empty());
    assert_eq!(p1.busy_in.map(|b| b.channel_id), Some(channel.id));

    let notifications = env.events.notifications().await;
    assert!(notifications
        .iter()
        .any(|n| n.kind == NotificationKind::SessionRequested && n.recipient_id == "h1"));
}

#[tokio::test]
async fn test_admit_low_balance_requeues_at_tail() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p_low", None).await.unwrap();
    env.clock.advance_ms(1_000);
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.clock.advance_ms(1_000);

    let outcome = env.engine.admit_temp_host("h1", CHAT, "p_low").await.unwrap();

    match outcome {
        AdmitOutcome::Requeued { waitlist } => {
            assert_eq!(ids(&waitlist), vec!["p2", "p_low"]);
            assert_eq!(waitlist[1].joined_at, TEST_START_MS + 2_000);
        }
        other => panic!("expected Requeued, got {other:?}"),
    }
    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert!(channel.temp_host.is_none());
}

#[tokio::test]
async fn test_admit_low_balance_without_queue_entry_is_refused() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    let err = env
        .engine
        .join_waitlist("h1", CHAT, "p_low", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::UserLowOnBalance { .. }));

    let err = env
        .engine
        .admit_temp_host("h1", CHAT, "p_low")
        .await
        .unwrap_err();
    match err {
        ScError::UserLowOnBalance {
            required,
            available,
        } => {
            assert_eq!(required, 50.0);
            assert_eq!(available, 40.0);
        }
        other => panic!("expected UserLowOnBalance, got {other:?}"),
    }

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert!(channel.waitlist.is_empty());
    assert!(channel.temp_host.is_none());
    let p_low: Participant = load(&env.store, "p_low").await.unwrap();
    assert!(p_low.joined_waitlists.is_empty());
}

#[tokio::test]
async fn test_offline_admit_restores_rejected_place() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    env.clock.advance_ms(1_000);
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();
    env.engine.reject_temp_host("h1", CHAT, "p1").await.unwrap();
    env.engine.disable_channel("h1", CHAT).await.unwrap();
    env.clock.advance_ms(60_000);

    let outcome = env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    match outcome {
        AdmitOutcome::Queued { waitlist } => {
            assert_eq!(ids(&waitlist), vec!["p1", "p2"]);
            assert_eq!(waitlist[0].joined_at, TEST_START_MS);
        }
        other => panic!("expected Queued, got {other:?}"),
    }
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.rejected_sessions.is_empty());
}

#[tokio::test]
async fn test_second_admit_is_restricted() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();

    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();
    let err = env.engine.admit_temp_host("h1", CHAT, "p2").await.unwrap_err();

    assert!(matches!(err, ScError::ChannelRestricted(_)));
    assert_eq!(err.status_code(), 423);
    assert_eq!(env.engine.get_temp_host("h1", CHAT).await.unwrap().id, "p1");
}

#[tokio::test]
async fn test_admit_busy_participant_is_on_a_call() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    env.engine
        .enable_channel("h1", SessionType::Call, "device-a")
        .await
        .unwrap();

    let err = env
        .engine
        .admit_temp_host("h1", SessionType::Call, "p1")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::UserOnACall(_)));
}

#[tokio::test]
async fn test_requested_cannot_be_terminated_without_force() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::TerminatedByClient, false)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::InvalidTransition { .. }));
    assert_eq!(err.status_code(), 400);

    let err = env
        .engine
        .patch_temp_host_status("h1", CHAT, "p1", TempHostStatus::TerminatedByClient)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::InvalidTransition { .. }));

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.status, TempHostStatus::Requested);
}

#[tokio::test]
async fn test_accept_twice_fails() {
    let env = seeded().await;
    accepted(&env, "p1").await;

    let err = env
        .engine
        .accept_temp_host("h1", CHAT, "p1")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::InvalidTransition { .. }));
    assert_eq!(env.recording.start_count(), 1);
}

#[tokio::test]
async fn test_patch_to_requested_is_validation_error() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .patch_temp_host_status("h1", CHAT, "p1", TempHostStatus::Requested)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::Validation(_)));
}

#[tokio::test]
async fn test_accept_wrong_user_is_temp_host_not_found() {
    let env = seeded().await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .accept_temp_host("h1", CHAT, "p2")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::TempHostNotFound(_)));
}

#[tokio::test]
async fn test_accept_opens_order_chat_and_recording() {
    let env = seeded().await;
    let channel_id = accepted(&env, "p1").await;

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.status, TempHostStatus::Accepted);
    assert_eq!(occupant.accepted_at, Some(TEST_START_MS));
    // 100 at 10/min buys ten minutes
    assert_eq!(occupant.tentative_end_at, Some(TEST_START_MS + 600_000));

    let order_id = Order::id_for("p1", TEST_START_MS);
    assert_eq!(occupant.order_id.as_deref(), Some(order_id.as_str()));
    let order: Order = load(&env.store, &order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Initialized);
    assert_eq!(order.channel_id, channel_id);
    assert_eq!(order.rate, 10.0);
    assert!(order.recording_id.is_some());

    let chat_id = ChatThread::id_for("h1", "p1");
    let chat: ChatThread = load(&env.store, &chat_id).await.unwrap();
    assert_eq!(chat.status, ChatStatus::Active);

    let enqueued = env.dispatcher.enqueued().await;
    let balance_delay = enqueued.iter().find_map(|(task, delay)| {
        matches!(task, ScheduledTask::BalanceCheck { .. }).then_some(*delay)
    });
    // one minute before the end: 540s, under the 15 minute cap
    assert_eq!(balance_delay, Some(540));
    assert!(enqueued
        .iter()
        .any(|(task, _)| matches!(task, ScheduledTask::RecordingHealthCheck { .. })));
}

#[tokio::test]
async fn test_accept_below_minimum_session_aborts() {
    let env = TestEngine::with_config(EngineConfig {
        min_session_ms: 10 * 60_000,
        ..EngineConfig::default()
    });
    seed(&env).await;
    set_balance(&env, "p1", 60.0).await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .accept_temp_host("h1", CHAT, "p1")
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::NotEnoughBalance { min_seconds: 600 }));
    assert_eq!(env.recording.acquire_count(), 0);
    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.status, TempHostStatus::Requested);
}

#[tokio::test]
async fn test_recording_start_failure_aborts_accept() {
    let env = TestEngine::with_recording(MockRecording::failing_start());
    seed(&env).await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .accept_temp_host("h1", CHAT, "p1")
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::FailedToStartRecording(_)));
    assert_eq!(err.status_code(), 500);

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.status, TempHostStatus::Requested);
    assert!(load::<Order>(&env.store, &Order::id_for("p1", TEST_START_MS))
        .await
        .is_none());
    assert!(load::<ChatThread>(&env.store, &ChatThread::id_for("h1", "p1"))
        .await
        .is_none());
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 100.0);
}

#[tokio::test]
async fn test_recording_acquire_failure_aborts_accept() {
    let env = TestEngine::with_recording(MockRecording::failing_acquire());
    seed(&env).await;
    env.engine.enable_channel("h1", CHAT, "device-a").await.unwrap();
    env.engine.admit_temp_host("h1", CHAT, "p1").await.unwrap();

    let err = env
        .engine
        .accept_temp_host("h1", CHAT, "p1")
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::FailedToStartRecording(_)));
    assert_eq!(env.recording.acquire_count(), 1);
    assert_eq!(env.recording.start_count(), 0);

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.status, TempHostStatus::Requested);
    assert!(load::<Order>(&env.store, &Order::id_for("p1", TEST_START_MS))
        .await
        .is_none());
}

// ============================================================================
// Billing
// ============================================================================

#[tokio::test]
async fn test_terminate_after_ninety_seconds_charges_fifteen() {
    let env = seeded().await;
    accepted(&env, "p1").await;

    env.clock.advance_ms(90_000);
    let ended = env
        .engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::TerminatedByClient, false)
        .await
        .unwrap();
    assert_eq!(ended.status, TempHostStatus::TerminatedByClient);
    assert_eq!(ended.ended_at, Some(TEST_START_MS + 90_000));

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 85.0);
    assert!(p1.busy_in.is_none());

    let order_id = Order::id_for("p1", TEST_START_MS);
    let order: Order = load(&env.store, &order_id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Success);
    assert_eq!(order.amount, 15.0);
    assert_eq!(order.ended_at, Some(TEST_START_MS + 90_000));

    let host_order: HostOrder = load(&env.store, &format!("h{order_id}")).await.unwrap();
    assert_eq!(host_order.duration_ms, 90_000);
    assert_eq!(host_order.shortfall, 0.0);

    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.orders, 1);
    assert_eq!(host.channel_time_spent[&CHAT], 90_000);

    let chat: ChatThread = load(&env.store, &ChatThread::id_for("h1", "p1"))
        .await
        .unwrap();
    assert_eq!(chat.status, ChatStatus::Inactive);
    assert_eq!(env.recording.stopped().await.len(), 1);
}

#[tokio::test]
async fn test_terminate_floors_balance_and_records_shortfall() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    set_balance(&env, "p1", 10.0).await;

    env.clock.advance_ms(90_000);
    env.engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::TerminatedByHost, false)
        .await
        .unwrap();

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 0.0);

    let order_id = Order::id_for("p1", TEST_START_MS);
    let host_order: HostOrder = load(&env.store, &format!("h{order_id}")).await.unwrap();
    assert_eq!(host_order.amount, 15.0);
    assert_eq!(host_order.shortfall, 5.0);
}

#[tokio::test]
async fn test_immediate_terminate_charges_nothing() {
    let env = seeded().await;
    accepted(&env, "p1").await;

    env.engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::TerminatedByClient, false)
        .await
        .unwrap();

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 100.0);
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert_eq!(host.orders, 1);

    let err = env.engine.get_temp_host("h1", CHAT).await.unwrap_err();
    assert!(matches!(err, ScError::TempHostNotFound(_)));

    // Occupant slot is free again
    let outcome = env.engine.admit_temp_host("h1", CHAT, "p2").await.unwrap();
    assert!(matches!(outcome, AdmitOutcome::Admitted { .. }));
}

#[tokio::test]
async fn test_recording_stop_failure_does_not_fail_terminate() {
    let env = TestEngine::with_recording(MockRecording::failing_stop());
    seed(&env).await;
    accepted(&env, "p1").await;

    env.advance_minutes(2);
    let ended = env
        .engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::TerminatedByClient, false)
        .await
        .unwrap();

    assert_eq!(ended.status, TempHostStatus::TerminatedByClient);
    assert_eq!(env.recording.stopped().await.len(), 1);
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 80.0);
}

#[tokio::test]
async fn test_terminate_with_non_termination_status_is_validation_error() {
    let env = seeded().await;
    accepted(&env, "p1").await;

    let err = env
        .engine
        .terminate_temp_host("h1", CHAT, "p1", TempHostStatus::Rejected, true)
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::Validation(_)));
}

// ============================================================================
// Store conflicts
// ============================================================================

#[tokio::test]
async fn test_conflict_is_retried_from_fresh_reads() {
    let env = seeded().await;
    env.store.inject_conflicts(2);

    let waitlist = env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();

    assert_eq!(ids(&waitlist), vec!["p1"]);
    assert_eq!(env.store.commit_count(), 1);
}

#[tokio::test]
async fn test_persistent_conflict_surfaces_and_writes_nothing() {
    let env = seeded().await;
    env.store.inject_conflicts(10);

    let err = env
        .engine
        .join_waitlist("h1", CHAT, "p1", None)
        .await
        .unwrap_err();

    assert!(matches!(err, ScError::TransactionConflict(_)));
    let host: Host = load(&env.store, "h1").await.unwrap();
    assert!(host.waitlists.is_empty());
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert!(p1.joined_waitlists.is_empty());
}

// ============================================================================
// Scheduled tasks
// ============================================================================

async fn balance_check_task(env: &TestEngine) -> ScheduledTask {
    env.dispatcher
        .enqueued()
        .await
        .into_iter()
        .rev()
        .find_map(|(task, _)| matches!(task, ScheduledTask::BalanceCheck { .. }).then_some(task))
        .expect("balance check scheduled")
}

#[tokio::test]
async fn test_balance_check_reschedules_then_warns_then_terminates() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    let task = balance_check_task(&env).await;

    let outcome = env.engine.handle_task(task.clone()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Rescheduled { delay_seconds: 540 });

    env.clock.advance_ms(570_000);
    let outcome = env.engine.handle_task(task.clone()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::LowBalance { delay_seconds: 30 });
    let warnings = env.events.events_named("balance.low").await;
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].payload["user_id"], "p1");

    env.clock.advance_ms(30_000);
    let outcome = env.engine.handle_task(task.clone()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Terminated);

    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 0.0);
    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert_eq!(
        channel.temp_host_history.last().map(|r| r.status),
        Some(TempHostStatus::TerminatedBySystem)
    );

    // Duplicate delivery after the occupancy ended
    let outcome = env.engine.handle_task(task).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped);
}

#[tokio::test]
async fn test_top_up_extends_live_session() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    env.dispatcher.drain().await;

    let participant = env.engine.top_up("p1", 50.0).await.unwrap();
    assert_eq!(participant.balance, 150.0);

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(occupant.tentative_end_at, Some(TEST_START_MS + 900_000));

    let order: Order = load(&env.store, &Order::id_for("p1", TEST_START_MS))
        .await
        .unwrap();
    assert_eq!(order.tentative_end_at, TEST_START_MS + 900_000);

    let enqueued = env.dispatcher.enqueued().await;
    assert_eq!(enqueued.len(), 1);
    assert!(matches!(enqueued[0].0, ScheduledTask::BalanceCheck { .. }));
    assert_eq!(enqueued[0].1, 840);
}

#[tokio::test]
async fn test_top_up_without_session_only_credits() {
    let env = seeded().await;

    let participant = env.engine.top_up("p2", 12.5).await.unwrap();

    assert_eq!(participant.balance, 112.5);
    assert!(env.dispatcher.enqueued().await.is_empty());
}

#[tokio::test]
async fn test_top_up_rejects_non_positive_amount() {
    let env = seeded().await;

    for amount in [0.0, -5.0, f64::NAN] {
        let err = env.engine.top_up("p1", amount).await.unwrap_err();
        assert!(matches!(err, ScError::Validation(_)));
    }
    let err = env.engine.top_up("ghost", 5.0).await.unwrap_err();
    assert!(matches!(err, ScError::UserNotFound(_)));
}

#[tokio::test]
async fn test_top_up_rejects_amount_above_maximum() {
    let env = seeded().await;

    for amount in [MAX_TOP_UP_AMOUNT * 2.0, 1e300] {
        let err = env.engine.top_up("p1", amount).await.unwrap_err();
        assert!(matches!(err, ScError::Validation(_)));
    }
    let p1: Participant = load(&env.store, "p1").await.unwrap();
    assert_eq!(p1.balance, 100.0);
}

#[tokio::test]
async fn test_huge_balance_caps_tentative_end() {
    let env = seeded().await;
    set_balance(&env, "p1", 1e300).await;
    accepted(&env, "p1").await;

    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert_eq!(
        occupant.tentative_end_at,
        Some(TEST_START_MS + MAX_AFFORDABLE_MS)
    );
    let enqueued = env.dispatcher.drain().await;
    assert!(enqueued
        .iter()
        .any(|(task, delay)| matches!(task, ScheduledTask::BalanceCheck { .. }) && *delay == 900));

    env.engine.top_up("p1", MAX_TOP_UP_AMOUNT).await.unwrap();
    let occupant = env.engine.get_temp_host("h1", CHAT).await.unwrap();
    assert!(occupant.tentative_end_at.unwrap() > TEST_START_MS + MAX_AFFORDABLE_MS);
}

#[tokio::test]
async fn test_recording_check_restarts_stopped_recording() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    let order_id = Order::id_for("p1", TEST_START_MS);
    let task = env
        .dispatcher
        .enqueued()
        .await
        .into_iter()
        .find_map(|(task, _)| {
            matches!(task, ScheduledTask::RecordingHealthCheck { .. }).then_some(task)
        })
        .unwrap();

    let outcome = env.engine.handle_task(task.clone()).await.unwrap();
    assert_eq!(outcome, TaskOutcome::Rescheduled { delay_seconds: 60 });

    env.recording.set_status(RecordingStatus::Stopped).await;
    let before: Order = load(&env.store, &order_id).await.unwrap();
    let outcome = env.engine.handle_task(task).await.unwrap();

    let TaskOutcome::RecordingRestarted { recording_id } = outcome else {
        panic!("expected RecordingRestarted, got {outcome:?}");
    };
    let after: Order = load(&env.store, &order_id).await.unwrap();
    assert_eq!(after.recording_id.as_deref(), Some(recording_id.as_str()));
    assert_ne!(after.recording_id, before.recording_id);
    assert_eq!(env.recording.start_count(), 2);
}

#[tokio::test]
async fn test_recording_check_restart_failure_reschedules() {
    let env = seeded().await;
    accepted(&env, "p1").await;
    let order_id = Order::id_for("p1", TEST_START_MS);
    let before: Order = load(&env.store, &order_id).await.unwrap();
    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();

    env.recording.set_status(RecordingStatus::Failed).await;
    env.recording.set_start_failing(true);
    let outcome = env
        .engine
        .handle_task(ScheduledTask::RecordingHealthCheck {
            host_id: "h1".to_string(),
            session_type: CHAT,
            channel_id: channel.id,
            order_id: order_id.clone(),
        })
        .await
        .unwrap();

    assert_eq!(outcome, TaskOutcome::Rescheduled { delay_seconds: 60 });
    let after: Order = load(&env.store, &order_id).await.unwrap();
    assert_eq!(after.recording_id, before.recording_id);
}

#[tokio::test]
async fn test_wait_time_estimate_uses_default_average() {
    let env = seeded().await;
    env.engine.join_waitlist("h1", CHAT, "p1", None).await.unwrap();
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();

    let outcome = env
        .engine
        .handle_task(ScheduledTask::WaitTimeEstimate {
            host_id: "h1".to_string(),
            session_type: CHAT,
        })
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Published { entries: 2 });

    let events = env.events.events_named("waittime.updated").await;
    let estimates = &events.last().unwrap().payload["estimates"];
    assert_eq!(estimates[0]["user_id"], "p1");
    assert_eq!(estimates[0]["wait_seconds"], 0);
    // five minute default average
    assert_eq!(estimates[1]["wait_seconds"], 300);
}

#[tokio::test]
async fn test_wait_time_estimate_counts_occupant_remaining_time() {
    let env = TestEngine::new();
    TestHost::new("h1")
        .with_rate(CHAT, 10.0)
        .with_history(CHAT, 4 * 120_000, 4)
        .seed(&env.store)
        .await;
    TestParticipant::new("p1").with_balance(100.0).seed(&env.store).await;
    TestParticipant::new("p2").with_balance(100.0).seed(&env.store).await;
    accepted(&env, "p1").await;
    env.engine.join_waitlist("h1", CHAT, "p2", None).await.unwrap();

    env.advance_minutes(4);
    env.engine
        .handle_task(ScheduledTask::WaitTimeEstimate {
            host_id: "h1".to_string(),
            session_type: CHAT,
        })
        .await
        .unwrap();

    let events = env.events.events_named("waittime.updated").await;
    let estimates = &events.last().unwrap().payload["estimates"];
    // ten minutes bought, four used
    assert_eq!(estimates[0]["wait_seconds"], 360);
}

#[tokio::test]
async fn test_wait_time_estimate_for_unknown_host_is_skipped() {
    let env = seeded().await;

    let outcome = env
        .engine
        .handle_task(ScheduledTask::WaitTimeEstimate {
            host_id: "nobody".to_string(),
            session_type: CHAT,
        })
        .await
        .unwrap();
    assert_eq!(outcome, TaskOutcome::Skipped);
}
