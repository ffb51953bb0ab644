//! Concurrency tests.
//!
//! The single-occupant and single-location invariants must hold whether
//! requests are serialized by the host actor or race directly against the
//! store's version preconditions.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic, clippy::indexing_slicing)]

use futures::future::join_all;
use sc_test_utils::{load, TestEngine, TestHost, TestParticipant};
use session_controller::engine::{AdmitOutcome, EngineConfig};
use session_controller::errors::ScError;
use session_controller::models::{Channel, Participant, SessionType};
use std::sync::Arc;

const CHAT: SessionType = SessionType::Chat;
const CANDIDATES: usize = 8;

async fn seed(env: &TestEngine) {
    TestHost::new("h1")
        .with_rate(CHAT, 10.0)
        .seed(&env.store)
        .await;
    for i in 0..CANDIDATES {
        TestParticipant::new(format!("p{i}"))
            .with_balance(100.0)
            .seed(&env.store)
            .await;
    }
}

fn count_admitted(results: &[Result<AdmitOutcome, ScError>]) -> usize {
    results
        .iter()
        .filter(|r| matches!(r, Ok(AdmitOutcome::Admitted { .. })))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admits_through_actor_admit_exactly_one() {
    let env = TestEngine::new();
    seed(&env).await;
    let controller = env.controller();
    controller
        .enable_channel("h1", CHAT, "device-a")
        .await
        .unwrap();

    let results = join_all((0..CANDIDATES).map(|i| {
        let controller = controller.clone();
        async move {
            controller
                .admit_temp_host("h1", CHAT, &format!("p{i}"))
                .await
        }
    }))
    .await;

    assert_eq!(count_admitted(&results), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result, Err(ScError::ChannelRestricted(_))));
    }

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    let occupant = channel.temp_host.unwrap();
    let mut busy = Vec::new();
    for i in 0..CANDIDATES {
        let participant: Participant = load(&env.store, &format!("p{i}")).await.unwrap();
        if participant.busy_in.is_some() {
            busy.push(participant);
        }
    }
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].id, occupant.id);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_admits_against_engine_admit_at_most_one() {
    let env = TestEngine::new();
    seed(&env).await;
    env.engine
        .enable_channel("h1", CHAT, "device-a")
        .await
        .unwrap();

    let handles: Vec<_> = (0..CANDIDATES)
        .map(|i| {
            let engine = Arc::clone(&env.engine);
            tokio::spawn(async move { engine.admit_temp_host("h1", CHAT, &format!("p{i}")).await })
        })
        .collect();
    let results: Vec<_> = join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    // Losers see the occupant on re-read, or give up after repeated conflicts.
    assert_eq!(count_admitted(&results), 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result,
            Err(ScError::ChannelRestricted(_) | ScError::TransactionConflict(_))
        ));
    }

    let channel = env.engine.get_channel("h1", CHAT).await.unwrap();
    assert!(channel.temp_host.is_some());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_through_actor_all_land_once() {
    let env = TestEngine::new();
    seed(&env).await;
    let controller = env.controller();
    let channel = controller
        .enable_channel("h1", CHAT, "device-a")
        .await
        .unwrap();

    let results = join_all((0..CANDIDATES).map(|i| {
        let controller = controller.clone();
        async move {
            controller
                .join_waitlist("h1", CHAT, &format!("p{i}"), None)
                .await
        }
    }))
    .await;
    assert!(results.iter().all(Result::is_ok));

    let stored: Channel = load(&env.store, &channel.id).await.unwrap();
    assert_eq!(stored.waitlist.len(), CANDIDATES);
    let mut ids: Vec<_> = stored.waitlist.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), CANDIDATES);

    controller.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_top_ups_are_not_lost() {
    let env = TestEngine::with_config(EngineConfig {
        commit_max_attempts: 64,
        ..EngineConfig::default()
    });
    seed(&env).await;

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let engine = Arc::clone(&env.engine);
            tokio::spawn(async move { engine.top_up("p0", 5.0).await })
        })
        .collect();
    for joined in join_all(handles).await {
        joined.unwrap().unwrap();
    }

    let participant: Participant = load(&env.store, "p0").await.unwrap();
    assert_eq!(participant.balance, 150.0);
}

#[tokio::test]
async fn test_operations_for_different_hosts_use_separate_actors() {
    let env = TestEngine::new();
    seed(&env).await;
    TestHost::new("h2")
        .with_rate(CHAT, 10.0)
        .seed(&env.store)
        .await;
    let controller = env.controller();

    let (a, b) = tokio::join!(
        controller.enable_channel("h1", CHAT, "device-a"),
        controller.enable_channel("h2", CHAT, "device-b"),
    );
    assert_ne!(a.unwrap().id, b.unwrap().id);

    let status = controller.get_status().await.unwrap();
    assert_eq!(status.host_actor_count, 2);

    controller.shutdown().await.unwrap();
    let err = controller
        .enable_channel("h1", CHAT, "device-a")
        .await
        .unwrap_err();
    assert!(matches!(err, ScError::Unavailable(_)));
}
