//! Optimistic updates against a failing backend, and merging server snapshots.

mod common;

use std::collections::{BTreeMap, BTreeSet};

use chrono::Duration;
use common::{harness, DEVICE_ID};
use grenzwanderer::progression::{
    BackendError, PlayerSnapshot, ProgressionError, ProgressionEvent,
};

fn actor() -> String {
    format!("device:{}", DEVICE_ID)
}

#[tokio::test]
async fn network_failure_restores_previous_step_exactly() {
    let mut h = harness();
    h.engine.start_quest("q1", "a").await.unwrap();
    let before = h.engine.quests().get("q1").unwrap().clone();
    h.clock.advance(Duration::minutes(3));

    h.backend.fail_next(BackendError::Network("timeout".into()));
    let err = h
        .engine
        .dispatch(ProgressionEvent::advance("q1", "b"))
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(h.engine.quests().get("q1").unwrap(), &before);
    assert_eq!(h.backend.quest_record(&actor(), "q1").unwrap().current_step, "a");
}

#[tokio::test]
async fn failed_start_leaves_no_trace() {
    let mut h = harness();
    h.backend.fail_next(BackendError::Network("offline".into()));
    assert!(h.engine.start_quest("intro", "step1").await.is_err());
    assert!(h.engine.quests().is_empty());
    assert_eq!(h.engine.quests().tracked_quest_id(), None);
}

#[tokio::test]
async fn failed_completion_keeps_tracking() {
    let mut h = harness();
    h.engine.start_quest("intro", "step1").await.unwrap();
    h.engine.start_quest("mill", "a").await.unwrap();

    h.backend.fail_next(BackendError::Rejected("quota".into()));
    let err = h.engine.complete_quest("intro").await.unwrap_err();
    assert!(matches!(err, ProgressionError::Rejected(_)));
    assert!(!err.is_retryable());

    let quests = h.engine.quests();
    assert!(!quests.get("intro").unwrap().is_completed());
    assert_eq!(quests.tracked_quest_id(), Some("intro"));
}

#[tokio::test]
async fn failed_discovery_is_rolled_back() {
    let mut h = harness();
    h.backend.fail_next(BackendError::Network("offline".into()));
    assert!(h.engine.scan("schwabentor").await.is_err());
    assert!(h.engine.discoveries().is_empty());
    assert!(h.engine.quests().is_empty());

    // A retry goes through and applies the binding.
    h.engine.scan("schwabentor").await.unwrap();
    assert!(h.engine.discoveries().is_discovered(&actor(), "schwabentor"));
    assert!(h.engine.quests().is_started("old_town"));
}

#[tokio::test]
async fn failed_binding_rolls_back_the_discovery() {
    let mut h = harness();
    // mark_discovered succeeds, then the quest start fails.
    h.backend
        .fail_on("mutate_quest_start", BackendError::Network("flaky".into()));
    assert!(h.engine.scan("schwabentor").await.is_err());
    assert!(h.engine.discoveries().is_empty());
    assert!(h.engine.quests().is_empty());
    assert!(h.backend.is_discovered(&actor(), "schwabentor"));

    h.engine.scan("schwabentor").await.unwrap();
    assert!(h.engine.quests().is_started("old_town"));
}

#[tokio::test]
async fn unauthenticated_backend_error_maps_through() {
    let mut h = harness();
    h.backend.fail_next(BackendError::Unauthenticated);
    assert!(matches!(
        h.engine.start_quest("intro", "s").await,
        Err(ProgressionError::Unauthenticated)
    ));
}

#[tokio::test]
async fn player_sync_unions_inventory_and_keeps_absent_fields() {
    let mut h = harness();
    h.engine
        .grant(40, &["compass".to_string()])
        .await
        .unwrap();

    let snapshot = PlayerSnapshot {
        phase: Some(2),
        inventory: Some(BTreeSet::from(["lantern".to_string(), "map".to_string()])),
        skills: Some(BTreeMap::from([("climbing".to_string(), 3)])),
        ..PlayerSnapshot::default()
    };
    h.backend.put_player(&actor(), snapshot);

    assert!(h.engine.sync_player().await.unwrap());
    let player = h.engine.player().state();
    assert_eq!(player.phase, 2);
    assert_eq!(player.credits, 40);
    assert_eq!(
        player.inventory,
        BTreeSet::from(["compass".to_string(), "lantern".to_string(), "map".to_string()])
    );
    assert_eq!(player.skills.get("climbing"), Some(&3));
}

#[tokio::test]
async fn player_sync_without_server_record_changes_nothing() {
    let mut h = harness();
    let before = h.engine.player().state().clone();
    assert!(!h.engine.sync_player().await.unwrap());
    assert_eq!(h.engine.player().state(), &before);
}

#[tokio::test]
async fn failed_player_query_propagates() {
    let mut h = harness();
    h.backend.fail_next(BackendError::Network("down".into()));
    assert!(h.engine.sync_player().await.unwrap_err().is_retryable());
}
