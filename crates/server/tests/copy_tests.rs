//! Copy pipeline: availability stage, storage stage and deletion protection.

mod common;

use common::{ScriptedLocation, TestEngine, copy_intent, deletion_intent, owners};
use stowage_core::{GroupEventState, RequestKind, RequestStatus};
use stowage_metadata::repos::{CacheFileRepo, FileRefRepo};
use stowage_server::EngineError;
use stowage_server::engine::copy::missing_everywhere_cause;
use stowage_server::engine::deletion::COPY_RUNNING_REASON;

async fn disk_and_tape() -> TestEngine {
    TestEngine::builder()
        .location(ScriptedLocation::online("disk"))
        .location(ScriptedLocation::nearline("tape"))
        .build()
        .await
}

#[tokio::test]
async fn test_copy_from_online_source() {
    let harness = disk_and_tape().await;
    harness.seed("k1", "disk", "alice").await;

    let receipt = harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("k1", "tape")], None)
        .await
        .unwrap();
    assert_eq!(receipt.created, 1);

    let report = harness.run(RequestKind::Copy).await;
    assert_eq!(report.scheduled, 1);
    let copies = harness.requests(RequestKind::Copy).await;
    assert_eq!(copies.len(), 1);
    assert_eq!(copies[0].status, RequestStatus::Running);
    assert!(copies[0].cache_group_id.is_some());
    assert!(copies[0].storage_group_id.is_some());

    let stages = harness.requests(RequestKind::Storage).await;
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].backend, "tape");
    assert_eq!(stages[0].origin_url.as_deref(), Some("disk://k1"));
    assert!(stages[0].in_group(copies[0].storage_group_id.as_deref().unwrap()));

    harness.run(RequestKind::Storage).await;
    assert!(harness.requests(RequestKind::Copy).await.is_empty());
    let copied = harness
        .metadata
        .get_file_ref("k1", "tape")
        .await
        .unwrap()
        .expect("copied to tape");
    assert_eq!(copied.owners, owners(&["alice"]));
    assert_eq!(copied.location_url, "tape://k1");

    // The seed group and the copy group.
    assert_eq!(harness.check_groups().await, 2);
    let results = harness.aggregate_results("gc");
    assert_eq!(results.len(), 1);
    assert!(!results[0].is_error);
    assert_eq!(results[0].result_file.as_deref(), Some("tape://k1"));
}

#[tokio::test]
async fn test_copy_restores_nearline_source_first() {
    let harness = disk_and_tape().await;
    harness.seed("k2", "tape", "bob").await;

    harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("k2", "disk")], None)
        .await
        .unwrap();
    harness.run(RequestKind::Copy).await;

    let copies = harness.requests(RequestKind::Copy).await;
    assert_eq!(copies[0].status, RequestStatus::Pending);
    let restorations = harness.requests(RequestKind::Cache).await;
    assert_eq!(restorations.len(), 1);
    assert_eq!(restorations[0].backend, "tape");
    assert!(restorations[0].in_group(copies[0].cache_group_id.as_deref().unwrap()));

    harness.run(RequestKind::Cache).await;
    let stages = harness.requests(RequestKind::Storage).await;
    assert_eq!(stages.len(), 1);
    assert_eq!(stages[0].origin_url.as_deref(), Some("cache://k2"));

    harness.run(RequestKind::Storage).await;
    assert!(harness.requests(RequestKind::Copy).await.is_empty());
    assert!(
        harness
            .metadata
            .get_file_ref("k2", "disk")
            .await
            .unwrap()
            .is_some()
    );

    // The copy no longer holds the restored file.
    let entry = harness
        .metadata
        .get_cache_file("k2")
        .await
        .unwrap()
        .expect("restored file cached");
    assert!(entry.group_ids.is_empty());

    harness.check_groups().await;
    assert_eq!(
        harness.group_states("gc"),
        vec![GroupEventState::Granted, GroupEventState::Success]
    );
}

#[tokio::test]
async fn test_copy_of_unknown_file_fails_immediately() {
    let harness = disk_and_tape().await;
    let receipt = harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("zz", "tape")], None)
        .await
        .unwrap();
    assert_eq!(receipt.resolved, 1);
    assert!(harness.requests(RequestKind::Copy).await.is_empty());

    assert_eq!(harness.check_groups().await, 1);
    let results = harness.aggregate_results("gc");
    assert_eq!(
        results[0].error_cause.as_deref(),
        Some(missing_everywhere_cause("zz").as_str())
    );
}

#[tokio::test]
async fn test_copy_to_location_already_holding_file() {
    let harness = disk_and_tape().await;
    harness.seed("k3", "disk", "alice").await;
    let receipt = harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("k3", "disk")], None)
        .await
        .unwrap();
    assert_eq!(receipt.resolved, 1);

    harness.check_groups().await;
    let results = harness.aggregate_results("gc");
    assert_eq!(results[0].result_file.as_deref(), Some("disk://k3"));
}

#[tokio::test]
async fn test_deletion_denied_while_copy_runs() {
    let harness = disk_and_tape().await;
    harness.seed("k4", "disk", "alice").await;
    harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("k4", "tape")], None)
        .await
        .unwrap();
    harness.run(RequestKind::Copy).await;

    let err = harness
        .engine
        .deletion()
        .submit("gd", vec![deletion_intent("k4", "alice")], None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Denied(ref reason) if reason == COPY_RUNNING_REASON));
    assert_eq!(harness.group_states("gd"), vec![GroupEventState::Denied]);

    // Nothing was changed by the denied batch.
    let reference = harness
        .metadata
        .get_file_ref("k4", "disk")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.owners, owners(&["alice"]));
    assert!(harness.requests(RequestKind::Deletion).await.is_empty());

    // Accepted once the copy is over.
    harness.run(RequestKind::Storage).await;
    harness
        .engine
        .deletion()
        .submit("gd2", vec![deletion_intent("k4", "alice")], None)
        .await
        .unwrap();
}
