//! End-to-end scenarios driving the engine through sweeps, jobs and group checks.

mod common;

use common::{Script, ScriptedLocation, TestEngine, deletion_intent, owners, storage_intent};
use stowage_core::{GroupEventState, RequestKind, RequestStatus};
use stowage_metadata::repos::{FileRefRepo, GroupRepo, JobRepo, JobState};
use stowage_server::engine::groups::GROUP_EXPIRED_CAUSE;
use stowage_server::engine::scheduler::unknown_location_cause;
use time::{Duration, OffsetDateTime};

#[tokio::test]
async fn test_duplicate_storage_requests_share_one_upload() {
    let harness = TestEngine::with_disk().await;
    let storage = harness.engine.storage();
    for (i, owner) in ["alice", "bob", "carol"].iter().enumerate() {
        storage
            .submit(&format!("g{i}"), vec![storage_intent("x1", "disk", owner)], None)
            .await
            .unwrap();
    }
    assert_eq!(
        harness.statuses(RequestKind::Storage).await,
        vec![
            RequestStatus::ToDo,
            RequestStatus::Delayed,
            RequestStatus::Delayed
        ]
    );

    harness.run(RequestKind::Storage).await;
    assert_eq!(
        harness.statuses(RequestKind::Storage).await,
        vec![RequestStatus::Delayed, RequestStatus::Delayed]
    );
    let reference = harness
        .metadata
        .get_file_ref("x1", "disk")
        .await
        .unwrap()
        .expect("file stored");
    assert_eq!(reference.owners, owners(&["alice"]));

    assert_eq!(harness.undelay().await, 2);
    assert!(harness.requests(RequestKind::Storage).await.is_empty());
    let reference = harness
        .metadata
        .get_file_ref("x1", "disk")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reference.owners, owners(&["alice", "bob", "carol"]));

    // One physical store for three groups.
    let stores: Vec<_> = harness
        .location("disk")
        .calls()
        .into_iter()
        .filter(|(op, _)| *op == "store")
        .collect();
    assert_eq!(stores.len(), 1);

    assert_eq!(harness.check_groups().await, 3);
    for group_id in ["g0", "g1", "g2"] {
        assert_eq!(
            harness.group_states(group_id),
            vec![GroupEventState::Granted, GroupEventState::Success]
        );
    }
}

#[tokio::test]
async fn test_deletion_waits_for_storage_in_progress() {
    let harness = TestEngine::builder()
        .location(ScriptedLocation::online("disk"))
        .location(ScriptedLocation::online("tape"))
        .build()
        .await;
    harness.seed("y1", "disk", "alice").await;

    harness
        .engine
        .storage()
        .submit("gs", vec![storage_intent("y1", "tape", "bob")], None)
        .await
        .unwrap();
    let report = harness.sweep(RequestKind::Storage).await;
    assert_eq!(report.scheduled, 1);
    assert_eq!(
        harness.statuses(RequestKind::Storage).await,
        vec![RequestStatus::Pending]
    );

    harness
        .engine
        .deletion()
        .submit("gd", vec![deletion_intent("y1", "alice")], None)
        .await
        .unwrap();
    assert_eq!(
        harness.statuses(RequestKind::Deletion).await,
        vec![RequestStatus::Delayed]
    );

    harness.dispatcher.drain().await.unwrap();
    assert!(harness.requests(RequestKind::Storage).await.is_empty());
    assert_eq!(harness.undelay().await, 1);
    assert_eq!(
        harness.statuses(RequestKind::Deletion).await,
        vec![RequestStatus::ToDo]
    );

    harness.run(RequestKind::Deletion).await;
    assert!(harness.requests(RequestKind::Deletion).await.is_empty());
    assert!(
        harness
            .metadata
            .get_file_ref("y1", "disk")
            .await
            .unwrap()
            .is_none()
    );
    let kept = harness
        .metadata
        .get_file_ref("y1", "tape")
        .await
        .unwrap()
        .expect("tape copy kept");
    assert_eq!(kept.owners, owners(&["bob"]));

    // The seed, storage and deletion groups.
    assert_eq!(harness.check_groups().await, 3);
    assert_eq!(
        harness.group_states("gd"),
        vec![GroupEventState::Granted, GroupEventState::Success]
    );
}

async fn submit_deletion(harness: &TestEngine, checksum: &str, force_delete: bool) {
    let mut intent = deletion_intent(checksum, "alice");
    intent.force_delete = force_delete;
    harness
        .engine
        .deletion()
        .submit("gd", vec![intent], None)
        .await
        .unwrap();
    harness.run(RequestKind::Deletion).await;
}

#[tokio::test]
async fn test_forced_deletion_drops_reference_when_location_fails() {
    let harness = TestEngine::with_disk().await;
    harness.seed("z1", "disk", "alice").await;
    harness
        .location("disk")
        .script("z1", Script::Fail("device busy".to_string()));

    submit_deletion(&harness, "z1", true).await;
    assert!(harness.requests(RequestKind::Deletion).await.is_empty());
    assert!(
        harness
            .metadata
            .get_file_ref("z1", "disk")
            .await
            .unwrap()
            .is_none()
    );
    harness.check_groups().await;
    assert_eq!(
        harness.group_states("gd"),
        vec![GroupEventState::Granted, GroupEventState::Success]
    );
}

#[tokio::test]
async fn test_unforced_deletion_keeps_reference_when_location_fails() {
    let harness = TestEngine::with_disk().await;
    harness.seed("z2", "disk", "alice").await;
    harness
        .location("disk")
        .script("z2", Script::Fail("device busy".to_string()));

    submit_deletion(&harness, "z2", false).await;
    let rows = harness.requests(RequestKind::Deletion).await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, RequestStatus::Error);
    assert_eq!(rows[0].error_cause.as_deref(), Some("device busy"));
    assert!(
        harness
            .metadata
            .get_file_ref("z2", "disk")
            .await
            .unwrap()
            .is_some()
    );
    harness.check_groups().await;
    assert_eq!(
        harness.group_states("gd"),
        vec![GroupEventState::Granted, GroupEventState::Error]
    );
}

#[tokio::test]
async fn test_disabled_location_fails_every_request() {
    let harness = TestEngine::builder()
        .disabled_location(ScriptedLocation::online("s2"))
        .build()
        .await;
    let intents = (0..10)
        .map(|i| storage_intent(&format!("c{i}"), "s2", "alice"))
        .collect();
    harness
        .engine
        .storage()
        .submit("gc", intents, None)
        .await
        .unwrap();

    let report = harness.sweep(RequestKind::Storage).await;
    assert_eq!(report.failed, 10);
    assert_eq!(report.jobs, 0);

    let rows = harness.requests(RequestKind::Storage).await;
    assert_eq!(rows.len(), 10);
    for row in &rows {
        assert_eq!(row.status, RequestStatus::Error);
        assert_eq!(
            row.error_cause.as_deref(),
            Some(unknown_location_cause(&row.checksum, "s2").as_str())
        );
    }
    assert!(
        harness
            .metadata
            .list_jobs_by_state(JobState::Queued)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(harness.location("s2").calls().is_empty());

    assert_eq!(harness.check_groups().await, 1);
    let results = harness.aggregate_results("gc");
    assert_eq!(results.len(), 10);
    assert!(results.iter().all(|r| r.is_error));
}

#[tokio::test]
async fn test_group_with_one_error_resolves_as_error() {
    let harness = TestEngine::with_disk().await;
    let groups = harness.engine.groups();
    assert!(
        groups
            .granted("gd", RequestKind::Storage, 5, None, true)
            .await
            .unwrap()
    );
    let alice = owners(&["alice"]);
    for i in 0..4 {
        assert!(
            groups
                .request_success(
                    "gd",
                    RequestKind::Storage,
                    &format!("d{i}"),
                    "disk",
                    &alice,
                    Some("disk://d")
                )
                .await
                .unwrap()
        );
    }
    // Not complete yet.
    assert_eq!(harness.check_groups().await, 0);
    groups
        .request_error("gd", RequestKind::Storage, "d4", "disk", &alice, "broken")
        .await
        .unwrap();

    assert_eq!(harness.check_groups().await, 1);
    assert_eq!(harness.group_states("gd"), vec![GroupEventState::Error]);
    let results = harness.aggregate_results("gd");
    assert_eq!(results.len(), 5);
    assert_eq!(results.iter().filter(|r| r.is_error).count(), 1);
    assert!(harness.metadata.get_group("gd").await.unwrap().is_none());
    assert_eq!(harness.check_groups().await, 0);
}

#[tokio::test]
async fn test_expired_group_fails_its_requests() {
    let harness = TestEngine::with_disk().await;
    let intents = vec![
        storage_intent("e0", "disk", "alice"),
        storage_intent("e1", "disk", "alice"),
        storage_intent("e2", "disk", "alice"),
    ];
    let expiration = OffsetDateTime::now_utc() - Duration::seconds(60);
    harness
        .engine
        .storage()
        .submit("ge", intents, Some(expiration))
        .await
        .unwrap();

    assert_eq!(harness.engine.groups().expire_groups().await.unwrap(), 1);
    let rows = harness.requests(RequestKind::Storage).await;
    assert_eq!(rows.len(), 3);
    for row in &rows {
        assert_eq!(row.status, RequestStatus::Error);
        assert_eq!(row.error_cause.as_deref(), Some(GROUP_EXPIRED_CAUSE));
    }
    assert!(harness.metadata.get_group("ge").await.unwrap().is_none());

    // Torn down without an aggregate.
    assert_eq!(harness.check_groups().await, 0);
    assert_eq!(harness.group_states("ge"), vec![GroupEventState::Granted]);
    assert!(harness.aggregate("ge").is_none());
}

#[tokio::test]
async fn test_expiry_racing_completion_check_emits_no_aggregate() {
    let harness = TestEngine::with_disk().await;
    let intents = (0..8)
        .map(|i| storage_intent(&format!("r{i}"), "disk", "alice"))
        .collect();
    let expiration = OffsetDateTime::now_utc() - Duration::seconds(60);
    harness
        .engine
        .storage()
        .submit("gr", intents, Some(expiration))
        .await
        .unwrap();

    let groups = harness.engine.groups();
    let checks = async {
        let mut resolved = 0;
        for _ in 0..20 {
            resolved += groups.check_groups_done().await.unwrap();
            tokio::task::yield_now().await;
        }
        resolved
    };
    let (expired, resolved) = tokio::join!(groups.expire_groups(), checks);
    assert_eq!(expired.unwrap(), 1);
    assert_eq!(resolved, 0);

    assert_eq!(harness.group_states("gr"), vec![GroupEventState::Granted]);
    let statuses = harness.statuses(RequestKind::Storage).await;
    assert_eq!(statuses, vec![RequestStatus::Error; 8]);
}
