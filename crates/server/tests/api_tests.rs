//! HTTP API tests.

mod common;

use axum::http::StatusCode;
use common::{ScriptedLocation, TestEngine, TestServer, copy_intent};
use serde_json::json;
use stowage_core::{GroupEventState, RequestKind, RequestStatus};

fn storage_batch(group_id: &str, checksums: &[&str]) -> serde_json::Value {
    let requests: Vec<_> = checksums
        .iter()
        .map(|c| {
            json!({
                "checksum": c,
                "backend": "disk",
                "owner": "alice",
                "origin_url": format!("file:///incoming/{c}"),
            })
        })
        .collect();
    json!({ "group_id": group_id, "requests": requests })
}

#[tokio::test]
async fn test_health_lists_locations() {
    let server = TestServer::new().await;
    let (status, body) = server.call("GET", "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["locations"], json!(["disk"]));
}

#[tokio::test]
async fn test_submit_storage_batch() {
    let server = TestServer::new().await;
    let (status, body) = server
        .call(
            "POST",
            "/v1/storage-requests",
            Some(storage_batch("g1", &["h0", "h1"])),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["group_id"], "g1");
    assert_eq!(body["expected"], 2);
    assert_eq!(body["created"], 2);

    let harness = &server.harness;
    assert_eq!(
        harness.statuses(RequestKind::Storage).await,
        vec![RequestStatus::ToDo, RequestStatus::ToDo]
    );
    assert_eq!(harness.group_states("g1"), vec![GroupEventState::Granted]);
}

#[tokio::test]
async fn test_empty_batch_is_rejected() {
    let server = TestServer::new().await;
    let (status, body) = server
        .call("POST", "/v1/storage-requests", Some(storage_batch("g1", &[])))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_batch");
    assert_eq!(
        server.harness.group_states("g1"),
        vec![GroupEventState::Denied]
    );
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let server = TestServer::new().await;
    let (status, body) = server
        .call(
            "POST",
            "/v1/cache-requests",
            Some(json!({ "group_id": "g1", "checksums": "h0" })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "bad_request");
}

#[tokio::test]
async fn test_deletion_during_copy_conflicts() {
    let harness = TestEngine::builder()
        .location(ScriptedLocation::online("disk"))
        .location(ScriptedLocation::nearline("tape"))
        .build()
        .await;
    harness.seed("h2", "disk", "alice").await;
    harness
        .engine
        .copy()
        .submit("gc", vec![copy_intent("h2", "tape")], None)
        .await
        .unwrap();
    harness.run(RequestKind::Copy).await;
    let server = TestServer::from_harness(harness);

    let (status, body) = server
        .call(
            "POST",
            "/v1/deletion-requests",
            Some(json!({
                "group_id": "gd",
                "requests": [{ "checksum": "h2", "owner": "alice" }],
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "denied");
}

#[tokio::test]
async fn test_stats_endpoint() {
    let server = TestServer::new().await;
    server
        .call(
            "POST",
            "/v1/storage-requests",
            Some(storage_batch("g1", &["h3"])),
        )
        .await;

    let (status, body) = server.call("GET", "/v1/admin/requests/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        body,
        json!([{ "kind": "storage", "status": "TO_DO", "count": 1 }])
    );
}

#[tokio::test]
async fn test_stop_unknown_kind() {
    let server = TestServer::new().await;
    let (status, _) = server.call("POST", "/v1/admin/stop/bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server.call("POST", "/v1/admin/stop/storage", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 0);
}

#[tokio::test]
async fn test_group_retry_and_cancel() {
    let server = TestServer::new().await;
    server
        .harness
        .location("disk")
        .script("h4", common::Script::Fail("device busy".to_string()));
    server
        .call(
            "POST",
            "/v1/storage-requests",
            Some(storage_batch("g1", &["h4"])),
        )
        .await;
    server.harness.run(RequestKind::Storage).await;
    server.harness.check_groups().await;

    server.harness.location("disk").clear("h4");
    let (status, body) = server.call("POST", "/v1/groups/g1/retry", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 1);

    server.harness.sweep(RequestKind::Storage).await;
    let (status, body) = server.call("POST", "/v1/groups/g1/cancel", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 1);
    assert_eq!(
        server.harness.statuses(RequestKind::Storage).await,
        vec![RequestStatus::Error]
    );
}

#[tokio::test]
async fn test_purge_backend_requests() {
    let server = TestServer::new().await;
    server
        .harness
        .location("disk")
        .script("h5", common::Script::Fail("device busy".to_string()));
    server
        .call(
            "POST",
            "/v1/storage-requests",
            Some(storage_batch("g1", &["h5", "h6"])),
        )
        .await;
    server.harness.sweep(RequestKind::Storage).await;
    server.harness.dispatcher.drain().await.unwrap();

    let (status, body) = server
        .call(
            "DELETE",
            "/v1/admin/backends/disk/requests?kind=storage&status=ERROR",
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 1);
    assert!(server.harness.requests(RequestKind::Storage).await.is_empty());
}

#[tokio::test]
async fn test_retry_owners_requires_owners() {
    let server = TestServer::new().await;
    let (status, _) = server
        .call("POST", "/v1/requests/retry", Some(json!({ "owners": [] })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = server
        .call(
            "POST",
            "/v1/requests/retry",
            Some(json!({ "owners": ["alice"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["affected"], 0);
}
