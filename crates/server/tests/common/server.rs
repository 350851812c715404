//! HTTP test utilities.

use super::engine::TestEngine;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::Value;
use stowage_server::{AppState, create_router};
use tower::ServiceExt;

/// A router over a [`TestEngine`].
#[allow(dead_code)]
pub struct TestServer {
    pub router: axum::Router,
    pub harness: TestEngine,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::from_harness(TestEngine::with_disk().await)
    }

    pub fn from_harness(harness: TestEngine) -> Self {
        let state = AppState::new(harness.engine.clone());
        Self {
            router: create_router(state),
            harness,
        }
    }

    /// Send a request and decode the JSON answer.
    pub async fn call(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("Content-Type", "application/json");
                Body::from(serde_json::to_vec(&v).unwrap())
            }
            None => Body::empty(),
        };

        let request = builder.body(body).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();

        let status = response.status();
        let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: Value = if body_bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
        };
        (status, json)
    }
}
