//! Shared test helpers for API integration tests.
#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use keel_api::build_router;
use keel_api::routes::OWNER_HEADER;
use keel_api::state::AppState;
use keel_test_support::{FixedClock, InMemoryDatabase, RecordingPublisher};
use tower::ServiceExt;
use uuid::Uuid;

/// An application wired to in-memory doubles.
pub struct TestApp {
    pub db: Arc<InMemoryDatabase>,
    pub publisher: Arc<RecordingPublisher>,
    state: AppState<InMemoryDatabase>,
}

impl TestApp {
    pub fn new() -> Self {
        let db = Arc::new(InMemoryDatabase::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let state = AppState::new(
            Arc::clone(&db),
            publisher.clone(),
            Arc::new(FixedClock::standard()),
        )
        .with_ledger(db.clone());
        Self {
            db,
            publisher,
            state,
        }
    }

    /// A fresh router over the shared state; `oneshot` consumes it.
    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        owner_id: Option<Uuid>,
        body: Option<&serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(owner_id) = owner_id {
            builder = builder.header(OWNER_HEADER, owner_id.to_string());
        }
        let request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_vec(body).unwrap()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router().oneshot(request).await.unwrap();
        let status = response.status();
        let body_bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body_bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&body_bytes).unwrap_or(serde_json::Value::Null)
        };

        (status, json)
    }

    pub async fn get(&self, uri: &str, owner_id: Option<Uuid>) -> (StatusCode, serde_json::Value) {
        self.send("GET", uri, owner_id, None).await
    }

    pub async fn post(
        &self,
        uri: &str,
        owner_id: Option<Uuid>,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        self.send("POST", uri, owner_id, Some(body)).await
    }

    pub async fn patch(
        &self,
        uri: &str,
        owner_id: Option<Uuid>,
        body: &serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        self.send("PATCH", uri, owner_id, Some(body)).await
    }

    pub async fn delete(&self, uri: &str, owner_id: Option<Uuid>) -> (StatusCode, serde_json::Value) {
        self.send("DELETE", uri, owner_id, None).await
    }
}
