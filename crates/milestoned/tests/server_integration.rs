//! Integration tests for the external-adapter HTTP surface.
//!
//! Drives the router over a real SQLite store with a scripted metric source:
//! milestone sequences, restarts, administrative routes and failure handling.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use http_body_util::BodyExt;
use milestone_core::cache::InMemoryCache;
use milestone_core::{Config, MilestoneEngine, ResourceId};
use milestoned::server::{create_router, AppState};
use milestoned::source::{MetricSnapshot, MetricSource, SourceError};
use milestoned::storage::Storage;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

/// Replays queued snapshots; an empty queue means the source is down.
#[derive(Default)]
struct ScriptedSource {
    responses: Mutex<VecDeque<Result<MetricSnapshot, String>>>,
    calls: Mutex<usize>,
}

impl ScriptedSource {
    fn push(&self, views: Option<u64>, likes: Option<u64>) {
        let mut snapshot = MetricSnapshot::new();
        if let Some(v) = views {
            snapshot.insert("views".to_string(), v);
        }
        if let Some(l) = likes {
            snapshot.insert("likes".to_string(), l);
        }
        self.responses.lock().unwrap().push_back(Ok(snapshot));
    }

    fn push_failure(&self, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .push_back(Err(message.to_string()));
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl MetricSource for ScriptedSource {
    async fn fetch(&self, _resource_id: &ResourceId) -> Result<MetricSnapshot, SourceError> {
        *self.calls.lock().unwrap() += 1;
        match self.responses.lock().unwrap().pop_front() {
            Some(Ok(snapshot)) => Ok(snapshot),
            Some(Err(message)) => Err(SourceError::Unavailable(message)),
            None => Err(SourceError::Unavailable("script exhausted".to_string())),
        }
    }
}

async fn create_test_app(dir: &TempDir, config: &Config) -> (axum::Router, Arc<ScriptedSource>) {
    let db_path = dir.path().join("test.db");
    let storage = Storage::new(&db_path).await.unwrap();
    storage.migrate_embedded().await.unwrap();

    let engine = MilestoneEngine::new(
        config.catalog().unwrap(),
        Arc::new(storage),
        Arc::new(InMemoryCache::new()),
    );
    let source = Arc::new(ScriptedSource::default());
    let state = AppState::new(Arc::new(engine), source.clone());
    (create_router(Arc::new(state)), source)
}

fn adapter_post(job: &str, video_id: &str, endpoint: &str) -> Request<Body> {
    let body = serde_json::json!({
        "id": job,
        "data": { "videoId": video_id, "endpoint": endpoint }
    });
    Request::builder()
        .method("POST")
        .uri("/")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn body_to_json(response: Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn check(app: &axum::Router, video_id: &str, endpoint: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(adapter_post("job", video_id, endpoint))
        .await
        .unwrap();
    let status = response.status();
    (status, body_to_json(response).await)
}

// --- Milestone sequences ---

#[tokio::test]
async fn views_follow_floor_then_step() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    let mut fired = Vec::new();
    for views in [524, 525, 529, 530, 531, 547] {
        source.push(Some(views), Some(0));
        let (status, json) = check(&app, "vid", "views").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["value"], views);
        if json["data"]["shouldTrigger"] == true {
            fired.push(json["data"]["milestone"].as_u64().unwrap());
        }
    }

    assert_eq!(fired, vec![525, 530, 545]);
}

#[tokio::test]
async fn likes_fire_on_each_multiple() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    let mut fired = Vec::new();
    for likes in [10, 24, 25, 26, 49, 50, 50, 51] {
        source.push(Some(1000), Some(likes));
        let (_, json) = check(&app, "vid", "likes").await;
        if json["data"]["shouldTrigger"] == true {
            fired.push(json["data"]["milestone"].as_u64().unwrap());
        }
    }

    assert_eq!(fired, vec![25, 50]);
}

#[tokio::test]
async fn regressed_count_is_flagged_and_ignored() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push(Some(600), None);
    check(&app, "vid", "views").await;

    source.push(Some(590), None);
    let (status, json) = check(&app, "vid", "views").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["data"]["shouldTrigger"], false);
    assert_eq!(json["data"]["sourceRegressed"], true);

    // The ratchet kept 600, so 604 is still in the same bucket.
    source.push(Some(604), None);
    let (_, json) = check(&app, "vid", "views").await;
    assert_eq!(json["data"]["shouldTrigger"], false);
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let config = Config::default();

    {
        let (app, source) = create_test_app(&dir, &config).await;
        source.push(Some(100), Some(26));
        let (_, json) = check(&app, "vid", "likes").await;
        assert_eq!(json["data"]["milestone"], 25);
    }

    let (app, source) = create_test_app(&dir, &config).await;
    source.push(Some(100), Some(30));
    let (_, json) = check(&app, "vid", "likes").await;
    assert_eq!(json["data"]["shouldTrigger"], false);

    source.push(Some(100), Some(50));
    let (_, json) = check(&app, "vid", "likes").await;
    assert_eq!(json["data"]["milestone"], 50);
}

#[tokio::test]
async fn resources_are_independent() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push(None, Some(25));
    let (_, a) = check(&app, "video-a", "likes").await;
    source.push(None, Some(25));
    let (_, b) = check(&app, "video-b", "likes").await;

    assert_eq!(a["data"]["shouldTrigger"], true);
    assert_eq!(b["data"]["shouldTrigger"], true);
}

#[tokio::test]
async fn per_resource_override_applies() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::default();
    config
        .parse_content("resource.special.metric.likes.step = 100\n")
        .unwrap();
    let (app, source) = create_test_app(&dir, &config).await;

    source.push(None, Some(75));
    let (_, json) = check(&app, "special", "likes").await;
    assert_eq!(json["data"]["shouldTrigger"], false);

    source.push(None, Some(75));
    let (_, json) = check(&app, "other", "likes").await;
    assert_eq!(json["data"]["milestone"], 75);
}

// --- Failure handling ---

#[tokio::test]
async fn source_failure_leaves_state_untouched() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push_failure("quota exceeded");
    let (status, json) = check(&app, "vid", "likes").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["status"], "errored");
    assert_eq!(json["statusCode"], 502);

    // No state was written, so the next good fetch still fires.
    source.push(None, Some(25));
    let (_, json) = check(&app, "vid", "likes").await;
    assert_eq!(json["data"]["milestone"], 25);
}

#[tokio::test]
async fn hidden_metric_skips_the_round() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push(Some(700), None);
    let (status, json) = check(&app, "vid", "likes").await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(json["status"], "errored");
}

#[tokio::test]
async fn unknown_endpoint_does_not_fetch() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    let (status, _) = check(&app, "vid", "subscribers").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(source.calls(), 0);
}

// --- Concurrency ---

#[tokio::test]
async fn concurrent_checks_fire_once() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    for _ in 0..8 {
        source.push(None, Some(25));
    }

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            tokio::spawn(async move {
                let response = app
                    .oneshot(adapter_post(&format!("job-{i}"), "vid", "likes"))
                    .await
                    .unwrap();
                assert_eq!(response.status(), StatusCode::OK);
                body_to_json(response).await
            })
        })
        .collect();

    let mut triggered = 0;
    for handle in handles {
        if handle.await.unwrap()["data"]["shouldTrigger"] == true {
            triggered += 1;
        }
    }
    assert_eq!(triggered, 1);
}

// --- Administrative routes ---

#[tokio::test]
async fn resource_status_reports_next_triggers() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push(Some(531), Some(27));
    check(&app, "vid", "views").await;

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/resources/vid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_to_json(response).await;

    assert_eq!(json["resource_id"], "vid");
    assert_eq!(json["version"], 1);
    let metrics = json["metrics"].as_array().unwrap();
    let views = metrics.iter().find(|m| m["metric"] == "views").unwrap();
    assert_eq!(views["last_counter_value"], 531);
    assert_eq!(views["last_triggered_milestone"], 530);
    assert_eq!(views["next_trigger"], 535);
    assert_eq!(views["phase"], "ARMED");

    // Likes was reported in the snapshot but only views was checked.
    let likes = metrics.iter().find(|m| m["metric"] == "likes").unwrap();
    assert!(likes["last_counter_value"].is_null());
    assert_eq!(likes["next_trigger"], 25);
}

#[tokio::test]
async fn delete_resource_resets_state() {
    let dir = TempDir::new().unwrap();
    let (app, source) = create_test_app(&dir, &Config::default()).await;

    source.push(None, Some(30));
    check(&app, "vid", "likes").await;

    let delete = || {
        Request::builder()
            .method("DELETE")
            .uri("/resources/vid")
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_to_json(response).await["removed"], true);

    let response = app.clone().oneshot(delete()).await.unwrap();
    assert_eq!(body_to_json(response).await["removed"], false);

    // Fresh state: 30 crosses 25 again.
    source.push(None, Some(30));
    let (_, json) = check(&app, "vid", "likes").await;
    assert_eq!(json["data"]["milestone"], 25);
}
