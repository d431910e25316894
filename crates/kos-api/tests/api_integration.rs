use async_trait::async_trait;
use axum_test::TestServer;
use kos_api::{create_router, AppState, Server};
use kos_core::{EmbeddingVector, KosError, Result, Settings};
use kos_vector::EmbeddingComputer;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct MockComputer {
    calls: AtomicUsize,
    fail: AtomicBool,
    delay: Option<Duration>,
}

#[async_trait]
impl EmbeddingComputer for MockComputer {
    async fn compute_batch(&self, texts: &[String]) -> Result<Vec<EmbeddingVector>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(KosError::DownstreamUnavailable("mock down".into()));
        }
        Ok(texts
            .iter()
            .map(|t| EmbeddingVector::new(vec![t.len() as f32, 0.5, 0.25]))
            .collect())
    }

    fn name(&self) -> &str {
        "mock"
    }
}

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.batch.batch_timeout_ms = 5;
    settings.prefetch.enabled = false;
    settings
}

fn server_with(settings: Settings, computer: Arc<MockComputer>) -> (TestServer, AppState) {
    let state = AppState::with_computer(settings, computer);
    let server = TestServer::new(create_router(state.clone())).unwrap();
    (server, state)
}

#[tokio::test]
async fn health_endpoint_returns_ok() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let resp = server.get("/health").await;
    assert_eq!(resp.status_code(), 200);
    let body: Value = resp.json();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn embed_then_stats_then_clear() {
    let computer = Arc::new(MockComputer::default());
    let (server, _) = server_with(test_settings(), computer.clone());

    let resp = server
        .post("/rag/embed")
        .json(&json!({ "text": "What is the cache policy?", "request_id": "r-1" }))
        .await;
    assert_eq!(resp.status_code(), 200);
    let body: Value = resp.json();
    assert_eq!(body["request_id"], "r-1");
    assert_eq!(body["dimension"], 3);
    assert_eq!(body["cached"], false);

    let again: Value = server
        .post("/rag/embed")
        .json(&json!({ "text": "what is the cache policy?" }))
        .await
        .json();
    assert_eq!(again["cached"], true);
    assert_eq!(computer.calls.load(Ordering::SeqCst), 1);

    let stats: Value = server.get("/rag/stats").await.json();
    assert_eq!(stats["cache_size"], 1);
    assert_eq!(stats["batch_size"], 10);
    assert_eq!(stats["queue_size"], 0);
    assert_eq!(stats["active_scopes"], 0);
    assert_eq!(stats["limiter"]["max_concurrent"], 5);

    let cleared: Value = server.post("/rag/cache/clear").await.json();
    assert_eq!(cleared, json!({ "status": "ok", "cleared": 1 }));

    let stats: Value = server.get("/rag/stats").await.json();
    assert_eq!(stats["cache_size"], 0);
}

#[tokio::test]
async fn blank_text_is_a_bad_request() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let resp = server
        .post("/rag/embed")
        .json(&json!({ "text": "   " }))
        .expect_failure()
        .await;
    assert_eq!(resp.status_code(), 400);
    let body: Value = resp.json();
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("empty"));
}

#[tokio::test]
async fn downstream_outage_is_503() {
    let computer = Arc::new(MockComputer::default());
    computer.fail.store(true, Ordering::SeqCst);
    let (server, _) = server_with(test_settings(), computer);

    let resp = server
        .post("/rag/embed")
        .json(&json!({ "text": "anything" }))
        .expect_failure()
        .await;
    assert_eq!(resp.status_code(), 503);
}

#[tokio::test]
async fn saturated_limiter_returns_503_with_retry_after() {
    let mut settings = test_settings();
    settings.limiter.max_concurrent = 1;
    settings.limiter.acquire_timeout_secs = 0.05;
    let (server, state) = server_with(settings, Arc::new(MockComputer::default()));

    let _held = state.limiter.try_acquire_slot().unwrap();
    let resp = server
        .post("/rag/embed")
        .json(&json!({ "text": "queued behind a busy slot" }))
        .expect_failure()
        .await;

    assert_eq!(resp.status_code(), 503);
    assert!(resp.headers().get("retry-after").is_some());
    let body: Value = resp.json();
    assert_eq!(body["status"], 503);
}

#[tokio::test]
async fn cache_hits_are_served_while_limiter_is_saturated() {
    let mut settings = test_settings();
    settings.limiter.max_concurrent = 1;
    settings.limiter.acquire_timeout_secs = 0.05;
    let computer = Arc::new(MockComputer::default());
    let (server, state) = server_with(settings, computer.clone());

    server
        .post("/rag/embed")
        .json(&json!({ "text": "warm entry" }))
        .await
        .assert_status_ok();

    let _held = state.limiter.try_acquire_slot().unwrap();
    let body: Value = server
        .post("/rag/embed")
        .json(&json!({ "text": "Warm Entry" }))
        .await
        .json();
    assert_eq!(body["cached"], true);
    assert_eq!(computer.calls.load(Ordering::SeqCst), 1);

    let stats: Value = server.get("/rag/stats").await.json();
    assert_eq!(stats["limiter"]["acquired_total"], 2);
    assert_eq!(stats["limiter"]["rejected_total"], 0);
}

#[tokio::test]
async fn prefetch_reload_is_counted_by_the_limiter() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    server
        .post("/rag/prefetch/reload")
        .json(&json!({ "max_queries": 2 }))
        .await
        .assert_status_ok();

    let stats: Value = server.get("/rag/stats").await.json();
    assert!(stats["limiter"]["acquired_total"].as_u64().unwrap() >= 1);
    assert_eq!(stats["limiter"]["in_flight"], 0);
}

#[tokio::test]
async fn malformed_embed_body_gets_json_error() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let resp = server
        .post("/rag/embed")
        .json(&json!({ "txt": "typo in the field name" }))
        .expect_failure()
        .await;
    assert_eq!(resp.status_code(), 400);
    let body: Value = resp.json();
    assert_eq!(body["status"], 400);
    assert!(body["error"].as_str().unwrap().contains("text"));
}

#[tokio::test]
async fn non_json_reload_body_gets_json_error() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let resp = server
        .post("/rag/prefetch/reload")
        .text("max_queries=3")
        .expect_failure()
        .await;
    assert_eq!(resp.status_code(), 400);
    let body: Value = resp.json();
    assert_eq!(body["status"], 400);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn hybrid_endpoint_ranks_worked_example() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let body: Value = server
        .post("/rag/hybrid")
        .json(&json!({
            "query": "q",
            "vector_results": [
                { "content": "content1", "score": 0.8 },
                { "content": "content2", "score": 0.6 }
            ],
            "keyword_results": [
                { "content": "content2", "score": 0.9 },
                { "content": "content3", "score": 0.7 }
            ],
            "vector_weight": 0.7
        }))
        .await
        .json();

    let order: Vec<&str> = body["results"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["content"].as_str().unwrap())
        .collect();
    assert_eq!(order, vec!["content2", "content1", "content3"]);
    let top = body["results"][0]["score"].as_f64().unwrap();
    assert!((top - 0.69).abs() < 1e-4);
}

#[tokio::test]
async fn prefetch_reload_and_stats() {
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));

    let report: Value = server
        .post("/rag/prefetch/reload")
        .json(&json!({ "max_queries": 3 }))
        .await
        .json();
    assert_eq!(report["requested"], 3);
    assert_eq!(report["loaded"], 3);

    let stats: Value = server.get("/rag/prefetch/stats").await.json();
    assert_eq!(stats["prefetched_queries_count"], 3);
    assert_eq!(stats["total_prefetched"], 3);
    assert!(stats["last_loaded_at"].is_string());

    // No body falls back to the configured max_queries (15)
    let report: Value = server.post("/rag/prefetch/reload").await.json();
    assert_eq!(report["requested"], 15);
}

#[tokio::test]
async fn metrics_endpoint_exposes_component_gauges() {
    kos_api::metrics::register_metrics();
    let (server, _) = server_with(test_settings(), Arc::new(MockComputer::default()));
    server
        .post("/rag/embed")
        .json(&json!({ "text": "count me" }))
        .await;

    let resp = server.get("/metrics").await;
    assert_eq!(resp.status_code(), 200);
    let text = resp.text();
    assert!(text.contains("kos_embedding_cache_entries"));
    assert!(text.contains("kos_http_requests_total"));
}

#[tokio::test]
async fn shutdown_cancels_startup_prefetch() {
    let mut settings = test_settings();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    settings.prefetch.enabled = true;
    let computer = Arc::new(MockComputer {
        delay: Some(Duration::from_millis(500)),
        ..Default::default()
    });
    let state = AppState::with_computer(settings, computer.clone());

    let server = Server::new(state.clone());
    let cancel = server.cancellation_token();
    let running = tokio::spawn(server.run());

    while computer.calls.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("server stops")
        .unwrap()
        .unwrap();

    // The warm-up task was dropped before it could record anything
    assert!(state.prefetch.get_stats().last_loaded_at.is_none());
    assert_eq!(Arc::strong_count(&state.prefetch), 1);
    assert!(state.batcher.is_shut_down());
}
