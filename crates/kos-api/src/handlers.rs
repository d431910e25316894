use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use kos_concurrent::LimiterStats;
use kos_core::{HybridResult, KosError};
use kos_vector::{hybrid_search, BatchStats, PrefetchReport, PrefetchStats};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};
use uuid::Uuid;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    metrics::record_request("health");
    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

#[derive(Debug, Serialize)]
pub struct RagStatsResponse {
    #[serde(flatten)]
    pub batch: BatchStats,
    pub limiter: LimiterStats,
    pub active_scopes: usize,
}

pub async fn rag_stats(State(state): State<AppState>) -> Json<RagStatsResponse> {
    metrics::record_request("rag_stats");
    Json(RagStatsResponse {
        batch: state.batcher.stats(),
        limiter: state.limiter.stats(),
        active_scopes: state.provider.active_scopes(),
    })
}

pub async fn clear_cache(State(state): State<AppState>) -> Json<Value> {
    metrics::record_request("cache_clear");
    let cleared = state.batcher.clear_cache();
    Json(json!({ "status": "ok", "cleared": cleared }))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReloadRequest {
    pub max_queries: Option<usize>,
}

pub async fn reload_prefetch(
    State(state): State<AppState>,
    body: Result<Option<Json<ReloadRequest>>, JsonRejection>,
) -> ApiResult<Json<PrefetchReport>> {
    metrics::record_request("prefetch_reload");
    let max_queries = body?
        .and_then(|Json(req)| req.max_queries)
        .unwrap_or(state.settings.prefetch.max_queries);
    Ok(Json(state.prefetch.load_frequent_queries(max_queries).await))
}

pub async fn prefetch_stats(State(state): State<AppState>) -> Json<PrefetchStats> {
    metrics::record_request("prefetch_stats");
    Json(state.prefetch.get_stats())
}

#[derive(Debug, Deserialize)]
pub struct EmbedRequest {
    pub text: String,
    pub request_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub request_id: String,
    pub dimension: usize,
    pub cached: bool,
    pub embedding: Vec<f32>,
}

pub async fn embed(
    State(state): State<AppState>,
    payload: Result<Json<EmbedRequest>, JsonRejection>,
) -> ApiResult<Json<EmbedResponse>> {
    metrics::record_request("embed");
    let Json(req) = payload?;
    if req.text.trim().is_empty() {
        return Err(KosError::InvalidInput("text must not be empty".into()).into());
    }
    let request_id = req
        .request_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Only cache misses reach the limiter, inside the batcher
    let text = req.text;
    let outcome = state
        .provider
        .scope(&request_id, move |scope| async move {
            let cached = scope.get_cached_only(&text).is_some();
            scope
                .try_get_embedding(&text)
                .await
                .map(|found| found.map(|v| (v, cached)))
        })
        .await;

    let (vector, cached) = match outcome {
        Ok(Some(found)) => found,
        Ok(None) => {
            return Err(ApiError::ServiceUnavailable(
                "embedding service did not return a vector".into(),
            ))
        }
        Err(e) => {
            if e.is_overloaded() {
                metrics::OVERLOAD_REJECTIONS_TOTAL.inc();
                warn!("rejecting embed request {}: {}", request_id, e);
            }
            return Err(e.into());
        }
    };

    debug!(request_id = %request_id, cached, "embed served");
    Ok(Json(EmbedResponse {
        request_id,
        dimension: vector.dimension(),
        cached,
        embedding: vector.to_vec(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct HybridRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub vector_results: Vec<HybridResult>,
    #[serde(default)]
    pub keyword_results: Vec<HybridResult>,
    pub vector_weight: Option<f32>,
    pub limit: Option<usize>,
}

pub async fn hybrid(
    State(state): State<AppState>,
    payload: Result<Json<HybridRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    metrics::record_request("hybrid");
    let Json(req) = payload?;
    let weight = req
        .vector_weight
        .unwrap_or(state.settings.hybrid.vector_weight);
    if !weight.is_finite() {
        return Err(ApiError::BadRequest("vector_weight must be a number".into()));
    }

    let to_pairs = |items: Vec<HybridResult>| -> Vec<(String, f32)> {
        items.into_iter().map(|r| (r.content, r.score)).collect()
    };
    let mut results = hybrid_search(
        &req.query,
        &to_pairs(req.vector_results),
        &to_pairs(req.keyword_results),
        weight,
    );
    if let Some(limit) = req.limit {
        results.truncate(limit);
    }
    Ok(Json(json!({ "results": results })))
}

pub async fn metrics_handler(State(state): State<AppState>) -> (StatusCode, String) {
    metrics::update_component_metrics(
        &state.batcher.stats(),
        &state.limiter.stats(),
        &state.prefetch.get_stats(),
    );
    (StatusCode::OK, metrics::gather_text())
}
