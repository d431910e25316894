use crate::{handlers, AppState};
use axum::{
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/rag/stats", get(handlers::rag_stats))
        .route("/rag/cache/clear", post(handlers::clear_cache))
        .route("/rag/prefetch/reload", post(handlers::reload_prefetch))
        .route("/rag/prefetch/stats", get(handlers::prefetch_stats))
        .route("/rag/embed", post(handlers::embed))
        .route("/rag/hybrid", post(handlers::hybrid))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
