use crate::{create_router, metrics, AppState};
use kos_core::Result;
use kos_vector::{PrefetchScheduler, SchedulerConfig};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct Server {
    state: AppState,
    host: String,
    port: u16,
    cancel: CancellationToken,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        let host = state.settings.server.host.clone();
        let port = state.settings.server.port;
        Self {
            state,
            host,
            port,
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling this token stops the server and its background tasks.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<()> {
        metrics::register_metrics();
        let prefetch_settings = self.state.settings.prefetch.clone();

        let warmup = prefetch_settings.enabled.then(|| {
            let prefetch = Arc::clone(&self.state.prefetch);
            let max_queries = prefetch_settings.max_queries;
            let cancel = self.cancel.child_token();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => info!("startup prefetch cancelled"),
                    _ = prefetch.load_frequent_queries(max_queries) => {}
                }
            })
        });

        let scheduler = SchedulerConfig::from_settings(&prefetch_settings).map(|config| {
            PrefetchScheduler::spawn(
                Arc::clone(&self.state.prefetch),
                config,
                self.cancel.child_token(),
            )
        });

        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;
        info!("Knowledge OS RAG-light API listening on {}", listener.local_addr()?);
        info!("  GET  /health, /metrics, /rag/stats, /rag/prefetch/stats");
        info!("  POST /rag/embed, /rag/hybrid, /rag/cache/clear, /rag/prefetch/reload");

        let router = create_router(self.state.clone());
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal(self.cancel.clone()))
            .await?;

        self.cancel.cancel();
        for handle in [warmup, scheduler].into_iter().flatten() {
            if let Err(e) = handle.await {
                warn!("prefetch task ended abnormally: {}", e);
            }
        }
        self.state.batcher.shutdown().await;
        info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down gracefully"),
        _ = terminate => info!("Received SIGTERM, shutting down gracefully"),
        _ = cancel.cancelled() => info!("Shutdown requested"),
    }
}
