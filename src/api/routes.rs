//! Router assembly and server entry point.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware,
    routing::get,
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::rate_limit::{self, RateLimits};
use super::{research, ws};
use crate::agents::{AgentContext, Orchestrator};
use crate::cache::{MemoryCache, ResultCache, SqliteCache};
use crate::config::{CacheBackendKind, Config};
use crate::llm::LlmClient;
use crate::notify::Notifier;
use crate::queue::TaskQueue;
use crate::store::TaskStore;

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: TaskStore,
    pub cache: ResultCache,
    pub notifier: Notifier,
    pub queue: Arc<TaskQueue>,
    pub limits: RateLimits,
    /// Label of the model gateway in use.
    pub provider: String,
}

impl AppState {
    /// Wire the cache, notifier, orchestrator and queue around `store`.
    /// Workers are not started.
    pub fn new(config: Config, store: TaskStore, llm: Arc<dyn LlmClient>) -> Self {
        let cache = match config.cache_backend {
            CacheBackendKind::Memory => {
                ResultCache::new(Arc::new(MemoryCache::new()), config.cache_ttl)
            }
            CacheBackendKind::Sqlite => {
                ResultCache::new(Arc::new(SqliteCache::new(&store)), config.cache_ttl)
            }
            CacheBackendKind::Off => ResultCache::disabled(),
        };
        let notifier = Notifier::new();
        let provider = llm.provider().to_string();
        let orchestrator = Arc::new(Orchestrator::new(Arc::new(AgentContext::new(llm))));
        let queue = TaskQueue::new(
            store.clone(),
            cache.clone(),
            notifier.clone(),
            orchestrator,
            config.run_config(),
            config.queue_config(),
        );

        let limits = RateLimits::per_minute(config.rate_limit_submit, config.rate_limit_list);

        Self {
            config,
            store,
            cache,
            notifier,
            queue: Arc::new(queue),
            limits,
            provider,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route(
            "/api/research",
            get(research::list_tasks).post(research::submit_task),
        )
        .route("/api/research/:id", get(research::get_task))
        .route("/api/research/:id/status", get(research::get_status))
        .route("/api/research/:id/export", get(research::export_task))
        .route("/api/health", get(research::health))
        .route("/api/config", get(research::get_config))
        .route("/ws", get(ws::ws_handler))
        .route("/ws/research/:id", get(ws::ws_task_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::limit_requests,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);
    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let allowed: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    base.allow_origin(allowed)
}

/// Serve until `shutdown` is cancelled.
pub async fn serve(
    state: Arc<AppState>,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    // Peer addresses key the per-client rate limits.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}
