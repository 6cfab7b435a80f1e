use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tokio::sync::Notify;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::bootstrap::{self, BootstrapError, SelectedBackend};
use crate::config::AppConfig;
use crate::memory_store::InMemoryCatalog;
use crate::service::ProductService;
use crate::store::CatalogStore;
use crate::{handlers, middleware as app_middleware};

/// How often expired entries are swept from the in-process cache.
const LOCAL_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct AppState {
    pub service: ProductService,
}

impl AppState {
    pub fn new(service: ProductService) -> Self {
        Self { service }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/invalidateCache", post(handlers::invalidate_cache))
        .route(
            "/api/products",
            get(handlers::list_products).post(handlers::create_product),
        )
        .route(
            "/api/products/{id}",
            get(handlers::get_product)
                .put(handlers::update_product)
                .delete(handlers::delete_product),
        )
        .route(
            "/api/products/{id}/tags",
            get(handlers::get_product_tags)
                .post(handlers::attach_product_tags)
                .put(handlers::replace_product_tags),
        )
        .route(
            "/api/tags",
            get(handlers::list_tags).post(handlers::create_tag),
        )
        .route(
            "/api/users",
            get(handlers::list_users).post(handlers::create_user),
        )
        .route(
            "/api/users/{user_id}/orders",
            get(handlers::get_user_orders).post(handlers::create_order),
        )
        .route("/api/orders/{id}", get(handlers::get_order))
        .route("/metrics", get(handlers::metrics))
        .route_layer(middleware::from_fn(app_middleware::http_metrics))
        .fallback(handlers::not_found)
        .with_state(state)
        // Layers run outermost-last: request id wraps tracing wraps the routes.
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: Duration, span: &tracing::Span| {
                        span.record(
                            "http.status_code",
                            tracing::field::display(res.status().as_u16()),
                        );
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(middleware::from_fn(app_middleware::request_id))
}

/// Wire the store, cache backend and service described by `cfg`.
///
/// Returns the state and the selected backend so the caller can start
/// backend-specific maintenance.
pub async fn build_state(
    cfg: &AppConfig,
    store: Arc<dyn CatalogStore>,
) -> Result<(AppState, SelectedBackend), BootstrapError> {
    let selected = bootstrap::create_cache_backend(&cfg.redis, &cfg.cache).await?;
    let service = ProductService::new(store, selected.clone().into_shared(), &cfg.cache);
    tracing::info!(mode = selected.mode(), "cache backend ready");
    Ok((AppState::new(service), selected))
}

pub struct CatalogServer {
    addr: SocketAddr,
    app: Router,
    shutdown_timeout: Duration,
    maintenance: Option<tokio::task::JoinHandle<()>>,
}

impl CatalogServer {
    /// Build a server on the in-memory catalog.
    pub async fn from_config(cfg: &AppConfig) -> Result<Self, BootstrapError> {
        let store = if cfg.server.seed_demo_data {
            InMemoryCatalog::with_demo_data().await
        } else {
            InMemoryCatalog::new()
        };
        let (state, selected) = build_state(cfg, Arc::new(store)).await?;
        let maintenance = selected
            .local()
            .cloned()
            .map(|local| bootstrap::spawn_local_maintenance(local, LOCAL_CACHE_SWEEP_INTERVAL));
        Ok(Self {
            addr: cfg.addr(),
            app: build_app(state),
            shutdown_timeout: cfg.shutdown_timeout(),
            maintenance,
        })
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", listener.local_addr()?);

        let draining = Arc::new(Notify::new());
        let signal_draining = Arc::clone(&draining);
        let serve = axum::serve(listener, self.app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                signal_draining.notify_one();
            })
            .into_future();
        tokio::pin!(serve);

        let shutdown_timeout = self.shutdown_timeout;
        tokio::select! {
            res = &mut serve => res?,
            _ = async {
                draining.notified().await;
                tokio::time::sleep(shutdown_timeout).await;
            } => {
                tracing::warn!(
                    timeout_ms = shutdown_timeout.as_millis() as u64,
                    "shutdown timeout elapsed, dropping open connections"
                );
            }
        }

        if let Some(handle) = self.maintenance {
            handle.abort();
        }
        tracing::info!("server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
