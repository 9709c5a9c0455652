//! HTTP Surface (C8): wires the Proxy Manager into an axum `Router`,
//! binds the listener, and drives graceful shutdown.
//!
//! Grounded on `proxy/server.rs::start_proxy` (state construction, router
//! assembly, `with_graceful_shutdown`) and its `/*path` catch-all habit,
//! reused here for `/upstream/*path`.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{any, get};
use axum::Router;
use tokio::net::TcpListener;

use crate::admin;
use crate::group::ttl_sweep;
use crate::handlers;
use crate::manager::ProxyManager;

/// Every inference route in spec.md §6's table funnels into
/// [`handlers::forward`]; only the URL differs, the handler logic doesn't
/// branch on path beyond what it reads out of the JSON body.
const INFERENCE_ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/completions",
    "/v1/embeddings",
    "/v1/messages",
    "/v1/audio/speech",
    "/v1/audio/transcriptions",
    "/v1/images/generations",
    "/v1/images/edits",
    "/completion",
    "/completions",
    "/infill",
    "/rerank",
    "/reranking",
    "/v1/rerank",
];

pub fn build_router(manager: Arc<ProxyManager>) -> Router {
    let mut router = Router::new();

    for path in INFERENCE_ROUTES {
        router = router.route(path, any(handlers::forward).options(admin::cors_preflight));
    }

    router = router
        .route("/v1/models", get(admin::list_models))
        .route("/running", get(admin::running))
        .route("/unload", get(admin::unload))
        .route("/health", get(admin::health))
        .route("/logs", get(admin::logs_snapshot))
        .route("/logs/stream", get(admin::logs_stream))
        .route("/logs/stream/:model", get(admin::logs_stream_for_model))
        .route("/props", get(admin::props))
        .route(
            "/upstream/*path",
            any(handlers::upstream::forward).options(admin::cors_preflight),
        )
        .with_state(manager);

    router
}

/// Starts the server, spawns preload + TTL sweep background tasks, and
/// blocks until `shutdown` resolves, at which point every group is stopped
/// before the function returns — mirroring `start_proxy`'s own
/// spawn-then-graceful-drain shape.
pub async fn start(
    manager: Arc<ProxyManager>,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    manager.spawn_preload();
    tokio::spawn(ttl_sweep(manager.clone(), Duration::from_secs(1)));

    let router = build_router(manager.clone());
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            tracing::info!("shutdown signal received, draining");
            manager.shutdown().await;
        })
        .await?;

    Ok(())
}
