//! Server assembly: router construction, state wiring, and lifecycle.

pub mod api;
pub mod connections;
pub mod ws;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::config::ServerConfig;
use crate::events::Event;
use crate::launcher::WorkerLauncher;
use crate::monitor::LogStreamer;
use crate::store::{AdwDb, DbHandle};
use crate::supervisor::spawn_supervisor;

use api::{AppState, SharedState};

/// Build the full application router: read API, worker intake, and the
/// control-plane WebSocket.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/ws/trigger", get(ws::ws_handler))
        .with_state(state)
}

/// Construct shared state plus the receiver half of the monitor bridge.
pub fn build_state(
    config: ServerConfig,
) -> Result<(SharedState, mpsc::UnboundedReceiver<Event>)> {
    let mut db = AdwDb::new(&config.db_path).context("Failed to initialize database")?;
    if !config.db_only {
        db = db.with_dual_write(config.agents_dir.clone());
        info!("dual-write mode enabled, mirroring state to JSON files");
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let streamer = LogStreamer::new(
        config.agents_dir.clone(),
        config.specs_dir.clone(),
        events_tx,
    );

    let state = Arc::new(AppState {
        db: DbHandle::new(db),
        connections: connections::ConnectionManager::new(),
        launcher: WorkerLauncher::new(config),
        streamer,
        started_at: Instant::now(),
        workflows_triggered: AtomicU64::new(0),
    });
    Ok((state, events_rx))
}

/// Start the trigger server and run until ctrl-c.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let port = config.port;
    let dev_mode = config.dev_mode;
    let (state, mut events_rx) = build_state(config)?;

    // Bridge consumer: monitor threads push events onto the channel; this
    // task fans them out.
    let bridge_state = Arc::clone(&state);
    let bridge = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            bridge_state.connections.publish(&event);
        }
    });

    let supervisor = spawn_supervisor(Arc::clone(&state));

    let mut app = build_router(Arc::clone(&state));
    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, "ADW trigger server listening");
    info!("WebSocket endpoint: ws://{}/ws/trigger", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    // Shutdown: cancel periodic work, tell clients, release monitors.
    // Detached workers are untouched and keep running.
    supervisor.abort();
    state.connections.close_all("server shutting down");
    state.streamer.stop_all();
    bridge.abort();

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install ctrl-c handler");
    }
    info!("shutdown requested");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_router() -> Router {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            db_path: dir.path().join("test.db"),
            agents_dir: dir.path().join("agents"),
            specs_dir: dir.path().join("specs"),
            repo_root: dir.path().to_path_buf(),
            ..ServerConfig::default()
        };
        let (state, _events_rx) = build_state(config).unwrap();
        // Keep the tempdir alive for the life of the router.
        std::mem::forget(dir);
        build_router(state)
    }

    #[tokio::test]
    async fn test_health_via_full_router() {
        let app = test_router();
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["active_connections"], 0);
    }

    #[tokio::test]
    async fn test_api_routes_mounted() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/adws")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_route_404s() {
        let app = test_router();
        let req = Request::builder()
            .uri("/api/unknown")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
