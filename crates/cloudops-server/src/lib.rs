pub mod error;
pub mod routes;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use cloudops_core::orchestrator::Orchestrator;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use state::AppState;

/// Build the axum Router with all API routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(app_state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Actions
        .route("/api/actions", get(routes::actions::list_actions))
        .route("/api/actions", post(routes::actions::create_action))
        .route("/api/actions/{id}", get(routes::actions::get_action))
        .route(
            "/api/actions/{id}/logs",
            get(routes::actions::get_action_logs),
        )
        .route(
            "/api/actions/{id}/cancel",
            post(routes::actions::cancel_action),
        )
        .route("/api/actions/{id}/run", post(routes::actions::run_action))
        // Dispatch
        .route("/api/dispatch", post(routes::dispatch::run_cycle))
        // Config
        .route("/api/config", get(routes::config::get_config))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Drive dispatch cycles from an interval timer.
///
/// Cycles run back to back on one task, so they never overlap; a cycle that
/// overruns the interval delays the next tick instead of queueing a burst.
pub fn spawn_ticker(orchestrator: Arc<Orchestrator>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = orchestrator.run_cycle().await {
                tracing::error!(error = %e, "dispatch cycle failed");
            }
        }
    })
}

/// Start the server for the workspace at `root`.
///
/// With `external_trigger` set no ticker is started and cycles run only on
/// `POST /api/dispatch`.
pub async fn serve(root: PathBuf, port: u16, external_trigger: bool) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(root, listener, external_trigger).await
}

/// Start the server on a pre-bound listener, so callers can bind port 0 and
/// read the actual port first.
pub async fn serve_on(
    root: PathBuf,
    listener: tokio::net::TcpListener,
    external_trigger: bool,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app_state = AppState::open(root)?;

    let ticker = if external_trigger {
        tracing::info!("dispatch ticker disabled; waiting for POST /api/dispatch");
        None
    } else {
        let every = app_state.config.dispatch.tick_interval();
        tracing::info!(interval_secs = every.as_secs(), "dispatch ticker started");
        Some(spawn_ticker(app_state.orchestrator.clone(), every))
    };

    tracing::info!("cloudops server listening on http://localhost:{actual_port}");
    let result = axum::serve(listener, build_router(app_state)).await;
    if let Some(handle) = ticker {
        handle.abort();
    }
    result?;
    Ok(())
}
