pub mod error;
pub mod routes;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use sprinkler_core::SprinklerSystem;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(system: Arc<SprinklerSystem>) -> Router {
    let app_state = state::AppState::new(system);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(routes::index::get_index))
        // Sprinklers
        .route(
            "/sprinklers",
            get(routes::actuators::list_actuators).post(routes::actuators::create_actuator),
        )
        .route(
            "/sprinklers/{id}",
            get(routes::actuators::get_actuator).post(routes::actuators::update_actuator),
        )
        // Scenarios
        .route("/scenarios", get(routes::scenarios::list_scenarios))
        .route(
            "/scenarios/{id}",
            get(routes::scenarios::get_scenario).post(routes::scenarios::update_scenario),
        )
        // Completed runs
        .route("/events", get(routes::events::list_events))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state)
}

/// Serve the API on `0.0.0.0:port` until `shutdown` resolves.
pub async fn serve(
    system: Arc<SprinklerSystem>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    serve_on(system, listener, shutdown).await
}

/// Serve on a pre-bound listener, so callers binding port 0 can read the
/// actual port first.
pub async fn serve_on(
    system: Arc<SprinklerSystem>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(system);

    tracing::info!("sprinkler API listening on http://localhost:{actual_port}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
