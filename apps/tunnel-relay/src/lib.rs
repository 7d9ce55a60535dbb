//! Rendezvous relay for tunnel peers: HTTP polling endpoints and a duplex
//! websocket endpoint over one shared session store.

pub mod config;
mod handlers;
pub mod state;
mod websocket;

use axum::{
    routing::{get, head, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use crate::config::Config;
pub use crate::state::RelayState;

pub fn build_router(state: RelayState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/api/sdp", post(handlers::post_sdp))
        .route("/api/candidate", post(handlers::post_candidate))
        .route("/api/fetch", get(handlers::fetch))
        .route("/api/offline", head(handlers::offline))
        .route("/api/signalling", get(websocket::websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay on `listener` until the server fails.
pub async fn serve(listener: tokio::net::TcpListener, state: RelayState) -> std::io::Result<()> {
    let reaper = state.spawn_reaper();
    let result = axum::serve(listener, build_router(state)).await;
    reaper.abort();
    result
}
