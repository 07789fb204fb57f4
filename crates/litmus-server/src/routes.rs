//! HTTP surface.
//!
//! Two paths under an optional base prefix:
//!
//! - `GET {base}/litmus` — upgrade to the signalling WebSocket
//! - `GET {base}/litmus/health` — liveness probe

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::session;
use crate::state::AppState;

/// Build the application router. `path_base` may be empty, `"prefix"`,
/// or `"/prefix/"`; it is normalized either way.
pub fn router(state: AppState, path_base: &str) -> Router {
    let base = normalize_base(path_base);
    Router::new()
        .route(&format!("{base}/litmus"), get(session::handler))
        .route(&format!("{base}/litmus/health"), get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> &'static str {
    "Litmus OK"
}

fn normalize_base(raw: &str) -> String {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{trimmed}")
    }
}
