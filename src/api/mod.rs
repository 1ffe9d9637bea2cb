//! HTTP API endpoints.

pub mod health;
pub mod sources;
pub mod threads;

use axum::Router;

use crate::AppState;

/// Create the combined API router.
pub fn create_router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(sources::router())
        .merge(threads::router())
}
