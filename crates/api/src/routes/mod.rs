pub mod admin;
pub mod health;
pub mod status;
pub mod upload;
pub mod webhooks;

use axum::Router;

use crate::state::AppState;

/// Build the complete API router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(health::router())
        .merge(upload::router())
        .merge(status::router())
        .merge(webhooks::router())
        .merge(admin::router())
        .with_state(state)
}
