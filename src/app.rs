use crate::handlers;
use crate::state::AppState;
use axum::{routing::{get, post}, Router};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(handlers::status))
        .route("/api/users/:user_id/today", get(handlers::get_today))
        .route("/api/users/:user_id/adjust", post(handlers::adjust))
        .route("/api/team", get(handlers::get_team))
        .with_state(state)
}
