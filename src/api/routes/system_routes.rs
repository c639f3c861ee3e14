use axum::{Router, routing::get};

use crate::api::app_state::AppState;
use crate::api::handlers::system_handler::*;

pub fn create_system_router() -> Router<AppState> {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
}
