//! Dashboard Routes

use axum::{Router, routing::get};

use crate::api::app_state::AppState;
use crate::api::handlers::dashboard_handler::*;

/// 创建调试面板路由器
pub fn create_dashboard_router() -> Router<AppState> {
    Router::new()
        .route("/query/db", get(query_history))
        .route("/query/db/stats", get(history_stats))
        .route("/query/vectordb", get(query_vectors))
        .route("/query/vectordb/stats", get(vector_stats))
        .route("/query/graphdb", get(query_graph))
        .route("/query/graphdb/stats", get(graph_stats))
}
