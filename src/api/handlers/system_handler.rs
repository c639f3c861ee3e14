//! 系统接口：服务信息、健康检查、指标

use axum::{Json, extract::State, http::header, response::IntoResponse};
use serde_json::json;

use crate::api::app_state::AppState;

/// GET /
pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "service": state.app_name,
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "health": "/health",
        "metrics": "/metrics",
        "dashboard": ["/query/db", "/query/vectordb", "/query/graphdb"],
    }))
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "memory_instance": "initialized",
        "graph_enabled": state.service.graph_enabled(),
    }))
}

/// GET /metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.gather(),
    )
}
