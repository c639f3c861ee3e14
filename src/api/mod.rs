//! API 模块
//!
//! 提供 REST API 支持：记忆接口、调试面板、健康检查与指标。

pub mod app_state;
pub mod dto;
pub mod extract;
pub mod handlers;
pub mod routes;

use std::time::{Duration, Instant};

use axum::{
    Router,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use tower_http::{
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::api::app_state::AppState;
use crate::config::ServerConfig;

pub fn create_router(app_state: AppState, server: &ServerConfig) -> Router {
    let cors = if server.cors_allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        CorsLayer::new()
    };

    Router::new()
        .merge(routes::system_routes::create_system_router())
        .merge(routes::memory_routes::create_memory_router())
        .merge(routes::dashboard_routes::create_dashboard_router())
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            track_metrics,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(server.request_timeout)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// 统计请求数、耗时和失败响应
async fn track_metrics(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;

    state
        .metrics
        .record_http_request(started.elapsed().as_millis() as u64);
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        state.metrics.record_error();
    }
    response
}
