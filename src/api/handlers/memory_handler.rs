//! Memory API Handlers
//!
//! 记忆的增删改查、检索与历史接口。

use std::time::Instant;

use axum::{
    Json,
    extract::{Path, State},
    response::IntoResponse,
};
use serde_json::json;
use tracing::debug;

use crate::{
    api::{
        app_state::AppState,
        dto::memory_dto::*,
        extract::{ApiJson, ApiQuery},
    },
    error::AppError,
    models::history::EventKind,
};

/// 添加记忆
///
/// POST /memories
pub async fn add_memory(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<AddMemoryBody>,
) -> Result<impl IntoResponse, AppError> {
    let request = body.into_request()?;
    debug!(
        scope = %request.scope,
        messages = request.messages.len(),
        infer = request.infer,
        "Adding memory"
    );

    let result = state.service.add(request).await?;
    let added = result
        .results
        .iter()
        .filter(|e| e.event == EventKind::Add)
        .count();
    state.metrics.record_added(added as u64);

    Ok(Json(ApiResponse::ok("记忆添加成功", result)))
}

/// 检索记忆
///
/// POST /memories/search
pub async fn search_memories(
    State(state): State<AppState>,
    ApiJson(body): ApiJson<SearchBody>,
) -> Result<impl IntoResponse, AppError> {
    let started = Instant::now();
    let request = body.into_request();
    debug!(scope = %request.scope, "Searching memories: {}", request.query);

    let result = state.service.search(request).await?;
    state
        .metrics
        .record_search(started.elapsed().as_millis() as u64);

    Ok(Json(ApiResponse::ok(
        format!("找到 {} 条记忆", result.results.len()),
        result,
    )))
}

/// 列出作用域内的记忆
///
/// GET /memories
pub async fn list_memories(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ScopeParams>,
) -> Result<impl IntoResponse, AppError> {
    let scope = params.scope();
    debug!(%scope, "Listing memories");

    let records = state.service.get_all(&scope, params.limit).await?;
    Ok(Json(ApiResponse::ok(
        format!("获取到 {} 条记忆", records.len()),
        json!({ "results": records }),
    )))
}

/// GET /memories/:id
pub async fn get_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    debug!("Getting memory: {}", id);

    let record = state.service.get(&id).await?;
    Ok(Json(ApiResponse::ok("获取记忆成功", record)))
}

/// PUT /memories/:id
pub async fn update_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ApiJson(body): ApiJson<UpdateBody>,
) -> Result<impl IntoResponse, AppError> {
    debug!("Updating memory: {}", id);

    let record = state.service.update(&id, &body.data).await?;
    Ok(Json(ApiResponse::ok("记忆更新成功", record)))
}

/// DELETE /memories/:id
pub async fn delete_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    debug!("Deleting memory: {}", id);

    state.service.delete(&id).await?;
    Ok(Json(ApiResponse::<serde_json::Value>::empty(format!(
        "记忆 {} 删除成功",
        id
    ))))
}

/// 删除作用域内全部记忆
///
/// DELETE /memories
pub async fn delete_all_memories(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ScopeParams>,
) -> Result<impl IntoResponse, AppError> {
    let scope = params.scope();
    debug!(%scope, "Deleting all memories");

    let deleted = state.service.delete_all(&scope).await?;
    Ok(Json(ApiResponse::ok(
        format!("已删除 {} 条记忆 ({})", deleted, scope),
        json!({ "deleted": deleted }),
    )))
}

/// 单条记忆的变更历史
///
/// GET /memories/:id/history
pub async fn memory_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    debug!("Getting history of memory: {}", id);

    let events = state.service.history(&id)?;
    Ok(Json(ApiResponse::ok(
        format!("获取到 {} 条历史记录", events.len()),
        json!({ "history": events }),
    )))
}

/// 作用域内的全部记忆（与 GET /memories 相同的数据，放在 history 字段下）
///
/// GET /history
pub async fn list_history(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<ScopeParams>,
) -> Result<impl IntoResponse, AppError> {
    let scope = params.scope();
    let records = state.service.get_all(&scope, params.limit).await?;
    Ok(Json(ApiResponse::ok(
        format!("获取到 {} 条记忆记录", records.len()),
        json!({ "history": records }),
    )))
}
