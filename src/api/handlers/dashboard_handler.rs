//! Dashboard Handlers
//!
//! 只读的调试面板：直接查看历史库、向量库和图库中的原始数据。

use axum::{Json, extract::State, response::IntoResponse};
use serde_json::json;
use tracing::debug;

use crate::{
    api::{app_state::AppState, dto::dashboard_dto::*, extract::ApiQuery},
    error::AppError,
    index::ScrollRequest,
    models::history::{EventKind, HistoryQuery},
    storage::GraphStore,
};

/// GET /query/db
pub async fn query_history(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<HistoryParams>,
) -> Result<impl IntoResponse, AppError> {
    debug!(?params, "Querying history table");

    let query = HistoryQuery {
        event: params
            .event
            .as_deref()
            .filter(|e| !e.is_empty())
            .map(str::parse::<EventKind>)
            .transpose()?,
        memory_id: params.memory_id.filter(|m| !m.is_empty()),
        limit: params.limit,
    };
    let events = state.service.history_store().query(&query)?;

    Ok(Json(json!({
        "success": true,
        "count": events.len(),
        "data": events,
    })))
}

/// GET /query/db/stats
pub async fn history_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let stats = state.service.history_store().stats()?;
    Ok(Json(json!({
        "success": true,
        "statistics": stats,
    })))
}

/// GET /query/vectordb
pub async fn query_vectors(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<VectorParams>,
) -> Result<impl IntoResponse, AppError> {
    debug!(?params, "Querying vector index");
    if params.limit == 0 {
        return Err(AppError::Validation("limit 必须大于 0".to_string()));
    }

    let index = state.service.vector_index();
    let info = index.info().await?;
    let page = index
        .scroll(ScrollRequest {
            filter: params.filter(),
            limit: params.limit,
            offset: params.offset.clone(),
            with_vectors: params.include_vectors,
            include_deleted: params.include_deleted,
        })
        .await?;

    let points: Vec<PointView> = page
        .points
        .into_iter()
        .map(|p| PointView::new(p, params.include_vectors))
        .collect();

    Ok(Json(json!({
        "success": true,
        "count": points.len(),
        "next_offset": page.next_offset,
        "collection_info": info,
        "data": points,
    })))
}

/// GET /query/vectordb/stats
pub async fn vector_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let info = state.service.vector_index().info().await?;
    Ok(Json(json!({
        "success": true,
        "statistics": {
            "collection_name": info.name,
            "points_count": info.points_count,
            "config": {
                "vector_size": info.dimension,
                "distance": info.distance,
            },
        },
    })))
}

fn graph_store(state: &AppState) -> Result<&GraphStore, AppError> {
    state
        .service
        .graph_store()
        .ok_or_else(|| AppError::NotFound("图存储未启用".to_string()))
}

/// GET /query/graphdb
pub async fn query_graph(
    State(state): State<AppState>,
    ApiQuery(params): ApiQuery<GraphParams>,
) -> Result<impl IntoResponse, AppError> {
    debug!(?params, "Querying graph store");
    let graph = graph_store(&state)?;
    let filter = params.filter();

    let nodes = graph.entities(filter.as_ref(), params.limit)?;
    let relationships = graph.relations(filter.as_ref(), params.limit)?;

    Ok(Json(json!({
        "success": true,
        "nodes_count": nodes.len(),
        "relationships_count": relationships.len(),
        "data": {
            "nodes": nodes,
            "relationships": relationships,
        },
    })))
}

/// GET /query/graphdb/stats
pub async fn graph_stats(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let stats = graph_store(&state)?.stats()?;
    Ok(Json(json!({
        "success": true,
        "statistics": stats,
    })))
}
