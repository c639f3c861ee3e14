//! Memory Routes
//!
//! 定义记忆相关的 API 路由。

use axum::{
    Router,
    routing::{get, post},
};

use crate::api::app_state::AppState;
use crate::api::handlers::memory_handler::*;

/// 创建记忆路由器
pub fn create_memory_router() -> Router<AppState> {
    Router::new()
        .route(
            "/memories",
            get(list_memories)
                .post(add_memory)
                .delete(delete_all_memories),
        )
        .route("/memories/search", post(search_memories))
        .route(
            "/memories/:id",
            get(get_memory).put(update_memory).delete(delete_memory),
        )
        .route("/memories/:id/history", get(memory_history))
        .route("/history", get(list_history))
}
