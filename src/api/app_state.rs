//! 应用状态
//!
//! 进程启动时构建一次，通过 axum `State` 注入所有 handler。

use std::sync::Arc;

use crate::observability::AppMetrics;
use crate::services::MemoryService;

/// 应用状态
#[derive(Clone)]
pub struct AppState {
    /// 记忆服务（持有三个存储的句柄）
    pub service: Arc<MemoryService>,
    /// 请求指标
    pub metrics: AppMetrics,
    /// 服务名称，展示在根路径
    pub app_name: String,
}

impl AppState {
    pub fn new(service: Arc<MemoryService>, app_name: &str) -> Self {
        Self {
            service,
            metrics: AppMetrics::default(),
            app_name: app_name.to_string(),
        }
    }
}
