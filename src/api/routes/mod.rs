//! Routes 模块
//!
//! 定义 API 路由。

pub mod dashboard_routes;
pub mod memory_routes;
pub mod system_routes;
