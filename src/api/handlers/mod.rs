//! Handlers 模块
//!
//! HTTP 请求处理程序。

pub mod dashboard_handler;
pub mod memory_handler;
pub mod system_handler;

pub use dashboard_handler::*;
pub use memory_handler::*;
pub use system_handler::*;
