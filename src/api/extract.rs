//! 请求提取器
//!
//! 包装 axum 的 `Json` / `Query`，解析失败时返回统一的错误信封而不是纯文本。

use axum::extract::{FromRequest, FromRequestParts};

use crate::error::AppError;

/// JSON 请求体
#[derive(Debug, FromRequest)]
#[from_request(via(axum::Json), rejection(AppError))]
pub struct ApiJson<T>(pub T);

/// 查询字符串参数
#[derive(Debug, FromRequestParts)]
#[from_request(via(axum::extract::Query), rejection(AppError))]
pub struct ApiQuery<T>(pub T);
