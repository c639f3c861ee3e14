//! 错误处理模块
//!
//! 定义应用程序的错误类型，以及错误到统一响应信封的转换。

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// 应用程序错误类型
#[derive(Error, Debug)]
pub enum AppError {
    /// 资源不存在（记忆 ID、数据库文件等）
    #[error("资源不存在: {0}")]
    NotFound(String),

    /// 参数验证错误
    #[error("参数验证失败: {0}")]
    Validation(String),

    /// 存储层错误（向量库 / 图库 / 历史库）
    #[error("存储错误: {0}")]
    Store(String),

    /// 上游模型调用错误（LLM / Embedding）
    #[error("上游模型调用失败: {0}")]
    Upstream(String),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),

    /// 序列化错误
    #[error("序列化错误: {0}")]
    Serialization(String),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(String),

    /// 内部错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl AppError {
    /// 错误代码与 HTTP 状态码
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            AppError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            AppError::Upstream(_) => (StatusCode::BAD_GATEWAY, "UPSTREAM_ERROR"),
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR"),
            AppError::Serialization(_) => (StatusCode::BAD_REQUEST, "SERIALIZATION_ERROR"),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(e: std::io::Error) -> Self {
        AppError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(e: serde_json::Error) -> Self {
        AppError::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(e: rusqlite::Error) -> Self {
        AppError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(e: reqwest::Error) -> Self {
        AppError::Upstream(e.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        AppError::Validation(rejection.body_text())
    }
}

impl From<figment::Error> for AppError {
    fn from(e: figment::Error) -> Self {
        AppError::Config(e.to_string())
    }
}

/// 所有失败都渲染为统一信封 `{success:false, message, data:{error, code}}`
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.to_string();
        let body = Json(json!({
            "success": false,
            "message": message,
            "data": {
                "error": format!("{:?}", self),
                "code": code,
            }
        }));
        (status, body).into_response()
    }
}

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::NotFound("x".into()).status_and_code().0,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Validation("x".into()).status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Upstream("x".into()).status_and_code().1,
            "UPSTREAM_ERROR"
        );
    }

    #[tokio::test]
    async fn test_error_renders_envelope() {
        let response = AppError::NotFound("memory abc".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["success"], false);
        assert!(value["message"].as_str().unwrap().contains("memory abc"));
        assert_eq!(value["data"]["code"], "NOT_FOUND");
    }
}
