//! 记忆 DTO
//!
//! API 请求和响应的数据传输对象

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::memory::{MemoryType, Message, Scope};
use crate::services::{AddMemoryRequest, SearchRequest};

/// 未提供任何 ID 时使用的用户
pub const DEFAULT_USER_ID: &str = "default_user";

/// 统一响应信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T = serde_json::Value> {
    pub success: bool,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn empty(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }
}

/// 三个 ID 都缺省时回落到 default_user
fn resolve_scope(
    user_id: Option<String>,
    agent_id: Option<String>,
    run_id: Option<String>,
) -> Scope {
    let scope = Scope::new(user_id, agent_id, run_id);
    if scope.is_empty() {
        Scope::user(DEFAULT_USER_ID)
    } else {
        scope
    }
}

/// 添加记忆请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddMemoryBody {
    /// 对话消息列表
    pub messages: Vec<Message>,

    #[serde(default)]
    pub user_id: Option<String>,

    /// 过程记忆必须提供
    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub run_id: Option<String>,

    /// 是否经过 LLM 抽取事实
    #[serde(default)]
    pub infer: bool,

    /// 仅支持 "procedural_memory"
    #[serde(default)]
    pub memory_type: Option<String>,

    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,

    /// 过程记忆总结 prompt
    #[serde(default)]
    pub prompt: Option<String>,
}

impl AddMemoryBody {
    pub fn into_request(self) -> Result<AddMemoryRequest> {
        let memory_type = self
            .memory_type
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(str::parse::<MemoryType>)
            .transpose()?;

        Ok(AddMemoryRequest {
            messages: self.messages,
            scope: resolve_scope(self.user_id, self.agent_id, self.run_id),
            infer: self.infer,
            memory_type,
            metadata: self.metadata.unwrap_or_default(),
            prompt: self.prompt,
        })
    }
}

fn default_search_limit() -> usize {
    5
}

/// 搜索记忆请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchBody {
    pub query: String,

    #[serde(default)]
    pub user_id: Option<String>,

    #[serde(default)]
    pub agent_id: Option<String>,

    #[serde(default)]
    pub run_id: Option<String>,

    #[serde(default = "default_search_limit")]
    pub limit: usize,

    /// 最低相似度
    #[serde(default)]
    pub threshold: Option<f32>,
}

impl SearchBody {
    pub fn into_request(self) -> SearchRequest {
        SearchRequest {
            query: self.query,
            scope: resolve_scope(self.user_id, self.agent_id, self.run_id),
            limit: Some(self.limit),
            threshold: self.threshold,
        }
    }
}

/// 作用域查询参数（列表 / 删除全部 / 历史）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeParams {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

impl ScopeParams {
    pub fn scope(&self) -> Scope {
        resolve_scope(
            self.user_id.clone(),
            self.agent_id.clone(),
            self.run_id.clone(),
        )
    }
}

/// 更新记忆请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateBody {
    /// 新的记忆内容
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_add_body_defaults() {
        let body: AddMemoryBody = serde_json::from_str(
            r#"{"messages":[{"role":"user","content":"我喜欢吃苹果"}]}"#,
        )
        .unwrap();
        let request = body.into_request().unwrap();

        assert_eq!(request.scope, Scope::user(DEFAULT_USER_ID));
        assert!(!request.infer);
        assert_eq!(request.memory_type, None);
        assert!(request.metadata.is_empty());
    }

    #[test]
    fn test_agent_only_scope_does_not_fall_back() {
        let body: AddMemoryBody = serde_json::from_str(
            r#"{"messages":[],"agent_id":"planner","memory_type":"procedural_memory"}"#,
        )
        .unwrap();
        let request = body.into_request().unwrap();

        assert_eq!(request.scope.user_id, None);
        assert_eq!(request.scope.agent_id.as_deref(), Some("planner"));
        assert_eq!(request.memory_type, Some(MemoryType::Procedural));
    }

    #[test]
    fn test_unknown_memory_type_is_rejected() {
        let body: AddMemoryBody =
            serde_json::from_str(r#"{"messages":[],"memory_type":"episodic"}"#).unwrap();
        assert!(matches!(
            body.into_request().unwrap_err(),
            AppError::Validation(_)
        ));
    }

    #[test]
    fn test_search_body_default_limit() {
        let body: SearchBody =
            serde_json::from_str(r#"{"query":"我喜欢吃橘子吗","user_id":"user_001"}"#).unwrap();
        let request = body.into_request();

        assert_eq!(request.limit, Some(5));
        assert_eq!(request.scope, Scope::user("user_001"));
        assert_eq!(request.threshold, None);
    }
}
