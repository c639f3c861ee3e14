//! 记忆数据模型
//!
//! 一条记忆（事实）归属于 (user_id, agent_id, run_id) 作用域，
//! 在向量库中以 embedding + payload 的形式保存。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};
use crate::models::history::EventKind;

/// 作用域：用于隔离三个存储中的数据
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Scope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl Scope {
    /// 仅包含 user_id 的作用域
    pub fn user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            ..Default::default()
        }
    }

    pub fn new(user_id: Option<String>, agent_id: Option<String>, run_id: Option<String>) -> Self {
        fn non_empty(v: Option<String>) -> Option<String> {
            v.filter(|s| !s.trim().is_empty())
        }
        Self {
            user_id: non_empty(user_id),
            agent_id: non_empty(agent_id),
            run_id: non_empty(run_id),
        }
    }

    pub fn with_agent(mut self, agent_id: &str) -> Self {
        self.agent_id = Some(agent_id.to_string());
        self
    }

    pub fn with_run(mut self, run_id: &str) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.user_id.is_none() && self.agent_id.is_none() && self.run_id.is_none()
    }

    /// 至少需要一个 ID
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(AppError::Validation(
                "至少需要提供 user_id、agent_id 或 run_id 之一".to_string(),
            ));
        }
        Ok(())
    }

    /// 作为过滤条件：self 中设置的每个 ID 都必须与 other 相等
    pub fn matches(&self, other: &Scope) -> bool {
        fn field_matches(filter: &Option<String>, value: &Option<String>) -> bool {
            match filter {
                Some(f) => value.as_deref() == Some(f.as_str()),
                None => true,
            }
        }
        field_matches(&self.user_id, &other.user_id)
            && field_matches(&self.agent_id, &other.agent_id)
            && field_matches(&self.run_id, &other.run_id)
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "user={} agent={} run={}",
            self.user_id.as_deref().unwrap_or("-"),
            self.agent_id.as_deref().unwrap_or("-"),
            self.run_id.as_deref().unwrap_or("-")
        )
    }
}

/// 记忆类型标签
///
/// 只有 `procedural_memory` 一种取值，普通事实记忆不带标签。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryType {
    #[serde(rename = "procedural_memory")]
    Procedural,
}

impl std::fmt::Display for MemoryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemoryType::Procedural => write!(f, "procedural_memory"),
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "procedural_memory" => Ok(MemoryType::Procedural),
            other => Err(AppError::Validation(format!(
                "不支持的 memory_type: {}，可选值为 'procedural_memory'",
                other
            ))),
        }
    }
}

/// 对话消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// 消息角色：user / assistant / system
    pub role: String,
    /// 消息内容
    pub content: String,
    /// 发言者名称，写入历史记录的 actor_id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
            name: None,
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
            name: None,
        }
    }

    pub fn is_system(&self) -> bool {
        self.role.eq_ignore_ascii_case("system")
    }
}

/// 将消息列表拼接成 "role: content" 形式的对话文本
pub fn format_conversation(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !m.is_system())
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// 内容哈希，用于重复检测
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// 核心记忆结构
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// 记忆唯一标识
    pub id: String,
    /// 记忆文本
    pub memory: String,
    /// 文本哈希
    pub hash: String,
    #[serde(flatten)]
    pub scope: Scope,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// 墓碑标记（逻辑删除）
    #[serde(default, skip_serializing)]
    pub deleted: bool,
}

impl MemoryRecord {
    /// 创建新记忆
    pub fn new(scope: Scope, text: &str, embedding: Vec<f32>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            memory: text.to_string(),
            hash: content_hash(text),
            scope,
            embedding,
            created_at: Utc::now(),
            updated_at: None,
            memory_type: None,
            metadata: serde_json::Map::new(),
            deleted: false,
        }
    }

    pub fn with_memory_type(mut self, memory_type: Option<MemoryType>) -> Self {
        self.memory_type = memory_type;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Map<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    /// 原地改写文本与向量
    pub fn rewrite(&mut self, text: &str, embedding: Vec<f32>) {
        self.memory = text.to_string();
        self.hash = content_hash(text);
        self.embedding = embedding;
        self.updated_at = Some(Utc::now());
    }

    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.updated_at = Some(Utc::now());
    }
}

/// 带相似度分数的记忆（搜索结果）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    #[serde(flatten)]
    pub record: MemoryRecord,
    pub score: f32,
}

/// add 操作对单条记忆造成的变化
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub id: String,
    pub memory: String,
    pub event: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_memory: Option<String>,
}
