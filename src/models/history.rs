//! 历史事件模型
//!
//! 追加式账本：每次 ADD / UPDATE / DELETE 都写入一行，已写入的行不会被修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AppError, Result};

/// 事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    Add,
    Update,
    Delete,
    /// 合并阶段判定无需变更，不会写入历史库
    None,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "ADD",
            EventKind::Update => "UPDATE",
            EventKind::Delete => "DELETE",
            EventKind::None => "NONE",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ADD" => Ok(EventKind::Add),
            "UPDATE" => Ok(EventKind::Update),
            "DELETE" => Ok(EventKind::Delete),
            "NONE" => Ok(EventKind::None),
            other => Err(AppError::Validation(format!("未知事件类型: {}", other))),
        }
    }
}

/// 历史事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub id: String,
    pub memory_id: String,
    pub old_memory: Option<String>,
    pub new_memory: Option<String>,
    pub event: EventKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub actor_id: Option<String>,
    pub role: Option<String>,
}

impl HistoryEvent {
    fn base(memory_id: &str, event: EventKind) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            memory_id: memory_id.to_string(),
            old_memory: None,
            new_memory: None,
            event,
            created_at: Utc::now(),
            updated_at: None,
            is_deleted: false,
            actor_id: None,
            role: None,
        }
    }

    pub fn added(memory_id: &str, text: &str) -> Self {
        Self {
            new_memory: Some(text.to_string()),
            ..Self::base(memory_id, EventKind::Add)
        }
    }

    pub fn updated(memory_id: &str, old_text: &str, new_text: &str) -> Self {
        let now = Utc::now();
        Self {
            old_memory: Some(old_text.to_string()),
            new_memory: Some(new_text.to_string()),
            created_at: now,
            updated_at: Some(now),
            ..Self::base(memory_id, EventKind::Update)
        }
    }

    pub fn deleted(memory_id: &str, old_text: &str) -> Self {
        Self {
            old_memory: Some(old_text.to_string()),
            is_deleted: true,
            ..Self::base(memory_id, EventKind::Delete)
        }
    }

    pub fn with_actor(mut self, actor_id: Option<String>, role: Option<String>) -> Self {
        self.actor_id = actor_id;
        self.role = role;
        self
    }
}

/// 历史查询条件，所有条件以 AND 组合
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub event: Option<EventKind>,
    pub memory_id: Option<String>,
    pub limit: Option<usize>,
}

/// 历史库统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total_records: u64,
    pub deleted_records: u64,
    pub event_counts: BTreeMap<String, u64>,
}
