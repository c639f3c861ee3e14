//! KeMem - 多存储的 Agent 记忆服务
//!
//! 为 AI Agent 提供持久化的长期记忆：事实保存在向量索引中用于语义检索，
//! 实体关系保存在图索引中，每次变更都追加到 SQLite 历史账本。

pub mod api;
pub mod config;
pub mod error;
pub mod index;
pub mod llm;
pub mod models;
pub mod observability;
pub mod services;
pub mod storage;
