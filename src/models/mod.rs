//! 数据模型模块

pub mod graph;
pub mod history;
pub mod memory;

pub use graph::{Entity, GraphAddResult, GraphStats, Relation, RelationTriple};
pub use history::{EventKind, HistoryEvent, HistoryQuery, HistoryStats};
pub use memory::{
    MemoryEvent, MemoryRecord, MemoryType, Message, Scope, ScoredMemory, content_hash,
    format_conversation,
};
