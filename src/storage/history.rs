//! History Log
//!
//! 追加式事件账本，表结构与 mem0 的 `history` 表一致。写入只有 INSERT。

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, Row, params, params_from_iter, types::Value};
use tracing::debug;

use crate::config::SqliteStoreConfig;
use crate::error::Result;
use crate::models::history::{EventKind, HistoryEvent, HistoryQuery, HistoryStats};
use crate::storage::{format_timestamp, open_connection, parse_timestamp};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    id TEXT PRIMARY KEY,
    memory_id TEXT,
    old_memory TEXT,
    new_memory TEXT,
    event TEXT,
    created_at DATETIME,
    updated_at DATETIME,
    is_deleted INTEGER,
    actor_id TEXT,
    role TEXT
);
CREATE INDEX IF NOT EXISTS idx_history_memory_id ON history(memory_id);
CREATE INDEX IF NOT EXISTS idx_history_created_at ON history(created_at);
"#;

const COLUMNS: &str =
    "id, memory_id, old_memory, new_memory, event, created_at, updated_at, is_deleted, actor_id, role";

/// 历史库
#[derive(Clone)]
pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for HistoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryStore").finish_non_exhaustive()
    }
}

impl HistoryStore {
    pub fn open(config: &SqliteStoreConfig) -> Result<Self> {
        Self::from_connection(open_connection(config)?)
    }

    pub fn in_memory() -> Result<Self> {
        Self::open(&SqliteStoreConfig::Memory)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 追加一条事件
    pub fn append(&self, event: &HistoryEvent) -> Result<()> {
        debug!(
            memory_id = %event.memory_id,
            event = %event.event,
            "Appending history event"
        );
        let conn = self.conn.lock();
        conn.execute(
            &format!(
                "INSERT INTO history ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                COLUMNS
            ),
            params![
                event.id,
                event.memory_id,
                event.old_memory,
                event.new_memory,
                event.event.as_str(),
                format_timestamp(&event.created_at),
                event.updated_at.as_ref().map(format_timestamp),
                event.is_deleted as i64,
                event.actor_id,
                event.role,
            ],
        )?;
        Ok(())
    }

    /// 按条件查询，按创建时间倒序
    pub fn query(&self, query: &HistoryQuery) -> Result<Vec<HistoryEvent>> {
        let mut sql = format!("SELECT {} FROM history", COLUMNS);
        let mut conditions = Vec::new();
        let mut values: Vec<Value> = Vec::new();

        if let Some(event) = query.event {
            values.push(Value::Text(event.as_str().to_string()));
            conditions.push(format!("event = ?{}", values.len()));
        }
        if let Some(memory_id) = &query.memory_id {
            values.push(Value::Text(memory_id.clone()));
            conditions.push(format!("memory_id = ?{}", values.len()));
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at DESC, rowid DESC");
        if let Some(limit) = query.limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_event).collect()
    }

    /// 单条记忆的全部事件，按时间正序
    pub fn for_memory(&self, memory_id: &str) -> Result<Vec<HistoryEvent>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM history WHERE memory_id = ?1 ORDER BY created_at ASC, rowid ASC",
            COLUMNS
        ))?;
        let rows = stmt
            .query_map(params![memory_id], RawRow::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.into_iter().map(RawRow::into_event).collect()
    }

    pub fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// 总数、删除数、各事件类型数量
    pub fn stats(&self) -> Result<HistoryStats> {
        let conn = self.conn.lock();
        let total: i64 = conn.query_row("SELECT COUNT(*) FROM history", [], |row| row.get(0))?;
        let deleted: i64 = conn.query_row(
            "SELECT COUNT(*) FROM history WHERE is_deleted = 1",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare("SELECT event, COUNT(*) FROM history GROUP BY event")?;
        let event_counts = stmt
            .query_map([], |row| {
                let event: Option<String> = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok((event.unwrap_or_else(|| "unknown".to_string()), count as u64))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(HistoryStats {
            total_records: total as u64,
            deleted_records: deleted as u64,
            event_counts,
        })
    }

    /// 让后续写入失败，用于验证跨库补偿
    #[cfg(test)]
    pub(crate) fn break_writes(&self) {
        let conn = self.conn.lock();
        conn.execute_batch("DROP TABLE history").expect("drop history table");
    }
}

/// SQLite 行的原始形态，时间戳与事件类型在锁外解析
struct RawRow {
    id: String,
    memory_id: String,
    old_memory: Option<String>,
    new_memory: Option<String>,
    event: String,
    created_at: String,
    updated_at: Option<String>,
    is_deleted: i64,
    actor_id: Option<String>,
    role: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            memory_id: row.get(1)?,
            old_memory: row.get(2)?,
            new_memory: row.get(3)?,
            event: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            is_deleted: row.get::<_, Option<i64>>(7)?.unwrap_or(0),
            actor_id: row.get(8)?,
            role: row.get(9)?,
        })
    }

    fn into_event(self) -> Result<HistoryEvent> {
        Ok(HistoryEvent {
            id: self.id,
            memory_id: self.memory_id,
            old_memory: self.old_memory,
            new_memory: self.new_memory,
            event: self.event.parse::<EventKind>()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: self
                .updated_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            is_deleted: self.is_deleted != 0,
            actor_id: self.actor_id,
            role: self.role,
        })
    }
}
