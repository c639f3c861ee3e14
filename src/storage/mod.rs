//! 存储模块
//!
//! 历史库与图库都基于 SQLite，连接由 `parking_lot::Mutex` 串行化访问。

pub mod graph;
pub mod history;

pub use graph::GraphStore;
pub use history::HistoryStore;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tracing::info;

use crate::config::SqliteStoreConfig;
use crate::error::{AppError, Result};

/// 按配置打开 SQLite 连接，文件模式下自动创建父目录
pub fn open_connection(config: &SqliteStoreConfig) -> Result<Connection> {
    let conn = match config {
        SqliteStoreConfig::Sqlite { path } => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            info!("Opening SQLite store at {}", path.display());
            Connection::open(path)?
        }
        SqliteStoreConfig::Memory => Connection::open_in_memory()?,
    };
    // 内存库会回落为 "memory" 模式
    let _mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    Ok(conn)
}

/// 定宽 RFC3339 时间戳（微秒、UTC），保证按字符串排序即按时间排序
pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::Store(format!("无效时间戳 '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let text = format_timestamp(&now);
        let parsed = parse_timestamp(&text).unwrap();
        assert_eq!(parsed.timestamp_micros(), now.timestamp_micros());
        assert!(text.ends_with('Z'));
    }

    #[test]
    fn test_open_file_store_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/history/history.db");
        let conn = open_connection(&SqliteStoreConfig::Sqlite { path: path.clone() }).unwrap();
        drop(conn);
        assert!(path.exists());
    }
}
