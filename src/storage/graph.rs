//! Graph Index
//!
//! 实体与关系保存在两张表中：`entity` 节点表和 `connected_to` 边表。
//! 节点按 (作用域, 名称) 唯一，边按 (源, 标签, 目标) 唯一，重复写入只累加 mentions。
//! 缺省的作用域 ID 以空串入库，保证唯一键对 NULL 同样生效。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, Row, params, params_from_iter, types::Value};
use tracing::debug;

use crate::config::SqliteStoreConfig;
use crate::error::{AppError, Result};
use crate::models::graph::{Entity, GraphStats, Relation, RelationTriple};
use crate::models::memory::Scope;
use crate::storage::{format_timestamp, open_connection};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS entity (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id TEXT NOT NULL DEFAULT '',
    agent_id TEXT NOT NULL DEFAULT '',
    run_id TEXT NOT NULL DEFAULT '',
    name TEXT NOT NULL,
    mentions INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    embedding BLOB,
    UNIQUE (user_id, agent_id, run_id, name)
);
CREATE TABLE IF NOT EXISTS connected_to (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source_id INTEGER NOT NULL REFERENCES entity(id),
    destination_id INTEGER NOT NULL REFERENCES entity(id),
    name TEXT NOT NULL,
    mentions INTEGER NOT NULL DEFAULT 0,
    created TEXT NOT NULL,
    updated TEXT,
    UNIQUE (source_id, name, destination_id)
);
CREATE INDEX IF NOT EXISTS idx_entity_user ON entity(user_id);
CREATE INDEX IF NOT EXISTS idx_connected_to_destination ON connected_to(destination_id);
"#;

const RELATION_SELECT: &str = r#"
SELECT s.name, r.name, d.name, r.mentions, r.created, r.updated
FROM connected_to r
JOIN entity s ON s.id = r.source_id
JOIN entity d ON d.id = r.destination_id
"#;

/// 图库
#[derive(Clone)]
pub struct GraphStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphStore").finish_non_exhaustive()
    }
}

fn key(id: &Option<String>) -> &str {
    id.as_deref().unwrap_or("")
}

fn non_empty(raw: String) -> Option<String> {
    if raw.is_empty() { None } else { Some(raw) }
}

/// 作用域过滤：只为已设置的 ID 生成条件
fn scope_conditions(alias: &str, scope: &Scope, values: &mut Vec<Value>) -> Vec<String> {
    let mut conditions = Vec::new();
    for (column, id) in [
        ("user_id", &scope.user_id),
        ("agent_id", &scope.agent_id),
        ("run_id", &scope.run_id),
    ] {
        if let Some(id) = id {
            values.push(Value::Text(id.clone()));
            conditions.push(format!("{}.{} = ?{}", alias, column, values.len()));
        }
    }
    conditions
}

fn where_clause(conditions: &[String]) -> String {
    if conditions.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", conditions.join(" AND "))
    }
}

fn entity_from_row(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: row.get(0)?,
        user_id: non_empty(row.get(1)?),
        agent_id: non_empty(row.get(2)?),
        run_id: non_empty(row.get(3)?),
        name: row.get(4)?,
        mentions: row.get(5)?,
        created: row.get(6)?,
    })
}

fn relation_from_row(row: &Row<'_>) -> rusqlite::Result<Relation> {
    Ok(Relation {
        source: row.get(0)?,
        relationship: row.get(1)?,
        destination: row.get(2)?,
        mentions: row.get(3)?,
        created: row.get(4)?,
        updated: row.get(5)?,
    })
}

fn upsert_entity_in(conn: &Connection, scope: &Scope, name: &str, now: &str) -> Result<Entity> {
    let entity = conn.query_row(
        r#"
        INSERT INTO entity (user_id, agent_id, run_id, name, mentions, created)
        VALUES (?1, ?2, ?3, ?4, 1, ?5)
        ON CONFLICT (user_id, agent_id, run_id, name)
        DO UPDATE SET mentions = mentions + 1
        RETURNING id, user_id, agent_id, run_id, name, mentions, created
        "#,
        params![
            key(&scope.user_id),
            key(&scope.agent_id),
            key(&scope.run_id),
            name,
            now
        ],
        entity_from_row,
    )?;
    Ok(entity)
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(AppError::Validation(format!("{} 名称不能为空", kind)));
    }
    Ok(())
}

impl GraphStore {
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

    /// 写入（或强化）单个实体
    pub fn upsert_entity(&self, scope: &Scope, name: &str) -> Result<Entity> {
        check_name("实体", name)?;
        let now = format_timestamp(&Utc::now());
        let conn = self.conn.lock();
        upsert_entity_in(&conn, scope, name, &now)
    }

    /// 写入（或强化）一条关系，两个端点各自 mentions + 1
    pub fn upsert_relation(&self, scope: &Scope, triple: &RelationTriple) -> Result<Relation> {
        check_name("实体", &triple.source)?;
        check_name("实体", &triple.destination)?;
        check_name("关系", &triple.relationship)?;

        let now = format_timestamp(&Utc::now());
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let source = upsert_entity_in(&tx, scope, &triple.source, &now)?;
        let destination = upsert_entity_in(&tx, scope, &triple.destination, &now)?;

        let (mentions, created, updated) = tx.query_row(
            r#"
            INSERT INTO connected_to (source_id, destination_id, name, mentions, created)
            VALUES (?1, ?2, ?3, 1, ?4)
            ON CONFLICT (source_id, name, destination_id)
            DO UPDATE SET mentions = mentions + 1, updated = excluded.created
            RETURNING mentions, created, updated
            "#,
            params![source.id, destination.id, triple.relationship, now],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?;
        tx.commit()?;

        debug!(
            source = %triple.source,
            relationship = %triple.relationship,
            destination = %triple.destination,
            mentions,
            "Upserted graph relation"
        );

        Ok(Relation {
            source: source.name,
            relationship: triple.relationship.clone(),
            destination: destination.name,
            mentions,
            created,
            updated,
        })
    }

    /// 列出节点，scope 为 None 时返回全部
    pub fn entities(&self, scope: Option<&Scope>, limit: Option<usize>) -> Result<Vec<Entity>> {
        let mut values = Vec::new();
        let conditions = scope
            .map(|s| scope_conditions("e", s, &mut values))
            .unwrap_or_default();
        let mut sql = format!(
            "SELECT e.id, e.user_id, e.agent_id, e.run_id, e.name, e.mentions, e.created FROM entity e{} ORDER BY e.id",
            where_clause(&conditions)
        );
        if let Some(limit) = limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let entities = stmt
            .query_map(params_from_iter(values.iter()), entity_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entities)
    }

    /// 列出关系边（作用域按源节点判断）
    pub fn relations(&self, scope: Option<&Scope>, limit: Option<usize>) -> Result<Vec<Relation>> {
        let mut values = Vec::new();
        let conditions = scope
            .map(|s| scope_conditions("s", s, &mut values))
            .unwrap_or_default();
        let mut sql = format!("{}{} ORDER BY r.id", RELATION_SELECT, where_clause(&conditions));
        if let Some(limit) = limit {
            values.push(Value::Integer(limit as i64));
            sql.push_str(&format!(" LIMIT ?{}", values.len()));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let relations = stmt
            .query_map(params_from_iter(values.iter()), relation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(relations)
    }

    /// 作用域内、源或目标名称命中 names 的关系
    pub fn relations_for_entities(&self, scope: &Scope, names: &[String]) -> Result<Vec<Relation>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }

        let mut values = Vec::new();
        let mut conditions = scope_conditions("s", scope, &mut values);

        let mut placeholders = Vec::with_capacity(names.len());
        for name in names {
            values.push(Value::Text(name.clone()));
            placeholders.push(format!("?{}", values.len()));
        }
        let list = placeholders.join(", ");
        conditions.push(format!("(s.name IN ({list}) OR d.name IN ({list}))"));

        let sql = format!(
            "{}{} ORDER BY r.mentions DESC, r.id",
            RELATION_SELECT,
            where_clause(&conditions)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let relations = stmt
            .query_map(params_from_iter(values.iter()), relation_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(relations)
    }

    /// 节点数、边数、用户数、mentions 总和、各关系标签数量
    pub fn stats(&self) -> Result<GraphStats> {
        let total_mentions = self.mention_total(&Scope::default())?;
        let conn = self.conn.lock();
        let nodes: i64 = conn.query_row("SELECT COUNT(*) FROM entity", [], |row| row.get(0))?;
        let edges: i64 =
            conn.query_row("SELECT COUNT(*) FROM connected_to", [], |row| row.get(0))?;
        let users: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT user_id) FROM entity WHERE user_id != ''",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare("SELECT name, COUNT(*) FROM connected_to GROUP BY name")?;
        let relationship_types = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;

        Ok(GraphStats {
            nodes_count: nodes as u64,
            relationships_count: edges as u64,
            users_count: users as u64,
            total_mentions: total_mentions as u64,
            relationship_types,
        })
    }

    /// 作用域内所有节点的 mentions 之和
    pub fn mention_total(&self, scope: &Scope) -> Result<i64> {
        let mut values = Vec::new();
        let conditions = scope_conditions("e", scope, &mut values);
        let sql = format!(
            "SELECT COALESCE(SUM(e.mentions), 0) FROM entity e{}",
            where_clause(&conditions)
        );
        let conn = self.conn.lock();
        let total = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(total)
    }

    /// 删除作用域内的全部节点及其关联的边，返回删除的节点数
    pub fn delete_scope(&self, scope: &Scope) -> Result<usize> {
        scope.validate()?;

        let mut values = Vec::new();
        let conditions = scope_conditions("e", scope, &mut values);
        let ids_sql = format!("SELECT e.id FROM entity e{}", where_clause(&conditions));

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let edges = tx.execute(
            &format!(
                "DELETE FROM connected_to WHERE source_id IN ({ids_sql}) OR destination_id IN ({ids_sql})"
            ),
            params_from_iter(values.iter()),
        )?;
        let nodes = tx.execute(
            &format!("DELETE FROM entity WHERE id IN ({ids_sql})"),
            params_from_iter(values.iter()),
        )?;
        tx.commit()?;

        debug!(%scope, nodes, edges, "Deleted graph scope");
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn likes(source: &str, destination: &str) -> RelationTriple {
        RelationTriple::new(source, "likes", destination)
    }

    #[test]
    fn test_upsert_entity_increments_mentions() {
        let store = GraphStore::in_memory().unwrap();
        let scope = Scope::user("user_001");

        let first = store.upsert_entity(&scope, "苹果").unwrap();
        let second = store.upsert_entity(&scope, "苹果").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.mentions, 1);
        assert_eq!(second.mentions, 2);
        assert_eq!(store.entities(Some(&scope), None).unwrap().len(), 1);
    }

    #[rstest]
    #[case(1)]
    #[case(3)]
    #[case(7)]
    fn test_repeated_relation_reinforces(#[case] times: i64) {
        let store = GraphStore::in_memory().unwrap();
        let scope = Scope::user("user_001");

        let mut last = None;
        for _ in 0..times {
            last = Some(store.upsert_relation(&scope, &likes("user_001", "苹果")).unwrap());
        }
        let relation = last.unwrap();

        assert_eq!(relation.mentions, times);
        assert_eq!(relation.updated.is_some(), times > 1);

        let entities = store.entities(Some(&scope), None).unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.mentions == times));
        assert_eq!(store.relations(Some(&scope), None).unwrap().len(), 1);
        assert_eq!(store.mention_total(&scope).unwrap(), times * 2);
    }

    #[test]
    fn test_names_are_not_normalized() {
        let store = GraphStore::in_memory().unwrap();
        let scope = Scope::user("u");

        store.upsert_entity(&scope, "Apple").unwrap();
        store.upsert_entity(&scope, "apple").unwrap();
        store.upsert_entity(&scope, "apple ").unwrap();

        assert_eq!(store.entities(Some(&scope), None).unwrap().len(), 3);
    }

    #[test]
    fn test_scopes_are_isolated() {
        let store = GraphStore::in_memory().unwrap();
        let alice = Scope::user("alice");
        let bob = Scope::user("bob");
        let bob_agent = Scope::user("bob").with_agent("helper");

        store.upsert_relation(&alice, &likes("alice", "苹果")).unwrap();
        store.upsert_relation(&bob, &likes("bob", "苹果")).unwrap();
        store.upsert_relation(&bob_agent, &likes("bob", "香蕉")).unwrap();

        assert_eq!(store.entities(Some(&alice), None).unwrap().len(), 2);
        // 只设置 user_id 的过滤条件同时命中带 agent_id 的节点
        assert_eq!(store.relations(Some(&bob), None).unwrap().len(), 2);
        assert_eq!(store.relations(Some(&bob_agent), None).unwrap().len(), 1);
        assert_eq!(store.relations(None, None).unwrap().len(), 3);

        let stats = store.stats().unwrap();
        assert_eq!(stats.users_count, 2);
        assert_eq!(stats.relationships_count, 3);
        assert_eq!(stats.relationship_types.get("likes"), Some(&3));
        assert_eq!(stats.total_mentions, 6);
        assert_eq!(store.mention_total(&bob).unwrap(), 4);
    }

    #[test]
    fn test_relations_for_entities_matches_either_endpoint() {
        let store = GraphStore::in_memory().unwrap();
        let scope = Scope::user("user_001");

        store.upsert_relation(&scope, &likes("user_001", "苹果")).unwrap();
        store
            .upsert_relation(&scope, &RelationTriple::new("苹果", "is", "甜"))
            .unwrap();
        store.upsert_relation(&scope, &likes("user_001", "香蕉")).unwrap();

        let hits = store
            .relations_for_entities(&scope, &["苹果".to_string()])
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|r| r.source == "苹果" || r.destination == "苹果"));

        let other = store
            .relations_for_entities(&Scope::user("someone_else"), &["苹果".to_string()])
            .unwrap();
        assert!(other.is_empty());
        assert!(store.relations_for_entities(&scope, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_delete_scope_removes_nodes_and_edges() {
        let store = GraphStore::in_memory().unwrap();
        let alice = Scope::user("alice");
        let bob = Scope::user("bob");

        store.upsert_relation(&alice, &likes("alice", "苹果")).unwrap();
        store.upsert_relation(&bob, &likes("bob", "苹果")).unwrap();

        assert_eq!(store.delete_scope(&alice).unwrap(), 2);
        assert!(store.entities(Some(&alice), None).unwrap().is_empty());
        assert!(store.relations(Some(&alice), None).unwrap().is_empty());
        assert_eq!(store.relations(Some(&bob), None).unwrap().len(), 1);

        assert!(store.delete_scope(&Scope::default()).is_err());
    }

    #[test]
    fn test_empty_names_rejected() {
        let store = GraphStore::in_memory().unwrap();
        let err = store
            .upsert_relation(&Scope::user("u"), &RelationTriple::new("a", " ", "b"))
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }
}
