//! 图数据模型
//!
//! 实体节点按 (作用域, 名称) 唯一，关系边按 (源, 标签, 目标) 唯一，
//! 重复出现只增加 mentions 计数。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// 实体节点
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    /// 名称原样保存，不做大小写或空白归一化
    pub name: String,
    pub mentions: i64,
    pub created: String,
}

/// 关系边（带端点名称）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub source: String,
    pub relationship: String,
    pub destination: String,
    pub mentions: i64,
    pub created: String,
    pub updated: Option<String>,
}

/// 抽取出的关系三元组
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationTriple {
    pub source: String,
    pub relationship: String,
    #[serde(alias = "target")]
    pub destination: String,
}

impl RelationTriple {
    pub fn new(source: &str, relationship: &str, destination: &str) -> Self {
        Self {
            source: source.to_string(),
            relationship: relationship.to_string(),
            destination: destination.to_string(),
        }
    }
}

impl From<&Relation> for RelationTriple {
    fn from(r: &Relation) -> Self {
        Self::new(&r.source, &r.relationship, &r.destination)
    }
}

/// add 操作写入图库的结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphAddResult {
    pub added_entities: Vec<RelationTriple>,
}

/// 图库统计
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub nodes_count: u64,
    pub relationships_count: u64,
    pub users_count: u64,
    /// 全部节点 mentions 之和
    pub total_mentions: u64,
    pub relationship_types: BTreeMap<String, u64>,
}
