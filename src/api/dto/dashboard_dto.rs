//! 调试面板 DTO

use serde::{Deserialize, Serialize};

use crate::index::{VectorPayload, VectorPoint};
use crate::models::memory::Scope;

/// 超过该维度的向量只返回摘要
pub const FULL_VECTOR_MAX_DIM: usize = 100;

fn default_vector_limit() -> usize {
    100
}

/// GET /query/db
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<usize>,
    pub event: Option<String>,
    pub memory_id: Option<String>,
}

/// GET /query/vectordb
#[derive(Debug, Clone, Deserialize)]
pub struct VectorParams {
    #[serde(default = "default_vector_limit")]
    pub limit: usize,
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    #[serde(default)]
    pub include_vectors: bool,
    /// 同时列出已逻辑删除的点
    #[serde(default)]
    pub include_deleted: bool,
    /// 上一页返回的 next_offset
    pub offset: Option<String>,
}

impl VectorParams {
    pub fn filter(&self) -> Option<Scope> {
        let scope = Scope::new(
            self.user_id.clone(),
            self.agent_id.clone(),
            self.run_id.clone(),
        );
        (!scope.is_empty()).then_some(scope)
    }
}

/// GET /query/graphdb
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GraphParams {
    pub user_id: Option<String>,
    pub agent_id: Option<String>,
    pub run_id: Option<String>,
    pub limit: Option<usize>,
}

impl GraphParams {
    pub fn filter(&self) -> Option<Scope> {
        let scope = Scope::new(
            self.user_id.clone(),
            self.agent_id.clone(),
            self.run_id.clone(),
        );
        (!scope.is_empty()).then_some(scope)
    }
}

/// 向量摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorSummary {
    pub dimension: usize,
    pub first_5_values: Vec<f32>,
    pub full_vector: Option<Vec<f32>>,
}

impl VectorSummary {
    pub fn of(vector: &[f32]) -> Self {
        Self {
            dimension: vector.len(),
            first_5_values: vector.iter().take(5).copied().collect(),
            full_vector: (vector.len() <= FULL_VECTOR_MAX_DIM).then(|| vector.to_vec()),
        }
    }
}

/// 面板中展示的向量点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PointView {
    pub id: String,
    pub payload: VectorPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vector: Option<VectorSummary>,
}

impl PointView {
    pub fn new(point: VectorPoint, include_vector: bool) -> Self {
        let vector = (include_vector && !point.vector.is_empty())
            .then(|| VectorSummary::of(&point.vector));
        Self {
            id: point.id,
            payload: point.payload,
            vector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_vector_keeps_full_values() {
        let summary = VectorSummary::of(&[0.1, 0.2, 0.3]);
        assert_eq!(summary.dimension, 3);
        assert_eq!(summary.first_5_values, vec![0.1, 0.2, 0.3]);
        assert_eq!(summary.full_vector, Some(vec![0.1, 0.2, 0.3]));
    }

    #[test]
    fn test_large_vector_is_summarised() {
        let vector = vec![0.5; 1536];
        let summary = VectorSummary::of(&vector);
        assert_eq!(summary.dimension, 1536);
        assert_eq!(summary.first_5_values.len(), 5);
        assert_eq!(summary.full_vector, None);
    }

    #[test]
    fn test_vector_params_defaults() {
        let params: VectorParams = serde_json::from_str("{}").unwrap();
        assert_eq!(params.limit, 100);
        assert!(!params.include_vectors);
        assert_eq!(params.filter(), None);
    }
}
