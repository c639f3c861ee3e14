//! 向量索引服务
//!
//! 每条记忆在向量库中对应一个点：id + embedding + payload。
//! 删除是逻辑删除（payload.deleted = true），检索与枚举默认跳过墓碑。

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::models::memory::{MemoryRecord, MemoryType, Scope};

pub const DISTANCE: &str = "Cosine";

/// 点的 payload，字段名沿用 mem0 的 Qdrant 布局（文本存放在 `data`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub data: String,
    #[serde(default)]
    pub hash: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_type: Option<MemoryType>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub deleted: bool,
}

impl VectorPayload {
    pub fn scope(&self) -> Scope {
        Scope {
            user_id: self.user_id.clone(),
            agent_id: self.agent_id.clone(),
            run_id: self.run_id.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    #[serde(default)]
    pub vector: Vec<f32>,
    pub payload: VectorPayload,
}

impl VectorPoint {
    pub fn from_record(record: &MemoryRecord) -> Self {
        Self {
            id: record.id.clone(),
            vector: record.embedding.clone(),
            payload: VectorPayload {
                user_id: record.scope.user_id.clone(),
                agent_id: record.scope.agent_id.clone(),
                run_id: record.scope.run_id.clone(),
                data: record.memory.clone(),
                hash: record.hash.clone(),
                created_at: record.created_at,
                updated_at: record.updated_at,
                memory_type: record.memory_type,
                metadata: record.metadata.clone(),
                deleted: record.deleted,
            },
        }
    }

    pub fn into_record(self) -> MemoryRecord {
        let scope = self.payload.scope();
        MemoryRecord {
            id: self.id,
            memory: self.payload.data,
            hash: self.payload.hash,
            scope,
            embedding: self.vector,
            created_at: self.payload.created_at,
            updated_at: self.payload.updated_at,
            memory_type: self.payload.memory_type,
            metadata: self.payload.metadata,
            deleted: self.payload.deleted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: VectorPayload,
}

/// 游标式枚举请求，offset 为上一页返回的 next_offset
#[derive(Debug, Clone, Default)]
pub struct ScrollRequest {
    pub filter: Option<Scope>,
    pub limit: usize,
    pub offset: Option<String>,
    pub with_vectors: bool,
    pub include_deleted: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScrollPage {
    pub points: Vec<VectorPoint>,
    pub next_offset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub dimension: usize,
    pub distance: String,
    pub points_count: u64,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// 集合不存在时创建
    async fn ensure_collection(&self) -> Result<()>;
    async fn upsert(&self, point: VectorPoint) -> Result<()>;
    async fn get(&self, id: &str) -> Result<Option<VectorPoint>>;
    /// 物理删除，仅用于写入失败后的补偿
    async fn remove(&self, id: &str) -> Result<()>;
    async fn search(&self, query: &[f32], filter: &Scope, limit: usize) -> Result<Vec<ScoredPoint>>;
    async fn scroll(&self, request: ScrollRequest) -> Result<ScrollPage>;
    async fn info(&self) -> Result<CollectionInfo>;
    fn dimension(&self) -> usize;
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

pub(crate) fn check_dimension(expected: usize, actual: usize) -> Result<()> {
    if expected != actual {
        return Err(AppError::Validation(format!(
            "向量维度不匹配: 期望 {}，实际 {}",
            expected, actual
        )));
    }
    Ok(())
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    name: String,
    dimension: usize,
    points: Vec<VectorPoint>,
}

/// 进程内向量索引
///
/// 配置了 snapshot 路径时，每次写入后把整个集合写成 JSON 文件，启动时重新载入。
pub struct LocalVectorIndex {
    name: String,
    dimension: usize,
    points: DashMap<String, VectorPoint>,
    snapshot: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl LocalVectorIndex {
    pub fn new(name: &str, dimension: usize) -> Self {
        Self {
            name: name.to_string(),
            dimension,
            points: DashMap::new(),
            snapshot: None,
            write_lock: Mutex::new(()),
        }
    }

    /// 打开带快照的索引；快照存在时载入其中的点
    pub async fn open(name: &str, dimension: usize, path: PathBuf) -> Result<Self> {
        let mut index = Self::new(name, dimension);

        if tokio::fs::try_exists(&path).await? {
            let raw = tokio::fs::read(&path).await?;
            let snapshot: Snapshot = serde_json::from_slice(&raw)?;
            if snapshot.dimension != dimension {
                return Err(AppError::Config(format!(
                    "向量快照 {} 的维度为 {}，配置为 {}",
                    path.display(),
                    snapshot.dimension,
                    dimension
                )));
            }
            for point in snapshot.points {
                index.points.insert(point.id.clone(), point);
            }
            info!(
                "Loaded {} vector points from {}",
                index.points.len(),
                path.display()
            );
        }

        index.snapshot = Some(path);
        Ok(index)
    }

    fn sorted_points(&self) -> Vec<VectorPoint> {
        let mut points: Vec<VectorPoint> = self.points.iter().map(|e| e.value().clone()).collect();
        points.sort_by(|a, b| a.id.cmp(&b.id));
        points
    }

    async fn persist(&self) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };

        let _guard = self.write_lock.lock().await;
        let snapshot = Snapshot {
            name: self.name.clone(),
            dimension: self.dimension,
            points: self.sorted_points(),
        };
        let raw = serde_json::to_vec(&snapshot)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        debug!(points = snapshot.points.len(), "Persisted vector snapshot");
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for LocalVectorIndex {
    async fn ensure_collection(&self) -> Result<()> {
        Ok(())
    }

    async fn upsert(&self, point: VectorPoint) -> Result<()> {
        check_dimension(self.dimension, point.vector.len())?;
        let id = point.id.clone();
        let previous = self.points.insert(id.clone(), point);
        if let Err(e) = self.persist().await {
            // 快照未写入时内存中的点也回到写入前的状态
            match previous {
                Some(previous) => {
                    self.points.insert(id, previous);
                }
                None => {
                    self.points.remove(&id);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorPoint>> {
        Ok(self.points.get(id).map(|p| p.value().clone()))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let removed = self.points.remove(id);
        if let Err(e) = self.persist().await {
            if let Some((key, point)) = removed {
                self.points.insert(key, point);
            }
            return Err(e);
        }
        Ok(())
    }

    async fn search(&self, query: &[f32], filter: &Scope, limit: usize) -> Result<Vec<ScoredPoint>> {
        check_dimension(self.dimension, query.len())?;

        let mut results: Vec<ScoredPoint> = self
            .points
            .iter()
            .filter(|entry| {
                let payload = &entry.value().payload;
                !payload.deleted && filter.matches(&payload.scope())
            })
            .map(|entry| {
                let point = entry.value();
                ScoredPoint {
                    id: point.id.clone(),
                    score: cosine_similarity(query, &point.vector),
                    payload: point.payload.clone(),
                }
            })
            .collect();

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);

        Ok(results)
    }

    async fn scroll(&self, request: ScrollRequest) -> Result<ScrollPage> {
        let mut matching = self
            .sorted_points()
            .into_iter()
            .filter(|p| request.include_deleted || !p.payload.deleted)
            .filter(|p| {
                request
                    .filter
                    .as_ref()
                    .map(|f| f.matches(&p.payload.scope()))
                    .unwrap_or(true)
            })
            .filter(|p| {
                request
                    .offset
                    .as_deref()
                    .map(|offset| p.id.as_str() >= offset)
                    .unwrap_or(true)
            });

        let mut points = Vec::new();
        for point in matching.by_ref().take(request.limit) {
            points.push(point);
        }
        let next_offset = matching.next().map(|p| p.id);

        if !request.with_vectors {
            for point in &mut points {
                point.vector.clear();
            }
        }

        Ok(ScrollPage {
            points,
            next_offset,
        })
    }

    async fn info(&self) -> Result<CollectionInfo> {
        Ok(CollectionInfo {
            name: self.name.clone(),
            dimension: self.dimension,
            distance: DISTANCE.to_string(),
            points_count: self.points.len() as u64,
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
