//! Qdrant REST 适配器
//!
//! 只使用集合与点相关的少量接口。作用域过滤转换为 `must` 条件，
//! 墓碑通过 `must_not deleted=true` 排除。

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::error::{AppError, Result};
use crate::index::vector::{
    CollectionInfo, ScoredPoint, ScrollPage, ScrollRequest, VectorIndex, VectorPayload,
    VectorPoint, check_dimension,
};
use crate::models::memory::Scope;

pub struct QdrantVectorIndex {
    client: reqwest::Client,
    base_url: String,
    collection: String,
    api_key: Option<String>,
    dimension: usize,
    on_disk: bool,
}

#[derive(Deserialize)]
struct QdrantResponse<T> {
    result: T,
}

/// Qdrant 的点 ID 可能是 UUID 字符串或整数
#[derive(Deserialize)]
#[serde(untagged)]
enum PointId {
    Uuid(String),
    Num(u64),
}

impl From<PointId> for String {
    fn from(id: PointId) -> Self {
        match id {
            PointId::Uuid(s) => s,
            PointId::Num(n) => n.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct RawPoint {
    id: PointId,
    #[serde(default)]
    score: Option<f32>,
    payload: VectorPayload,
    #[serde(default)]
    vector: Option<Vec<f32>>,
}

#[derive(Deserialize)]
struct RawScroll {
    points: Vec<RawPoint>,
    #[serde(default)]
    next_page_offset: Option<PointId>,
}

#[derive(Deserialize)]
struct RawCollection {
    #[serde(default)]
    points_count: Option<u64>,
    config: RawCollectionConfig,
}

#[derive(Deserialize)]
struct RawCollectionConfig {
    params: RawCollectionParams,
}

#[derive(Deserialize)]
struct RawCollectionParams {
    vectors: RawVectorParams,
}

#[derive(Deserialize)]
struct RawVectorParams {
    size: usize,
    distance: String,
}

impl RawPoint {
    fn into_point(self) -> VectorPoint {
        VectorPoint {
            id: self.id.into(),
            vector: self.vector.unwrap_or_default(),
            payload: self.payload,
        }
    }
}

/// 作用域 + 墓碑过滤
pub(crate) fn build_filter(scope: Option<&Scope>, include_deleted: bool) -> Value {
    let mut must = Vec::new();
    if let Some(scope) = scope {
        for (key, id) in [
            ("user_id", &scope.user_id),
            ("agent_id", &scope.agent_id),
            ("run_id", &scope.run_id),
        ] {
            if let Some(id) = id {
                must.push(json!({ "key": key, "match": { "value": id } }));
            }
        }
    }

    let mut filter = json!({ "must": must });
    if !include_deleted {
        filter["must_not"] = json!([{ "key": "deleted", "match": { "value": true } }]);
    }
    filter
}

impl QdrantVectorIndex {
    pub fn new(
        url: &str,
        collection: &str,
        api_key: Option<String>,
        dimension: usize,
        on_disk: bool,
        timeout_secs: u64,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: url.trim_end_matches('/').to_string(),
            collection: collection.to_string(),
            api_key,
            dimension,
            on_disk,
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/collections/{}{}", self.base_url, self.collection, path);
        let builder = self.client.request(method, url);
        match &self.api_key {
            Some(key) => builder.header("api-key", key),
            None => builder,
        }
    }

    /// 发送请求并解析 `result` 字段；404 返回 None
    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<Option<T>> {
        let response = builder
            .send()
            .await
            .map_err(|e| AppError::Store(format!("Qdrant 请求失败: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Store(format!(
                "Qdrant 返回错误 ({}): {}",
                status, error_text
            )));
        }

        let body: QdrantResponse<T> = response
            .json()
            .await
            .map_err(|e| AppError::Store(format!("Qdrant 响应解析失败: {}", e)))?;
        Ok(Some(body.result))
    }

    async fn send_required<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        self.send(builder).await?.ok_or_else(|| {
            AppError::Store(format!("Qdrant 集合 {} 不存在", self.collection))
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantVectorIndex {
    async fn ensure_collection(&self) -> Result<()> {
        let existing: Option<Value> = self.send(self.request(Method::GET, "")).await?;
        if existing.is_some() {
            debug!(collection = %self.collection, "Qdrant collection exists");
            return Ok(());
        }

        info!(
            "Creating Qdrant collection {} (size {}, on_disk {})",
            self.collection, self.dimension, self.on_disk
        );
        let _: Value = self
            .send_required(self.request(Method::PUT, "").json(&json!({
                "vectors": {
                    "size": self.dimension,
                    "distance": "Cosine",
                    "on_disk": self.on_disk,
                }
            })))
            .await?;
        Ok(())
    }

    async fn upsert(&self, point: VectorPoint) -> Result<()> {
        check_dimension(self.dimension, point.vector.len())?;
        let _: Value = self
            .send_required(self.request(Method::PUT, "/points?wait=true").json(&json!({
                "points": [{
                    "id": point.id,
                    "vector": point.vector,
                    "payload": point.payload,
                }]
            })))
            .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<VectorPoint>> {
        let raw: Option<RawPoint> = self
            .send(self.request(Method::GET, &format!("/points/{}", id)))
            .await?;
        Ok(raw.map(RawPoint::into_point))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let _: Value = self
            .send_required(
                self.request(Method::POST, "/points/delete?wait=true")
                    .json(&json!({ "points": [id] })),
            )
            .await?;
        Ok(())
    }

    async fn search(&self, query: &[f32], filter: &Scope, limit: usize) -> Result<Vec<ScoredPoint>> {
        check_dimension(self.dimension, query.len())?;
        let raw: Vec<RawPoint> = self
            .send_required(self.request(Method::POST, "/points/search").json(&json!({
                "vector": query,
                "limit": limit,
                "filter": build_filter(Some(filter), false),
                "with_payload": true,
            })))
            .await?;

        let mut results: Vec<ScoredPoint> = raw
            .into_iter()
            .map(|p| ScoredPoint {
                score: p.score.unwrap_or_default(),
                id: p.id.into(),
                payload: p.payload,
            })
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);
        Ok(results)
    }

    async fn scroll(&self, request: ScrollRequest) -> Result<ScrollPage> {
        let mut body = json!({
            "limit": request.limit,
            "filter": build_filter(request.filter.as_ref(), request.include_deleted),
            "with_payload": true,
            "with_vector": request.with_vectors,
        });
        if let Some(offset) = &request.offset {
            body["offset"] = json!(offset);
        }

        let raw: RawScroll = self
            .send_required(self.request(Method::POST, "/points/scroll").json(&body))
            .await?;

        Ok(ScrollPage {
            points: raw.points.into_iter().map(RawPoint::into_point).collect(),
            next_offset: raw.next_page_offset.map(String::from),
        })
    }

    async fn info(&self) -> Result<CollectionInfo> {
        let raw: RawCollection = self.send_required(self.request(Method::GET, "")).await?;
        Ok(CollectionInfo {
            name: self.collection.clone(),
            dimension: raw.config.params.vectors.size,
            distance: raw.config.params.vectors.distance,
            points_count: raw.points_count.unwrap_or_default(),
        })
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::memory::MemoryRecord;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn index(server: &MockServer) -> QdrantVectorIndex {
        QdrantVectorIndex::new(&server.uri(), "mem0", Some("secret".into()), 3, true, 5).unwrap()
    }

    #[test]
    fn test_build_filter() {
        let scope = Scope::user("user_001").with_run("run_1");
        let filter = build_filter(Some(&scope), false);

        assert_eq!(filter["must"].as_array().unwrap().len(), 2);
        assert_eq!(filter["must"][0]["key"], "user_id");
        assert_eq!(filter["must_not"][0]["key"], "deleted");

        let all = build_filter(None, true);
        assert!(all["must"].as_array().unwrap().is_empty());
        assert!(all.get("must_not").is_none());
    }

    #[tokio::test]
    async fn test_ensure_collection_creates_when_missing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/mem0"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/collections/mem0"))
            .and(header("api-key", "secret"))
            .and(body_partial_json(json!({
                "vectors": {"size": 3, "distance": "Cosine", "on_disk": true}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
            .expect(1)
            .mount(&server)
            .await;

        index(&server).ensure_collection().await.unwrap();
    }

    #[tokio::test]
    async fn test_search_sends_scope_filter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/mem0/points/search"))
            .and(body_partial_json(json!({
                "limit": 5,
                "filter": {"must": [{"key": "user_id", "match": {"value": "user_001"}}]}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": [
                    {"id": "b", "score": 0.4, "payload": {"user_id": "user_001", "data": "苹果很甜", "hash": "h2", "created_at": "2025-01-01T00:00:00Z"}},
                    {"id": "a", "score": 0.9, "payload": {"user_id": "user_001", "data": "喜欢吃苹果", "hash": "h1", "created_at": "2025-01-01T00:00:00Z"}}
                ]
            })))
            .mount(&server)
            .await;

        let results = index(&server)
            .search(&[1.0, 0.0, 0.0], &Scope::user("user_001"), 5)
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "a");
        assert_eq!(results[0].payload.data, "喜欢吃苹果");
    }

    #[tokio::test]
    async fn test_scroll_and_get() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/collections/mem0/points/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "points": [
                        {"id": 7, "payload": {"data": "x", "created_at": "2025-01-01T00:00:00Z"}, "vector": [0.1, 0.2, 0.3]}
                    ],
                    "next_page_offset": "next-id"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/collections/mem0/points/missing"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let qdrant = index(&server);
        let page = qdrant
            .scroll(ScrollRequest {
                limit: 1,
                with_vectors: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.points[0].id, "7");
        assert_eq!(page.points[0].vector.len(), 3);
        assert_eq!(page.next_offset.as_deref(), Some("next-id"));

        assert!(qdrant.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_upsert_error_is_store_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/collections/mem0/points"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let record = MemoryRecord::new(Scope::user("u"), "x", vec![1.0, 0.0, 0.0]);
        let err = index(&server)
            .upsert(VectorPoint::from_record(&record))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
    }

    #[tokio::test]
    async fn test_info_reads_collection_params() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/collections/mem0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "status": "green",
                    "points_count": 42,
                    "config": {"params": {"vectors": {"size": 3, "distance": "Cosine"}}}
                }
            })))
            .mount(&server)
            .await;

        let info = index(&server).info().await.unwrap();
        assert_eq!(info.points_count, 42);
        assert_eq!(info.dimension, 3);
        assert_eq!(info.distance, "Cosine");
    }
}
