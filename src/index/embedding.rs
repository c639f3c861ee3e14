//! 嵌入模型服务

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::{AzureDeployment, EmbedderConfig};
use crate::error::{AppError, Result};

#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    async fn encode(&self, text: &str) -> Result<Vec<f32>>;
    async fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;
    fn dimension(&self) -> usize;
}

/// 字符 n-gram 哈希向量
///
/// 不依赖任何外部服务，同一文本总是得到同一向量。共享字符片段越多的文本
/// 余弦相似度越高，足够用于离线调试和测试。
pub struct HashEmbedding {
    dimension: usize,
}

impl HashEmbedding {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }

    fn fnv1a(bytes: &[u8]) -> u64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for b in bytes {
            hash ^= *b as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        hash
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = Self::fnv1a(feature.as_bytes());
        let slot = (hash % self.dimension as u64) as usize;
        let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        if self.dimension == 0 {
            return vector;
        }

        let chars: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| !c.is_whitespace() && !c.is_ascii_punctuation())
            .collect();

        for c in &chars {
            self.add_feature(&mut vector, &c.to_string(), 1.0);
        }
        for pair in chars.windows(2) {
            let gram: String = pair.iter().collect();
            self.add_feature(&mut vector, &gram, 1.5);
        }

        let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for HashEmbedding {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        Ok(self.embed(text))
    }

    async fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Azure OpenAI Embedding 客户端
pub struct AzureOpenAiEmbedding {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
    dimension: usize,
    batch_size: usize,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

impl AzureOpenAiEmbedding {
    pub fn new(deployment: &AzureDeployment, dimension: usize, batch_size: usize) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(deployment.timeout_secs))
            .build()?;

        let api_key = deployment.resolve_api_key();
        if api_key.is_none() {
            warn!(
                "Embedding API key not found (env {}), requests will be unauthenticated",
                deployment.api_key_env
            );
        }

        Ok(Self {
            client,
            url: deployment.url("embeddings"),
            api_key,
            dimension,
            batch_size: batch_size.max(1),
        })
    }

    async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut request = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "input": texts }));
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(AppError::Upstream(format!(
                "Embedding 请求失败 ({}): {}",
                status, error_text
            )));
        }

        let mut body: EmbeddingResponse = response.json().await?;
        if body.data.len() != texts.len() {
            return Err(AppError::Upstream(format!(
                "Embedding 返回 {} 条结果，期望 {} 条",
                body.data.len(),
                texts.len()
            )));
        }
        body.data.sort_by_key(|d| d.index);

        body.data
            .into_iter()
            .map(|d| {
                if d.embedding.len() != self.dimension {
                    Err(AppError::Upstream(format!(
                        "Embedding 维度为 {}，配置为 {}",
                        d.embedding.len(),
                        self.dimension
                    )))
                } else {
                    Ok(d.embedding)
                }
            })
            .collect()
    }
}

#[async_trait]
impl EmbeddingModel for AzureOpenAiEmbedding {
    async fn encode(&self, text: &str) -> Result<Vec<f32>> {
        self.embed(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Upstream("Embedding 返回为空".to_string()))
    }

    async fn encode_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.batch_size) {
            debug!(batch = chunk.len(), "Encoding embedding batch");
            all_embeddings.extend(self.embed(chunk).await?);
        }

        Ok(all_embeddings)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

pub fn create_embedding_model(config: &EmbedderConfig) -> Result<Arc<dyn EmbeddingModel>> {
    match config {
        EmbedderConfig::AzureOpenai {
            azure_kwargs,
            embedding_dims,
            batch_size,
            ..
        } => Ok(Arc::new(AzureOpenAiEmbedding::new(
            azure_kwargs,
            *embedding_dims,
            *batch_size,
        )?)),
        EmbedderConfig::Hash { embedding_dims } => Ok(Arc::new(HashEmbedding::new(*embedding_dims))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::vector::cosine_similarity;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn deployment(server: &MockServer) -> AzureDeployment {
        AzureDeployment {
            azure_endpoint: server.uri(),
            azure_deployment: "text-embedding-3-small".into(),
            api_version: "2023-05-15".into(),
            api_key: Some("test-key".into()),
            ..AzureDeployment::default()
        }
    }

    #[tokio::test]
    async fn test_hash_embedding_is_deterministic_and_normalized() {
        let model = HashEmbedding::new(64);

        let a = model.encode("喜欢吃苹果").await.unwrap();
        let b = model.encode("喜欢吃苹果").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_hash_embedding_similarity_follows_overlap() {
        let model = HashEmbedding::new(256);

        let query = model.encode("苹果").await.unwrap();
        let apple = model.encode("喜欢吃苹果").await.unwrap();
        let weather = model.encode("今天天气很好").await.unwrap();

        assert!(cosine_similarity(&query, &apple) > cosine_similarity(&query, &weather));
    }

    #[tokio::test]
    async fn test_azure_embedding_request_shape() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/openai/deployments/text-embedding-3-small/embeddings"))
            .and(query_param("api-version", "2023-05-15"))
            .and(header("api-key", "test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"index": 1, "embedding": [0.0, 1.0, 0.0]},
                    {"index": 0, "embedding": [1.0, 0.0, 0.0]}
                ]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let model = AzureOpenAiEmbedding::new(&deployment(&server), 3, 16).unwrap();
        let vectors = model.encode_batch(&["你是谁", "我是谁"]).await.unwrap();

        assert_eq!(vectors[0], vec![1.0, 0.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0, 0.0]);
    }

    #[tokio::test]
    async fn test_azure_embedding_dimension_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"index": 0, "embedding": [0.5, 0.5]}]
            })))
            .mount(&server)
            .await;

        let model = AzureOpenAiEmbedding::new(&deployment(&server), 1536, 16).unwrap();
        let err = model.encode("你是谁").await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_azure_embedding_http_error_is_upstream() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Access denied"))
            .mount(&server)
            .await;

        let model = AzureOpenAiEmbedding::new(&deployment(&server), 3, 16).unwrap();
        let err = model.encode("你是谁").await.unwrap_err();
        match err {
            AppError::Upstream(msg) => assert!(msg.contains("Access denied")),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_create_embedding_model_from_config() {
        let model = create_embedding_model(&EmbedderConfig::Hash { embedding_dims: 8 }).unwrap();
        assert_eq!(model.dimension(), 8);
    }
}
