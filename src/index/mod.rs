//! 索引模块
//!
//! 向量索引（本地 / Qdrant）与嵌入模型。

pub mod embedding;
pub mod qdrant;
pub mod vector;

pub use embedding::{AzureOpenAiEmbedding, EmbeddingModel, HashEmbedding, create_embedding_model};
pub use qdrant::QdrantVectorIndex;
pub use vector::{
    CollectionInfo, LocalVectorIndex, ScoredPoint, ScrollPage, ScrollRequest, VectorIndex,
    VectorPayload, VectorPoint, cosine_similarity,
};

use std::sync::Arc;

use tracing::info;

use crate::config::VectorStoreConfig;
use crate::error::Result;

/// 按配置创建向量索引，并确保集合存在
pub async fn create_vector_index(
    config: &VectorStoreConfig,
    dimension: usize,
) -> Result<Arc<dyn VectorIndex>> {
    let index: Arc<dyn VectorIndex> = match config {
        VectorStoreConfig::Local { collection, path } => match path {
            Some(path) => Arc::new(LocalVectorIndex::open(collection, dimension, path.clone()).await?),
            None => Arc::new(LocalVectorIndex::new(collection, dimension)),
        },
        VectorStoreConfig::Qdrant {
            url,
            collection,
            api_key,
            on_disk,
            timeout_secs,
        } => Arc::new(QdrantVectorIndex::new(
            url,
            collection,
            api_key.clone(),
            dimension,
            *on_disk,
            *timeout_secs,
        )?),
    };

    index.ensure_collection().await?;
    info!(
        "Vector index ready: collection={} dimension={}",
        config.collection(),
        dimension
    );
    Ok(index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_local_index() {
        let config = VectorStoreConfig::Local {
            collection: "facts".into(),
            path: None,
        };
        let index = create_vector_index(&config, 16).await.unwrap();
        let info = index.info().await.unwrap();

        assert_eq!(info.name, "facts");
        assert_eq!(info.dimension, 16);
        assert_eq!(info.points_count, 0);
    }
}
