//! 记忆服务
//!
//! 统一入口：把 add / search / get / update / delete 请求分发到向量库、历史库和图库。
//!
//! 跨库写入顺序固定为 向量库 → 历史库。历史写入失败时撤销刚才的向量写入
//! （新增的点被物理删除，修改和删除则恢复旧值），保证每条成功的记忆都有历史记录。
//! 图库写入只记录告警，不回滚其他存储。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{AppConfig, ExtractionConfig};
use crate::error::{AppError, Result};
use crate::index::{
    EmbeddingModel, ScrollRequest, VectorIndex, VectorPoint, create_embedding_model,
    create_vector_index,
};
use crate::llm::{
    ExistingMemory, Extractor, GraphExtractor, LlmExtractor, LlmGraphExtractor, LlmMerger,
    LlmProceduralSummarizer, Merger, ProceduralSummarizer, create_chat_model,
};
use crate::models::graph::{GraphAddResult, Relation};
use crate::models::history::{EventKind, HistoryEvent};
use crate::models::memory::{
    MemoryEvent, MemoryRecord, MemoryType, Message, Scope, ScoredMemory, content_hash,
    format_conversation,
};
use crate::storage::{GraphStore, HistoryStore};

const SCROLL_PAGE: usize = 256;

/// add 请求
#[derive(Debug, Clone, Default)]
pub struct AddMemoryRequest {
    pub messages: Vec<Message>,
    pub scope: Scope,
    pub infer: bool,
    pub memory_type: Option<MemoryType>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// 过程记忆总结使用的 prompt，覆盖配置值
    pub prompt: Option<String>,
}

impl AddMemoryRequest {
    pub fn new(messages: Vec<Message>, scope: Scope) -> Self {
        Self {
            messages,
            scope,
            ..Default::default()
        }
    }

    pub fn infer(mut self, infer: bool) -> Self {
        self.infer = infer;
        self
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddResult {
    pub results: Vec<MemoryEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<GraphAddResult>,
}

/// search 请求
#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub query: String,
    pub scope: Scope,
    pub limit: Option<usize>,
    pub threshold: Option<f32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub results: Vec<ScoredMemory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
}

/// 记忆服务
pub struct MemoryService {
    vector: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingModel>,
    history: HistoryStore,
    graph: Option<GraphStore>,
    extractor: Option<Arc<dyn Extractor>>,
    merger: Option<Arc<dyn Merger>>,
    graph_extractor: Option<Arc<dyn GraphExtractor>>,
    summarizer: Option<Arc<dyn ProceduralSummarizer>>,
    limits: ExtractionConfig,
}

/// 记忆服务构建器
pub struct MemoryServiceBuilder {
    service: MemoryService,
}

impl MemoryServiceBuilder {
    pub fn graph(mut self, graph: GraphStore) -> Self {
        self.service.graph = Some(graph);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn Extractor>) -> Self {
        self.service.extractor = Some(extractor);
        self
    }

    pub fn merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.service.merger = Some(merger);
        self
    }

    pub fn graph_extractor(mut self, extractor: Arc<dyn GraphExtractor>) -> Self {
        self.service.graph_extractor = Some(extractor);
        self
    }

    pub fn summarizer(mut self, summarizer: Arc<dyn ProceduralSummarizer>) -> Self {
        self.service.summarizer = Some(summarizer);
        self
    }

    pub fn limits(mut self, limits: ExtractionConfig) -> Self {
        self.service.limits = limits;
        self
    }

    pub fn build(self) -> MemoryService {
        self.service
    }
}

fn graph_user(scope: &Scope) -> &str {
    scope
        .user_id
        .as_deref()
        .or(scope.agent_id.as_deref())
        .or(scope.run_id.as_deref())
        .unwrap_or("USER")
}

impl MemoryService {
    pub fn builder(
        vector: Arc<dyn VectorIndex>,
        embedder: Arc<dyn EmbeddingModel>,
        history: HistoryStore,
    ) -> MemoryServiceBuilder {
        MemoryServiceBuilder {
            service: MemoryService {
                vector,
                embedder,
                history,
                graph: None,
                extractor: None,
                merger: None,
                graph_extractor: None,
                summarizer: None,
                limits: ExtractionConfig::default(),
            },
        }
    }

    /// 按配置打开三个存储并装配模型
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let embedder = create_embedding_model(&config.embedder)?;
        let vector = create_vector_index(&config.vector_store, embedder.dimension()).await?;
        let history = HistoryStore::open(&config.history)?;

        let mut builder =
            Self::builder(vector, embedder, history).limits(config.extraction.clone());

        if config.graph_enabled() {
            builder = builder.graph(GraphStore::open(&config.graph_store)?);
            info!("Graph store enabled");
        }

        match create_chat_model(&config.llm)? {
            Some(chat) => {
                info!("LLM ready: {}", chat.model_name());
                builder = builder
                    .extractor(Arc::new(LlmExtractor::new(
                        chat.clone(),
                        config.extraction.custom_fact_extraction_prompt.clone(),
                    )))
                    .merger(Arc::new(LlmMerger::new(
                        chat.clone(),
                        config.extraction.custom_update_memory_prompt.clone(),
                    )))
                    .graph_extractor(Arc::new(LlmGraphExtractor::new(chat.clone())))
                    .summarizer(Arc::new(LlmProceduralSummarizer::new(
                        chat,
                        config.extraction.procedural_memory_prompt.clone(),
                    )));
            }
            None => warn!(
                "LLM disabled: infer, procedural memory and graph extraction are unavailable"
            ),
        }

        Ok(builder.build())
    }

    pub fn graph_enabled(&self) -> bool {
        self.graph.is_some()
    }

    pub fn vector_index(&self) -> &Arc<dyn VectorIndex> {
        &self.vector
    }

    pub fn history_store(&self) -> &HistoryStore {
        &self.history
    }

    pub fn graph_store(&self) -> Option<&GraphStore> {
        self.graph.as_ref()
    }

    /// 写入记忆
    pub async fn add(&self, request: AddMemoryRequest) -> Result<AddResult> {
        request.scope.validate()?;
        if request.messages.is_empty() {
            return Err(AppError::Validation("messages 不能为空".to_string()));
        }

        if request.memory_type == Some(MemoryType::Procedural) {
            let event = self.add_procedural(&request).await?;
            return Ok(AddResult {
                results: vec![event],
                relations: None,
            });
        }

        // 向量与图两条路径互不依赖
        let (results, relations) =
            tokio::join!(self.add_to_vector(&request), self.add_to_graph(&request));

        Ok(AddResult {
            results: results?,
            relations,
        })
    }

    async fn add_procedural(&self, request: &AddMemoryRequest) -> Result<MemoryEvent> {
        if request.scope.agent_id.is_none() {
            return Err(AppError::Validation(
                "过程记忆需要提供 agent_id".to_string(),
            ));
        }
        let summarizer = self.summarizer.as_ref().ok_or_else(|| {
            AppError::Config("未配置 LLM，无法生成过程记忆".to_string())
        })?;

        let summary = summarizer
            .summarize(request.messages.clone(), request.prompt.clone())
            .await?;
        let embedding = self.embedder.encode(&summary).await?;

        let record = MemoryRecord::new(request.scope.clone(), &summary, embedding)
            .with_memory_type(Some(MemoryType::Procedural))
            .with_metadata(request.metadata.clone());
        self.insert_record(record, None, None).await
    }

    async fn add_to_vector(&self, request: &AddMemoryRequest) -> Result<Vec<MemoryEvent>> {
        if request.infer {
            self.add_inferred(request).await
        } else {
            self.add_verbatim(request).await
        }
    }

    /// infer=false：每条非 system 消息原样保存为一条记忆
    async fn add_verbatim(&self, request: &AddMemoryRequest) -> Result<Vec<MemoryEvent>> {
        let mut events = Vec::new();
        for message in request.messages.iter().filter(|m| !m.is_system()) {
            if message.content.trim().is_empty() {
                warn!(role = %message.role, "Skipping empty message");
                continue;
            }
            let embedding = self.embedder.encode(&message.content).await?;
            let record = MemoryRecord::new(request.scope.clone(), &message.content, embedding)
                .with_metadata(request.metadata.clone());
            let event = self
                .insert_record(record, message.name.clone(), Some(message.role.clone()))
                .await?;
            events.push(event);
        }
        Ok(events)
    }

    /// infer=true：抽取事实 → 检索相似记忆 → 合并 → 逐条执行
    async fn add_inferred(&self, request: &AddMemoryRequest) -> Result<Vec<MemoryEvent>> {
        let (Some(extractor), Some(merger)) = (&self.extractor, &self.merger) else {
            return Err(AppError::Config(
                "未配置 LLM，infer=true 不可用".to_string(),
            ));
        };

        let conversation = format_conversation(&request.messages);
        let facts = extractor.extract_facts(&conversation).await?;
        if facts.is_empty() {
            debug!(scope = %request.scope, "No facts extracted");
            return Ok(Vec::new());
        }

        let fact_refs: Vec<&str> = facts.iter().map(String::as_str).collect();
        let fact_embeddings = self.embedder.encode_batch(&fact_refs).await?;

        let mut existing = Vec::new();
        let mut seen = HashSet::new();
        let mut existing_hashes = HashSet::new();
        for embedding in &fact_embeddings {
            let similar = self
                .vector
                .search(embedding, &request.scope, self.limits.similar_memories)
                .await?;
            for point in similar {
                if seen.insert(point.id.clone()) {
                    existing_hashes.insert(point.payload.hash.clone());
                    existing.push(ExistingMemory {
                        id: point.id,
                        text: point.payload.data,
                    });
                }
            }
        }

        let mut embeddings: HashMap<String, Vec<f32>> =
            facts.iter().cloned().zip(fact_embeddings).collect();

        let operations = merger.merge(facts, existing).await?;
        debug!(count = operations.len(), "Merge produced operations");

        let mut events = Vec::new();
        for op in operations {
            let outcome = match (op.event, op.id) {
                (EventKind::Add, _) => {
                    let record_hash = content_hash(&op.text);
                    if existing_hashes.contains(&record_hash) {
                        debug!(text = %op.text, "Skipping duplicate fact");
                        continue;
                    }
                    let embedding = match embeddings.remove(&op.text) {
                        Some(e) => e,
                        None => self.embedder.encode(&op.text).await?,
                    };
                    existing_hashes.insert(record_hash);
                    let record = MemoryRecord::new(request.scope.clone(), &op.text, embedding)
                        .with_metadata(request.metadata.clone());
                    self.insert_record(record, None, None).await
                }
                (EventKind::Update, Some(id)) => {
                    let embedding = match embeddings.get(&op.text) {
                        Some(e) => e.clone(),
                        None => self.embedder.encode(&op.text).await?,
                    };
                    self.update_record(&id, &op.text, embedding)
                        .await
                        .map(|(record, previous)| MemoryEvent {
                            id: record.id,
                            memory: record.memory,
                            event: EventKind::Update,
                            previous_memory: Some(previous),
                        })
                }
                (EventKind::Delete, Some(id)) => {
                    self.delete_record(&id).await.map(|record| MemoryEvent {
                        id: record.id,
                        memory: record.memory,
                        event: EventKind::Delete,
                        previous_memory: None,
                    })
                }
                _ => continue,
            };

            match outcome {
                Ok(event) => events.push(event),
                Err(AppError::NotFound(msg)) => {
                    warn!("Skipping merge operation on missing memory: {}", msg)
                }
                Err(e) => return Err(e),
            }
        }

        Ok(events)
    }

    /// 图库写入，失败只告警
    async fn add_to_graph(&self, request: &AddMemoryRequest) -> Option<GraphAddResult> {
        let graph = self.graph.as_ref()?;
        let Some(extractor) = &self.graph_extractor else {
            return Some(GraphAddResult::default());
        };

        let text = format_conversation(&request.messages);
        let triples = match extractor
            .extract_relations(&text, graph_user(&request.scope))
            .await
        {
            Ok(triples) => triples,
            Err(e) => {
                warn!("Graph extraction failed, skipping graph write: {}", e);
                return Some(GraphAddResult::default());
            }
        };

        let mut added = Vec::new();
        for triple in triples {
            match graph.upsert_relation(&request.scope, &triple) {
                Ok(_) => added.push(triple),
                Err(e) => warn!(
                    source = %triple.source,
                    destination = %triple.destination,
                    "Graph upsert failed: {}",
                    e
                ),
            }
        }

        Some(GraphAddResult {
            added_entities: added,
        })
    }

    /// 向量库写入新记忆并追加 ADD 历史
    async fn insert_record(
        &self,
        record: MemoryRecord,
        actor_id: Option<String>,
        role: Option<String>,
    ) -> Result<MemoryEvent> {
        self.vector.upsert(VectorPoint::from_record(&record)).await?;

        let event = HistoryEvent::added(&record.id, &record.memory).with_actor(actor_id, role);
        if let Err(e) = self.history.append(&event) {
            error!(memory_id = %record.id, "History append failed, removing vector point: {}", e);
            if let Err(undo) = self.vector.remove(&record.id).await {
                error!(memory_id = %record.id, "Vector compensation failed: {}", undo);
            }
            return Err(e);
        }

        debug!(memory_id = %record.id, scope = %record.scope, "Memory added");
        Ok(MemoryEvent {
            id: record.id,
            memory: record.memory,
            event: EventKind::Add,
            previous_memory: None,
        })
    }

    async fn restore(&self, previous: &MemoryRecord) {
        if let Err(undo) = self.vector.upsert(VectorPoint::from_record(previous)).await {
            error!(memory_id = %previous.id, "Vector compensation failed: {}", undo);
        }
    }

    /// 改写记忆，返回新记录与旧文本
    async fn update_record(
        &self,
        memory_id: &str,
        text: &str,
        embedding: Vec<f32>,
    ) -> Result<(MemoryRecord, String)> {
        let previous = self.load_live(memory_id, true).await?;
        let mut record = previous.clone();
        record.rewrite(text, embedding);

        self.vector.upsert(VectorPoint::from_record(&record)).await?;

        let event = HistoryEvent::updated(memory_id, &previous.memory, text);
        if let Err(e) = self.history.append(&event) {
            error!(memory_id, "History append failed, restoring vector point: {}", e);
            self.restore(&previous).await;
            return Err(e);
        }

        debug!(memory_id, "Memory updated");
        Ok((record, previous.memory))
    }

    /// 逻辑删除，返回删除前的记录
    async fn delete_record(&self, memory_id: &str) -> Result<MemoryRecord> {
        let previous = self.load_live(memory_id, true).await?;
        let mut record = previous.clone();
        record.tombstone();

        self.vector.upsert(VectorPoint::from_record(&record)).await?;

        let event = HistoryEvent::deleted(memory_id, &previous.memory);
        if let Err(e) = self.history.append(&event) {
            error!(memory_id, "History append failed, restoring vector point: {}", e);
            self.restore(&previous).await;
            return Err(e);
        }

        debug!(memory_id, "Memory deleted");
        Ok(previous)
    }

    async fn load_live(&self, memory_id: &str, with_vector: bool) -> Result<MemoryRecord> {
        match self.vector.get(memory_id).await? {
            Some(point) if !point.payload.deleted => {
                let mut record = point.into_record();
                if !with_vector {
                    record.embedding.clear();
                }
                Ok(record)
            }
            _ => Err(AppError::NotFound(format!("记忆 {} 不存在", memory_id))),
        }
    }

    /// 语义检索
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResult> {
        request.scope.validate()?;
        if request.query.trim().is_empty() {
            return Err(AppError::Validation("query 不能为空".to_string()));
        }
        let limit = request.limit.unwrap_or(self.limits.default_search_limit);
        if limit == 0 {
            return Err(AppError::Validation("limit 必须大于 0".to_string()));
        }

        let (results, relations) = tokio::join!(
            self.search_vector(&request, limit),
            self.search_graph(&request)
        );

        Ok(SearchResult {
            results: results?,
            relations,
        })
    }

    async fn search_vector(&self, request: &SearchRequest, limit: usize) -> Result<Vec<ScoredMemory>> {
        let embedding = self.embedder.encode(&request.query).await?;
        let points = self.vector.search(&embedding, &request.scope, limit).await?;

        Ok(points
            .into_iter()
            .filter(|p| request.threshold.map_or(true, |t| p.score >= t))
            .map(|p| {
                let score = p.score;
                let record = VectorPoint {
                    id: p.id,
                    vector: Vec::new(),
                    payload: p.payload,
                }
                .into_record();
                ScoredMemory { record, score }
            })
            .collect())
    }

    /// 图检索：查询中提到的实体所关联的关系
    async fn search_graph(&self, request: &SearchRequest) -> Option<Vec<Relation>> {
        let graph = self.graph.as_ref()?;

        let names = match &self.graph_extractor {
            Some(extractor) => {
                match extractor
                    .extract_entities(&request.query, graph_user(&request.scope))
                    .await
                {
                    Ok(names) => names,
                    Err(e) => {
                        warn!("Query entity extraction failed: {}", e);
                        return Some(Vec::new());
                    }
                }
            }
            // 没有 LLM 时退化为名称包含匹配
            None => match graph.entities(Some(&request.scope), None) {
                Ok(entities) => entities
                    .into_iter()
                    .filter(|e| request.query.contains(&e.name))
                    .map(|e| e.name)
                    .collect(),
                Err(e) => {
                    warn!("Graph entity lookup failed: {}", e);
                    return Some(Vec::new());
                }
            },
        };

        match graph.relations_for_entities(&request.scope, &names) {
            Ok(relations) => Some(relations),
            Err(e) => {
                warn!("Graph relation lookup failed: {}", e);
                Some(Vec::new())
            }
        }
    }

    /// 作用域内所有未删除的记忆，按创建时间升序
    pub async fn get_all(&self, scope: &Scope, limit: Option<usize>) -> Result<Vec<MemoryRecord>> {
        scope.validate()?;
        let limit = limit.unwrap_or(self.limits.default_list_limit);

        let mut records = self.scan_scope(scope).await?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records.truncate(limit);
        Ok(records)
    }

    async fn scan_scope(&self, scope: &Scope) -> Result<Vec<MemoryRecord>> {
        let mut records = Vec::new();
        let mut offset = None;
        loop {
            let page = self
                .vector
                .scroll(ScrollRequest {
                    filter: Some(scope.clone()),
                    limit: SCROLL_PAGE,
                    offset,
                    with_vectors: false,
                    include_deleted: false,
                })
                .await?;
            records.extend(page.points.into_iter().map(VectorPoint::into_record));
            match page.next_offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(records)
    }

    pub async fn get(&self, memory_id: &str) -> Result<MemoryRecord> {
        self.load_live(memory_id, false).await
    }

    pub async fn update(&self, memory_id: &str, text: &str) -> Result<MemoryRecord> {
        if text.trim().is_empty() {
            return Err(AppError::Validation("新的记忆内容不能为空".to_string()));
        }
        // 先确认存在，避免为不存在的记忆调用 embedding
        self.load_live(memory_id, false).await?;

        let embedding = self.embedder.encode(text).await?;
        let (mut record, _) = self.update_record(memory_id, text, embedding).await?;
        record.embedding.clear();
        Ok(record)
    }

    pub async fn delete(&self, memory_id: &str) -> Result<()> {
        self.delete_record(memory_id).await.map(|_| ())
    }

    /// 删除作用域内全部记忆，并清理该作用域的图数据
    pub async fn delete_all(&self, scope: &Scope) -> Result<usize> {
        scope.validate()?;

        let records = self.scan_scope(scope).await?;
        let mut deleted = 0;
        for record in records {
            match self.delete_record(&record.id).await {
                Ok(_) => deleted += 1,
                Err(AppError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if let Some(graph) = &self.graph {
            if let Err(e) = graph.delete_scope(scope) {
                warn!(%scope, "Graph cleanup failed: {}", e);
            }
        }

        info!(%scope, deleted, "Deleted all memories in scope");
        Ok(deleted)
    }

    /// 单条记忆的历史，按时间正序
    pub fn history(&self, memory_id: &str) -> Result<Vec<HistoryEvent>> {
        self.history.for_memory(memory_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{HashEmbedding, LocalVectorIndex};
    use crate::llm::extraction::{
        MemoryOperation, MockExtractor, MockGraphExtractor, MockMerger, MockProceduralSummarizer,
    };
    use crate::models::graph::RelationTriple;
    use crate::models::history::HistoryQuery;

    const DIM: usize = 64;

    fn builder() -> MemoryServiceBuilder {
        MemoryService::builder(
            Arc::new(LocalVectorIndex::new("mem0", DIM)),
            Arc::new(HashEmbedding::new(DIM)),
            HistoryStore::in_memory().unwrap(),
        )
    }

    fn user() -> Scope {
        Scope::user("user_001")
    }

    #[tokio::test]
    async fn test_verbatim_add_skips_system_and_records_role() {
        let service = builder().build();
        let mut named = Message::user("我喜欢吃苹果");
        named.name = Some("alice".into());

        let result = service
            .add(AddMemoryRequest::new(
                vec![
                    Message {
                        role: "system".into(),
                        content: "you are helpful".into(),
                        name: None,
                    },
                    named,
                ],
                user(),
            ))
            .await
            .unwrap();

        assert_eq!(result.results.len(), 1);
        assert_eq!(result.results[0].memory, "我喜欢吃苹果");
        assert!(result.relations.is_none());

        let history = service.history(&result.results[0].id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role.as_deref(), Some("user"));
        assert_eq!(history[0].actor_id.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_add_validation() {
        let service = builder().build();

        let err = service
            .add(AddMemoryRequest::new(vec![], user()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = service
            .add(AddMemoryRequest::new(
                vec![Message::user("x")],
                Scope::default(),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let err = service
            .add(AddMemoryRequest::new(vec![Message::user("x")], user()).infer(true))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[tokio::test]
    async fn test_inferred_add_applies_merge_operations() {
        let mut extractor = MockExtractor::new();
        extractor
            .expect_extract_facts()
            .returning(|_| Ok(vec!["喜欢吃青苹果".to_string(), "喜欢橘子".to_string()]));

        let mut merger = MockMerger::new();
        merger.expect_merge().times(1).returning(|facts, existing| {
            assert_eq!(facts.len(), 2);
            let apple = existing
                .iter()
                .find(|m| m.text == "喜欢吃苹果")
                .expect("existing memory offered to merger");
            let banana = existing
                .iter()
                .find(|m| m.text == "喜欢香蕉")
                .expect("existing memory offered to merger");
            Ok(vec![
                MemoryOperation {
                    id: Some(apple.id.clone()),
                    text: "喜欢吃青苹果".into(),
                    event: EventKind::Update,
                    old_memory: Some(apple.text.clone()),
                },
                MemoryOperation {
                    id: Some(banana.id.clone()),
                    text: banana.text.clone(),
                    event: EventKind::Delete,
                    old_memory: None,
                },
                MemoryOperation {
                    id: None,
                    text: "喜欢橘子".into(),
                    event: EventKind::Add,
                    old_memory: None,
                },
                MemoryOperation {
                    id: Some("not-a-real-id".into()),
                    text: "ghost".into(),
                    event: EventKind::Delete,
                    old_memory: None,
                },
            ])
        });

        let service = builder()
            .extractor(Arc::new(extractor))
            .merger(Arc::new(merger))
            .limits(ExtractionConfig {
                similar_memories: 10,
                ..Default::default()
            })
            .build();

        service
            .add(AddMemoryRequest::new(
                vec![Message::user("喜欢吃苹果"), Message::user("喜欢香蕉")],
                user(),
            ))
            .await
            .unwrap();

        let result = service
            .add(AddMemoryRequest::new(vec![Message::user("我现在只吃青苹果和橘子")], user()).infer(true))
            .await
            .unwrap();

        let kinds: Vec<EventKind> = result.results.iter().map(|e| e.event).collect();
        assert_eq!(kinds, vec![EventKind::Update, EventKind::Delete, EventKind::Add]);
        assert_eq!(result.results[0].previous_memory.as_deref(), Some("喜欢吃苹果"));

        let texts: Vec<String> = service
            .get_all(&user(), None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.memory)
            .collect();
        assert_eq!(texts.len(), 2);
        assert!(texts.contains(&"喜欢吃青苹果".to_string()));
        assert!(texts.contains(&"喜欢橘子".to_string()));

        // 2 ADD + UPDATE + DELETE + ADD
        assert_eq!(service.history_store().count().unwrap(), 5);
    }

    #[tokio::test]
    async fn test_inferred_add_without_facts_skips_merger() {
        let mut extractor = MockExtractor::new();
        extractor.expect_extract_facts().returning(|_| Ok(vec![]));
        let mut merger = MockMerger::new();
        merger.expect_merge().times(0);

        let service = builder()
            .extractor(Arc::new(extractor))
            .merger(Arc::new(merger))
            .build();

        let result = service
            .add(AddMemoryRequest::new(vec![Message::user("你好")], user()).infer(true))
            .await
            .unwrap();
        assert!(result.results.is_empty());
        assert_eq!(service.history_store().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_procedural_memory_requires_agent_and_is_tagged() {
        let mut summarizer = MockProceduralSummarizer::new();
        summarizer
            .expect_summarize()
            .times(1)
            .returning(|_, _| Ok("1. 打开浏览器\n2. 搜索天气".to_string()));
        let service = builder().summarizer(Arc::new(summarizer)).build();

        let mut request = AddMemoryRequest::new(vec![Message::assistant("打开浏览器")], user());
        request.memory_type = Some(MemoryType::Procedural);

        let err = service.add(request.clone()).await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        request.scope = user().with_agent("agent_007");
        let result = service.add(request).await.unwrap();
        assert_eq!(result.results.len(), 1);

        let record = service.get(&result.results[0].id).await.unwrap();
        assert_eq!(record.memory_type, Some(MemoryType::Procedural));
        assert!(record.memory.starts_with("1. 打开浏览器"));
    }

    #[tokio::test]
    async fn test_graph_write_and_search() {
        let mut graph_extractor = MockGraphExtractor::new();
        graph_extractor
            .expect_extract_relations()
            .returning(|_, user| Ok(vec![RelationTriple::new(user, "likes", "苹果")]));
        graph_extractor
            .expect_extract_entities()
            .returning(|_, _| Ok(vec!["苹果".to_string()]));

        let service = builder()
            .graph(GraphStore::in_memory().unwrap())
            .graph_extractor(Arc::new(graph_extractor))
            .build();

        for _ in 0..2 {
            let result = service
                .add(AddMemoryRequest::new(vec![Message::user("我喜欢吃苹果")], user()))
                .await
                .unwrap();
            let relations = result.relations.unwrap();
            assert_eq!(relations.added_entities.len(), 1);
        }

        let graph = service.graph_store().unwrap();
        let entities = graph.entities(Some(&user()), None).unwrap();
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().all(|e| e.mentions == 2));

        let found = service
            .search(SearchRequest {
                query: "苹果".into(),
                scope: user(),
                ..Default::default()
            })
            .await
            .unwrap();
        let relations = found.relations.unwrap();
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].mentions, 2);
    }

    #[tokio::test]
    async fn test_graph_failure_does_not_fail_add() {
        let mut graph_extractor = MockGraphExtractor::new();
        graph_extractor
            .expect_extract_relations()
            .returning(|_, _| Err(AppError::Upstream("timeout".into())));

        let service = builder()
            .graph(GraphStore::in_memory().unwrap())
            .graph_extractor(Arc::new(graph_extractor))
            .build();

        let result = service
            .add(AddMemoryRequest::new(vec![Message::user("我喜欢吃苹果")], user()))
            .await
            .unwrap();
        assert_eq!(result.results.len(), 1);
        assert_eq!(result.relations.unwrap().added_entities.len(), 0);
    }

    #[tokio::test]
    async fn test_history_failure_removes_new_vector_point() {
        let service = builder().build();
        service.history_store().break_writes();

        let err = service
            .add(AddMemoryRequest::new(vec![Message::user("喜欢吃苹果")], user()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Store(_)));
        assert!(service.get_all(&user(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_restores_deleted_record() {
        let service = builder().build();
        let added = service
            .add(AddMemoryRequest::new(vec![Message::user("喜欢吃苹果")], user()))
            .await
            .unwrap();
        let id = added.results[0].id.clone();

        service.history_store().break_writes();
        assert!(service.delete(&id).await.is_err());
        assert!(service.update(&id, "喜欢吃梨").await.is_err());

        let record = service.get(&id).await.unwrap();
        assert_eq!(record.memory, "喜欢吃苹果");
    }

    #[tokio::test]
    async fn test_search_threshold_and_limit() {
        let service = builder().build();
        service
            .add(AddMemoryRequest::new(
                vec![
                    Message::user("喜欢吃苹果"),
                    Message::user("苹果很甜"),
                    Message::user("明天要开会"),
                ],
                user(),
            ))
            .await
            .unwrap();

        let err = service
            .search(SearchRequest {
                query: "苹果".into(),
                scope: user(),
                limit: Some(0),
                threshold: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));

        let all = service
            .search(SearchRequest {
                query: "苹果".into(),
                scope: user(),
                limit: Some(10),
                threshold: None,
            })
            .await
            .unwrap();
        assert_eq!(all.results.len(), 3);
        assert!(all.relations.is_none());

        let cutoff = all.results[1].score;
        let filtered = service
            .search(SearchRequest {
                query: "苹果".into(),
                scope: user(),
                limit: Some(10),
                threshold: Some(cutoff),
            })
            .await
            .unwrap();
        assert!(filtered.results.len() >= 2);
        assert!(filtered.results.iter().all(|r| r.score >= cutoff));
    }

    #[tokio::test]
    async fn test_delete_all_scope() {
        let service = builder().graph(GraphStore::in_memory().unwrap()).build();
        let other = Scope::user("user_002");

        for scope in [user(), user(), other.clone()] {
            service
                .add(AddMemoryRequest::new(vec![Message::user("一条记忆")], scope))
                .await
                .unwrap();
        }
        service
            .graph_store()
            .unwrap()
            .upsert_relation(&user(), &RelationTriple::new("user_001", "likes", "苹果"))
            .unwrap();

        assert_eq!(service.delete_all(&user()).await.unwrap(), 2);
        assert!(service.get_all(&user(), None).await.unwrap().is_empty());
        assert_eq!(service.get_all(&other, None).await.unwrap().len(), 1);
        assert!(
            service
                .graph_store()
                .unwrap()
                .entities(Some(&user()), None)
                .unwrap()
                .is_empty()
        );

        let deletes = service
            .history_store()
            .query(&HistoryQuery {
                event: Some(EventKind::Delete),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(deletes.len(), 2);
    }

    #[tokio::test]
    async fn test_get_update_delete_not_found() {
        let service = builder().build();

        assert!(matches!(service.get("missing").await, Err(AppError::NotFound(_))));
        assert!(matches!(
            service.update("missing", "x").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(service.delete("missing").await, Err(AppError::NotFound(_))));

        let added = service
            .add(AddMemoryRequest::new(vec![Message::user("喜欢吃苹果")], user()))
            .await
            .unwrap();
        let id = &added.results[0].id;

        assert!(matches!(
            service.update(id, "  ").await,
            Err(AppError::Validation(_))
        ));
        service.delete(id).await.unwrap();
        assert!(matches!(service.delete(id).await, Err(AppError::NotFound(_))));
        assert!(matches!(service.get(id).await, Err(AppError::NotFound(_))));
    }
}
