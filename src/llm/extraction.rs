//! 抽取与合并
//!
//! 事实抽取、记忆合并、图关系抽取和过程记忆总结都是外部能力，
//! 这里只定义接口，并提供基于 LLM prompt 的实现。

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::{AppError, Result};
use crate::llm::client::{ChatMessage, ChatModel, ChatRequest};
use crate::llm::prompts;
use crate::models::history::EventKind;
use crate::models::graph::RelationTriple;
use crate::models::memory::{Message, format_conversation};

static CODE_FENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[a-zA-Z]*\s*(.*?)\s*```\s*$").expect("valid code fence regex")
});

/// 去掉模型偶尔包裹的 ```json 代码块，再按类型严格解析
pub fn parse_llm_json<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let body = CODE_FENCE
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(raw)
        .trim();

    serde_json::from_str(body)
        .map_err(|e| AppError::Upstream(format!("LLM 返回的 JSON 无法解析: {} ({})", e, raw)))
}

/// 合并阶段可见的已有记忆
#[derive(Debug, Clone, PartialEq)]
pub struct ExistingMemory {
    pub id: String,
    pub text: String,
}

/// 合并结果：对一条记忆执行的操作
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryOperation {
    /// ADD 时为空；其余事件为已有记忆的真实 ID
    pub id: Option<String>,
    pub text: String,
    pub event: EventKind,
    pub old_memory: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Extractor: Send + Sync {
    /// 对话文本 → 事实列表
    async fn extract_facts(&self, conversation: &str) -> Result<Vec<String>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Merger: Send + Sync {
    /// 新事实 × 已有记忆 → 操作列表
    async fn merge(
        &self,
        facts: Vec<String>,
        existing: Vec<ExistingMemory>,
    ) -> Result<Vec<MemoryOperation>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GraphExtractor: Send + Sync {
    /// 文本 → 关系三元组；user 用于替换第一人称
    async fn extract_relations(&self, text: &str, user: &str) -> Result<Vec<RelationTriple>>;
    /// 检索语句 → 实体名称
    async fn extract_entities(&self, query: &str, user: &str) -> Result<Vec<String>>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProceduralSummarizer: Send + Sync {
    async fn summarize(&self, messages: Vec<Message>, prompt: Option<String>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct FactsOutput {
    #[serde(default)]
    facts: Vec<String>,
}

#[derive(Deserialize)]
struct MergeOutput {
    #[serde(default)]
    memory: Vec<MergeItem>,
}

#[derive(Deserialize)]
struct MergeItem {
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    text: String,
    event: String,
    #[serde(default)]
    old_memory: Option<String>,
}

#[derive(Deserialize)]
struct RelationsOutput {
    #[serde(default)]
    relations: Vec<RelationTriple>,
}

#[derive(Deserialize)]
struct EntitiesOutput {
    #[serde(default)]
    entities: Vec<String>,
}

fn id_to_string(id: &serde_json::Value) -> String {
    match id {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub struct LlmExtractor {
    chat: Arc<dyn ChatModel>,
    prompt: String,
}

impl LlmExtractor {
    pub fn new(chat: Arc<dyn ChatModel>, custom_prompt: Option<String>) -> Self {
        Self {
            chat,
            prompt: custom_prompt.unwrap_or_else(|| prompts::FACT_EXTRACTION_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl Extractor for LlmExtractor {
    async fn extract_facts(&self, conversation: &str) -> Result<Vec<String>> {
        let raw = self
            .chat
            .complete(
                ChatRequest::new(vec![
                    ChatMessage::system(&self.prompt),
                    ChatMessage::user(&format!("Input:\n{}", conversation)),
                ])
                .json(),
            )
            .await?;

        let output: FactsOutput = parse_llm_json(&raw)?;
        let facts: Vec<String> = output
            .facts
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        debug!(count = facts.len(), "Extracted facts");
        Ok(facts)
    }
}

/// 合并器
///
/// 发送给模型的是临时整数 ID（"0"、"1"…），返回后映射回真实 ID，
/// 避免模型改写 UUID。未知 ID 的操作会被跳过。
pub struct LlmMerger {
    chat: Arc<dyn ChatModel>,
    prompt: String,
}

impl LlmMerger {
    pub fn new(chat: Arc<dyn ChatModel>, custom_prompt: Option<String>) -> Self {
        Self {
            chat,
            prompt: custom_prompt.unwrap_or_else(|| prompts::UPDATE_MEMORY_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl Merger for LlmMerger {
    async fn merge(
        &self,
        facts: Vec<String>,
        existing: Vec<ExistingMemory>,
    ) -> Result<Vec<MemoryOperation>> {
        if facts.is_empty() {
            return Ok(Vec::new());
        }

        let id_map: HashMap<String, &ExistingMemory> = existing
            .iter()
            .enumerate()
            .map(|(i, m)| (i.to_string(), m))
            .collect();
        let existing_json = serde_json::to_string(
            &existing
                .iter()
                .enumerate()
                .map(|(i, m)| serde_json::json!({ "id": i.to_string(), "text": m.text }))
                .collect::<Vec<_>>(),
        )?;
        let facts_json = serde_json::to_string(&facts)?;

        let raw = self
            .chat
            .complete(
                ChatRequest::new(vec![ChatMessage::user(&prompts::update_memory_prompt(
                    &self.prompt,
                    &existing_json,
                    &facts_json,
                ))])
                .json(),
            )
            .await?;
        let output: MergeOutput = parse_llm_json(&raw)?;

        let mut operations = Vec::new();
        for item in output.memory {
            let event: EventKind = match item.event.parse() {
                Ok(event) => event,
                Err(_) => {
                    warn!(event = %item.event, "Skipping merge item with unknown event");
                    continue;
                }
            };

            if event == EventKind::Add {
                if item.text.trim().is_empty() {
                    warn!("Skipping ADD with empty text");
                    continue;
                }
                operations.push(MemoryOperation {
                    id: None,
                    text: item.text,
                    event,
                    old_memory: None,
                });
                continue;
            }

            let temp_id = item.id.as_ref().map(id_to_string).unwrap_or_default();
            let Some(target) = id_map.get(&temp_id) else {
                warn!(id = %temp_id, event = %event, "Merge referenced an unknown memory id, skipping");
                continue;
            };
            if event == EventKind::Update && item.text.trim().is_empty() {
                warn!(id = %target.id, "Skipping UPDATE with empty text");
                continue;
            }

            operations.push(MemoryOperation {
                id: Some(target.id.clone()),
                text: if item.text.is_empty() {
                    target.text.clone()
                } else {
                    item.text
                },
                event,
                old_memory: item.old_memory.or_else(|| Some(target.text.clone())),
            });
        }

        Ok(operations)
    }
}

pub struct LlmGraphExtractor {
    chat: Arc<dyn ChatModel>,
}

impl LlmGraphExtractor {
    pub fn new(chat: Arc<dyn ChatModel>) -> Self {
        Self { chat }
    }
}

#[async_trait]
impl GraphExtractor for LlmGraphExtractor {
    async fn extract_relations(&self, text: &str, user: &str) -> Result<Vec<RelationTriple>> {
        let raw = self
            .chat
            .complete(
                ChatRequest::new(vec![
                    ChatMessage::system(&prompts::with_user(prompts::GRAPH_EXTRACTION_PROMPT, user)),
                    ChatMessage::user(text),
                ])
                .json(),
            )
            .await?;

        let output: RelationsOutput = parse_llm_json(&raw)?;
        Ok(output
            .relations
            .into_iter()
            .filter(|r| {
                !r.source.trim().is_empty()
                    && !r.relationship.trim().is_empty()
                    && !r.destination.trim().is_empty()
            })
            .collect())
    }

    async fn extract_entities(&self, query: &str, user: &str) -> Result<Vec<String>> {
        let raw = self
            .chat
            .complete(
                ChatRequest::new(vec![
                    ChatMessage::system(&prompts::with_user(prompts::QUERY_ENTITIES_PROMPT, user)),
                    ChatMessage::user(query),
                ])
                .json(),
            )
            .await?;

        let output: EntitiesOutput = parse_llm_json(&raw)?;
        Ok(output
            .entities
            .into_iter()
            .filter(|e| !e.trim().is_empty())
            .collect())
    }
}

pub struct LlmProceduralSummarizer {
    chat: Arc<dyn ChatModel>,
    default_prompt: String,
}

impl LlmProceduralSummarizer {
    pub fn new(chat: Arc<dyn ChatModel>, configured_prompt: Option<String>) -> Self {
        Self {
            chat,
            default_prompt: configured_prompt
                .unwrap_or_else(|| prompts::PROCEDURAL_MEMORY_PROMPT.to_string()),
        }
    }
}

#[async_trait]
impl ProceduralSummarizer for LlmProceduralSummarizer {
    async fn summarize(&self, messages: Vec<Message>, prompt: Option<String>) -> Result<String> {
        let system = prompt.unwrap_or_else(|| self.default_prompt.clone());
        let conversation = format_conversation(&messages);

        let summary = self
            .chat
            .complete(ChatRequest::new(vec![
                ChatMessage::system(&system),
                ChatMessage::user(&conversation),
            ]))
            .await?;

        let summary = summary.trim().to_string();
        if summary.is_empty() {
            return Err(AppError::Upstream("过程记忆总结为空".to_string()));
        }
        Ok(summary)
    }
}
