//! 模型调用模块
//!
//! 对话模型客户端、内置 prompt，以及基于 LLM 的抽取 / 合并实现。

pub mod client;
pub mod extraction;
pub mod prompts;

pub use client::{AzureOpenAiChat, ChatMessage, ChatModel, ChatRequest, create_chat_model};
pub use extraction::{
    ExistingMemory, Extractor, GraphExtractor, LlmExtractor, LlmGraphExtractor, LlmMerger,
    LlmProceduralSummarizer, MemoryOperation, Merger, ProceduralSummarizer, parse_llm_json,
};
