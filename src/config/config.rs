use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// 服务地址
    pub host: String,
    /// 服务端口
    pub port: u16,
    /// 请求超时（秒）
    pub request_timeout: u64,
    /// 是否允许任意来源的跨域请求（调试面板使用）
    pub cors_allow_any: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8000,
            request_timeout: 120,
            cors_allow_any: true,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    pub level: String,
    /// 结构化（JSON）日志格式
    pub structured: bool,
    /// 日志文件目录，按天滚动
    pub log_dir: Option<PathBuf>,
    /// 日志文件名前缀
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            structured: false,
            log_dir: None,
            file_prefix: "kemem.log".into(),
        }
    }
}

/// Azure OpenAI 部署连接信息（对应 azure_kwargs）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AzureDeployment {
    /// 例如 https://bk-us-2.openai.azure.com
    pub azure_endpoint: String,
    pub azure_deployment: String,
    pub api_version: String,
    /// 直接写在配置里的 API Key
    pub api_key: Option<String>,
    /// 未配置 api_key 时，从该环境变量读取
    pub api_key_env: String,
    /// 请求超时（秒）
    pub timeout_secs: u64,
}

impl Default for AzureDeployment {
    fn default() -> Self {
        Self {
            azure_endpoint: "https://bk-us-2.openai.azure.com".into(),
            azure_deployment: "gpt-4.1-nano".into(),
            api_version: "2025-01-01-preview".into(),
            api_key: None,
            api_key_env: "GPT_41_NANO_KEY".into(),
            timeout_secs: 60,
        }
    }
}

impl AzureDeployment {
    /// 解析 API Key：配置值优先，其次环境变量
    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|k| !k.is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|k| !k.is_empty())
    }

    /// `{endpoint}/openai/deployments/{deployment}/{operation}?api-version={v}`
    pub fn url(&self, operation: &str) -> String {
        format!(
            "{}/openai/deployments/{}/{}?api-version={}",
            self.azure_endpoint.trim_end_matches('/'),
            self.azure_deployment,
            operation,
            self.api_version
        )
    }
}

/// LLM 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum LlmConfig {
    #[serde(rename = "azure_openai")]
    AzureOpenai {
        #[serde(default = "default_llm_model")]
        model: String,
        #[serde(default)]
        azure_kwargs: AzureDeployment,
        #[serde(default = "default_temperature")]
        temperature: f32,
        #[serde(default = "default_max_tokens")]
        max_tokens: u32,
    },
    /// 不配置 LLM：infer / 过程记忆 / 图抽取不可用
    #[serde(rename = "disabled")]
    Disabled,
}

fn default_llm_model() -> String {
    "gpt-4.1-nano".into()
}

fn default_temperature() -> f32 {
    0.1
}

fn default_max_tokens() -> u32 {
    2000
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig::AzureOpenai {
            model: default_llm_model(),
            azure_kwargs: AzureDeployment::default(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

/// Embedding 配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum EmbedderConfig {
    #[serde(rename = "azure_openai")]
    AzureOpenai {
        #[serde(default = "default_embedding_model")]
        model: String,
        #[serde(default = "default_embedding_deployment")]
        azure_kwargs: AzureDeployment,
        #[serde(default = "default_embedding_dims")]
        embedding_dims: usize,
        #[serde(default = "default_batch_size")]
        batch_size: usize,
    },
    /// 本地字符 n-gram 哈希向量，离线调试和测试使用
    #[serde(rename = "hash")]
    Hash {
        #[serde(default = "default_embedding_dims")]
        embedding_dims: usize,
    },
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_deployment() -> AzureDeployment {
    AzureDeployment {
        azure_endpoint: "https://bk-cloud.openai.azure.com".into(),
        azure_deployment: "text-embedding-3-small".into(),
        api_version: "2023-05-15".into(),
        api_key: None,
        api_key_env: "TEXT_EMBEDDING_3_SMALL".into(),
        timeout_secs: 60,
    }
}

fn default_embedding_dims() -> usize {
    1536
}

fn default_batch_size() -> usize {
    16
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        EmbedderConfig::AzureOpenai {
            model: default_embedding_model(),
            azure_kwargs: default_embedding_deployment(),
            embedding_dims: default_embedding_dims(),
            batch_size: default_batch_size(),
        }
    }
}

impl EmbedderConfig {
    pub fn dimension(&self) -> usize {
        match self {
            EmbedderConfig::AzureOpenai { embedding_dims, .. } => *embedding_dims,
            EmbedderConfig::Hash { embedding_dims } => *embedding_dims,
        }
    }
}

/// 向量库配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum VectorStoreConfig {
    /// 进程内索引；设置 path 时落盘为 JSON 快照
    #[serde(rename = "local")]
    Local {
        #[serde(default = "default_collection")]
        collection: String,
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// 远端 Qdrant（REST API）
    #[serde(rename = "qdrant")]
    Qdrant {
        url: String,
        #[serde(default = "default_collection")]
        collection: String,
        #[serde(default)]
        api_key: Option<String>,
        #[serde(default = "default_true")]
        on_disk: bool,
        #[serde(default = "default_store_timeout")]
        timeout_secs: u64,
    },
}

fn default_collection() -> String {
    "mem0".into()
}

fn default_true() -> bool {
    true
}

fn default_store_timeout() -> u64 {
    30
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        VectorStoreConfig::Local {
            collection: default_collection(),
            path: Some(PathBuf::from("./memorydb/vector/mem0.json")),
        }
    }
}

impl VectorStoreConfig {
    pub fn collection(&self) -> &str {
        match self {
            VectorStoreConfig::Local { collection, .. } => collection,
            VectorStoreConfig::Qdrant { collection, .. } => collection,
        }
    }
}

/// SQLite 存储位置（历史库 / 图库共用）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "provider")]
pub enum SqliteStoreConfig {
    #[serde(rename = "sqlite")]
    Sqlite { path: PathBuf },
    /// 进程内 SQLite，进程退出即丢失
    #[serde(rename = "memory")]
    Memory,
}

/// 记忆抽取与检索配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// 自定义事实抽取 prompt
    pub custom_fact_extraction_prompt: Option<String>,
    /// 自定义记忆合并 prompt
    pub custom_update_memory_prompt: Option<String>,
    /// 过程记忆总结 prompt
    pub procedural_memory_prompt: Option<String>,
    /// infer 模式下每条事实检索的相似记忆数
    pub similar_memories: usize,
    /// search 默认返回条数
    pub default_search_limit: usize,
    /// get_all 默认返回条数
    pub default_list_limit: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            custom_fact_extraction_prompt: None,
            custom_update_memory_prompt: None,
            procedural_memory_prompt: None,
            similar_memories: 5,
            default_search_limit: 5,
            default_list_limit: 100,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 服务器配置
    pub server: ServerConfig,
    /// 日志配置
    pub logging: LoggingConfig,
    /// LLM 配置
    pub llm: LlmConfig,
    /// Embedding 配置
    pub embedder: EmbedderConfig,
    /// 向量库配置
    pub vector_store: VectorStoreConfig,
    /// 是否启用图存储
    pub enable_graph: bool,
    /// 图库配置
    pub graph_store: SqliteStoreConfig,
    /// 历史库配置
    pub history: SqliteStoreConfig,
    /// 抽取与检索配置
    pub extraction: ExtractionConfig,
    /// 应用名称
    pub app_name: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            llm: LlmConfig::default(),
            embedder: EmbedderConfig::default(),
            vector_store: VectorStoreConfig::default(),
            enable_graph: true,
            graph_store: SqliteStoreConfig::Sqlite {
                path: PathBuf::from("./memorydb/graph/kemem_graph.db"),
            },
            history: SqliteStoreConfig::Sqlite {
                path: PathBuf::from("./memorydb/history/history.db"),
            },
            extraction: ExtractionConfig::default(),
            app_name: "kemem".into(),
        }
    }
}

impl AppConfig {
    /// 完全进程内、无外部依赖的配置（测试与本地调试）
    pub fn in_memory(dimension: usize) -> Self {
        Self {
            llm: LlmConfig::Disabled,
            embedder: EmbedderConfig::Hash {
                embedding_dims: dimension,
            },
            vector_store: VectorStoreConfig::Local {
                collection: default_collection(),
                path: None,
            },
            graph_store: SqliteStoreConfig::Memory,
            history: SqliteStoreConfig::Memory,
            ..Self::default()
        }
    }

    /// 当前配置是否启用图存储
    pub fn graph_enabled(&self) -> bool {
        self.enable_graph
    }
}
