//! kemem-cli：批量写入对话、检索记忆、查看三个存储和探测模型端点。

use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use kemem::config::{AppConfig, ConfigLoader};
use kemem::index::{ScrollRequest, create_embedding_model, create_vector_index};
use kemem::llm::{ChatMessage, ChatRequest, create_chat_model};
use kemem::models::history::{EventKind, HistoryQuery};
use kemem::models::memory::{Message, Scope};
use kemem::observability::init_tracing;
use kemem::services::{AddMemoryRequest, MemoryService, SearchRequest};
use kemem::storage::{GraphStore, HistoryStore};

/// KeMem 记忆管理命令行工具
#[derive(Parser)]
#[command(name = "kemem-cli", version)]
struct Cli {
    /// 配置文件路径（TOML / YAML），默认读取 ./kemem.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 从对话文件批量写入记忆，每行一个 JSON 消息数组
    Add {
        #[arg(long, default_value = "chats.txt", value_name = "FILE")]
        chats: PathBuf,
        #[arg(long, default_value = "user_001", value_name = "ID")]
        user_id: String,
        /// 经过 LLM 抽取事实后再写入
        #[arg(long)]
        infer: bool,
        /// 同时写入图存储；配置中已启用时无需指定
        #[arg(long)]
        graph: bool,
        /// 自定义记忆合并 prompt 文件
        #[arg(long, value_name = "FILE")]
        update_memory_prompt: Option<PathBuf>,
    },
    /// 语义检索
    Search {
        query: String,
        #[arg(long, default_value = "user_001", value_name = "ID")]
        user_id: String,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long)]
        graph: bool,
    },
    /// 查看存储中的原始数据
    Dump {
        #[command(subcommand)]
        target: DumpTarget,
    },
    /// 对模型端点发起单次调用
    Probe {
        #[command(subcommand)]
        target: ProbeTarget,
    },
}

#[derive(Subcommand)]
enum DumpTarget {
    /// 历史库，按时间倒序
    History {
        #[arg(long)]
        event: Option<String>,
        #[arg(long)]
        memory_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// 向量库中的点
    Vectors {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// 图库中的节点和关系
    Graph {
        #[arg(long)]
        user_id: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[derive(Subcommand)]
enum ProbeTarget {
    Llm {
        #[arg(long, default_value = "用一句话介绍你自己")]
        prompt: String,
    },
    Embedding {
        #[arg(long, default_value = "我喜欢吃苹果")]
        text: String,
    },
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => ConfigLoader::load_from(path),
        None => ConfigLoader::load(),
    }
    .context("failed to load configuration")?;
    ConfigLoader::validate(&config)?;
    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `--graph` 只能打开图存储，不会关闭配置中已启用的图存储
fn enable_graph(config: &mut AppConfig, flag: bool) {
    config.enable_graph |= flag;
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config)?;
    let _guard = init_tracing(&config.logging);

    match cli.command {
        Command::Add {
            chats,
            user_id,
            infer,
            graph,
            update_memory_prompt,
        } => {
            enable_graph(&mut config, graph);
            if let Some(path) = update_memory_prompt {
                let prompt = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read prompt file {}", path.display()))?;
                config.extraction.custom_update_memory_prompt = Some(prompt);
                println!("使用自定义 update_memory_prompt: {}", path.display());
            }
            let service = MemoryService::from_config(&config).await?;
            add_chats(&service, &chats, &Scope::user(&user_id), infer).await
        }
        Command::Search {
            query,
            user_id,
            limit,
            graph,
        } => {
            enable_graph(&mut config, graph);
            let service = MemoryService::from_config(&config).await?;
            let result = service
                .search(SearchRequest {
                    query,
                    scope: Scope::user(&user_id),
                    limit: Some(limit),
                    threshold: None,
                })
                .await?;
            println!("找到 {} 条记忆", result.results.len());
            print_json(&result)
        }
        Command::Dump { target } => dump(&config, target).await,
        Command::Probe { target } => probe(&config, target).await,
    }
}

async fn add_chats(
    service: &MemoryService,
    chats: &Path,
    scope: &Scope,
    infer: bool,
) -> anyhow::Result<()> {
    let content = std::fs::read_to_string(chats)
        .with_context(|| format!("failed to read chats file {}", chats.display()))?;

    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_no = line_no + 1;

        let messages: Vec<Message> = match serde_json::from_str(line) {
            Ok(messages) => messages,
            Err(e) => {
                eprintln!("第 {} 行不是合法的消息数组，已跳过: {}", line_no, e);
                continue;
            }
        };

        println!("\n[{}] 添加对话: {}", line_no, line);
        let request = AddMemoryRequest::new(messages, scope.clone()).infer(infer);
        match service.add(request).await {
            Ok(result) => print_json(&result)?,
            Err(e) => {
                eprintln!("第 {} 行写入失败: {}", line_no, e);
                continue;
            }
        }

        let memories = service.get_all(scope, None).await?;
        println!("当前共有 {} 条记忆:", memories.len());
        for (i, record) in memories.iter().enumerate() {
            println!("  {}. {} ({})", i + 1, record.memory, record.id);
        }
    }
    Ok(())
}

async fn dump(config: &AppConfig, target: DumpTarget) -> anyhow::Result<()> {
    match target {
        DumpTarget::History {
            event,
            memory_id,
            limit,
        } => {
            let history = HistoryStore::open(&config.history)?;
            let query = HistoryQuery {
                event: event.as_deref().map(str::parse::<EventKind>).transpose()?,
                memory_id,
                limit,
            };
            let events = history.query(&query)?;
            println!("共 {} 条历史记录", events.len());
            print_json(&events)?;
            print_json(&history.stats()?)
        }
        DumpTarget::Vectors { user_id, limit } => {
            let index =
                create_vector_index(&config.vector_store, config.embedder.dimension()).await?;
            let page = index
                .scroll(ScrollRequest {
                    filter: user_id.as_deref().map(Scope::user),
                    limit,
                    ..Default::default()
                })
                .await?;
            print_json(&index.info().await?)?;
            for point in &page.points {
                println!("{}  {}", point.id, point.payload.data);
            }
            if let Some(next) = page.next_offset {
                println!("(还有更多，下一页从 {} 开始)", next);
            }
            Ok(())
        }
        DumpTarget::Graph { user_id, limit } => {
            let graph = GraphStore::open(&config.graph_store)?;
            let scope = user_id.as_deref().map(Scope::user);
            let nodes = graph.entities(scope.as_ref(), limit)?;
            let mentions = graph.mention_total(&scope.clone().unwrap_or_default())?;
            let relations = graph.relations(scope.as_ref(), limit)?;

            println!("节点 {} 个，mentions 合计 {}:", nodes.len(), mentions);
            for node in &nodes {
                println!("  {} (mentions={})", node.name, node.mentions);
            }
            println!("关系 {} 条:", relations.len());
            for r in &relations {
                println!(
                    "  {} --{}--> {} (mentions={})",
                    r.source, r.relationship, r.destination, r.mentions
                );
            }
            print_json(&graph.stats()?)
        }
    }
}

async fn probe(config: &AppConfig, target: ProbeTarget) -> anyhow::Result<()> {
    match target {
        ProbeTarget::Llm { prompt } => {
            let Some(chat) = create_chat_model(&config.llm)? else {
                bail!("LLM is disabled in the configuration");
            };
            let reply = chat
                .complete(ChatRequest::new(vec![ChatMessage::user(&prompt)]))
                .await?;
            println!("[{}] {}", chat.model_name(), reply);
        }
        ProbeTarget::Embedding { text } => {
            let embedder = create_embedding_model(&config.embedder)?;
            let vector = embedder.encode(&text).await?;
            println!("dimension: {}", vector.len());
            println!(
                "first_5_values: {:?}",
                vector.iter().take(5).collect::<Vec<_>>()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_graph_flag_never_disables_configured_graph() {
        let mut config = AppConfig::in_memory(8);
        config.enable_graph = true;
        enable_graph(&mut config, false);
        assert!(config.enable_graph);

        config.enable_graph = false;
        enable_graph(&mut config, false);
        assert!(!config.enable_graph);
        enable_graph(&mut config, true);
        assert!(config.enable_graph);
    }

    #[test]
    fn test_add_command_defaults() {
        let cli = Cli::try_parse_from(["kemem-cli", "add"]).unwrap();
        match cli.command {
            Command::Add {
                chats,
                user_id,
                graph,
                ..
            } => {
                assert_eq!(chats, PathBuf::from("chats.txt"));
                assert_eq!(user_id, "user_001");
                assert!(!graph);
            }
            _ => panic!("expected add command"),
        }
    }
}
