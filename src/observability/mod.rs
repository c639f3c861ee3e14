//! 可观测性模块
//!
//! 提供 tracing 日志初始化和简单的 Prometheus 文本格式指标。

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// 初始化全局 tracing subscriber
///
/// `RUST_LOG` 优先于配置中的 level。配置了 log_dir 时额外写入按天滚动的日志文件，
/// 返回的 guard 需要在进程生命周期内持有。
pub fn init_tracing(config: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let (file_writer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, &config.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter);

    // try_init: 测试或 CLI 中重复初始化时不 panic
    let result = if config.structured {
        registry
            .with(fmt::layer().json())
            .with(file_writer.map(|w| fmt::layer().json().with_ansi(false).with_writer(w)))
            .try_init()
    } else {
        registry
            .with(fmt::layer())
            .with(file_writer.map(|w| fmt::layer().with_ansi(false).with_writer(w)))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing subscriber already initialized: {}", e);
    }

    guard
}

/// 应用指标
#[derive(Clone, Default)]
pub struct AppMetrics {
    pub http_requests_total: Arc<AtomicU64>,
    pub http_request_duration_sum: Arc<AtomicU64>,
    pub memories_added_total: Arc<AtomicU64>,
    pub search_requests_total: Arc<AtomicU64>,
    pub search_latency_sum: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

impl AppMetrics {
    /// 记录 HTTP 请求
    pub fn record_http_request(&self, duration_ms: u64) {
        self.http_requests_total.fetch_add(1, Ordering::Relaxed);
        self.http_request_duration_sum
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    /// 记录新写入的记忆条数
    pub fn record_added(&self, count: u64) {
        self.memories_added_total.fetch_add(count, Ordering::Relaxed);
    }

    /// 记录搜索请求
    pub fn record_search(&self, duration_ms: u64) {
        self.search_requests_total.fetch_add(1, Ordering::Relaxed);
        self.search_latency_sum
            .fetch_add(duration_ms, Ordering::Relaxed);
    }

    /// 记录错误
    pub fn record_error(&self) {
        self.errors_total.fetch_add(1, Ordering::Relaxed);
    }

    /// 生成 Prometheus 格式指标
    pub fn gather(&self) -> String {
        format!(
            r#"# HELP http_requests_total Total HTTP requests
# TYPE http_requests_total counter
http_requests_total {}
# HELP http_request_duration_seconds HTTP request duration in seconds
# TYPE http_request_duration_seconds summary
http_request_duration_seconds_sum {}
http_request_duration_seconds_count {}
# HELP memories_added_total Memory records written by add
# TYPE memories_added_total counter
memories_added_total {}
# HELP search_requests_total Total search requests
# TYPE search_requests_total counter
search_requests_total {}
# HELP search_latency_seconds Search request latency in seconds
# TYPE search_latency_seconds summary
search_latency_seconds_sum {}
search_latency_seconds_count {}
# HELP errors_total Total failed requests
# TYPE errors_total counter
errors_total {}
"#,
            self.http_requests_total.load(Ordering::Relaxed),
            self.http_request_duration_sum.load(Ordering::Relaxed) as f64 / 1000.0,
            self.http_requests_total.load(Ordering::Relaxed),
            self.memories_added_total.load(Ordering::Relaxed),
            self.search_requests_total.load(Ordering::Relaxed),
            self.search_latency_sum.load(Ordering::Relaxed) as f64 / 1000.0,
            self.search_requests_total.load(Ordering::Relaxed),
            self.errors_total.load(Ordering::Relaxed),
        )
    }
}
