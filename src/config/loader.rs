use crate::config::config::{AppConfig, VectorStoreConfig};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml, Yaml},
};
use std::path::{Path, PathBuf};

/// 环境变量前缀，嵌套键用 `__` 分隔，例如 `KEMEM_SERVER__PORT=9000`
pub const ENV_PREFIX: &str = "KEMEM_";

/// 配置加载器
pub struct ConfigLoader;

impl ConfigLoader {
    /// 从默认路径加载配置
    ///
    /// 合并顺序（后者覆盖前者）：
    /// 1. 内置默认值
    /// 2. ./kemem.toml
    /// 3. ./kemem.yaml
    /// 4. 环境变量 KEMEM_*
    pub fn load() -> Result<AppConfig, figment::Error> {
        Self::figment(None).extract()
    }

    /// 从指定路径加载配置（按扩展名选择 TOML 或 YAML）
    pub fn load_from(path: PathBuf) -> Result<AppConfig, figment::Error> {
        Self::figment(Some(&path)).extract()
    }

    fn figment(path: Option<&Path>) -> Figment {
        let base = Figment::from(Serialized::defaults(AppConfig::default()));

        let with_files = match path {
            Some(p) if is_yaml(p) => base.merge(Yaml::file(p)),
            Some(p) => base.merge(Toml::file(p)),
            None => base
                .merge(Toml::file(default_config_path()))
                .merge(Yaml::file("kemem.yaml")),
        };

        with_files.merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 验证配置
    pub fn validate(config: &AppConfig) -> Result<(), ConfigValidationError> {
        if config.server.port == 0 {
            return Err(ConfigValidationError::InvalidPort);
        }

        if config.embedder.dimension() == 0 {
            return Err(ConfigValidationError::InvalidDimension);
        }

        if config.vector_store.collection().is_empty() {
            return Err(ConfigValidationError::MissingCollection);
        }

        if let VectorStoreConfig::Qdrant { url, .. } = &config.vector_store {
            if url.is_empty() {
                return Err(ConfigValidationError::MissingVectorStoreUrl);
            }
        }

        if config.extraction.default_search_limit == 0 || config.extraction.default_list_limit == 0
        {
            return Err(ConfigValidationError::InvalidLimit);
        }

        Ok(())
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

/// 配置验证错误
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum ConfigValidationError {
    #[error("服务端口无效，必须大于 0")]
    InvalidPort,

    #[error("向量维度无效，必须大于 0")]
    InvalidDimension,

    #[error("向量集合名称未配置")]
    MissingCollection,

    #[error("Qdrant 地址未配置")]
    MissingVectorStoreUrl,

    #[error("默认检索条数必须大于 0")]
    InvalidLimit,
}

/// 获取默认配置文件路径
pub fn default_config_path() -> PathBuf {
    PathBuf::from("kemem.toml")
}

/// 检查配置文件是否存在
pub fn config_exists() -> bool {
    default_config_path().exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::config::{EmbedderConfig, SqliteStoreConfig};

    #[test]
    fn test_defaults_validate() {
        let config = AppConfig::default();
        assert_eq!(ConfigLoader::validate(&config), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_port_and_dimension() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigValidationError::InvalidPort)
        );

        let mut config = AppConfig::default();
        config.embedder = EmbedderConfig::Hash { embedding_dims: 0 };
        assert_eq!(
            ConfigLoader::validate(&config),
            Err(ConfigValidationError::InvalidDimension)
        );
    }

    #[test]
    fn test_load_from_toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kemem.toml");
        std::fs::write(
            &path,
            r#"
enable_graph = false

[server]
port = 9100

[embedder]
provider = "hash"
embedding_dims = 32

[history]
provider = "memory"
"#,
        )
        .unwrap();

        let config = ConfigLoader::load_from(path).unwrap();
        assert_eq!(config.server.port, 9100);
        assert_eq!(config.embedder, EmbedderConfig::Hash { embedding_dims: 32 });
        assert_eq!(config.history, SqliteStoreConfig::Memory);
        assert!(!config.graph_enabled());
        // 未覆盖的字段保持默认
        assert_eq!(config.server.host, "0.0.0.0");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kemem.yaml");
        std::fs::write(
            &path,
            "vector_store:\n  provider: qdrant\n  url: http://localhost:6333\n  collection: facts\n",
        )
        .unwrap();

        let config = ConfigLoader::load_from(path).unwrap();
        assert_eq!(config.vector_store.collection(), "facts");
        assert!(matches!(
            config.vector_store,
            VectorStoreConfig::Qdrant { .. }
        ));
    }
}
