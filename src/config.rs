//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `ARCH__*` 覆盖（双下划线表示嵌套，如 `ARCH__PIPELINE__MAX_WORKERS=8`）。

use std::path::PathBuf;

use serde::Deserialize;

use crate::core::task_scheduler::DEFAULT_MAX_WORKERS;
use crate::llm::embedding::DEFAULT_HASH_DIMENSION;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub pipeline: PipelineSection,
    pub memory: MemorySection,
    pub llm: LlmSection,
    pub embedding: EmbeddingSection,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 待分析的仓库，命令行 --repo 优先
    pub repo_path: Option<PathBuf>,
}

/// [pipeline] 段：Worker 池大小、精化循环上限
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSection {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_max_refine_iters")]
    pub max_refine_iters: usize,
    /// Excavator 最多读取的提交数
    #[serde(default = "default_max_commits")]
    pub max_commits: usize,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

fn default_max_refine_iters() -> usize {
    5
}

fn default_max_commits() -> usize {
    100
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_refine_iters: default_max_refine_iters(),
            max_commits: default_max_commits(),
        }
    }
}

/// [memory] 段：侧车目录、历史窗口、压缩保留条数、会话空闲超时
#[derive(Debug, Clone, Deserialize)]
pub struct MemorySection {
    #[serde(default = "default_persist_dir")]
    pub persist_dir: PathBuf,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_keep_last")]
    pub keep_last: usize,
    #[serde(default = "default_session_idle_secs")]
    pub session_idle_secs: u64,
}

fn default_persist_dir() -> PathBuf {
    PathBuf::from("memory_store")
}

fn default_history_limit() -> usize {
    50
}

fn default_keep_last() -> usize {
    10
}

fn default_session_idle_secs() -> u64 {
    3600
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            persist_dir: default_persist_dir(),
            history_limit: default_history_limit(),
            keep_last: default_keep_last(),
            session_idle_secs: default_session_idle_secs(),
        }
    }
}

/// [llm] 段：生成后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// openai / deepseek / stub
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [embedding] 段
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingSection {
    /// hash / openai
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// HashEmbedder 维度
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

fn default_embedding_provider() -> String {
    "hash".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimension() -> usize {
    DEFAULT_HASH_DIMENSION
}

impl Default for EmbeddingSection {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: default_embedding_model(),
            base_url: None,
            dimension: default_dimension(),
        }
    }
}

/// 从 config 目录加载配置，环境变量 ARCH__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 ARCH__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        } else {
            tracing::warn!("config file {} not found, ignored", path.display());
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("ARCH")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 加载配置；文件缺失或无法解析时记录警告并使用默认值
pub fn load_config_or_default(config_path: Option<PathBuf>) -> AppConfig {
    load_config(config_path).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.pipeline.max_workers, 4);
        assert_eq!(cfg.pipeline.max_refine_iters, 5);
        assert_eq!(cfg.memory.keep_last, 10);
        assert_eq!(cfg.memory.persist_dir, PathBuf::from("memory_store"));
        assert_eq!(cfg.embedding.provider, "hash");
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "[pipeline]\nmax_workers = 8\n\n[memory]\nkeep_last = 3\n\n[llm]\nprovider = \"stub\"\n",
        )
        .unwrap();

        let cfg = load_config(Some(path)).unwrap();
        assert_eq!(cfg.pipeline.max_workers, 8);
        assert_eq!(cfg.pipeline.max_refine_iters, 5);
        assert_eq!(cfg.memory.keep_last, 3);
        assert_eq!(cfg.memory.history_limit, 50);
        assert_eq!(cfg.llm.provider, "stub");
    }

    #[test]
    fn test_unparsable_config_falls_back_to_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[pipeline]\nmax_workers = \"many\"\n").unwrap();

        assert!(load_config(Some(path.clone())).is_err());
        let cfg = load_config_or_default(Some(path));
        assert_eq!(cfg.pipeline.max_workers, 4);
        assert_eq!(cfg.memory.history_limit, 50);
    }
}
