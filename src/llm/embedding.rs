//! 嵌入能力：供向量长期记忆使用
//!
//! - `HashEmbedder`：离线、确定性的特征哈希向量（默认，测试也用它）
//! - `OpenAiEmbedder`：调用 OpenAI 兼容的 /embeddings 端点

use std::sync::Arc;

use async_openai::config::OpenAIConfig;
use async_openai::types::embeddings::{CreateEmbeddingRequestArgs, EmbeddingInput};
use async_openai::Client;

use crate::config::EmbeddingSection;
use crate::core::error::BackendError;

/// 可从同步上下文（含 Worker 池的阻塞线程）调用的嵌入提供方
pub trait Embedder: Send + Sync {
    /// 将文本编码为定长向量
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError>;

    fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
        texts.iter().map(|t| self.embed(t)).collect()
    }
}

/// 特征哈希嵌入：词 + 字符三元组哈希到固定维度，再做 L2 归一化
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimension: usize,
}

pub const DEFAULT_HASH_DIMENSION: usize = 256;

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(8),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn bump(&self, vec: &mut [f32], feature: &str, weight: f32) {
        let h = fnv1a(feature.as_bytes());
        let idx = (h % self.dimension as u64) as usize;
        let sign = if (h >> 63) & 1 == 0 { 1.0 } else { -1.0 };
        vec[idx] += sign * weight;
    }
}

impl Default for HashEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASH_DIMENSION)
    }
}

impl Embedder for HashEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let mut vec = vec![0.0f32; self.dimension];
        let lower = text.to_lowercase();

        for word in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            self.bump(&mut vec, word, 1.0);
        }

        let chars: Vec<char> = format!(" {} ", lower.trim()).chars().collect();
        for window in chars.windows(3) {
            let gram: String = window.iter().collect();
            self.bump(&mut vec, &gram, 0.5);
        }

        let norm = vec.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            vec.iter_mut().for_each(|x| *x /= norm);
        }
        Ok(vec)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;
    bytes
        .iter()
        .fold(OFFSET, |h, b| (h ^ u64::from(*b)).wrapping_mul(PRIME))
}

/// 使用 async-openai 调用 OpenAI 兼容的 embeddings API
#[derive(Clone)]
pub struct OpenAiEmbedder {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(base_url: Option<&str>, model: &str, api_key: &str) -> Self {
        let config = match base_url {
            Some(url) => OpenAIConfig::new().with_api_base(url).with_api_key(api_key),
            None => OpenAIConfig::new().with_api_key(api_key),
        };
        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    pub async fn embed_async(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BackendError::EmptyEmbedding);
        }
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .input(EmbeddingInput::String(text.to_string()))
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        let response = self
            .client
            .embeddings()
            .create(request)
            .await
            .map_err(|e| BackendError::Request(e.to_string()))?;
        response
            .data
            .first()
            .map(|e| e.embedding.clone())
            .filter(|v| !v.is_empty())
            .ok_or(BackendError::EmptyEmbedding)
    }
}

impl Embedder for OpenAiEmbedder {
    /// 在多线程运行时的 worker 上用 block_in_place，在阻塞线程上直接 block_on
    fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
        let handle = tokio::runtime::Handle::try_current()
            .map_err(|_| BackendError::Unavailable("no tokio runtime for embeddings".to_string()))?;
        match handle.runtime_flavor() {
            tokio::runtime::RuntimeFlavor::CurrentThread => Err(BackendError::Unavailable(
                "OpenAI embeddings need a multi-thread runtime".to_string(),
            )),
            _ => tokio::task::block_in_place(|| handle.block_on(self.embed_async(text))),
        }
    }
}

/// 从配置创建嵌入提供方；openai 缺少 API Key 时退回 HashEmbedder
pub fn create_embedder_from_config(cfg: &EmbeddingSection) -> Arc<dyn Embedder> {
    if cfg.provider.eq_ignore_ascii_case("openai") {
        let key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        if !key.is_empty() {
            tracing::info!("Using OpenAI embeddings ({})", cfg.model);
            return Arc::new(OpenAiEmbedder::new(cfg.base_url.as_deref(), &cfg.model, &key));
        }
        tracing::warn!("OPENAI_API_KEY not set; falling back to hash embeddings");
    }
    Arc::new(HashEmbedder::new(cfg.dimension))
}
