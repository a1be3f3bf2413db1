//! LLM 层：生成（OpenAI 兼容 / DeepSeek / Stub）与嵌入能力

pub mod deepseek;
pub mod embedding;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use deepseek::{create_deepseek_generator, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use embedding::{create_embedder_from_config, Embedder, HashEmbedder, OpenAiEmbedder};
pub use mock::{stub_response, StubGenerator};
pub use openai::{OpenAiGenerator, TokenUsage};
pub use traits::{generate_or_stub, Generator};

use crate::config::LlmSection;

/// 按配置选择生成后端；缺少 API Key 或 provider 为 stub 时使用 StubGenerator
pub fn create_generator_from_config(cfg: &LlmSection) -> Arc<dyn Generator> {
    let provider = cfg.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.request_timeout_secs.max(1));
    let openai_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.is_empty());
    let deepseek_key = std::env::var("DEEPSEEK_API_KEY").ok().filter(|k| !k.is_empty());

    match provider.as_str() {
        "deepseek" => {
            if let Some(key) = deepseek_key.or(openai_key) {
                let model = Some(cfg.model.as_str()).filter(|m| m.starts_with("deepseek"));
                let generator = create_deepseek_generator(model, &key).with_timeout(timeout);
                tracing::info!("Using DeepSeek LLM ({})", generator.model());
                return Arc::new(generator);
            }
        }
        "openai" => {
            if let Some(key) = openai_key {
                tracing::info!("Using OpenAI LLM ({})", cfg.model);
                return Arc::new(
                    OpenAiGenerator::new(cfg.base_url.as_deref(), &cfg.model, &key)
                        .with_timeout(timeout),
                );
            }
        }
        _ => {}
    }

    tracing::warn!("No API key set or provider is '{}', using stub LLM", cfg.provider);
    Arc::new(StubGenerator)
}
