//! 文本生成能力
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Stub）实现 Generator；编排层对真实后端与桩完全一致地调用。

use async_trait::async_trait;

use crate::core::error::BackendError;
use crate::llm::mock::stub_response;

/// 生成器 trait：`generate(prompt) -> String`
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError>;

    /// 后端名称，用于日志
    fn name(&self) -> &str {
        "generator"
    }
}

/// 调用生成器，失败时记录日志并退回确定性的桩响应
pub async fn generate_or_stub(generator: &dyn Generator, prompt: &str) -> String {
    match generator.generate(prompt).await {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("{} failed ({}); returning stub", generator.name(), e);
            stub_response(prompt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DownGenerator;

    #[async_trait]
    impl Generator for DownGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            Err(BackendError::Unavailable("connection refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_failure_degrades_to_stub() {
        let out = generate_or_stub(&DownGenerator, "why was serde adopted?").await;
        assert_eq!(out, "[LLM STUB] why was serde adopted?");
    }
}
