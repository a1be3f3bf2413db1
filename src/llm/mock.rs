//! Stub 生成器（无需 API，用于离线运行与测试）
//!
//! 返回 `[LLM STUB] ` + 规整空白后提示词的前 100 个字符，超出时追加 `...`。

use async_trait::async_trait;

use crate::core::error::BackendError;
use crate::llm::Generator;

const STUB_PREVIEW_CHARS: usize = 100;

/// 确定性的桩响应
pub fn stub_response(prompt: &str) -> String {
    let cleaned = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    let preview: String = cleaned.chars().take(STUB_PREVIEW_CHARS).collect();
    let ellipsis = if cleaned.chars().count() > STUB_PREVIEW_CHARS {
        "..."
    } else {
        ""
    };
    format!("[LLM STUB] {}{}", preview, ellipsis)
}

/// Stub 客户端
#[derive(Debug, Default, Clone)]
pub struct StubGenerator;

#[async_trait]
impl Generator for StubGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
        Ok(stub_response(prompt))
    }

    fn name(&self) -> &str {
        "stub"
    }
}
