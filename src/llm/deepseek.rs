//! DeepSeek API 预设（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiGenerator;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// 创建 DeepSeek 生成器；模型未指定时用 `DEEPSEEK_MODEL` 或 deepseek-chat
pub fn create_deepseek_generator(model: Option<&str>, api_key: &str) -> OpenAiGenerator {
    let model = model
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    OpenAiGenerator::new(Some(DEEPSEEK_BASE_URL), &model, api_key)
}
