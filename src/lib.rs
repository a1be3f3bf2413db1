//! Archaeologist - 多 Agent 仓库考古
//!
//! 模块划分：
//! - **agents**: Excavator / Historian / Narrator 三个流水线阶段与仓库扫描
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 流水线执行器、Worker 池、Agent 信箱、错误类型
//! - **llm**: 生成与嵌入后端（OpenAI 兼容 / DeepSeek / Stub）
//! - **memory**: 会话历史与向量长期记忆
//! - **observability**: 日志初始化

pub mod agents;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
