//! 错误分类
//!
//! 结构性错误（信箱未注册、会话参数非法、阶段失败）向调用方返回；
//! 后端与持久化错误（BackendError / PersistenceError）在各自层内记录日志后降级，不穿透编排层。

use thiserror::Error;

/// 信箱（A2A）操作错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MailboxError {
    /// 目标信箱从未注册，或已被注销
    #[error("Agent {0} not registered")]
    NotRegistered(String),
}

/// 顺序流水线错误：任一阶段失败即终止整次运行
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed: {source}")]
    StageFailed {
        stage: String,
        #[source]
        source: anyhow::Error,
    },
}

/// 会话存储的参数错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),
}

/// 外部能力（Embedder / Generator）不可用或调用失败
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackendError {
    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error("Backend request failed: {0}")]
    Request(String),

    #[error("Empty embedding for input")]
    EmptyEmbedding,

    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// 侧车文件读写失败
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Sidecar I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Sidecar JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_registered_message() {
        let err = MailboxError::NotRegistered("historian".to_string());
        assert_eq!(err.to_string(), "Agent historian not registered");
    }

    #[test]
    fn test_stage_failed_keeps_source() {
        let err = PipelineError::StageFailed {
            stage: "excavation".to_string(),
            source: anyhow::anyhow!("repo missing"),
        };
        assert!(err.to_string().contains("excavation"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
