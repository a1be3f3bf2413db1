//! 向量记忆侧车文件
//!
//! 单个 JSON 数组，每项为 `{text, metadata}`；每次追加都整体重写。
//! 数值索引从不落盘，启动时由这些文本重新嵌入重建。

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::PersistenceError;

/// 侧车文件名
pub const SIDECAR_FILE: &str = "meta.json";

/// 一条持久化记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
}

impl MemoryRecord {
    pub fn new(text: impl Into<String>, metadata: Value) -> Self {
        Self {
            text: text.into(),
            metadata,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MemorySidecar {
    path: PathBuf,
}

impl MemorySidecar {
    /// 侧车位于 `dir/meta.json`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(SIDECAR_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录；文件不存在时返回空 Vec
    pub fn load(&self) -> Result<Vec<MemoryRecord>, PersistenceError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&self.path)?;
        let records: Vec<MemoryRecord> = serde_json::from_str(&data)?;
        Ok(records)
    }

    /// 读出现有记录、追加后整体写回；父目录不存在时自动创建
    pub fn append(&self, entries: &[MemoryRecord]) -> Result<(), PersistenceError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut records = self.load()?;
        records.extend_from_slice(entries);
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, serde_json::to_string_pretty(&records)?)?;
        Ok(())
    }
}
