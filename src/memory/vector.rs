//! 长期向量记忆
//!
//! 文本列表与嵌入列表按下标一一对应，任何操作后两者长度相等；检索按平方欧氏距离升序。
//! 可选侧车文件（meta.json）保存 `{text, metadata}`，启动时重新嵌入以重建索引。
//!
//! 写操作需要 `&mut self`：多个 Worker 并发写入时由调用方串行化（如包一层 Mutex 或集中到单一所有者）。

use std::path::Path;
use std::sync::Arc;

use serde_json::Value;

use crate::core::error::BackendError;
use crate::llm::Embedder;
use crate::memory::persistence::{MemoryRecord, MemorySidecar};

/// 检索命中：文本与距离（越小越相似）
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub text: String,
    pub distance: f32,
}

pub struct VectorMemory {
    embedder: Arc<dyn Embedder>,
    text_store: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    /// 首个向量确定维度，之后必须一致
    dimension: Option<usize>,
    sidecar: Option<MemorySidecar>,
}

impl VectorMemory {
    /// 纯内存实例，不读写侧车
    pub fn in_memory(embedder: Arc<dyn Embedder>) -> Self {
        Self {
            embedder,
            text_store: Vec::new(),
            embeddings: Vec::new(),
            dimension: None,
            sidecar: None,
        }
    }

    /// 打开 `persist_dir` 下的侧车并重建索引；读取或嵌入失败只记录日志，实例仍可用
    pub fn open(persist_dir: impl AsRef<Path>, embedder: Arc<dyn Embedder>) -> Self {
        let dir = persist_dir.as_ref();
        if let Err(e) = std::fs::create_dir_all(dir) {
            tracing::warn!("memory dir {} unavailable: {}", dir.display(), e);
        }
        let sidecar = MemorySidecar::in_dir(dir);
        let mut memory = Self {
            sidecar: Some(sidecar.clone()),
            ..Self::in_memory(embedder)
        };

        match sidecar.load() {
            Ok(records) => {
                let texts: Vec<String> = records
                    .into_iter()
                    .map(|r| r.text)
                    .filter(|t| !t.trim().is_empty())
                    .collect();
                if !texts.is_empty() {
                    match memory.index_documents(&texts) {
                        Ok(n) => tracing::info!("Recovered {} long-term memories", n),
                        Err(e) => tracing::warn!("long-term memory recovery skipped: {}", e),
                    }
                }
            }
            Err(e) => tracing::warn!("failed to read {}: {}", sidecar.path().display(), e),
        }
        memory
    }

    /// 嵌入并写入索引，同时把 `{text, metadata: {}}` 追加到侧车。
    ///
    /// 任一文本嵌入失败时整批不写入，保持文本与向量等长；侧车写入失败仅记录日志。
    pub fn add_documents(&mut self, texts: &[String]) -> Result<usize, BackendError> {
        let added = self.index_documents(texts)?;
        let records: Vec<MemoryRecord> = texts
            .iter()
            .map(|t| MemoryRecord::new(t.clone(), Value::Object(Default::default())))
            .collect();
        self.persist(&records);
        Ok(added)
    }

    /// 批量写入 `(text, metadata)`：整批嵌入后只重写一次侧车
    pub fn add_with_metadata(&mut self, entries: &[(String, Value)]) -> Result<usize, BackendError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let texts: Vec<String> = entries.iter().map(|(t, _)| t.clone()).collect();
        let added = self.index_documents(&texts)?;
        let records: Vec<MemoryRecord> = entries
            .iter()
            .map(|(t, m)| MemoryRecord::new(t.clone(), m.clone()))
            .collect();
        self.persist(&records);
        Ok(added)
    }

    /// 写入单条文本及元数据；失败降级为带日志的 no-op
    pub fn add(&mut self, text: &str, metadata: Value) {
        if let Err(e) = self.index_documents(&[text.to_string()]) {
            tracing::warn!("long-term memory add skipped: {}", e);
            return;
        }
        self.persist(&[MemoryRecord::new(text, metadata)]);
    }

    /// 最近的 k 条文本（距离升序）；尚无文档或查询嵌入失败时返回空
    pub fn query(&self, text: &str, k: usize) -> Vec<SearchHit> {
        if self.text_store.is_empty() || k == 0 {
            return Vec::new();
        }
        let q = match self.embedder.embed(text) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("query embedding failed: {}", e);
                return Vec::new();
            }
        };
        if Some(q.len()) != self.dimension {
            tracing::warn!(
                "query dimension {} does not match index {:?}",
                q.len(),
                self.dimension
            );
            return Vec::new();
        }

        let mut scored: Vec<(f32, usize)> = self
            .embeddings
            .iter()
            .enumerate()
            .map(|(i, emb)| (squared_l2(&q, emb), i))
            .collect();
        scored.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        scored
            .into_iter()
            .take(k)
            .map(|(distance, i)| SearchHit {
                text: self.text_store[i].clone(),
                distance,
            })
            .collect()
    }

    /// 检索结果按行拼接，作为 RAG 上下文；无结果时为空串
    pub fn search_context(&self, query: &str, k: usize) -> String {
        self.query(query, k)
            .into_iter()
            .map(|h| h.text)
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn contains(&self, text: &str) -> bool {
        self.text_store.iter().any(|t| t == text)
    }

    pub fn texts(&self) -> &[String] {
        &self.text_store
    }

    pub fn len(&self) -> usize {
        self.text_store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text_store.is_empty()
    }

    /// 已索引的向量数，恒等于 `len()`
    pub fn indexed(&self) -> usize {
        self.embeddings.len()
    }

    fn index_documents(&mut self, texts: &[String]) -> Result<usize, BackendError> {
        if texts.is_empty() {
            return Ok(0);
        }
        // 空白文本没有可检索的内容，重启恢复时也会被跳过
        if texts.iter().any(|t| t.trim().is_empty()) {
            return Err(BackendError::EmptyEmbedding);
        }
        let vectors = self.embedder.embed_batch(texts)?;
        if vectors.len() != texts.len() {
            return Err(BackendError::Request(format!(
                "embedder returned {} vectors for {} texts",
                vectors.len(),
                texts.len()
            )));
        }

        let expected = match self.dimension {
            Some(d) => d,
            None => vectors.first().map(|v| v.len()).unwrap_or(0),
        };
        if expected == 0 {
            return Err(BackendError::EmptyEmbedding);
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(BackendError::DimensionMismatch {
                expected,
                got: bad.len(),
            });
        }

        self.dimension = Some(expected);
        self.embeddings.extend(vectors);
        self.text_store.extend(texts.iter().cloned());
        debug_assert_eq!(self.embeddings.len(), self.text_store.len());
        Ok(texts.len())
    }

    fn persist(&self, records: &[MemoryRecord]) {
        let Some(sidecar) = &self.sidecar else {
            return;
        };
        if let Err(e) = sidecar.append(records) {
            tracing::warn!("failed to persist long-term memory: {}", e);
        }
    }
}

fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}
