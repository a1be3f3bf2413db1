//! Historian：对提交做并行分类与统计，生成演进时间线，并回答 "为什么" 类问题

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{lock_memory, SharedVectorMemory};
use crate::core::{PipelineExecutor, Stage};
use crate::llm::{generate_or_stub, Generator};
use crate::memory::Message;

/// 提交类型关键词，按顺序匹配
const COMMIT_KINDS: &[(&str, &[&str])] = &[
    ("fix", &["fix", "bug", "hotfix", "patch"]),
    ("refactor", &["refactor", "cleanup", "restructure", "rewrite"]),
    ("feature", &["feat", "add", "implement", "introduce", "support"]),
    ("docs", &["doc", "readme", "comment"]),
    ("test", &["test", "spec", "coverage"]),
    ("chore", &["chore", "bump", "release", "deps", "ci"]),
];

/// 提到依赖变化的提交：需同时命中动作词与生态关键词
const LIBRARY_TRIGGERS: &[&str] = &[
    "library", "dependency", "dependencies", "package", "upgrade", "switch", "migrate", "adopt", "integrate",
];
const LIBRARY_KEYWORDS: &[&str] = &["import", "require", "install", "pip", "npm", "maven", "cargo", "crate", "from", "to "];
/// 只看最近的这些提交
const LIBRARY_SCAN_WINDOW: usize = 50;
const MAX_LIBRARY_CHANGES: usize = 5;
/// 提示中每条会话消息保留的字符数
const HISTORY_PREVIEW_CHARS: usize = 300;

pub struct HistorianStage {
    generator: Arc<dyn Generator>,
    executor: PipelineExecutor,
    memory: SharedVectorMemory,
}

impl HistorianStage {
    pub fn new(generator: Arc<dyn Generator>, executor: PipelineExecutor, memory: SharedVectorMemory) -> Self {
        Self {
            generator,
            executor,
            memory,
        }
    }

    /// 结合长期记忆中的相关提交回答问题
    pub async fn answer_why(&self, question: &str) -> String {
        self.answer_in_session(question, &[]).await
    }

    /// 同 `answer_why`，并把会话里最近的消息一并放进提示
    pub async fn answer_in_session(&self, question: &str, history: &[Arc<Message>]) -> String {
        let memory = Arc::clone(&self.memory);
        let q = question.to_string();
        let context = tokio::task::spawn_blocking(move || lock_memory(&memory).search_context(&q, 5))
            .await
            .unwrap_or_else(|e| {
                tracing::warn!("memory search task failed: {}", e);
                String::new()
            });

        let conversation = history
            .iter()
            .map(|m| {
                let preview: String = m.content.chars().take(HISTORY_PREVIEW_CHARS).collect();
                format!("{}: {}", m.role.as_str(), preview)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut prompt = format!(
            "You are a code historian. Using the commit history below, answer the question.\n\
             Relevant commits and code:\n{}\n\n",
            if context.is_empty() { "(none)" } else { context.as_str() }
        );
        if !conversation.is_empty() {
            prompt.push_str(&format!("Recent conversation:\n{}\n\n", conversation));
        }
        prompt.push_str(&format!(
            "Question: {}\nAnswer concisely and cite commit hashes.",
            question
        ));
        generate_or_stub(self.generator.as_ref(), &prompt).await
    }
}

#[async_trait]
impl Stage for HistorianStage {
    fn name(&self) -> &str {
        "history"
    }

    async fn run(&self, context: &Value) -> anyhow::Result<Value> {
        let commits = context["commits"].as_array().cloned().unwrap_or_default();
        if commits.is_empty() {
            tracing::warn!("[Historian] No commits in context");
        }

        let outcomes = self.executor.run_parallel(commits, classify_commit).await;
        let failed = outcomes.iter().filter(|o| o.is_error()).count();
        let classified: Vec<Value> = outcomes.into_iter().filter_map(|o| o.ok()).collect();

        let mut kinds: HashMap<String, usize> = HashMap::new();
        let mut authors: HashMap<String, usize> = HashMap::new();
        for c in &classified {
            *kinds.entry(str_field(c, "kind").to_string()).or_insert(0) += 1;
            *authors.entry(str_field(c, "author").to_string()).or_insert(0) += 1;
        }
        let mut top_authors: Vec<(String, usize)> = authors.into_iter().collect();
        top_authors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_authors.truncate(5);

        let refactors: Vec<&Value> = classified
            .iter()
            .filter(|c| str_field(c, "kind") == "refactor")
            .take(10)
            .collect();
        let library_changes = detect_library_changes(&classified);

        let digest = classified
            .iter()
            .take(30)
            .map(|c| format!("- [{}] {}", str_field(c, "hash"), str_field(c, "message")))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = format!(
            "Summarize how this project evolved, as a short timeline of phases.\nCommits (newest first):\n{}",
            digest
        );
        let timeline = generate_or_stub(self.generator.as_ref(), &prompt).await;

        tracing::info!(
            "[Historian] Classified {} commits ({} failed)",
            classified.len(),
            failed
        );

        Ok(json!({
            "commit_kinds": kinds,
            "top_authors": top_authors
                .into_iter()
                .map(|(name, commits)| json!({"name": name, "commits": commits}))
                .collect::<Vec<_>>(),
            "refactor_events": refactors,
            "library_changes": library_changes,
            "classify_failures": failed,
            "timeline_summary": timeline,
        }))
    }
}

/// 单条提交分类；缺少 hash 视为坏记录
pub fn classify_commit(commit: Value) -> anyhow::Result<Value> {
    let hash = commit["hash"]
        .as_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| anyhow::anyhow!("commit record without hash"))?;
    let message = commit["message"].as_str().unwrap_or_default();
    let lower = message.to_lowercase();
    let kind = COMMIT_KINDS
        .iter()
        .find(|(_, words)| words.iter().any(|w| lower.contains(w)))
        .map(|(k, _)| *k)
        .unwrap_or("other");

    Ok(json!({
        "hash": hash,
        "author": commit["author"].as_str().unwrap_or("unknown"),
        "message": message,
        "kind": kind,
    }))
}

/// 最近提交中引入、替换或升级依赖的记录，格式 `[hash] subject`
pub fn detect_library_changes(commits: &[Value]) -> Vec<String> {
    commits
        .iter()
        .take(LIBRARY_SCAN_WINDOW)
        .filter(|c| {
            let msg = str_field(c, "message").to_lowercase();
            LIBRARY_TRIGGERS.iter().any(|w| msg.contains(w))
                && LIBRARY_KEYWORDS.iter().any(|w| msg.contains(w))
        })
        .take(MAX_LIBRARY_CHANGES)
        .map(|c| {
            let subject: String = str_field(c, "message").chars().take(80).collect();
            format!("[{}] {}", str_field(c, "hash"), subject)
        })
        .collect()
}

fn str_field<'a>(v: &'a Value, key: &str) -> &'a str {
    v[key].as_str().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackendError;
    use crate::llm::{HashEmbedder, StubGenerator};
    use crate::memory::VectorMemory;
    use std::sync::Mutex;

    /// 记录最后一次提示
    #[derive(Default)]
    struct RecordingGenerator {
        last_prompt: Mutex<String>,
    }

    #[async_trait]
    impl Generator for RecordingGenerator {
        async fn generate(&self, prompt: &str) -> Result<String, BackendError> {
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            Ok("recorded".to_string())
        }
    }

    fn memory() -> SharedVectorMemory {
        Arc::new(Mutex::new(VectorMemory::in_memory(Arc::new(HashEmbedder::default()))))
    }

    #[test]
    fn test_classify_commit() {
        let c = classify_commit(json!({"hash": "a1", "author": "Ada", "message": "Fix panic on empty input"})).unwrap();
        assert_eq!(c["kind"], "fix");
        let c = classify_commit(json!({"hash": "a2", "message": "Refactor scheduler"})).unwrap();
        assert_eq!(c["kind"], "refactor");
        assert_eq!(c["author"], "unknown");
        assert!(classify_commit(json!({"message": "no hash"})).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_history_counts_and_keeps_going_on_bad_records() {
        let stage = HistorianStage::new(Arc::new(StubGenerator), PipelineExecutor::new(2), memory());
        let ctx = json!({
            "commits": [
                {"hash": "a1", "author": "Ada", "message": "add parser"},
                {"hash": "a2", "author": "Ada", "message": "fix parser bug"},
                {"author": "Lin", "message": "broken record"},
                {"hash": "a4", "author": "Lin", "message": "refactor lexer"},
            ]
        });

        let out = stage.run(&ctx).await.unwrap();
        assert_eq!(out["classify_failures"], 1);
        assert_eq!(out["commit_kinds"]["feature"], 1);
        assert_eq!(out["commit_kinds"]["fix"], 1);
        assert_eq!(out["top_authors"][0], json!({"name": "Ada", "commits": 2}));
        assert_eq!(out["refactor_events"][0]["hash"], "a4");
        assert_eq!(out["library_changes"], json!([]));
        assert!(out["timeline_summary"].as_str().unwrap().starts_with("[LLM STUB]"));
    }

    #[test]
    fn test_detect_library_changes() {
        let commits = vec![
            json!({"hash": "a1", "message": "Switch HTTP client to reqwest crate"}),
            json!({"hash": "a2", "message": "Upgrade dependency tokio to 1.35"}),
            json!({"hash": "a3", "message": "Fix typo in README"}),
            json!({"hash": "a4", "message": "Migrate docs"}),
        ];
        let changes = detect_library_changes(&commits);
        assert_eq!(
            changes,
            vec![
                "[a1] Switch HTTP client to reqwest crate".to_string(),
                "[a2] Upgrade dependency tokio to 1.35".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_answer_in_session_includes_recent_messages() {
        let mem = memory();
        lock_memory(&mem).add("[c0ffee1] Ada: adopt serde crate", json!({}));
        let generator = Arc::new(RecordingGenerator::default());
        let stage = HistorianStage::new(generator.clone(), PipelineExecutor::default(), mem);

        let history = vec![
            Arc::new(Message::user("what changed in 2024?")),
            Arc::new(Message::agent("the storage layer was rewritten")),
        ];
        let answer = stage.answer_in_session("why serde?", &history).await;
        assert_eq!(answer, "recorded");

        let prompt = generator.last_prompt.lock().unwrap().clone();
        assert!(prompt.contains("[c0ffee1] Ada: adopt serde crate"));
        assert!(prompt.contains("Recent conversation:\nuser: what changed in 2024?\nagent: the storage layer was rewritten"));
        assert!(prompt.ends_with("Question: why serde?\nAnswer concisely and cite commit hashes."));

        stage.answer_why("why serde?").await;
        assert!(!generator.last_prompt.lock().unwrap().contains("Recent conversation"));
    }

    #[tokio::test]
    async fn test_answer_why_uses_memory() {
        let mem = memory();
        lock_memory(&mem).add("[c0ffee1] Ada: switch storage to sqlite", json!({}));
        let stage = HistorianStage::new(Arc::new(StubGenerator), PipelineExecutor::default(), mem);

        let answer = stage.answer_why("why sqlite?").await;
        assert!(answer.starts_with("[LLM STUB] You are a code historian."));
    }
}
