//! Narrator：汇总前序阶段输出，生成并迭代精化报告，写入会话历史

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::{MailboxRouter, PipelineExecutor, Stage};
use crate::llm::{generate_or_stub, Generator};
use crate::memory::{Role, SessionStore};

/// 精化提示中约定的 "无需修改" 回复
const NO_CHANGES: &str = "NO_CHANGES";

pub struct NarratorStage {
    generator: Arc<dyn Generator>,
    executor: PipelineExecutor,
    sessions: Arc<SessionStore>,
    session_id: String,
    max_refine_iters: usize,
    /// 报告完成后通知的收件箱
    notify: Option<(Arc<MailboxRouter>, String)>,
}

impl NarratorStage {
    pub fn new(
        generator: Arc<dyn Generator>,
        executor: PipelineExecutor,
        sessions: Arc<SessionStore>,
        session_id: impl Into<String>,
    ) -> Self {
        Self {
            generator,
            executor,
            sessions,
            session_id: session_id.into(),
            max_refine_iters: 0,
            notify: None,
        }
    }

    pub fn with_refine_iters(mut self, max_iters: usize) -> Self {
        self.max_refine_iters = max_iters;
        self
    }

    pub fn with_notify(mut self, router: Arc<MailboxRouter>, inbox: impl Into<String>) -> Self {
        self.notify = Some((router, inbox.into()));
        self
    }

    async fn refine_narrative(&self, draft: String) -> anyhow::Result<(String, usize)> {
        let mut rounds = 0usize;
        let refine = |current: String| {
            rounds += 1;
            let generator = Arc::clone(&self.generator);
            async move {
                let prompt = format!(
                    "Review this repository narrative for accuracy and clarity. \
                     If it needs no changes reply with exactly {}. Otherwise reply with the improved text only.\n\n{}",
                    NO_CHANGES, current
                );
                let revised = match generator.generate(&prompt).await {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::warn!("narrative refinement stopped: {}", e);
                        return Ok::<_, anyhow::Error>(None);
                    }
                };
                let revised = revised.trim();
                if revised.is_empty() || revised == NO_CHANGES || revised == current.trim() {
                    return Ok(None);
                }
                Ok(Some(revised.to_string()))
            }
        };
        let text = self
            .executor
            .run_loop_refine(draft, refine, self.max_refine_iters)
            .await?;
        Ok((text, rounds))
    }
}

#[async_trait]
impl Stage for NarratorStage {
    fn name(&self) -> &str {
        "narrative"
    }

    async fn run(&self, context: &Value) -> anyhow::Result<Value> {
        let facts = render_facts(context);
        let prompt = format!(
            "Write a short narrative of this repository's history for a new contributor.\n\n{}",
            facts
        );
        let draft = generate_or_stub(self.generator.as_ref(), &prompt).await;
        let (narrative, rounds) = self.refine_narrative(draft).await?;

        let report = format!("# Repository report\n\n{}\n## Narrative\n\n{}\n", facts, narrative);

        self.sessions
            .append(&self.session_id, Role::Agent, report.clone());
        self.sessions.update_metadata(
            &self.session_id,
            "commit_count",
            context["commit_count"].clone(),
        );
        tracing::info!(
            "[Narrator] Report written to session {} after {} refine rounds",
            self.session_id,
            rounds
        );

        if let Some((router, inbox)) = &self.notify {
            let event = json!({"event": "report_ready", "session": self.session_id});
            if let Err(e) = router.send(inbox, event).await {
                tracing::warn!("report notification not delivered: {}", e);
            }
        }

        Ok(json!({
            "report": report,
            "refine_rounds": rounds,
        }))
    }
}

/// 把前序阶段的统计渲染为 Markdown
fn render_facts(context: &Value) -> String {
    let mut out = String::new();
    out.push_str("## Overview\n\n");
    out.push_str(&format!(
        "- Commits analysed: {}\n- Files: {}\n",
        context["commit_count"].as_u64().unwrap_or(0),
        context["files_count"].as_u64().unwrap_or(0)
    ));

    if let Some(langs) = context["language_breakdown"].as_object() {
        out.push_str("\n## Languages\n\n");
        for (lang, n) in langs {
            out.push_str(&format!("- {}: {}\n", lang, n));
        }
    }

    if let Some(kinds) = context["commit_kinds"].as_object() {
        let mut kinds: Vec<(&String, u64)> = kinds
            .iter()
            .map(|(k, v)| (k, v.as_u64().unwrap_or(0)))
            .collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        out.push_str("\n## Commit kinds\n\n");
        for (kind, n) in kinds {
            out.push_str(&format!("- {}: {}\n", kind, n));
        }
    }

    if let Some(authors) = context["top_authors"].as_array() {
        out.push_str("\n## Top authors\n\n");
        for a in authors {
            out.push_str(&format!(
                "- {} ({} commits)\n",
                a["name"].as_str().unwrap_or("unknown"),
                a["commits"].as_u64().unwrap_or(0)
            ));
        }
    }

    if let Some(hotspots) = context["hotspots"].as_array().filter(|h| !h.is_empty()) {
        out.push_str("\n## Hotspots\n\n");
        for h in hotspots {
            out.push_str(&format!(
                "- {} ({} changes)\n",
                h["file"].as_str().unwrap_or_default(),
                h["changes"].as_u64().unwrap_or(0)
            ));
        }
    }

    if let Some(changes) = context["library_changes"].as_array().filter(|c| !c.is_empty()) {
        out.push_str("\n## Dependency changes\n\n");
        for c in changes.iter().filter_map(|c| c.as_str()) {
            out.push_str(&format!("- {}\n", c));
        }
    }

    if let Some(timeline) = context["timeline_summary"].as_str() {
        out.push_str("\n## Timeline\n\n");
        out.push_str(timeline);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::BackendError;
    use crate::llm::StubGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 第一次返回草稿，之后依次给出修订，最后回复 NO_CHANGES
    struct ScriptedGenerator {
        calls: AtomicUsize,
        script: Vec<&'static str>,
    }

    #[async_trait]
    impl Generator for ScriptedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, BackendError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.script.get(n).copied().unwrap_or(NO_CHANGES).to_string())
        }
    }

    fn context() -> Value {
        json!({
            "commit_count": 3,
            "files_count": 2,
            "language_breakdown": {"Rust": 2},
            "commit_kinds": {"fix": 1, "feature": 2},
            "top_authors": [{"name": "Ada", "commits": 3}],
            "hotspots": [{"file": "src/parser.rs", "changes": 2}],
            "library_changes": ["[a1] Switch HTTP client to reqwest crate"],
            "timeline_summary": "v0 then v1",
        })
    }

    #[test]
    fn test_render_facts() {
        let facts = render_facts(&context());
        assert!(facts.contains("- Commits analysed: 3"));
        assert!(facts.contains("- Rust: 2"));
        assert!(facts.find("- feature: 2").unwrap() < facts.find("- fix: 1").unwrap());
        assert!(facts.contains("- Ada (3 commits)"));
        assert!(facts.contains("## Hotspots\n\n- src/parser.rs (2 changes)"));
        assert!(facts.contains("- [a1] Switch HTTP client to reqwest crate"));
        assert!(facts.contains("v0 then v1"));
    }

    #[tokio::test]
    async fn test_report_lands_in_session_and_refines_until_no_changes() {
        let generator = Arc::new(ScriptedGenerator {
            calls: AtomicUsize::new(0),
            script: vec!["draft", "better draft", "best draft"],
        });
        let sessions = Arc::new(SessionStore::new());
        let router: Arc<MailboxRouter> = Arc::new(MailboxRouter::new());
        router.register("cli").await;

        let stage = NarratorStage::new(generator, PipelineExecutor::default(), Arc::clone(&sessions), "s1")
            .with_refine_iters(5)
            .with_notify(Arc::clone(&router), "cli");

        let out = stage.run(&context()).await.unwrap();
        // better draft, best draft, NO_CHANGES
        assert_eq!(out["refine_rounds"], 3);
        let report = out["report"].as_str().unwrap();
        assert!(report.ends_with("## Narrative\n\nbest draft\n"));

        let history = sessions.get_history("s1", 10);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::Agent);
        assert_eq!(sessions.get_metadata("s1")["commit_count"], json!(3));

        let event = router.recv("cli", None).await.unwrap().unwrap();
        assert_eq!(event["event"], "report_ready");
    }

    #[tokio::test]
    async fn test_refine_cap_and_missing_inbox() {
        let sessions = Arc::new(SessionStore::new());
        let router: Arc<MailboxRouter> = Arc::new(MailboxRouter::new());
        let stage = NarratorStage::new(Arc::new(StubGenerator), PipelineExecutor::default(), Arc::clone(&sessions), "s2")
            .with_refine_iters(2)
            .with_notify(router, "nobody");

        let out = stage.run(&context()).await.unwrap();
        assert_eq!(out["refine_rounds"], 2);
        assert_eq!(sessions.get_history("s2", 10).len(), 1);
    }
}
