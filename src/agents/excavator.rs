//! Excavator：扫描仓库，整理提交、热点与文件统计，并把提交信息和关键文件片段写入长期记忆
//!
//! 写入按文本去重：同一仓库反复运行不会在侧车中堆积重复记录。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{lock_memory, Scanner, SharedVectorMemory};
use crate::core::Stage;

/// 热点文件数量
const MAX_HOTSPOTS: usize = 15;
/// 参与嵌入的关键文件数量
const MAX_KEY_FILES: usize = 20;
/// 单个文件最多读取的字符数
const MAX_FILE_CHARS: usize = 20_000;
/// 单个文件最多切出的片段数
const MAX_CHUNKS_PER_FILE: usize = 8;
const CHUNK_CHARS: usize = 1000;

/// 文件名中含这些片段的优先嵌入（README、清单、入口等）
const KEY_FILE_PATTERNS: &[&str] = &[
    "readme",
    "cargo.toml",
    "package.json",
    "requirements",
    "setup.py",
    "main.",
    "lib.",
    "index.",
    "app.",
    "config",
];

/// 行首出现这些关键字时可以在此切分片段
const DEFINITION_MARKERS: &[&str] = &[
    "fn ", "pub fn ", "async fn ", "impl ", "struct ", "enum ", "trait ", "def ", "async def ", "class ",
    "function ", "func ", "@",
];

pub struct ExcavatorStage {
    scanner: Arc<dyn Scanner>,
    memory: SharedVectorMemory,
}

impl ExcavatorStage {
    pub fn new(scanner: Arc<dyn Scanner>, memory: SharedVectorMemory) -> Self {
        Self { scanner, memory }
    }
}

#[async_trait]
impl Stage for ExcavatorStage {
    fn name(&self) -> &str {
        "excavation"
    }

    async fn run(&self, _context: &Value) -> anyhow::Result<Value> {
        let scanner = Arc::clone(&self.scanner);
        let (commits, files, chunks) = tokio::task::spawn_blocking(move || {
            scanner.commits().map(|c| {
                let files = scanner.files();
                let chunks = key_file_chunks(scanner.as_ref(), &files);
                (c, files, chunks)
            })
        })
        .await??;

        let commit_entries: Vec<(String, Value)> = commits
            .iter()
            .map(|c| {
                let text = format!(
                    "[{}] {}: {}",
                    c["hash"].as_str().unwrap_or("?"),
                    c["author"].as_str().unwrap_or("unknown"),
                    c["message"].as_str().unwrap_or_default()
                );
                (text, json!({"type": "commit", "hash": c["hash"]}))
            })
            .collect();

        let memory = Arc::clone(&self.memory);
        let (embedded_commits, embedded_chunks) = tokio::task::spawn_blocking(move || {
            let mut mem = lock_memory(&memory);
            let commits = store_new(&mut mem, commit_entries);
            let chunks = store_new(&mut mem, chunks);
            (commits, chunks)
        })
        .await?;

        let hotspots = identify_hotspots(&commits);
        tracing::info!(
            "[Excavator] Found {} commits, {} files; embedded {} new commits, {} new chunks",
            commits.len(),
            files.len(),
            embedded_commits,
            embedded_chunks
        );

        Ok(json!({
            "commit_count": commits.len(),
            "files_count": files.len(),
            "language_breakdown": language_breakdown(&files),
            "hotspots": hotspots
                .into_iter()
                .map(|(file, changes)| json!({"file": file, "changes": changes}))
                .collect::<Vec<_>>(),
            "sample_files": files.iter().take(10).collect::<Vec<_>>(),
            "embedded_commits": embedded_commits,
            "embedded_chunks": embedded_chunks,
            "commits": commits,
        }))
    }
}

/// 跳过已在记忆中的文本，其余一次性写入；嵌入失败只记录日志
fn store_new(memory: &mut crate::memory::VectorMemory, entries: Vec<(String, Value)>) -> usize {
    let mut seen: HashSet<String> = memory.texts().iter().cloned().collect();
    let fresh: Vec<(String, Value)> = entries
        .into_iter()
        .filter(|(text, _)| seen.insert(text.clone()))
        .collect();
    match memory.add_with_metadata(&fresh) {
        Ok(n) => n,
        Err(e) => {
            tracing::warn!("long-term memory batch skipped: {}", e);
            0
        }
    }
}

/// 按提交涉及次数统计最常改动的文件，次数降序、同次数按路径
pub fn identify_hotspots(commits: &[Value]) -> Vec<(String, usize)> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for c in commits {
        for f in c["files"].as_array().into_iter().flatten() {
            if let Some(path) = f.as_str() {
                *counts.entry(path).or_insert(0) += 1;
            }
        }
    }
    let mut ranked: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(path, n)| (path.to_string(), n))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.truncate(MAX_HOTSPOTS);
    ranked
}

/// 选出关键文件（先匹配 KEY_FILE_PATTERNS，再补源码文件），切成带文件名标题的片段
fn key_file_chunks(scanner: &dyn Scanner, files: &[String]) -> Vec<(String, Value)> {
    let is_key = |f: &String| {
        let lower = f.to_lowercase();
        KEY_FILE_PATTERNS.iter().any(|p| lower.contains(p))
    };
    let is_source = |f: &String| !matches!(language_of(f), "Other" | "JSON" | "YAML" | "TOML" | "Markdown");

    let mut picked: Vec<&String> = files.iter().filter(|f| is_key(*f)).collect();
    picked.extend(files.iter().filter(|f| !is_key(*f) && is_source(*f)));
    picked.truncate(MAX_KEY_FILES);

    let mut entries = Vec::new();
    for f in picked {
        let Some(content) = scanner.read_file(f) else {
            continue;
        };
        let content: String = content.chars().take(MAX_FILE_CHARS).collect();
        for chunk in chunk_code(&content, f).into_iter().take(MAX_CHUNKS_PER_FILE) {
            entries.push((chunk, json!({"type": "chunk", "filename": f})));
        }
    }
    entries
}

/// 在定义行处（片段已超过 100 字符）或长度超过 CHUNK_CHARS 时切分
pub fn chunk_code(content: &str, filename: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_len = 0usize;

    let mut flush = |lines: &mut Vec<&str>, len: &mut usize| {
        let body = lines.join("\n");
        if !body.trim().is_empty() {
            chunks.push(format!("### {} ###\n{}", filename, body));
        }
        lines.clear();
        *len = 0;
    };

    for line in content.lines() {
        let trimmed = line.trim_start();
        let at_definition = DEFINITION_MARKERS.iter().any(|m| trimmed.starts_with(m));
        if at_definition && current_len > 100 {
            flush(&mut current, &mut current_len);
        }
        current_len += line.len() + 1;
        current.push(line);
        if current_len > CHUNK_CHARS {
            flush(&mut current, &mut current_len);
        }
    }
    if !current.is_empty() {
        flush(&mut current, &mut current_len);
    }
    chunks
}

fn language_of(file: &str) -> &'static str {
    let ext = std::path::Path::new(file)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "rs" => "Rust",
        "py" => "Python",
        "js" => "JavaScript",
        "ts" => "TypeScript",
        "java" => "Java",
        "go" => "Go",
        "md" => "Markdown",
        "json" => "JSON",
        "yaml" | "yml" => "YAML",
        "toml" => "TOML",
        _ => "Other",
    }
}

/// 按扩展名统计语言分布
pub fn language_breakdown(files: &[String]) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    for f in files {
        *counts.entry(language_of(f)).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::StaticScanner;
    use crate::llm::HashEmbedder;
    use crate::memory::{MemorySidecar, VectorMemory};
    use std::sync::Mutex;

    fn scanner() -> StaticScanner {
        StaticScanner {
            commits: vec![
                json!({"hash": "abc1234", "author": "Ada", "message": "add parser", "files": ["src/parser.rs", "src/lib.rs"]}),
                json!({"hash": "def5678", "author": "Lin", "message": "fix crash", "files": ["src/parser.rs"]}),
            ],
            files: vec!["src/lib.rs".to_string(), "notes.txt".to_string()],
            contents: HashMap::from([("src/lib.rs".to_string(), "pub fn parse() {}\n".to_string())]),
        }
    }

    #[test]
    fn test_language_breakdown() {
        let files = vec!["a.rs".to_string(), "b.RS".to_string(), "README.md".to_string(), "Makefile".to_string()];
        let counts = language_breakdown(&files);
        assert_eq!(counts.get("Rust"), Some(&2));
        assert_eq!(counts.get("Markdown"), Some(&1));
        assert_eq!(counts.get("Other"), Some(&1));
    }

    #[test]
    fn test_hotspots_ranked_by_change_count() {
        let hot = identify_hotspots(&scanner().commits);
        assert_eq!(hot, vec![("src/parser.rs".to_string(), 2), ("src/lib.rs".to_string(), 1)]);
        assert!(identify_hotspots(&[json!({"hash": "x"})]).is_empty());
    }

    #[test]
    fn test_chunk_code_splits_on_definitions_and_size() {
        let body = format!("{}\nfn second() {{}}\n", "// header line\n".repeat(10));
        let chunks = chunk_code(&body, "src/a.rs");
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.starts_with("### src/a.rs ###\n")));
        assert!(chunks[1].contains("fn second()"));

        let long = "x".repeat(400) + "\n";
        let chunks = chunk_code(&long.repeat(6), "big.txt");
        assert!(chunks.len() >= 2);
        assert!(chunk_code("", "empty.rs").is_empty());
    }

    #[tokio::test]
    async fn test_excavation_stores_commits_and_chunks() {
        let memory = Arc::new(Mutex::new(VectorMemory::in_memory(Arc::new(HashEmbedder::default()))));
        let stage = ExcavatorStage::new(Arc::new(scanner()), Arc::clone(&memory));

        let out = stage.run(&json!({})).await.unwrap();
        assert_eq!(out["commit_count"], 2);
        assert_eq!(out["language_breakdown"]["Rust"], 1);
        assert_eq!(out["hotspots"][0], json!({"file": "src/parser.rs", "changes": 2}));
        assert_eq!(out["embedded_commits"], 2);
        assert_eq!(out["embedded_chunks"], 1);

        let mem = lock_memory(&memory);
        assert_eq!(mem.len(), 3);
        assert_eq!(mem.texts()[1], "[def5678] Lin: fix crash");
        assert_eq!(mem.texts()[2], "### src/lib.rs ###\npub fn parse() {}");
    }

    #[tokio::test]
    async fn test_repeated_runs_do_not_duplicate_memory() {
        let dir = tempfile::TempDir::new().unwrap();
        let embedder: Arc<dyn crate::llm::Embedder> = Arc::new(HashEmbedder::default());

        for run in 0..2 {
            let memory = Arc::new(Mutex::new(VectorMemory::open(dir.path(), Arc::clone(&embedder))));
            let stage = ExcavatorStage::new(Arc::new(scanner()), Arc::clone(&memory));
            let out = stage.run(&json!({})).await.unwrap();
            let expected_new = if run == 0 { 2 } else { 0 };
            assert_eq!(out["embedded_commits"], expected_new);
            assert_eq!(lock_memory(&memory).len(), 3);
        }

        let memory = VectorMemory::open(dir.path(), embedder);
        let top: Vec<String> = memory.query("add parser", 2).into_iter().map(|h| h.text).collect();
        assert_eq!(top.iter().filter(|t| t.as_str() == "[abc1234] Ada: add parser").count(), 1);
        assert_eq!(MemorySidecar::in_dir(dir.path()).load().unwrap().len(), 3);
    }
}
