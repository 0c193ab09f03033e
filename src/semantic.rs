//! Bottom-up summary generation for the `Semantic` queue.
//!
//! One message covers a whole subtree. The processor lists it once,
//! orders directories so every child comes before its parent, then for
//! each directory:
//!
//! 1. reads each child directory's `.abstract.md` (already written
//!    earlier in the same pass),
//! 2. summarizes each file, at most `max_concurrent_llm` at a time,
//! 3. asks the summarizer for an overview and takes the abstract from
//!    its first paragraph,
//! 4. writes `.overview.md` and `.abstract.md`,
//! 5. queues one embedding job for the directory and one per file.
//!
//! Per-file failures degrade to empty summaries; a failed overview
//! becomes a placeholder. Only failing to list the message's own
//! directory or to persist summaries fails the message.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use regex::Regex;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use viking_store_core::llm::Summarizer;
use viking_store_core::models::ContextType;
use viking_store_core::uri::VikingUri;

use crate::config::SemanticConfig;
use crate::llm::INPUT_MARKER;
use crate::queue::{DequeueHandler, EmbeddingMsg, NamedQueue, SemanticMsg};
use crate::vfs::{parse_uri, LsOptions, VikingFs};

/// Content class of a file, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    Text,
    Image,
    Video,
    Audio,
}

impl FileKind {
    /// Unknown extensions count as text.
    pub fn of(name: &str) -> Self {
        let ext = name
            .rsplit_once('.')
            .map(|(_, e)| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "png" | "jpg" | "jpeg" | "gif" | "bmp" | "svg" | "webp" => FileKind::Image,
            "mp4" | "avi" | "mov" | "wmv" | "flv" => FileKind::Video,
            "mp3" | "wav" | "aac" | "flac" => FileKind::Audio,
            _ => FileKind::Text,
        }
    }
}

/// One directory of a pass, with its direct children.
#[derive(Debug, Clone, PartialEq)]
struct DirInfo {
    uri: String,
    child_dirs: Vec<String>,
    files: Vec<String>,
}

#[derive(Debug, Clone)]
struct FileSummary {
    uri: String,
    name: String,
    summary: String,
    /// Truncated file text, kept for embedding text files.
    content: Option<String>,
}

fn last_segment(uri: &str) -> &str {
    let name = uri.rsplit('/').next().unwrap_or_default();
    if name.is_empty() {
        "viking"
    } else {
        name
    }
}

/// Prose after the title and before the first `##` heading.
pub fn extract_abstract(overview: &str) -> String {
    let mut out: Vec<&str> = Vec::new();
    let mut in_header = true;
    for line in overview.lines() {
        if in_header && line.starts_with('#') {
            continue;
        }
        if in_header && !line.trim().is_empty() {
            in_header = false;
        }
        if !in_header {
            if line.starts_with("##") {
                break;
            }
            if !line.trim().is_empty() {
                out.push(line.trim());
            }
        }
    }
    out.join("\n").trim().to_string()
}

fn default_overview(dir_name: &str) -> String {
    format!("# {}\n\nDirectory overview", dir_name)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}\n...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

fn file_summary_prompt(name: &str, content: &str) -> String {
    format!(
        "Summarize the file `{name}` in one sentence that says what it contains. \
         Reply with the sentence only.\n\n{INPUT_MARKER}\n{content}"
    )
}

fn overview_prompt(dir_name: &str, files: &[FileSummary], children: &[(String, String)]) -> String {
    let files_section = if files.is_empty() {
        "None".to_string()
    } else {
        files
            .iter()
            .enumerate()
            .map(|(i, f)| format!("[{}] {}: {}", i + 1, f.name, f.summary))
            .collect::<Vec<_>>()
            .join("\n")
    };
    let children_section = if children.is_empty() {
        "None".to_string()
    } else {
        children
            .iter()
            .map(|(name, abs)| format!("- {}/: {}", name, abs))
            .collect::<Vec<_>>()
            .join("\n")
    };
    format!(
        "Write a markdown overview of the directory `{dir_name}`. Start with a `# {dir_name}` \
         title, then one short paragraph describing the directory as a whole, then `##` \
         sections. Refer to files by their [n] index.\n\n{INPUT_MARKER}\n# {dir_name}\n\n\
         ## Files\n{files_section}\n\n## Subdirectories\n{children_section}"
    )
}

/// Replace `[n]` references with file names. `[n] name` where the
/// model repeated the name collapses to one `name`.
fn resolve_file_refs(overview: &str, names: &HashMap<usize, String>) -> String {
    let Ok(re) = Regex::new(r"\[(\d+)\]( [^\s:]+)?") else {
        return overview.to_string();
    };
    re.replace_all(overview, |caps: &regex::Captures| {
        let Some(name) = caps[1].parse::<usize>().ok().and_then(|i| names.get(&i)) else {
            return caps[0].to_string();
        };
        match caps.get(2) {
            Some(m) if m.as_str().trim() == name => name.clone(),
            Some(m) => format!("{}{}", name, m.as_str()),
            None => name.clone(),
        }
    })
    .into_owned()
}

/// Handler for the `Semantic` queue.
pub struct SemanticProcessor {
    vfs: Arc<VikingFs>,
    summarizer: Arc<dyn Summarizer>,
    embedding_queue: Arc<NamedQueue>,
    max_concurrent_llm: usize,
    max_file_chars: usize,
}

impl SemanticProcessor {
    /// `vfs` should not carry the queue manager that will own this
    /// handler.
    pub fn new(
        vfs: Arc<VikingFs>,
        summarizer: Arc<dyn Summarizer>,
        embedding_queue: Arc<NamedQueue>,
        config: &SemanticConfig,
    ) -> Self {
        Self {
            vfs,
            summarizer,
            embedding_queue,
            max_concurrent_llm: config.max_concurrent_llm.max(1),
            max_file_chars: config.max_file_chars,
        }
    }

    /// Directories under `root` (inclusive), every child before its
    /// parent. Names starting with `.` are skipped.
    async fn collect_directories(&self, root: &str) -> Result<Vec<DirInfo>> {
        let mut preorder = Vec::new();
        let mut stack = vec![root.to_string()];
        while let Some(uri) = stack.pop() {
            let entries = match self.vfs.ls(&uri, LsOptions::default()).await {
                Ok(entries) => entries,
                Err(e) if uri == root => {
                    return Err(e).with_context(|| format!("failed to list {}", root))
                }
                Err(e) => {
                    warn!("[SemanticProcessor] failed to list {}: {}", uri, e);
                    continue;
                }
            };
            let mut info = DirInfo {
                uri,
                child_dirs: Vec::new(),
                files: Vec::new(),
            };
            for entry in entries.into_iter().filter(|e| !e.name.starts_with('.')) {
                if entry.is_dir {
                    info.child_dirs.push(entry.uri);
                } else {
                    info.files.push(entry.uri);
                }
            }
            stack.extend(info.child_dirs.iter().rev().cloned());
            preorder.push(info);
        }
        // Reversed preorder puts every descendant ahead of its ancestor.
        preorder.reverse();
        Ok(preorder)
    }

    async fn summarize_file(&self, uri: String) -> FileSummary {
        let name = last_segment(&uri).to_string();
        let content = match self.vfs.read_to_string(&uri).await {
            Ok(text) => truncate_chars(&text, self.max_file_chars),
            Err(e) => {
                warn!("[SemanticProcessor] cannot read {} as text: {}", uri, e);
                return FileSummary {
                    uri,
                    name,
                    summary: String::new(),
                    content: None,
                };
            }
        };
        let summary = match self
            .summarizer
            .complete(&file_summary_prompt(&name, &content))
            .await
        {
            Ok(s) => s.trim().to_string(),
            Err(e) => {
                warn!("[SemanticProcessor] failed to summarize {}: {:#}", uri, e);
                String::new()
            }
        };
        FileSummary {
            uri,
            name,
            summary,
            content: Some(content),
        }
    }

    async fn summarize_files(&self, files: &[String]) -> Vec<FileSummary> {
        let sem = Arc::new(Semaphore::new(self.max_concurrent_llm));
        join_all(files.iter().cloned().map(|uri| {
            let sem = sem.clone();
            async move {
                let _permit = sem.acquire().await;
                self.summarize_file(uri).await
            }
        }))
        .await
    }

    async fn child_abstracts(&self, child_dirs: &[String]) -> Vec<(String, String)> {
        let mut out = Vec::with_capacity(child_dirs.len());
        for uri in child_dirs {
            let abstract_text = self.vfs.abstract_text(uri).await.unwrap_or_else(|e| {
                warn!("[SemanticProcessor] no abstract for {}: {}", uri, e);
                String::new()
            });
            out.push((last_segment(uri).to_string(), abstract_text));
        }
        out
    }

    async fn generate_overview(
        &self,
        dir_uri: &str,
        files: &[FileSummary],
        children: &[(String, String)],
    ) -> String {
        let dir_name = last_segment(dir_uri);
        let names: HashMap<usize, String> = files
            .iter()
            .enumerate()
            .map(|(i, f)| (i + 1, f.name.clone()))
            .collect();
        match self
            .summarizer
            .complete(&overview_prompt(dir_name, files, children))
            .await
        {
            Ok(text) => resolve_file_refs(text.trim(), &names),
            Err(e) => {
                error!("[SemanticProcessor] overview failed for {}: {:#}", dir_uri, e);
                default_overview(dir_name)
            }
        }
    }

    async fn process_directory(&self, dir: &DirInfo, context_type: ContextType) -> Result<()> {
        let children = self.child_abstracts(&dir.child_dirs).await;
        let files = self.summarize_files(&dir.files).await;
        let overview = self.generate_overview(&dir.uri, &files, &children).await;
        let abstract_text = extract_abstract(&overview);

        let uri = parse_uri(&dir.uri)?;
        self.vfs
            .write_summaries(&uri, &abstract_text, &overview)
            .await
            .with_context(|| format!("failed to write summaries for {}", dir.uri))?;
        debug!("[SemanticProcessor] summarized {}", dir.uri);

        if let Err(e) = self
            .enqueue_directory(&uri, context_type, &abstract_text, &overview)
            .await
        {
            error!("[SemanticProcessor] failed to queue {} for embedding: {:#}", dir.uri, e);
        }
        if let Err(e) = self.enqueue_files(&dir.uri, context_type, files).await {
            error!("[SemanticProcessor] failed to queue files of {} for embedding: {:#}", dir.uri, e);
        }
        Ok(())
    }

    async fn enqueue_directory(
        &self,
        uri: &VikingUri,
        context_type: ContextType,
        abstract_text: &str,
        overview: &str,
    ) -> Result<()> {
        let mut msg = EmbeddingMsg::new(uri.to_string(), context_type, overview);
        msg.parent_uri = uri.parent().map(|p| p.to_string());
        msg.is_leaf = false;
        msg.abstract_text = abstract_text.to_string();
        self.embedding_queue.enqueue(&msg).await?;
        Ok(())
    }

    async fn enqueue_files(
        &self,
        dir_uri: &str,
        context_type: ContextType,
        files: Vec<FileSummary>,
    ) -> Result<()> {
        for file in files {
            let text = match (FileKind::of(&file.name), file.content) {
                (FileKind::Text, Some(content)) => content,
                _ => file.summary.clone(),
            };
            let mut msg = EmbeddingMsg::new(file.uri, context_type, text);
            msg.parent_uri = Some(dir_uri.to_string());
            msg.is_leaf = true;
            msg.abstract_text = file.summary;
            self.embedding_queue.enqueue(&msg).await?;
        }
        Ok(())
    }

    /// Run a full pass for one message.
    pub async fn process(&self, msg: &SemanticMsg) -> Result<usize> {
        info!("[SemanticProcessor] processing {}", msg.uri);
        let dirs = self.collect_directories(&msg.uri).await?;
        for dir in &dirs {
            self.process_directory(dir, msg.context_type).await?;
        }
        info!(
            "[SemanticProcessor] completed {} ({} directories)",
            msg.uri,
            dirs.len()
        );
        Ok(dirs.len())
    }
}

#[async_trait]
impl DequeueHandler for SemanticProcessor {
    async fn handle(&self, message: Value) -> Result<()> {
        let msg = SemanticMsg::from_value(message)?;
        self.process(&msg).await.map(|_| ())
    }
}
