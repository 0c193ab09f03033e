//! Summarizer clients.
//!
//! | Provider     | Backend                                            |
//! |--------------|----------------------------------------------------|
//! | `extractive` | [`ExtractiveSummarizer`], local and deterministic  |
//! | `openai`     | `POST https://api.openai.com/v1/chat/completions`  |
//! | `ollama`     | `POST {url}/api/chat`                              |
//!
//! Prompts put the text to summarize after [`INPUT_MARKER`]. The
//! extractive summarizer only looks at that part: a body starting with
//! a `# ` title is treated as an overview request, anything else as a
//! single document to condense into one sentence. Prompts it does not
//! understand (intent analysis) get a plain sentence back, which
//! callers treat as unparsable output.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use viking_store_core::llm::Summarizer;

use crate::config::{Config, LlmProviderKind};
use crate::http::{endpoint_url, openai_api_key, JsonEndpoint, OLLAMA_DEFAULT_URL};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Separates instructions from the material in a prompt.
pub const INPUT_MARKER: &str = "---- INPUT ----";

const MAX_SENTENCE_CHARS: usize = 200;
const LEAD_ENTRIES: usize = 3;

/// Build the configured summarizer.
pub fn create_summarizer(config: &Config) -> Result<Arc<dyn Summarizer>> {
    Ok(match config.llm.provider {
        LlmProviderKind::Extractive => Arc::new(ExtractiveSummarizer),
        LlmProviderKind::OpenAI => Arc::new(ChatSummarizer::openai(config)?),
        LlmProviderKind::Ollama => Arc::new(ChatSummarizer::ollama(config)?),
    })
}

// ============ Extractive ============

/// Summaries built from the input text itself. No model, no network.
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    fn model_name(&self) -> &str {
        "extractive"
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let material = prompt
            .rsplit_once(INPUT_MARKER)
            .map(|(_, m)| m)
            .unwrap_or(prompt)
            .trim();
        if material.starts_with("# ") {
            Ok(extract_overview(material))
        } else {
            Ok(lead_sentence(material))
        }
    }
}

/// First sentence of the first line with prose in it.
fn lead_sentence(text: &str) -> String {
    let Some(line) = text
        .lines()
        .map(|l| l.trim().trim_start_matches(['#', '-', '*', '>']).trim())
        .find(|l| !l.is_empty())
    else {
        return String::new();
    };

    let sentence = match line.find(". ") {
        Some(end) => &line[..=end],
        None => line,
    };
    if sentence.chars().count() > MAX_SENTENCE_CHARS {
        let cut: String = sentence.chars().take(MAX_SENTENCE_CHARS - 3).collect();
        format!("{}...", cut.trim_end())
    } else {
        sentence.to_string()
    }
}

/// Description part of an index line: `[1] a.md: text` or `- b/: text`.
fn entry_description(line: &str) -> Option<&str> {
    let line = line.trim();
    if !(line.starts_with('[') || line.starts_with("- ")) {
        return None;
    }
    line.split_once(": ")
        .map(|(_, desc)| desc.trim())
        .filter(|d| !d.is_empty())
}

/// Title, a lead paragraph from the first few entry descriptions, then
/// the material's sections unchanged.
fn extract_overview(material: &str) -> String {
    let mut lines = material.lines();
    let title = lines.next().unwrap_or_default().trim();
    let body: Vec<&str> = lines.collect();

    let lead: Vec<String> = body
        .iter()
        .filter_map(|l| entry_description(l))
        .map(lead_sentence)
        .filter(|s| !s.is_empty())
        .take(LEAD_ENTRIES)
        .collect();
    let lead = if lead.is_empty() {
        format!("{} has no summarized content yet.", title.trim_start_matches("# "))
    } else {
        lead.join(" ")
    };

    format!("{}\n\n{}\n\n{}", title, lead, body.join("\n").trim())
}

// ============ Chat completion ============

#[derive(Debug, Clone, Copy)]
enum ChatApi {
    OpenAI,
    Ollama,
}

/// Chat-completion client for OpenAI or Ollama.
pub struct ChatSummarizer {
    endpoint: JsonEndpoint,
    model: String,
    api: ChatApi,
}

fn required_model(config: &Config) -> Result<String> {
    config
        .llm
        .model
        .clone()
        .with_context(|| format!("llm.model required for {:?} provider", config.llm.provider))
}

impl ChatSummarizer {
    pub fn openai(config: &Config) -> Result<Self> {
        let url = config
            .llm
            .url
            .clone()
            .unwrap_or_else(|| OPENAI_CHAT_URL.to_string());
        Ok(Self {
            endpoint: JsonEndpoint::new(
                "OpenAI",
                url,
                Some(openai_api_key()?),
                Duration::from_secs(config.llm.timeout_secs),
                config.llm.max_retries,
            )?,
            model: required_model(config)?,
            api: ChatApi::OpenAI,
        })
    }

    pub fn ollama(config: &Config) -> Result<Self> {
        let base = config.llm.url.as_deref().unwrap_or(OLLAMA_DEFAULT_URL);
        Ok(Self {
            endpoint: JsonEndpoint::new(
                "Ollama",
                endpoint_url(base, "/api/chat"),
                None,
                Duration::from_secs(config.llm.timeout_secs),
                config.llm.max_retries,
            )?,
            model: required_model(config)?,
            api: ChatApi::Ollama,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        let messages = json!([{ "role": "user", "content": prompt }]);
        match self.api {
            ChatApi::OpenAI => json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.0,
            }),
            ChatApi::Ollama => json!({
                "model": self.model,
                "messages": messages,
                "stream": false,
            }),
        }
    }
}

#[async_trait]
impl Summarizer for ChatSummarizer {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let response = self.endpoint.post(&self.request_body(prompt)).await?;
        let text = match self.api {
            ChatApi::OpenAI => parse_openai_chat(&response)?,
            ChatApi::Ollama => parse_ollama_chat(&response)?,
        };
        Ok(text.trim().to_string())
    }
}

fn parse_openai_chat(json: &Value) -> Result<String> {
    json.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("Invalid OpenAI response: missing choices[0].message.content")
}

fn parse_ollama_chat(json: &Value) -> Result<String> {
    json.pointer("/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .context("Invalid Ollama response: missing message.content")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_sentence() {
        assert_eq!(
            lead_sentence("# Title\n\nFirst sentence here. Second one."),
            "Title"
        );
        assert_eq!(
            lead_sentence("\n\nWAL makes writes durable. It appends first."),
            "WAL makes writes durable."
        );
        assert_eq!(lead_sentence("  \n "), "");
        let long = "x".repeat(500);
        assert_eq!(lead_sentence(&long).chars().count(), MAX_SENTENCE_CHARS);
    }

    #[tokio::test]
    async fn test_extractive_file_summary_uses_input_only() {
        let prompt = format!(
            "Summarize the file. Instructions are ignored.\n\n{}\nRust ownership rules. Borrowing too.",
            INPUT_MARKER
        );
        let out = ExtractiveSummarizer.complete(&prompt).await.unwrap();
        assert_eq!(out, "Rust ownership rules.");
    }

    #[tokio::test]
    async fn test_extractive_overview_leads_with_entries() {
        let prompt = format!(
            "{}\n# docs\n\n## Files\n[1] a.md: Covers storage. More.\n\n## Subdirectories\n- api/: HTTP handlers.",
            INPUT_MARKER
        );
        let out = ExtractiveSummarizer.complete(&prompt).await.unwrap();
        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("# docs"));
        assert_eq!(lines.next(), Some(""));
        assert_eq!(lines.next(), Some("Covers storage. HTTP handlers."));
        assert!(out.contains("## Subdirectories\n- api/: HTTP handlers."));
    }

    #[tokio::test]
    async fn test_extractive_overview_without_entries() {
        let out = ExtractiveSummarizer
            .complete(&format!("{}\n# empty\n\n## Files\nNone", INPUT_MARKER))
            .await
            .unwrap();
        assert!(out.contains("empty has no summarized content yet."));
    }

    #[test]
    fn test_parse_chat_responses() {
        let openai = json!({"choices": [{"message": {"role": "assistant", "content": " hi "}}]});
        assert_eq!(parse_openai_chat(&openai).unwrap(), " hi ");
        assert!(parse_openai_chat(&json!({"choices": []})).is_err());

        let ollama = json!({"message": {"role": "assistant", "content": "ok"}, "done": true});
        assert_eq!(parse_ollama_chat(&ollama).unwrap(), "ok");
        assert!(parse_ollama_chat(&json!({"response": "x"})).is_err());
    }

    #[test]
    fn test_create_summarizer() {
        let mut config = Config::default();
        assert_eq!(create_summarizer(&config).unwrap().model_name(), "extractive");

        config.llm.provider = LlmProviderKind::Ollama;
        assert!(create_summarizer(&config).is_err());
        config.llm.model = Some("llama3".into());
        assert_eq!(create_summarizer(&config).unwrap().model_name(), "llama3");
    }
}
