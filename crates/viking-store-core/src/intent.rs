//! Turns conversational context into typed retrieval queries.
//!
//! The analyzer asks the summarizer for a JSON [`QueryPlan`]. Any
//! output that does not parse into at least one query falls back to
//! the current message issued against every partition (or only the
//! target partition when one is known).

use std::sync::Arc;

use anyhow::Result;
use serde::Deserialize;

use crate::llm::Summarizer;
use crate::models::ContextType;
use crate::retrieve::{QueryPlan, TypedQuery};

pub struct IntentAnalyzer {
    summarizer: Arc<dyn Summarizer>,
    max_recent_messages: usize,
}

/// Inputs to [`IntentAnalyzer::analyze`].
#[derive(Debug, Clone, Default)]
pub struct IntentInput<'a> {
    pub session_summary: &'a str,
    pub recent_messages: &'a [String],
    pub current_message: &'a str,
    pub context_type: Option<ContextType>,
    pub target_abstract: &'a str,
}

#[derive(Deserialize)]
struct RawPlan {
    #[serde(default)]
    queries: Vec<TypedQuery>,
    #[serde(default)]
    reasoning: String,
}

impl IntentAnalyzer {
    pub fn new(summarizer: Arc<dyn Summarizer>, max_recent_messages: usize) -> Self {
        Self {
            summarizer,
            max_recent_messages,
        }
    }

    pub fn build_prompt(&self, input: &IntentInput<'_>) -> String {
        let skip = input
            .recent_messages
            .len()
            .saturating_sub(self.max_recent_messages);
        let recent: Vec<&str> = input.recent_messages[skip..]
            .iter()
            .map(String::as_str)
            .collect();

        let partitions = match input.context_type {
            Some(t) => t.as_str().to_string(),
            None => "memory, resource, skill".to_string(),
        };

        let mut prompt = String::from(
            "Plan retrieval queries for the user's current message.\n\
             Reply with JSON only: {\"queries\": [{\"query\": str, \"context_type\": \
             \"memory\"|\"resource\"|\"skill\", \"intent\": str, \"priority\": int}], \
             \"reasoning\": str}\n\n",
        );
        prompt.push_str(&format!("Allowed context types: {}\n", partitions));
        if !input.session_summary.is_empty() {
            prompt.push_str(&format!("\nSession summary:\n{}\n", input.session_summary));
        }
        if !recent.is_empty() {
            prompt.push_str("\nRecent messages:\n");
            for m in recent {
                prompt.push_str(&format!("- {}\n", m));
            }
        }
        if !input.target_abstract.is_empty() {
            prompt.push_str(&format!("\nTarget directory: {}\n", input.target_abstract));
        }
        prompt.push_str(&format!("\nCurrent message:\n{}\n", input.current_message));
        prompt
    }

    pub async fn analyze(&self, input: &IntentInput<'_>) -> Result<QueryPlan> {
        let prompt = self.build_prompt(input);
        let session_context = input.session_summary.to_string();

        let reply = match self.summarizer.complete(&prompt).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("[IntentAnalyzer] summarizer failed, using fallback plan: {:#}", e);
                return Ok(fallback_plan(input, session_context));
            }
        };

        match parse_plan(&reply) {
            Some(raw) => {
                let queries: Vec<TypedQuery> = raw
                    .queries
                    .into_iter()
                    .filter(|q| !q.query.trim().is_empty())
                    .filter(|q| input.context_type.map_or(true, |t| t == q.context_type))
                    .collect();
                if queries.is_empty() {
                    return Ok(fallback_plan(input, session_context));
                }
                Ok(QueryPlan {
                    queries,
                    session_context,
                    reasoning: raw.reasoning,
                })
            }
            None => {
                tracing::debug!("[IntentAnalyzer] unparsable plan, using fallback");
                Ok(fallback_plan(input, session_context))
            }
        }
    }
}

/// Parse the first JSON object in `reply`, tolerating code fences and
/// surrounding prose.
fn parse_plan(reply: &str) -> Option<RawPlan> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&reply[start..=end]).ok()
}

fn fallback_plan(input: &IntentInput<'_>, session_context: String) -> QueryPlan {
    let types: Vec<ContextType> = match input.context_type {
        Some(t) => vec![t],
        None => ContextType::ALL.to_vec(),
    };
    QueryPlan {
        queries: types
            .into_iter()
            .map(|t| TypedQuery::new(input.current_message, t))
            .collect(),
        session_context,
        reasoning: "fallback".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Canned(String);

    #[async_trait]
    impl Summarizer for Canned {
        fn model_name(&self) -> &str {
            "canned"
        }
        async fn complete(&self, _prompt: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    fn analyzer(reply: &str) -> IntentAnalyzer {
        IntentAnalyzer::new(Arc::new(Canned(reply.to_string())), 5)
    }

    #[tokio::test]
    async fn test_parses_plan_inside_fence() {
        let reply = "```json\n{\"queries\": [{\"query\": \"rust lifetimes\", \
                     \"context_type\": \"resource\", \"intent\": \"learn\", \"priority\": 2}], \
                     \"reasoning\": \"asks about rust\"}\n```";
        let plan = analyzer(reply)
            .analyze(&IntentInput {
                current_message: "how do lifetimes work?",
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.queries.len(), 1);
        assert_eq!(plan.queries[0].query, "rust lifetimes");
        assert_eq!(plan.queries[0].priority, 2);
        assert_eq!(plan.reasoning, "asks about rust");
    }

    #[tokio::test]
    async fn test_garbage_falls_back_to_all_partitions() {
        let plan = analyzer("not json at all")
            .analyze(&IntentInput {
                current_message: "hello",
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.queries.len(), 3);
        assert!(plan.queries.iter().all(|q| q.query == "hello"));
    }

    #[tokio::test]
    async fn test_target_type_restricts_plan() {
        let plan = analyzer("{}")
            .analyze(&IntentInput {
                current_message: "hello",
                context_type: Some(ContextType::Skill),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(plan.queries.len(), 1);
        assert_eq!(plan.queries[0].context_type, ContextType::Skill);
    }

    #[test]
    fn test_prompt_keeps_last_messages() {
        let a = analyzer("");
        let msgs: Vec<String> = (0..8).map(|i| format!("msg{}", i)).collect();
        let prompt = a.build_prompt(&IntentInput {
            recent_messages: &msgs,
            current_message: "now",
            ..Default::default()
        });
        assert!(!prompt.contains("msg2"));
        assert!(prompt.contains("msg3"));
        assert!(prompt.contains("msg7"));
    }
}
