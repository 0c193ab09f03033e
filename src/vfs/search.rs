//! `find` and `search` over the vector index.
//!
//! `find` issues one query against the partition implied by the target
//! URI. `search` may first turn session context into a query plan and
//! then runs every planned query concurrently.

use futures::future::join_all;
use serde::Deserialize;
use tracing::debug;
use viking_store_core::filter::Filter;
use viking_store_core::intent::{IntentAnalyzer, IntentInput};
use viking_store_core::models::ContextType;
use viking_store_core::retrieve::{FindResult, HierarchicalRetriever, QueryPlan, TypedQuery};

use super::{parse_uri, VikingFs};
use crate::error::{Result, VikingError};

const MAX_RECENT_MESSAGES: usize = 5;

/// Conversation context for [`VikingFs::search`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub recent_messages: Vec<String>,
}

impl SessionInfo {
    fn is_empty(&self) -> bool {
        self.summary.trim().is_empty() && self.recent_messages.is_empty()
    }
}

impl VikingFs {
    fn retriever(&self) -> Result<HierarchicalRetriever> {
        let embedder = self
            .embedder
            .clone()
            .ok_or_else(|| VikingError::Backend("no embedder configured".into()))?;
        Ok(HierarchicalRetriever::new(
            self.vectors.clone(),
            embedder,
            self.collection.clone(),
            self.retriever_config,
        )
        .with_reranker(self.reranker.clone()))
    }

    async fn run_queries(
        &self,
        queries: &[TypedQuery],
        limit: usize,
        score_threshold: Option<f64>,
        filter: Option<&Filter>,
        plan: Option<QueryPlan>,
    ) -> Result<FindResult> {
        let retriever = self.retriever()?;
        let results = join_all(
            queries
                .iter()
                .map(|q| retriever.retrieve(q, limit, score_threshold, filter)),
        )
        .await
        .into_iter()
        .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(FindResult::from_results(results, plan))
    }

    /// Semantic search in one partition. Without a target URI the
    /// resource partition is searched.
    pub async fn find(
        &self,
        query: &str,
        target_uri: Option<&str>,
        limit: usize,
        score_threshold: Option<f64>,
        filter: Option<&Filter>,
    ) -> Result<FindResult> {
        let typed = match target_uri {
            Some(target) => {
                let target = parse_uri(target)?.to_string();
                let mut q = TypedQuery::new(query, ContextType::infer_from_uri(&target));
                q.target_directories = vec![target];
                q
            }
            None => TypedQuery::new(query, ContextType::Resource),
        };
        self.run_queries(&[typed], limit, score_threshold, filter, None)
            .await
    }

    /// Search with optional session context.
    ///
    /// With a session summary or recent messages and a summarizer, the
    /// intent analyzer plans the queries. Otherwise the query runs
    /// against the target's partition, or all three when there is no
    /// target.
    pub async fn search(
        &self,
        query: &str,
        target_uri: Option<&str>,
        session: Option<&SessionInfo>,
        limit: usize,
        score_threshold: Option<f64>,
        filter: Option<&Filter>,
    ) -> Result<FindResult> {
        let target = target_uri.map(parse_uri).transpose()?.map(|u| u.to_string());
        let target_type = target.as_deref().map(ContextType::infer_from_uri);

        let session = session.filter(|s| !s.is_empty());
        let mut plan = None;
        let mut queries = match (session, &self.summarizer) {
            (Some(session), Some(summarizer)) => {
                let target_abstract = match &target {
                    Some(t) => self.abstract_text(t).await.unwrap_or_default(),
                    None => String::new(),
                };
                let analyzer = IntentAnalyzer::new(summarizer.clone(), MAX_RECENT_MESSAGES);
                let analyzed = analyzer
                    .analyze(&IntentInput {
                        session_summary: &session.summary,
                        recent_messages: &session.recent_messages,
                        current_message: query,
                        context_type: target_type,
                        target_abstract: &target_abstract,
                    })
                    .await?;
                let queries = analyzed.queries.clone();
                plan = Some(analyzed);
                queries
            }
            (session, _) => {
                if session.is_some() {
                    debug!("[VikingFs] no summarizer configured, skipping intent analysis");
                }
                match target_type {
                    Some(t) => vec![TypedQuery::new(query, t)],
                    None => ContextType::ALL
                        .iter()
                        .map(|t| TypedQuery::new(query, *t))
                        .collect(),
                }
            }
        };

        if let Some(t) = &target {
            for q in &mut queries {
                q.target_directories = vec![t.clone()];
            }
        }
        self.run_queries(&queries, limit, score_threshold, filter, plan)
            .await
    }
}
