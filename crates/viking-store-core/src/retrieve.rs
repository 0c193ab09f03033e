//! Hierarchical retrieval over the context tree.
//!
//! A plain top-k vector search treats every node as independent. The
//! [`HierarchicalRetriever`] instead uses the tree: a small global
//! search finds promising directories, then directories are expanded
//! best-first through their `parent_uri` links. A child's score blends
//! its own similarity with its parent's:
//!
//! ```text
//! score(child) = α · sim(child) + (1 − α) · score(parent)
//! ```
//!
//! Expansion stops when the top-`limit` set has been stable for
//! `max_convergence_rounds` consecutive expansions, or when there is
//! nothing left to expand. An optional [`Reranker`] rescores the final
//! candidates before the score threshold is applied.

use std::collections::{BinaryHeap, HashMap, HashSet};
use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::embedding::Embedder;
use crate::filter::Filter;
use crate::fusion::FusionParams;
use crate::llm::Reranker;
use crate::models::{ContextType, MatchedContext};
use crate::store::{ScoredRecord, VectorQuery, VectorStore};

/// One typed sub-query against a single partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedQuery {
    pub query: String,
    pub context_type: ContextType,
    #[serde(default)]
    pub intent: String,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub target_directories: Vec<String>,
}

fn default_priority() -> u32 {
    1
}

impl TypedQuery {
    pub fn new(query: impl Into<String>, context_type: ContextType) -> Self {
        Self {
            query: query.into(),
            context_type,
            intent: String::new(),
            priority: default_priority(),
            target_directories: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub query: TypedQuery,
    pub matched_contexts: Vec<MatchedContext>,
    pub searched_directories: Vec<String>,
}

/// Sub-queries derived from a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub queries: Vec<TypedQuery>,
    #[serde(default)]
    pub session_context: String,
    #[serde(default)]
    pub reasoning: String,
}

/// Results grouped by partition.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FindResult {
    pub memories: Vec<MatchedContext>,
    pub resources: Vec<MatchedContext>,
    pub skills: Vec<MatchedContext>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_plan: Option<QueryPlan>,
    #[serde(skip)]
    pub query_results: Vec<QueryResult>,
}

impl FindResult {
    pub fn from_results(query_results: Vec<QueryResult>, query_plan: Option<QueryPlan>) -> Self {
        let mut out = FindResult {
            query_plan,
            ..Default::default()
        };
        for result in &query_results {
            for ctx in &result.matched_contexts {
                let bucket = match ctx.context_type {
                    ContextType::Memory => &mut out.memories,
                    ContextType::Resource => &mut out.resources,
                    ContextType::Skill => &mut out.skills,
                };
                bucket.push(ctx.clone());
            }
        }
        out.query_results = query_results;
        out
    }

    pub fn total(&self) -> usize {
        self.memories.len() + self.resources.len() + self.skills.len()
    }

    /// All matches, best first.
    pub fn all(&self) -> Vec<&MatchedContext> {
        let mut all: Vec<&MatchedContext> = self
            .memories
            .iter()
            .chain(&self.resources)
            .chain(&self.skills)
            .collect();
        all.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
        all
    }
}

/// Retrieval tuning.
#[derive(Debug, Clone, Copy)]
pub struct RetrieverConfig {
    pub score_propagation_alpha: f64,
    pub max_convergence_rounds: usize,
    pub global_search_topk: usize,
    pub fusion: FusionParams,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            score_propagation_alpha: 0.5,
            max_convergence_rounds: 3,
            global_search_topk: 5,
            fusion: FusionParams::default(),
        }
    }
}

#[derive(Debug, PartialEq)]
struct Frontier {
    score: f64,
    uri: String,
}

impl Eq for Frontier {}

impl PartialOrd for Frontier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Frontier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .partial_cmp(&other.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| other.uri.cmp(&self.uri))
    }
}

pub struct HierarchicalRetriever {
    store: Arc<dyn VectorStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    collection: String,
    config: RetrieverConfig,
}

impl HierarchicalRetriever {
    pub fn new(
        store: Arc<dyn VectorStore>,
        embedder: Arc<dyn Embedder>,
        collection: impl Into<String>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker: None,
            collection: collection.into(),
            config,
        }
    }

    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    pub async fn retrieve(
        &self,
        query: &TypedQuery,
        limit: usize,
        score_threshold: Option<f64>,
        metadata_filter: Option<&Filter>,
    ) -> Result<QueryResult> {
        let embedded = self.embedder.embed(&query.query).await?;
        if embedded.dense.is_none() && embedded.sparse.is_none() {
            bail!("embedder returned no vectors for query");
        }

        let base = base_filter(query, metadata_filter);
        let vector_query = |filter: Option<Filter>, limit: usize| VectorQuery {
            dense: embedded.dense.clone(),
            sparse: embedded.sparse.clone().filter(|s| !s.is_empty()),
            filter,
            limit,
            fusion: self.config.fusion,
        };

        let global = self
            .store
            .search_by_vector(
                &self.collection,
                &vector_query(base.clone(), self.config.global_search_topk.max(limit)),
            )
            .await?;

        let mut results: HashMap<String, MatchedContext> = HashMap::new();
        let mut frontier = BinaryHeap::new();
        let mut visited: HashSet<String> = HashSet::new();

        for dir in &query.target_directories {
            frontier.push(Frontier {
                score: 0.0,
                uri: dir.trim_end_matches('/').to_string(),
            });
        }
        for hit in global {
            let Some(ctx) = to_matched(&hit, hit.score) else {
                continue;
            };
            if !ctx.is_leaf {
                frontier.push(Frontier {
                    score: ctx.score,
                    uri: ctx.uri.clone(),
                });
            }
            merge(&mut results, ctx);
        }

        let alpha = self.config.score_propagation_alpha;
        let mut searched = Vec::new();
        let mut previous_top: Vec<String> = Vec::new();
        let mut stable_rounds = 0;

        while let Some(Frontier { score: parent_score, uri }) = frontier.pop() {
            if !visited.insert(uri.clone()) {
                continue;
            }
            searched.push(uri.clone());

            let mut child_filters = vec![Filter::eq("parent_uri", uri.as_str())];
            child_filters.extend(base.clone());
            let children = self
                .store
                .search_by_vector(
                    &self.collection,
                    &vector_query(
                        Filter::all(child_filters),
                        self.config.fusion.prefetch_limit(limit),
                    ),
                )
                .await?;

            for hit in children {
                let score = if parent_score > 0.0 {
                    alpha * hit.score + (1.0 - alpha) * parent_score
                } else {
                    hit.score
                };
                let Some(ctx) = to_matched(&hit, score) else {
                    continue;
                };
                if !ctx.is_leaf && !visited.contains(&ctx.uri) {
                    frontier.push(Frontier {
                        score,
                        uri: ctx.uri.clone(),
                    });
                }
                merge(&mut results, ctx);
            }

            let top = top_uris(&results, limit);
            if top == previous_top {
                stable_rounds += 1;
                if stable_rounds >= self.config.max_convergence_rounds {
                    tracing::debug!(
                        "[HierarchicalRetriever] converged after {} expansions",
                        searched.len()
                    );
                    break;
                }
            } else {
                stable_rounds = 0;
                previous_top = top;
            }
        }

        let mut matched: Vec<MatchedContext> = results.into_values().collect();
        sort_desc(&mut matched);

        if let Some(reranker) = &self.reranker {
            matched.truncate(self.config.fusion.prefetch_limit(limit));
            let docs: Vec<String> = matched
                .iter()
                .map(|m| {
                    if m.abstract_text.is_empty() {
                        m.uri.clone()
                    } else {
                        m.abstract_text.clone()
                    }
                })
                .collect();
            match reranker.rerank(&query.query, &docs).await {
                Ok(scores) if scores.len() == matched.len() => {
                    for (m, s) in matched.iter_mut().zip(scores) {
                        m.score = s;
                    }
                    sort_desc(&mut matched);
                }
                Ok(scores) => tracing::warn!(
                    "[HierarchicalRetriever] reranker returned {} scores for {} documents",
                    scores.len(),
                    matched.len()
                ),
                Err(e) => tracing::warn!("[HierarchicalRetriever] rerank failed: {:#}", e),
            }
        }

        if let Some(threshold) = score_threshold {
            matched.retain(|m| m.score >= threshold);
        }
        matched.truncate(limit);

        Ok(QueryResult {
            query: query.clone(),
            matched_contexts: matched,
            searched_directories: searched,
        })
    }
}

fn base_filter(query: &TypedQuery, metadata_filter: Option<&Filter>) -> Option<Filter> {
    let mut filters = vec![Filter::eq("context_type", query.context_type.as_str())];
    if !query.target_directories.is_empty() {
        let scopes = query
            .target_directories
            .iter()
            .flat_map(|dir| {
                let dir = dir.trim_end_matches('/');
                [Filter::eq("uri", dir), Filter::prefix("uri", format!("{}/", dir))]
            })
            .collect();
        filters.push(Filter::Or { conds: scopes });
    }
    if let Some(f) = metadata_filter {
        filters.push(f.clone());
    }
    Filter::all(filters)
}

fn to_matched(hit: &ScoredRecord, score: f64) -> Option<MatchedContext> {
    let uri = hit.field_str("uri")?.to_string();
    let context_type = hit
        .field_str("context_type")
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| ContextType::infer_from_uri(&uri));
    Some(MatchedContext {
        parent_uri: hit
            .field_str("parent_uri")
            .filter(|p| !p.is_empty())
            .map(str::to_string),
        is_leaf: hit
            .fields
            .get("is_leaf")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        abstract_text: hit.field_str("abstract").unwrap_or_default().to_string(),
        context_type,
        uri,
        score,
    })
}

fn merge(results: &mut HashMap<String, MatchedContext>, ctx: MatchedContext) {
    match results.get_mut(&ctx.uri) {
        Some(existing) if existing.score >= ctx.score => {}
        Some(existing) => *existing = ctx,
        None => {
            results.insert(ctx.uri.clone(), ctx);
        }
    }
}

fn sort_desc(matched: &mut [MatchedContext]) {
    matched.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.uri.cmp(&b.uri))
    });
}

fn top_uris(results: &HashMap<String, MatchedContext>, limit: usize) -> Vec<String> {
    let mut all: Vec<&MatchedContext> = results.values().collect();
    all.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.uri.cmp(&b.uri))
    });
    all.into_iter().take(limit).map(|m| m.uri.clone()).collect()
}
