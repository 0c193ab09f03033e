//! Language-model seams used by the semantic processor and retrieval.
//!
//! Both are opaque text functions from the store's point of view.
//! Concrete clients live in the app crate.

use anyhow::Result;
use async_trait::async_trait;

/// `summarize(prompt) -> text`.
#[async_trait]
pub trait Summarizer: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String>;
}

/// Rescores candidate documents against a query.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Returns one score per document, in input order.
    async fn rerank(&self, query: &str, documents: &[String]) -> Result<Vec<f64>>;
}
