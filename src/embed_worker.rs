//! Consumer for the `Embedding` queue.
//!
//! Each message becomes one vector row keyed by [`vector_id`] of its
//! URI. Vectors carried in the message are stored as-is; otherwise the
//! message text (falling back to its abstract, then its name) is
//! embedded. Re-embedding a node keeps its original `created_at`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::debug;

use viking_store_core::embedding::Embedder;
use viking_store_core::store::{VectorRecord, VectorStore};
use viking_store_core::uri::VikingUri;

use crate::queue::{DequeueHandler, EmbeddingMsg};
use crate::vfs::vector_id;

pub struct EmbeddingConsumer {
    vectors: Arc<dyn VectorStore>,
    collection: String,
    embedder: Option<Arc<dyn Embedder>>,
}

impl EmbeddingConsumer {
    pub fn new(
        vectors: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        embedder: Option<Arc<dyn Embedder>>,
    ) -> Self {
        Self {
            vectors,
            collection: collection.into(),
            embedder,
        }
    }

    fn embed_text(msg: &EmbeddingMsg) -> &str {
        [msg.text.as_str(), msg.abstract_text.as_str(), msg.name.as_str()]
            .into_iter()
            .find(|t| !t.trim().is_empty())
            .unwrap_or_default()
    }

    async fn created_at(&self, id: &str) -> Option<Value> {
        let fetched = self
            .vectors
            .fetch(&self.collection, &[id.to_string()])
            .await
            .ok()?;
        fetched
            .found
            .into_iter()
            .next()
            .and_then(|r| r.fields.get("created_at").cloned())
    }

    /// Build and upsert the row for one message.
    pub async fn store(&self, mut msg: EmbeddingMsg) -> Result<String> {
        if msg.dense.is_none() && msg.sparse.is_none() {
            let Some(embedder) = &self.embedder else {
                bail!("no embedder configured and message for {} carries no vectors", msg.uri);
            };
            let result = embedder
                .embed(Self::embed_text(&msg))
                .await
                .with_context(|| format!("failed to embed {}", msg.uri))?;
            msg.dense = result.dense;
            msg.sparse = result.sparse;
        }

        let parent_uri = msg.parent_uri.clone().or_else(|| {
            VikingUri::parse(&msg.uri)
                .ok()
                .and_then(|u| u.parent())
                .map(|p| p.to_string())
        });
        let id = vector_id(&msg.uri);
        let now = json!(Utc::now().to_rfc3339());
        let created_at = self.created_at(&id).await.unwrap_or_else(|| now.clone());

        let mut record = VectorRecord::new(id.clone());
        record.vector = msg.dense;
        record.sparse_vector = msg.sparse;
        let fields = &mut record.fields;
        fields.insert("uri".into(), json!(msg.uri));
        if let Some(parent) = parent_uri {
            fields.insert("parent_uri".into(), json!(parent));
        }
        fields.insert("context_type".into(), json!(msg.context_type.as_str()));
        fields.insert(
            "type".into(),
            json!(if msg.is_leaf { "file" } else { "directory" }),
        );
        fields.insert("is_leaf".into(), json!(msg.is_leaf));
        fields.insert("name".into(), json!(msg.name));
        fields.insert("abstract".into(), json!(msg.abstract_text));
        fields.insert("created_at".into(), created_at);
        fields.insert("updated_at".into(), now);
        fields.insert("active_count".into(), json!(0));

        self.vectors.upsert(&self.collection, vec![record]).await?;
        debug!("[EmbeddingConsumer] upserted {} ({})", msg.uri, id);
        Ok(id)
    }
}

#[async_trait]
impl DequeueHandler for EmbeddingConsumer {
    async fn handle(&self, message: Value) -> Result<()> {
        let msg = EmbeddingMsg::from_value(message)?;
        self.store(msg).await.map(|_| ())
    }
}
