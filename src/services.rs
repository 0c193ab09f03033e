//! Wiring of the store's components.
//!
//! [`Services`] builds everything a process needs from one [`Config`]:
//! the object store, the transaction manager, the vector backend, the
//! model clients, the queue manager with both pipeline consumers
//! registered, and the [`VikingFs`] facade on top. Nothing is global;
//! callers hold the `Services` value and pass references down.
//!
//! ```text
//! VikingFs ──write/mv/rm──▶ ObjectStore ◀── TransactionManager
//!     │ reindex
//!     ▼
//! Semantic queue ──▶ SemanticProcessor ──▶ Embedding queue ──▶ EmbeddingConsumer ──▶ VectorStore
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::info;

use viking_store_core::store::VectorStore;

use crate::backend::open_vector_store;
use crate::config::Config;
use crate::embed_worker::EmbeddingConsumer;
use crate::embedding::create_embedder;
use crate::llm::create_summarizer;
use crate::objstore::{LocalFs, ObjectStore};
use crate::queue::{QueueManager, QueueStatus, EMBEDDING, SEMANTIC};
use crate::semantic::SemanticProcessor;
use crate::transaction::TransactionManager;
use crate::vfs::VikingFs;

pub struct Services {
    pub config: Config,
    pub fs: Arc<dyn ObjectStore>,
    pub txn: Arc<TransactionManager>,
    pub vectors: Arc<dyn VectorStore>,
    pub queues: Arc<QueueManager>,
    pub vfs: VikingFs,
}

impl Services {
    /// Build on a [`LocalFs`] rooted at `{workspace}/fs`.
    pub async fn open(config: Config) -> Result<Self> {
        let fs: Arc<dyn ObjectStore> = Arc::new(LocalFs::new(config.fs_root())?);
        Self::with_object_store(config, fs).await
    }

    /// Build on an existing object store. Background workers are not
    /// started; call [`start`](Self::start).
    pub async fn with_object_store(config: Config, fs: Arc<dyn ObjectStore>) -> Result<Self> {
        let txn = Arc::new(TransactionManager::new(fs.clone(), &config.transaction));
        let vectors = open_vector_store(&config).await?;
        let embedder = create_embedder(&config)?;
        let summarizer = create_summarizer(&config)?;
        let collection = config.vectordb.collection.clone();

        let base = VikingFs::new(fs.clone(), txn.clone(), vectors.clone(), collection.clone())
            .with_embedder(embedder.clone())
            .with_summarizer(Some(summarizer.clone()))
            .with_retriever_config(config.retrieval.retriever());

        let queues = Arc::new(QueueManager::new(fs.clone(), &config.queue));
        let processor = SemanticProcessor::new(
            Arc::new(base.clone()),
            summarizer,
            queues.queue(EMBEDDING)?,
            &config.semantic,
        );
        queues.register_handler(SEMANTIC, Arc::new(processor))?;
        queues.register_handler(
            EMBEDDING,
            Arc::new(EmbeddingConsumer::new(vectors.clone(), collection, embedder)),
        )?;

        let vfs = base.with_queues(queues.clone());
        Ok(Self {
            config,
            fs,
            txn,
            vectors,
            queues,
            vfs,
        })
    }

    /// Start the transaction timeout sweep and the queue dispatcher.
    pub async fn start(&self) -> Result<()> {
        self.txn.start().await?;
        self.queues.start()?;
        info!("[Services] background workers started");
        Ok(())
    }

    /// Stop both background workers. Messages still queued stay on disk.
    pub async fn stop(&self) {
        self.queues.stop().await;
        self.txn.stop().await;
    }

    /// Block until both pipeline queues are drained.
    pub async fn wait_indexed(&self, timeout: Option<Duration>) -> Result<BTreeMap<String, QueueStatus>> {
        Ok(self.queues.wait_complete(None, timeout).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use crate::objstore::MemoryFs;

    #[tokio::test]
    async fn test_services_register_both_consumers() {
        let mut config = Config::default();
        config.vectordb.backend = BackendKind::Memory;
        let services = Services::with_object_store(config, Arc::new(MemoryFs::new()))
            .await
            .unwrap();
        assert!(services.queues.queue(SEMANTIC).unwrap().has_handler());
        assert!(services.queues.queue(EMBEDDING).unwrap().has_handler());

        services.start().await.unwrap();
        assert!(services.queues.is_running());
        services.stop().await;
        assert!(!services.queues.is_running());
        assert!(!services.txn.is_running());
    }
}
