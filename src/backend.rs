//! Vector-store backend selection.
//!
//! | `vectordb.backend` | Implementation | Persistence |
//! |--------------------|----------------|-------------|
//! | `memory` | [`InMemoryVectorStore`] | none |
//! | `sqlite` | [`SqliteVectorStore`] | `{workspace}/vectordb/vectors.sqlite` |
//!
//! [`open_vector_store`] also makes sure the context collection exists
//! with the configured dimensionality.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use viking_store_core::schema::context_collection_schema;
use viking_store_core::store::memory::InMemoryVectorStore;
use viking_store_core::store::VectorStore;

use crate::config::{BackendKind, Config};
use crate::sqlite_store::SqliteVectorStore;

/// Open the configured backend and create the context collection if
/// it is missing.
pub async fn open_vector_store(config: &Config) -> Result<Arc<dyn VectorStore>> {
    let store: Arc<dyn VectorStore> = match config.vectordb.backend {
        BackendKind::Memory => Arc::new(InMemoryVectorStore::new()),
        BackendKind::Sqlite => Arc::new(SqliteVectorStore::open(&config.vectordb_path()).await?),
    };

    let schema = context_collection_schema(&config.vectordb.collection, config.vectordb.dims);
    store.create_collection(&schema).await?;
    info!(
        "[VectorStore] backend={} collection={} dims={}",
        store.backend_name(),
        config.vectordb.collection,
        config.vectordb.dims
    );
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_backend_has_collection() {
        let mut config = Config::default();
        config.vectordb.backend = BackendKind::Memory;
        let store = open_vector_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "memory");
        assert!(store.has_collection("context").await.unwrap());
    }

    #[tokio::test]
    async fn test_sqlite_backend_reopens() {
        let tmp = TempDir::new().unwrap();
        let config = Config::for_workspace(tmp.path());
        let store = open_vector_store(&config).await.unwrap();
        assert_eq!(store.backend_name(), "sqlite");
        assert!(config.vectordb_path().exists());
        drop(store);

        assert!(open_vector_store(&config).await.is_ok());
    }

    #[tokio::test]
    async fn test_sqlite_rejects_changed_dims() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::for_workspace(tmp.path());
        open_vector_store(&config).await.unwrap();
        config.vectordb.dims = 8;
        assert!(open_vector_store(&config).await.is_err());
    }
}
