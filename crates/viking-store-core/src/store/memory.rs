//! In-memory [`VectorStore`] implementation for tests and small workspaces.
//!
//! Collections are `HashMap`s behind `std::sync::RwLock`. Vector search
//! is brute-force cosine similarity; sparse search is a dot product
//! over shared terms. Nothing survives the process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::embedding::{cosine_similarity, sparse_dot};
use crate::filter::Filter;
use crate::models::SparseVector;
use crate::schema::CollectionSchema;

use super::{
    aggregate_counts, keyword_score, scalar_order, AggregateRequest, FetchResult, ScoredRecord,
    SortOrder, VectorRecord, VectorStore,
};

struct Collection {
    schema: CollectionSchema,
    records: HashMap<String, VectorRecord>,
    /// Insertion order, so equal scores come back deterministically.
    order: Vec<String>,
}

impl Collection {
    fn iter(&self) -> impl Iterator<Item = &VectorRecord> {
        self.order.iter().filter_map(|id| self.records.get(id))
    }

    fn filtered<'a>(
        &'a self,
        filter: Option<&'a Filter>,
    ) -> impl Iterator<Item = &'a VectorRecord> + 'a {
        self.iter()
            .filter(move |r| filter.map_or(true, |f| f.matches(&r.fields)))
    }
}

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .read()
            .map_err(|_| anyhow!("in-memory vector store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .write()
            .map_err(|_| anyhow!("in-memory vector store lock poisoned"))
    }
}

fn top_k(mut hits: Vec<ScoredRecord>, limit: usize) -> Vec<ScoredRecord> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

fn scored(record: &VectorRecord, score: f64) -> ScoredRecord {
    ScoredRecord {
        id: record.id.clone(),
        score,
        fields: record.fields.clone(),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        schema.validate()?;
        let mut cols = self.write()?;
        if let Some(existing) = cols.get(&schema.name) {
            if existing.schema != *schema {
                bail!("collection '{}' already exists with a different schema", schema.name);
            }
            return Ok(());
        }
        cols.insert(
            schema.name.clone(),
            Collection {
                schema: schema.clone(),
                records: HashMap::new(),
                order: Vec::new(),
            },
        );
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self.read()?.contains_key(name))
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        Ok(self.write()?.remove(name).is_some())
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        let mut cols = self.write()?;
        let col = cols
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;
        let dim = col.schema.vector_dim();

        for record in records {
            if let (Some(dim), Some(v)) = (dim, &record.vector) {
                if v.len() != dim {
                    bail!(
                        "record '{}': vector has {} dims, collection expects {}",
                        record.id,
                        v.len(),
                        dim
                    );
                }
            }
            if !col.records.contains_key(&record.id) {
                col.order.push(record.id.clone());
            }
            col.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<FetchResult> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let mut result = FetchResult::default();
        for id in ids {
            match col.records.get(id) {
                Some(r) => result.found.push(r.clone()),
                None => result.missing.push(id.clone()),
            }
        }
        Ok(result)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        let mut cols = self.write()?;
        let col = cols
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let mut removed = 0;
        for id in ids {
            if col.records.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            let records = &col.records;
            col.order.retain(|id| records.contains_key(id));
        }
        Ok(removed)
    }

    async fn delete_all(&self, collection: &str) -> Result<usize> {
        let mut cols = self.write()?;
        let col = cols
            .get_mut(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;
        let n = col.records.len();
        col.records.clear();
        col.order.clear();
        Ok(n)
    }

    async fn search_dense(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let hits = col
            .filtered(filter)
            .filter_map(|r| {
                r.vector
                    .as_ref()
                    .map(|v| scored(r, cosine_similarity(vector, v) as f64))
            })
            .collect();
        Ok(top_k(hits, limit))
    }

    async fn search_sparse(
        &self,
        collection: &str,
        sparse: &SparseVector,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let hits = col
            .filtered(filter)
            .filter_map(|r| {
                let score = sparse_dot(sparse, r.sparse_vector.as_ref()?);
                (score > 0.0).then(|| scored(r, score as f64))
            })
            .collect();
        Ok(top_k(hits, limit))
    }

    async fn search_by_keywords(
        &self,
        collection: &str,
        keywords: &[String],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let hits = col
            .filtered(filter)
            .filter_map(|r| {
                let score = keyword_score(&r.fields, keywords);
                (score > 0.0).then(|| scored(r, score))
            })
            .collect();
        Ok(top_k(hits, limit))
    }

    async fn search_by_scalar(
        &self,
        collection: &str,
        field: &str,
        order: SortOrder,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        let mut rows: Vec<&VectorRecord> = col.filtered(filter).collect();
        rows.sort_by(|a, b| scalar_order(&a.fields, &b.fields, field, order));
        Ok(rows
            .into_iter()
            .take(limit)
            .map(|r| scored(r, 0.0))
            .collect())
    }

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregateRequest,
    ) -> Result<BTreeMap<String, u64>> {
        let cols = self.read()?;
        let col = cols
            .get(collection)
            .ok_or_else(|| anyhow!("collection '{}' not found", collection))?;

        Ok(aggregate_counts(
            col.filtered(request.filter.as_ref()).map(|r| &r.fields),
            request,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fusion::FusionParams;
    use crate::schema::{CollectionSchema, FieldSchema, FieldType};
    use crate::store::VectorQuery;
    use serde_json::json;

    fn schema() -> CollectionSchema {
        CollectionSchema {
            name: "c".into(),
            description: String::new(),
            fields: vec![
                FieldSchema::new("id", FieldType::String).primary_key(),
                FieldSchema::new("vector", FieldType::Vector).with_dim(2),
                FieldSchema::new("sparse_vector", FieldType::SparseVector),
                FieldSchema::new("uri", FieldType::Path),
            ],
        }
    }

    fn record(id: &str, v: [f32; 2], terms: &[(&str, f32)]) -> VectorRecord {
        let mut r = VectorRecord::new(id);
        r.vector = Some(v.to_vec());
        r.sparse_vector = Some(terms.iter().map(|(t, w)| (t.to_string(), *w)).collect());
        r.fields.insert("uri".into(), json!(format!("viking://resources/{}", id)));
        r
    }

    async fn store() -> InMemoryVectorStore {
        let store = InMemoryVectorStore::new();
        store.create_collection(&schema()).await.unwrap();
        store
            .upsert(
                "c",
                vec![
                    record("a", [1.0, 0.0], &[("x", 1.0)]),
                    record("b", [0.9, 0.1], &[("y", 1.0)]),
                    record("c", [0.0, 1.0], &[("x", 2.0)]),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_dense_search_ranks_by_cosine() {
        let store = store().await;
        let hits = store.search_dense("c", &[1.0, 0.0], None, 2).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "a");
        assert_eq!(hits[1].id, "b");
    }

    #[tokio::test]
    async fn test_sparse_search_skips_non_overlapping() {
        let store = store().await;
        let q: SparseVector = [("x".to_string(), 1.0)].into_iter().collect();
        let hits = store.search_sparse("c", &q, None, 10).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_hybrid_matches_rrf_table() {
        let store = store().await;
        // dense ranks: a(1) b(2) c(3); sparse ranks: c(1) a(2)
        // a = 1/61 + 1/62, c = 1/63 + 1/61, b = 1/62
        let q = VectorQuery::dense(vec![1.0, 0.0], 3)
            .with_sparse([("x".to_string(), 1.0)].into_iter().collect())
            .with_fusion(FusionParams::default());
        let hits = store.search_by_vector("c", &q).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
        assert!((hits[0].score - (1.0 / 61.0 + 1.0 / 62.0)).abs() < 1e-12);
        assert!((hits[2].score - 1.0 / 62.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_filter_applies_to_all_modes() {
        let store = store().await;
        let f = Filter::eq("uri", "viking://resources/c");
        let q = VectorQuery::dense(vec![1.0, 0.0], 3)
            .with_sparse([("x".to_string(), 1.0)].into_iter().collect())
            .with_filter(Some(f));
        let hits = store.search_by_vector("c", &q).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "c");
    }

    #[tokio::test]
    async fn test_upsert_rejects_wrong_dim() {
        let store = store().await;
        let mut r = VectorRecord::new("bad");
        r.vector = Some(vec![1.0, 2.0, 3.0]);
        assert!(store.upsert("c", vec![r]).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_and_delete() {
        let store = store().await;
        let ids = vec!["a".to_string(), "zz".to_string()];
        let fetched = store.fetch("c", &ids).await.unwrap();
        assert_eq!(fetched.found.len(), 1);
        assert_eq!(fetched.missing, vec!["zz".to_string()]);
        assert_eq!(fetched.found[0].vector.as_deref(), Some(&[1.0f32, 0.0][..]));

        assert_eq!(store.delete("c", &ids).await.unwrap(), 1);
        let total = store.aggregate("c", &AggregateRequest::count()).await.unwrap();
        assert_eq!(total["_total"], 2);
        assert_eq!(store.delete_all("c").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_scalar_sort() {
        let store = store().await;
        let hits = store
            .search_by_scalar("c", "uri", SortOrder::Desc, None, 10)
            .await
            .unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_collection_lifecycle() {
        let store = InMemoryVectorStore::new();
        assert!(!store.has_collection("c").await.unwrap());
        store.create_collection(&schema()).await.unwrap();
        store.create_collection(&schema()).await.unwrap();
        assert!(store.has_collection("c").await.unwrap());
        assert!(store.drop_collection("c").await.unwrap());
        assert!(!store.drop_collection("c").await.unwrap());
    }
}
