//! Vector-store abstraction for context nodes.
//!
//! The [`VectorStore`] trait is the contract every backend implements:
//! collection lifecycle, record CRUD, dense/sparse/hybrid similarity
//! search, keyword and scalar scans, and counting aggregates. Backends
//! only implement the single-mode searches; hybrid fusion is provided
//! here once for all of them.
//!
//! # Operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`create_collection`](VectorStore::create_collection) | Declare a collection from a [`CollectionSchema`] |
//! | [`upsert`](VectorStore::upsert) | Insert or replace records by id |
//! | [`fetch`](VectorStore::fetch) | Read records (with vectors) by id |
//! | [`delete`](VectorStore::delete) | Remove records by id |
//! | [`search_by_vector`](VectorStore::search_by_vector) | Dense, sparse, or RRF-fused hybrid search |
//! | [`search_by_keywords`](VectorStore::search_by_keywords) | Keyword match over text fields |
//! | [`search_by_scalar`](VectorStore::search_by_scalar) | Filter and sort by a scalar field |
//! | [`aggregate`](VectorStore::aggregate) | Count, optionally grouped by a field |
//!
//! Record ids are opaque caller-chosen strings. A backend whose native
//! key has a fixed format maps ids through [`native_key`] and stores
//! the original id alongside the record.

pub mod memory;

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::filter::{compare, Filter};
use crate::fusion::{reciprocal_rank_fusion, FusionParams};
use crate::models::SparseVector;
use crate::schema::CollectionSchema;

/// Namespace for deriving UUIDv5 native keys from caller ids.
pub const NATIVE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0xf47ac10b_58cc_4372_a567_0e02b2c3d479);

/// Deterministic native key for a caller id.
pub fn native_key(id: &str) -> Uuid {
    Uuid::new_v5(&NATIVE_KEY_NAMESPACE, id.as_bytes())
}

/// Text fields scanned by keyword search.
pub const TEXT_FIELDS: [&str; 6] = ["abstract", "content", "text", "name", "title", "description"];

/// A stored record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub sparse_vector: Option<SparseVector>,
    /// Scalar payload (`uri`, `parent_uri`, `context_type`, ...).
    #[serde(default)]
    pub fields: Map<String, Value>,
}

impl VectorRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            vector: None,
            sparse_vector: None,
            fields: Map::new(),
        }
    }

    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub id: String,
    pub score: f64,
    pub fields: Map<String, Value>,
}

impl ScoredRecord {
    pub fn field_str(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub found: Vec<VectorRecord>,
    /// Requested ids with no stored record.
    pub missing: Vec<String>,
}

/// Similarity query. At least one of `dense`/`sparse` must be set.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    pub dense: Option<Vec<f32>>,
    pub sparse: Option<SparseVector>,
    pub filter: Option<Filter>,
    pub limit: usize,
    pub fusion: FusionParams,
}

impl VectorQuery {
    pub fn dense(vector: Vec<f32>, limit: usize) -> Self {
        Self {
            dense: Some(vector),
            sparse: None,
            filter: None,
            limit,
            fusion: FusionParams::default(),
        }
    }

    pub fn with_sparse(mut self, sparse: SparseVector) -> Self {
        if !sparse.is_empty() {
            self.sparse = Some(sparse);
        }
        self
    }

    pub fn with_filter(mut self, filter: Option<Filter>) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_fusion(mut self, fusion: FusionParams) -> Self {
        self.fusion = fusion;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateOp {
    Count,
}

/// Bounds applied to group counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CountCondition {
    pub gt: Option<u64>,
    pub gte: Option<u64>,
    pub lt: Option<u64>,
    pub lte: Option<u64>,
}

impl CountCondition {
    pub fn accepts(&self, n: u64) -> bool {
        self.gt.map_or(true, |b| n > b)
            && self.gte.map_or(true, |b| n >= b)
            && self.lt.map_or(true, |b| n < b)
            && self.lte.map_or(true, |b| n <= b)
    }
}

#[derive(Debug, Clone)]
pub struct AggregateRequest {
    pub op: AggregateOp,
    /// Group-by field. `None` counts everything under `_total`.
    pub field: Option<String>,
    pub filter: Option<Filter>,
    pub cond: Option<CountCondition>,
}

impl AggregateRequest {
    pub fn count() -> Self {
        Self {
            op: AggregateOp::Count,
            field: None,
            filter: None,
            cond: None,
        }
    }
}

/// Key of the ungrouped count in an aggregate result.
pub const TOTAL_KEY: &str = "_total";

/// Abstract vector-store backend.
///
/// Implementations must be `Send + Sync`; every method may be called
/// concurrently.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Backend name for logs and `vk status`.
    fn backend_name(&self) -> &'static str;

    /// Create a collection. Creating an existing collection with the
    /// same schema is a no-op.
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()>;

    async fn has_collection(&self, name: &str) -> Result<bool>;

    /// Drop a collection and its records. Returns false if absent.
    async fn drop_collection(&self, name: &str) -> Result<bool>;

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()>;

    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<FetchResult>;

    /// Delete records by id. Returns the number removed.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize>;

    async fn delete_all(&self, collection: &str) -> Result<usize>;

    /// Dense-only similarity search.
    async fn search_dense(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Sparse-only (dot product) search.
    async fn search_sparse(
        &self,
        collection: &str,
        sparse: &SparseVector,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    async fn search_by_keywords(
        &self,
        collection: &str,
        keywords: &[String],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    /// Records matching `filter`, sorted by `field`. Records missing
    /// the field sort last.
    async fn search_by_scalar(
        &self,
        collection: &str,
        field: &str,
        order: SortOrder,
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>>;

    async fn aggregate(
        &self,
        collection: &str,
        request: &AggregateRequest,
    ) -> Result<BTreeMap<String, u64>>;

    /// Dense, sparse, or hybrid search depending on which vectors the
    /// query carries.
    ///
    /// With both vectors, each mode prefetches
    /// [`FusionParams::prefetch_limit`] candidates and the lists are
    /// fused with RRF. If the fusion path fails, the query falls back
    /// to dense-only search.
    async fn search_by_vector(
        &self,
        collection: &str,
        query: &VectorQuery,
    ) -> Result<Vec<ScoredRecord>> {
        let filter = query.filter.as_ref();
        match (&query.dense, &query.sparse) {
            (Some(dense), Some(sparse)) => {
                match self.hybrid_search(collection, dense, sparse, query).await {
                    Ok(hits) => Ok(hits),
                    Err(e) => {
                        tracing::warn!(
                            "[VectorStore] hybrid search failed, falling back to dense: {:#}",
                            e
                        );
                        self.search_dense(collection, dense, filter, query.limit).await
                    }
                }
            }
            (Some(dense), None) => self.search_dense(collection, dense, filter, query.limit).await,
            (None, Some(sparse)) => {
                self.search_sparse(collection, sparse, filter, query.limit).await
            }
            (None, None) => anyhow::bail!("vector query needs a dense or sparse vector"),
        }
    }

    #[doc(hidden)]
    async fn hybrid_search(
        &self,
        collection: &str,
        dense: &[f32],
        sparse: &SparseVector,
        query: &VectorQuery,
    ) -> Result<Vec<ScoredRecord>> {
        let filter = query.filter.as_ref();
        let prefetch = query.fusion.prefetch_limit(query.limit);
        let (dense_hits, sparse_hits) = futures::try_join!(
            self.search_dense(collection, dense, filter, prefetch),
            self.search_sparse(collection, sparse, filter, prefetch),
        )?;

        let lists = vec![
            dense_hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>(),
            sparse_hits.iter().map(|h| h.id.clone()).collect::<Vec<_>>(),
        ];
        let mut by_id: HashMap<String, ScoredRecord> = HashMap::new();
        for hit in dense_hits.into_iter().chain(sparse_hits) {
            by_id.entry(hit.id.clone()).or_insert(hit);
        }

        let fused = reciprocal_rank_fusion(&lists, query.fusion.k);
        Ok(fused
            .into_iter()
            .take(query.limit)
            .filter_map(|(id, score)| {
                by_id.remove(&id).map(|mut hit| {
                    hit.score = score;
                    hit
                })
            })
            .collect())
    }
}

/// Fraction of `keywords` found (case-insensitive) in any text field.
/// Zero means no match.
pub fn keyword_score(fields: &Map<String, Value>, keywords: &[String]) -> f64 {
    if keywords.is_empty() {
        return 0.0;
    }
    let haystack: String = TEXT_FIELDS
        .iter()
        .filter_map(|f| fields.get(*f).and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
        .to_lowercase();
    let hits = keywords
        .iter()
        .filter(|k| !k.is_empty() && haystack.contains(&k.to_lowercase()))
        .count();
    hits as f64 / keywords.len() as f64
}

/// Order two payloads by a scalar field; missing values sort last.
pub fn scalar_order(
    a: &Map<String, Value>,
    b: &Map<String, Value>,
    field: &str,
    order: SortOrder,
) -> Ordering {
    match (a.get(field), b.get(field)) {
        (Some(x), Some(y)) => {
            let o = compare(x, y).unwrap_or(Ordering::Equal);
            match order {
                SortOrder::Asc => o,
                SortOrder::Desc => o.reverse(),
            }
        }
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// Count payloads for an aggregate request. Payloads are assumed to be
/// pre-filtered.
pub fn aggregate_counts<'a, I>(payloads: I, request: &AggregateRequest) -> BTreeMap<String, u64>
where
    I: IntoIterator<Item = &'a Map<String, Value>>,
{
    let mut out = BTreeMap::new();
    match &request.field {
        None => {
            out.insert(TOTAL_KEY.to_string(), payloads.into_iter().count() as u64);
        }
        Some(field) => {
            for p in payloads {
                let key = match p.get(field) {
                    Some(Value::String(s)) => s.clone(),
                    Some(Value::Null) | None => "_null_".to_string(),
                    Some(other) => other.to_string(),
                };
                *out.entry(key).or_insert(0) += 1;
            }
            if let Some(cond) = &request.cond {
                out.retain(|_, n| cond.accepts(*n));
            }
        }
    }
    out
}
