//! SQLite-backed [`VectorStore`].
//!
//! Records live in one `vectors` table keyed by `(collection, native_id)`,
//! where `native_id` is the UUIDv5 [`native_key`] of the caller's id and
//! the caller's id is kept in `original_id`. Dense vectors are stored as
//! little-endian f32 BLOBs, sparse vectors and scalar fields as JSON.
//!
//! Filters are pushed down to `json_extract` SQL where the translation
//! is exact or a superset (`must`, `must_not`, `prefix`, `contains`,
//! numeric ranges, and boolean compositions of those). Every candidate
//! row is then re-checked with [`Filter::matches`], which is also how
//! `regex` and `time_range` are evaluated. Similarity is computed
//! in-process over the candidates.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use viking_store_core::embedding::{blob_to_vec, cosine_similarity, sparse_dot, vec_to_blob};
use viking_store_core::filter::Filter;
use viking_store_core::models::SparseVector;
use viking_store_core::schema::CollectionSchema;
use viking_store_core::store::{
    aggregate_counts, keyword_score, native_key, scalar_order, AggregateRequest, FetchResult,
    ScoredRecord, SortOrder, VectorRecord, VectorStore, TEXT_FIELDS,
};

use crate::{db, migrate};

/// Ids per `IN (...)` list.
const ID_CHUNK: usize = 500;

/// SQLite implementation of the [`VectorStore`] trait.
pub struct SqliteVectorStore {
    pool: SqlitePool,
}

#[derive(Debug, Clone, PartialEq)]
enum SqlArg {
    Text(String),
    Int(i64),
    Real(f64),
}

/// A `WHERE` fragment with its positional arguments.
#[derive(Debug, Clone, PartialEq)]
struct SqlFilter {
    sql: String,
    args: Vec<SqlArg>,
}

impl SqlFilter {
    fn constant(matches: bool) -> Self {
        Self {
            sql: if matches { "1" } else { "0" }.to_string(),
            args: Vec::new(),
        }
    }
}

fn json_path(field: &str) -> Option<String> {
    if field.contains('"') {
        return None;
    }
    Some(format!("$.\"{}\"", field))
}

fn scalar_arg(value: &Value) -> Option<SqlArg> {
    match value {
        Value::String(s) => Some(SqlArg::Text(s.clone())),
        Value::Bool(b) => Some(SqlArg::Int(*b as i64)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(SqlArg::Int(i)),
            None => n.as_f64().map(SqlArg::Real),
        },
        _ => None,
    }
}

fn numeric_arg(value: &Value) -> Option<SqlArg> {
    match value {
        Value::Number(_) => scalar_arg(value),
        _ => None,
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

/// Translate a filter into SQL that selects every row the filter
/// matches (possibly more). `None` means no pushdown is possible.
fn compile(filter: &Filter) -> Option<SqlFilter> {
    match filter {
        Filter::Must { field, conds } => {
            if conds.is_empty() {
                return Some(SqlFilter::constant(false));
            }
            let path = json_path(field)?;
            let values = conds.iter().map(scalar_arg).collect::<Option<Vec<_>>>()?;
            let mut args = vec![SqlArg::Text(path.clone()), SqlArg::Text(path)];
            let sql = format!(
                "(json_type(fields_json, ?) = 'array' OR json_extract(fields_json, ?) IN ({}))",
                placeholders(values.len())
            );
            args.extend(values);
            Some(SqlFilter { sql, args })
        }
        Filter::MustNot { field, conds } => {
            if conds.is_empty() {
                return Some(SqlFilter::constant(true));
            }
            let path = json_path(field)?;
            let values = conds.iter().map(scalar_arg).collect::<Option<Vec<_>>>()?;
            let mut args = vec![SqlArg::Text(path.clone()), SqlArg::Text(path)];
            let sql = format!(
                "(coalesce(json_type(fields_json, ?), 'null') IN ('null', 'true', 'false', 'array', 'object') \
                 OR json_extract(fields_json, ?) NOT IN ({}))",
                placeholders(values.len())
            );
            args.extend(values);
            Some(SqlFilter { sql, args })
        }
        Filter::Range {
            field,
            gt,
            gte,
            lt,
            lte,
        } => {
            let path = json_path(field)?;
            let mut parts = vec!["json_type(fields_json, ?) IS NOT NULL".to_string()];
            let mut args = vec![SqlArg::Text(path.clone())];
            for (bound, op) in [(gt, ">"), (gte, ">="), (lt, "<"), (lte, "<=")] {
                if let Some(b) = bound {
                    args.push(SqlArg::Text(path.clone()));
                    args.push(numeric_arg(b)?);
                    parts.push(format!("json_extract(fields_json, ?) {} ?", op));
                }
            }
            Some(SqlFilter {
                sql: format!("({})", parts.join(" AND ")),
                args,
            })
        }
        Filter::RangeOut { field, gte, lte } => {
            let path = json_path(field)?;
            let mut parts = Vec::new();
            let mut args = Vec::new();
            for (bound, op) in [(gte, "<"), (lte, ">")] {
                if let Some(b) = bound {
                    args.push(SqlArg::Text(path.clone()));
                    args.push(numeric_arg(b)?);
                    parts.push(format!("json_extract(fields_json, ?) {} ?", op));
                }
            }
            if parts.is_empty() {
                return Some(SqlFilter::constant(false));
            }
            Some(SqlFilter {
                sql: format!("({})", parts.join(" OR ")),
                args,
            })
        }
        Filter::Prefix { field, prefix } => {
            let path = json_path(field)?;
            Some(SqlFilter {
                sql: "substr(json_extract(fields_json, ?), 1, length(?)) = ?".to_string(),
                args: vec![
                    SqlArg::Text(path),
                    SqlArg::Text(prefix.clone()),
                    SqlArg::Text(prefix.clone()),
                ],
            })
        }
        Filter::Contains { field, substring } => {
            let path = json_path(field)?;
            Some(SqlFilter {
                sql: "instr(json_extract(fields_json, ?), ?) > 0".to_string(),
                args: vec![SqlArg::Text(path), SqlArg::Text(substring.clone())],
            })
        }
        Filter::Regex { .. } | Filter::TimeRange { .. } => None,
        Filter::And { conds } => {
            // Dropping a conjunct only widens the candidate set.
            let parts: Vec<SqlFilter> = conds.iter().filter_map(compile).collect();
            if parts.is_empty() {
                return None;
            }
            Some(join_filters(parts, " AND "))
        }
        Filter::Or { conds } => {
            if conds.is_empty() {
                return Some(SqlFilter::constant(false));
            }
            let parts = conds.iter().map(compile).collect::<Option<Vec<_>>>()?;
            Some(join_filters(parts, " OR "))
        }
    }
}

fn join_filters(parts: Vec<SqlFilter>, sep: &str) -> SqlFilter {
    let sql = format!(
        "({})",
        parts.iter().map(|p| p.sql.as_str()).collect::<Vec<_>>().join(sep)
    );
    let args = parts.into_iter().flat_map(|p| p.args).collect();
    SqlFilter { sql, args }
}

/// Case-insensitive `LIKE` over the text fields. `None` when a keyword
/// is not plain ASCII, since SQLite only folds ASCII case.
fn keyword_candidates(keywords: &[String]) -> Option<SqlFilter> {
    let keywords: Vec<&String> = keywords.iter().filter(|k| !k.is_empty()).collect();
    if keywords.is_empty() || keywords.iter().any(|k| !k.is_ascii()) {
        return None;
    }
    let mut parts = Vec::new();
    for field in TEXT_FIELDS {
        for keyword in &keywords {
            parts.push(SqlFilter {
                sql: format!(
                    "json_extract(fields_json, '$.{}') LIKE ? ESCAPE '\\'",
                    field
                ),
                args: vec![SqlArg::Text(format!("%{}%", escape_like(keyword)))],
            });
        }
    }
    Some(join_filters(parts, " OR "))
}

fn decode(row: &SqliteRow) -> Result<VectorRecord> {
    let id: String = row.try_get("original_id")?;
    let vector: Option<Vec<u8>> = row.try_get("vector")?;
    let sparse_json: Option<String> = row.try_get("sparse_json")?;
    let fields_json: String = row.try_get("fields_json")?;

    let sparse_vector = match sparse_json {
        Some(s) => Some(serde_json::from_str::<SparseVector>(&s)?),
        None => None,
    };
    let fields: Map<String, Value> = serde_json::from_str(&fields_json)?;
    Ok(VectorRecord {
        id,
        vector: vector.map(|b| blob_to_vec(&b)),
        sparse_vector,
        fields,
    })
}

fn scored(record: VectorRecord, score: f64) -> ScoredRecord {
    ScoredRecord {
        id: record.id,
        score,
        fields: record.fields,
    }
}

fn top_k(mut hits: Vec<ScoredRecord>, limit: usize) -> Vec<ScoredRecord> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(limit);
    hits
}

impl SqliteVectorStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to the database at `path` and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn schema(&self, collection: &str) -> Result<CollectionSchema> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT schema_json FROM collections WHERE name = ?")
                .bind(collection)
                .fetch_optional(&self.pool)
                .await?;
        let json = json.ok_or_else(|| anyhow!("collection '{}' not found", collection))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Rows of `collection` matching `filter` and `extra`, in insertion
    /// order.
    async fn scan(
        &self,
        collection: &str,
        filter: Option<&Filter>,
        extra: Option<SqlFilter>,
    ) -> Result<Vec<VectorRecord>> {
        self.schema(collection).await?;

        let mut sql = String::from(
            "SELECT original_id, vector, sparse_json, fields_json FROM vectors WHERE collection = ?",
        );
        let mut args = vec![SqlArg::Text(collection.to_string())];
        for part in [filter.and_then(compile), extra].into_iter().flatten() {
            sql.push_str(" AND ");
            sql.push_str(&part.sql);
            args.extend(part.args);
        }
        sql.push_str(" ORDER BY seq");

        let mut query = sqlx::query(&sql);
        for arg in args {
            query = match arg {
                SqlArg::Text(s) => query.bind(s),
                SqlArg::Int(i) => query.bind(i),
                SqlArg::Real(f) => query.bind(f),
            };
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let record = decode(row)?;
            if filter.map_or(true, |f| f.matches(&record.fields)) {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn rows_by_id(&self, collection: &str, ids: &[String]) -> Result<HashMap<String, VectorRecord>> {
        let mut out = HashMap::new();
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "SELECT original_id, vector, sparse_json, fields_json FROM vectors \
                 WHERE collection = ? AND native_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for id in chunk {
                query = query.bind(native_key(id).to_string());
            }
            for row in query.fetch_all(&self.pool).await? {
                let record = decode(&row)?;
                out.insert(record.id.clone(), record);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn backend_name(&self) -> &'static str {
        "sqlite"
    }

    async fn create_collection(&self, schema: &CollectionSchema) -> Result<()> {
        schema.validate()?;
        if let Ok(existing) = self.schema(&schema.name).await {
            if existing != *schema {
                bail!("collection '{}' already exists with a different schema", schema.name);
            }
            return Ok(());
        }
        sqlx::query("INSERT INTO collections (name, schema_json, created_at) VALUES (?, ?, ?)")
            .bind(&schema.name)
            .bind(serde_json::to_string(schema)?)
            .bind(chrono::Utc::now().timestamp())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn has_collection(&self, name: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM collections WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    async fn drop_collection(&self, name: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM collections WHERE name = ?")
            .bind(name)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> Result<()> {
        let dim = self.schema(collection).await?.vector_dim();
        for record in &records {
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
        }

        let mut tx = self.pool.begin().await?;
        let mut seq: i64 =
            sqlx::query_scalar("SELECT COALESCE(MAX(seq), 0) FROM vectors WHERE collection = ?")
                .bind(collection)
                .fetch_one(&mut *tx)
                .await?;
        for record in records {
            seq += 1;
            let sparse_json = match &record.sparse_vector {
                Some(s) => Some(serde_json::to_string(s)?),
                None => None,
            };
            sqlx::query(
                r#"
                INSERT INTO vectors (collection, native_id, original_id, vector, sparse_json, fields_json, seq)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(collection, native_id) DO UPDATE SET
                    original_id = excluded.original_id,
                    vector = excluded.vector,
                    sparse_json = excluded.sparse_json,
                    fields_json = excluded.fields_json
                "#,
            )
            .bind(collection)
            .bind(native_key(&record.id).to_string())
            .bind(&record.id)
            .bind(record.vector.as_deref().map(vec_to_blob))
            .bind(sparse_json)
            .bind(serde_json::to_string(&record.fields)?)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn fetch(&self, collection: &str, ids: &[String]) -> Result<FetchResult> {
        self.schema(collection).await?;
        let mut rows = self.rows_by_id(collection, ids).await?;
        let mut result = FetchResult::default();
        for id in ids {
            match rows.remove(id) {
                Some(r) => result.found.push(r),
                None => result.missing.push(id.clone()),
            }
        }
        Ok(result)
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<usize> {
        self.schema(collection).await?;
        let mut removed = 0u64;
        for chunk in ids.chunks(ID_CHUNK) {
            let sql = format!(
                "DELETE FROM vectors WHERE collection = ? AND native_id IN ({})",
                placeholders(chunk.len())
            );
            let mut query = sqlx::query(&sql).bind(collection);
            for id in chunk {
                query = query.bind(native_key(id).to_string());
            }
            removed += query.execute(&self.pool).await?.rows_affected();
        }
        Ok(removed as usize)
    }

    async fn delete_all(&self, collection: &str) -> Result<usize> {
        self.schema(collection).await?;
        let removed = sqlx::query("DELETE FROM vectors WHERE collection = ?")
            .bind(collection)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed as usize)
    }

    async fn search_dense(
        &self,
        collection: &str,
        vector: &[f32],
        filter: Option<&Filter>,
        limit: usize,
    ) -> Result<Vec<ScoredRecord>> {
        let rows = self
            .scan(collection, filter, Some(SqlFilter {
                sql: "vector IS NOT NULL".into(),
                args: Vec::new(),
            }))
            .await?;
        let hits = rows
            .into_iter()
            .filter_map(|mut r| {
                let v = r.vector.take()?;
                let score = cosine_similarity(vector, &v) as f64;
                Some(scored(r, score))
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
        let rows = self
            .scan(collection, filter, Some(SqlFilter {
                sql: "sparse_json IS NOT NULL".into(),
                args: Vec::new(),
            }))
            .await?;
        let hits = rows
            .into_iter()
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
        let rows = self
            .scan(collection, filter, keyword_candidates(keywords))
            .await?;
        let hits = rows
            .into_iter()
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
        let mut rows = self.scan(collection, filter, None).await?;
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
        let rows = self.scan(collection, request.filter.as_ref(), None).await?;
        Ok(aggregate_counts(rows.iter().map(|r| &r.fields), request))
    }
}
