//! Keeps vector rows in step with `rm` and `mv`.
//!
//! Rows are found two ways: by the id derived from each URI seen in
//! the object store, and by a paged `uri` prefix scan of the collection,
//! so rows whose files were already gone are still caught. Failures here
//! are logged and never fail the filesystem operation.

use std::collections::BTreeSet;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use viking_store_core::filter::Filter;
use viking_store_core::store::{SortOrder, VectorRecord};
use viking_store_core::uri::VikingUri;

use super::VikingFs;
use crate::lock::LOCK_FILE_NAME;

const SCAN_PAGE: usize = 1000;

/// Vector row id of a node: hex SHA-256 of its URI.
pub fn vector_id(uri: &str) -> String {
    hex::encode(Sha256::digest(uri.as_bytes()))
}

impl VikingFs {
    /// `uri` plus, for a directory, every descendant.
    pub(super) async fn collect_uris(&self, uri: &VikingUri, path: &str, is_dir: bool) -> Vec<VikingUri> {
        let mut out = vec![uri.clone()];
        if !is_dir {
            return out;
        }
        let entries = match self.fs.walk(path).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[VikingFs] failed to collect URIs under {}: {}", uri, e);
                return out;
            }
        };
        for entry in entries.into_iter().filter(|e| e.name != LOCK_FILE_NAME) {
            match self.uri_of(&entry.path).await {
                Ok(u) => out.push(u),
                Err(e) => debug!("[VikingFs] skipping {}: {}", entry.path, e),
            }
        }
        out
    }

    /// Ids of every row for `root` and its descendants.
    async fn row_ids(&self, root: &VikingUri, uris: &[VikingUri]) -> BTreeSet<String> {
        let mut ids: BTreeSet<String> = uris.iter().map(|u| vector_id(&u.to_string())).collect();
        if let Err(e) = self.scan_descendant_ids(root, SCAN_PAGE, &mut ids).await {
            warn!("[VikingFs] vector scan under {} failed: {:#}", root, e);
        }
        ids
    }

    /// Page through rows whose `uri` lies under `root`, in `uri` order,
    /// until the prefix is exhausted.
    async fn scan_descendant_ids(
        &self,
        root: &VikingUri,
        page: usize,
        ids: &mut BTreeSet<String>,
    ) -> anyhow::Result<()> {
        let prefix = Filter::prefix("uri", format!("{}/", root));
        let mut after: Option<String> = None;
        // Set when a page starting at `after` brought nothing new, so the
        // next page starts strictly past it.
        let mut strict = false;
        let mut seen = BTreeSet::new();
        loop {
            let mut parts = vec![prefix.clone()];
            if let Some(last) = &after {
                let bound = Some(Value::String(last.clone()));
                let (gt, gte) = if strict { (bound, None) } else { (None, bound) };
                parts.push(Filter::Range {
                    field: "uri".into(),
                    gt,
                    gte,
                    lt: None,
                    lte: None,
                });
            }
            let filter = Filter::all(parts);
            let rows = self
                .vectors
                .search_by_scalar(&self.collection, "uri", SortOrder::Asc, filter.as_ref(), page)
                .await?;
            let before = seen.len();
            seen.extend(rows.iter().map(|r| r.id.clone()));
            let last = rows.last().and_then(|r| r.field_str("uri")).map(str::to_string);
            if rows.len() < page || last.is_none() {
                break;
            }
            if seen.len() > before {
                after = last;
                strict = false;
            } else if strict {
                break;
            } else {
                strict = true;
            }
        }
        debug!("[VikingFs] scanned {} vector rows under {}", seen.len(), root);
        ids.extend(seen);
        Ok(())
    }

    pub(super) async fn delete_vectors(&self, root: &VikingUri, uris: &[VikingUri]) {
        let ids: Vec<String> = self.row_ids(root, uris).await.into_iter().collect();
        match self.vectors.delete(&self.collection, &ids).await {
            Ok(n) => info!("[VikingFs] deleted {} vector rows under {}", n, root),
            Err(e) => warn!("[VikingFs] failed to delete vectors under {}: {:#}", root, e),
        }
    }

    /// Move rows from under `src` to under `dst`, keeping their vectors.
    pub(super) async fn rekey_vectors(&self, src: &VikingUri, dst: &VikingUri, uris: &[VikingUri]) {
        let ids: Vec<String> = self.row_ids(src, uris).await.into_iter().collect();
        let fetched = match self.vectors.fetch(&self.collection, &ids).await {
            Ok(f) => f,
            Err(e) => {
                warn!("[VikingFs] failed to fetch vectors under {}: {:#}", src, e);
                return;
            }
        };

        let now = Value::String(Utc::now().to_rfc3339());
        let mut moved: Vec<VectorRecord> = Vec::new();
        let mut old_ids: Vec<String> = Vec::new();
        for mut record in fetched.found {
            let Some(new_uri) = record
                .field_str("uri")
                .and_then(|u| VikingUri::parse(u).ok())
                .and_then(|u| u.rebase(src, dst))
            else {
                continue;
            };
            let new_parent = if new_uri == *dst {
                dst.parent()
            } else {
                new_uri.parent()
            };

            old_ids.push(record.id.clone());
            record.id = vector_id(&new_uri.to_string());
            record
                .fields
                .insert("uri".into(), Value::String(new_uri.to_string()));
            if let Some(parent) = new_parent {
                record
                    .fields
                    .insert("parent_uri".into(), Value::String(parent.to_string()));
            }
            record
                .fields
                .insert("name".into(), Value::String(new_uri.name().to_string()));
            record.fields.insert("updated_at".into(), now.clone());
            moved.push(record);
        }
        if moved.is_empty() {
            return;
        }

        let count = moved.len();
        let new_ids: BTreeSet<String> = moved.iter().map(|r| r.id.clone()).collect();
        if let Err(e) = self.vectors.upsert(&self.collection, moved).await {
            warn!("[VikingFs] failed to re-key vectors {} -> {}: {:#}", src, dst, e);
            return;
        }
        old_ids.retain(|id| !new_ids.contains(id));
        if let Err(e) = self.vectors.delete(&self.collection, &old_ids).await {
            warn!("[VikingFs] failed to drop old vector rows under {}: {:#}", src, e);
        }
        info!("[VikingFs] re-keyed {} vector rows {} -> {}", count, src, dst);
    }
}
