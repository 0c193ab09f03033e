//! The `viking://` virtual filesystem.
//!
//! [`VikingFs`] maps URIs onto the object store and keeps the vector
//! index consistent with structural changes. Byte-level operations
//! delegate to the [`ObjectStore`]; the store-specific ones (abstract,
//! overview, relations, find, search) live in the submodules.
//!
//! | Operation | Locks | Vector index |
//! |-----------|-------|--------------|
//! | `write`, `mkdir`, `append` | parent directory | untouched |
//! | `write_context`, `link`, `unlink` | node directory | untouched |
//! | `rm` (directory) | whole subtree | rows under the URI deleted |
//! | `rm` (file) | parent directory | row deleted |
//! | `mv` | source subtree (or parent) + destination parent | rows re-keyed, vectors copied |
//!
//! Every mutation runs inside [`TransactionManager::run`]. Reads are
//! never gated by locks.
//!
//! Segments longer than the filename limit are shortened on the way
//! in; the original name is recorded in the parent directory's
//! `.names.json` so the reverse mapping reads it back instead of
//! decoding the hash.

mod listing;
mod relations;
mod search;
mod vector_sync;

pub use listing::{FsEntry, GrepMatch, LsOptions, TreeOptions};
pub use relations::{RelatedContent, RelationRef};
pub use search::SessionInfo;
pub use vector_sync::vector_id;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};
use viking_store_core::embedding::Embedder;
use viking_store_core::llm::{Reranker, Summarizer};
use viking_store_core::models::{ContextType, Level};
use viking_store_core::retrieve::RetrieverConfig;
use viking_store_core::store::VectorStore;
use viking_store_core::uri::{
    is_shortened_form, path_to_uri_with, uri_to_path, PathMapping, VikingUri, LOCAL_ROOT,
};

use crate::error::{Result, VikingError};
use crate::lock::LOCK_FILE_NAME;
use crate::objstore::{join_path, ObjectStore};
use crate::queue::{QueueManager, SemanticMsg, SEMANTIC};
use crate::transaction::{init_info, TransactionManager};

pub const ABSTRACT_FILE: &str = ".abstract.md";
pub const OVERVIEW_FILE: &str = ".overview.md";
pub const RELATIONS_FILE: &str = ".relations.json";
pub const NAMES_FILE: &str = ".names.json";
pub const DEFAULT_CONTENT_FILE: &str = "content.md";

/// Parse a user-supplied URI.
pub fn parse_uri(raw: &str) -> Result<VikingUri> {
    VikingUri::parse(raw).map_err(|e| VikingError::InvalidUri(format!("{:#}", e)))
}

/// All three tiers of a hand-authored node, for
/// [`VikingFs::write_context`]. Empty parts are not written.
#[derive(Debug, Clone)]
pub struct WriteContext<'a> {
    pub content: &'a str,
    pub abstract_text: &'a str,
    pub overview: &'a str,
    pub content_filename: &'a str,
}

impl Default for WriteContext<'_> {
    fn default() -> Self {
        Self {
            content: "",
            abstract_text: "",
            overview: "",
            content_filename: DEFAULT_CONTENT_FILE,
        }
    }
}

#[derive(Clone)]
pub struct VikingFs {
    fs: Arc<dyn ObjectStore>,
    txn: Arc<TransactionManager>,
    vectors: Arc<dyn VectorStore>,
    collection: String,
    embedder: Option<Arc<dyn Embedder>>,
    summarizer: Option<Arc<dyn Summarizer>>,
    reranker: Option<Arc<dyn Reranker>>,
    queues: Option<Arc<QueueManager>>,
    retriever_config: RetrieverConfig,
}

impl VikingFs {
    pub fn new(
        fs: Arc<dyn ObjectStore>,
        txn: Arc<TransactionManager>,
        vectors: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        let collection = collection.into();
        info!(
            "[VikingFs] initialized, vector backend={}, collection={}",
            vectors.backend_name(),
            collection
        );
        Self {
            fs,
            txn,
            vectors,
            collection,
            embedder: None,
            summarizer: None,
            reranker: None,
            queues: None,
            retriever_config: RetrieverConfig::default(),
        }
    }

    pub fn with_embedder(mut self, embedder: Option<Arc<dyn Embedder>>) -> Self {
        self.embedder = embedder;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Option<Arc<dyn Summarizer>>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_reranker(mut self, reranker: Option<Arc<dyn Reranker>>) -> Self {
        self.reranker = reranker;
        self
    }

    pub fn with_queues(mut self, queues: Arc<QueueManager>) -> Self {
        self.queues = Some(queues);
        self
    }

    pub fn with_retriever_config(mut self, config: RetrieverConfig) -> Self {
        self.retriever_config = config;
        self
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.fs
    }

    pub fn vector_store(&self) -> &Arc<dyn VectorStore> {
        &self.vectors
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    // ---- URI mapping ----

    /// Object-store path of `uri`.
    pub fn path_of(&self, uri: &VikingUri) -> String {
        uri_to_path(uri).path
    }

    /// Shortened-segment table of one directory. A corrupt table reads
    /// as empty and is rebuilt by the next write under it.
    async fn read_names(&self, dir_path: &str) -> Result<BTreeMap<String, String>> {
        let path = join_path(dir_path, NAMES_FILE);
        match self.fs.read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(names) => Ok(names),
                Err(e) => {
                    warn!("[VikingFs] ignoring corrupt name table {}: {}", path, e);
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.is_not_found() => Ok(BTreeMap::new()),
            Err(e) => Err(e),
        }
    }

    /// Persist the original names of every shortened segment.
    async fn record_names(&self, mapping: &PathMapping) -> Result<()> {
        for seg in &mapping.shortened {
            let mut names = self.read_names(&seg.parent_path).await?;
            if names.get(&seg.short) == Some(&seg.original) {
                continue;
            }
            names.insert(seg.short.clone(), seg.original.clone());
            let json = serde_json::to_vec_pretty(&names)?;
            self.fs
                .write(&join_path(&seg.parent_path, NAMES_FILE), &json)
                .await?;
            debug!("[VikingFs] recorded name for {}", seg.short);
        }
        Ok(())
    }

    /// Map an object-store path back to its URI, restoring shortened
    /// segments from `.names.json`.
    pub async fn uri_of(&self, path: &str) -> Result<VikingUri> {
        let rest = path.strip_prefix(LOCAL_ROOT).unwrap_or(path);
        let mut table: HashMap<(String, String), String> = HashMap::new();
        let mut parent = LOCAL_ROOT.to_string();
        for seg in rest.split('/').filter(|s| !s.is_empty()) {
            if is_shortened_form(seg) {
                if let Some(original) = self.read_names(&parent).await?.remove(seg) {
                    table.insert((parent.clone(), seg.to_string()), original);
                }
            }
            parent = join_path(&parent, seg);
        }
        path_to_uri_with(path, |p, s| table.get(&(p.to_string(), s.to_string())).cloned())
            .map_err(|e| VikingError::InvalidUri(format!("{:#}", e)))
    }

    /// Original name of a child entry given its directory's name table.
    fn display_name(names: &BTreeMap<String, String>, stored: &str) -> String {
        if is_shortened_form(stored) {
            if let Some(original) = names.get(stored) {
                return original.clone();
            }
        }
        stored.to_string()
    }

    // ---- byte-level operations ----

    pub async fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let uri = parse_uri(uri)?;
        self.fs.read(&self.path_of(&uri)).await
    }

    pub async fn read_to_string(&self, uri: &str) -> Result<String> {
        let uri = parse_uri(uri)?;
        self.fs.read_to_string(&self.path_of(&uri)).await
    }

    pub async fn stat(&self, uri: &str) -> Result<FsEntry> {
        let uri = parse_uri(uri)?;
        let entry = self.fs.stat(&self.path_of(&uri)).await?;
        Ok(FsEntry::from_object(&entry, uri.name().to_string(), &uri, uri.name().to_string()))
    }

    /// Create the directories above `uri` so its parent can be locked.
    async fn ensure_parent(&self, uri: &VikingUri) -> Result<(VikingUri, String)> {
        let parent = uri
            .parent()
            .ok_or_else(|| VikingError::InvalidArgument("the root has no parent".into()))?;
        let parent_path = self.path_of(&parent);
        self.fs.mkdir(&parent_path).await?;
        Ok((parent, parent_path))
    }

    /// Write a file, replacing any previous content. Missing parent
    /// directories are created. Does not trigger indexing; call
    /// [`reindex`](Self::reindex) after a batch of writes.
    pub async fn write(&self, uri: &str, data: &[u8]) -> Result<()> {
        let uri = parse_uri(uri)?;
        if uri.is_root() {
            return Err(VikingError::InvalidArgument("cannot write to the root".into()));
        }
        let (_, parent_path) = self.ensure_parent(&uri).await?;
        let mapping = uri_to_path(&uri);
        let label = uri.to_string();

        self.txn
            .run(init_info([("op", "write"), ("uri", label.as_str())]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &parent_path).await?;
                self.record_names(&mapping).await?;
                self.fs.write(&mapping.path, data).await
            })
            .await
    }

    /// Append text to a file, creating it if missing.
    pub async fn append(&self, uri: &str, text: &str) -> Result<()> {
        let parsed = parse_uri(uri)?;
        if parsed.is_root() {
            return Err(VikingError::InvalidArgument("cannot write to the root".into()));
        }
        let (_, parent_path) = self.ensure_parent(&parsed).await?;
        let mapping = uri_to_path(&parsed);

        self.txn
            .run(init_info([("op", "append"), ("uri", uri)]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &parent_path).await?;
                self.record_names(&mapping).await?;
                let mut existing = match self.fs.read(&mapping.path).await {
                    Ok(bytes) => bytes,
                    Err(e) if e.is_not_found() => Vec::new(),
                    Err(e) => return Err(e),
                };
                existing.extend_from_slice(text.as_bytes());
                self.fs.write(&mapping.path, &existing).await
            })
            .await
    }

    /// Create a directory and any missing ancestors. Existing
    /// directories are not an error.
    pub async fn mkdir(&self, uri: &str) -> Result<()> {
        let parsed = parse_uri(uri)?;
        if parsed.is_root() {
            return self.fs.mkdir(LOCAL_ROOT).await;
        }
        let (_, parent_path) = self.ensure_parent(&parsed).await?;
        let mapping = uri_to_path(&parsed);

        self.txn
            .run(init_info([("op", "mkdir"), ("uri", uri)]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &parent_path).await?;
                self.record_names(&mapping).await?;
                self.fs.mkdir(&mapping.path).await
            })
            .await
    }

    /// Delete a file or directory and purge its vector rows.
    ///
    /// A directory is locked as a whole subtree. Without `recursive`,
    /// only an empty directory can be removed. Vector rows are purged
    /// even if the object-store delete fails; the delete error is still
    /// returned.
    pub async fn rm(&self, uri: &str, recursive: bool) -> Result<()> {
        let parsed = parse_uri(uri)?;
        if parsed.is_root() {
            return Err(VikingError::InvalidArgument("refusing to remove the root".into()));
        }
        let path = self.path_of(&parsed);
        let entry = self.fs.stat(&path).await?;
        let uris = self.collect_uris(&parsed, &path, entry.is_dir).await;

        self.txn
            .run(init_info([("op", "rm"), ("uri", uri)]), |txn_id| async move {
                if entry.is_dir {
                    self.txn.acquire_lock_rm(&txn_id, &path).await?;
                    if !recursive {
                        let children = self.fs.ls(&path).await?;
                        if children.iter().any(|c| c.name != LOCK_FILE_NAME) {
                            return Err(VikingError::InvalidArgument(format!(
                                "directory not empty: {}",
                                parsed
                            )));
                        }
                    }
                } else {
                    let parent_path = self.path_of(&parsed.parent().unwrap_or_else(VikingUri::root));
                    self.txn.acquire_lock_normal(&txn_id, &parent_path).await?;
                }

                // Markers inside the subtree go with it.
                let removed = self.fs.rm(&path, true).await;
                if let Err(ref e) = removed {
                    warn!("[VikingFs] rm {} failed: {}", parsed, e);
                }
                self.delete_vectors(&parsed, &uris).await;
                removed
            })
            .await
    }

    /// Move a file or directory. Vector rows follow with their stored
    /// vectors; nothing is re-embedded.
    pub async fn mv(&self, from: &str, to: &str) -> Result<()> {
        let src = parse_uri(from)?;
        let dst = parse_uri(to)?;
        if src.is_root() || dst.is_root() {
            return Err(VikingError::InvalidArgument("cannot move the root".into()));
        }
        if dst.starts_with(&src) {
            return Err(VikingError::InvalidArgument(format!(
                "cannot move {} into itself",
                src
            )));
        }
        let src_path = self.path_of(&src);
        let dst_mapping = uri_to_path(&dst);
        let entry = self.fs.stat(&src_path).await?;
        if self.fs.exists(&dst_mapping.path).await? {
            return Err(VikingError::InvalidArgument(format!(
                "destination already exists: {}",
                dst
            )));
        }
        let (_, dst_parent_path) = self.ensure_parent(&dst).await?;
        let uris = self.collect_uris(&src, &src_path, entry.is_dir).await;

        self.txn
            .run(init_info([("op", "mv"), ("from", from), ("to", to)]), |txn_id| async move {
                if entry.is_dir {
                    self.txn
                        .acquire_lock_mv(&txn_id, &src_path, &dst_parent_path)
                        .await?;
                } else {
                    let src_parent = self.path_of(&src.parent().unwrap_or_else(VikingUri::root));
                    self.txn.acquire_lock_normal(&txn_id, &src_parent).await?;
                    self.txn.acquire_lock_normal(&txn_id, &dst_parent_path).await?;
                }
                self.record_names(&dst_mapping).await?;

                let moved = self.fs.mv(&src_path, &dst_mapping.path).await;
                if entry.is_dir && moved.is_ok() {
                    self.release_carried_markers(&txn_id, &src_path, &dst_mapping.path)
                        .await;
                }

                let src_gone = !matches!(self.fs.exists(&src_path).await, Ok(true));
                if moved.is_ok() || src_gone {
                    self.rekey_vectors(&src, &dst, &uris).await;
                } else if let Err(ref e) = moved {
                    warn!("[VikingFs] mv {} -> {} failed: {}", src, dst, e);
                }
                moved
            })
            .await
    }

    /// A moved directory carries its lock markers along; drop the ones
    /// this transaction owns at their new location.
    async fn release_carried_markers(&self, txn_id: &str, src_path: &str, dst_path: &str) {
        let Ok(Some(record)) = self.txn.get_transaction(txn_id).await else {
            return;
        };
        let carried: Vec<String> = record
            .locks
            .iter()
            .filter_map(|p| {
                if p == src_path {
                    Some(dst_path.to_string())
                } else {
                    p.strip_prefix(src_path)
                        .filter(|rest| rest.starts_with('/'))
                        .map(|rest| format!("{}{}", dst_path, rest))
                }
            })
            .collect();
        self.txn.path_lock().release_reversed(&carried, txn_id).await;
    }

    // ---- L0 / L1 ----

    async fn read_tier(&self, uri: &str, file: &str) -> Result<String> {
        let parsed = parse_uri(uri)?;
        let path = self.path_of(&parsed);
        let entry = self.fs.stat(&path).await?;
        if !entry.is_dir {
            return Err(VikingError::InvalidArgument(format!(
                "{} is not a directory",
                parsed
            )));
        }
        self.fs.read_to_string(&join_path(&path, file)).await
    }

    /// A directory's L0 summary.
    pub async fn abstract_text(&self, uri: &str) -> Result<String> {
        self.read_tier(uri, ABSTRACT_FILE).await
    }

    /// A directory's L1 overview.
    pub async fn overview(&self, uri: &str) -> Result<String> {
        self.read_tier(uri, OVERVIEW_FILE).await
    }

    /// L0 or L1 for many URIs. URIs that cannot be read are omitted.
    pub async fn read_batch(&self, uris: &[String], level: Level) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for uri in uris {
            let content = match level {
                Level::L0 => self.abstract_text(uri).await,
                Level::L1 => self.overview(uri).await,
                Level::L2 => self.read_to_string(uri).await,
            };
            if let Ok(content) = content {
                out.insert(uri.clone(), content);
            }
        }
        out
    }

    /// Write a node's content, abstract, and overview in one
    /// transaction.
    pub async fn write_context(&self, uri: &str, ctx: WriteContext<'_>) -> Result<()> {
        let parsed = parse_uri(uri)?;
        let mapping = uri_to_path(&parsed);
        self.fs.mkdir(&mapping.path).await?;

        self.txn
            .run(init_info([("op", "write_context"), ("uri", uri)]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &mapping.path).await?;
                self.record_names(&mapping).await?;
                for (file, text) in [
                    (ctx.content_filename, ctx.content),
                    (ABSTRACT_FILE, ctx.abstract_text),
                    (OVERVIEW_FILE, ctx.overview),
                ] {
                    if !text.is_empty() {
                        self.fs.write(&join_path(&mapping.path, file), text.as_bytes()).await?;
                    }
                }
                Ok(())
            })
            .await
    }

    /// Persist derived summaries for a directory.
    pub async fn write_summaries(&self, uri: &VikingUri, abstract_text: &str, overview: &str) -> Result<()> {
        let path = self.path_of(uri);
        let label = uri.to_string();
        self.txn
            .run(init_info([("op", "summarize"), ("uri", label.as_str())]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &path).await?;
                self.fs
                    .write(&join_path(&path, OVERVIEW_FILE), overview.as_bytes())
                    .await?;
                self.fs
                    .write(&join_path(&path, ABSTRACT_FILE), abstract_text.as_bytes())
                    .await
            })
            .await
    }

    // ---- indexing ----

    /// Queue a semantic pass over the subtree at `uri`. A file URI
    /// reindexes its directory. Returns the queued message.
    pub async fn reindex(&self, uri: &str, context_type: Option<ContextType>) -> Result<SemanticMsg> {
        let queues = self
            .queues
            .as_ref()
            .ok_or_else(|| VikingError::Backend("no queue manager configured".into()))?;
        let mut parsed = parse_uri(uri)?;
        let entry = self.fs.stat(&self.path_of(&parsed)).await?;
        if !entry.is_dir {
            parsed = parsed.parent().unwrap_or_else(VikingUri::root);
        }
        let label = parsed.to_string();
        let context_type = context_type.unwrap_or_else(|| ContextType::infer_from_uri(&label));
        let msg = SemanticMsg::new(label, context_type);
        queues.enqueue(SEMANTIC, &msg).await?;
        info!("[VikingFs] queued semantic pass for {}", msg.uri);
        Ok(msg)
    }

    // ---- temp scope ----

    /// A fresh, unused `viking://temp/...` URI.
    pub fn create_temp_uri(&self) -> String {
        let stamp = chrono::Utc::now().format("%m%d%H%M");
        let rand = uuid::Uuid::new_v4().simple().to_string();
        format!("viking://temp/{}_{}", stamp, &rand[..6])
    }

    /// Delete a temp directory. Failures are logged, not returned.
    pub async fn delete_temp(&self, uri: &str) {
        let parsed = match parse_uri(uri) {
            Ok(u) => u,
            Err(e) => {
                warn!("[VikingFs] bad temp uri {}: {}", uri, e);
                return;
            }
        };
        if parsed.scope() != Some("temp") {
            warn!("[VikingFs] {} is not a temp uri", uri);
            return;
        }
        if let Err(e) = self.fs.rm(&self.path_of(&parsed), true).await {
            warn!("[VikingFs] failed to delete temp {}: {}", uri, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::TransactionConfig;
    use crate::objstore::MemoryFs;
    use viking_store_core::schema::context_collection_schema;
    use viking_store_core::store::memory::InMemoryVectorStore;

    pub const DIMS: usize = 32;

    pub async fn vfs() -> (Arc<MemoryFs>, VikingFs) {
        let fs = Arc::new(MemoryFs::new());
        let txn = Arc::new(TransactionManager::new(fs.clone(), &TransactionConfig::default()));
        let store = Arc::new(InMemoryVectorStore::default());
        store
            .create_collection(&context_collection_schema("context", DIMS))
            .await
            .unwrap();
        let vfs = VikingFs::new(fs.clone(), txn, store, "context");
        (fs, vfs)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::vfs;
    use super::*;
    use crate::error::ErrorKind;

    fn markers(fs: &crate::objstore::MemoryFs) -> usize {
        fs.paths().iter().filter(|p| p.ends_with(LOCK_FILE_NAME)).count()
    }

    #[tokio::test]
    async fn test_write_read_and_no_markers_left() {
        let (fs, vfs) = vfs().await;
        vfs.write("viking://resources/docs/a.md", b"alpha").await.unwrap();
        assert_eq!(vfs.read("viking://resources/docs/a.md").await.unwrap(), b"alpha");
        assert!(fs.exists("/local/resources/docs/a.md").await.unwrap());
        assert_eq!(markers(&fs), 0);
        assert!(vfs.txn.list_transactions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_blocked_by_foreign_lock() {
        let (fs, vfs) = vfs().await;
        vfs.mkdir("viking://resources/docs").await.unwrap();
        fs.write("/local/resources/docs/.path.ovlock", b"someone").await.unwrap();
        let err = vfs
            .write("viking://resources/docs/a.md", b"x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockConflict);
        assert!(!fs.exists("/local/resources/docs/a.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_append() {
        let (_fs, vfs) = vfs().await;
        vfs.append("viking://user/memories/log.md", "one\n").await.unwrap();
        vfs.append("viking://user/memories/log.md", "two\n").await.unwrap();
        assert_eq!(
            vfs.read_to_string("viking://user/memories/log.md").await.unwrap(),
            "one\ntwo\n"
        );
    }

    #[tokio::test]
    async fn test_rm_non_recursive_requires_empty_dir() {
        let (fs, vfs) = vfs().await;
        vfs.write("viking://resources/d/f.md", b"x").await.unwrap();
        let err = vfs.rm("viking://resources/d", false).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(markers(&fs), 0);

        vfs.rm("viking://resources/d/f.md", false).await.unwrap();
        vfs.rm("viking://resources/d", false).await.unwrap();
        assert!(!fs.exists("/local/resources/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_rm_missing_is_not_found() {
        let (_fs, vfs) = vfs().await;
        let err = vfs.rm("viking://resources/nope", true).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_mv_leaves_no_markers() {
        let (fs, vfs) = vfs().await;
        vfs.write("viking://resources/a/x/1.md", b"1").await.unwrap();
        vfs.mv("viking://resources/a/x", "viking://resources/b/x").await.unwrap();
        assert_eq!(vfs.read("viking://resources/b/x/1.md").await.unwrap(), b"1");
        assert!(!fs.exists("/local/resources/a/x").await.unwrap());
        assert_eq!(markers(&fs), 0);
    }

    #[tokio::test]
    async fn test_mv_rejects_existing_destination_and_self_nesting() {
        let (_fs, vfs) = vfs().await;
        vfs.write("viking://resources/a/1.md", b"1").await.unwrap();
        vfs.write("viking://resources/b/1.md", b"1").await.unwrap();
        assert!(vfs.mv("viking://resources/a", "viking://resources/b").await.is_err());
        assert!(vfs
            .mv("viking://resources/a", "viking://resources/a/inner")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_long_segment_round_trips_through_name_table() {
        let (_fs, vfs) = vfs().await;
        let long = "chapter-".repeat(50);
        let uri = format!("viking://resources/book/{}", long);
        vfs.write(&uri, b"text").await.unwrap();

        let parsed = parse_uri(&uri).unwrap();
        let path = vfs.path_of(&parsed);
        assert_ne!(path, format!("/local/resources/book/{}", long));
        assert_eq!(vfs.uri_of(&path).await.unwrap(), parsed);

        let listed = vfs
            .ls("viking://resources/book", LsOptions::default())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].uri, uri);
        assert_eq!(listed[0].name, long);
    }

    #[tokio::test]
    async fn test_corrupt_name_table_is_rebuilt_on_write() {
        let (fs, vfs) = vfs().await;
        let long = "appendix-".repeat(40);
        let uri = format!("viking://resources/book/{}", long);
        vfs.write(&uri, b"v1").await.unwrap();
        fs.write(&format!("/local/resources/book/{}", NAMES_FILE), b"{broken")
            .await
            .unwrap();

        vfs.write(&uri, b"v2").await.unwrap();
        let parsed = parse_uri(&uri).unwrap();
        let path = vfs.path_of(&parsed);
        assert_eq!(vfs.uri_of(&path).await.unwrap(), parsed);
        assert_eq!(vfs.read(&uri).await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_write_context_and_tiers() {
        let (_fs, vfs) = vfs().await;
        vfs.write_context(
            "viking://user/memories/prefs",
            WriteContext {
                content: "likes tea",
                abstract_text: "Beverage preferences.",
                overview: "# prefs\n\nBeverage preferences.",
                ..WriteContext::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(
            vfs.abstract_text("viking://user/memories/prefs").await.unwrap(),
            "Beverage preferences."
        );
        assert!(vfs
            .overview("viking://user/memories/prefs")
            .await
            .unwrap()
            .starts_with("# prefs"));
        assert_eq!(
            vfs.read_to_string("viking://user/memories/prefs/content.md")
                .await
                .unwrap(),
            "likes tea"
        );
        // L0 of a file is an error.
        assert!(vfs
            .abstract_text("viking://user/memories/prefs/content.md")
            .await
            .is_err());

        let batch = vfs
            .read_batch(
                &[
                    "viking://user/memories/prefs".to_string(),
                    "viking://user/memories/missing".to_string(),
                ],
                Level::L0,
            )
            .await;
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_temp_uri_and_delete() {
        let (fs, vfs) = vfs().await;
        let temp = vfs.create_temp_uri();
        assert!(temp.starts_with("viking://temp/"));
        let suffix = temp.rsplit('/').next().unwrap();
        assert_eq!(suffix.len(), 8 + 1 + 6);

        vfs.write(&format!("{}/a/b.md", temp), b"x").await.unwrap();
        vfs.delete_temp(&temp).await;
        assert!(!fs.exists(&vfs.path_of(&parse_uri(&temp).unwrap())).await.unwrap());

        // Outside the temp scope nothing happens.
        vfs.write("viking://resources/keep.md", b"x").await.unwrap();
        vfs.delete_temp("viking://resources").await;
        assert!(fs.exists("/local/resources/keep.md").await.unwrap());
    }

    #[tokio::test]
    async fn test_reindex_without_queue_fails() {
        let (_fs, vfs) = vfs().await;
        vfs.mkdir("viking://resources/x").await.unwrap();
        let err = vfs.reindex("viking://resources/x", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
    }

    #[tokio::test]
    async fn test_invalid_uri() {
        let (_fs, vfs) = vfs().await;
        let err = vfs.read("http://x").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
