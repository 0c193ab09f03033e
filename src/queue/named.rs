//! A durable FIFO queue stored in the object store.
//!
//! Each message is one file, `/queue/{name}/{seq}-{id}.json`, where
//! `seq` is a zero-padded counter so lexical order is arrival order and
//! `id` is random so writers in different processes never share a key.
//! Dequeue reads the head file and deletes it. A head that cannot be
//! read or deleted is moved to `/queue/{name}/.failed/` and counted as
//! an error.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, VikingError};
use crate::objstore::{join_path, ObjectStore};

pub const QUEUE_ROOT: &str = "/queue";
pub const FAILED_DIR: &str = ".failed";
const MAX_RECENT_ERRORS: usize = 100;

/// Consumer of one queue's messages.
#[async_trait]
pub trait DequeueHandler: Send + Sync {
    async fn handle(&self, message: Value) -> anyhow::Result<()>;
}

/// One failed message.
#[derive(Debug, Clone, Serialize)]
pub struct QueueError {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub in_progress: usize,
    pub processed: u64,
    pub error_count: u64,
    /// Most recent failures, oldest first.
    pub errors: Vec<QueueError>,
}

impl QueueStatus {
    pub fn is_complete(&self) -> bool {
        self.pending == 0 && self.in_progress == 0
    }

    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

#[derive(Default)]
struct Counters {
    in_progress: usize,
    processed: u64,
    error_count: u64,
    errors: VecDeque<QueueError>,
}

pub struct NamedQueue {
    name: String,
    dir: String,
    fs: Arc<dyn ObjectStore>,
    concurrency: usize,
    /// Serializes file operations; holds the next sequence number this
    /// handle will use.
    io: tokio::sync::Mutex<Option<u64>>,
    /// Heads that could be neither taken nor quarantined.
    stuck: Mutex<HashSet<String>>,
    handler: RwLock<Option<Arc<dyn DequeueHandler>>>,
    counters: Mutex<Counters>,
}

fn poisoned() -> VikingError {
    VikingError::Backend("queue state lock poisoned".into())
}

fn seq_of(file_name: &str) -> Option<u64> {
    let stem = file_name.strip_suffix(".json")?;
    let seq = stem.split_once('-').map_or(stem, |(seq, _)| seq);
    seq.parse().ok()
}

impl NamedQueue {
    pub fn new(fs: Arc<dyn ObjectStore>, name: &str, concurrency: usize) -> Self {
        Self {
            name: name.to_string(),
            dir: join_path(QUEUE_ROOT, name),
            fs,
            concurrency: concurrency.max(1),
            io: tokio::sync::Mutex::new(None),
            stuck: Mutex::new(HashSet::new()),
            handler: RwLock::new(None),
            counters: Mutex::new(Counters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_handler(&self, handler: Arc<dyn DequeueHandler>) -> Result<()> {
        *self.handler.write().map_err(|_| poisoned())? = Some(handler);
        Ok(())
    }

    pub fn has_handler(&self) -> bool {
        self.handler.read().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Sorted message file names currently on disk.
    async fn pending_files(&self) -> Result<Vec<String>> {
        let entries = match self.fs.ls(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let stuck = self.stuck.lock().map_err(|_| poisoned())?;
        let mut files: Vec<(u64, String)> = entries
            .into_iter()
            .filter(|e| !e.is_dir && !stuck.contains(&e.name))
            .filter_map(|e| seq_of(&e.name).map(|seq| (seq, e.name)))
            .collect();
        files.sort();
        Ok(files.into_iter().map(|(_, name)| name).collect())
    }

    /// Append a message. Returns its key.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, message: &T) -> Result<String> {
        let bytes = serde_json::to_vec(message)?;
        let mut next = self.io.lock().await;
        let on_disk = self
            .pending_files()
            .await?
            .last()
            .and_then(|n| seq_of(n))
            .map(|s| s + 1)
            .unwrap_or(0);
        let seq = next.map_or(on_disk, |n| n.max(on_disk));
        let key = format!("{:020}-{}", seq, Uuid::new_v4().simple());
        self.fs
            .write(&join_path(&self.dir, &format!("{}.json", key)), &bytes)
            .await?;
        *next = Some(seq + 1);
        debug!("[NamedQueue] {} enqueued {}", self.name, key);
        Ok(key)
    }

    /// Remove and return the raw head message.
    ///
    /// A head that fails to read or delete is quarantined and the next
    /// one is tried. A head deleted by another consumer is skipped.
    async fn pop_raw(&self) -> Result<Option<Vec<u8>>> {
        let _guard = self.io.lock().await;
        for head in self.pending_files().await? {
            let path = join_path(&self.dir, &head);
            let taken = match self.fs.read(&path).await {
                Ok(bytes) => self.fs.rm(&path, false).await.map(|()| bytes),
                Err(e) => Err(e),
            };
            match taken {
                Ok(bytes) => return Ok(Some(bytes)),
                Err(e) if e.is_not_found() => continue,
                Err(e) => self.quarantine(&head, &e).await,
            }
        }
        Ok(None)
    }

    async fn quarantine(&self, head: &str, cause: &VikingError) {
        warn!("[NamedQueue] {} cannot take {}: {}", self.name, head, cause);
        let from = join_path(&self.dir, head);
        let to = join_path(&join_path(&self.dir, FAILED_DIR), head);
        if let Err(e) = self.fs.mv(&from, &to).await {
            warn!("[NamedQueue] {} cannot quarantine {}: {}", self.name, head, e);
            if let Ok(mut stuck) = self.stuck.lock() {
                stuck.insert(head.to_string());
            }
        }
        if let Ok(mut c) = self.counters.lock() {
            push_error(
                &mut c,
                QueueError {
                    timestamp: Utc::now(),
                    message: format!("cannot take {}: {}", head, cause),
                    data: None,
                },
            );
        }
    }

    /// Remove and return the head message.
    pub async fn dequeue(&self) -> Result<Option<Value>> {
        match self.pop_raw().await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// The head message without removing it.
    pub async fn peek(&self) -> Result<Option<Value>> {
        let _guard = self.io.lock().await;
        let Some(head) = self.pending_files().await?.into_iter().next() else {
            return Ok(None);
        };
        let bytes = self.fs.read(&join_path(&self.dir, &head)).await?;
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub async fn size(&self) -> Result<usize> {
        Ok(self.pending_files().await?.len())
    }

    /// Drop every pending message. Returns how many were removed.
    pub async fn clear(&self) -> Result<usize> {
        let _guard = self.io.lock().await;
        let files = self.pending_files().await?;
        for f in &files {
            self.fs.rm(&join_path(&self.dir, f), false).await?;
        }
        Ok(files.len())
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let pending = self.size().await?;
        let c = self.counters.lock().map_err(|_| poisoned())?;
        Ok(QueueStatus {
            pending,
            in_progress: c.in_progress,
            processed: c.processed,
            error_count: c.error_count,
            errors: c.errors.iter().cloned().collect(),
        })
    }

    pub fn error_count(&self) -> u64 {
        self.counters.lock().map(|c| c.error_count).unwrap_or(0)
    }

    fn uncount(&self) {
        if let Ok(mut c) = self.counters.lock() {
            c.in_progress = c.in_progress.saturating_sub(1);
        }
    }

    fn record(&self, outcome: std::result::Result<(), QueueError>) {
        let Ok(mut c) = self.counters.lock() else {
            return;
        };
        c.in_progress = c.in_progress.saturating_sub(1);
        match outcome {
            Ok(()) => c.processed += 1,
            Err(err) => push_error(&mut c, err),
        }
    }

    /// Take up to `concurrency` messages and run them through the
    /// handler concurrently. Returns how many were taken.
    ///
    /// Failed messages are counted and dropped, never retried.
    pub async fn process_batch(&self) -> Result<usize> {
        let handler = match self.handler.read().map_err(|_| poisoned())?.clone() {
            Some(h) => h,
            None => return Ok(0),
        };

        let mut batch = Vec::new();
        while batch.len() < self.concurrency {
            // Counted before the file is gone so a status check never
            // sees the message in neither state.
            if let Ok(mut c) = self.counters.lock() {
                c.in_progress += 1;
            }
            match self.pop_raw().await {
                Ok(Some(bytes)) => batch.push(bytes),
                Ok(None) => {
                    self.uncount();
                    break;
                }
                Err(e) => {
                    self.uncount();
                    if batch.is_empty() {
                        return Err(e);
                    }
                    warn!("[NamedQueue] {} dequeue failed mid-batch: {}", self.name, e);
                    break;
                }
            }
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let taken = batch.len();
        let handler = &handler;
        join_all(batch.into_iter().map(|bytes| async move {
            let outcome = match serde_json::from_slice::<Value>(&bytes) {
                Err(e) => Err(QueueError {
                    timestamp: Utc::now(),
                    message: format!("invalid JSON: {}", e),
                    data: None,
                }),
                Ok(value) => match handler.handle(value.clone()).await {
                    Ok(()) => Ok(()),
                    Err(e) => Err(QueueError {
                        timestamp: Utc::now(),
                        message: format!("{:#}", e),
                        data: Some(value),
                    }),
                },
            };
            if let Err(ref err) = outcome {
                warn!("[NamedQueue] {} message failed: {}", self.name, err.message);
            }
            self.record(outcome);
        }))
        .await;
        Ok(taken)
    }
}

fn push_error(c: &mut Counters, err: QueueError) {
    c.error_count += 1;
    c.errors.push_back(err);
    while c.errors.len() > MAX_RECENT_ERRORS {
        c.errors.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryFs;
    use serde_json::json;

    struct Collect(Mutex<Vec<Value>>);

    #[async_trait]
    impl DequeueHandler for Collect {
        async fn handle(&self, message: Value) -> anyhow::Result<()> {
            if message.get("fail").is_some() {
                anyhow::bail!("rejected");
            }
            self.0.lock().unwrap().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_fifo_order_and_peek() {
        let fs = Arc::new(MemoryFs::new());
        let q = NamedQueue::new(fs, "Semantic", 1);
        for i in 0..3 {
            q.enqueue(&json!({ "n": i })).await.unwrap();
        }
        assert_eq!(q.size().await.unwrap(), 3);
        assert_eq!(q.peek().await.unwrap().unwrap()["n"], 0);
        for i in 0..3 {
            assert_eq!(q.dequeue().await.unwrap().unwrap()["n"], i);
        }
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sequence_resumes_after_reopen() {
        let fs = Arc::new(MemoryFs::new());
        let q = NamedQueue::new(fs.clone(), "Embedding", 1);
        q.enqueue(&json!({"n": 0})).await.unwrap();
        q.enqueue(&json!({"n": 1})).await.unwrap();

        let reopened = NamedQueue::new(fs, "Embedding", 1);
        let key = reopened.enqueue(&json!({"n": 2})).await.unwrap();
        assert_eq!(seq_of(&format!("{}.json", key)), Some(2));
        assert_eq!(reopened.dequeue().await.unwrap().unwrap()["n"], 0);
    }

    #[tokio::test]
    async fn test_process_batch_counts_errors_without_retry() {
        let fs = Arc::new(MemoryFs::new());
        let q = NamedQueue::new(fs.clone(), "Semantic", 4);
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        q.set_handler(handler.clone()).unwrap();

        q.enqueue(&json!({"n": 1})).await.unwrap();
        q.enqueue(&json!({"fail": true})).await.unwrap();
        fs.write("/queue/Semantic/00000000000000000099.json", b"{not json")
            .await
            .unwrap();

        assert_eq!(q.process_batch().await.unwrap(), 3);
        let status = q.status().await.unwrap();
        assert!(status.is_complete());
        assert_eq!(status.processed, 1);
        assert_eq!(status.error_count, 2);
        assert_eq!(status.errors.len(), 2);
        assert!(status.errors.iter().any(|e| e.data.is_some()));
        assert_eq!(handler.0.lock().unwrap().len(), 1);
        assert_eq!(q.process_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let fs = Arc::new(MemoryFs::new());
        let q = NamedQueue::new(fs, "Semantic", 1);
        q.enqueue(&json!({})).await.unwrap();
        q.enqueue(&json!({})).await.unwrap();
        assert_eq!(q.clear().await.unwrap(), 2);
        assert_eq!(q.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_two_handles_never_overwrite_each_other() {
        let fs = Arc::new(MemoryFs::new());
        let a = NamedQueue::new(fs.clone(), "Semantic", 1);
        let b = NamedQueue::new(fs.clone(), "Semantic", 1);
        a.enqueue(&json!("a0")).await.unwrap();
        b.enqueue(&json!("b0")).await.unwrap();
        a.enqueue(&json!("a1")).await.unwrap();
        assert_eq!(a.size().await.unwrap(), 3);

        let mut drained = Vec::new();
        while let Some(v) = a.dequeue().await.unwrap() {
            drained.push(v);
        }
        assert_eq!(drained.len(), 3);
        assert_eq!(drained[0], json!("a0"));
        assert!(drained.contains(&json!("b0")));
        assert!(drained.contains(&json!("a1")));
    }

    #[tokio::test]
    async fn test_undeletable_head_is_quarantined() {
        let fs = Arc::new(MemoryFs::new());
        let q = NamedQueue::new(fs.clone(), "Embedding", 1);
        let handler = Arc::new(Collect(Mutex::new(Vec::new())));
        q.set_handler(handler.clone()).unwrap();

        let head = q.enqueue(&json!({"n": 0})).await.unwrap();
        q.enqueue(&json!({"n": 1})).await.unwrap();
        let head_file = format!("{}.json", head);
        let blocked = head_file.clone();
        fs.fail_removes_when(move |p| p.ends_with(&blocked));

        assert_eq!(q.process_batch().await.unwrap(), 1);
        assert_eq!(handler.0.lock().unwrap().as_slice(), &[json!({"n": 1})]);

        let status = q.status().await.unwrap();
        assert!(status.is_complete());
        assert_eq!(status.processed, 1);
        assert_eq!(status.error_count, 1);
        assert!(fs
            .exists(&format!("/queue/Embedding/{}/{}", FAILED_DIR, head_file))
            .await
            .unwrap());
    }
}
