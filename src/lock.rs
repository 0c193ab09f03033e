//! Directory locks built from marker files.
//!
//! A directory `P` is locked when `P/.path.ovlock` exists; the file
//! holds the owning transaction id. There is no lock table: the marker
//! is the only source of truth, so any process sharing the object
//! store observes the same locks.
//!
//! # Acquire protocol
//!
//! For path `P` and transaction `T`:
//!
//! 1. `P` must exist.
//! 2. `P` must not be locked by another transaction.
//! 3. `parent(P)` must not be locked by another transaction.
//! 4. Write the marker with `T`.
//! 5. Re-check `parent(P)`; if another transaction locked it in the
//!    meantime, delete the marker and fail.
//! 6. Read the marker back; if it does not hold `T`, delete it and fail.
//!
//! Step 5 narrows but does not close the race with a concurrent parent
//! lock. Every failure path removes the marker it wrote.
//!
//! Recursive acquisition locks every descendant directory deepest
//! first, in batches of at most `max_parallel`, then the root. Any
//! failure releases everything acquired so far, shallowest first.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::objstore::{join_path, parent_path, ObjectStore};

pub const LOCK_FILE_NAME: &str = ".path.ovlock";
pub const DEFAULT_MAX_PARALLEL_LOCKS: usize = 8;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    #[error("{path} is locked by {owner}")]
    Conflict { path: String, owner: String },

    #[error("lock marker at {path} holds '{found}', expected '{expected}'")]
    Corruption {
        path: String,
        expected: String,
        found: String,
    },

    #[error("cannot lock missing path {0}")]
    NotFound(String),

    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Only a conflict can clear up on its own; the rest will fail
    /// again the same way.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LockError::Conflict { .. })
    }
}

pub type LockResult<T> = std::result::Result<T, LockError>;

pub struct PathLock {
    fs: Arc<dyn ObjectStore>,
    max_parallel: usize,
}

fn marker_path(path: &str) -> String {
    join_path(path, LOCK_FILE_NAME)
}

fn depth(path: &str) -> usize {
    path.matches('/').count()
}

impl PathLock {
    pub fn new(fs: Arc<dyn ObjectStore>, max_parallel: usize) -> Self {
        Self {
            fs,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Owner of the lock on `path`, if any.
    pub async fn lock_owner(&self, path: &str) -> Option<String> {
        let bytes = self.fs.read(&marker_path(path)).await.ok()?;
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub async fn is_locked(&self, path: &str) -> bool {
        matches!(self.fs.exists(&marker_path(path)).await, Ok(true))
    }

    /// Fail if `path` is locked by someone other than `txn_id`.
    async fn check_not_held_by_other(&self, path: &str, txn_id: &str) -> LockResult<()> {
        if !self.is_locked(path).await {
            return Ok(());
        }
        match self.lock_owner(path).await {
            Some(owner) if owner != txn_id => Err(LockError::Conflict {
                path: path.to_string(),
                owner,
            }),
            _ => Ok(()),
        }
    }

    async fn remove_marker(&self, marker: &str) {
        if let Err(e) = self.fs.rm(marker, false).await {
            if !e.is_not_found() {
                debug!("[PathLock] failed to remove marker {}: {}", marker, e);
            }
        }
    }

    /// Lock a single directory for `txn_id`. Re-acquiring a lock the
    /// transaction already holds succeeds.
    pub async fn acquire(&self, path: &str, txn_id: &str) -> LockResult<()> {
        match self.fs.stat(path).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => return Err(LockError::NotFound(path.to_string())),
            Err(e) => return Err(LockError::Backend(e.to_string())),
        }

        if let Err(e) = self.check_not_held_by_other(path, txn_id).await {
            warn!("[PathLock] {} already locked: {}", path, e);
            return Err(e);
        }

        let parent = parent_path(path).filter(|p| *p != path);
        if let Some(parent) = parent {
            if let Err(e) = self.check_not_held_by_other(parent, txn_id).await {
                warn!("[PathLock] parent of {} already locked: {}", path, e);
                return Err(e);
            }
        }

        if self.lock_owner(path).await.as_deref() == Some(txn_id) {
            debug!("[PathLock] {} already held by {}", path, txn_id);
            return Ok(());
        }

        let marker = marker_path(path);
        if let Err(e) = self.fs.write(&marker, txn_id.as_bytes()).await {
            self.remove_marker(&marker).await;
            error!("[PathLock] failed to write marker for {}: {}", path, e);
            return Err(LockError::Backend(e.to_string()));
        }

        if let Some(parent) = parent {
            if let Err(e) = self.check_not_held_by_other(parent, txn_id).await {
                self.remove_marker(&marker).await;
                warn!("[PathLock] parent of {} locked during acquisition: {}", path, e);
                return Err(e);
            }
        }

        let found = match self.fs.read(&marker).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                self.remove_marker(&marker).await;
                return Err(LockError::Backend(e.to_string()));
            }
        };
        if found != txn_id {
            self.remove_marker(&marker).await;
            warn!(
                "[PathLock] marker for {} corrupted, expected {}, got {}",
                path, txn_id, found
            );
            return Err(LockError::Corruption {
                path: path.to_string(),
                expected: txn_id.to_string(),
                found,
            });
        }

        debug!("[PathLock] acquired {} for {}", path, txn_id);
        Ok(())
    }

    /// Lock `paths` in order; on failure release what was taken.
    pub async fn acquire_multiple(&self, paths: &[String], txn_id: &str) -> LockResult<Vec<String>> {
        let mut acquired = Vec::new();
        for path in paths {
            if let Err(e) = self.acquire(path, txn_id).await {
                warn!("[PathLock] failed to lock {}, rolling back", path);
                self.release_reversed(&acquired, txn_id).await;
                return Err(e);
            }
            acquired.push(path.clone());
        }
        Ok(acquired)
    }

    /// Lock `path` and every directory beneath it.
    ///
    /// Returns the acquired paths in acquisition order (deepest first,
    /// `path` last).
    pub async fn acquire_recursive(&self, path: &str, txn_id: &str) -> LockResult<Vec<String>> {
        let mut subdirs = self.collect_subdirectories(path).await?;
        // Stable sort keeps sibling order within a depth.
        subdirs.sort_by_key(|p| std::cmp::Reverse(depth(p)));

        let mut acquired: Vec<String> = Vec::new();
        for batch in subdirs.chunks(self.max_parallel) {
            let results = join_all(batch.iter().map(|p| self.acquire(p, txn_id))).await;

            let mut failure = None;
            for (p, result) in batch.iter().zip(results) {
                match result {
                    Ok(()) => acquired.push(p.clone()),
                    Err(e) => {
                        if failure.is_none() {
                            failure = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = failure {
                warn!("[PathLock] recursive lock of {} failed, rolling back: {}", path, e);
                self.release_reversed(&acquired, txn_id).await;
                return Err(e);
            }
        }

        if let Err(e) = self.acquire(path, txn_id).await {
            warn!("[PathLock] failed to lock root {}, rolling back", path);
            self.release_reversed(&acquired, txn_id).await;
            return Err(e);
        }
        acquired.push(path.to_string());
        Ok(acquired)
    }

    /// Lock the whole source subtree plus the destination directory.
    pub async fn acquire_for_move(
        &self,
        src: &str,
        dst: &str,
        txn_id: &str,
    ) -> LockResult<Vec<String>> {
        let mut acquired = self.acquire_recursive(src, txn_id).await?;
        if let Err(e) = self.acquire(dst, txn_id).await {
            warn!("[PathLock] failed to lock move destination {}, rolling back", dst);
            self.release_reversed(&acquired, txn_id).await;
            return Err(e);
        }
        acquired.push(dst.to_string());
        Ok(acquired)
    }

    /// Release locks in the given order. Missing markers and markers
    /// owned by another transaction are skipped.
    pub async fn release(&self, paths: &[String], txn_id: &str) {
        for path in paths {
            let marker = marker_path(path);
            match self.lock_owner(path).await {
                Some(owner) if owner != txn_id => {
                    debug!(
                        "[PathLock] not releasing {}: held by {}, not {}",
                        path, owner, txn_id
                    );
                }
                Some(_) => {
                    self.remove_marker(&marker).await;
                    debug!("[PathLock] released {}", path);
                }
                None => {}
            }
        }
    }

    /// Release in reverse acquisition order (shallowest first).
    pub async fn release_reversed(&self, acquired: &[String], txn_id: &str) {
        let reversed: Vec<String> = acquired.iter().rev().cloned().collect();
        self.release(&reversed, txn_id).await;
    }

    async fn collect_subdirectories(&self, path: &str) -> LockResult<Vec<String>> {
        let entries = self.fs.walk(path).await.map_err(|e| {
            if e.is_not_found() {
                LockError::NotFound(path.to_string())
            } else {
                LockError::Backend(e.to_string())
            }
        })?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir)
            .map(|e| e.path)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryFs;

    async fn setup() -> (Arc<MemoryFs>, PathLock) {
        let fs = Arc::new(MemoryFs::new());
        for dir in ["/local/r/a/b/c", "/local/r/a/d", "/local/r/e"] {
            fs.mkdir(dir).await.unwrap();
        }
        let lock = PathLock::new(fs.clone(), 2);
        (fs, lock)
    }

    fn markers(fs: &MemoryFs) -> Vec<String> {
        fs.paths()
            .into_iter()
            .filter(|p| p.ends_with(LOCK_FILE_NAME))
            .collect()
    }

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let (_fs, lock) = setup().await;
        lock.acquire("/local/r/e", "t1").await.unwrap();
        let err = lock.acquire("/local/r/e", "t2").await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(lock.lock_owner("/local/r/e").await.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn test_reentrant_for_same_transaction() {
        let (_fs, lock) = setup().await;
        lock.acquire("/local/r/e", "t1").await.unwrap();
        lock.acquire("/local/r/e", "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_reentrant_acquire_keeps_marker_when_writes_fail() {
        let (fs, lock) = setup().await;
        lock.acquire("/local/r/e", "t1").await.unwrap();
        fs.fail_writes_when(|p| p.ends_with(LOCK_FILE_NAME));
        lock.acquire("/local/r/e", "t1").await.unwrap();
        assert_eq!(lock.lock_owner("/local/r/e").await.as_deref(), Some("t1"));
        assert!(lock.acquire("/local/r/a", "t1").await.is_err());
        assert_eq!(markers(&fs), vec![marker_path("/local/r/e")]);
    }

    #[tokio::test]
    async fn test_parent_lock_blocks_child() {
        let (_fs, lock) = setup().await;
        lock.acquire("/local/r/a", "t1").await.unwrap();
        assert!(matches!(
            lock.acquire("/local/r/a/d", "t2").await,
            Err(LockError::Conflict { .. })
        ));
        lock.acquire("/local/r/a/d", "t1").await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_path() {
        let (fs, lock) = setup().await;
        let err = lock.acquire("/local/nope", "t1").await.unwrap_err();
        assert_eq!(err, LockError::NotFound("/local/nope".into()));
        assert!(!err.is_retryable());
        assert!(markers(&fs).is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_marker_is_cleaned_up() {
        let (fs, lock) = setup().await;
        fs.tamper_reads_with(|path, data| {
            if path.ends_with(LOCK_FILE_NAME) {
                b"someone-else".to_vec()
            } else {
                data
            }
        });
        let err = lock.acquire("/local/r/e", "t1").await.unwrap_err();
        assert!(matches!(err, LockError::Corruption { .. }));
        assert!(!err.is_retryable());
        fs.clear_faults();
        assert!(markers(&fs).is_empty());
    }

    #[tokio::test]
    async fn test_recursive_locks_everything_deepest_first() {
        let (fs, lock) = setup().await;
        let acquired = lock.acquire_recursive("/local/r/a", "t1").await.unwrap();
        assert_eq!(acquired.first().map(String::as_str), Some("/local/r/a/b/c"));
        assert_eq!(acquired.last().map(String::as_str), Some("/local/r/a"));
        assert_eq!(acquired.len(), 4);
        assert_eq!(markers(&fs).len(), 4);

        lock.release_reversed(&acquired, "t1").await;
        assert!(markers(&fs).is_empty());
    }

    #[tokio::test]
    async fn test_recursive_failure_leaves_no_markers() {
        let (fs, lock) = setup().await;
        // Another transaction holds a leaf deep in the tree.
        lock.acquire("/local/r/a/b/c", "other").await.unwrap();
        let err = lock.acquire_recursive("/local/r/a", "t1").await.unwrap_err();
        assert!(err.is_retryable());
        let left = markers(&fs);
        assert_eq!(left, vec![format!("/local/r/a/b/c/{}", LOCK_FILE_NAME)]);
    }

    #[tokio::test]
    async fn test_recursive_write_fault_leaves_no_markers() {
        let (fs, lock) = setup().await;
        fs.fail_writes_when(|p| p == "/local/r/a/d/.path.ovlock");
        assert!(lock.acquire_recursive("/local/r/a", "t1").await.is_err());
        fs.clear_faults();
        assert!(markers(&fs).is_empty());
    }

    #[tokio::test]
    async fn test_move_locks_destination() {
        let (fs, lock) = setup().await;
        let acquired = lock
            .acquire_for_move("/local/r/a/b", "/local/r/e", "t1")
            .await
            .unwrap();
        assert_eq!(acquired.last().map(String::as_str), Some("/local/r/e"));
        assert_eq!(markers(&fs).len(), 3);
    }

    #[tokio::test]
    async fn test_move_destination_conflict_rolls_back_source() {
        let (fs, lock) = setup().await;
        lock.acquire("/local/r/e", "other").await.unwrap();
        assert!(lock
            .acquire_for_move("/local/r/a/b", "/local/r/e", "t1")
            .await
            .is_err());
        assert_eq!(markers(&fs).len(), 1);
    }

    #[tokio::test]
    async fn test_release_skips_foreign_markers() {
        let (_fs, lock) = setup().await;
        lock.acquire("/local/r/e", "t1").await.unwrap();
        lock.release(&["/local/r/e".to_string()], "t2").await;
        assert!(lock.is_locked("/local/r/e").await);
        lock.release(&["/local/r/e".to_string(), "/local/gone".to_string()], "t1")
            .await;
        assert!(!lock.is_locked("/local/r/e").await);
    }
}
