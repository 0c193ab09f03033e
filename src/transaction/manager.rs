//! Transaction lifecycle, lock bookkeeping, and the timeout sweep.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::record::{unix_now, TransactionRecord, TransactionStatus};
use super::store::TransactionStore;
use crate::config::TransactionConfig;
use crate::error::{Result, VikingError};
use crate::lock::PathLock;
use crate::objstore::ObjectStore;

struct SweepWorker {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns transaction records and the [`PathLock`] that backs them.
///
/// Construct one per process and share it behind an `Arc`. Call
/// [`start`](Self::start) to run the timeout sweep in the background and
/// [`stop`](Self::stop) before shutdown.
pub struct TransactionManager {
    store: TransactionStore,
    lock: PathLock,
    timeout: Duration,
    check_interval: Duration,
    worker: Mutex<Option<SweepWorker>>,
}

impl TransactionManager {
    pub fn new(fs: Arc<dyn ObjectStore>, config: &TransactionConfig) -> Self {
        info!(
            "[TransactionManager] timeout={}s, max_parallel_locks={}",
            config.timeout_secs, config.max_parallel_locks
        );
        Self {
            store: TransactionStore::new(fs.clone()),
            lock: PathLock::new(fs, config.max_parallel_locks),
            timeout: config.timeout(),
            check_interval: config.check_interval(),
            worker: Mutex::new(None),
        }
    }

    pub fn path_lock(&self) -> &PathLock {
        &self.lock
    }

    pub fn store(&self) -> &TransactionStore {
        &self.store
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Spawn the background timeout sweep. A second call is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.initialize().await?;

        let mut worker = self
            .worker
            .lock()
            .map_err(|_| VikingError::Backend("transaction worker lock poisoned".into()))?;
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            loop {
                if let Err(e) = manager.sweep_once().await {
                    error!("[TransactionManager] timeout check failed: {}", e);
                }
                tokio::select! {
                    _ = tokio::time::sleep(manager.check_interval) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *worker = Some(SweepWorker { stop_tx, handle });
        info!("[TransactionManager] started");
        Ok(())
    }

    /// Stop the sweep and wait for it to exit.
    pub async fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(true);
            if let Err(e) = worker.handle.await {
                warn!("[TransactionManager] sweep task ended abnormally: {}", e);
            }
            info!("[TransactionManager] stopped");
        }
    }

    /// Roll back every ACQUIRE/EXEC transaction older than the timeout.
    /// Returns the ids rolled back.
    pub async fn sweep_once(&self) -> Result<Vec<String>> {
        let now = unix_now();
        let limit = self.timeout.as_secs_f64();
        let mut rolled_back = Vec::new();
        for (id, record) in self.store.list_all().await? {
            if record.status.is_active() && record.age_secs(now) > limit {
                warn!(
                    "[TransactionManager] transaction {} timed out in {}, rolling back",
                    id, record.status
                );
                if self.rollback(&id).await? {
                    rolled_back.push(id);
                }
            }
        }
        Ok(rolled_back)
    }

    pub async fn begin(&self, init_info: Map<String, Value>) -> Result<String> {
        let record = TransactionRecord::new(init_info);
        self.store.add(&record).await?;
        debug!("[TransactionManager] began transaction {}", record.id);
        Ok(record.id)
    }

    async fn load(&self, txn_id: &str) -> Result<TransactionRecord> {
        self.store
            .get(txn_id)
            .await?
            .ok_or_else(|| VikingError::NotFound(format!("transaction {}", txn_id)))
    }

    async fn set_status(&self, record: &mut TransactionRecord, status: TransactionStatus) -> Result<()> {
        record.update_status(status);
        self.store.update(record).await
    }

    /// Record acquired paths and move the transaction back to EXEC.
    async fn record_locks(&self, record: &mut TransactionRecord, paths: &[String]) -> Result<()> {
        for path in paths {
            record.add_lock(path);
        }
        self.set_status(record, TransactionStatus::Exec).await
    }

    /// Lock a single directory.
    pub async fn acquire_lock_normal(&self, txn_id: &str, path: &str) -> Result<()> {
        let mut record = self.load(txn_id).await?;
        self.set_status(&mut record, TransactionStatus::Acquire).await?;
        self.lock.acquire(path, txn_id).await?;
        self.record_locks(&mut record, &[path.to_string()]).await
    }

    /// Lock a directory and its whole subtree, for `rm`.
    pub async fn acquire_lock_rm(&self, txn_id: &str, path: &str) -> Result<()> {
        let mut record = self.load(txn_id).await?;
        self.set_status(&mut record, TransactionStatus::Acquire).await?;
        let acquired = self.lock.acquire_recursive(path, txn_id).await?;
        self.record_locks(&mut record, &acquired).await
    }

    /// Lock the source subtree and the destination directory, for `mv`.
    pub async fn acquire_lock_mv(&self, txn_id: &str, src: &str, dst: &str) -> Result<()> {
        let mut record = self.load(txn_id).await?;
        self.set_status(&mut record, TransactionStatus::Acquire).await?;
        let acquired = self.lock.acquire_for_move(src, dst, txn_id).await?;
        self.record_locks(&mut record, &acquired).await
    }

    /// Commit and release. `Ok(false)` when the transaction is unknown
    /// or already released.
    pub async fn commit(&self, txn_id: &str) -> Result<bool> {
        self.finish(txn_id, TransactionStatus::Commit).await
    }

    /// Roll back and release. `Ok(false)` when the transaction is
    /// unknown or already released.
    pub async fn rollback(&self, txn_id: &str) -> Result<bool> {
        self.finish(txn_id, TransactionStatus::Fail).await
    }

    async fn finish(&self, txn_id: &str, outcome: TransactionStatus) -> Result<bool> {
        let Some(mut record) = self.store.get(txn_id).await? else {
            warn!("[TransactionManager] transaction {} not found", txn_id);
            return Ok(false);
        };
        if record.status == TransactionStatus::Released {
            warn!("[TransactionManager] transaction {} already released", txn_id);
            return Ok(false);
        }

        self.set_status(&mut record, outcome).await?;
        self.release_locks(&mut record).await?;
        self.set_status(&mut record, TransactionStatus::Released).await?;
        self.store.delete(txn_id).await?;
        debug!("[TransactionManager] {} transaction {}", outcome, txn_id);
        Ok(true)
    }

    async fn release_locks(&self, record: &mut TransactionRecord) -> Result<()> {
        if record.locks.is_empty() {
            return Ok(());
        }
        self.set_status(record, TransactionStatus::Releasing).await?;
        // Locks were recorded deepest first; release shallowest first.
        self.lock.release_reversed(&record.locks, &record.id).await;
        record.locks.clear();
        Ok(())
    }

    /// Run `op` inside a fresh transaction: commit on `Ok`, roll back
    /// on `Err` and return the error.
    pub async fn run<F, Fut, T>(&self, init_info: Map<String, Value>, op: F) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let txn_id = self.begin(init_info).await?;
        if let Some(mut record) = self.store.get(&txn_id).await? {
            self.set_status(&mut record, TransactionStatus::Exec).await?;
        }

        match op(txn_id.clone()).await {
            Ok(value) => {
                self.commit(&txn_id).await?;
                Ok(value)
            }
            Err(e) => {
                error!(
                    "[TransactionManager] operation failed in transaction {}: {}",
                    txn_id, e
                );
                if let Err(rb) = self.rollback(&txn_id).await {
                    error!("[TransactionManager] rollback of {} failed: {}", txn_id, rb);
                }
                Err(e)
            }
        }
    }

    pub async fn get_transaction(&self, txn_id: &str) -> Result<Option<TransactionRecord>> {
        self.store.get(txn_id).await
    }

    pub async fn list_transactions(&self) -> Result<BTreeMap<String, TransactionRecord>> {
        self.store.list_all().await
    }
}

/// Build an `init_info` map from key/value pairs.
pub fn init_info<const N: usize>(pairs: [(&str, &str); N]) -> Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect()
}
