//! Hosts the named queues and the background dispatch loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::named::{DequeueHandler, NamedQueue, QueueStatus};
use crate::config::QueueConfig;
use crate::error::{Result, VikingError};
use crate::objstore::ObjectStore;

pub const EMBEDDING: &str = "Embedding";
pub const SEMANTIC: &str = "Semantic";

struct DispatchWorker {
    stop_tx: watch::Sender<bool>,
    /// One task per queue with a handler.
    handles: BTreeMap<String, JoinHandle<()>>,
}

/// Owns every [`NamedQueue`] of a process.
///
/// Once [`start`](Self::start)ed, each queue with a handler gets its own
/// dispatch task that polls every `poll_interval`, so a slow queue never
/// holds back another. Enqueueing never waits for processing.
pub struct QueueManager {
    fs: Arc<dyn ObjectStore>,
    config: QueueConfig,
    queues: RwLock<BTreeMap<String, Arc<NamedQueue>>>,
    worker: Mutex<Option<DispatchWorker>>,
}

fn poisoned() -> VikingError {
    VikingError::Backend("queue registry lock poisoned".into())
}

impl QueueManager {
    pub fn new(fs: Arc<dyn ObjectStore>, config: &QueueConfig) -> Self {
        info!(
            "[QueueManager] poll_interval={}ms",
            config.poll_interval_ms
        );
        Self {
            fs,
            config: config.clone(),
            queues: RwLock::new(BTreeMap::new()),
            worker: Mutex::new(None),
        }
    }

    fn concurrency_for(&self, name: &str) -> usize {
        match name {
            EMBEDDING => self.config.embedding_concurrency,
            SEMANTIC => self.config.semantic_concurrency,
            _ => 1,
        }
    }

    /// Get a queue, creating it on first use.
    pub fn queue(&self, name: &str) -> Result<Arc<NamedQueue>> {
        if let Some(q) = self.queues.read().map_err(|_| poisoned())?.get(name) {
            return Ok(q.clone());
        }
        let mut queues = self.queues.write().map_err(|_| poisoned())?;
        let q = queues
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(NamedQueue::new(
                    self.fs.clone(),
                    name,
                    self.concurrency_for(name),
                ))
            })
            .clone();
        Ok(q)
    }

    /// Set the consumer of a queue. When the manager is already running
    /// the queue gets its dispatch task right away.
    pub fn register_handler(&self, name: &str, handler: Arc<dyn DequeueHandler>) -> Result<()> {
        let queue = self.queue(name)?;
        queue.set_handler(handler)?;
        debug!("[QueueManager] handler registered for {}", name);

        let mut worker = self.worker.lock().map_err(|_| poisoned())?;
        if let Some(worker) = worker.as_mut() {
            if !worker.handles.contains_key(name) {
                let handle = spawn_dispatch(
                    queue,
                    worker.stop_tx.subscribe(),
                    self.config.poll_interval(),
                );
                worker.handles.insert(name.to_string(), handle);
            }
        }
        Ok(())
    }

    pub async fn enqueue<T: Serialize + ?Sized>(&self, name: &str, message: &T) -> Result<String> {
        self.queue(name)?.enqueue(message).await
    }

    fn all_queues(&self) -> Result<Vec<Arc<NamedQueue>>> {
        Ok(self
            .queues
            .read()
            .map_err(|_| poisoned())?
            .values()
            .cloned()
            .collect())
    }

    /// One dispatch pass over every queue with a handler. Returns the
    /// number of messages taken.
    pub async fn poll_once(&self) -> Result<usize> {
        let queues: Vec<Arc<NamedQueue>> = self
            .all_queues()?
            .into_iter()
            .filter(|q| q.has_handler())
            .collect();
        let mut taken = 0;
        for (q, result) in queues
            .iter()
            .zip(join_all(queues.iter().map(|q| q.process_batch())).await)
        {
            match result {
                Ok(n) => {
                    if n > 0 {
                        debug!("[QueueManager] dispatched {} from {}", n, q.name());
                    }
                    taken += n;
                }
                Err(e) => error!("[QueueManager] dispatch on {} failed: {}", q.name(), e),
            }
        }
        Ok(taken)
    }

    /// Spawn one dispatch task per queue with a handler. A second call
    /// is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().map_err(|_| poisoned())?;
        if worker.is_some() {
            return Ok(());
        }

        let (stop_tx, _) = watch::channel(false);
        let interval = self.config.poll_interval();
        let mut handles = BTreeMap::new();
        for q in self.all_queues()?.into_iter().filter(|q| q.has_handler()) {
            let name = q.name().to_string();
            handles.insert(name, spawn_dispatch(q, stop_tx.subscribe(), interval));
        }
        info!("[QueueManager] started {} dispatch task(s)", handles.len());
        *worker = Some(DispatchWorker { stop_tx, handles });
        Ok(())
    }

    /// Stop every dispatch task after its current batch.
    pub async fn stop(&self) {
        let worker = match self.worker.lock() {
            Ok(mut w) => w.take(),
            Err(_) => None,
        };
        if let Some(worker) = worker {
            let _ = worker.stop_tx.send(true);
            for (name, handle) in worker.handles {
                if let Err(e) = handle.await {
                    error!("[QueueManager] dispatch task for {} ended abnormally: {}", name, e);
                }
            }
            info!("[QueueManager] stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().map(|w| w.is_some()).unwrap_or(false)
    }

    /// Status of one queue, or of every queue when `name` is `None`.
    /// An unknown name yields an empty map.
    pub async fn check_status(&self, name: Option<&str>) -> Result<BTreeMap<String, QueueStatus>> {
        let queues: Vec<Arc<NamedQueue>> = match name {
            Some(n) => self
                .queues
                .read()
                .map_err(|_| poisoned())?
                .get(n)
                .cloned()
                .into_iter()
                .collect(),
            None => self.all_queues()?,
        };
        let mut out = BTreeMap::new();
        for q in queues {
            out.insert(q.name().to_string(), q.status().await?);
        }
        Ok(out)
    }

    pub fn has_errors(&self, name: Option<&str>) -> bool {
        let Ok(queues) = self.all_queues() else {
            return false;
        };
        queues
            .iter()
            .filter(|q| name.map(|n| q.name() == n).unwrap_or(true))
            .any(|q| q.error_count() > 0)
    }

    pub async fn is_all_complete(&self, name: Option<&str>) -> Result<bool> {
        Ok(self
            .check_status(name)
            .await?
            .values()
            .all(QueueStatus::is_complete))
    }

    /// Poll until every selected queue is drained and idle. Fails with
    /// [`VikingError::Timeout`] after `timeout`.
    pub async fn wait_complete(
        &self,
        name: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<String, QueueStatus>> {
        let started = Instant::now();
        loop {
            if self.is_all_complete(name).await? {
                return self.check_status(name).await;
            }
            if let Some(limit) = timeout {
                if started.elapsed() > limit {
                    return Err(VikingError::Timeout(format!(
                        "queue processing not complete after {:?}",
                        limit
                    )));
                }
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }
}

fn spawn_dispatch(
    queue: Arc<NamedQueue>,
    mut stop_rx: watch::Receiver<bool>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let taken = match queue.process_batch().await {
                Ok(n) => n,
                Err(e) => {
                    error!("[QueueManager] dispatch on {} failed: {}", queue.name(), e);
                    0
                }
            };
            if taken > 0 {
                debug!("[QueueManager] dispatched {} from {}", taken, queue.name());
                continue;
            }
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = stop_rx.changed() => {
                    if changed.is_err() || *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Render queue statuses as the table printed by `vk status`.
pub fn format_status_table(statuses: &BTreeMap<String, QueueStatus>) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "  {:<12} {:>8} {:>12} {:>10} {:>8}\n",
        "QUEUE", "PENDING", "IN PROGRESS", "PROCESSED", "ERRORS"
    ));
    out.push_str(&format!("  {}\n", "-".repeat(54)));
    let mut totals = QueueStatus::default();
    for (name, s) in statuses {
        out.push_str(&format!(
            "  {:<12} {:>8} {:>12} {:>10} {:>8}\n",
            name, s.pending, s.in_progress, s.processed, s.error_count
        ));
        totals.pending += s.pending;
        totals.in_progress += s.in_progress;
        totals.processed += s.processed;
        totals.error_count += s.error_count;
    }
    out.push_str(&format!("  {}\n", "-".repeat(54)));
    out.push_str(&format!(
        "  {:<12} {:>8} {:>12} {:>10} {:>8}\n",
        "TOTAL", totals.pending, totals.in_progress, totals.processed, totals.error_count
    ));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryFs;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Count(AtomicUsize);

    #[async_trait]
    impl DequeueHandler for Count {
        async fn handle(&self, _message: Value) -> anyhow::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn manager() -> Arc<QueueManager> {
        let config = QueueConfig {
            poll_interval_ms: 10,
            ..QueueConfig::default()
        };
        Arc::new(QueueManager::new(Arc::new(MemoryFs::new()), &config))
    }

    #[tokio::test]
    async fn test_background_dispatch_drains_queue() {
        let qm = manager();
        let handler = Arc::new(Count(AtomicUsize::new(0)));
        qm.register_handler(SEMANTIC, handler.clone()).unwrap();
        for i in 0..5 {
            qm.enqueue(SEMANTIC, &json!({ "n": i })).await.unwrap();
        }
        qm.start().unwrap();
        let statuses = qm
            .wait_complete(Some(SEMANTIC), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        qm.stop().await;

        assert_eq!(handler.0.load(Ordering::SeqCst), 5);
        assert_eq!(statuses[SEMANTIC].processed, 5);
        assert!(!qm.has_errors(None));
        assert!(!qm.is_running());
    }

    struct Gate(tokio::sync::Semaphore);

    #[async_trait]
    impl DequeueHandler for Gate {
        async fn handle(&self, _message: Value) -> anyhow::Result<()> {
            let _permit = self.0.acquire().await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_blocked_queue_does_not_hold_back_others() {
        let qm = manager();
        let gate = Arc::new(Gate(tokio::sync::Semaphore::new(0)));
        let count = Arc::new(Count(AtomicUsize::new(0)));
        qm.register_handler(SEMANTIC, gate.clone()).unwrap();
        qm.register_handler(EMBEDDING, count.clone()).unwrap();
        qm.enqueue(SEMANTIC, &json!({})).await.unwrap();
        for i in 0..3 {
            qm.enqueue(EMBEDDING, &json!({ "n": i })).await.unwrap();
        }
        qm.start().unwrap();

        qm.wait_complete(Some(EMBEDDING), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(count.0.load(Ordering::SeqCst), 3);
        assert!(!qm.is_all_complete(Some(SEMANTIC)).await.unwrap());

        gate.0.add_permits(1);
        qm.wait_complete(Some(SEMANTIC), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        qm.stop().await;
    }

    #[tokio::test]
    async fn test_handler_registered_after_start_is_dispatched() {
        let qm = manager();
        qm.start().unwrap();
        let count = Arc::new(Count(AtomicUsize::new(0)));
        qm.enqueue(EMBEDDING, &json!({})).await.unwrap();
        qm.register_handler(EMBEDDING, count.clone()).unwrap();
        qm.wait_complete(None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        qm.stop().await;
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_queue_without_handler_is_not_drained() {
        let qm = manager();
        qm.enqueue(EMBEDDING, &json!({})).await.unwrap();
        assert_eq!(qm.poll_once().await.unwrap(), 0);
        assert!(!qm.is_all_complete(None).await.unwrap());
        let err = qm
            .wait_complete(None, Some(Duration::from_millis(30)))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_unknown_queue_status_is_empty() {
        let qm = manager();
        assert!(qm.check_status(Some("Nope")).await.unwrap().is_empty());
    }

    #[test]
    fn test_status_table_has_totals() {
        let mut statuses = BTreeMap::new();
        statuses.insert(
            SEMANTIC.to_string(),
            QueueStatus {
                pending: 2,
                processed: 3,
                ..QueueStatus::default()
            },
        );
        statuses.insert(
            EMBEDDING.to_string(),
            QueueStatus {
                pending: 1,
                error_count: 1,
                ..QueueStatus::default()
            },
        );
        let table = format_status_table(&statuses);
        assert!(table.contains("QUEUE"));
        assert!(table.lines().last().unwrap().contains("TOTAL"));
        assert!(table.lines().last().unwrap().contains('3'));
    }
}
