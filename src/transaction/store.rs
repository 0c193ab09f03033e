//! Durable transaction records, one JSON file per transaction.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error};

use super::record::{unix_now, TransactionRecord};
use crate::error::{Result, VikingError};
use crate::objstore::{join_path, ObjectStore};

pub const TRANSACTIONS_DIR: &str = "/transactions";

pub struct TransactionStore {
    fs: Arc<dyn ObjectStore>,
    cache: RwLock<HashMap<String, TransactionRecord>>,
}

fn record_path(id: &str) -> String {
    join_path(TRANSACTIONS_DIR, &format!("{}.json", id))
}

fn poisoned() -> VikingError {
    VikingError::Backend("transaction cache lock poisoned".into())
}

impl TransactionStore {
    pub fn new(fs: Arc<dyn ObjectStore>) -> Self {
        Self {
            fs,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn initialize(&self) -> Result<()> {
        self.fs.mkdir(TRANSACTIONS_DIR).await?;
        debug!("[TransactionStore] initialized at {}", TRANSACTIONS_DIR);
        Ok(())
    }

    pub async fn add(&self, record: &TransactionRecord) -> Result<()> {
        self.write_record(record).await?;
        debug!("[TransactionStore] added transaction {}", record.id);
        Ok(())
    }

    pub async fn update(&self, record: &TransactionRecord) -> Result<()> {
        self.write_record(record).await
    }

    /// Fetch a record, from cache first, then from disk. A record that
    /// cannot be parsed is reported as absent.
    pub async fn get(&self, id: &str) -> Result<Option<TransactionRecord>> {
        if let Some(record) = self.cache.read().map_err(|_| poisoned())?.get(id) {
            return Ok(Some(record.clone()));
        }

        let bytes = match self.fs.read(&record_path(id)).await {
            Ok(b) => b,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice::<TransactionRecord>(&bytes) {
            Ok(record) => {
                self.cache
                    .write()
                    .map_err(|_| poisoned())?
                    .insert(id.to_string(), record.clone());
                Ok(Some(record))
            }
            Err(e) => {
                error!("[TransactionStore] unreadable record {}: {}", id, e);
                Ok(None)
            }
        }
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        match self.fs.rm(&record_path(id), false).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        self.cache.write().map_err(|_| poisoned())?.remove(id);
        debug!("[TransactionStore] deleted transaction {}", id);
        Ok(())
    }

    /// Every stored record keyed by id.
    pub async fn list_all(&self) -> Result<BTreeMap<String, TransactionRecord>> {
        let entries = match self.fs.ls(TRANSACTIONS_DIR).await {
            Ok(e) => e,
            Err(e) if e.is_not_found() => return Ok(BTreeMap::new()),
            Err(e) => return Err(e),
        };

        let mut out = BTreeMap::new();
        for entry in entries {
            let Some(id) = entry.name.strip_suffix(".json") else {
                continue;
            };
            if let Some(record) = self.get(id).await? {
                out.insert(id.to_string(), record);
            }
        }
        Ok(out)
    }

    /// Delete finished records (COMMIT, FAIL, RELEASED) not updated for
    /// longer than `max_age`. Returns how many were removed.
    pub async fn cleanup(&self, max_age: Duration) -> Result<usize> {
        let now = unix_now();
        let mut cleaned = 0;
        for (id, record) in self.list_all().await? {
            if record.status.is_finished() && now - record.updated_at > max_age.as_secs_f64() {
                self.delete(&id).await?;
                cleaned += 1;
            }
        }
        debug!("[TransactionStore] cleaned up {} transactions", cleaned);
        Ok(cleaned)
    }

    async fn write_record(&self, record: &TransactionRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        self.fs.write(&record_path(&record.id), &json).await?;
        self.cache
            .write()
            .map_err(|_| poisoned())?
            .insert(record.id.clone(), record.clone());
        Ok(())
    }
}
