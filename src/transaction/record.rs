//! Transaction record and status.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Lifecycle of a transaction:
/// `INIT → ACQUIRE → EXEC → {COMMIT | FAIL} → RELEASING → RELEASED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransactionStatus {
    Init,
    Acquire,
    Exec,
    Commit,
    Fail,
    Releasing,
    Released,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Init => "INIT",
            TransactionStatus::Acquire => "ACQUIRE",
            TransactionStatus::Exec => "EXEC",
            TransactionStatus::Commit => "COMMIT",
            TransactionStatus::Fail => "FAIL",
            TransactionStatus::Releasing => "RELEASING",
            TransactionStatus::Released => "RELEASED",
        }
    }

    /// Statuses the timeout sweep rolls back.
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionStatus::Acquire | TransactionStatus::Exec)
    }

    /// Statuses left behind only by an interrupted release.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Commit | TransactionStatus::Fail | TransactionStatus::Released
        )
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current time as fractional unix seconds.
pub fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Persisted state of one transaction, stored as
/// `/transactions/{id}.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: String,
    #[serde(default)]
    pub locks: Vec<String>,
    pub status: TransactionStatus,
    #[serde(default)]
    pub init_info: Map<String, Value>,
    #[serde(default)]
    pub rollback_info: Map<String, Value>,
    pub created_at: f64,
    pub updated_at: f64,
}

impl TransactionRecord {
    pub fn new(init_info: Map<String, Value>) -> Self {
        let now = unix_now();
        Self {
            id: Uuid::new_v4().to_string(),
            locks: Vec::new(),
            status: TransactionStatus::Init,
            init_info,
            rollback_info: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn update_status(&mut self, status: TransactionStatus) {
        self.status = status;
        self.updated_at = unix_now();
    }

    pub fn add_lock(&mut self, path: &str) {
        if !self.locks.iter().any(|p| p == path) {
            self.locks.push(path.to_string());
        }
        self.updated_at = unix_now();
    }

    pub fn remove_lock(&mut self, path: &str) {
        self.locks.retain(|p| p != path);
        self.updated_at = unix_now();
    }

    /// Seconds since the transaction began.
    pub fn age_secs(&self, now: f64) -> f64 {
        now - self.created_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&TransactionStatus::Releasing).unwrap();
        assert_eq!(json, "\"RELEASING\"");
        let back: TransactionStatus = serde_json::from_str("\"EXEC\"").unwrap();
        assert_eq!(back, TransactionStatus::Exec);
    }

    #[test]
    fn test_locks_are_deduplicated() {
        let mut record = TransactionRecord::new(Map::new());
        record.add_lock("/local/a");
        record.add_lock("/local/a");
        record.add_lock("/local/b");
        assert_eq!(record.locks, vec!["/local/a", "/local/b"]);
        record.remove_lock("/local/a");
        assert_eq!(record.locks, vec!["/local/b"]);
    }

    #[test]
    fn test_record_json_shape() {
        let mut info = Map::new();
        info.insert("op".into(), Value::String("rm".into()));
        let record = TransactionRecord::new(info);
        let value = serde_json::to_value(&record).unwrap();
        for key in [
            "id",
            "locks",
            "status",
            "init_info",
            "rollback_info",
            "created_at",
            "updated_at",
        ] {
            assert!(value.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(value["status"], "INIT");
        assert!(Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let record: TransactionRecord = serde_json::from_str(
            r#"{"id":"t1","status":"ACQUIRE","created_at":1.0,"updated_at":2.0,"extra":true}"#,
        )
        .unwrap();
        assert!(record.locks.is_empty());
        assert!(record.status.is_active());
    }
}
