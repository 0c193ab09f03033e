//! Queue message envelopes.
//!
//! Both envelopes are versionless JSON. Unknown fields are ignored;
//! `uri` and `context_type` are required, and a message missing either
//! fails on its own without affecting the rest of the queue.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use viking_store_core::models::{ContextType, SparseVector};

/// Check that `uri` and `context_type` are present and non-empty.
fn require_fields(value: &Value) -> Result<()> {
    let Some(obj) = value.as_object() else {
        bail!("message is not a JSON object");
    };
    if obj.is_empty() {
        bail!("message is empty");
    }
    let missing: Vec<&str> = ["uri", "context_type"]
        .into_iter()
        .filter(|k| {
            obj.get(*k)
                .and_then(Value::as_str)
                .map(str::is_empty)
                .unwrap_or(true)
        })
        .collect();
    if !missing.is_empty() {
        bail!("missing required fields: {:?}", missing);
    }
    Ok(())
}

fn default_status() -> String {
    "pending".to_string()
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// "(Re)index the subtree at `uri`."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticMsg {
    #[serde(default = "new_id")]
    pub id: String,
    pub uri: String,
    pub context_type: ContextType,
    #[serde(default = "default_status")]
    pub status: String,
    #[serde(default)]
    pub timestamp: i64,
}

impl SemanticMsg {
    pub fn new(uri: impl Into<String>, context_type: ContextType) -> Self {
        Self {
            id: new_id(),
            uri: uri.into(),
            context_type,
            status: default_status(),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        require_fields(&value)?;
        serde_json::from_value(value).map_err(|e| anyhow!("invalid semantic message: {}", e))
    }
}

/// "Vectorize this node and upsert it."
///
/// `text` is what the embedder sees. `dense`/`sparse` may be supplied
/// by a producer that already has vectors; the consumer then skips the
/// embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingMsg {
    #[serde(default = "new_id")]
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub parent_uri: Option<String>,
    pub context_type: ContextType,
    #[serde(default)]
    pub is_leaf: bool,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub text: String,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    #[serde(default)]
    pub dense: Option<Vec<f32>>,
    #[serde(default)]
    pub sparse: Option<SparseVector>,
    #[serde(default)]
    pub timestamp: i64,
}

impl EmbeddingMsg {
    pub fn new(uri: impl Into<String>, context_type: ContextType, text: impl Into<String>) -> Self {
        let uri = uri.into();
        let name = uri.rsplit('/').next().unwrap_or_default().to_string();
        Self {
            id: new_id(),
            uri,
            parent_uri: None,
            context_type,
            is_leaf: false,
            name,
            text: text.into(),
            abstract_text: String::new(),
            dense: None,
            sparse: None,
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn from_value(value: Value) -> Result<Self> {
        require_fields(&value)?;
        serde_json::from_value(value).map_err(|e| anyhow!("invalid embedding message: {}", e))
    }
}
