//! Core data models shared by the filesystem, the indexing pipeline,
//! and retrieval.
//!
//! A context node is addressed by a `viking://` URI and carries three
//! tiers of content: L0 (abstract), L1 (overview), and L2 (full
//! content). Directories derive L0/L1 from their children; leaves
//! carry L2 directly.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Sparse vector: term → weight. Ordered so serialization is stable.
pub type SparseVector = BTreeMap<String, f32>;

/// Partition a context node belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextType {
    Resource,
    Memory,
    Skill,
}

impl ContextType {
    pub const ALL: [ContextType; 3] = [ContextType::Memory, ContextType::Resource, ContextType::Skill];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextType::Resource => "resource",
            ContextType::Memory => "memory",
            ContextType::Skill => "skill",
        }
    }

    /// Infer the partition from a URI: any `/memories` segment means
    /// memory, `/skills` means skill, everything else is a resource.
    pub fn infer_from_uri(uri: &str) -> Self {
        if uri.contains("/memories") {
            ContextType::Memory
        } else if uri.contains("/skills") {
            ContextType::Skill
        } else {
            ContextType::Resource
        }
    }
}

impl fmt::Display for ContextType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContextType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resource" => Ok(ContextType::Resource),
            "memory" => Ok(ContextType::Memory),
            "skill" => Ok(ContextType::Skill),
            other => bail!(
                "Unknown context type: '{}'. Must be resource, memory, or skill.",
                other
            ),
        }
    }
}

/// Content tier of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    /// `.abstract.md`, one sentence.
    L0,
    /// `.overview.md`, a structured summary.
    L1,
    /// Full content.
    L2,
}

/// Coarse media classification of a leaf, by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceContentType {
    Text,
    Image,
    Video,
    Audio,
}

impl ResourceContentType {
    /// Classify a file name. Unknown extensions are treated as text.
    pub fn classify(file_name: &str) -> Self {
        let lower = file_name.to_lowercase();
        let has_ext = |exts: &[&str]| exts.iter().any(|e| lower.ends_with(e));

        if has_ext(&[".txt", ".md", ".csv", ".json", ".xml"]) {
            ResourceContentType::Text
        } else if has_ext(&[".png", ".jpg", ".jpeg", ".gif", ".bmp", ".svg", ".webp"]) {
            ResourceContentType::Image
        } else if has_ext(&[".mp4", ".avi", ".mov", ".wmv", ".flv"]) {
            ResourceContentType::Video
        } else if has_ext(&[".mp3", ".wav", ".aac", ".flac"]) {
            ResourceContentType::Audio
        } else {
            ResourceContentType::Text
        }
    }
}

/// A node as handed to the embedding pipeline.
///
/// `vectorize_text` is the text the embedder sees: the overview for a
/// directory, the full text or the summary for a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub uri: String,
    #[serde(default)]
    pub parent_uri: Option<String>,
    #[serde(default)]
    pub is_leaf: bool,
    #[serde(rename = "abstract", default)]
    pub abstract_text: String,
    pub context_type: ContextType,
    #[serde(default)]
    pub vectorize_text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

impl Context {
    pub fn new(uri: impl Into<String>, context_type: ContextType) -> Self {
        let now = chrono::Utc::now();
        Self {
            uri: uri.into(),
            parent_uri: None,
            is_leaf: false,
            abstract_text: String::new(),
            context_type,
            vectorize_text: String::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Last URI segment.
    pub fn name(&self) -> &str {
        self.uri.rsplit('/').next().unwrap_or(&self.uri)
    }
}

/// One entry of a node's `.relations.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationEntry {
    pub id: String,
    pub uris: Vec<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default = "now_iso")]
    pub created_at: String,
}

impl RelationEntry {
    pub fn new(id: impl Into<String>, uris: Vec<String>, reason: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uris,
            reason: reason.into(),
            created_at: now_iso(),
        }
    }
}

/// Current time as ISO 8601 with second precision.
pub fn now_iso() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// A node matched by retrieval.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedContext {
    pub uri: String,
    pub parent_uri: Option<String>,
    pub is_leaf: bool,
    pub context_type: ContextType,
    #[serde(rename = "abstract")]
    pub abstract_text: String,
    pub score: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_context_type() {
        assert_eq!(
            ContextType::infer_from_uri("viking://user/memories/prefs"),
            ContextType::Memory
        );
        assert_eq!(
            ContextType::infer_from_uri("viking://agent/skills/search"),
            ContextType::Skill
        );
        assert_eq!(
            ContextType::infer_from_uri("viking://resources/docs"),
            ContextType::Resource
        );
    }

    #[test]
    fn test_context_type_parse() {
        assert_eq!("memory".parse::<ContextType>().unwrap(), ContextType::Memory);
        assert!("unknown".parse::<ContextType>().is_err());
    }

    #[test]
    fn test_classify() {
        assert_eq!(ResourceContentType::classify("a.md"), ResourceContentType::Text);
        assert_eq!(ResourceContentType::classify("A.PNG"), ResourceContentType::Image);
        assert_eq!(ResourceContentType::classify("clip.mov"), ResourceContentType::Video);
        assert_eq!(ResourceContentType::classify("song.flac"), ResourceContentType::Audio);
        assert_eq!(ResourceContentType::classify("main.rs"), ResourceContentType::Text);
    }

    #[test]
    fn test_relation_entry_defaults() {
        let entry: RelationEntry =
            serde_json::from_str(r#"{"id":"link_1","uris":["viking://a"]}"#).unwrap();
        assert_eq!(entry.reason, "");
        assert!(!entry.created_at.is_empty());
    }
}
