//! Per-node relation tables (`.relations.json`).
//!
//! A table is a flat JSON array of [`RelationEntry`]. Tables written in
//! the older nested layout (`{namespace: {user: [entries]}}`) are still
//! read. A table that is missing or unreadable counts as empty.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use viking_store_core::models::{Level, RelationEntry};

use super::{parse_uri, VikingFs, RELATIONS_FILE};
use crate::error::{Result, VikingError};
use crate::objstore::join_path;
use crate::transaction::init_info;

/// One related URI with the reason of the entry it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelationRef {
    pub uri: String,
    pub reason: String,
}

/// A related URI with its summaries attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RelatedContent {
    pub uri: String,
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overview: Option<String>,
}

fn parse_table(value: Value) -> Vec<RelationEntry> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        Value::Object(namespaces) => namespaces
            .into_iter()
            .filter_map(|(_, users)| match users {
                Value::Object(users) => Some(users),
                _ => None,
            })
            .flat_map(|users| users.into_iter().map(|(_, list)| list))
            .flat_map(|list| match list {
                Value::Array(items) => items,
                _ => Vec::new(),
            })
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect(),
        _ => Vec::new(),
    }
}

/// First `link_{n}` id, `n >= 1`, not used in `entries`.
fn next_link_id(entries: &[RelationEntry]) -> String {
    (1..)
        .map(|i| format!("link_{}", i))
        .find(|id| !entries.iter().any(|e| &e.id == id))
        .unwrap_or_else(|| format!("link_{}", entries.len() + 1))
}

impl VikingFs {
    async fn read_relation_table(&self, dir_path: &str) -> Vec<RelationEntry> {
        let Ok(bytes) = self.fs.read(&join_path(dir_path, RELATIONS_FILE)).await else {
            return Vec::new();
        };
        serde_json::from_slice::<Value>(&bytes)
            .map(parse_table)
            .unwrap_or_default()
    }

    async fn write_relation_table(&self, dir_path: &str, entries: &[RelationEntry]) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)?;
        self.fs.write(&join_path(dir_path, RELATIONS_FILE), &json).await
    }

    async fn relation_dir(&self, uri: &str) -> Result<String> {
        let parsed = parse_uri(uri)?;
        let path = self.path_of(&parsed);
        if !self.fs.stat(&path).await?.is_dir {
            return Err(VikingError::InvalidArgument(format!(
                "{} is not a directory",
                parsed
            )));
        }
        Ok(path)
    }

    /// All relation entries of a node.
    pub async fn get_relation_table(&self, uri: &str) -> Result<Vec<RelationEntry>> {
        let parsed = parse_uri(uri)?;
        Ok(self.read_relation_table(&self.path_of(&parsed)).await)
    }

    /// Add a relation entry from `from_uri` to `uris`. Returns the new
    /// entry's id.
    pub async fn link(&self, from_uri: &str, uris: Vec<String>, reason: &str) -> Result<String> {
        if uris.is_empty() {
            return Err(VikingError::InvalidArgument("link needs at least one target".into()));
        }
        for target in &uris {
            parse_uri(target)?;
        }
        let path = self.relation_dir(from_uri).await?;

        self.txn
            .run(init_info([("op", "link"), ("uri", from_uri)]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &path).await?;
                let mut entries = self.read_relation_table(&path).await;
                let id = next_link_id(&entries);
                info!("[VikingFs] linking {} -> {:?} as {}", from_uri, uris, id);
                entries.push(RelationEntry::new(id.clone(), uris, reason));
                self.write_relation_table(&path, &entries).await?;
                Ok(id)
            })
            .await
    }

    /// Remove `uri` from the first entry of `from_uri` that lists it.
    /// An entry left without targets is dropped. Removing a URI that is
    /// not linked is a no-op.
    pub async fn unlink(&self, from_uri: &str, uri: &str) -> Result<()> {
        let path = self.relation_dir(from_uri).await?;

        self.txn
            .run(init_info([("op", "unlink"), ("uri", from_uri)]), |txn_id| async move {
                self.txn.acquire_lock_normal(&txn_id, &path).await?;
                let mut entries = self.read_relation_table(&path).await;
                let Some(idx) = entries.iter().position(|e| e.uris.iter().any(|u| u == uri)) else {
                    warn!("[VikingFs] {} is not linked from {}", uri, from_uri);
                    return Ok(());
                };
                entries[idx].uris.retain(|u| u != uri);
                if entries[idx].uris.is_empty() {
                    let removed = entries.remove(idx);
                    info!("[VikingFs] removed empty relation entry {}", removed.id);
                }
                self.write_relation_table(&path, &entries).await
            })
            .await
    }

    /// Every related URI, one row per target.
    pub async fn relations(&self, uri: &str) -> Result<Vec<RelationRef>> {
        Ok(self
            .get_relation_table(uri)
            .await?
            .into_iter()
            .flat_map(|entry| {
                let reason = entry.reason;
                entry.uris.into_iter().map(move |uri| RelationRef {
                    uri,
                    reason: reason.clone(),
                })
            })
            .collect())
    }

    /// Related URIs with their L0 and/or L1. Summaries that cannot be
    /// read come back empty.
    pub async fn relations_with_content(
        &self,
        uri: &str,
        include_l0: bool,
        include_l1: bool,
    ) -> Result<Vec<RelatedContent>> {
        let uris: Vec<String> = self
            .get_relation_table(uri)
            .await?
            .into_iter()
            .flat_map(|e| e.uris)
            .collect();
        if uris.is_empty() {
            return Ok(Vec::new());
        }

        let abstracts = if include_l0 {
            self.read_batch(&uris, Level::L0).await
        } else {
            Default::default()
        };
        let overviews = if include_l1 {
            self.read_batch(&uris, Level::L1).await
        } else {
            Default::default()
        };

        Ok(uris
            .into_iter()
            .map(|uri| RelatedContent {
                abstract_text: include_l0.then(|| abstracts.get(&uri).cloned().unwrap_or_default()),
                overview: include_l1.then(|| overviews.get(&uri).cloned().unwrap_or_default()),
                uri,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::vfs;
    use super::super::WriteContext;
    use super::*;
    use crate::objstore::ObjectStore;
    use serde_json::json;

    async fn nodes(vfs: &VikingFs) {
        for (uri, abs) in [
            ("viking://resources/a", "Node A."),
            ("viking://resources/b", "Node B."),
            ("viking://resources/c", "Node C."),
        ] {
            vfs.write_context(
                uri,
                WriteContext {
                    abstract_text: abs,
                    overview: "overview",
                    ..WriteContext::default()
                },
            )
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn test_link_ids_and_unlink() {
        let (_fs, vfs) = vfs().await;
        nodes(&vfs).await;
        let first = vfs
            .link(
                "viking://resources/a",
                vec!["viking://resources/b".into(), "viking://resources/c".into()],
                "same topic",
            )
            .await
            .unwrap();
        let second = vfs
            .link("viking://resources/a", vec!["viking://resources/c".into()], "cites")
            .await
            .unwrap();
        assert_eq!(first, "link_1");
        assert_eq!(second, "link_2");

        let rels = vfs.relations("viking://resources/a").await.unwrap();
        assert_eq!(rels.len(), 3);
        assert_eq!(rels[0].reason, "same topic");

        // First entry containing c loses it; the second keeps it.
        vfs.unlink("viking://resources/a", "viking://resources/c").await.unwrap();
        let table = vfs.get_relation_table("viking://resources/a").await.unwrap();
        assert_eq!(table[0].uris, vec!["viking://resources/b"]);
        assert_eq!(table[1].uris, vec!["viking://resources/c"]);

        vfs.unlink("viking://resources/a", "viking://resources/b").await.unwrap();
        let table = vfs.get_relation_table("viking://resources/a").await.unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table[0].id, "link_2");

        // Freed id is reused.
        let again = vfs
            .link("viking://resources/a", vec!["viking://resources/b".into()], "")
            .await
            .unwrap();
        assert_eq!(again, "link_1");
    }

    #[tokio::test]
    async fn test_unlink_unknown_is_noop() {
        let (_fs, vfs) = vfs().await;
        nodes(&vfs).await;
        vfs.unlink("viking://resources/a", "viking://resources/zzz")
            .await
            .unwrap();
        assert!(vfs.relations("viking://resources/a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_relations_with_content() {
        let (_fs, vfs) = vfs().await;
        nodes(&vfs).await;
        vfs.link(
            "viking://resources/a",
            vec!["viking://resources/b".into(), "viking://resources/gone".into()],
            "",
        )
        .await
        .unwrap();
        let related = vfs
            .relations_with_content("viking://resources/a", true, false)
            .await
            .unwrap();
        assert_eq!(related.len(), 2);
        assert_eq!(related[0].abstract_text.as_deref(), Some("Node B."));
        assert_eq!(related[1].abstract_text.as_deref(), Some(""));
        assert!(related[0].overview.is_none());
    }

    #[tokio::test]
    async fn test_reads_nested_layout() {
        let (fs, vfs) = vfs().await;
        nodes(&vfs).await;
        let nested = json!({
            "default": {
                "alice": [{"id": "link_1", "uris": ["viking://resources/b"], "reason": "old"}]
            }
        });
        fs.write(
            "/local/resources/a/.relations.json",
            nested.to_string().as_bytes(),
        )
        .await
        .unwrap();
        let rels = vfs.relations("viking://resources/a").await.unwrap();
        assert_eq!(
            rels,
            vec![RelationRef {
                uri: "viking://resources/b".into(),
                reason: "old".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_link_requires_directory() {
        let (_fs, vfs) = vfs().await;
        vfs.write("viking://resources/file.md", b"x").await.unwrap();
        assert!(vfs
            .link("viking://resources/file.md", vec!["viking://resources/a".into()], "")
            .await
            .is_err());
        assert!(vfs
            .link("viking://resources/missing", vec!["viking://resources/a".into()], "")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
