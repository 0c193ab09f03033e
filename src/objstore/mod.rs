//! Path-addressed byte store underneath the virtual filesystem.
//!
//! Paths are absolute, `/`-separated, and never contain `.` or `..`
//! segments (`/local/resources/docs/a.md`, `/transactions/{id}.json`).
//! A missing path is reported as [`VikingError::NotFound`].
//!
//! | Implementation | Backing |
//! |----------------|---------|
//! | [`LocalFs`] | a directory on disk (`tokio::fs`, `walkdir`) |
//! | [`MemoryFs`] | an in-process tree, with fault injection for tests |

pub mod local;
pub mod memory;

pub use local::LocalFs;
pub use memory::MemoryFs;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Result, VikingError};

/// Metadata for one object-store entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn stat(&self, path: &str) -> Result<ObjectEntry>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Write a file, creating missing parent directories.
    async fn write(&self, path: &str, data: &[u8]) -> Result<()>;

    /// Create a directory and any missing parents. Existing
    /// directories are not an error.
    async fn mkdir(&self, path: &str) -> Result<()>;

    /// Remove a file or directory. A non-empty directory needs
    /// `recursive`.
    async fn rm(&self, path: &str, recursive: bool) -> Result<()>;

    /// Rename `from` to `to`. `to` must not exist; its parent is
    /// created if missing.
    async fn mv(&self, from: &str, to: &str) -> Result<()>;

    /// Direct children of a directory, sorted by name.
    async fn ls(&self, path: &str) -> Result<Vec<ObjectEntry>>;

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_to_string(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes)
            .map_err(|_| VikingError::InvalidArgument(format!("{} is not valid UTF-8", path)))
    }

    /// Every descendant of `path` (not `path` itself), parents before
    /// children, siblings sorted by name.
    async fn walk(&self, path: &str) -> Result<Vec<ObjectEntry>> {
        let mut out = Vec::new();
        let mut stack = vec![path.to_string()];
        while let Some(dir) = stack.pop() {
            let children = self.ls(&dir).await?;
            let mut subdirs = Vec::new();
            for child in children {
                if child.is_dir {
                    subdirs.push(child.path.clone());
                }
                out.push(child);
            }
            stack.extend(subdirs.into_iter().rev());
        }
        Ok(out)
    }
}

/// Normalize and validate an object-store path.
pub fn normalize_path(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(VikingError::InvalidArgument(format!(
            "object path must be absolute: '{}'",
            path
        )));
    }
    let mut parts = Vec::new();
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        if seg == "." || seg == ".." {
            return Err(VikingError::InvalidArgument(format!(
                "object path must not contain relative segments: '{}'",
                path
            )));
        }
        parts.push(seg);
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Parent of a normalized path. `None` for `/`.
pub fn parent_path(path: &str) -> Option<&str> {
    if path == "/" {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&path[..idx]),
        None => None,
    }
}

/// Join a directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}

/// Last segment of a path.
pub fn base_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a//b/").unwrap(), "/a/b");
        assert_eq!(normalize_path("/").unwrap(), "/");
        assert!(normalize_path("a/b").is_err());
        assert!(normalize_path("/a/../b").is_err());
    }

    #[test]
    fn test_parent_and_join() {
        assert_eq!(parent_path("/a/b"), Some("/a"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(join_path("/", "a"), "/a");
        assert_eq!(join_path("/a", "b"), "/a/b");
        assert_eq!(base_name("/a/b.md"), "b.md");
    }
}
