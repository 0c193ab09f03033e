//! [`ObjectStore`] over a directory on the local disk.

use std::io::ErrorKind as IoKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use walkdir::WalkDir;

use super::{base_name, join_path, normalize_path, ObjectEntry, ObjectStore};
use crate::error::{Result, VikingError};

pub struct LocalFs {
    root: PathBuf,
}

impl LocalFs {
    /// Open (and create if needed) a store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Result<(String, PathBuf)> {
        let norm = normalize_path(path)?;
        let local = self.root.join(norm.trim_start_matches('/'));
        Ok((norm, local))
    }
}

fn not_found(path: &str, e: std::io::Error) -> VikingError {
    if e.kind() == IoKind::NotFound {
        VikingError::NotFound(path.to_string())
    } else {
        VikingError::Io(e)
    }
}

fn entry_from_metadata(path: String, meta: &std::fs::Metadata) -> ObjectEntry {
    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    ObjectEntry {
        name: base_name(&path).to_string(),
        is_dir: meta.is_dir(),
        size: if meta.is_dir() { 0 } else { meta.len() },
        mod_time,
        path,
    }
}

#[async_trait]
impl ObjectStore for LocalFs {
    async fn stat(&self, path: &str) -> Result<ObjectEntry> {
        let (norm, local) = self.resolve(path)?;
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(|e| not_found(&norm, e))?;
        Ok(entry_from_metadata(norm, &meta))
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let (norm, local) = self.resolve(path)?;
        tokio::fs::read(&local).await.map_err(|e| not_found(&norm, e))
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let (_, local) = self.resolve(path)?;
        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, data).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let (_, local) = self.resolve(path)?;
        tokio::fs::create_dir_all(&local).await?;
        Ok(())
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let (norm, local) = self.resolve(path)?;
        let meta = tokio::fs::metadata(&local)
            .await
            .map_err(|e| not_found(&norm, e))?;
        if meta.is_dir() {
            if recursive {
                tokio::fs::remove_dir_all(&local).await?;
            } else {
                tokio::fs::remove_dir(&local).await?;
            }
        } else {
            tokio::fs::remove_file(&local).await?;
        }
        Ok(())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        let (from_norm, from_local) = self.resolve(from)?;
        let (to_norm, to_local) = self.resolve(to)?;
        if !tokio::fs::try_exists(&from_local).await? {
            return Err(VikingError::NotFound(from_norm));
        }
        if tokio::fs::try_exists(&to_local).await? {
            return Err(VikingError::InvalidArgument(format!(
                "destination already exists: {}",
                to_norm
            )));
        }
        if let Some(parent) = to_local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&from_local, &to_local).await?;
        Ok(())
    }

    async fn ls(&self, path: &str) -> Result<Vec<ObjectEntry>> {
        let (norm, local) = self.resolve(path)?;
        let mut reader = tokio::fs::read_dir(&local)
            .await
            .map_err(|e| not_found(&norm, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = reader.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            let meta = entry.metadata().await?;
            entries.push(entry_from_metadata(join_path(&norm, &name), &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn walk(&self, path: &str) -> Result<Vec<ObjectEntry>> {
        let (norm, local) = self.resolve(path)?;
        if !tokio::fs::try_exists(&local).await? {
            return Err(VikingError::NotFound(norm));
        }

        tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            let walker = WalkDir::new(&local)
                .min_depth(1)
                .sort_by(|a, b| a.file_name().cmp(b.file_name()));
            for entry in walker {
                let entry = entry.map_err(|e| VikingError::Backend(e.to_string()))?;
                let rel = entry
                    .path()
                    .strip_prefix(&local)
                    .map_err(|e| VikingError::Backend(e.to_string()))?;
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/");
                let meta = entry
                    .metadata()
                    .map_err(|e| VikingError::Backend(e.to_string()))?;
                out.push(entry_from_metadata(join_path(&norm, &rel), &meta));
            }
            Ok::<_, VikingError>(out)
        })
        .await
        .map_err(|e| VikingError::Backend(format!("walk task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, LocalFs) {
        let tmp = TempDir::new().unwrap();
        let fs = LocalFs::new(tmp.path().join("fs")).unwrap();
        (tmp, fs)
    }

    #[tokio::test]
    async fn test_write_read_stat() {
        let (_tmp, fs) = store();
        fs.write("/local/a/b.md", b"hello").await.unwrap();
        assert_eq!(fs.read("/local/a/b.md").await.unwrap(), b"hello");
        let st = fs.stat("/local/a/b.md").await.unwrap();
        assert_eq!(st.name, "b.md");
        assert!(!st.is_dir);
        assert_eq!(st.size, 5);
        assert!(fs.stat("/local/a").await.unwrap().is_dir);
    }

    #[tokio::test]
    async fn test_missing_is_not_found() {
        let (_tmp, fs) = store();
        let err = fs.read("/local/nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!fs.exists("/local/nope").await.unwrap());
    }

    #[tokio::test]
    async fn test_ls_sorted_and_walk() {
        let (_tmp, fs) = store();
        fs.write("/d/b.txt", b"1").await.unwrap();
        fs.write("/d/a/x.txt", b"2").await.unwrap();
        let names: Vec<String> = fs.ls("/d").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b.txt"]);

        let paths: Vec<String> = fs.walk("/d").await.unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["/d/a", "/d/a/x.txt", "/d/b.txt"]);
    }

    #[tokio::test]
    async fn test_rm_requires_recursive_for_nonempty() {
        let (_tmp, fs) = store();
        fs.write("/d/f", b"1").await.unwrap();
        assert!(fs.rm("/d", false).await.is_err());
        fs.rm("/d", true).await.unwrap();
        assert!(!fs.exists("/d").await.unwrap());
    }

    #[tokio::test]
    async fn test_mv() {
        let (_tmp, fs) = store();
        fs.write("/a/f", b"1").await.unwrap();
        fs.mv("/a", "/b/a2").await.unwrap();
        assert_eq!(fs.read("/b/a2/f").await.unwrap(), b"1");
        assert!(!fs.exists("/a").await.unwrap());
    }

    #[tokio::test]
    async fn test_rejects_escape() {
        let (_tmp, fs) = store();
        assert!(fs.write("/../etc/passwd", b"x").await.is_err());
    }
}
