//! In-process [`ObjectStore`] for tests.
//!
//! Holds a flat `BTreeMap` of normalized paths. The root `/` always
//! exists. Writes and removals can be made to fail and reads to
//! return altered bytes, which is how lock rollback, marker
//! corruption, and partial deletes are exercised without a real disk.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{base_name, normalize_path, parent_path, ObjectEntry, ObjectStore};
use crate::error::{Result, VikingError};

#[derive(Clone)]
enum Node {
    Dir { mod_time: DateTime<Utc> },
    File { data: Vec<u8>, mod_time: DateTime<Utc> },
}

type WriteFault = Arc<dyn Fn(&str) -> bool + Send + Sync>;
type ReadTamper = Arc<dyn Fn(&str, Vec<u8>) -> Vec<u8> + Send + Sync>;

#[derive(Default)]
struct Faults {
    fail_write: Option<WriteFault>,
    fail_remove: Option<WriteFault>,
    tamper_read: Option<ReadTamper>,
}

pub struct MemoryFs {
    nodes: Mutex<BTreeMap<String, Node>>,
    faults: Mutex<Faults>,
}

impl Default for MemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "/".to_string(),
            Node::Dir {
                mod_time: Utc::now(),
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Fail every write whose path satisfies `predicate`.
    pub fn fail_writes_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_write = Some(Arc::new(predicate));
        }
    }

    /// Fail every `rm` whose path satisfies `predicate`.
    pub fn fail_removes_when<F>(&self, predicate: F)
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        if let Ok(mut faults) = self.faults.lock() {
            faults.fail_remove = Some(Arc::new(predicate));
        }
    }

    /// Pass every read through `tamper(path, bytes)`.
    pub fn tamper_reads_with<F>(&self, tamper: F)
    where
        F: Fn(&str, Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
    {
        if let Ok(mut faults) = self.faults.lock() {
            faults.tamper_read = Some(Arc::new(tamper));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            *faults = Faults::default();
        }
    }

    /// Every stored path, sorted. For assertions.
    pub fn paths(&self) -> Vec<String> {
        self.nodes
            .lock()
            .map(|n| n.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn nodes(&self) -> Result<MutexGuard<'_, BTreeMap<String, Node>>> {
        self.nodes
            .lock()
            .map_err(|_| VikingError::Backend("memory fs lock poisoned".into()))
    }

    fn write_fault(&self) -> Option<WriteFault> {
        self.faults.lock().ok().and_then(|f| f.fail_write.clone())
    }

    fn remove_fault(&self) -> Option<WriteFault> {
        self.faults.lock().ok().and_then(|f| f.fail_remove.clone())
    }

    fn read_tamper(&self) -> Option<ReadTamper> {
        self.faults.lock().ok().and_then(|f| f.tamper_read.clone())
    }
}

fn is_descendant(candidate: &str, dir: &str) -> bool {
    if dir == "/" {
        return candidate != "/";
    }
    candidate.len() > dir.len()
        && candidate.starts_with(dir)
        && candidate.as_bytes()[dir.len()] == b'/'
}

fn mkdir_all(nodes: &mut BTreeMap<String, Node>, path: &str) -> Result<()> {
    let mut current = String::new();
    for seg in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(seg);
        match nodes.get(&current) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(VikingError::InvalidArgument(format!(
                    "{} is a file, not a directory",
                    current
                )))
            }
            None => {
                nodes.insert(
                    current.clone(),
                    Node::Dir {
                        mod_time: Utc::now(),
                    },
                );
            }
        }
    }
    Ok(())
}

fn entry(path: &str, node: &Node) -> ObjectEntry {
    let (is_dir, size, mod_time) = match node {
        Node::Dir { mod_time } => (true, 0, *mod_time),
        Node::File { data, mod_time } => (false, data.len() as u64, *mod_time),
    };
    ObjectEntry {
        name: base_name(path).to_string(),
        path: path.to_string(),
        is_dir,
        size,
        mod_time,
    }
}

#[async_trait]
impl ObjectStore for MemoryFs {
    async fn stat(&self, path: &str) -> Result<ObjectEntry> {
        let norm = normalize_path(path)?;
        let nodes = self.nodes()?;
        match nodes.get(&norm) {
            Some(n) => Ok(entry(&norm, n)),
            None => Err(VikingError::NotFound(norm)),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let norm = normalize_path(path)?;
        let data = {
            let nodes = self.nodes()?;
            match nodes.get(&norm) {
                Some(Node::File { data, .. }) => data.clone(),
                Some(Node::Dir { .. }) => {
                    return Err(VikingError::InvalidArgument(format!(
                        "{} is a directory",
                        norm
                    )))
                }
                None => return Err(VikingError::NotFound(norm)),
            }
        };
        Ok(match self.read_tamper() {
            Some(tamper) => tamper(&norm, data),
            None => data,
        })
    }

    async fn write(&self, path: &str, data: &[u8]) -> Result<()> {
        let norm = normalize_path(path)?;
        if let Some(fault) = self.write_fault() {
            if fault(&norm) {
                return Err(VikingError::Backend(format!("injected write failure: {}", norm)));
            }
        }
        let mut nodes = self.nodes()?;
        if let Some(parent) = parent_path(&norm) {
            mkdir_all(&mut nodes, parent)?;
        }
        if let Some(Node::Dir { .. }) = nodes.get(&norm) {
            return Err(VikingError::InvalidArgument(format!("{} is a directory", norm)));
        }
        nodes.insert(
            norm,
            Node::File {
                data: data.to_vec(),
                mod_time: Utc::now(),
            },
        );
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let norm = normalize_path(path)?;
        let mut nodes = self.nodes()?;
        mkdir_all(&mut nodes, &norm)
    }

    async fn rm(&self, path: &str, recursive: bool) -> Result<()> {
        let norm = normalize_path(path)?;
        if let Some(fault) = self.remove_fault() {
            if fault(&norm) {
                return Err(VikingError::Backend(format!("injected remove failure: {}", norm)));
            }
        }
        let mut nodes = self.nodes()?;
        match nodes.get(&norm) {
            None => return Err(VikingError::NotFound(norm)),
            Some(Node::File { .. }) => {
                nodes.remove(&norm);
                return Ok(());
            }
            Some(Node::Dir { .. }) => {}
        }

        let descendants: Vec<String> = nodes
            .keys()
            .filter(|k| is_descendant(k, &norm))
            .cloned()
            .collect();
        if !descendants.is_empty() && !recursive {
            return Err(VikingError::InvalidArgument(format!(
                "directory not empty: {}",
                norm
            )));
        }
        for d in descendants {
            nodes.remove(&d);
        }
        if norm != "/" {
            nodes.remove(&norm);
        }
        Ok(())
    }

    async fn mv(&self, from: &str, to: &str) -> Result<()> {
        let from = normalize_path(from)?;
        let to = normalize_path(to)?;
        let mut nodes = self.nodes()?;
        if !nodes.contains_key(&from) {
            return Err(VikingError::NotFound(from));
        }
        if nodes.contains_key(&to) {
            return Err(VikingError::InvalidArgument(format!(
                "destination already exists: {}",
                to
            )));
        }
        if is_descendant(&to, &from) {
            return Err(VikingError::InvalidArgument(format!(
                "cannot move {} into itself",
                from
            )));
        }
        if let Some(parent) = parent_path(&to) {
            mkdir_all(&mut nodes, parent)?;
        }

        let moved: Vec<String> = nodes
            .keys()
            .filter(|k| **k == from || is_descendant(k, &from))
            .cloned()
            .collect();
        for old in moved {
            if let Some(node) = nodes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                nodes.insert(new, node);
            }
        }
        Ok(())
    }

    async fn ls(&self, path: &str) -> Result<Vec<ObjectEntry>> {
        let norm = normalize_path(path)?;
        let nodes = self.nodes()?;
        match nodes.get(&norm) {
            Some(Node::Dir { .. }) => {}
            Some(Node::File { .. }) => {
                return Err(VikingError::InvalidArgument(format!(
                    "{} is not a directory",
                    norm
                )))
            }
            None => return Err(VikingError::NotFound(norm)),
        }

        let mut out: Vec<ObjectEntry> = nodes
            .iter()
            .filter(|(k, _)| is_descendant(k, &norm) && parent_path(k) == Some(norm.as_str()))
            .map(|(k, n)| entry(k, n))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_creates_parents() {
        let fs = MemoryFs::new();
        fs.write("/a/b/c.txt", b"x").await.unwrap();
        assert!(fs.stat("/a/b").await.unwrap().is_dir);
        let names: Vec<String> = fs.ls("/a").await.unwrap().into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["b"]);
    }

    #[tokio::test]
    async fn test_rm_and_mv_subtrees() {
        let fs = MemoryFs::new();
        fs.write("/a/x/1", b"1").await.unwrap();
        fs.write("/ab/2", b"2").await.unwrap();
        fs.mv("/a", "/z/a").await.unwrap();
        assert_eq!(fs.read("/z/a/x/1").await.unwrap(), b"1");
        assert!(fs.exists("/ab/2").await.unwrap());

        fs.rm("/z", true).await.unwrap();
        assert!(!fs.exists("/z/a/x/1").await.unwrap());
        assert!(fs.exists("/ab/2").await.unwrap());
    }

    #[tokio::test]
    async fn test_walk_order() {
        let fs = MemoryFs::new();
        fs.write("/d/b", b"").await.unwrap();
        fs.write("/d/a/c", b"").await.unwrap();
        let paths: Vec<String> = fs.walk("/d").await.unwrap().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec!["/d/a", "/d/a/c", "/d/b"]);
    }

    #[tokio::test]
    async fn test_injected_faults() {
        let fs = MemoryFs::new();
        fs.fail_writes_when(|p| p.ends_with(".lock"));
        assert!(fs.write("/x.lock", b"t").await.is_err());
        fs.write("/x.txt", b"t").await.unwrap();

        fs.tamper_reads_with(|_, _| b"other".to_vec());
        assert_eq!(fs.read("/x.txt").await.unwrap(), b"other");
        fs.clear_faults();
        assert_eq!(fs.read("/x.txt").await.unwrap(), b"t");
    }
}
