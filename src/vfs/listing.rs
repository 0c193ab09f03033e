//! Directory listing, recursive trees, glob, and grep.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use globset::GlobBuilder;
use regex::RegexBuilder;
use serde::Serialize;
use tokio::sync::Semaphore;
use viking_store_core::uri::VikingUri;

use super::{parse_uri, VikingFs};
use crate::error::{Result, VikingError};
use crate::objstore::ObjectEntry;

const ABSTRACT_CONCURRENCY: usize = 6;
const ABSTRACT_NOT_READY: &str = "[.abstract.md is not ready]";

/// One listed node.
#[derive(Debug, Clone, Serialize)]
pub struct FsEntry {
    pub name: String,
    pub uri: String,
    /// Path relative to the listed directory.
    pub rel_path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: DateTime<Utc>,
    /// L0 of a directory when requested; empty for files.
    #[serde(rename = "abstract", skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
}

impl FsEntry {
    pub(super) fn from_object(obj: &ObjectEntry, name: String, uri: &VikingUri, rel_path: String) -> Self {
        Self {
            name,
            uri: uri.to_string(),
            rel_path,
            is_dir: obj.is_dir,
            size: obj.size,
            mod_time: obj.mod_time,
            abstract_text: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LsOptions {
    /// Include dot-files. Directories are always listed.
    pub show_hidden: bool,
    /// Attach each directory's L0.
    pub with_abstract: bool,
    /// Longer abstracts are cut and end in `...`.
    pub abstract_limit: usize,
}

impl Default for LsOptions {
    fn default() -> Self {
        Self {
            show_hidden: false,
            with_abstract: false,
            abstract_limit: 256,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreeOptions {
    pub show_hidden: bool,
    /// Stop after this many entries.
    pub node_limit: usize,
    pub with_abstract: bool,
    pub abstract_limit: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            show_hidden: false,
            node_limit: 1000,
            with_abstract: false,
            abstract_limit: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GrepMatch {
    pub uri: String,
    /// 1-based.
    pub line: usize,
    pub content: String,
}

fn visible(entry: &ObjectEntry, show_hidden: bool) -> bool {
    entry.is_dir || show_hidden || !entry.name.starts_with('.')
}

fn truncate_abstract(text: String, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text;
    }
    let mut cut: String = text.chars().take(limit.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

impl VikingFs {
    async fn child_entries(
        &self,
        dir_uri: &VikingUri,
        dir_path: &str,
        rel_prefix: &str,
        show_hidden: bool,
    ) -> Result<Vec<(FsEntry, String)>> {
        let names = self.read_names(dir_path).await?;
        let mut out = Vec::new();
        for obj in self.fs.ls(dir_path).await? {
            if !visible(&obj, show_hidden) {
                continue;
            }
            let name = Self::display_name(&names, &obj.name);
            let uri = dir_uri
                .join(&name)
                .map_err(|e| VikingError::InvalidUri(format!("{:#}", e)))?;
            let rel_path = if rel_prefix.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", rel_prefix, name)
            };
            out.push((FsEntry::from_object(&obj, name, &uri, rel_path), obj.path));
        }
        Ok(out)
    }

    /// Fill in directory abstracts, at most six reads at a time.
    async fn attach_abstracts(&self, entries: &mut [FsEntry], limit: usize) {
        let semaphore = Arc::new(Semaphore::new(ABSTRACT_CONCURRENCY));
        let fetched = join_all(entries.iter().map(|entry| {
            let semaphore = semaphore.clone();
            async move {
                if !entry.is_dir {
                    return String::new();
                }
                let _permit = semaphore.acquire().await;
                match self.abstract_text(&entry.uri).await {
                    Ok(text) => text,
                    Err(_) => ABSTRACT_NOT_READY.to_string(),
                }
            }
        }))
        .await;
        for (entry, text) in entries.iter_mut().zip(fetched) {
            entry.abstract_text = Some(truncate_abstract(text, limit));
        }
    }

    /// Direct children of a directory.
    pub async fn ls(&self, uri: &str, opts: LsOptions) -> Result<Vec<FsEntry>> {
        let parsed = parse_uri(uri)?;
        let path = self.path_of(&parsed);
        let mut entries: Vec<FsEntry> = self
            .child_entries(&parsed, &path, "", opts.show_hidden)
            .await?
            .into_iter()
            .map(|(e, _)| e)
            .collect();
        if opts.with_abstract {
            self.attach_abstracts(&mut entries, opts.abstract_limit).await;
        }
        Ok(entries)
    }

    /// Every descendant, depth first with parents before children.
    pub async fn tree(&self, uri: &str, opts: TreeOptions) -> Result<Vec<FsEntry>> {
        let parsed = parse_uri(uri)?;
        let path = self.path_of(&parsed);
        let mut out: Vec<FsEntry> = Vec::new();

        let top = self.child_entries(&parsed, &path, "", opts.show_hidden).await?;
        let mut stack = vec![top.into_iter()];
        while out.len() < opts.node_limit {
            let Some(level) = stack.last_mut() else {
                break;
            };
            let Some((entry, obj_path)) = level.next() else {
                stack.pop();
                continue;
            };
            if entry.is_dir {
                let dir_uri = parse_uri(&entry.uri)?;
                let children = self
                    .child_entries(&dir_uri, &obj_path, &entry.rel_path, opts.show_hidden)
                    .await?;
                out.push(entry);
                stack.push(children.into_iter());
            } else {
                out.push(entry);
            }
        }

        if opts.with_abstract {
            self.attach_abstracts(&mut out, opts.abstract_limit).await;
        }
        Ok(out)
    }

    /// URIs under `uri` whose relative path matches `pattern`.
    ///
    /// Patterns match from the right like shell globs on relative
    /// paths: `*.md` finds markdown files at any depth, `docs/*.md`
    /// only those directly inside a `docs` directory.
    pub async fn glob(&self, pattern: &str, uri: &str, node_limit: usize) -> Result<Vec<String>> {
        let anchored = if pattern.starts_with("**") {
            pattern.to_string()
        } else {
            format!("**/{}", pattern.trim_start_matches('/'))
        };
        let matcher = GlobBuilder::new(&anchored)
            .literal_separator(true)
            .build()
            .map_err(|e| VikingError::InvalidArgument(format!("bad glob '{}': {}", pattern, e)))?
            .compile_matcher();

        let entries = self
            .tree(
                uri,
                TreeOptions {
                    node_limit,
                    ..TreeOptions::default()
                },
            )
            .await?;
        Ok(entries
            .into_iter()
            .filter(|e| matcher.is_match(&e.rel_path))
            .map(|e| e.uri)
            .collect())
    }

    /// Lines matching `pattern` in every non-hidden file under `uri`.
    pub async fn grep(&self, uri: &str, pattern: &str, case_insensitive: bool) -> Result<Vec<GrepMatch>> {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|e| VikingError::InvalidArgument(format!("bad pattern '{}': {}", pattern, e)))?;
        let parsed = parse_uri(uri)?;
        let path = self.path_of(&parsed);

        let root = self.fs.stat(&path).await?;
        let files: Vec<String> = if root.is_dir {
            self.fs
                .walk(&path)
                .await?
                .into_iter()
                .filter(|e| !e.is_dir && !e.name.starts_with('.'))
                .map(|e| e.path)
                .collect()
        } else {
            vec![path]
        };

        let mut matches = Vec::new();
        for file in files {
            // Binary files are skipped.
            let Ok(text) = self.fs.read_to_string(&file).await else {
                continue;
            };
            let hits: Vec<(usize, &str)> = text
                .lines()
                .enumerate()
                .filter(|(_, line)| re.is_match(line))
                .collect();
            if hits.is_empty() {
                continue;
            }
            let file_uri = self.uri_of(&file).await?.to_string();
            for (idx, line) in hits {
                matches.push(GrepMatch {
                    uri: file_uri.clone(),
                    line: idx + 1,
                    content: line.to_string(),
                });
            }
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::vfs;
    use super::super::WriteContext;
    use super::*;
    use std::collections::BTreeMap;

    async fn sample(vfs: &VikingFs) {
        vfs.write("viking://resources/proj/README.md", b"# Project\nhello world\n")
            .await
            .unwrap();
        vfs.write("viking://resources/proj/src/main.rs", b"fn main() {}\n// Hello again\n")
            .await
            .unwrap();
        vfs.write("viking://resources/proj/docs/guide.md", b"guide text\n")
            .await
            .unwrap();
        vfs.write("viking://resources/proj/.hidden", b"hello hidden\n")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_ls_hides_dot_files_but_not_directories() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        let names: Vec<String> = vfs
            .ls("viking://resources/proj", LsOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["README.md", "docs", "src"]);

        let all = vfs
            .ls(
                "viking://resources/proj",
                LsOptions {
                    show_hidden: true,
                    ..LsOptions::default()
                },
            )
            .await
            .unwrap();
        assert!(all.iter().any(|e| e.name == ".hidden"));
    }

    #[tokio::test]
    async fn test_ls_missing_dir_is_not_found() {
        let (_fs, vfs) = vfs().await;
        let err = vfs
            .ls("viking://resources/none", LsOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_ls_with_abstracts() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        vfs.write_context(
            "viking://resources/proj/docs",
            WriteContext {
                abstract_text: &"x".repeat(40),
                ..WriteContext::default()
            },
        )
        .await
        .unwrap();
        let entries = vfs
            .ls(
                "viking://resources/proj",
                LsOptions {
                    with_abstract: true,
                    abstract_limit: 10,
                    ..LsOptions::default()
                },
            )
            .await
            .unwrap();
        let by_name: BTreeMap<_, _> = entries
            .iter()
            .map(|e| (e.name.as_str(), e.abstract_text.clone().unwrap()))
            .collect();
        assert_eq!(by_name["docs"], format!("{}...", "x".repeat(7)));
        assert_eq!(by_name["src"], ABSTRACT_NOT_READY.chars().take(7).collect::<String>() + "...");
        assert_eq!(by_name["README.md"], "");
    }

    #[tokio::test]
    async fn test_tree_is_preorder_with_rel_paths() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        let rels: Vec<String> = vfs
            .tree("viking://resources/proj", TreeOptions::default())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.rel_path)
            .collect();
        assert_eq!(
            rels,
            vec!["README.md", "docs", "docs/guide.md", "src", "src/main.rs"]
        );
    }

    #[tokio::test]
    async fn test_tree_node_limit() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        let entries = vfs
            .tree(
                "viking://resources/proj",
                TreeOptions {
                    node_limit: 2,
                    ..TreeOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(entries.len(), 2);
    }

    #[tokio::test]
    async fn test_glob() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        let md = vfs.glob("*.md", "viking://resources/proj", 1000).await.unwrap();
        assert_eq!(
            md,
            vec![
                "viking://resources/proj/README.md",
                "viking://resources/proj/docs/guide.md"
            ]
        );
        let rs = vfs.glob("src/*.rs", "viking://resources", 1000).await.unwrap();
        assert_eq!(rs, vec!["viking://resources/proj/src/main.rs"]);
        assert!(vfs.glob("[", "viking://resources", 10).await.is_err());
    }

    #[tokio::test]
    async fn test_grep() {
        let (_fs, vfs) = vfs().await;
        sample(&vfs).await;
        let hits = vfs.grep("viking://resources/proj", "hello", true).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.iter().all(|m| !m.uri.ends_with(".hidden")));
        let main = hits
            .iter()
            .find(|m| m.uri == "viking://resources/proj/src/main.rs")
            .unwrap();
        assert_eq!(main.line, 2);

        let sensitive = vfs.grep("viking://resources/proj", "hello", false).await.unwrap();
        assert_eq!(sensitive.len(), 1);

        let single = vfs
            .grep("viking://resources/proj/docs/guide.md", "guide", false)
            .await
            .unwrap();
        assert_eq!(single[0].uri, "viking://resources/proj/docs/guide.md");
    }
}
