//! `viking://` URI parsing and the URI ↔ object-store path mapping.
//!
//! # Scheme
//!
//! ```text
//! viking://<scope>/<segment>/<segment>/...
//! ```
//!
//! | Scope | Holds |
//! |-------|-------|
//! | `user` | per-user memories and sessions |
//! | `agent` | agent memories and skills |
//! | `resources` | ingested documents and code |
//! | `temp` | scratch trees, deleted by the caller |
//!
//! Every URI maps to `/local/<scope>/<segment>/...` in the object
//! store. A segment whose UTF-8 encoding exceeds [`MAX_SEGMENT_BYTES`]
//! is shortened to a prefix plus `_` and the first 8 hex characters of
//! the SHA-256 of the full segment. The shortening is one-way: the
//! object store keeps a `{short → original}` table next to the
//! shortened entry, and [`path_to_uri_with`] consults it.

use std::borrow::Cow;
use std::fmt;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SCHEME: &str = "viking://";

/// Scopes accepted as the first URI segment.
pub const SCOPES: [&str; 4] = ["user", "agent", "resources", "temp"];

/// Object-store prefix every URI maps under.
pub const LOCAL_ROOT: &str = "/local";

/// Filename length limit most filesystems enforce.
pub const MAX_SEGMENT_BYTES: usize = 255;

const HASH_SUFFIX_HEX: usize = 8;

/// A validated `viking://` URI.
///
/// Stored in normalized form: no trailing slash, no empty segments.
/// The root `viking://` is valid and has no scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VikingUri {
    segments: Vec<String>,
}

impl VikingUri {
    /// The root URI, `viking://`.
    pub fn root() -> Self {
        Self {
            segments: Vec::new(),
        }
    }

    /// Parse and normalize a URI string.
    ///
    /// Rejects a missing scheme, an unknown scope, and `.`/`..`
    /// segments.
    pub fn parse(raw: &str) -> Result<Self> {
        let Some(rest) = raw.strip_prefix(SCHEME) else {
            bail!("invalid URI '{}': must start with {}", raw, SCHEME);
        };

        let segments: Vec<String> = rest
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if let Some(scope) = segments.first() {
            if !SCOPES.contains(&scope.as_str()) {
                bail!(
                    "invalid URI '{}': unknown scope '{}' (expected one of {})",
                    raw,
                    scope,
                    SCOPES.join(", ")
                );
            }
        }
        for seg in &segments {
            if seg == "." || seg == ".." {
                bail!("invalid URI '{}': relative segment '{}'", raw, seg);
            }
        }

        Ok(Self { segments })
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn scope(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Last segment, or `""` for the root.
    pub fn name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or("")
    }

    /// Immediate ancestor. `None` for the root.
    pub fn parent(&self) -> Option<VikingUri> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    /// Append a relative path (may contain `/`).
    pub fn join(&self, rel: &str) -> Result<VikingUri> {
        let joined = if self.is_root() {
            format!("{}{}", SCHEME, rel.trim_start_matches('/'))
        } else {
            format!("{}/{}", self, rel.trim_start_matches('/'))
        };
        Self::parse(&joined)
    }

    /// True if `self` equals `other` or lies beneath it.
    pub fn starts_with(&self, other: &VikingUri) -> bool {
        self.segments.len() >= other.segments.len()
            && self.segments[..other.segments.len()] == other.segments[..]
    }

    /// Rebase `self` from under `from` to under `to`.
    ///
    /// Returns `None` when `self` is not beneath `from`.
    pub fn rebase(&self, from: &VikingUri, to: &VikingUri) -> Option<VikingUri> {
        if !self.starts_with(from) {
            return None;
        }
        let mut segments = to.segments.clone();
        segments.extend_from_slice(&self.segments[from.segments.len()..]);
        Some(Self { segments })
    }
}

impl fmt::Display for VikingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", SCHEME, self.segments.join("/"))
    }
}

impl std::str::FromStr for VikingUri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VikingUri {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<VikingUri> for String {
    fn from(value: VikingUri) -> Self {
        value.to_string()
    }
}

/// Shorten a segment that exceeds [`MAX_SEGMENT_BYTES`].
///
/// The result is `{prefix}_{hash8}` where `prefix` is cut at a char
/// boundary so the whole result fits the limit. Short segments are
/// returned unchanged.
pub fn shorten_segment(segment: &str) -> Cow<'_, str> {
    if segment.len() <= MAX_SEGMENT_BYTES {
        return Cow::Borrowed(segment);
    }

    let digest = hex::encode(Sha256::digest(segment.as_bytes()));
    let budget = MAX_SEGMENT_BYTES - HASH_SUFFIX_HEX - 1;
    let mut cut = budget;
    while !segment.is_char_boundary(cut) {
        cut -= 1;
    }

    Cow::Owned(format!("{}_{}", &segment[..cut], &digest[..HASH_SUFFIX_HEX]))
}

/// Whether `segment` has the exact shape [`shorten_segment`] produces.
///
/// Only such segments can have an original name recorded elsewhere;
/// anything else maps back to itself.
pub fn is_shortened_form(segment: &str) -> bool {
    let min_len = MAX_SEGMENT_BYTES - HASH_SUFFIX_HEX - 1 - 3 + HASH_SUFFIX_HEX + 1;
    if segment.len() < min_len || segment.len() > MAX_SEGMENT_BYTES {
        return false;
    }
    let bytes = segment.as_bytes();
    let suffix_at = bytes.len() - HASH_SUFFIX_HEX;
    bytes[suffix_at - 1] == b'_'
        && bytes[suffix_at..]
            .iter()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(b))
}

/// One segment that [`uri_to_path`] had to shorten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShortenedSegment {
    /// Object-store path of the directory holding the entry.
    pub parent_path: String,
    pub short: String,
    pub original: String,
}

/// Result of mapping a URI into the object store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub path: String,
    pub shortened: Vec<ShortenedSegment>,
}

/// Map a URI to its object-store path.
pub fn uri_to_path(uri: &VikingUri) -> PathMapping {
    let mut path = String::from(LOCAL_ROOT);
    let mut shortened = Vec::new();

    for seg in uri.segments() {
        let short = shorten_segment(seg);
        if let Cow::Owned(ref s) = short {
            shortened.push(ShortenedSegment {
                parent_path: path.clone(),
                short: s.clone(),
                original: seg.clone(),
            });
        }
        path.push('/');
        path.push_str(&short);
    }

    PathMapping { path, shortened }
}

/// Map an object-store path back to a URI, taking segments verbatim.
pub fn path_to_uri(path: &str) -> Result<VikingUri> {
    path_to_uri_with(path, |_, _| None)
}

/// Map an object-store path back to a URI.
///
/// `lookup(parent_path, segment)` returns the original name for a
/// shortened segment; `None` keeps the segment as is.
pub fn path_to_uri_with<F>(path: &str, lookup: F) -> Result<VikingUri>
where
    F: Fn(&str, &str) -> Option<String>,
{
    let Some(rest) = path.strip_prefix(LOCAL_ROOT) else {
        bail!("path '{}' is not under {}", path, LOCAL_ROOT);
    };
    if !rest.is_empty() && !rest.starts_with('/') {
        bail!("path '{}' is not under {}", path, LOCAL_ROOT);
    }

    let mut parent_path = String::from(LOCAL_ROOT);
    let mut segments = Vec::new();
    for seg in rest.split('/').filter(|s| !s.is_empty()) {
        let original = lookup(&parent_path, seg).unwrap_or_else(|| seg.to_string());
        segments.push(original);
        parent_path.push('/');
        parent_path.push_str(seg);
    }

    VikingUri::parse(&format!("{}{}", SCHEME, segments.join("/")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_normalizes() {
        let uri = VikingUri::parse("viking://resources//docs/").unwrap();
        assert_eq!(uri.to_string(), "viking://resources/docs");
        assert_eq!(uri.scope(), Some("resources"));
        assert_eq!(uri.name(), "docs");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(VikingUri::parse("http://resources").is_err());
        assert!(VikingUri::parse("viking://nowhere/x").is_err());
        assert!(VikingUri::parse("viking://resources/../x").is_err());
    }

    #[test]
    fn test_root() {
        let root = VikingUri::parse("viking://").unwrap();
        assert!(root.is_root());
        assert_eq!(root.parent(), None);
        assert_eq!(uri_to_path(&root).path, "/local");
        assert_eq!(path_to_uri("/local").unwrap(), root);
    }

    #[test]
    fn test_parent_and_join() {
        let uri = VikingUri::parse("viking://user/memories/prefs").unwrap();
        assert_eq!(uri.parent().unwrap().to_string(), "viking://user/memories");
        let child = uri.join("a/b.md").unwrap();
        assert_eq!(child.to_string(), "viking://user/memories/prefs/a/b.md");
        assert!(child.starts_with(&uri));
        assert!(!uri.starts_with(&child));
    }

    #[test]
    fn test_rebase() {
        let from = VikingUri::parse("viking://resources/a").unwrap();
        let to = VikingUri::parse("viking://resources/b").unwrap();
        let node = VikingUri::parse("viking://resources/a/x/y.md").unwrap();
        assert_eq!(
            node.rebase(&from, &to).unwrap().to_string(),
            "viking://resources/b/x/y.md"
        );
        let other = VikingUri::parse("viking://resources/ab").unwrap();
        assert!(other.rebase(&from, &to).is_none());
    }

    #[test]
    fn test_short_segment_unchanged() {
        assert_eq!(shorten_segment("readme.md"), "readme.md");
    }

    #[test]
    fn test_long_segment_shortened() {
        let long = "é".repeat(200);
        let short = shorten_segment(&long);
        assert!(short.len() <= MAX_SEGMENT_BYTES);
        assert_ne!(short, long.as_str());
        let digest = hex::encode(Sha256::digest(long.as_bytes()));
        assert!(short.ends_with(&format!("_{}", &digest[..8])));
        assert_eq!(shorten_segment(&long), short);
    }

    #[test]
    fn test_distinct_long_segments_map_distinct() {
        let a = format!("{}a", "x".repeat(300));
        let b = format!("{}b", "x".repeat(300));
        assert_ne!(shorten_segment(&a), shorten_segment(&b));
    }

    #[test]
    fn test_long_segment_round_trip_with_name_table() {
        let long = "n".repeat(400);
        let uri = VikingUri::parse(&format!("viking://resources/docs/{}", long)).unwrap();
        let mapping = uri_to_path(&uri);
        assert_eq!(mapping.shortened.len(), 1);
        assert_eq!(mapping.shortened[0].parent_path, "/local/resources/docs");

        let table: HashMap<(String, String), String> = mapping
            .shortened
            .iter()
            .map(|s| ((s.parent_path.clone(), s.short.clone()), s.original.clone()))
            .collect();
        let back = path_to_uri_with(&mapping.path, |parent, seg| {
            table.get(&(parent.to_string(), seg.to_string())).cloned()
        })
        .unwrap();
        assert_eq!(back, uri);

        // Without the table the hash is never decoded.
        let lossy = path_to_uri(&mapping.path).unwrap();
        assert_ne!(lossy, uri);
    }

    #[test]
    fn test_shortened_form_detection() {
        assert!(is_shortened_form(&shorten_segment(&"q".repeat(500))));
        assert!(is_shortened_form(&shorten_segment(&"é".repeat(300))));
        assert!(!is_shortened_form("notes_deadbeef"));
        assert!(!is_shortened_form(&"z".repeat(255)));
    }

    #[test]
    fn test_serde_as_string() {
        let uri = VikingUri::parse("viking://agent/skills").unwrap();
        let json = serde_json::to_string(&uri).unwrap();
        assert_eq!(json, "\"viking://agent/skills\"");
        let back: VikingUri = serde_json::from_str(&json).unwrap();
        assert_eq!(back, uri);
    }
}
