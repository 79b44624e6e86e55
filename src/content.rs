//! Content items and the read-only index they live in.
//!
//! The index is produced by an external content loader that has already
//! parsed every definition file and resolved its dependencies. `retest` only
//! reads the resulting manifest:
//!
//! ```json
//! {
//!   "items": [
//!     {
//!       "id": "3f1a...",
//!       "path": "detections/endpoint/suspicious_cmd.yml",
//!       "dependencies": ["macros/security_content_ctime.yml"],
//!       "status": "production",
//!       "category": "TTP",
//!       "search": "| tstats count from datamodel=Endpoint.Processes"
//!     }
//!   ]
//! }
//! ```
//!
//! Relative paths are resolved against the content root so that every path
//! held by a [`ContentItem`] is absolute and directly comparable with the
//! paths produced by the change-set resolver.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle tag attached to every content item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentStatus {
    /// Shipped and supported.
    Production,
    /// Kept for compatibility, scheduled for removal.
    Deprecated,
    /// Not yet shipped.
    Experimental,
    /// Any status the loader does not classify.
    #[serde(other)]
    Other,
}

impl fmt::Display for ContentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ContentStatus::Production => "production",
            ContentStatus::Deprecated => "deprecated",
            ContentStatus::Experimental => "experimental",
            ContentStatus::Other => "other",
        };
        f.write_str(s)
    }
}

/// A single testable unit of content, typically a detection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ContentItem {
    /// Stable identifier assigned by the content loader.
    pub id: String,

    /// Location of the definition file.
    pub path: PathBuf,

    /// Definition files this item requires (macros, lookups).
    #[serde(default)]
    pub dependencies: BTreeSet<PathBuf>,

    /// Lifecycle tag.
    pub status: ContentStatus,

    /// Analytic category (e.g. `TTP`, `Hunting`), if the loader provides one.
    #[serde(default)]
    pub category: Option<String>,

    /// Query the target application runs to test this item.
    #[serde(default)]
    pub search: Option<String>,
}

impl ContentItem {
    /// Creates a production item with no dependencies.
    pub fn new(id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            dependencies: BTreeSet::new(),
            status: ContentStatus::Production,
            category: None,
            search: None,
        }
    }

    /// Adds a dependency path.
    pub fn with_dependency(mut self, path: impl Into<PathBuf>) -> Self {
        self.dependencies.insert(path.into());
        self
    }

    /// Sets the lifecycle tag.
    pub fn with_status(mut self, status: ContentStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the analytic category.
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Sets the test query.
    pub fn with_search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Returns `true` if any declared dependency is in `changed`.
    pub fn depends_on_any(&self, changed: &BTreeSet<PathBuf>) -> bool {
        !self.dependencies.is_disjoint(changed)
    }

    /// Short display name (file stem), falling back to the id.
    pub fn name(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Caller-defined exclusions applied after every selection mode.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ContentFilter {
    /// Statuses that are never tested.
    #[serde(default)]
    pub exclude_statuses: BTreeSet<ContentStatus>,

    /// Categories that are never tested (case-insensitive).
    #[serde(default)]
    pub exclude_categories: BTreeSet<String>,
}

impl ContentFilter {
    /// Returns `true` if `item` should be tested.
    pub fn admits(&self, item: &ContentItem) -> bool {
        if self.exclude_statuses.contains(&item.status) {
            return false;
        }
        match &item.category {
            Some(category) => !self
                .exclude_categories
                .iter()
                .any(|c| c.eq_ignore_ascii_case(category)),
            None => true,
        }
    }
}

#[derive(Deserialize)]
struct Manifest {
    items: Vec<ContentItem>,
}

/// Read-only view of all loaded content, keyed by absolute path.
///
/// Iteration is always in path order.
#[derive(Debug, Clone, Default)]
pub struct ContentIndex {
    items: BTreeMap<PathBuf, Vec<ContentItem>>,
}

impl ContentIndex {
    /// Builds an index from already-loaded items.
    ///
    /// Items sharing a path are kept side by side so that selection can
    /// report the ambiguity instead of silently picking one.
    pub fn new(items: impl IntoIterator<Item = ContentItem>) -> Self {
        let mut map: BTreeMap<PathBuf, Vec<ContentItem>> = BTreeMap::new();
        for item in items {
            map.entry(item.path.clone()).or_default().push(item);
        }
        Self { items: map }
    }

    /// Loads a JSON manifest, resolving relative paths against `root`.
    pub fn load(manifest: &Path, root: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(manifest)
            .with_context(|| format!("Failed to read content manifest: {}", manifest.display()))?;
        Self::from_json(&content, root)
            .with_context(|| format!("Failed to parse content manifest: {}", manifest.display()))
    }

    /// Parses a JSON manifest string, resolving relative paths against `root`.
    pub fn from_json(content: &str, root: &Path) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(content)?;
        let items = manifest.items.into_iter().map(|mut item| {
            item.path = absolutize(root, &item.path);
            item.dependencies = item
                .dependencies
                .iter()
                .map(|dep| absolutize(root, dep))
                .collect();
            item
        });
        Ok(Self::new(items))
    }

    /// Total number of items.
    pub fn len(&self) -> usize {
        self.items.values().map(Vec::len).sum()
    }

    /// Returns `true` if the index holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterates all items in path order.
    pub fn iter(&self) -> impl Iterator<Item = &ContentItem> {
        self.items.values().flatten()
    }

    /// Every item whose path equals `path`.
    pub fn matching(&self, path: &Path) -> &[ContentItem] {
        self.items.get(path).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Joins `path` onto `root` unless it is already absolute, then folds `.`
/// and `..` components lexically.
///
/// Symlinks are not followed, so the result can be compared against index
/// keys without touching the filesystem.
pub fn absolutize(root: &Path, path: &Path) -> PathBuf {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    };

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root; a leading `..` on a
                // relative root is kept.
                match normalized.components().next_back() {
                    Some(Component::Normal(_)) => {
                        normalized.pop();
                    }
                    Some(Component::RootDir | Component::Prefix(_)) => {}
                    _ => normalized.push(".."),
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}
