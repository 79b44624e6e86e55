//! Selection of the content to test.
//!
//! The resolver turns a [`SelectionMode`] into an ordered list of
//! [`ContentItem`]s:
//!
//! | Mode | Source |
//! |------|--------|
//! | `all` | Every item in the index |
//! | `selected` | An explicit list of definition files |
//! | `changed` | A git diff plus the single-hop dependency closure |
//!
//! Whatever the mode, exclusion filters are applied afterwards and the
//! result is de-duplicated and sorted by path, so two runs over the same
//! inputs always dispatch jobs in the same order.
//!
//! # Dependency closure
//!
//! In `changed` mode an item is selected when its own definition changed or
//! when one of its declared dependencies changed. Dependencies of
//! dependencies are not followed: a macro that uses another macro does not
//! pull in the detections of the inner macro.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::content::{ContentFilter, ContentIndex, ContentItem, absolutize};
use crate::vcs::{ChangeType, FileChange, VcsError, VersionControl};

/// Errors that abort a run before any instance is provisioned.
#[derive(Debug, thiserror::Error)]
pub enum SelectionError {
    /// A requested path matched more than one item.
    #[error("Multiple content items found when resolving {}", .0.display())]
    AmbiguousSelection(PathBuf),

    /// Requested paths matched nothing. Every unmatched path is listed.
    #[error("Failed to find the following content file(s) for testing:{}", format_paths(.0))]
    MissingContent(Vec<PathBuf>),

    /// `selected` mode with nothing to select.
    #[error("Selection mode 'selected' requires at least one content path")]
    EmptySelection,

    /// The mode string is not one of `all`, `selected`, `changed`.
    #[error("Unsupported selection mode '{0}' (expected all, selected or changed)")]
    UnsupportedMode(String),

    /// `changed` mode without a base or test branch.
    #[error("Selection mode 'changed' requires a version control target and test branch")]
    MissingVersionControl,

    /// The two revisions share no history.
    #[error("Branches '{base}' and '{test}' do not share a common ancestor")]
    NoCommonAncestor {
        /// Base revision.
        base: String,
        /// Revision under test.
        test: String,
    },

    /// The version-control collaborator failed.
    #[error(transparent)]
    Vcs(#[from] VcsError),
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("\n\t - {}", p.display()))
        .collect()
}

/// How content to test is chosen. Fixed for the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionMode {
    /// Every item in the index.
    All,
    /// An explicit list of paths.
    Selected,
    /// Items changed between two revisions, plus their dependents.
    #[serde(alias = "changes")]
    Changed,
}

impl FromStr for SelectionMode {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(SelectionMode::All),
            "selected" => Ok(SelectionMode::Selected),
            "changed" | "changes" => Ok(SelectionMode::Changed),
            _ => Err(SelectionError::UnsupportedMode(s.to_string())),
        }
    }
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionMode::All => "all",
            SelectionMode::Selected => "selected",
            SelectionMode::Changed => "changed",
        };
        f.write_str(s)
    }
}

/// Directory conventions of the content repository.
///
/// All directories are relative to the repository root.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentLayout {
    /// Directories holding testable content.
    #[serde(default = "default_detection_dirs")]
    pub detection_dirs: Vec<PathBuf>,

    /// Directories holding dependencies (macros, lookups).
    #[serde(default = "default_dependency_dirs")]
    pub dependency_dirs: Vec<PathBuf>,

    /// Dependency directories whose data files have a companion definition.
    #[serde(default = "default_lookup_dirs")]
    pub lookup_dirs: Vec<PathBuf>,

    /// Extension of lookup data files.
    #[serde(default = "default_lookup_data_extension")]
    pub lookup_data_extension: String,

    /// Extension of definition files.
    #[serde(default = "default_definition_extension")]
    pub definition_extension: String,
}

fn default_detection_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("detections")]
}

fn default_dependency_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("macros"), PathBuf::from("lookups")]
}

fn default_lookup_dirs() -> Vec<PathBuf> {
    vec![PathBuf::from("lookups")]
}

fn default_lookup_data_extension() -> String {
    "csv".to_string()
}

fn default_definition_extension() -> String {
    "yml".to_string()
}

impl Default for ContentLayout {
    fn default() -> Self {
        Self {
            detection_dirs: default_detection_dirs(),
            dependency_dirs: default_dependency_dirs(),
            lookup_dirs: default_lookup_dirs(),
            lookup_data_extension: default_lookup_data_extension(),
            definition_extension: default_definition_extension(),
        }
    }
}

impl ContentLayout {
    /// Every directory that can influence test selection.
    pub fn content_dirs(&self) -> Vec<PathBuf> {
        let dirs: BTreeSet<&PathBuf> = self
            .detection_dirs
            .iter()
            .chain(&self.dependency_dirs)
            .chain(&self.lookup_dirs)
            .collect();
        dirs.into_iter().cloned().collect()
    }

    fn is_detection(&self, path: &Path) -> bool {
        self.detection_dirs.iter().any(|d| path.starts_with(d))
    }

    fn is_dependency(&self, path: &Path) -> bool {
        self.dependency_dirs
            .iter()
            .chain(&self.lookup_dirs)
            .any(|d| path.starts_with(d))
    }

    /// Maps a lookup data file to its definition; other paths pass through.
    fn normalize_dependency(&self, path: &Path) -> PathBuf {
        let is_lookup = self.lookup_dirs.iter().any(|d| path.starts_with(d));
        let is_data = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case(&self.lookup_data_extension));
        if is_lookup && is_data {
            path.with_extension(&self.definition_extension)
        } else {
            path.to_path_buf()
        }
    }
}

/// Files that differ between two revisions, grouped by kind of change.
///
/// Paths are repository-relative.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Newly added files.
    pub added: BTreeSet<PathBuf>,
    /// Modified files.
    pub modified: BTreeSet<PathBuf>,
    /// Deleted files.
    pub deleted: BTreeSet<PathBuf>,
    /// Rename targets.
    pub renamed: BTreeSet<PathBuf>,
}

impl ChangeSet {
    /// Groups diff entries by change type.
    pub fn from_changes(changes: impl IntoIterator<Item = FileChange>) -> Self {
        let mut set = ChangeSet::default();
        for change in changes {
            let bucket = match change.change_type {
                ChangeType::Added => &mut set.added,
                ChangeType::Modified => &mut set.modified,
                ChangeType::Deleted => &mut set.deleted,
                ChangeType::Renamed => &mut set.renamed,
            };
            bucket.insert(change.path);
        }
        set
    }

    /// Treats `paths` as added files.
    pub fn with_added(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.added.extend(paths);
        self
    }

    /// Total number of changed files.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len() + self.renamed.len()
    }

    /// Returns `true` if nothing changed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Changed dependency definitions, absolute under `root`.
    ///
    /// Only additions and modifications count; lookup data files are
    /// replaced by their definition file.
    pub fn changed_dependencies(&self, layout: &ContentLayout, root: &Path) -> BTreeSet<PathBuf> {
        self.added
            .iter()
            .chain(&self.modified)
            .filter(|p| layout.is_dependency(p))
            .map(|p| absolutize(root, &layout.normalize_dependency(p)))
            .collect()
    }

    /// Changed detection definitions, absolute under `root`.
    ///
    /// Additions, modifications and rename targets count.
    pub fn changed_detections(&self, layout: &ContentLayout, root: &Path) -> BTreeSet<PathBuf> {
        self.added
            .iter()
            .chain(&self.modified)
            .chain(&self.renamed)
            .filter(|p| layout.is_detection(p))
            .map(|p| absolutize(root, p))
            .collect()
    }
}

/// The two revisions compared in `changed` mode.
#[derive(Debug, Clone, Default)]
pub struct ChangeRange {
    /// Branch the changes will be merged into.
    pub base_branch: Option<String>,
    /// Branch under test.
    pub test_branch: Option<String>,
    /// Remote prefix for the base branch (e.g. `origin`).
    pub remote: Option<String>,
    /// Whether untracked files count as added.
    pub include_untracked: bool,
}

impl ChangeRange {
    /// Compares `base` with `test` using local refs.
    pub fn new(base: impl Into<String>, test: impl Into<String>) -> Self {
        Self {
            base_branch: Some(base.into()),
            test_branch: Some(test.into()),
            remote: None,
            include_untracked: false,
        }
    }

    fn base_ref(&self, base: &str) -> String {
        match &self.remote {
            Some(remote) if !remote.is_empty() => format!("{remote}/{base}"),
            _ => base.to_string(),
        }
    }
}

/// Computes the content to test for a run.
pub struct ChangeSetResolver<'a, V> {
    vcs: Option<&'a V>,
    root: PathBuf,
    layout: ContentLayout,
    filter: ContentFilter,
}

impl<'a, V: VersionControl> ChangeSetResolver<'a, V> {
    /// Creates a resolver for content rooted at `root`.
    ///
    /// `vcs` is only consulted in `changed` mode.
    pub fn new(vcs: Option<&'a V>, root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            root: root.into(),
            layout: ContentLayout::default(),
            filter: ContentFilter::default(),
        }
    }

    /// Overrides the directory conventions.
    pub fn with_layout(mut self, layout: ContentLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Sets the exclusion filter applied after every mode.
    pub fn with_filter(mut self, filter: ContentFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Resolves `mode` to a de-duplicated, path-sorted list of items.
    ///
    /// # Errors
    ///
    /// Any [`SelectionError`]; all of them are fatal for the run.
    pub async fn resolve(
        &self,
        mode: SelectionMode,
        index: &ContentIndex,
        range: &ChangeRange,
        explicit_paths: &[PathBuf],
    ) -> Result<Vec<ContentItem>, SelectionError> {
        let selected = match mode {
            SelectionMode::All => index.iter().cloned().collect(),
            SelectionMode::Selected => self.resolve_selected(index, explicit_paths)?,
            SelectionMode::Changed => self.resolve_changed(index, range).await?,
        };

        let before = selected.len();
        let mut items: Vec<ContentItem> = selected
            .into_iter()
            .filter(|item| self.filter.admits(item))
            .collect();
        items.sort_by(|a, b| a.path.cmp(&b.path).then_with(|| a.id.cmp(&b.id)));
        items.dedup_by(|a, b| a.path == b.path && a.id == b.id);

        // Jobs and their outcomes are keyed by path.
        if let Some(pair) = items.windows(2).find(|pair| pair[0].path == pair[1].path) {
            return Err(SelectionError::AmbiguousSelection(pair[0].path.clone()));
        }

        if items.len() < before {
            debug!("Excluded {} item(s) by filter", before - items.len());
        }
        info!("Selected {} content item(s) in '{}' mode", items.len(), mode);
        Ok(items)
    }

    fn resolve_selected(
        &self,
        index: &ContentIndex,
        explicit_paths: &[PathBuf],
    ) -> Result<Vec<ContentItem>, SelectionError> {
        if explicit_paths.is_empty() {
            return Err(SelectionError::EmptySelection);
        }

        let requested: BTreeSet<PathBuf> = explicit_paths
            .iter()
            .map(|p| absolutize(&self.root, p))
            .collect();

        let mut found = Vec::with_capacity(requested.len());
        let mut missing = Vec::new();
        for path in requested {
            match index.matching(&path) {
                [] => missing.push(path),
                [item] => found.push(item.clone()),
                _ => return Err(SelectionError::AmbiguousSelection(path)),
            }
        }

        if !missing.is_empty() {
            return Err(SelectionError::MissingContent(missing));
        }
        Ok(found)
    }

    async fn resolve_changed(
        &self,
        index: &ContentIndex,
        range: &ChangeRange,
    ) -> Result<Vec<ContentItem>, SelectionError> {
        let (Some(vcs), Some(base), Some(test)) =
            (self.vcs, &range.base_branch, &range.test_branch)
        else {
            return Err(SelectionError::MissingVersionControl);
        };

        let base_ref = range.base_ref(base);
        let base_commit = vcs.commit(&base_ref).await?;
        let test_commit = vcs.commit(test).await?;

        let ancestor = vcs
            .merge_base(&base_commit, &test_commit)
            .await?
            .ok_or_else(|| SelectionError::NoCommonAncestor {
                base: base_ref.clone(),
                test: test.clone(),
            })?;
        debug!("Merge base of {} and {} is {}", base_ref, test, ancestor);

        let content_dirs = self.layout.content_dirs();
        let changes = vcs.diff(&ancestor, &test_commit, &content_dirs).await?;
        let mut change_set = ChangeSet::from_changes(changes);

        if range.include_untracked {
            let untracked = vcs.untracked_files().await?;
            change_set = change_set.with_added(
                untracked
                    .into_iter()
                    .filter(|p| content_dirs.iter().any(|d| p.starts_with(d))),
            );
        }

        info!(
            "{} file(s) changed between {} and {}",
            change_set.len(),
            base_ref,
            test
        );
        Ok(select_changed(index, &change_set, &self.layout, &self.root))
    }
}

/// Applies a change set to the index: changed detections plus every item
/// declaring a changed dependency.
pub fn select_changed(
    index: &ContentIndex,
    change_set: &ChangeSet,
    layout: &ContentLayout,
    root: &Path,
) -> Vec<ContentItem> {
    let changed_dependencies = change_set.changed_dependencies(layout, root);
    let mut changed_detections = change_set.changed_detections(layout, root);

    for item in index.iter() {
        if !changed_detections.contains(&item.path) && item.depends_on_any(&changed_dependencies) {
            debug!("{} selected through a changed dependency", item.path.display());
            changed_detections.insert(item.path.clone());
        }
    }

    changed_detections
        .iter()
        .flat_map(|path| {
            let matching = index.matching(path);
            if matching.is_empty() {
                debug!("Changed file {} is not in the content index", path.display());
            }
            matching.iter().cloned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use async_trait::async_trait;

    use super::*;
    use crate::content::ContentStatus;
    use crate::vcs::{CommitHandle, VcsResult};

    const ROOT: &str = "/repo";

    /// In-memory repository: refs map to commits, one diff, optional ancestor.
    struct FakeVcs {
        refs: HashMap<String, String>,
        ancestor: Option<String>,
        changes: Vec<FileChange>,
        untracked: Vec<PathBuf>,
    }

    impl FakeVcs {
        fn new(changes: Vec<FileChange>) -> Self {
            let refs = [
                ("origin/develop".to_string(), "base".to_string()),
                ("feature".to_string(), "head".to_string()),
            ]
            .into_iter()
            .collect();
            Self {
                refs,
                ancestor: Some("base".to_string()),
                changes,
                untracked: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl VersionControl for FakeVcs {
        async fn commit(&self, reference: &str) -> VcsResult<CommitHandle> {
            self.refs
                .get(reference)
                .map(|sha| CommitHandle { sha: sha.clone() })
                .ok_or_else(|| VcsError::UnknownRevision(reference.to_string()))
        }

        async fn diff(
            &self,
            _a: &CommitHandle,
            _b: &CommitHandle,
            paths: &[PathBuf],
        ) -> VcsResult<Vec<FileChange>> {
            Ok(self
                .changes
                .iter()
                .filter(|c| paths.is_empty() || paths.iter().any(|p| c.path.starts_with(p)))
                .cloned()
                .collect())
        }

        async fn merge_base(
            &self,
            _a: &CommitHandle,
            _b: &CommitHandle,
        ) -> VcsResult<Option<CommitHandle>> {
            Ok(self.ancestor.clone().map(|sha| CommitHandle { sha }))
        }

        async fn untracked_files(&self) -> VcsResult<Vec<PathBuf>> {
            Ok(self.untracked.clone())
        }
    }

    fn abs(path: &str) -> PathBuf {
        Path::new(ROOT).join(path)
    }

    fn range() -> ChangeRange {
        ChangeRange {
            remote: Some("origin".to_string()),
            ..ChangeRange::new("develop", "feature")
        }
    }

    fn sample_index() -> ContentIndex {
        ContentIndex::new([
            ContentItem::new("d1", abs("detections/d1.yml")).with_dependency(abs("macros/m.yml")),
            ContentItem::new("d2", abs("detections/d2.yml")),
            ContentItem::new("d3", abs("detections/d3.yml"))
                .with_dependency(abs("lookups/users.yml")),
            ContentItem::new("d4", abs("detections/d4.yml"))
                .with_dependency(abs("macros/other.yml"))
                .with_status(ContentStatus::Deprecated),
        ])
    }

    fn paths(items: &[ContentItem]) -> Vec<PathBuf> {
        items.iter().map(|i| i.path.clone()).collect()
    }

    #[tokio::test]
    async fn test_changed_macro_selects_dependents() {
        let vcs = FakeVcs::new(vec![
            FileChange::new("macros/m.yml", ChangeType::Modified),
            FileChange::new("detections/d2.yml", ChangeType::Modified),
        ]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let items = resolver
            .resolve(SelectionMode::Changed, &sample_index(), &range(), &[])
            .await
            .unwrap();

        assert_eq!(
            paths(&items),
            vec![abs("detections/d1.yml"), abs("detections/d2.yml")]
        );
    }

    #[tokio::test]
    async fn test_changed_lookup_data_maps_to_definition() {
        let vcs = FakeVcs::new(vec![FileChange::new("lookups/users.csv", ChangeType::Modified)]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let items = resolver
            .resolve(SelectionMode::Changed, &sample_index(), &range(), &[])
            .await
            .unwrap();

        assert_eq!(paths(&items), vec![abs("detections/d3.yml")]);
    }

    #[tokio::test]
    async fn test_deleted_files_do_not_select() {
        let vcs = FakeVcs::new(vec![
            FileChange::new("macros/m.yml", ChangeType::Deleted),
            FileChange::new("detections/d2.yml", ChangeType::Deleted),
        ]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let items = resolver
            .resolve(SelectionMode::Changed, &sample_index(), &range(), &[])
            .await
            .unwrap();
        assert!(items.is_empty());
    }

    #[tokio::test]
    async fn test_renamed_detection_is_selected() {
        let index = ContentIndex::new([ContentItem::new("n", abs("detections/new_name.yml"))]);
        let vcs = FakeVcs::new(vec![FileChange {
            path: PathBuf::from("detections/new_name.yml"),
            old_path: Some(PathBuf::from("detections/old_name.yml")),
            change_type: ChangeType::Renamed,
        }]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let items = resolver
            .resolve(SelectionMode::Changed, &index, &range(), &[])
            .await
            .unwrap();
        assert_eq!(paths(&items), vec![abs("detections/new_name.yml")]);
    }

    #[tokio::test]
    async fn test_dependency_closure_is_single_hop() {
        // m.yml uses inner.yml; only the direct dependents of inner.yml are selected.
        let index = ContentIndex::new([
            ContentItem::new("m", abs("macros/m.yml")).with_dependency(abs("macros/inner.yml")),
            ContentItem::new("d1", abs("detections/d1.yml")).with_dependency(abs("macros/m.yml")),
        ]);
        let vcs = FakeVcs::new(vec![FileChange::new("macros/inner.yml", ChangeType::Modified)]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let items = resolver
            .resolve(SelectionMode::Changed, &index, &range(), &[])
            .await
            .unwrap();
        assert_eq!(paths(&items), vec![abs("macros/m.yml")]);
    }

    #[tokio::test]
    async fn test_untracked_files_count_when_enabled() {
        let index = ContentIndex::new([ContentItem::new("draft", abs("detections/draft.yml"))]);
        let mut vcs = FakeVcs::new(Vec::new());
        vcs.untracked = vec![PathBuf::from("detections/draft.yml"), PathBuf::from("notes.txt")];
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let without = resolver
            .resolve(SelectionMode::Changed, &index, &range(), &[])
            .await
            .unwrap();
        assert!(without.is_empty());

        let with_untracked = ChangeRange {
            include_untracked: true,
            ..range()
        };
        let with = resolver
            .resolve(SelectionMode::Changed, &index, &with_untracked, &[])
            .await
            .unwrap();
        assert_eq!(paths(&with), vec![abs("detections/draft.yml")]);
    }

    #[tokio::test]
    async fn test_no_common_ancestor_is_fatal() {
        let mut vcs = FakeVcs::new(Vec::new());
        vcs.ancestor = None;
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let err = resolver
            .resolve(SelectionMode::Changed, &sample_index(), &range(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::NoCommonAncestor { .. }));
    }

    #[tokio::test]
    async fn test_changed_requires_branches() {
        let vcs = FakeVcs::new(Vec::new());
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        let err = resolver
            .resolve(
                SelectionMode::Changed,
                &sample_index(),
                &ChangeRange::default(),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::MissingVersionControl));
    }

    #[tokio::test]
    async fn test_selected_reports_every_missing_path() {
        let resolver = ChangeSetResolver::<FakeVcs>::new(None, ROOT);
        let requested = vec![
            PathBuf::from("detections/d1.yml"),
            PathBuf::from("detections/nope.yml"),
            abs("detections/gone.yml"),
        ];

        let err = resolver
            .resolve(
                SelectionMode::Selected,
                &sample_index(),
                &ChangeRange::default(),
                &requested,
            )
            .await
            .unwrap_err();

        match err {
            SelectionError::MissingContent(missing) => {
                assert_eq!(
                    missing,
                    vec![abs("detections/gone.yml"), abs("detections/nope.yml")]
                );
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_selected_duplicates_collapse() {
        let resolver = ChangeSetResolver::<FakeVcs>::new(None, ROOT);
        let requested = vec![
            PathBuf::from("detections/d2.yml"),
            abs("detections/d2.yml"),
            PathBuf::from("detections/d1.yml"),
        ];

        let items = resolver
            .resolve(
                SelectionMode::Selected,
                &sample_index(),
                &ChangeRange::default(),
                &requested,
            )
            .await
            .unwrap();
        assert_eq!(
            paths(&items),
            vec![abs("detections/d1.yml"), abs("detections/d2.yml")]
        );
    }

    #[tokio::test]
    async fn test_selected_ambiguous_path() {
        let index = ContentIndex::new([
            ContentItem::new("a", abs("detections/a.yml")),
            ContentItem::new("a-copy", abs("detections/a.yml")),
        ]);
        let resolver = ChangeSetResolver::<FakeVcs>::new(None, ROOT);

        let err = resolver
            .resolve(
                SelectionMode::Selected,
                &index,
                &ChangeRange::default(),
                &[PathBuf::from("detections/a.yml")],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::AmbiguousSelection(_)));
    }

    #[tokio::test]
    async fn test_shared_path_rejected_in_every_mode() {
        let index = ContentIndex::new([
            ContentItem::new("x1", abs("detections/x.yml")),
            ContentItem::new("x2", abs("detections/x.yml")),
            ContentItem::new("y", abs("detections/y.yml")),
        ]);
        let vcs = FakeVcs::new(vec![FileChange::new("detections/x.yml", ChangeType::Modified)]);
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT);

        for mode in [SelectionMode::All, SelectionMode::Changed] {
            let err = resolver
                .resolve(mode, &index, &range(), &[])
                .await
                .unwrap_err();
            assert!(
                matches!(&err, SelectionError::AmbiguousSelection(p) if *p == abs("detections/x.yml")),
                "{mode}: {err}"
            );
        }

        // A copy removed by the filter no longer collides.
        let index = ContentIndex::new([
            ContentItem::new("x1", abs("detections/x.yml")),
            ContentItem::new("x2", abs("detections/x.yml")).with_status(ContentStatus::Deprecated),
        ]);
        let filter = ContentFilter {
            exclude_statuses: [ContentStatus::Deprecated].into_iter().collect(),
            ..Default::default()
        };
        let items = ChangeSetResolver::new(Some(&vcs), ROOT)
            .with_filter(filter)
            .resolve(SelectionMode::All, &index, &range(), &[])
            .await
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "x1");
    }

    #[tokio::test]
    async fn test_selected_path_with_parent_components() {
        let resolver = ChangeSetResolver::<FakeVcs>::new(None, ROOT);
        let items = resolver
            .resolve(
                SelectionMode::Selected,
                &sample_index(),
                &ChangeRange::default(),
                &[PathBuf::from("../repo/detections/./d2.yml")],
            )
            .await
            .unwrap();
        assert_eq!(paths(&items), vec![abs("detections/d2.yml")]);
    }

    #[tokio::test]
    async fn test_selected_requires_paths() {
        let resolver = ChangeSetResolver::<FakeVcs>::new(None, ROOT);
        let err = resolver
            .resolve(
                SelectionMode::Selected,
                &sample_index(),
                &ChangeRange::default(),
                &[],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SelectionError::EmptySelection));
    }

    #[tokio::test]
    async fn test_all_is_superset_of_changed_and_filtered() {
        let vcs = FakeVcs::new(vec![
            FileChange::new("macros/m.yml", ChangeType::Modified),
            FileChange::new("macros/other.yml", ChangeType::Added),
            FileChange::new("detections/d2.yml", ChangeType::Added),
        ]);
        let filter = ContentFilter {
            exclude_statuses: [ContentStatus::Deprecated].into_iter().collect(),
            ..Default::default()
        };
        let resolver = ChangeSetResolver::new(Some(&vcs), ROOT).with_filter(filter);
        let index = sample_index();

        let all = resolver
            .resolve(SelectionMode::All, &index, &range(), &[])
            .await
            .unwrap();
        let changed = resolver
            .resolve(SelectionMode::Changed, &index, &range(), &[])
            .await
            .unwrap();

        assert_eq!(all.len(), 3);
        assert!(!paths(&all).contains(&abs("detections/d4.yml")));
        assert!(changed.iter().all(|c| all.iter().any(|a| a.id == c.id)));

        let mut sorted = paths(&all);
        sorted.sort();
        assert_eq!(paths(&all), sorted);
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("all".parse::<SelectionMode>().unwrap(), SelectionMode::All);
        assert_eq!(
            "Changes".parse::<SelectionMode>().unwrap(),
            SelectionMode::Changed
        );
        assert!(matches!(
            "random".parse::<SelectionMode>(),
            Err(SelectionError::UnsupportedMode(m)) if m == "random"
        ));
    }

    #[test]
    fn test_missing_content_message_lists_all_paths() {
        let err = SelectionError::MissingContent(vec![abs("a.yml"), abs("b.yml")]);
        let message = err.to_string();
        assert!(message.contains("/repo/a.yml"));
        assert!(message.contains("/repo/b.yml"));
    }

    #[test]
    fn test_change_set_classification() {
        let set = ChangeSet::from_changes([
            FileChange::new("lookups/users.csv", ChangeType::Added),
            FileChange::new("macros/m.yml", ChangeType::Modified),
            FileChange::new("detections/a.yml", ChangeType::Renamed),
            FileChange::new("detections/b.yml", ChangeType::Deleted),
            FileChange::new("docs/readme.md", ChangeType::Modified),
        ]);
        let layout = ContentLayout::default();
        let root = Path::new(ROOT);

        assert_eq!(set.len(), 5);
        assert_eq!(
            set.changed_dependencies(&layout, root),
            [abs("lookups/users.yml"), abs("macros/m.yml")]
                .into_iter()
                .collect()
        );
        assert_eq!(
            set.changed_detections(&layout, root),
            [abs("detections/a.yml")].into_iter().collect()
        );
    }
}
