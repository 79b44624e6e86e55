//! Version-control collaborator.
//!
//! The change-set resolver only needs four questions answered about a
//! repository: what commit a ref names, which files differ between two
//! commits, where two histories meet, and which files are untracked.
//! [`VersionControl`] captures exactly that; [`GitCli`] answers it by
//! shelling out to `git`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tracing::debug;

/// Result type for version-control operations.
pub type VcsResult<T> = Result<T, VcsError>;

/// Errors raised by the version-control collaborator.
#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    /// `git` could not be started.
    #[error("Failed to run git: {0}")]
    Spawn(#[from] std::io::Error),

    /// `git` ran and reported failure.
    #[error("git {command} failed: {stderr}")]
    Command {
        /// Subcommand that failed.
        command: String,
        /// Captured standard error.
        stderr: String,
    },

    /// A ref could not be resolved to a commit.
    #[error("Unknown revision: {0}")]
    UnknownRevision(String),

    /// `git` produced output that could not be interpreted.
    #[error("Unexpected git output: {0}")]
    Parse(String),
}

/// A resolved commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommitHandle {
    /// Full object id.
    pub sha: String,
}

impl fmt::Display for CommitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sha)
    }
}

/// How a file changed between two revisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// `A`
    Added,
    /// `M`
    Modified,
    /// `D`
    Deleted,
    /// `R`
    Renamed,
}

impl ChangeType {
    /// Parses a `--name-status` letter. Copies count as additions and type
    /// changes as modifications.
    pub fn from_status(status: &str) -> Option<Self> {
        match status.chars().next()? {
            'A' | 'C' => Some(ChangeType::Added),
            'M' | 'T' => Some(ChangeType::Modified),
            'D' => Some(ChangeType::Deleted),
            'R' => Some(ChangeType::Renamed),
            _ => None,
        }
    }
}

/// A single entry of a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Repository-relative path after the change (the deleted path for `D`).
    pub path: PathBuf,

    /// Path before a rename.
    pub old_path: Option<PathBuf>,

    /// Kind of change.
    pub change_type: ChangeType,
}

impl FileChange {
    /// Creates a change entry without a previous path.
    pub fn new(path: impl Into<PathBuf>, change_type: ChangeType) -> Self {
        Self {
            path: path.into(),
            old_path: None,
            change_type,
        }
    }
}

/// Read access to a version-controlled repository.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Resolves `reference` to a commit.
    async fn commit(&self, reference: &str) -> VcsResult<CommitHandle>;

    /// Files that differ between `a` and `b`, restricted to `paths` when
    /// non-empty.
    async fn diff(
        &self,
        a: &CommitHandle,
        b: &CommitHandle,
        paths: &[PathBuf],
    ) -> VcsResult<Vec<FileChange>>;

    /// Best common ancestor of `a` and `b`, or `None` for unrelated histories.
    async fn merge_base(&self, a: &CommitHandle, b: &CommitHandle)
    -> VcsResult<Option<CommitHandle>>;

    /// Repository-relative paths of untracked, non-ignored files.
    async fn untracked_files(&self) -> VcsResult<Vec<PathBuf>>;
}

/// [`VersionControl`] backed by the `git` command line.
pub struct GitCli {
    repo: PathBuf,
}

impl GitCli {
    /// Opens the repository at `repo`.
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    /// Repository working directory.
    pub fn repo(&self) -> &Path {
        &self.repo
    }

    async fn git(&self, args: &[&str]) -> VcsResult<std::process::Output> {
        debug!("git {}", args.join(" "));
        let output = tokio::process::Command::new("git")
            .args(args)
            .current_dir(&self.repo)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(output)
    }

    async fn git_ok(&self, args: &[&str]) -> VcsResult<Vec<u8>> {
        let output = self.git(args).await?;
        if !output.status.success() {
            return Err(VcsError::Command {
                command: args.first().copied().unwrap_or_default().to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl VersionControl for GitCli {
    async fn commit(&self, reference: &str) -> VcsResult<CommitHandle> {
        let spec = format!("{reference}^{{commit}}");
        let output = self
            .git(&["rev-parse", "--verify", "--quiet", spec.as_str()])
            .await?;
        if !output.status.success() {
            return Err(VcsError::UnknownRevision(reference.to_string()));
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if sha.is_empty() {
            return Err(VcsError::UnknownRevision(reference.to_string()));
        }
        Ok(CommitHandle { sha })
    }

    async fn diff(
        &self,
        a: &CommitHandle,
        b: &CommitHandle,
        paths: &[PathBuf],
    ) -> VcsResult<Vec<FileChange>> {
        let path_args: Vec<String> = paths
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect();
        let mut args = vec![
            "diff",
            "--name-status",
            "--relative",
            "-M",
            "-z",
            a.sha.as_str(),
            b.sha.as_str(),
            "--",
        ];
        args.extend(path_args.iter().map(String::as_str));

        let stdout = self.git_ok(&args).await?;
        parse_name_status(&String::from_utf8_lossy(&stdout))
    }

    async fn merge_base(
        &self,
        a: &CommitHandle,
        b: &CommitHandle,
    ) -> VcsResult<Option<CommitHandle>> {
        let output = self
            .git(&["merge-base", a.sha.as_str(), b.sha.as_str()])
            .await?;
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();

        // Exit status 1 with no output means the histories are unrelated.
        match output.status.code() {
            Some(0) if !sha.is_empty() => Ok(Some(CommitHandle { sha })),
            Some(0) | Some(1) if sha.is_empty() => Ok(None),
            _ => Err(VcsError::Command {
                command: "merge-base".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn untracked_files(&self) -> VcsResult<Vec<PathBuf>> {
        let stdout = self
            .git_ok(&["ls-files", "--others", "--exclude-standard", "-z"])
            .await?;
        Ok(String::from_utf8_lossy(&stdout)
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect())
    }
}

/// Parses `git diff --name-status -z` output.
///
/// Records are NUL separated: `status, path` or, for renames and copies,
/// `status, old, new`.
fn parse_name_status(output: &str) -> VcsResult<Vec<FileChange>> {
    let mut fields = output.split('\0').filter(|s| !s.is_empty());
    let mut changes = Vec::new();

    while let Some(status) = fields.next() {
        let change_type = ChangeType::from_status(status)
            .ok_or_else(|| VcsError::Parse(format!("unknown status '{status}'")))?;
        let first = fields
            .next()
            .ok_or_else(|| VcsError::Parse(format!("missing path after '{status}'")))?;

        let change = if status.starts_with('R') || status.starts_with('C') {
            let second = fields
                .next()
                .ok_or_else(|| VcsError::Parse(format!("missing target of '{first}'")))?;
            FileChange {
                path: PathBuf::from(second),
                old_path: Some(PathBuf::from(first)),
                change_type,
            }
        } else {
            FileChange::new(first, change_type)
        };
        changes.push(change);
    }

    Ok(changes)
}
