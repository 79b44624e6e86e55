//! Configuration loading and schema definitions for retest.
//!
//! This module provides types and functions for loading retest configuration
//! from TOML files or strings. The schema covers content selection, version
//! control, test instances, the backend and reporting.

pub mod schema;

pub use schema::*;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::resolver::ChangeRange;

/// Loads retest configuration from a TOML file.
///
/// Paths in the file are `~`-expanded; relative ones are kept relative to
/// the current directory.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid TOML, does not
/// match the schema or fails [`Config::validate`].
///
/// # Example
///
/// ```no_run
/// use retest::config::load_config;
/// use std::path::Path;
///
/// let config = load_config(Path::new("retest.toml"))?;
/// println!("Instances: {}", config.retest.instances);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    load_config_str(&content)
        .with_context(|| format!("Failed to load config file: {}", path.display()))
}

/// Loads retest configuration from a TOML string.
///
/// # Example
///
/// ```
/// use retest::config::load_config_str;
///
/// let config = load_config_str(r#"
///     [content]
///     manifest = "content.json"
///
///     [backend]
///     type = "docker"
/// "#)?;
///
/// assert_eq!(config.retest.instances, 1);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn load_config_str(content: &str) -> Result<Config> {
    let mut config: Config = toml::from_str(content).context("Failed to parse config")?;
    config.expand_paths();
    config.validate()?;
    Ok(config)
}

impl Config {
    /// Rejects settings no run could succeed with.
    pub fn validate(&self) -> Result<()> {
        if self.retest.instances == 0 {
            bail!("retest.instances must be at least 1");
        }
        if self.retest.job_timeout_secs == 0 {
            bail!("retest.job_timeout_secs must be greater than 0");
        }
        if let BackendConfig::Remote(remote) = &self.backend {
            if remote.hosts.is_empty() {
                bail!("backend.hosts must list at least one host");
            }
        }
        Ok(())
    }

    /// Repository diffed in `changed` mode.
    pub fn repo_path(&self) -> PathBuf {
        self.version_control
            .repo_path
            .clone()
            .unwrap_or_else(|| self.content.root.clone())
    }

    /// Revision range for `changed` mode.
    pub fn change_range(&self) -> ChangeRange {
        ChangeRange {
            base_branch: self.version_control.target_branch.clone(),
            test_branch: self.version_control.test_branch.clone(),
            remote: Some(self.version_control.remote.clone()),
            include_untracked: self.version_control.include_untracked,
        }
    }

    fn expand_paths(&mut self) {
        self.content.manifest = expand_path(&self.content.manifest);
        self.content.root = expand_path(&self.content.root);
        if let Some(repo) = &self.version_control.repo_path {
            self.version_control.repo_path = Some(expand_path(repo));
        }
        self.report.output_dir = expand_path(&self.report.output_dir);
    }
}

/// Starter configuration written by `retest init`.
pub const EXAMPLE_CONFIG: &str = r#"# retest configuration

[retest]
# all | selected | changed
mode = "changed"
instances = 2
job_timeout_secs = 900
retry_count = 2

[content]
manifest = "build/content.json"
root = "."

[content.filter]
exclude_statuses = ["deprecated", "experimental"]

[version_control]
remote = "origin"
target_branch = "develop"
test_branch = "HEAD"

[selection]
detections = []

[instance]
username = "admin"
password = "Chang3d!"

[backend]
type = "docker"
image = "splunk/splunk:latest"

[report]
output_dir = "test-results"
junit = true
"#;
