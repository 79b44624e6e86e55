//! Configuration schema definitions for retest.
//!
//! This module defines all configuration types that can be deserialized from
//! TOML configuration files. The backend is selected with a tagged enum.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── RetestConfig           - Core settings (mode, instances, timeouts, retries)
//! ├── ContentConfig          - Manifest, content root, layout, filters
//! ├── VersionControlConfig   - Repository, remote and branches for `changed`
//! ├── SelectionConfig        - Explicit detections for `selected`
//! ├── InstanceConfig         - Credentials, permissions, health policy, API
//! ├── BackendConfig          - Tagged enum selecting the backend
//! │   ├── Docker             - Ephemeral containers
//! │   └── Remote             - Pre-existing hosts
//! └── ReportConfig           - Output and reporting settings
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::content::ContentFilter;
use crate::resolver::ContentLayout;
use crate::retry::BackoffPolicy;

/// Root configuration structure for retest.
///
/// # TOML Structure
///
/// ```toml
/// [retest]
/// mode = "changed"
/// instances = 2
///
/// [content]
/// manifest = "build/content.json"
/// root = "."
///
/// [version_control]
/// target_branch = "develop"
/// test_branch = "feature/new-detection"
///
/// [backend]
/// type = "docker"
/// image = "splunk/splunk:latest"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Core settings.
    #[serde(default)]
    pub retest: RetestConfig,

    /// Where the content lives and how it is laid out.
    pub content: ContentConfig,

    /// Version control settings, required for `changed` mode.
    #[serde(default)]
    pub version_control: VersionControlConfig,

    /// Explicit selection, used by `selected` mode.
    #[serde(default)]
    pub selection: SelectionConfig,

    /// Test instance settings.
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Backend the test instances run on.
    pub backend: BackendConfig,

    /// Report configuration (optional, has defaults).
    #[serde(default)]
    pub report: ReportConfig,
}

/// Core execution settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `mode` | `"changed"` |
/// | `instances` | 1 |
/// | `job_timeout_secs` | 900 (15 minutes) |
/// | `retry_count` | 2 |
/// | `provision` | 3 attempts, 5s base delay, 60s max delay |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetestConfig {
    /// Selection mode: `all`, `selected` or `changed`.
    ///
    /// Kept as a string so an unknown mode surfaces as a selection error
    /// rather than a parse failure.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Number of test instances to run jobs on.
    #[serde(default = "default_instances")]
    pub instances: usize,

    /// Per-job timeout in seconds. A timeout counts as an infrastructure
    /// error.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Infrastructure retries per job. Test failures are never retried.
    #[serde(default = "default_retry_count")]
    pub retry_count: usize,

    /// Attempts and backoff for provisioning each instance.
    #[serde(default = "default_provision_policy")]
    pub provision: BackoffPolicy,
}

impl Default for RetestConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            instances: default_instances(),
            job_timeout_secs: default_job_timeout(),
            retry_count: default_retry_count(),
            provision: default_provision_policy(),
        }
    }
}

fn default_mode() -> String {
    "changed".to_string()
}

fn default_instances() -> usize {
    1
}

fn default_job_timeout() -> u64 {
    900 // 15 minutes
}

fn default_retry_count() -> usize {
    2
}

fn default_provision_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 3,
        base_delay_ms: 5_000,
        max_delay_ms: 60_000,
    }
}

/// Content settings.
///
/// ```toml
/// [content]
/// manifest = "build/content.json"
/// root = "~/security_content"
///
/// [content.layout]
/// detection_dirs = ["detections"]
/// dependency_dirs = ["macros", "lookups"]
///
/// [content.filter]
/// exclude_statuses = ["deprecated", "experimental"]
/// exclude_categories = ["Correlation"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentConfig {
    /// JSON manifest produced by the content loader.
    pub manifest: PathBuf,

    /// Root of the content repository. Relative manifest paths and
    /// explicit selections resolve against it.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Directory conventions.
    #[serde(default)]
    pub layout: ContentLayout,

    /// Exclusion filters applied after every selection mode.
    #[serde(default)]
    pub filter: ContentFilter,
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

/// Version control settings for `changed` mode.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VersionControlConfig {
    /// Repository to diff. Defaults to the content root.
    pub repo_path: Option<PathBuf>,

    /// Remote the target branch is read from.
    ///
    /// Default: `origin`
    #[serde(default = "default_remote")]
    pub remote: String,

    /// Branch changes are measured against.
    pub target_branch: Option<String>,

    /// Branch containing the changes.
    pub test_branch: Option<String>,

    /// Treat untracked files under content directories as added.
    #[serde(default)]
    pub include_untracked: bool,
}

impl Default for VersionControlConfig {
    fn default() -> Self {
        Self {
            repo_path: None,
            remote: default_remote(),
            target_branch: None,
            test_branch: None,
            include_untracked: false,
        }
    }
}

fn default_remote() -> String {
    "origin".to_string()
}

/// Explicit selection for `selected` mode.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SelectionConfig {
    /// Paths of the content items to test.
    #[serde(default)]
    pub detections: Vec<PathBuf>,
}

/// Test instance settings shared by every backend.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `username` | `"admin"` |
/// | `password` | `"Chang3d!"` |
/// | `imported_roles` | `["user", "power", "can_delete"]` |
/// | `delete_indexes` | `["_*", "*", "main"]` |
/// | `startup` | 30 attempts, 2s base delay, 20s max delay |
/// | `health` | 10 attempts, 1s base delay, 30s max delay |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Application user the tests run as.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password of the application user. Docker instances are created with it.
    #[serde(default = "default_password")]
    pub password: String,

    /// Roles granted to the test user during configuration.
    #[serde(default = "default_imported_roles")]
    pub imported_roles: Vec<String>,

    /// Indexes the test user may delete events from.
    #[serde(default = "default_delete_indexes")]
    pub delete_indexes: Vec<String>,

    /// Liveness polling while a fresh instance boots.
    #[serde(default = "default_startup_policy")]
    pub startup: BackoffPolicy,

    /// Readiness polling after configuration.
    #[serde(default)]
    pub health: BackoffPolicy,

    /// Application API client settings.
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            username: default_username(),
            password: default_password(),
            imported_roles: default_imported_roles(),
            delete_indexes: default_delete_indexes(),
            startup: default_startup_policy(),
            health: BackoffPolicy::default(),
            api: ApiConfig::default(),
        }
    }
}

fn default_username() -> String {
    "admin".to_string()
}

fn default_password() -> String {
    "Chang3d!".to_string()
}

fn default_imported_roles() -> Vec<String> {
    ["user", "power", "can_delete"].map(String::from).to_vec()
}

fn default_delete_indexes() -> Vec<String> {
    ["_*", "*", "main"].map(String::from).to_vec()
}

fn default_startup_policy() -> BackoffPolicy {
    BackoffPolicy {
        max_attempts: 30,
        base_delay_ms: 2_000,
        max_delay_ms: 20_000,
    }
}

/// Application API client settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    /// URL scheme of the management endpoint.
    ///
    /// Default: `https`
    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// Verify TLS certificates. Test instances usually have self-signed ones.
    ///
    /// Default: false
    #[serde(default)]
    pub verify_tls: bool,

    /// Timeout of a single request in seconds.
    ///
    /// Default: 60
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            verify_tls: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// Backend configuration specifying where test instances come from.
///
/// | Type | Description |
/// |------|-------------|
/// | `docker` | A fresh container per instance, removed afterwards |
/// | `remote` | Pre-existing hosts, claimed one per instance |
///
/// # Example
///
/// ```toml
/// [backend]
/// type = "docker"
/// image = "splunk/splunk:9.1"
///
/// [backend]
/// type = "remote"
/// hosts = ["10.0.0.5", "10.0.0.6:8089"]
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Ephemeral Docker containers.
    Docker(DockerBackendConfig),

    /// Pre-existing remote hosts.
    Remote(RemoteBackendConfig),
}

/// Configuration for the Docker backend.
///
/// ```toml
/// [backend]
/// type = "docker"
/// image = "splunk/splunk:latest"
/// pull = true
///
/// [backend.env]
/// SPLUNK_APPS_URL = "https://example.com/app.tgz"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DockerBackendConfig {
    /// Image of the target application.
    #[serde(default = "default_image")]
    pub image: String,

    /// Pull the image before the first container is created.
    #[serde(default)]
    pub pull: bool,

    /// Additional environment for the container.
    #[serde(default)]
    pub env: std::collections::BTreeMap<String, String>,

    /// Container port of the management API.
    ///
    /// Default: 8089
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Docker daemon URL. Uses the local socket if unset.
    pub docker_host: Option<String>,
}

impl Default for DockerBackendConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            pull: false,
            env: Default::default(),
            api_port: default_api_port(),
            docker_host: None,
        }
    }
}

fn default_image() -> String {
    "splunk/splunk:latest".to_string()
}

fn default_api_port() -> u16 {
    8089
}

/// Configuration for the remote host backend.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteBackendConfig {
    /// Hosts available for testing, `host` or `host:port`.
    pub hosts: Vec<String>,

    /// Port used when a host entry has none.
    ///
    /// Default: 8089
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// TCP connect timeout for the reachability check, in seconds.
    ///
    /// Default: 10
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

/// Configuration for test result reporting.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `output_dir` | `"test-results"` |
/// | `junit` | `true` |
/// | `junit_file` | `"junit.xml"` |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportConfig {
    /// Directory where report files are written. Created if missing.
    #[serde(default = "default_report_dir")]
    pub output_dir: PathBuf,

    /// Whether to write a JUnit XML report.
    #[serde(default = "default_true")]
    pub junit: bool,

    /// Filename of the JUnit XML report, inside `output_dir`.
    #[serde(default = "default_junit_file")]
    pub junit_file: String,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            output_dir: default_report_dir(),
            junit: true,
            junit_file: default_junit_file(),
        }
    }
}

impl ReportConfig {
    /// Full path of the JUnit report.
    pub fn junit_path(&self) -> PathBuf {
        self.output_dir.join(&self.junit_file)
    }
}

fn default_report_dir() -> PathBuf {
    PathBuf::from("test-results")
}

fn default_true() -> bool {
    true
}

fn default_junit_file() -> String {
    "junit.xml".to_string()
}

/// Expands a leading `~` and environment variables in `path`.
pub fn expand_path(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    match shellexpand::full(&raw) {
        Ok(expanded) => PathBuf::from(expanded.as_ref()),
        Err(_) => path.to_path_buf(),
    }
}
