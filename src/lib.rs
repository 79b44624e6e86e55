//! retest: change-aware test orchestration for detection content.
//!
//! This crate decides which content items need retesting after a change and
//! runs their tests in parallel on a pool of disposable or pre-existing
//! instances of the target application.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Content**: Read-only index of content items and their dependencies
//! - **Resolver**: Selects items to test (all, an explicit list, or changed)
//! - **Instance**: Drives one test instance through its lifecycle (Docker or remote)
//! - **Scheduler**: Distributes jobs over instances with bounded retries
//! - **Report**: Collects outcomes, prints a summary, writes JUnit XML
//!
//! # Example
//!
//! ```no_run
//! use retest::config::load_config;
//! use retest::content::ContentIndex;
//! use retest::resolver::{ChangeSetResolver, SelectionMode};
//! use retest::vcs::GitCli;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("retest.toml"))?;
//!     let index = ContentIndex::load(&config.content.manifest, &config.content.root)?;
//!
//!     let git = GitCli::new(config.repo_path());
//!     let items = ChangeSetResolver::new(Some(&git), &config.content.root)
//!         .resolve(SelectionMode::Changed, &index, &config.change_range(), &[])
//!         .await?;
//!     println!("{} item(s) to test", items.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod content;
pub mod instance;
pub mod job;
pub mod report;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod vcs;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use content::{ContentIndex, ContentItem};
pub use instance::{InstanceManager, LifecycleManager, TestInstance};
pub use job::{JobOutcome, JobStatus, TestJob};
pub use report::ResultCollector;
pub use resolver::{ChangeSetResolver, SelectionError, SelectionMode};
pub use scheduler::{SchedulerConfig, TestScheduler};
