//! Test jobs and their outcomes.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::content::ContentItem;

/// Status of a job. `Passed`, `Failed` and `Error` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting in the queue.
    Pending,
    /// Dispatched to an instance.
    Running,
    /// The test ran and passed.
    Passed,
    /// The test ran and its assertions did not hold.
    Failed,
    /// The test could not be run (infrastructure).
    Error,
}

impl JobStatus {
    /// Returns `true` once a result has been recorded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Passed | JobStatus::Failed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Passed => "passed",
            JobStatus::Failed => "failed",
            JobStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// What a single execution attempt reported.
///
/// Lower layers never decide on retries; they only distinguish a test that
/// ran from one that could not run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The test ran and passed.
    Passed {
        /// Captured output.
        output: String,
    },
    /// The test ran and failed.
    Failed {
        /// Captured output.
        output: String,
    },
    /// The instance could not run the test.
    InfraError {
        /// What went wrong.
        message: String,
    },
}

impl JobOutcome {
    /// Returns `true` for infrastructure errors, the only retryable outcome.
    pub fn is_infra_error(&self) -> bool {
        matches!(self, JobOutcome::InfraError { .. })
    }

    /// Captured output or error message.
    pub fn diagnostics(&self) -> &str {
        match self {
            JobOutcome::Passed { output } | JobOutcome::Failed { output } => output,
            JobOutcome::InfraError { message } => message,
        }
    }
}

/// One content item waiting for, or undergoing, execution.
#[derive(Debug, Clone)]
pub struct TestJob {
    /// Item under test.
    pub item: ContentItem,

    /// Current status.
    pub status: JobStatus,

    /// Execution attempts started so far.
    pub attempts: u32,

    /// Instance the latest attempt ran on.
    pub instance_id: Option<String>,

    /// Diagnostics from the latest attempt.
    pub output: String,
}

impl TestJob {
    /// Creates a pending job.
    pub fn new(item: ContentItem) -> Self {
        Self {
            item,
            status: JobStatus::Pending,
            attempts: 0,
            instance_id: None,
            output: String::new(),
        }
    }

    /// Job identity: the path of the item under test.
    pub fn id(&self) -> String {
        self.item.path.to_string_lossy().to_string()
    }

    /// Marks the job as dispatched to `instance_id`.
    pub fn start(&mut self, instance_id: &str) {
        self.status = JobStatus::Running;
        self.attempts += 1;
        self.instance_id = Some(instance_id.to_string());
    }

    /// Returns the job to the queue after an infrastructure error.
    pub fn requeue(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Pending;
        self.output = message.into();
    }

    /// Converts the job into its terminal record.
    pub fn finish(
        self,
        status: JobStatus,
        output: impl Into<String>,
        duration: Duration,
    ) -> JobRecord {
        JobRecord {
            id: self.id(),
            item: self.item,
            status,
            attempts: self.attempts,
            instance_id: self.instance_id,
            output: output.into(),
            duration,
        }
    }
}

/// Terminal result of a job, as stored by the collector.
#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    /// Job identity.
    pub id: String,

    /// Item under test.
    #[serde(skip)]
    pub item: ContentItem,

    /// Terminal status.
    pub status: JobStatus,

    /// Attempts used.
    pub attempts: u32,

    /// Instance of the final attempt.
    pub instance_id: Option<String>,

    /// Diagnostics from the final attempt.
    pub output: String,

    /// Wall-clock time of the final attempt.
    pub duration: Duration,
}
