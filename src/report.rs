//! Result collection and reporting.
//!
//! [`ResultCollector`] accumulates one terminal record per job and derives
//! the run's summary and exit status. [`print_summary`] renders it on the
//! console and [`junit::JunitReport`] writes it as JUnit XML.

pub mod junit;

pub use junit::JunitReport;

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::job::{JobRecord, JobStatus};

/// Errors raised while collecting results.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    /// A job already has a recorded outcome.
    #[error("Outcome for {0} was already recorded")]
    DuplicateOutcome(String),

    /// A record without a terminal status was submitted.
    #[error("Outcome for {id} is not terminal: {status}")]
    NotTerminal {
        /// Job identity.
        id: String,
        /// Offending status.
        status: JobStatus,
    },
}

/// Counts per terminal status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    /// Jobs recorded.
    pub total: usize,
    /// Jobs that passed.
    pub passed: usize,
    /// Jobs whose test failed.
    pub failed: usize,
    /// Jobs that could not be run.
    pub errored: usize,
}

impl Summary {
    /// Returns `true` if every recorded job passed. An empty run succeeds.
    pub fn success(&self) -> bool {
        self.failed == 0 && self.errored == 0
    }

    /// Process exit code: 0 only if every job passed.
    pub fn exit_code(&self) -> i32 {
        if self.success() { 0 } else { 1 }
    }
}

/// Accumulates the terminal outcome of every job.
#[derive(Debug, Default)]
pub struct ResultCollector {
    records: Vec<JobRecord>,
    index: HashMap<String, usize>,
    duration: Duration,
}

impl ResultCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the outcome of one job.
    ///
    /// # Errors
    ///
    /// [`CollectorError::DuplicateOutcome`] if the job was already recorded;
    /// the first outcome is kept.
    pub fn record(&mut self, record: JobRecord) -> Result<(), CollectorError> {
        if !record.status.is_terminal() {
            return Err(CollectorError::NotTerminal {
                id: record.id,
                status: record.status,
            });
        }
        if self.index.contains_key(&record.id) {
            return Err(CollectorError::DuplicateOutcome(record.id));
        }
        self.index.insert(record.id.clone(), self.records.len());
        self.records.push(record);
        Ok(())
    }

    /// Sets the run's wall-clock duration.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration = duration;
    }

    /// Run's wall-clock duration.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Recorded outcome of `id`.
    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    /// All records, sorted by job identity.
    pub fn records(&self) -> Vec<&JobRecord> {
        let mut records: Vec<&JobRecord> = self.records.iter().collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    /// Failed and errored records with their diagnostics, sorted by identity.
    pub fn failures(&self) -> Vec<&JobRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.status != JobStatus::Passed)
            .collect()
    }

    /// Counts per status.
    pub fn summary(&self) -> Summary {
        let mut summary = Summary {
            total: self.records.len(),
            ..Summary::default()
        };
        for record in &self.records {
            match record.status {
                JobStatus::Passed => summary.passed += 1,
                JobStatus::Failed => summary.failed += 1,
                JobStatus::Error => summary.errored += 1,
                JobStatus::Pending | JobStatus::Running => {}
            }
        }
        summary
    }

    /// Process exit code: 0 only if every job passed.
    pub fn exit_code(&self) -> i32 {
        self.summary().exit_code()
    }
}

/// Prints a summary of the run to the console.
pub fn print_summary(collector: &ResultCollector) {
    let summary = collector.summary();

    println!();
    println!("Test Results:");
    println!("  Total:    {}", summary.total);
    println!("  Passed:   {}", console::style(summary.passed).green());
    println!("  Failed:   {}", console::style(summary.failed).red());
    if summary.errored > 0 {
        println!("  Errors:   {}", console::style(summary.errored).red().bold());
    }
    println!("  Duration: {:?}", collector.duration());

    let failures = collector.failures();
    if !failures.is_empty() {
        println!();
        for record in failures {
            let label = match record.status {
                JobStatus::Error => console::style("ERROR").red().bold(),
                _ => console::style("FAIL").red(),
            };
            println!("{} {}", label, record.id);
            for line in record.output.lines().take(10) {
                println!("    {}", console::style(line).dim());
            }
        }
    }

    println!();
    if summary.total == 0 {
        println!("{}", console::style("No content selected for testing.").yellow());
    } else if summary.success() {
        println!("{}", console::style("All tests passed!").green().bold());
    } else {
        println!("{}", console::style("Some tests failed.").red().bold());
    }
}
