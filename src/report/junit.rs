//! JUnit XML report generation.
//!
//! Writes one `<testcase>` per job, which CI systems (Jenkins, GitLab CI,
//! GitHub Actions) render natively.
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuites tests="2" failures="1" errors="0" time="61.200">
//!   <testsuite name="retest" tests="2" failures="1" errors="0" skipped="0" time="61.200">
//!     <testcase classname="endpoint" name="suspicious_process" time="30.100"/>
//!     <testcase classname="network" name="dns_tunnel" time="31.100">
//!       <failure message="test failed" type="TestFailure">0 result(s)</failure>
//!     </testcase>
//!   </testsuite>
//! </testsuites>
//! ```

use std::path::Path;

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::ResultCollector;
use crate::job::{JobRecord, JobStatus};

/// Renders a [`ResultCollector`] as JUnit XML.
pub struct JunitReport<'a> {
    collector: &'a ResultCollector,
    testsuite_name: String,
}

impl<'a> JunitReport<'a> {
    /// Creates a report over `collector`.
    pub fn new(collector: &'a ResultCollector) -> Self {
        Self {
            collector,
            testsuite_name: "retest".to_string(),
        }
    }

    /// Sets the test suite name. Defaults to `"retest"`.
    pub fn with_testsuite_name(mut self, name: impl Into<String>) -> Self {
        self.testsuite_name = name.into();
        self
    }

    /// Writes the report to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let xml = self.to_xml()?;
        std::fs::write(path, xml)
            .with_context(|| format!("Failed to write JUnit report: {}", path.display()))
    }

    /// Generates the XML document.
    pub fn to_xml(&self) -> anyhow::Result<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

        let summary = self.collector.summary();
        let tests = summary.total.to_string();
        let failures = summary.failed.to_string();
        let errors = summary.errored.to_string();
        let time = format!("{:.3}", self.collector.duration().as_secs_f64());

        let mut testsuites = BytesStart::new("testsuites");
        testsuites.push_attribute(("tests", tests.as_str()));
        testsuites.push_attribute(("failures", failures.as_str()));
        testsuites.push_attribute(("errors", errors.as_str()));
        testsuites.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuites))?;

        let mut testsuite = BytesStart::new("testsuite");
        testsuite.push_attribute(("name", self.testsuite_name.as_str()));
        testsuite.push_attribute(("tests", tests.as_str()));
        testsuite.push_attribute(("failures", failures.as_str()));
        testsuite.push_attribute(("errors", errors.as_str()));
        testsuite.push_attribute(("skipped", "0"));
        testsuite.push_attribute(("time", time.as_str()));
        writer.write_event(Event::Start(testsuite))?;

        for record in self.collector.records() {
            write_testcase(&mut writer, record)?;
        }

        writer.write_event(Event::End(BytesEnd::new("testsuite")))?;
        writer.write_event(Event::End(BytesEnd::new("testsuites")))?;

        Ok(String::from_utf8(writer.into_inner())?)
    }
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    record: &JobRecord,
) -> anyhow::Result<()> {
    let classname = record
        .item
        .path
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "retest".to_string());
    let name = record.item.name();

    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", classname.as_str()));
    testcase.push_attribute(("name", name.as_str()));
    testcase.push_attribute((
        "time",
        format!("{:.3}", record.duration.as_secs_f64()).as_str(),
    ));

    let (element, message, kind) = match record.status {
        JobStatus::Failed => ("failure", "test failed", "TestFailure"),
        JobStatus::Error => ("error", "test could not be run", "InfrastructureError"),
        _ => {
            writer.write_event(Event::Empty(testcase))?;
            return Ok(());
        }
    };

    writer.write_event(Event::Start(testcase))?;
    let mut detail = BytesStart::new(element);
    detail.push_attribute(("message", message));
    detail.push_attribute(("type", kind));
    writer.write_event(Event::Start(detail))?;
    writer.write_event(Event::Text(BytesText::new(&record.output)))?;
    writer.write_event(Event::End(BytesEnd::new(element)))?;

    let attempts = format!("attempts: {}", record.attempts);
    writer.write_event(Event::Start(BytesStart::new("system-out")))?;
    writer.write_event(Event::Text(BytesText::new(&attempts)))?;
    writer.write_event(Event::End(BytesEnd::new("system-out")))?;

    writer.write_event(Event::End(BytesEnd::new("testcase")))?;
    Ok(())
}
