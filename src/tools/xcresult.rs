//! `xcresulttool` adapter: test summaries from an `.xcresult` bundle

use serde_json::Value;
use std::path::Path;

use super::{ToolError, Xcrun};
use crate::cancel::CancelToken;
use crate::process::run_capture;

/// Read the test summary from a result bundle.
///
/// The subcommand surface has changed across Xcode releases; shapes are
/// tried newest-first and the first parseable JSON document wins.
pub fn summary(xcrun: &Xcrun, bundle: &Path, token: &CancelToken) -> Result<Value, ToolError> {
    let path = bundle.to_string_lossy();
    let shapes: [&[&str]; 3] = [
        &[
            "get", "test-results", "summary", "--path", &path, "--format", "json",
        ],
        &["get", "--path", &path, "--format", "json"],
        &["get", "--legacy", "--path", &path, "--format", "json"],
    ];
    let mut last_failure = String::new();
    for shape in shapes {
        let request = xcrun.request("xcresulttool", shape);
        let output = run_capture(&request, token, None)?;
        if output.success() {
            match serde_json::from_str(&output.stdout) {
                Ok(value) => return Ok(value),
                Err(e) => last_failure = format!("unparseable summary: {e}"),
            }
        } else {
            last_failure = output.stderr.trim().to_string();
        }
    }
    Err(ToolError::failed(
        "xcresulttool",
        format!("could not read {}: {last_failure}", bundle.display()),
    ))
}

/// Counts extracted from a summary document, tolerant of either the modern
/// top-level fields or the legacy `metrics` nesting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestCounts {
    pub total: u64,
    pub passed: u64,
    pub failed: u64,
    pub skipped: u64,
}

pub fn extract_counts(summary: &Value) -> TestCounts {
    let field = |names: &[&str]| -> u64 {
        for name in names {
            if let Some(n) = summary.get(*name).and_then(Value::as_u64) {
                return n;
            }
            if let Some(n) = summary
                .get("metrics")
                .and_then(|m| m.get(*name))
                .and_then(Value::as_u64)
            {
                return n;
            }
        }
        0
    };
    let mut counts = TestCounts {
        total: field(&["totalTestCount", "testsCount", "total"]),
        passed: field(&["passedTests", "testsPassedCount", "passed"]),
        failed: field(&["failedTests", "testsFailedCount", "failed"]),
        skipped: field(&["skippedTests", "testsSkippedCount", "skipped"]),
    };
    if counts.total == 0 {
        counts.total = counts.passed + counts.failed + counts.skipped;
    }
    counts
}
