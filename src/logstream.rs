//! Unified-log streaming and app-console mirroring (simulator runs)

use chrono::Utc;
use regex_lite::Regex;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cancel::CancelToken;
use crate::process::{LineHandler, ProcessError, StreamSource};
use crate::tools::Xcrun;

/// Substrings that promote a stderr console line to fatal.
const FATAL_PATTERNS: &[&str] = &[
    "fatal error",
    "uncaught exception",
    "precondition failed",
    "assertion failed",
    "libc++abi: terminating",
    "sigabrt",
    "sigsegv",
    "abort() called",
    "dyld: library not loaded",
];

/// Derive the `log stream` predicate from app metadata.
///
/// Returns `None` when there is nothing to subscribe on.
pub fn predicate(executable: &str, bundle_id: &str, include_system: bool) -> Option<String> {
    match (executable.is_empty(), bundle_id.is_empty()) {
        (false, false) if !include_system => Some(format!(
            "process == \"{executable}\" AND (subsystem == \"{bundle_id}\" OR subsystem BEGINSWITH \"{bundle_id}.\")"
        )),
        (false, _) => Some(format!("process == \"{executable}\"")),
        (true, false) => Some(format!(
            "subsystem == \"{bundle_id}\" OR subsystem BEGINSWITH \"{bundle_id}.\""
        )),
        (true, true) => None,
    }
}

/// A unified-log line mirrored onto the launch child's console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirroredLine {
    pub level: String,
    pub process: String,
    pub subsystem: String,
    pub message: String,
}

/// Formats launch-child console lines for display.
pub struct MirrorFormat {
    /// Name shown on synthetic lines.
    pub display_name: String,
    /// Drop mirrored lines outside this subsystem (and its children).
    pub subsystem_filter: Option<String>,
    /// Drop mirrored lines entirely; the live log stream already has them.
    pub dedup_with_stream: bool,
    mirror: Regex,
}

impl MirrorFormat {
    pub fn new(
        display_name: String,
        subsystem_filter: Option<String>,
        dedup_with_stream: bool,
    ) -> Self {
        // 2026-03-14 09:26:53.123 I App[512:4099] [com.example.app] message
        let mirror = Regex::new(
            r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\.\d+\s+(\S+)\s+(\S+)\[\d+:\d+\]\s+\[([^\]]*)\]\s?(.*)$",
        )
        .expect("mirror pattern is valid");
        Self {
            display_name,
            subsystem_filter,
            dedup_with_stream,
            mirror,
        }
    }

    /// Recognize a mirrored unified-log line.
    pub fn parse_mirrored(&self, line: &str) -> Option<MirroredLine> {
        let caps = self.mirror.captures(line)?;
        Some(MirroredLine {
            level: caps[1].to_string(),
            process: caps[2].to_string(),
            subsystem: caps[3].to_string(),
            message: caps[4].to_string(),
        })
    }

    /// Format one console line; `None` means drop it.
    pub fn format_line(&self, line: &str, source: StreamSource) -> Option<String> {
        if let Some(mirrored) = self.parse_mirrored(line) {
            if self.dedup_with_stream {
                return None;
            }
            if let Some(filter) = &self.subsystem_filter {
                let child_prefix = format!("{filter}.");
                if mirrored.subsystem != *filter && !mirrored.subsystem.starts_with(&child_prefix) {
                    return None;
                }
            }
            return Some(line.to_string());
        }
        Some(self.synthetic(line, source))
    }

    /// Decorate a plain stdout/stderr line in the mirrored shape.
    fn synthetic(&self, line: &str, source: StreamSource) -> String {
        let level = match source {
            StreamSource::Stdout => "I",
            StreamSource::Stderr => {
                if is_fatal_line(line) {
                    "F"
                } else {
                    "W"
                }
            }
        };
        format!(
            "{} {} {}[0:0] {}",
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
            level,
            self.display_name,
            line
        )
    }
}

fn is_fatal_line(line: &str) -> bool {
    let folded = line.to_ascii_lowercase();
    FATAL_PATTERNS.iter().any(|p| folded.contains(p))
}

/// A background `log stream` subscription on a simulator.
///
/// The subscription runs `xcrun simctl spawn <udid> log stream` on its own
/// thread with its own token, so tearing it down never races the launch
/// child's own cancellation.
pub struct LogStreamer {
    token: CancelToken,
    thread: Option<JoinHandle<Result<(), ProcessError>>>,
}

impl LogStreamer {
    pub fn start(
        xcrun: &Xcrun,
        udid: &str,
        predicate: &str,
        levels: &[String],
        handler: Arc<dyn LineHandler>,
    ) -> Self {
        let mut args = vec![
            "spawn".to_string(),
            udid.to_string(),
            "log".to_string(),
            "stream".to_string(),
            "--style".to_string(),
            "compact".to_string(),
            "--predicate".to_string(),
            predicate.to_string(),
        ];
        if levels.iter().any(|l| l == "debug") {
            args.push("--level".to_string());
            args.push("debug".to_string());
        }
        let request = xcrun.request(
            "simctl",
            &args.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        let token = CancelToken::new();
        let thread_token = token.clone();
        let thread = std::thread::spawn(move || {
            crate::process::run_streaming(&request, &thread_token, handler).map(|_| ())
        });
        Self {
            token,
            thread: Some(thread),
        }
    }

    /// Tear the subscription down and wait for the reader to drain.
    pub fn stop(mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for LogStreamer {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn predicate_prefers_process_and_subsystem() {
        assert_eq!(
            predicate("App", "com.example.app", false).as_deref(),
            Some(
                "process == \"App\" AND (subsystem == \"com.example.app\" OR subsystem BEGINSWITH \"com.example.app.\")"
            )
        );
        assert_eq!(
            predicate("App", "com.example.app", true).as_deref(),
            Some("process == \"App\"")
        );
        assert_eq!(
            predicate("", "com.example.app", false).as_deref(),
            Some("subsystem == \"com.example.app\" OR subsystem BEGINSWITH \"com.example.app.\"")
        );
        assert_eq!(predicate("", "", false), None);
    }

    #[test]
    fn mirrored_lines_pass_subsystem_filter() {
        let format = MirrorFormat::new(
            "App".to_string(),
            Some("com.example.app".to_string()),
            false,
        );
        let own = "2026-03-14 09:26:53.123 I App[512:4099] [com.example.app.net] request sent";
        let foreign = "2026-03-14 09:26:53.200 D kernel[0:100] [com.apple.network] noise";
        assert_eq!(format.format_line(own, StreamSource::Stdout).as_deref(), Some(own));
        assert_eq!(format.format_line(foreign, StreamSource::Stdout), None);
    }

    #[test]
    fn dedup_drops_all_mirrored_lines() {
        let format = MirrorFormat::new("App".to_string(), None, true);
        let mirrored = "2026-03-14 09:26:53.123 I App[512:4099] [com.example.app] hello";
        assert_eq!(format.format_line(mirrored, StreamSource::Stdout), None);
        assert!(format.format_line("plain print", StreamSource::Stdout).is_some());
    }

    #[test]
    fn synthetic_lines_carry_level_and_name() {
        let format = MirrorFormat::new("App".to_string(), None, false);
        let info = format.format_line("hello", StreamSource::Stdout).unwrap();
        assert!(info.contains(" I App[0:0] hello"), "got {info}");
        let warn = format.format_line("careful", StreamSource::Stderr).unwrap();
        assert!(warn.contains(" W App[0:0] careful"), "got {warn}");
    }

    #[test]
    fn fatal_patterns_promote_stderr() {
        let format = MirrorFormat::new("App".to_string(), None, false);
        for line in [
            "Fatal error: unexpectedly found nil",
            "libc++abi: terminating with uncaught exception",
            "Precondition failed: index out of range",
            "dyld: Library not loaded: @rpath/Missing.framework",
        ] {
            let out = format.format_line(line, StreamSource::Stderr).unwrap();
            assert!(out.contains(" F App[0:0] "), "expected fatal for {line:?}, got {out}");
        }
    }
}
