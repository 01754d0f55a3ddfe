//! Build log sink with an optional pretty-formatter pipeline
//!
//! Raw xcodebuild output is teed three ways: lossless `log_raw` events for
//! JSON consumers, a bounded buffer for failure-time flushing, and the
//! stdin of an external pretty formatter (`xcpretty` or `xcbeautify`) whose
//! stdout comes back as `log` events. The sink fails open: a missing or
//! broken formatter degrades to raw line emission, and error-looking lines
//! always pass through even when the formatter would swallow them.
//!
//! One mutex guards the buffer, the pretty-line counter and the
//! switched-to-raw flag. Events are emitted outside the lock; the formatter
//! stdin has its own lock so a blocked child can never deadlock the reader
//! thread that drains its stdout.

use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::event::{Event, EventSink};

/// Lines of raw output retained for failure-time flushing.
const RAW_BUFFER_LINES: usize = 200;

/// Formatter selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Try `xcpretty`, then `xcbeautify`, else raw
    #[default]
    Auto,
    /// No formatter, every line is a `log`
    Raw,
    Xcpretty,
    Xcbeautify,
}

/// Substrings (matched case-insensitively) that mark a raw line as an error
/// the user must see even if the formatter drops it.
const ERROR_PATTERNS: &[&str] = &[
    "error:",
    "fatal error:",
    "clang: error:",
    "ld: error",
    "linker command failed",
    "command swiftcompile failed",
    "command compilec failed",
    "codesign error",
    "provisioning profile",
    "no such module",
    "failed with exit code",
];

fn is_error_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    ERROR_PATTERNS.iter().any(|p| lower.contains(p))
}

/// One recognized package-manager progress line.
#[derive(Debug, Clone, PartialEq)]
struct PackageProgress {
    action: &'static str,
    package: Option<String>,
}

struct PackagePatterns {
    updating: Regex,
    fetching: Regex,
    checking_out: Regex,
    creating: Regex,
}

impl PackagePatterns {
    fn new() -> Self {
        Self {
            updating: Regex::new(r"^Updating from (.+)$").unwrap(),
            fetching: Regex::new(r"^Fetching from (.+)$").unwrap(),
            checking_out: Regex::new("^Checking out [\"\u{201c}]([^\"\u{201d}]+)[\"\u{201d}]")
                .unwrap(),
            creating: Regex::new(
                "^Creating working copy of package [\"\u{201c}]([^\"\u{201d}]+)[\"\u{201d}]",
            )
            .unwrap(),
        }
    }

    fn parse(&self, line: &str) -> Option<PackageProgress> {
        let line = line.trim();
        if line.starts_with("Resolve Package Graph") {
            return Some(PackageProgress {
                action: "Resolving",
                package: None,
            });
        }
        if let Some(caps) = self.updating.captures(line) {
            return Some(PackageProgress {
                action: "Updating",
                package: Some(package_name_from_url(&caps[1])),
            });
        }
        if let Some(caps) = self.fetching.captures(line) {
            return Some(PackageProgress {
                action: "Fetching",
                package: Some(package_name_from_url(&caps[1])),
            });
        }
        if let Some(caps) = self.checking_out.captures(line) {
            return Some(PackageProgress {
                action: "Checking out",
                package: Some(caps[1].to_string()),
            });
        }
        if let Some(caps) = self.creating.captures(line) {
            return Some(PackageProgress {
                action: "Creating working copy of",
                package: Some(caps[1].to_string()),
            });
        }
        None
    }
}

/// Last path segment of a repository URL, without a `.git` suffix.
fn package_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed.rsplit('/').next().unwrap_or(trimmed);
    last.trim_end_matches(".git").to_string()
}

/// Accumulates consecutive same-action progress lines.
#[derive(Debug)]
struct PackageBatch {
    action: &'static str,
    names: Vec<String>,
    count: usize,
}

impl PackageBatch {
    fn new(progress: PackageProgress) -> Self {
        let mut batch = Self {
            action: progress.action,
            names: Vec::new(),
            count: 0,
        };
        batch.add(progress);
        batch
    }

    fn add(&mut self, progress: PackageProgress) {
        self.count += 1;
        if let Some(name) = progress.package {
            if self.names.len() < 3 {
                self.names.push(name);
            }
        }
    }

    fn message(&self) -> String {
        if self.names.is_empty() {
            return format!("SwiftPM: {} {} package(s)", self.action, self.count);
        }
        let mut listed = self.names.join(", ");
        if self.count > self.names.len() {
            listed.push('\u{2026}');
        }
        format!(
            "SwiftPM: {} {} package(s) ({})",
            self.action, self.count, listed
        )
    }
}

#[derive(Debug)]
struct BufferedLine {
    text: String,
    emitted: bool,
}

/// State behind the single sink mutex.
struct SinkState {
    raw_buffer: VecDeque<BufferedLine>,
    pretty_lines: u64,
    /// Set when a formatter write fails mid-run.
    raw_fallback: bool,
    pending_batch: Option<PackageBatch>,
}

struct PrettyChild {
    name: &'static str,
    child: Child,
    stdin: Mutex<Option<ChildStdin>>,
    reader: Option<JoinHandle<()>>,
}

/// The build log sink.
pub struct LogSink {
    command: String,
    sink: Arc<dyn EventSink>,
    state: Arc<Mutex<SinkState>>,
    pretty: Option<PrettyChild>,
    patterns: PackagePatterns,
}

/// Locate an executable on `PATH`.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(name);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

fn is_executable(path: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        path.metadata()
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }
    #[cfg(not(unix))]
    {
        path.is_file()
    }
}

fn formatter_candidates(format: LogFormat) -> &'static [&'static str] {
    match format {
        LogFormat::Auto => &["xcpretty", "xcbeautify"],
        LogFormat::Xcpretty => &["xcpretty"],
        LogFormat::Xcbeautify => &["xcbeautify"],
        LogFormat::Raw => &[],
    }
}

impl LogSink {
    /// Create a sink for one tool run.
    ///
    /// A formatter that cannot be found or started produces a `warning` and
    /// a raw-mode sink; it never fails the run.
    pub fn new(
        command: &str,
        sink: Arc<dyn EventSink>,
        format: LogFormat,
        format_args: &[String],
    ) -> Self {
        let state = Arc::new(Mutex::new(SinkState {
            raw_buffer: VecDeque::with_capacity(RAW_BUFFER_LINES),
            pretty_lines: 0,
            raw_fallback: false,
            pending_batch: None,
        }));

        let mut pretty = None;
        for name in formatter_candidates(format) {
            let Some(path) = find_on_path(name) else {
                continue;
            };
            match spawn_formatter(&path, format_args, command, &sink, &state) {
                Ok(child) => {
                    pretty = Some(child);
                    break;
                }
                Err(e) => {
                    sink.emit(&Event::warning(
                        command,
                        format!("failed to start {}: {}; trying next formatter", name, e),
                    ));
                }
            }
        }

        if pretty.is_none() && !matches!(format, LogFormat::Raw | LogFormat::Auto) {
            sink.emit(&Event::warning(
                command,
                format!(
                    "requested log formatter {:?} not found on PATH, using raw output",
                    format
                ),
            ));
        }

        Self {
            command: command.to_string(),
            sink,
            state,
            pretty,
            patterns: PackagePatterns::new(),
        }
    }

    /// Whether a formatter child is attached and healthy.
    pub fn pretty_active(&self) -> bool {
        self.pretty.is_some()
            && !self
                .state
                .lock()
                .map(|s| s.raw_fallback)
                .unwrap_or(true)
    }

    /// Feed one raw line of tool output.
    pub fn push_line(&self, line: &str) {
        if self.pretty_active() {
            self.push_pretty(line);
        } else {
            self.push_raw(line);
        }
    }

    /// Raw mode: package progress collapses into batches, everything else is
    /// a `log` event.
    fn push_raw(&self, line: &str) {
        let progress = self.patterns.parse(line);
        let mut to_emit: Vec<Event> = Vec::new();
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            match progress {
                Some(progress) => match state.pending_batch.take() {
                    Some(mut batch) if batch.action == progress.action => {
                        batch.add(progress);
                        state.pending_batch = Some(batch);
                    }
                    Some(finished) => {
                        to_emit.push(Event::log(&self.command, finished.message()));
                        state.pending_batch = Some(PackageBatch::new(progress));
                    }
                    None => {
                        state.pending_batch = Some(PackageBatch::new(progress));
                    }
                },
                None => {
                    if let Some(finished) = state.pending_batch.take() {
                        to_emit.push(Event::log(&self.command, finished.message()));
                    }
                    to_emit.push(Event::log(&self.command, line));
                }
            }
        }
        for event in &to_emit {
            self.sink.emit(event);
        }
    }

    /// Pretty mode: lossless `log_raw`, buffered for flushing, forwarded to
    /// the formatter; error-looking lines also pass through as `log`.
    fn push_pretty(&self, line: &str) {
        let error_line = is_error_line(line);
        let mut to_emit: Vec<Event> = Vec::new();
        to_emit.push(Event::log_raw(&self.command, line));
        {
            let mut state = match self.state.lock() {
                Ok(s) => s,
                Err(_) => return,
            };
            if state.raw_buffer.len() == RAW_BUFFER_LINES {
                state.raw_buffer.pop_front();
            }
            state.raw_buffer.push_back(BufferedLine {
                text: line.to_string(),
                // Error passthrough already shows this line; do not flush it
                // again at finalize.
                emitted: error_line,
            });
        }
        if error_line {
            to_emit.push(Event::log(&self.command, line));
        }
        for event in &to_emit {
            self.sink.emit(event);
        }

        let write_failed = match self.pretty.as_ref().and_then(|p| p.stdin.lock().ok()) {
            Some(mut stdin) => match stdin.as_mut() {
                Some(pipe) => writeln!(pipe, "{}", line).is_err(),
                None => false,
            },
            None => false,
        };
        if write_failed {
            let mut first = false;
            if let Ok(mut state) = self.state.lock() {
                first = !state.raw_fallback;
                state.raw_fallback = true;
            }
            if first {
                self.sink.emit(&Event::warning(
                    &self.command,
                    "formatter pipe broke, continuing with raw output",
                ));
            }
        }
    }

    /// Close the run: shut down the formatter, then flush whatever a failed
    /// or silent formatter run would otherwise hide.
    pub fn finalize(mut self, exit_code: Option<i32>, wait_error: Option<&str>) {
        // A pending package batch flushes unconditionally.
        let pending = self
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.pending_batch.take());
        if let Some(batch) = pending {
            self.sink.emit(&Event::log(&self.command, batch.message()));
        }

        let mut formatter_error: Option<String> = None;
        let had_pretty = self.pretty.is_some();
        if let Some(mut pretty) = self.pretty.take() {
            // Dropping stdin sends EOF; the reader thread drains the rest.
            if let Ok(mut stdin) = pretty.stdin.lock() {
                stdin.take();
            }
            if let Some(reader) = pretty.reader.take() {
                let _ = reader.join();
            }
            match pretty.child.wait() {
                Ok(status) if !status.success() => {
                    formatter_error =
                        Some(format!("{} exited with {:?}", pretty.name, status.code()));
                }
                Err(e) => formatter_error = Some(format!("{} wait failed: {}", pretty.name, e)),
                Ok(_) => {}
            }
        }

        if !had_pretty {
            return;
        }

        let build_failed = wait_error.is_some() || exit_code.map(|c| c != 0).unwrap_or(true);
        let (pretty_lines, unemitted): (u64, Vec<String>) = match self.state.lock() {
            Ok(mut state) => {
                let lines = state
                    .raw_buffer
                    .iter_mut()
                    .filter(|l| !l.emitted)
                    .map(|l| {
                        l.emitted = true;
                        l.text.clone()
                    })
                    .collect();
                (state.pretty_lines, lines)
            }
            Err(_) => return,
        };

        let reason = if pretty_lines == 0 {
            Some("log formatter produced no output".to_string())
        } else if let Some(err) = formatter_error {
            Some(format!("log formatter failed: {}", err))
        } else if build_failed {
            Some(match wait_error {
                Some(err) => format!("build failed: {}", err),
                None => format!(
                    "build failed with exit code {}",
                    exit_code.map(|c| c.to_string()).unwrap_or_else(|| "?".into())
                ),
            })
        } else {
            None
        };

        if let Some(reason) = reason {
            if !unemitted.is_empty() {
                self.sink.emit(&Event::warning(
                    &self.command,
                    format!("{}; replaying {} raw line(s)", reason, unemitted.len()),
                ));
                for line in unemitted {
                    self.sink.emit(&Event::log(&self.command, line));
                }
            }
        }
    }
}

fn spawn_formatter(
    path: &Path,
    args: &[String],
    command: &str,
    sink: &Arc<dyn EventSink>,
    state: &Arc<Mutex<SinkState>>,
) -> std::io::Result<PrettyChild> {
    let name: &'static str = if path.ends_with("xcbeautify") || path.to_string_lossy().ends_with("xcbeautify") {
        "xcbeautify"
    } else {
        "xcpretty"
    };
    let mut child = Command::new(path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let sink = Arc::clone(sink);
    let state = Arc::clone(state);
    let command = command.to_string();
    let reader = std::thread::spawn(move || {
        let Some(stdout) = stdout else { return };
        let reader = BufReader::new(stdout);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            if let Ok(mut state) = state.lock() {
                state.pretty_lines += 1;
            }
            // Emit outside the state lock.
            sink.emit(
                &Event::log(&command, line).with_data(serde_json::json!({ "pretty": true })),
            );
        }
    });

    Ok(PrettyChild {
        name,
        child,
        stdin: Mutex::new(stdin),
        reader: Some(reader),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{CollectSink, EventType};

    fn raw_sink(collect: &Arc<CollectSink>) -> LogSink {
        LogSink::new(
            "build",
            Arc::clone(collect) as Arc<dyn EventSink>,
            LogFormat::Raw,
            &[],
        )
    }

    #[test]
    fn test_raw_mode_emits_every_line_once() {
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("CompileSwift normal arm64");
        sink.push_line("Ld /tmp/App.app/App normal");
        sink.finalize(Some(0), None);

        let events = collect.events();
        let logs: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::Log)
            .collect();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message.as_deref(), Some("CompileSwift normal arm64"));
        assert!(!events.iter().any(|e| e.event_type == EventType::LogRaw));
        assert!(!events.iter().any(|e| e.event_type == EventType::Warning));
    }

    #[test]
    fn test_package_batch_single_event() {
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("Updating from https://github.com/pointfreeco/swift-snapshot-testing.git");
        sink.push_line("Updating from https://github.com/apple/swift-collections.git");
        sink.push_line("Updating from https://github.com/apple/swift-argument-parser");
        sink.push_line("Updating from https://github.com/apple/swift-log.git");
        sink.push_line("CompileSwift normal arm64");
        sink.finalize(Some(0), None);

        let events = collect.events();
        let batches: Vec<_> = events
            .iter()
            .filter(|e| {
                e.message
                    .as_deref()
                    .map(|m| m.starts_with("SwiftPM: Updating"))
                    .unwrap_or(false)
            })
            .collect();
        assert_eq!(batches.len(), 1, "consecutive updates collapse to one event");
        let message = batches[0].message.as_deref().unwrap();
        assert!(message.starts_with("SwiftPM: Updating 4 package(s) ("));
        assert!(message.contains("swift-snapshot-testing"));
        assert!(message.contains('\u{2026}'), "more than three names elides");
    }

    #[test]
    fn test_action_change_flushes_batch() {
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("Fetching from https://github.com/apple/swift-nio.git");
        sink.push_line("Checking out \u{201c}swift-nio\u{201d}");
        sink.finalize(Some(0), None);

        let messages: Vec<String> = collect
            .events()
            .iter()
            .filter_map(|e| e.message.clone())
            .collect();
        assert_eq!(
            messages,
            vec![
                "SwiftPM: Fetching 1 package(s) (swift-nio)".to_string(),
                "SwiftPM: Checking out 1 package(s) (swift-nio)".to_string(),
            ]
        );
    }

    #[test]
    fn test_pending_batch_flushed_at_finalize() {
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("Checking out \"swift-log\"");
        sink.finalize(Some(0), None);

        let messages: Vec<String> = collect
            .events()
            .iter()
            .filter_map(|e| e.message.clone())
            .collect();
        assert_eq!(messages, vec!["SwiftPM: Checking out 1 package(s) (swift-log)"]);
    }

    #[test]
    fn test_error_patterns() {
        assert!(is_error_line("main.swift:4:1: error: use of unresolved identifier"));
        assert!(is_error_line("clang: error: no such file or directory"));
        assert!(is_error_line("ld: error: undefined symbol"));
        assert!(is_error_line("Command SwiftCompile failed with a nonzero exit code"));
        assert!(is_error_line("No such module 'Foundation2'"));
        assert!(is_error_line("error: no provisioning profile matches"));
        assert!(!is_error_line("CompileSwift normal arm64 App.swift"));
        assert!(!is_error_line("note: using cached build"));
    }

    #[test]
    fn test_package_name_from_url() {
        assert_eq!(
            package_name_from_url("https://github.com/apple/swift-nio.git"),
            "swift-nio"
        );
        assert_eq!(
            package_name_from_url("https://github.com/apple/swift-nio"),
            "swift-nio"
        );
        assert_eq!(package_name_from_url("swift-nio"), "swift-nio");
    }

    #[test]
    fn test_resolve_package_graph_has_no_names() {
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("Resolve Package Graph");
        sink.finalize(Some(0), None);

        let messages: Vec<String> = collect
            .events()
            .iter()
            .filter_map(|e| e.message.clone())
            .collect();
        assert_eq!(messages, vec!["SwiftPM: Resolving 1 package(s)"]);
    }

    #[test]
    fn test_raw_mode_no_finalize_warning_on_failure() {
        // No formatter: failure-time replay does not apply.
        let collect = Arc::new(CollectSink::new());
        let sink = raw_sink(&collect);
        sink.push_line("error: something broke");
        sink.finalize(Some(65), None);

        let events = collect.events();
        assert!(!events.iter().any(|e| e.event_type == EventType::Warning));
        // The error line itself was emitted exactly once.
        let logs: Vec<_> = events
            .iter()
            .filter(|e| e.event_type == EventType::Log)
            .collect();
        assert_eq!(logs.len(), 1);
    }
}
