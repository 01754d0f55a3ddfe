//! Structured event stream for xcbolt
//!
//! Every user-visible record the pipelines produce flows through an
//! [`EventSink`]: status lines, raw and formatted build output, warnings,
//! errors and final results. Two sinks exist: a human text sink and a
//! newline-delimited JSON sink with a versioned schema for CI consumers.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::Write;
use std::sync::Mutex;
use thiserror::Error;

/// Current event schema version emitted by the JSON sink.
pub const EVENT_SCHEMA_VERSION: u32 = 2;

/// Event record type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Progress and lifecycle notices
    Status,
    /// A line of (possibly formatted) tool output
    Log,
    /// A lossless raw line, kept alongside pretty-printed output
    LogRaw,
    /// Non-fatal problem; the pipeline continues
    Warning,
    /// Fatal problem; a result(failure) usually follows
    Error,
    /// Terminal outcome of a command
    Result,
}

/// Severity attached to an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Info,
    Warn,
    Error,
}

/// Machine-readable error payload carried on error events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Stable error code (e.g. `XCODEBUILD_FAILED`)
    pub code: String,

    /// Human-readable message
    pub message: String,

    /// Longer detail, often raw tool output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Actionable suggestion for the user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ErrorObject {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            suggestion: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

/// An immutable event record.
///
/// Field names are the stable wire schema: `version`, `timestamp`,
/// `command`, `type`, `level`, `code`, `message`, `data`, `error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Schema version (always [`EVENT_SCHEMA_VERSION`] for new events)
    pub version: u32,

    /// RFC-3339 UTC timestamp with nanosecond precision
    pub timestamp: String,

    /// Command that produced the event (`build`, `test`, `run`, ...)
    pub command: String,

    /// Event record type
    #[serde(rename = "type")]
    pub event_type: EventType,

    /// Severity, when meaningful
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<Level>,

    /// Stable machine code, when the event carries one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,

    /// Human-readable message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Structured payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Error payload (error events)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorObject>,
}

fn now_rfc3339_nanos() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl Event {
    fn base(command: &str, event_type: EventType) -> Self {
        Self {
            version: EVENT_SCHEMA_VERSION,
            timestamp: now_rfc3339_nanos(),
            command: command.to_string(),
            event_type,
            level: None,
            code: None,
            message: None,
            data: None,
            error: None,
        }
    }

    /// A status event (info level).
    pub fn status(command: &str, message: impl Into<String>) -> Self {
        let mut ev = Self::base(command, EventType::Status);
        ev.level = Some(Level::Info);
        ev.message = Some(message.into());
        ev
    }

    /// A log line.
    pub fn log(command: &str, message: impl Into<String>) -> Self {
        let mut ev = Self::base(command, EventType::Log);
        ev.level = Some(Level::Info);
        ev.message = Some(message.into());
        ev
    }

    /// A lossless raw log line (suppressed by the text sink).
    pub fn log_raw(command: &str, message: impl Into<String>) -> Self {
        let mut ev = Self::base(command, EventType::LogRaw);
        ev.level = Some(Level::Info);
        ev.message = Some(message.into());
        ev
    }

    /// A warning event.
    pub fn warning(command: &str, message: impl Into<String>) -> Self {
        let mut ev = Self::base(command, EventType::Warning);
        ev.level = Some(Level::Warn);
        ev.message = Some(message.into());
        ev
    }

    /// An error event carrying a structured error object.
    pub fn error(command: &str, error: ErrorObject) -> Self {
        let mut ev = Self::base(command, EventType::Error);
        ev.level = Some(Level::Error);
        ev.code = Some(error.code.clone());
        ev.error = Some(error);
        ev
    }

    /// A terminal result event. `success` lands in `data.success`.
    pub fn result(command: &str, success: bool) -> Self {
        let mut ev = Self::base(command, EventType::Result);
        ev.level = Some(if success { Level::Info } else { Level::Error });
        ev.data = Some(serde_json::json!({ "success": success }));
        ev
    }

    /// Attach a structured payload, merging into any existing object.
    pub fn with_data(mut self, data: Value) -> Self {
        match (self.data.take(), data) {
            (Some(Value::Object(mut base)), Value::Object(extra)) => {
                base.extend(extra);
                self.data = Some(Value::Object(base));
            }
            (_, data) => self.data = Some(data),
        }
        self
    }
}

/// Errors constructing or driving a sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The caller requested an event schema version this build cannot emit
    #[error("unsupported event schema version {requested} (current: {current})")]
    UnsupportedVersion { requested: u32, current: u32 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives events. Implementations must be safe for concurrent emission;
/// the process runner calls `emit` from its reader threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
    fn flush(&self);
}

/// Newline-delimited JSON sink. One event per line, one trailing newline.
#[derive(Debug)]
pub struct JsonSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    /// Create a JSON sink emitting the given schema version.
    ///
    /// Requesting any version other than [`EVENT_SCHEMA_VERSION`] is a
    /// configuration error detected here, not at emit time.
    pub fn new(writer: W, version: u32) -> Result<Self, SinkError> {
        if version != EVENT_SCHEMA_VERSION {
            return Err(SinkError::UnsupportedVersion {
                requested: version,
                current: EVENT_SCHEMA_VERSION,
            });
        }
        Ok(Self {
            writer: Mutex::new(writer),
        })
    }
}

impl<W: Write + Send> EventSink for JsonSink<W> {
    fn emit(&self, event: &Event) {
        let line = match serde_json::to_string(event) {
            Ok(line) => line,
            Err(e) => {
                // Fallback line of the same schema so consumers never see a
                // hole in the stream.
                serde_json::json!({
                    "version": EVENT_SCHEMA_VERSION,
                    "timestamp": now_rfc3339_nanos(),
                    "command": event.command,
                    "type": "error",
                    "level": "error",
                    "message": format!("failed to encode event: {}", e),
                })
                .to_string()
            }
        };
        if let Ok(mut w) = self.writer.lock() {
            let _ = writeln!(w, "{}", line);
            let _ = w.flush();
        }
    }

    fn flush(&self) {
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.flush();
        }
    }
}

/// Human-readable text sink.
pub struct TextSink<W: Write + Send> {
    writer: Mutex<W>,
}

impl<W: Write + Send> TextSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> EventSink for TextSink<W> {
    fn emit(&self, event: &Event) {
        // Raw lines only exist for lossless JSON consumers.
        if event.event_type == EventType::LogRaw {
            return;
        }
        let mut w = match self.writer.lock() {
            Ok(w) => w,
            Err(_) => return,
        };
        if let Some(ref message) = event.message {
            let _ = match event.level {
                Some(Level::Warn) => writeln!(w, "[warn] {}", message),
                Some(Level::Error) => writeln!(w, "[error] {}", message),
                _ => writeln!(w, "{}", message),
            };
        } else if let Some(ref err) = event.error {
            let _ = writeln!(w, "error[{}]: {}", err.code, err.message);
            if let Some(ref suggestion) = err.suggestion {
                let _ = writeln!(w, "  hint: {}", suggestion);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut w) = self.writer.lock() {
            let _ = w.flush();
        }
    }
}

/// In-memory sink for tests and stand-ins.
#[derive(Default)]
pub struct CollectSink {
    events: Mutex<Vec<Event>>,
}

impl CollectSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything emitted so far.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl EventSink for CollectSink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }

    fn flush(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_lines(buf: &[u8]) -> Vec<serde_json::Value> {
        String::from_utf8_lossy(buf)
            .lines()
            .map(|l| serde_json::from_str(l).expect("each line is valid JSON"))
            .collect()
    }

    #[test]
    fn test_json_sink_one_event_per_line() {
        let sink = JsonSink::new(Vec::new(), EVENT_SCHEMA_VERSION).unwrap();
        sink.emit(&Event::status("build", "Resolving destination"));
        sink.emit(&Event::log("build", "CompileSwift normal arm64"));

        let buf = sink.writer.into_inner().unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.ends_with('\n'));
        assert!(!text.ends_with("\n\n"));
        assert_eq!(decode_lines(&buf).len(), 2);
    }

    #[test]
    fn test_json_sink_required_keys_no_legacy_keys() {
        let sink = JsonSink::new(Vec::new(), EVENT_SCHEMA_VERSION).unwrap();
        sink.emit(&Event::result("test", true));
        sink.emit(&Event::error(
            "run",
            ErrorObject::new("SIM_LAUNCH_FAILED", "launch failed"),
        ));

        for value in decode_lines(&sink.writer.into_inner().unwrap()) {
            let obj = value.as_object().unwrap();
            for key in ["version", "timestamp", "command", "type"] {
                assert!(obj.contains_key(key), "missing required key {}", key);
            }
            for legacy in ["v", "ts", "cmd"] {
                assert!(!obj.contains_key(legacy), "legacy key {} present", legacy);
            }
            assert_eq!(obj["version"], EVENT_SCHEMA_VERSION);
        }
    }

    #[test]
    fn test_json_sink_rejects_other_versions() {
        let err = JsonSink::new(Vec::new(), 1).unwrap_err();
        match err {
            SinkError::UnsupportedVersion { requested, current } => {
                assert_eq!(requested, 1);
                assert_eq!(current, EVENT_SCHEMA_VERSION);
            }
            other => panic!("expected UnsupportedVersion, got {:?}", other),
        }
        assert!(JsonSink::new(Vec::new(), 3).is_err());
    }

    #[test]
    fn test_text_sink_renders_levels() {
        let sink = TextSink::new(Vec::new());
        sink.emit(&Event::status("build", "Building App"));
        sink.emit(&Event::warning("build", "formatter unavailable"));

        let text = String::from_utf8(sink.writer.into_inner().unwrap()).unwrap();
        assert_eq!(text, "Building App\n[warn] formatter unavailable\n");
    }

    #[test]
    fn test_text_sink_suppresses_raw_and_renders_error_hint() {
        let sink = TextSink::new(Vec::new());
        sink.emit(&Event::log_raw("build", "CompileC something.o"));
        sink.emit(&Event::error(
            "run",
            ErrorObject::new("SCHEME_REQUIRED", "no scheme selected")
                .with_suggestion("pass --scheme or run `xcbolt init`"),
        ));

        let text = String::from_utf8(sink.writer.into_inner().unwrap()).unwrap();
        assert_eq!(
            text,
            "error[SCHEME_REQUIRED]: no scheme selected\n  hint: pass --scheme or run `xcbolt init`\n"
        );
    }

    #[test]
    fn test_error_event_carries_code() {
        let ev = Event::error(
            "run",
            ErrorObject::new("BUNDLE_ID_MISSING", "Info.plist has no CFBundleIdentifier")
                .with_detail("at /tmp/App.app"),
        );
        assert_eq!(ev.code.as_deref(), Some("BUNDLE_ID_MISSING"));
        assert_eq!(ev.level, Some(Level::Error));
        assert_eq!(
            ev.error.as_ref().unwrap().detail.as_deref(),
            Some("at /tmp/App.app")
        );
    }

    #[test]
    fn test_timestamp_has_nanosecond_precision() {
        let ev = Event::status("build", "x");
        // 2026-01-01T00:00:00.123456789Z
        let frac = ev
            .timestamp
            .split('.')
            .nth(1)
            .expect("timestamp has a fractional part");
        assert_eq!(frac.trim_end_matches('Z').len(), 9);
    }

    #[test]
    fn test_with_data_merges_objects() {
        let ev = Event::result("run", true).with_data(serde_json::json!({"pid": 42}));
        let data = ev.data.unwrap();
        assert_eq!(data["success"], true);
        assert_eq!(data["pid"], 42);
    }
}
