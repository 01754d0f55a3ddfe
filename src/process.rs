//! Child process runner with line streaming and cooperative cancellation
//!
//! Children are started in their own process group so cancellation can
//! signal the whole subtree. Stdout and stderr are drained by one reader
//! thread each, delivering lines in stream order to a shared handler.
//!
//! Cancellation protocol: SIGINT to the group; after a 3 second grace,
//! SIGTERM; after a further 3 seconds, SIGKILL and an unconditional wait.

use std::collections::HashMap;
use std::io::{self, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::cancel::CancelToken;

/// Initial line buffer; grows on demand.
const INITIAL_LINE_CAPACITY: usize = 64 * 1024;

/// Hard cap on a single line. Exceeding it is a fatal stream error, never a
/// silent truncation.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// Grace period between escalation steps when cancelling.
const CANCEL_GRACE: Duration = Duration::from_secs(3);

/// Poll interval while waiting on a child.
const WAIT_POLL: Duration = Duration::from_millis(50);

/// Errors from running a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The child could not be started at all.
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The run was cancelled via the shared token.
    #[error("cancelled")]
    Cancelled,

    /// A policy deadline expired before the child exited.
    #[error("timed out after {:?}", .0)]
    TimedOut(Duration),

    /// A stream produced a line larger than [`MAX_LINE_BYTES`].
    #[error("line exceeds {max} bytes on {stream}")]
    LineTooLong { stream: StreamSource, max: usize },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamSource::Stdout => write!(f, "stdout"),
            StreamSource::Stderr => write!(f, "stderr"),
        }
    }
}

/// Receives lines from the reader threads. Called from two threads at once.
pub trait LineHandler: Send + Sync {
    fn on_line(&self, source: StreamSource, line: &str);

    /// A stream failed mid-read (oversized line or pipe error).
    fn on_stream_error(&self, source: StreamSource, error: &ProcessError) {
        let _ = (source, error);
    }
}

impl<F> LineHandler for F
where
    F: Fn(StreamSource, &str) + Send + Sync,
{
    fn on_line(&self, source: StreamSource, line: &str) {
        self(source, line)
    }
}

/// Everything needed to launch one child.
#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    /// Merged over the inherited environment; overrides win.
    pub env: HashMap<String, String>,
    /// Deliver empty lines verbatim instead of dropping them.
    pub retain_empty_lines: bool,
}

impl ProcessRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            working_dir: None,
            env: HashMap::new(),
            retain_empty_lines: false,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn retain_empty_lines(mut self, retain: bool) -> Self {
        self.retain_empty_lines = retain;
        self
    }
}

/// Result of a completed (or cancelled) run.
#[derive(Debug)]
pub struct RunOutcome {
    /// Exit code, when the child exited normally.
    pub exit_code: Option<i32>,
    /// Child pid.
    pub pid: u32,
    /// Wall-clock duration.
    pub elapsed: Duration,
    /// Post-start failure, cancellation taking precedence over exit status.
    pub wait_error: Option<ProcessError>,
    /// Whether the shared token fired during the run.
    pub cancelled: bool,
}

impl RunOutcome {
    /// True when the child exited zero and nothing went wrong.
    pub fn success(&self) -> bool {
        self.wait_error.is_none() && self.exit_code == Some(0)
    }
}

/// Captured output of a short-lived invocation.
#[derive(Debug, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CapturedOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Stdout followed by stderr, for pattern scans across both.
    pub fn combined(&self) -> String {
        let mut s = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !s.is_empty() && !s.ends_with('\n') {
                s.push('\n');
            }
            s.push_str(&self.stderr);
        }
        s
    }
}

fn spawn_in_group(request: &ProcessRequest, stdio: fn() -> Stdio) -> Result<Child, ProcessError> {
    let mut command = Command::new(&request.program);
    command
        .args(&request.args)
        .envs(&request.env)
        .stdin(Stdio::null())
        .stdout(stdio())
        .stderr(stdio());
    if let Some(ref dir) = request.working_dir {
        command.current_dir(dir);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
    command.spawn().map_err(|source| ProcessError::Spawn {
        program: request.program.clone(),
        source,
    })
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;
    let _ = killpg(Pid::from_raw(pid as i32), signal);
}

/// Escalating teardown of the child's process group.
fn terminate_group(child: &mut Child) -> io::Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::Signal;

        let pid = child.id();
        for signal in [Signal::SIGINT, Signal::SIGTERM] {
            signal_group(pid, signal);
            let start = Instant::now();
            while start.elapsed() < CANCEL_GRACE {
                if child.try_wait()?.is_some() {
                    return Ok(());
                }
                thread::sleep(WAIT_POLL);
            }
        }
        signal_group(pid, Signal::SIGKILL);
    }
    #[cfg(not(unix))]
    {
        let _ = child.kill();
    }
    let _ = child.wait();
    Ok(())
}

/// Read `source` line by line, delivering to `handler`.
///
/// Lines are delivered without their trailing newline (a trailing `\r` is
/// trimmed too). A line that outgrows [`MAX_LINE_BYTES`] aborts the stream
/// with a fatal error; the remaining bytes are drained so the child is not
/// blocked on a full pipe.
fn scan_lines<R: Read>(
    reader: R,
    source: StreamSource,
    retain_empty: bool,
    handler: &dyn LineHandler,
) -> Result<(), ProcessError> {
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::with_capacity(INITIAL_LINE_CAPACITY);
    let mut byte = [0u8; 1];
    let mut chunk = [0u8; 8192];

    loop {
        buf.clear();
        let mut saw_any = false;
        loop {
            match reader.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    saw_any = true;
                    if byte[0] == b'\n' {
                        break;
                    }
                    if buf.len() >= MAX_LINE_BYTES {
                        let err = ProcessError::LineTooLong {
                            stream: source,
                            max: MAX_LINE_BYTES,
                        };
                        handler.on_stream_error(source, &err);
                        // Drain so the child does not block on a full pipe.
                        while let Ok(n) = reader.read(&mut chunk) {
                            if n == 0 {
                                break;
                            }
                        }
                        return Err(err);
                    }
                    buf.push(byte[0]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    let err = ProcessError::Io(e);
                    handler.on_stream_error(source, &err);
                    return Err(err);
                }
            }
        }
        if !saw_any {
            return Ok(());
        }
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf);
        if !line.is_empty() || retain_empty {
            handler.on_line(source, &line);
        }
    }
}

/// Run a child to completion, streaming its output through `handler`.
///
/// Start failure is returned immediately. Everything after a successful
/// start lands in the [`RunOutcome`], with cancellation reported in
/// preference to the exit status.
pub fn run_streaming(
    request: &ProcessRequest,
    token: &CancelToken,
    handler: Arc<dyn LineHandler>,
) -> Result<RunOutcome, ProcessError> {
    let start = Instant::now();
    let mut child = spawn_in_group(request, Stdio::piped)?;
    let pid = child.id();

    let retain = request.retain_empty_lines;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let out_handler = Arc::clone(&handler);
    let stdout_thread = thread::spawn(move || match stdout {
        Some(pipe) => scan_lines(pipe, StreamSource::Stdout, retain, out_handler.as_ref()),
        None => Ok(()),
    });
    let err_handler = Arc::clone(&handler);
    let stderr_thread = thread::spawn(move || match stderr {
        Some(pipe) => scan_lines(pipe, StreamSource::Stderr, retain, err_handler.as_ref()),
        None => Ok(()),
    });

    let mut cancelled = false;
    let status = loop {
        if token.is_cancelled() {
            cancelled = true;
            terminate_group(&mut child)?;
            break child.wait()?;
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(WAIT_POLL),
        }
    };

    let stdout_result = stdout_thread.join().unwrap_or(Ok(()));
    let stderr_result = stderr_thread.join().unwrap_or(Ok(()));

    let wait_error = if cancelled {
        Some(ProcessError::Cancelled)
    } else if let Err(e) = stdout_result {
        Some(e)
    } else if let Err(e) = stderr_result {
        Some(e)
    } else {
        None
    };

    Ok(RunOutcome {
        exit_code: status.code(),
        pid,
        elapsed: start.elapsed(),
        wait_error,
        cancelled,
    })
}

/// Run a short-lived child, capturing stdout/stderr whole, with a deadline.
///
/// On deadline expiry or cancellation the group is torn down with the usual
/// escalation and the distinguished error is returned.
pub fn run_capture(
    request: &ProcessRequest,
    token: &CancelToken,
    timeout: Option<Duration>,
) -> Result<CapturedOutput, ProcessError> {
    let start = Instant::now();
    let mut child = spawn_in_group(request, Stdio::piped)?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();
    let stdout_thread = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stdout_pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });
    let stderr_thread = thread::spawn(move || {
        let mut buf = String::new();
        if let Some(ref mut pipe) = stderr_pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let mut failure: Option<ProcessError> = None;
    let status = loop {
        if token.is_cancelled() {
            terminate_group(&mut child)?;
            failure = Some(ProcessError::Cancelled);
            break child.wait()?;
        }
        if let Some(limit) = timeout {
            if start.elapsed() > limit {
                terminate_group(&mut child)?;
                failure = Some(ProcessError::TimedOut(limit));
                break child.wait()?;
            }
        }
        match child.try_wait()? {
            Some(status) => break status,
            None => thread::sleep(WAIT_POLL),
        }
    };

    let stdout = stdout_thread.join().unwrap_or_default();
    let stderr = stderr_thread.join().unwrap_or_default();

    if let Some(err) = failure {
        return Err(err);
    }

    Ok(CapturedOutput {
        stdout,
        stderr,
        exit_code: status.code(),
    })
}
