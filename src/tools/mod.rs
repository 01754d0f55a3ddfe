//! Adapters around the delegated Apple command-line tools
//!
//! Each adapter builds an `xcrun` invocation and interprets its output; the
//! pipelines depend only on the [`Toolchain`] trait so tests can substitute
//! stand-in implementations.

pub mod devicectl;
pub mod simctl;
pub mod xcodebuild;
pub mod xcresult;

use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::destination::Candidate;
use crate::process::{
    run_capture, run_streaming, CapturedOutput, LineHandler, ProcessError, ProcessRequest,
    RunOutcome,
};

/// Deadline for context-listing tool calls.
pub const LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deadline for single-shot convenience calls (boot, open, screenshot).
pub const SINGLE_SHOT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from tool adapters.
#[derive(Debug, Error)]
pub enum ToolError {
    /// The tool ran and reported failure
    #[error("{tool} failed: {message}")]
    Failed { tool: String, message: String },

    /// The tool's output could not be interpreted
    #[error("failed to parse {tool} output: {message}")]
    Parse { tool: String, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn failed(tool: &str, message: impl Into<String>) -> Self {
        Self::Failed {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    pub fn parse(tool: &str, message: impl Into<String>) -> Self {
        Self::Parse {
            tool: tool.to_string(),
            message: message.into(),
        }
    }

    /// Whether the underlying failure was a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ToolError::Process(ProcessError::Cancelled))
    }
}

/// Request to launch an app on a simulator.
#[derive(Debug, Clone, Default)]
pub struct SimLaunchRequest {
    pub udid: String,
    pub bundle_id: String,
    /// Attach `--console` and stream the app's output
    pub console: bool,
    pub args: Vec<String>,
    /// App environment; rewritten to `SIMCTL_CHILD_*` before launch
    pub env: HashMap<String, String>,
}

/// Outcome of a launch attempt.
#[derive(Debug, Default)]
pub struct LaunchOutcome {
    pub pid: Option<i64>,
    pub output: CapturedOutput,
}

/// Capability interface over the delegated toolchain.
pub trait Toolchain: Send + Sync {
    fn enumerate_simulators(&self, token: &CancelToken) -> Result<Vec<Candidate>, ToolError>;

    fn enumerate_devices(&self, token: &CancelToken) -> Result<Vec<Candidate>, ToolError>;

    /// `xcodebuild -list -json`; best-effort union source for scheme and
    /// configuration discovery.
    fn list_project(
        &self,
        root: &Path,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<Value, ToolError>;

    /// `xcodebuild -showBuildSettings` parsed into a map.
    fn show_build_settings(
        &self,
        args: &[String],
        root: &Path,
        token: &CancelToken,
    ) -> Result<HashMap<String, String>, ToolError>;

    /// Drive a full `xcodebuild` run, streaming lines to the handler.
    fn run_xcodebuild(
        &self,
        request: &ProcessRequest,
        token: &CancelToken,
        handler: Arc<dyn LineHandler>,
    ) -> Result<RunOutcome, ToolError>;

    /// Idempotent boot; an already-booted simulator is success.
    fn boot_simulator(&self, udid: &str, token: &CancelToken) -> Result<(), ToolError>;

    fn wait_simulator_booted(&self, udid: &str, token: &CancelToken) -> Result<(), ToolError>;

    fn install_on_simulator(
        &self,
        udid: &str,
        app: &Path,
        token: &CancelToken,
    ) -> Result<(), ToolError>;

    /// Launch on a simulator. With a handler the call streams the launch
    /// child's output until it exits (console mode); without one it captures.
    fn launch_on_simulator(
        &self,
        request: &SimLaunchRequest,
        token: &CancelToken,
        handler: Option<Arc<dyn LineHandler>>,
    ) -> Result<LaunchOutcome, ToolError>;

    fn terminate_on_simulator(
        &self,
        udid: &str,
        bundle_id: &str,
        token: &CancelToken,
    ) -> Result<(), ToolError>;

    fn install_on_device(
        &self,
        device_id: &str,
        app: &Path,
        token: &CancelToken,
    ) -> Result<(), ToolError>;

    fn launch_on_device(
        &self,
        device_id: &str,
        bundle_id: &str,
        token: &CancelToken,
    ) -> Result<LaunchOutcome, ToolError>;

    /// `xcresulttool` test summary as a raw JSON tree.
    fn xcresult_summary(&self, bundle: &Path, token: &CancelToken) -> Result<Value, ToolError>;
}

/// The real toolchain, delegating through `xcrun`.
#[derive(Debug, Clone, Default)]
pub struct Xcrun {
    /// Launcher binary; `xcrun` unless overridden for tests.
    pub launcher: Option<String>,
}

impl Xcrun {
    pub fn new() -> Self {
        Self::default()
    }

    fn launcher(&self) -> &str {
        self.launcher.as_deref().unwrap_or("xcrun")
    }

    /// Build an `xcrun <tool> <args>` request.
    pub fn request(&self, tool: &str, args: &[&str]) -> ProcessRequest {
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(tool.to_string());
        full.extend(args.iter().map(|a| a.to_string()));
        ProcessRequest::new(self.launcher(), full)
    }

    /// Run a short-lived xcrun call, mapping nonzero exit to [`ToolError`].
    pub fn capture(
        &self,
        tool: &str,
        args: &[&str],
        timeout: Option<Duration>,
        token: &CancelToken,
    ) -> Result<CapturedOutput, ToolError> {
        let request = self.request(tool, args);
        let output = run_capture(&request, token, timeout)?;
        if !output.success() {
            return Err(ToolError::failed(
                tool,
                format!(
                    "exit code {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output)
    }
}

impl Toolchain for Xcrun {
    fn enumerate_simulators(&self, token: &CancelToken) -> Result<Vec<Candidate>, ToolError> {
        let output = self.capture("simctl", &["list", "--json"], Some(LIST_TIMEOUT), token)?;
        let value: Value = serde_json::from_str(&output.stdout)
            .map_err(|e| ToolError::parse("simctl", e.to_string()))?;
        Ok(simctl::parse_device_list(&value))
    }

    fn enumerate_devices(&self, token: &CancelToken) -> Result<Vec<Candidate>, ToolError> {
        devicectl::enumerate(self, token)
    }

    fn list_project(
        &self,
        root: &Path,
        timeout: Duration,
        token: &CancelToken,
    ) -> Result<Value, ToolError> {
        let request = self
            .request("xcodebuild", &["-list", "-json"])
            .with_working_dir(root);
        let output = run_capture(&request, token, Some(timeout))?;
        if !output.success() {
            return Err(ToolError::failed(
                "xcodebuild",
                format!("-list failed: {}", output.stderr.trim()),
            ));
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| ToolError::parse("xcodebuild", e.to_string()))
    }

    fn show_build_settings(
        &self,
        args: &[String],
        root: &Path,
        token: &CancelToken,
    ) -> Result<HashMap<String, String>, ToolError> {
        let mut full: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        full.push("-showBuildSettings");
        let request = self.request("xcodebuild", &full).with_working_dir(root);
        let output = run_capture(&request, token, None)?;
        if !output.success() {
            return Err(ToolError::failed(
                "xcodebuild",
                format!("-showBuildSettings failed: {}", output.stderr.trim()),
            ));
        }
        Ok(xcodebuild::parse_build_settings(&output.stdout))
    }

    fn run_xcodebuild(
        &self,
        request: &ProcessRequest,
        token: &CancelToken,
        handler: Arc<dyn LineHandler>,
    ) -> Result<RunOutcome, ToolError> {
        Ok(run_streaming(request, token, handler)?)
    }

    fn boot_simulator(&self, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
        simctl::boot(self, udid, token)
    }

    fn wait_simulator_booted(&self, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
        simctl::wait_booted(self, udid, token)
    }

    fn install_on_simulator(
        &self,
        udid: &str,
        app: &Path,
        token: &CancelToken,
    ) -> Result<(), ToolError> {
        self.capture(
            "simctl",
            &["install", udid, &app.to_string_lossy()],
            None,
            token,
        )?;
        Ok(())
    }

    fn launch_on_simulator(
        &self,
        request: &SimLaunchRequest,
        token: &CancelToken,
        handler: Option<Arc<dyn LineHandler>>,
    ) -> Result<LaunchOutcome, ToolError> {
        simctl::launch(self, request, token, handler)
    }

    fn terminate_on_simulator(
        &self,
        udid: &str,
        bundle_id: &str,
        token: &CancelToken,
    ) -> Result<(), ToolError> {
        self.capture(
            "simctl",
            &["terminate", udid, bundle_id],
            Some(SINGLE_SHOT_TIMEOUT),
            token,
        )?;
        Ok(())
    }

    fn install_on_device(
        &self,
        device_id: &str,
        app: &Path,
        token: &CancelToken,
    ) -> Result<(), ToolError> {
        self.capture(
            "devicectl",
            &[
                "device",
                "install",
                "app",
                "--device",
                device_id,
                &app.to_string_lossy(),
            ],
            None,
            token,
        )?;
        Ok(())
    }

    fn launch_on_device(
        &self,
        device_id: &str,
        bundle_id: &str,
        token: &CancelToken,
    ) -> Result<LaunchOutcome, ToolError> {
        devicectl::launch(self, device_id, bundle_id, token)
    }

    fn xcresult_summary(&self, bundle: &Path, token: &CancelToken) -> Result<Value, ToolError> {
        xcresult::summary(self, bundle, token)
    }
}
