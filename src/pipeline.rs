//! Build / test / run orchestration
//!
//! All three commands share a preamble (scheme, destination, output
//! directories, argument vector); `run` continues through a launch state
//! machine that ends with a persisted session.

use chrono::Utc;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::bundle::{read_app_bundle, AppBundleInfo, BundleError};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::destination::{
    local_candidates, resolve, Candidate, Destination, Kind, PlatformFamily, ResolveError,
    TargetType,
};
use crate::event::{ErrorObject, Event, EventSink};
use crate::logsink::LogSink;
use crate::logstream::{predicate, LogStreamer, MirrorFormat};
use crate::process::{LineHandler, ProcessError, ProcessRequest, StreamSource};
use crate::project::ProjectDirs;
use crate::session::{Session, SessionStore};
use crate::tools::{
    xcodebuild, xcresult, SimLaunchRequest, ToolError, Toolchain, LIST_TIMEOUT,
};
use crate::watch::{self, PlistReader, WatchError};

/// Errors surfaced by the pipelines. Each coded variant maps onto one
/// `error` event; cancellation is distinguished, not coded.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no scheme selected and none could be auto-detected")]
    SchemeRequired,

    #[error("destination could not be resolved: {0}")]
    DestinationRequired(#[from] ResolveError),

    #[error("xcodebuild failed with exit code {exit_code:?}")]
    XcodebuildFailed { exit_code: Option<i32> },

    #[error("tests failed with exit code {exit_code:?}")]
    XcodebuildTestFailed { exit_code: Option<i32> },

    #[error("could not read build settings: {0}")]
    BuildSettingsFailed(String),

    #[error("build settings did not name an app bundle")]
    AppBundleNotFound,

    #[error("app bundle missing on disk: {0}")]
    AppBundleMissing(PathBuf),

    #[error("could not read app bundle info: {0}")]
    AppBundleInfoFailed(#[from] BundleError),

    #[error("app bundle has no bundle identifier: {0}")]
    BundleIdMissing(PathBuf),

    #[error("app bundle has no executable: {0}")]
    AppExecutableMissing(PathBuf),

    #[error("simulator install failed: {0}")]
    SimInstallFailed(String),

    #[error("simulator launch failed: {0}")]
    SimLaunchFailed(String),

    #[error("device install failed: {0}")]
    DeviceInstallFailed(String),

    #[error("device launch failed: {0}")]
    DeviceLaunchFailed(String),

    #[error("watchOS device runs require a companion target")]
    WatchCompanionRequired,

    #[error("watch deployment failed: {0}")]
    WatchDeploymentFailed(#[from] WatchError),

    #[error("companion app install failed: {0}")]
    WatchCompanionInstallFailed(String),

    #[error("watch app install failed: {0}")]
    WatchInstallFailed(String),

    #[error("watch app launch failed: {0}")]
    WatchLaunchFailed(String),

    #[error("could not launch app: {0}")]
    MacLaunchFailed(String),

    #[error("canceled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Session(#[from] crate::session::SessionError),

    #[error(transparent)]
    Tool(ToolError),
}

impl From<ToolError> for PipelineError {
    fn from(e: ToolError) -> Self {
        if e.is_cancelled() {
            PipelineError::Cancelled
        } else {
            PipelineError::Tool(e)
        }
    }
}

impl From<ProcessError> for PipelineError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::Tool(ToolError::Process(other)),
        }
    }
}

impl PipelineError {
    /// Stable machine code; `None` for cancellation and wrapped errors.
    pub fn code(&self) -> Option<&'static str> {
        use PipelineError::*;
        Some(match self {
            SchemeRequired => "SCHEME_REQUIRED",
            DestinationRequired(_) => "DESTINATION_REQUIRED",
            XcodebuildFailed { .. } => "XCODEBUILD_FAILED",
            XcodebuildTestFailed { .. } => "XCODEBUILD_TEST_FAILED",
            BuildSettingsFailed(_) => "BUILD_SETTINGS_FAILED",
            AppBundleNotFound => "APP_BUNDLE_NOT_FOUND",
            AppBundleMissing(_) => "APP_BUNDLE_MISSING",
            AppBundleInfoFailed(_) => "APP_BUNDLE_INFO_FAILED",
            BundleIdMissing(_) => "BUNDLE_ID_MISSING",
            AppExecutableMissing(_) => "APP_EXECUTABLE_MISSING",
            SimInstallFailed(_) => "SIM_INSTALL_FAILED",
            SimLaunchFailed(_) => "SIM_LAUNCH_FAILED",
            DeviceInstallFailed(_) => "DEVICE_INSTALL_FAILED",
            DeviceLaunchFailed(_) => "DEVICE_LAUNCH_FAILED",
            WatchCompanionRequired => "WATCH_COMPANION_REQUIRED",
            WatchDeploymentFailed(_) => "WATCH_DEPLOYMENT_FAILED",
            WatchCompanionInstallFailed(_) => "WATCH_COMPANION_INSTALL_FAILED",
            WatchInstallFailed(_) => "WATCH_INSTALL_FAILED",
            WatchLaunchFailed(_) => "WATCH_LAUNCH_FAILED",
            MacLaunchFailed(_) => "MAC_LAUNCH_FAILED",
            Cancelled | Io(_) | Config(_) | Session(_) | Tool(_) => return None,
        })
    }

    fn suggestion(&self) -> Option<&'static str> {
        use PipelineError::*;
        match self {
            SchemeRequired => Some("pass --scheme, or run `xcbolt init` to detect one"),
            DestinationRequired(_) => {
                Some("pass --target or --platform, or check `xcbolt simulator list`")
            }
            WatchCompanionRequired => Some("pass --companion-target with the paired iPhone"),
            _ => None,
        }
    }

    /// The coded error as an event payload.
    pub fn error_object(&self) -> ErrorObject {
        let code = self.code().unwrap_or("INTERNAL");
        let mut object = ErrorObject::new(code, self.to_string());
        if let Some(suggestion) = self.suggestion() {
            object = object.with_suggestion(suggestion);
        }
        object
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Cancelled => 130,
            _ => 1,
        }
    }
}

/// Quote one argument for a rendered command line.
fn quote_arg(arg: &str) -> String {
    if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c == '"') {
        format!("\"{}\"", arg.replace('"', "\\\""))
    } else {
        arg.to_string()
    }
}

/// Render a full command line for dry runs.
pub fn render_command(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(quote_arg)
        .collect::<Vec<_>>()
        .join(" ")
}

/// What a successful build learned about its product.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub app_path: String,
    pub bundle_id: String,
    pub result_bundle: PathBuf,
}

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    pub only: Vec<String>,
    pub skip: Vec<String>,
    /// Enumerate tests instead of running them.
    pub list: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stream the app's console after launch.
    pub console: bool,
}

#[derive(Debug, Clone, Default)]
pub struct TestOutput {
    pub summary: Option<Value>,
    pub counts: xcresult::TestCounts,
    pub result_bundle: PathBuf,
}

/// Shared preamble output.
struct Invocation {
    destination: Destination,
    /// Container/scheme/configuration/destination selection, reusable for
    /// `-showBuildSettings`.
    select_args: Vec<String>,
    /// Full vector up to (not including) the action token.
    args: Vec<String>,
    result_bundle: PathBuf,
}

/// Routes streamed tool lines into the log sink.
struct SinkLines(Arc<LogSink>);

impl LineHandler for SinkLines {
    fn on_line(&self, _source: StreamSource, line: &str) {
        self.0.push_line(line);
    }
}

pub struct Pipeline {
    pub root: PathBuf,
    pub config: Config,
    pub dirs: ProjectDirs,
    pub sink: Arc<dyn EventSink>,
    pub toolchain: Arc<dyn Toolchain>,
    pub token: CancelToken,
}

impl Pipeline {
    pub fn new(
        root: &Path,
        config: Config,
        sink: Arc<dyn EventSink>,
        toolchain: Arc<dyn Toolchain>,
        token: CancelToken,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            dirs: ProjectDirs::new(root),
            config,
            sink,
            toolchain,
            token,
        }
    }

    fn check_cancelled(&self) -> Result<(), PipelineError> {
        if self.token.is_cancelled() {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Enumerate every destination candidate. Adapter failures degrade to
    /// warnings so the rest of the state is still usable.
    pub fn candidates(&self, command: &str) -> Vec<Candidate> {
        let mut all = Vec::new();
        match self.toolchain.enumerate_simulators(&self.token) {
            Ok(sims) => all.extend(sims),
            Err(e) => self.sink.emit(&Event::warning(
                command,
                format!("could not enumerate simulators: {e}"),
            )),
        }
        match self.toolchain.enumerate_devices(&self.token) {
            Ok(devices) => all.extend(devices),
            Err(e) => self.sink.emit(&Event::warning(
                command,
                format!("could not enumerate devices: {e}"),
            )),
        }
        all.extend(local_candidates());
        all
    }

    /// Auto-pick a scheme when the project has exactly one.
    fn ensure_scheme(&mut self, command: &str) -> Result<(), PipelineError> {
        if !self.config.scheme.is_empty() {
            return Ok(());
        }
        let mut schemes = xcodebuild::discover_schemes(&self.root);
        if let Ok(listed) = self
            .toolchain
            .list_project(&self.root, LIST_TIMEOUT, &self.token)
        {
            xcodebuild::merge_listed_schemes(&mut schemes, &listed);
        }
        if schemes.len() == 1 {
            self.config.scheme = schemes.remove(0);
            self.sink.emit(&Event::status(
                command,
                format!("Using scheme {}", self.config.scheme),
            ));
            return Ok(());
        }
        Err(PipelineError::SchemeRequired)
    }

    fn ensure_configuration(&mut self, command: &str) {
        if !self.config.configuration.is_empty() {
            return;
        }
        let configurations = xcodebuild::discover_configurations(&self.root);
        if configurations.len() == 1 {
            self.config.configuration = configurations.into_iter().next().unwrap();
            self.sink.emit(&Event::status(
                command,
                format!("Using configuration {}", self.config.configuration),
            ));
        }
    }

    fn container_args(&self) -> Vec<String> {
        let configured = self.config.container_args();
        if !configured.is_empty() {
            return configured;
        }
        xcodebuild::find_container(&self.root)
            .map(|c| c.args())
            .unwrap_or_default()
    }

    fn derived_data_path(&self) -> PathBuf {
        if self.config.derived_data_path.is_empty() {
            self.dirs.derived_data.clone()
        } else {
            PathBuf::from(&self.config.derived_data_path)
        }
    }

    fn results_dir(&self) -> PathBuf {
        if self.config.result_bundle_path.is_empty() {
            self.dirs.results.clone()
        } else {
            PathBuf::from(&self.config.result_bundle_path)
        }
    }

    fn preamble(&mut self, command: &str) -> Result<Invocation, PipelineError> {
        self.check_cancelled()?;
        self.ensure_scheme(command)?;
        self.ensure_configuration(command);

        let requested = self.config.destination.clone();
        let destination = resolve(&requested, &self.candidates(command))?;
        self.sink.emit(
            &Event::status(command, format!("Destination: {}", destination.name))
                .with_data(json!({"destination": destination})),
        );

        self.dirs.ensure()?;
        let result_bundle = if self.config.result_bundle_path.is_empty() {
            self.dirs.result_bundle_path(Utc::now())
        } else {
            let results_dir = self.results_dir();
            std::fs::create_dir_all(&results_dir)?;
            results_dir.join(format!("{}.xcresult", Utc::now().format("%Y%m%d-%H%M%S")))
        };

        let mut select_args = self.container_args();
        select_args.push("-scheme".to_string());
        select_args.push(self.config.scheme.clone());
        if !self.config.configuration.is_empty() {
            select_args.push("-configuration".to_string());
            select_args.push(self.config.configuration.clone());
        }
        select_args.push("-destination".to_string());
        select_args.push(xcodebuild::destination_string(&destination));

        let mut args = select_args.clone();
        args.push("-derivedDataPath".to_string());
        args.push(self.derived_data_path().to_string_lossy().into_owned());
        args.push("-resultBundlePath".to_string());
        args.push(result_bundle.to_string_lossy().into_owned());
        args.extend(self.config.tool.args.iter().cloned());

        Ok(Invocation {
            destination,
            select_args,
            args,
            result_bundle,
        })
    }

    /// Emit the rendered command line instead of running it.
    fn dry_run(&self, command: &str, args: &[String]) {
        self.sink.emit(
            &Event::log(command, render_command("xcodebuild", args))
                .with_data(json!({"dryRun": true})),
        );
        self.sink.emit(&Event::result(command, true));
    }

    fn run_tool(&self, command: &str, args: Vec<String>) -> Result<crate::process::RunOutcome, PipelineError> {
        let log_sink = Arc::new(LogSink::new(
            command,
            Arc::clone(&self.sink),
            self.config.tool.log_format,
            &self.config.tool.log_format_args,
        ));
        let request = ProcessRequest::new("xcodebuild", args)
            .with_working_dir(&self.root)
            .with_env(self.config.tool.env.clone());
        let handler: Arc<dyn LineHandler> = Arc::new(SinkLines(Arc::clone(&log_sink)));
        let outcome = self
            .toolchain
            .run_xcodebuild(&request, &self.token, handler);
        let wait_error = match &outcome {
            Ok(o) => o.wait_error.as_ref().map(|e| e.to_string()),
            Err(e) => Some(e.to_string()),
        };
        let exit_code = outcome.as_ref().ok().and_then(|o| o.exit_code);
        if let Ok(log_sink) = Arc::try_unwrap(log_sink) {
            log_sink.finalize(exit_code, wait_error.as_deref());
        }
        let outcome = outcome?;
        if outcome.cancelled {
            return Err(PipelineError::Cancelled);
        }
        Ok(outcome)
    }

    pub fn build(&mut self) -> Result<BuildOutput, PipelineError> {
        self.dispatch("build", |p, command| p.build_inner(command))
    }

    /// Wrap a pipeline body with the event propagation policy: coded errors
    /// produce `error` + `result(failure)`, cancellation a status line only.
    fn dispatch<T>(
        &mut self,
        command: &str,
        body: impl FnOnce(&mut Self, &str) -> Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        match body(self, command) {
            Ok(value) => Ok(value),
            Err(PipelineError::Cancelled) => {
                self.sink.emit(&Event::status(command, "Run canceled"));
                Err(PipelineError::Cancelled)
            }
            Err(e) => {
                self.sink.emit(&Event::error(command, e.error_object()));
                self.sink.emit(&Event::result(command, false));
                Err(e)
            }
        }
    }

    fn build_inner(&mut self, command: &str) -> Result<BuildOutput, PipelineError> {
        let invocation = self.preamble(command)?;
        let mut args = invocation.args.clone();
        args.push("build".to_string());

        if self.config.tool.dry_run {
            self.dry_run(command, &args);
            return Ok(BuildOutput::default());
        }

        self.sink
            .emit(&Event::status(command, format!("Building {}", self.config.scheme)));
        let outcome = self.run_tool(command, args)?;
        if !outcome.success() {
            return Err(PipelineError::XcodebuildFailed {
                exit_code: outcome.exit_code,
            });
        }

        let mut output = BuildOutput {
            result_bundle: invocation.result_bundle,
            ..BuildOutput::default()
        };
        match self.query_product(&invocation.select_args) {
            Ok((app_path, bundle_id)) => {
                output.app_path = app_path;
                output.bundle_id = bundle_id;
                self.config.last_app_path = output.app_path.clone();
                self.config.last_bundle_id = output.bundle_id.clone();
            }
            Err(e) => {
                // The build itself succeeded; product introspection failing
                // only matters to `run`.
                self.sink.emit(&Event::warning(
                    command,
                    format!("built, but could not read build settings: {e}"),
                ));
            }
        }
        self.sink.emit(
            &Event::result(command, true).with_data(json!({
                "appPath": output.app_path,
                "bundleId": output.bundle_id,
            })),
        );
        Ok(output)
    }

    /// Learn the product path and bundle id from build settings.
    fn query_product(&self, select_args: &[String]) -> Result<(String, String), PipelineError> {
        let settings = self
            .toolchain
            .show_build_settings(select_args, &self.root, &self.token)
            .map_err(|e| match PipelineError::from(e) {
                PipelineError::Cancelled => PipelineError::Cancelled,
                other => PipelineError::BuildSettingsFailed(other.to_string()),
            })?;
        let bundle_id = settings
            .get("PRODUCT_BUNDLE_IDENTIFIER")
            .cloned()
            .unwrap_or_default();
        let app_path = product_path(&settings).ok_or(PipelineError::AppBundleNotFound)?;
        Ok((app_path.to_string_lossy().into_owned(), bundle_id))
    }

    pub fn test(&mut self, options: &TestOptions) -> Result<TestOutput, PipelineError> {
        self.dispatch("test", |p, command| p.test_inner(command, options))
    }

    fn test_inner(
        &mut self,
        command: &str,
        options: &TestOptions,
    ) -> Result<TestOutput, PipelineError> {
        let invocation = self.preamble(command)?;
        let mut args = invocation.args.clone();
        for token in &options.only {
            args.push(format!("-only-testing:{token}"));
        }
        for token in &options.skip {
            args.push(format!("-skip-testing:{token}"));
        }
        if options.list {
            args.push("-enumerate-tests".to_string());
        }
        args.push("test".to_string());

        if self.config.tool.dry_run {
            self.dry_run(command, &args);
            return Ok(TestOutput::default());
        }

        self.sink
            .emit(&Event::status(command, format!("Testing {}", self.config.scheme)));
        let outcome = self.run_tool(command, args)?;

        // The summary is attached regardless of outcome.
        let mut output = TestOutput {
            result_bundle: invocation.result_bundle.clone(),
            ..TestOutput::default()
        };
        if invocation.result_bundle.exists() {
            match self
                .toolchain
                .xcresult_summary(&invocation.result_bundle, &self.token)
            {
                Ok(summary) => {
                    output.counts = xcresult::extract_counts(&summary);
                    output.summary = Some(summary);
                }
                Err(e) if e.is_cancelled() => return Err(PipelineError::Cancelled),
                Err(e) => self.sink.emit(&Event::warning(
                    command,
                    format!("could not parse result bundle: {e}"),
                )),
            }
        }

        if !outcome.success() {
            if let Some(summary) = &output.summary {
                self.sink.emit(
                    &Event::log(command, summary_line(&output.counts))
                        .with_data(json!({"summary": summary})),
                );
            }
            return Err(PipelineError::XcodebuildTestFailed {
                exit_code: outcome.exit_code,
            });
        }
        self.sink.emit(
            &Event::result(command, true).with_data(json!({
                "resultBundle": invocation.result_bundle,
                "tests": {
                    "total": output.counts.total,
                    "passed": output.counts.passed,
                    "failed": output.counts.failed,
                    "skipped": output.counts.skipped,
                },
            })),
        );
        Ok(output)
    }

    pub fn run(&mut self, options: &RunOptions) -> Result<(), PipelineError> {
        self.dispatch("run", |p, command| p.run_inner(command, options))
    }

    fn run_inner(&mut self, command: &str, options: &RunOptions) -> Result<(), PipelineError> {
        // S0: a physical watch can only be reached through its companion.
        let requested = self.config.destination.normalized();
        if requested.platform_family == PlatformFamily::Watchos
            && requested.target_type == TargetType::Device
            && requested.companion_target.is_empty()
        {
            return Err(PipelineError::WatchCompanionRequired);
        }

        // S1: build.
        let build = self.build_inner(command)?;
        if self.config.tool.dry_run {
            return Ok(());
        }

        // S2: locate the product on disk.
        let mut destination = resolve(&requested, &self.candidates(command))?;
        let app_path = self.locate_app(&build)?;

        // S3: introspect.
        let info = read_app_bundle(&app_path, &self.token)?;
        if info.bundle_id.is_empty() {
            return Err(PipelineError::BundleIdMissing(app_path));
        }

        // S4: launch environment.
        let env = self.launch_env(options.console);

        // S5: dispatch by target.
        let pid = match destination.kind {
            Kind::Simulator => self.launch_simulator(command, &destination, &info, options, env)?,
            Kind::Device => {
                if destination.platform_family == PlatformFamily::Watchos {
                    self.launch_watch(command, &mut destination, &info)?
                } else {
                    self.launch_device(command, &destination, &info)?
                }
            }
            Kind::Macos | Kind::Catalyst => self.launch_local(command, &info, env)?,
            Kind::Auto => {
                return Err(PipelineError::DestinationRequired(ResolveError::NotFound {
                    requested: destination.name.clone(),
                }))
            }
        };

        // S6: persist the session.
        let mut store = SessionStore::load(&self.root);
        store.upsert(Session::started(&info.bundle_id, pid, &destination));
        store.save(&self.root)?;

        // S7: done.
        self.sink.emit(
            &Event::status(command, format!("Running {}", info.bundle_id)).with_data(json!({
                "bundleId": info.bundle_id,
                "pid": pid,
                "targetId": destination.target_id,
            })),
        );
        self.sink.emit(&Event::result(command, true));
        Ok(())
    }

    fn locate_app(&mut self, build: &BuildOutput) -> Result<PathBuf, PipelineError> {
        let mut path = PathBuf::from(&build.app_path);
        if build.app_path.is_empty() || !path.exists() {
            // The build's answer is stale or absent; ask again.
            let invocation_args = {
                let mut args = self.container_args();
                args.push("-scheme".to_string());
                args.push(self.config.scheme.clone());
                if !self.config.configuration.is_empty() {
                    args.push("-configuration".to_string());
                    args.push(self.config.configuration.clone());
                }
                args
            };
            let (app_path, _) = self.query_product(&invocation_args)?;
            path = PathBuf::from(app_path);
        }
        if !path.exists() {
            return Err(PipelineError::AppBundleMissing(path));
        }
        Ok(path)
    }

    fn launch_env(&self, console: bool) -> HashMap<String, String> {
        let mut env = self.config.launch.env.clone();
        if console {
            // Routes unified-log output onto the launch child's console and
            // keeps print() unbuffered. User-set values win.
            env.entry("OS_ACTIVITY_DT_MODE".to_string())
                .or_insert_with(|| "enable".to_string());
            env.entry("NSUnbufferedIO".to_string())
                .or_insert_with(|| "YES".to_string());
        }
        env
    }

    fn launch_simulator(
        &self,
        command: &str,
        destination: &Destination,
        info: &AppBundleInfo,
        options: &RunOptions,
        env: HashMap<String, String>,
    ) -> Result<Option<i64>, PipelineError> {
        let udid = &destination.target_id;
        self.toolchain
            .boot_simulator(udid, &self.token)
            .map_err(|e| map_launch(e, PipelineError::SimLaunchFailed))?;
        self.toolchain
            .wait_simulator_booted(udid, &self.token)
            .map_err(|e| map_launch(e, PipelineError::SimLaunchFailed))?;
        self.toolchain
            .install_on_simulator(udid, Path::new(&info.path), &self.token)
            .map_err(|e| map_launch(e, PipelineError::SimInstallFailed))?;

        let streamer = if options.console && self.config.launch.stream_unified_logs {
            self.start_log_stream(command, udid, info)
        } else {
            None
        };

        let request = SimLaunchRequest {
            udid: udid.clone(),
            bundle_id: info.bundle_id.clone(),
            console: options.console,
            args: self.config.launch.args.clone(),
            env,
        };
        let handler: Option<Arc<dyn LineHandler>> = if options.console {
            Some(self.console_handler(command, info, streamer.is_some()))
        } else {
            None
        };
        let result = self.toolchain.launch_on_simulator(&request, &self.token, handler);
        if let Some(streamer) = streamer {
            streamer.stop();
        }
        let outcome = result.map_err(|e| map_launch(e, PipelineError::SimLaunchFailed))?;
        if !outcome.output.success() {
            // Known pid but nonzero exit: the app ran and quit.
            self.sink.emit(&Event::status(
                command,
                format!("{} exited", info.bundle_id),
            ));
        }
        Ok(outcome.pid)
    }

    fn start_log_stream(
        &self,
        command: &str,
        udid: &str,
        info: &AppBundleInfo,
    ) -> Option<LogStreamer> {
        let predicate = predicate(
            &info.executable,
            &info.bundle_id,
            self.config.launch.stream_system_logs,
        )?;
        let sink = Arc::clone(&self.sink);
        let command = command.to_string();
        let handler: Arc<dyn LineHandler> = Arc::new(move |_source: StreamSource, line: &str| {
            sink.emit(&Event::log(&command, line).with_data(json!({"unified": true})));
        });
        let xcrun = crate::tools::Xcrun::new();
        Some(LogStreamer::start(
            &xcrun,
            udid,
            &predicate,
            &self.config.launch.console_log_levels,
            handler,
        ))
    }

    /// Handler for the launch child's console in `--console` mode.
    fn console_handler(
        &self,
        command: &str,
        info: &AppBundleInfo,
        dedup_with_stream: bool,
    ) -> Arc<dyn LineHandler> {
        let display_name = if info.display_name.is_empty() {
            info.bundle_name.clone()
        } else {
            info.display_name.clone()
        };
        let subsystem_filter = if self.config.launch.stream_system_logs {
            None
        } else {
            Some(info.bundle_id.clone())
        };
        let format = MirrorFormat::new(display_name, subsystem_filter, dedup_with_stream);
        let sink = Arc::clone(&self.sink);
        let command = command.to_string();
        Arc::new(move |source: StreamSource, line: &str| {
            if let Some(rendered) = format.format_line(line, source) {
                sink.emit(&Event::log(&command, rendered));
            }
        })
    }

    fn launch_device(
        &self,
        command: &str,
        destination: &Destination,
        info: &AppBundleInfo,
    ) -> Result<Option<i64>, PipelineError> {
        let device_id = &destination.target_id;
        self.sink
            .emit(&Event::status(command, format!("Installing on {}", destination.name)));
        self.toolchain
            .install_on_device(device_id, Path::new(&info.path), &self.token)
            .map_err(|e| map_launch(e, PipelineError::DeviceInstallFailed))?;
        let outcome = self
            .toolchain
            .launch_on_device(device_id, &info.bundle_id, &self.token)
            .map_err(|e| map_launch(e, PipelineError::DeviceLaunchFailed))?;
        Ok(outcome.pid)
    }

    fn launch_watch(
        &self,
        command: &str,
        destination: &mut Destination,
        info: &AppBundleInfo,
    ) -> Result<Option<i64>, PipelineError> {
        let candidates = self.candidates(command);
        let build_dir = info
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.dirs.derived_data.clone());
        let reader = PlistReader { token: &self.token };
        let plan = watch::plan(
            &destination.companion_target,
            info,
            &build_dir,
            &candidates,
            &reader,
        )
        .map_err(|e| match e {
            WatchError::CompanionRequired => PipelineError::WatchCompanionRequired,
            other => PipelineError::WatchDeploymentFailed(other),
        })?;

        self.sink.emit(&Event::status(
            command,
            format!("Installing companion app on {}", plan.companion_device_id),
        ));
        self.toolchain
            .install_on_device(&plan.companion_device_id, &plan.companion_app.path, &self.token)
            .map_err(|e| map_launch(e, PipelineError::WatchCompanionInstallFailed))?;
        self.toolchain
            .install_on_device(&destination.target_id, &plan.watch_app.path, &self.token)
            .map_err(|e| map_launch(e, PipelineError::WatchInstallFailed))?;
        let outcome = self
            .toolchain
            .launch_on_device(&destination.target_id, &plan.watch_app.bundle_id, &self.token)
            .map_err(|e| map_launch(e, PipelineError::WatchLaunchFailed))?;

        // The session records how the app was reached.
        destination.companion_target = plan.companion_device_id.clone();
        destination.companion_bundle_id = plan.companion_app.bundle_id.clone();
        Ok(outcome.pid)
    }

    /// Launch the built product directly on this machine, detached.
    fn launch_local(
        &self,
        command: &str,
        info: &AppBundleInfo,
        env: HashMap<String, String>,
    ) -> Result<Option<i64>, PipelineError> {
        if info.executable.is_empty() {
            return Err(PipelineError::AppExecutableMissing(info.path.clone()));
        }
        let executable = info.path.join("Contents/MacOS").join(&info.executable);
        let mut child = std::process::Command::new(&executable)
            .args(&self.config.launch.args)
            .envs(env)
            .spawn()
            .map_err(|e| PipelineError::MacLaunchFailed(format!("{}: {e}", executable.display())))?;
        let pid = child.id() as i64;
        // The app outlives this tool; dropping the handle orphans it
        // deliberately. Reap it once without blocking so a fast crash
        // does not leave a zombie.
        let _ = child.try_wait();
        self.sink
            .emit(&Event::status(command, format!("Launched {}", info.bundle_id)));
        Ok(Some(pid))
    }
}

/// Keep cancellation distinguished while coding everything else.
fn map_launch(e: ToolError, wrap: impl FnOnce(String) -> PipelineError) -> PipelineError {
    if e.is_cancelled() {
        PipelineError::Cancelled
    } else {
        wrap(e.to_string())
    }
}

/// Derive the product path from build settings.
fn product_path(settings: &HashMap<String, String>) -> Option<PathBuf> {
    let dir = settings
        .get("TARGET_BUILD_DIR")
        .or_else(|| settings.get("BUILT_PRODUCTS_DIR"))?;
    let name = settings
        .get("WRAPPER_NAME")
        .or_else(|| settings.get("FULL_PRODUCT_NAME"))
        .cloned()
        .or_else(|| settings.get("PRODUCT_NAME").map(|n| format!("{n}.app")))?;
    Some(Path::new(dir).join(name))
}

/// One-line human summary of parsed test counts.
fn summary_line(counts: &xcresult::TestCounts) -> String {
    format!(
        "{} tests: {} passed, {} failed, {} skipped",
        counts.total, counts.passed, counts.failed, counts.skipped
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_wraps_whitespace_and_escapes_quotes() {
        assert_eq!(quote_arg("plain"), "plain");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[test]
    fn rendered_command_joins_quoted_args() {
        let args = vec![
            "-scheme".to_string(),
            "My App".to_string(),
            "build".to_string(),
        ];
        assert_eq!(
            render_command("xcodebuild", &args),
            "xcodebuild -scheme \"My App\" build"
        );
    }

    #[test]
    fn product_path_prefers_wrapper_name() {
        let mut settings = HashMap::new();
        settings.insert("TARGET_BUILD_DIR".to_string(), "/b/Debug".to_string());
        settings.insert("WRAPPER_NAME".to_string(), "App.app".to_string());
        settings.insert("PRODUCT_NAME".to_string(), "App".to_string());
        assert_eq!(product_path(&settings), Some(PathBuf::from("/b/Debug/App.app")));
    }

    #[test]
    fn product_path_falls_back_to_product_name() {
        let mut settings = HashMap::new();
        settings.insert("BUILT_PRODUCTS_DIR".to_string(), "/b/Debug".to_string());
        settings.insert("PRODUCT_NAME".to_string(), "App".to_string());
        assert_eq!(product_path(&settings), Some(PathBuf::from("/b/Debug/App.app")));
    }

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PipelineError::SchemeRequired.code(), Some("SCHEME_REQUIRED"));
        assert_eq!(
            PipelineError::XcodebuildFailed { exit_code: Some(65) }.code(),
            Some("XCODEBUILD_FAILED")
        );
        assert_eq!(PipelineError::Cancelled.code(), None);
        assert_eq!(PipelineError::Cancelled.exit_code(), 130);
        assert_eq!(
            PipelineError::WatchCompanionRequired.code(),
            Some("WATCH_COMPANION_REQUIRED")
        );
    }

    #[test]
    fn launch_env_sets_console_defaults_without_clobbering() {
        let config = {
            let mut c = Config::new();
            c.launch
                .env
                .insert("OS_ACTIVITY_DT_MODE".to_string(), "disable".to_string());
            c
        };
        let pipeline = Pipeline::new(
            Path::new("/tmp"),
            config,
            Arc::new(crate::event::CollectSink::new()),
            Arc::new(crate::tools::Xcrun::new()),
            CancelToken::new(),
        );
        let env = pipeline.launch_env(true);
        assert_eq!(env.get("OS_ACTIVITY_DT_MODE").map(String::as_str), Some("disable"));
        assert_eq!(env.get("NSUnbufferedIO").map(String::as_str), Some("YES"));
        assert!(pipeline.launch_env(false).get("NSUnbufferedIO").is_none());
    }
}
