use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use xcbolt::cancel::{install_signal_handler, CancelToken};
use xcbolt::config::{migrate, Config, ConfigError};
use xcbolt::destination::{parse_platform_family, TargetType};
use xcbolt::event::{
    ErrorObject, Event, EventSink, JsonSink, TextSink, EVENT_SCHEMA_VERSION,
};
use xcbolt::logsink::{find_on_path, LogFormat};
use xcbolt::logstream::predicate as log_predicate;
use xcbolt::pipeline::{Pipeline, PipelineError, RunOptions, TestOptions};
use xcbolt::process::{run_streaming, LineHandler, StreamSource};
use xcbolt::project::{clean, CleanSelection, ProjectDirs};
use xcbolt::session::SessionStore;
use xcbolt::tools::{simctl, xcodebuild, Toolchain, Xcrun, LIST_TIMEOUT};

#[derive(Parser)]
#[command(name = "xcbolt", version, about = "Drive xcodebuild, simctl, and friends as one pipeline")]
struct Cli {
    /// Emit newline-delimited JSON events on stdout
    #[arg(long, global = true)]
    json: bool,

    /// Event schema version for --json output
    #[arg(long, global = true, value_name = "N", default_value_t = EVENT_SCHEMA_VERSION)]
    event_version: u32,

    /// Config document to use instead of <project>/.xcbolt/config.json
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true, value_name = "PATH")]
    project: Option<PathBuf>,

    #[arg(long, global = true)]
    verbose: bool,

    /// Tool output formatter
    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormatArg>,

    /// Extra argument for the log formatter (repeatable)
    #[arg(long = "log-format-arg", global = true, value_name = "ARG")]
    log_format_args: Vec<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Auto,
    Raw,
    Xcpretty,
    Xcbeautify,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Auto => LogFormat::Auto,
            LogFormatArg::Raw => LogFormat::Raw,
            LogFormatArg::Xcpretty => LogFormat::Xcpretty,
            LogFormatArg::Xcbeautify => LogFormat::Xcbeautify,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum TargetTypeArg {
    Auto,
    Simulator,
    Device,
    Local,
}

impl From<TargetTypeArg> for TargetType {
    fn from(arg: TargetTypeArg) -> Self {
        match arg {
            TargetTypeArg::Auto => TargetType::Auto,
            TargetTypeArg::Simulator => TargetType::Simulator,
            TargetTypeArg::Device => TargetType::Device,
            TargetTypeArg::Local => TargetType::Local,
        }
    }
}

/// Destination/scheme selection shared by build, test, and run.
#[derive(Args, Clone, Default)]
struct SelectArgs {
    #[arg(long)]
    scheme: Option<String>,

    #[arg(long)]
    configuration: Option<String>,

    /// Platform family (ios, ipados, tvos, visionos, watchos, macos, catalyst)
    #[arg(long)]
    platform: Option<String>,

    /// Target simulator/device by UDID or name
    #[arg(long)]
    target: Option<String>,

    #[arg(long, value_enum)]
    target_type: Option<TargetTypeArg>,

    /// Paired iPhone for a watchOS device run (UDID or name)
    #[arg(long)]
    companion_target: Option<String>,

    /// Deprecated; use --target-type simulator
    #[arg(long, hide = true)]
    simulator: bool,

    /// Deprecated; use --target-type device
    #[arg(long, hide = true)]
    device: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Build the scheme for the resolved destination
    Build(SelectArgs),

    /// Build and run tests, attaching the result-bundle summary
    Test {
        #[command(flatten)]
        select: SelectArgs,

        /// Enumerate tests instead of running them
        #[arg(long)]
        list: bool,

        /// Run only this test identifier (repeatable)
        #[arg(long)]
        only: Vec<String>,

        /// Skip this test identifier (repeatable)
        #[arg(long)]
        skip: Vec<String>,
    },

    /// Build, install, and launch on the resolved destination
    Run {
        #[command(flatten)]
        select: SelectArgs,

        /// Stream the app's console and unified log after launch
        #[arg(long)]
        console: bool,
    },

    /// Show discovered schemes, configurations, and destinations
    Context,

    /// List recorded app sessions
    Apps,

    /// Stop a running app by bundle id or session id
    Stop { key: String },

    /// Stream unified logs from a simulator
    Logs {
        #[arg(long)]
        predicate: Option<String>,

        #[arg(long)]
        platform: Option<String>,

        #[arg(long)]
        target: Option<String>,

        #[arg(long, value_enum)]
        target_type: Option<TargetTypeArg>,
    },

    /// Simulator management
    Simulator {
        #[command(subcommand)]
        command: SimulatorCommand,
    },

    /// Physical device management
    Device {
        #[command(subcommand)]
        command: DeviceCommand,
    },

    /// Show or edit the config document
    Config {
        /// Open the config in $EDITOR
        #[arg(long)]
        edit: bool,
    },

    /// Remove build artifacts and caches
    Clean {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        derived_data: bool,
        #[arg(long)]
        results: bool,
        #[arg(long)]
        sessions: bool,
        #[arg(long)]
        spm_cache: bool,
    },

    /// Detect the project and write an initial config
    Init {
        #[arg(long)]
        non_interactive: bool,
    },

    /// Check the toolchain and project setup
    Doctor,
}

#[derive(Subcommand)]
enum SimulatorCommand {
    List,
    Boot { udid: String },
    Shutdown { udid: String },
    Erase { udid: String },
    /// Open the Simulator app
    Open,
    Openurl { udid: String, url: String },
    Screenshot { udid: String, output: PathBuf },
    Create {
        name: String,
        device_type: String,
        #[arg(long)]
        runtime: Option<String>,
    },
    Delete { udid: String },
    /// Delete simulators whose runtime is gone
    Prune,
}

#[derive(Subcommand)]
enum DeviceCommand {
    List,
    Install { device_id: String, app: PathBuf },
    Launch { device_id: String, bundle_id: String },
}

fn main() {
    let cli = Cli::parse();
    std::process::exit(run(cli));
}

fn run(cli: Cli) -> i32 {
    let sink: Arc<dyn EventSink> = if cli.json {
        match JsonSink::new(std::io::stdout(), cli.event_version) {
            Ok(sink) => Arc::new(sink),
            Err(e) => {
                eprintln!("xcbolt: {e}");
                return 1;
            }
        }
    } else {
        Arc::new(TextSink::new(std::io::stdout()))
    };

    let token = CancelToken::new();
    if let Err(e) = install_signal_handler(token.clone()) {
        if cli.verbose {
            eprintln!("xcbolt: could not install signal handler: {e}");
        }
    }

    let root = cli
        .project
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let command_name = command_name(&cli.command);
    let config = match load_config(&cli, &root, command_name, &sink) {
        Ok(config) => config,
        Err(code) => return code,
    };

    let app = App {
        root,
        config,
        sink,
        toolchain: Arc::new(Xcrun::new()),
        token,
        verbose: cli.verbose,
        config_path: cli.config.clone(),
    };
    app.dispatch(cli.command)
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::Build(_) => "build",
        Command::Test { .. } => "test",
        Command::Run { .. } => "run",
        Command::Context => "context",
        Command::Apps => "apps",
        Command::Stop { .. } => "stop",
        Command::Logs { .. } => "logs",
        Command::Simulator { .. } => "simulator",
        Command::Device { .. } => "device",
        Command::Config { .. } => "config",
        Command::Clean { .. } => "clean",
        Command::Init { .. } => "init",
        Command::Doctor => "doctor",
    }
}

fn load_config(
    cli: &Cli,
    root: &Path,
    command: &str,
    sink: &Arc<dyn EventSink>,
) -> Result<Config, i32> {
    let loaded = match &cli.config {
        Some(path) => Config::load_path(path),
        None => Config::load(root),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(ConfigError::VersionMismatch { found, expected }) if cli.config.is_none() => {
            sink.emit(&Event::warning(
                command,
                format!("config version {found} found, migrating to {expected}"),
            ));
            match migrate(root) {
                Ok(config) => {
                    sink.emit(&Event::status(
                        command,
                        "config migrated; previous version saved as config.json.bak",
                    ));
                    config
                }
                Err(e) => {
                    sink.emit(&Event::error(
                        command,
                        ErrorObject::new("CONFIG_INVALID", e.to_string()),
                    ));
                    return Err(1);
                }
            }
        }
        Err(e) => {
            sink.emit(&Event::error(
                command,
                ErrorObject::new("CONFIG_INVALID", e.to_string()),
            ));
            return Err(1);
        }
    };
    if let Some(format) = cli.log_format {
        config.tool.log_format = format.into();
    }
    if !cli.log_format_args.is_empty() {
        config.tool.log_format_args = cli.log_format_args.clone();
    }
    Ok(config)
}

struct App {
    root: PathBuf,
    config: Config,
    sink: Arc<dyn EventSink>,
    toolchain: Arc<dyn Toolchain>,
    token: CancelToken,
    verbose: bool,
    config_path: Option<PathBuf>,
}

impl App {
    fn dispatch(mut self, command: Command) -> i32 {
        let name = command_name(&command);
        if self.verbose {
            eprintln!("xcbolt: {name} in {}", self.root.display());
        }
        let result = match command {
            Command::Build(select) => {
                self.apply_select(&select, "build");
                self.pipeline().build().map(|_| 0)
            }
            Command::Test {
                select,
                list,
                only,
                skip,
            } => {
                self.apply_select(&select, "test");
                let options = TestOptions { only, skip, list };
                self.pipeline().test(&options).map(|_| 0)
            }
            Command::Run { select, console } => {
                self.apply_select(&select, "run");
                let options = RunOptions { console };
                self.pipeline().run(&options).map(|_| 0)
            }
            Command::Context => self.context(),
            Command::Apps => self.apps(),
            Command::Stop { key } => self.stop(&key),
            Command::Logs {
                predicate,
                platform,
                target,
                target_type,
            } => self.logs(predicate, platform, target, target_type),
            Command::Simulator { command } => self.simulator(command),
            Command::Device { command } => self.device(command),
            Command::Config { edit } => self.config_command(edit),
            Command::Clean {
                all,
                derived_data,
                results,
                sessions,
                spm_cache,
            } => self.clean_command(all, derived_data, results, sessions, spm_cache),
            Command::Init { non_interactive } => self.init(non_interactive),
            Command::Doctor => self.doctor(),
        };
        self.sink.flush();
        match result {
            Ok(code) => code,
            Err(e) => {
                if !matches!(
                    e,
                    PipelineError::Cancelled
                        | PipelineError::SchemeRequired
                        | PipelineError::DestinationRequired(_)
                ) && e.code().is_none()
                {
                    // Uncoded failures outside the pipelines still need a line.
                    self.sink
                        .emit(&Event::error(name, ErrorObject::new("INTERNAL", e.to_string())));
                    self.sink.flush();
                }
                e.exit_code()
            }
        }
    }

    fn pipeline(&self) -> Pipeline {
        Pipeline::new(
            &self.root,
            self.config.clone(),
            Arc::clone(&self.sink),
            Arc::clone(&self.toolchain),
            self.token.clone(),
        )
    }

    fn apply_select(&mut self, select: &SelectArgs, command: &str) {
        if let Some(scheme) = &select.scheme {
            self.config.scheme = scheme.clone();
        }
        if let Some(configuration) = &select.configuration {
            self.config.configuration = configuration.clone();
        }
        if let Some(platform) = &select.platform {
            self.config.destination.platform_family = parse_platform_family(platform);
        }
        if let Some(target) = &select.target {
            self.config.destination.name = target.clone();
            self.config.destination.target_id = String::new();
            self.config.destination.udid = String::new();
        }
        if let Some(target_type) = select.target_type {
            self.config.destination.target_type = target_type.into();
        }
        if select.simulator {
            self.sink.emit(&Event::warning(
                command,
                "--simulator is deprecated; use --target-type simulator",
            ));
            self.config.destination.target_type = TargetType::Simulator;
        }
        if select.device {
            self.sink.emit(&Event::warning(
                command,
                "--device is deprecated; use --target-type device",
            ));
            self.config.destination.target_type = TargetType::Device;
        }
        if let Some(companion) = &select.companion_target {
            self.config.destination.companion_target = companion.clone();
        }
        self.config.destination = self.config.destination.normalized();
    }

    fn context(&self) -> Result<i32, PipelineError> {
        let command = "context";
        let container = xcodebuild::find_container(&self.root).unwrap_or_default();
        let mut schemes = xcodebuild::discover_schemes(&self.root);
        let mut configurations = xcodebuild::discover_configurations(&self.root);
        match self
            .toolchain
            .list_project(&self.root, LIST_TIMEOUT, &self.token)
        {
            Ok(listed) => {
                xcodebuild::merge_listed_schemes(&mut schemes, &listed);
                xcodebuild::merge_listed_configurations(&mut configurations, &listed);
            }
            Err(e) => self.sink.emit(&Event::warning(
                command,
                format!("xcodebuild -list unavailable: {e}"),
            )),
        }
        let candidates = self.pipeline().candidates(command);

        if let Some(workspace) = &container.workspace {
            self.sink
                .emit(&Event::log(command, format!("workspace: {}", workspace.display())));
        } else if let Some(project) = &container.project {
            self.sink
                .emit(&Event::log(command, format!("project: {}", project.display())));
        }
        self.sink
            .emit(&Event::log(command, format!("schemes: {}", schemes.join(", "))));
        self.sink.emit(&Event::log(
            command,
            format!("configurations: {}", configurations.join(", ")),
        ));
        for candidate in &candidates {
            self.sink.emit(&Event::log(
                command,
                format!(
                    "{} [{}] {} {}",
                    candidate.name, candidate.id, candidate.platform, candidate.state
                ),
            ));
        }
        self.sink.emit(
            &Event::result(command, true).with_data(json!({
                "workspace": container.workspace,
                "project": container.project,
                "schemes": schemes,
                "configurations": configurations,
                "destinations": candidates,
            })),
        );
        Ok(0)
    }

    fn apps(&self) -> Result<i32, PipelineError> {
        let command = "apps";
        let store = SessionStore::load(&self.root);
        for session in &store.sessions {
            self.sink.emit(&Event::log(
                command,
                format!(
                    "{} pid={} target={} started={}",
                    session.id,
                    session.pid.map_or_else(|| "-".to_string(), |p| p.to_string()),
                    session.target_id,
                    session.started_at
                ),
            ));
        }
        self.sink.emit(
            &Event::result(command, true).with_data(json!({"sessions": store.sessions})),
        );
        Ok(0)
    }

    fn stop(&self, key: &str) -> Result<i32, PipelineError> {
        let command = "stop";
        let mut store = SessionStore::load(&self.root);
        let matched: Vec<_> = store.find(key).into_iter().cloned().collect();
        if matched.is_empty() {
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new("SESSION_NOT_FOUND", format!("no session matches {key:?}"))
                    .with_suggestion("run `xcbolt apps` to list known sessions"),
            ));
            self.sink.emit(&Event::result(command, false));
            return Ok(1);
        }
        let mut stopped = Vec::new();
        for session in &matched {
            let outcome = match session.target_type {
                TargetType::Simulator => self
                    .toolchain
                    .terminate_on_simulator(&session.target_id, &session.bundle_id, &self.token)
                    .map_err(|e| e.to_string()),
                TargetType::Local => stop_local(session.pid),
                _ => Err("stopping device sessions is not supported".to_string()),
            };
            match outcome {
                Ok(()) => {
                    self.sink
                        .emit(&Event::status(command, format!("Stopped {}", session.id)));
                    stopped.push(session.id.clone());
                }
                Err(e) => self.sink.emit(&Event::warning(
                    command,
                    format!("could not stop {}: {e}", session.id),
                )),
            }
        }
        store.sessions.retain(|s| !stopped.contains(&s.id));
        store.save(&self.root)?;
        self.sink.emit(&Event::result(command, true));
        Ok(0)
    }

    fn logs(
        &mut self,
        predicate: Option<String>,
        platform: Option<String>,
        target: Option<String>,
        target_type: Option<TargetTypeArg>,
    ) -> Result<i32, PipelineError> {
        let command = "logs";
        let select = SelectArgs {
            platform,
            target,
            target_type,
            ..SelectArgs::default()
        };
        self.apply_select(&select, command);
        let destination = match xcbolt::destination::resolve(
            &self.config.destination,
            &self.pipeline().candidates(command),
        ) {
            Ok(destination) => destination,
            Err(e) => {
                self.sink.emit(&Event::error(
                    command,
                    ErrorObject::new("DESTINATION_REQUIRED", e.to_string()),
                ));
                self.sink.emit(&Event::result(command, false));
                return Ok(1);
            }
        };
        if destination.target_type != TargetType::Simulator {
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new(
                    "DESTINATION_REQUIRED",
                    "log streaming needs a simulator destination",
                )
                .with_suggestion("pass --target-type simulator"),
            ));
            self.sink.emit(&Event::result(command, false));
            return Ok(1);
        }

        let predicate = predicate.or_else(|| {
            log_predicate(
                "",
                &self.config.last_bundle_id,
                self.config.launch.stream_system_logs,
            )
        });
        let mut args = vec![
            "spawn".to_string(),
            destination.target_id.clone(),
            "log".to_string(),
            "stream".to_string(),
            "--style".to_string(),
            "compact".to_string(),
        ];
        if let Some(predicate) = &predicate {
            args.push("--predicate".to_string());
            args.push(predicate.clone());
        }
        let xcrun = Xcrun::new();
        let request = xcrun.request(
            "simctl",
            &args.iter().map(String::as_str).collect::<Vec<_>>(),
        );
        let sink = Arc::clone(&self.sink);
        let handler: Arc<dyn LineHandler> =
            Arc::new(move |_source: StreamSource, line: &str| {
                sink.emit(&Event::log(command, line));
            });
        self.sink
            .emit(&Event::status(command, format!("Streaming logs from {}", destination.name)));
        let outcome = run_streaming(&request, &self.token, handler)?;
        if outcome.cancelled {
            self.sink.emit(&Event::status(command, "Run canceled"));
            return Ok(130);
        }
        self.sink.emit(&Event::result(command, outcome.success()));
        Ok(if outcome.success() { 0 } else { 1 })
    }

    fn simulator(&self, command: SimulatorCommand) -> Result<i32, PipelineError> {
        let name = "simulator";
        let xcrun = Xcrun::new();
        match command {
            SimulatorCommand::List => {
                let sims = self.toolchain.enumerate_simulators(&self.token)?;
                for sim in &sims {
                    self.sink.emit(&Event::log(
                        name,
                        format!(
                            "{} [{}] {} {} {}",
                            sim.name, sim.id, sim.runtime_name, sim.os_version, sim.state
                        ),
                    ));
                }
                self.sink
                    .emit(&Event::result(name, true).with_data(json!({"simulators": sims})));
            }
            SimulatorCommand::Boot { udid } => {
                self.toolchain.boot_simulator(&udid, &self.token)?;
                self.toolchain.wait_simulator_booted(&udid, &self.token)?;
                self.emit_done(name, format!("Booted {udid}"));
            }
            SimulatorCommand::Shutdown { udid } => {
                simctl::shutdown(&xcrun, &udid, &self.token)?;
                self.emit_done(name, format!("Shut down {udid}"));
            }
            SimulatorCommand::Erase { udid } => {
                simctl::erase(&xcrun, &udid, &self.token)?;
                self.emit_done(name, format!("Erased {udid}"));
            }
            SimulatorCommand::Open => {
                let request = xcbolt::process::ProcessRequest::new(
                    "open",
                    vec!["-a".to_string(), "Simulator".to_string()],
                );
                let output = xcbolt::process::run_capture(
                    &request,
                    &self.token,
                    Some(std::time::Duration::from_secs(10)),
                )?;
                if !output.success() {
                    return Err(PipelineError::Tool(xcbolt::tools::ToolError::Failed {
                        tool: "open".to_string(),
                        message: output.stderr.trim().to_string(),
                    }));
                }
                self.emit_done(name, "Opened Simulator");
            }
            SimulatorCommand::Openurl { udid, url } => {
                simctl::open_url(&xcrun, &udid, &url, &self.token)?;
                self.emit_done(name, format!("Opened {url}"));
            }
            SimulatorCommand::Screenshot { udid, output } => {
                simctl::screenshot(&xcrun, &udid, &output.to_string_lossy(), &self.token)?;
                self.emit_done(name, format!("Saved {}", output.display()));
            }
            SimulatorCommand::Create {
                name: sim_name,
                device_type,
                runtime,
            } => {
                let udid =
                    simctl::create(&xcrun, &sim_name, &device_type, runtime.as_deref(), &self.token)?;
                self.sink
                    .emit(&Event::status(name, format!("Created {sim_name} [{udid}]")));
                self.sink
                    .emit(&Event::result(name, true).with_data(json!({"udid": udid})));
            }
            SimulatorCommand::Delete { udid } => {
                simctl::delete(&xcrun, &udid, &self.token)?;
                self.emit_done(name, format!("Deleted {udid}"));
            }
            SimulatorCommand::Prune => {
                simctl::prune(&xcrun, &self.token)?;
                self.emit_done(name, "Deleted unavailable simulators");
            }
        }
        Ok(0)
    }

    fn device(&self, command: DeviceCommand) -> Result<i32, PipelineError> {
        let name = "device";
        match command {
            DeviceCommand::List => {
                let devices = self.toolchain.enumerate_devices(&self.token)?;
                for device in &devices {
                    self.sink.emit(&Event::log(
                        name,
                        format!("{} [{}] {}", device.name, device.id, device.os_version),
                    ));
                }
                self.sink
                    .emit(&Event::result(name, true).with_data(json!({"devices": devices})));
            }
            DeviceCommand::Install { device_id, app } => {
                self.toolchain.install_on_device(&device_id, &app, &self.token)?;
                self.emit_done(name, format!("Installed {}", app.display()));
            }
            DeviceCommand::Launch {
                device_id,
                bundle_id,
            } => {
                let outcome = self
                    .toolchain
                    .launch_on_device(&device_id, &bundle_id, &self.token)?;
                self.sink
                    .emit(&Event::status(name, format!("Launched {bundle_id}")));
                self.sink
                    .emit(&Event::result(name, true).with_data(json!({"pid": outcome.pid})));
            }
        }
        Ok(0)
    }

    fn config_command(&self, edit: bool) -> Result<i32, PipelineError> {
        let command = "config";
        let path = self
            .config_path
            .clone()
            .unwrap_or_else(|| Config::path_in(&self.root));
        if edit {
            let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
            if !path.exists() {
                self.config.save_path(&path)?;
            }
            let status = std::process::Command::new(&editor).arg(&path).status()?;
            if !status.success() {
                self.sink.emit(&Event::warning(
                    command,
                    format!("{editor} exited with {status}"),
                ));
            }
            // Validate what the edit left behind.
            match Config::load_path(&path) {
                Ok(_) => self.sink.emit(&Event::result(command, true)),
                Err(e) => {
                    self.sink.emit(&Event::error(
                        command,
                        ErrorObject::new("CONFIG_INVALID", e.to_string()),
                    ));
                    self.sink.emit(&Event::result(command, false));
                    return Ok(1);
                }
            }
            return Ok(0);
        }
        self.sink.emit(&Event::log(
            command,
            serde_json::to_string_pretty(&self.config).unwrap_or_default(),
        ));
        self.sink.emit(
            &Event::result(command, true)
                .with_data(serde_json::to_value(&self.config).unwrap_or_default()),
        );
        Ok(0)
    }

    fn clean_command(
        &self,
        all: bool,
        derived_data: bool,
        results: bool,
        sessions: bool,
        spm_cache: bool,
    ) -> Result<i32, PipelineError> {
        let command = "clean";
        let selection = if all || !(derived_data || results || sessions || spm_cache) {
            CleanSelection::all()
        } else {
            CleanSelection {
                derived_data,
                results,
                sessions,
                spm_cache,
            }
        };
        let dirs = ProjectDirs::new(&self.root);
        let removed = clean(&dirs, selection)?;
        for path in &removed {
            self.sink
                .emit(&Event::status(command, format!("Removed {}", path.display())));
        }
        self.sink.emit(
            &Event::result(command, true).with_data(json!({"removed": removed})),
        );
        Ok(0)
    }

    fn init(&self, _non_interactive: bool) -> Result<i32, PipelineError> {
        let command = "init";
        let container = xcodebuild::find_container(&self.root).unwrap_or_default();
        if container.is_empty() {
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new(
                    "NO_PROJECT",
                    format!("no .xcworkspace or .xcodeproj in {}", self.root.display()),
                ),
            ));
            self.sink.emit(&Event::result(command, false));
            return Ok(2);
        }

        let mut schemes = xcodebuild::discover_schemes(&self.root);
        if let Ok(listed) = self
            .toolchain
            .list_project(&self.root, LIST_TIMEOUT, &self.token)
        {
            xcodebuild::merge_listed_schemes(&mut schemes, &listed);
        }
        if schemes.is_empty() {
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new("NO_SCHEME", "no scheme detected")
                    .with_suggestion("share a scheme in Xcode (Product > Scheme > Manage Schemes)"),
            ));
            self.sink.emit(&Event::result(command, false));
            return Ok(3);
        }

        let configurations = xcodebuild::discover_configurations(&self.root);
        if configurations.is_empty() {
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new("NO_CONFIGURATION", "no build configuration detected"),
            ));
            self.sink.emit(&Event::result(command, false));
            return Ok(4);
        }

        let mut config = Config::new();
        if let Some(workspace) = &container.workspace {
            config.workspace = workspace.to_string_lossy().into_owned();
        } else if let Some(project) = &container.project {
            config.project = project.to_string_lossy().into_owned();
        }
        config.scheme = schemes[0].clone();
        config.configuration = configurations
            .iter()
            .find(|c| c.as_str() == "Debug")
            .cloned()
            .unwrap_or_else(|| configurations[0].clone());

        ProjectDirs::new(&self.root).ensure()?;
        config.save(&self.root)?;

        self.sink.emit(&Event::status(
            command,
            format!(
                "Initialized: scheme {}, configuration {}",
                config.scheme, config.configuration
            ),
        ));
        self.sink.emit(
            &Event::result(command, true).with_data(json!({
                "scheme": config.scheme,
                "configuration": config.configuration,
                "schemes": schemes,
                "configurations": configurations,
            })),
        );
        Ok(0)
    }

    fn doctor(&self) -> Result<i32, PipelineError> {
        let command = "doctor";
        let mut healthy = true;

        if find_on_path("xcrun").is_some() {
            self.sink.emit(&Event::status(command, "xcrun: found"));
        } else {
            healthy = false;
            self.sink.emit(&Event::error(
                command,
                ErrorObject::new("XCRUN_MISSING", "xcrun not found on PATH")
                    .with_suggestion("install Xcode command-line tools: xcode-select --install"),
            ));
        }
        for formatter in ["xcpretty", "xcbeautify"] {
            let status = if find_on_path(formatter).is_some() {
                "found"
            } else {
                "not found (raw log output)"
            };
            self.sink
                .emit(&Event::status(command, format!("{formatter}: {status}")));
        }

        let container = xcodebuild::find_container(&self.root).unwrap_or_default();
        if container.is_empty() {
            self.sink.emit(&Event::warning(
                command,
                "no .xcworkspace/.xcodeproj here; pipelines need --project",
            ));
        }
        match Config::load(&self.root) {
            Ok(_) => self.sink.emit(&Event::status(command, "config: ok")),
            Err(e) => self
                .sink
                .emit(&Event::warning(command, format!("config: {e}"))),
        }

        self.sink.emit(&Event::result(command, healthy));
        Ok(if healthy { 0 } else { 1 })
    }

    fn emit_done(&self, command: &str, message: impl Into<String>) {
        self.sink.emit(&Event::status(command, message));
        self.sink.emit(&Event::result(command, true));
    }
}

#[cfg(unix)]
fn stop_local(pid: Option<i64>) -> Result<(), String> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    let pid = pid.ok_or_else(|| "no recorded pid".to_string())?;
    kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|e| e.to_string())
}

#[cfg(not(unix))]
fn stop_local(_pid: Option<i64>) -> Result<(), String> {
    Err("stopping local sessions is unsupported on this platform".to_string())
}
