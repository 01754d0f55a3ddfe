//! Project configuration document (`.xcbolt/config.json`)

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::destination::Destination;
use crate::logsink::LogFormat;

/// Current config document version.
pub const CONFIG_VERSION: u32 = 2;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document version differs from [`CONFIG_VERSION`]
    #[error("config version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("could not read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("could not write {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed config at {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// Options forwarded to `xcodebuild` invocations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ToolOptions {
    /// Extra arguments appended to every invocation.
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub log_format: LogFormat,
    pub log_format_args: Vec<String>,
    pub dry_run: bool,
}

/// Options applied when launching the built app.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LaunchOptions {
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Subscribe to the simulator's unified log while the app runs.
    pub stream_unified_logs: bool,
    /// Include log lines outside the app's own subsystem.
    pub stream_system_logs: bool,
    /// Unified-log levels mirrored to the console.
    pub console_log_levels: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            args: Vec::new(),
            env: HashMap::new(),
            stream_unified_logs: true,
            stream_system_logs: false,
            console_log_levels: vec!["default".to_string(), "error".to_string(), "fault".to_string()],
        }
    }
}

/// The persisted configuration document.
///
/// At most one of `workspace` / `project` is meaningful; workspace wins when
/// both are set. The `last_*` fields describe the most recent build and are
/// never persisted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
    pub version: u32,
    pub workspace: String,
    pub project: String,
    pub scheme: String,
    pub configuration: String,
    pub destination: Destination,
    pub derived_data_path: String,
    pub result_bundle_path: String,
    pub tool: ToolOptions,
    pub launch: LaunchOptions,

    #[serde(skip)]
    pub last_app_path: String,
    #[serde(skip)]
    pub last_bundle_id: String,
}

impl Config {
    pub fn new() -> Self {
        Self {
            version: CONFIG_VERSION,
            launch: LaunchOptions::default(),
            ..Self::default()
        }
    }

    /// Path of the config document inside a project root.
    pub fn path_in(root: &Path) -> PathBuf {
        root.join(".xcbolt").join("config.json")
    }

    /// Load from a project root; a missing document yields defaults.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        Self::load_path(&Self::path_in(root))
    }

    pub fn load_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::new());
        }
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config =
            serde_json::from_str(&text).map_err(|e| ConfigError::Malformed {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        if config.version != CONFIG_VERSION {
            return Err(ConfigError::VersionMismatch {
                found: config.version,
                expected: CONFIG_VERSION,
            });
        }
        Ok(config)
    }

    /// Persist to a project root, creating `.xcbolt/` as needed.
    pub fn save(&self, root: &Path) -> Result<(), ConfigError> {
        self.save_path(&Self::path_in(root))
    }

    pub fn save_path(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(|source| ConfigError::Write {
                path: path.to_path_buf(),
                source,
            })?;
        }
        let mut text = serde_json::to_string_pretty(self).map_err(|e| ConfigError::Malformed {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        text.push('\n');
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Container arguments for `xcodebuild`, workspace preferred.
    pub fn container_args(&self) -> Vec<String> {
        if !self.workspace.is_empty() {
            vec!["-workspace".to_string(), self.workspace.clone()]
        } else if !self.project.is_empty() {
            vec!["-project".to_string(), self.project.clone()]
        } else {
            Vec::new()
        }
    }
}

/// Upgrade an older document in place, leaving a `config.json.bak` aside.
///
/// Version 1 documents used a flat layout with `logFormat` and `dryRun` at
/// the top level; they move under `tool`.
pub fn migrate(root: &Path) -> Result<Config, ConfigError> {
    let path = Config::path_in(root);
    let text = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    let raw: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| ConfigError::Malformed {
            path: path.clone(),
            message: e.to_string(),
        })?;
    let found = raw.get("version").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
    if found == CONFIG_VERSION {
        return Config::load_path(&path);
    }
    if found != 1 {
        return Err(ConfigError::VersionMismatch {
            found,
            expected: CONFIG_VERSION,
        });
    }

    let backup = path.with_extension("json.bak");
    fs::copy(&path, &backup).map_err(|source| ConfigError::Write {
        path: backup.clone(),
        source,
    })?;

    let mut config = Config::new();
    let take = |key: &str| {
        raw.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };
    config.workspace = take("workspace");
    config.project = take("project");
    config.scheme = take("scheme");
    config.configuration = take("configuration");
    config.derived_data_path = take("derivedDataPath");
    config.result_bundle_path = take("resultBundlePath");
    if let Some(dest) = raw.get("destination") {
        if let Ok(dest) = serde_json::from_value::<Destination>(dest.clone()) {
            config.destination = dest;
        }
    }
    if let Some(format) = raw.get("logFormat") {
        if let Ok(format) = serde_json::from_value::<LogFormat>(format.clone()) {
            config.tool.log_format = format;
        }
    }
    config.tool.dry_run = raw.get("dryRun").and_then(|v| v.as_bool()).unwrap_or(false);
    config.save_path(&path)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::destination::{PlatformFamily, TargetType};

    #[test]
    fn save_then_load_is_structurally_equal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::new();
        config.scheme = "App".to_string();
        config.configuration = "Debug".to_string();
        config.destination.platform_family = PlatformFamily::Ios;
        config.destination.target_type = TargetType::Simulator;
        config.tool.log_format = LogFormat::Raw;
        config.tool.env.insert("CODE_SIGNING_ALLOWED".to_string(), "NO".to_string());
        config.last_app_path = "/tmp/App.app".to_string();
        config.save(dir.path()).expect("save");

        let loaded = Config::load(dir.path()).expect("load");
        assert_eq!(loaded.scheme, config.scheme);
        assert_eq!(loaded.destination, config.destination);
        assert_eq!(loaded.tool, config.tool);
        assert!(loaded.last_app_path.is_empty(), "transient fields never persist");
    }

    #[test]
    fn missing_document_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load(dir.path()).expect("load");
        assert_eq!(config.version, CONFIG_VERSION);
        assert!(config.scheme.is_empty());
    }

    #[test]
    fn version_mismatch_is_a_typed_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Config::path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"version": 1, "scheme": "Old"}"#).unwrap();

        let err = Config::load(dir.path()).unwrap_err();
        match err {
            ConfigError::VersionMismatch { found, expected } => {
                assert_eq!(found, 1);
                assert_eq!(expected, CONFIG_VERSION);
            }
            other => panic!("expected version mismatch, got {other}"),
        }
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn migration_backs_up_and_reloads_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Config::path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            r#"{"version": 1, "scheme": "Old", "logFormat": "raw", "dryRun": true}"#,
        )
        .unwrap();

        let migrated = migrate(dir.path()).expect("migrate");
        assert_eq!(migrated.version, CONFIG_VERSION);
        assert_eq!(migrated.scheme, "Old");
        assert_eq!(migrated.tool.log_format, LogFormat::Raw);
        assert!(migrated.tool.dry_run);
        assert!(path.with_extension("json.bak").exists(), "backup left aside");

        let reloaded = Config::load(dir.path()).expect("reload");
        assert_eq!(reloaded.scheme, "Old");
    }

    #[test]
    fn unknown_version_does_not_migrate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Config::path_in(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, r#"{"version": 7}"#).unwrap();
        assert!(matches!(
            migrate(dir.path()),
            Err(ConfigError::VersionMismatch { found: 7, .. })
        ));
    }
}
