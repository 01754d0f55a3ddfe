//! `devicectl` adapter: physical device enumeration, install, launch
//!
//! `devicectl` JSON output has shifted shape across Xcode releases, so
//! parsing walks the tree for device-looking objects instead of binding a
//! fixed schema.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

use super::{LaunchOutcome, LIST_TIMEOUT, ToolError, Xcrun};
use crate::cancel::CancelToken;
use crate::destination::{platform_string, Candidate, PlatformFamily, TargetType};
use crate::process::run_capture;
use crate::tools::simctl::parse_launch_pid;

/// Identifier keys tried in order on a candidate device object.
const IDENTIFIER_KEYS: &[&str] = &[
    "identifier",
    "udid",
    "deviceIdentifier",
    "deviceUDID",
    "deviceId",
    "id",
];

/// Enumerate connected physical devices.
///
/// `devicectl` writes its JSON report to a file, not stdout.
pub fn enumerate(xcrun: &Xcrun, token: &CancelToken) -> Result<Vec<Candidate>, ToolError> {
    let report = report_path();
    let result = enumerate_into(xcrun, &report, token);
    let _ = fs::remove_file(&report);
    result
}

fn enumerate_into(
    xcrun: &Xcrun,
    report: &Path,
    token: &CancelToken,
) -> Result<Vec<Candidate>, ToolError> {
    let report_arg = report.to_string_lossy().into_owned();
    let request = xcrun.request(
        "devicectl",
        &["list", "devices", "--json-output", &report_arg],
    );
    let output = run_capture(&request, token, Some(LIST_TIMEOUT))?;
    if !output.success() {
        return Err(ToolError::failed(
            "devicectl",
            format!("list devices failed: {}", output.stderr.trim()),
        ));
    }
    let text = fs::read_to_string(report)?;
    let value: Value =
        serde_json::from_str(&text).map_err(|e| ToolError::parse("devicectl", e.to_string()))?;
    Ok(parse_device_report(&value))
}

fn report_path() -> PathBuf {
    std::env::temp_dir().join(format!("xcbolt-devicectl-{}.json", std::process::id()))
}

/// Walk an arbitrary JSON tree collecting device objects.
pub fn parse_device_report(value: &Value) -> Vec<Candidate> {
    let mut out = Vec::new();
    collect_devices(value, &mut out);
    out
}

fn collect_devices(value: &Value, out: &mut Vec<Candidate>) {
    match value {
        Value::Object(map) => {
            if let Some(candidate) = device_from_object(map) {
                out.push(candidate);
                return;
            }
            for child in map.values() {
                collect_devices(child, out);
            }
        }
        Value::Array(list) => {
            for child in list {
                collect_devices(child, out);
            }
        }
        _ => {}
    }
}

/// A device object has a name and one of the known identifier keys with a
/// plausibly long value.
fn device_from_object(map: &serde_json::Map<String, Value>) -> Option<Candidate> {
    let name = object_string(map, &["name", "deviceName"])?;
    let id = IDENTIFIER_KEYS
        .iter()
        .find_map(|key| lookup_string(map, key))
        .filter(|id| id.len() >= 8)?;
    let os_version = object_string(map, &["osVersionNumber", "osVersion", "osBuildUpdate"]);
    let hint = [
        object_string(map, &["platform"]),
        object_string(map, &["deviceType", "model", "marketingName", "hardwareModel"]),
        Some(name.clone()),
    ]
    .into_iter()
    .flatten()
    .collect::<Vec<_>>()
    .join(" ");
    let family = family_from_hint(&hint);
    Some(Candidate {
        id,
        name,
        platform_family: family,
        target_type: TargetType::Device,
        platform: platform_string(family, TargetType::Device),
        os_version: os_version.unwrap_or_default(),
        runtime_id: String::new(),
        runtime_name: String::new(),
        state: String::new(),
        available: true,
    })
}

/// First string value among the listed keys, searched one nesting level deep
/// as well since newer reports tuck properties under sub-objects.
fn object_string(map: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| lookup_string(map, key))
}

fn lookup_string(map: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    if let Some(s) = map.get(key).and_then(Value::as_str) {
        return Some(s.to_string());
    }
    for child in map.values() {
        if let Some(child) = child.as_object() {
            if let Some(s) = child.get(key).and_then(Value::as_str) {
                return Some(s.to_string());
            }
        }
    }
    None
}

fn family_from_hint(hint: &str) -> PlatformFamily {
    let hint = hint.to_ascii_lowercase();
    if hint.contains("watch") {
        PlatformFamily::Watchos
    } else if hint.contains("vision") || hint.contains("xros") || hint.contains("reality") {
        PlatformFamily::Visionos
    } else if hint.contains("apple tv") || hint.contains("tvos") {
        PlatformFamily::Tvos
    } else if hint.contains("ipad") {
        PlatformFamily::Ipados
    } else {
        PlatformFamily::Ios
    }
}

/// Launch an app, trying `device launch app` first and falling back to the
/// older `device process launch --bundle-id` shape.
pub fn launch(
    xcrun: &Xcrun,
    device_id: &str,
    bundle_id: &str,
    token: &CancelToken,
) -> Result<LaunchOutcome, ToolError> {
    let shapes: [&[&str]; 2] = [
        &["device", "launch", "app", "--device", device_id, bundle_id],
        &[
            "device",
            "process",
            "launch",
            "--device",
            device_id,
            "--bundle-id",
            bundle_id,
        ],
    ];
    let mut last_failure = String::new();
    for shape in shapes {
        let request = xcrun.request("devicectl", shape);
        let output = run_capture(&request, token, None)?;
        if output.success() {
            let pid = parse_launch_pid(&output.combined());
            return Ok(LaunchOutcome { pid, output });
        }
        last_failure = output.stderr.trim().to_string();
    }
    Err(ToolError::failed(
        "devicectl",
        format!("launch failed: {last_failure}"),
    ))
}
