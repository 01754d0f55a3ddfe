//! `simctl` adapter: simulator enumeration, boot, install, launch

use regex_lite::Regex;
use serde_json::Value;
use std::sync::Arc;

use super::{LaunchOutcome, SimLaunchRequest, SINGLE_SHOT_TIMEOUT, ToolError, Xcrun};
use crate::cancel::CancelToken;
use crate::destination::{platform_string, Candidate, PlatformFamily, TargetType};
use crate::process::{run_capture, run_streaming, CapturedOutput, LineHandler, StreamSource};

/// Flatten `simctl list --json` into resolver candidates.
///
/// The document maps runtime identifiers to device arrays; the runtime
/// identifier also carries the platform and OS version, e.g.
/// `com.apple.CoreSimulator.SimRuntime.iOS-18-2`.
pub fn parse_device_list(value: &Value) -> Vec<Candidate> {
    let mut out = Vec::new();
    let Some(devices) = value.get("devices").and_then(Value::as_object) else {
        return out;
    };
    let runtime_names = runtime_name_map(value);
    for (runtime_id, list) in devices {
        let (family_hint, os_version) = parse_runtime(runtime_id);
        let Some(list) = list.as_array() else {
            continue;
        };
        for device in list {
            let Some(name) = device.get("name").and_then(Value::as_str) else {
                continue;
            };
            let Some(udid) = device.get("udid").and_then(Value::as_str) else {
                continue;
            };
            let state = device
                .get("state")
                .and_then(Value::as_str)
                .unwrap_or_default();
            // Newer outputs carry a boolean; older ones a string field.
            let available = device
                .get("isAvailable")
                .and_then(Value::as_bool)
                .unwrap_or_else(|| {
                    device
                        .get("availability")
                        .and_then(Value::as_str)
                        .map(|a| !a.contains("unavailable"))
                        .unwrap_or(true)
                });
            let family = refine_family(family_hint, name);
            out.push(Candidate {
                id: udid.to_string(),
                name: name.to_string(),
                platform_family: family,
                target_type: TargetType::Simulator,
                platform: platform_string(family, TargetType::Simulator),
                os_version: os_version.clone().unwrap_or_default(),
                runtime_id: runtime_id.clone(),
                runtime_name: runtime_names
                    .get(runtime_id.as_str())
                    .cloned()
                    .unwrap_or_default(),
                state: state.to_string(),
                available,
            });
        }
    }
    out
}

/// Map runtime identifiers to their display names from the `runtimes` array.
fn runtime_name_map(value: &Value) -> std::collections::HashMap<&str, String> {
    let mut map = std::collections::HashMap::new();
    if let Some(runtimes) = value.get("runtimes").and_then(Value::as_array) {
        for runtime in runtimes {
            if let (Some(id), Some(name)) = (
                runtime.get("identifier").and_then(Value::as_str),
                runtime.get("name").and_then(Value::as_str),
            ) {
                map.insert(id, name.to_string());
            }
        }
    }
    map
}

/// Split a CoreSimulator runtime identifier into family and dotted version.
fn parse_runtime(runtime_id: &str) -> (PlatformFamily, Option<String>) {
    let tail = runtime_id.rsplit('.').next().unwrap_or(runtime_id);
    let mut parts = tail.splitn(2, '-');
    let family = match parts.next().unwrap_or_default().to_ascii_lowercase().as_str() {
        "ios" => PlatformFamily::Ios,
        "tvos" => PlatformFamily::Tvos,
        "watchos" => PlatformFamily::Watchos,
        "xros" | "visionos" => PlatformFamily::Visionos,
        _ => PlatformFamily::Unknown,
    };
    let version = parts.next().map(|v| v.replace('-', "."));
    (family, version)
}

/// iPad simulators live under the iOS runtime but resolve as iPadOS.
fn refine_family(family: PlatformFamily, name: &str) -> PlatformFamily {
    if family == PlatformFamily::Ios && name.to_ascii_lowercase().contains("ipad") {
        PlatformFamily::Ipados
    } else {
        family
    }
}

/// Boot a simulator; booting one that is already booted is success.
pub fn boot(xcrun: &Xcrun, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
    let request = xcrun.request("simctl", &["boot", udid]);
    let output = run_capture(&request, token, Some(SINGLE_SHOT_TIMEOUT))?;
    if output.success() {
        return Ok(());
    }
    let combined = output.combined().to_ascii_lowercase();
    if combined.contains("current state: booted") || combined.contains("already booted") {
        return Ok(());
    }
    Err(ToolError::failed(
        "simctl",
        format!("boot failed: {}", output.stderr.trim()),
    ))
}

/// Block until the simulator finishes booting.
pub fn wait_booted(xcrun: &Xcrun, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
    xcrun.capture("simctl", &["bootstatus", udid, "-b"], None, token)?;
    Ok(())
}

/// Launch an app, rewriting the environment for the simulator child.
///
/// With a handler the launch child is streamed until it exits (`--console`);
/// otherwise output is captured and the call returns once `simctl` does.
pub fn launch(
    xcrun: &Xcrun,
    request: &SimLaunchRequest,
    token: &CancelToken,
    handler: Option<Arc<dyn LineHandler>>,
) -> Result<LaunchOutcome, ToolError> {
    let mut args = vec!["launch".to_string()];
    if request.console {
        args.push("--console".to_string());
    }
    args.push("--terminate-running-process".to_string());
    args.push(request.udid.clone());
    args.push(request.bundle_id.clone());
    args.extend(request.args.iter().cloned());

    let mut env = std::collections::HashMap::new();
    for (key, value) in &request.env {
        // simctl forwards SIMCTL_CHILD_* variables to the launched app.
        env.insert(format!("SIMCTL_CHILD_{key}"), value.clone());
    }

    let mut full = vec!["simctl".to_string()];
    full.extend(args);
    let process = crate::process::ProcessRequest::new(
        xcrun.launcher.as_deref().unwrap_or("xcrun"),
        full,
    )
    .with_env(env);

    match handler {
        Some(handler) => {
            // Tee the stream into a transcript so the pid survives the run.
            let transcript = Arc::new(std::sync::Mutex::new(String::new()));
            let tee: Arc<dyn LineHandler> = {
                let transcript = Arc::clone(&transcript);
                Arc::new(move |source: StreamSource, line: &str| {
                    if let Ok(mut buf) = transcript.lock() {
                        buf.push_str(line);
                        buf.push('\n');
                    }
                    handler.on_line(source, line);
                })
            };
            let outcome = run_streaming(&process, token, tee)?;
            let text = transcript.lock().map(|b| b.clone()).unwrap_or_default();
            let pid = parse_launch_pid(&text);
            // As in capture mode, a known pid means the app started; a
            // nonzero exit then reports how it ended, not a launch failure.
            if !outcome.success() && !outcome.cancelled && pid.is_none() {
                return Err(ToolError::failed(
                    "simctl",
                    format!("launch exited with code {:?}", outcome.exit_code),
                ));
            }
            Ok(LaunchOutcome {
                pid,
                output: CapturedOutput {
                    stdout: text,
                    stderr: String::new(),
                    exit_code: outcome.exit_code,
                },
            })
        }
        None => {
            let output = run_capture(&process, token, None)?;
            let pid = parse_launch_pid(&output.combined());
            // A failed launch that still reports a pid means the app started
            // and exited; that is the caller's to interpret, not an error.
            if !output.success() && pid.is_none() {
                return Err(ToolError::failed(
                    "simctl",
                    format!("launch failed: {}", output.stderr.trim()),
                ));
            }
            Ok(LaunchOutcome { pid, output })
        }
    }
}

/// Shut a simulator down; already-shutdown is success.
pub fn shutdown(xcrun: &Xcrun, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
    let request = xcrun.request("simctl", &["shutdown", udid]);
    let output = run_capture(&request, token, Some(SINGLE_SHOT_TIMEOUT))?;
    if output.success() || output.combined().to_ascii_lowercase().contains("current state: shutdown") {
        return Ok(());
    }
    Err(ToolError::failed(
        "simctl",
        format!("shutdown failed: {}", output.stderr.trim()),
    ))
}

pub fn erase(xcrun: &Xcrun, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
    xcrun.capture("simctl", &["erase", udid], None, token)?;
    Ok(())
}

pub fn open_url(xcrun: &Xcrun, udid: &str, url: &str, token: &CancelToken) -> Result<(), ToolError> {
    xcrun.capture("simctl", &["openurl", udid, url], Some(SINGLE_SHOT_TIMEOUT), token)?;
    Ok(())
}

pub fn screenshot(
    xcrun: &Xcrun,
    udid: &str,
    output_path: &str,
    token: &CancelToken,
) -> Result<(), ToolError> {
    xcrun.capture(
        "simctl",
        &["io", udid, "screenshot", output_path],
        Some(SINGLE_SHOT_TIMEOUT),
        token,
    )?;
    Ok(())
}

/// Create a simulator, returning its new UDID.
pub fn create(
    xcrun: &Xcrun,
    name: &str,
    device_type: &str,
    runtime: Option<&str>,
    token: &CancelToken,
) -> Result<String, ToolError> {
    let mut args = vec!["create", name, device_type];
    if let Some(runtime) = runtime {
        args.push(runtime);
    }
    let output = xcrun.capture("simctl", &args, None, token)?;
    Ok(output.stdout.trim().to_string())
}

pub fn delete(xcrun: &Xcrun, udid: &str, token: &CancelToken) -> Result<(), ToolError> {
    xcrun.capture("simctl", &["delete", udid], None, token)?;
    Ok(())
}

/// Delete simulators whose runtime is no longer installed.
pub fn prune(xcrun: &Xcrun, token: &CancelToken) -> Result<(), ToolError> {
    xcrun.capture("simctl", &["delete", "unavailable"], None, token)?;
    Ok(())
}

/// Pull the launched process id out of `simctl launch` output.
///
/// The format varies by Xcode release; a labelled `pid` wins, any integer is
/// the fallback, and a nonzero value is preferred over zero in both passes.
pub fn parse_launch_pid(output: &str) -> Option<i64> {
    let labelled = Regex::new(r"(?i)\bpid\b[^0-9]*([0-9]+)").ok()?;
    let mut zero_seen = false;
    for caps in labelled.captures_iter(output) {
        if let Ok(pid) = caps[1].parse::<i64>() {
            if pid != 0 {
                return Some(pid);
            }
            zero_seen = true;
        }
    }
    let any_int = Regex::new(r"([0-9]+)").ok()?;
    for caps in any_int.captures_iter(output) {
        if let Ok(pid) = caps[1].parse::<i64>() {
            if pid != 0 {
                return Some(pid);
            }
            zero_seen = true;
        }
    }
    if zero_seen {
        Some(0)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_device_list_with_runtime_versions() {
        let doc = json!({
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-18-2": [
                    {"name": "iPhone 16", "udid": "AAAA", "state": "Booted", "isAvailable": true},
                    {"name": "iPad Pro 13-inch", "udid": "BBBB", "state": "Shutdown", "isAvailable": true}
                ],
                "com.apple.CoreSimulator.SimRuntime.watchOS-11-0": [
                    {"name": "Apple Watch Series 10", "udid": "CCCC", "state": "Shutdown", "isAvailable": false}
                ]
            }
        });
        let mut list = parse_device_list(&doc);
        list.sort_by(|a, b| a.id.cmp(&b.id));
        assert_eq!(list.len(), 3);
        assert_eq!(list[0].platform_family, PlatformFamily::Ios);
        assert_eq!(list[0].os_version, "18.2");
        assert_eq!(list[0].state, "Booted");
        assert_eq!(list[0].platform, "iOS Simulator");
        assert_eq!(
            list[1].platform_family,
            PlatformFamily::Ipados,
            "iPad refines to iPadOS"
        );
        assert_eq!(list[2].platform_family, PlatformFamily::Watchos);
        assert!(!list[2].available);
    }

    #[test]
    fn tolerates_string_availability_field() {
        let doc = json!({
            "devices": {
                "com.apple.CoreSimulator.SimRuntime.iOS-12-4": [
                    {"name": "iPhone 6", "udid": "DDDD", "state": "Shutdown",
                     "availability": "(unavailable, runtime profile not found)"}
                ]
            }
        });
        let list = parse_device_list(&doc);
        assert_eq!(list.len(), 1);
        assert!(!list[0].available);
    }

    #[test]
    fn labelled_pid_wins() {
        assert_eq!(parse_launch_pid("com.example.app: pid 4242"), Some(4242));
        assert_eq!(parse_launch_pid("com.example.app: 31337"), Some(31337));
    }

    #[test]
    fn nonzero_pid_preferred_over_zero() {
        assert_eq!(parse_launch_pid("Launched 0 (pid=0)"), Some(0));
        assert_eq!(parse_launch_pid("pid=0 then later 512"), Some(512));
        assert_eq!(parse_launch_pid("no numbers here"), None);
    }

    #[cfg(unix)]
    fn fake_launcher(dir: &std::path::Path, script: &str) -> Xcrun {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-xcrun");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        Xcrun {
            launcher: Some(path.to_string_lossy().into_owned()),
        }
    }

    #[cfg(unix)]
    fn console_request() -> SimLaunchRequest {
        SimLaunchRequest {
            udid: "SIM-1".to_string(),
            bundle_id: "com.example.app".to_string(),
            console: true,
            ..SimLaunchRequest::default()
        }
    }

    #[cfg(unix)]
    #[test]
    fn console_launch_keeps_pid_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let xcrun = fake_launcher(
            dir.path(),
            "#!/bin/sh\necho 'com.example.app: pid 4242'\nexit 0\n",
        );
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let handler: Arc<dyn LineHandler> = {
            let seen = Arc::clone(&seen);
            Arc::new(move |_source: StreamSource, line: &str| {
                seen.lock().unwrap().push(line.to_string());
            })
        };

        let outcome = launch(&xcrun, &console_request(), &CancelToken::new(), Some(handler))
            .expect("launch");
        assert_eq!(outcome.pid, Some(4242));
        assert_eq!(outcome.output.exit_code, Some(0));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["com.example.app: pid 4242"],
            "the caller's handler still sees every line"
        );
    }

    #[cfg(unix)]
    #[test]
    fn console_launch_with_pid_and_nonzero_exit_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let xcrun = fake_launcher(
            dir.path(),
            "#!/bin/sh\necho 'com.example.app: pid 512'\nexit 3\n",
        );
        let handler: Arc<dyn LineHandler> = Arc::new(|_: StreamSource, _: &str| {});

        let outcome = launch(&xcrun, &console_request(), &CancelToken::new(), Some(handler))
            .expect("a launched-then-exited app is the caller's to interpret");
        assert_eq!(outcome.pid, Some(512));
        assert_eq!(outcome.output.exit_code, Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn console_launch_without_pid_fails_on_nonzero_exit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let xcrun = fake_launcher(
            dir.path(),
            "#!/bin/sh\necho 'no such app' >&2\nexit 64\n",
        );
        let handler: Arc<dyn LineHandler> = Arc::new(|_: StreamSource, _: &str| {});

        let result = launch(&xcrun, &console_request(), &CancelToken::new(), Some(handler));
        assert!(result.is_err());
    }
}
