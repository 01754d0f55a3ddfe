//! `xcodebuild` helpers: invocation shaping, build-settings parsing, and
//! scheme/configuration discovery

use regex_lite::Regex;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::destination::{Destination, Kind};

/// Parse `-showBuildSettings` output.
///
/// Settings print as indented `KEY = VALUE` lines; anything else (section
/// headers, blank lines, tool chatter) is skipped.
pub fn parse_build_settings(text: &str) -> HashMap<String, String> {
    let mut settings = HashMap::new();
    for line in text.lines() {
        let trimmed = line.trim();
        let Some((key, value)) = trimmed.split_once(" = ") else {
            continue;
        };
        let key = key.trim();
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
            || key.chars().next().is_some_and(|c| c.is_ascii_digit())
        {
            continue;
        }
        settings.insert(key.to_string(), value.trim().to_string());
    }
    settings
}

/// Build the `-destination` argument for a resolved destination.
pub fn destination_string(dest: &Destination) -> String {
    match dest.kind {
        Kind::Macos => "platform=macOS".to_string(),
        Kind::Catalyst => "platform=macOS,variant=Mac Catalyst".to_string(),
        _ => {
            let id = if dest.target_id.is_empty() {
                &dest.udid
            } else {
                &dest.target_id
            };
            format!("platform={},id={}", dest.platform, id)
        }
    }
}

/// Workspace/project container found in a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Container {
    pub workspace: Option<PathBuf>,
    pub project: Option<PathBuf>,
}

impl Container {
    pub fn is_empty(&self) -> bool {
        self.workspace.is_none() && self.project.is_none()
    }

    /// Arguments selecting this container, workspace preferred.
    pub fn args(&self) -> Vec<String> {
        if let Some(ws) = &self.workspace {
            vec!["-workspace".to_string(), ws.to_string_lossy().into_owned()]
        } else if let Some(proj) = &self.project {
            vec!["-project".to_string(), proj.to_string_lossy().into_owned()]
        } else {
            Vec::new()
        }
    }
}

/// Locate the `.xcworkspace` / `.xcodeproj` in a directory (top level only).
pub fn find_container(root: &Path) -> std::io::Result<Container> {
    let mut container = Container::default();
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            continue;
        };
        match ext {
            "xcworkspace" if container.workspace.is_none() => container.workspace = Some(path),
            "xcodeproj" if container.project.is_none() => container.project = Some(path),
            _ => {}
        }
    }
    Ok(container)
}

/// Discover scheme names from the filesystem.
///
/// Shared and per-user schemes live as `*.xcscheme` files under
/// `xcshareddata/xcschemes` and `xcuserdata/<user>.xcuserdatad/xcschemes`
/// inside each project or workspace container. Workspaces may reference
/// projects outside the root; those are scanned through their FileRefs.
pub fn discover_schemes(root: &Path) -> Vec<String> {
    let mut names = BTreeSet::new();
    let mut roots = vec![root.to_path_buf()];
    roots.extend(workspace_project_refs(root));
    for scan_root in roots {
        collect_schemes(&scan_root, &mut names);
    }
    names.into_iter().collect()
}

fn collect_schemes(root: &Path, names: &mut BTreeSet<String>) {
    for entry in WalkDir::new(root)
        .max_depth(6)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e.path()))
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("xcscheme") {
            continue;
        }
        let in_schemes_dir = path
            .parent()
            .and_then(|p| p.file_name())
            .is_some_and(|d| d == "xcschemes");
        if !in_schemes_dir {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.insert(stem.to_string());
        }
    }
}

/// Project directories a workspace references through its
/// `contents.xcworkspacedata` FileRefs. Locations resolve relative to the
/// workspace's parent directory, so they can point outside the root.
fn workspace_project_refs(root: &Path) -> Vec<PathBuf> {
    let location =
        Regex::new(r#"location\s*=\s*"(?:group:|container:|absolute:|self:)?([^"]+)""#).unwrap();
    let mut refs = Vec::new();
    for entry in WalkDir::new(root)
        .max_depth(3)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e.path()))
        .filter_map(Result::ok)
    {
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) != Some("contents.xcworkspacedata") {
            continue;
        }
        let Ok(text) = fs::read_to_string(path) else {
            continue;
        };
        // <workspace>.xcworkspace/contents.xcworkspacedata
        let base = path.parent().and_then(Path::parent).unwrap_or(root);
        for caps in location.captures_iter(&text) {
            let loc = Path::new(&caps[1]);
            let referenced = if loc.is_absolute() {
                loc.to_path_buf()
            } else {
                base.join(loc)
            };
            if referenced.extension().and_then(|e| e.to_str()) == Some("xcodeproj")
                && referenced.is_dir()
            {
                refs.push(referenced);
            }
        }
    }
    refs
}

fn is_ignored_dir(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| {
            n == "DerivedData" || n == "build" || n == ".git" || n == ".xcbolt" || n == "Pods"
        })
}

/// Discover build configuration names from `project.pbxproj` files.
///
/// Within the `XCBuildConfiguration` section each entry's header comment
/// carries its configuration name.
pub fn discover_configurations(root: &Path) -> Vec<String> {
    let header = Regex::new(r"^\s*[0-9A-Fa-f]{8,} /\* (.+) \*/ = \{$").unwrap();
    let mut names = BTreeSet::new();
    for entry in WalkDir::new(root)
        .max_depth(4)
        .into_iter()
        .filter_entry(|e| !is_ignored_dir(e.path()))
        .filter_map(Result::ok)
    {
        if entry.path().file_name().and_then(|n| n.to_str()) != Some("project.pbxproj") {
            continue;
        }
        let Ok(text) = fs::read_to_string(entry.path()) else {
            continue;
        };
        let mut in_section = false;
        for line in text.lines() {
            if line.contains("Begin XCBuildConfiguration section") {
                in_section = true;
            } else if line.contains("End XCBuildConfiguration section") {
                in_section = false;
            } else if in_section {
                if let Some(caps) = header.captures(line) {
                    names.insert(caps[1].to_string());
                }
            }
        }
    }
    names.into_iter().collect()
}

/// Union scheme names from `-list -json` output into the discovered set.
pub fn merge_listed_schemes(schemes: &mut Vec<String>, listed: &Value) {
    let mut set: BTreeSet<String> = schemes.iter().cloned().collect();
    for key in ["workspace", "project"] {
        if let Some(listed) = listed
            .get(key)
            .and_then(|c| c.get("schemes"))
            .and_then(Value::as_array)
        {
            for s in listed.iter().filter_map(Value::as_str) {
                set.insert(s.to_string());
            }
        }
    }
    *schemes = set.into_iter().collect();
}

/// Union configuration names from `-list -json` output.
pub fn merge_listed_configurations(configurations: &mut Vec<String>, listed: &Value) {
    let mut set: BTreeSet<String> = configurations.iter().cloned().collect();
    if let Some(listed) = listed
        .get("project")
        .and_then(|c| c.get("configurations"))
        .and_then(Value::as_array)
    {
        for s in listed.iter().filter_map(Value::as_str) {
            set.insert(s.to_string());
        }
    }
    *configurations = set.into_iter().collect();
}
