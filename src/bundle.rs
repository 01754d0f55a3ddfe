//! App bundle inspection
//!
//! Property lists come in binary and XML flavors; rather than parse either
//! directly, `plutil` converts `Info.plist` to JSON on stdout and the result
//! is read as an ordinary JSON tree.

use serde_json::Value;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::process::{run_capture, ProcessError, ProcessRequest};

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("no Info.plist in {0}")]
    MissingInfoPlist(PathBuf),

    #[error("could not read {path}: {message}")]
    Unreadable { path: PathBuf, message: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// Identity of a built `.app` bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppBundleInfo {
    pub path: PathBuf,
    pub bundle_id: String,
    pub display_name: String,
    pub bundle_name: String,
    pub executable: String,
    pub version: String,
    pub build_version: String,
    pub is_watch_app: bool,
    /// Set on watch apps; names the paired iPhone app.
    pub companion_bundle_id: Option<String>,
    pub minimum_os_version: Option<String>,
}

/// Read a bundle's identity from its `Info.plist`.
pub fn read_app_bundle(app: &Path, token: &CancelToken) -> Result<AppBundleInfo, BundleError> {
    // macOS app bundles keep the plist under Contents/; iOS-family bundles
    // keep it at the top level.
    let plist = ["Info.plist", "Contents/Info.plist"]
        .iter()
        .map(|rel| app.join(rel))
        .find(|p| p.is_file())
        .ok_or_else(|| BundleError::MissingInfoPlist(app.to_path_buf()))?;

    let value = plist_as_json(&plist, token)?;
    let string = |key: &str| {
        value
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let flag = |key: &str| value.get(key).and_then(Value::as_bool).unwrap_or(false);
    let bundle_id = string("CFBundleIdentifier").ok_or_else(|| BundleError::Unreadable {
        path: plist.clone(),
        message: "missing CFBundleIdentifier".to_string(),
    })?;
    let companion_bundle_id = string("WKCompanionAppBundleIdentifier");
    Ok(AppBundleInfo {
        path: app.to_path_buf(),
        bundle_id,
        display_name: string("CFBundleDisplayName").unwrap_or_default(),
        bundle_name: string("CFBundleName").unwrap_or_default(),
        executable: string("CFBundleExecutable").unwrap_or_default(),
        version: string("CFBundleShortVersionString").unwrap_or_default(),
        build_version: string("CFBundleVersion").unwrap_or_default(),
        is_watch_app: flag("WKWatchKitApp") || flag("WKApplication") || companion_bundle_id.is_some(),
        companion_bundle_id,
        minimum_os_version: string("MinimumOSVersion").or_else(|| string("LSMinimumSystemVersion")),
    })
}

fn plist_as_json(plist: &Path, token: &CancelToken) -> Result<Value, BundleError> {
    let request = ProcessRequest::new(
        "plutil",
        vec![
            "-convert".to_string(),
            "json".to_string(),
            "-o".to_string(),
            "-".to_string(),
            plist.to_string_lossy().into_owned(),
        ],
    );
    let output = run_capture(&request, token, None)?;
    if !output.success() {
        return Err(BundleError::Unreadable {
            path: plist.to_path_buf(),
            message: output.stderr.trim().to_string(),
        });
    }
    serde_json::from_str(&output.stdout).map_err(|e| BundleError::Unreadable {
        path: plist.to_path_buf(),
        message: e.to_string(),
    })
}

/// Find `.app` bundles under a directory, shallowest first.
///
/// Bundles nested inside another `.app` (watch apps, plugins) are skipped;
/// callers that want those look inside a specific bundle themselves.
pub fn find_app_bundles(root: &Path, max_depth: usize) -> Vec<PathBuf> {
    let mut found = Vec::new();
    let mut walker = WalkDir::new(root)
        .max_depth(max_depth)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walker.next() {
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_dir() {
            continue;
        }
        let is_app = entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e == "app");
        if is_app && entry.path() != root {
            found.push(entry.path().to_path_buf());
            walker.skip_current_dir();
        }
    }
    found.sort_by_key(|p| p.components().count());
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn finds_bundles_without_descending_into_them() {
        let dir = tempfile::tempdir().expect("tempdir");
        let outer = dir.path().join("Debug-iphonesimulator/App.app");
        let nested = outer.join("Watch/WatchApp.app");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(dir.path().join("Debug-iphonesimulator/Other.app")).unwrap();

        let found = find_app_bundles(dir.path(), 4);
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|p| !p.ends_with("WatchApp.app")),
            "nested bundles are the caller's business");
    }

    #[test]
    fn shallower_bundles_sort_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a/b/Deep.app")).unwrap();
        fs::create_dir_all(dir.path().join("Shallow.app")).unwrap();

        let found = find_app_bundles(dir.path(), 4);
        assert!(found[0].ends_with("Shallow.app"));
    }

    #[test]
    fn missing_plist_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let app = dir.path().join("Empty.app");
        fs::create_dir_all(&app).unwrap();
        let err = read_app_bundle(&app, &CancelToken::new()).unwrap_err();
        assert!(matches!(err, BundleError::MissingInfoPlist(_)));
    }
}
