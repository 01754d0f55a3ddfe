//! Watch companion planning
//!
//! A watchOS run against a physical watch goes through its paired iPhone:
//! the companion app installs on the phone, the watch app on the watch. The
//! planner works out which built bundle is which and where they go.

use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::bundle::{find_app_bundles, read_app_bundle, AppBundleInfo, BundleError};
use crate::cancel::CancelToken;
use crate::destination::{Candidate, PlatformFamily, TargetType};

#[derive(Debug, Error)]
pub enum WatchError {
    /// A watchOS device run needs a companion target to route through
    #[error("watchOS device runs require a companion target")]
    CompanionRequired,

    #[error("no companion device matches {requested:?}")]
    CompanionNotFound { requested: String },

    #[error("companion target {requested:?} matches {matches} devices")]
    CompanionAmbiguous { requested: String, matches: usize },

    #[error("no watch app found under {0}")]
    WatchAppNotFound(PathBuf),

    #[error("no companion app for {bundle_id} found under {searched}")]
    CompanionAppNotFound { bundle_id: String, searched: PathBuf },

    #[error(
        "watch app pairs with {recorded}, but the companion app is {actual}"
    )]
    PairingMismatch { recorded: String, actual: String },

    #[error(transparent)]
    Bundle(#[from] BundleError),
}

/// Reads bundle identity; the seam exists so pairing logic is testable
/// without a real `Info.plist` toolchain.
pub trait BundleReader {
    fn read(&self, app: &Path) -> Result<AppBundleInfo, BundleError>;
}

/// The real reader, backed by `plutil`.
pub struct PlistReader<'a> {
    pub token: &'a CancelToken,
}

impl BundleReader for PlistReader<'_> {
    fn read(&self, app: &Path) -> Result<AppBundleInfo, BundleError> {
        read_app_bundle(app, self.token)
    }
}

/// A resolved deployment plan for a watch run.
#[derive(Debug, Clone)]
pub struct WatchPlan {
    /// Paired iPhone the companion app installs on.
    pub companion_device_id: String,
    pub companion_app: AppBundleInfo,
    pub watch_app: AppBundleInfo,
}

/// Resolve the companion device from the enumerated candidates.
///
/// Only physical iOS/iPadOS devices qualify; the request matches by exact
/// id or name, case-insensitively, and must hit exactly one.
pub fn resolve_companion_device(
    requested: &str,
    candidates: &[Candidate],
) -> Result<Candidate, WatchError> {
    if requested.is_empty() {
        return Err(WatchError::CompanionRequired);
    }
    let matches: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| {
            c.target_type == TargetType::Device
                && matches!(
                    c.platform_family,
                    PlatformFamily::Ios | PlatformFamily::Ipados
                )
        })
        .filter(|c| {
            c.id.eq_ignore_ascii_case(requested) || c.name.eq_ignore_ascii_case(requested)
        })
        .collect();
    match matches.len() {
        1 => Ok(matches[0].clone()),
        0 => Err(WatchError::CompanionNotFound {
            requested: requested.to_string(),
        }),
        n => Err(WatchError::CompanionAmbiguous {
            requested: requested.to_string(),
            matches: n,
        }),
    }
}

/// Figure out the watch/phone bundle pair starting from the bundle the
/// build just produced.
pub fn pair_bundles(
    built: &AppBundleInfo,
    build_dir: &Path,
    reader: &dyn BundleReader,
) -> Result<(AppBundleInfo, AppBundleInfo), WatchError> {
    if built.is_watch_app {
        let companion = find_companion_for(built, build_dir, reader)?;
        Ok((built.clone(), companion))
    } else {
        let watch = find_watch_for(built, build_dir, reader)?;
        Ok((watch, built.clone()))
    }
}

/// The built bundle is the watch app; hunt the phone app in the build dir.
fn find_companion_for(
    watch: &AppBundleInfo,
    build_dir: &Path,
    reader: &dyn BundleReader,
) -> Result<AppBundleInfo, WatchError> {
    let recorded = watch.companion_bundle_id.as_deref().unwrap_or_default();
    let mut non_watch = Vec::new();
    for app in find_app_bundles(build_dir, 4) {
        if app == watch.path {
            continue;
        }
        let Ok(info) = reader.read(&app) else { continue };
        if info.is_watch_app {
            continue;
        }
        if !recorded.is_empty() && info.bundle_id == recorded {
            return Ok(info);
        }
        non_watch.push(info);
    }
    // No id match; a lone non-watch bundle is unambiguous enough.
    if non_watch.len() == 1 {
        return Ok(non_watch.into_iter().next().unwrap());
    }
    Err(WatchError::CompanionAppNotFound {
        bundle_id: if recorded.is_empty() {
            watch.bundle_id.clone()
        } else {
            recorded.to_string()
        },
        searched: build_dir.to_path_buf(),
    })
}

/// The built bundle is the phone app; prefer its embedded `Watch/*.app`,
/// falling back to a build-dir sweep for watch apps pointing back at it.
fn find_watch_for(
    phone: &AppBundleInfo,
    build_dir: &Path,
    reader: &dyn BundleReader,
) -> Result<AppBundleInfo, WatchError> {
    let embedded_dir = phone.path.join("Watch");
    if embedded_dir.is_dir() {
        for app in find_app_bundles(&embedded_dir, 2) {
            if let Ok(info) = reader.read(&app) {
                if info.is_watch_app {
                    return Ok(info);
                }
            }
        }
    }
    for app in find_app_bundles(build_dir, 4) {
        let Ok(info) = reader.read(&app) else { continue };
        if info.is_watch_app
            && info.companion_bundle_id.as_deref() == Some(phone.bundle_id.as_str())
        {
            return Ok(info);
        }
    }
    Err(WatchError::WatchAppNotFound(build_dir.to_path_buf()))
}

/// Build the full plan: companion device, bundle pairing, validation.
pub fn plan(
    companion_target: &str,
    built: &AppBundleInfo,
    build_dir: &Path,
    candidates: &[Candidate],
    reader: &dyn BundleReader,
) -> Result<WatchPlan, WatchError> {
    let device = resolve_companion_device(companion_target, candidates)?;
    let (watch_app, companion_app) = pair_bundles(built, build_dir, reader)?;
    validate_pairing(&watch_app, &companion_app)?;
    Ok(WatchPlan {
        companion_device_id: device.id,
        companion_app,
        watch_app,
    })
}

fn validate_pairing(
    watch: &AppBundleInfo,
    companion: &AppBundleInfo,
) -> Result<(), WatchError> {
    if watch.bundle_id.is_empty() || companion.bundle_id.is_empty() {
        return Err(WatchError::PairingMismatch {
            recorded: watch.companion_bundle_id.clone().unwrap_or_default(),
            actual: companion.bundle_id.clone(),
        });
    }
    if let Some(recorded) = watch.companion_bundle_id.as_deref() {
        if !recorded.is_empty() && recorded != companion.bundle_id {
            return Err(WatchError::PairingMismatch {
                recorded: recorded.to_string(),
                actual: companion.bundle_id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;

    struct MapReader(HashMap<PathBuf, AppBundleInfo>);

    impl BundleReader for MapReader {
        fn read(&self, app: &Path) -> Result<AppBundleInfo, BundleError> {
            self.0
                .get(app)
                .cloned()
                .ok_or_else(|| BundleError::MissingInfoPlist(app.to_path_buf()))
        }
    }

    fn device(id: &str, name: &str, family: PlatformFamily) -> Candidate {
        Candidate {
            id: id.to_string(),
            name: name.to_string(),
            platform_family: family,
            target_type: TargetType::Device,
            platform: "iOS".to_string(),
            os_version: String::new(),
            runtime_id: String::new(),
            runtime_name: String::new(),
            state: String::new(),
            available: true,
        }
    }

    fn info(path: &Path, bundle_id: &str, companion: Option<&str>) -> AppBundleInfo {
        AppBundleInfo {
            path: path.to_path_buf(),
            bundle_id: bundle_id.to_string(),
            is_watch_app: companion.is_some(),
            companion_bundle_id: companion.map(str::to_string),
            ..AppBundleInfo::default()
        }
    }

    #[test]
    fn companion_device_matches_by_name_case_insensitively() {
        let candidates = vec![
            device("iphone-udid", "My-Phone", PlatformFamily::Ios),
            device("watch-udid", "My Watch", PlatformFamily::Watchos),
        ];
        let found = resolve_companion_device("my-phone", &candidates).expect("resolved");
        assert_eq!(found.id, "iphone-udid");
    }

    #[test]
    fn simulators_never_qualify_as_companion() {
        let mut sim = device("sim-udid", "iPhone 16", PlatformFamily::Ios);
        sim.target_type = TargetType::Simulator;
        let err = resolve_companion_device("iPhone 16", &[sim]).unwrap_err();
        assert!(matches!(err, WatchError::CompanionNotFound { .. }));
    }

    #[test]
    fn empty_companion_target_is_rejected() {
        let err = resolve_companion_device("", &[]).unwrap_err();
        assert!(matches!(err, WatchError::CompanionRequired));
    }

    #[test]
    fn pairs_embedded_watch_app_from_phone_build() {
        let dir = tempfile::tempdir().expect("tempdir");
        let phone_path = dir.path().join("Build/Phone.app");
        let watch_path = phone_path.join("Watch/Watch.app");
        fs::create_dir_all(&watch_path).unwrap();

        let phone = info(&phone_path, "com.example.phone", None);
        let watch = info(&watch_path, "com.example.phone.watch", Some("com.example.phone"));
        let reader = MapReader(HashMap::from([
            (phone_path.clone(), phone.clone()),
            (watch_path.clone(), watch.clone()),
        ]));
        let candidates = vec![device("iphone-udid", "my-phone", PlatformFamily::Ios)];

        let plan = plan("my-phone", &phone, dir.path(), &candidates, &reader).expect("plan");
        assert_eq!(plan.companion_device_id, "iphone-udid");
        assert!(plan.watch_app.path.ends_with("Watch/Watch.app"));
        assert!(plan.companion_app.path.ends_with("Phone.app"));
    }

    #[test]
    fn watch_build_finds_companion_by_recorded_id() {
        let dir = tempfile::tempdir().expect("tempdir");
        let watch_path = dir.path().join("Watch.app");
        let phone_path = dir.path().join("Phone.app");
        fs::create_dir_all(&watch_path).unwrap();
        fs::create_dir_all(&phone_path).unwrap();

        let watch = info(&watch_path, "com.example.watch", Some("com.example.phone"));
        let phone = info(&phone_path, "com.example.phone", None);
        let reader = MapReader(HashMap::from([
            (watch_path.clone(), watch.clone()),
            (phone_path.clone(), phone.clone()),
        ]));

        let (w, p) = pair_bundles(&watch, dir.path(), &reader).expect("paired");
        assert_eq!(w.bundle_id, "com.example.watch");
        assert_eq!(p.bundle_id, "com.example.phone");
    }

    #[test]
    fn recorded_companion_mismatch_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let phone_path = dir.path().join("Build/Phone.app");
        let watch_path = phone_path.join("Watch/Watch.app");
        fs::create_dir_all(&watch_path).unwrap();

        let phone = info(&phone_path, "com.example.other", None);
        let watch = info(&watch_path, "com.example.watch", Some("com.example.phone"));
        let reader = MapReader(HashMap::from([
            (phone_path.clone(), phone.clone()),
            (watch_path.clone(), watch.clone()),
        ]));
        let candidates = vec![device("iphone-udid", "my-phone", PlatformFamily::Ios)];

        let err = plan("my-phone", &phone, dir.path(), &candidates, &reader).unwrap_err();
        assert!(matches!(err, WatchError::PairingMismatch { .. }));
    }
}
