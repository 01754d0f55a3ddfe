//! Destination model and resolver
//!
//! A destination is where the app builds, installs and launches: a
//! simulator, a physical device, or the host machine. The resolver turns a
//! high-level request (possibly just "auto") into one concrete candidate
//! enumerated from `simctl`/`devicectl`, by explicit id/name match or by
//! scoring.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

/// High-level destination kind, derivable from (TargetType, PlatformFamily).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    #[default]
    Auto,
    Simulator,
    Device,
    Macos,
    Catalyst,
}

/// Apple platform family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformFamily {
    #[default]
    Unknown,
    Ios,
    Ipados,
    Tvos,
    Visionos,
    Watchos,
    Macos,
    Catalyst,
}

impl PlatformFamily {
    /// Auto-pick penalty; lower is preferred.
    fn priority(self) -> i32 {
        match self {
            PlatformFamily::Ios | PlatformFamily::Unknown => 0,
            PlatformFamily::Ipados => 1,
            PlatformFamily::Tvos => 2,
            PlatformFamily::Visionos => 3,
            PlatformFamily::Watchos => 4,
            PlatformFamily::Macos => 5,
            PlatformFamily::Catalyst => 6,
        }
    }
}

/// What class of target to run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Auto,
    Simulator,
    Device,
    /// The host machine itself (macOS or Catalyst)
    Local,
}

/// Parse a loose platform family spelling ("iPadOS", "apple tv", "watch os",
/// "maccatalyst", ...) into the closed sum. Unrecognized input is Unknown.
pub fn parse_platform_family(input: &str) -> PlatformFamily {
    let folded: String = input
        .to_lowercase()
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
        .collect();
    match folded.as_str() {
        "ios" | "iphoneos" | "iphone" => PlatformFamily::Ios,
        "ipados" | "ipad" => PlatformFamily::Ipados,
        "tvos" | "appletvos" | "appletv" => PlatformFamily::Tvos,
        "visionos" | "xros" | "visionpro" => PlatformFamily::Visionos,
        "watchos" | "applewatch" | "watch" => PlatformFamily::Watchos,
        "macos" | "mac" | "osx" => PlatformFamily::Macos,
        "maccatalyst" | "catalyst" => PlatformFamily::Catalyst,
        _ => PlatformFamily::Unknown,
    }
}

/// Platform display string for a (family, target type) pair, matching the
/// strings `xcodebuild -destination` expects.
pub fn platform_string(family: PlatformFamily, target_type: TargetType) -> String {
    let base = match family {
        PlatformFamily::Ios | PlatformFamily::Ipados | PlatformFamily::Unknown => "iOS",
        PlatformFamily::Tvos => "tvOS",
        PlatformFamily::Visionos => "visionOS",
        PlatformFamily::Watchos => "watchOS",
        PlatformFamily::Macos | PlatformFamily::Catalyst => return "macOS".to_string(),
    };
    match target_type {
        TargetType::Simulator | TargetType::Auto => format!("{} Simulator", base),
        _ => base.to_string(),
    }
}

/// A requested or resolved destination.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Destination {
    pub kind: Kind,

    #[serde(rename = "platformFamily")]
    pub platform_family: PlatformFamily,

    #[serde(rename = "targetType")]
    pub target_type: TargetType,

    /// Canonical target identifier (simulator UDID, device identifier).
    #[serde(rename = "targetId")]
    pub target_id: String,

    /// Legacy alias; kept equal to `target_id` after normalization.
    pub udid: String,

    pub name: String,

    /// Platform display string (e.g. "iOS Simulator").
    pub platform: String,

    #[serde(rename = "osVersion")]
    pub os_version: String,

    #[serde(rename = "runtimeId")]
    pub runtime_id: String,

    /// Paired iPhone id/name for a watchOS physical run.
    #[serde(rename = "companionTarget")]
    pub companion_target: String,

    #[serde(rename = "companionBundleId")]
    pub companion_bundle_id: String,
}

fn kind_for(target_type: TargetType, family: PlatformFamily) -> Kind {
    match target_type {
        TargetType::Simulator => Kind::Simulator,
        TargetType::Device => Kind::Device,
        TargetType::Local => match family {
            PlatformFamily::Catalyst => Kind::Catalyst,
            _ => Kind::Macos,
        },
        TargetType::Auto => Kind::Auto,
    }
}

impl Destination {
    /// Pure, idempotent normalization.
    ///
    /// Keeps `target_id` and `udid` equal (filling either from the other),
    /// empties both for local targets, recomputes `kind` whenever the target
    /// type is not auto, and derives the platform string when missing.
    pub fn normalized(&self) -> Destination {
        let mut d = self.clone();

        if d.target_id.is_empty() && !d.udid.is_empty() {
            d.target_id = d.udid.clone();
        }
        d.udid = d.target_id.clone();

        if d.target_type == TargetType::Local {
            d.target_id.clear();
            d.udid.clear();
            if d.platform_family == PlatformFamily::Unknown {
                d.platform_family = PlatformFamily::Macos;
            }
        }

        if d.target_type != TargetType::Auto {
            d.kind = kind_for(d.target_type, d.platform_family);
        }

        if d.platform.is_empty() && d.platform_family != PlatformFamily::Unknown {
            d.platform = platform_string(d.platform_family, d.target_type);
        }

        d
    }

    /// Whether any explicit target was requested (by id or name).
    pub fn is_explicit(&self) -> bool {
        !self.target_id.is_empty() || !self.name.is_empty()
    }
}

/// One enumerated simulator/device/local target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub id: String,
    pub name: String,
    pub platform_family: PlatformFamily,
    pub target_type: TargetType,
    pub platform: String,
    pub os_version: String,
    pub runtime_id: String,
    pub runtime_name: String,
    /// Raw device state ("Booted", "Shutdown", ...)
    pub state: String,
    pub available: bool,
}

impl Candidate {
    fn is_booted(&self) -> bool {
        self.state.eq_ignore_ascii_case("booted")
    }
}

/// The always-present host candidates.
pub fn local_candidates() -> Vec<Candidate> {
    vec![
        Candidate {
            id: String::new(),
            name: "My Mac".to_string(),
            platform_family: PlatformFamily::Macos,
            target_type: TargetType::Local,
            platform: "macOS".to_string(),
            os_version: String::new(),
            runtime_id: String::new(),
            runtime_name: String::new(),
            state: String::new(),
            available: true,
        },
        Candidate {
            id: String::new(),
            name: "My Mac (Catalyst)".to_string(),
            platform_family: PlatformFamily::Catalyst,
            target_type: TargetType::Local,
            platform: "macOS".to_string(),
            os_version: String::new(),
            runtime_id: String::new(),
            runtime_name: String::new(),
            state: String::new(),
            available: true,
        },
    ]
}

/// Destination resolution errors.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// No candidate matched the request
    #[error("no destination found matching '{requested}'")]
    NotFound { requested: String },

    /// Multiple candidates matched an explicit id/name
    #[error("destination '{requested}' is ambiguous: matches {}", matches.join(", "))]
    Ambiguous {
        requested: String,
        matches: Vec<String>,
    },
}

/// Compare dotted numeric versions ("18.2" vs "17.5").
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let a_parts: Vec<u32> = a.split('.').filter_map(|s| s.parse().ok()).collect();
    let b_parts: Vec<u32> = b.split('.').filter_map(|s| s.parse().ok()).collect();
    for i in 0..a_parts.len().max(b_parts.len()) {
        let a_val = a_parts.get(i).copied().unwrap_or(0);
        let b_val = b_parts.get(i).copied().unwrap_or(0);
        match a_val.cmp(&b_val) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn score(c: &Candidate) -> i32 {
    let mut score = match c.target_type {
        TargetType::Simulator => {
            let mut s = 100;
            if c.is_booted() {
                s += 20;
            }
            if c.available {
                s += 10;
            }
            s
        }
        TargetType::Device => 50,
        TargetType::Local => 10,
        TargetType::Auto => 0,
    };
    score -= c.platform_family.priority();
    score
}

fn local_destination(requested: &Destination) -> Destination {
    let mut d = requested.clone();
    d.target_type = TargetType::Local;
    if d.name.is_empty() {
        d.name = match d.platform_family {
            PlatformFamily::Catalyst => "My Mac (Catalyst)".to_string(),
            _ => "My Mac".to_string(),
        };
    }
    d.normalized()
}

fn apply_candidate(requested: &Destination, c: &Candidate) -> Destination {
    let mut d = requested.clone();
    d.target_id = c.id.clone();
    d.udid = c.id.clone();
    d.name = c.name.clone();
    d.platform_family = c.platform_family;
    d.target_type = c.target_type;
    d.platform = c.platform.clone();
    d.os_version = c.os_version.clone();
    d.runtime_id = c.runtime_id.clone();
    d.normalized()
}

/// Resolve a requested destination against enumerated candidates.
pub fn resolve(
    requested: &Destination,
    candidates: &[Candidate],
) -> Result<Destination, ResolveError> {
    let requested = requested.normalized();

    // Local requests never need enumeration.
    if requested.target_type == TargetType::Local {
        return Ok(local_destination(&requested));
    }

    let filtered: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.target_type == TargetType::Local || c.available)
        .filter(|c| {
            requested.platform_family == PlatformFamily::Unknown
                || c.platform_family == requested.platform_family
        })
        .filter(|c| match requested.target_type {
            TargetType::Auto => true,
            other => c.target_type == other,
        })
        .filter(|c| {
            c.target_type != TargetType::Local
                || matches!(requested.target_type, TargetType::Local | TargetType::Auto)
        })
        .collect();

    if requested.is_explicit() {
        let wanted = if requested.target_id.is_empty() {
            &requested.name
        } else {
            &requested.target_id
        };
        let mut matches: Vec<&&Candidate> = filtered
            .iter()
            .filter(|c| c.id.eq_ignore_ascii_case(wanted))
            .collect();
        if matches.is_empty() {
            matches = filtered
                .iter()
                .filter(|c| c.name.eq_ignore_ascii_case(wanted))
                .collect();
        }
        return match matches.len() {
            0 => Err(ResolveError::NotFound {
                requested: wanted.clone(),
            }),
            1 => Ok(apply_candidate(&requested, matches[0])),
            _ => Err(ResolveError::Ambiguous {
                requested: wanted.clone(),
                matches: matches
                    .iter()
                    .map(|c| {
                        if c.id.is_empty() {
                            c.name.clone()
                        } else {
                            c.id.clone()
                        }
                    })
                    .collect(),
            }),
        };
    }

    let best = filtered.iter().max_by(|a, b| {
        score(a)
            .cmp(&score(b))
            .then_with(|| compare_versions(&a.os_version, &b.os_version))
            .then_with(|| b.name.cmp(&a.name))
    });

    match best {
        Some(c) => Ok(apply_candidate(&requested, c)),
        None => {
            // Nothing left, but a Mac-family request can still run locally.
            if matches!(
                requested.platform_family,
                PlatformFamily::Macos | PlatformFamily::Catalyst
            ) {
                Ok(local_destination(&requested))
            } else {
                Err(ResolveError::NotFound {
                    requested: format!("{:?}", requested.platform_family),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sim(id: &str, name: &str, state: &str, os: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            name: name.to_string(),
            platform_family: PlatformFamily::Ios,
            target_type: TargetType::Simulator,
            platform: "iOS Simulator".to_string(),
            os_version: os.to_string(),
            runtime_id: "com.apple.CoreSimulator.SimRuntime.iOS-18-2".to_string(),
            runtime_name: "iOS 18.2".to_string(),
            state: state.to_string(),
            available: true,
        }
    }

    fn device(id: &str, name: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            name: name.to_string(),
            platform_family: PlatformFamily::Ios,
            target_type: TargetType::Device,
            platform: "iOS".to_string(),
            os_version: "18.0".to_string(),
            runtime_id: String::new(),
            runtime_name: String::new(),
            state: String::new(),
            available: true,
        }
    }

    #[test]
    fn test_parse_platform_family_table() {
        assert_eq!(parse_platform_family("iPadOS"), PlatformFamily::Ipados);
        assert_eq!(parse_platform_family("apple tv"), PlatformFamily::Tvos);
        assert_eq!(parse_platform_family("watch os"), PlatformFamily::Watchos);
        assert_eq!(parse_platform_family("maccatalyst"), PlatformFamily::Catalyst);
        assert_eq!(parse_platform_family("unknown"), PlatformFamily::Unknown);
        assert_eq!(parse_platform_family("iOS"), PlatformFamily::Ios);
        assert_eq!(parse_platform_family("visionOS"), PlatformFamily::Visionos);
        assert_eq!(parse_platform_family("macOS"), PlatformFamily::Macos);
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let destinations = vec![
            Destination {
                udid: "ABCD-1234".to_string(),
                target_type: TargetType::Simulator,
                platform_family: PlatformFamily::Ios,
                ..Default::default()
            },
            Destination {
                target_type: TargetType::Local,
                platform_family: PlatformFamily::Catalyst,
                target_id: "stale".to_string(),
                ..Default::default()
            },
            Destination::default(),
        ];
        for d in destinations {
            let once = d.normalized();
            assert_eq!(once.normalized(), once, "normalize must be idempotent");
        }
    }

    #[test]
    fn test_normalize_syncs_id_aliases() {
        let d = Destination {
            udid: "UDID-9".to_string(),
            target_type: TargetType::Device,
            platform_family: PlatformFamily::Ios,
            ..Default::default()
        }
        .normalized();
        assert_eq!(d.target_id, "UDID-9");
        assert_eq!(d.udid, "UDID-9");
    }

    #[test]
    fn test_normalize_local_clears_ids() {
        let d = Destination {
            target_type: TargetType::Local,
            target_id: "something".to_string(),
            udid: "something".to_string(),
            ..Default::default()
        }
        .normalized();
        assert!(d.target_id.is_empty());
        assert!(d.udid.is_empty());
    }

    #[test]
    fn test_kind_from_type_and_family() {
        let cases = [
            (TargetType::Simulator, PlatformFamily::Ios, Kind::Simulator),
            (TargetType::Device, PlatformFamily::Watchos, Kind::Device),
            (TargetType::Local, PlatformFamily::Macos, Kind::Macos),
            (TargetType::Local, PlatformFamily::Catalyst, Kind::Catalyst),
        ];
        for (target_type, family, kind) in cases {
            let d = Destination {
                target_type,
                platform_family: family,
                kind: Kind::Auto,
                ..Default::default()
            }
            .normalized();
            assert_eq!(d.kind, kind, "{:?}/{:?}", target_type, family);
        }
    }

    #[test]
    fn test_platform_string_derivation() {
        assert_eq!(
            platform_string(PlatformFamily::Ios, TargetType::Simulator),
            "iOS Simulator"
        );
        assert_eq!(platform_string(PlatformFamily::Ios, TargetType::Device), "iOS");
        assert_eq!(
            platform_string(PlatformFamily::Watchos, TargetType::Simulator),
            "watchOS Simulator"
        );
        assert_eq!(platform_string(PlatformFamily::Catalyst, TargetType::Local), "macOS");
    }

    #[test]
    fn test_auto_pick_prefers_booted_simulator() {
        let candidates = vec![
            sim("sim-shutdown", "iPhone 16", "Shutdown", "18.2"),
            device("dev-1", "My iPhone"),
            sim("sim-booted", "iPhone 16 Pro", "Booted", "18.2"),
        ];
        let resolved = resolve(&Destination::default(), &candidates).unwrap();
        assert_eq!(resolved.target_id, "sim-booted");
        assert_eq!(resolved.kind, Kind::Simulator);
    }

    #[test]
    fn test_auto_pick_breaks_ties_by_os_version() {
        let mut older = sim("sim-old", "iPhone 15", "Shutdown", "17.5");
        older.runtime_name = "iOS 17.5".to_string();
        let candidates = vec![older, sim("sim-new", "iPhone 16", "Shutdown", "18.2")];
        let resolved = resolve(&Destination::default(), &candidates).unwrap();
        assert_eq!(resolved.target_id, "sim-new");
    }

    #[test]
    fn test_explicit_name_exactly_one_match() {
        let candidates = vec![
            sim("sim-a", "iPhone 16", "Shutdown", "18.2"),
            sim("sim-b", "iPhone 16 Pro", "Shutdown", "18.2"),
        ];
        let requested = Destination {
            name: "iphone 16".to_string(),
            ..Default::default()
        };
        let resolved = resolve(&requested, &candidates).unwrap();
        assert_eq!(resolved.target_id, "sim-a");
    }

    #[test]
    fn test_explicit_name_ambiguous() {
        let candidates = vec![
            sim("sim-a", "iPhone 16", "Shutdown", "18.2"),
            sim("sim-b", "iPhone 16", "Shutdown", "18.2"),
        ];
        let requested = Destination {
            name: "iPhone 16".to_string(),
            ..Default::default()
        };
        match resolve(&requested, &candidates) {
            Err(ResolveError::Ambiguous { matches, .. }) => assert_eq!(matches.len(), 2),
            other => panic!("expected ambiguity, got {:?}", other),
        }
    }

    #[test]
    fn test_explicit_id_not_found() {
        let candidates = vec![sim("sim-a", "iPhone 16", "Shutdown", "18.2")];
        let requested = Destination {
            target_id: "nope".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            resolve(&requested, &candidates),
            Err(ResolveError::NotFound { .. })
        ));
    }

    #[test]
    fn test_id_match_preferred_over_name() {
        // A candidate whose *name* collides with another candidate's id.
        let mut named = sim("sim-b", "sim-a", "Booted", "18.2");
        named.name = "sim-a".to_string();
        let candidates = vec![sim("sim-a", "iPhone 16", "Shutdown", "18.2"), named];
        let requested = Destination {
            target_id: "sim-a".to_string(),
            ..Default::default()
        };
        let resolved = resolve(&requested, &candidates).unwrap();
        assert_eq!(resolved.target_id, "sim-a");
    }

    #[test]
    fn test_unavailable_candidates_filtered() {
        let mut unavailable = sim("sim-a", "iPhone 16", "Booted", "18.2");
        unavailable.available = false;
        let candidates = vec![unavailable, sim("sim-b", "iPhone 15", "Shutdown", "17.5")];
        let resolved = resolve(&Destination::default(), &candidates).unwrap();
        assert_eq!(resolved.target_id, "sim-b");
    }

    #[test]
    fn test_family_filter_applies() {
        let mut watch = sim("watch-1", "Apple Watch", "Booted", "11.0");
        watch.platform_family = PlatformFamily::Watchos;
        let candidates = vec![watch, sim("sim-a", "iPhone 16", "Shutdown", "18.2")];
        let requested = Destination {
            platform_family: PlatformFamily::Watchos,
            ..Default::default()
        };
        let resolved = resolve(&requested, &candidates).unwrap();
        assert_eq!(resolved.target_id, "watch-1");
    }

    #[test]
    fn test_macos_family_promotes_to_local_when_empty() {
        let requested = Destination {
            platform_family: PlatformFamily::Macos,
            ..Default::default()
        };
        let resolved = resolve(&requested, &[]).unwrap();
        assert_eq!(resolved.target_type, TargetType::Local);
        assert_eq!(resolved.kind, Kind::Macos);
        assert_eq!(resolved.name, "My Mac");
    }

    #[test]
    fn test_local_request_short_circuits() {
        let requested = Destination {
            target_type: TargetType::Local,
            platform_family: PlatformFamily::Catalyst,
            target_id: "junk".to_string(),
            ..Default::default()
        };
        let resolved = resolve(&requested, &[]).unwrap();
        assert_eq!(resolved.kind, Kind::Catalyst);
        assert_eq!(resolved.platform, "macOS");
        assert!(resolved.target_id.is_empty());
        assert_eq!(resolved.name, "My Mac (Catalyst)");
    }

    #[test]
    fn test_local_candidates_present() {
        let locals = local_candidates();
        assert_eq!(locals.len(), 2);
        assert_eq!(locals[0].name, "My Mac");
        assert_eq!(locals[1].platform_family, PlatformFamily::Catalyst);
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("18.2", "17.5"), Ordering::Greater);
        assert_eq!(compare_versions("18.0.1", "18.0"), Ordering::Greater);
        assert_eq!(compare_versions("18.0", "18.0"), Ordering::Equal);
    }
}
