//! Destination normalization invariants exercised through the public API.

use xcbolt::destination::{
    parse_platform_family, Destination, Kind, PlatformFamily, TargetType,
};

fn dest(family: PlatformFamily, target_type: TargetType) -> Destination {
    Destination {
        platform_family: family,
        target_type,
        ..Destination::default()
    }
}

#[test]
fn normalization_is_idempotent() {
    let cases = [
        dest(PlatformFamily::Ios, TargetType::Simulator),
        dest(PlatformFamily::Watchos, TargetType::Device),
        dest(PlatformFamily::Macos, TargetType::Local),
        dest(PlatformFamily::Unknown, TargetType::Auto),
        {
            let mut d = dest(PlatformFamily::Ios, TargetType::Simulator);
            d.udid = "UDID-1".to_string();
            d
        },
    ];
    for case in cases {
        let once = case.normalized();
        assert_eq!(once.normalized(), once, "normalize(normalize(d)) == normalize(d)");
    }
}

#[test]
fn kind_is_derived_from_type_and_family() {
    let table = [
        (TargetType::Simulator, PlatformFamily::Ios, Kind::Simulator),
        (TargetType::Device, PlatformFamily::Watchos, Kind::Device),
        (TargetType::Local, PlatformFamily::Macos, Kind::Macos),
        (TargetType::Local, PlatformFamily::Catalyst, Kind::Catalyst),
    ];
    for (target_type, family, kind) in table {
        let normalized = dest(family, target_type).normalized();
        assert_eq!(normalized.kind, kind, "({target_type:?}, {family:?})");
    }
}

#[test]
fn local_targets_carry_no_identifiers() {
    let mut d = dest(PlatformFamily::Macos, TargetType::Local);
    d.target_id = "stale-udid".to_string();
    d.udid = "stale-udid".to_string();
    let normalized = d.normalized();
    assert!(normalized.target_id.is_empty());
    assert!(normalized.udid.is_empty());
}

#[test]
fn legacy_id_alias_stays_equal_to_target_id() {
    let mut d = dest(PlatformFamily::Ios, TargetType::Simulator);
    d.udid = "ABCD-1234".to_string();
    let normalized = d.normalized();
    assert_eq!(normalized.target_id, "ABCD-1234");
    assert_eq!(normalized.udid, normalized.target_id);
}

#[test]
fn platform_family_parsing_folds_spacing_and_case() {
    assert_eq!(parse_platform_family("iPadOS"), PlatformFamily::Ipados);
    assert_eq!(parse_platform_family("apple tv"), PlatformFamily::Tvos);
    assert_eq!(parse_platform_family("watch os"), PlatformFamily::Watchos);
    assert_eq!(parse_platform_family("maccatalyst"), PlatformFamily::Catalyst);
    assert_eq!(parse_platform_family("unknown"), PlatformFamily::Unknown);
    assert_eq!(parse_platform_family("something else"), PlatformFamily::Unknown);
}
