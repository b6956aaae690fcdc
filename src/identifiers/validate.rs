//! Format predicates for every identifier kind.

use chrono::Utc;
use uuid::{Uuid, Variant};

use super::IdentifierKind;
use super::generate::{
    DeviceModel, MAX_UPTIME, MIN_UPTIME, OsVersion, PART_REGIONS, SERIAL_ALPHABET, SERIAL_LEN, WifiInfo,
};

const MAX_DEVICE_NAME: usize = 64;
/// 2007-01-09, before which no iPhone booted.
const EARLIEST_BOOT: i64 = 1_168_300_800;

/// True when `value` is acceptable for `kind`. Values failing this are never served.
pub fn validate(kind: IdentifierKind, value: &str) -> bool {
    match kind {
        IdentifierKind::DeviceName => is_device_name(value),
        IdentifierKind::SerialNumber => is_serial_number(value),
        IdentifierKind::OsVersion => value.parse::<OsVersion>().is_ok_and(|v| is_os_version(&v)),
        IdentifierKind::WifiInfo => is_wifi_info(value),
        IdentifierKind::Uptime => value
            .parse::<u64>()
            .is_ok_and(|s| (MIN_UPTIME..=MAX_UPTIME).contains(&s)),
        IdentifierKind::BootTime => value
            .parse::<i64>()
            .is_ok_and(|t| (EARLIEST_BOOT..=Utc::now().timestamp()).contains(&t)),
        IdentifierKind::DeviceModel => is_device_model(value),
        _ => is_canonical_uuid(value),
    }
}

/// Uppercase, hyphenated, version 4, RFC 4122 variant.
fn is_canonical_uuid(value: &str) -> bool {
    if value.len() != 36 || value.chars().any(|c| c.is_ascii_lowercase()) {
        return false;
    }
    let hyphens_ok = value
        .char_indices()
        .all(|(i, c)| matches!(i, 8 | 13 | 18 | 23) == (c == '-'));
    if !hyphens_ok {
        return false;
    }
    Uuid::parse_str(value)
        .is_ok_and(|u| u.get_version_num() == 4 && u.get_variant() == Variant::RFC4122)
}

fn is_device_name(value: &str) -> bool {
    !value.is_empty()
        && value.chars().count() <= MAX_DEVICE_NAME
        && !value.chars().any(char::is_control)
        && value.trim() == value
        && (value == "iPhone" || is_owned_name(value))
}

/// `{owner}'s iPhone`, optionally followed by a marketing name.
fn is_owned_name(value: &str) -> bool {
    value
        .split_once("'s iPhone")
        .is_some_and(|(owner, tail)| !owner.is_empty() && (tail.is_empty() || tail.starts_with(' ')))
}

fn is_serial_number(value: &str) -> bool {
    value.len() == SERIAL_LEN && value.bytes().all(|b| SERIAL_ALPHABET.contains(&b))
}

/// Build numbers track the major version: iOS 15 builds start with `19`.
pub(crate) fn is_os_version(v: &OsVersion) -> bool {
    if !(15..=17).contains(&v.major) || v.minor > 9 || v.patch > 9 {
        return false;
    }
    let build = v.build.as_bytes();
    if build.len() < 4 || !v.build.starts_with(&(v.major + 4).to_string()) {
        return false;
    }
    if !build[2].is_ascii_uppercase() {
        return false;
    }
    let rest = &v.build[3..];
    let digits = rest.trim_end_matches(|c: char| c.is_ascii_lowercase());
    let suffix_len = rest.len() - digits.len();
    (1..=4).contains(&digits.len())
        && digits.chars().all(|c| c.is_ascii_digit())
        && suffix_len <= 1
}

fn is_wifi_info(value: &str) -> bool {
    let Ok(WifiInfo { ssid, bssid }) = value.parse::<WifiInfo>() else {
        return false;
    };
    if ssid.is_empty() || ssid.len() > 32 || ssid.chars().any(char::is_control) {
        return false;
    }
    let octets: Vec<&str> = bssid.split(':').collect();
    if octets.len() != 6
        || !octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)))
    {
        return false;
    }
    // Access points use unicast addresses.
    u8::from_str_radix(octets[0], 16).is_ok_and(|b| b & 0x01 == 0)
}

fn is_device_model(value: &str) -> bool {
    value
        .parse::<DeviceModel>()
        .is_ok_and(|m| is_machine(&m.machine) && is_part_number(&m.part_number))
}

fn is_machine(value: &str) -> bool {
    let Some(rest) = value.strip_prefix("iPhone") else {
        return false;
    };
    let Some((major, minor)) = rest.split_once(',') else {
        return false;
    };
    let numeric = |s: &str| (1..=2).contains(&s.len()) && s.chars().all(|c| c.is_ascii_digit());
    numeric(major) && numeric(minor)
}

/// Retail part numbers look like `MLPF3LL/A`.
fn is_part_number(value: &str) -> bool {
    let Some(body) = value.strip_suffix("/A") else {
        return false;
    };
    let b = body.as_bytes();
    b.len() >= 6
        && matches!(b[0], b'M' | b'N' | b'F' | b'P')
        && b[1..4].iter().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        && b[4].is_ascii_digit()
        && body.get(5..).is_some_and(|region| PART_REGIONS.contains(&region))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifiers::{Generator, StandardGenerator};

    #[test]
    fn every_generated_value_validates() {
        for _ in 0..200 {
            for kind in IdentifierKind::ALL {
                let value = StandardGenerator.generate(kind);
                assert!(validate(kind, &value), "{kind} generated '{value}'");
            }
        }
    }

    #[test]
    fn uuid_shape_is_strict() {
        let kind = IdentifierKind::Idfa;
        assert!(validate(kind, "AAAAAAAA-BBBB-4CCC-8DDD-EEEEEEEEEEEE"));
        // wrong version nibble
        assert!(!validate(kind, "AAAAAAAA-BBBB-1CCC-8DDD-EEEEEEEEEEEE"));
        // wrong variant nibble
        assert!(!validate(kind, "AAAAAAAA-BBBB-4CCC-CDDD-EEEEEEEEEEEE"));
        // lowercase
        assert!(!validate(kind, "aaaaaaaa-bbbb-4ccc-8ddd-eeeeeeeeeeee"));
        // unhyphenated
        assert!(!validate(kind, "AAAAAAAABBBB4CCC8DDDEEEEEEEEEEEE"));
        assert!(!validate(kind, ""));
    }

    #[test]
    fn os_version_build_must_match_major() {
        assert!(validate(IdentifierKind::OsVersion, "15.4.1 (19E258)"));
        assert!(validate(IdentifierKind::OsVersion, "16.0 (20A362)"));
        assert!(validate(IdentifierKind::OsVersion, "16.0 (20A362a)"));
        assert!(!validate(IdentifierKind::OsVersion, "16.0 (19A362)"));
        assert!(!validate(IdentifierKind::OsVersion, "14.8 (18H17)"));
        assert!(!validate(IdentifierKind::OsVersion, "16.0 (20a362)"));
        assert!(!validate(IdentifierKind::OsVersion, "16.0"));
    }

    #[test]
    fn other_formats() {
        assert!(validate(IdentifierKind::SerialNumber, "C39XK2ABHG7F"));
        assert!(!validate(IdentifierKind::SerialNumber, "C39XK2ABHG7O"));
        assert!(!validate(IdentifierKind::SerialNumber, "C39XK2"));

        assert!(validate(IdentifierKind::DeviceName, "Riley's iPhone"));
        assert!(validate(IdentifierKind::DeviceName, "iPhone"));
        assert!(validate(IdentifierKind::DeviceName, "Riley M. Cox's iPhone 13 Pro"));
        assert!(!validate(IdentifierKind::DeviceName, "Riley's iPhoneX"));
        assert!(!validate(IdentifierKind::DeviceName, "'s iPhone"));
        assert!(!validate(IdentifierKind::DeviceName, "Riley's\niPhone"));
        assert!(!validate(IdentifierKind::DeviceName, ""));

        assert!(validate(IdentifierKind::WifiInfo, "NETGEAR1A2B (a4:2b:8c:01:02:03)"));
        assert!(!validate(IdentifierKind::WifiInfo, "NETGEAR1A2B (a5:2b:8c:01:02:03)"));
        assert!(!validate(IdentifierKind::WifiInfo, "NETGEAR1A2B"));

        assert!(validate(IdentifierKind::DeviceModel, "iPhone14,2 (MLPF3LL/A)"));
        assert!(!validate(IdentifierKind::DeviceModel, "iPhone14,2"));
        assert!(!validate(IdentifierKind::DeviceModel, "iPad13,1 (MLPF3LL/A)"));
        assert!(!validate(IdentifierKind::DeviceModel, "iPhone14,2 (MLPF3QQ/A)"));

        assert!(validate(IdentifierKind::Uptime, "86400"));
        assert!(!validate(IdentifierKind::Uptime, "12"));
        let future = (Utc::now().timestamp() + 3600).to_string();
        assert!(!validate(IdentifierKind::BootTime, &future));
        assert!(!validate(IdentifierKind::BootTime, "1000000000"));
    }

    #[test]
    fn stored_boot_time_does_not_expire() {
        let long_ago = (Utc::now().timestamp() - 400 * 86_400).to_string();
        assert!(validate(IdentifierKind::BootTime, &long_ago));
    }
}
