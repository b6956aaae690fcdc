use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::IdentifierKind;
use crate::error::IdentifierError;

/// Produces fresh values for identifier kinds.
pub trait Generator: Send + Sync {
    fn generate(&self, kind: IdentifierKind) -> String;
}

/// Structured OS version, e.g. `15.4.1 (19E258)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
    pub build: String,
}

impl OsVersion {
    /// `major.minor[.patch]` without the build.
    pub fn version_string(&self) -> String {
        if self.patch == 0 {
            format!("{}.{}", self.major, self.minor)
        } else {
            format!("{}.{}.{}", self.major, self.minor, self.patch)
        }
    }
}

impl fmt::Display for OsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.version_string(), self.build)
    }
}

impl FromStr for OsVersion {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentifierError::InvalidGeneratedValue {
            kind: IdentifierKind::OsVersion,
            value: s.to_string(),
        };

        let (version, build) = s.split_once(" (").ok_or_else(invalid)?;
        let build = build.strip_suffix(')').ok_or_else(invalid)?;
        let mut parts = version.split('.');
        let mut next = |required: bool| -> Result<u32, IdentifierError> {
            match parts.next() {
                Some(p) if !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()) => {
                    p.parse().map_err(|_| invalid())
                }
                None if !required => Ok(0),
                _ => Err(invalid()),
            }
        };
        let major = next(true)?;
        let minor = next(true)?;
        let patch = next(false)?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(OsVersion {
            major,
            minor,
            patch,
            build: build.to_string(),
        })
    }
}

/// Machine identifier plus the retail part number, e.g. `iPhone14,2 (MLPF3LL/A)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceModel {
    /// What `uname` and `hw.machine` report.
    pub machine: String,
    pub part_number: String,
}

impl fmt::Display for DeviceModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.machine, self.part_number)
    }
}

impl FromStr for DeviceModel {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentifierError::InvalidGeneratedValue {
            kind: IdentifierKind::DeviceModel,
            value: s.to_string(),
        };

        let (machine, part_number) = s.split_once(" (").ok_or_else(invalid)?;
        let part_number = part_number.strip_suffix(')').ok_or_else(invalid)?;
        Ok(DeviceModel {
            machine: machine.to_string(),
            part_number: part_number.to_string(),
        })
    }
}

/// Network the device reports being joined to, e.g. `NETGEAR1A2B (a4:2b:8c:01:02:03)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WifiInfo {
    pub ssid: String,
    /// Lowercase colon-separated MAC of the access point.
    pub bssid: String,
}

impl fmt::Display for WifiInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.ssid, self.bssid)
    }
}

impl FromStr for WifiInfo {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdentifierError::InvalidGeneratedValue {
            kind: IdentifierKind::WifiInfo,
            value: s.to_string(),
        };

        // SSIDs may contain " (" themselves; the BSSID is always last.
        let (ssid, bssid) = s.rsplit_once(" (").ok_or_else(invalid)?;
        let bssid = bssid.strip_suffix(')').ok_or_else(invalid)?;
        Ok(WifiInfo {
            ssid: ssid.to_string(),
            bssid: bssid.to_string(),
        })
    }
}

/// Shipped releases and the build train each belongs to. Build numbers
/// within a train are drawn at random.
const RELEASES: &[(u32, u32, u32, &str)] = &[
    (15, 0, 2, "19A"),
    (15, 1, 0, "19B"),
    (15, 2, 0, "19C"),
    (15, 3, 1, "19D"),
    (15, 4, 1, "19E"),
    (15, 5, 0, "19F"),
    (15, 6, 1, "19G"),
    (15, 7, 0, "19H"),
    (16, 0, 0, "20A"),
    (16, 1, 1, "20B"),
    (16, 2, 0, "20C"),
    (16, 3, 1, "20D"),
    (16, 4, 1, "20E"),
    (16, 5, 0, "20F"),
    (16, 6, 0, "20G"),
    (16, 7, 2, "20H"),
    (17, 0, 3, "21A"),
    (17, 1, 1, "21B"),
    (17, 2, 1, "21C"),
    (17, 3, 1, "21D"),
    (17, 4, 1, "21E"),
    (17, 5, 1, "21F"),
    (17, 6, 1, "21G"),
];

const DEVICE_MODELS: &[&str] = &[
    "iPhone13,1", "iPhone13,2", "iPhone13,3", "iPhone13,4", "iPhone14,2", "iPhone14,3",
    "iPhone14,4", "iPhone14,5", "iPhone14,6", "iPhone14,7", "iPhone14,8", "iPhone15,2",
    "iPhone15,3", "iPhone15,4", "iPhone15,5", "iPhone16,1", "iPhone16,2",
];

/// Regional suffixes of retail part numbers.
pub(crate) const PART_REGIONS: &[&str] = &["LL", "ZP", "CH", "J", "B", "ZD", "X", "C", "KH", "ZA"];

const FIRST_NAMES: &[&str] = &[
    "Alex", "Jordan", "Taylor", "Sam", "Chris", "Morgan", "Jamie", "Casey", "Riley", "Avery",
    "Emma", "Liam", "Olivia", "Noah", "Sophia", "Mason", "Mia", "Lucas", "Ava", "Ethan",
    "Harper", "Logan", "Ella", "James", "Grace", "Daniel", "Chloe", "Henry", "Zoe", "Owen",
    "Nora", "Leo", "Ruby", "Jack", "Isla", "Max", "Lily", "Ben", "Maya", "Eli",
    "Hannah", "Adam", "Sara", "Luke", "Anna", "Ryan", "Julia", "Nathan",
];

const LAST_NAMES: &[&str] = &[
    "Smith", "Johnson", "Brown", "Garcia", "Miller", "Davis", "Wilson", "Moore", "Clark", "Lewis",
    "Walker", "Hall", "Allen", "Young", "King", "Wright", "Scott", "Green", "Baker", "Adams",
    "Nelson", "Hill", "Campbell", "Mitchell", "Roberts", "Carter", "Phillips", "Evans", "Turner", "Torres",
    "Parker", "Collins", "Edwards", "Stewart", "Morris", "Murphy", "Cook", "Rogers", "Reed", "Bailey",
    "Bell", "Cooper", "Howard", "Ward", "Cox", "Kelly", "Price", "Ross",
];

/// Marketing names some owners append to their device name.
const NAME_SUFFIXES: &[&str] = &[
    "", " 12", " 12 Pro", " 13", " 13 mini", " 13 Pro", " 13 Pro Max", " 14", " 14 Plus", " 14 Pro",
    " 15", " 15 Pro",
];

const SSID_PREFIXES: &[&str] = &[
    "NETGEAR", "Linksys", "TP-Link_", "ASUS_", "ATT", "Spectrum", "HOME-", "Xfinity-", "MySpectrumWiFi",
];

/// Vendor OUIs used for access point BSSIDs.
const AP_OUIS: &[[u8; 3]] = &[
    [0xA4, 0x2B, 0x8C],
    [0x50, 0xC7, 0xBF],
    [0x04, 0xD9, 0xF5],
    [0x3C, 0x37, 0x86],
    [0xE8, 0x65, 0xD4],
    [0x10, 0x0C, 0x6B],
];

/// Serial number alphabet; Apple never uses `I` or `O`.
pub(crate) const SERIAL_ALPHABET: &[u8] = b"0123456789ABCDEFGHJKLMNPQRSTUVWXYZ";
pub(crate) const SERIAL_LEN: usize = 12;

pub(crate) const MIN_UPTIME: u64 = 3_600;
pub(crate) const MAX_UPTIME: u64 = 2_592_000;

/// Random generator following each kind's real-world format.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardGenerator;

impl StandardGenerator {
    fn uuid() -> String {
        Uuid::new_v4().to_string().to_uppercase()
    }

    fn device_name(rng: &mut impl Rng) -> String {
        let first = FIRST_NAMES.choose(rng).copied().unwrap_or("Alex");
        let last = LAST_NAMES.choose(rng).copied().unwrap_or("Smith");
        let suffix = NAME_SUFFIXES.choose(rng).copied().unwrap_or("");
        // Middle initial, or none.
        let initial = rng.gen_range(0..=26u8);
        if initial == 26 {
            format!("{} {}'s iPhone{}", first, last, suffix)
        } else {
            format!("{} {}. {}'s iPhone{}", first, (b'A' + initial) as char, last, suffix)
        }
    }

    fn device_model(rng: &mut impl Rng) -> String {
        let machine = DEVICE_MODELS.choose(rng).copied().unwrap_or("iPhone14,2");
        let stem: String = (0..3)
            .map(|_| SERIAL_ALPHABET[rng.gen_range(10..SERIAL_ALPHABET.len())] as char)
            .collect();
        let region = PART_REGIONS.choose(rng).copied().unwrap_or("LL");
        DeviceModel {
            machine: machine.to_string(),
            part_number: format!(
                "{}{}{}{}/A",
                if rng.gen_ratio(1, 4) { 'N' } else { 'M' },
                stem,
                rng.gen_range(1..=9u8),
                region
            ),
        }
        .to_string()
    }

    fn serial_number(rng: &mut impl Rng) -> String {
        (0..SERIAL_LEN)
            .map(|_| SERIAL_ALPHABET[rng.gen_range(0..SERIAL_ALPHABET.len())] as char)
            .collect()
    }

    fn os_version(rng: &mut impl Rng) -> String {
        let (major, minor, patch, train) = RELEASES.choose(rng).copied().unwrap_or(RELEASES[0]);
        let mut build = format!("{}{}", train, rng.gen_range(10..=999u32));
        // Carrier and hotfix builds carry a lowercase suffix.
        if rng.gen_ratio(1, 2) {
            build.push((b'a' + rng.gen_range(0..26u8)) as char);
        }
        OsVersion {
            major,
            minor,
            patch,
            build,
        }
        .to_string()
    }

    fn wifi_info(rng: &mut impl Rng) -> String {
        let prefix = SSID_PREFIXES.choose(rng).copied().unwrap_or("NETGEAR");
        let ssid = format!("{}{:04X}", prefix, rng.gen_range(0..0x1_0000u32));
        let oui = AP_OUIS.choose(rng).copied().unwrap_or(AP_OUIS[0]);
        let bssid = [oui[0], oui[1], oui[2], rng.r#gen(), rng.r#gen(), rng.r#gen()]
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(":");
        WifiInfo { ssid, bssid }.to_string()
    }
}

impl Generator for StandardGenerator {
    fn generate(&self, kind: IdentifierKind) -> String {
        let mut rng = rand::thread_rng();
        match kind {
            IdentifierKind::DeviceName => Self::device_name(&mut rng),
            IdentifierKind::SerialNumber => Self::serial_number(&mut rng),
            IdentifierKind::OsVersion => Self::os_version(&mut rng),
            IdentifierKind::WifiInfo => Self::wifi_info(&mut rng),
            IdentifierKind::Uptime => rng.gen_range(MIN_UPTIME..=MAX_UPTIME / 2).to_string(),
            IdentifierKind::BootTime => {
                let ago = rng.gen_range(MIN_UPTIME as i64..=30 * 86_400);
                (Utc::now().timestamp() - ago).to_string()
            }
            IdentifierKind::DeviceModel => Self::device_model(&mut rng),
            _ => Self::uuid(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn os_version_parses_with_and_without_patch() {
        let v: OsVersion = "15.4.1 (19E258)".parse().unwrap();
        assert_eq!((v.major, v.minor, v.patch), (15, 4, 1));
        assert_eq!(v.build, "19E258");

        let v: OsVersion = "16.0 (20A362)".parse().unwrap();
        assert_eq!(v.patch, 0);
        assert_eq!(v.to_string(), "16.0 (20A362)");

        assert!("16 (20A362)".parse::<OsVersion>().is_err());
        assert!("16.1.2.3 (20A362)".parse::<OsVersion>().is_err());
        assert!("16.1".parse::<OsVersion>().is_err());
    }

    #[test]
    fn device_model_splits_machine_and_part_number() {
        let model: DeviceModel = "iPhone14,2 (MLPF3LL/A)".parse().unwrap();
        assert_eq!(model.machine, "iPhone14,2");
        assert_eq!(model.part_number, "MLPF3LL/A");
        assert_eq!(model.to_string(), "iPhone14,2 (MLPF3LL/A)");
        assert!("iPhone14,2".parse::<DeviceModel>().is_err());
    }

    #[test]
    fn wifi_info_takes_the_last_parenthesis() {
        let info: WifiInfo = "Cafe (Guest) (a4:2b:8c:01:02:03)".parse().unwrap();
        assert_eq!(info.ssid, "Cafe (Guest)");
        assert_eq!(info.bssid, "a4:2b:8c:01:02:03");
        assert!("Cafe".parse::<WifiInfo>().is_err());
    }

    #[test]
    fn generated_values_rarely_repeat() {
        for kind in IdentifierKind::ALL {
            let values: std::collections::HashSet<String> =
                (0..100).map(|_| StandardGenerator.generate(kind)).collect();
            assert!(values.len() >= 98, "{kind} produced only {} distinct values", values.len());
        }
    }

    #[test]
    fn uuid_kinds_are_uppercase_v4() {
        let value = StandardGenerator.generate(IdentifierKind::Idfa);
        assert_eq!(value.len(), 36);
        assert_eq!(value, value.to_uppercase());
        assert_eq!(&value[14..15], "4");
    }
}
