//! Spoofed device identifiers: kinds, generation, validation and storage.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IdentifierError;

mod generate;
mod store;
mod system;
mod validate;

pub use generate::{DeviceModel, Generator, OsVersion, StandardGenerator, WifiInfo};
pub use store::{IdentifierRecord, IdentifierStore, KindStatus, Resolution};
pub use system::{HostSystem, SystemValues};
pub use validate::validate;

/// Whether a kind has one value per profile or one per app per profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Global,
    App,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierKind {
    Idfa,
    Idfv,
    DeviceName,
    SerialNumber,
    OsVersion,
    WifiInfo,
    BootUuid,
    DyldCacheUuid,
    PasteboardUuid,
    KeychainUuid,
    UserDefaultsUuid,
    AppGroupUuid,
    CoreDataUuid,
    InstallUuid,
    ContainerUuid,
    Uptime,
    BootTime,
    DeviceModel,
}

impl IdentifierKind {
    pub const ALL: [IdentifierKind; 18] = [
        IdentifierKind::Idfa,
        IdentifierKind::Idfv,
        IdentifierKind::DeviceName,
        IdentifierKind::SerialNumber,
        IdentifierKind::OsVersion,
        IdentifierKind::WifiInfo,
        IdentifierKind::BootUuid,
        IdentifierKind::DyldCacheUuid,
        IdentifierKind::PasteboardUuid,
        IdentifierKind::KeychainUuid,
        IdentifierKind::UserDefaultsUuid,
        IdentifierKind::AppGroupUuid,
        IdentifierKind::CoreDataUuid,
        IdentifierKind::InstallUuid,
        IdentifierKind::ContainerUuid,
        IdentifierKind::Uptime,
        IdentifierKind::BootTime,
        IdentifierKind::DeviceModel,
    ];

    pub fn scope(self) -> Scope {
        match self {
            IdentifierKind::Idfv
            | IdentifierKind::KeychainUuid
            | IdentifierKind::UserDefaultsUuid
            | IdentifierKind::AppGroupUuid
            | IdentifierKind::CoreDataUuid
            | IdentifierKind::InstallUuid
            | IdentifierKind::ContainerUuid => Scope::App,
            _ => Scope::Global,
        }
    }

    /// True for kinds whose value is a bare UUID string.
    pub fn is_uuid(self) -> bool {
        !matches!(
            self,
            IdentifierKind::DeviceName
                | IdentifierKind::SerialNumber
                | IdentifierKind::OsVersion
                | IdentifierKind::WifiInfo
                | IdentifierKind::Uptime
                | IdentifierKind::BootTime
                | IdentifierKind::DeviceModel
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IdentifierKind::Idfa => "idfa",
            IdentifierKind::Idfv => "idfv",
            IdentifierKind::DeviceName => "device_name",
            IdentifierKind::SerialNumber => "serial_number",
            IdentifierKind::OsVersion => "os_version",
            IdentifierKind::WifiInfo => "wifi_info",
            IdentifierKind::BootUuid => "boot_uuid",
            IdentifierKind::DyldCacheUuid => "dyld_cache_uuid",
            IdentifierKind::PasteboardUuid => "pasteboard_uuid",
            IdentifierKind::KeychainUuid => "keychain_uuid",
            IdentifierKind::UserDefaultsUuid => "user_defaults_uuid",
            IdentifierKind::AppGroupUuid => "app_group_uuid",
            IdentifierKind::CoreDataUuid => "core_data_uuid",
            IdentifierKind::InstallUuid => "install_uuid",
            IdentifierKind::ContainerUuid => "container_uuid",
            IdentifierKind::Uptime => "uptime",
            IdentifierKind::BootTime => "boot_time",
            IdentifierKind::DeviceModel => "device_model",
        }
    }
}

impl fmt::Display for IdentifierKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdentifierKind {
    type Err = IdentifierError;

    /// Accepts `device_name`, `device-name`, `DeviceName`, `IDFA` and similar spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let folded: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
            .flat_map(char::to_lowercase)
            .collect();
        let folded = folded.replace("ios", "os");
        IdentifierKind::ALL
            .into_iter()
            .find(|k| k.as_str().replace('_', "") == folded)
            .ok_or_else(|| IdentifierError::UnknownKind(s.to_string()))
    }
}
