use std::ffi::CStr;

use chrono::Utc;

use super::IdentifierKind;

/// Source of the real, unspoofed value for a kind.
pub trait SystemValues: Send + Sync {
    fn system_value(&self, kind: IdentifierKind, bundle_id: &str) -> Option<String>;
}

/// Reads what the host actually reports. Kinds with no host equivalent
/// yield `None`.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostSystem;

impl HostSystem {
    fn uname() -> Option<libc::utsname> {
        let mut buf: libc::utsname = unsafe { std::mem::zeroed() };
        if unsafe { libc::uname(&mut buf) } != 0 {
            return None;
        }
        Some(buf)
    }

    fn field(raw: &[libc::c_char]) -> String {
        unsafe { CStr::from_ptr(raw.as_ptr()) }
            .to_string_lossy()
            .into_owned()
    }

    fn uptime_seconds() -> Option<u64> {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        #[cfg(target_vendor = "apple")]
        let clock = libc::CLOCK_MONOTONIC_RAW;
        #[cfg(not(target_vendor = "apple"))]
        let clock = libc::CLOCK_BOOTTIME;
        if unsafe { libc::clock_gettime(clock, &mut ts) } != 0 {
            return None;
        }
        Some(ts.tv_sec as u64)
    }
}

impl SystemValues for HostSystem {
    fn system_value(&self, kind: IdentifierKind, _bundle_id: &str) -> Option<String> {
        match kind {
            IdentifierKind::DeviceName => {
                let mut buf = [0 as libc::c_char; 256];
                if unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len()) } != 0 {
                    return None;
                }
                Some(Self::field(&buf))
            }
            IdentifierKind::OsVersion => Self::uname().map(|u| Self::field(&u.release)),
            IdentifierKind::DeviceModel => Self::uname().map(|u| Self::field(&u.machine)),
            IdentifierKind::Uptime => Self::uptime_seconds().map(|s| s.to_string()),
            IdentifierKind::BootTime => Self::uptime_seconds()
                .map(|s| (Utc::now().timestamp() - s as i64).to_string()),
            IdentifierKind::BootUuid => std::fs::read_to_string("/proc/sys/kernel/random/boot_id")
                .ok()
                .map(|s| s.trim().to_uppercase()),
            _ => None,
        }
    }
}
