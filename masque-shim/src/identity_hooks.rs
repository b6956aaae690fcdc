//! C-level entry points that report device identity.

use std::ffi::c_void;
use std::sync::atomic::AtomicUsize;

use libc::{c_char, c_int, size_t};
use masque::bindings::wait_original;
use masque::{Binding, BindingRegistry, IdentifierKind};
use tracing::trace;

use crate::{fill_c_field, set_errno, spoofed, spoofed_machine, write_c_string};

type GethostnameFn = unsafe extern "C" fn(*mut c_char, size_t) -> c_int;
type UnameFn = unsafe extern "C" fn(*mut libc::utsname) -> c_int;

static ORIG_GETHOSTNAME: AtomicUsize = AtomicUsize::new(0);
static ORIG_UNAME: AtomicUsize = AtomicUsize::new(0);

pub fn register(registry: &mut BindingRegistry) {
    registry
        .add(Binding::new("gethostname", gethostname as *const c_void, &ORIG_GETHOSTNAME))
        .add(Binding::new("uname", uname as *const c_void, &ORIG_UNAME));

    #[cfg(target_vendor = "apple")]
    apple::register(registry);
}

/// Intercept gethostname() - reports the spoofed device name
unsafe extern "C" fn gethostname(name: *mut c_char, len: size_t) -> c_int {
    if let Some(value) = spoofed(IdentifierKind::DeviceName) {
        trace!("gethostname -> {}", value);
        if write_c_string(&value, name, len) {
            return 0;
        }
        set_errno(libc::ENAMETOOLONG);
        return -1;
    }

    match unsafe { wait_original::<GethostnameFn>(&ORIG_GETHOSTNAME) } {
        Some(orig) => unsafe { orig(name, len) },
        None => {
            set_errno(libc::ENOSYS);
            -1
        }
    }
}

/// Intercept uname() - spoofs the node name and machine identifier
unsafe extern "C" fn uname(buf: *mut libc::utsname) -> c_int {
    let Some(orig) = (unsafe { wait_original::<UnameFn>(&ORIG_UNAME) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    let ret = unsafe { orig(buf) };
    if ret != 0 || buf.is_null() {
        return ret;
    }

    let info = unsafe { &mut *buf };
    if let Some(name) = spoofed(IdentifierKind::DeviceName) {
        fill_c_field(&mut info.nodename, &name);
    }
    if let Some(machine) = spoofed_machine() {
        fill_c_field(&mut info.machine, &machine);
    }
    ret
}

#[cfg(target_vendor = "apple")]
mod apple {
    use super::*;
    use crate::cf;
    use crate::spoofed_as;
    use masque::{DeviceModel, OsVersion, WifiInfo};

    type SysctlbynameFn =
        unsafe extern "C" fn(*const c_char, *mut c_void, *mut size_t, *mut c_void, size_t) -> c_int;

    type DyldCacheUuidFn = unsafe extern "C" fn(*mut u8) -> bool;
    type CopyAnswerFn = unsafe extern "C" fn(cf::CFStringRef) -> cf::CFTypeRef;

    static ORIG_SYSCTLBYNAME: AtomicUsize = AtomicUsize::new(0);
    static ORIG_DYLD_CACHE_UUID: AtomicUsize = AtomicUsize::new(0);
    static ORIG_MG_COPY_ANSWER: AtomicUsize = AtomicUsize::new(0);
    static ORIG_COPY_NETWORK_INFO: AtomicUsize = AtomicUsize::new(0);

    pub fn register(registry: &mut BindingRegistry) {
        registry
            .add(Binding::new(
                "sysctlbyname",
                sysctlbyname as *const c_void,
                &ORIG_SYSCTLBYNAME,
            ))
            .add(Binding::new(
                "_dyld_get_shared_cache_uuid",
                dyld_get_shared_cache_uuid as *const c_void,
                &ORIG_DYLD_CACHE_UUID,
            ))
            .add(Binding::new(
                "MGCopyAnswer",
                mg_copy_answer as *const c_void,
                &ORIG_MG_COPY_ANSWER,
            ))
            .add(Binding::new(
                "CNCopyCurrentNetworkInfo",
                copy_current_network_info as *const c_void,
                &ORIG_COPY_NETWORK_INFO,
            ));
    }

    /// Intercept _dyld_get_shared_cache_uuid()
    unsafe extern "C" fn dyld_get_shared_cache_uuid(out: *mut u8) -> bool {
        if !out.is_null() {
            let spoofed_uuid = spoofed(IdentifierKind::DyldCacheUuid)
                .and_then(|v| uuid::Uuid::parse_str(&v).ok());
            if let Some(value) = spoofed_uuid {
                unsafe { std::ptr::copy_nonoverlapping(value.as_bytes().as_ptr(), out, 16) };
                return true;
            }
        }

        match unsafe { wait_original::<DyldCacheUuidFn>(&ORIG_DYLD_CACHE_UUID) } {
            Some(orig) => unsafe { orig(out) },
            None => false,
        }
    }

    /// MobileGestalt keys answered from the profile.
    pub(super) fn gestalt_answer(key: &str) -> Option<String> {
        let part_number = || spoofed_as::<DeviceModel>(IdentifierKind::DeviceModel).map(|m| m.part_number);
        match key {
            "SerialNumber" => spoofed(IdentifierKind::SerialNumber),
            "UserAssignedDeviceName" => spoofed(IdentifierKind::DeviceName),
            "ProductType" => spoofed_machine(),
            "ProductVersion" => spoofed_as::<OsVersion>(IdentifierKind::OsVersion).map(|v| v.version_string()),
            "BuildVersion" => spoofed_as::<OsVersion>(IdentifierKind::OsVersion).map(|v| v.build),
            // `MLPF3LL/A` splits into model `MLPF3` and region `LL/A`.
            "ModelNumber" => part_number().and_then(|p| p.get(..5).map(str::to_string)),
            "RegionInfo" => part_number().and_then(|p| p.get(5..).map(str::to_string)),
            _ => None,
        }
    }

    /// Intercept MGCopyAnswer() - string answers only
    unsafe extern "C" fn mg_copy_answer(key: cf::CFStringRef) -> cf::CFTypeRef {
        let answer = cf::string_value(key).as_deref().and_then(gestalt_answer);
        if let Some(value) = answer.as_deref().and_then(cf::string_create) {
            trace!("MGCopyAnswer spoofed");
            return value;
        }

        match unsafe { wait_original::<CopyAnswerFn>(&ORIG_MG_COPY_ANSWER) } {
            Some(orig) => unsafe { orig(key) },
            None => std::ptr::null(),
        }
    }

    /// Intercept CNCopyCurrentNetworkInfo() - reports the spoofed network
    unsafe extern "C" fn copy_current_network_info(interface: cf::CFStringRef) -> cf::CFTypeRef {
        if let Some(info) = spoofed_as::<WifiInfo>(IdentifierKind::WifiInfo) {
            let null = std::ptr::null();
            let dict = cf::dictionary_create(vec![
                ("SSID", cf::string_create(&info.ssid).unwrap_or(null)),
                ("BSSID", cf::string_create(&info.bssid).unwrap_or(null)),
                ("SSIDDATA", cf::data_create(info.ssid.as_bytes()).unwrap_or(null)),
            ]);
            if let Some(dict) = dict {
                trace!("CNCopyCurrentNetworkInfo -> {}", info.ssid);
                return dict;
            }
        }

        match unsafe { wait_original::<CopyAnswerFn>(&ORIG_COPY_NETWORK_INFO) } {
            Some(orig) => unsafe { orig(interface) },
            None => std::ptr::null(),
        }
    }

    /// Spoofed sysctl reply for `name`, if it is one we answer.
    enum Reply {
        Text(String),
        Timeval(libc::timeval),
    }

    fn reply_for(name: &str) -> Option<Reply> {
        match name {
            "hw.machine" => spoofed_machine().map(Reply::Text),
            "kern.hostname" => spoofed(IdentifierKind::DeviceName).map(Reply::Text),
            "kern.bootsessionuuid" => spoofed(IdentifierKind::BootUuid).map(Reply::Text),
            "kern.osversion" => spoofed_as::<OsVersion>(IdentifierKind::OsVersion).map(|v| Reply::Text(v.build)),
            "kern.osproductversion" => {
                spoofed_as::<OsVersion>(IdentifierKind::OsVersion).map(|v| Reply::Text(v.version_string()))
            }
            "kern.boottime" => spoofed(IdentifierKind::BootTime)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|secs| {
                    Reply::Timeval(libc::timeval {
                        tv_sec: secs as libc::time_t,
                        tv_usec: 0,
                    })
                }),
            _ => None,
        }
    }

    /// Write `bytes` following sysctl's size-query protocol.
    unsafe fn write_reply(bytes: &[u8], oldp: *mut c_void, oldlenp: *mut size_t) -> c_int {
        if oldlenp.is_null() {
            set_errno(libc::EINVAL);
            return -1;
        }
        if oldp.is_null() {
            unsafe { *oldlenp = bytes.len() };
            return 0;
        }
        if unsafe { *oldlenp } < bytes.len() {
            set_errno(libc::ENOMEM);
            return -1;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), oldp.cast::<u8>(), bytes.len());
            *oldlenp = bytes.len();
        }
        0
    }

    /// Intercept sysctlbyname() - read-only queries for identity keys
    unsafe extern "C" fn sysctlbyname(
        name: *const c_char,
        oldp: *mut c_void,
        oldlenp: *mut size_t,
        newp: *mut c_void,
        newlen: size_t,
    ) -> c_int {
        if !name.is_null() && newp.is_null() {
            let key = unsafe { std::ffi::CStr::from_ptr(name) }.to_str().ok();
            if let Some(reply) = key.and_then(reply_for) {
                trace!("sysctlbyname({:?}) spoofed", key);
                return match reply {
                    Reply::Text(text) => {
                        let mut bytes = text.into_bytes();
                        bytes.push(0);
                        unsafe { write_reply(&bytes, oldp, oldlenp) }
                    }
                    Reply::Timeval(tv) => {
                        let bytes = unsafe {
                            std::slice::from_raw_parts(
                                (&tv as *const libc::timeval).cast::<u8>(),
                                std::mem::size_of::<libc::timeval>(),
                            )
                        };
                        unsafe { write_reply(bytes, oldp, oldlenp) }
                    }
                };
            }
        }

        match unsafe { wait_original::<SysctlbynameFn>(&ORIG_SYSCTLBYNAME) } {
            Some(orig) => unsafe { orig(name, oldp, oldlenp, newp, newlen) },
            None => {
                set_errno(libc::ENOSYS);
                -1
            }
        }
    }
}
