//! Objective-C identity accessors, replaced by swapping method IMPs.
//!
//! These are methods rather than exported symbols, so they bypass the
//! inline hook engine and go through the runtime's own
//! `method_setImplementation`.

use std::ffi::{CStr, CString, c_void};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use libc::c_char;
use masque::{IdentifierKind, OsVersion};
use tracing::{debug, info, warn};

use crate::{spoofed, spoofed_as};

type Id = *mut c_void;
type Sel = *mut c_void;
type Imp = unsafe extern "C" fn(Id, Sel) -> Id;
type IntervalImp = unsafe extern "C" fn(Id, Sel) -> f64;

#[link(name = "objc")]
unsafe extern "C" {
    fn objc_getClass(name: *const c_char) -> Id;
    fn sel_registerName(name: *const c_char) -> Sel;
    fn class_getInstanceMethod(cls: Id, sel: Sel) -> *mut c_void;
    fn method_getImplementation(method: *mut c_void) -> *const c_void;
    fn method_setImplementation(method: *mut c_void, imp: *const c_void) -> *const c_void;
    fn objc_msgSend();
}

fn sel(name: &str) -> Option<Sel> {
    let name = CString::new(name).ok()?;
    let sel = unsafe { sel_registerName(name.as_ptr()) };
    (!sel.is_null()).then_some(sel)
}

fn class(name: &str) -> Option<Id> {
    let name = CString::new(name).ok()?;
    let cls = unsafe { objc_getClass(name.as_ptr()) };
    (!cls.is_null()).then_some(cls)
}

/// `[receiver selector]` returning an object.
unsafe fn send(receiver: Id, selector: &str) -> Option<Id> {
    if receiver.is_null() {
        return None;
    }
    let send: unsafe extern "C" fn(Id, Sel) -> Id = unsafe { std::mem::transmute(objc_msgSend as *const c_void) };
    let result = unsafe { send(receiver, sel(selector)?) };
    (!result.is_null()).then_some(result)
}

/// `[receiver selector:arg]` with a C string or object argument.
unsafe fn send_with(receiver: Id, selector: &str, arg: *const c_void) -> Option<Id> {
    if receiver.is_null() {
        return None;
    }
    let send: unsafe extern "C" fn(Id, Sel, *const c_void) -> Id =
        unsafe { std::mem::transmute(objc_msgSend as *const c_void) };
    let result = unsafe { send(receiver, sel(selector)?, arg) };
    (!result.is_null()).then_some(result)
}

/// Autoreleased `NSString` holding `value`.
fn ns_string(value: &str) -> Option<Id> {
    let value = CString::new(value).ok()?;
    unsafe { send_with(class("NSString")?, "stringWithUTF8String:", value.as_ptr().cast()) }
}

/// Autoreleased `NSUUID` parsed from `value`.
fn ns_uuid(value: &str) -> Option<Id> {
    let string = ns_string(value)?;
    unsafe {
        let uuid = send(class("NSUUID")?, "alloc")?;
        let uuid = send_with(uuid, "initWithUUIDString:", string)?;
        send(uuid, "autorelease")
    }
}

/// `[[NSBundle mainBundle] bundleIdentifier]`
pub fn main_bundle_identifier() -> Option<String> {
    unsafe {
        let bundle = send(class("NSBundle")?, "mainBundle")?;
        let identifier = send(bundle, "bundleIdentifier")?;
        let utf8 = send(identifier, "UTF8String")? as *const c_char;
        Some(CStr::from_ptr(utf8).to_string_lossy().into_owned())
    }
}

static ORIG_ADVERTISING_IDENTIFIER: AtomicUsize = AtomicUsize::new(0);
static ORIG_IDENTIFIER_FOR_VENDOR: AtomicUsize = AtomicUsize::new(0);
static ORIG_DEVICE_NAME: AtomicUsize = AtomicUsize::new(0);
static ORIG_SYSTEM_VERSION: AtomicUsize = AtomicUsize::new(0);
static ORIG_SYSTEM_UPTIME: AtomicUsize = AtomicUsize::new(0);

/// Real uptime when the spoofed one was first served, as `f64` bits.
static UPTIME_BASELINE: AtomicU64 = AtomicU64::new(0);

fn call_original(slot: &AtomicUsize, this: Id, cmd: Sel) -> Id {
    match slot.load(Ordering::Acquire) {
        0 => std::ptr::null_mut(),
        addr => {
            let imp: Imp = unsafe { std::mem::transmute(addr) };
            unsafe { imp(this, cmd) }
        }
    }
}

/// -[ASIdentifierManager advertisingIdentifier]
unsafe extern "C" fn advertising_identifier(this: Id, cmd: Sel) -> Id {
    spoofed(IdentifierKind::Idfa)
        .and_then(|v| ns_uuid(&v))
        .unwrap_or_else(|| call_original(&ORIG_ADVERTISING_IDENTIFIER, this, cmd))
}

/// -[UIDevice identifierForVendor]
unsafe extern "C" fn identifier_for_vendor(this: Id, cmd: Sel) -> Id {
    spoofed(IdentifierKind::Idfv)
        .and_then(|v| ns_uuid(&v))
        .unwrap_or_else(|| call_original(&ORIG_IDENTIFIER_FOR_VENDOR, this, cmd))
}

/// -[UIDevice name]
unsafe extern "C" fn device_name(this: Id, cmd: Sel) -> Id {
    spoofed(IdentifierKind::DeviceName)
        .and_then(|v| ns_string(&v))
        .unwrap_or_else(|| call_original(&ORIG_DEVICE_NAME, this, cmd))
}

/// -[UIDevice systemVersion]
unsafe extern "C" fn system_version(this: Id, cmd: Sel) -> Id {
    spoofed_as::<OsVersion>(IdentifierKind::OsVersion)
        .and_then(|v| ns_string(&v.version_string()))
        .unwrap_or_else(|| call_original(&ORIG_SYSTEM_VERSION, this, cmd))
}

/// -[NSProcessInfo systemUptime]
///
/// Starts from the profile's uptime and advances with the real clock.
unsafe extern "C" fn system_uptime(this: Id, cmd: Sel) -> f64 {
    let real = match ORIG_SYSTEM_UPTIME.load(Ordering::Acquire) {
        0 => 0.0,
        addr => {
            let imp: IntervalImp = unsafe { std::mem::transmute(addr) };
            unsafe { imp(this, cmd) }
        }
    };
    let Some(spoofed_uptime) = spoofed(IdentifierKind::Uptime).and_then(|v| v.parse::<f64>().ok()) else {
        return real;
    };

    let baseline = match UPTIME_BASELINE.compare_exchange(0, real.to_bits(), Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => real,
        Err(bits) => f64::from_bits(bits),
    };
    spoofed_uptime + (real - baseline).max(0.0)
}

#[derive(Clone, Copy)]
enum Replacement {
    Object(Imp),
    Interval(IntervalImp),
}

impl Replacement {
    fn as_ptr(self) -> *const c_void {
        match self {
            Replacement::Object(imp) => imp as *const c_void,
            Replacement::Interval(imp) => imp as *const c_void,
        }
    }
}

struct MethodSwap {
    class: &'static str,
    selector: &'static str,
    replacement: Replacement,
    original: &'static AtomicUsize,
}

static SWAPS: &[MethodSwap] = &[
    MethodSwap {
        class: "ASIdentifierManager",
        selector: "advertisingIdentifier",
        replacement: Replacement::Object(advertising_identifier),
        original: &ORIG_ADVERTISING_IDENTIFIER,
    },
    MethodSwap {
        class: "UIDevice",
        selector: "identifierForVendor",
        replacement: Replacement::Object(identifier_for_vendor),
        original: &ORIG_IDENTIFIER_FOR_VENDOR,
    },
    MethodSwap {
        class: "UIDevice",
        selector: "name",
        replacement: Replacement::Object(device_name),
        original: &ORIG_DEVICE_NAME,
    },
    MethodSwap {
        class: "UIDevice",
        selector: "systemVersion",
        replacement: Replacement::Object(system_version),
        original: &ORIG_SYSTEM_VERSION,
    },
    MethodSwap {
        class: "NSProcessInfo",
        selector: "systemUptime",
        replacement: Replacement::Interval(system_uptime),
        original: &ORIG_SYSTEM_UPTIME,
    },
];

/// Swap in every replacement whose class is loaded. Classes from frameworks
/// the app does not link are skipped.
pub fn install() {
    let mut installed = 0;
    for swap in SWAPS {
        let Some(cls) = class(swap.class) else {
            debug!("{} not loaded, skipping -{}", swap.class, swap.selector);
            continue;
        };
        let Some(selector) = sel(swap.selector) else {
            continue;
        };
        let method = unsafe { class_getInstanceMethod(cls, selector) };
        if method.is_null() {
            warn!("-[{} {}] not found", swap.class, swap.selector);
            continue;
        }

        unsafe { swap_method(method, swap.replacement.as_ptr(), swap.original) };
        installed += 1;
    }
    info!("Replaced {} of {} Objective-C accessors", installed, SWAPS.len());
}

/// Point `method` at `replacement`, leaving its old IMP in `original`.
unsafe fn swap_method(method: *mut c_void, replacement: *const c_void, original: &AtomicUsize) {
    // Callers that land on the replacement mid-swap must find the original.
    let current = unsafe { method_getImplementation(method) };
    original.store(current as usize, Ordering::Release);
    let previous = unsafe { method_setImplementation(method, replacement) };
    if !previous.is_null() {
        original.store(previous as usize, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[link(name = "objc")]
    unsafe extern "C" {
        fn objc_allocateClassPair(superclass: Id, name: *const c_char, extra: usize) -> Id;
        fn objc_registerClassPair(cls: Id);
        fn class_addMethod(cls: Id, name: Sel, imp: *const c_void, types: *const c_char) -> bool;
    }

    unsafe extern "C" fn fixture_original(_: Id, _: Sel) -> Id {
        1usize as Id
    }

    unsafe extern "C" fn fixture_replacement(_: Id, _: Sel) -> Id {
        2usize as Id
    }

    #[test]
    fn swap_keeps_the_original_reachable() {
        static SLOT: AtomicUsize = AtomicUsize::new(0);
        let name = CString::new("MasqueSwapFixture").unwrap();
        let types = CString::new("@@:").unwrap();
        let selector = sel("fixtureValue").unwrap();

        unsafe {
            let cls = objc_allocateClassPair(class("NSObject").unwrap(), name.as_ptr(), 0);
            assert!(!cls.is_null());
            assert!(class_addMethod(cls, selector, fixture_original as *const c_void, types.as_ptr()));
            objc_registerClassPair(cls);

            let method = class_getInstanceMethod(cls, selector);
            assert!(!method.is_null());
            swap_method(method, fixture_replacement as *const c_void, &SLOT);

            assert_eq!(SLOT.load(Ordering::Acquire), fixture_original as usize);
            assert_eq!(method_getImplementation(method), fixture_replacement as *const c_void);
            assert_eq!(call_original(&SLOT, std::ptr::null_mut(), selector), 1usize as Id);
        }
    }
}
