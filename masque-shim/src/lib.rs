use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use lazy_static::lazy_static;
use libc::{c_char, c_int};
use masque::identifiers::Resolution;
use masque::{BindingRegistry, Config, DeviceModel, IdentifierKind, ReentrancyGuard, Runtime};
#[cfg(not(test))]
use masque::{HookEngine, LibloadingResolver};
#[cfg(not(test))]
use tracing::{debug, info};
use tracing::{error, warn};

#[cfg(target_vendor = "apple")]
mod cf;
mod identity_hooks;
#[cfg(target_vendor = "apple")]
mod objc;
mod path_hooks;

// Global state
lazy_static! {
    static ref RUNTIME: Option<Runtime> = start_runtime();
    static ref BINDINGS: BindingRegistry = {
        let mut registry = BindingRegistry::new();
        path_hooks::register(&mut registry);
        identity_hooks::register(&mut registry);
        registry
    };
}

fn load_config() -> anyhow::Result<Config> {
    Config::from_sources(|key| {
        let value = std::env::var(key).ok();
        #[cfg(target_vendor = "apple")]
        if value.is_none() && key == masque::config::ENV_BUNDLE_ID {
            return objc::main_bundle_identifier();
        }
        value
    })
}

fn start_runtime() -> Option<Runtime> {
    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load Masque configuration: {:#}", e);
            return None;
        }
    };

    match Runtime::start(&config) {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            error!("Failed to start Masque runtime for {}: {}", config.bundle_id, e);
            None
        }
    }
}

pub(crate) fn runtime() -> Option<&'static Runtime> {
    RUNTIME.as_ref()
}

// Initialize the shim when loaded
#[cfg(not(test))]
#[ctor::ctor]
fn init_shim() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .try_init();

    info!("Masque shim loaded");

    let Some(runtime) = runtime() else {
        warn!("Masque runtime unavailable, leaving the process unhooked");
        return;
    };

    if runtime.translator().is_system_app(runtime.bundle_id()) {
        info!("{} is a system app, not intercepting", runtime.bundle_id());
        return;
    }

    let resolver = LibloadingResolver::new();
    if let Some(report) = BINDINGS.install_all(HookEngine::global(), &resolver) {
        for (symbol, reason) in &report.failed {
            debug!("{} left unhooked: {}", symbol, reason);
        }
    }

    #[cfg(target_vendor = "apple")]
    objc::install();

    info!(
        "Masque active for {} (profile {:?})",
        runtime.bundle_id(),
        runtime.current_profile_id()
    );
}

// =============================================================================
// Helpers shared by the replacement functions
// =============================================================================

/// Translated copy of `path`, or `None` to use `path` unchanged.
///
/// Also `None` when called from inside another interception on this thread,
/// so the core's own filesystem access is never redirected.
pub(crate) fn redirected(path: *const c_char) -> Option<CString> {
    if path.is_null() {
        return None;
    }
    let _guard = ReentrancyGuard::enter()?;
    let runtime = runtime()?;

    let original = unsafe { CStr::from_ptr(path) }.to_str().ok()?;
    if !original.starts_with('/') {
        return None;
    }

    match runtime.translate_path(Path::new(original)) {
        Ok(translated) if translated != Path::new(original) => {
            CString::new(translated.as_os_str().as_bytes()).ok()
        }
        Ok(_) => None,
        Err(e) => {
            warn!("Passing {} through: {}", original, e);
            None
        }
    }
}

/// The spoofed value of `kind`, or `None` to report the real one.
pub(crate) fn spoofed(kind: IdentifierKind) -> Option<String> {
    let _guard = ReentrancyGuard::enter()?;
    let runtime = runtime()?;

    match runtime.store().resolve(kind, runtime.bundle_id()) {
        Ok(Resolution::Spoofed(value)) => Some(value),
        Ok(Resolution::Passthrough) => None,
        Err(e) => {
            warn!("Reporting real {}: {}", kind, e);
            None
        }
    }
}

/// Spoofed value of `kind` parsed into its structured form.
pub(crate) fn spoofed_as<T: std::str::FromStr>(kind: IdentifierKind) -> Option<T> {
    spoofed(kind)?.parse().ok()
}

/// Machine identifier (`iPhone14,2`) of the spoofed device model.
pub(crate) fn spoofed_machine() -> Option<String> {
    spoofed_as::<DeviceModel>(IdentifierKind::DeviceModel).map(|m| m.machine)
}

pub(crate) fn set_errno(code: c_int) {
    #[cfg(target_os = "linux")]
    unsafe {
        *libc::__errno_location() = code
    };
    #[cfg(target_vendor = "apple")]
    unsafe {
        *libc::__error() = code
    };
}

/// Copy `value` with a terminating NUL into a C buffer of `len` bytes.
/// Returns false, writing nothing, when it does not fit.
pub(crate) fn write_c_string(value: &str, buf: *mut c_char, len: usize) -> bool {
    let bytes = value.as_bytes();
    if buf.is_null() || bytes.len() + 1 > len || bytes.contains(&0) {
        return false;
    }
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), buf.cast::<u8>(), bytes.len());
        *buf.add(bytes.len()) = 0;
    }
    true
}

/// Fill a fixed-size `c_char` field, truncating to fit.
pub(crate) fn fill_c_field(field: &mut [c_char], value: &str) {
    let Some(max) = field.len().checked_sub(1) else {
        return;
    };
    let bytes = value.as_bytes();
    let n = bytes.len().min(max);
    for (dst, src) in field.iter_mut().zip(&bytes[..n]) {
        *dst = *src as c_char;
    }
    field[n] = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_string_must_fit_with_terminator() {
        let mut buf = [1 as c_char; 8];
        assert!(write_c_string("iPhone", buf.as_mut_ptr(), buf.len()));
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap(), "iPhone");

        let mut small = [1 as c_char; 6];
        assert!(!write_c_string("iPhone", small.as_mut_ptr(), small.len()));
        assert_eq!(small[0], 1);
    }

    #[test]
    fn fixed_fields_are_truncated() {
        let mut field = [1 as c_char; 5];
        fill_c_field(&mut field, "iPhone14,2");
        assert_eq!(unsafe { CStr::from_ptr(field.as_ptr()) }.to_str().unwrap(), "iPho");

        fill_c_field(&mut field, "ab");
        assert_eq!(unsafe { CStr::from_ptr(field.as_ptr()) }.to_str().unwrap(), "ab");
    }

    #[test]
    fn null_path_is_not_redirected() {
        assert!(redirected(std::ptr::null()).is_none());
    }
}
