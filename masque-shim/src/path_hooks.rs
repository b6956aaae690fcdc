//! Filesystem entry points that see container paths.
//!
//! Each replacement translates an absolute container path into the current
//! profile's storage and forwards to the original through its trampoline.

use std::ffi::c_void;
use std::sync::atomic::AtomicUsize;

use libc::{c_char, c_int, mode_t};
use masque::bindings::wait_original;
use masque::{Binding, BindingRegistry};
use tracing::debug;

use crate::{redirected, set_errno};

type StatFn = unsafe extern "C" fn(*const c_char, *mut libc::stat) -> c_int;
type AccessFn = unsafe extern "C" fn(*const c_char, c_int) -> c_int;
#[cfg(not(target_os = "linux"))]
type FopenFn = unsafe extern "C" fn(*const c_char, *const c_char) -> *mut libc::FILE;
type OpendirFn = unsafe extern "C" fn(*const c_char) -> *mut libc::DIR;
type MkdirFn = unsafe extern "C" fn(*const c_char, mode_t) -> c_int;

static ORIG_STAT: AtomicUsize = AtomicUsize::new(0);
static ORIG_LSTAT: AtomicUsize = AtomicUsize::new(0);
static ORIG_ACCESS: AtomicUsize = AtomicUsize::new(0);
#[cfg(not(target_os = "linux"))]
static ORIG_FOPEN: AtomicUsize = AtomicUsize::new(0);
static ORIG_OPENDIR: AtomicUsize = AtomicUsize::new(0);
static ORIG_MKDIR: AtomicUsize = AtomicUsize::new(0);

pub fn register(registry: &mut BindingRegistry) {
    #[cfg(target_os = "linux")]
    linux::register(registry);

    // glibc's fopen is too short to patch and opens through the hooked
    // open() anyway.
    #[cfg(not(target_os = "linux"))]
    registry.add(Binding::new("fopen", fopen as *const c_void, &ORIG_FOPEN));

    registry
        .add(Binding::new("stat", stat as *const c_void, &ORIG_STAT))
        .add(Binding::new("lstat", lstat as *const c_void, &ORIG_LSTAT))
        .add(Binding::new("access", access as *const c_void, &ORIG_ACCESS))
        .add(Binding::new("opendir", opendir as *const c_void, &ORIG_OPENDIR))
        .add(Binding::new("mkdir", mkdir as *const c_void, &ORIG_MKDIR));
}

/// Intercept stat()
unsafe extern "C" fn stat(pathname: *const c_char, statbuf: *mut libc::stat) -> c_int {
    let Some(orig) = (unsafe { wait_original::<StatFn>(&ORIG_STAT) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("stat: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr(), statbuf) };
    }
    unsafe { orig(pathname, statbuf) }
}

/// Intercept lstat()
unsafe extern "C" fn lstat(pathname: *const c_char, statbuf: *mut libc::stat) -> c_int {
    let Some(orig) = (unsafe { wait_original::<StatFn>(&ORIG_LSTAT) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("lstat: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr(), statbuf) };
    }
    unsafe { orig(pathname, statbuf) }
}

/// Intercept access()
unsafe extern "C" fn access(pathname: *const c_char, mode: c_int) -> c_int {
    let Some(orig) = (unsafe { wait_original::<AccessFn>(&ORIG_ACCESS) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("access: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr(), mode) };
    }
    unsafe { orig(pathname, mode) }
}

/// Intercept fopen()
#[cfg(not(target_os = "linux"))]
unsafe extern "C" fn fopen(pathname: *const c_char, mode: *const c_char) -> *mut libc::FILE {
    let Some(orig) = (unsafe { wait_original::<FopenFn>(&ORIG_FOPEN) }) else {
        set_errno(libc::ENOSYS);
        return std::ptr::null_mut();
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("fopen: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr(), mode) };
    }
    unsafe { orig(pathname, mode) }
}

/// Intercept opendir()
unsafe extern "C" fn opendir(pathname: *const c_char) -> *mut libc::DIR {
    let Some(orig) = (unsafe { wait_original::<OpendirFn>(&ORIG_OPENDIR) }) else {
        set_errno(libc::ENOSYS);
        return std::ptr::null_mut();
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("opendir: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr()) };
    }
    unsafe { orig(pathname) }
}

/// Intercept mkdir()
unsafe extern "C" fn mkdir(pathname: *const c_char, mode: mode_t) -> c_int {
    let Some(orig) = (unsafe { wait_original::<MkdirFn>(&ORIG_MKDIR) }) else {
        set_errno(libc::ENOSYS);
        return -1;
    };

    if let Some(new_path) = redirected(pathname) {
        debug!("mkdir: -> {:?}", new_path);
        return unsafe { orig(new_path.as_ptr(), mode) };
    }
    unsafe { orig(pathname, mode) }
}

/// `open` and `openat` are variadic. On Linux the optional mode travels in
/// the same register as a fixed argument would, so a fixed-arity
/// replacement sees it; Apple's arm64 ABI passes it on the stack instead,
/// so these two are only bound on Linux.
///
/// `statx` and `fstatat` are what coreutils and newer glibc use for
/// `ls` and friends.
#[cfg(target_os = "linux")]
mod linux {
    use super::*;

    type OpenFn = unsafe extern "C" fn(*const c_char, c_int, ...) -> c_int;
    type OpenatFn = unsafe extern "C" fn(c_int, *const c_char, c_int, ...) -> c_int;
    type FstatatFn = unsafe extern "C" fn(c_int, *const c_char, *mut libc::stat, c_int) -> c_int;
    type StatxFn = unsafe extern "C" fn(c_int, *const c_char, c_int, libc::c_uint, *mut c_void) -> c_int;

    static ORIG_OPEN: AtomicUsize = AtomicUsize::new(0);
    static ORIG_OPENAT: AtomicUsize = AtomicUsize::new(0);
    static ORIG_FSTATAT: AtomicUsize = AtomicUsize::new(0);
    static ORIG_STATX: AtomicUsize = AtomicUsize::new(0);

    pub fn register(registry: &mut BindingRegistry) {
        registry
            .add(Binding::new("open", open as *const c_void, &ORIG_OPEN))
            .add(Binding::new("openat", openat as *const c_void, &ORIG_OPENAT))
            .add(Binding::new("fstatat", fstatat as *const c_void, &ORIG_FSTATAT))
            .add(Binding::new("statx", statx as *const c_void, &ORIG_STATX));
    }

    /// Intercept fstatat(). Relative paths depend on `dirfd` and pass through.
    unsafe extern "C" fn fstatat(
        dirfd: c_int,
        pathname: *const c_char,
        statbuf: *mut libc::stat,
        flags: c_int,
    ) -> c_int {
        let Some(orig) = (unsafe { wait_original::<FstatatFn>(&ORIG_FSTATAT) }) else {
            set_errno(libc::ENOSYS);
            return -1;
        };

        if let Some(new_path) = redirected(pathname) {
            debug!("fstatat: -> {:?}", new_path);
            return unsafe { orig(dirfd, new_path.as_ptr(), statbuf, flags) };
        }
        unsafe { orig(dirfd, pathname, statbuf, flags) }
    }

    /// Intercept statx()
    unsafe extern "C" fn statx(
        dirfd: c_int,
        pathname: *const c_char,
        flags: c_int,
        mask: libc::c_uint,
        statxbuf: *mut c_void,
    ) -> c_int {
        let Some(orig) = (unsafe { wait_original::<StatxFn>(&ORIG_STATX) }) else {
            set_errno(libc::ENOSYS);
            return -1;
        };

        if let Some(new_path) = redirected(pathname) {
            debug!("statx: -> {:?}", new_path);
            return unsafe { orig(dirfd, new_path.as_ptr(), flags, mask, statxbuf) };
        }
        unsafe { orig(dirfd, pathname, flags, mask, statxbuf) }
    }

    /// Intercept open()
    unsafe extern "C" fn open(pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let Some(orig) = (unsafe { wait_original::<OpenFn>(&ORIG_OPEN) }) else {
            set_errno(libc::ENOSYS);
            return -1;
        };

        if let Some(new_path) = redirected(pathname) {
            debug!("open: -> {:?}", new_path);
            return unsafe { orig(new_path.as_ptr(), flags, mode as libc::c_uint) };
        }
        unsafe { orig(pathname, flags, mode as libc::c_uint) }
    }

    /// Intercept openat(). Relative paths depend on `dirfd` and pass through.
    unsafe extern "C" fn openat(dirfd: c_int, pathname: *const c_char, flags: c_int, mode: mode_t) -> c_int {
        let Some(orig) = (unsafe { wait_original::<OpenatFn>(&ORIG_OPENAT) }) else {
            set_errno(libc::ENOSYS);
            return -1;
        };

        if let Some(new_path) = redirected(pathname) {
            debug!("openat: -> {:?}", new_path);
            return unsafe { orig(dirfd, new_path.as_ptr(), flags, mode as libc::c_uint) };
        }
        unsafe { orig(dirfd, pathname, flags, mode as libc::c_uint) }
    }
}
