//! The table of intercepted symbols and their replacements.
//!
//! A [`BindingRegistry`] is filled once at load time and installed once.
//! Each binding owns a static slot that receives the trampoline, which the
//! replacement calls to reach the real implementation.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tracing::{debug, info, warn};

use crate::hook::{CodePatcher, HookEngine};

/// Finds the address of a symbol in the loaded images.
pub trait SymbolResolver {
    fn resolve(&self, symbol: &str) -> Option<*const c_void>;
}

/// Looks symbols up in the images already loaded into the process.
pub struct LibloadingResolver {
    #[cfg(unix)]
    library: libloading::os::unix::Library,
}

impl LibloadingResolver {
    #[cfg(unix)]
    pub fn new() -> Self {
        Self {
            library: libloading::os::unix::Library::this(),
        }
    }
}

#[cfg(unix)]
impl Default for LibloadingResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
impl SymbolResolver for LibloadingResolver {
    fn resolve(&self, symbol: &str) -> Option<*const c_void> {
        let found = unsafe { self.library.get::<*mut c_void>(symbol.as_bytes()) };
        match found {
            Ok(sym) if !(*sym).is_null() => Some(*sym as *const c_void),
            Ok(_) => None,
            Err(e) => {
                debug!("Symbol {} not found: {}", symbol, e);
                None
            }
        }
    }
}

/// Fixed symbol table, for tests and for callers that already hold addresses.
#[derive(Debug, Default, Clone)]
pub struct MapResolver {
    symbols: HashMap<String, usize>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, symbol: impl Into<String>, addr: *const c_void) -> &mut Self {
        self.symbols.insert(symbol.into(), addr as usize);
        self
    }
}

impl SymbolResolver for MapResolver {
    fn resolve(&self, symbol: &str) -> Option<*const c_void> {
        self.symbols.get(symbol).map(|addr| *addr as *const c_void)
    }
}

/// One intercepted symbol.
pub struct Binding {
    symbol: &'static str,
    replacement: usize,
    original: &'static AtomicUsize,
}

impl Binding {
    /// `original` receives the trampoline once installed; it stays zero
    /// while the binding is unpatched.
    pub fn new(symbol: &'static str, replacement: *const c_void, original: &'static AtomicUsize) -> Self {
        Self {
            symbol,
            replacement: replacement as usize,
            original,
        }
    }

    pub fn symbol(&self) -> &'static str {
        self.symbol
    }

    pub fn is_installed(&self) -> bool {
        self.original.load(Ordering::Acquire) != 0
    }
}

/// What [`BindingRegistry::install_all`] managed to patch.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub installed: Vec<&'static str>,
    pub failed: Vec<(&'static str, String)>,
}

#[derive(Default)]
pub struct BindingRegistry {
    bindings: Vec<Binding>,
    installed: AtomicBool,
}

impl BindingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, binding: Binding) -> &mut Self {
        self.bindings.push(binding);
        self
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Resolve and hook every binding. Failures are logged and leave that
    /// symbol unpatched. Returns `None` when called a second time.
    pub fn install_all<P: CodePatcher>(
        &self,
        engine: &HookEngine<P>,
        resolver: &dyn SymbolResolver,
    ) -> Option<InstallReport> {
        if self.installed.swap(true, Ordering::AcqRel) {
            warn!("Interception bindings already installed, ignoring");
            return None;
        }

        let mut report = InstallReport::default();
        for binding in &self.bindings {
            let Some(target) = resolver.resolve(binding.symbol) else {
                warn!("Cannot resolve {}, leaving it unhooked", binding.symbol);
                report.failed.push((binding.symbol, "symbol not found".to_string()));
                continue;
            };

            match unsafe { engine.install(target, binding.replacement as *const c_void) } {
                Ok(trampoline) => {
                    binding.original.store(trampoline as usize, Ordering::Release);
                    debug!("Hooked {} at {:p}", binding.symbol, target);
                    report.installed.push(binding.symbol);
                }
                Err(e) => {
                    warn!("Failed to hook {}: {}", binding.symbol, e);
                    report.failed.push((binding.symbol, e.to_string()));
                }
            }
        }

        info!(
            "Installed {} of {} interception bindings",
            report.installed.len(),
            self.bindings.len()
        );
        Some(report)
    }

    /// Restore every patched symbol. The registry cannot be installed again.
    pub fn uninstall_all<P: CodePatcher>(&self, engine: &HookEngine<P>, resolver: &dyn SymbolResolver) {
        for binding in self.bindings.iter().filter(|b| b.is_installed()) {
            if let Some(target) = resolver.resolve(binding.symbol) {
                if unsafe { engine.remove(target) } {
                    binding.original.store(0, Ordering::Release);
                }
            }
        }
    }
}

/// Load the trampoline stored in `slot` as a function pointer of type `F`.
///
/// # Safety
/// `F` must be the exact function pointer type of the hooked symbol.
pub unsafe fn original<F: Copy>(slot: &AtomicUsize) -> Option<F> {
    assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<usize>());
    let addr = slot.load(Ordering::Acquire);
    if addr == 0 {
        return None;
    }
    Some(unsafe { std::mem::transmute_copy(&addr) })
}

const INSTALL_SPINS: usize = 1 << 20;

/// Like [`original`], spinning briefly while the binding is mid-install:
/// the target is patched a moment before its slot is filled.
///
/// # Safety
/// Same contract as [`original`].
pub unsafe fn wait_original<F: Copy>(slot: &AtomicUsize) -> Option<F> {
    for _ in 0..INSTALL_SPINS {
        if let Some(f) = unsafe { original(slot) } {
            return Some(f);
        }
        std::hint::spin_loop();
    }
    None
}

thread_local! {
    static IN_INTERCEPTION: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as serving an intercepted call.
///
/// While held, nested calls made by the interception code itself must go
/// straight to the original implementation.
pub struct ReentrancyGuard {
    _private: (),
}

impl ReentrancyGuard {
    /// `None` if this thread is already inside an intercepted call, or its
    /// thread-local storage is being torn down.
    pub fn enter() -> Option<Self> {
        IN_INTERCEPTION
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(ReentrancyGuard { _private: () })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        let _ = IN_INTERCEPTION.try_with(|flag| flag.set(false));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::MAX_PROLOGUE;
    use crate::hook::memory::ExecBuffer;
    use serial_test::serial;

    type AddFn = extern "C" fn(i64) -> i64;

    fn make_add_const(c: u8) -> (ExecBuffer, AddFn) {
        let mut code = Vec::new();
        #[cfg(target_arch = "x86_64")]
        {
            code.extend_from_slice(&[0x48, 0x89, 0xF8, 0x48, 0x05, c, 0, 0, 0]);
            code.extend_from_slice(&[0x90; 8]);
            code.push(0xC3);
        }
        #[cfg(target_arch = "aarch64")]
        {
            let add = 0x9100_0000u32 | (u32::from(c) << 10);
            for w in [add, 0xD503_201F, 0xD503_201F, 0xD503_201F, 0xD65F_03C0] {
                code.extend_from_slice(&w.to_le_bytes());
            }
        }
        code.resize(MAX_PROLOGUE * 2, 0);

        let mut buf = ExecBuffer::alloc(code.len(), None).unwrap();
        buf.write(&code).unwrap();
        buf.seal().unwrap();
        let f: AddFn = unsafe { std::mem::transmute(buf.addr()) };
        (buf, f)
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn install_all_runs_once_and_fills_slots() {
        static ORIGINAL_ADD: AtomicUsize = AtomicUsize::new(0);

        let engine = HookEngine::new();
        let (_target_mem, target) = make_add_const(1);
        let (_repl_mem, replacement) = make_add_const(30);

        let mut resolver = MapResolver::new();
        resolver.insert("add_one", target as *const c_void);

        let mut registry = BindingRegistry::new();
        registry
            .add(Binding::new("add_one", replacement as *const c_void, &ORIGINAL_ADD))
            .add(Binding::new("missing", replacement as *const c_void, &ORIGINAL_ADD));

        let report = registry.install_all(&engine, &resolver).unwrap();
        assert_eq!(report.installed, vec!["add_one"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "missing");

        assert_eq!(target(1), 31);
        let original: AddFn = unsafe { super::original(&ORIGINAL_ADD) }.unwrap();
        assert_eq!(original(1), 2);

        assert!(registry.install_all(&engine, &resolver).is_none());
        assert_eq!(engine.hook_count(), 1);

        registry.uninstall_all(&engine, &resolver);
        assert_eq!(target(1), 2);
        assert!(!registry.bindings()[0].is_installed());
    }

    #[test]
    fn empty_slot_has_no_original() {
        static SLOT: AtomicUsize = AtomicUsize::new(0);
        assert!(unsafe { original::<AddFn>(&SLOT) }.is_none());
    }

    #[test]
    fn reentrancy_guard_blocks_nested_entry() {
        let outer = ReentrancyGuard::enter();
        assert!(outer.is_some());
        assert!(ReentrancyGuard::enter().is_none());
        drop(outer);
        assert!(ReentrancyGuard::enter().is_some());
    }

    #[test]
    fn reentrancy_guard_is_per_thread() {
        let _held = ReentrancyGuard::enter().unwrap();
        let other = std::thread::spawn(|| ReentrancyGuard::enter().is_some())
            .join()
            .unwrap();
        assert!(other);
    }

    #[test]
    #[cfg(unix)]
    fn libloading_resolver_finds_libc() {
        let resolver = LibloadingResolver::new();
        assert!(resolver.resolve("getpid").is_some());
        assert!(resolver.resolve("definitely_not_a_symbol_4242").is_none());
    }
}
