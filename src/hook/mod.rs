//! Inline function hooking.
//!
//! [`HookEngine`] overwrites the prologue of a target function with an
//! absolute branch to a replacement, and hands back a trampoline that runs
//! the displaced instructions before jumping back into the original body.
//! Everything that depends on the instruction set lives behind
//! [`CodePatcher`]; the engine itself only manages memory and bookkeeping.

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Mutex, MutexGuard, OnceLock};

use tracing::{debug, info, warn};

use crate::error::HookError;

pub mod aarch64;
pub mod memory;
pub mod x86_64;

use memory::ExecBuffer;

/// Upper bound on the number of prologue bytes ever displaced.
pub const MAX_PROLOGUE: usize = 32;

/// Displaced prologue rewritten to run from a trampoline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelocatedPrologue {
    /// Bytes consumed at the target, always whole instructions.
    pub saved_len: usize,
    /// Equivalent code for the trampoline address.
    pub code: Vec<u8>,
}

/// Instruction-set specific half of inline hooking.
pub trait CodePatcher: Send + Sync {
    /// Length of the absolute branch written over a prologue.
    fn branch_size(&self) -> usize;

    /// Whether trampolines should be mapped close to their target.
    fn wants_near_trampoline(&self) -> bool;

    /// Absolute branch from `from` to `to`, exactly `branch_size()` bytes.
    fn encode_branch(&self, from: usize, to: usize) -> Vec<u8>;

    /// Filler for patched bytes beyond the branch.
    fn padding(&self, len: usize) -> Vec<u8>;

    /// Decode whole instructions of `code` (read at `target`) until at least
    /// `branch_size()` bytes are covered, and rewrite them for `trampoline`.
    fn relocate_prologue(
        &self,
        code: &[u8],
        target: usize,
        trampoline: usize,
    ) -> Result<RelocatedPrologue, HookError>;

    /// Change protection of the pages under `[addr, addr + len)`.
    fn protect(&self, addr: usize, len: usize, prot: libc::c_int) -> Result<(), HookError> {
        memory::protect(addr, len, prot)
    }
}

/// Patcher that refuses everything, for targets without an implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedPatcher;

impl CodePatcher for UnsupportedPatcher {
    fn branch_size(&self) -> usize {
        0
    }

    fn wants_near_trampoline(&self) -> bool {
        false
    }

    fn encode_branch(&self, _from: usize, _to: usize) -> Vec<u8> {
        Vec::new()
    }

    fn padding(&self, _len: usize) -> Vec<u8> {
        Vec::new()
    }

    fn relocate_prologue(
        &self,
        _code: &[u8],
        _target: usize,
        _trampoline: usize,
    ) -> Result<RelocatedPrologue, HookError> {
        Err(HookError::UnsupportedArchitecture)
    }
}

#[cfg(target_arch = "x86_64")]
pub type NativePatcher = x86_64::X86_64Patcher;

#[cfg(target_arch = "aarch64")]
pub type NativePatcher = aarch64::Arm64Patcher;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub type NativePatcher = UnsupportedPatcher;

/// Bookkeeping for one patched target.
pub struct HookRecord {
    target: usize,
    replacement: usize,
    trampoline: ExecBuffer,
    saved_prologue: [u8; MAX_PROLOGUE],
    saved_len: usize,
    active: bool,
}

impl HookRecord {
    pub fn target(&self) -> usize {
        self.target
    }

    pub fn replacement(&self) -> usize {
        self.replacement
    }

    pub fn trampoline(&self) -> usize {
        self.trampoline.addr()
    }

    fn saved_prologue(&self) -> &[u8] {
        &self.saved_prologue[..self.saved_len]
    }

    pub fn is_active(&self) -> bool {
        self.active
    }
}

/// Installs and removes inline hooks in the running process.
///
/// A single lock serializes every install and removal, so no two patches
/// ever race on the same code page.
pub struct HookEngine<P: CodePatcher = NativePatcher> {
    patcher: P,
    hooks: Mutex<HashMap<usize, HookRecord>>,
}

impl HookEngine<NativePatcher> {
    pub fn new() -> Self {
        Self::with_patcher(NativePatcher::default())
    }

    /// Process-wide engine shared by all interception bindings.
    pub fn global() -> &'static HookEngine {
        static ENGINE: OnceLock<HookEngine> = OnceLock::new();
        ENGINE.get_or_init(HookEngine::new)
    }
}

impl Default for HookEngine<NativePatcher> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CodePatcher> HookEngine<P> {
    pub fn with_patcher(patcher: P) -> Self {
        Self {
            patcher,
            hooks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<usize, HookRecord>> {
        self.hooks.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Overwrite live code at `addr`, bracketed by RWX and back to RX and
    /// followed by an instruction-cache flush.
    ///
    /// When RX cannot be restored the previous bytes are written back, so a
    /// failed patch never leaves the new code in place.
    ///
    /// # Safety
    /// `addr..addr + bytes.len()` must be mapped code owned by this process,
    /// and the caller must hold the engine lock.
    unsafe fn write_code(&self, addr: usize, bytes: &[u8]) -> Result<(), HookError> {
        let previous = unsafe { std::slice::from_raw_parts(addr as *const u8, bytes.len()) }.to_vec();

        self.patcher.protect(
            addr,
            bytes.len(),
            libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
        )?;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };

        if let Err(e) = self
            .patcher
            .protect(addr, bytes.len(), libc::PROT_READ | libc::PROT_EXEC)
        {
            warn!("restoring RX at {:#x} failed, rolling back: {}", addr, e);
            unsafe { std::ptr::copy_nonoverlapping(previous.as_ptr(), addr as *mut u8, bytes.len()) };
            memory::flush_instruction_cache(addr, bytes.len());
            return Err(e);
        }
        memory::flush_instruction_cache(addr, bytes.len());
        Ok(())
    }

    /// Redirect `target` to `replacement` and return the trampoline that
    /// behaves like the unhooked `target`.
    ///
    /// # Safety
    /// `target` must be the entry of a function in mapped code with at least
    /// [`MAX_PROLOGUE`] readable bytes, and `replacement` must be a function
    /// with an ABI-compatible signature.
    pub unsafe fn install(
        &self,
        target: *const c_void,
        replacement: *const c_void,
    ) -> Result<*const c_void, HookError> {
        let (target, replacement) = (target as usize, replacement as usize);
        if target == 0 || replacement == 0 {
            return Err(HookError::NullAddress);
        }

        let mut hooks = self.lock();
        if hooks.get(&target).is_some_and(|h| h.active) {
            return Err(HookError::AlreadyHooked(target));
        }

        let mut original = [0u8; MAX_PROLOGUE];
        unsafe {
            std::ptr::copy_nonoverlapping(target as *const u8, original.as_mut_ptr(), MAX_PROLOGUE)
        };

        let near = self.patcher.wants_near_trampoline().then_some(target);
        let mut trampoline = ExecBuffer::alloc(MAX_PROLOGUE * 4, near)?;
        let relocated = self
            .patcher
            .relocate_prologue(&original, target, trampoline.addr())?;

        let mut stub = relocated.code;
        let resume = target + relocated.saved_len;
        stub.extend(
            self.patcher
                .encode_branch(trampoline.addr() + stub.len(), resume),
        );
        trampoline.write(&stub)?;
        trampoline.seal()?;

        let mut patch = self.patcher.encode_branch(target, replacement);
        patch.extend(
            self.patcher
                .padding(relocated.saved_len - self.patcher.branch_size()),
        );
        unsafe { self.write_code(target, &patch)? };

        let record = HookRecord {
            target,
            replacement,
            saved_prologue: original,
            saved_len: relocated.saved_len,
            trampoline,
            active: true,
        };
        let trampoline_addr = record.trampoline();
        hooks.insert(target, record);

        debug!(
            "hooked {:#x} -> {:#x} (prologue {} bytes, trampoline {:#x})",
            target, replacement, relocated.saved_len, trampoline_addr
        );

        Ok(trampoline_addr as *const c_void)
    }

    /// Restore the original prologue of `target` and release its trampoline.
    ///
    /// # Safety
    /// No thread may be executing inside the trampoline being released.
    pub unsafe fn try_remove(&self, target: *const c_void) -> Result<(), HookError> {
        let target = target as usize;
        let mut hooks = self.lock();
        let Some(record) = hooks.get(&target).filter(|h| h.active) else {
            return Err(HookError::TargetNotHooked(target));
        };

        unsafe { self.write_code(target, record.saved_prologue())? };
        hooks.remove(&target);

        debug!("unhooked {:#x}", target);
        Ok(())
    }

    /// [`try_remove`](Self::try_remove), reporting only success.
    ///
    /// # Safety
    /// Same contract as [`try_remove`](Self::try_remove).
    pub unsafe fn remove(&self, target: *const c_void) -> bool {
        match unsafe { self.try_remove(target) } {
            Ok(()) => true,
            Err(e) => {
                info!("remove hook failed: {}", e);
                false
            }
        }
    }

    pub fn is_hooked(&self, target: *const c_void) -> bool {
        self.lock()
            .get(&(target as usize))
            .is_some_and(|h| h.active)
    }

    pub fn trampoline(&self, target: *const c_void) -> Option<*const c_void> {
        self.lock()
            .get(&(target as usize))
            .filter(|h| h.active)
            .map(|h| h.trampoline() as *const c_void)
    }

    pub fn hook_count(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    type AddFn = extern "C" fn(i64) -> i64;

    /// Build `f(x) = x + c` in fresh executable memory with a prologue long
    /// enough to hook and a tail of filler so reads never leave the mapping.
    fn make_add_const(c: u8) -> (ExecBuffer, AddFn) {
        let mut code = Vec::new();
        #[cfg(target_arch = "x86_64")]
        {
            // mov rax, rdi ; add rax, c ; nop x8 ; ret
            code.extend_from_slice(&[0x48, 0x89, 0xF8, 0x48, 0x05, c, 0, 0, 0]);
            code.extend_from_slice(&[0x90; 8]);
            code.push(0xC3);
        }
        #[cfg(target_arch = "aarch64")]
        {
            // add x0, x0, #c ; nop x3 ; ret
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

    fn read_bytes(f: AddFn, len: usize) -> Vec<u8> {
        unsafe { std::slice::from_raw_parts(f as usize as *const u8, len).to_vec() }
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn install_then_remove_restores_prologue() {
        let engine = HookEngine::new();
        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(100);
        let before = read_bytes(f, MAX_PROLOGUE);
        assert_eq!(f(1), 2);

        let tramp = unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap();
        let original: AddFn = unsafe { std::mem::transmute(tramp) };

        assert_eq!(f(1), 101);
        assert_eq!(original(1), 2);
        assert!(engine.is_hooked(f as *const c_void));

        assert!(unsafe { engine.remove(f as *const c_void) });
        assert_eq!(read_bytes(f, MAX_PROLOGUE), before);
        assert_eq!(f(1), 2);
        assert!(!engine.is_hooked(f as *const c_void));
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn double_install_is_rejected() {
        let engine = HookEngine::new();
        let (_f_mem, f) = make_add_const(1);
        let (_r_mem, r) = make_add_const(7);

        unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap();
        let err = unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap_err();
        assert_eq!(err, HookError::AlreadyHooked(f as usize));
        assert_eq!(f(0), 7);

        assert!(unsafe { engine.remove(f as *const c_void) });
        assert_eq!(f(0), 1);
    }

    #[test]
    #[serial]
    fn removing_unknown_target_fails() {
        let engine = HookEngine::new();
        let (_f_mem, f) = make_add_const(1);
        assert_eq!(
            unsafe { engine.try_remove(f as *const c_void) },
            Err(HookError::TargetNotHooked(f as usize))
        );
        assert!(!unsafe { engine.remove(f as *const c_void) });
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn reinstall_after_remove_cycles() {
        let engine = HookEngine::new();
        let (_f_mem, f) = make_add_const(3);
        let (_r_mem, r) = make_add_const(50);

        for _ in 0..50 {
            unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap();
            assert_eq!(f(0), 50);
            assert!(unsafe { engine.remove(f as *const c_void) });
            assert_eq!(f(0), 3);
        }
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn hooked_function_works_across_threads() {
        let engine = HookEngine::new();
        let (_f_mem, f) = make_add_const(2);
        let (_r_mem, r) = make_add_const(40);
        unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap();

        let handles: Vec<_> = (0..4)
            .map(|i| std::thread::spawn(move || f(i)))
            .collect();
        for (i, h) in handles.into_iter().enumerate() {
            assert_eq!(h.join().unwrap(), i as i64 + 40);
        }

        assert!(unsafe { engine.remove(f as *const c_void) });
    }

    /// Native patcher whose second protection change fails.
    struct FailingRestore {
        inner: NativePatcher,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl CodePatcher for FailingRestore {
        fn branch_size(&self) -> usize {
            self.inner.branch_size()
        }

        fn wants_near_trampoline(&self) -> bool {
            self.inner.wants_near_trampoline()
        }

        fn encode_branch(&self, from: usize, to: usize) -> Vec<u8> {
            self.inner.encode_branch(from, to)
        }

        fn padding(&self, len: usize) -> Vec<u8> {
            self.inner.padding(len)
        }

        fn relocate_prologue(
            &self,
            code: &[u8],
            target: usize,
            trampoline: usize,
        ) -> Result<RelocatedPrologue, HookError> {
            self.inner.relocate_prologue(code, target, trampoline)
        }

        fn protect(&self, addr: usize, len: usize, prot: libc::c_int) -> Result<(), HookError> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 1 {
                return Err(HookError::ProtectionDenied {
                    addr,
                    len,
                    errno: libc::EACCES,
                });
            }
            memory::protect(addr, len, prot)
        }
    }

    #[test]
    #[serial]
    #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
    fn failed_protection_restore_leaves_target_unpatched() {
        let engine = HookEngine::with_patcher(FailingRestore {
            inner: NativePatcher::default(),
            calls: std::sync::atomic::AtomicUsize::new(0),
        });
        let (_f_mem, f) = make_add_const(4);
        let (_r_mem, r) = make_add_const(90);
        let before = read_bytes(f, MAX_PROLOGUE);

        let err = unsafe { engine.install(f as *const c_void, r as *const c_void) }.unwrap_err();
        assert!(matches!(err, HookError::ProtectionDenied { .. }));
        assert_eq!(read_bytes(f, MAX_PROLOGUE), before);
        assert_eq!(f(1), 5);
        assert!(!engine.is_hooked(f as *const c_void));
        assert_eq!(engine.hook_count(), 0);
    }

    #[test]
    fn null_addresses_are_rejected() {
        let engine = HookEngine::new();
        let err = unsafe { engine.install(std::ptr::null(), std::ptr::null()) }.unwrap_err();
        assert_eq!(err, HookError::NullAddress);
    }
}
