//! Executable memory: trampoline buffers, protection changes and cache maintenance.

use std::ptr;

use tracing::trace;

use crate::error::HookError;

/// Largest distance from the target we accept for a "near" trampoline.
const NEAR_RANGE: usize = 0x7000_0000;
/// Step between placement hints when searching for a near region.
const HINT_STEP: usize = 0x10_0000;
const HINT_ATTEMPTS: usize = 1024;

pub fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { 4096 } else { size as usize }
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// An anonymous mapping that is writable until sealed, then read+execute.
pub struct ExecBuffer {
    ptr: *mut u8,
    len: usize,
    sealed: bool,
}

// The mapping is owned exclusively by the buffer and only mutated before sealing.
unsafe impl Send for ExecBuffer {}
unsafe impl Sync for ExecBuffer {}

impl ExecBuffer {
    /// Map at least `len` bytes, preferring an address within ±1.75 GiB of `near`.
    pub fn alloc(len: usize, near: Option<usize>) -> Result<Self, HookError> {
        let page = page_size();
        let len = len.div_ceil(page).max(1) * page;

        if let Some(near) = near {
            for step in 1..=HINT_ATTEMPTS {
                let delta = step * HINT_STEP;
                for hint in [near.checked_sub(delta), near.checked_add(delta)]
                    .into_iter()
                    .flatten()
                {
                    let hint = hint & !(page - 1);
                    if let Some(ptr) = Self::map(len, hint as *mut libc::c_void) {
                        if (ptr as usize).abs_diff(near) < NEAR_RANGE {
                            trace!("trampoline mapped at {:#x} near {:#x}", ptr as usize, near);
                            return Ok(Self { ptr, len, sealed: false });
                        }
                        unsafe { libc::munmap(ptr as *mut libc::c_void, len) };
                    }
                }
            }
        }

        match Self::map(len, ptr::null_mut()) {
            Some(ptr) => Ok(Self { ptr, len, sealed: false }),
            None => Err(HookError::AllocationFailed(errno())),
        }
    }

    fn map(len: usize, hint: *mut libc::c_void) -> Option<*mut u8> {
        let ptr = unsafe {
            libc::mmap(
                hint,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED { None } else { Some(ptr as *mut u8) }
    }

    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Copy `bytes` to the start of the buffer. Only valid before sealing.
    pub fn write(&mut self, bytes: &[u8]) -> Result<(), HookError> {
        if self.sealed || bytes.len() > self.len {
            return Err(HookError::AllocationFailed(libc::EINVAL));
        }
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr, bytes.len()) };
        Ok(())
    }

    /// Flip the buffer to read+execute and make the new code visible to instruction fetch.
    pub fn seal(&mut self) -> Result<(), HookError> {
        protect(self.addr(), self.len, libc::PROT_READ | libc::PROT_EXEC)?;
        flush_instruction_cache(self.addr(), self.len);
        self.sealed = true;
        Ok(())
    }
}

impl Drop for ExecBuffer {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

/// Change protection for every page touching `[addr, addr + len)`.
pub fn protect(addr: usize, len: usize, prot: libc::c_int) -> Result<(), HookError> {
    let page = page_size();
    let start = addr & !(page - 1);
    let end = (addr + len).div_ceil(page) * page;
    let rc = unsafe { libc::mprotect(start as *mut libc::c_void, end - start, prot) };
    if rc != 0 {
        return Err(HookError::ProtectionDenied {
            addr,
            len,
            errno: errno(),
        });
    }
    Ok(())
}

#[cfg(target_arch = "aarch64")]
pub fn flush_instruction_cache(addr: usize, len: usize) {
    use core::arch::asm;

    let ctr: u64;
    unsafe { asm!("mrs {0}, ctr_el0", out(reg) ctr, options(nomem, nostack)) };
    let dline = 4usize << ((ctr >> 16) & 0xF);
    let iline = 4usize << (ctr & 0xF);
    let end = addr + len;

    let mut line = addr & !(dline - 1);
    while line < end {
        unsafe { asm!("dc cvau, {0}", in(reg) line, options(nostack)) };
        line += dline;
    }
    unsafe { asm!("dsb ish", options(nostack)) };

    let mut line = addr & !(iline - 1);
    while line < end {
        unsafe { asm!("ic ivau, {0}", in(reg) line, options(nostack)) };
        line += iline;
    }
    unsafe { asm!("dsb ish", "isb", options(nostack)) };
}

#[cfg(not(target_arch = "aarch64"))]
pub fn flush_instruction_cache(_addr: usize, _len: usize) {
    // x86 keeps instruction fetch coherent with stores; only order the write.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
