//! Cache-control instruction implementations
//!
//! The real [`CacheOps`] backing for the engine, plus cache-mode detection
//! from CR0. WBINVD is the only privileged instruction here; the policy
//! resolver guarantees it is never reached from ring 3 or V86 context.

use core::arch::asm;

use dma_coherency::capability::{CacheInfo, CacheMode};
use dma_coherency::hal::CacheOps;
use x86_64::registers::control::{Cr0, Cr0Flags};

/// Write back and invalidate one cache line
///
/// # Safety
/// `addr` must be a mapped linear address.
#[inline(always)]
pub unsafe fn clflush(addr: *const u8) {
    asm!("clflush [{}]", in(reg) addr, options(nostack, preserves_flags));
}

/// Write back and invalidate the entire cache
///
/// # Safety
/// Must be called from ring 0 outside V86 context; faults otherwise.
#[inline(always)]
pub unsafe fn wbinvd() {
    asm!("wbinvd", options(nostack, preserves_flags));
}

/// Order all prior stores before any later store
#[inline(always)]
pub fn sfence() {
    unsafe {
        asm!("sfence", options(nostack, preserves_flags));
    }
}

/// Instruction-backed cache operations
///
/// Construction asserts nothing; the resolved tier decides which of these is
/// ever executed.
pub struct HardwareCacheOps;

impl CacheOps for HardwareCacheOps {
    fn flush_line(&mut self, addr: *const u8) {
        unsafe { clflush(addr) };
    }

    fn flush_whole_cache(&mut self) {
        unsafe { wbinvd() };
    }

    fn store_fence(&mut self) {
        sfence();
    }
}

/// Cache configuration from CR0
///
/// CD set means caching is off. CD clear is treated as write-back: the probes
/// must run on exactly the machines where stores linger in cache, and
/// assuming write-through would skip them there.
///
/// # Safety
/// Reads CR0; ring 0 only.
pub unsafe fn detect_cache_mode() -> CacheInfo {
    let cr0 = Cr0::read();

    let mode = if cr0.contains(Cr0Flags::CACHE_DISABLE) {
        CacheMode::Disabled
    } else {
        CacheMode::WriteBack
    };

    CacheInfo { mode }
}
