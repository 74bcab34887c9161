//! Data and instruction cache maintenance for code patching.
//!
//! A patched instruction word must be visible to instruction fetch on every
//! core before any of them can execute it. AArch64 caches are not coherent
//! between the data and instruction side, so the written range is cleaned to
//! the point of unification and then invalidated in the I-cache. x86_64 keeps
//! them coherent; only ordering is needed there.

use core::sync::atomic::{Ordering, fence};

/// Cache line size assumed for maintenance loops.
#[cfg(target_arch = "aarch64")]
const CACHE_LINE_SIZE: usize = 64;

/// Clean the data cache for `[start, start + len)` to the point of
/// unification.
#[cfg(target_arch = "aarch64")]
pub fn flush_dcache_range(start: usize, len: usize) {
    let start_aligned = start & !(CACHE_LINE_SIZE - 1);
    let end = start + len;

    unsafe {
        for addr in (start_aligned..end).step_by(CACHE_LINE_SIZE) {
            core::arch::asm!("dc cvau, {0}", in(reg) addr, options(nostack, preserves_flags));
        }
        core::arch::asm!("dsb ish", options(nostack, preserves_flags));
    }

    log::trace!("flush_dcache_range: {:#x} +{}", start, len);
}

/// Invalidate the instruction cache for `[start, start + len)`.
#[cfg(target_arch = "aarch64")]
pub fn invalidate_icache_range(start: usize, len: usize) {
    let start_aligned = start & !(CACHE_LINE_SIZE - 1);
    let end = start + len;

    unsafe {
        for addr in (start_aligned..end).step_by(CACHE_LINE_SIZE) {
            core::arch::asm!("ic ivau, {0}", in(reg) addr, options(nostack, preserves_flags));
        }
        core::arch::asm!(
            "dsb ish", // wait for IC invalidation
            "isb",
            options(nostack, preserves_flags)
        );
    }

    log::trace!("invalidate_icache_range: {:#x} +{}", start, len);
}

#[cfg(target_arch = "x86_64")]
pub fn flush_dcache_range(_start: usize, _len: usize) {
    // Coherent with the I-cache; the store just has to be ordered.
    unsafe {
        core::arch::asm!("mfence", options(nostack, preserves_flags));
    }
}

#[cfg(target_arch = "x86_64")]
pub fn invalidate_icache_range(_start: usize, _len: usize) {}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
pub fn flush_dcache_range(_start: usize, _len: usize) {
    log::warn!("flush_dcache_range: not implemented for this architecture");
}

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
pub fn invalidate_icache_range(_start: usize, _len: usize) {
    log::warn!("invalidate_icache_range: not implemented for this architecture");
}

/// Make a freshly written instruction range visible to instruction fetch.
pub fn sync_text(start: usize, len: usize) {
    flush_dcache_range(start, len);
    invalidate_icache_range(start, len);
}

/// Order every patch of a batch before the batch call returns.
#[inline]
pub fn membar_producer() {
    fence(Ordering::Release);
}
