//! Trap-dispatch arbitration.
//!
//! The host trap handler forwards breakpoints it does not own to a single
//! hook. Exactly one tracing backend may hold that hook at a time; a backend
//! claims it with a compare-and-swap and must (re-)claim it before installing
//! any patch, since a trap nobody routes is fatal.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

/// What the hook decided about a trapping PC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapVerdict {
    /// The trap does not belong to this backend.
    NotOurs,
    /// The backend is busy; return from the exception without advancing the
    /// PC so the instruction re-executes.
    Retry,
    /// The trap was an fbt site. The host must emulate (or single-step) the
    /// displaced instruction `emulate` before resuming.
    Handled { emulate: u32, is_return: bool },
}

/// Signature of a dispatch entry point.
pub type TrapHookFn = fn(pc: usize) -> TrapVerdict;

/// The slot was already held by a different backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationLost;

impl core::fmt::Display for ArbitrationLost {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "trap hook already occupied")
    }
}

impl core::error::Error for ArbitrationLost {}

/// Single-claimant slot holding a dispatch entry point.
pub struct TrapHookSlot {
    hook: AtomicPtr<()>,
}

/// The host kernel's slot.
pub static HOST_TRAP_HOOK: TrapHookSlot = TrapHookSlot::new();

impl TrapHookSlot {
    pub const fn new() -> Self {
        Self {
            hook: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Claim the slot for `hook`.
    ///
    /// Succeeds when the slot was empty or already holds `hook`.
    pub fn claim(&self, hook: TrapHookFn) -> Result<(), ArbitrationLost> {
        let want = hook as *mut ();
        match self
            .hook
            .compare_exchange(ptr::null_mut(), want, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                trace!("fbt: trap hook claimed ({:p})", want);
                Ok(())
            }
            Err(current) if current == want => Ok(()),
            Err(_) => Err(ArbitrationLost),
        }
    }

    /// Whether `hook` currently holds the slot.
    pub fn is_held_by(&self, hook: TrapHookFn) -> bool {
        self.hook.load(Ordering::Acquire) == hook as *mut ()
    }

    /// Current claimant, if any.
    pub fn current(&self) -> Option<TrapHookFn> {
        let raw = self.hook.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: the only non-null values ever stored are `TrapHookFn`
        // pointers written by `claim`.
        Some(unsafe { core::mem::transmute::<*mut (), TrapHookFn>(raw) })
    }

    /// Forward a trap to the claimant. Called from the host trap handler.
    pub fn dispatch(&self, pc: usize) -> TrapVerdict {
        match self.current() {
            Some(hook) => hook(pc),
            None => TrapVerdict::NotOurs,
        }
    }
}

impl Default for TrapHookSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hook_a(_pc: usize) -> TrapVerdict {
        TrapVerdict::Retry
    }

    fn hook_b(_pc: usize) -> TrapVerdict {
        TrapVerdict::NotOurs
    }

    #[test]
    fn test_claim_is_exclusive() {
        let slot = TrapHookSlot::new();
        assert_eq!(slot.dispatch(0x1000), TrapVerdict::NotOurs);
        assert!(slot.claim(hook_a).is_ok());
        assert!(slot.claim(hook_a).is_ok());
        assert_eq!(slot.claim(hook_b), Err(ArbitrationLost));
        assert!(slot.is_held_by(hook_a));
        assert_eq!(slot.dispatch(0x1000), TrapVerdict::Retry);
    }
}
