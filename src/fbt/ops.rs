//! Kernel text access for the fbt provider.
//!
//! [`PatchTarget`] is the only way the provider touches instruction memory.
//! [`KernelText`] implements it on live kernel text with the host's
//! fault-tolerant write primitive plus cache maintenance; tests drive the
//! same lifecycle against a simulated target.

use axerrno::AxResult;
use spin::Mutex;

use super::Error;
use crate::probe::{PATCHVAL_SIZE, PatchVal, SiteKind};

/// BRK immediate placed at function entry.
pub const FBT_ENTRY_BRK_IMM: u32 = 0x10;

/// BRK immediate placed on return instructions.
pub const FBT_RETURN_BRK_IMM: u32 = 0x11;

/// AArch64 `RET` (x30).
pub const AARCH64_RET: PatchVal = 0xd65f_03c0;

/// Encode `BRK #imm`.
pub const fn brk(imm: u32) -> PatchVal {
    0xd420_0000 | ((imm & 0xffff) << 5)
}

/// Fault-tolerant write: copies `data` to `addr`, returning an error
/// instead of faulting when the destination cannot be written.
pub type NofaultWriteFn = fn(addr: usize, data: &[u8]) -> AxResult;

static NOFAULT_WRITE: Mutex<Option<NofaultWriteFn>> = Mutex::new(None);

/// Register the host's fault-tolerant write primitive.
pub fn register_nofault_write_hook(hook: NofaultWriteFn) {
    *NOFAULT_WRITE.lock() = Some(hook);
}

/// Instruction memory the provider can read and patch.
pub trait PatchTarget: Send + Sync {
    /// Read the instruction word at `addr`.
    fn read(&self, addr: usize) -> Result<PatchVal, Error>;

    /// Write `val` at `addr` and make it visible to instruction fetch on
    /// every core before returning.
    fn install(&mut self, addr: usize, val: PatchVal) -> Result<(), Error>;

    /// Trap encoding for a site.
    fn trap_encoding(&self, kind: SiteKind) -> PatchVal {
        match kind {
            SiteKind::Entry => brk(FBT_ENTRY_BRK_IMM),
            SiteKind::Return { .. } => brk(FBT_RETURN_BRK_IMM),
        }
    }

    /// Whether `insn` returns from the function.
    fn is_return(&self, insn: PatchVal) -> bool {
        insn == AARCH64_RET
    }
}

/// Live kernel text.
#[derive(Debug, Default)]
pub struct KernelText;

impl KernelText {
    pub fn new() -> Self {
        Self
    }
}

impl PatchTarget for KernelText {
    fn read(&self, addr: usize) -> Result<PatchVal, Error> {
        if addr == 0 || addr % PATCHVAL_SIZE != 0 {
            return Err(Error::MemoryReadFault(addr));
        }
        // SAFETY: callers only pass patch points inside a loaded module's
        // text, which stays mapped while the module is loaded.
        Ok(unsafe { core::ptr::read_volatile(addr as *const PatchVal) })
    }

    fn install(&mut self, addr: usize, val: PatchVal) -> Result<(), Error> {
        let Some(write) = *NOFAULT_WRITE.lock() else {
            log::error!("fbt: no nofault write primitive registered");
            return Err(Error::MemoryWriteFault(addr));
        };

        if let Err(e) = write(addr, &val.to_ne_bytes()) {
            log::warn!("fbt: nofault write to {:#x} failed: {:?}", addr, e);
            return Err(Error::MemoryWriteFault(addr));
        }

        crate::cache::sync_text(addr, PATCHVAL_SIZE);
        Ok(())
    }
}
