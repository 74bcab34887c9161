//! Function boundary tracing provider.
//!
//! Places a trap on the first instruction and on every return instruction
//! of eligible kernel functions:
//! - provision: create probes for a newly loaded module
//! - lifecycle: enable/disable/suspend/resume/destroy a function's probes
//! - handler: route a trapping PC to its probe
//! - ops: read and patch kernel text
//! - manager: the provider service and its process-wide instance

use core::sync::atomic::{AtomicBool, Ordering};

pub mod handler;
pub mod lifecycle;
pub mod manager;
pub mod ops;
pub mod provision;

pub use lifecycle::BatchOutcome;
pub use manager::{FbtProvider, ProbeInfo};
pub use ops::{KernelText, PatchTarget};

/// Log every skipped probe and arbitration failure.
static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn is_verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

/// Error types for fbt operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The probe's module is not loaded.
    ModuleUnloaded,
    /// The probe's module was reloaded since the probe was created.
    ModuleReloaded,
    /// Another backend holds the trap hook.
    ArbitrationLost,
    /// Writing the patch point failed.
    MemoryWriteFault(usize),
    /// Reading the patch point failed.
    MemoryReadFault(usize),
    /// The provider is already attached.
    AlreadyAttached,
    /// The provider is not attached.
    NotAttached,
    /// No symbol with that name.
    SymbolNotFound,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::ModuleUnloaded => write!(f, "module unloaded"),
            Self::ModuleReloaded => write!(f, "module reloaded"),
            Self::ArbitrationLost => write!(f, "trap hook already occupied"),
            Self::MemoryWriteFault(addr) => write!(f, "write to {:#x} faulted", addr),
            Self::MemoryReadFault(addr) => write!(f, "read from {:#x} faulted", addr),
            Self::AlreadyAttached => write!(f, "fbt provider already attached"),
            Self::NotAttached => write!(f, "fbt provider not attached"),
            Self::SymbolNotFound => write!(f, "symbol not found"),
        }
    }
}

impl core::error::Error for Error {}

impl From<crate::trap_hook::ArbitrationLost> for Error {
    fn from(_: crate::trap_hook::ArbitrationLost) -> Self {
        Self::ArbitrationLost
    }
}
