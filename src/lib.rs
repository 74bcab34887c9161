//! AxVisor function boundary tracing (fbt) provider
//!
//! Places a trap on the entry and on every return instruction of kernel
//! functions while the kernel runs, and removes it again afterwards so the
//! function is byte-identical to its un-instrumented form.
//!
//! # Features
//!
//! - `symbols` - Resident kernel symbol table lookup (default)
//! - `kasan` - Exclude sanitizer runtime paths from instrumentation
//!
//! # Quick Start
//!
//! ```ignore
//! use axfbt::{FbtConfig, KernelText};
//!
//! // Install the host's fault-tolerant write primitive, then attach.
//! axfbt::fbt::ops::register_nofault_write_hook(nofault_write);
//! axfbt::init(FbtConfig::default(), Box::new(KernelText::new())).unwrap();
//!
//! // On module load (module lock held)
//! axfbt::fbt::manager::provide_module(&ctl).unwrap();
//!
//! // Tracing session
//! let chain = axfbt::fbt::manager::lookup_function(ctl.id(), "vfs_read").unwrap();
//! axfbt::fbt::manager::enable(chain).unwrap();
//!
//! // In the host breakpoint exception handler
//! match axfbt::trap_hook::HOST_TRAP_HOOK.dispatch(pc) { ... }
//! ```

#![no_std]

extern crate alloc;

#[macro_use]
extern crate log;

pub mod cache;
pub mod config;
pub mod exclusion;
pub mod fbt;
pub mod module;
pub mod probe;
pub mod registry;
pub mod trap_hook;

#[cfg(feature = "symbols")]
pub mod symbols;

pub use config::{FbtConfig, KernelSymbolMode};
pub use fbt::{BatchOutcome, Error, FbtProvider, KernelText, PatchTarget, ProbeInfo};
pub use module::{ModFlags, ModuleCtl, ModuleKind, ModuleSymbol, SymbolSource};
pub use probe::{FbtProbe, PatchVal, SiteKind};
pub use registry::{ChainId, ProbeId, ProbeRegistry};
pub use trap_hook::{TrapHookSlot, TrapVerdict};

// =============================================================================
// Initialization
// =============================================================================

/// Attach the fbt provider.
///
/// Call once during kernel boot after the memory allocator is ready and the
/// nofault write primitive is registered.
pub fn init(config: FbtConfig, target: alloc::boxed::Box<dyn PatchTarget>) -> Result<(), Error> {
    info!("Initializing axfbt...");
    info!(
        "  - probe table: {:#x} buckets, symbol mode {:?}",
        config.probetab_size, config.symbol_mode
    );
    if config.ignore_denylist {
        warn!("  - denylist override set at boot");
    }

    fbt::manager::attach(config, target)?;

    info!("axfbt initialization complete");
    Ok(())
}

/// Attach the fbt provider with the kernel symbol table loaded, which
/// single-function provisioning needs.
///
/// # Arguments
/// * `kallsyms_data` - The kallsyms.bin binary blob (static lifetime required)
/// * `stext` - Start address of kernel text section (_stext)
/// * `etext` - End address of kernel text section (_etext)
#[cfg(feature = "symbols")]
pub fn init_with_symbols(
    config: FbtConfig,
    target: alloc::boxed::Box<dyn PatchTarget>,
    kallsyms_data: &'static [u8],
    stext: u64,
    etext: u64,
) -> Result<(), Error> {
    let ptr = kallsyms_data.as_ptr() as usize;
    if ptr % 4096 != 0 {
        warn!("  - kallsyms data is not page-aligned (ptr % 4096 = {})", ptr % 4096);
    }

    match symbols::init(kallsyms_data, stext, etext) {
        Ok(()) => info!("  - symbol table loaded, text {:#x} - {:#x}", stext, etext),
        Err(e) => error!("  - failed to load symbol table: {}", e),
    }

    init(config, target)
}
