//! Integration tests for provisioning probes from module symbol lists.

mod common;

use std::sync::Arc;

use axfbt::{
    FbtConfig, FbtProvider, KernelSymbolMode, ModFlags, ModuleCtl, ModuleKind, ModuleSymbol, SiteKind, TrapVerdict,
};
use common::*;

fn with_mode(text: &SimText, mode: KernelSymbolMode) -> FbtProvider {
    let config = FbtConfig {
        symbol_mode: mode,
        ..FbtConfig::default()
    };
    FbtProvider::new(config, Box::new(text.clone()), leaked_slot())
}

fn user_module(id: u32, name: &str, kind: ModuleKind, symbols: Vec<ModuleSymbol>) -> Arc<ModuleCtl> {
    let ctl = ModuleCtl::new(id, name, TEXT_BASE, TEXT_SIZE, kind);
    ctl.set_user_symbols(symbols);
    ctl.mark_loaded();
    Arc::new(ctl)
}

// =============================================================================
// Kernel Symbols
// =============================================================================

#[test]
fn test_entry_and_return_sites() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    assert_eq!(fbt.provide_module(&ctl), 5);
    assert!(ctl.flags().contains(ModFlags::FBT_PROBES_PROVIDED));

    let chain = fbt.lookup_function(1, "vfs_read").unwrap();
    let probes = fbt.chain_info(chain);
    let kinds: Vec<SiteKind> = probes.iter().map(|p| p.kind).collect();
    assert_eq!(
        kinds,
        vec![
            SiteKind::Entry,
            SiteKind::Return { offset: 8 },
            SiteKind::Return { offset: 16 }
        ]
    );
    assert_eq!(probes[0].savedval, PROLOGUE);
    assert_eq!(probes[0].patchval, ENTRY_TRAP);
    assert_eq!(probes[1].patchpoint, VFS_READ + 8);
    assert_eq!(probes[1].savedval, RET);
    assert_eq!(probes[1].patchval, RETURN_TRAP);
    assert!(probes.iter().all(|p| p.currentval == p.savedval));
    assert!(probes.iter().all(|p| p.function == "vfs_read" && p.module == "mach_kernel"));

    // Provisioning reads text, it never writes it.
    assert_eq!(text.writes(), 0);
}

#[test]
fn test_excluded_names_are_not_provided() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    fbt.provide_module(&ctl);

    assert!(fbt.lookup_function(1, "cpu_idle").is_none());
    assert!(fbt.lookup(CPU_IDLE).is_none());
    assert!(fbt.lookup_function(1, "tcp_input").is_some());
}

#[test]
fn test_provide_is_idempotent() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    assert_eq!(fbt.provide_module(&ctl), 5);
    assert_eq!(fbt.provide_module(&ctl), 0);
    assert_eq!(fbt.provide_function(&ctl, "vfs_read", VFS_READ, VFS_READ_SIZE), 0);
    assert_eq!(fbt.registry().len(), 5);
    assert_eq!(fbt.list_all().len(), 5);
}

#[test]
fn test_patch_points_are_never_shared() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let a = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    let b = kernel_module(2, "com.example.driver", ModuleKind::Driver);

    assert_eq!(fbt.provide_module(&a), 5);
    // Same text range: every patch point already belongs to module 1.
    assert_eq!(fbt.provide_module(&b), 0);
    assert!(fbt.lookup_function(2, "vfs_read").is_none());
    assert_eq!(fbt.registry().len(), 5);
}

#[test]
fn test_alias_provided_before_enable() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    fbt.provide_module(&ctl);

    assert_eq!(fbt.provide_function(&ctl, "sys_read", VFS_READ, VFS_READ_SIZE), 0);
    assert!(fbt.lookup_function(1, "sys_read").is_none());

    let chain = fbt.lookup_function(1, "vfs_read").unwrap();
    assert_eq!(fbt.enable(chain).patched, 3);
    assert_eq!(
        fbt.handle_trap(VFS_READ),
        TrapVerdict::Handled {
            emulate: PROLOGUE,
            is_return: false
        }
    );
}

#[test]
fn test_alias_provided_after_enable() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    fbt.provide_module(&ctl);
    let chain = fbt.lookup_function(1, "vfs_read").unwrap();
    fbt.enable(chain);
    assert_eq!(text.word(VFS_READ), ENTRY_TRAP);

    assert_eq!(fbt.provide_function(&ctl, "sys_read", VFS_READ, VFS_READ_SIZE), 0);
    assert_eq!(fbt.registry().len(), 5);
    assert_eq!(
        fbt.handle_trap(VFS_READ),
        TrapVerdict::Handled {
            emulate: PROLOGUE,
            is_return: false
        }
    );
    assert_eq!(
        fbt.handle_trap(VFS_READ + 8),
        TrapVerdict::Handled {
            emulate: RET,
            is_return: true
        }
    );
}

#[test]
fn test_inner_symbol_leaves_return_sites_to_owner() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    fbt.provide_module(&ctl);

    // A local label inside vfs_read: its own entry, but the RET at +16
    // already belongs to vfs_read.
    assert_eq!(fbt.provide_function(&ctl, "vfs_read_tail", VFS_READ + 12, 8), 1);
    let chain = fbt.lookup_function(1, "vfs_read_tail").unwrap();
    assert_eq!(fbt.chain_info(chain).len(), 1);
    let owner = fbt.probe_info(fbt.lookup(VFS_READ + 16).unwrap()).unwrap();
    assert_eq!(owner.function, "vfs_read");
}

#[test]
fn test_trap_word_is_never_saved() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    // Left behind by another provider instance.
    let stray = TEXT_BASE + 0x300;
    text.load(stray, &[ENTRY_TRAP, NOP, RETURN_TRAP]);
    assert_eq!(fbt.provide_function(&ctl, "stray", stray, 12), 0);
    assert!(fbt.lookup(stray).is_none());
}

#[test]
fn test_always_from_kernel_discards_symbols() {
    let text = sample_text();
    let mut fbt = with_mode(&text, KernelSymbolMode::AlwaysFromKernel);
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    assert_eq!(fbt.provide_module(&ctl), 5);
    assert!(!ctl.has_kernel_symbols());
}

#[test]
fn test_never_mode_provides_nothing() {
    let text = sample_text();
    let mut fbt = with_mode(&text, KernelSymbolMode::Never);
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    assert_eq!(fbt.provide_module(&ctl), 0);
    assert!(ctl.flags().is_empty());
    assert!(fbt.registry().is_empty());
}

// =============================================================================
// Excluded Modules
// =============================================================================

#[test]
fn test_denylisted_driver_is_marked_invalid() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(7, "com.apple.driver.AppleACPIPlatform", ModuleKind::Driver);

    assert_eq!(fbt.provide_module(&ctl), 0);
    assert!(ctl.flags().contains(ModFlags::FBT_INVALID));
    assert!(ctl.fbt_done());
    assert!(fbt.registry().is_empty());
}

#[test]
fn test_unloaded_module_is_marked_invalid() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = ModuleCtl::new(3, "com.example.driver", TEXT_BASE, TEXT_SIZE, ModuleKind::Driver)
        .with_symbols(axfbt::SymbolSource::Kernel(sample_symbols()));
    let ctl = Arc::new(ctl);

    assert_eq!(fbt.provide_module(&ctl), 0);
    assert!(ctl.flags().contains(ModFlags::FBT_INVALID));

    // Invalid for good, even once loaded.
    ctl.mark_loaded();
    assert_eq!(fbt.provide_module(&ctl), 0);
}

// =============================================================================
// Companion Symbol Lists
// =============================================================================

#[test]
fn test_user_symbols_consumed_once() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = user_module(
        1,
        "mach_kernel",
        ModuleKind::Kernel,
        vec![
            ModuleSymbol::new("_vfs_read", VFS_READ, VFS_READ_SIZE),
            ModuleSymbol::new("_cpu_idle", CPU_IDLE, 8),
            ModuleSymbol::new("_tcp_input", 0, TCP_INPUT_SIZE),
        ],
    );

    assert_eq!(fbt.provide_module(&ctl), 3);
    assert!(!ctl.has_user_symbols());
    assert!(fbt.lookup_function(1, "vfs_read").is_some());
    assert!(fbt.lookup_function(1, "_vfs_read").is_none());
    assert!(fbt.lookup_function(1, "cpu_idle").is_none());
    assert!(fbt.lookup_function(1, "tcp_input").is_none());
}

#[test]
fn test_user_symbols_of_drivers_skip_name_filter() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = user_module(
        4,
        "com.example.driver",
        ModuleKind::Driver,
        vec![ModuleSymbol::new("_cpu_idle", CPU_IDLE, 8)],
    );

    assert_eq!(fbt.provide_module(&ctl), 2);
    assert!(fbt.lookup_function(4, "cpu_idle").is_some());
}

// =============================================================================
// Bad Symbols
// =============================================================================

#[test]
fn test_symbol_outside_module_is_skipped() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    assert_eq!(fbt.provide_function(&ctl, "elsewhere", TEXT_BASE + TEXT_SIZE, 16), 0);
    assert!(fbt.lookup_function(1, "elsewhere").is_none());
}

#[test]
fn test_unreadable_entry_is_skipped() {
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);

    // Inside the module, but nothing mapped there.
    assert_eq!(fbt.provide_function(&ctl, "hole", TEXT_BASE + 0x800, 16), 0);
    assert!(fbt.lookup_function(1, "hole").is_none());
    assert!(fbt.registry().is_empty());
}
