//! Runtime control of the denylist override.
//!
//! Setting the override is process-wide and cannot be undone, so this binary
//! holds a single test.

mod common;

use axfbt::exclusion::{function_excluded, ignore_denylist, set_ignore_denylist};
use axfbt::{KernelSymbolMode, ModFlags, ModuleKind};
use common::*;

#[test]
fn test_override_control_surface() {
    assert!(!ignore_denylist());

    let err = set_ignore_denylist(2, KernelSymbolMode::FromKernel).unwrap_err();
    assert!(matches!(err, axerrno::AxError::InvalidInput));
    let err = set_ignore_denylist(-1, KernelSymbolMode::FromKernel).unwrap_err();
    assert!(matches!(err, axerrno::AxError::InvalidInput));

    let err = set_ignore_denylist(0, KernelSymbolMode::FromKernel).unwrap_err();
    assert!(matches!(err, axerrno::AxError::PermissionDenied));
    let err = set_ignore_denylist(1, KernelSymbolMode::Never).unwrap_err();
    assert!(matches!(err, axerrno::AxError::PermissionDenied));
    let err = set_ignore_denylist(1, KernelSymbolMode::AlwaysFromKernel).unwrap_err();
    assert!(matches!(err, axerrno::AxError::PermissionDenied));
    assert!(!ignore_denylist());

    // Provide once without the override.
    let text = sample_text();
    let mut fbt = provider(&text, leaked_slot());
    let ctl = kernel_module(1, "mach_kernel", ModuleKind::Kernel);
    assert_eq!(fbt.provide_module(&ctl), 5);
    assert!(ctl.fbt_done());
    assert!(fbt.lookup_function(1, "cpu_idle").is_none());

    set_ignore_denylist(1, KernelSymbolMode::FromUserspace).unwrap();
    assert!(ignore_denylist());
    assert!(!function_excluded("dtrace_probe"));

    // Cannot be turned back off.
    let err = set_ignore_denylist(0, KernelSymbolMode::FromKernel).unwrap_err();
    assert!(matches!(err, axerrno::AxError::PermissionDenied));
    assert!(ignore_denylist());

    // A second pass now picks up the denylisted functions.
    assert_eq!(fbt.provide_module(&ctl), 2);
    assert!(fbt.lookup_function(1, "cpu_idle").is_some());
    assert!(
        ctl.flags()
            .contains(ModFlags::FBT_PROVIDE_DENYLISTED_PROBES | ModFlags::FBT_DENYLISTED_PROBES_PROVIDED)
    );
    assert_eq!(fbt.provide_module(&ctl), 0);

    // Denylisted drivers become eligible too. Its text overlaps the kernel's
    // here, so every patch point is already taken.
    let ec = kernel_module(2, "com.apple.driver.AppleACPIEC", ModuleKind::Driver);
    assert_eq!(fbt.provide_module(&ec), 0);
    assert!(!ec.flags().contains(ModFlags::FBT_INVALID));
    assert!(ec.flags().contains(ModFlags::FBT_PROBES_PROVIDED));
}
