//! Eligibility filter for fbt probes.
//!
//! Decides which modules and which functions may ever be patched. Anything
//! the tracer itself transits from probe context (trap handling, clocks,
//! low-level copy and cache primitives, debugger and panic paths) must stay
//! untouched, otherwise the first trap recurses into itself.
//!
//! Both static denylists are kept in byte order so they can be searched with
//! `binary_search`; a `const` assertion below rejects an unsorted table at
//! build time.

use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::AxResult;

use crate::config::KernelSymbolMode;
use crate::module::ModuleCtl;

/// Process-wide "trust the user" switch. Once set it is never cleared.
static IGNORE_DENYLIST: AtomicBool = AtomicBool::new(false);

/// Prefix of the tracer's own routines.
const TRACER_PREFIX: &str = "dtrace_";

/// Tracer routines that promise never to run in probe context.
const TRACER_SAFE_PREFIX: &str = "dtrace_safe_";

/// Critical routines that must not be probed.
pub const CRITICAL_DENYLIST: &[&str] = &[
    "Call_DebuggerC",
    "SysChoked",
    "_ZN9IOService14newTemperatureElPS_",
    "_ZN9IOService26temperatureCriticalForZoneEPS_",
    "_ZNK6OSData14getBytesNoCopyEv",
    "_disable_preemption",
    "_enable_preemption",
    "bcopy_phys",
    "console_cpu_alloc",
    "console_cpu_free",
    "cpu_IA32e_disable",
    "cpu_IA32e_enable",
    "cpu_NMI_interrupt",
    "cpu_control",
    "cpu_data_alloc",
    "cpu_desc_init",
    "cpu_desc_init64",
    "cpu_desc_load",
    "cpu_desc_load64",
    "cpu_exit_wait",
    "cpu_info",
    "cpu_info_count",
    "cpu_init",
    "cpu_interrupt",
    "cpu_machine_init",
    "cpu_mode_init",
    "cpu_processor_alloc",
    "cpu_processor_free",
    "cpu_signal_handler",
    "cpu_sleep",
    "cpu_start",
    "cpu_subtype",
    "cpu_thread_alloc",
    "cpu_thread_halt",
    "cpu_thread_init",
    "cpu_threadtype",
    "cpu_to_processor",
    "cpu_topology_sort",
    "cpu_topology_start_cpu",
    "cpu_type",
    "cpuid_cpu_display",
    "cpuid_extfeatures",
    "dtrace_invop",
    "enter_lohandler",
    "fbt_invop",
    "fbt_perfCallback",
    "get_threadtask",
    "handle_pending_TLB_flushes",
    "hw_compare_and_store",
    "interrupt",
    "kernel_trap",
    "kprintf",
    "lo_alltraps",
    "lock_debugger",
    "machine_idle_cstate",
    "machine_thread_get_kern_state",
    "mca_cpu_alloc",
    "mca_cpu_init",
    "ml_nofault_copy",
    "nanoseconds_to_absolutetime",
    "nanotime_to_absolutetime",
    "packA",
    "panic",
    "pmKextRegister",
    "pmMarkAllCPUsOff",
    "pmSafeMode",
    "pmTimerRestore",
    "pmTimerSave",
    "pmUnRegister",
    "pmap_cpu_alloc",
    "pmap_cpu_free",
    "pmap_cpu_high_map_vaddr",
    "pmap_cpu_high_shared_remap",
    "pmap_cpu_init",
    "power_management_init",
    "preemption_underflow_panic",
    "register_cpu_setup_func",
    "sdt_invop",
    "sprlock",
    "sprunlock",
    "t_invop",
    "tmrCvt",
    "unlock_debugger",
    "unpackA",
    "unregister_cpu_setup_func",
    "uread",
    "uwrite",
    "vstart",
];

/// Routines reachable from probe context, apart from the tracer's own
/// `dtrace_` routines.
pub const PROBE_CONTEXT_CLOSURE: &[&str] = &[
    "ClearIdlePop",
    "Debugger",
    "IS_64BIT_PROCESS",
    "OSCompareAndSwap",
    "SetIdlePop",
    "absolutetime_to_microtime",
    "act_set_astbsd",
    "arm_init_idle_cpu",
    "ast_dtrace_on",
    "ast_pending",
    "clean_dcache",
    "clean_mmu_dcache",
    "clock_get_calendar_nanotime_nowait",
    "copyin",
    "copyin_kern",
    "copyin_user",
    "copyinstr",
    "copyout",
    "copyoutstr",
    "cpu_number",
    "current_proc",
    "current_processor",
    "current_task",
    "current_thread",
    "debug_enter",
    "drain_write_buffer",
    "find_user_regs",
    "flush_dcache",
    "flush_tlb64",
    "get_bsdtask_info",
    "get_bsdthread_info",
    "hertz_tick",
    "hw_atomic_and",
    "invalidate_mmu_icache",
    "kauth_cred_get",
    "kauth_getgid",
    "kauth_getuid",
    "kernel_preempt_check",
    "kvtophys",
    "mach_absolute_time",
    "max_valid_stack_address",
    "memcpy",
    "memmove",
    "ml_at_interrupt_context",
    "ml_phys_write_byte_64",
    "ml_phys_write_half_64",
    "ml_phys_write_word_64",
    "ml_set_interrupts_enabled",
    "mt_core_snap",
    "mt_cur_cpu_cycles",
    "mt_cur_cpu_instrs",
    "mt_cur_thread_cycles",
    "mt_cur_thread_instrs",
    "mt_fixed_counts",
    "mt_fixed_counts_internal",
    "mt_mtc_update_count",
    "mt_update_thread",
    "ovbcopy",
    "panic",
    "pmap64_pde",
    "pmap64_pdpt",
    "pmap_find_phys",
    "pmap_get_mapwindow",
    "pmap_pde",
    "pmap_pte",
    "pmap_put_mapwindow",
    "pmap_valid_page",
    "prf",
    "proc_is64bit",
    "proc_selfname",
    "psignal_lock",
    "rtc_nanotime_load",
    "rtc_nanotime_read",
    "sdt_getargdesc",
    "setPop",
    "strlcpy",
    "sync_iss_to_iks_unconditionally",
    "systrace_stub",
    "timer_grab",
];

const _: () = assert!(is_sorted(CRITICAL_DENYLIST));
const _: () = assert!(is_sorted(PROBE_CONTEXT_CLOSURE));

/// Coarse prefixes: bring-up, clocks, copy/cache/TLB/atomic primitives,
/// fast user-copy internals, tracer shims, hibernation and debugger paths.
const COARSE_PREFIXES: &[&str] = &[
    "cpu_",
    "platform_",
    "machine_",
    "ml_",
    "PE_",
    "rtc_",
    "_rtc_",
    "rtclock_",
    "clock_",
    "bcopy",
    "pmap_",
    "hw_",
    "lapic_",
    "OSAdd",
    "OSBit",
    "OSDecrement",
    "OSIncrement",
    "OSCompareAndSwap",
    "etimer_",
    "dtxnu_kern_",
    "flush_mmu_tlb_",
    "fasttrap_",
    "fuword",
    "suword",
    "_dtrace",
    "hibernate_",
    "kdp_",
    "kdb_",
    "debug_",
];

/// Exception-handling path and metaclass casts used while handling a trap.
#[cfg(target_arch = "aarch64")]
const ARCH_PREFIXES: &[&str] = &[
    "fleh_",
    "sleh_",
    "timer_state_event",
    "_ZNK15OSMetaClassBase8metaCastEPK11OSMetaClass",
    "_ZN15OSMetaClassBase12safeMetaCastEPKS_PK11OSMetaClass",
    "_ZNK11OSMetaClass13checkMetaCastEPK15OSMetaClassBase",
];

#[cfg(target_arch = "aarch64")]
const ARCH_EXACT: &[&str] = &["get_vfp_enabled"];

/// Firmware glue, TSC and spinlock internals.
#[cfg(target_arch = "x86_64")]
const ARCH_PREFIXES: &[&str] = &[
    "mapping_",
    "tsc_",
    "pmCPU",
    "pms",
    "usimple_",
    "lck_spin_lock",
    "lck_spin_unlock",
    "absolutetime_to_",
    "commpage_",
    "act_machine",
    "acpi_",
    "pal_",
    "dsmos_",
];

#[cfg(target_arch = "x86_64")]
const ARCH_EXACT: &[&str] = &[];

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
const ARCH_PREFIXES: &[&str] = &[];

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
const ARCH_EXACT: &[&str] = &[];

#[cfg(feature = "kasan")]
const SANITIZER_PREFIXES: &[&str] = &["kasan", "__kasan", "__asan"];

#[cfg(not(feature = "kasan"))]
const SANITIZER_PREFIXES: &[&str] = &[];

/// Anything on the way to a panic.
const PANIC_FRAGMENT: &str = "panic_";

/// Drivers backing sleep/wake, power management, firmware and interrupt
/// delivery. Matched as substrings of the module name on every architecture,
/// so a bundle id such as `com.apple.driver.AppleRTC` matches `AppleRTC`.
pub const MODULE_DENYLIST: &[&str] = &[
    "AppleACPIEC",
    "AppleACPIPlatform",
    "AppleRTC",
    "IOACPIFamily",
    "AppleIntelCPUPowerManagement",
    "AppleProfile",
    "AppleIntelProfile",
    "AppleEFI",
    "com.apple.driver.AppleARMPlatform",
    "com.apple.driver.AppleARMPL192VIC",
    "com.apple.driver.AppleInterruptController",
];

/// Bytewise ordering check usable in `const` context.
pub const fn is_sorted(list: &[&str]) -> bool {
    let mut i = 1;
    while i < list.len() {
        if !bytes_le(list[i - 1].as_bytes(), list[i].as_bytes()) {
            return false;
        }
        i += 1;
    }
    true
}

const fn bytes_le(a: &[u8], b: &[u8]) -> bool {
    let mut i = 0;
    while i < a.len() && i < b.len() {
        if a[i] != b[i] {
            return a[i] < b[i];
        }
        i += 1;
    }
    a.len() <= b.len()
}

/// Whether the denylists are currently bypassed.
pub fn ignore_denylist() -> bool {
    IGNORE_DENYLIST.load(Ordering::Acquire)
}

/// Apply the boot-time override. Only ever turns the override on.
pub fn init_ignore_denylist(ignore: bool) {
    if ignore {
        IGNORE_DENYLIST.store(true, Ordering::Release);
        warn!("fbt: denylist disabled at boot, every function is probeable");
    }
}

/// Runtime control point for the override.
///
/// Accepts only `0` or `1` (`InvalidInput` otherwise). Turning the override
/// back off is refused, since nothing tracks whether unsafe probes are still
/// in use. It is also refused when the kernel symbol mode is pinned: with
/// `Never` nothing may be provided, with `AlwaysFromKernel` the symbol tables
/// are discarded after the first provisioning pass.
pub fn set_ignore_denylist(value: i64, mode: KernelSymbolMode) -> AxResult {
    if value != 0 && value != 1 {
        return axerrno::ax_err!(InvalidInput, "ignore_fbt_denylist must be 0 or 1");
    }
    if value != 1 || matches!(mode, KernelSymbolMode::Never | KernelSymbolMode::AlwaysFromKernel) {
        return axerrno::ax_err!(PermissionDenied, "ignore_fbt_denylist cannot be changed");
    }
    IGNORE_DENYLIST.store(true, Ordering::Release);
    info!("fbt: denylist disabled at runtime");
    Ok(())
}

/// Module-level check: should no probe at all be placed in this module?
///
/// A module that is not mapped or not loaded is always excluded, even with
/// the override set.
pub fn module_excluded(ctl: &ModuleCtl) -> bool {
    module_excluded_by_rules(ctl, ignore_denylist())
}

/// Module-level rules with an explicit override value.
pub fn module_excluded_by_rules(ctl: &ModuleCtl, ignore: bool) -> bool {
    if ctl.address() == 0 || ctl.size() == 0 || !ctl.is_loaded() {
        return true;
    }
    if ignore {
        return false;
    }
    let name = ctl.name();
    MODULE_DENYLIST.iter().any(|fragment| name.contains(fragment))
}

/// Name-level check against the process-wide override.
pub fn function_excluded(name: &str) -> bool {
    excluded_by_rules(name, ignore_denylist())
}

/// Name-level rules, evaluated in order; the first match wins.
pub fn excluded_by_rules(name: &str, ignore: bool) -> bool {
    if ignore {
        return false;
    }

    if name.starts_with(TRACER_PREFIX) && !name.starts_with(TRACER_SAFE_PREFIX) {
        return true;
    }

    if in_denylist(CRITICAL_DENYLIST, name) || in_denylist(PROBE_CONTEXT_CLOSURE, name) {
        return true;
    }

    if has_any_prefix(name, COARSE_PREFIXES)
        || has_any_prefix(name, ARCH_PREFIXES)
        || has_any_prefix(name, SANITIZER_PREFIXES)
        || ARCH_EXACT.contains(&name)
    {
        return true;
    }

    name.contains(PANIC_FRAGMENT)
}

/// Exact (whole-string) membership in a sorted denylist.
fn in_denylist(list: &[&str], name: &str) -> bool {
    list.binary_search(&name).is_ok()
}

fn has_any_prefix(name: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p))
}
