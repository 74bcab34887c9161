//! fbt trap handler.
//!
//! Routes a trapping PC to its probe and tells the host which displaced
//! instruction to emulate. Runs in exception context: no allocation and no
//! blocking.

use spin::RwLock;

use super::FbtProvider;
use super::manager::FBT;
use crate::probe::SiteKind;
use crate::registry::ProbeId;
use crate::trap_hook::TrapVerdict;

/// A probe fired.
#[derive(Debug, Clone, Copy)]
pub struct FireEvent<'a> {
    pub id: ProbeId,
    pub module_id: u32,
    pub function: &'a str,
    pub kind: SiteKind,
    pub pc: usize,
}

/// Tracing framework callback invoked on every hit.
pub type FireFn = fn(&FireEvent<'_>);

static FIRE_HOOK: RwLock<Option<FireFn>> = RwLock::new(None);

/// Register the callback that receives probe hits.
pub fn register_fire_hook(hook: FireFn) {
    *FIRE_HOOK.write() = Some(hook);
}

fn emit_fire(event: &FireEvent<'_>) {
    // A hook being replaced right now misses this hit.
    if let Some(guard) = FIRE_HOOK.try_read() {
        if let Some(hook) = *guard {
            hook(event);
        }
    }
}

impl FbtProvider {
    /// Handle a trap at `pc`.
    pub fn handle_trap(&self, pc: usize) -> TrapVerdict {
        let Some(id) = self.registry.lookup(pc) else {
            return TrapVerdict::NotOurs;
        };
        let Some(probe) = self.registry.get(id) else {
            return TrapVerdict::NotOurs;
        };

        // Unpatched after the trap was taken; the original instruction is
        // back in place.
        if !probe.is_patched() {
            return TrapVerdict::Retry;
        }

        probe.record_hit();
        emit_fire(&FireEvent {
            id,
            module_id: probe.module.id(),
            function: probe.name(),
            kind: probe.kind(),
            pc,
        });

        log::trace!(
            "fbt: hit {}:{}:{} pc={:#x}",
            probe.module.name(),
            probe.name(),
            probe.kind().label(),
            pc
        );

        TrapVerdict::Handled {
            emulate: probe.savedval(),
            is_return: probe.kind().is_return(),
        }
    }
}

/// Dispatch entry point claimed in the trap hook slot.
pub fn fbt_trap_hook(pc: usize) -> TrapVerdict {
    match FBT.try_read() {
        Some(guard) => match guard.as_ref() {
            Some(provider) => provider.handle_trap(pc),
            None => TrapVerdict::NotOurs,
        },
        // Lifecycle call in progress on another core.
        None => TrapVerdict::Retry,
    }
}
