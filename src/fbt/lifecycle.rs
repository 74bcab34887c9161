//! Patch lifecycle of a function's probes.
//!
//! Every operation walks one chain (the entry probe and the return probes of
//! a function) and reports what happened in a [`BatchOutcome`]. Stale probes
//! (their module was unloaded or reloaded) are skipped without touching
//! memory. Enable and resume re-claim the trap hook before patching: enable
//! skips a probe it cannot arbitrate for, resume abandons the batch.

extern crate alloc;

use alloc::vec::Vec;

use super::{Error, FbtProvider, is_verbose};
use crate::cache;
use crate::probe::FbtProbe;
use crate::registry::{ChainId, ProbeId};

/// Result of a lifecycle batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Probes whose memory was written.
    pub patched: usize,
    /// Probes left alone (stale module, lost arbitration, write fault).
    pub skipped: usize,
    /// The batch stopped early on lost arbitration.
    pub aborted: bool,
}

/// What a per-probe step did.
enum Step {
    Patched,
    Unchanged,
    Skipped(Error),
}

impl BatchOutcome {
    fn record(&mut self, step: &Step) {
        match step {
            Step::Patched => self.patched += 1,
            Step::Unchanged => {}
            Step::Skipped(_) => self.skipped += 1,
        }
    }
}

fn check_live(probe: &FbtProbe) -> Result<(), Error> {
    if !probe.module.is_loaded() {
        return Err(Error::ModuleUnloaded);
    }
    if probe.module.load_count() != probe.loadcnt {
        return Err(Error::ModuleReloaded);
    }
    Ok(())
}

fn log_skip(op: &str, probe: &FbtProbe, err: &Error) {
    match err {
        Error::MemoryWriteFault(addr) => {
            #[cfg(feature = "symbols")]
            if let Some(location) = crate::symbols::describe(*addr) {
                warn!("fbt: {} {}:{} failed at {}: {}", op, probe.module.name(), probe.name, location, err);
                return;
            }
            warn!(
                "fbt: {} {}:{}:{} failed at {:#x}: {}",
                op,
                probe.module.name(),
                probe.name,
                probe.kind.label(),
                addr,
                err
            );
        }
        _ if is_verbose() => info!(
            "fbt: {} skipped {}:{}:{}: {}",
            op,
            probe.module.name(),
            probe.name,
            probe.kind.label(),
            err
        ),
        _ => {}
    }
}

impl FbtProvider {
    fn members(&self, chain: ChainId) -> Vec<ProbeId> {
        self.registry.chain(chain).map(<[ProbeId]>::to_vec).unwrap_or_default()
    }

    /// Install the trap on every probe of `chain`.
    pub fn enable(&mut self, chain: ChainId) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in self.members(chain) {
            let step = self.enable_one(id);
            outcome.record(&step);
        }
        cache::membar_producer();
        debug!("fbt: enable chain {}: {:?}", chain.index(), outcome);
        outcome
    }

    fn enable_one(&mut self, id: ProbeId) -> Step {
        let Self {
            registry,
            target,
            slot,
            dispatch,
            ..
        } = self;
        let Some(probe) = registry.get_mut(id) else {
            return Step::Unchanged;
        };

        if let Err(e) = check_live(probe) {
            log_skip("enable", probe, &e);
            return Step::Skipped(e);
        }
        if let Err(e) = slot.claim(*dispatch) {
            let e = Error::from(e);
            log_skip("enable", probe, &e);
            return Step::Skipped(e);
        }
        if probe.currentval == probe.patchval {
            return Step::Unchanged;
        }

        match target.install(probe.patchpoint, probe.patchval) {
            Ok(()) => {
                probe.currentval = probe.patchval;
                probe.module.inc_enabled();
                Step::Patched
            }
            Err(e) => {
                log_skip("enable", probe, &e);
                Step::Skipped(e)
            }
        }
    }

    /// Restore the original instruction on every probe of `chain`.
    pub fn disable(&mut self, chain: ChainId) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in self.members(chain) {
            let step = self.disable_one(id);
            outcome.record(&step);
        }
        cache::membar_producer();
        debug!("fbt: disable chain {}: {:?}", chain.index(), outcome);
        outcome
    }

    fn disable_one(&mut self, id: ProbeId) -> Step {
        let Self {
            registry, target, ..
        } = self;
        let Some(probe) = registry.get_mut(id) else {
            return Step::Unchanged;
        };

        if let Err(e) = check_live(probe) {
            log_skip("disable", probe, &e);
            return Step::Skipped(e);
        }
        if probe.currentval == probe.savedval {
            return Step::Unchanged;
        }

        match target.install(probe.patchpoint, probe.savedval) {
            Ok(()) => {
                probe.currentval = probe.savedval;
                probe.module.dec_enabled();
                Step::Patched
            }
            Err(e) => {
                log_skip("disable", probe, &e);
                Step::Skipped(e)
            }
        }
    }

    /// Temporarily restore the original instruction on every probe of
    /// `chain`. The module's enabled count is not touched.
    pub fn suspend(&mut self, chain: ChainId) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in self.members(chain) {
            let step = self.suspend_one(id);
            outcome.record(&step);
        }
        cache::membar_producer();
        debug!("fbt: suspend chain {}: {:?}", chain.index(), outcome);
        outcome
    }

    fn suspend_one(&mut self, id: ProbeId) -> Step {
        let Self {
            registry, target, ..
        } = self;
        let Some(probe) = registry.get_mut(id) else {
            return Step::Unchanged;
        };

        if let Err(e) = check_live(probe) {
            log_skip("suspend", probe, &e);
            return Step::Skipped(e);
        }

        // Written even when already saved.
        match target.install(probe.patchpoint, probe.savedval) {
            Ok(()) => {
                probe.currentval = probe.savedval;
                Step::Patched
            }
            Err(e) => {
                log_skip("suspend", probe, &e);
                Step::Skipped(e)
            }
        }
    }

    /// Re-install the trap on every probe of `chain` after [`suspend`].
    ///
    /// Losing arbitration stops the whole batch; the remaining probes stay
    /// suspended and `aborted` is set.
    ///
    /// [`suspend`]: Self::suspend
    pub fn resume(&mut self, chain: ChainId) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        for id in self.members(chain) {
            let step = self.resume_one(id);
            if matches!(step, Step::Skipped(Error::ArbitrationLost)) {
                outcome.aborted = true;
                break;
            }
            outcome.record(&step);
        }
        cache::membar_producer();
        debug!("fbt: resume chain {}: {:?}", chain.index(), outcome);
        outcome
    }

    fn resume_one(&mut self, id: ProbeId) -> Step {
        let Self {
            registry,
            target,
            slot,
            dispatch,
            ..
        } = self;
        let Some(probe) = registry.get_mut(id) else {
            return Step::Unchanged;
        };

        if let Err(e) = check_live(probe) {
            log_skip("resume", probe, &e);
            return Step::Skipped(e);
        }
        if let Err(e) = slot.claim(*dispatch) {
            let e = Error::from(e);
            log_skip("resume", probe, &e);
            return Step::Skipped(e);
        }

        match target.install(probe.patchpoint, probe.patchval) {
            Ok(()) => {
                probe.currentval = probe.patchval;
                Step::Patched
            }
            Err(e) => {
                log_skip("resume", probe, &e);
                Step::Skipped(e)
            }
        }
    }

    /// Remove every probe of `chain` from the provider.
    ///
    /// The tracing framework disables a probe before destroying it; a probe
    /// that is still patched is removed anyway and reported.
    pub fn destroy(&mut self, chain: ChainId) -> usize {
        if let Some(members) = self.registry.chain(chain) {
            for id in members {
                if let Some(probe) = self.registry.get(*id).filter(|p| p.is_patched()) {
                    warn!(
                        "fbt: destroying patched probe {}:{} at {:#x}",
                        probe.module.name(),
                        probe.name,
                        probe.patchpoint
                    );
                }
            }
        }

        self.functions.retain(|_, c| *c != chain);
        let removed = self.registry.remove_all(chain);
        debug!("fbt: destroyed chain {} ({} probes)", chain.index(), removed);
        removed
    }
}
