//! fbt provider service.
//!
//! [`FbtProvider`] owns the probe registry, the function index and the patch
//! target, and holds a reference to the host's trap hook slot. It is created
//! at attach and dropped at detach; nothing in it is ambient global state.
//!
//! The host reaches the attached instance through the module-level
//! functions below. The trap entry point ([`super::handler::fbt_trap_hook`])
//! needs it too, since a hook is a plain function pointer.

extern crate alloc;

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::RwLock;

use super::handler::fbt_trap_hook;
use super::lifecycle::BatchOutcome;
use super::{Error, PatchTarget};
use crate::config::FbtConfig;
use crate::module::ModuleCtl;
use crate::probe::{PatchVal, SiteKind};
use crate::registry::{ChainId, ProbeId, ProbeRegistry};
use crate::trap_hook::{HOST_TRAP_HOOK, TrapHookFn, TrapHookSlot};

/// Function index key: (module id, function name).
type FunctionKey = (u32, String);

/// Snapshot of one probe for listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub id: ProbeId,
    pub chain: ChainId,
    pub module: String,
    pub function: String,
    pub kind: SiteKind,
    pub patchpoint: usize,
    pub savedval: PatchVal,
    pub patchval: PatchVal,
    pub currentval: PatchVal,
    pub hits: u64,
}

impl ProbeInfo {
    pub fn is_patched(&self) -> bool {
        self.currentval == self.patchval
    }
}

/// The process-wide provider instance.
pub(super) static FBT: RwLock<Option<FbtProvider>> = RwLock::new(None);

/// Function boundary tracing provider.
pub struct FbtProvider {
    pub(super) config: FbtConfig,
    pub(super) registry: ProbeRegistry,
    pub(super) functions: HashMap<FunctionKey, ChainId>,
    pub(super) target: Box<dyn PatchTarget>,
    pub(super) slot: &'static TrapHookSlot,
    pub(super) dispatch: TrapHookFn,
}

impl FbtProvider {
    /// Create a provider that claims `slot` with [`fbt_trap_hook`].
    ///
    /// `config.verbose` turns verbose logging on for the whole process; only
    /// [`attach`] turns it back off.
    pub fn new(config: FbtConfig, target: Box<dyn PatchTarget>, slot: &'static TrapHookSlot) -> Self {
        if config.verbose {
            super::set_verbose(true);
        }
        let registry = ProbeRegistry::new(config.probetab_size);
        debug!(
            "fbt: probe table with {} buckets ({} requested)",
            registry.capacity(),
            config.probetab_size
        );
        Self {
            config,
            registry,
            functions: HashMap::new(),
            target,
            slot,
            dispatch: fbt_trap_hook,
        }
    }

    /// Use a different dispatch entry point when claiming the slot.
    pub fn with_dispatch(mut self, dispatch: TrapHookFn) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn config(&self) -> &FbtConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProbeRegistry {
        &self.registry
    }

    /// Chain of a provided function.
    pub fn lookup_function(&self, module_id: u32, name: &str) -> Option<ChainId> {
        self.functions.get(&(module_id, String::from(name))).copied()
    }

    /// Probe whose patch point is `addr`.
    pub fn lookup(&self, addr: usize) -> Option<ProbeId> {
        self.registry.lookup(addr)
    }

    pub fn probe_info(&self, id: ProbeId) -> Option<ProbeInfo> {
        let chain = self.registry.chain_of(id)?;
        self.info_in_chain(chain, id)
    }

    /// Probes of one function, entry first.
    pub fn chain_info(&self, chain: ChainId) -> Vec<ProbeInfo> {
        self.registry
            .chain(chain)
            .unwrap_or_default()
            .iter()
            .filter_map(|id| self.info_in_chain(chain, *id))
            .collect()
    }

    /// Every probe the provider knows about.
    pub fn list_all(&self) -> Vec<ProbeInfo> {
        let mut out = Vec::with_capacity(self.registry.len());
        for (chain, members) in self.registry.chains() {
            out.extend(members.iter().filter_map(|id| self.info_in_chain(chain, *id)));
        }
        out
    }

    fn info_in_chain(&self, chain: ChainId, id: ProbeId) -> Option<ProbeInfo> {
        let probe = self.registry.get(id)?;
        Some(ProbeInfo {
            id,
            chain,
            module: String::from(probe.module().name()),
            function: String::from(probe.name()),
            kind: probe.kind(),
            patchpoint: probe.patchpoint(),
            savedval: probe.savedval(),
            patchval: probe.patchval(),
            currentval: probe.currentval(),
            hits: probe.hits(),
        })
    }
}

impl Drop for FbtProvider {
    fn drop(&mut self) {
        let patched = self
            .registry
            .chains()
            .flat_map(|(_, members)| members.iter())
            .filter(|id| self.registry.get(**id).is_some_and(|p| p.is_patched()))
            .count();
        if patched > 0 {
            warn!("fbt: provider dropped with {} probes still patched", patched);
        }
    }
}

// === Module-level convenience functions ===

/// Attach the process-wide provider, routed through the host trap hook.
pub fn attach(config: FbtConfig, target: Box<dyn PatchTarget>) -> Result<(), Error> {
    let mut fbt = FBT.write();
    if fbt.is_some() {
        return Err(Error::AlreadyAttached);
    }

    crate::exclusion::init_ignore_denylist(config.ignore_denylist);
    super::set_verbose(config.verbose);

    *fbt = Some(FbtProvider::new(config, target, &HOST_TRAP_HOOK));
    info!("fbt: provider attached");
    Ok(())
}

/// Detach the process-wide provider, releasing every probe.
///
/// The tracing framework must have disabled every probe before this.
pub fn detach() -> Result<(), Error> {
    let provider = FBT.write().take().ok_or(Error::NotAttached)?;
    let probes = provider.registry.len();
    drop(provider);
    info!("fbt: provider detached ({} probes released)", probes);
    Ok(())
}

pub fn is_attached() -> bool {
    FBT.read().is_some()
}

/// Run `f` on the attached provider.
pub fn with_provider<R>(f: impl FnOnce(&mut FbtProvider) -> R) -> Result<R, Error> {
    let mut fbt = FBT.write();
    let provider = fbt.as_mut().ok_or(Error::NotAttached)?;
    Ok(f(provider))
}

/// Provide probes for a newly loaded module.
pub fn provide_module(ctl: &Arc<ModuleCtl>) -> Result<usize, Error> {
    with_provider(|p| p.provide_module(ctl))
}

pub fn enable(chain: ChainId) -> Result<BatchOutcome, Error> {
    with_provider(|p| p.enable(chain))
}

pub fn disable(chain: ChainId) -> Result<BatchOutcome, Error> {
    with_provider(|p| p.disable(chain))
}

pub fn suspend(chain: ChainId) -> Result<BatchOutcome, Error> {
    with_provider(|p| p.suspend(chain))
}

pub fn resume(chain: ChainId) -> Result<BatchOutcome, Error> {
    with_provider(|p| p.resume(chain))
}

pub fn destroy(chain: ChainId) -> Result<usize, Error> {
    with_provider(|p| p.destroy(chain))
}

pub fn lookup_function(module_id: u32, name: &str) -> Option<ChainId> {
    FBT.read().as_ref()?.lookup_function(module_id, name)
}

/// List all probes for shell command.
pub fn list_all() -> Vec<ProbeInfo> {
    match FBT.read().as_ref() {
        Some(p) => p.list_all(),
        None => Vec::new(),
    }
}
