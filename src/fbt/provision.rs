//! Probe provisioning for loaded modules.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;

use super::FbtProvider;
use crate::config::KernelSymbolMode;
use crate::exclusion;
use crate::module::{ModFlags, ModuleCtl};
use crate::probe::{FbtProbe, PATCHVAL_SIZE, PatchVal, SiteKind};

impl FbtProvider {
    /// Create probes for every eligible function of `ctl`.
    ///
    /// Called by the host with its module lock held, once per load and again
    /// whenever the tracing framework asks for probes. Returns the number of
    /// probes created.
    pub fn provide_module(&mut self, ctl: &Arc<ModuleCtl>) -> usize {
        if self.config.symbol_mode == KernelSymbolMode::Never {
            return 0;
        }

        if exclusion::ignore_denylist() {
            ctl.insert_flags(ModFlags::FBT_PROVIDE_DENYLISTED_PROBES);
        }

        if ctl.fbt_done() {
            return 0;
        }

        if exclusion::module_excluded(ctl) {
            debug!("fbt: module {} excluded", ctl.name());
            ctl.insert_flags(ModFlags::FBT_INVALID);
            return 0;
        }

        let provided = if ctl.has_kernel_symbols() {
            let n = self.provide_kernel_syms(ctl);
            if self.config.symbol_mode == KernelSymbolMode::AlwaysFromKernel {
                ctl.discard_symbols();
            }
            n
        } else if ctl.has_user_symbols() {
            self.provide_user_syms(ctl)
        } else {
            return 0;
        };

        let mut flags = ModFlags::FBT_PROBES_PROVIDED;
        if ctl.flags().contains(ModFlags::FBT_PROVIDE_DENYLISTED_PROBES) {
            flags |= ModFlags::FBT_DENYLISTED_PROBES_PROVIDED;
        }
        ctl.insert_flags(flags);

        info!("fbt: provided {} probes for module {}", provided, ctl.name());
        provided
    }

    fn provide_kernel_syms(&mut self, ctl: &Arc<ModuleCtl>) -> usize {
        let Some(symbols) = ctl.kernel_symbols() else {
            return 0;
        };

        symbols
            .iter()
            .filter(|sym| !exclusion::function_excluded(&sym.name))
            .map(|sym| self.provide_function(ctl, &sym.name, sym.addr, sym.size))
            .sum()
    }

    fn provide_user_syms(&mut self, ctl: &Arc<ModuleCtl>) -> usize {
        let Some(symbols) = ctl.take_user_symbols() else {
            return 0;
        };

        let mut provided = 0;
        for sym in &symbols {
            let name = sym.name.strip_prefix('_').unwrap_or(&sym.name);
            // Only the kernel core is filtered by name.
            if ctl.is_kernel() && exclusion::function_excluded(name) {
                continue;
            }
            if sym.addr == 0 {
                continue;
            }
            provided += self.provide_function(ctl, name, sym.addr, sym.size);
        }
        provided
    }

    /// Create the entry probe and one return probe per return instruction
    /// for the function `name` at `[addr, addr + size)`.
    ///
    /// A function that already has probes, lies outside the module, or whose
    /// entry cannot be read is skipped, and so is one whose entry is already a
    /// patch point of another function. Return sites that already carry a
    /// probe are left to their owner.
    pub fn provide_function(&mut self, ctl: &Arc<ModuleCtl>, name: &str, addr: usize, size: usize) -> usize {
        let key = (ctl.id(), String::from(name));
        if self.functions.contains_key(&key) {
            return 0;
        }

        if !ctl.contains(addr) || size < PATCHVAL_SIZE {
            trace!("fbt: {}:{} at {:#x} not in module text", ctl.name(), name, addr);
            return 0;
        }

        // An alias of a provided function shares its patch points.
        if self.registry.lookup(addr).is_some() {
            debug!("fbt: {}:{} at {:#x} already probed", ctl.name(), name, addr);
            return 0;
        }

        let entry = match self.target.read(addr) {
            Ok(insn) => insn,
            Err(e) => {
                warn!("fbt: cannot read entry of {}:{}: {}", ctl.name(), name, e);
                return 0;
            }
        };
        if self.is_trap(entry) {
            warn!("fbt: {}:{} entry already holds a trap", ctl.name(), name);
            return 0;
        }

        let chain = self.registry.new_chain();
        let patchval = self.target.trap_encoding(SiteKind::Entry);
        let probe = FbtProbe::new(ctl.clone(), name, SiteKind::Entry, addr, entry, patchval);
        if self.registry.insert(chain, probe).is_none() {
            return 0;
        }
        let mut provided = 1;

        let end = addr.saturating_add(size);
        let mut offset = PATCHVAL_SIZE;
        while addr + offset + PATCHVAL_SIZE <= end {
            let site = addr + offset;
            if !ctl.contains(site) {
                break;
            }
            if self.registry.lookup(site).is_some() {
                offset += PATCHVAL_SIZE;
                continue;
            }
            match self.target.read(site) {
                Ok(insn) if self.target.is_return(insn) && !self.is_trap(insn) => {
                    let kind = SiteKind::Return { offset };
                    let patchval = self.target.trap_encoding(kind);
                    let probe = FbtProbe::new(ctl.clone(), name, kind, site, insn, patchval);
                    if self.registry.insert(chain, probe).is_some() {
                        provided += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("fbt: scan of {}:{} stopped at {:#x}: {}", ctl.name(), name, site, e);
                    break;
                }
            }
            offset += PATCHVAL_SIZE;
        }

        self.functions.insert(key, chain);
        trace!("fbt: {}:{} -> {} probes", ctl.name(), name, provided);
        provided
    }

    /// `insn` is one of our own trap encodings.
    fn is_trap(&self, insn: PatchVal) -> bool {
        insn == self.target.trap_encoding(SiteKind::Entry)
            || insn == self.target.trap_encoding(SiteKind::Return { offset: 0 })
    }

    /// Provide a single kernel function by name, resolved through the
    /// resident kernel symbol table.
    #[cfg(feature = "symbols")]
    pub fn provide_kernel_function(&mut self, ctl: &Arc<ModuleCtl>, name: &str) -> Result<usize, super::Error> {
        let sym = crate::symbols::resolve(name).map_err(|_| super::Error::SymbolNotFound)?;
        if exclusion::function_excluded(&sym.name) {
            debug!("fbt: {} is excluded", sym.name);
            return Ok(0);
        }
        Ok(self.provide_function(ctl, &sym.name, sym.addr, sym.size))
    }
}
