//! Module descriptors shared between the host kernel and the provider.
//!
//! The host owns the module table and drives load/unload; the provider keeps
//! an `Arc<ModuleCtl>` in every probe so it can tell when the code it patched
//! has gone away or been replaced.

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

bitflags::bitflags! {
    /// Per-module fbt bookkeeping.
    pub struct ModFlags: u32 {
        /// Module failed the module-level filter; never provide again.
        const FBT_INVALID = 1 << 0;
        /// Probes have been provided for this module.
        const FBT_PROBES_PROVIDED = 1 << 1;
        /// The denylist override was on when provisioning was requested.
        const FBT_PROVIDE_DENYLISTED_PROBES = 1 << 2;
        /// Denylisted functions have been provided as well.
        const FBT_DENYLISTED_PROBES_PROVIDED = 1 << 3;
    }
}

/// Kind of loadable code unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// The kernel image itself.
    Kernel,
    /// A loadable driver.
    Driver,
}

/// One exported function of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSymbol {
    pub name: String,
    pub addr: usize,
    pub size: usize,
}

impl ModuleSymbol {
    pub fn new(name: &str, addr: usize, size: usize) -> Self {
        Self {
            name: String::from(name),
            addr,
            size,
        }
    }
}

/// Where a module's function list comes from.
#[derive(Debug, Clone, Default)]
pub enum SymbolSource {
    /// No symbols available (yet).
    #[default]
    None,
    /// Resident kernel symbol table.
    Kernel(Vec<ModuleSymbol>),
    /// One-time companion list handed over by the user-space loader.
    /// Addresses are already slid.
    User(Vec<ModuleSymbol>),
}

/// Descriptor of a loaded (or once-loaded) module.
pub struct ModuleCtl {
    id: u32,
    name: String,
    address: usize,
    size: usize,
    kind: ModuleKind,
    loaded: AtomicBool,
    load_count: AtomicU32,
    nenabled: AtomicU32,
    flags: AtomicU32,
    symbols: Mutex<SymbolSource>,
}

impl ModuleCtl {
    /// Create a descriptor. The module starts out not loaded.
    pub fn new(id: u32, name: &str, address: usize, size: usize, kind: ModuleKind) -> Self {
        Self {
            id,
            name: String::from(name),
            address,
            size,
            kind,
            loaded: AtomicBool::new(false),
            load_count: AtomicU32::new(0),
            nenabled: AtomicU32::new(0),
            flags: AtomicU32::new(0),
            symbols: Mutex::new(SymbolSource::None),
        }
    }

    pub fn with_symbols(self, source: SymbolSource) -> Self {
        *self.symbols.lock() = source;
        self
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> usize {
        self.address
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn kind(&self) -> ModuleKind {
        self.kind
    }

    pub fn is_kernel(&self) -> bool {
        self.kind == ModuleKind::Kernel
    }

    /// Whether `addr` lies inside the module's text.
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.address && addr - self.address < self.size
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Current load generation. Bumped on every load and every unload.
    pub fn load_count(&self) -> u32 {
        self.load_count.load(Ordering::Acquire)
    }

    /// Called by the host once the module's text is mapped.
    pub fn mark_loaded(&self) {
        self.load_count.fetch_add(1, Ordering::AcqRel);
        self.loaded.store(true, Ordering::Release);
        debug!("fbt: module {} loaded (loadcnt={})", self.name, self.load_count());
    }

    /// Called by the host before the module's text is unmapped.
    pub fn mark_unloaded(&self) {
        self.loaded.store(false, Ordering::Release);
        self.load_count.fetch_add(1, Ordering::AcqRel);
        debug!("fbt: module {} unloaded (loadcnt={})", self.name, self.load_count());
    }

    /// Number of currently enabled probes in this module.
    pub fn nenabled(&self) -> u32 {
        self.nenabled.load(Ordering::Acquire)
    }

    pub(crate) fn inc_enabled(&self) {
        self.nenabled.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_enabled(&self) {
        let prev = self
            .nenabled
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if prev.is_err() {
            warn!("fbt: enabled count underflow in module {}", self.name);
        }
    }

    pub fn flags(&self) -> ModFlags {
        ModFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn insert_flags(&self, flags: ModFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Whether provisioning has nothing left to do for this module.
    pub fn fbt_done(&self) -> bool {
        let flags = self.flags();
        if flags.contains(ModFlags::FBT_INVALID) {
            return true;
        }
        flags.contains(ModFlags::FBT_PROBES_PROVIDED)
            && (!flags.contains(ModFlags::FBT_PROVIDE_DENYLISTED_PROBES)
                || flags.contains(ModFlags::FBT_DENYLISTED_PROBES_PROVIDED))
    }

    /// Hand over a companion symbol list from the loader.
    pub fn set_user_symbols(&self, symbols: Vec<ModuleSymbol>) {
        *self.symbols.lock() = SymbolSource::User(symbols);
    }

    pub fn has_kernel_symbols(&self) -> bool {
        matches!(*self.symbols.lock(), SymbolSource::Kernel(_))
    }

    pub fn has_user_symbols(&self) -> bool {
        matches!(*self.symbols.lock(), SymbolSource::User(_))
    }

    /// Copy of the resident kernel symbols, if any.
    pub fn kernel_symbols(&self) -> Option<Vec<ModuleSymbol>> {
        match &*self.symbols.lock() {
            SymbolSource::Kernel(list) => Some(list.clone()),
            _ => None,
        }
    }

    /// Take the companion list; it can be consumed only once.
    pub fn take_user_symbols(&self) -> Option<Vec<ModuleSymbol>> {
        let mut source = self.symbols.lock();
        match core::mem::take(&mut *source) {
            SymbolSource::User(list) => Some(list),
            other => {
                *source = other;
                None
            }
        }
    }

    /// Drop whatever symbols are still held.
    pub fn discard_symbols(&self) {
        *self.symbols.lock() = SymbolSource::None;
    }
}

impl core::fmt::Debug for ModuleCtl {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ModuleCtl")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("loaded", &self.is_loaded())
            .field("load_count", &self.load_count())
            .field("nenabled", &self.nenabled())
            .finish()
    }
}
