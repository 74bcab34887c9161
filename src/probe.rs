//! fbt probe records.

extern crate alloc;

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::module::ModuleCtl;

/// One instruction word, as read from or written to a patch point.
pub type PatchVal = u32;

/// Size of a patch value in bytes.
pub const PATCHVAL_SIZE: usize = core::mem::size_of::<PatchVal>();

/// Where in its function a probe sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiteKind {
    /// First instruction of the function.
    Entry,
    /// A return instruction, `offset` bytes into the function.
    Return { offset: usize },
}

impl SiteKind {
    pub fn is_return(&self) -> bool {
        matches!(self, SiteKind::Return { .. })
    }

    /// Probe name component, as the tracing framework shows it.
    pub fn label(&self) -> &'static str {
        match self {
            SiteKind::Entry => "entry",
            SiteKind::Return { .. } => "return",
        }
    }
}

/// Runtime record for one instrumentation point.
pub struct FbtProbe {
    pub(crate) module: Arc<ModuleCtl>,
    pub(crate) name: String,
    pub(crate) kind: SiteKind,
    pub(crate) patchpoint: usize,
    /// Original instruction at the patch point.
    pub(crate) savedval: PatchVal,
    /// Trap encoding to install.
    pub(crate) patchval: PatchVal,
    /// What is installed right now.
    pub(crate) currentval: PatchVal,
    /// Module load generation at creation time.
    pub(crate) loadcnt: u32,
    pub(crate) hits: AtomicU64,
}

impl FbtProbe {
    pub fn new(
        module: Arc<ModuleCtl>,
        name: &str,
        kind: SiteKind,
        patchpoint: usize,
        savedval: PatchVal,
        patchval: PatchVal,
    ) -> Self {
        let loadcnt = module.load_count();
        Self {
            module,
            name: String::from(name),
            kind,
            patchpoint,
            savedval,
            patchval,
            currentval: savedval,
            loadcnt,
            hits: AtomicU64::new(0),
        }
    }

    pub fn module(&self) -> &Arc<ModuleCtl> {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> SiteKind {
        self.kind
    }

    pub fn patchpoint(&self) -> usize {
        self.patchpoint
    }

    pub fn savedval(&self) -> PatchVal {
        self.savedval
    }

    pub fn patchval(&self) -> PatchVal {
        self.patchval
    }

    pub fn currentval(&self) -> PatchVal {
        self.currentval
    }

    pub fn loadcnt(&self) -> u32 {
        self.loadcnt
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub(crate) fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// The trap encoding is what is installed.
    pub fn is_patched(&self) -> bool {
        self.currentval == self.patchval
    }

    /// The module was unloaded, or unloaded and loaded again, since this
    /// probe was created. Such a probe must not touch memory.
    pub fn is_stale(&self) -> bool {
        !self.module.is_loaded() || self.module.load_count() != self.loadcnt
    }
}

impl core::fmt::Debug for FbtProbe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FbtProbe")
            .field("module", &self.module.name())
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("patchpoint", &format_args!("{:#x}", self.patchpoint))
            .field("savedval", &format_args!("{:#010x}", self.savedval))
            .field("patchval", &format_args!("{:#010x}", self.patchval))
            .field("currentval", &format_args!("{:#010x}", self.currentval))
            .field("loadcnt", &self.loadcnt)
            .finish()
    }
}
