//! Provider configuration.

/// Default number of probe table buckets (32k entries).
pub const PROBETAB_SIZE: usize = 0x8000;

/// Where kernel symbols come from, fixed by boot policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KernelSymbolMode {
    /// Kernel symbols are never made available; nothing is provided.
    Never,
    /// Symbols come from the resident kernel tables, kept around.
    #[default]
    FromKernel,
    /// Symbols come from a companion list supplied by the loader.
    FromUserspace,
    /// Symbols come from the kernel tables, which are discarded after the
    /// first provisioning pass.
    AlwaysFromKernel,
}

/// Settings applied when the provider is attached.
#[derive(Debug, Clone)]
pub struct FbtConfig {
    /// Requested bucket count; rounded up to a power of two.
    pub probetab_size: usize,
    /// Boot-time value of the denylist override.
    pub ignore_denylist: bool,
    /// Kernel symbol policy.
    pub symbol_mode: KernelSymbolMode,
    /// Log every skipped probe.
    pub verbose: bool,
}

impl Default for FbtConfig {
    fn default() -> Self {
        Self {
            probetab_size: PROBETAB_SIZE,
            ignore_denylist: false,
            symbol_mode: KernelSymbolMode::default(),
            verbose: false,
        }
    }
}
