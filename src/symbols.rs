//! Resident kernel symbol table.
//!
//! Resolves kernel function names to their address and size so a single
//! function can be provided on demand, and symbolizes trap PCs for logs.

use alloc::string::String;
use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};
use ksym::KallsymsMapped;

use crate::module::ModuleSymbol;

static INITIALIZED: AtomicBool = AtomicBool::new(false);

struct KernelSymbolTable(UnsafeCell<Option<KallsymsMapped<'static>>>);
// Written once by `init` before any reader can observe `INITIALIZED`.
unsafe impl Sync for KernelSymbolTable {}
static SYMBOL_TABLE: KernelSymbolTable = KernelSymbolTable(UnsafeCell::new(None));

const KSYM_NAME_LEN: usize = 1024;

/// Error types for symbol operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Symbol table has already been initialized.
    AlreadyInitialized,
    /// Failed to parse the symbol table blob.
    ParseError(&'static str),
    /// Symbol table has not been initialized yet.
    NotInitialized,
    /// No function with that name.
    NotFound,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::AlreadyInitialized => write!(f, "symbol table already initialized"),
            Self::ParseError(e) => write!(f, "failed to parse symbol table: {}", e),
            Self::NotInitialized => write!(f, "symbol table not initialized"),
            Self::NotFound => write!(f, "symbol not found"),
        }
    }
}

impl core::error::Error for Error {}

/// Load the kernel symbol table from a kallsyms blob covering
/// `[stext, etext)`.
///
/// The blob must stay mapped for the lifetime of the kernel.
pub fn init(data: &'static [u8], stext: u64, etext: u64) -> Result<(), Error> {
    if INITIALIZED.load(Ordering::Acquire) {
        return Err(Error::AlreadyInitialized);
    }

    let table = KallsymsMapped::from_blob(data, stext, etext).map_err(Error::ParseError)?;

    unsafe {
        *SYMBOL_TABLE.0.get() = Some(table);
    }
    INITIALIZED.store(true, Ordering::Release);
    Ok(())
}

pub fn is_initialized() -> bool {
    INITIALIZED.load(Ordering::Acquire)
}

fn table() -> Result<&'static KallsymsMapped<'static>, Error> {
    if !is_initialized() {
        return Err(Error::NotInitialized);
    }
    // SAFETY: set once in `init` before `INITIALIZED` is published.
    unsafe { (*SYMBOL_TABLE.0.get()).as_ref() }.ok_or(Error::NotInitialized)
}

/// Address and size of the kernel function `name`.
pub fn resolve(name: &str) -> Result<ModuleSymbol, Error> {
    let table = table()?;
    let addr = table.lookup_name(name).ok_or(Error::NotFound)?;

    let mut name_buf = [0u8; KSYM_NAME_LEN];
    let (found, size, offset, _ty) = table
        .lookup_address(addr, &mut name_buf)
        .ok_or(Error::NotFound)?;
    if offset != 0 || found != name {
        warn!("fbt: {} resolved to {}+{:#x}", name, found, offset);
        return Err(Error::NotFound);
    }

    Ok(ModuleSymbol::new(name, addr as usize, size as usize))
}

/// `function+offset` for a kernel text address, for log messages.
pub fn describe(addr: usize) -> Option<String> {
    let table = table().ok()?;
    let mut name_buf = [0u8; KSYM_NAME_LEN];
    let (name, _size, offset, _ty) = table.lookup_address(addr as u64, &mut name_buf)?;
    Some(alloc::format!("{}+{:#x}", name, offset))
}
