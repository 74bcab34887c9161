//! Shared fixtures: a simulated text segment and module builders.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use axfbt::fbt::ops::{AARCH64_RET, FBT_ENTRY_BRK_IMM, FBT_RETURN_BRK_IMM, brk};
use axfbt::{
    Error, FbtConfig, FbtProvider, ModuleCtl, ModuleKind, ModuleSymbol, PatchTarget, PatchVal, SymbolSource,
    TrapHookSlot, TrapVerdict,
};

/// `stp x29, x30, [sp, #-16]!`
pub const PROLOGUE: PatchVal = 0xa9bf_7bfd;
pub const NOP: PatchVal = 0xd503_201f;
pub const RET: PatchVal = AARCH64_RET;

pub const ENTRY_TRAP: PatchVal = brk(FBT_ENTRY_BRK_IMM);
pub const RETURN_TRAP: PatchVal = brk(FBT_RETURN_BRK_IMM);

#[derive(Default)]
struct SimState {
    words: HashMap<usize, PatchVal>,
    faulty: HashSet<usize>,
    writes: usize,
}

/// Instruction memory backed by a map; clones share the same memory.
#[derive(Clone, Default)]
pub struct SimText {
    state: Arc<Mutex<SimState>>,
}

impl SimText {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `words` starting at `base`.
    pub fn load(&self, base: usize, words: &[PatchVal]) {
        let mut state = self.state.lock().unwrap();
        for (i, w) in words.iter().enumerate() {
            state.words.insert(base + i * 4, *w);
        }
    }

    pub fn word(&self, addr: usize) -> PatchVal {
        self.state.lock().unwrap().words[&addr]
    }

    /// Make every write to `addr` fail.
    pub fn fail_writes_at(&self, addr: usize) {
        self.state.lock().unwrap().faulty.insert(addr);
    }

    pub fn writes(&self) -> usize {
        self.state.lock().unwrap().writes
    }
}

impl PatchTarget for SimText {
    fn read(&self, addr: usize) -> Result<PatchVal, Error> {
        self.state
            .lock()
            .unwrap()
            .words
            .get(&addr)
            .copied()
            .ok_or(Error::MemoryReadFault(addr))
    }

    fn install(&mut self, addr: usize, val: PatchVal) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if state.faulty.contains(&addr) || !state.words.contains_key(&addr) {
            return Err(Error::MemoryWriteFault(addr));
        }
        state.words.insert(addr, val);
        state.writes += 1;
        Ok(())
    }
}

/// A slot private to one test.
pub fn leaked_slot() -> &'static TrapHookSlot {
    Box::leak(Box::new(TrapHookSlot::new()))
}

/// Another tracing backend competing for the slot.
pub fn rival_hook(_pc: usize) -> TrapVerdict {
    TrapVerdict::NotOurs
}

pub const TEXT_BASE: usize = 0x4_0000;
pub const TEXT_SIZE: usize = 0x1000;

/// `vfs_read`: prologue, nop, ret, nop, ret. One entry and two return sites.
pub const VFS_READ: usize = TEXT_BASE;
pub const VFS_READ_SIZE: usize = 5 * 4;

/// `cpu_idle`: rejected by the name filter in the kernel core.
pub const CPU_IDLE: usize = TEXT_BASE + 0x100;

/// `tcp_input`: prologue, nop, nop, ret.
pub const TCP_INPUT: usize = TEXT_BASE + 0x200;
pub const TCP_INPUT_SIZE: usize = 4 * 4;

/// Simulated text containing the functions above.
pub fn sample_text() -> SimText {
    let text = SimText::new();
    text.load(VFS_READ, &[PROLOGUE, NOP, RET, NOP, RET]);
    text.load(CPU_IDLE, &[PROLOGUE, RET]);
    text.load(TCP_INPUT, &[PROLOGUE, NOP, NOP, RET]);
    text
}

pub fn sample_symbols() -> Vec<ModuleSymbol> {
    vec![
        ModuleSymbol::new("vfs_read", VFS_READ, VFS_READ_SIZE),
        ModuleSymbol::new("cpu_idle", CPU_IDLE, 8),
        ModuleSymbol::new("tcp_input", TCP_INPUT, TCP_INPUT_SIZE),
    ]
}

/// A loaded module with resident kernel symbols.
pub fn kernel_module(id: u32, name: &str, kind: ModuleKind) -> Arc<ModuleCtl> {
    let ctl = ModuleCtl::new(id, name, TEXT_BASE, TEXT_SIZE, kind).with_symbols(SymbolSource::Kernel(sample_symbols()));
    ctl.mark_loaded();
    Arc::new(ctl)
}

pub fn provider(text: &SimText, slot: &'static TrapHookSlot) -> FbtProvider {
    FbtProvider::new(FbtConfig::default(), Box::new(text.clone()), slot)
}
