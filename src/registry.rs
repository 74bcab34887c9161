//! Probe registry: patch-point address → probe.
//!
//! Probes live in an arena and are referred to by [`ProbeId`]. The bucket
//! table maps an address to the handles hashed there; a chain
//! ([`ChainId`]) groups the entry and return probes of one function so they
//! can be enabled and torn down together.
//!
//! `lookup` runs from trap context: it only walks existing vectors and never
//! allocates or takes a lock.

use alloc::vec::Vec;

use crate::probe::FbtProbe;

/// Low address bits ignored by the bucket hash.
pub const PROBETAB_SHIFT: u32 = 4;

/// Handle to a probe in the registry arena.
///
/// Carries the slot generation, so a handle kept past `remove_all` never
/// resolves to whatever probe reuses the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId {
    idx: usize,
    generation: u32,
}

impl ProbeId {
    pub fn index(&self) -> usize {
        self.idx
    }
}

/// Handle to a function's probe chain, generation-checked like [`ProbeId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChainId {
    idx: usize,
    generation: u32,
}

impl ChainId {
    pub fn index(&self) -> usize {
        self.idx
    }
}

struct ProbeSlot {
    generation: u32,
    probe: Option<FbtProbe>,
    /// Chain owning the probe while it is live.
    owner: Option<ChainId>,
}

struct ChainSlot {
    generation: u32,
    members: Option<Vec<ProbeId>>,
}

/// Address-indexed probe table.
pub struct ProbeRegistry {
    probes: Vec<ProbeSlot>,
    free_probes: Vec<usize>,
    /// Each bucket is ordered oldest first; the head is the last element.
    buckets: Vec<Vec<ProbeId>>,
    mask: usize,
    chains: Vec<ChainSlot>,
    free_chains: Vec<usize>,
    len: usize,
}

impl ProbeRegistry {
    /// Create a registry with `size` buckets, rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(1).next_power_of_two();
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, Vec::new);
        Self {
            probes: Vec::new(),
            free_probes: Vec::new(),
            buckets,
            mask: size - 1,
            chains: Vec::new(),
            free_chains: Vec::new(),
            len: 0,
        }
    }

    /// Number of buckets.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    /// Number of live probes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn bucket_index(&self, addr: usize) -> usize {
        (addr >> PROBETAB_SHIFT) & self.mask
    }

    /// Start an empty chain for a new function.
    pub fn new_chain(&mut self) -> ChainId {
        match self.free_chains.pop() {
            Some(idx) => {
                let slot = &mut self.chains[idx];
                slot.members = Some(Vec::new());
                ChainId { idx, generation: slot.generation }
            }
            None => {
                self.chains.push(ChainSlot {
                    generation: 0,
                    members: Some(Vec::new()),
                });
                ChainId {
                    idx: self.chains.len() - 1,
                    generation: 0,
                }
            }
        }
    }

    fn chain_slot_mut(&mut self, chain: ChainId) -> Option<&mut Vec<ProbeId>> {
        let slot = self.chains.get_mut(chain.idx)?;
        if slot.generation != chain.generation {
            return None;
        }
        slot.members.as_mut()
    }

    /// Insert `probe` at the head of its bucket and append it to `chain`.
    ///
    /// Returns `None` if `chain` does not exist.
    pub fn insert(&mut self, chain: ChainId, probe: FbtProbe) -> Option<ProbeId> {
        self.chain_slot_mut(chain)?;

        let bucket = self.bucket_index(probe.patchpoint());
        let id = match self.free_probes.pop() {
            Some(idx) => {
                let slot = &mut self.probes[idx];
                slot.probe = Some(probe);
                slot.owner = Some(chain);
                ProbeId { idx, generation: slot.generation }
            }
            None => {
                self.probes.push(ProbeSlot {
                    generation: 0,
                    probe: Some(probe),
                    owner: Some(chain),
                });
                ProbeId {
                    idx: self.probes.len() - 1,
                    generation: 0,
                }
            }
        };

        self.buckets[bucket].push(id);
        if let Some(members) = self.chain_slot_mut(chain) {
            members.push(id);
        }
        self.len += 1;
        Some(id)
    }

    /// Find the probe whose patch point is exactly `addr`.
    pub fn lookup(&self, addr: usize) -> Option<ProbeId> {
        self.buckets[self.bucket_index(addr)]
            .iter()
            .rev()
            .copied()
            .find(|id| matches!(self.get(*id), Some(p) if p.patchpoint() == addr))
    }

    fn probe_slot(&self, id: ProbeId) -> Option<&ProbeSlot> {
        self.probes.get(id.idx).filter(|slot| slot.generation == id.generation)
    }

    pub fn get(&self, id: ProbeId) -> Option<&FbtProbe> {
        self.probe_slot(id)?.probe.as_ref()
    }

    pub fn get_mut(&mut self, id: ProbeId) -> Option<&mut FbtProbe> {
        let slot = self.probes.get_mut(id.idx)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.probe.as_mut()
    }

    /// Chain a live probe belongs to.
    pub fn chain_of(&self, id: ProbeId) -> Option<ChainId> {
        let slot = self.probe_slot(id)?;
        slot.probe.as_ref()?;
        slot.owner
    }

    /// Members of a chain, entry probe first.
    pub fn chain(&self, chain: ChainId) -> Option<&[ProbeId]> {
        let slot = self.chains.get(chain.idx)?;
        if slot.generation != chain.generation {
            return None;
        }
        slot.members.as_deref()
    }

    /// Unlink every probe of `chain` from its bucket and release it, then
    /// release the chain. Returns the number of probes removed.
    ///
    /// A handle from an earlier occupant of the chain slot removes nothing.
    pub fn remove_all(&mut self, chain: ChainId) -> usize {
        let Some(slot) = self.chains.get_mut(chain.idx).filter(|slot| slot.generation == chain.generation) else {
            return 0;
        };
        let Some(members) = slot.members.take() else {
            return 0;
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free_chains.push(chain.idx);

        let mut removed = 0;
        for id in members {
            let Some(slot) = self.probes.get_mut(id.idx).filter(|slot| slot.generation == id.generation) else {
                continue;
            };
            let Some(probe) = slot.probe.take() else {
                continue;
            };
            slot.owner = None;
            slot.generation = slot.generation.wrapping_add(1);

            let bucket = self.bucket_index(probe.patchpoint());
            let entries = &mut self.buckets[bucket];
            if let Some(pos) = entries.iter().position(|e| *e == id) {
                entries.remove(pos);
            } else {
                warn!("fbt: probe {:#x} missing from bucket {}", probe.patchpoint(), bucket);
            }
            self.free_probes.push(id.idx);
            self.len -= 1;
            removed += 1;
        }
        removed
    }

    /// All live chains.
    pub fn chains(&self) -> impl Iterator<Item = (ChainId, &[ProbeId])> {
        self.chains
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let members = slot.members.as_deref()?;
                Some((ChainId { idx, generation: slot.generation }, members))
            })
    }

    /// Handles of every probe in `addr`'s bucket, head first.
    pub fn bucket(&self, addr: usize) -> impl Iterator<Item = ProbeId> + '_ {
        self.buckets[self.bucket_index(addr)].iter().rev().copied()
    }
}
