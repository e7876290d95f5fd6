//! Space map: per-region `Vaddr -> Baddr` table with fragment accounting.
//!
//! Each tracked block hosts objects of a single kind. Placement is best-fit:
//! the fullest same-kind block with an aligned free slot wins, otherwise the
//! lowest untracked block of the region is proposed.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use funex_config::{log_spmap_debug, log_spmap_info, log_spmap_trace};

use crate::addr::{AddrKind, Baddr, Geometry, Vaddr, ROOT_VOLUME};
use crate::arena::{ArenaObject, ObjectKind, OwnerId};
use crate::{Result, SpaceError};

/// Occupancy of one physical block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUsage {
    kind: AddrKind,
    mask: u64,
    nfrgs: u32,
}

impl BlockUsage {
    fn new(kind: AddrKind) -> Self {
        Self {
            kind,
            mask: 0,
            nfrgs: 0,
        }
    }

    fn full(kind: AddrKind, geometry: &Geometry) -> Self {
        Self {
            kind,
            mask: geometry.full_mask(),
            nfrgs: geometry.block_fragments(),
        }
    }

    /// Kind of objects hosted by the block
    pub fn kind(&self) -> AddrKind {
        self.kind
    }

    /// Used fragments
    pub fn used(&self) -> u32 {
        self.nfrgs
    }

    /// Fragment occupancy bits, bit `i` for fragment `i`
    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn is_free_at(&self, fragment: u32) -> bool {
        fragment < u64::BITS && self.mask & (1u64 << fragment) == 0
    }

    fn free(&self, geometry: &Geometry) -> u32 {
        geometry.block_fragments() - self.nfrgs
    }

    /// Lowest fragment where an object of `kind` fits, aligned to its size
    fn free_slot(&self, kind: AddrKind, geometry: &Geometry) -> Option<u32> {
        let nfrg = geometry.nfrg(kind);
        let slot = geometry.kind_mask(kind);
        (0..geometry.block_fragments())
            .step_by(nfrg as usize)
            .find(|&frg| self.mask & (slot << frg) == 0)
    }

    fn occupy(&mut self, bits: u64, nfrg: u32) {
        self.mask |= bits;
        self.nfrgs += nfrg;
    }

    fn vacate(&mut self, bits: u64, nfrg: u32) {
        self.mask &= !bits;
        self.nfrgs = self.nfrgs.saturating_sub(nfrg);
    }
}

/// Space-map statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceStats {
    pub bindings: usize,
    pub blocks: usize,
    pub used_fragments: u64,
    pub free_fragments: u64,
}

/// Address table for one region of blocks
#[derive(Debug, Clone)]
pub struct SpaceMap {
    vaddr: Vaddr,
    baddr: Baddr,
    owner: Option<OwnerId>,
    geometry: Geometry,
    bindings: BTreeMap<Vaddr, Baddr>,
    blocks: BTreeMap<u64, BlockUsage>,
}

impl SpaceMap {
    /// Create an empty map stored at `baddr`, governing the region that
    /// starts at its own block. The region must fit below the end of the
    /// block address space.
    pub fn setup(
        vaddr: Vaddr,
        baddr: Baddr,
        owner: Option<OwnerId>,
        geometry: Geometry,
    ) -> Result<Self> {
        let baddr = baddr.floor();
        if baddr.lba.checked_add(geometry.region_blocks()).is_none() {
            return Err(SpaceError::RegionOverflow {
                lba: baddr.lba,
                blocks: geometry.region_blocks(),
            });
        }
        let mut blocks = BTreeMap::new();
        blocks.insert(baddr.lba, BlockUsage::full(AddrKind::SpaceMapBlock, &geometry));

        log_spmap_info!(
            "Space map ready",
            lba = baddr.lba,
            volume = baddr.volume,
            region_blocks = geometry.region_blocks()
        );

        Ok(Self {
            vaddr,
            baddr,
            owner,
            geometry,
            bindings: BTreeMap::new(),
            blocks,
        })
    }

    /// Map of region `index` on the root volume
    pub fn for_region(index: u64, geometry: Geometry) -> Result<Self> {
        let lba = index
            .checked_mul(geometry.region_blocks())
            .ok_or(SpaceError::RegionOverflow {
                lba: u64::MAX,
                blocks: geometry.region_blocks(),
            })?;
        Self::setup(
            Vaddr::spmap(index),
            Baddr::block(ROOT_VOLUME, lba),
            None,
            geometry,
        )
    }

    pub fn vaddr(&self) -> Vaddr {
        self.vaddr
    }

    pub fn baddr(&self) -> Baddr {
        self.baddr
    }

    pub fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    pub fn set_owner(&mut self, owner: Option<OwnerId>) {
        self.owner = owner;
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Whether `baddr` lies inside the governed region
    pub fn in_region(&self, baddr: &Baddr) -> bool {
        baddr.volume == self.baddr.volume
            && baddr.lba >= self.baddr.lba
            && baddr.lba - self.baddr.lba < self.geometry.region_blocks()
    }

    /// Propose a placement for `vaddr` without changing the map.
    pub fn predict(&self, vaddr: &Vaddr) -> Result<Baddr> {
        if self.bindings.contains_key(vaddr) {
            return Err(SpaceError::Duplicate(*vaddr));
        }
        let kind = vaddr.kind();

        let best = self
            .blocks
            .iter()
            .filter(|(_, usage)| usage.kind == kind)
            .filter_map(|(&lba, usage)| {
                usage
                    .free_slot(kind, &self.geometry)
                    .map(|frg| (usage.free(&self.geometry), lba, frg))
            })
            .min_by_key(|&(free, lba, _)| (free, lba));

        let baddr = match best {
            Some((_, lba, frg)) => Baddr::new(self.baddr.volume, lba, frg),
            None => {
                let lba = self.first_untracked().ok_or(SpaceError::NoSpace(kind))?;
                Baddr::block(self.baddr.volume, lba)
            }
        };

        log_spmap_trace!(
            "Predicted placement",
            kind = kind.name(),
            lba = baddr.lba,
            fragment = baddr.fragment
        );
        Ok(baddr)
    }

    /// Used fragments of the block holding `baddr`; zero when untracked.
    pub fn usageat(&self, baddr: &Baddr) -> u32 {
        if baddr.volume != self.baddr.volume {
            return 0;
        }
        self.blocks.get(&baddr.lba).map_or(0, BlockUsage::used)
    }

    /// Bind `vaddr` to `baddr`. On error the map is left unchanged.
    pub fn insert(&mut self, vaddr: Vaddr, baddr: Baddr) -> Result<()> {
        if self.bindings.contains_key(&vaddr) {
            return Err(SpaceError::Duplicate(vaddr));
        }
        if !self.in_region(&baddr) {
            return Err(SpaceError::OutOfRegion(baddr));
        }

        let kind = vaddr.kind();
        let nfrg = self.geometry.nfrg(kind);
        let capacity = self.geometry.block_fragments();
        if baddr.fragment >= capacity
            || nfrg > capacity - baddr.fragment
            || baddr.fragment % nfrg != 0
        {
            return Err(SpaceError::Misaligned { baddr, nfrg });
        }

        let usage = self
            .blocks
            .get(&baddr.lba)
            .copied()
            .unwrap_or_else(|| BlockUsage::new(kind));
        if usage.nfrgs + nfrg > capacity {
            return Err(SpaceError::CapacityExceeded {
                lba: baddr.lba,
                used: usage.nfrgs,
                requested: nfrg,
                capacity,
            });
        }
        let bits = self.geometry.kind_mask(kind) << baddr.fragment;
        if usage.mask & bits != 0 {
            return Err(SpaceError::FragmentInUse(baddr));
        }
        if usage.kind != kind {
            return Err(SpaceError::KindMismatch {
                lba: baddr.lba,
                hosted: usage.kind,
                requested: kind,
            });
        }

        self.blocks
            .entry(baddr.lba)
            .or_insert(usage)
            .occupy(bits, nfrg);
        self.bindings.insert(vaddr, baddr);

        log_spmap_debug!(
            "Inserted binding",
            kind = kind.name(),
            lba = baddr.lba,
            fragment = baddr.fragment,
            used = usage.nfrgs + nfrg
        );
        Ok(())
    }

    pub fn lookup(&self, vaddr: &Vaddr) -> Result<Baddr> {
        self.bindings
            .get(vaddr)
            .copied()
            .ok_or(SpaceError::NotFound(*vaddr))
    }

    /// Unbind `vaddr` and free its fragments, returning where it was stored.
    pub fn remove(&mut self, vaddr: &Vaddr) -> Result<Baddr> {
        let baddr = self
            .bindings
            .remove(vaddr)
            .ok_or(SpaceError::NotFound(*vaddr))?;

        let kind = vaddr.kind();
        let nfrg = self.geometry.nfrg(kind);
        let bits = self.geometry.kind_mask(kind) << baddr.fragment;
        if let Entry::Occupied(mut entry) = self.blocks.entry(baddr.lba) {
            entry.get_mut().vacate(bits, nfrg);
            if entry.get().nfrgs == 0 {
                entry.remove();
            }
        }

        log_spmap_debug!(
            "Removed binding",
            kind = kind.name(),
            lba = baddr.lba,
            fragment = baddr.fragment
        );
        Ok(baddr)
    }

    pub fn contains(&self, vaddr: &Vaddr) -> bool {
        self.bindings.contains_key(vaddr)
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Used fragments across the region, the map's own block included
    pub fn used_fragments(&self) -> u64 {
        self.blocks.values().map(|u| u64::from(u.nfrgs)).sum()
    }

    /// Whether an object of `kind` could be placed now
    pub fn has_space(&self, kind: AddrKind) -> bool {
        let packable = self
            .blocks
            .values()
            .any(|u| u.kind == kind && u.free_slot(kind, &self.geometry).is_some());
        packable || (self.blocks.len() as u64) < self.geometry.region_blocks()
    }

    /// Tracked blocks in ascending block order
    pub fn blocks(&self) -> impl Iterator<Item = (Baddr, &BlockUsage)> + '_ {
        let volume = self.baddr.volume;
        self.blocks
            .iter()
            .map(move |(&lba, usage)| (Baddr::block(volume, lba), usage))
    }

    /// Bindings in ascending `Vaddr` order
    pub fn bindings(&self) -> impl Iterator<Item = (&Vaddr, &Baddr)> + '_ {
        self.bindings.iter()
    }

    pub fn stats(&self) -> SpaceStats {
        let total = self.geometry.total_fragments();
        let used = self.used_fragments();
        SpaceStats {
            bindings: self.bindings.len(),
            blocks: self.blocks.len(),
            used_fragments: used,
            free_fragments: total - used,
        }
    }

    fn first_untracked(&self) -> Option<u64> {
        let start = self.baddr.lba;
        let end = start.checked_add(self.geometry.region_blocks())?;
        (start..end).find(|lba| !self.blocks.contains_key(lba))
    }
}

impl ArenaObject for SpaceMap {
    const KIND: ObjectKind = ObjectKind::SpaceMap;

    fn owner(&self) -> Option<OwnerId> {
        self.owner
    }

    fn footprint(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.bindings.len() * std::mem::size_of::<(Vaddr, Baddr)>()
            + self.blocks.len() * std::mem::size_of::<(u64, BlockUsage)>()
    }
}
