//! Address model: logical (`Vaddr`) and physical (`Baddr`) addresses.
//!
//! A `Vaddr` names a filesystem object independently of where it is stored.
//! A `Baddr` names a fragment within a physical block of a volume. The
//! `Geometry` ties the two together by fixing how many fragments an object of
//! each kind occupies.

use std::fmt;

use serde::{Deserialize, Serialize};

use funex_config::SpaceConfig;

use crate::{Result, SpaceError};

/// Inode number
pub type Ino = u64;

/// Backing volume identifier
pub type VolumeId = u64;

/// Default fragment size in bytes (minimal allocation unit)
pub const FRAGMENT_SIZE: u32 = 512;
/// Default number of fragments per block
pub const BLOCK_FRAGMENTS: u32 = 16;
/// Default block size in bytes
pub const BLOCK_SIZE: u32 = FRAGMENT_SIZE * BLOCK_FRAGMENTS;
/// Default number of blocks governed by one space map
pub const REGION_BLOCKS: u64 = 128;

/// On-disk size of a directory segment
pub const DIRSEG_SIZE: u32 = 512;
/// On-disk size of a regular-file segment mapping
pub const REGSEG_SIZE: u32 = 1024;
/// Logical span of one regular-file segment (512K)
pub const RSEG_SPAN: u64 = 1 << 19;

/// Volume holding the super block and the space maps
pub const ROOT_VOLUME: VolumeId = 1;
/// Volume id of the null address
pub const NULL_VOLUME: VolumeId = 0;
/// Block number of the null address
pub const NULL_LBA: u64 = u64::MAX;

/// Directory entries held by the directory head
pub const DIR_HEAD_NDENT: u64 = 223;
/// Number of potential directory segments
pub const DIR_NSEGS: u64 = 32768;
/// Directory entries per directory segment
pub const DSEG_NDENT: u64 = 29;

/// Directory offset of the "." entry
pub const DOFF_SELF: u64 = 0;
/// First directory offset served by a directory segment
pub const DOFF_BEGINS: u64 = DIR_HEAD_NDENT;
/// End of the directory-segment offsets
pub const DOFF_END: u64 = DOFF_BEGINS + DIR_NSEGS * DSEG_NDENT;
/// Offset of the ".." entry of the root directory
pub const DOFF_PROOT: u64 = DOFF_END + 1;

/// Kind of a logical object, with its on-disk type code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum AddrKind {
    /// Directory head
    DirectoryMain = 0x01,
    /// Space-mapping block
    SpaceMapBlock = 0x20,
    /// Directory sub-segment
    DirectorySegment = 0x40,
    /// Regular-file segment
    RegularFileSegment = 0x60,
    /// Raw block object
    RawBlock = 0x70,
}

impl AddrKind {
    pub const ALL: [AddrKind; 5] = [
        AddrKind::DirectoryMain,
        AddrKind::SpaceMapBlock,
        AddrKind::DirectorySegment,
        AddrKind::RegularFileSegment,
        AddrKind::RawBlock,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            AddrKind::DirectoryMain => "dir",
            AddrKind::SpaceMapBlock => "spmap",
            AddrKind::DirectorySegment => "dirseg",
            AddrKind::RegularFileSegment => "regseg",
            AddrKind::RawBlock => "vbk",
        }
    }

    /// Whether objects of this kind always fill an entire block
    pub fn is_whole_block(self) -> bool {
        matches!(
            self,
            AddrKind::DirectoryMain | AddrKind::SpaceMapBlock | AddrKind::RawBlock
        )
    }

    /// Object size in bytes for a given block size
    fn object_size(self, block_size: u32) -> u32 {
        match self {
            AddrKind::DirectorySegment => DIRSEG_SIZE,
            AddrKind::RegularFileSegment => REGSEG_SIZE,
            _ => block_size,
        }
    }
}

impl fmt::Display for AddrKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Logical address of a filesystem object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Vaddr {
    /// A space map's own block, by region index
    SpaceMapBlock { index: u64 },
    /// Head block of a directory
    DirectoryMain { ino: Ino },
    /// Overflow block of directory entries at a logical offset
    DirectorySegment { ino: Ino, offset: u64 },
    /// Data segment of a regular file at a logical byte offset
    RegularFileSegment { ino: Ino, offset: u64 },
    /// Address-space block not tied to an inode
    RawBlock { lba: u64 },
}

impl Vaddr {
    pub fn spmap(index: u64) -> Self {
        Vaddr::SpaceMapBlock { index }
    }

    pub fn dir(ino: Ino) -> Self {
        Vaddr::DirectoryMain { ino }
    }

    pub fn dirseg(ino: Ino, offset: u64) -> Self {
        Vaddr::DirectorySegment { ino, offset }
    }

    /// Directory segment which holds the entry `name` of directory `ino`
    pub fn dirseg_by_name(ino: Ino, name: &str) -> Self {
        let dseg = hash_to_dseg(name_hash(name));
        Vaddr::DirectorySegment {
            ino,
            offset: dseg_to_doff(dseg),
        }
    }

    /// Regular-file segment covering byte `offset`; the offset is floored to
    /// the segment span.
    pub fn regseg(ino: Ino, offset: u64) -> Self {
        Vaddr::RegularFileSegment {
            ino,
            offset: offset - (offset % RSEG_SPAN),
        }
    }

    pub fn vbk(lba: u64) -> Self {
        Vaddr::RawBlock { lba }
    }

    pub fn kind(&self) -> AddrKind {
        match self {
            Vaddr::SpaceMapBlock { .. } => AddrKind::SpaceMapBlock,
            Vaddr::DirectoryMain { .. } => AddrKind::DirectoryMain,
            Vaddr::DirectorySegment { .. } => AddrKind::DirectorySegment,
            Vaddr::RegularFileSegment { .. } => AddrKind::RegularFileSegment,
            Vaddr::RawBlock { .. } => AddrKind::RawBlock,
        }
    }

    /// Owning inode, for inode-bound kinds
    pub fn ino(&self) -> Option<Ino> {
        match *self {
            Vaddr::DirectoryMain { ino }
            | Vaddr::DirectorySegment { ino, .. }
            | Vaddr::RegularFileSegment { ino, .. } => Some(ino),
            Vaddr::SpaceMapBlock { .. } | Vaddr::RawBlock { .. } => None,
        }
    }
}

impl fmt::Display for Vaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vaddr::SpaceMapBlock { index } => write!(f, "spmap[{}]", index),
            Vaddr::DirectoryMain { ino } => write!(f, "dir[{}]", ino),
            Vaddr::DirectorySegment { ino, offset } => write!(f, "dirseg[{}:{}]", ino, offset),
            Vaddr::RegularFileSegment { ino, offset } => {
                write!(f, "regseg[{}:{}]", ino, offset)
            }
            Vaddr::RawBlock { lba } => write!(f, "vbk[{}]", lba),
        }
    }
}

/// Physical address: a fragment within a block of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Baddr {
    /// Backing volume
    pub volume: VolumeId,
    /// Block number within the volume
    pub lba: u64,
    /// Fragment index from the block's start
    pub fragment: u32,
}

impl Baddr {
    pub const NULL: Baddr = Baddr {
        volume: NULL_VOLUME,
        lba: NULL_LBA,
        fragment: 0,
    };

    pub fn new(volume: VolumeId, lba: u64, fragment: u32) -> Self {
        Self {
            volume,
            lba,
            fragment,
        }
    }

    /// Address of a whole block (fragment 0)
    pub fn block(volume: VolumeId, lba: u64) -> Self {
        Self::new(volume, lba, 0)
    }

    pub fn is_null(&self) -> bool {
        self.volume == NULL_VOLUME && self.lba == NULL_LBA
    }

    /// Same address with the fragment index dropped
    pub fn floor(&self) -> Self {
        Self::block(self.volume, self.lba)
    }

    /// Whether both addresses refer to the same physical block
    pub fn same_block(&self, other: &Baddr) -> bool {
        self.volume == other.volume && self.lba == other.lba
    }

    /// Carry a fragment index beyond the block end into the block number
    /// Carry a fragment index beyond the block end into the block number;
    /// the block number saturates at `u64::MAX`.
    pub fn normalized(&self, geometry: &Geometry) -> Self {
        let nfrg = u128::from(geometry.block_fragments());
        let abs = u128::from(self.lba) * nfrg + u128::from(self.fragment);
        let lba = u64::try_from(abs / nfrg).unwrap_or(u64::MAX);
        Self::new(self.volume, lba, (abs % nfrg) as u32)
    }

    /// Distance from `self` to `other` in fragments; `None` across volumes
    pub fn fragment_distance(&self, other: &Baddr, geometry: &Geometry) -> Option<i64> {
        if self.volume != other.volume {
            return None;
        }
        let nfrg = geometry.block_fragments() as i128;
        let beg = self.lba as i128 * nfrg + self.fragment as i128;
        let end = other.lba as i128 * nfrg + other.fragment as i128;
        i64::try_from(end - beg).ok()
    }
}

impl fmt::Display for Baddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}+{}", self.volume, self.lba, self.fragment)
    }
}

/// Block and fragment dimensions of a space-map region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawGeometry")]
pub struct Geometry {
    fragment_size: u32,
    block_fragments: u32,
    region_blocks: u64,
}

/// Unchecked wire form of `Geometry`
#[derive(Deserialize)]
struct RawGeometry {
    fragment_size: u32,
    block_fragments: u32,
    region_blocks: u64,
}

impl TryFrom<RawGeometry> for Geometry {
    type Error = SpaceError;

    fn try_from(raw: RawGeometry) -> Result<Self> {
        Geometry::new(raw.fragment_size, raw.block_fragments, raw.region_blocks)
    }
}

impl Default for Geometry {
    fn default() -> Self {
        Self {
            fragment_size: FRAGMENT_SIZE,
            block_fragments: BLOCK_FRAGMENTS,
            region_blocks: REGION_BLOCKS,
        }
    }
}

impl Geometry {
    /// Maximum fragments per block (one occupancy bit each)
    pub const MAX_BLOCK_FRAGMENTS: u32 = 64;
    /// Maximum blocks per region
    pub const MAX_REGION_BLOCKS: u64 = 1 << 32;

    pub fn new(fragment_size: u32, block_fragments: u32, region_blocks: u64) -> Result<Self> {
        if !fragment_size.is_power_of_two() || fragment_size < DIRSEG_SIZE {
            return Err(SpaceError::InvalidGeometry(format!(
                "fragment size {} must be a power of two >= {}",
                fragment_size, DIRSEG_SIZE
            )));
        }
        if !block_fragments.is_power_of_two() || block_fragments > Self::MAX_BLOCK_FRAGMENTS {
            return Err(SpaceError::InvalidGeometry(format!(
                "block fragments {} must be a power of two <= {}",
                block_fragments,
                Self::MAX_BLOCK_FRAGMENTS
            )));
        }
        let block_size = u64::from(fragment_size) * u64::from(block_fragments);
        if block_size < u64::from(REGSEG_SIZE) || block_size > u64::from(u32::MAX) {
            return Err(SpaceError::InvalidGeometry(format!(
                "block size {} out of range",
                block_size
            )));
        }
        if region_blocks < 2 {
            return Err(SpaceError::InvalidGeometry(format!(
                "region of {} blocks leaves no room besides the map",
                region_blocks
            )));
        }
        if region_blocks > Self::MAX_REGION_BLOCKS {
            return Err(SpaceError::InvalidGeometry(format!(
                "region of {} blocks exceeds {}",
                region_blocks,
                Self::MAX_REGION_BLOCKS
            )));
        }
        Ok(Self {
            fragment_size,
            block_fragments,
            region_blocks,
        })
    }

    pub fn from_config(config: &SpaceConfig) -> Result<Self> {
        Self::new(
            config.fragment_size,
            config.block_fragments,
            config.region_blocks,
        )
    }

    /// Geometry of the process-wide configuration
    pub fn from_global() -> Result<Self> {
        Self::from_config(&funex_config::config().space)
    }

    pub fn fragment_size(&self) -> u32 {
        self.fragment_size
    }

    pub fn block_fragments(&self) -> u32 {
        self.block_fragments
    }

    pub fn region_blocks(&self) -> u64 {
        self.region_blocks
    }

    pub fn block_size(&self) -> u32 {
        self.fragment_size * self.block_fragments
    }

    /// Fragments in a whole region
    pub fn total_fragments(&self) -> u64 {
        self.region_blocks * u64::from(self.block_fragments)
    }

    /// Fragments needed to hold `nbytes`
    pub fn bytes_to_nfrg(&self, nbytes: u64) -> u64 {
        nbytes.div_ceil(u64::from(self.fragment_size))
    }

    /// Blocks needed to hold `nbytes`
    pub fn bytes_to_nblk(&self, nbytes: u64) -> u64 {
        nbytes.div_ceil(u64::from(self.block_size()))
    }

    /// Fragments occupied by one object of `kind`
    pub fn nfrg(&self, kind: AddrKind) -> u32 {
        let size = kind.object_size(self.block_size());
        self.bytes_to_nfrg(u64::from(size)) as u32
    }

    /// Objects of `kind` a single block can host
    pub fn capacity(&self, kind: AddrKind) -> u32 {
        self.block_fragments / self.nfrg(kind)
    }

    /// Occupancy bits of an object of `kind` at fragment 0
    pub(crate) fn kind_mask(&self, kind: AddrKind) -> u64 {
        low_bits(self.nfrg(kind))
    }

    /// Occupancy bits of a full block
    pub(crate) fn full_mask(&self) -> u64 {
        low_bits(self.block_fragments)
    }
}

fn low_bits(n: u32) -> u64 {
    if n >= u64::BITS {
        u64::MAX
    } else {
        (1u64 << n) - 1
    }
}

/// Hash of a directory-entry name
pub fn name_hash(name: &str) -> u64 {
    let digest = blake3::hash(name.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(head)
}

/// Directory segment for a name hash; a prime modulus spreads the hash
/// before masking to the segment range.
pub fn hash_to_dseg(hash: u64) -> u64 {
    (hash % 32771) & (DIR_NSEGS - 1)
}

pub fn doff_is_valid(doff: u64) -> bool {
    (DOFF_SELF..DOFF_END).contains(&doff) || doff == DOFF_PROOT
}

/// Directory segment serving offset `doff`; `doff` must be at or past
/// `DOFF_BEGINS`.
pub fn doff_to_dseg(doff: u64) -> u64 {
    doff.saturating_sub(DOFF_BEGINS) / DSEG_NDENT
}

pub fn dseg_to_doff(dseg: u64) -> u64 {
    DOFF_BEGINS + dseg * DSEG_NDENT
}
