//! # funex-space
//!
//! Space mapping for the Funex filesystem.
//!
//! A space map governs a fixed region of blocks on a volume. It binds logical
//! object addresses (`Vaddr`) to physical fragment addresses (`Baddr`), packs
//! small objects into shared blocks and tracks how many fragments of each
//! block are in use.
//!
//! ## Example
//!
//! ```
//! use funex_space::{Geometry, SpaceMap, Vaddr};
//!
//! let mut map = SpaceMap::for_region(0, Geometry::default()).unwrap();
//! let vaddr = Vaddr::dirseg(1000, 1234);
//! let baddr = map.predict(&vaddr).unwrap();
//! map.insert(vaddr, baddr).unwrap();
//! assert_eq!(map.lookup(&vaddr), Ok(baddr));
//! ```

pub mod addr;
pub mod arena;
pub mod snapshot;
pub mod spmap;

pub use addr::{AddrKind, Baddr, Geometry, Ino, Vaddr, VolumeId};
pub use arena::{ArenaError, ArenaHandle, ArenaObject, ArenaStats, ObjectArena, ObjectKind, OwnerId};
pub use snapshot::SnapshotError;
pub use spmap::{BlockUsage, SpaceMap, SpaceStats};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpaceError {
    #[error("Address already bound: {0}")]
    Duplicate(Vaddr),

    #[error("Block {lba} full: {used} + {requested} fragments exceeds {capacity}")]
    CapacityExceeded {
        lba: u64,
        used: u32,
        requested: u32,
        capacity: u32,
    },

    #[error("Address not bound: {0}")]
    NotFound(Vaddr),

    #[error("No space left in region for {0}")]
    NoSpace(AddrKind),

    #[error("Block address outside region: {0}")]
    OutOfRegion(Baddr),

    #[error("Misaligned address {baddr} for {nfrg}-fragment object")]
    Misaligned { baddr: Baddr, nfrg: u32 },

    #[error("Fragments already in use at {0}")]
    FragmentInUse(Baddr),

    #[error("Block {lba} hosts {hosted}, cannot place {requested}")]
    KindMismatch {
        lba: u64,
        hosted: AddrKind,
        requested: AddrKind,
    },

    #[error("Region of {blocks} blocks at {lba} overruns the block address space")]
    RegionOverflow { lba: u64, blocks: u64 },

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),
}

pub type Result<T> = std::result::Result<T, SpaceError>;
