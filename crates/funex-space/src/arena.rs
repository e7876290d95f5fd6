//! Object arena: explicit, thread-safe home for in-memory space maps.
//!
//! Each arena is an independent handle; nothing is process-wide. Objects are
//! addressed by `ArenaHandle`, which is never reused within an arena.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::mapref::one::{Ref, RefMut};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use funex_config::{log_arena_debug, log_arena_info};

use crate::spmap::SpaceMap;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Unknown arena handle: {0}")]
    UnknownHandle(ArenaHandle),
}

/// Object kinds an arena can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectKind {
    SpaceMap,
}

/// Identity of the object owning a space map (a region, a volume, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId(pub u64);

/// Opaque reference to an arena-held object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArenaHandle {
    id: u64,
    kind: ObjectKind,
}

impl ArenaHandle {
    pub fn kind(&self) -> ObjectKind {
        self.kind
    }
}

impl fmt::Display for ArenaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}#{}", self.kind, self.id)
    }
}

/// Object that can live in an `ObjectArena`
pub trait ArenaObject: Send + Sync {
    const KIND: ObjectKind;

    /// Owner relation, if any
    fn owner(&self) -> Option<OwnerId>;

    /// Approximate in-memory size in bytes
    fn footprint(&self) -> usize;
}

/// Arena statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArenaStats {
    /// Live objects
    pub blocks_used: u64,
    /// Sum of live object footprints
    pub bytes_used: u64,
}

pub struct ObjectArena<T: ArenaObject = SpaceMap> {
    objects: DashMap<ArenaHandle, T>,
    next_id: AtomicU64,
}

impl<T: ArenaObject> Default for ObjectArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ArenaObject> ObjectArena<T> {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Take ownership of `object` and return its handle
    pub fn allocate(&self, object: T) -> ArenaHandle {
        let handle = ArenaHandle {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            kind: T::KIND,
        };
        self.objects.insert(handle, object);
        log_arena_debug!("Allocated object", id = handle.id);
        handle
    }

    /// Remove the object and hand it back to the caller
    pub fn release(&self, handle: ArenaHandle) -> Result<T, ArenaError> {
        let (_, object) = self
            .objects
            .remove(&handle)
            .ok_or(ArenaError::UnknownHandle(handle))?;
        log_arena_debug!("Released object", id = handle.id);
        Ok(object)
    }

    pub fn get(&self, handle: ArenaHandle) -> Option<Ref<'_, ArenaHandle, T>> {
        self.objects.get(&handle)
    }

    pub fn get_mut(&self, handle: ArenaHandle) -> Option<RefMut<'_, ArenaHandle, T>> {
        self.objects.get_mut(&handle)
    }

    /// Run `f` on the object behind `handle`
    pub fn with_mut<R>(
        &self,
        handle: ArenaHandle,
        f: impl FnOnce(&mut T) -> R,
    ) -> Result<R, ArenaError> {
        let mut object = self
            .objects
            .get_mut(&handle)
            .ok_or(ArenaError::UnknownHandle(handle))?;
        Ok(f(&mut *object))
    }

    /// Handles of every object owned by `owner`, in allocation order
    pub fn find_by_owner(&self, owner: OwnerId) -> Vec<ArenaHandle> {
        let mut handles: Vec<ArenaHandle> = self
            .objects
            .iter()
            .filter(|entry| entry.value().owner() == Some(owner))
            .map(|entry| *entry.key())
            .collect();
        handles.sort();
        handles
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn stats(&self) -> ArenaStats {
        let bytes_used = self
            .objects
            .iter()
            .map(|entry| entry.value().footprint() as u64)
            .sum();
        ArenaStats {
            blocks_used: self.objects.len() as u64,
            bytes_used,
        }
    }

    /// Release everything, returning the number of objects dropped
    pub fn clear(&self) -> usize {
        let count = self.objects.len();
        self.objects.clear();
        log_arena_info!("Arena cleared", objects = count);
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{Baddr, Geometry, Vaddr, ROOT_VOLUME};

    fn owned_map(index: u64, owner: u64) -> SpaceMap {
        let mut map = SpaceMap::for_region(index, Geometry::default()).unwrap();
        map.set_owner(Some(OwnerId(owner)));
        map
    }

    #[test]
    fn test_allocate_and_release() {
        let arena = ObjectArena::new();
        let handle = arena.allocate(SpaceMap::for_region(0, Geometry::default()).unwrap());
        assert_eq!(handle.kind(), ObjectKind::SpaceMap);
        assert_eq!(arena.len(), 1);

        let map = arena.release(handle).unwrap();
        assert_eq!(map.vaddr(), Vaddr::spmap(0));
        assert!(arena.is_empty());
        assert!(matches!(
            arena.release(handle),
            Err(ArenaError::UnknownHandle(h)) if h == handle
        ));
    }

    #[test]
    fn test_handles_not_reused() {
        let arena: ObjectArena = ObjectArena::new();
        let a = arena.allocate(owned_map(0, 1));
        arena.release(a).unwrap();
        let b = arena.allocate(owned_map(0, 1));
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
    }

    #[test]
    fn test_mutation_through_handle() {
        let arena: ObjectArena = ObjectArena::new();
        let handle = arena.allocate(owned_map(0, 1));
        let v = Vaddr::dir(1000);

        arena
            .with_mut(handle, |map| {
                let b = map.predict(&v)?;
                map.insert(v, b)
            })
            .unwrap()
            .unwrap();

        {
            let mut map = arena.get_mut(handle).unwrap();
            map.remove(&v).unwrap();
            map.insert(v, Baddr::block(ROOT_VOLUME, 5)).unwrap();
        }
        assert_eq!(
            arena.get(handle).unwrap().lookup(&v),
            Ok(Baddr::block(ROOT_VOLUME, 5))
        );
    }

    #[test]
    fn test_find_by_owner() {
        let arena: ObjectArena = ObjectArena::new();
        let a = arena.allocate(owned_map(0, 7));
        let _b = arena.allocate(owned_map(1, 8));
        let c = arena.allocate(owned_map(2, 7));
        arena.allocate(SpaceMap::for_region(3, Geometry::default()).unwrap());

        assert_eq!(arena.find_by_owner(OwnerId(7)), vec![a, c]);
        assert!(arena.find_by_owner(OwnerId(99)).is_empty());
    }

    #[test]
    fn test_stats_track_allocations() {
        let arena: ObjectArena = ObjectArena::new();
        assert_eq!(arena.stats(), ArenaStats::default());

        let a = arena.allocate(owned_map(0, 1));
        let b = arena.allocate(owned_map(1, 1));
        let stats = arena.stats();
        assert_eq!(stats.blocks_used, 2);
        assert!(stats.bytes_used > 0);

        arena.release(a).unwrap();
        assert_eq!(arena.stats().blocks_used, 1);
        arena.release(b).unwrap();
        assert_eq!(arena.stats(), ArenaStats::default());
    }

    #[test]
    fn test_arenas_are_independent() {
        let first: ObjectArena = ObjectArena::new();
        let second: ObjectArena = ObjectArena::new();
        let h = first.allocate(owned_map(0, 1));
        assert!(second.get(h).is_none());
        assert_eq!(second.stats().blocks_used, 0);
        assert_eq!(first.clear(), 1);
        assert!(first.is_empty());
    }

    #[test]
    fn test_concurrent_allocation() {
        let arena: std::sync::Arc<ObjectArena> = std::sync::Arc::new(ObjectArena::new());
        let threads: Vec<_> = (0..4u64)
            .map(|t| {
                let arena = arena.clone();
                std::thread::spawn(move || {
                    (0..8u64)
                        .map(|i| arena.allocate(owned_map(t * 8 + i, t)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut handles: Vec<ArenaHandle> = threads
            .into_iter()
            .flat_map(|t| t.join().unwrap())
            .collect();
        handles.sort();
        handles.dedup();
        assert_eq!(handles.len(), 32);
        assert_eq!(arena.find_by_owner(OwnerId(2)).len(), 8);
    }
}
