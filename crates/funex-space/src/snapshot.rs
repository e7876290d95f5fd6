//! Snapshot images of a space map.
//!
//! ## Image Format
//!
//! ```text
//! +----------------+
//! | Header (56B)   |  Magic, version, binding count, payload length, BLAKE3
//! +----------------+
//! | Payload        |  bincode: map identity, geometry, bindings
//! +----------------+
//! ```
//!
//! Block usage is not stored. Decoding replays every binding through
//! `SpaceMap::insert`, so an image that breaks the packing rules is refused.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use funex_config::{log_snapshot_debug, log_snapshot_warn};

use crate::addr::{Baddr, Geometry, Vaddr};
use crate::arena::OwnerId;
use crate::spmap::SpaceMap;

/// Magic bytes for snapshot identification
const SNAPSHOT_MAGIC: &[u8; 8] = b"FNXSPMAP";
/// Current snapshot format version
const SNAPSHOT_VERSION: u32 = 1;
/// Encoded header size
const HEADER_SIZE: usize = 56;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Invalid snapshot: {0}")]
    Invalid(String),

    #[error("Corrupted snapshot: {0}")]
    Corrupted(String),
}

pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Snapshot header (fixed 56 bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SnapshotHeader {
    magic: [u8; 8],
    version: u32,
    binding_count: u32,
    payload_len: u64,
    checksum: [u8; 32],
}

impl SnapshotHeader {
    fn new(binding_count: u32, payload: &[u8]) -> Self {
        Self {
            magic: *SNAPSHOT_MAGIC,
            version: SNAPSHOT_VERSION,
            binding_count,
            payload_len: payload.len() as u64,
            checksum: *blake3::hash(payload).as_bytes(),
        }
    }

    fn validate(&self) -> Result<()> {
        if &self.magic != SNAPSHOT_MAGIC {
            return Err(SnapshotError::Invalid("Bad magic bytes".to_string()));
        }
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Invalid(format!(
                "Unsupported version: {}",
                self.version
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    vaddr: Vaddr,
    baddr: Baddr,
    owner: Option<OwnerId>,
    geometry: Geometry,
    bindings: Vec<(Vaddr, Baddr)>,
}

/// Encode `map` into a snapshot image
pub fn encode(map: &SpaceMap) -> Result<Vec<u8>> {
    let payload = SnapshotPayload {
        vaddr: map.vaddr(),
        baddr: map.baddr(),
        owner: map.owner(),
        geometry: *map.geometry(),
        bindings: map.bindings().map(|(v, b)| (*v, *b)).collect(),
    };
    let binding_count = u32::try_from(payload.bindings.len())
        .map_err(|_| SnapshotError::Invalid("Too many bindings".to_string()))?;
    let body = bincode::serialize(&payload)?;
    let header = bincode::serialize(&SnapshotHeader::new(binding_count, &body))?;
    debug_assert_eq!(header.len(), HEADER_SIZE);

    let mut image = Vec::with_capacity(header.len() + body.len());
    image.extend_from_slice(&header);
    image.extend_from_slice(&body);
    log_snapshot_debug!("Encoded snapshot", bindings = binding_count, bytes = image.len());
    Ok(image)
}

/// Decode a snapshot image, rebuilding block usage from the bindings
pub fn decode(image: &[u8]) -> Result<SpaceMap> {
    if image.len() < HEADER_SIZE {
        return Err(SnapshotError::Invalid("File too small".to_string()));
    }
    let header: SnapshotHeader = bincode::deserialize(&image[..HEADER_SIZE])?;
    header.validate()?;

    let body = &image[HEADER_SIZE..];
    if body.len() as u64 != header.payload_len {
        return Err(SnapshotError::Corrupted(format!(
            "Payload length {} does not match header {}",
            body.len(),
            header.payload_len
        )));
    }
    if blake3::hash(body).as_bytes() != &header.checksum {
        log_snapshot_warn!("Checksum mismatch", bytes = body.len());
        return Err(SnapshotError::Corrupted("Checksum mismatch".to_string()));
    }

    let payload: SnapshotPayload = bincode::deserialize(body)?;
    if payload.bindings.len() as u64 != u64::from(header.binding_count) {
        return Err(SnapshotError::Corrupted(format!(
            "Header announces {} bindings, payload has {}",
            header.binding_count,
            payload.bindings.len()
        )));
    }

    let mut map = SpaceMap::setup(payload.vaddr, payload.baddr, payload.owner, payload.geometry)
        .map_err(|e| SnapshotError::Corrupted(e.to_string()))?;
    for (vaddr, baddr) in payload.bindings {
        map.insert(vaddr, baddr)
            .map_err(|e| SnapshotError::Corrupted(format!("{} -> {}: {}", vaddr, baddr, e)))?;
    }

    log_snapshot_debug!("Decoded snapshot", bindings = map.len());
    Ok(map)
}

/// Write a snapshot image of `map` to `path`
pub fn save<P: AsRef<Path>>(map: &SpaceMap, path: P) -> Result<()> {
    let image = encode(map)?;
    let file = File::create(path.as_ref())?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&image)?;
    writer.flush()?;
    Ok(())
}

/// Read a snapshot image from `path`
pub fn load<P: AsRef<Path>>(path: P) -> Result<SpaceMap> {
    let file = File::open(path.as_ref())?;
    let mut reader = BufReader::new(file);
    let mut image = Vec::new();
    reader.read_to_end(&mut image)?;
    decode(&image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::ROOT_VOLUME;
    use tempfile::tempdir;

    fn populated_map() -> SpaceMap {
        let mut map = SpaceMap::for_region(2, Geometry::default()).unwrap();
        map.set_owner(Some(OwnerId(42)));
        let vaddrs = [
            Vaddr::dir(1000),
            Vaddr::dirseg(1000, 1234),
            Vaddr::dirseg(1000, 223),
            Vaddr::regseg(12, 0),
            Vaddr::regseg(12, 1 << 19),
            Vaddr::vbk(9),
        ];
        for v in vaddrs {
            let b = map.predict(&v).unwrap();
            map.insert(v, b).unwrap();
        }
        map
    }

    fn assert_equivalent(a: &SpaceMap, b: &SpaceMap) {
        assert_eq!(a.vaddr(), b.vaddr());
        assert_eq!(a.baddr(), b.baddr());
        assert_eq!(a.owner(), b.owner());
        assert_eq!(a.geometry(), b.geometry());
        assert!(a.bindings().eq(b.bindings()));
        assert!(a.blocks().eq(b.blocks()));
    }

    #[test]
    fn test_header_size() {
        let header = SnapshotHeader::new(0, &[]);
        assert_eq!(bincode::serialize(&header).unwrap().len(), HEADER_SIZE);
    }

    #[test]
    fn test_restores_equivalent_map() {
        let map = populated_map();
        let restored = decode(&encode(&map).unwrap()).unwrap();
        assert_equivalent(&map, &restored);
        assert_eq!(restored.stats(), map.stats());
    }

    #[test]
    fn test_empty_map() {
        let map = SpaceMap::for_region(0, Geometry::default()).unwrap();
        let restored = decode(&encode(&map).unwrap()).unwrap();
        assert!(restored.is_empty());
        assert_eq!(restored.usageat(&restored.baddr()), 16);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region-2.spmap");
        let map = populated_map();

        save(&map, &path).unwrap();
        let loaded = load(&path).unwrap();
        assert_equivalent(&map, &loaded);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut image = encode(&populated_map()).unwrap();
        image[0] = b'X';
        assert!(matches!(decode(&image), Err(SnapshotError::Invalid(_))));
    }

    #[test]
    fn test_rejects_short_image() {
        assert!(matches!(
            decode(b"FNXSPMAP"),
            Err(SnapshotError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_flipped_payload() {
        let mut image = encode(&populated_map()).unwrap();
        let last = image.len() - 1;
        image[last] ^= 0xFF;
        assert!(matches!(decode(&image), Err(SnapshotError::Corrupted(_))));
    }

    #[test]
    fn test_rejects_truncated_payload() {
        let image = encode(&populated_map()).unwrap();
        let cut = &image[..image.len() - 3];
        assert!(matches!(decode(cut), Err(SnapshotError::Corrupted(_))));
    }

    #[test]
    fn test_rejects_overlapping_bindings() {
        // Two bindings on the same fragment, checksummed as if valid
        let map = SpaceMap::for_region(0, Geometry::default()).unwrap();
        let slot = Baddr::new(ROOT_VOLUME, 3, 0);
        let payload = SnapshotPayload {
            vaddr: map.vaddr(),
            baddr: map.baddr(),
            owner: None,
            geometry: *map.geometry(),
            bindings: vec![(Vaddr::dirseg(1, 0), slot), (Vaddr::dirseg(1, 29), slot)],
        };
        assert!(matches!(
            decode(&forged_image(&payload)),
            Err(SnapshotError::Corrupted(_))
        ));
    }

    fn forged_image(payload: &SnapshotPayload) -> Vec<u8> {
        let body = bincode::serialize(payload).unwrap();
        let count = payload.bindings.len() as u32;
        let mut image = bincode::serialize(&SnapshotHeader::new(count, &body)).unwrap();
        image.extend_from_slice(&body);
        image
    }

    #[test]
    fn test_rejects_fragment_past_block() {
        let map = SpaceMap::for_region(0, Geometry::default()).unwrap();
        let payload = SnapshotPayload {
            vaddr: map.vaddr(),
            baddr: map.baddr(),
            owner: None,
            geometry: *map.geometry(),
            bindings: vec![(Vaddr::dirseg(1, 0), Baddr::new(ROOT_VOLUME, 3, u32::MAX))],
        };
        assert!(matches!(
            decode(&forged_image(&payload)),
            Err(SnapshotError::Corrupted(_))
        ));
    }

    #[test]
    fn test_rejects_region_past_lba_space() {
        let map = SpaceMap::for_region(0, Geometry::default()).unwrap();
        let payload = SnapshotPayload {
            vaddr: map.vaddr(),
            baddr: Baddr::block(ROOT_VOLUME, u64::MAX - 10),
            owner: None,
            geometry: *map.geometry(),
            bindings: Vec::new(),
        };
        assert!(matches!(
            decode(&forged_image(&payload)),
            Err(SnapshotError::Corrupted(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        let result = load(dir.path().join("absent.spmap"));
        assert!(matches!(result, Err(SnapshotError::Io(_))));
    }
}
