//! On-disk cell framing.
//!
//! The db file holds a reserved header followed by a dense array of
//! fixed-size cells:
//!
//! ```text
//! +--------------------+
//! | reserved header    |  16 KiB, zeroed
//! +--------------------+
//! | cell 0             |  max_objsize bytes
//! | cell 1             |  max_objsize bytes
//! | ...                |
//! +--------------------+
//! ```
//!
//! Each cell begins with a [`CellHeader`] recording the payload size,
//! and every payload begins with a [`SwapMeta`] record (key plus entry
//! basics) so the startup rebuild can reattribute the cell without any
//! surviving in-memory state. Both records are little-endian.

use crate::entry::EntryBasics;
use crate::key::CacheKey;

/// Size of the reserved region at the start of the db file.
pub const HEADER_SIZE: i64 = 16 * 1024;

/// The fixed header at the start of every cell.
///
/// A zero `payload_size` marks the cell as empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CellHeader {
    /// Bytes of payload following this header, swap header included.
    pub payload_size: u64,
}

impl CellHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Encode the header as little-endian bytes.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        self.payload_size.to_le_bytes()
    }

    /// Decode a header from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            payload_size: u64::from_le_bytes(bytes[..Self::SIZE].try_into().unwrap()),
        })
    }
}

/// The swap header at the start of every cell payload.
///
/// Mirrors the key and basics held in the directory slot so that a cell
/// is self-describing on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapMeta {
    /// Content key the cell was written for.
    pub key: CacheKey,
    /// Entry basics at write time.
    pub basics: EntryBasics,
}

impl SwapMeta {
    /// Encoded size in bytes.
    pub const SIZE: usize = 64;

    /// Encode the record as little-endian bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..16].copy_from_slice(self.key.as_bytes());
        bytes[16..24].copy_from_slice(&self.basics.timestamp.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.basics.lastref.to_le_bytes());
        bytes[32..40].copy_from_slice(&self.basics.expires.to_le_bytes());
        bytes[40..48].copy_from_slice(&self.basics.lastmod.to_le_bytes());
        bytes[48..56].copy_from_slice(&self.basics.swap_file_sz.to_le_bytes());
        bytes[56..58].copy_from_slice(&self.basics.refcount.to_le_bytes());
        bytes[58..60].copy_from_slice(&self.basics.flags.to_le_bytes());
        bytes
    }

    /// Decode a record from the start of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        let word = |range: std::ops::Range<usize>| -> [u8; 8] { bytes[range].try_into().unwrap() };
        Some(Self {
            key: CacheKey::new(bytes[0..16].try_into().unwrap()),
            basics: EntryBasics {
                timestamp: i64::from_le_bytes(word(16..24)),
                lastref: i64::from_le_bytes(word(24..32)),
                expires: i64::from_le_bytes(word(32..40)),
                lastmod: i64::from_le_bytes(word(40..48)),
                swap_file_sz: u64::from_le_bytes(word(48..56)),
                refcount: u16::from_le_bytes(bytes[56..58].try_into().unwrap()),
                flags: u16::from_le_bytes(bytes[58..60].try_into().unwrap()),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_header_roundtrip() {
        let header = CellHeader { payload_size: 4096 };
        let bytes = header.to_bytes();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(bytes[1], 0x10);
        assert_eq!(CellHeader::from_bytes(&bytes), Some(header));
    }

    #[test]
    fn cell_header_rejects_short_input() {
        assert_eq!(CellHeader::from_bytes(&[0u8; 7]), None);
    }

    #[test]
    fn swap_meta_roundtrip() {
        let meta = SwapMeta {
            key: CacheKey::new([9; 16]),
            basics: EntryBasics {
                timestamp: 1_700_000_000,
                lastref: 1_700_000_001,
                expires: -1,
                lastmod: 1_600_000_000,
                swap_file_sz: 777,
                refcount: 3,
                flags: 0x8001,
            },
        };
        let bytes = meta.to_bytes();
        assert_eq!(&bytes[0..16], meta.key.as_bytes());
        // trailing pad stays zero
        assert_eq!(&bytes[60..64], &[0, 0, 0, 0]);
        assert_eq!(SwapMeta::from_bytes(&bytes), Some(meta));
    }

    #[test]
    fn swap_meta_rejects_short_input() {
        assert!(SwapMeta::from_bytes(&[0u8; 63]).is_none());
    }
}
