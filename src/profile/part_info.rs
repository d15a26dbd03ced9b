//! The partition-info block the bootloader reads from the header area.

use serde::Serialize;
use zerocopy::little_endian::U32;
use zerocopy::IntoBytes;
use zerocopy_derive::{Immutable, IntoBytes, KnownLayout, Unaligned};

pub const PART_INFO_MAGIC: u32 = 0xA55A_5AA5;
pub const PART_INFO_SIZE: usize = 0x200;

const ID_LEN: usize = 12;

/// Leading bytes of the block; the rest stays `0xFF`.
#[derive(Clone, Copy, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawPartInfo {
    magic: U32,
    format: [u8; 8],
    version: U32,
    flags: [u8; 8],
    ids: [RawId; 3],
}

#[derive(Clone, Copy, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C, packed)]
struct RawId {
    reserved: [u8; 4],
    name: [u8; ID_LEN],
}

impl RawId {
    fn new(id: &str) -> Self {
        Self {
            reserved: [0; 4],
            name: padded_id(id),
        }
    }
}

/// Identity of the firmware originally shipped with a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartInfo {
    /// Shipped firmware version, e.g. `0x0102_0000` for v1.02.
    pub version: u32,
    pub id_a: &'static str,
    pub id_b: &'static str,
    pub id_c: &'static str,
}

impl PartInfo {
    pub const fn new(version: u32, id_a: &'static str, id_b: &'static str, id_c: &'static str) -> Self {
        Self {
            version,
            id_a,
            id_b,
            id_c,
        }
    }

    /// Render the 512-byte block. Unused bytes are `0xFF`.
    pub fn to_block(&self) -> Vec<u8> {
        let raw = RawPartInfo {
            magic: U32::new(PART_INFO_MAGIC),
            format: [1, 0, 0, 0, 0, 0, 0, 0],
            version: U32::new(self.version),
            flags: [1, 0, 0, 0, 0, 0, 0, 0],
            ids: [RawId::new(self.id_a), RawId::new(self.id_b), RawId::new(self.id_c)],
        };
        let mut block = vec![0xFFu8; PART_INFO_SIZE];
        block[..std::mem::size_of::<RawPartInfo>()].copy_from_slice(raw.as_bytes());
        block
    }
}

fn padded_id(id: &str) -> [u8; ID_LEN] {
    let mut out = [0u8; ID_LEN];
    let bytes = id.as_bytes();
    let n = bytes.len().min(ID_LEN);
    out[..n].copy_from_slice(&bytes[..n]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_layout() {
        let block = PartInfo::new(0x0100_0000, "CVJ3973-A", "CVJ3973-A", "PJDZ5-1-A").to_block();
        assert_eq!(block.len(), PART_INFO_SIZE);
        assert_eq!(&block[0..4], &[0xA5, 0x5A, 0x5A, 0xA5]);
        assert_eq!(&block[4..12], &[1, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&block[12..16], &[0, 0, 0, 1]);
        assert_eq!(&block[24..28], &[0, 0, 0, 0]);
        assert_eq!(&block[28..40], b"CVJ3973-A\0\0\0");
        assert_eq!(&block[60..72], b"PJDZ5-1-A\0\0\0");
        assert!(block[72..].iter().all(|b| *b == 0xFF));
    }

    #[test]
    fn long_ids_are_truncated_to_field() {
        let block = PartInfo::new(0x0102_0000, "ABCDEFGHIJKLMNOP", "", "X").to_block();
        assert_eq!(std::mem::size_of::<RawPartInfo>(), 72);
        assert_eq!(&block[12..16], &[0, 0, 2, 1]);
        assert_eq!(&block[28..40], b"ABCDEFGHIJKL");
        assert_eq!(&block[40..44], &[0; 4]);
        assert_eq!(&block[44..56], &[0; 12]);
        assert_eq!(&block[60..72], b"X\0\0\0\0\0\0\0\0\0\0\0");
    }
}
