//! On-disk superblock.
//!
//! The superblock occupies the first metadata block and records the
//! parameters everything else is derived from. A CRC over the encoded
//! fields guards the one block that bootstraps the whole layout.

use crate::error::{Result, StoreError};

const MAGIC: &[u8; 8] = b"PENUMBRA";
const VERSION: u16 = 1;

/// Serialized size of the superblock.
pub const SUPER_NBYTES: usize = 32;

/// Layout parameters persisted at format time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /// Number of pool entries reserved.
    pub npools: u32,
    /// Number of slabs the device was carved into.
    pub nslabs: u32,
    /// Size of each slab in logical blocks.
    pub slab_nlb: u32,
    /// Blocks reserved for the superblock region.
    pub md_nlb: u32,
}

impl SuperBlock {
    /// Parse the superblock from the first metadata block.
    ///
    /// Returns `Ok(None)` when the block is all zeroes (device never
    /// formatted). A present but invalid superblock is an error.
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < SUPER_NBYTES {
            return Err(StoreError::Open("superblock region truncated".into()));
        }
        if data[..SUPER_NBYTES].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(StoreError::Open("bad superblock magic".into()));
        }
        let version = u16::from_le_bytes([data[8], data[9]]);
        if version != VERSION {
            return Err(StoreError::Open(format!(
                "unsupported format version {version}"
            )));
        }
        let stored_crc = u32::from_le_bytes([data[28], data[29], data[30], data[31]]);
        if stored_crc != crc32fast::hash(&data[..28]) {
            return Err(StoreError::Open("superblock checksum mismatch".into()));
        }
        Ok(Some(Self {
            npools: u32::from_le_bytes([data[12], data[13], data[14], data[15]]),
            nslabs: u32::from_le_bytes([data[16], data[17], data[18], data[19]]),
            slab_nlb: u32::from_le_bytes([data[20], data[21], data[22], data[23]]),
            md_nlb: u32::from_le_bytes([data[24], data[25], data[26], data[27]]),
        }))
    }

    /// Encode into the head of `data`.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < SUPER_NBYTES {
            return Err(StoreError::InvalidArgument(
                "superblock target buffer too small".into(),
            ));
        }
        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8..10].copy_from_slice(&VERSION.to_le_bytes());
        data[10..12].fill(0);
        data[12..16].copy_from_slice(&self.npools.to_le_bytes());
        data[16..20].copy_from_slice(&self.nslabs.to_le_bytes());
        data[20..24].copy_from_slice(&self.slab_nlb.to_le_bytes());
        data[24..28].copy_from_slice(&self.md_nlb.to_le_bytes());
        let crc = crc32fast::hash(&data[..28]);
        data[28..32].copy_from_slice(&crc.to_le_bytes());
        Ok(())
    }
}
