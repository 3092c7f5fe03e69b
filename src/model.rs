//! Handle types shared between the direct engine and the daemon client.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Addresses one allocated entry: the owning slab and the entry index
/// within it. Valid only between allocation and free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectHandle {
    /// ID of the parent slab (`0..nslabs`).
    pub slab_id: u32,
    /// Index of the entry within the slab.
    pub entry_ndx: u32,
}

impl ObjectHandle {
    /// Pack into the on-disk u64 representation used for root references.
    pub(crate) fn to_raw(self) -> u64 {
        (u64::from(self.slab_id) << 32) | u64::from(self.entry_ndx)
    }

    /// Unpack from the on-disk representation; `u64::MAX` means unset.
    pub(crate) fn from_raw(raw: u64) -> Option<Self> {
        if raw == u64::MAX {
            return None;
        }
        Some(Self {
            slab_id: (raw >> 32) as u32,
            entry_ndx: raw as u32,
        })
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj(slab={}, entry={})", self.slab_id, self.entry_ndx)
    }
}

/// Handle to a pool obtained from `pool_create` or `pool_open`.
///
/// Carries the secondary hash of the pool name so the store can detect
/// handles that outlived their pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolHandle {
    /// Index into the pool entry table.
    pub ndx: u32,
    /// Secondary hash of the pool name at handle creation time.
    pub h2: u64,
}

/// Flags accepted by `pool_set_root`. Reserved for future use; the
/// current store records the root unconditionally.
pub type RootFlags = u32;
