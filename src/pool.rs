//! Pool table: entries, name index and entry freelist.

use crate::error::{Result, StoreError};
use crate::freelist::Freelist;
use crate::geometry::PoolSegment;
use crate::index::{self, PoolIndex};
use crate::model::ObjectHandle;

/// Serialized size of one pool entry.
pub const POOL_ENTRY_NBYTES: usize = 128;
/// Maximum pool name length in bytes.
pub const POOL_NAME_MAX: usize = 96;

const NAME_OFF: usize = 32;
const LIST_NONE: u32 = u32::MAX;

/// Which of a pool's slab lists a slab belongs to, by fullness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabList {
    /// No entries allocated.
    Empty,
    /// Some entries allocated, some free.
    Partial,
    /// Every entry allocated.
    Full,
}

/// One pool's persistent state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolEntry {
    /// Pool name; empty for unused entries.
    pub name: String,
    /// Declared object extent, in logical blocks.
    pub obj_nlb: u32,
    /// Number of objects each of this pool's slabs can hold.
    pub slab_nobj: u32,
    /// Head of the pool's empty-slab list.
    pub empty_slabs: Option<u32>,
    /// Head of the pool's full-slab list.
    pub full_slabs: Option<u32>,
    /// Head of the pool's partially-filled slab list.
    pub partial_slabs: Option<u32>,
    /// Optional root object reference.
    pub root: Option<ObjectHandle>,
}

impl PoolEntry {
    /// Whether this table slot holds a live pool.
    pub fn in_use(&self) -> bool {
        self.obj_nlb != 0
    }

    /// The list a slab with `refcount` live objects belongs on.
    pub fn list_for(&self, refcount: u32) -> SlabList {
        if refcount == 0 {
            SlabList::Empty
        } else if refcount >= self.slab_nobj {
            SlabList::Full
        } else {
            SlabList::Partial
        }
    }

    /// Mutable head pointer of the given slab list.
    pub fn list_head_mut(&mut self, list: SlabList) -> &mut Option<u32> {
        match list {
            SlabList::Empty => &mut self.empty_slabs,
            SlabList::Partial => &mut self.partial_slabs,
            SlabList::Full => &mut self.full_slabs,
        }
    }

    fn read(data: &[u8]) -> Result<Self> {
        let obj_nlb = u32::from_le_bytes(data[0..4].try_into().expect("slice is 4 bytes"));
        let slab_nobj = u32::from_le_bytes(data[4..8].try_into().expect("slice is 4 bytes"));
        let empty = u32::from_le_bytes(data[8..12].try_into().expect("slice is 4 bytes"));
        let full = u32::from_le_bytes(data[12..16].try_into().expect("slice is 4 bytes"));
        let partial = u32::from_le_bytes(data[16..20].try_into().expect("slice is 4 bytes"));
        let root = u64::from_le_bytes(data[20..28].try_into().expect("slice is 8 bytes"));
        let name_end = data[NAME_OFF..NAME_OFF + POOL_NAME_MAX]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(POOL_NAME_MAX);
        let name = std::str::from_utf8(&data[NAME_OFF..NAME_OFF + name_end])
            .map_err(|_| StoreError::Corruption("pool name is not valid UTF-8".into()))?
            .to_string();
        Ok(Self {
            name,
            obj_nlb,
            slab_nobj,
            empty_slabs: decode_link(empty),
            full_slabs: decode_link(full),
            partial_slabs: decode_link(partial),
            root: ObjectHandle::from_raw(root),
        })
    }

    fn write(&self, data: &mut [u8]) {
        data[..POOL_ENTRY_NBYTES].fill(0);
        data[0..4].copy_from_slice(&self.obj_nlb.to_le_bytes());
        data[4..8].copy_from_slice(&self.slab_nobj.to_le_bytes());
        data[8..12].copy_from_slice(&encode_link(self.empty_slabs).to_le_bytes());
        data[12..16].copy_from_slice(&encode_link(self.full_slabs).to_le_bytes());
        data[16..20].copy_from_slice(&encode_link(self.partial_slabs).to_le_bytes());
        let root = self.root.map(ObjectHandle::to_raw).unwrap_or(u64::MAX);
        data[20..28].copy_from_slice(&root.to_le_bytes());
        data[NAME_OFF..NAME_OFF + self.name.len()].copy_from_slice(self.name.as_bytes());
    }
}

fn decode_link(raw: u32) -> Option<u32> {
    if raw == LIST_NONE {
        None
    } else {
        Some(raw)
    }
}

fn encode_link(link: Option<u32>) -> u32 {
    link.unwrap_or(LIST_NONE)
}

/// The in-memory pool segment: entry freelist, name index and entries.
#[derive(Debug, Clone)]
pub struct PoolTable {
    /// Bitmap of free pool entry slots.
    pub freelist: Freelist,
    /// Name → entry-index associative table.
    pub index: PoolIndex,
    /// The pool entries themselves.
    pub entries: Vec<PoolEntry>,
}

impl PoolTable {
    /// Fresh table for `npools` pools, as written by the formatter.
    pub fn new(npools: u32) -> Self {
        Self {
            freelist: Freelist::with_len(npools),
            index: PoolIndex::with_buckets(npools * 2),
            entries: vec![PoolEntry::default(); npools as usize],
        }
    }

    /// Parse the pool segment from its on-disk bytes.
    pub fn from_bytes(data: &[u8], sgmt: &PoolSegment, lb_nbytes: u32) -> Result<Self> {
        let lb = lb_nbytes as usize;
        let htbl_off = sgmt.freelist_nlb as usize * lb;
        let entries_off = htbl_off + sgmt.htbl_nlb as usize * lb;
        let end = entries_off + sgmt.entries_nlb as usize * lb;
        if data.len() < end {
            return Err(StoreError::Corruption("pool segment truncated".into()));
        }
        let freelist = Freelist::from_bytes(&data[..htbl_off])?;
        let index = PoolIndex::from_bytes(&data[htbl_off..entries_off])?;
        let npools = freelist.len() as usize;
        if index.bucket_count() != freelist.len() * 2 {
            return Err(StoreError::Corruption(
                "pool index size disagrees with pool count".into(),
            ));
        }
        let mut entries = Vec::with_capacity(npools);
        for i in 0..npools {
            let off = entries_off + i * POOL_ENTRY_NBYTES;
            entries.push(PoolEntry::read(&data[off..off + POOL_ENTRY_NBYTES])?);
        }
        Ok(Self {
            freelist,
            index,
            entries,
        })
    }

    /// Serialize the pool segment into `data`.
    pub fn write_to(&self, data: &mut [u8], sgmt: &PoolSegment, lb_nbytes: u32) -> Result<()> {
        let lb = lb_nbytes as usize;
        let htbl_off = sgmt.freelist_nlb as usize * lb;
        let entries_off = htbl_off + sgmt.htbl_nlb as usize * lb;
        self.freelist.write_to(&mut data[..htbl_off])?;
        self.index.write_to(&mut data[htbl_off..entries_off])?;
        for (i, entry) in self.entries.iter().enumerate() {
            let off = entries_off + i * POOL_ENTRY_NBYTES;
            entry.write(&mut data[off..off + POOL_ENTRY_NBYTES]);
        }
        Ok(())
    }

    /// Secondary hash used to fingerprint pool handles.
    pub fn name_h2(name: &str) -> u64 {
        index::hash_h2(name)
    }
}
