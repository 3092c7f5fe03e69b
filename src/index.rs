//! Fixed-bucket associative index for pool name lookups.
//!
//! A Robin Hood hash table with a bucket count fixed at construction:
//! no growth, no rehash. Collisions are resolved by linear probing
//! where insertion steals the slot of any "richer" entry (one closer to
//! its ideal bucket), keeping probe sequences short. Entries store a
//! secondary hash rather than the key itself, which keeps them
//! fixed-size on disk; distinct names colliding on both hash functions
//! is improbable enough that the table treats h2 equality as identity.

use crate::error::{Result, StoreError};

/// Sentinel marking an empty bucket.
const UNSET: u64 = u64::MAX;

/// Serialized size of the table header (bucket count + live count).
pub const HEADER_NBYTES: usize = 8;
/// Serialized size of one bucket.
pub const ENTRY_NBYTES: usize = 16;

/// Serialized byte size of an index with `buckets` buckets.
pub fn byte_size(buckets: u32) -> usize {
    HEADER_NBYTES + buckets as usize * ENTRY_NBYTES
}

/// DJB2 string hash, the table's primary hash.
pub fn hash_h1(key: &str) -> u64 {
    let mut hash: u64 = 5381;
    for b in key.bytes() {
        hash = hash.wrapping_shl(5).wrapping_add(hash).wrapping_add(u64::from(b));
    }
    hash
}

/// SDBM string hash, the secondary hash stored per entry.
pub fn hash_h2(key: &str) -> u64 {
    let mut hash: u64 = 0;
    for b in key.bytes() {
        hash = u64::from(b)
            .wrapping_add(hash.wrapping_shl(6))
            .wrapping_add(hash.wrapping_shl(16))
            .wrapping_sub(hash);
    }
    hash
}

/// Multiply-add-divide compression of a hash value into `[0, n)`.
fn compress(hash: u64, n: u64) -> u64 {
    hash.wrapping_mul(31).wrapping_add(5745) % n
}

/// One index bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Secondary hash distinguishing keys that collide on h1.
    pub h2: u64,
    /// Associated value (a pool table index).
    pub val: u32,
    /// Probe sequence length: distance from the ideal bucket.
    psl: u16,
}

impl IndexEntry {
    fn unset() -> Self {
        Self {
            h2: UNSET,
            val: 0,
            psl: 0,
        }
    }
}

/// Fixed-bucket Robin Hood hash table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolIndex {
    buckets: Vec<IndexEntry>,
    len: u32,
}

impl PoolIndex {
    /// New empty index; the bucket count is fixed for its lifetime.
    pub fn with_buckets(buckets: u32) -> Self {
        Self {
            buckets: vec![IndexEntry::unset(); buckets as usize],
            len: 0,
        }
    }

    /// Number of live entries.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// True when no entries are present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed bucket count set at construction.
    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    /// Insert or overwrite the association for `key`.
    ///
    /// Inserting a key already present replaces its value in place and
    /// leaves `len` unchanged. Fails only when the key is new and every
    /// bucket is occupied.
    pub fn insert(&mut self, key: &str, val: u32) -> Result<()> {
        let n = self.buckets.len() as u64;
        if n == 0 {
            return Err(StoreError::AllocationExhausted("index is full".into()));
        }
        let start = compress(hash_h1(key), n) as usize;
        let h2 = hash_h2(key);
        if let Some(i) = self.probe(h2, start) {
            self.buckets[i].val = val;
            return Ok(());
        }
        if u64::from(self.len) == n {
            return Err(StoreError::AllocationExhausted("index is full".into()));
        }
        let mut ndx = start;
        let mut cur = IndexEntry { h2, val, psl: 0 };
        loop {
            let entry = &mut self.buckets[ndx];
            if entry.h2 == UNSET {
                *entry = cur;
                self.len += 1;
                return Ok(());
            } else if entry.psl < cur.psl {
                // Richer element, swap out and continue placing it.
                std::mem::swap(entry, &mut cur);
                cur.psl += 1;
            } else {
                cur.psl += 1;
            }
            ndx += 1;
            if ndx == self.buckets.len() {
                ndx = 0;
            }
        }
    }

    fn probe(&self, h2: u64, mut ndx: usize) -> Option<usize> {
        let mut psl: u16 = 0;
        loop {
            let entry = &self.buckets[ndx];
            if entry.h2 == h2 {
                return Some(ndx);
            }
            if entry.h2 == UNSET || entry.psl < psl {
                // An empty bucket, or one whose occupant sits closer to
                // its ideal slot than our probe has travelled: the key
                // cannot be further along under Robin Hood placement.
                return None;
            }
            ndx += 1;
            if ndx == self.buckets.len() {
                ndx = 0;
            }
            psl += 1;
        }
    }

    /// Find the entry for `key`, if present. Never mutates the table.
    pub fn lookup(&self, key: &str) -> Option<&IndexEntry> {
        let n = self.buckets.len() as u64;
        let ndx = compress(hash_h1(key), n) as usize;
        self.probe(hash_h2(key), ndx).map(|i| &self.buckets[i])
    }

    /// Remove the entry for `key`; a no-op when absent.
    pub fn remove(&mut self, key: &str) {
        let n = self.buckets.len() as u64;
        let start = compress(hash_h1(key), n) as usize;
        let Some(mut ndx) = self.probe(hash_h2(key), start) else {
            return;
        };
        // Backward-shift deletion: pull successors one slot closer to
        // their ideal bucket until one is already home (psl == 0).
        loop {
            let mut next = ndx + 1;
            if next == self.buckets.len() {
                next = 0;
            }
            if self.buckets[next].psl == 0 {
                break;
            }
            self.buckets[ndx] = self.buckets[next];
            self.buckets[ndx].psl -= 1;
            ndx = next;
        }
        self.buckets[ndx] = IndexEntry::unset();
        self.len -= 1;
    }

    /// Parse an index from its serialized form.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_NBYTES {
            return Err(StoreError::Corruption("index header truncated".into()));
        }
        let buckets = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let len = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        if data.len() < byte_size(buckets) {
            return Err(StoreError::Corruption("index body truncated".into()));
        }
        let mut idx = Self {
            buckets: Vec::with_capacity(buckets as usize),
            len,
        };
        for i in 0..buckets as usize {
            let off = HEADER_NBYTES + i * ENTRY_NBYTES;
            let h2 = u64::from_le_bytes(data[off..off + 8].try_into().expect("slice is 8 bytes"));
            let val = u32::from_le_bytes([data[off + 8], data[off + 9], data[off + 10], data[off + 11]]);
            let psl = u16::from_le_bytes([data[off + 12], data[off + 13]]);
            idx.buckets.push(IndexEntry { h2, val, psl });
        }
        Ok(idx)
    }

    /// Serialize into `data`, which must hold `byte_size(bucket_count)`.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < byte_size(self.bucket_count()) {
            return Err(StoreError::InvalidArgument(
                "index target buffer too small".into(),
            ));
        }
        data[0..4].copy_from_slice(&self.bucket_count().to_le_bytes());
        data[4..8].copy_from_slice(&self.len.to_le_bytes());
        for (i, entry) in self.buckets.iter().enumerate() {
            let off = HEADER_NBYTES + i * ENTRY_NBYTES;
            data[off..off + 8].copy_from_slice(&entry.h2.to_le_bytes());
            data[off + 8..off + 12].copy_from_slice(&entry.val.to_le_bytes());
            data[off + 12..off + 14].copy_from_slice(&entry.psl.to_le_bytes());
            data[off + 14..off + 16].fill(0);
        }
        Ok(())
    }
}
