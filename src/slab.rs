//! Slab arena: headers, the device-wide free-slab list and the
//! index-linked lists threading slabs onto their pool.
//!
//! Slabs never move; all list membership is expressed through
//! prev/next indices embedded in the headers. The free list keeps both
//! head and tail so releases append (FIFO reuse) while acquisitions pop
//! the head.

use crate::error::{Result, StoreError};

/// Serialized size of one slab header.
pub const SLAB_HDR_NBYTES: usize = 16;
/// Trailing free-list bookkeeping: count, head, tail.
pub const SLAB_SGMT_TAIL_NBYTES: usize = 12;

const LINK_NONE: u32 = u32::MAX;

/// Per-slab persistent header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlabHeader {
    /// Owning pool entry index, if assigned.
    pub pool: Option<u32>,
    /// Previous slab in whichever list this slab is on.
    pub prev: Option<u32>,
    /// Next slab in whichever list this slab is on.
    pub next: Option<u32>,
    /// Number of objects currently allocated from this slab.
    pub refcount: u32,
}

/// All slab headers plus the free-slab list state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlabArena {
    headers: Vec<SlabHeader>,
    free_head: Option<u32>,
    free_tail: Option<u32>,
    free_len: u32,
}

impl SlabArena {
    /// Fresh arena with every slab chained onto the free list.
    pub fn new(nslabs: u32) -> Self {
        let mut headers = Vec::with_capacity(nslabs as usize);
        for i in 0..nslabs {
            headers.push(SlabHeader {
                pool: None,
                prev: if i == 0 { None } else { Some(i - 1) },
                next: if i + 1 == nslabs { None } else { Some(i + 1) },
                refcount: 0,
            });
        }
        Self {
            headers,
            free_head: if nslabs == 0 { None } else { Some(0) },
            free_tail: if nslabs == 0 { None } else { Some(nslabs - 1) },
            free_len: nslabs,
        }
    }

    /// Number of slabs in the arena.
    pub fn nslabs(&self) -> u32 {
        self.headers.len() as u32
    }

    /// Number of slabs on the free list.
    pub fn free_len(&self) -> u32 {
        self.free_len
    }

    /// Header of slab `id`, when in range.
    pub fn header(&self, id: u32) -> Result<&SlabHeader> {
        self.headers
            .get(id as usize)
            .ok_or_else(|| StoreError::InvalidArgument(format!("slab id {id} out of range")))
    }

    /// Mutable header of slab `id`, when in range.
    pub fn header_mut(&mut self, id: u32) -> Result<&mut SlabHeader> {
        let nslabs = self.headers.len();
        self.headers
            .get_mut(id as usize)
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("slab id {id} out of range ({nslabs} slabs)"))
            })
    }

    /// Pop the free-list head, resetting its header for reuse.
    pub fn acquire(&mut self) -> Result<u32> {
        let Some(id) = self.free_head else {
            return Err(StoreError::AllocationExhausted(
                "no free slabs left on device".into(),
            ));
        };
        let next = self.headers[id as usize].next;
        self.free_head = next;
        match next {
            Some(n) => self.headers[n as usize].prev = None,
            None => self.free_tail = None,
        }
        self.free_len -= 1;
        self.headers[id as usize] = SlabHeader::default();
        Ok(id)
    }

    /// Append a fully-drained slab back onto the free list.
    pub fn release(&mut self, id: u32) -> Result<()> {
        let tail = self.free_tail;
        let hdr = self.header_mut(id)?;
        if hdr.refcount != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "slab {id} still has {} live objects",
                hdr.refcount
            )));
        }
        hdr.pool = None;
        hdr.prev = tail;
        hdr.next = None;
        match tail {
            Some(t) => self.headers[t as usize].next = Some(id),
            None => self.free_head = Some(id),
        }
        self.free_tail = Some(id);
        self.free_len += 1;
        Ok(())
    }

    /// Push slab `id` onto the front of a pool list.
    pub fn list_prepend(&mut self, head: &mut Option<u32>, id: u32) -> Result<()> {
        if let Some(old) = *head {
            self.header_mut(old)?.prev = Some(id);
        }
        let hdr = self.header_mut(id)?;
        hdr.next = *head;
        hdr.prev = None;
        *head = Some(id);
        Ok(())
    }

    /// Unlink slab `id` from the pool list it is on.
    pub fn list_remove(&mut self, head: &mut Option<u32>, id: u32) -> Result<()> {
        let (prev, next) = {
            let hdr = self.header(id)?;
            (hdr.prev, hdr.next)
        };
        match prev {
            None => *head = next,
            Some(p) => self.header_mut(p)?.next = next,
        }
        if let Some(n) = next {
            self.header_mut(n)?.prev = prev;
        }
        let hdr = self.header_mut(id)?;
        hdr.prev = None;
        hdr.next = None;
        Ok(())
    }

    /// Parse the slab segment from its on-disk bytes.
    pub fn from_bytes(data: &[u8], nslabs: u32) -> Result<Self> {
        let hdr_nbytes = nslabs as usize * SLAB_HDR_NBYTES;
        if data.len() < hdr_nbytes + SLAB_SGMT_TAIL_NBYTES {
            return Err(StoreError::Corruption("slab segment truncated".into()));
        }
        let mut headers = Vec::with_capacity(nslabs as usize);
        for i in 0..nslabs as usize {
            let off = i * SLAB_HDR_NBYTES;
            let pool = u32::from_le_bytes(data[off..off + 4].try_into().expect("4 bytes"));
            let prev = u32::from_le_bytes(data[off + 4..off + 8].try_into().expect("4 bytes"));
            let next = u32::from_le_bytes(data[off + 8..off + 12].try_into().expect("4 bytes"));
            let refcount = u32::from_le_bytes(data[off + 12..off + 16].try_into().expect("4 bytes"));
            headers.push(SlabHeader {
                pool: decode(pool),
                prev: decode(prev),
                next: decode(next),
                refcount,
            });
        }
        let tail_off = data.len() - SLAB_SGMT_TAIL_NBYTES;
        let free_len = u32::from_le_bytes(data[tail_off..tail_off + 4].try_into().expect("4 bytes"));
        let free_head =
            u32::from_le_bytes(data[tail_off + 4..tail_off + 8].try_into().expect("4 bytes"));
        let free_tail =
            u32::from_le_bytes(data[tail_off + 8..tail_off + 12].try_into().expect("4 bytes"));
        if free_len > nslabs {
            return Err(StoreError::Corruption(
                "free slab count exceeds slab count".into(),
            ));
        }
        Ok(Self {
            headers,
            free_head: decode(free_head),
            free_tail: decode(free_tail),
            free_len,
        })
    }

    /// Serialize the slab segment into `data` (headers first, free-list
    /// bookkeeping in the final 12 bytes).
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        let hdr_nbytes = self.headers.len() * SLAB_HDR_NBYTES;
        if data.len() < hdr_nbytes + SLAB_SGMT_TAIL_NBYTES {
            return Err(StoreError::InvalidArgument(
                "slab segment target buffer too small".into(),
            ));
        }
        for (i, hdr) in self.headers.iter().enumerate() {
            let off = i * SLAB_HDR_NBYTES;
            data[off..off + 4].copy_from_slice(&encode(hdr.pool).to_le_bytes());
            data[off + 4..off + 8].copy_from_slice(&encode(hdr.prev).to_le_bytes());
            data[off + 8..off + 12].copy_from_slice(&encode(hdr.next).to_le_bytes());
            data[off + 12..off + 16].copy_from_slice(&hdr.refcount.to_le_bytes());
        }
        let tail_off = data.len() - SLAB_SGMT_TAIL_NBYTES;
        data[tail_off..tail_off + 4].copy_from_slice(&self.free_len.to_le_bytes());
        data[tail_off + 4..tail_off + 8].copy_from_slice(&encode(self.free_head).to_le_bytes());
        data[tail_off + 8..tail_off + 12].copy_from_slice(&encode(self.free_tail).to_le_bytes());
        Ok(())
    }
}

fn decode(raw: u32) -> Option<u32> {
    if raw == LINK_NONE {
        None
    } else {
        Some(raw)
    }
}

fn encode(link: Option<u32>) -> u32 {
    link.unwrap_or(LINK_NONE)
}
