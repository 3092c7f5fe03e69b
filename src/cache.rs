//! Per-slab entry freelist cache.
//!
//! Every slab tracks which of its entries are allocated in a freelist
//! stored in the slab's own tail blocks. The exact freelist size
//! depends on the owning pool's object size, so it cannot be laid out
//! with the fixed metadata. Freelists are pulled into memory on first
//! use and written back on sync; the cache tracks a per-slab state so
//! untouched slabs cost no I/O.

use crate::device::BlockDevice;
use crate::error::{Result, StoreError};
use crate::freelist::Freelist;
use crate::geometry::{self, Geometry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElemState {
    /// Not initialized, or invalidated when the slab was released.
    Stale,
    /// In memory and identical to the on-disk copy.
    Clean,
    /// In memory with changes not yet written back.
    Dirty,
}

#[derive(Debug)]
struct CacheElem {
    state: ElemState,
    freelist: Option<Freelist>,
}

/// Cache of per-slab entry freelists, indexed by slab id.
#[derive(Debug)]
pub struct SlabCache {
    elems: Vec<CacheElem>,
}

fn flist_slba(geo: &Geometry, slab_id: u32, nobj: u32) -> u64 {
    let flist_nlb = geometry::slab_flist_nlb(nobj, geo.lb_nbytes);
    geo.slab_lb_off(slab_id) + u64::from(geo.slab_nlb) - u64::from(flist_nlb)
}

impl SlabCache {
    /// Empty cache for `nslabs` slabs; every element starts stale.
    pub fn new(nslabs: u32) -> Self {
        let mut elems = Vec::with_capacity(nslabs as usize);
        for _ in 0..nslabs {
            elems.push(CacheElem {
                state: ElemState::Stale,
                freelist: None,
            });
        }
        Self { elems }
    }

    fn elem(&self, slab_id: u32) -> Result<&CacheElem> {
        self.elems
            .get(slab_id as usize)
            .ok_or_else(|| StoreError::InvalidArgument(format!("slab id {slab_id} out of range")))
    }

    fn elem_mut(&mut self, slab_id: u32) -> Result<&mut CacheElem> {
        self.elems
            .get_mut(slab_id as usize)
            .ok_or_else(|| StoreError::InvalidArgument(format!("slab id {slab_id} out of range")))
    }

    /// Initialize a freshly acquired slab with `nobj` free entries.
    pub fn init(&mut self, slab_id: u32, nobj: u32) -> Result<()> {
        let elem = self.elem_mut(slab_id)?;
        elem.freelist = Some(Freelist::with_len(nobj));
        elem.state = ElemState::Dirty;
        Ok(())
    }

    /// Load the slab's freelist from the device unless already cached.
    pub fn load(
        &mut self,
        dev: &mut BlockDevice,
        geo: &Geometry,
        slab_id: u32,
        nobj: u32,
    ) -> Result<()> {
        let elem = self.elem(slab_id)?;
        if elem.state != ElemState::Stale {
            return Ok(());
        }
        let flist_nlb = geometry::slab_flist_nlb(nobj, geo.lb_nbytes);
        let mut buf = vec![0u8; flist_nlb as usize * geo.lb_nbytes as usize];
        dev.read_at(flist_slba(geo, slab_id, nobj), &mut buf)?;
        let fl = Freelist::from_bytes(&buf)?;
        if fl.len() != nobj {
            return Err(StoreError::Corruption(format!(
                "slab {slab_id} freelist tracks {} entries, expected {nobj}",
                fl.len()
            )));
        }
        let elem = self.elem_mut(slab_id)?;
        elem.freelist = Some(fl);
        elem.state = ElemState::Clean;
        Ok(())
    }

    fn freelist_mut(&mut self, slab_id: u32) -> Result<&mut Freelist> {
        let elem = self.elems.get_mut(slab_id as usize).ok_or_else(|| {
            StoreError::InvalidArgument(format!("slab id {slab_id} out of range"))
        })?;
        elem.freelist.as_mut().ok_or_else(|| {
            StoreError::Corruption(format!("slab {slab_id} freelist not loaded"))
        })
    }

    /// Take the lowest free entry of the slab.
    pub fn alloc(&mut self, slab_id: u32) -> Result<u32> {
        let ndx = self.freelist_mut(slab_id)?.alloc().ok_or_else(|| {
            StoreError::AllocationExhausted(format!("slab {slab_id} has no free entries"))
        })?;
        self.elem_mut(slab_id)?.state = ElemState::Dirty;
        Ok(ndx)
    }

    /// Return an entry to the slab. Fails when the entry is not
    /// currently allocated.
    pub fn free(&mut self, slab_id: u32, entry_ndx: u32) -> Result<()> {
        self.freelist_mut(slab_id)?.free(entry_ndx)?;
        self.elem_mut(slab_id)?.state = ElemState::Dirty;
        Ok(())
    }

    /// Invalidate the cache entry of a released slab.
    pub fn drop_elem(&mut self, slab_id: u32) -> Result<()> {
        let elem = self.elem_mut(slab_id)?;
        elem.freelist = None;
        elem.state = ElemState::Stale;
        Ok(())
    }

    /// Write every dirty freelist back to its slab's tail blocks.
    pub fn flush(&mut self, dev: &mut BlockDevice, geo: &Geometry) -> Result<()> {
        for (slab_id, elem) in self.elems.iter_mut().enumerate() {
            if elem.state != ElemState::Dirty {
                continue;
            }
            let fl = elem
                .freelist
                .as_ref()
                .ok_or_else(|| StoreError::Corruption("dirty slab freelist missing".into()))?;
            let flist_nlb = geometry::slab_flist_nlb(fl.len(), geo.lb_nbytes);
            let mut buf = vec![0u8; flist_nlb as usize * geo.lb_nbytes as usize];
            fl.write_to(&mut buf)?;
            let slba = flist_slba(geo, slab_id as u32, fl.len());
            dev.write_at(slba, &buf)?;
            elem.state = ElemState::Clean;
        }
        Ok(())
    }
}
