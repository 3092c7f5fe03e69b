//! The allocation engine.
//!
//! An [`ObjectStore`] owns one formatted device (plus an optional
//! metadata device), the in-memory mirror of its layout, and the dirty
//! state that `sync` makes durable. One open store per device is the
//! unit of safe mutation; concurrent opens of the same device are not
//! detected and not supported — daemon mode exists for shared access.

use std::path::Path;

use tracing::{debug, info};

use crate::buffer::IoBuffer;
use crate::cache::SlabCache;
use crate::device::BlockDevice;
use crate::error::{Result, StoreError};
use crate::geometry::{self, Geometry};
use crate::model::{ObjectHandle, PoolHandle, RootFlags};
use crate::pool::{PoolEntry, PoolTable, POOL_NAME_MAX};
use crate::slab::SlabArena;
use crate::superblock::SuperBlock;

/// Open allocation engine over a formatted device.
#[derive(Debug)]
pub struct ObjectStore {
    dev: BlockDevice,
    md_dev: Option<BlockDevice>,
    geo: Geometry,
    pools: PoolTable,
    slabs: SlabArena,
    cache: SlabCache,
    dirty: bool,
}

impl ObjectStore {
    /// Open a store whose metadata lives on the data device.
    pub fn open<P: AsRef<Path>>(dev_path: P) -> Result<Self> {
        Self::open_impl(dev_path.as_ref(), None)
    }

    /// Open a store formatted with a separate metadata device.
    pub fn open_with_md<P: AsRef<Path>, Q: AsRef<Path>>(dev_path: P, md_path: Q) -> Result<Self> {
        Self::open_impl(dev_path.as_ref(), Some(md_path.as_ref()))
    }

    fn open_impl(dev_path: &Path, md_path: Option<&Path>) -> Result<Self> {
        let mut dev = BlockDevice::open(dev_path)?;
        let mut md_dev = match md_path {
            Some(p) => Some(BlockDevice::open(p)?),
            None => None,
        };
        if let Some(md) = &md_dev {
            if md.lb_nbytes() != dev.lb_nbytes() {
                return Err(StoreError::Open(format!(
                    "metadata device block size {} differs from data device block size {}",
                    md.lb_nbytes(),
                    dev.lb_nbytes()
                )));
            }
        }
        let lb_nbytes = dev.lb_nbytes();

        // The superblock region size depends only on the block size, so
        // it can be read before anything is known about the layout.
        let md_nlb = crate::superblock::SUPER_NBYTES.div_ceil(lb_nbytes as usize);
        let mut super_buf = vec![0u8; md_nlb * lb_nbytes as usize];
        md_target_of(&mut dev, &mut md_dev).read_at(0, &mut super_buf)?;
        let sb = SuperBlock::read(&super_buf)?.ok_or_else(|| {
            StoreError::Open(format!(
                "{} holds no layout (device not formatted?)",
                dev_path.display()
            ))
        })?;

        let geo = Geometry::from_super(dev.nlb(), lb_nbytes, &sb, md_dev.is_some());
        let md_target_nlb = md_dev.as_ref().map(BlockDevice::nlb).unwrap_or(dev.nlb());
        if geo.meta_nlb() > md_target_nlb {
            return Err(StoreError::Open(
                "metadata region exceeds device capacity".into(),
            ));
        }
        let data_end = geo.slab_lb_off(0) + u64::from(geo.nslabs) * u64::from(geo.slab_nlb);
        if data_end > dev.nlb() {
            return Err(StoreError::Open(
                "slab data region exceeds device capacity".into(),
            ));
        }

        let mut meta_buf = vec![0u8; geo.meta_nbytes()];
        md_target_of(&mut dev, &mut md_dev).read_at(0, &mut meta_buf)?;
        let pool_off = geo.pool_sgmt_lb_off() as usize * lb_nbytes as usize;
        let slab_off = geo.slab_sgmt_lb_off() as usize * lb_nbytes as usize;
        let pools = PoolTable::from_bytes(&meta_buf[pool_off..slab_off], &geo.pool_sgmt, lb_nbytes)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        let slabs = SlabArena::from_bytes(&meta_buf[slab_off..], geo.nslabs)
            .map_err(|e| StoreError::Open(e.to_string()))?;
        if pools.freelist.len() != geo.npools {
            return Err(StoreError::Open(
                "pool freelist disagrees with superblock pool count".into(),
            ));
        }

        info!(
            device = %dev_path.display(),
            npools = geo.npools,
            nslabs = geo.nslabs,
            slab_nlb = geo.slab_nlb,
            "store opened"
        );
        Ok(Self {
            cache: SlabCache::new(geo.nslabs),
            dev,
            md_dev,
            geo,
            pools,
            slabs,
            dirty: false,
        })
    }

    /// Logical block size of the underlying device, in bytes.
    pub fn lb_nbytes(&self) -> u32 {
        self.geo.lb_nbytes
    }

    /// Disk geometry this store was opened with.
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    /// Number of slabs not assigned to any pool.
    pub fn free_slab_count(&self) -> u32 {
        self.slabs.free_len()
    }

    /// Live pools: `(entry index, entry)` pairs.
    pub fn pools(&self) -> impl Iterator<Item = (u32, &PoolEntry)> {
        self.pools
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.in_use())
            .map(|(i, e)| (i as u32, e))
    }

    /// Allocate a transfer buffer of at least `nbytes`.
    pub fn alloc_buf(&self, nbytes: usize) -> IoBuffer {
        IoBuffer::new(self.geo.lb_nbytes, nbytes)
    }

    /// Byte extent of each object in the pool.
    pub fn object_nbytes(&self, pool: &PoolHandle) -> Result<u64> {
        let ndx = self.check_pool(pool)?;
        Ok(u64::from(self.pools.entries[ndx as usize].obj_nlb) * u64::from(self.geo.lb_nbytes))
    }

    fn check_pool(&self, pool: &PoolHandle) -> Result<u32> {
        let entry = self
            .pools
            .entries
            .get(pool.ndx as usize)
            .filter(|e| e.in_use())
            .ok_or_else(|| {
                StoreError::InvalidArgument(format!("no pool at index {}", pool.ndx))
            })?;
        if PoolTable::name_h2(&entry.name) != pool.h2 {
            return Err(StoreError::InvalidArgument(format!(
                "stale pool handle: entry {} now belongs to a different pool",
                pool.ndx
            )));
        }
        Ok(pool.ndx)
    }

    /// Create a pool, or return the existing pool of the same name.
    ///
    /// `obj_nlb` declares the extent of every object allocated from the
    /// pool, in logical blocks; reads and writes are validated against
    /// it. Re-creating an existing pool with a different `obj_nlb` is an
    /// error.
    pub fn pool_create(&mut self, name: &str, obj_nlb: u32) -> Result<PoolHandle> {
        if name.is_empty() || name.len() > POOL_NAME_MAX || name.bytes().any(|b| b == 0) {
            return Err(StoreError::InvalidArgument(format!(
                "pool name must be 1..={POOL_NAME_MAX} bytes without NUL"
            )));
        }
        if let Some(found) = self.pools.index.lookup(name) {
            let entry = &self.pools.entries[found.val as usize];
            if entry.obj_nlb != obj_nlb {
                return Err(StoreError::InvalidArgument(format!(
                    "pool {name:?} exists with object size {} blocks",
                    entry.obj_nlb
                )));
            }
            return Ok(PoolHandle {
                ndx: found.val,
                h2: found.h2,
            });
        }

        let slab_nobj = geometry::objs_in_slab(self.geo.slab_nlb, obj_nlb, self.geo.lb_nbytes);
        if slab_nobj == 0 {
            return Err(StoreError::InvalidArgument(format!(
                "object size of {obj_nlb} blocks is incompatible with {}-block slabs",
                self.geo.slab_nlb
            )));
        }
        let ndx = self.pools.freelist.alloc().ok_or_else(|| {
            StoreError::AllocationExhausted(format!(
                "pool table is full ({} pools)",
                self.geo.npools
            ))
        })?;
        if let Err(e) = self.pools.index.insert(name, ndx) {
            self.pools.freelist.free(ndx)?;
            return Err(e);
        }
        self.pools.entries[ndx as usize] = PoolEntry {
            name: name.to_string(),
            obj_nlb,
            slab_nobj,
            ..Default::default()
        };
        self.dirty = true;
        info!(pool = name, ndx, obj_nlb, slab_nobj, "pool created");
        Ok(PoolHandle {
            ndx,
            h2: PoolTable::name_h2(name),
        })
    }

    /// Handle for an existing pool.
    pub fn pool_open(&self, name: &str) -> Result<PoolHandle> {
        let found = self
            .pools
            .index
            .lookup(name)
            .ok_or_else(|| StoreError::NotFound(format!("pool {name:?}")))?;
        Ok(PoolHandle {
            ndx: found.val,
            h2: found.h2,
        })
    }

    /// Destroy a pool, releasing its slabs back to the device.
    ///
    /// Every object must have been freed first: a pool with live
    /// objects is not destroyable.
    pub fn pool_destroy(&mut self, pool: PoolHandle) -> Result<()> {
        let ndx = self.check_pool(&pool)?;
        for list in [
            self.pools.entries[ndx as usize].empty_slabs,
            self.pools.entries[ndx as usize].partial_slabs,
            self.pools.entries[ndx as usize].full_slabs,
        ] {
            let mut cursor = list;
            while let Some(id) = cursor {
                if self.slabs.header(id)?.refcount != 0 {
                    return Err(StoreError::InvalidArgument(format!(
                        "pool {:?} still has live objects",
                        self.pools.entries[ndx as usize].name
                    )));
                }
                cursor = self.slabs.header(id)?.next;
            }
        }
        for list in [
            self.pools.entries[ndx as usize].empty_slabs.take(),
            self.pools.entries[ndx as usize].partial_slabs.take(),
            self.pools.entries[ndx as usize].full_slabs.take(),
        ] {
            let mut cursor = list;
            while let Some(id) = cursor {
                cursor = self.slabs.header(id)?.next;
                self.cache.drop_elem(id)?;
                self.slabs.release(id)?;
            }
        }
        let name = std::mem::take(&mut self.pools.entries[ndx as usize].name);
        self.pools.entries[ndx as usize] = PoolEntry::default();
        self.pools.index.remove(&name);
        self.pools.freelist.free(ndx)?;
        self.dirty = true;
        info!(pool = %name, ndx, "pool destroyed");
        Ok(())
    }

    fn ensure_cache_loaded(&mut self, slab_id: u32, nobj: u32) -> Result<()> {
        self.cache.load(&mut self.dev, &self.geo, slab_id, nobj)
    }

    /// Allocate one object from the pool.
    ///
    /// Picks the first free entry of a partially-filled slab, then of
    /// an empty slab, and acquires a fresh slab from the device-wide
    /// free list when the pool has no room left. Fails with
    /// `AllocationExhausted` once the device has no free slab either.
    pub fn object_alloc(&mut self, pool: &PoolHandle) -> Result<ObjectHandle> {
        let ndx = self.check_pool(pool)? as usize;
        let slab_nobj = self.pools.entries[ndx].slab_nobj;

        let slab_id = match self.pools.entries[ndx]
            .partial_slabs
            .or(self.pools.entries[ndx].empty_slabs)
        {
            Some(id) => {
                self.ensure_cache_loaded(id, slab_nobj)?;
                id
            }
            None => {
                let id = self.slabs.acquire()?;
                self.slabs.header_mut(id)?.pool = Some(ndx as u32);
                self.cache.init(id, slab_nobj)?;
                self.slabs
                    .list_prepend(&mut self.pools.entries[ndx].empty_slabs, id)?;
                debug!(pool = ndx, slab = id, "slab acquired");
                id
            }
        };

        let rc_before = self.slabs.header(slab_id)?.refcount;
        let entry_ndx = self.cache.alloc(slab_id)?;
        self.slabs.header_mut(slab_id)?.refcount = rc_before + 1;

        let from = self.pools.entries[ndx].list_for(rc_before);
        let to = self.pools.entries[ndx].list_for(rc_before + 1);
        if from != to {
            self.slabs
                .list_remove(self.pools.entries[ndx].list_head_mut(from), slab_id)?;
            self.slabs
                .list_prepend(self.pools.entries[ndx].list_head_mut(to), slab_id)?;
        }
        self.dirty = true;
        Ok(ObjectHandle {
            slab_id,
            entry_ndx,
        })
    }

    /// Free an object, making its entry eligible for reuse.
    ///
    /// A slab whose last object is freed is returned to the device-wide
    /// free list. Freeing a handle that is not currently allocated is
    /// an error.
    pub fn object_free(&mut self, pool: &PoolHandle, obj: ObjectHandle) -> Result<()> {
        let ndx = self.check_pool(pool)? as usize;
        let slab_nobj = self.pools.entries[ndx].slab_nobj;
        self.check_object(ndx as u32, &obj)?;
        self.ensure_cache_loaded(obj.slab_id, slab_nobj)?;

        self.cache.free(obj.slab_id, obj.entry_ndx)?;
        let rc_before = self.slabs.header(obj.slab_id)?.refcount;
        if rc_before == 0 {
            return Err(StoreError::Corruption(format!(
                "slab {} freelist and refcount disagree",
                obj.slab_id
            )));
        }
        let rc_after = rc_before - 1;
        self.slabs.header_mut(obj.slab_id)?.refcount = rc_after;

        let from = self.pools.entries[ndx].list_for(rc_before);
        self.slabs
            .list_remove(self.pools.entries[ndx].list_head_mut(from), obj.slab_id)?;
        if rc_after == 0 {
            self.cache.drop_elem(obj.slab_id)?;
            self.slabs.release(obj.slab_id)?;
            debug!(pool = ndx, slab = obj.slab_id, "slab released");
        } else {
            let to = self.pools.entries[ndx].list_for(rc_after);
            self.slabs
                .list_prepend(self.pools.entries[ndx].list_head_mut(to), obj.slab_id)?;
        }
        self.dirty = true;
        Ok(())
    }

    fn check_object(&self, pool_ndx: u32, obj: &ObjectHandle) -> Result<()> {
        let hdr = self.slabs.header(obj.slab_id)?;
        if hdr.pool != Some(pool_ndx) {
            return Err(StoreError::InvalidArgument(format!(
                "slab {} does not belong to pool {pool_ndx}",
                obj.slab_id
            )));
        }
        let slab_nobj = self.pools.entries[pool_ndx as usize].slab_nobj;
        if obj.entry_ndx >= slab_nobj {
            return Err(StoreError::InvalidArgument(format!(
                "entry {} out of range for {slab_nobj}-entry slabs",
                obj.entry_ndx
            )));
        }
        Ok(())
    }

    fn object_span(&self, pool: &PoolHandle, obj: &ObjectHandle) -> Result<(u64, u64)> {
        let ndx = self.check_pool(pool)?;
        self.check_object(ndx, obj)?;
        let obj_nlb = u64::from(self.pools.entries[ndx as usize].obj_nlb);
        let slba = self.geo.slab_lb_off(obj.slab_id) + u64::from(obj.entry_ndx) * obj_nlb;
        Ok((slba, obj_nlb * u64::from(self.geo.lb_nbytes)))
    }

    fn check_transfer(
        &self,
        extent: u64,
        buf_nbytes: usize,
        offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        if nbytes > buf_nbytes {
            return Err(StoreError::OutOfRange(format!(
                "transfer of {nbytes} bytes exceeds the {buf_nbytes}-byte buffer"
            )));
        }
        let end = offset.checked_add(nbytes).ok_or_else(|| {
            StoreError::OutOfRange(format!("transfer end {offset}+{nbytes} overflows"))
        })?;
        if end as u64 > extent {
            return Err(StoreError::OutOfRange(format!(
                "transfer of {nbytes} bytes at offset {offset} exceeds the {extent}-byte object"
            )));
        }
        Ok(())
    }

    /// Read `nbytes` from the object, starting `offset` bytes in, into
    /// the head of `buf`.
    pub fn object_read(
        &mut self,
        pool: &PoolHandle,
        obj: &ObjectHandle,
        buf: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        let (slba, extent) = self.object_span(pool, obj)?;
        self.check_transfer(extent, buf.len(), offset, nbytes)?;
        if nbytes == 0 {
            return Ok(());
        }
        let lb = self.geo.lb_nbytes as usize;
        if offset % lb == 0 && nbytes % lb == 0 {
            return self
                .dev
                .read_at(slba + (offset / lb) as u64, &mut buf[..nbytes]);
        }
        // Unaligned: read the covering block span and copy out.
        let start_lb = offset / lb;
        let end_lb = (offset + nbytes).div_ceil(lb);
        let mut bounce = vec![0u8; (end_lb - start_lb) * lb];
        self.dev.read_at(slba + start_lb as u64, &mut bounce)?;
        let head = offset - start_lb * lb;
        buf[..nbytes].copy_from_slice(&bounce[head..head + nbytes]);
        Ok(())
    }

    /// Write `nbytes` from the head of `buf` into the object, starting
    /// `offset` bytes in.
    ///
    /// Unaligned offsets and lengths take a read-modify-write path over
    /// the covering blocks; aligned transfers go straight through.
    pub fn object_write(
        &mut self,
        pool: &PoolHandle,
        obj: &ObjectHandle,
        buf: &[u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        let (slba, extent) = self.object_span(pool, obj)?;
        self.check_transfer(extent, buf.len(), offset, nbytes)?;
        if nbytes == 0 {
            return Ok(());
        }
        let lb = self.geo.lb_nbytes as usize;
        if offset % lb == 0 && nbytes % lb == 0 {
            return self
                .dev
                .write_at(slba + (offset / lb) as u64, &buf[..nbytes]);
        }
        let start_lb = offset / lb;
        let end_lb = (offset + nbytes).div_ceil(lb);
        let mut bounce = vec![0u8; (end_lb - start_lb) * lb];
        self.dev.read_at(slba + start_lb as u64, &mut bounce)?;
        let head = offset - start_lb * lb;
        bounce[head..head + nbytes].copy_from_slice(&buf[..nbytes]);
        self.dev.write_at(slba + start_lb as u64, &bounce)
    }

    /// Record `obj` as the pool's root reference.
    ///
    /// `flags` is reserved and currently ignored: the root is recorded
    /// unconditionally and persists until overwritten.
    pub fn pool_set_root(
        &mut self,
        pool: &PoolHandle,
        obj: ObjectHandle,
        _flags: RootFlags,
    ) -> Result<()> {
        let ndx = self.check_pool(pool)?;
        self.check_object(ndx, &obj)?;
        self.pools.entries[ndx as usize].root = Some(obj);
        self.dirty = true;
        Ok(())
    }

    /// The pool's root reference; fails with `RootUnset` when none was
    /// ever recorded.
    pub fn pool_get_root(&self, pool: &PoolHandle) -> Result<ObjectHandle> {
        let ndx = self.check_pool(pool)?;
        self.pools.entries[ndx as usize]
            .root
            .ok_or(StoreError::RootUnset)
    }

    /// Durably persist all dirty metadata. The store remains open and
    /// fully usable.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        // Slab entry freelists first: they live with the data, outside
        // the contiguous metadata region.
        self.cache.flush(&mut self.dev, &self.geo)?;

        let lb = self.geo.lb_nbytes as usize;
        let mut buf = vec![0u8; self.geo.meta_nbytes()];
        self.geo.super_block().write(&mut buf)?;
        let pool_off = self.geo.pool_sgmt_lb_off() as usize * lb;
        let slab_off = self.geo.slab_sgmt_lb_off() as usize * lb;
        self.pools
            .write_to(&mut buf[pool_off..slab_off], &self.geo.pool_sgmt, self.geo.lb_nbytes)?;
        self.slabs.write_to(&mut buf[slab_off..])?;
        md_target_of(&mut self.dev, &mut self.md_dev).write_at(0, &buf)?;

        self.dev.sync()?;
        if let Some(md) = &mut self.md_dev {
            md.sync()?;
        }
        self.dirty = false;
        debug!("metadata flushed");
        Ok(())
    }

    /// Flush remaining dirty state and release the device.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

impl Drop for ObjectStore {
    fn drop(&mut self) {
        // Best-effort durability for stores dropped without close();
        // a clean store writes nothing.
        let _ = self.flush();
    }
}

fn md_target_of<'a>(
    dev: &'a mut BlockDevice,
    md_dev: &'a mut Option<BlockDevice>,
) -> &'a mut BlockDevice {
    md_dev.as_mut().unwrap_or(dev)
}
