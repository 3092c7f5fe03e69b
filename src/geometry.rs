//! On-disk geometry: how the formatter carves a device into a
//! superblock region, a pool segment, a slab segment and slab data.
//!
//! Data-device layout (single-device case):
//!
//! ```text
//! | super | pool freelist | pool index | pool entries | slab headers+free list | slab 0 | slab 1 | ...
//! ```
//!
//! With a separate metadata device, everything up to and including the
//! slab segment moves onto it and the data device is slab data only,
//! starting at block 0. Each slab reserves its tail blocks for its own
//! entry freelist; objects are laid out from the slab's first block.

use crate::error::{Result, StoreError};
use crate::freelist;
use crate::index;
use crate::pool::POOL_ENTRY_NBYTES;
use crate::slab::{SLAB_HDR_NBYTES, SLAB_SGMT_TAIL_NBYTES};
use crate::superblock::{SuperBlock, SUPER_NBYTES};

/// Block counts of the three pool segment sections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSegment {
    /// Blocks holding the pool entry freelist bitmap.
    pub freelist_nlb: u32,
    /// Blocks holding the name index.
    pub htbl_nlb: u32,
    /// Bucket count of the name index.
    pub htbl_size: u32,
    /// Blocks holding the pool entries.
    pub entries_nlb: u32,
}

impl PoolSegment {
    /// Total blocks in the pool segment.
    pub fn nlb(&self) -> u32 {
        self.freelist_nlb + self.htbl_nlb + self.entries_nlb
    }
}

/// Complete disk geometry, derived at format time and rebuilt from the
/// superblock on open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Data device capacity in logical blocks.
    pub nlb: u64,
    /// Logical block size in bytes.
    pub lb_nbytes: u32,
    /// Slab size in logical blocks.
    pub slab_nlb: u32,
    /// Number of pool entries.
    pub npools: u32,
    /// Number of slabs.
    pub nslabs: u32,
    /// Blocks reserved for the superblock.
    pub md_nlb: u32,
    /// Pool segment block counts.
    pub pool_sgmt: PoolSegment,
    /// Blocks in the slab header segment.
    pub slab_sgmt_nlb: u32,
    /// Whether metadata lives on a separate device.
    pub has_md_dev: bool,
}

fn ceil_div(nbytes: usize, lb_nbytes: u32) -> u32 {
    (nbytes.div_ceil(lb_nbytes as usize)) as u32
}

/// Pool segment block counts for `npools` pools.
pub fn pool_sgmt_calc(npools: u32, lb_nbytes: u32) -> PoolSegment {
    // Twice as many index buckets as pools: fixed-size tables degrade
    // steeply past ~50% occupancy.
    let htbl_size = npools * 2;
    PoolSegment {
        freelist_nlb: ceil_div(freelist::byte_size(npools), lb_nbytes),
        htbl_nlb: ceil_div(index::byte_size(htbl_size), lb_nbytes),
        htbl_size,
        entries_nlb: ceil_div(npools as usize * POOL_ENTRY_NBYTES, lb_nbytes),
    }
}

/// Blocks needed for `nslabs` slab headers plus free-list bookkeeping.
pub fn slab_sgmt_nlb(nslabs: u32, lb_nbytes: u32) -> u32 {
    ceil_div(
        nslabs as usize * SLAB_HDR_NBYTES + SLAB_SGMT_TAIL_NBYTES,
        lb_nbytes,
    )
}

/// Blocks a slab must reserve for an entry freelist of `nobj` entries.
pub fn slab_flist_nlb(nobj: u32, lb_nbytes: u32) -> u32 {
    ceil_div(freelist::byte_size(nobj), lb_nbytes)
}

/// Number of `obj_nlb`-sized objects a slab can hold once its tail
/// freelist blocks are taken out.
pub fn objs_in_slab(slab_nlb: u32, obj_nlb: u32, lb_nbytes: u32) -> u32 {
    if obj_nlb == 0 || obj_nlb > slab_nlb {
        return 0;
    }
    let mut nobj = slab_nlb / obj_nlb;
    while nobj > 0 {
        let unused = slab_nlb - nobj * obj_nlb;
        if unused >= slab_flist_nlb(nobj, lb_nbytes) {
            break;
        }
        nobj -= 1;
    }
    nobj
}

/// Largest slab count whose data plus header segment fits `blocks`.
fn nslabs_max(blocks: u64, slab_nlb: u32, lb_nbytes: u32) -> u32 {
    let mut nslabs = (blocks / u64::from(slab_nlb)).min(u64::from(u32::MAX)) as u32;
    loop {
        let sgmt = u64::from(slab_sgmt_nlb(nslabs, lb_nbytes));
        if sgmt >= blocks {
            return 0;
        }
        let next = ((blocks - sgmt) / u64::from(slab_nlb)).min(u64::from(u32::MAX)) as u32;
        if next == nslabs {
            return nslabs;
        }
        nslabs = next;
    }
}

impl Geometry {
    /// Compute the geometry for formatting.
    ///
    /// `npools == 0` means "as many pools as slabs". Fails when the
    /// device cannot host a single slab for the requested layout or
    /// when `npools` exceeds the number of slabs that fit.
    pub fn calc(
        dev_nlb: u64,
        md_dev_nlb: Option<u64>,
        npools: u32,
        slab_nlb: u32,
        lb_nbytes: u32,
    ) -> Result<Self> {
        if slab_nlb == 0 {
            return Err(StoreError::Format("slab size must be non-zero".into()));
        }
        let md_nlb = ceil_div(SUPER_NBYTES, lb_nbytes);

        match md_dev_nlb {
            None => Self::calc_single(dev_nlb, npools, slab_nlb, lb_nbytes, md_nlb),
            Some(md_blocks) => {
                Self::calc_with_md(dev_nlb, md_blocks, npools, slab_nlb, lb_nbytes, md_nlb)
            }
        }
    }

    fn calc_single(
        dev_nlb: u64,
        mut npools: u32,
        slab_nlb: u32,
        lb_nbytes: u32,
        md_nlb: u32,
    ) -> Result<Self> {
        let avail = dev_nlb
            .checked_sub(u64::from(md_nlb))
            .ok_or_else(|| StoreError::Format("device smaller than the superblock".into()))?;

        // First pass without the pool segment to bound the pool count.
        let approx = nslabs_max(avail, slab_nlb, lb_nbytes);
        if approx == 0 {
            return Err(StoreError::Format(
                "slab size too large - not enough space to allocate any slabs".into(),
            ));
        }
        if npools > approx {
            return Err(StoreError::Format(format!(
                "{npools} pools requested but at most {approx} slabs fit the device"
            )));
        }
        let inferred = npools == 0;
        if inferred {
            npools = approx;
        }

        let mut pool_sgmt = pool_sgmt_calc(npools, lb_nbytes);
        let avail = avail
            .checked_sub(u64::from(pool_sgmt.nlb()))
            .ok_or_else(|| StoreError::Format("pool segment exceeds device capacity".into()))?;
        let nslabs = nslabs_max(avail, slab_nlb, lb_nbytes);
        if nslabs == 0 {
            return Err(StoreError::Format(
                "slab size too large - not enough space to allocate any slabs".into(),
            ));
        }
        if npools > nslabs {
            if !inferred {
                return Err(StoreError::Format(format!(
                    "every pool needs at least one slab: {npools} pools, {nslabs} slabs"
                )));
            }
            // The inferred pool count overshoots once the pool segment
            // itself takes blocks away; clamp it.
            npools = nslabs;
            pool_sgmt = pool_sgmt_calc(npools, lb_nbytes);
        }

        Ok(Self {
            nlb: dev_nlb,
            lb_nbytes,
            slab_nlb,
            npools,
            nslabs,
            md_nlb,
            pool_sgmt,
            slab_sgmt_nlb: slab_sgmt_nlb(nslabs, lb_nbytes),
            has_md_dev: false,
        })
    }

    fn calc_with_md(
        dev_nlb: u64,
        md_dev_nlb: u64,
        mut npools: u32,
        slab_nlb: u32,
        lb_nbytes: u32,
        md_nlb: u32,
    ) -> Result<Self> {
        let nslabs = (dev_nlb / u64::from(slab_nlb)).min(u64::from(u32::MAX)) as u32;
        if nslabs == 0 {
            return Err(StoreError::Format(
                "slab size too large - not enough space to allocate any slabs".into(),
            ));
        }
        if npools > nslabs {
            return Err(StoreError::Format(format!(
                "every pool needs at least one slab: {npools} pools, {nslabs} slabs"
            )));
        }
        if npools == 0 {
            npools = nslabs;
        }
        let pool_sgmt = pool_sgmt_calc(npools, lb_nbytes);
        let slab_sgmt = slab_sgmt_nlb(nslabs, lb_nbytes);
        let need = u64::from(md_nlb) + u64::from(pool_sgmt.nlb()) + u64::from(slab_sgmt);
        if need > md_dev_nlb {
            return Err(StoreError::Format(format!(
                "metadata needs {need} blocks but the metadata device has {md_dev_nlb}"
            )));
        }
        Ok(Self {
            nlb: dev_nlb,
            lb_nbytes,
            slab_nlb,
            npools,
            nslabs,
            md_nlb,
            pool_sgmt,
            slab_sgmt_nlb: slab_sgmt,
            has_md_dev: true,
        })
    }

    /// Rebuild geometry from a superblock read off an opened device.
    pub fn from_super(dev_nlb: u64, lb_nbytes: u32, sb: &SuperBlock, has_md_dev: bool) -> Self {
        Self {
            nlb: dev_nlb,
            lb_nbytes,
            slab_nlb: sb.slab_nlb,
            npools: sb.npools,
            nslabs: sb.nslabs,
            md_nlb: sb.md_nlb,
            pool_sgmt: pool_sgmt_calc(sb.npools, lb_nbytes),
            slab_sgmt_nlb: slab_sgmt_nlb(sb.nslabs, lb_nbytes),
            has_md_dev,
        }
    }

    /// Superblock mirroring this geometry.
    pub fn super_block(&self) -> SuperBlock {
        SuperBlock {
            npools: self.npools,
            nslabs: self.nslabs,
            slab_nlb: self.slab_nlb,
            md_nlb: self.md_nlb,
        }
    }

    /// First block of the pool segment on the metadata target.
    pub fn pool_sgmt_lb_off(&self) -> u64 {
        u64::from(self.md_nlb)
    }

    /// First block of the slab segment on the metadata target.
    pub fn slab_sgmt_lb_off(&self) -> u64 {
        self.pool_sgmt_lb_off() + u64::from(self.pool_sgmt.nlb())
    }

    /// Total metadata region size, in blocks.
    pub fn meta_nlb(&self) -> u64 {
        self.slab_sgmt_lb_off() + u64::from(self.slab_sgmt_nlb)
    }

    /// Total metadata region size, in bytes.
    pub fn meta_nbytes(&self) -> usize {
        self.meta_nlb() as usize * self.lb_nbytes as usize
    }

    /// First data block of slab `slab_id` on the data device.
    pub fn slab_lb_off(&self, slab_id: u32) -> u64 {
        let base = if self.has_md_dev { 0 } else { self.meta_nlb() };
        base + u64::from(slab_id) * u64::from(self.slab_nlb)
    }
}
