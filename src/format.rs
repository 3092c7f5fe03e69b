//! Device formatting.

use std::path::PathBuf;

use tracing::info;

use crate::device::BlockDevice;
use crate::error::Result;
use crate::geometry::Geometry;
use crate::pool::PoolTable;
use crate::slab::SlabArena;

/// Parameters for [`format`].
#[derive(Debug, Clone)]
pub struct FormatParams {
    /// Data device path.
    pub dev_path: PathBuf,
    /// Optional separate metadata device path.
    pub md_dev_path: Option<PathBuf>,
    /// Number of pools to reserve entries for; `0` reserves one pool
    /// per slab.
    pub npools: u32,
    /// Slab size, in logical blocks.
    pub slab_nlb: u32,
    /// Logical block size override for raw device nodes.
    pub lb_nbytes: Option<u32>,
}

/// Lay out a fresh store on the device.
///
/// Validates that `npools` pools of at least one `slab_nlb`-block slab
/// each, plus the metadata to track them, fit the device; any previous
/// layout is overwritten. Formatting the same parameters twice yields
/// the same layout.
pub fn format(params: &FormatParams) -> Result<Geometry> {
    let mut dev = match params.lb_nbytes {
        Some(lb) => BlockDevice::open_with_block_size(&params.dev_path, lb)?,
        None => BlockDevice::open(&params.dev_path)?,
    };
    let mut md_dev = match &params.md_dev_path {
        Some(path) => Some(match params.lb_nbytes {
            Some(lb) => BlockDevice::open_with_block_size(path, lb)?,
            None => BlockDevice::open(path)?,
        }),
        None => None,
    };

    let geo = Geometry::calc(
        dev.nlb(),
        md_dev.as_ref().map(BlockDevice::nlb),
        params.npools,
        params.slab_nlb,
        dev.lb_nbytes(),
    )?;

    let lb = geo.lb_nbytes as usize;
    let mut buf = vec![0u8; geo.meta_nbytes()];
    geo.super_block().write(&mut buf)?;
    let pool_off = geo.pool_sgmt_lb_off() as usize * lb;
    let slab_off = geo.slab_sgmt_lb_off() as usize * lb;
    PoolTable::new(geo.npools).write_to(&mut buf[pool_off..slab_off], &geo.pool_sgmt, geo.lb_nbytes)?;
    SlabArena::new(geo.nslabs).write_to(&mut buf[slab_off..])?;

    let md_target = md_dev.as_mut().unwrap_or(&mut dev);
    md_target.write_at(0, &buf)?;
    md_target.sync()?;

    info!(
        device = %params.dev_path.display(),
        npools = geo.npools,
        nslabs = geo.nslabs,
        slab_nlb = geo.slab_nlb,
        "device formatted"
    );
    Ok(geo)
}
