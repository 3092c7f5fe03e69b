//! Block device access.
//!
//! A thin, block-granular wrapper over a backing file or raw block
//! device node. All transfers are whole logical blocks; byte-granular
//! access is layered on top by the store via bounce buffers.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};

/// Logical block size assumed for regular files and used as the default
/// when no override is given.
pub const DEFAULT_LB_NBYTES: u32 = 512;

/// An open block store: a fixed logical block size and block count.
#[derive(Debug)]
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    lb_nbytes: u32,
    nlb: u64,
}

impl BlockDevice {
    /// Open the device or file at `path` with the default logical block
    /// size.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_block_size(path, DEFAULT_LB_NBYTES)
    }

    /// Open with an explicit logical block size, for device nodes whose
    /// logical block width differs from the 512-byte default.
    pub fn open_with_block_size<P: AsRef<Path>>(path: P, lb_nbytes: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if lb_nbytes == 0 || !lb_nbytes.is_power_of_two() {
            return Err(StoreError::InvalidArgument(format!(
                "logical block size {lb_nbytes} is not a power of two"
            )));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::Open(format!("cannot open {}: {e}", path.display())))?;

        // Regular file metadata reports the true length; device nodes
        // report 0, so fall back to seeking the end.
        let md_len = file.metadata()?.len();
        let nbytes = if md_len > 0 {
            md_len
        } else {
            let end = file.seek(SeekFrom::End(0))?;
            file.seek(SeekFrom::Start(0))?;
            end
        };
        if nbytes == 0 {
            return Err(StoreError::Open(format!(
                "{} has zero capacity",
                path.display()
            )));
        }
        if nbytes % u64::from(lb_nbytes) != 0 {
            return Err(StoreError::Open(format!(
                "{} length {nbytes} is not a multiple of the {lb_nbytes}B logical block",
                path.display()
            )));
        }
        Ok(Self {
            nlb: nbytes / u64::from(lb_nbytes),
            file,
            path,
            lb_nbytes,
        })
    }

    /// Path this device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Logical block size in bytes.
    pub fn lb_nbytes(&self) -> u32 {
        self.lb_nbytes
    }

    /// Total number of logical blocks.
    pub fn nlb(&self) -> u64 {
        self.nlb
    }

    fn check_range(&self, lba: u64, len: usize, op: &str) -> Result<()> {
        let lb = u64::from(self.lb_nbytes);
        if len as u64 % lb != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "{op} length {len} is not block aligned"
            )));
        }
        let nlb = len as u64 / lb;
        if lba + nlb > self.nlb {
            return Err(StoreError::OutOfRange(format!(
                "{op} of {nlb} blocks at lba {lba} exceeds device ({} blocks)",
                self.nlb
            )));
        }
        Ok(())
    }

    /// Read `buf.len()` bytes (a whole number of blocks) starting at `lba`.
    pub fn read_at(&mut self, lba: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(lba, buf.len(), "read")?;
        self.file
            .seek(SeekFrom::Start(lba * u64::from(self.lb_nbytes)))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Write `buf.len()` bytes (a whole number of blocks) starting at `lba`.
    pub fn write_at(&mut self, lba: u64, buf: &[u8]) -> Result<()> {
        self.check_range(lba, buf.len(), "write")?;
        self.file
            .seek(SeekFrom::Start(lba * u64::from(self.lb_nbytes)))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    /// Flush written data down to the device.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
