//! Error taxonomy for the allocator.

use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Failures surfaced by the store, the formatter and the transport layer.
///
/// None of these are retried internally; every operation reports its
/// failure to the caller exactly once.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying device or socket I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The requested layout does not fit the device.
    #[error("format failed: {0}")]
    Format(String),
    /// No valid layout on the device, or the device is unreachable.
    #[error("open failed: {0}")]
    Open(String),
    /// No free entry or slab is left to satisfy an allocation.
    #[error("allocation exhausted: {0}")]
    AllocationExhausted(String),
    /// An I/O request falls outside the object extent, or the supplied
    /// buffer is too small for the transfer.
    #[error("out of range: {0}")]
    OutOfRange(String),
    /// The pool has no root object recorded.
    #[error("pool has no root object set")]
    RootUnset,
    /// Named entity does not exist.
    #[error("{0} not found")]
    NotFound(String),
    /// Caller-supplied argument or handle is invalid.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// On-disk metadata is inconsistent.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Daemon transport failure: unreachable socket, malformed frame or
    /// a missed readiness/shutdown deadline.
    #[error("ipc error: {0}")]
    Ipc(String),
}
