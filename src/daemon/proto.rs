//! Daemon wire protocol.
//!
//! Frames are a 4-byte little-endian length followed by one
//! JSON-encoded [`Request`] or [`Response`]. Errors cross the wire as
//! an [`ErrorKind`] plus message and are rehydrated into the matching
//! [`StoreError`] variant, so daemon-mode callers observe the same
//! error kinds as direct-mode callers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use crate::error::{Result, StoreError};
use crate::model::{ObjectHandle, PoolHandle, RootFlags};

/// Protocol version spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Line the daemon prints on stdout once it is accepting connections.
pub const READY_LINE: &str = "penumbrad: ready for connections";

/// Upper bound on a single frame; larger transfers must be split by
/// the caller.
pub const MAX_FRAME_NBYTES: usize = 4 << 20;

/// Client-to-daemon operations, mirroring the engine surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Protocol handshake.
    Identify,
    /// Engine/device parameters for the client proxy.
    DeviceInfo,
    /// `ObjectStore::pool_create`.
    PoolCreate {
        /// Pool name.
        name: String,
        /// Declared object extent in logical blocks.
        obj_nlb: u32,
    },
    /// `ObjectStore::pool_open`.
    PoolOpen {
        /// Pool name.
        name: String,
    },
    /// `ObjectStore::pool_destroy`.
    PoolDestroy {
        /// Pool to destroy.
        pool: PoolHandle,
    },
    /// `ObjectStore::object_alloc`.
    ObjectAlloc {
        /// Owning pool.
        pool: PoolHandle,
    },
    /// `ObjectStore::object_free`.
    ObjectFree {
        /// Owning pool.
        pool: PoolHandle,
        /// Object to free.
        obj: ObjectHandle,
    },
    /// `ObjectStore::object_read`.
    ObjectRead {
        /// Owning pool.
        pool: PoolHandle,
        /// Object to read.
        obj: ObjectHandle,
        /// Byte offset within the object.
        offset: usize,
        /// Bytes to read.
        nbytes: usize,
    },
    /// `ObjectStore::object_write`.
    ObjectWrite {
        /// Owning pool.
        pool: PoolHandle,
        /// Object to write.
        obj: ObjectHandle,
        /// Byte offset within the object.
        offset: usize,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// `ObjectStore::pool_set_root`.
    SetRoot {
        /// Pool whose root to record.
        pool: PoolHandle,
        /// Root object.
        obj: ObjectHandle,
        /// Reserved flags.
        flags: RootFlags,
    },
    /// `ObjectStore::pool_get_root`.
    GetRoot {
        /// Pool whose root to fetch.
        pool: PoolHandle,
    },
    /// `ObjectStore::sync`.
    Sync,
    /// End this client session; the daemon's engine stays open.
    Close,
}

/// Daemon-to-client replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Response {
    /// Handshake reply.
    Identify {
        /// Daemon's protocol version.
        version: u32,
    },
    /// Engine/device parameters.
    DeviceInfo {
        /// Logical block size of the served device.
        lb_nbytes: u32,
        /// Slab size of the served layout.
        slab_nlb: u32,
    },
    /// A pool handle.
    Pool {
        /// The handle.
        handle: PoolHandle,
    },
    /// An object handle.
    Object {
        /// The handle.
        handle: ObjectHandle,
    },
    /// Bytes read from an object.
    Bytes {
        /// The data.
        data: Vec<u8>,
    },
    /// Operation succeeded with nothing to return.
    Ok,
    /// Operation failed; kind and message relayed verbatim.
    Error {
        /// Failure category.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
}

/// Serializable mirror of the [`StoreError`] variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum ErrorKind {
    Io,
    Format,
    Open,
    AllocationExhausted,
    OutOfRange,
    RootUnset,
    NotFound,
    InvalidArgument,
    Corruption,
    Ipc,
}

/// Split an error into its wire representation.
pub fn encode_error(err: &StoreError) -> (ErrorKind, String) {
    let kind = match err {
        StoreError::Io(_) => ErrorKind::Io,
        StoreError::Format(_) => ErrorKind::Format,
        StoreError::Open(_) => ErrorKind::Open,
        StoreError::AllocationExhausted(_) => ErrorKind::AllocationExhausted,
        StoreError::OutOfRange(_) => ErrorKind::OutOfRange,
        StoreError::RootUnset => ErrorKind::RootUnset,
        StoreError::NotFound(_) => ErrorKind::NotFound,
        StoreError::InvalidArgument(_) => ErrorKind::InvalidArgument,
        StoreError::Corruption(_) => ErrorKind::Corruption,
        StoreError::Ipc(_) => ErrorKind::Ipc,
    };
    (kind, err.to_string())
}

/// Rehydrate a wire error into the matching [`StoreError`] variant.
pub fn decode_error(kind: ErrorKind, message: String) -> StoreError {
    match kind {
        ErrorKind::Io => StoreError::Ipc(format!("remote I/O error: {message}")),
        ErrorKind::Format => StoreError::Format(message),
        ErrorKind::Open => StoreError::Open(message),
        ErrorKind::AllocationExhausted => StoreError::AllocationExhausted(message),
        ErrorKind::OutOfRange => StoreError::OutOfRange(message),
        ErrorKind::RootUnset => StoreError::RootUnset,
        ErrorKind::NotFound => StoreError::NotFound(message),
        ErrorKind::InvalidArgument => StoreError::InvalidArgument(message),
        ErrorKind::Corruption => StoreError::Corruption(message),
        ErrorKind::Ipc => StoreError::Ipc(message),
    }
}

/// Write one length-prefixed frame to a blocking stream.
pub fn write_frame<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| StoreError::Ipc(e.to_string()))?;
    if body.len() > MAX_FRAME_NBYTES {
        return Err(StoreError::Ipc(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_NBYTES}-byte limit",
            body.len()
        )));
    }
    writer.write_all(&(body.len() as u32).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Read one length-prefixed frame from a blocking stream.
pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_NBYTES {
        return Err(StoreError::Ipc(format!(
            "peer announced a {len}-byte frame, limit is {MAX_FRAME_NBYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    serde_json::from_slice(&body).map_err(|e| StoreError::Ipc(format!("malformed frame: {e}")))
}
