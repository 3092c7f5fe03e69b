//! Synchronous client proxy for a running daemon.

use std::io::{BufRead, BufReader, Read};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::proto::{self, Request, Response, PROTOCOL_VERSION, READY_LINE};
use crate::error::{Result, StoreError};
use crate::model::{ObjectHandle, PoolHandle, RootFlags};

/// Proxy exposing the engine operations of a daemon-hosted store.
///
/// One request is in flight at a time; the daemon serializes requests
/// from all clients against its single engine instance, so a sequence
/// of operations through this proxy observes the same results as the
/// same sequence against a directly opened store.
#[derive(Debug)]
pub struct DaemonClient {
    stream: UnixStream,
    lb_nbytes: u32,
    slab_nlb: u32,
}

impl DaemonClient {
    /// Connect to a daemon listening on `socket_path` and handshake.
    pub fn connect<P: AsRef<Path>>(socket_path: P) -> Result<Self> {
        let stream = UnixStream::connect(socket_path.as_ref()).map_err(|e| {
            StoreError::Ipc(format!(
                "daemon unreachable at {}: {e}",
                socket_path.as_ref().display()
            ))
        })?;
        let mut client = Self {
            stream,
            lb_nbytes: 0,
            slab_nlb: 0,
        };
        match client.call(Request::Identify)? {
            Response::Identify { version } if version == PROTOCOL_VERSION => {}
            Response::Identify { version } => {
                return Err(StoreError::Ipc(format!(
                    "daemon speaks protocol {version}, client speaks {PROTOCOL_VERSION}"
                )))
            }
            other => return Err(unexpected(&other)),
        }
        match client.call(Request::DeviceInfo)? {
            Response::DeviceInfo {
                lb_nbytes,
                slab_nlb,
            } => {
                client.lb_nbytes = lb_nbytes;
                client.slab_nlb = slab_nlb;
            }
            other => return Err(unexpected(&other)),
        }
        Ok(client)
    }

    /// Logical block size of the daemon's device.
    pub fn lb_nbytes(&self) -> u32 {
        self.lb_nbytes
    }

    /// Slab size of the daemon's layout, in logical blocks.
    pub fn slab_nlb(&self) -> u32 {
        self.slab_nlb
    }

    fn call(&mut self, req: Request) -> Result<Response> {
        proto::write_frame(&mut self.stream, &req)?;
        let resp: Response = proto::read_frame(&mut self.stream)?;
        if let Response::Error { kind, message } = resp {
            return Err(proto::decode_error(kind, message));
        }
        Ok(resp)
    }

    /// Remote `pool_create`.
    pub fn pool_create(&mut self, name: &str, obj_nlb: u32) -> Result<PoolHandle> {
        match self.call(Request::PoolCreate {
            name: name.to_string(),
            obj_nlb,
        })? {
            Response::Pool { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `pool_open`.
    pub fn pool_open(&mut self, name: &str) -> Result<PoolHandle> {
        match self.call(Request::PoolOpen {
            name: name.to_string(),
        })? {
            Response::Pool { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `pool_destroy`.
    pub fn pool_destroy(&mut self, pool: PoolHandle) -> Result<()> {
        match self.call(Request::PoolDestroy { pool })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `object_alloc`.
    pub fn object_alloc(&mut self, pool: &PoolHandle) -> Result<ObjectHandle> {
        match self.call(Request::ObjectAlloc { pool: *pool })? {
            Response::Object { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `object_free`.
    pub fn object_free(&mut self, pool: &PoolHandle, obj: ObjectHandle) -> Result<()> {
        match self.call(Request::ObjectFree { pool: *pool, obj })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `object_read` into the head of `buf`.
    pub fn object_read(
        &mut self,
        pool: &PoolHandle,
        obj: &ObjectHandle,
        buf: &mut [u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        // The daemon cannot see the caller's buffer; enforce the
        // buffer-capacity contract on this side of the wire.
        if nbytes > buf.len() {
            return Err(StoreError::OutOfRange(format!(
                "transfer of {nbytes} bytes exceeds the {}-byte buffer",
                buf.len()
            )));
        }
        match self.call(Request::ObjectRead {
            pool: *pool,
            obj: *obj,
            offset,
            nbytes,
        })? {
            Response::Bytes { data } if data.len() == nbytes => {
                buf[..nbytes].copy_from_slice(&data);
                Ok(())
            }
            Response::Bytes { data } => Err(StoreError::Ipc(format!(
                "daemon returned {} bytes, expected {nbytes}",
                data.len()
            ))),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `object_write` from the head of `buf`.
    pub fn object_write(
        &mut self,
        pool: &PoolHandle,
        obj: &ObjectHandle,
        buf: &[u8],
        offset: usize,
        nbytes: usize,
    ) -> Result<()> {
        if nbytes > buf.len() {
            return Err(StoreError::OutOfRange(format!(
                "transfer of {nbytes} bytes exceeds the {}-byte buffer",
                buf.len()
            )));
        }
        match self.call(Request::ObjectWrite {
            pool: *pool,
            obj: *obj,
            offset,
            data: buf[..nbytes].to_vec(),
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `pool_set_root`.
    pub fn pool_set_root(
        &mut self,
        pool: &PoolHandle,
        obj: ObjectHandle,
        flags: RootFlags,
    ) -> Result<()> {
        match self.call(Request::SetRoot {
            pool: *pool,
            obj,
            flags,
        })? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `pool_get_root`.
    pub fn pool_get_root(&mut self, pool: &PoolHandle) -> Result<ObjectHandle> {
        match self.call(Request::GetRoot { pool: *pool })? {
            Response::Object { handle } => Ok(handle),
            other => Err(unexpected(&other)),
        }
    }

    /// Remote `sync`.
    pub fn sync(&mut self) -> Result<()> {
        match self.call(Request::Sync)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// End this session. The daemon and its engine stay up for other
    /// clients.
    pub fn close(mut self) -> Result<()> {
        match self.call(Request::Close)? {
            Response::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}

fn unexpected(resp: &Response) -> StoreError {
    StoreError::Ipc(format!("unexpected daemon response: {resp:?}"))
}

/// Scan a daemon's stdout for the readiness line, bounded by `timeout`.
///
/// Launchers must call this (or an equivalent) before connecting;
/// expiry of the timeout is fatal, not retried.
pub fn wait_ready<R>(reader: R, timeout: Duration) -> Result<()>
where
    R: Read + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let lines = BufReader::new(reader).lines();
        for line in lines {
            match line {
                Ok(line) if line.trim() == READY_LINE => {
                    let _ = tx.send(true);
                    return;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        let _ = tx.send(false);
    });
    match rx.recv_timeout(timeout) {
        Ok(true) => Ok(()),
        Ok(false) => Err(StoreError::Ipc(
            "daemon exited before signalling readiness".into(),
        )),
        Err(_) => Err(StoreError::Ipc(format!(
            "daemon not ready within {timeout:?}"
        ))),
    }
}
