//! Daemon server: hosts one engine instance behind a unix socket.
//!
//! All client operations funnel through a single mutex around the one
//! `ObjectStore`, making the daemon the sole arbiter of ordering for a
//! shared device. An interrupt or terminate signal stops the accept
//! loop, flushes the engine and removes the socket before exit.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

use super::proto::{
    self, ErrorKind, Request, Response, MAX_FRAME_NBYTES, PROTOCOL_VERSION, READY_LINE,
};
use crate::error::{Result, StoreError};
use crate::store::ObjectStore;

/// Daemon launch parameters.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Data device path.
    pub dev_path: PathBuf,
    /// Optional separate metadata device path.
    pub md_dev_path: Option<PathBuf>,
    /// Unix socket path to listen on.
    pub socket_path: PathBuf,
}

type SharedStore = Arc<Mutex<Option<ObjectStore>>>;

/// Open the device and serve it until interrupted.
///
/// Prints [`READY_LINE`] on stdout once the socket is accepting
/// connections; launchers must wait for it before connecting.
pub async fn run(cfg: DaemonConfig) -> Result<()> {
    if cfg.socket_path.exists() {
        return Err(StoreError::InvalidArgument(format!(
            "socket path {} already exists",
            cfg.socket_path.display()
        )));
    }
    let store = match &cfg.md_dev_path {
        Some(md) => ObjectStore::open_with_md(&cfg.dev_path, md)?,
        None => ObjectStore::open(&cfg.dev_path)?,
    };
    let engine: SharedStore = Arc::new(Mutex::new(Some(store)));

    let listener = UnixListener::bind(&cfg.socket_path)
        .map_err(|e| StoreError::Ipc(format!("cannot bind {}: {e}", cfg.socket_path.display())))?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    println!("{READY_LINE}");
    std::io::stdout().flush()?;
    info!(socket = %cfg.socket_path.display(), "serving");

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let engine = engine.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, engine).await {
                            debug!("client session ended: {e}");
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {e}");
                    break;
                }
            },
            _ = sigint.recv() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("terminate received, shutting down");
                break;
            }
        }
    }

    drop(listener);
    // Closing flushes dirty metadata; a request already holding the
    // lock finishes first.
    let store = engine.lock().take();
    if let Some(store) = store {
        store.close()?;
    }
    if let Err(e) = std::fs::remove_file(&cfg.socket_path) {
        warn!("could not remove socket file: {e}");
    }
    info!("shut down");
    Ok(())
}

async fn handle_client(mut stream: UnixStream, engine: SharedStore) -> Result<()> {
    loop {
        let req: Request = match read_frame_async(&mut stream).await {
            Ok(req) => req,
            // Peer hung up between requests.
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        };
        let closing = matches!(req, Request::Close);
        let resp = dispatch(req, &engine);
        write_frame_async(&mut stream, &resp).await?;
        if closing {
            return Ok(());
        }
    }
}

fn error_response(err: &StoreError) -> Response {
    let (kind, message) = proto::encode_error(err);
    Response::Error { kind, message }
}

fn ok_or_error(result: Result<Response>) -> Response {
    result.unwrap_or_else(|e| error_response(&e))
}

fn dispatch(req: Request, engine: &SharedStore) -> Response {
    if let Request::Identify = req {
        return Response::Identify {
            version: PROTOCOL_VERSION,
        };
    }
    let mut guard = engine.lock();
    let Some(store) = guard.as_mut() else {
        return Response::Error {
            kind: ErrorKind::Ipc,
            message: "daemon is shutting down".into(),
        };
    };
    match req {
        Request::Identify => unreachable!("handled above"),
        Request::DeviceInfo => Response::DeviceInfo {
            lb_nbytes: store.lb_nbytes(),
            slab_nlb: store.geometry().slab_nlb,
        },
        Request::PoolCreate { name, obj_nlb } => ok_or_error(
            store
                .pool_create(&name, obj_nlb)
                .map(|handle| Response::Pool { handle }),
        ),
        Request::PoolOpen { name } => ok_or_error(
            store
                .pool_open(&name)
                .map(|handle| Response::Pool { handle }),
        ),
        Request::PoolDestroy { pool } => {
            ok_or_error(store.pool_destroy(pool).map(|()| Response::Ok))
        }
        Request::ObjectAlloc { pool } => ok_or_error(
            store
                .object_alloc(&pool)
                .map(|handle| Response::Object { handle }),
        ),
        Request::ObjectFree { pool, obj } => {
            ok_or_error(store.object_free(&pool, obj).map(|()| Response::Ok))
        }
        Request::ObjectRead {
            pool,
            obj,
            offset,
            nbytes,
        } => {
            if nbytes > MAX_FRAME_NBYTES {
                return error_response(&StoreError::Ipc(format!(
                    "read of {nbytes} bytes exceeds the frame limit"
                )));
            }
            let mut data = vec![0u8; nbytes];
            ok_or_error(
                store
                    .object_read(&pool, &obj, &mut data, offset, nbytes)
                    .map(|()| Response::Bytes { data }),
            )
        }
        Request::ObjectWrite {
            pool,
            obj,
            offset,
            data,
        } => ok_or_error(
            store
                .object_write(&pool, &obj, &data, offset, data.len())
                .map(|()| Response::Ok),
        ),
        Request::SetRoot { pool, obj, flags } => {
            ok_or_error(store.pool_set_root(&pool, obj, flags).map(|()| Response::Ok))
        }
        Request::GetRoot { pool } => ok_or_error(
            store
                .pool_get_root(&pool)
                .map(|handle| Response::Object { handle }),
        ),
        Request::Sync => ok_or_error(store.sync().map(|()| Response::Ok)),
        Request::Close => Response::Ok,
    }
}

async fn read_frame_async<T: DeserializeOwned>(stream: &mut UnixStream) -> Result<T> {
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > MAX_FRAME_NBYTES {
        return Err(StoreError::Ipc(format!(
            "peer announced a {len}-byte frame, limit is {MAX_FRAME_NBYTES}"
        )));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    serde_json::from_slice(&body).map_err(|e| StoreError::Ipc(format!("malformed frame: {e}")))
}

async fn write_frame_async<T: Serialize>(stream: &mut UnixStream, msg: &T) -> Result<()> {
    let body = serde_json::to_vec(msg).map_err(|e| StoreError::Ipc(e.to_string()))?;
    stream.write_all(&(body.len() as u32).to_le_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}
