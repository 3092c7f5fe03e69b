#![cfg(unix)]
#![allow(missing_docs)]

use std::mem::discriminant;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use assert_cmd::cargo::CommandCargoExt;
use penumbra::daemon::{wait_ready, DaemonClient};
use penumbra::{format, FormatParams, ObjectStore, StoreError};
use tempfile::{NamedTempFile, TempDir};

const LB: u64 = 512;
const READY_TIMEOUT: Duration = Duration::from_secs(30);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn formatted_device(nlb: u64, npools: u32, slab_nlb: u32) -> NamedTempFile {
    let tmp = NamedTempFile::new().expect("temp file");
    tmp.as_file().set_len(nlb * LB).expect("set_len");
    format(&FormatParams {
        dev_path: tmp.path().to_path_buf(),
        md_dev_path: None,
        npools,
        slab_nlb,
        lb_nbytes: None,
    })
    .expect("format");
    tmp
}

struct Daemon {
    child: Child,
    dir: TempDir,
}

impl Daemon {
    fn spawn(dev: &NamedTempFile) -> Self {
        let dir = TempDir::new().expect("socket dir");
        let socket = dir.path().join("penumbra.sock");
        let mut child = Command::cargo_bin("penumbrad")
            .expect("penumbrad binary")
            .arg(dev.path())
            .arg("--socket")
            .arg(&socket)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .expect("spawn penumbrad");
        let stdout = child.stdout.take().expect("stdout pipe");
        wait_ready(stdout, READY_TIMEOUT).expect("daemon readiness");
        Self { child, dir }
    }

    fn socket(&self) -> std::path::PathBuf {
        self.dir.path().join("penumbra.sock")
    }

    fn interrupt(&self) {
        let status = Command::new("kill")
            .args(["-INT", &self.child.id().to_string()])
            .status()
            .expect("send SIGINT");
        assert!(status.success());
    }

    fn wait_exit(&mut self) -> std::process::ExitStatus {
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            if let Some(status) = self.child.try_wait().expect("try_wait") {
                return status;
            }
            assert!(
                Instant::now() < deadline,
                "daemon did not exit within {SHUTDOWN_TIMEOUT:?}"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for Daemon {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn daemon_serves_the_full_operation_surface() {
    let dev = formatted_device(4096, 4, 256);
    let mut daemon = Daemon::spawn(&dev);

    let mut client = DaemonClient::connect(daemon.socket()).expect("connect");
    assert_eq!(client.lb_nbytes(), 512);
    assert_eq!(client.slab_nlb(), 256);

    let pool = client.pool_create("remote", 4).expect("pool_create");
    assert!(matches!(
        client.pool_get_root(&pool),
        Err(StoreError::RootUnset)
    ));

    let obj = client.object_alloc(&pool).expect("object_alloc");
    let payload = b"over the wire";
    client
        .object_write(&pool, &obj, payload, 0, payload.len())
        .expect("object_write");
    let mut readback = vec![0u8; payload.len()];
    client
        .object_read(&pool, &obj, &mut readback, 0, payload.len())
        .expect("object_read");
    assert_eq!(&readback, payload);

    // Error kinds come back intact across the wire.
    let mut big = vec![0u8; 8 * LB as usize];
    let err = client
        .object_read(&pool, &obj, &mut big, 0, 8 * LB as usize)
        .unwrap_err();
    assert!(matches!(err, StoreError::OutOfRange(_)), "got {err:?}");

    client.pool_set_root(&pool, obj, 0).expect("set root");
    assert_eq!(client.pool_get_root(&pool).expect("get root"), obj);

    let spare = client.object_alloc(&pool).expect("alloc");
    client.object_free(&pool, spare).expect("object_free");
    client.sync().expect("sync");
    client.close().expect("close");

    daemon.interrupt();
    assert!(daemon.wait_exit().success());
}

#[test]
fn daemon_serializes_multiple_clients() {
    let dev = formatted_device(4096, 4, 256);
    let mut daemon = Daemon::spawn(&dev);

    let mut first = DaemonClient::connect(daemon.socket()).expect("first client");
    let mut second = DaemonClient::connect(daemon.socket()).expect("second client");

    let pool = first.pool_create("shared", 4).expect("create");
    let seen = second.pool_open("shared").expect("second client sees it");
    assert_eq!(pool, seen);

    // Allocations from both clients against one engine never collide.
    let a = first.object_alloc(&pool).expect("a");
    let b = second.object_alloc(&pool).expect("b");
    assert_ne!(a, b);

    first.close().expect("close first");
    // The engine stays open for the second client.
    let c = second.object_alloc(&pool).expect("c");
    assert_ne!(b, c);
    second.close().expect("close second");

    daemon.interrupt();
    assert!(daemon.wait_exit().success());
}

#[test]
fn daemon_and_direct_mode_agree() {
    // Identically formatted devices, identical operation sequences:
    // direct mode and daemon mode must produce identical observations.
    let direct_dev = formatted_device(4096, 4, 256);
    let daemon_dev = formatted_device(4096, 4, 256);
    let mut daemon = Daemon::spawn(&daemon_dev);

    let mut store = ObjectStore::open(direct_dev.path()).expect("direct open");
    let mut client = DaemonClient::connect(daemon.socket()).expect("connect");

    let payload = b"transparency";
    let mut direct_read = vec![0u8; payload.len()];
    let mut remote_read = vec![0u8; payload.len()];

    // Direct sequence.
    let d_pool = store.pool_create("mirror", 4).expect("pool");
    let d_obj1 = store.object_alloc(&d_pool).expect("alloc 1");
    let d_obj2 = store.object_alloc(&d_pool).expect("alloc 2");
    store.object_free(&d_pool, d_obj1).expect("free 1");
    store
        .object_write(&d_pool, &d_obj2, payload, 0, payload.len())
        .expect("write");
    store
        .object_read(&d_pool, &d_obj2, &mut direct_read, 0, payload.len())
        .expect("read");
    store.pool_set_root(&d_pool, d_obj2, 0).expect("root");
    let d_root = store.pool_get_root(&d_pool).expect("get root");
    let d_err = store
        .object_read(&d_pool, &d_obj2, &mut direct_read, 4096, 64)
        .unwrap_err();

    // The same sequence through the daemon.
    let r_pool = client.pool_create("mirror", 4).expect("pool");
    let r_obj1 = client.object_alloc(&r_pool).expect("alloc 1");
    let r_obj2 = client.object_alloc(&r_pool).expect("alloc 2");
    client.object_free(&r_pool, r_obj1).expect("free 1");
    client
        .object_write(&r_pool, &r_obj2, payload, 0, payload.len())
        .expect("write");
    client
        .object_read(&r_pool, &r_obj2, &mut remote_read, 0, payload.len())
        .expect("read");
    client.pool_set_root(&r_pool, r_obj2, 0).expect("root");
    let r_root = client.pool_get_root(&r_pool).expect("get root");
    let r_err = client
        .object_read(&r_pool, &r_obj2, &mut remote_read, 4096, 64)
        .unwrap_err();

    assert_eq!(d_pool, r_pool);
    assert_eq!(d_obj1, r_obj1);
    assert_eq!(d_obj2, r_obj2);
    assert_eq!(direct_read, remote_read);
    assert_eq!(d_root, r_root);
    assert_eq!(discriminant(&d_err), discriminant(&r_err));

    daemon.interrupt();
    assert!(daemon.wait_exit().success());
}

#[test]
fn interrupt_flushes_state_and_removes_socket() {
    let dev = formatted_device(4096, 4, 256);
    let mut daemon = Daemon::spawn(&dev);
    let socket = daemon.socket();

    let mut client = DaemonClient::connect(&socket).expect("connect");
    let pool = client.pool_create("durable", 4).expect("pool");
    let obj = client.object_alloc(&pool).expect("alloc");
    let payload = b"written then interrupted";
    client
        .object_write(&pool, &obj, payload, 0, payload.len())
        .expect("write");
    client.pool_set_root(&pool, obj, 0).expect("root");
    // No explicit sync: the interrupt path must flush.
    drop(client);

    daemon.interrupt();
    assert!(daemon.wait_exit().success());
    assert!(!socket.exists(), "socket file removed on shutdown");

    // State made it to the device.
    let mut store = ObjectStore::open(dev.path()).expect("direct reopen");
    let pool = store.pool_open("durable").expect("pool persisted");
    let root = store.pool_get_root(&pool).expect("root persisted");
    assert_eq!(root, obj);
    let mut readback = vec![0u8; payload.len()];
    store
        .object_read(&pool, &root, &mut readback, 0, payload.len())
        .expect("read");
    assert_eq!(&readback, payload);

    // And the daemon is really gone.
    assert!(matches!(
        DaemonClient::connect(&socket),
        Err(StoreError::Ipc(_))
    ));
}

#[test]
fn daemon_refuses_occupied_socket_path() {
    let dev = formatted_device(4096, 2, 256);
    let dir = TempDir::new().expect("dir");
    let socket = dir.path().join("taken.sock");
    std::fs::write(&socket, b"occupied").expect("occupy path");

    let out = Command::cargo_bin("penumbrad")
        .expect("penumbrad binary")
        .arg(dev.path())
        .arg("--socket")
        .arg(&socket)
        .output()
        .expect("run penumbrad");
    assert!(!out.status.success());
}

#[test]
fn readiness_wait_is_bounded() {
    // A stream that ends without the ready line reports failure
    // immediately, not a hang.
    let err = wait_ready(std::io::empty(), Duration::from_secs(5)).unwrap_err();
    assert!(matches!(err, StoreError::Ipc(_)));
}
