#![allow(missing_docs)]

use assert_cmd::cargo::CommandCargoExt;
use penumbra::{format, FormatParams, ObjectStore, StoreError};
use std::process::Command;
use tempfile::NamedTempFile;

const LB: u64 = 512;

fn device_file(nlb: u64) -> NamedTempFile {
    let tmp = NamedTempFile::new().expect("temp file");
    tmp.as_file().set_len(nlb * LB).expect("set_len");
    tmp
}

fn params(dev: &NamedTempFile, npools: u32, slab_nlb: u32) -> FormatParams {
    FormatParams {
        dev_path: dev.path().to_path_buf(),
        md_dev_path: None,
        npools,
        slab_nlb,
        lb_nbytes: None,
    }
}

#[test]
fn capacity_check_gates_formatting() {
    // 10 MiB device at 512-byte blocks: 20 pools of 2000-block slabs
    // do not fit, 1000-block slabs do.
    let dev = device_file(20480);
    let err = format(&params(&dev, 20, 2000)).unwrap_err();
    assert!(matches!(err, StoreError::Format(_)), "got {err:?}");

    let geo = format(&params(&dev, 20, 1000)).expect("smaller slabs fit");
    assert_eq!(geo.npools, 20);
    assert_eq!(geo.nslabs, 20);
}

#[test]
fn format_then_open_reports_layout() {
    let dev = device_file(4096);
    format(&params(&dev, 4, 256)).expect("format");

    let store = ObjectStore::open(dev.path()).expect("open");
    let geo = store.geometry();
    assert_eq!(geo.npools, 4);
    assert_eq!(geo.slab_nlb, 256);
    assert_eq!(geo.lb_nbytes, 512);
    assert_eq!(geo.nlb, 4096);
    assert_eq!(store.free_slab_count(), geo.nslabs);
    assert_eq!(store.pools().count(), 0);
    store.close().expect("close");
}

#[test]
fn reformat_overwrites_previous_layout() {
    let dev = device_file(4096);
    format(&params(&dev, 4, 256)).expect("format");
    {
        let mut store = ObjectStore::open(dev.path()).expect("open");
        store.pool_create("doomed", 2).expect("pool");
        store.close().expect("close");
    }
    format(&params(&dev, 2, 128)).expect("reformat");
    let store = ObjectStore::open(dev.path()).expect("reopen");
    assert_eq!(store.geometry().npools, 2);
    assert_eq!(store.pools().count(), 0);
    assert!(matches!(
        store.pool_open("doomed"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn open_unformatted_device_fails() {
    let dev = device_file(4096);
    assert!(matches!(
        ObjectStore::open(dev.path()),
        Err(StoreError::Open(_))
    ));
}

#[test]
fn open_corrupt_superblock_fails() {
    use std::io::{Seek, SeekFrom, Write};

    let dev = device_file(4096);
    format(&params(&dev, 4, 256)).expect("format");
    {
        let mut f = dev.reopen().expect("reopen backing file");
        f.seek(SeekFrom::Start(0)).unwrap();
        f.write_all(b"not a superblock").unwrap();
        f.sync_all().unwrap();
    }
    assert!(matches!(
        ObjectStore::open(dev.path()),
        Err(StoreError::Open(_))
    ));
}

#[test]
fn open_missing_path_fails() {
    assert!(matches!(
        ObjectStore::open("/nonexistent/penumbra-device"),
        Err(StoreError::Open(_))
    ));
}

#[test]
fn metadata_device_splits_layout() {
    let dev = device_file(4096);
    let md = device_file(512);
    let params = FormatParams {
        dev_path: dev.path().to_path_buf(),
        md_dev_path: Some(md.path().to_path_buf()),
        npools: 2,
        slab_nlb: 128,
        lb_nbytes: None,
    };
    let geo = format(&params).expect("format with md device");
    assert!(geo.has_md_dev);
    // The whole data device is slab space.
    assert_eq!(geo.nslabs, 32);
    assert_eq!(geo.slab_lb_off(0), 0);

    let store = ObjectStore::open_with_md(dev.path(), md.path()).expect("open");
    assert_eq!(store.geometry().nslabs, 32);
    store.close().expect("close");

    // The data device alone carries no layout.
    assert!(matches!(
        ObjectStore::open(dev.path()),
        Err(StoreError::Open(_))
    ));
}

#[test]
fn undersized_metadata_device_fails() {
    let dev = device_file(1 << 20);
    let md = device_file(1);
    let params = FormatParams {
        dev_path: dev.path().to_path_buf(),
        md_dev_path: Some(md.path().to_path_buf()),
        npools: 8,
        slab_nlb: 64,
        lb_nbytes: None,
    };
    assert!(matches!(format(&params), Err(StoreError::Format(_))));
}

#[test]
fn mkfs_binary_formats_and_inspect_reads() {
    let dev = device_file(4096);

    let status = Command::cargo_bin("penumbra-mkfs")
        .expect("mkfs binary")
        .arg(dev.path())
        .args(["--slab-nlb", "256", "--npools", "4", "--verbose"])
        .status()
        .expect("run mkfs");
    assert!(status.success());

    let out = Command::cargo_bin("penumbra-inspect")
        .expect("inspect binary")
        .arg(dev.path())
        .output()
        .expect("run inspect");
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    assert!(text.contains("slab size"), "inspect output: {text}");

    // Capacity failure surfaces as a non-zero exit.
    let status = Command::cargo_bin("penumbra-mkfs")
        .expect("mkfs binary")
        .arg(dev.path())
        .args(["--slab-nlb", "100000"])
        .status()
        .expect("run mkfs");
    assert!(!status.success());
}
