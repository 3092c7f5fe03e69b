#![allow(missing_docs)]

use penumbra::{format, FormatParams, ObjectHandle, ObjectStore, StoreError};
use tempfile::NamedTempFile;

const LB: u64 = 512;

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

#[test]
fn unset_root_fails() {
    let dev = formatted_device(4096, 2, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let pool = store.pool_create("boot", 4).expect("pool");
    assert!(matches!(
        store.pool_get_root(&pool),
        Err(StoreError::RootUnset)
    ));
}

#[test]
fn set_then_get_returns_identical_handle() {
    let dev = formatted_device(4096, 2, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let pool = store.pool_create("boot", 4).expect("pool");
    let obj = store.object_alloc(&pool).expect("alloc");

    store.pool_set_root(&pool, obj, 0).expect("set root");
    let root = store.pool_get_root(&pool).expect("get root");
    assert_eq!(root.slab_id, obj.slab_id);
    assert_eq!(root.entry_ndx, obj.entry_ndx);
}

#[test]
fn root_persists_until_overwritten() {
    let dev = formatted_device(4096, 2, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let pool = store.pool_create("boot", 4).expect("pool");
    let first = store.object_alloc(&pool).expect("first");
    let second = store.object_alloc(&pool).expect("second");

    store.pool_set_root(&pool, first, 0).expect("set first");
    assert_eq!(store.pool_get_root(&pool).unwrap(), first);
    // Unrelated operations leave the root alone.
    let scratch = store.object_alloc(&pool).expect("scratch");
    store.object_free(&pool, scratch).expect("free");
    store.sync().expect("sync");
    assert_eq!(store.pool_get_root(&pool).unwrap(), first);

    store.pool_set_root(&pool, second, 0).expect("overwrite");
    assert_eq!(store.pool_get_root(&pool).unwrap(), second);
}

#[test]
fn per_pool_roots_are_independent() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let p1 = store.pool_create("one", 4).expect("p1");
    let p2 = store.pool_create("two", 4).expect("p2");
    let o1 = store.object_alloc(&p1).expect("o1");

    store.pool_set_root(&p1, o1, 0).expect("set");
    assert!(store.pool_get_root(&p1).is_ok());
    assert!(matches!(
        store.pool_get_root(&p2),
        Err(StoreError::RootUnset)
    ));
}

#[test]
fn root_rejects_foreign_objects() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let p1 = store.pool_create("one", 4).expect("p1");
    let p2 = store.pool_create("two", 4).expect("p2");
    let o2 = store.object_alloc(&p2).expect("o2");

    assert!(matches!(
        store.pool_set_root(&p1, o2, 0),
        Err(StoreError::InvalidArgument(_))
    ));
    let bogus = ObjectHandle {
        slab_id: 9999,
        entry_ndx: 0,
    };
    assert!(store.pool_set_root(&p1, bogus, 0).is_err());
}

#[test]
fn root_survives_close_and_reopen() {
    let dev = formatted_device(4096, 2, 256);
    let obj = {
        let mut store = ObjectStore::open(dev.path()).expect("open");
        let pool = store.pool_create("boot", 4).expect("pool");
        let obj = store.object_alloc(&pool).expect("alloc");
        store.pool_set_root(&pool, obj, 0).expect("set root");
        store.close().expect("close");
        obj
    };

    let store = ObjectStore::open(dev.path()).expect("reopen");
    let pool = store.pool_open("boot").expect("pool");
    assert_eq!(store.pool_get_root(&pool).expect("root"), obj);
}
