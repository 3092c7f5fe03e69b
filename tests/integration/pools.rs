#![allow(missing_docs)]

use penumbra::{format, FormatParams, ObjectStore, StoreError};
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
fn create_then_open_returns_same_pool() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    let created = store.pool_create("events", 4).expect("create");
    let opened = store.pool_open("events").expect("open pool");
    assert_eq!(created, opened);

    assert!(matches!(
        store.pool_open("missing"),
        Err(StoreError::NotFound(_))
    ));
}

#[test]
fn duplicate_create_honours_object_size() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    let first = store.pool_create("events", 4).expect("create");
    let again = store.pool_create("events", 4).expect("same size is idempotent");
    assert_eq!(first, again);

    assert!(matches!(
        store.pool_create("events", 8),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn pool_name_is_validated() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    assert!(store.pool_create("", 4).is_err());
    let long = "x".repeat(200);
    assert!(store.pool_create(&long, 4).is_err());
}

#[test]
fn oversized_objects_are_rejected() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    // An object larger than a slab can never be allocated.
    assert!(matches!(
        store.pool_create("big", 512),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn pool_table_exhaustion() {
    let dev = formatted_device(4096, 2, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    store.pool_create("one", 2).expect("one");
    store.pool_create("two", 2).expect("two");
    assert!(matches!(
        store.pool_create("three", 2),
        Err(StoreError::AllocationExhausted(_))
    ));
}

#[test]
fn destroy_requires_all_objects_freed() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");
    let free_before = store.free_slab_count();

    let pool = store.pool_create("scratch", 2).expect("create");
    let obj = store.object_alloc(&pool).expect("alloc");
    assert!(store.pool_destroy(pool).is_err());

    store.object_free(&pool, obj).expect("free");
    store.pool_destroy(pool).expect("destroy");
    assert!(matches!(
        store.pool_open("scratch"),
        Err(StoreError::NotFound(_))
    ));
    assert_eq!(store.free_slab_count(), free_before);

    // The handle is dead after destroy.
    assert!(store.object_alloc(&pool).is_err());
}

#[test]
fn destroyed_name_can_be_recreated() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    let pool = store.pool_create("cycle", 2).expect("create");
    store.pool_destroy(pool).expect("destroy");
    let again = store.pool_create("cycle", 8).expect("recreate with a new size");
    assert_eq!(store.object_nbytes(&again).unwrap(), 8 * LB);
}

#[test]
fn pools_persist_across_reopen() {
    let dev = formatted_device(4096, 4, 256);
    {
        let mut store = ObjectStore::open(dev.path()).expect("open");
        store.pool_create("alpha", 2).expect("alpha");
        store.pool_create("beta", 8).expect("beta");
        store.sync().expect("sync");
        store.close().expect("close");
    }

    let store = ObjectStore::open(dev.path()).expect("reopen");
    assert_eq!(store.pools().count(), 2);
    let alpha = store.pool_open("alpha").expect("alpha survives");
    let beta = store.pool_open("beta").expect("beta survives");
    assert_eq!(store.object_nbytes(&alpha).unwrap(), 2 * LB);
    assert_eq!(store.object_nbytes(&beta).unwrap(), 8 * LB);
}

#[test]
fn multi_pool_slabs_stay_disjoint() {
    let dev = formatted_device(4096, 4, 256);
    let mut store = ObjectStore::open(dev.path()).expect("open");

    let p1 = store.pool_create("p1", 2).expect("p1");
    let p2 = store.pool_create("p2", 2).expect("p2");
    let o1 = store.object_alloc(&p1).expect("alloc p1");
    let o2 = store.object_alloc(&p2).expect("alloc p2");
    assert_ne!(o1.slab_id, o2.slab_id, "pools never share a slab");

    // Cross-pool handles are rejected.
    assert!(matches!(
        store.object_free(&p1, o2),
        Err(StoreError::InvalidArgument(_))
    ));
}
