//! Driver contract tests shared by every bundled driver.

use bytes::Bytes;
use shelfdb_storage::{
    ErrorClass, InMemoryDriver, IssuedToken, StorageDriver, StorageResult, TokenCache, WriteOptions,
};
use shelfdb_testkit::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn create_new_never_overwrites() {
    for store in all_stores() {
        let driver = store.driver();
        driver
            .write_file("d/a", Bytes::from_static(b"first"), WriteOptions::create_new())
            .await
            .unwrap();
        let err = driver
            .write_file("d/a", Bytes::from_static(b"second"), WriteOptions::create_new())
            .await
            .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict, "{}", driver.name());
        assert_eq!(&driver.read_file("d/a").await.unwrap()[..], b"first");
    }
}

#[tokio::test]
async fn not_found_is_quiet_where_promised() {
    for store in all_stores() {
        let driver = store.driver();
        driver.unlink("missing").await.unwrap();
        driver.remove_folder("missing-dir").await.unwrap();
        assert!(!driver.exists("missing").await.unwrap());
        assert!(driver.readdir("missing-dir").await.unwrap().is_empty());
        assert!(driver.read_file("missing").await.unwrap_err().is_not_found());
    }
}

#[tokio::test]
async fn rename_replaces_destination() {
    for store in all_stores() {
        let driver = store.driver();
        for (path, data) in [("t.db", "old"), ("t.db~", "new")] {
            driver
                .write_file(path, Bytes::from(data), WriteOptions::default())
                .await
                .unwrap();
        }
        driver.rename("t.db~", "t.db").await.unwrap();
        assert_eq!(&driver.read_file("t.db").await.unwrap()[..], b"new");
        assert!(!driver.exists("t.db~").await.unwrap());
    }
}

#[tokio::test]
async fn readdir_lists_direct_children() {
    for store in all_stores() {
        let driver = store.driver();
        for path in ["dir/a", "dir/b", "dir/sub/c"] {
            driver
                .write_file(path, Bytes::from_static(b"x"), WriteOptions::default())
                .await
                .unwrap();
        }
        let names = driver.readdir("dir").await.unwrap();
        assert_eq!(names, vec!["a", "b", "sub"]);
        assert!(driver.stat("dir/sub").await.unwrap().is_dir());
    }
}

#[tokio::test]
async fn size_covers_objects_and_folders() {
    for store in all_stores() {
        let driver = store.driver();
        for (path, data) in [("t.db", "main"), ("~t.db/rec-1-1.adb", "ab"), ("~t.db/rec-2-2.adb", "cde")] {
            driver
                .write_file(path, Bytes::from(data), WriteOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(driver.size("t.db").await.unwrap(), 4, "{}", driver.name());
        assert_eq!(driver.size("~t.db").await.unwrap(), 5, "{}", driver.name());
        assert_eq!(driver.size("absent").await.unwrap(), 0);
    }
}

#[tokio::test]
async fn default_size_walks_every_page() {
    let memory = InMemoryDriver::new().with_page_size(2);
    for i in 0..5 {
        memory
            .write_file(&format!("dir/f{i}"), Bytes::from_static(b"xy"), WriteOptions::default())
            .await
            .unwrap();
    }
    memory
        .write_file("dir/sub/deep", Bytes::from_static(b"z"), WriteOptions::default())
        .await
        .unwrap();

    // The failure-injecting wrapper does not override `size`, so this runs
    // the trait's stat-and-list walk over a paginated backend.
    let failing = FailingDriver::new(Arc::new(memory));
    assert_eq!(failing.size("dir").await.unwrap(), 11);
    assert_eq!(failing.count(DriverOp::List), 4);
}

#[tokio::test]
async fn expired_session_is_refreshed_once() {
    let store = TestStore::memory();
    let failing = FailingDriver::new(store.driver());
    failing
        .write_file("obj", Bytes::from_static(b"payload"), WriteOptions::default())
        .await
        .unwrap();
    failing.fail_once_with(DriverOp::Read, "obj", FailureMode::SessionExpired);

    let cache = TokenCache::new();
    let logins = AtomicUsize::new(0);
    let refresh = || async {
        let n = logins.fetch_add(1, Ordering::SeqCst);
        StorageResult::Ok(IssuedToken::new(format!("token-{n}"), Duration::from_secs(60)))
    };
    let seen = parking_lot::Mutex::new(Vec::new());

    let data = cache
        .with_token(refresh, |token| {
            seen.lock().push(token);
            failing.read_file("obj")
        })
        .await
        .unwrap();

    assert_eq!(&data[..], b"payload");
    assert_eq!(logins.load(Ordering::SeqCst), 2);
    assert_eq!(*seen.lock(), vec!["token-0", "token-1"]);
    assert_eq!(failing.count(DriverOp::Read), 2);
}

#[tokio::test]
async fn transient_failures_are_not_retried() {
    let failing = Arc::new(FailingDriver::new(TestStore::memory().driver()));
    failing.fail_always(DriverOp::Exists, "");

    let cache = TokenCache::new();
    let result = cache
        .with_token(
            || async { StorageResult::Ok(IssuedToken::new("t", Duration::from_secs(60))) },
            |_| failing.exists("anything"),
        )
        .await;

    assert_eq!(result.unwrap_err().class(), ErrorClass::Transient);
    assert_eq!(failing.count(DriverOp::Exists), 1);
}
