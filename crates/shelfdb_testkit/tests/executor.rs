//! Integration tests for operation queuing through the datastore.

use parking_lot::Mutex;
use serde_json::json;
use shelfdb_core::{CoreError, CoreResult, Executor, ExecutorState, Query, Request, Response};
use shelfdb_testkit::prelude::*;
use std::sync::Arc;
use tokio::sync::oneshot;

#[tokio::test]
async fn missing_sink_is_a_no_op() {
    let executor = Executor::new_ready();
    executor.push("silent", || async { Ok(1) }, None, false);
    executor.push(
        "failing",
        || async { Err::<(), _>(CoreError::invalid_operation("nobody listens")) },
        None,
        false,
    );
    assert_eq!(executor.schedule("after", || async { Ok(2) }).await.unwrap(), 2);
}

#[tokio::test]
async fn panicking_sink_does_not_stop_the_queue() {
    init_tracing();
    let executor = Executor::new_ready();
    let log = Arc::new(Mutex::new(Vec::new()));

    let l = Arc::clone(&log);
    executor.push(
        "a",
        move || async move {
            l.lock().push("a");
            Ok(())
        },
        Some(Box::new(|_: CoreResult<()>| panic!("sink exploded"))),
        false,
    );
    let l = Arc::clone(&log);
    let b = executor.schedule("b", move || async move {
        l.lock().push("b");
        Ok(())
    });
    let l = Arc::clone(&log);
    let c = executor.schedule("c", move || async move {
        l.lock().push("c");
        Ok(())
    });

    b.await.unwrap();
    c.await.unwrap();
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
}

#[tokio::test]
async fn long_queue_drains_without_growing_the_stack() {
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    db.insert(doc(json!({"_id": "only"}))).await.unwrap();

    let pending: Vec<_> = (0..1001).map(|_| db.find(Query::all())).collect();
    for p in pending {
        assert_eq!(p.await.unwrap().len(), 1);
    }
}

#[tokio::test]
async fn submitted_inserts_without_sink_still_persist() {
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    for i in 0..10 {
        db.submit(Request::Insert(vec![doc(json!({"n": i}))]), None);
    }
    assert_eq!(db.count(Query::all()).await.unwrap(), 10);

    let reopened = store.open_datastore("t.db").await;
    assert_eq!(reopened.get_all_data().len(), 10);
}

#[tokio::test]
async fn sinks_fire_in_submission_order() {
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();

    for i in 0..5 {
        let order = Arc::clone(&order);
        db.submit(
            Request::Insert(vec![doc(json!({"n": i}))]),
            Some(Box::new(move |r: CoreResult<Response>| {
                assert!(r.is_ok());
                order.lock().push(i);
            })),
        );
    }
    db.submit(
        Request::Count(Query::all()),
        Some(Box::new(move |r| {
            let _ = done_tx.send(r);
        })),
    );

    assert_eq!(done_rx.await.unwrap().unwrap(), Response::Counted(5));
    assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn operations_report_errors_through_sink() {
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    let (tx, rx) = oneshot::channel();
    db.submit(
        Request::Insert(vec![doc(json!({"$bad": 1}))]),
        Some(Box::new(move |r| {
            let _ = tx.send(r);
        })),
    );
    assert!(matches!(rx.await.unwrap(), Err(CoreError::InvalidDocument { .. })));
}

#[tokio::test]
async fn executor_goes_idle_after_draining() {
    let store = TestStore::memory();
    let db = store.open_datastore("t.db").await;
    for i in 0..20 {
        db.submit(Request::Insert(vec![doc(json!({"n": i}))]), None);
    }
    db.count(Query::all()).await.unwrap();
    for _ in 0..100 {
        if db.executor().state() == ExecutorState::Idle {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(db.executor().state(), ExecutorState::Idle);
}
