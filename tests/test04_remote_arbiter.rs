use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use sqlite_arbiter::test_utils::StubEngine;
use sqlite_arbiter::{LockArbiter, ResultSet, RowValue, SqliteArbiterError};

fn single_row(column: &str, value: RowValue) -> ResultSet {
    let mut result = ResultSet::with_capacity(1);
    result.set_column_names(Arc::new(vec![column.to_string()]));
    result.push_values(vec![value]);
    result
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shared_holders_from_different_contexts_run_concurrently() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine);
    let conn_a = handle.connect("ctx-a");
    let conn_b = handle.connect("ctx-b");

    // Both callbacks must be inside their locks at the same time to pass
    // the barrier; serialized shared grants would deadlock here.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));

    let barrier_a = Arc::clone(&barrier);
    let a = tokio::spawn(async move {
        conn_a
            .read_lock(Some(Duration::from_secs(1)), |_ctx| async move {
                barrier_a.wait().await;
                Ok(())
            })
            .await
    });
    let barrier_b = Arc::clone(&barrier);
    let b = tokio::spawn(async move {
        conn_b
            .read_lock(Some(Duration::from_secs(1)), |_ctx| async move {
                barrier_b.wait().await;
                Ok(())
            })
            .await
    });

    a.await.expect("task").expect("shared lock a");
    b.await.expect("task").expect("shared lock b");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_waits_for_every_shared_holder() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine);
    let shared_done = Arc::new(AtomicUsize::new(0));

    let mut holders = Vec::new();
    for label in ["ctx-a", "ctx-b"] {
        let conn = handle.connect(label);
        let shared_done = Arc::clone(&shared_done);
        holders.push(tokio::spawn(async move {
            conn.read_lock(None, |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                shared_done.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    let writer = handle.connect("ctx-w");
    let shared_done_at_write = Arc::clone(&shared_done);
    writer
        .write_lock(None, |_tx| async move {
            assert_eq!(shared_done_at_write.load(Ordering::SeqCst), 2);
            Ok(())
        })
        .await
        .expect("exclusive lock");

    for holder in holders {
        holder.await.expect("task").expect("shared lock");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_request_times_out_while_shared_is_held() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine);

    let reader = handle.connect("ctx-r");
    let holder = tokio::spawn(async move {
        reader
            .read_lock(None, |_ctx| async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                Ok(())
            })
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    let writer = handle.connect("ctx-w");
    let err = writer
        .write_lock(Some(Duration::from_millis(10)), |_tx| async move { Ok(()) })
        .await
        .expect_err("shared held elsewhere");
    assert!(matches!(err, SqliteArbiterError::LockTimeout(_)));

    holder.await.expect("task").expect("shared lock");

    // The timed-out request must not leave a phantom grant behind.
    writer
        .write_lock(Some(Duration::from_millis(200)), |_tx| async move { Ok(()) })
        .await
        .expect("exclusive lock after shared release");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grant_racing_a_timed_out_request_is_released() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine);
    let holder = Arc::new(handle.connect("ctx-hold"));
    let contender = handle.connect("ctx-race");
    let verifier = handle.connect("ctx-verify");

    // The holder releases right at the contender's deadline, so the grant
    // can arrive exactly as the contender's wait expires. Whichever way that
    // race lands, the lock must remain acquirable afterwards.
    for _ in 0..200 {
        let conn = Arc::clone(&holder);
        let hold = tokio::spawn(async move {
            conn.write_lock(None, |_tx| async move {
                tokio::time::sleep(Duration::from_millis(2)).await;
                Ok(())
            })
            .await
        });
        tokio::task::yield_now().await;

        let _ = contender
            .write_lock(Some(Duration::from_millis(2)), |_tx| async move { Ok(()) })
            .await;

        hold.await.expect("task").expect("held write lock");
        verifier
            .write_lock(Some(Duration::from_millis(500)), |_tx| async move { Ok(()) })
            .await
            .expect("lock must remain acquirable after a timed-out request");
    }
}

#[tokio::test]
async fn statements_run_on_the_arbiter_owned_engine() {
    let engine = StubEngine::new("shared-db");
    engine.script_select(
        "SELECT name FROM users WHERE id = ?1",
        single_row("name", RowValue::Text("alice".into())),
    );
    let handle = LockArbiter::spawn(engine.clone());
    let conn = handle.connect("ctx-a");

    let row = conn
        .read_lock(None, |ctx| async move {
            ctx.get("SELECT name FROM users WHERE id = ?1", &[RowValue::Int(1)])
                .await
        })
        .await
        .expect("read lock");
    assert_eq!(row.get("name"), Some(&RowValue::Text("alice".into())));

    conn.write_lock(None, |tx| async move {
        tx.execute(
            "INSERT INTO users (name) VALUES (?1)",
            &[RowValue::Text("bob".into())],
        )
        .await
        .map(|_| ())
    })
    .await
    .expect("write lock");
    assert_eq!(engine.executed().len(), 1);
}

#[tokio::test]
async fn autocommit_is_probed_through_the_arbiter() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine.clone());
    let conn = handle.connect("ctx-a");

    assert!(conn.get_autocommit().await.expect("autocommit"));
    engine.set_autocommit(false);
    assert!(!conn.get_autocommit().await.expect("autocommit"));
}

#[tokio::test]
async fn callback_error_still_releases_the_remote_lock() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine);
    let conn = handle.connect("ctx-a");

    let err = conn
        .write_lock(None, |_tx| async move {
            Err::<(), _>(SqliteArbiterError::Execution("boom".into()))
        })
        .await
        .expect_err("callback error propagates");
    assert!(matches!(err, SqliteArbiterError::Execution(_)));

    conn.write_lock(Some(Duration::from_millis(200)), |_tx| async move { Ok(()) })
        .await
        .expect("lock free again after failed callback");
}

#[tokio::test]
async fn shutdown_disposes_the_engine_and_fails_later_calls() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine.clone());
    let conn = handle.connect("ctx-a");

    handle.shutdown().await.expect("shutdown");
    assert!(engine.is_disposed());

    let err = conn
        .read_lock(None, |_ctx| async move { Ok(()) })
        .await
        .expect_err("arbiter gone");
    assert!(matches!(err, SqliteArbiterError::Protocol(_)));
}

#[tokio::test]
async fn dropping_every_handle_disposes_the_engine() {
    let engine = StubEngine::new("shared-db");
    let handle = LockArbiter::spawn(engine.clone());
    let conn = handle.connect("ctx-a");

    drop(conn);
    drop(handle);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(engine.is_disposed());
}
