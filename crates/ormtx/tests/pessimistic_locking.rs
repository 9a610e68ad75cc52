use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use asupersync::runtime::RuntimeBuilder;

use ormtx::prelude::*;
use ormtx::{MemoryConfig, QueryErrorKind};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn expect_err<T>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        Outcome::Ok(_) => panic!("expected an error"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

const SEAT: Entity = Entity::new("Seat", "seats", &["id"], &["id", "holder"]);

fn setup(lock_timeout: Duration) -> (MemoryDatabase, Arc<Pool<MemoryDatabase>>) {
    let db = MemoryDatabase::new(MemoryConfig::default().lock_timeout(lock_timeout));
    db.create_table("seats", &["id"]);
    for id in 1..=2 {
        db.insert_row("seats", &[("id", Value::BigInt(id)), ("holder", Value::Null)])
            .expect("seed seat");
    }
    let pool = Arc::new(Pool::new(db.clone(), PoolConfig::new(4)));
    (db, pool)
}

#[test]
fn no_wait_on_locked_row_fails_immediately() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup(Duration::from_secs(30));

    rt.block_on(async {
        let mut holder = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open");
        let seat = unwrap_outcome(
            holder
                .get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::Wait)
                .await,
        );
        assert!(seat.is_some());

        let mut contender = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open");
        let started = Instant::now();
        let err = expect_err(
            contender
                .get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::NoWait)
                .await,
        );
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(err.is_kind(&FailureKind::LockUnavailable));
        assert!(err.is_kind(&FailureKind::TransactionFailure));

        // Other rows are not affected.
        let other = unwrap_outcome(
            contender
                .get_for_update(&cx, &SEAT, &[Value::BigInt(2)], WaitPolicy::NoWait)
                .await,
        );
        assert!(other.is_some());
        assert_eq!(db.locks_held(), 2);

        unwrap_outcome(contender.exit(&cx, Some(&err)).await);
        unwrap_outcome(holder.exit(&cx, None).await);
    });

    assert_eq!(db.locks_held(), 0);
}

#[test]
fn waiting_lock_request_times_out() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup(Duration::from_millis(150));

    rt.block_on(async {
        let mut holder = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open");
        unwrap_outcome(
            holder
                .for_update(&cx, &SEAT, &[("id", Value::BigInt(1))], WaitPolicy::NoWait)
                .await,
        );

        let mut waiter = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open");
        let started = Instant::now();
        let err = expect_err(
            waiter
                .get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::Wait)
                .await,
        );
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(err.is_kind(&FailureKind::LockTimeout));
        assert!(err.is_retryable());

        unwrap_outcome(waiter.exit(&cx, Some(&err)).await);
        unwrap_outcome(holder.exit(&cx, None).await);
    });

    assert_eq!(db.locks_held(), 0);
}

#[test]
fn waiting_lock_request_is_granted_after_holder_commits() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup(Duration::from_secs(10));

    rt.block_on(async {
        let mut holder = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open");
        let seat = unwrap_outcome(
            holder
                .get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::NoWait)
                .await,
        )
        .expect("seat 1");
        assert_eq!(holder.lock_requests().len(), 1);
        unwrap_outcome(holder.write(&cx, &seat, "holder", "alice").await);

        let (requesting_tx, requesting_rx) = mpsc::channel();
        let waiter_pool = Arc::clone(&pool);
        let waiter = thread::spawn(move || {
            let rt = RuntimeBuilder::current_thread()
                .build()
                .expect("create asupersync runtime");
            let cx = Cx::for_testing();
            rt.block_on(async {
                let mut session = Session::open(waiter_pool, SessionConfig::new()).expect("open");
                requesting_tx.send(()).expect("signal lock request");
                let seat = unwrap_outcome(
                    session
                        .get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::Wait)
                        .await,
                )
                .expect("seat 1");
                let seen = unwrap_outcome(session.read(&cx, &seat, "holder").await);
                let held = session.lock_requests().len();
                unwrap_outcome(session.write(&cx, &seat, "holder", "bob").await);
                let flushed = unwrap_outcome(session.commit(&cx).await);
                let released = session.lock_requests().is_empty()
                    && !session.cache().get(&seat).is_some_and(|o| o.is_locked());
                unwrap_outcome(session.exit(&cx, None).await);
                (seen, held, flushed.checked, released)
            })
        });

        requesting_rx.recv().expect("waiter started");
        thread::sleep(Duration::from_millis(100));
        assert!(!waiter.is_finished());

        unwrap_outcome(holder.commit(&cx).await);
        assert!(holder.lock_requests().is_empty());
        unwrap_outcome(holder.exit(&cx, None).await);

        let (seen, held, checked, released) = waiter.join().expect("waiter thread");
        assert_eq!(seen, Value::Text("alice".into()));
        assert_eq!(held, 1);
        assert_eq!(checked, 0);
        assert!(released);
    });

    assert_eq!(db.locks_held(), 0);
    assert_eq!(
        db.committed_value("seats", &[("id", Value::BigInt(1))], "holder"),
        Some(Value::Text("bob".into()))
    );
}

#[test]
fn locked_rows_are_written_without_version_guards() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup(Duration::from_secs(1));

    rt.block_on(async {
        unwrap_outcome(
            db_session(&cx, &pool, SessionConfig::new(), async |s| {
                let seats = try_outcome!(
                    s.for_update(&cx, &SEAT, &[], WaitPolicy::Wait)
                        .await
                );
                assert_eq!(seats.len(), 2);
                assert_eq!(s.lock_requests().len(), 2);
                for seat in &seats {
                    try_outcome!(s.write(&cx, seat, "holder", "alice").await);
                }
                Outcome::Ok(())
            })
            .await,
        );
    });

    let holders = db.committed_rows("seats", &[("holder", Value::Text("alice".into()))]);
    assert_eq!(holders.len(), 2);
    let checks = db
        .statement_log()
        .iter()
        .filter(|s| matches!(s, ormtx::Statement::Select { lock: None, .. }))
        .count();
    assert_eq!(checks, 0);
}

#[test]
fn backend_deadlock_is_a_retryable_transaction_failure() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup(Duration::from_secs(1));

    rt.block_on(async {
        let mut attempts = 0;
        let db_ref = &db;
        let locked = unwrap_outcome(
            db_session(&cx, &pool, SessionConfig::new().retry(1), async |s| {
                attempts += 1;
                if attempts == 1 {
                    db_ref.fail_next_statement(QueryErrorKind::Deadlock);
                }
                let seat = try_outcome!(
                    s.get_for_update(&cx, &SEAT, &[Value::BigInt(1)], WaitPolicy::Wait)
                        .await
                );
                Outcome::Ok(seat.is_some())
            })
            .await,
        );
        assert!(locked);
        assert_eq!(attempts, 2);
    });
}
