use asupersync::runtime::RuntimeBuilder;

use ormtx::prelude::*;
use ormtx::{Statement, TransactionErrorKind};

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

const POINT: Entity = Entity::new("Point", "points", &["id"], &["id", "x", "y"]);

fn setup() -> (MemoryDatabase, Arc<Pool<MemoryDatabase>>) {
    let db = MemoryDatabase::default();
    db.create_table("points", &["id"]);
    db.insert_row(
        "points",
        &[
            ("id", Value::BigInt(1)),
            ("x", Value::BigInt(1)),
            ("y", Value::BigInt(2)),
        ],
    )
    .expect("seed point");
    let pool = Arc::new(Pool::new(db.clone(), PoolConfig::new(4)));
    (db, pool)
}

fn committed(db: &MemoryDatabase, column: &str) -> Option<Value> {
    db.committed_value("points", &[("id", Value::BigInt(1))], column)
}

#[test]
fn disjoint_attribute_writes_both_commit() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup();

    rt.block_on(async {
        let mut t1 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t1");
        let a = unwrap_outcome(t1.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t1.write(&cx, &a, "x", 5_i64).await);

        let mut t2 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t2");
        let a2 = unwrap_outcome(t2.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t2.write(&cx, &a2, "y", 9_i64).await);
        unwrap_outcome(t2.exit(&cx, None).await);

        unwrap_outcome(t1.exit(&cx, None).await);
    });

    assert_eq!(committed(&db, "x"), Some(Value::BigInt(5)));
    assert_eq!(committed(&db, "y"), Some(Value::BigInt(9)));
}

#[test]
fn overlapping_write_fails_optimistic_check() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup();

    rt.block_on(async {
        let mut t1 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t1");
        let a = unwrap_outcome(t1.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        assert_eq!(unwrap_outcome(t1.read(&cx, &a, "x").await), Value::BigInt(1));

        let mut t2 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t2");
        let a2 = unwrap_outcome(t2.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t2.write(&cx, &a2, "x", 2_i64).await);
        unwrap_outcome(t2.exit(&cx, None).await);

        unwrap_outcome(t1.write(&cx, &a, "x", 3_i64).await);
        let err = match t1.exit(&cx, None).await {
            Outcome::Err(e) => e,
            other => panic!("expected optimistic check failure, got {other:?}"),
        };
        assert!(err.is_kind(&FailureKind::OptimisticCheckFailure));
        assert!(err.is_kind(&FailureKind::TransactionFailure));
        assert_eq!(err.conflicting_object(), Some("Point[1]"));
        assert!(!t1.is_open());
    });

    assert_eq!(committed(&db, "x"), Some(Value::BigInt(2)));
    assert_eq!(pool.stats().active_connections, 0);
}

#[test]
fn read_only_attribute_is_still_checked() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup();

    rt.block_on(async {
        let mut t1 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t1");
        let a = unwrap_outcome(t1.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t1.read(&cx, &a, "y").await);
        unwrap_outcome(t1.write(&cx, &a, "x", 7_i64).await);

        let mut t2 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t2");
        let bump = Statement::Update {
            table: "points".into(),
            key: vec![("id".into(), Value::BigInt(1))],
            assignments: vec![("y".into(), Value::BigInt(20))],
            guards: Vec::new(),
        };
        assert_eq!(unwrap_outcome(t2.execute(&cx, &bump).await), 1);
        unwrap_outcome(t2.exit(&cx, None).await);

        match t1.exit(&cx, None).await {
            Outcome::Err(Error::Transaction(t)) => {
                assert_eq!(t.kind, TransactionErrorKind::OptimisticCheck);
            }
            other => panic!("expected optimistic check failure, got {other:?}"),
        }
    });

    assert_eq!(committed(&db, "x"), Some(Value::BigInt(1)));
    assert_eq!(committed(&db, "y"), Some(Value::BigInt(20)));
}

#[test]
fn optimistic_checks_can_be_disabled() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup();

    rt.block_on(async {
        let config = SessionConfig::new().optimistic(false);
        let mut t1 = Session::open(Arc::clone(&pool), config).expect("open t1");
        let a = unwrap_outcome(t1.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t1.read(&cx, &a, "x").await);

        let mut t2 = Session::open(Arc::clone(&pool), SessionConfig::new()).expect("open t2");
        let a2 = unwrap_outcome(t2.get(&cx, &POINT, &[Value::BigInt(1)]).await).expect("point");
        unwrap_outcome(t2.write(&cx, &a2, "x", 2_i64).await);
        unwrap_outcome(t2.exit(&cx, None).await);

        unwrap_outcome(t1.write(&cx, &a, "x", 3_i64).await);
        let flushed = unwrap_outcome(t1.commit(&cx).await);
        assert_eq!(flushed.checked, 0);
        assert_eq!(flushed.updated, 1);
        unwrap_outcome(t1.exit(&cx, None).await);
    });

    assert_eq!(committed(&db, "x"), Some(Value::BigInt(3)));
}

#[test]
fn lost_update_is_retried_against_fresh_state() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let (db, pool) = setup();

    rt.block_on(async {
        let mut attempts = 0;
        let x = unwrap_outcome(
            db_session(&cx, &pool, SessionConfig::new().retry(2), async |s| {
                attempts += 1;
                let Some(a) = try_outcome!(s.get(&cx, &POINT, &[Value::BigInt(1)]).await) else {
                    return Outcome::Err(Error::application("not_found", "point 1"));
                };
                let x = try_outcome!(s.read(&cx, &a, "x").await)
                    .as_i64()
                    .unwrap_or_default();

                if attempts == 1 {
                    // Another unit of work commits in between.
                    try_outcome!(
                        db_session(&cx, &pool, SessionConfig::new(), async |other| {
                            let Some(a) =
                                try_outcome!(other.get(&cx, &POINT, &[Value::BigInt(1)]).await)
                            else {
                                return Outcome::Ok(());
                            };
                            other.write(&cx, &a, "x", 10_i64).await
                        })
                        .await
                    );
                }

                try_outcome!(s.write(&cx, &a, "x", x + 1).await);
                Outcome::Ok(x + 1)
            })
            .await,
        );
        assert_eq!(attempts, 2);
        assert_eq!(x, 11);
    });

    assert_eq!(committed(&db, "x"), Some(Value::BigInt(11)));
}
