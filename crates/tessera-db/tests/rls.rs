mod common;

use common::TestDb;
use tessera_db::{
    run_migrations, with_context, DbError, Executor, IsolationLevel, Statement,
    TransactionManager, Value, INVALID_IDENTITY,
};

const ALICE: &str = "0b5c8a3e-1d2f-4e6a-9b7c-2d4e6f8a0b1c";
const BOB: &str = "7e9d1c3b-5a4f-4c2e-8d6b-1a3c5e7f9b2d";

fn seeded(max_size: u32) -> TestDb {
    let db = TestDb::new(max_size);
    db.write_migration(
        "001_notes.sql",
        "CREATE TABLE notes (id INTEGER PRIMARY KEY, owner_id TEXT NOT NULL, body TEXT NOT NULL);
CREATE VIEW my_notes AS
    SELECT id, body FROM notes
    WHERE owner_id = current_setting('app.current_user_id', 1);",
    );
    run_migrations(&db.pool, &db.migrations()).expect("migrations should succeed");

    let mut pool = db.pool.clone();
    for (owner, body) in [(ALICE, "alice one"), (ALICE, "alice two"), (BOB, "bob one")] {
        pool.query(
            &Statement::new("INSERT INTO notes (owner_id, body) VALUES (?1, ?2)")
                .bind(owner)
                .bind(body),
        )
        .expect("seed insert should succeed");
    }
    db
}

fn bodies(exec: &mut impl Executor) -> Result<Vec<String>, DbError> {
    let rows = exec.query(&Statement::new("SELECT body FROM my_notes ORDER BY id"))?;
    Ok(rows
        .into_iter()
        .filter_map(|r| r.get("body").and_then(Value::as_str).map(str::to_string))
        .collect())
}

#[test]
fn context_scopes_rows_to_the_identity() {
    let db = seeded(2);

    let alice = with_context(&db.pool, ALICE, |conn| bodies(conn)).expect("alice scope");
    let bob = with_context(&db.pool, BOB, |conn| bodies(conn)).expect("bob scope");

    assert_eq!(alice, vec!["alice one".to_string(), "alice two".to_string()]);
    assert_eq!(bob, vec!["bob one".to_string()]);
}

#[test]
fn identity_does_not_leak_to_the_next_lease() {
    let db = seeded(1);

    let scoped = with_context(&db.pool, ALICE, |conn| bodies(conn)).expect("alice scope");
    assert_eq!(scoped.len(), 2);

    // Pool of one: this is the same physical connection.
    let mut conn = db.pool.acquire().expect("lease");
    let setting = conn
        .query(&Statement::new(
            "SELECT current_setting('app.current_user_id', 1) AS v",
        ))
        .expect("read setting");
    let value = setting.first().and_then(|r| r.get("v")).cloned();
    assert!(
        matches!(value, Some(Value::Null)) || value.as_ref().and_then(Value::as_str) == Some(""),
        "identity should be cleared, got {value:?}"
    );
    assert!(bodies(&mut conn).expect("unscoped read").is_empty());
    conn.release();
}

#[test]
fn malformed_identity_is_rejected() {
    let db = seeded(1);

    let err = with_context(&db.pool, "alice", |conn| bodies(conn)).expect_err("malformed identity");
    assert_eq!(err.code(), INVALID_IDENTITY);
    assert_eq!(err.status(), 400);
}

#[test]
fn transaction_applies_identity_on_its_own_connection() {
    let db = seeded(2);
    let manager = TransactionManager::new(db.pool.clone(), IsolationLevel::ReadCommitted);

    let seen = manager
        .with_default(Some(BOB), |tx| -> Result<Vec<String>, DbError> {
            tx.query(
                &Statement::new("INSERT INTO notes (owner_id, body) VALUES (?1, ?2)")
                    .bind(BOB)
                    .bind("bob two"),
            )?;
            bodies(tx)
        })
        .expect("scoped transaction");

    assert_eq!(seen, vec!["bob one".to_string(), "bob two".to_string()]);
}
