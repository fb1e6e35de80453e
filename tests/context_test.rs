//! Integration tests for execution contexts, transactions and modules.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dbscope::db::{ContextHandle, DbModule, ModuleFactory, column};
use dbscope::{Closeable, Database, DbError, DbResult, SqliteSource, TransactionState, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

async fn setup() -> (Database, NamedTempFile) {
    let temp_file = NamedTempFile::new().expect("Failed to create temp file");
    let url = format!("sqlite:{}?writable=true", temp_file.path().display());
    let db = Database::new(SqliteSource::from_url(&url).unwrap());

    let mut ctx = db.get_context().await.unwrap();
    ctx.execute(
        "CREATE TABLE accounts (name TEXT PRIMARY KEY, balance INTEGER NOT NULL)",
        &[],
    )
    .await
    .unwrap();
    ctx.close().await.unwrap();

    (db, temp_file)
}

async fn balance_count(db: &Database) -> i64 {
    let counts = db
        .query_list("SELECT COUNT(*) FROM accounts", &[], column::<i64, _>(0usize))
        .await
        .unwrap();
    counts[0]
}

/// Per-context module that works through its context's connection.
struct Accounts {
    ctx: ContextHandle,
    log: Arc<Mutex<Vec<String>>>,
}

impl Accounts {
    async fn open(&self, name: &str, balance: i64) -> DbResult<()> {
        self.ctx
            .execute(
                "INSERT INTO accounts (name, balance) VALUES (?, ?)",
                &[Value::from(name), Value::from(balance)],
            )
            .await?;
        Ok(())
    }

    async fn balance(&self, name: &str) -> DbResult<Option<i64>> {
        let statement = self
            .ctx
            .prepare("SELECT balance FROM accounts WHERE name = ?")
            .await?;
        statement.query_single(&[Value::from(name)], "balance").await
    }
}

#[async_trait]
impl DbModule for Accounts {
    async fn close(&self) -> DbResult<()> {
        self.log.lock().unwrap().push("accounts".to_string());
        Ok(())
    }
}

struct AccountsFactory {
    created: Arc<AtomicUsize>,
    log: Arc<Mutex<Vec<String>>>,
}

impl AccountsFactory {
    fn new() -> Self {
        Self {
            created: Arc::new(AtomicUsize::new(0)),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ModuleFactory for AccountsFactory {
    type Module = Accounts;

    fn create(&self, ctx: ContextHandle) -> Accounts {
        self.created.fetch_add(1, Ordering::SeqCst);
        Accounts {
            ctx,
            log: self.log.clone(),
        }
    }
}

struct Marker {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Closeable for Marker {
    async fn close(&self) -> DbResult<()> {
        self.log.lock().unwrap().push(self.name.to_string());
        Ok(())
    }
}

#[tokio::test]
async fn test_commit_persists_across_contexts() {
    let (db, _file) = setup().await;

    let mut ctx = db.get_context().await.unwrap();
    ctx.begin_transaction().await.unwrap();
    assert_eq!(ctx.transaction_state(), TransactionState::InTransaction);
    ctx.execute(
        "INSERT INTO accounts (name, balance) VALUES (?, ?)",
        &[Value::from("ada"), Value::from(10)],
    )
    .await
    .unwrap();
    ctx.commit_transaction().await.unwrap();
    ctx.close().await.unwrap();

    assert_eq!(balance_count(&db).await, 1);
}

#[tokio::test]
async fn test_abort_discards_writes() {
    let (db, _file) = setup().await;

    let mut ctx = db.get_context().await.unwrap();
    ctx.begin_transaction().await.unwrap();
    ctx.execute(
        "INSERT INTO accounts (name, balance) VALUES ('grace', 5)",
        &[],
    )
    .await
    .unwrap();
    ctx.abort_transaction().await.unwrap();
    assert_eq!(ctx.transaction_state(), TransactionState::Idle);
    ctx.close().await.unwrap();

    assert_eq!(balance_count(&db).await, 0);
}

#[tokio::test]
async fn test_close_refused_while_transaction_open() {
    let (db, _file) = setup().await;

    let mut ctx = db.get_context().await.unwrap();
    ctx.begin_transaction().await.unwrap();
    ctx.execute(
        "INSERT INTO accounts (name, balance) VALUES ('linus', 1)",
        &[],
    )
    .await
    .unwrap();

    let err = ctx.close().await.unwrap_err();
    assert!(matches!(err, DbError::ActiveTransaction { .. }));
    assert!(!ctx.is_closed());
    assert!(ctx.in_transaction());

    // The connection is still usable and sees its own uncommitted write
    let rows = ctx.query("SELECT name FROM accounts", &[]).await.unwrap();
    let names = ctx.unpack_list(&rows, column::<String, _>("name")).unwrap();
    assert_eq!(names, vec!["linus"]);

    ctx.commit_transaction().await.unwrap();
    ctx.close().await.unwrap();
    assert_eq!(balance_count(&db).await, 1);
}

#[tokio::test]
async fn test_out_of_sequence_transaction_calls() {
    let (db, _file) = setup().await;
    let mut ctx = db.get_context().await.unwrap();

    assert!(matches!(
        ctx.commit_transaction().await,
        Err(DbError::InvalidTransactionState { operation: "commit", .. })
    ));
    assert!(matches!(
        ctx.abort_transaction().await,
        Err(DbError::InvalidTransactionState { operation: "abort", .. })
    ));

    ctx.begin_transaction().await.unwrap();
    assert!(matches!(
        ctx.begin_transaction().await,
        Err(DbError::InvalidTransactionState { .. })
    ));
    assert!(ctx.in_transaction());

    ctx.abort_transaction().await.unwrap();
    ctx.close().await.unwrap();
}

#[tokio::test]
async fn test_module_created_once_per_context() {
    let (db, _file) = setup().await;
    let factory = AccountsFactory::new();
    let created = factory.created.clone();
    db.register(factory);

    let mut c1 = db.get_context().await.unwrap();
    let first = c1.get_module::<Accounts>().unwrap();
    let again = c1.get_module::<Accounts>().unwrap();
    let third = c1.get_module::<Accounts>().unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    assert!(Arc::ptr_eq(&first, &third));
    assert_eq!(created.load(Ordering::SeqCst), 1);

    let mut c2 = db.get_context().await.unwrap();
    let other = c2.get_module::<Accounts>().unwrap();
    assert!(!Arc::ptr_eq(&first, &other));
    assert_eq!(created.load(Ordering::SeqCst), 2);

    c1.close().await.unwrap();
    c2.close().await.unwrap();
}

#[tokio::test]
async fn test_unregistered_module_fails() {
    let (db, _file) = setup().await;
    let mut ctx = db.get_context().await.unwrap();

    let err = ctx.get_module::<Accounts>().err().expect("no factory registered");
    assert!(matches!(err, DbError::NotRegistered { .. }));
    ctx.close().await.unwrap();
}

#[tokio::test]
async fn test_module_shares_context_transaction() {
    let (db, _file) = setup().await;
    db.register(AccountsFactory::new());

    let mut ctx = db.get_context().await.unwrap();
    let accounts = ctx.get_module::<Accounts>().unwrap();
    ctx.begin_transaction().await.unwrap();
    accounts.open("ada", 42).await.unwrap();
    assert_eq!(accounts.balance("ada").await.unwrap(), Some(42));
    assert_eq!(accounts.balance("nobody").await.unwrap(), None);

    ctx.abort_transaction().await.unwrap();
    assert_eq!(accounts.balance("ada").await.unwrap(), None);
    ctx.close().await.unwrap();

    // Handle outlives the context but can no longer reach it
    assert!(matches!(
        accounts.balance("ada").await,
        Err(DbError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn test_close_releases_modules_in_tracking_order() {
    let (db, _file) = setup().await;
    let factory = AccountsFactory::new();
    let log = factory.log.clone();
    db.register(factory);

    let mut ctx = db.get_context().await.unwrap();
    ctx.track_closeable(Arc::new(Marker {
        name: "before",
        log: log.clone(),
    }));
    ctx.get_module::<Accounts>().unwrap();
    ctx.track_closeable(Arc::new(Marker {
        name: "after",
        log: log.clone(),
    }));
    assert_eq!(ctx.tracked_count(), 3);

    ctx.close().await.unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["before", "accounts", "after"]);

    ctx.close().await.unwrap();
    assert_eq!(log.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_unpack_helpers() {
    let (db, _file) = setup().await;
    let mut ctx = db.get_context().await.unwrap();
    for (name, balance) in [("a", 1), ("b", 2), ("c", 3)] {
        ctx.execute(
            "INSERT INTO accounts (name, balance) VALUES (?, ?)",
            &[Value::from(name), Value::from(balance)],
        )
        .await
        .unwrap();
    }

    let empty = ctx
        .query("SELECT name FROM accounts WHERE balance > 100", &[])
        .await
        .unwrap();
    let none = ctx.unpack_single(&empty, column::<String, _>("name")).unwrap();
    assert_eq!(none, None);

    let rows = ctx
        .query("SELECT name FROM accounts ORDER BY name", &[])
        .await
        .unwrap();
    let first = ctx.unpack_single(&rows, column::<String, _>("name")).unwrap();
    assert_eq!(first.as_deref(), Some("a"));
    // Only the first row was consumed
    assert!(rows.next().unwrap());
    assert_eq!(rows.row().unwrap().get::<String, _>(0usize).unwrap(), "b");

    let dupes = ctx
        .query(
            "SELECT 'x' AS k, 1 AS v UNION ALL SELECT 'y', 2 UNION ALL SELECT 'x', 3",
            &[],
        )
        .await
        .unwrap();
    let map = ctx
        .unpack_map(&dupes, column::<String, _>("k"), column::<i64, _>("v"))
        .unwrap();
    assert_eq!(map.len(), 2);
    assert_eq!(map["x"], 3);
    assert_eq!(map["y"], 2);

    ctx.close().await.unwrap();
    assert!(rows.is_closed());
    assert!(dupes.is_closed());
}

#[tokio::test]
async fn test_current_timestamp_column_reads_as_utc() {
    let (db, _file) = setup().await;
    db.execute(
        "CREATE TABLE audit (id INTEGER, at DATETIME DEFAULT CURRENT_TIMESTAMP)",
        &[],
    )
    .await
    .unwrap();

    let before = Utc::now() - Duration::seconds(2);
    db.execute("INSERT INTO audit (id) VALUES (1)", &[]).await.unwrap();
    let after = Utc::now() + Duration::seconds(2);

    let rows = db.query_rows("SELECT id, at FROM audit", &[]).await.unwrap();
    let at = rows[0].get::<DateTime<Utc>, _>("at").unwrap();
    assert!(at >= before && at <= after, "{at} not between {before} and {after}");
}
