//! Database registry: module factories plus the source of execution contexts.

use crate::db::context::DbContext;
use crate::db::cursor;
use crate::db::module::{DbModule, ModuleFactory, RegisteredFactory};
use crate::engine::DataSource;
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use futures_util::future::BoxFuture;
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    factories: HashMap<TypeId, RegisteredFactory>,
    /// Registration order; each module type appears once.
    init_order: Vec<TypeId>,
}

struct DatabaseInner {
    source: Arc<dyn DataSource>,
    registry: RwLock<RegistryState>,
}

/// Application-wide registry of module factories.
///
/// Cloning is cheap and every clone shares the same registrations. Each
/// [`get_context`](Self::get_context) call opens a new connection through
/// the configured [`DataSource`].
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl Database {
    pub fn new<S: DataSource + 'static>(source: S) -> Self {
        Self::from_arc(Arc::new(source))
    }

    pub fn from_arc(source: Arc<dyn DataSource>) -> Self {
        Self {
            inner: Arc::new(DatabaseInner {
                source,
                registry: RwLock::new(RegistryState::default()),
            }),
        }
    }

    pub fn data_source(&self) -> &Arc<dyn DataSource> {
        &self.inner.source
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.inner.registry.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.inner.registry.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the factory for `F::Module`.
    ///
    /// Registering a module type again replaces its factory but keeps its
    /// original position in the init order.
    pub fn register<F: ModuleFactory>(&self, factory: F) {
        let type_id = TypeId::of::<F::Module>();
        let entry = RegisteredFactory::new(factory);
        let module = entry.module_name();

        let mut state = self.write();
        if state.factories.insert(type_id, entry).is_some() {
            warn!(module, "Replaced module factory; init order unchanged");
        } else {
            state.init_order.push(type_id);
            debug!(module, "Registered module factory");
        }
    }

    pub fn get_factory<M: DbModule>(&self) -> DbResult<RegisteredFactory> {
        self.read()
            .factories
            .get(&TypeId::of::<M>())
            .cloned()
            .ok_or(DbError::NotRegistered {
                module: std::any::type_name::<M>(),
            })
    }

    pub fn is_registered<M: DbModule>(&self) -> bool {
        self.read().factories.contains_key(&TypeId::of::<M>())
    }

    pub fn registered_count(&self) -> usize {
        self.read().factories.len()
    }

    /// Run every factory's init hook once, in registration order.
    ///
    /// Stops at the first failure.
    pub async fn init_factories(&self) -> DbResult<()> {
        let factories: Vec<RegisteredFactory> = {
            let state = self.read();
            state
                .init_order
                .iter()
                .filter_map(|type_id| state.factories.get(type_id).cloned())
                .collect()
        };

        for factory in &factories {
            debug!(module = factory.module_name(), "Initializing module factory");
            factory.init(self).await?;
        }

        info!(count = factories.len(), "Module factories initialized");
        Ok(())
    }

    /// Open a new execution context on a fresh connection.
    pub async fn get_context(&self) -> DbResult<DbContext> {
        let connection = self.inner.source.connect().await.map_err(|e| match e {
            DbError::Connection { .. } => e,
            other => DbError::connection(
                other.to_string(),
                format!("Check that {} is reachable", self.inner.source.describe()),
            ),
        })?;
        Ok(DbContext::new(self.clone(), connection))
    }

    /// Execute one statement in a short-lived context.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let mut ctx = self.get_context().await?;
        let result = ctx.execute(sql, params).await;
        let closed = ctx.close().await;
        finish(result, closed)
    }

    /// Run a query in a short-lived context and return every row.
    ///
    /// Rows are read in full before the context closes.
    pub async fn query_rows(&self, sql: &str, params: &[Value]) -> DbResult<Vec<Row>> {
        self.query_list(sql, params, |row| Ok(row.clone())).await
    }

    /// Like [`query_rows`](Self::query_rows), converting each row with
    /// `unpacker`.
    pub async fn query_list<T, F>(&self, sql: &str, params: &[Value], unpacker: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        let mut ctx = self.get_context().await?;
        let result = match ctx.query(sql, params).await {
            Ok(rows) => cursor::unpack_list(&rows, unpacker),
            Err(e) => Err(e),
        };
        let closed = ctx.close().await;
        finish(result, closed)
    }

    /// Run `f` against a fresh context and close it afterwards.
    ///
    /// A transaction left open by `f` is rolled back before closing.
    ///
    /// ```no_run
    /// # async fn demo(db: dbscope::Database) -> dbscope::DbResult<()> {
    /// let moved = db
    ///     .with_context(|ctx| {
    ///         Box::pin(async move {
    ///             ctx.begin_transaction().await?;
    ///             let n = ctx.execute("UPDATE jobs SET state = 'done'", &[]).await?;
    ///             ctx.commit_transaction().await?;
    ///             Ok(n)
    ///         })
    ///     })
    ///     .await?;
    /// # let _ = moved;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn with_context<T, F>(&self, f: F) -> DbResult<T>
    where
        F: for<'c> FnOnce(&'c mut DbContext) -> BoxFuture<'c, DbResult<T>>,
    {
        let mut ctx = self.get_context().await?;
        let result = f(&mut ctx).await;

        let rolled_back = if ctx.in_transaction() {
            warn!(context_id = %ctx.id(), "Transaction left open; rolling back");
            ctx.abort_transaction().await
        } else {
            Ok(())
        };
        let closed = match rolled_back {
            Ok(()) => ctx.close().await,
            Err(e) => Err(e),
        };
        finish(result, closed)
    }
}

/// Combine an operation's result with the result of closing its context.
///
/// The operation's own error takes precedence.
fn finish<T>(result: DbResult<T>, closed: DbResult<()>) -> DbResult<T> {
    match (result, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(close_err)) => Err(close_err),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(close_err)) => {
            warn!(error = %close_err, "Failed to close context after error");
            Err(e)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("source", &self.inner.source.describe())
            .field("modules", &self.registered_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::module::ContextHandle;
    use crate::engine::mock::MockSource;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tagged<const N: usize>;

    impl<const N: usize> DbModule for Tagged<N> {}

    struct TaggedFactory<const N: usize> {
        inits: Arc<Mutex<Vec<usize>>>,
        fail: bool,
    }

    impl<const N: usize> TaggedFactory<N> {
        fn new(inits: &Arc<Mutex<Vec<usize>>>) -> Self {
            Self {
                inits: inits.clone(),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl<const N: usize> ModuleFactory for TaggedFactory<N> {
        type Module = Tagged<N>;

        fn create(&self, _ctx: ContextHandle) -> Tagged<N> {
            Tagged
        }

        async fn init(&self, _db: &Database) -> DbResult<()> {
            self.inits.lock().unwrap().push(N);
            if self.fail {
                return Err(DbError::invalid_state(format!("factory {} failed", N)));
            }
            Ok(())
        }
    }

    fn database() -> (Database, MockSource) {
        let source = MockSource::default();
        (Database::new(source.clone()), source)
    }

    #[tokio::test]
    async fn test_init_runs_in_registration_order() {
        let (db, _) = database();
        let inits = Arc::new(Mutex::new(Vec::new()));
        db.register(TaggedFactory::<1>::new(&inits));
        db.register(TaggedFactory::<2>::new(&inits));
        db.register(TaggedFactory::<3>::new(&inits));

        db.init_factories().await.unwrap();
        assert_eq!(*inits.lock().unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_and_lookup() {
        let (db, _) = database();
        let inits = Arc::new(Mutex::new(Vec::new()));

        let mut tasks = Vec::new();
        macro_rules! spawn_register {
            ($($n:literal),+) => {
                $({
                    let (db, inits) = (db.clone(), inits.clone());
                    tasks.push(tokio::spawn(async move {
                        db.register(TaggedFactory::<$n>::new(&inits));
                    }));
                })+
            };
        }
        spawn_register!(1, 2, 3, 4, 5, 6, 7, 8, 1, 5);

        for _ in 0..8 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let _ = db.get_factory::<Tagged<1>>();
                    assert!(db.registered_count() <= 8);
                    db.init_factories().await.unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(db.registered_count(), 8);
        assert!(db.get_factory::<Tagged<8>>().is_ok());

        inits.lock().unwrap().clear();
        db.init_factories().await.unwrap();
        let mut order = inits.lock().unwrap().clone();
        assert_eq!(order.len(), 8);
        order.sort_unstable();
        order.dedup();
        assert_eq!(order, (1..=8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_reregistration_keeps_single_init_entry() {
        let (db, _) = database();
        let inits = Arc::new(Mutex::new(Vec::new()));
        db.register(TaggedFactory::<1>::new(&inits));
        db.register(TaggedFactory::<2>::new(&inits));
        db.register(TaggedFactory::<1>::new(&inits));

        assert_eq!(db.registered_count(), 2);
        db.init_factories().await.unwrap();
        assert_eq!(*inits.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_init_failure_stops_sequence() {
        let (db, _) = database();
        let inits = Arc::new(Mutex::new(Vec::new()));
        db.register(TaggedFactory::<1>::new(&inits));
        db.register(TaggedFactory::<2> {
            inits: inits.clone(),
            fail: true,
        });
        db.register(TaggedFactory::<3>::new(&inits));

        assert!(db.init_factories().await.is_err());
        assert_eq!(*inits.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn test_unregistered_module() {
        let (db, _) = database();
        assert!(!db.is_registered::<Tagged<9>>());
        let err = db.get_factory::<Tagged<9>>().unwrap_err();
        assert!(matches!(err, DbError::NotRegistered { module } if module.contains("Tagged")));
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_error() {
        let source = MockSource {
            fail_connect: true,
            ..Default::default()
        };
        let db = Database::new(source);
        let err = db.get_context().await.unwrap_err();
        assert!(matches!(err, DbError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_execute_closes_context() {
        let (db, source) = database();
        let affected = db.execute("DELETE FROM t", &[]).await.unwrap();
        assert_eq!(affected, 1);
        assert_eq!(source.events().last().map(String::as_str), Some("disconnect"));
    }

    #[tokio::test]
    async fn test_query_rows_materializes_before_close() {
        let source = MockSource {
            rows: vec![
                vec![Value::from("a"), Value::Int(1)],
                vec![Value::from("b"), Value::Int(2)],
            ],
            ..Default::default()
        };
        let db = Database::new(source.clone());

        let rows = db.query_rows("SELECT k, v FROM t", &[]).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get::<i64, _>("v").unwrap(), 2);
        assert_eq!(source.events().last().map(String::as_str), Some("disconnect"));

        let keys = db
            .query_list("SELECT k, v FROM t", &[], cursor::column::<String, _>("k"))
            .await
            .unwrap();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_with_context_rolls_back_open_transaction() {
        let (db, source) = database();
        let affected = db
            .with_context(|ctx| {
                Box::pin(async move {
                    ctx.begin_transaction().await?;
                    ctx.execute("UPDATE t SET v = 1", &[]).await
                })
            })
            .await
            .unwrap();
        assert_eq!(affected, 1);

        let events = source.events();
        let tail: Vec<&str> = events.iter().rev().take(2).rev().map(String::as_str).collect();
        assert_eq!(tail, vec!["rollback", "disconnect"]);
    }

    #[tokio::test]
    async fn test_with_context_closes_on_error() {
        let (db, source) = database();
        let err = db
            .with_context(|_ctx| {
                Box::pin(async move { Err::<(), _>(DbError::invalid_state("boom")) })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
        assert_eq!(source.events().last().map(String::as_str), Some("disconnect"));
    }

    #[test]
    fn test_finish_prefers_operation_error() {
        let both: DbResult<()> = finish(
            Err(DbError::invalid_state("op")),
            Err(DbError::active_transaction("ctx_1")),
        );
        assert!(matches!(both, Err(DbError::InvalidState { .. })));

        let close_only: DbResult<u64> = finish(Ok(3), Err(DbError::active_transaction("ctx_1")));
        assert!(matches!(close_only, Err(DbError::ActiveTransaction { .. })));
    }

    struct Accounts;

    impl DbModule for Accounts {}

    struct AccountsFactory(Arc<AtomicUsize>);

    impl ModuleFactory for AccountsFactory {
        type Module = Accounts;

        fn create(&self, _ctx: ContextHandle) -> Accounts {
            self.0.fetch_add(1, Ordering::SeqCst);
            Accounts
        }
    }

    #[tokio::test]
    async fn test_module_created_once_per_context() {
        let (db, _) = database();
        let created = Arc::new(AtomicUsize::new(0));
        db.register(AccountsFactory(created.clone()));

        let mut c1 = db.get_context().await.unwrap();
        let first = c1.get_module::<Accounts>().unwrap();
        for _ in 0..2 {
            assert!(Arc::ptr_eq(&first, &c1.get_module::<Accounts>().unwrap()));
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);

        let mut c2 = db.get_context().await.unwrap();
        let second = c2.get_module::<Accounts>().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(created.load(Ordering::SeqCst), 2);

        c1.close().await.unwrap();
        c2.close().await.unwrap();
    }
}
