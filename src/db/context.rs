//! Per-connection execution context.
//!
//! A [`DbContext`] owns one engine connection for one unit of work. It
//! caches module instances, drives the transaction state machine and tracks
//! every statement, cursor and module derived from it so that
//! [`DbContext::close`] can release them in creation order.
//!
//! Module cache and transaction state live in the shared core, so modules
//! see the same view of the context through their [`ContextHandle`].

use crate::db::cursor::{self, RowCursor};
use crate::db::module::ContextHandle;
use crate::db::registry::Database;
use crate::db::statement::DbStatement;
use crate::db::tracker::{Closeable, ResourceTracker};
use crate::db::DbModule;
use crate::engine::{Connection, StatementKey};
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::ThreadId;
use tracing::{debug, info, warn};

#[derive(Default)]
struct ModuleCache {
    instances: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    /// Types whose factory is running, per calling thread.
    building: HashSet<(TypeId, ThreadId)>,
}

/// Generate a unique context ID.
fn generate_context_id() -> String {
    format!("ctx_{}", uuid::Uuid::new_v4().simple())
}

/// State shared between a context and the handles derived from it.
pub(crate) struct ContextCore {
    id: String,
    database: Database,
    connection: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    tracker: ResourceTracker,
    modules: Mutex<ModuleCache>,
    transaction: Mutex<TransactionState>,
    open: AtomicBool,
}

impl ContextCore {
    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn database(&self) -> &Database {
        &self.database
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn track(&self, resource: Arc<dyn Closeable>) {
        self.tracker.track(resource);
    }

    fn closed_error(&self) -> DbError {
        DbError::invalid_state(format!("context {} is closed", self.id))
    }

    fn modules(&self) -> MutexGuard<'_, ModuleCache> {
        self.modules.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn transaction_state(&self) -> TransactionState {
        *self.transaction.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_transaction_state(&self, state: TransactionState) {
        *self.transaction.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Cached module of type `M`, built through the registered factory on
    /// first use.
    pub(crate) fn get_module<M: DbModule>(self: &Arc<Self>) -> DbResult<Arc<M>> {
        if !self.is_open() {
            return Err(self.closed_error());
        }
        let type_id = TypeId::of::<M>();
        let building = (type_id, std::thread::current().id());

        let cached = {
            let mut modules = self.modules();
            let cached = modules.instances.get(&type_id).cloned();
            if cached.is_none() && !modules.building.insert(building) {
                return Err(DbError::invalid_state(format!(
                    "module {} requested itself while being created",
                    std::any::type_name::<M>()
                )));
            }
            cached
        };

        let (instance, created) = match cached {
            Some(instance) => (instance, false),
            None => {
                // The cache is unlocked here: a factory may request other modules
                let built = self
                    .database
                    .get_factory::<M>()
                    .map(|factory| factory.create(ContextHandle::new(self)));
                let mut modules = self.modules();
                modules.building.remove(&building);
                let built = built?;
                match modules.instances.get(&type_id) {
                    Some(existing) => (existing.clone(), false),
                    None => {
                        self.track(built.closer);
                        modules.instances.insert(type_id, built.instance.clone());
                        (built.instance, true)
                    }
                }
            }
        };

        let module = instance.downcast::<M>().map_err(|_| {
            DbError::invalid_state(format!(
                "cached module is not a {}",
                std::any::type_name::<M>()
            ))
        })?;
        if created {
            debug!(context_id = %self.id, module = module.name(), "Module created");
        }
        Ok(module)
    }

    pub(crate) async fn prepare(self: &Arc<Self>, sql: &str) -> DbResult<DbStatement> {
        let key = {
            let mut slot = self.connection.lock().await;
            let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
            conn.prepare(sql).await?
        };
        let statement = DbStatement::new(key, sql, Arc::downgrade(self));
        self.track(statement.as_closeable());
        Ok(statement)
    }

    pub(crate) async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        let rows_affected = conn.execute(sql, params).await?;
        debug!(context_id = %self.id, sql = %sql, rows_affected, "Executed");
        Ok(rows_affected)
    }

    pub(crate) async fn query(&self, sql: &str, params: &[Value]) -> DbResult<RowCursor> {
        let result = {
            let mut slot = self.connection.lock().await;
            let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
            conn.query(sql, params).await?
        };
        debug!(context_id = %self.id, sql = %sql, rows = result.rows.len(), "Queried");
        Ok(self.track_cursor(RowCursor::new(result)))
    }

    pub(crate) async fn execute_prepared(&self, key: StatementKey, params: &[Value]) -> DbResult<u64> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        conn.execute_prepared(key, params).await
    }

    pub(crate) async fn execute_batch_prepared(
        &self,
        key: StatementKey,
        batch: &[Vec<Value>],
    ) -> DbResult<Vec<u64>> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        conn.execute_batch_prepared(key, batch).await
    }

    pub(crate) async fn query_prepared(
        &self,
        key: StatementKey,
        params: &[Value],
    ) -> DbResult<RowCursor> {
        let result = {
            let mut slot = self.connection.lock().await;
            let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
            conn.query_prepared(key, params).await?
        };
        Ok(self.track_cursor(RowCursor::new(result)))
    }

    /// Statements outliving their connection have nothing left to release.
    pub(crate) async fn close_prepared(&self, key: StatementKey) -> DbResult<()> {
        match self.connection.lock().await.as_mut() {
            Some(conn) => conn.close_prepared(key).await,
            None => Ok(()),
        }
    }

    fn track_cursor(&self, cursor: RowCursor) -> RowCursor {
        self.track(cursor.as_closeable());
        cursor
    }

    async fn begin(&self) -> DbResult<()> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        conn.begin().await?;
        self.set_transaction_state(TransactionState::InTransaction);
        Ok(())
    }

    async fn commit(&self) -> DbResult<()> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        conn.commit().await?;
        self.set_transaction_state(TransactionState::Idle);
        Ok(())
    }

    async fn rollback(&self) -> DbResult<()> {
        let mut slot = self.connection.lock().await;
        let conn = slot.as_mut().ok_or_else(|| self.closed_error())?;
        conn.rollback().await?;
        self.set_transaction_state(TransactionState::Idle);
        Ok(())
    }

    /// Release tracked resources, then the connection.
    ///
    /// The context counts as closed afterwards whether or not anything
    /// failed.
    async fn release(&self) -> Vec<DbError> {
        let mut failures = self.tracker.close_all().await;
        self.modules().instances.clear();

        let connection = self.connection.lock().await.take();
        if let Some(conn) = connection {
            if let Err(e) = conn.close().await {
                warn!(context_id = %self.id, error = %e, "Failed to close connection");
                failures.push(e);
            }
        }

        self.open.store(false, Ordering::SeqCst);
        failures
    }
}

/// Transaction state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Auto-commit.
    Idle,
    InTransaction,
}

impl TransactionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionState::Idle => "idle",
            TransactionState::InTransaction => "in transaction",
        }
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Execution context bound to a single connection.
///
/// Obtained from [`Database::get_context`]. Must be closed with
/// [`close`](Self::close); a context dropped while open is released in the
/// background and a warning is logged.
pub struct DbContext {
    core: Arc<ContextCore>,
}

impl DbContext {
    pub(crate) fn new(database: Database, connection: Box<dyn Connection>) -> Self {
        let core = Arc::new(ContextCore {
            id: generate_context_id(),
            database,
            connection: tokio::sync::Mutex::new(Some(connection)),
            tracker: ResourceTracker::new(),
            modules: Mutex::new(ModuleCache::default()),
            transaction: Mutex::new(TransactionState::Idle),
            open: AtomicBool::new(true),
        });
        info!(context_id = %core.id, "Context opened");
        Self { core }
    }

    pub fn id(&self) -> &str {
        &self.core.id
    }

    pub fn database(&self) -> &Database {
        &self.core.database
    }

    /// Weak handle to this context, as given to module factories.
    pub fn handle(&self) -> ContextHandle {
        ContextHandle::new(&self.core)
    }

    pub fn is_closed(&self) -> bool {
        !self.core.is_open()
    }

    pub fn in_transaction(&self) -> bool {
        self.transaction_state() == TransactionState::InTransaction
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.core.transaction_state()
    }

    /// Resources awaiting release on close.
    pub fn tracked_count(&self) -> usize {
        self.core.tracker.len()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(self.core.closed_error());
        }
        Ok(())
    }

    /// Module instance of type `M` for this context, created on first use.
    ///
    /// Repeated calls, including calls through a module's
    /// [`ContextHandle`], return the same instance.
    pub fn get_module<M: DbModule>(&self) -> DbResult<Arc<M>> {
        self.core.get_module::<M>()
    }

    /// Open a transaction. Fails if one is already open.
    pub async fn begin_transaction(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.expect_state(TransactionState::Idle, "begin a transaction")?;
        self.core.begin().await?;
        info!(context_id = %self.core.id, "Transaction started");
        Ok(())
    }

    /// Commit the open transaction and return to auto-commit.
    pub async fn commit_transaction(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.expect_state(TransactionState::InTransaction, "commit")?;
        self.core.commit().await?;
        info!(context_id = %self.core.id, "Transaction committed");
        Ok(())
    }

    /// Roll back the open transaction and return to auto-commit.
    pub async fn abort_transaction(&mut self) -> DbResult<()> {
        self.ensure_open()?;
        self.expect_state(TransactionState::InTransaction, "abort")?;
        self.core.rollback().await?;
        info!(context_id = %self.core.id, "Transaction rolled back");
        Ok(())
    }

    fn expect_state(&self, expected: TransactionState, operation: &'static str) -> DbResult<()> {
        let current = self.transaction_state();
        if current != expected {
            return Err(DbError::invalid_transaction_state(
                self.core.id.clone(),
                operation,
                current.as_str(),
            ));
        }
        Ok(())
    }

    /// Compile `sql` into a tracked statement.
    pub async fn prepare(&self, sql: &str) -> DbResult<DbStatement> {
        self.ensure_open()?;
        self.core.prepare(sql).await
    }

    /// One-shot execution, returning the affected row count.
    pub async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        self.ensure_open()?;
        self.core.execute(sql, params).await
    }

    /// Execute a statement prepared by this context.
    pub async fn execute_statement(&self, statement: &DbStatement, params: &[Value]) -> DbResult<u64> {
        self.ensure_owned(statement)?;
        statement.execute(params).await
    }

    /// One-shot query. The cursor is released on close even if never read.
    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<RowCursor> {
        self.ensure_open()?;
        self.core.query(sql, params).await
    }

    pub async fn query_statement(
        &self,
        statement: &DbStatement,
        params: &[Value],
    ) -> DbResult<RowCursor> {
        self.ensure_owned(statement)?;
        statement.query(params).await
    }

    fn ensure_owned(&self, statement: &DbStatement) -> DbResult<()> {
        self.ensure_open()?;
        if !statement.belongs_to(&self.core) {
            return Err(DbError::invalid_state(format!(
                "statement `{}` was prepared by another context",
                statement.sql()
            )));
        }
        Ok(())
    }

    /// See [`cursor::unpack_single`].
    pub fn unpack_single<T, F>(&self, rows: &RowCursor, unpacker: F) -> DbResult<Option<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        cursor::unpack_single(rows, unpacker)
    }

    /// See [`cursor::unpack_list`].
    pub fn unpack_list<T, F>(&self, rows: &RowCursor, unpacker: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        cursor::unpack_list(rows, unpacker)
    }

    /// See [`cursor::unpack_map`].
    pub fn unpack_map<K, V, KF, VF>(
        &self,
        rows: &RowCursor,
        key_unpacker: KF,
        value_unpacker: VF,
    ) -> DbResult<HashMap<K, V>>
    where
        K: Eq + Hash,
        KF: FnMut(&Row) -> DbResult<K>,
        VF: FnMut(&Row) -> DbResult<V>,
    {
        cursor::unpack_map(rows, key_unpacker, value_unpacker)
    }

    /// Register `resource` for release on close and hand it back.
    pub fn track_closeable<R: Closeable + 'static>(&self, resource: Arc<R>) -> Arc<R> {
        self.core.track(resource.clone());
        resource
    }

    /// Release every tracked resource, then the connection.
    ///
    /// Refuses with [`DbError::ActiveTransaction`] while a transaction is
    /// open and leaves the context untouched. Release failures do not stop
    /// the sequence; they are reported together as
    /// [`DbError::CloseAggregate`]. Closing twice is a no-op.
    pub async fn close(&mut self) -> DbResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        if self.in_transaction() {
            return Err(DbError::active_transaction(self.core.id.clone()));
        }

        let tracked = self.tracked_count();
        let failures = self.core.release().await;

        if failures.is_empty() {
            info!(context_id = %self.core.id, released = tracked, "Context closed");
            Ok(())
        } else {
            warn!(
                context_id = %self.core.id,
                failures = failures.len(),
                "Context closed with release failures"
            );
            Err(DbError::CloseAggregate {
                context_id: self.core.id.clone(),
                failures,
            })
        }
    }
}

impl Drop for DbContext {
    fn drop(&mut self) {
        if self.is_closed() {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                context_id = %self.core.id,
                "Context dropped without close and no runtime to release it"
            );
            return;
        };

        let core = Arc::clone(&self.core);
        let in_transaction = self.in_transaction();
        runtime.spawn(async move {
            if in_transaction {
                if let Err(e) = core.rollback().await {
                    warn!(context_id = %core.id, error = %e, "Rollback of dropped context failed");
                }
            }
            let failures = core.release().await;
            warn!(
                context_id = %core.id,
                failures = failures.len(),
                "Context released via Drop - call close() explicitly"
            );
        });
    }
}

impl std::fmt::Debug for DbContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbContext")
            .field("id", &self.core.id)
            .field("transaction", &self.transaction_state())
            .field("closed", &self.is_closed())
            .field("modules", &self.core.modules().instances.len())
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
