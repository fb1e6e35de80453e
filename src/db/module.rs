//! Module extension contract.
//!
//! A module is per-context state created lazily by a factory registered with
//! the [`Database`]. Each context builds a module at most once; the instance
//! is tracked so its [`DbModule::close`] hook runs when the context closes.

use crate::db::context::{ContextCore, TransactionState};
use crate::db::cursor::RowCursor;
use crate::db::registry::Database;
use crate::db::statement::DbStatement;
use crate::db::tracker::Closeable;
use crate::error::{DbError, DbResult};
use crate::models::Value;
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Per-context extension state.
#[async_trait]
pub trait DbModule: Send + Sync + 'static {
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Called once while the owning context closes, in tracking order.
    async fn close(&self) -> DbResult<()> {
        Ok(())
    }
}

/// Builds one module instance per context.
#[async_trait]
pub trait ModuleFactory: Send + Sync + 'static {
    type Module: DbModule;

    fn create(&self, ctx: ContextHandle) -> Self::Module;

    /// One-time setup, run by [`Database::init_factories`].
    async fn init(&self, _db: &Database) -> DbResult<()> {
        Ok(())
    }
}

/// Weak reference to the context a module was created for.
///
/// The handle never keeps the context alive. Statements and cursors obtained
/// through it are tracked by that context.
#[derive(Clone)]
pub struct ContextHandle {
    id: String,
    database: Database,
    core: Weak<ContextCore>,
}

impl ContextHandle {
    pub(crate) fn new(core: &Arc<ContextCore>) -> Self {
        Self {
            id: core.id().to_string(),
            database: core.database().clone(),
            core: Arc::downgrade(core),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn is_open(&self) -> bool {
        self.core.upgrade().is_some_and(|core| core.is_open())
    }

    fn core(&self) -> DbResult<Arc<ContextCore>> {
        match self.core.upgrade() {
            Some(core) if core.is_open() => Ok(core),
            _ => Err(DbError::invalid_state(format!(
                "context {} is closed",
                self.id
            ))),
        }
    }

    /// Module of type `M` from the same context, shared with
    /// [`DbContext::get_module`](crate::db::DbContext::get_module).
    ///
    /// A factory may call this from `create` for other module types. Asking
    /// for the module being created fails with [`DbError::InvalidState`].
    pub fn get_module<M: DbModule>(&self) -> DbResult<Arc<M>> {
        self.core()?.get_module::<M>()
    }

    pub fn transaction_state(&self) -> DbResult<TransactionState> {
        Ok(self.core()?.transaction_state())
    }

    pub fn in_transaction(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.transaction_state() == TransactionState::InTransaction)
    }

    pub async fn prepare(&self, sql: &str) -> DbResult<DbStatement> {
        self.core()?.prepare(sql).await
    }

    pub async fn execute(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        self.core()?.execute(sql, params).await
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> DbResult<RowCursor> {
        self.core()?.query(sql, params).await
    }

    /// Register `resource` for release when the context closes.
    pub fn track_closeable<R: Closeable + 'static>(&self, resource: Arc<R>) -> DbResult<Arc<R>> {
        self.core()?.track(resource.clone());
        Ok(resource)
    }
}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.id)
            .field("open", &self.is_open())
            .finish()
    }
}

/// A freshly built module, viewed both as a cacheable value and as a
/// tracked resource.
pub(crate) struct CreatedModule {
    pub instance: Arc<dyn Any + Send + Sync>,
    pub closer: Arc<dyn Closeable>,
}

struct ModuleCloser<M>(Arc<M>);

#[async_trait]
impl<M: DbModule> Closeable for ModuleCloser<M> {
    fn kind(&self) -> &'static str {
        "module"
    }

    async fn close(&self) -> DbResult<()> {
        debug!(module = self.0.name(), "Closing module");
        self.0.close().await
    }
}

/// Object-safe view of a [`ModuleFactory`].
#[async_trait]
pub(crate) trait ErasedFactory: Send + Sync {
    fn create(&self, ctx: ContextHandle) -> CreatedModule;

    async fn init(&self, db: &Database) -> DbResult<()>;
}

struct FactoryAdapter<F>(F);

#[async_trait]
impl<F: ModuleFactory> ErasedFactory for FactoryAdapter<F> {
    fn create(&self, ctx: ContextHandle) -> CreatedModule {
        let module = Arc::new(self.0.create(ctx));
        CreatedModule {
            instance: module.clone(),
            closer: Arc::new(ModuleCloser(module)),
        }
    }

    async fn init(&self, db: &Database) -> DbResult<()> {
        self.0.init(db).await
    }
}

/// A factory as stored by the registry.
#[derive(Clone)]
pub struct RegisteredFactory {
    module: &'static str,
    factory: Arc<dyn ErasedFactory>,
}

impl RegisteredFactory {
    pub(crate) fn new<F: ModuleFactory>(factory: F) -> Self {
        Self {
            module: std::any::type_name::<F::Module>(),
            factory: Arc::new(FactoryAdapter(factory)),
        }
    }

    /// Type name of the module this factory builds.
    pub fn module_name(&self) -> &'static str {
        self.module
    }

    pub(crate) fn create(&self, ctx: ContextHandle) -> CreatedModule {
        self.factory.create(ctx)
    }

    pub(crate) async fn init(&self, db: &Database) -> DbResult<()> {
        self.factory.init(db).await
    }
}

impl std::fmt::Debug for RegisteredFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredFactory")
            .field("module", &self.module)
            .finish()
    }
}
