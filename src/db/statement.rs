//! Statement wrapper with single-shot execution and an explicit batch mode.

use crate::db::context::ContextCore;
use crate::db::cursor::{self, RowCursor};
use crate::db::tracker::Closeable;
use crate::engine::StatementKey;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnIndex, FromValue, Row, Value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::debug;

#[derive(Debug, Default)]
struct StatementState {
    bound: Vec<Value>,
    batch: bool,
    staged: Vec<Vec<Value>>,
}

pub(crate) struct StatementInner {
    key: StatementKey,
    sql: String,
    context: Weak<ContextCore>,
    state: Mutex<StatementState>,
    closed: AtomicBool,
}

impl StatementInner {
    fn state(&self) -> MutexGuard<'_, StatementState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn release(&self) -> DbResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let mut state = self.state();
            state.staged.clear();
            state.bound.clear();
        }
        match self.context.upgrade() {
            Some(core) => core.close_prepared(self.key).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Closeable for StatementInner {
    fn kind(&self) -> &'static str {
        "statement"
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> DbResult<()> {
        self.release().await
    }
}

/// A compiled statement owned by an execution context.
///
/// Parameters are positional and 0-based. Values bound by one call stay in
/// place until overwritten, so a later call may rebind a prefix only.
#[derive(Clone)]
pub struct DbStatement {
    inner: Arc<StatementInner>,
}

impl DbStatement {
    pub(crate) fn new(key: StatementKey, sql: &str, context: Weak<ContextCore>) -> Self {
        Self {
            inner: Arc::new(StatementInner {
                key,
                sql: sql.to_string(),
                context,
                state: Mutex::new(StatementState::default()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn as_closeable(&self) -> Arc<dyn Closeable> {
        self.inner.clone()
    }

    pub(crate) fn belongs_to(&self, core: &Arc<ContextCore>) -> bool {
        std::ptr::eq(self.inner.context.as_ptr(), Arc::as_ptr(core))
    }

    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn is_batch(&self) -> bool {
        self.inner.state().batch
    }

    /// Parameter rows waiting for [`execute_batch`](Self::execute_batch).
    pub fn staged_count(&self) -> usize {
        self.inner.state().staged.len()
    }

    fn ensure_open(&self) -> DbResult<()> {
        if self.is_closed() {
            return Err(DbError::invalid_state(format!(
                "statement `{}` is closed",
                self.inner.sql
            )));
        }
        Ok(())
    }

    fn context(&self) -> DbResult<Arc<ContextCore>> {
        self.inner.context.upgrade().ok_or_else(|| {
            DbError::invalid_state(format!(
                "context owning statement `{}` no longer exists",
                self.inner.sql
            ))
        })
    }

    /// Switch to batch mode: every `bind` stages a parameter row.
    pub fn begin_batch(&self) -> DbResult<()> {
        self.ensure_open()?;
        self.inner.state().batch = true;
        Ok(())
    }

    /// Leave batch mode and discard any staged rows.
    pub fn clear_batch(&self) -> DbResult<()> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        state.batch = false;
        state.staged.clear();
        Ok(())
    }

    /// Overwrite bound parameters starting at position 0. In batch mode the
    /// resulting parameter row is staged.
    pub fn bind(&self, params: &[Value]) -> DbResult<()> {
        self.ensure_open()?;
        let mut state = self.inner.state();
        for (idx, value) in params.iter().enumerate() {
            match state.bound.get_mut(idx) {
                Some(slot) => *slot = value.clone(),
                None => state.bound.push(value.clone()),
            }
        }
        if state.batch {
            let row = state.bound.clone();
            state.staged.push(row);
        }
        Ok(())
    }

    /// Bind and run the statement once, returning the affected row count.
    ///
    /// Fails with [`DbError::InvalidState`] in batch mode; nothing is written.
    pub async fn execute(&self, params: &[Value]) -> DbResult<u64> {
        let bound = self.bind_single(params, "execute")?;
        let rows_affected = self
            .context()?
            .execute_prepared(self.inner.key, &bound)
            .await?;
        debug!(sql = %self.inner.sql, rows_affected, "Executed statement");
        Ok(rows_affected)
    }

    /// Run every staged row in staging order and empty the stage.
    ///
    /// Returns one affected row count per staged row.
    pub async fn execute_batch(&self) -> DbResult<Vec<u64>> {
        self.ensure_open()?;
        let staged = std::mem::take(&mut self.inner.state().staged);
        if staged.is_empty() {
            return Ok(Vec::new());
        }
        let counts = self
            .context()?
            .execute_batch_prepared(self.inner.key, &staged)
            .await?;
        debug!(sql = %self.inner.sql, rows = counts.len(), "Executed batch");
        Ok(counts)
    }

    /// Bind and run the statement as a query.
    ///
    /// The cursor is tracked by the owning context.
    pub async fn query(&self, params: &[Value]) -> DbResult<RowCursor> {
        let bound = self.bind_single(params, "query")?;
        self.context()?
            .query_prepared(self.inner.key, &bound)
            .await
    }

    fn bind_single(&self, params: &[Value], operation: &str) -> DbResult<Vec<Value>> {
        if self.is_batch() {
            return Err(DbError::invalid_state(format!(
                "cannot {} `{}` in batch mode; use execute_batch or clear_batch",
                operation, self.inner.sql
            )));
        }
        self.bind(params)?;
        Ok(self.inner.state().bound.clone())
    }

    /// First row's `column`, or `None` when the query returns no rows.
    pub async fn query_single<T, I>(&self, params: &[Value], column: I) -> DbResult<Option<T>>
    where
        T: FromValue,
        I: ColumnIndex + Clone,
    {
        self.query_single_with(params, cursor::column(column)).await
    }

    pub async fn query_single_with<T, F>(&self, params: &[Value], unpacker: F) -> DbResult<Option<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        let rows = self.query(params).await?;
        let value = cursor::unpack_single(&rows, unpacker);
        rows.close();
        value
    }

    /// First column of the first row.
    pub async fn query_scalar<T: FromValue>(&self, params: &[Value]) -> DbResult<Option<T>> {
        self.query_single(params, 0usize).await
    }

    pub async fn query_list<T, I>(&self, params: &[Value], column: I) -> DbResult<Vec<T>>
    where
        T: FromValue,
        I: ColumnIndex + Clone,
    {
        self.query_list_with(params, cursor::column(column)).await
    }

    pub async fn query_list_with<T, F>(&self, params: &[Value], unpacker: F) -> DbResult<Vec<T>>
    where
        F: FnMut(&Row) -> DbResult<T>,
    {
        let rows = self.query(params).await?;
        let values = cursor::unpack_list(&rows, unpacker);
        rows.close();
        values
    }

    /// Map `key_column` to `value_column`; later rows win on duplicate keys.
    pub async fn query_map<K, V, KI, VI>(
        &self,
        params: &[Value],
        key_column: KI,
        value_column: VI,
    ) -> DbResult<HashMap<K, V>>
    where
        K: FromValue + Eq + Hash,
        V: FromValue,
        KI: ColumnIndex + Clone,
        VI: ColumnIndex + Clone,
    {
        self.query_map_with(params, cursor::column(key_column), cursor::column(value_column))
            .await
    }

    pub async fn query_map_with<K, V, KF, VF>(
        &self,
        params: &[Value],
        key_unpacker: KF,
        value_unpacker: VF,
    ) -> DbResult<HashMap<K, V>>
    where
        K: Eq + Hash,
        KF: FnMut(&Row) -> DbResult<K>,
        VF: FnMut(&Row) -> DbResult<V>,
    {
        let rows = self.query(params).await?;
        let values = cursor::unpack_map(&rows, key_unpacker, value_unpacker);
        rows.close();
        values
    }

    /// Number of rows the query produces. Rows are stepped over, never
    /// converted.
    pub async fn count(&self, params: &[Value]) -> DbResult<usize> {
        let rows = self.query(params).await?;
        let mut count = 0;
        while rows.next()? {
            count += 1;
        }
        rows.close();
        Ok(count)
    }

    /// Release the compiled statement. Idempotent.
    pub async fn close(&self) -> DbResult<()> {
        self.inner.release().await
    }
}

impl std::fmt::Debug for DbStatement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbStatement")
            .field("key", &self.inner.key)
            .field("sql", &self.inner.sql)
            .field("closed", &self.is_closed())
            .finish()
    }
}
