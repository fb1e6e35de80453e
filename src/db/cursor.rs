//! Forward-only row cursors and the unpack helpers that consume them.
//!
//! A cursor is positioned before its first row. Unpackers receive the
//! positioned row by reference, so they can read any column but cannot move
//! the cursor.

use crate::db::tracker::Closeable;
use crate::engine::RowSet;
use crate::error::{DbError, DbResult};
use crate::models::{ColumnIndex, FromValue, Row};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug)]
struct CursorState {
    pending: VecDeque<Row>,
    current: Option<Row>,
    closed: bool,
}

#[derive(Debug)]
pub(crate) struct CursorInner {
    columns: Arc<[String]>,
    state: Mutex<CursorState>,
}

impl CursorInner {
    fn state(&self) -> MutexGuard<'_, CursorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut state = self.state();
        state.closed = true;
        state.pending.clear();
        state.current = None;
    }
}

#[async_trait]
impl Closeable for CursorInner {
    fn kind(&self) -> &'static str {
        "cursor"
    }

    fn is_closed(&self) -> bool {
        self.state().closed
    }

    async fn close(&self) -> DbResult<()> {
        self.release();
        Ok(())
    }
}

/// Result of a query, read one row at a time.
///
/// Cloning yields another handle to the same cursor.
#[derive(Debug, Clone)]
pub struct RowCursor {
    inner: Arc<CursorInner>,
}

impl RowCursor {
    pub(crate) fn new(result: RowSet) -> Self {
        Self {
            inner: Arc::new(CursorInner {
                columns: result.columns,
                state: Mutex::new(CursorState {
                    pending: result.rows.into(),
                    current: None,
                    closed: false,
                }),
            }),
        }
    }

    pub(crate) fn as_closeable(&self) -> Arc<dyn Closeable> {
        self.inner.clone()
    }

    pub fn columns(&self) -> &[String] {
        &self.inner.columns
    }

    /// Advance to the next row. Returns `false` once the rows are exhausted.
    pub fn next(&self) -> DbResult<bool> {
        Ok(self.next_row()?.is_some())
    }

    /// Advance and hand out the newly positioned row.
    pub fn next_row(&self) -> DbResult<Option<Row>> {
        let mut state = self.inner.state();
        if state.closed {
            return Err(DbError::invalid_state("cursor is closed"));
        }
        state.current = state.pending.pop_front();
        Ok(state.current.clone())
    }

    /// The row the cursor is positioned on, if any.
    pub fn row(&self) -> Option<Row> {
        self.inner.state().current.clone()
    }

    /// Rows not yet reached.
    pub fn remaining(&self) -> usize {
        self.inner.state().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state().closed
    }

    /// Drop any unread rows. Idempotent.
    pub fn close(&self) {
        self.inner.release();
    }
}

/// Unpacker reading a single column.
pub fn column<T, I>(index: I) -> impl Fn(&Row) -> DbResult<T>
where
    T: FromValue,
    I: ColumnIndex + Clone,
{
    move |row| row.get::<T, I>(index.clone())
}

/// Unpack the first row, or `None` when the cursor has no rows. Later rows
/// are left unread.
pub fn unpack_single<T, F>(cursor: &RowCursor, mut unpacker: F) -> DbResult<Option<T>>
where
    F: FnMut(&Row) -> DbResult<T>,
{
    match cursor.next_row()? {
        Some(row) => unpacker(&row).map(Some),
        None => Ok(None),
    }
}

/// Unpack every remaining row, in cursor order.
pub fn unpack_list<T, F>(cursor: &RowCursor, mut unpacker: F) -> DbResult<Vec<T>>
where
    F: FnMut(&Row) -> DbResult<T>,
{
    let mut values = Vec::with_capacity(cursor.remaining());
    while let Some(row) = cursor.next_row()? {
        values.push(unpacker(&row)?);
    }
    Ok(values)
}

/// Unpack every remaining row into a map. On duplicate keys the later row
/// wins.
pub fn unpack_map<K, V, KF, VF>(
    cursor: &RowCursor,
    mut key_unpacker: KF,
    mut value_unpacker: VF,
) -> DbResult<HashMap<K, V>>
where
    K: Eq + Hash,
    KF: FnMut(&Row) -> DbResult<K>,
    VF: FnMut(&Row) -> DbResult<V>,
{
    let mut values = HashMap::with_capacity(cursor.remaining());
    while let Some(row) = cursor.next_row()? {
        values.insert(key_unpacker(&row)?, value_unpacker(&row)?);
    }
    Ok(values)
}
