//! Resource tracking for execution contexts.
//!
//! Every statement, cursor and module derived from a context is registered
//! here when it is created. On context close the tracker releases them in
//! registration order and reports every failure instead of stopping at the
//! first one.

use crate::error::{DbError, DbResult};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

/// A resource that must be released when its context closes.
///
/// `close` may be called more than once and must be a no-op after the first
/// call.
#[async_trait]
pub trait Closeable: Send + Sync {
    /// Short label used in logs.
    fn kind(&self) -> &'static str {
        "resource"
    }

    /// Whether the resource was already released by its owner. Released
    /// entries are dropped from the tracker instead of being kept until
    /// the context closes.
    fn is_closed(&self) -> bool {
        false
    }

    async fn close(&self) -> DbResult<()>;
}

/// Ordered set of resources awaiting release.
#[derive(Default)]
pub struct ResourceTracker {
    entries: Mutex<Vec<Arc<dyn Closeable>>>,
}

impl ResourceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<Arc<dyn Closeable>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add `resource` to the release order, dropping entries that were
    /// already closed.
    pub fn track(&self, resource: Arc<dyn Closeable>) {
        let mut entries = self.entries();
        entries.retain(|entry| !entry.is_closed());
        entries.push(resource);
    }

    /// Number of resources tracked and not yet released.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Close everything tracked so far, oldest first.
    ///
    /// Resources tracked while closing (e.g. by a module close hook) are
    /// released in a following round. Returns all failures; the tracker is
    /// empty afterwards, so a second call releases nothing.
    pub async fn close_all(&self) -> Vec<DbError> {
        let mut failures = Vec::new();
        let mut released = 0usize;

        loop {
            let batch = std::mem::take(&mut *self.entries());
            if batch.is_empty() {
                break;
            }
            for resource in batch {
                released += 1;
                if let Err(e) = resource.close().await {
                    warn!(kind = resource.kind(), error = %e, "Failed to release resource");
                    failures.push(e);
                }
            }
        }

        debug!(released, failed = failures.len(), "Released tracked resources");
        failures
    }
}

impl std::fmt::Debug for ResourceTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceTracker")
            .field("tracked", &self.len())
            .finish()
    }
}
