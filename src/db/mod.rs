//! Context layer on top of an engine connection.
//!
//! - [`Database`]: module factory registry and source of contexts
//! - [`DbContext`]: one connection, its modules, transaction state and
//!   tracked resources
//! - [`DbStatement`]: compiled statement with an explicit batch mode
//! - [`RowCursor`]: forward-only query result
//! - [`ResourceTracker`]: ordered release of everything a context hands out

pub mod context;
pub mod cursor;
pub mod module;
pub mod registry;
pub mod statement;
pub mod tracker;

pub use context::{DbContext, TransactionState};
pub use cursor::{RowCursor, column, unpack_list, unpack_map, unpack_single};
pub use module::{ContextHandle, DbModule, ModuleFactory, RegisteredFactory};
pub use registry::Database;
pub use statement::DbStatement;
pub use tracker::{Closeable, ResourceTracker};
