//! dbscope
//!
//! Scoped execution contexts over a SQL connection: lazily created
//! per-context modules, explicit transactions, statements with a batch mode
//! and guaranteed release of everything a context hands out.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;

pub use config::{Config, DatabaseConfig};
pub use db::{
    Closeable, ContextHandle, Database, DbContext, DbModule, DbStatement, ModuleFactory,
    RowCursor, TransactionState,
};
pub use engine::{Connection, DataSource, SqliteSource};
pub use error::{DbError, DbResult};
pub use models::{Row, Value};
