//! The SQL engine boundary.
//!
//! dbscope never compiles or executes SQL itself. It drives an engine through
//! these traits:
//! - [`DataSource`]: acquires new connections
//! - [`Connection`]: compiles statements, executes them with positional
//!   parameters, drives transactions and closes
//!
//! Compiled statements live inside the connection and are addressed by a
//! [`StatementKey`], so a statement handle never borrows the connection.

pub mod sqlite;

use crate::error::DbResult;
use crate::models::{Row, Value};
use async_trait::async_trait;
use std::sync::Arc;

pub use sqlite::SqliteSource;

/// Handle of a statement compiled by a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatementKey(pub u64);

impl std::fmt::Display for StatementKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stmt#{}", self.0)
    }
}

/// Fully fetched result of a query.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    pub columns: Arc<[String]>,
    pub rows: Vec<Row>,
}

/// Acquires connections.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> DbResult<Box<dyn Connection>>;

    /// Human readable description, free of credentials.
    fn describe(&self) -> String;
}

/// One live connection to the engine.
///
/// Parameters are passed 0-based in slice order; an engine with 1-based
/// placeholders maps slot `i` to placeholder `i + 1`.
#[async_trait]
pub trait Connection: Send {
    /// Compile a statement for repeated execution.
    async fn prepare(&mut self, sql: &str) -> DbResult<StatementKey>;

    /// Execute a compiled statement, returning the affected row count.
    async fn execute_prepared(&mut self, key: StatementKey, params: &[Value]) -> DbResult<u64>;

    /// Execute a compiled statement once per parameter row, returning one
    /// count per row in order.
    async fn execute_batch_prepared(
        &mut self,
        key: StatementKey,
        batch: &[Vec<Value>],
    ) -> DbResult<Vec<u64>> {
        let mut counts = Vec::with_capacity(batch.len());
        for params in batch {
            counts.push(self.execute_prepared(key, params).await?);
        }
        Ok(counts)
    }

    /// Run a compiled query.
    async fn query_prepared(&mut self, key: StatementKey, params: &[Value]) -> DbResult<RowSet>;

    /// Release a compiled statement. Unknown keys are ignored.
    async fn close_prepared(&mut self, key: StatementKey) -> DbResult<()>;

    /// One-shot execution without keeping a compiled statement around.
    async fn execute(&mut self, sql: &str, params: &[Value]) -> DbResult<u64> {
        let key = self.prepare(sql).await?;
        let result = self.execute_prepared(key, params).await;
        self.close_prepared(key).await?;
        result
    }

    /// One-shot query without keeping a compiled statement around.
    async fn query(&mut self, sql: &str, params: &[Value]) -> DbResult<RowSet> {
        let key = self.prepare(sql).await?;
        let result = self.query_prepared(key, params).await;
        self.close_prepared(key).await?;
        result
    }

    /// Turn auto-commit off and open a transaction.
    async fn begin(&mut self) -> DbResult<()>;

    /// Commit and return to auto-commit.
    async fn commit(&mut self) -> DbResult<()>;

    /// Roll back and return to auto-commit.
    async fn rollback(&mut self) -> DbResult<()>;

    /// Close the connection.
    async fn close(self: Box<Self>) -> DbResult<()>;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory engine for unit tests.

    use super::*;
    use crate::error::DbError;
    use std::sync::Mutex;

    /// Everything the mock engine was asked to do, in order.
    #[derive(Debug, Default)]
    pub struct EngineLog {
        pub events: Vec<String>,
    }

    #[derive(Clone, Default)]
    pub struct MockSource {
        pub log: Arc<Mutex<EngineLog>>,
        pub fail_connect: bool,
        /// Rows returned by every query.
        pub rows: Vec<Vec<Value>>,
    }

    impl MockSource {
        pub fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().events.clone()
        }
    }

    #[async_trait]
    impl DataSource for MockSource {
        async fn connect(&self) -> DbResult<Box<dyn Connection>> {
            if self.fail_connect {
                return Err(DbError::connection("refused", "start the mock"));
            }
            self.log.lock().unwrap().events.push("connect".to_string());
            Ok(Box::new(MockConnection {
                log: self.log.clone(),
                rows: self.rows.clone(),
                next_key: 0,
            }))
        }

        fn describe(&self) -> String {
            "mock".to_string()
        }
    }

    pub struct MockConnection {
        log: Arc<Mutex<EngineLog>>,
        rows: Vec<Vec<Value>>,
        next_key: u64,
    }

    impl MockConnection {
        fn record(&self, event: String) {
            self.log.lock().unwrap().events.push(event);
        }
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn prepare(&mut self, sql: &str) -> DbResult<StatementKey> {
            self.next_key += 1;
            self.record(format!("prepare {}", sql));
            Ok(StatementKey(self.next_key))
        }

        async fn execute_prepared(&mut self, key: StatementKey, params: &[Value]) -> DbResult<u64> {
            self.record(format!("execute {} {:?}", key, params));
            Ok(1)
        }

        async fn query_prepared(&mut self, key: StatementKey, _params: &[Value]) -> DbResult<RowSet> {
            self.record(format!("query {}", key));
            let columns: Arc<[String]> = vec!["k".to_string(), "v".to_string()].into();
            let rows = self
                .rows
                .iter()
                .map(|values| Row::new(columns.clone(), values.clone()))
                .collect();
            Ok(RowSet { columns, rows })
        }

        async fn close_prepared(&mut self, key: StatementKey) -> DbResult<()> {
            self.record(format!("close {}", key));
            Ok(())
        }

        async fn begin(&mut self) -> DbResult<()> {
            self.record("begin".to_string());
            Ok(())
        }

        async fn commit(&mut self) -> DbResult<()> {
            self.record("commit".to_string());
            Ok(())
        }

        async fn rollback(&mut self) -> DbResult<()> {
            self.record("rollback".to_string());
            Ok(())
        }

        async fn close(self: Box<Self>) -> DbResult<()> {
            self.record("disconnect".to_string());
            Ok(())
        }
    }
}
