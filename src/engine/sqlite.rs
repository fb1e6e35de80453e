//! SQLite engine backed by a single `sqlx::SqliteConnection`.
//!
//! No pooling: every [`DataSource::connect`] opens a fresh connection, which
//! is what an execution context expects to own exclusively.

use crate::config::DatabaseConfig;
use crate::engine::{Connection, DataSource, RowSet, StatementKey};
use crate::error::{DbError, DbResult};
use crate::models::{Row, Value};
use async_trait::async_trait;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteRow, SqliteStatement,
};
use sqlx::{Column, ConnectOptions, Decode, Executor, Row as _, Sqlite, Statement, TypeInfo, ValueRef};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info};

/// Opens SQLite connections from a [`DatabaseConfig`].
#[derive(Debug, Clone)]
pub struct SqliteSource {
    config: DatabaseConfig,
    options: SqliteConnectOptions,
}

impl SqliteSource {
    pub fn new(config: DatabaseConfig) -> DbResult<Self> {
        let mut options =
            SqliteConnectOptions::from_str(&config.connection_string).map_err(|e| {
                DbError::connection(
                    format!("Invalid SQLite connection string: {}", e),
                    "Check the connection URL format: sqlite:path/to/db.sqlite",
                )
            })?;

        if config.writable {
            options = options.create_if_missing(config.create).read_only(false);
        } else {
            options = options.read_only(true);
        }

        Ok(Self { config, options })
    }

    /// Parse `url` with [`DatabaseConfig::parse`] and build a source from it.
    pub fn from_url(url: &str) -> DbResult<Self> {
        Self::new(DatabaseConfig::parse(url)?)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }
}

#[async_trait]
impl DataSource for SqliteSource {
    async fn connect(&self) -> DbResult<Box<dyn Connection>> {
        let connect_timeout = self.config.connect_timeout;
        let conn = match timeout(connect_timeout, self.options.connect()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(DbError::connection(
                    format!("Failed to connect: {}", e),
                    connection_suggestion(&e),
                ));
            }
            Err(_) => {
                return Err(DbError::connection(
                    format!(
                        "Connection attempt exceeded {}s",
                        connect_timeout.as_secs()
                    ),
                    "Check that the database file is not locked by another process",
                ));
            }
        };

        info!(source = %self.describe(), "Opened SQLite connection");

        Ok(Box::new(SqliteEngineConnection {
            conn,
            statements: HashMap::new(),
            next_key: 0,
        }))
    }

    fn describe(&self) -> String {
        self.config.to_string()
    }
}

/// Generate a helpful suggestion for connection errors.
fn connection_suggestion(error: &sqlx::Error) -> String {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("unable to open") {
        return "Check that the file exists, or add ?create=true to the URL".to_string();
    }

    if error_str.contains("readonly") || error_str.contains("read-only") {
        return "Add ?writable=true to the connection URL to allow writes".to_string();
    }

    "Verify the file path exists and is accessible: sqlite:path/to/db.sqlite".to_string()
}

/// A live SQLite connection plus the statements compiled on it.
pub struct SqliteEngineConnection {
    conn: SqliteConnection,
    statements: HashMap<StatementKey, SqliteStatement<'static>>,
    next_key: u64,
}

impl SqliteEngineConnection {
    async fn run_raw(&mut self, sql: &'static str) -> DbResult<()> {
        sqlx::query(sql)
            .execute(&mut self.conn)
            .await
            .map_err(|e| DbError::engine(sql.to_lowercase(), e))?;
        Ok(())
    }
}

#[async_trait]
impl Connection for SqliteEngineConnection {
    async fn prepare(&mut self, sql: &str) -> DbResult<StatementKey> {
        let prepared = (&mut self.conn)
            .prepare(sql)
            .await
            .map_err(|e| DbError::engine(format!("prepare `{}`", sql), e))?;
        let statement = Statement::to_owned(&prepared);

        self.next_key += 1;
        let key = StatementKey(self.next_key);
        self.statements.insert(key, statement);

        debug!(statement = %key, sql = %sql, "Prepared statement");
        Ok(key)
    }

    async fn execute_prepared(&mut self, key: StatementKey, params: &[Value]) -> DbResult<u64> {
        let statement = self
            .statements
            .get(&key)
            .ok_or_else(|| DbError::invalid_state(format!("{} is not prepared", key)))?;

        let mut query = statement.query();
        for param in params {
            query = bind_param(query, param);
        }

        let rows_affected = query
            .execute(&mut self.conn)
            .await
            .map_err(|e| DbError::engine(format!("execute `{}`", statement.sql()), e))?
            .rows_affected();

        Ok(rows_affected)
    }

    async fn query_prepared(&mut self, key: StatementKey, params: &[Value]) -> DbResult<RowSet> {
        let statement = self
            .statements
            .get(&key)
            .ok_or_else(|| DbError::invalid_state(format!("{} is not prepared", key)))?;

        let mut query = statement.query();
        for param in params {
            query = bind_param(query, param);
        }

        let fetched: Vec<SqliteRow> = query
            .fetch_all(&mut self.conn)
            .await
            .map_err(|e| DbError::engine(format!("query `{}`", statement.sql()), e))?;

        let mut columns: Arc<[String]> = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        if columns.is_empty() {
            if let Some(first) = fetched.first() {
                columns = first.columns().iter().map(|c| c.name().to_string()).collect();
            }
        }

        let rows = fetched
            .iter()
            .map(|row| decode_row(row, &columns))
            .collect::<DbResult<Vec<_>>>()?;

        Ok(RowSet { columns, rows })
    }

    async fn close_prepared(&mut self, key: StatementKey) -> DbResult<()> {
        if self.statements.remove(&key).is_some() {
            debug!(statement = %key, "Released statement");
        }
        Ok(())
    }

    async fn begin(&mut self) -> DbResult<()> {
        self.run_raw("BEGIN").await
    }

    async fn commit(&mut self) -> DbResult<()> {
        self.run_raw("COMMIT").await
    }

    async fn rollback(&mut self) -> DbResult<()> {
        self.run_raw("ROLLBACK").await
    }

    async fn close(self: Box<Self>) -> DbResult<()> {
        let this = *self;
        sqlx::Connection::close(this.conn)
            .await
            .map_err(|e| DbError::engine("close connection", e))
    }
}

/// Bind a parameter to a SQLite query.
fn bind_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::String(v) => query.bind(v.as_str()),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

fn decode_row(row: &SqliteRow, columns: &Arc<[String]>) -> DbResult<Row> {
    let values = (0..row.len())
        .map(|idx| decode_column(row, idx))
        .collect::<DbResult<Vec<_>>>()?;
    Ok(Row::new(columns.clone(), values))
}

/// Decode by the storage class of the value itself, not the declared type.
fn decode_column(row: &SqliteRow, idx: usize) -> DbResult<Value> {
    let raw = row.try_get_raw(idx)?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let type_name = raw.type_info().name().to_ascii_uppercase();
    let column = row.column(idx).name().to_string();
    let fail = |e: sqlx::error::BoxDynError| DbError::decode(column.clone(), e.to_string());

    if type_name.contains("BOOL") {
        <bool as Decode<Sqlite>>::decode(raw).map(Value::Bool).map_err(fail)
    } else if type_name.contains("INT") {
        <i64 as Decode<Sqlite>>::decode(raw).map(Value::Int).map_err(fail)
    } else if type_name.contains("REAL")
        || type_name.contains("FLOAT")
        || type_name.contains("DOUBLE")
        || type_name.contains("NUMERIC")
    {
        <f64 as Decode<Sqlite>>::decode(raw).map(Value::Float).map_err(fail)
    } else if type_name.contains("BLOB") {
        <Vec<u8> as Decode<Sqlite>>::decode(raw).map(Value::Bytes).map_err(fail)
    } else {
        <String as Decode<Sqlite>>::decode(raw).map(Value::String).map_err(fail)
    }
}
