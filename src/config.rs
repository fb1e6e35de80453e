//! Configuration handling for dbscope.
//!
//! A database is configured by a single URL. Options understood by dbscope are
//! extracted from the URL query; everything else is left for the driver.

use crate::error::{DbError, DbResult};
use crate::models::Value;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Database configuration parsed from a connection URL.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Connection URL with dbscope options removed (sensitive - not logged).
    pub connection_string: String,
    /// Default: false for safety
    pub writable: bool,
    /// Create the database file if missing. Only honoured when writable.
    pub create: bool,
    pub connect_timeout: Duration,
}

impl DatabaseConfig {
    /// Option keys that we extract from URL query parameters.
    const OPTION_KEYS: &'static [&'static str] = &["writable", "create", "connect_timeout"];

    /// Parse a database config from a URL.
    ///
    /// # Examples
    ///
    /// ```text
    /// sqlite:data.db                           # read-only
    /// sqlite:data.db?writable=true             # writable, file must exist
    /// sqlite:data.db?writable=true&create=true # writable, created on demand
    /// sqlite::memory:?writable=true            # private in-memory database
    /// ```
    pub fn parse(s: &str) -> DbResult<Self> {
        let mut url = Url::parse(s).map_err(|e| DbError::config(format!("Invalid URL: {e}")))?;
        let mut opts = Self::extract_options(&mut url, Self::OPTION_KEYS);

        let writable = opts
            .remove("writable")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let create = opts
            .remove("create")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

        let connect_timeout = match opts.remove("connect_timeout") {
            Some(v) => {
                let secs: u64 = v.parse().map_err(|_| {
                    DbError::config(format!("connect_timeout must be a number of seconds, got '{v}'"))
                })?;
                if secs == 0 {
                    return Err(DbError::config("connect_timeout must be greater than 0"));
                }
                Duration::from_secs(secs)
            }
            None => Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        Ok(Self {
            connection_string: url.to_string(),
            writable,
            create,
            connect_timeout,
        })
    }

    /// Override the connection timeout.
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Extract dbscope options from URL query params, keeping others for the driver.
    /// Uses proper URL encoding to preserve special characters in remaining params.
    fn extract_options(url: &mut Url, keys: &[&str]) -> HashMap<String, String> {
        let mut opts = HashMap::new();
        let remaining: Vec<(String, String)> = url
            .query_pairs()
            .filter_map(|(k, v)| {
                let key_lower = k.to_ascii_lowercase();
                if keys.contains(&key_lower.as_str()) {
                    opts.insert(key_lower, v.into_owned());
                    None
                } else {
                    Some((k.into_owned(), v.into_owned()))
                }
            })
            .collect();

        if remaining.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(remaining);
        }
        opts
    }
}

/// Credentials are masked so the config can be logged.
impl std::fmt::Display for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redacted = match Url::parse(&self.connection_string) {
            Ok(mut parsed) => {
                if parsed.password().is_some() {
                    let _ = parsed.set_password(Some("***"));
                }
                parsed.to_string()
            }
            Err(_) => "***".to_string(),
        };
        write!(f, "{}", redacted)
    }
}

/// Command line configuration for the `dbscope` tool.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "dbscope",
    about = "Run SQL through a scoped execution context",
    version,
    author
)]
pub struct Config {
    /// Database connection URL.
    /// Add ?writable=true to enable write operations.
    #[arg(short = 'd', long = "database", value_name = "URL", env = "DBSCOPE_DATABASE")]
    pub database: String,

    /// Connection timeout in seconds (overrides ?connect_timeout= in the URL)
    #[arg(long, env = "DBSCOPE_CONNECT_TIMEOUT")]
    pub connect_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DBSCOPE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DBSCOPE_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Execute a write or DDL statement and print the affected row count
    Exec {
        sql: String,
        /// Positional parameter as JSON (repeatable). Non-JSON input is taken as a string.
        #[arg(short, long = "param", value_name = "JSON")]
        params: Vec<String>,
    },
    /// Run a query and print the rows as a JSON array
    Query {
        sql: String,
        #[arg(short, long = "param", value_name = "JSON")]
        params: Vec<String>,
    },
    /// Execute one statement for every row inside a single transaction
    Batch {
        sql: String,
        /// Parameter row as a JSON array (repeatable)
        #[arg(short, long = "row", value_name = "JSON_ARRAY")]
        rows: Vec<String>,
    },
}

impl Config {
    /// Parse the database URL, applying command line overrides.
    pub fn database_config(&self) -> DbResult<DatabaseConfig> {
        let config = DatabaseConfig::parse(&self.database)?;
        Ok(match self.connect_timeout {
            Some(secs) => config.with_connect_timeout(Duration::from_secs(secs)),
            None => config,
        })
    }
}

/// Parse a `--param` argument.
pub fn parse_param(raw: &str) -> Value {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(json) => Value::from_json(&json),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Parse a `--row` argument into one parameter row.
pub fn parse_row(raw: &str) -> DbResult<Vec<Value>> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(items)) => Ok(items.iter().map(Value::from_json).collect()),
        Ok(_) => Err(DbError::config(format!("--row must be a JSON array, got {raw}"))),
        Err(e) => Err(DbError::config(format!("--row is not valid JSON: {e}"))),
    }
}
