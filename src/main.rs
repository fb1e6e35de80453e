//! dbscope - Main entry point.
//!
//! Runs a single statement, query or batch against a configured database
//! through an execution context and prints the outcome as JSON.

use clap::Parser;
use dbscope::config::{Command, Config, parse_param, parse_row};
use dbscope::{Database, DbContext, DbResult, SqliteSource, Value};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    // Logs go to stderr so stdout carries only results
    if config.json_logs {
        subscriber
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();
    init_tracing(&config);

    let db_config = config.database_config()?;
    info!(
        database = %db_config,
        writable = db_config.writable,
        "Starting dbscope v{}",
        env!("CARGO_PKG_VERSION")
    );

    let database = Database::new(SqliteSource::new(db_config)?);
    database.init_factories().await?;

    let mut ctx = database.get_context().await?;
    let result = run(&mut ctx, &config.command).await;

    if ctx.in_transaction() {
        if let Err(e) = ctx.abort_transaction().await {
            error!(error = %e, "Rollback failed");
        }
    }
    let closed = ctx.close().await;

    let output = match (result, closed) {
        (Ok(output), Ok(())) => output,
        (Err(e), _) | (Ok(_), Err(e)) => {
            error!(error = %e, "Command failed");
            if let Some(suggestion) = e.suggestion() {
                eprintln!("Hint: {}", suggestion);
            }
            return Err(e.into());
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(ctx: &mut DbContext, command: &Command) -> DbResult<serde_json::Value> {
    match command {
        Command::Exec { sql, params } => {
            let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
            let rows_affected = ctx.execute(sql, &params).await?;
            Ok(serde_json::json!({ "rows_affected": rows_affected }))
        }
        Command::Query { sql, params } => {
            let params: Vec<Value> = params.iter().map(|p| parse_param(p)).collect();
            let rows = ctx.query(sql, &params).await?;
            let objects = ctx.unpack_list(&rows, |row| Ok(serde_json::Value::Object(row.to_json_map())))?;
            Ok(serde_json::Value::Array(objects))
        }
        Command::Batch { sql, rows } => {
            let rows = rows
                .iter()
                .map(|raw| parse_row(raw))
                .collect::<DbResult<Vec<_>>>()?;

            let statement = ctx.prepare(sql).await?;
            statement.begin_batch()?;
            for row in &rows {
                statement.bind(row)?;
            }

            ctx.begin_transaction().await?;
            let counts = statement.execute_batch().await?;
            ctx.commit_transaction().await?;

            Ok(serde_json::json!({ "rows_affected": counts }))
        }
    }
}
