//! Persistence Layer
//!
//! SQLite-backed implementation of the injected `PersistenceStore`
//! capability, plus an in-memory variant for tests and dry runs. Async
//! operations via sqlx.
//!
//! # Database Schema
//!
//! ## expected_positions
//! The trading subsystem's open-position book, read by the reconciler.
//!
//! ## reconciliation_records
//! Append-only audit trail, one row per matcher decision.
//!
//! ## close_audit
//! Append-only close attempts, success and failure alike.
//!
//! ## equity_snapshots
//! One current row per account: balance, equity, monotone peak, drawdown.
//!
//! ## accounts
//! Accounts the scheduler reconciles, with an active flag.

pub mod memory;
pub mod models;
pub mod repository;

use crate::domain::errors::StoreError;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// Database connection pool
pub type DbPool = SqlitePool;

/// Initialize the database connection pool and run migrations.
///
/// `database_url` is an sqlx SQLite URL, e.g. `sqlite://data/sentra.db`.
pub async fn init_database(database_url: &str) -> Result<DbPool, StoreError> {
    info!("Initializing database: {}", database_url);

    // Ensure the data directory exists
    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Query(format!("cannot create data dir: {}", e)))?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("Database initialized");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), StoreError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            active INTEGER NOT NULL DEFAULT 1
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS expected_positions (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            volume REAL NOT NULL,
            entry_price REAL NOT NULL,
            take_profit REAL,
            stop_loss REAL,
            status TEXT NOT NULL DEFAULT 'open'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS reconciliation_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            outcome TEXT NOT NULL,
            volume REAL NOT NULL,
            expected_volume REAL,
            entry_price REAL NOT NULL,
            expected_entry_price REAL,
            divergence_reason TEXT,
            slippage REAL,
            position_id TEXT,
            ticket INTEGER,
            recorded_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_records_account_time
        ON reconciliation_records (account_id, recorded_at)
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS close_audit (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id TEXT NOT NULL,
            position_id TEXT NOT NULL,
            ticket INTEGER NOT NULL,
            success INTEGER NOT NULL,
            closed_price REAL,
            realized_pnl REAL,
            reason TEXT NOT NULL,
            error TEXT,
            closed_at TIMESTAMP NOT NULL,
            idempotency_key TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS equity_snapshots (
            account_id TEXT PRIMARY KEY,
            balance REAL NOT NULL,
            equity REAL NOT NULL,
            peak_equity REAL NOT NULL,
            drawdown_percent REAL NOT NULL,
            open_positions INTEGER NOT NULL,
            margin_percent REAL NOT NULL,
            synced_at TIMESTAMP NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    info!("Migrations complete");
    Ok(())
}
