//! SQLite Store
//!
//! Production implementation of `PersistenceStore` over sqlx/SQLite. The
//! equity snapshot upsert keeps the stored peak monotone by taking the MAX
//! of the existing row's peak and the incoming one inside the statement, so
//! concurrent writers can never lower it.

use crate::domain::entities::position::ExpectedPosition;
use crate::domain::entities::records::{CloseResult, EquitySnapshot, ReconciliationRecord};
use crate::domain::repositories::store::{PersistenceStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use super::models::{ExpectedPositionRow, ReconciliationRecordRow};
use super::DbPool;

pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn active_accounts(&self) -> StoreResult<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT id FROM accounts WHERE active = 1 ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn open_positions(&self, account_id: &str) -> StoreResult<Vec<ExpectedPosition>> {
        let rows: Vec<ExpectedPositionRow> = sqlx::query_as(
            r#"
            SELECT id, account_id, symbol, side, volume, entry_price,
                   take_profit, stop_loss, status
            FROM expected_positions
            WHERE account_id = ?1 AND status = 'open'
            ORDER BY id
            "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ExpectedPosition::try_from).collect()
    }

    async fn append_record(&self, record: &ReconciliationRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO reconciliation_records (
                account_id, symbol, side, outcome, volume, expected_volume,
                entry_price, expected_entry_price, divergence_reason,
                slippage, position_id, ticket, recorded_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
        )
        .bind(&record.account_id)
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.outcome.as_str())
        .bind(record.volume)
        .bind(record.expected_volume)
        .bind(record.entry_price)
        .bind(record.expected_entry_price)
        .bind(record.divergence_reason.map(|r| r.as_str()))
        .bind(record.slippage)
        .bind(&record.position_id)
        .bind(record.ticket)
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;

        debug!(
            account_id = %record.account_id,
            symbol = %record.symbol,
            outcome = record.outcome.as_str(),
            "reconciliation record appended"
        );
        Ok(())
    }

    async fn append_close(&self, account_id: &str, result: &CloseResult) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO close_audit (
                account_id, position_id, ticket, success, closed_price,
                realized_pnl, reason, error, closed_at, idempotency_key
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(account_id)
        .bind(&result.position_id)
        .bind(result.ticket)
        .bind(result.success)
        .bind(result.closed_price)
        .bind(result.realized_pnl)
        .bind(result.reason.as_str())
        .bind(&result.error)
        .bind(result.closed_at)
        .bind(&result.idempotency_key)
        .execute(&self.pool)
        .await?;

        debug!(
            account_id = %account_id,
            position_id = %result.position_id,
            success = result.success,
            "close audit entry appended"
        );
        Ok(())
    }

    async fn upsert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO equity_snapshots (
                account_id, balance, equity, peak_equity, drawdown_percent,
                open_positions, margin_percent, synced_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(account_id) DO UPDATE SET
                balance = excluded.balance,
                equity = excluded.equity,
                peak_equity = MAX(equity_snapshots.peak_equity, excluded.peak_equity),
                drawdown_percent = excluded.drawdown_percent,
                open_positions = excluded.open_positions,
                margin_percent = excluded.margin_percent,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(&snapshot.account_id)
        .bind(snapshot.balance)
        .bind(snapshot.equity)
        .bind(snapshot.peak_equity)
        .bind(snapshot.drawdown_percent)
        .bind(snapshot.open_positions as i64)
        .bind(snapshot.margin_percent)
        .bind(snapshot.synced_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest_equity_snapshot(
        &self,
        account_id: &str,
    ) -> StoreResult<Option<EquitySnapshot>> {
        let row: Option<super::models::EquitySnapshotRow> = sqlx::query_as(
            r#"
            SELECT account_id, balance, equity, peak_equity, drawdown_percent,
                   open_positions, margin_percent, synced_at
            FROM equity_snapshots
            WHERE account_id = ?1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(EquitySnapshot::from))
    }

    async fn record_history(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReconciliationRecord>> {
        let rows: Vec<ReconciliationRecordRow> = sqlx::query_as(
            r#"
            SELECT account_id, symbol, side, outcome, volume, expected_volume,
                   entry_price, expected_entry_price, divergence_reason,
                   slippage, position_id, ticket, recorded_at
            FROM reconciliation_records
            WHERE account_id = ?1 AND recorded_at >= ?2
            ORDER BY recorded_at DESC
            "#,
        )
        .bind(account_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(ReconciliationRecord::try_from).collect()
    }
}
