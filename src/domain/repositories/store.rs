//! Persistence Store Trait
//!
//! Injected storage capability: append-only audit writes, the single
//! "current" equity snapshot row per account, and reads of expected
//! positions. Implementations: `persistence::SqliteStore` for production,
//! `persistence::InMemoryStore` for tests and dry runs.

use crate::domain::entities::position::ExpectedPosition;
use crate::domain::entities::records::{CloseResult, EquitySnapshot, ReconciliationRecord};
use crate::domain::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Accounts the scheduler should reconcile each cycle.
    async fn active_accounts(&self) -> StoreResult<Vec<String>>;

    /// Expected positions with status `open` for one account.
    async fn open_positions(&self, account_id: &str) -> StoreResult<Vec<ExpectedPosition>>;

    /// Append one reconciliation audit record. Never mutates existing rows.
    async fn append_record(&self, record: &ReconciliationRecord) -> StoreResult<()>;

    /// Append one close attempt, success or failure, to the audit trail.
    async fn append_close(&self, account_id: &str, result: &CloseResult) -> StoreResult<()>;

    /// Insert or update the current equity snapshot row for the account.
    /// The stored peak equity only ever moves up.
    async fn upsert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> StoreResult<()>;

    /// Current equity snapshot row, if the account has ever synced.
    async fn latest_equity_snapshot(
        &self,
        account_id: &str,
    ) -> StoreResult<Option<EquitySnapshot>>;

    /// Reconciliation history for one account, newest first.
    async fn record_history(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReconciliationRecord>>;
}
