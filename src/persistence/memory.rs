//! In-Memory Store
//!
//! `PersistenceStore` backed by plain maps. Used by the test suites and by
//! dry runs of the binary where no database should be touched. Supports
//! scripted write failures so error-isolation paths can be exercised.

use crate::domain::entities::position::ExpectedPosition;
use crate::domain::entities::records::{CloseResult, EquitySnapshot, ReconciliationRecord};
use crate::domain::errors::StoreError;
use crate::domain::repositories::store::{PersistenceStore, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Inner {
    accounts: Vec<String>,
    positions: Vec<ExpectedPosition>,
    records: Vec<ReconciliationRecord>,
    closes: Vec<(String, CloseResult)>,
    equity: HashMap<String, EquitySnapshot>,
    failing_appends: usize,
}

#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an account for the scheduler without seeding positions.
    pub fn add_account(&self, account_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accounts.iter().any(|a| a == account_id) {
            inner.accounts.push(account_id.to_string());
        }
    }

    /// Seed expected positions; their accounts become active.
    pub fn put_positions(&self, positions: Vec<ExpectedPosition>) {
        let mut inner = self.inner.lock().unwrap();
        for position in &positions {
            if !inner.accounts.iter().any(|a| *a == position.account_id) {
                inner.accounts.push(position.account_id.clone());
            }
        }
        inner.positions.extend(positions);
    }

    /// Make the next `n` append calls fail with a query error.
    pub fn fail_next_appends(&self, n: usize) {
        self.inner.lock().unwrap().failing_appends = n;
    }

    /// Close audit entries for one account, oldest first.
    pub fn close_audit(&self, account_id: &str) -> Vec<CloseResult> {
        self.inner
            .lock()
            .unwrap()
            .closes
            .iter()
            .filter(|(acc, _)| acc == account_id)
            .map(|(_, result)| result.clone())
            .collect()
    }

    fn take_scripted_failure(inner: &mut Inner) -> Option<StoreError> {
        if inner.failing_appends > 0 {
            inner.failing_appends -= 1;
            Some(StoreError::Query("scripted failure".to_string()))
        } else {
            None
        }
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn active_accounts(&self) -> StoreResult<Vec<String>> {
        Ok(self.inner.lock().unwrap().accounts.clone())
    }

    async fn open_positions(&self, account_id: &str) -> StoreResult<Vec<ExpectedPosition>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .positions
            .iter()
            .filter(|p| p.account_id == account_id && p.is_open())
            .cloned()
            .collect())
    }

    async fn append_record(&self, record: &ReconciliationRecord) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut inner) {
            return Err(err);
        }
        inner.records.push(record.clone());
        Ok(())
    }

    async fn append_close(&self, account_id: &str, result: &CloseResult) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(err) = Self::take_scripted_failure(&mut inner) {
            return Err(err);
        }
        inner.closes.push((account_id.to_string(), result.clone()));
        Ok(())
    }

    async fn upsert_equity_snapshot(&self, snapshot: &EquitySnapshot) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .equity
            .insert(snapshot.account_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn latest_equity_snapshot(
        &self,
        account_id: &str,
    ) -> StoreResult<Option<EquitySnapshot>> {
        Ok(self.inner.lock().unwrap().equity.get(account_id).cloned())
    }

    async fn record_history(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ReconciliationRecord>> {
        let mut records: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|r| r.account_id == account_id && r.recorded_at >= since)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        Ok(records)
    }
}
