//! Reconciliation Engine
//!
//! One sync pass for one account: fetch the broker snapshot, pair its
//! positions against the internally-expected open set, persist one audit
//! record per outcome, and update the account's equity snapshot. A failed
//! fetch aborts the whole pass with no state mutation; a failed write for
//! one record is counted and the pass continues.

use crate::domain::entities::position::ExpectedPosition;
use crate::domain::entities::records::{
    CloseRequest, EquitySnapshot, OutcomeKind, ReconciliationRecord,
};
use crate::domain::entities::snapshot::{AccountSnapshot, BrokerPosition};
use crate::domain::errors::SyncError;
use crate::domain::repositories::broker_gateway::BrokerGateway;
use crate::domain::repositories::store::PersistenceStore;
use crate::domain::services::matcher::PositionMatcher;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Summary of one completed pass.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub account_id: String,
    pub matched: usize,
    pub diverged: usize,
    pub unmatched: usize,
    pub broker_closed: usize,
    /// Non-fatal per-record persistence failures.
    pub record_errors: usize,
    pub equity: f64,
    pub balance: f64,
    /// Live (expected id, broker ticket) pairings for the guard's close set.
    pub open_pairs: Vec<CloseRequest>,
}

impl SyncReport {
    pub fn total_outcomes(&self) -> usize {
        self.matched + self.diverged + self.unmatched + self.broker_closed
    }
}

pub struct ReconciliationEngine {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<dyn PersistenceStore>,
    matcher: PositionMatcher,
}

impl ReconciliationEngine {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn PersistenceStore>,
        matcher: PositionMatcher,
    ) -> Self {
        Self {
            gateway,
            store,
            matcher,
        }
    }

    /// Run one reconciliation pass for `account_id`.
    pub async fn sync_account(&self, account_id: &str) -> Result<SyncReport, SyncError> {
        // A fetch failure must never read as "zero positions": abort here,
        // leave the equity snapshot untouched, retry next cycle.
        let snapshot = self.gateway.fetch_snapshot(account_id).await?;
        let expected = self.store.open_positions(account_id).await?;

        debug!(
            account_id = %account_id,
            broker_positions = snapshot.positions.len(),
            expected_positions = expected.len(),
            "reconciliation pass started"
        );

        let mut report = SyncReport {
            account_id: account_id.to_string(),
            matched: 0,
            diverged: 0,
            unmatched: 0,
            broker_closed: 0,
            record_errors: 0,
            equity: snapshot.equity,
            balance: snapshot.balance,
            open_pairs: Vec::new(),
        };
        let mut consumed = vec![false; expected.len()];

        // Broker positions in snapshot order; matching is order-dependent
        // and must stay sequential within one account.
        for broker in &snapshot.positions {
            let record = match self.matcher.find_match(broker, &expected, &consumed) {
                Some(idx) => {
                    consumed[idx] = true;
                    let exp = &expected[idx];
                    let verdict = self.matcher.classify(broker, exp);
                    match verdict.outcome {
                        OutcomeKind::Divergence => report.diverged += 1,
                        _ => report.matched += 1,
                    }
                    report.open_pairs.push(CloseRequest {
                        position_id: exp.id.clone(),
                        ticket: broker.ticket,
                        symbol: broker.symbol.clone(),
                    });
                    paired_record(account_id, broker, exp, &verdict)
                }
                None => {
                    report.unmatched += 1;
                    unmatched_record(account_id, broker)
                }
            };
            self.persist_record(&record, &mut report).await;
        }

        // Whatever is still open internally but absent from the snapshot was
        // closed on the broker side. Status mutation is not the matcher's
        // job; confirmation happens through the closer.
        for (idx, exp) in expected.iter().enumerate() {
            if !consumed[idx] && exp.is_open() {
                report.broker_closed += 1;
                let record = broker_closed_record(account_id, exp);
                self.persist_record(&record, &mut report).await;
            }
        }

        self.update_equity_snapshot(&snapshot, &mut report).await;

        info!(
            account_id = %account_id,
            matched = report.matched,
            diverged = report.diverged,
            unmatched = report.unmatched,
            broker_closed = report.broker_closed,
            record_errors = report.record_errors,
            equity = report.equity,
            "reconciliation pass finished"
        );

        Ok(report)
    }

    /// Append one audit record. Failure is isolated: counted, logged, and
    /// the rest of the pass carries on.
    async fn persist_record(&self, record: &ReconciliationRecord, report: &mut SyncReport) {
        if let Err(e) = self.store.append_record(record).await {
            warn!(
                account_id = %record.account_id,
                symbol = %record.symbol,
                outcome = record.outcome.as_str(),
                error = %e,
                "failed to persist reconciliation record"
            );
            report.record_errors += 1;
        }
    }

    async fn update_equity_snapshot(&self, snapshot: &AccountSnapshot, report: &mut SyncReport) {
        // Peak carries over from the stored row so it stays monotone across
        // restarts; the guard keeps its own in-memory epoch state.
        let previous_peak = match self.store.latest_equity_snapshot(&snapshot.account_id).await {
            Ok(row) => row.map(|r| r.peak_equity).unwrap_or(snapshot.equity),
            Err(e) => {
                warn!(account_id = %snapshot.account_id, error = %e, "failed to read previous equity snapshot");
                report.record_errors += 1;
                snapshot.equity
            }
        };
        let peak = previous_peak.max(snapshot.equity);
        let drawdown = if peak > 0.0 {
            ((peak - snapshot.equity) / peak * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        let row = EquitySnapshot {
            account_id: snapshot.account_id.clone(),
            balance: snapshot.balance,
            equity: snapshot.equity,
            peak_equity: peak,
            drawdown_percent: drawdown,
            open_positions: snapshot.positions.len() as u32,
            margin_percent: snapshot.margin_percent(),
            synced_at: snapshot.fetched_at,
        };
        if let Err(e) = self.store.upsert_equity_snapshot(&row).await {
            warn!(account_id = %snapshot.account_id, error = %e, "failed to upsert equity snapshot");
            report.record_errors += 1;
        }
    }
}

fn paired_record(
    account_id: &str,
    broker: &BrokerPosition,
    expected: &ExpectedPosition,
    verdict: &crate::domain::services::matcher::MatchVerdict,
) -> ReconciliationRecord {
    ReconciliationRecord {
        account_id: account_id.to_string(),
        symbol: broker.symbol.clone(),
        side: broker.side,
        outcome: verdict.outcome,
        volume: broker.volume,
        expected_volume: Some(expected.volume),
        entry_price: broker.entry_price,
        expected_entry_price: Some(expected.entry_price),
        divergence_reason: verdict.divergence_reason,
        slippage: verdict.slippage,
        position_id: Some(expected.id.clone()),
        ticket: Some(broker.ticket),
        recorded_at: Utc::now(),
    }
}

fn unmatched_record(account_id: &str, broker: &BrokerPosition) -> ReconciliationRecord {
    ReconciliationRecord {
        account_id: account_id.to_string(),
        symbol: broker.symbol.clone(),
        side: broker.side,
        outcome: OutcomeKind::Unmatched,
        volume: broker.volume,
        expected_volume: None,
        entry_price: broker.entry_price,
        expected_entry_price: None,
        divergence_reason: None,
        slippage: None,
        position_id: None,
        ticket: Some(broker.ticket),
        recorded_at: Utc::now(),
    }
}

fn broker_closed_record(account_id: &str, expected: &ExpectedPosition) -> ReconciliationRecord {
    ReconciliationRecord {
        account_id: account_id.to_string(),
        symbol: expected.symbol.clone(),
        side: expected.side,
        outcome: OutcomeKind::BrokerClosed,
        volume: expected.volume,
        expected_volume: Some(expected.volume),
        entry_price: expected.entry_price,
        expected_entry_price: Some(expected.entry_price),
        divergence_reason: None,
        slippage: None,
        position_id: Some(expected.id.clone()),
        ticket: None,
        recorded_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{PositionSide, PositionStatus};
    use crate::domain::errors::GatewayError;
    use crate::domain::repositories::broker_gateway::{ClosedDeal, GatewayResult};
    use crate::persistence::memory::InMemoryStore;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct FixedGateway {
        snapshot: Mutex<Option<GatewayResult<AccountSnapshot>>>,
    }

    impl FixedGateway {
        fn ok(snapshot: AccountSnapshot) -> Self {
            Self {
                snapshot: Mutex::new(Some(Ok(snapshot))),
            }
        }

        fn err(error: GatewayError) -> Self {
            Self {
                snapshot: Mutex::new(Some(Err(error))),
            }
        }
    }

    #[async_trait]
    impl BrokerGateway for FixedGateway {
        async fn fetch_snapshot(&self, _account_id: &str) -> GatewayResult<AccountSnapshot> {
            self.snapshot
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(GatewayError::Unavailable("exhausted".into())))
        }

        async fn close_position(
            &self,
            _ticket: i64,
            _price_override: Option<f64>,
        ) -> GatewayResult<ClosedDeal> {
            Err(GatewayError::Rejected("not used".into()))
        }

        async fn get_positions(
            &self,
            _account_id: &str,
        ) -> GatewayResult<Vec<BrokerPosition>> {
            Ok(vec![])
        }
    }

    fn expected(id: &str, symbol: &str, volume: f64, entry: f64) -> ExpectedPosition {
        ExpectedPosition {
            id: id.to_string(),
            account_id: "acc-1".to_string(),
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            volume,
            entry_price: entry,
            take_profit: None,
            stop_loss: None,
            status: PositionStatus::Open,
        }
    }

    fn broker(ticket: i64, symbol: &str, volume: f64, entry: f64) -> BrokerPosition {
        BrokerPosition {
            ticket,
            symbol: symbol.to_string(),
            side: PositionSide::Long,
            volume,
            entry_price: entry,
            current_price: entry,
            take_profit: None,
            stop_loss: None,
            commission: 0.0,
            swap: 0.0,
            profit: 0.0,
        }
    }

    fn snapshot(positions: Vec<BrokerPosition>) -> AccountSnapshot {
        AccountSnapshot {
            account_id: "acc-1".to_string(),
            balance: 10_000.0,
            equity: 10_050.0,
            margin_used: 200.0,
            positions,
            fetched_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_full_pass_counts_and_pairs() {
        let store = Arc::new(InMemoryStore::new());
        let mut p2 = expected("p2", "GBPUSD", 0.20, 1.2700);
        p2.stop_loss = Some(1.2650);
        store.put_positions(vec![
            expected("p1", "EURUSD", 0.10, 1.0850),
            p2,
            expected("p3", "XAUUSD", 1.00, 2310.00),
        ]);
        let mut drifted = broker(7002, "GBPUSD", 0.20, 1.2701);
        drifted.stop_loss = Some(1.2600);
        let gateway = Arc::new(FixedGateway::ok(snapshot(vec![
            broker(7001, "EURUSD", 0.10, 1.0850), // clean match
            drifted,                              // pairs, SL drift -> divergence
            broker(7003, "USDJPY", 0.30, 155.20), // unmatched
        ])));
        // p3 (XAUUSD) never appears in the snapshot -> broker-closed.

        let engine = ReconciliationEngine::new(gateway, store.clone(), PositionMatcher::default());
        let report = engine.sync_account("acc-1").await.unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.diverged, 1);
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.broker_closed, 1);
        assert_eq!(report.record_errors, 0);
        assert_eq!(report.total_outcomes(), 4);

        let pairs: Vec<_> = report.open_pairs.iter().map(|p| p.position_id.as_str()).collect();
        assert_eq!(pairs, vec!["p1", "p2"]);

        let records = store.record_history("acc-1", Utc::now() - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(records.len(), 4);

        let row = store.latest_equity_snapshot("acc-1").await.unwrap().unwrap();
        assert_eq!(row.equity, 10_050.0);
        assert_eq!(row.open_positions, 3);
    }

    #[tokio::test]
    async fn test_slippage_within_tolerance_is_clean() {
        let store = Arc::new(InMemoryStore::new());
        store.put_positions(vec![expected("p1", "GBPUSD", 0.20, 1.2700)]);
        let gateway = Arc::new(FixedGateway::ok(snapshot(vec![broker(
            7002, "GBPUSD", 0.20, 1.2701,
        )])));
        let engine = ReconciliationEngine::new(gateway, store, PositionMatcher::default());
        let report = engine.sync_account("acc-1").await.unwrap();
        assert_eq!(report.matched, 1);
        assert_eq!(report.diverged, 0);
    }

    #[tokio::test]
    async fn test_each_expected_consumed_at_most_once() {
        let store = Arc::new(InMemoryStore::new());
        store.put_positions(vec![expected("p1", "EURUSD", 0.10, 1.0850)]);
        let gateway = Arc::new(FixedGateway::ok(snapshot(vec![
            broker(7001, "EURUSD", 0.10, 1.0850),
            broker(7002, "EURUSD", 0.10, 1.0850),
        ])));
        let engine = ReconciliationEngine::new(gateway, store.clone(), PositionMatcher::default());
        let report = engine.sync_account("acc-1").await.unwrap();

        assert_eq!(report.matched, 1);
        assert_eq!(report.unmatched, 1);

        let records = store
            .record_history("acc-1", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        let p1_outcomes = records
            .iter()
            .filter(|r| r.position_id.as_deref() == Some("p1"))
            .count();
        assert_eq!(p1_outcomes, 1);
    }

    #[tokio::test]
    async fn test_gateway_failure_aborts_without_mutation() {
        let store = Arc::new(InMemoryStore::new());
        store.put_positions(vec![expected("p1", "EURUSD", 0.10, 1.0850)]);
        let gateway = Arc::new(FixedGateway::err(GatewayError::Timeout));
        let engine = ReconciliationEngine::new(gateway, store.clone(), PositionMatcher::default());

        let result = engine.sync_account("acc-1").await;
        assert!(matches!(result, Err(SyncError::Gateway(GatewayError::Timeout))));

        // No records, no equity snapshot: a failed fetch is not "zero positions".
        assert!(store.latest_equity_snapshot("acc-1").await.unwrap().is_none());
        let records = store
            .record_history("acc-1", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_record_persist_failure_is_isolated() {
        let store = Arc::new(InMemoryStore::new());
        store.put_positions(vec![expected("p1", "EURUSD", 0.10, 1.0850)]);
        store.fail_next_appends(1);
        let gateway = Arc::new(FixedGateway::ok(snapshot(vec![
            broker(7001, "EURUSD", 0.10, 1.0850),
            broker(7002, "USDJPY", 0.30, 155.20),
        ])));
        let engine = ReconciliationEngine::new(gateway, store.clone(), PositionMatcher::default());
        let report = engine.sync_account("acc-1").await.unwrap();

        // First record write failed but the pass finished and wrote the rest.
        assert_eq!(report.record_errors, 1);
        assert_eq!(report.total_outcomes(), 2);
        let records = store
            .record_history("acc-1", Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert!(store.latest_equity_snapshot("acc-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_persisted_peak_is_monotone() {
        let store = Arc::new(InMemoryStore::new());
        let engine = ReconciliationEngine::new(
            Arc::new(FixedGateway::ok(snapshot(vec![]))),
            store.clone(),
            PositionMatcher::default(),
        );
        engine.sync_account("acc-1").await.unwrap();
        let first = store.latest_equity_snapshot("acc-1").await.unwrap().unwrap();
        assert_eq!(first.peak_equity, 10_050.0);

        // Lower equity afterwards: peak must hold.
        let mut lower = snapshot(vec![]);
        lower.equity = 9_000.0;
        let engine = ReconciliationEngine::new(
            Arc::new(FixedGateway::ok(lower)),
            store.clone(),
            PositionMatcher::default(),
        );
        engine.sync_account("acc-1").await.unwrap();
        let second = store.latest_equity_snapshot("acc-1").await.unwrap().unwrap();
        assert_eq!(second.peak_equity, 10_050.0);
        assert!((second.drawdown_percent - (10_050.0 - 9_000.0) / 10_050.0 * 100.0).abs() < 1e-9);
    }
}
