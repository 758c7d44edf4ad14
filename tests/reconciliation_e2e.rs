//! Reconciliation End-to-End Tests
//!
//! Exercise the scheduler, engine, guard and closer together against the
//! in-memory store and either the simulated broker or a scripted gateway.

use async_trait::async_trait;
use sentra::application::scheduler::{ReconciliationScheduler, SchedulerConfig};
use sentra::domain::entities::position::{ExpectedPosition, PositionSide, PositionStatus};
use sentra::domain::entities::snapshot::{AccountSnapshot, BrokerPosition};
use sentra::domain::errors::GatewayError;
use sentra::domain::repositories::broker_gateway::{BrokerGateway, ClosedDeal, GatewayResult};
use sentra::domain::repositories::store::PersistenceStore;
use sentra::domain::services::alerts::{AlertEvent, AlertSink};
use sentra::domain::services::equity_guard::{EquityGuard, GuardConfig, GuardPhase};
use sentra::domain::services::matcher::PositionMatcher;
use sentra::domain::services::position_closer::PositionCloser;
use sentra::domain::services::reconciliation::ReconciliationEngine;
use sentra::infrastructure::sim_gateway::{SimAccount, SimBrokerGateway};
use sentra::persistence::memory::InMemoryStore;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep;

/// Gateway that reports empty healthy accounts while tracking how many
/// fetches run concurrently.
struct ConcurrencyProbeGateway {
    current: AtomicUsize,
    high_water: AtomicUsize,
    fetch_delay: Duration,
    failing_accounts: Vec<String>,
}

impl ConcurrencyProbeGateway {
    fn new(failing_accounts: Vec<String>) -> Self {
        Self::with_delay(Duration::from_millis(50), failing_accounts)
    }

    fn with_delay(fetch_delay: Duration, failing_accounts: Vec<String>) -> Self {
        Self {
            current: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            fetch_delay,
            failing_accounts,
        }
    }

    fn max_in_flight(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BrokerGateway for ConcurrencyProbeGateway {
    async fn fetch_snapshot(&self, account_id: &str) -> GatewayResult<AccountSnapshot> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        sleep(self.fetch_delay).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if self.failing_accounts.iter().any(|a| a == account_id) {
            return Err(GatewayError::Timeout);
        }
        Ok(AccountSnapshot {
            account_id: account_id.to_string(),
            balance: 10_000.0,
            equity: 10_000.0,
            margin_used: 0.0,
            positions: vec![],
            fetched_at: chrono::Utc::now(),
        })
    }

    async fn close_position(
        &self,
        _ticket: i64,
        _price_override: Option<f64>,
    ) -> GatewayResult<ClosedDeal> {
        Err(GatewayError::Rejected("not used".into()))
    }

    async fn get_positions(&self, _account_id: &str) -> GatewayResult<Vec<BrokerPosition>> {
        Ok(vec![])
    }
}

#[derive(Default)]
struct CollectingSink {
    events: Mutex<Vec<AlertEvent>>,
}

impl CollectingSink {
    fn events(&self) -> Vec<AlertEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl AlertSink for CollectingSink {
    async fn emit(&self, event: AlertEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn expected(id: &str, account_id: &str, symbol: &str, volume: f64, entry: f64) -> ExpectedPosition {
    ExpectedPosition {
        id: id.to_string(),
        account_id: account_id.to_string(),
        symbol: symbol.to_string(),
        side: PositionSide::Long,
        volume,
        entry_price: entry,
        take_profit: None,
        stop_loss: None,
        status: PositionStatus::Open,
    }
}

fn broker_position(ticket: i64, symbol: &str, volume: f64, entry: f64) -> BrokerPosition {
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

fn build_scheduler(
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<InMemoryStore>,
    alerts: Arc<dyn AlertSink>,
    guard_config: GuardConfig,
    scheduler_config: SchedulerConfig,
) -> ReconciliationScheduler {
    let closer = Arc::new(PositionCloser::new(
        gateway.clone(),
        store.clone(),
        alerts.clone(),
    ));
    let guard = EquityGuard::new(guard_config, closer, gateway.clone(), alerts.clone());
    let engine = ReconciliationEngine::new(gateway, store.clone(), PositionMatcher::default());
    ReconciliationScheduler::new(engine, guard, store, alerts, scheduler_config)
        .expect("valid scheduler config")
}

fn fast_config() -> SchedulerConfig {
    SchedulerConfig {
        sync_interval: Duration::from_millis(200),
        sync_timeout: Duration::from_millis(150),
        max_concurrent_syncs: 5,
        drain_timeout: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn test_concurrency_stays_within_bound() {
    let gateway = Arc::new(ConcurrencyProbeGateway::new(vec![]));
    let store = Arc::new(InMemoryStore::new());
    for i in 0..12 {
        store.add_account(&format!("acc-{}", i));
    }

    let scheduler = build_scheduler(
        gateway.clone(),
        store,
        Arc::new(CollectingSink::default()),
        GuardConfig::default(),
        fast_config(),
    );

    scheduler.run_once().await;

    assert!(gateway.max_in_flight() <= 5, "saw {} concurrent fetches", gateway.max_in_flight());
    assert!(gateway.max_in_flight() >= 2, "fan-out never overlapped");
    let status = scheduler.status();
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.error_count, 0);
}

#[tokio::test]
async fn test_one_account_failure_is_isolated() {
    let gateway = Arc::new(ConcurrencyProbeGateway::new(vec!["acc-bad".to_string()]));
    let store = Arc::new(InMemoryStore::new());
    store.add_account("acc-good");
    store.add_account("acc-bad");
    let sink = Arc::new(CollectingSink::default());

    let scheduler = build_scheduler(
        gateway,
        store.clone(),
        sink.clone(),
        GuardConfig::default(),
        fast_config(),
    );
    scheduler.run_once().await;

    let status = scheduler.status();
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.error_count, 1);

    // The healthy account still got its equity snapshot.
    assert!(store
        .latest_equity_snapshot("acc-good")
        .await
        .unwrap()
        .is_some());
    assert!(store
        .latest_equity_snapshot("acc-bad")
        .await
        .unwrap()
        .is_none());

    let sync_errors: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, AlertEvent::SyncError { account_id, .. } if account_id == "acc-bad"))
        .collect();
    assert_eq!(sync_errors.len(), 1);
}

#[tokio::test]
async fn test_slow_account_times_out_and_retries_next_cycle() {
    // Fetch takes far longer than the per-account budget: the pass must be
    // abandoned, counted, and alerted without writing any state.
    let gateway = Arc::new(ConcurrencyProbeGateway::with_delay(
        Duration::from_millis(500),
        vec![],
    ));
    let store = Arc::new(InMemoryStore::new());
    store.add_account("acc-slow");
    let sink = Arc::new(CollectingSink::default());

    let mut config = fast_config();
    config.sync_timeout = Duration::from_millis(50);
    let scheduler = build_scheduler(
        gateway,
        store.clone(),
        sink.clone(),
        GuardConfig::default(),
        config,
    );
    scheduler.run_once().await;

    let status = scheduler.status();
    assert_eq!(status.cycle_count, 1);
    assert_eq!(status.error_count, 1);
    assert!(store
        .latest_equity_snapshot("acc-slow")
        .await
        .unwrap()
        .is_none());

    let timeouts: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| {
            matches!(e, AlertEvent::SyncError { account_id, error }
                if account_id == "acc-slow" && error.contains("timed out"))
        })
        .collect();
    assert_eq!(timeouts.len(), 1);

    // The abandoned pass released its in-flight marker; the account is
    // picked up again on the next cycle.
    scheduler.run_once().await;
    assert_eq!(scheduler.status().cycle_count, 2);
    assert_eq!(scheduler.status().error_count, 2);
}

#[tokio::test]
async fn test_breach_liquidates_through_sim_broker() {
    let gateway = Arc::new(SimBrokerGateway::new());
    gateway.put_account(
        "acc-1",
        SimAccount::new(10_000.0)
            .with_position(broker_position(7001, "EURUSD", 0.10, 1.0850))
            .with_position(broker_position(7002, "GBPUSD", 0.20, 1.2700)),
    );

    let store = Arc::new(InMemoryStore::new());
    store.put_positions(vec![
        expected("p1", "acc-1", "EURUSD", 0.10, 1.0850),
        expected("p2", "acc-1", "GBPUSD", 0.20, 1.2700),
    ]);
    let sink = Arc::new(CollectingSink::default());

    let closer = Arc::new(PositionCloser::new(
        gateway.clone(),
        store.clone(),
        sink.clone(),
    ));
    let guard = EquityGuard::new(
        GuardConfig::new(20.0, 100.0).unwrap(),
        closer,
        gateway.clone(),
        sink.clone(),
    );
    let engine = ReconciliationEngine::new(
        gateway.clone(),
        store.clone(),
        PositionMatcher::default(),
    );
    let scheduler = ReconciliationScheduler::new(
        engine,
        guard,
        store.clone(),
        sink.clone(),
        fast_config(),
    )
    .unwrap();

    // Healthy first pass: monitoring epoch opens at 10k.
    scheduler.run_once().await;
    let events = sink.events();
    assert!(events
        .iter()
        .all(|e| !matches!(e, AlertEvent::DrawdownBreach { .. })));

    // Equity collapses 30% below peak. Next pass must breach and liquidate.
    gateway.set_profit("acc-1", 7001, -1_500.0);
    gateway.set_profit("acc-1", 7002, -1_500.0);
    scheduler.run_once().await;

    let breaches: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, AlertEvent::DrawdownBreach { .. }))
        .collect();
    assert_eq!(breaches.len(), 1);

    // Both broker positions were closed and their loss realized.
    let remaining = gateway.get_positions("acc-1").await.unwrap();
    assert!(remaining.is_empty());
    let closes = store.close_audit("acc-1");
    assert_eq!(closes.len(), 2);
    assert!(closes.iter().all(|c| c.success));

    // A third pass stays breached without a second close storm.
    scheduler.run_once().await;
    assert_eq!(store.close_audit("acc-1").len(), 2);
    let breaches_after: Vec<_> = sink
        .events()
        .into_iter()
        .filter(|e| matches!(e, AlertEvent::DrawdownBreach { .. }))
        .collect();
    assert_eq!(breaches_after.len(), 1);
}

#[tokio::test]
async fn test_broker_closed_positions_are_recorded() {
    let gateway = Arc::new(SimBrokerGateway::new());
    gateway.put_account("acc-1", SimAccount::new(10_000.0));

    let store = Arc::new(InMemoryStore::new());
    store.put_positions(vec![expected("p1", "acc-1", "XAUUSD", 1.0, 2_310.0)]);

    let scheduler = build_scheduler(
        gateway,
        store.clone(),
        Arc::new(CollectingSink::default()),
        GuardConfig::new(20.0, 100.0).unwrap(),
        fast_config(),
    );
    scheduler.run_once().await;

    let records = store
        .record_history("acc-1", chrono::Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let broker_closed: Vec<_> = records
        .iter()
        .filter(|r| r.outcome == sentra::domain::entities::records::OutcomeKind::BrokerClosed)
        .collect();
    assert_eq!(broker_closed.len(), 1);
    assert_eq!(broker_closed[0].symbol, "XAUUSD");
    assert_eq!(broker_closed[0].position_id.as_deref(), Some("p1"));

    // The matcher never mutates the expected position itself.
    let open = store.open_positions("acc-1").await.unwrap();
    assert_eq!(open.len(), 1);
}

#[tokio::test]
async fn test_driver_loop_start_stop() {
    let gateway = Arc::new(SimBrokerGateway::new());
    gateway.put_account("acc-1", SimAccount::new(10_000.0));
    let store = Arc::new(InMemoryStore::new());
    store.add_account("acc-1");

    let scheduler = build_scheduler(
        gateway,
        store,
        Arc::new(CollectingSink::default()),
        GuardConfig::default(),
        fast_config(),
    );

    scheduler.start().await;
    assert!(scheduler.status().running);
    sleep(Duration::from_millis(550)).await;
    scheduler.stop().await;

    let status = scheduler.status();
    assert!(!status.running);
    // First tick fires immediately, then roughly every 200ms.
    assert!(status.cycle_count >= 2, "only {} cycles ran", status.cycle_count);
    assert!(status.last_cycle_time.is_some());

    // Stopped scheduler runs no further cycles.
    let cycles = status.cycle_count;
    sleep(Duration::from_millis(300)).await;
    assert_eq!(scheduler.status().cycle_count, cycles);
}

#[tokio::test]
async fn test_guard_reset_reopens_monitoring() {
    let gateway = Arc::new(SimBrokerGateway::new());
    gateway.put_account(
        "acc-1",
        SimAccount::new(10_000.0).with_position(broker_position(7001, "EURUSD", 0.10, 1.0850)),
    );
    let store = Arc::new(InMemoryStore::new());
    store.put_positions(vec![expected("p1", "acc-1", "EURUSD", 0.10, 1.0850)]);
    let sink = Arc::new(CollectingSink::default());

    let closer = Arc::new(PositionCloser::new(
        gateway.clone(),
        store.clone(),
        sink.clone(),
    ));
    let guard = EquityGuard::new(
        GuardConfig::new(20.0, 100.0).unwrap(),
        closer,
        gateway.clone(),
        sink.clone(),
    );

    guard.check("acc-1", 10_000.0, &[]).await;
    guard.check("acc-1", 7_500.0, &[]).await;
    assert_eq!(guard.phase("acc-1").await, GuardPhase::Breached);

    guard.reset("acc-1").await;
    assert_eq!(guard.phase("acc-1").await, GuardPhase::Uninitialized);
    let verdict = guard.check("acc-1", 7_500.0, &[]).await;
    assert_eq!(verdict.phase, GuardPhase::Monitoring);
}
