//! Reconciliation Scheduler
//!
//! Sole driver of the reconciliation core. A single loop wakes on a fixed
//! interval and fans `sync + guard check` out across all active accounts
//! with bounded concurrency. Within one account the pass is strictly
//! sequential: matching completes before the guard sees the fresh equity,
//! and any resulting liquidation completes before the pass counts as done.
//! One account's failure or timeout never takes down the loop; it is
//! counted, alerted, and retried on the next tick.

use crate::domain::errors::{ConfigError, SyncError};
use crate::domain::repositories::store::PersistenceStore;
use crate::domain::services::alerts::{AlertEvent, AlertSink};
use crate::domain::services::equity_guard::EquityGuard;
use crate::domain::services::reconciliation::ReconciliationEngine;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub sync_interval: Duration,
    /// Per-account task budget; must be shorter than the interval.
    pub sync_timeout: Duration,
    pub max_concurrent_syncs: usize,
    /// How long `stop()` waits for in-flight work before cancelling.
    pub drain_timeout: Duration,
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_syncs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_syncs must be at least 1".to_string(),
            ));
        }
        if self.sync_timeout >= self.sync_interval {
            return Err(ConfigError::Invalid(format!(
                "sync_timeout ({:?}) must be shorter than sync_interval ({:?})",
                self.sync_timeout, self.sync_interval
            )));
        }
        Ok(())
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(10),
            sync_timeout: Duration::from_secs(8),
            max_concurrent_syncs: 5,
            drain_timeout: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cycle_count: u64,
    pub error_count: u64,
    pub last_cycle_time: Option<DateTime<Utc>>,
}

struct Shared {
    engine: ReconciliationEngine,
    guard: EquityGuard,
    store: Arc<dyn PersistenceStore>,
    alerts: Arc<dyn AlertSink>,
    config: SchedulerConfig,
    running: AtomicBool,
    cycle_count: AtomicU64,
    error_count: AtomicU64,
    last_cycle_time: std::sync::Mutex<Option<DateTime<Utc>>>,
    in_flight: Mutex<HashSet<String>>,
}

impl Shared {
    /// One scheduler tick: enumerate accounts, fan out bounded syncs, wait
    /// for all of them. The next tick cannot start while this one runs, so
    /// per-account passes never overlap.
    async fn run_cycle(self: &Arc<Self>) {
        let accounts = match self.store.active_accounts().await {
            Ok(accounts) => accounts,
            Err(e) => {
                warn!(error = %e, "could not enumerate active accounts, skipping cycle");
                self.error_count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        let runnable: Vec<String> = {
            let mut in_flight = self.in_flight.lock().await;
            accounts
                .into_iter()
                .filter(|account| in_flight.insert(account.clone()))
                .collect()
        };

        debug!(accounts = runnable.len(), "reconciliation cycle started");

        stream::iter(runnable)
            .for_each_concurrent(self.config.max_concurrent_syncs, |account| {
                let shared = Arc::clone(self);
                async move {
                    shared.sync_one(&account).await;
                    shared.in_flight.lock().await.remove(&account);
                }
            })
            .await;

        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        *self.last_cycle_time.lock().unwrap_or_else(|e| e.into_inner()) = Some(Utc::now());
    }

    /// Sync then guard-check one account under the task timeout. On timeout
    /// the task is abandoned; records already written stay (at-least-once
    /// semantics, dedup is the closer's job alone).
    async fn sync_one(&self, account_id: &str) {
        let pass = async {
            let report = self.engine.sync_account(account_id).await?;
            self.guard
                .check(account_id, report.equity, &report.open_pairs)
                .await;
            Ok::<(), SyncError>(())
        };

        let outcome = match timeout(self.config.sync_timeout, pass).await {
            Ok(result) => result,
            Err(_) => Err(SyncError::Timeout(self.config.sync_timeout.as_secs())),
        };

        if let Err(e) = outcome {
            match &e {
                SyncError::Gateway(g) if g.is_transient() => {
                    warn!(account_id = %account_id, error = %e, "sync pass failed, retrying next cycle");
                }
                _ => {
                    error!(account_id = %account_id, error = %e, "sync pass failed");
                }
            }
            self.error_count.fetch_add(1, Ordering::Relaxed);
            self.alerts
                .emit(AlertEvent::SyncError {
                    account_id: account_id.to_string(),
                    error: e.to_string(),
                })
                .await;
        }
    }
}

pub struct ReconciliationScheduler {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ReconciliationScheduler {
    pub fn new(
        engine: ReconciliationEngine,
        guard: EquityGuard,
        store: Arc<dyn PersistenceStore>,
        alerts: Arc<dyn AlertSink>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                guard,
                store,
                alerts,
                config,
                running: AtomicBool::new(false),
                cycle_count: AtomicU64::new(0),
                error_count: AtomicU64::new(0),
                last_cycle_time: std::sync::Mutex::new(None),
                in_flight: Mutex::new(HashSet::new()),
            }),
            shutdown,
            driver: Mutex::new(None),
        })
    }

    /// Spawn the driver loop. Idempotent: a second call while running is a
    /// no-op.
    pub async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            debug!("scheduler already running");
            return;
        }

        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            info!(
                interval_secs = shared.config.sync_interval.as_secs(),
                max_concurrent = shared.config.max_concurrent_syncs,
                "reconciliation scheduler started"
            );
            let mut ticker = interval(shared.config.sync_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => shared.run_cycle().await,
                }
            }
            info!("reconciliation scheduler stopped");
        });

        *self.driver.lock().await = Some(handle);
    }

    /// Graceful stop: signal shutdown, wait for the in-flight cycle up to
    /// the drain timeout, then cancel.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let _ = self.shutdown.send(true);

        if let Some(mut handle) = self.driver.lock().await.take() {
            let drain = self.shared.config.drain_timeout;
            if timeout(drain, &mut handle).await.is_err() {
                warn!(drain_secs = drain.as_secs(), "drain timeout exceeded, cancelling driver");
                handle.abort();
            }
        }
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.shared.running.load(Ordering::SeqCst),
            cycle_count: self.shared.cycle_count.load(Ordering::Relaxed),
            error_count: self.shared.error_count.load(Ordering::Relaxed),
            last_cycle_time: *self
                .shared
                .last_cycle_time
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        }
    }

    /// Run a single cycle inline without the interval loop. Used by tests
    /// and one-shot invocations.
    pub async fn run_once(&self) {
        self.shared.run_cycle().await;
    }
}
