//! Equity Guard
//!
//! Per-account drawdown and equity-floor enforcement. Each account moves
//! through `uninitialized -> monitoring -> breached`: the first positive
//! equity observation opens the monitoring epoch, every later check raises
//! the peak and recomputes drawdown, and the first breach liquidates the
//! account exactly once. The guard then stays breached, without re-issuing
//! bulk closes on every cycle, until an operator reset begins a new epoch.

use crate::domain::entities::records::{BulkCloseResult, CloseReason, CloseRequest};
use crate::domain::errors::ConfigError;
use crate::domain::repositories::broker_gateway::BrokerGateway;
use crate::domain::services::alerts::{AlertEvent, AlertSink};
use crate::domain::services::position_closer::PositionCloser;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

/// Guard thresholds, validated at construction and immutable afterwards.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    pub max_drawdown_percent: f64,
    pub min_equity_floor: f64,
}

impl GuardConfig {
    pub fn new(max_drawdown_percent: f64, min_equity_floor: f64) -> Result<Self, ConfigError> {
        if !(1.0..=99.0).contains(&max_drawdown_percent) {
            return Err(ConfigError::OutOfRange {
                name: "max_drawdown_percent",
                value: max_drawdown_percent,
                min: 1.0,
                max: 99.0,
            });
        }
        if min_equity_floor <= 0.0 || !min_equity_floor.is_finite() {
            return Err(ConfigError::NotPositive {
                name: "min_equity_floor",
                value: min_equity_floor,
            });
        }
        Ok(Self {
            max_drawdown_percent,
            min_equity_floor,
        })
    }
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_drawdown_percent: 20.0,
            min_equity_floor: 500.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPhase {
    Uninitialized,
    Monitoring,
    Breached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreachKind {
    Drawdown,
    EquityFloor,
}

/// In-memory monitoring state for one account.
///
/// Invariant after every update: `peak_equity >= entry_equity` and
/// `peak_equity >= current_equity`.
#[derive(Debug, Clone)]
pub struct GuardState {
    pub entry_equity: f64,
    pub peak_equity: f64,
    pub current_equity: f64,
    pub drawdown_percent: f64,
    pub triggered: bool,
    pub positions_closed: u32,
}

impl GuardState {
    fn open(equity: f64) -> Self {
        Self {
            entry_equity: equity,
            peak_equity: equity,
            current_equity: equity,
            drawdown_percent: 0.0,
            triggered: false,
            positions_closed: 0,
        }
    }

    fn observe(&mut self, equity: f64) {
        self.current_equity = equity;
        if equity > self.peak_equity {
            self.peak_equity = equity;
        }
        self.drawdown_percent = if self.peak_equity > 0.0 {
            ((self.peak_equity - equity) / self.peak_equity * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };
    }

    pub fn phase(&self) -> GuardPhase {
        if self.triggered {
            GuardPhase::Breached
        } else {
            GuardPhase::Monitoring
        }
    }
}

/// Outcome of one guard check.
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub phase: GuardPhase,
    pub drawdown_percent: f64,
    pub breach: Option<BreachKind>,
    /// Present only on the check that triggered liquidation.
    pub liquidation: Option<BulkCloseResult>,
}

impl GuardVerdict {
    fn neutral() -> Self {
        Self {
            phase: GuardPhase::Uninitialized,
            drawdown_percent: 0.0,
            breach: None,
            liquidation: None,
        }
    }
}

pub struct EquityGuard {
    config: GuardConfig,
    closer: Arc<PositionCloser>,
    gateway: Arc<dyn BrokerGateway>,
    alerts: Arc<dyn AlertSink>,
    states: Mutex<HashMap<String, GuardState>>,
}

impl EquityGuard {
    pub fn new(
        config: GuardConfig,
        closer: Arc<PositionCloser>,
        gateway: Arc<dyn BrokerGateway>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            config,
            closer,
            gateway,
            alerts,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Evaluate one account against the freshly-synced equity. `open_pairs`
    /// are the live pairings from the same pass; they become the close set
    /// if this check breaches.
    pub async fn check(
        &self,
        account_id: &str,
        equity: f64,
        open_pairs: &[CloseRequest],
    ) -> GuardVerdict {
        let breach = {
            let mut states = self.states.lock().await;
            let state = match states.entry(account_id.to_string()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    if equity <= 0.0 || !equity.is_finite() {
                        // Nothing meaningful observed yet; defer to next cycle.
                        debug!(account_id = %account_id, equity, "skipping guard init on non-positive equity");
                        return GuardVerdict::neutral();
                    }
                    info!(account_id = %account_id, equity, "guard monitoring epoch opened");
                    entry.insert(GuardState::open(equity))
                }
            };

            state.observe(equity);

            let breach = if state.drawdown_percent >= self.config.max_drawdown_percent {
                Some(BreachKind::Drawdown)
            } else if equity < self.config.min_equity_floor {
                Some(BreachKind::EquityFloor)
            } else {
                None
            };

            match breach {
                // Already breached: report but never re-trigger the close storm.
                Some(_) if state.triggered => {
                    return GuardVerdict {
                        phase: GuardPhase::Breached,
                        drawdown_percent: state.drawdown_percent,
                        breach,
                        liquidation: None,
                    };
                }
                Some(kind) => {
                    // Flip triggered inside the lock so a concurrent check of
                    // the same account cannot liquidate twice.
                    state.triggered = true;
                    error!(
                        account_id = %account_id,
                        equity,
                        peak = state.peak_equity,
                        drawdown = state.drawdown_percent,
                        ?kind,
                        "equity breach, forcing liquidation"
                    );
                    (kind, state.peak_equity, state.drawdown_percent)
                }
                None => {
                    // A recovered account stays breached until an operator
                    // reset; the verdict must not relabel it as monitoring.
                    return GuardVerdict {
                        phase: state.phase(),
                        drawdown_percent: state.drawdown_percent,
                        breach: None,
                        liquidation: None,
                    };
                }
            }
        };

        // Lock released: the close sweep and alert run without holding the
        // guard state.
        let (kind, peak, drawdown) = breach;
        let open_count = self.open_position_count(account_id, open_pairs.len()).await;

        let event = match kind {
            BreachKind::Drawdown => AlertEvent::DrawdownBreach {
                account_id: account_id.to_string(),
                drawdown_percent: drawdown,
                threshold_percent: self.config.max_drawdown_percent,
                equity,
                peak_equity: peak,
                open_positions: open_count,
            },
            BreachKind::EquityFloor => AlertEvent::EquityFloorBreach {
                account_id: account_id.to_string(),
                equity,
                floor: self.config.min_equity_floor,
                open_positions: open_count,
            },
        };
        self.alerts.emit(event).await;

        let reason = match kind {
            BreachKind::Drawdown => CloseReason::DrawdownBreach,
            BreachKind::EquityFloor => CloseReason::EquityFloor,
        };
        let bulk = self.closer.close_all(account_id, reason, open_pairs).await;

        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(account_id) {
                state.positions_closed += bulk.successful as u32;
            }
        }

        GuardVerdict {
            phase: GuardPhase::Breached,
            drawdown_percent: drawdown,
            breach: Some(kind),
            liquidation: Some(bulk),
        }
    }

    /// Live broker count for the breach alert. A transient gateway failure
    /// falls back to the pairing count rather than blocking the breach.
    async fn open_position_count(&self, account_id: &str, fallback: usize) -> usize {
        match self.gateway.get_positions(account_id).await {
            Ok(positions) => positions.len(),
            Err(e) => {
                debug!(account_id = %account_id, error = %e, "position count unavailable, using pairing count");
                fallback
            }
        }
    }

    /// Clear entry/peak/triggered for the account, returning it to
    /// `uninitialized` so a fresh monitoring epoch begins.
    pub async fn reset(&self, account_id: &str) {
        let removed = self.states.lock().await.remove(account_id);
        if removed.is_some() {
            info!(account_id = %account_id, "guard state reset");
        }
    }

    pub async fn state(&self, account_id: &str) -> Option<GuardState> {
        self.states.lock().await.get(account_id).cloned()
    }

    pub async fn phase(&self, account_id: &str) -> GuardPhase {
        self.states
            .lock()
            .await
            .get(account_id)
            .map(|s| s.phase())
            .unwrap_or(GuardPhase::Uninitialized)
    }
}
