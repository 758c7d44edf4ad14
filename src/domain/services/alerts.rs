//! Alert Sink
//!
//! Structured events the guard, closer and scheduler emit for the external
//! notification layer. Delivery channels (email, chat, push) are not this
//! crate's concern; the default sink logs through `tracing` so events are
//! never silently dropped when no notifier is wired.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AlertEvent {
    DrawdownBreach {
        account_id: String,
        drawdown_percent: f64,
        threshold_percent: f64,
        equity: f64,
        peak_equity: f64,
        open_positions: usize,
    },
    EquityFloorBreach {
        account_id: String,
        equity: f64,
        floor: f64,
        open_positions: usize,
    },
    PositionClosed {
        account_id: String,
        position_id: String,
        ticket: i64,
        success: bool,
        realized_pnl: Option<f64>,
        reason: String,
    },
    SyncError {
        account_id: String,
        error: String,
    },
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn emit(&self, event: AlertEvent);
}

/// Default sink: structured log lines, JSON payload included so downstream
/// log shippers can parse them.
pub struct TracingAlertSink;

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn emit(&self, event: AlertEvent) {
        let payload = serde_json::to_string(&event).unwrap_or_else(|e| format!("<unserializable: {}>", e));
        match &event {
            AlertEvent::DrawdownBreach { account_id, drawdown_percent, .. } => {
                error!(account_id = %account_id, drawdown = drawdown_percent, payload = %payload, "drawdown breach");
            }
            AlertEvent::EquityFloorBreach { account_id, equity, .. } => {
                error!(account_id = %account_id, equity, payload = %payload, "equity floor breach");
            }
            AlertEvent::PositionClosed { account_id, position_id, success, .. } => {
                info!(account_id = %account_id, position_id = %position_id, success, payload = %payload, "position closed");
            }
            AlertEvent::SyncError { account_id, error } => {
                warn!(account_id = %account_id, error = %error, "sync error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_tag() {
        let event = AlertEvent::SyncError {
            account_id: "acc-1".to_string(),
            error: "Broker request timed out".to_string(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"sync_error\""));
        assert!(json.contains("acc-1"));
    }
}
