//! Broker-side snapshot types.
//!
//! A `BrokerPosition` is a read-only projection of one broker-side position;
//! it only lives for the duration of the `AccountSnapshot` that carried it.
//! Persisted facts are extracted into reconciliation records and equity
//! snapshots, never the snapshot itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::position::PositionSide;

/// One broker-reported position inside a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub ticket: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub entry_price: f64,
    pub current_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub commission: f64,
    pub swap: f64,
    pub profit: f64,
}

impl BrokerPosition {
    /// Floating profit net of commission and swap.
    pub fn unrealized_pnl(&self) -> f64 {
        self.profit - self.commission - self.swap
    }
}

/// Point-in-time broker account state. Immutable once fetched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub margin_used: f64,
    pub positions: Vec<BrokerPosition>,
    pub fetched_at: DateTime<Utc>,
}

impl AccountSnapshot {
    pub fn total_volume(&self) -> f64 {
        self.positions.iter().map(|p| p.volume).sum()
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.positions.iter().map(|p| p.unrealized_pnl()).sum()
    }

    /// Margin in use as a percentage of equity. Zero when equity is not
    /// positive so a blown account never divides by zero.
    pub fn margin_percent(&self) -> f64 {
        if self.equity > 0.0 {
            self.margin_used / self.equity * 100.0
        } else {
            0.0
        }
    }
}
