//! Persisted reconciliation facts.
//!
//! Reconciliation records and close results are append-only: once written
//! they are never mutated, only queried for history and alerting. The equity
//! snapshot is the one exception, a single continuously-upserted "current"
//! row per account.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::position::PositionSide;

/// Outcome of matching one broker or expected position in a pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutcomeKind {
    /// Paired and clean within all tolerances.
    Matched,
    /// Paired, but attributes differ beyond the clean-match tolerance.
    Divergence,
    /// Broker position with no internal counterpart (manual or unreported).
    Unmatched,
    /// Internally-open position absent from the broker snapshot.
    BrokerClosed,
}

impl OutcomeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeKind::Matched => "matched",
            OutcomeKind::Divergence => "divergence",
            OutcomeKind::Unmatched => "unmatched",
            OutcomeKind::BrokerClosed => "broker_closed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "matched" => Some(OutcomeKind::Matched),
            "divergence" => Some(OutcomeKind::Divergence),
            "unmatched" => Some(OutcomeKind::Unmatched),
            "broker_closed" => Some(OutcomeKind::BrokerClosed),
            _ => None,
        }
    }
}

/// Why a matched pair was classified as a divergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivergenceReason {
    EntrySlippage,
    VolumeMismatch,
    StopLevelDrift,
}

impl DivergenceReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DivergenceReason::EntrySlippage => "entry_slippage",
            DivergenceReason::VolumeMismatch => "volume_mismatch",
            DivergenceReason::StopLevelDrift => "stop_level_drift",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "entry_slippage" => Some(DivergenceReason::EntrySlippage),
            "volume_mismatch" => Some(DivergenceReason::VolumeMismatch),
            "stop_level_drift" => Some(DivergenceReason::StopLevelDrift),
            _ => None,
        }
    }
}

/// Append-only audit fact, one per matcher decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationRecord {
    pub account_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub outcome: OutcomeKind,
    /// Broker-reported volume; expected volume for broker-closed records.
    pub volume: f64,
    pub expected_volume: Option<f64>,
    /// Broker-reported entry price; expected entry for broker-closed records.
    pub entry_price: f64,
    pub expected_entry_price: Option<f64>,
    pub divergence_reason: Option<DivergenceReason>,
    /// Absolute entry-price slippage for paired outcomes.
    pub slippage: Option<f64>,
    pub position_id: Option<String>,
    pub ticket: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// Per-account rolling drawdown state, one current row per account.
///
/// `peak_equity` is monotonically non-decreasing until an operator reset
/// begins a new monitoring epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquitySnapshot {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_percent: f64,
    pub open_positions: u32,
    pub margin_percent: f64,
    pub synced_at: DateTime<Utc>,
}

/// Why a close was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    DrawdownBreach,
    EquityFloor,
    Divergence,
    Manual,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::DrawdownBreach => "drawdown_breach",
            CloseReason::EquityFloor => "equity_floor",
            CloseReason::Divergence => "divergence",
            CloseReason::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "drawdown_breach" => Some(CloseReason::DrawdownBreach),
            "equity_floor" => Some(CloseReason::EquityFloor),
            "divergence" => Some(CloseReason::Divergence),
            "manual" => Some(CloseReason::Manual),
            _ => None,
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Handle for one liquidation target, produced by the engine's pairing step
/// so the guard and closer never re-run matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseRequest {
    pub position_id: String,
    pub ticket: i64,
    pub symbol: String,
}

/// Outcome of one close attempt. Cached per position id; a re-issued close
/// for the same position returns the identical result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    pub position_id: String,
    pub ticket: i64,
    pub success: bool,
    pub closed_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub reason: CloseReason,
    pub error: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Aggregate of one `close_all` sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkCloseResult {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    /// Sums realized P&L over successful closes only.
    pub total_pnl: f64,
    pub results: Vec<CloseResult>,
}
