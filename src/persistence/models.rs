//! Database Models
//!
//! Row structs for the SQLite store, with conversions into domain types.
//! Enums are stored as their text form; a row carrying an unknown variant
//! fails the conversion rather than silently defaulting.

use crate::domain::entities::position::{ExpectedPosition, PositionSide, PositionStatus};
use crate::domain::entities::records::{
    CloseReason, CloseResult, DivergenceReason, EquitySnapshot, OutcomeKind, ReconciliationRecord,
};
use crate::domain::errors::StoreError;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct ExpectedPositionRow {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub volume: f64,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: String,
}

impl TryFrom<ExpectedPositionRow> for ExpectedPosition {
    type Error = StoreError;

    fn try_from(row: ExpectedPositionRow) -> Result<Self, Self::Error> {
        let side = PositionSide::parse(&row.side)
            .ok_or_else(|| StoreError::Serialization(format!("unknown side: {}", row.side)))?;
        let status = match row.status.as_str() {
            "open" => PositionStatus::Open,
            "closed" => PositionStatus::Closed,
            other => {
                return Err(StoreError::Serialization(format!(
                    "unknown position status: {}",
                    other
                )))
            }
        };
        Ok(ExpectedPosition {
            id: row.id,
            account_id: row.account_id,
            symbol: row.symbol,
            side,
            volume: row.volume,
            entry_price: row.entry_price,
            take_profit: row.take_profit,
            stop_loss: row.stop_loss,
            status,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ReconciliationRecordRow {
    pub account_id: String,
    pub symbol: String,
    pub side: String,
    pub outcome: String,
    pub volume: f64,
    pub expected_volume: Option<f64>,
    pub entry_price: f64,
    pub expected_entry_price: Option<f64>,
    pub divergence_reason: Option<String>,
    pub slippage: Option<f64>,
    pub position_id: Option<String>,
    pub ticket: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

impl TryFrom<ReconciliationRecordRow> for ReconciliationRecord {
    type Error = StoreError;

    fn try_from(row: ReconciliationRecordRow) -> Result<Self, Self::Error> {
        let side = PositionSide::parse(&row.side)
            .ok_or_else(|| StoreError::Serialization(format!("unknown side: {}", row.side)))?;
        let outcome = OutcomeKind::parse(&row.outcome).ok_or_else(|| {
            StoreError::Serialization(format!("unknown outcome: {}", row.outcome))
        })?;
        let divergence_reason = match row.divergence_reason.as_deref() {
            Some(s) => Some(DivergenceReason::parse(s).ok_or_else(|| {
                StoreError::Serialization(format!("unknown divergence reason: {}", s))
            })?),
            None => None,
        };
        Ok(ReconciliationRecord {
            account_id: row.account_id,
            symbol: row.symbol,
            side,
            outcome,
            volume: row.volume,
            expected_volume: row.expected_volume,
            entry_price: row.entry_price,
            expected_entry_price: row.expected_entry_price,
            divergence_reason,
            slippage: row.slippage,
            position_id: row.position_id,
            ticket: row.ticket,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct CloseAuditRow {
    pub position_id: String,
    pub ticket: i64,
    pub success: bool,
    pub closed_price: Option<f64>,
    pub realized_pnl: Option<f64>,
    pub reason: String,
    pub error: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub idempotency_key: String,
}

impl TryFrom<CloseAuditRow> for CloseResult {
    type Error = StoreError;

    fn try_from(row: CloseAuditRow) -> Result<Self, Self::Error> {
        let reason = CloseReason::parse(&row.reason).ok_or_else(|| {
            StoreError::Serialization(format!("unknown close reason: {}", row.reason))
        })?;
        Ok(CloseResult {
            position_id: row.position_id,
            ticket: row.ticket,
            success: row.success,
            closed_price: row.closed_price,
            realized_pnl: row.realized_pnl,
            reason,
            error: row.error,
            closed_at: row.closed_at,
            idempotency_key: row.idempotency_key,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct EquitySnapshotRow {
    pub account_id: String,
    pub balance: f64,
    pub equity: f64,
    pub peak_equity: f64,
    pub drawdown_percent: f64,
    pub open_positions: i64,
    pub margin_percent: f64,
    pub synced_at: DateTime<Utc>,
}

impl From<EquitySnapshotRow> for EquitySnapshot {
    fn from(row: EquitySnapshotRow) -> Self {
        EquitySnapshot {
            account_id: row.account_id,
            balance: row.balance,
            equity: row.equity,
            peak_equity: row.peak_equity,
            drawdown_percent: row.drawdown_percent,
            open_positions: row.open_positions.max(0) as u32,
            margin_percent: row.margin_percent,
            synced_at: row.synced_at,
        }
    }
}
