//! Internally-tracked positions.
//!
//! `ExpectedPosition` is the trading subsystem's belief about an open
//! position. The reconciliation core reads it but never mutates it directly;
//! a position is only marked closed through a confirmed `CloseResult`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(PositionSide::Long),
            "short" | "sell" => Some(PositionSide::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
        }
    }
}

/// The system's belief about one open position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpectedPosition {
    pub id: String,
    pub account_id: String,
    pub symbol: String,
    pub side: PositionSide,
    pub volume: f64,
    pub entry_price: f64,
    pub take_profit: Option<f64>,
    pub stop_loss: Option<f64>,
    pub status: PositionStatus,
}

impl ExpectedPosition {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }
}
