pub mod alerts;
pub mod equity_guard;
pub mod matcher;
pub mod position_closer;
pub mod reconciliation;
