//! Broker Gateway Trait
//!
//! Abstract capability contract the core requires from the broker. The wire
//! protocol behind it (FIX, REST, terminal bridge) is not this crate's
//! concern; implementations live outside or in `infrastructure`. The
//! abstraction keeps the engine, guard and closer mockable in tests.

use crate::domain::entities::snapshot::{AccountSnapshot, BrokerPosition};
use crate::domain::errors::GatewayError;
use async_trait::async_trait;

/// Common result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Confirmation returned by the broker for a filled close.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClosedDeal {
    pub closed_price: f64,
    pub realized_pnl: f64,
}

/// Consumed capability: account snapshots and close operations.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Fetch the authoritative point-in-time state of one account.
    ///
    /// A failed fetch must never be treated as "zero positions": callers
    /// abort the pass and retry on the next cycle.
    async fn fetch_snapshot(&self, account_id: &str) -> GatewayResult<AccountSnapshot>;

    /// Close the position behind `ticket`, optionally at a caller-supplied
    /// price for instruments that support it.
    async fn close_position(
        &self,
        ticket: i64,
        price_override: Option<f64>,
    ) -> GatewayResult<ClosedDeal>;

    /// Open broker positions for one account, used for reporting.
    async fn get_positions(&self, account_id: &str) -> GatewayResult<Vec<BrokerPosition>>;
}
