//! Simulated Broker Gateway
//!
//! In-process `BrokerGateway` backed by a scriptable account book. Serves
//! local runs of the binary and the integration tests; the real broker
//! bridge lives outside this crate. Closing a position realizes its current
//! floating P&L into the balance and removes it from the book.

use crate::domain::entities::snapshot::{AccountSnapshot, BrokerPosition};
use crate::domain::errors::GatewayError;
use crate::domain::repositories::broker_gateway::{BrokerGateway, ClosedDeal, GatewayResult};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct SimAccount {
    pub balance: f64,
    pub margin_used: f64,
    pub positions: Vec<BrokerPosition>,
}

impl SimAccount {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            margin_used: 0.0,
            positions: Vec::new(),
        }
    }

    pub fn with_position(mut self, position: BrokerPosition) -> Self {
        self.positions.push(position);
        self
    }

    fn equity(&self) -> f64 {
        self.balance + self.positions.iter().map(|p| p.unrealized_pnl()).sum::<f64>()
    }
}

#[derive(Default)]
pub struct SimBrokerGateway {
    accounts: Mutex<HashMap<String, SimAccount>>,
}

impl SimBrokerGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_account(&self, account_id: &str, account: SimAccount) {
        self.accounts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(account_id.to_string(), account);
    }

    /// Adjust the floating profit of one position, moving the account's
    /// equity with it.
    pub fn set_profit(&self, account_id: &str, ticket: i64, profit: f64) {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(account) = accounts.get_mut(account_id) {
            if let Some(position) = account.positions.iter_mut().find(|p| p.ticket == ticket) {
                position.profit = profit;
            }
        }
    }
}

#[async_trait]
impl BrokerGateway for SimBrokerGateway {
    async fn fetch_snapshot(&self, account_id: &str) -> GatewayResult<AccountSnapshot> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        let account = accounts
            .get(account_id)
            .ok_or_else(|| GatewayError::Unavailable(format!("unknown account {}", account_id)))?;
        Ok(AccountSnapshot {
            account_id: account_id.to_string(),
            balance: account.balance,
            equity: account.equity(),
            margin_used: account.margin_used,
            positions: account.positions.clone(),
            fetched_at: Utc::now(),
        })
    }

    async fn close_position(
        &self,
        ticket: i64,
        price_override: Option<f64>,
    ) -> GatewayResult<ClosedDeal> {
        let mut accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        for account in accounts.values_mut() {
            if let Some(idx) = account.positions.iter().position(|p| p.ticket == ticket) {
                let position = account.positions.remove(idx);
                let closed_price = price_override.unwrap_or(position.current_price);
                let realized_pnl = position.unrealized_pnl();
                account.balance += realized_pnl;
                debug!(ticket, closed_price, realized_pnl, "sim position closed");
                return Ok(ClosedDeal {
                    closed_price,
                    realized_pnl,
                });
            }
        }
        Err(GatewayError::NotFound(format!("ticket {}", ticket)))
    }

    async fn get_positions(&self, account_id: &str) -> GatewayResult<Vec<BrokerPosition>> {
        let accounts = self.accounts.lock().unwrap_or_else(|e| e.into_inner());
        let account = accounts
            .get(account_id)
            .ok_or_else(|| GatewayError::Unavailable(format!("unknown account {}", account_id)))?;
        Ok(account.positions.clone())
    }
}
