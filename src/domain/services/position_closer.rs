//! Position Closer
//!
//! Executes close requests against the broker gateway exactly once per
//! logical position. Both successful and failed attempts are cached under
//! the position id: a re-issued close returns the identical result without
//! contacting the broker again, so retries after a breach never produce a
//! double close. Retrying a cached failure is the caller's decision and
//! goes through a fresh closer epoch, not this cache.

use crate::domain::entities::records::{BulkCloseResult, CloseReason, CloseRequest, CloseResult};
use crate::domain::repositories::broker_gateway::BrokerGateway;
use crate::domain::repositories::store::PersistenceStore;
use crate::domain::services::alerts::{AlertEvent, AlertSink};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct PositionCloser {
    gateway: Arc<dyn BrokerGateway>,
    store: Arc<dyn PersistenceStore>,
    alerts: Arc<dyn AlertSink>,
    // Held across the broker call. Positions never cross accounts, so the
    // serialization this causes is limited to the rare liquidation path.
    cache: Mutex<HashMap<String, CloseResult>>,
}

impl PositionCloser {
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        store: Arc<dyn PersistenceStore>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            gateway,
            store,
            alerts,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Close one position. Idempotent per position id: the first call
    /// decides the result, every later call replays it.
    pub async fn close(
        &self,
        account_id: &str,
        request: &CloseRequest,
        reason: CloseReason,
    ) -> CloseResult {
        let mut cache = self.cache.lock().await;

        if let Some(cached) = cache.get(&request.position_id) {
            debug!(
                position_id = %request.position_id,
                "close replayed from idempotency cache"
            );
            return cached.clone();
        }

        let result = match self.gateway.close_position(request.ticket, None).await {
            Ok(deal) => {
                info!(
                    account_id = %account_id,
                    position_id = %request.position_id,
                    ticket = request.ticket,
                    price = deal.closed_price,
                    pnl = deal.realized_pnl,
                    %reason,
                    "position closed"
                );
                CloseResult {
                    position_id: request.position_id.clone(),
                    ticket: request.ticket,
                    success: true,
                    closed_price: Some(deal.closed_price),
                    realized_pnl: Some(deal.realized_pnl),
                    reason,
                    error: None,
                    closed_at: Utc::now(),
                    idempotency_key: idempotency_key(&request.position_id),
                }
            }
            Err(e) => {
                warn!(
                    account_id = %account_id,
                    position_id = %request.position_id,
                    ticket = request.ticket,
                    error = %e,
                    "close failed"
                );
                CloseResult {
                    position_id: request.position_id.clone(),
                    ticket: request.ticket,
                    success: false,
                    closed_price: None,
                    realized_pnl: None,
                    reason,
                    error: Some(e.to_string()),
                    closed_at: Utc::now(),
                    idempotency_key: idempotency_key(&request.position_id),
                }
            }
        };

        // Persist the attempt before it becomes replayable, so a restart
        // can rebuild the audit trail even if the in-memory cache is gone.
        if let Err(e) = self.store.append_close(account_id, &result).await {
            warn!(
                position_id = %request.position_id,
                error = %e,
                "failed to persist close audit entry"
            );
        }

        self.alerts
            .emit(AlertEvent::PositionClosed {
                account_id: account_id.to_string(),
                position_id: request.position_id.clone(),
                ticket: request.ticket,
                success: result.success,
                realized_pnl: result.realized_pnl,
                reason: reason.as_str().to_string(),
            })
            .await;

        cache.insert(request.position_id.clone(), result.clone());
        result
    }

    /// Close every position in `requests`. One position's failure is counted
    /// and does not stop the sweep; aggregate P&L sums successes only.
    pub async fn close_all(
        &self,
        account_id: &str,
        reason: CloseReason,
        requests: &[CloseRequest],
    ) -> BulkCloseResult {
        let mut results = Vec::with_capacity(requests.len());
        let mut successful = 0;
        let mut failed = 0;
        let mut total_pnl = 0.0;

        for request in requests {
            let result = self.close(account_id, request, reason).await;
            if result.success {
                successful += 1;
                total_pnl += result.realized_pnl.unwrap_or(0.0);
            } else {
                failed += 1;
            }
            results.push(result);
        }

        info!(
            account_id = %account_id,
            total = requests.len(),
            successful,
            failed,
            total_pnl,
            %reason,
            "bulk close finished"
        );

        BulkCloseResult {
            total: requests.len(),
            successful,
            failed,
            total_pnl,
            results,
        }
    }

    /// Drop all cached results, beginning a new close epoch. Used after an
    /// operator reset of the equity guard.
    pub async fn clear_cache(&self) {
        self.cache.lock().await.clear();
    }
}

fn idempotency_key(position_id: &str) -> String {
    format!("close_{}", position_id)
}
