// =============================================================================
// Execution router — stateless facade over the connector, risk, and position
// subsystems (§4.J)
// =============================================================================
//
// No caching of its own: every call reads through to the owning service.
// A per-venue async mutex serializes submit+cancel sequences so a tracking-
// limit repost cycle on one venue can't interleave with, say, an emergency
// flatten on the same venue racing for the same book.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as SyncRwLock;
use tokio::sync::Mutex;

use crate::coi::CoiAllocator;
use crate::connector::Connector;
use crate::error::ExecError;
use crate::order::Order;
use crate::position::{AggregateReport, PlannedOrder, PositionService};
use crate::risk::{PostOrderRisk, RiskService};
use crate::symbol::SymbolMapper;
use crate::tracking_limit::{place_tracking_limit_order, TrackingLimitParams};

pub struct ExecutionRouter {
    connectors: HashMap<String, Arc<dyn Connector>>,
    locks: SyncRwLock<HashMap<String, Arc<Mutex<()>>>>,
    symbols: Arc<SymbolMapper>,
    coi: Arc<CoiAllocator>,
    positions: PositionService,
    risk: RiskService,
}

impl ExecutionRouter {
    pub fn new(symbols: Arc<SymbolMapper>, coi: Arc<CoiAllocator>, risk: RiskService) -> Self {
        Self {
            connectors: HashMap::new(),
            locks: SyncRwLock::new(HashMap::new()),
            symbols: symbols.clone(),
            coi,
            positions: PositionService::new(symbols),
            risk,
        }
    }

    pub fn register_connector(&mut self, venue: &str, connector: Arc<dyn Connector>) {
        let key = venue.to_lowercase();
        self.connectors.insert(key.clone(), connector.clone());
        self.positions.register_connector(&key, connector);
    }

    fn connector(&self, venue: &str) -> Result<&Arc<dyn Connector>, ExecError> {
        self.connectors.get(&venue.to_lowercase()).ok_or_else(|| ExecError::ConfigError(format!(
            "no connector registered for venue: {venue}"
        )))
    }

    fn lock_for(&self, venue: &str) -> Arc<Mutex<()>> {
        let key = venue.to_lowercase();
        if let Some(lock) = self.locks.read().get(&key) {
            return lock.clone();
        }
        let mut locks = self.locks.write();
        locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    fn venue_symbol(&self, venue: &str, canonical_symbol: &str) -> String {
        self.symbols
            .to_venue(canonical_symbol, venue, Some(canonical_symbol))
            .unwrap_or_else(|| canonical_symbol.to_string())
    }

    /// Submit a reduce-only or directional market order, after a pre-order
    /// risk check and under the venue's submit lock.
    pub async fn market_order(
        &self,
        venue: &str,
        canonical_symbol: &str,
        size_i: i64,
        is_ask: bool,
        reduce_only: bool,
        max_slippage: Option<f64>,
    ) -> Result<Order, ExecError> {
        self.risk
            .check_pre_order_risk(&self.positions, venue, canonical_symbol, size_i, is_ask)
            .await?;

        let connector = self.connector(venue)?.clone();
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        let lock = self.lock_for(venue);
        let _guard = lock.lock().await;

        let client_order_id = self.coi.next(venue);
        connector
            .place_market(&venue_symbol, client_order_id, size_i, is_ask, reduce_only, max_slippage)
            .await
    }

    /// Place a tracking-limit order — enforced as the only path to limit
    /// orders (§4.G), under the venue's submit lock.
    pub async fn limit_order(
        &self,
        venue: &str,
        canonical_symbol: &str,
        base_amount_i: i64,
        is_ask: bool,
        params: TrackingLimitParams,
    ) -> Result<Order, ExecError> {
        self.risk
            .check_pre_order_risk(&self.positions, venue, canonical_symbol, base_amount_i, is_ask)
            .await?;

        let connector = self.connector(venue)?.clone();
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        let lock = self.lock_for(venue);
        let _guard = lock.lock().await;

        let mut params = params;
        params.symbol = venue_symbol;
        params.base_amount_i = base_amount_i;
        params.is_ask = is_ask;

        place_tracking_limit_order(connector.as_ref(), &self.coi, params).await
    }

    pub async fn post_order_risk(
        &self,
        venue: &str,
        canonical_symbol: &str,
        filled_size_i: i64,
        is_ask: bool,
    ) -> PostOrderRisk {
        self.risk
            .check_post_order_risk(&self.positions, venue, canonical_symbol, filled_size_i, is_ask)
            .await
    }

    pub async fn position(&self, venue: &str, canonical_symbol: &str) -> Result<f64, ExecError> {
        self.positions.get_position(venue, canonical_symbol).await
    }

    pub async fn collateral(&self, venue: &str) -> Result<f64, ExecError> {
        self.positions.get_collateral(venue).await
    }

    pub async fn net_position(&self, canonical_symbol: &str) -> AggregateReport {
        self.positions.get_net_position(canonical_symbol, None).await
    }

    pub async fn total_collateral(&self) -> AggregateReport {
        self.positions.get_total_collateral(None).await
    }

    pub async fn confirm_position(
        &self,
        venue: &str,
        canonical_symbol: &str,
        target: f64,
        tolerance: f64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<f64> {
        self.positions
            .confirm_position(venue, canonical_symbol, target, tolerance, timeout, poll_interval)
            .await
    }

    pub async fn rebalance(
        &self,
        venue: &str,
        canonical_symbol: &str,
        target: f64,
        tolerance: f64,
        attempts: u32,
        retry_delay: Duration,
    ) -> bool {
        let lock = self.lock_for(venue);
        let _guard = lock.lock().await;
        self.positions
            .rebalance(venue, canonical_symbol, &self.coi, target, tolerance, attempts, retry_delay)
            .await
    }

    pub async fn flatten(
        &self,
        venue: &str,
        canonical_symbol: &str,
        tolerance: f64,
        attempts: u32,
        retry_delay: Duration,
    ) -> bool {
        let lock = self.lock_for(venue);
        let _guard = lock.lock().await;
        self.positions
            .flatten(venue, canonical_symbol, &self.coi, tolerance, attempts, retry_delay)
            .await
    }

    pub async fn plan_order_size(
        &self,
        venue: &str,
        canonical_symbol: &str,
        leverage: f64,
        min_collateral: f64,
        collateral_buffer: f64,
    ) -> Option<PlannedOrder> {
        self.positions
            .plan_order_size(venue, canonical_symbol, leverage, min_collateral, collateral_buffer)
            .await
    }

    pub fn venues(&self) -> Vec<String> {
        self.connectors.keys().cloned().collect()
    }

    /// Pass-through top-of-book read, used by the diagnostic harness to
    /// sample spread without exposing the connector registry itself.
    pub async fn top_of_book(&self, venue: &str, canonical_symbol: &str) -> Option<crate::connector::TopOfBook> {
        let connector = self.connector(venue).ok()?;
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        connector.get_top_of_book(&venue_symbol).await
    }

    /// Every order tracked by every registered connector, keyed by venue —
    /// the dashboard's `GET /api/v1/orders` reads through this rather than
    /// reaching into the connector registry itself.
    pub fn all_orders(&self) -> HashMap<String, Vec<OrderSummary>> {
        self.connectors
            .iter()
            .map(|(venue, connector)| {
                let orders = connector
                    .order_tracker()
                    .all()
                    .into_iter()
                    .map(|order| OrderSummary {
                        id: order.id(),
                        client_order_id: order.client_order_id(),
                        exchange_order_id: order.exchange_order_id(),
                        event: order.snapshot(),
                    })
                    .collect();
                (venue.clone(), orders)
            })
            .collect()
    }
}

/// Serialisable order summary for the dashboard order listing.
#[derive(Debug, Clone, serde::Serialize)]
pub struct OrderSummary {
    pub id: String,
    pub client_order_id: u64,
    pub exchange_order_id: Option<String>,
    pub event: crate::order::OrderEvent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_for_returns_same_instance_per_venue() {
        let symbols = Arc::new(SymbolMapper::new());
        let coi = Arc::new(CoiAllocator::new());
        let risk = RiskService::new(symbols.clone(), Default::default());
        let router = ExecutionRouter::new(symbols, coi, risk);
        let a = router.lock_for("backpack");
        let b = router.lock_for("BACKPACK");
        assert!(Arc::ptr_eq(&a, &b));
    }
}
