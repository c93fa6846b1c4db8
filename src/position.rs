// =============================================================================
// Position & collateral service — cross-venue aggregation, rebalance, flatten
// =============================================================================
//
// Reads go through each venue's connector; cross-venue aggregation (§4.H) is
// fault tolerant — a single venue failing to answer substitutes 0.0 and logs,
// it never aborts the whole aggregation. Rebalance/flatten submit reduce-only
// or directional market orders and poll until the position converges or the
// attempt budget is exhausted.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::connector::Connector;
use crate::coi::CoiAllocator;
use crate::error::ExecError;
use crate::order::OrderState;
use crate::symbol::SymbolMapper;

/// Aggregate positions or collateral across venues, mapping venue -> value
/// and a synthetic total/net key. Individual venue failures degrade to 0.0.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateReport {
    pub per_venue: HashMap<String, f64>,
    pub total: f64,
}

pub struct PositionService {
    connectors: HashMap<String, Arc<dyn Connector>>,
    symbols: Arc<SymbolMapper>,
}

impl PositionService {
    pub fn new(symbols: Arc<SymbolMapper>) -> Self {
        Self { connectors: HashMap::new(), symbols }
    }

    pub fn register_connector(&mut self, venue: &str, connector: Arc<dyn Connector>) {
        self.connectors.insert(venue.to_lowercase(), connector);
    }

    fn connector(&self, venue: &str) -> Result<&Arc<dyn Connector>, ExecError> {
        self.connectors.get(&venue.to_lowercase()).ok_or_else(|| ExecError::ConfigError(format!(
            "no connector registered for venue: {venue}"
        )))
    }

    fn venue_symbol(&self, venue: &str, canonical_symbol: &str) -> String {
        self.symbols
            .to_venue(canonical_symbol, venue, Some(canonical_symbol))
            .unwrap_or_else(|| canonical_symbol.to_string())
    }

    /// Signed position size in base units for one venue/symbol.
    pub async fn get_position(&self, venue: &str, canonical_symbol: &str) -> Result<f64, ExecError> {
        let connector = self.connector(venue)?;
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        let positions = connector.get_positions().await?;
        for entry in &positions {
            if entry.symbol.eq_ignore_ascii_case(&venue_symbol) {
                return Ok(entry.base_qty);
            }
        }
        Ok(0.0)
    }

    pub async fn get_collateral(&self, venue: &str) -> Result<f64, ExecError> {
        let connector = self.connector(venue)?;
        connector.get_collateral().await
    }

    /// Net position across venues, fault-tolerant: a venue that errors
    /// contributes 0.0 and is logged, never aborts the aggregation.
    pub async fn get_net_position(&self, canonical_symbol: &str, venues: Option<&[String]>) -> AggregateReport {
        let target: Vec<String> = match venues {
            Some(v) => v.to_vec(),
            None => self.connectors.keys().cloned().collect(),
        };

        let mut report = AggregateReport::default();
        for venue in target {
            match self.get_position(&venue, canonical_symbol).await {
                Ok(position) => {
                    report.total += position;
                    report.per_venue.insert(venue, position);
                }
                Err(e) => {
                    error!(venue = %venue, symbol = canonical_symbol, error = %e, "failed to get position, treating as 0");
                    report.per_venue.insert(venue, 0.0);
                }
            }
        }
        report
    }

    /// Total collateral across venues, same fault-tolerance as `get_net_position`.
    pub async fn get_total_collateral(&self, venues: Option<&[String]>) -> AggregateReport {
        let target: Vec<String> = match venues {
            Some(v) => v.to_vec(),
            None => self.connectors.keys().cloned().collect(),
        };

        let mut report = AggregateReport::default();
        for venue in target {
            match self.get_collateral(&venue).await {
                Ok(collateral) => {
                    report.total += collateral;
                    report.per_venue.insert(venue, collateral);
                }
                Err(e) => {
                    error!(venue = %venue, error = %e, "failed to get collateral, treating as 0");
                    report.per_venue.insert(venue, 0.0);
                }
            }
        }
        report
    }

    /// Poll a venue's position until it reaches `target` within `tolerance`,
    /// or `timeout` elapses.
    pub async fn confirm_position(
        &self,
        venue: &str,
        canonical_symbol: &str,
        target: f64,
        tolerance: f64,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Option<f64> {
        let tolerance = tolerance.max(0.0);
        let deadline = Instant::now() + timeout.max(poll_interval);
        loop {
            let current = self.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
            if (current - target).abs() <= tolerance {
                return Some(current);
            }
            if Instant::now() >= deadline {
                warn!(venue, symbol = canonical_symbol, target, current, "position confirmation timed out");
                return None;
            }
            sleep(poll_interval).await;
        }
    }

    /// Drive a venue's position to `target` via market orders, retrying up
    /// to `attempts` times.
    pub async fn rebalance(
        &self,
        venue: &str,
        canonical_symbol: &str,
        coi: &CoiAllocator,
        target: f64,
        tolerance: f64,
        attempts: u32,
        retry_delay: Duration,
    ) -> bool {
        let connector = match self.connector(venue) {
            Ok(c) => c.clone(),
            Err(_) => return false,
        };
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        let tolerance = tolerance.max(0.0);
        let attempts = attempts.max(1);

        let metadata = self.symbols.metadata(venue, canonical_symbol);
        let size_scale = metadata.as_ref().map(|m| m.size_scale()).unwrap_or(1);
        let min_size_i = metadata
            .as_ref()
            .map(|m| (m.min_qty * size_scale as f64).round() as i64)
            .unwrap_or(1);

        for attempt in 1..=attempts {
            let current = self.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
            let delta = target - current;
            if delta.abs() <= tolerance {
                return true;
            }
            let is_ask = delta < 0.0;
            let size_i = min_size_i.max((delta.abs() * size_scale as f64).round() as i64);
            let client_order_id = coi.next(venue);

            match connector.place_market(&venue_symbol, client_order_id, size_i, is_ask, false, None).await {
                Ok(order) => {
                    order.wait_final(Some(Duration::from_secs(30))).await;
                    if order.state() == OrderState::Filled {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(venue, symbol = canonical_symbol, attempt, error = %e, "rebalance order failed");
                }
            }
            if attempt < attempts && !retry_delay.is_zero() {
                sleep(retry_delay).await;
            }
        }

        error!(venue, symbol = canonical_symbol, target, "rebalance failed to converge");
        false
    }

    /// Drive a venue's position to flat (zero) via reduce-only market orders.
    pub async fn flatten(
        &self,
        venue: &str,
        canonical_symbol: &str,
        coi: &CoiAllocator,
        tolerance: f64,
        attempts: u32,
        retry_delay: Duration,
    ) -> bool {
        let connector = match self.connector(venue) {
            Ok(c) => c.clone(),
            Err(_) => return false,
        };
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);
        let attempts = attempts.max(1);
        let metadata = self.symbols.metadata(venue, canonical_symbol);
        let size_scale = metadata.as_ref().map(|m| m.size_scale()).unwrap_or(1);

        for attempt in 1..=attempts {
            let current = self.get_position(venue, canonical_symbol).await.unwrap_or(0.0);
            if current.abs() <= tolerance {
                return true;
            }
            let is_ask = current > 0.0;
            let size_i = ((current.abs() * size_scale as f64).round() as i64).max(1);
            let client_order_id = coi.next(venue);

            match connector.place_market(&venue_symbol, client_order_id, size_i, is_ask, true, None).await {
                Ok(order) => {
                    order.wait_final(Some(Duration::from_secs(30))).await;
                    if order.state() == OrderState::Filled {
                        continue;
                    }
                }
                Err(e) => {
                    warn!(venue, symbol = canonical_symbol, attempt, error = %e, "flatten order failed");
                }
            }
            if attempt < attempts && !retry_delay.is_zero() {
                sleep(retry_delay).await;
            }
        }

        error!(venue, symbol = canonical_symbol, "flatten failed to converge");
        false
    }

    /// Size the largest order that `leverage` and `min_collateral` allow,
    /// based on current collateral and top-of-book price.
    pub async fn plan_order_size(
        &self,
        venue: &str,
        canonical_symbol: &str,
        leverage: f64,
        min_collateral: f64,
        collateral_buffer: f64,
    ) -> Option<PlannedOrder> {
        let connector = self.connector(venue).ok()?;
        let venue_symbol = self.venue_symbol(venue, canonical_symbol);

        let collateral = connector.get_collateral().await.ok()?;
        if collateral <= min_collateral {
            warn!(venue, symbol = canonical_symbol, collateral, min_collateral, "collateral below minimum for order planning");
            return None;
        }

        let top = connector.get_top_of_book(&venue_symbol).await?;
        let scale = if top.scale > 0 { top.scale } else { 1 };
        let price_i = if leverage >= 0.0 { top.ask_i.or(top.bid_i) } else { top.bid_i.or(top.ask_i) }?;
        let price = price_i as f64 / scale as f64;
        if price <= 0.0 {
            return None;
        }

        let leverage = leverage.max(1.0);
        let buffer = collateral_buffer.clamp(0.0, 1.0);
        let effective_collateral = collateral * buffer;
        let notional = effective_collateral * leverage;
        let base_amount = notional / price;

        let metadata = self.symbols.metadata(venue, canonical_symbol);
        let size_scale = metadata.as_ref().map(|m| m.size_scale()).unwrap_or(1);
        let min_size_i = metadata
            .as_ref()
            .map(|m| (m.min_qty * size_scale as f64).round() as i64)
            .unwrap_or(1);

        let size_i = min_size_i.max((base_amount * size_scale as f64).round() as i64);
        if size_i <= 0 {
            return None;
        }

        Some(PlannedOrder { base_amount, size_i, collateral, price, price_scale: scale })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlannedOrder {
    pub base_amount: f64,
    pub size_i: i64,
    pub collateral: f64,
    pub price: f64,
    pub price_scale: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_report_defaults_to_empty() {
        let report = AggregateReport::default();
        assert_eq!(report.total, 0.0);
        assert!(report.per_venue.is_empty());
    }
}
