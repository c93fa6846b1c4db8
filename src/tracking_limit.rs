// =============================================================================
// Tracking-limit engine — repost-until-filled order placement
// =============================================================================
//
// Repeatedly posts a limit order pegged to the current top of book,
// cancelling and re-posting with a fresh client-order-id whenever the book
// moves or an interval elapses, until filled, failed, or the overall
// deadline expires. A higher-level market-order fallback after N attempts
// is policy above this engine (§4.G "Market fallback") and is not
// implemented here.
// =============================================================================

use std::time::{Duration, Instant};

use tracing::info;

use crate::coi::CoiAllocator;
use crate::connector::Connector;
use crate::error::ExecError;
use crate::order::{Order, OrderState};

/// Parameters for one tracking-limit placement call.
#[derive(Debug, Clone)]
pub struct TrackingLimitParams {
    pub symbol: String,
    pub base_amount_i: i64,
    pub is_ask: bool,
    pub interval_secs: f64,
    pub timeout_secs: f64,
    pub price_offset_ticks: i64,
    pub cancel_wait_secs: f64,
    pub post_only: bool,
    pub reduce_only: bool,
    pub max_attempts: Option<u32>,
}

impl Default for TrackingLimitParams {
    fn default() -> Self {
        Self {
            symbol: String::new(),
            base_amount_i: 0,
            is_ask: false,
            interval_secs: 10.0,
            timeout_secs: 120.0,
            price_offset_ticks: 0,
            cancel_wait_secs: 2.0,
            post_only: false,
            reduce_only: false,
            max_attempts: None,
        }
    }
}

/// Select the limit price for the next attempt, pegged to the side being
/// crossed and clamped so it never crosses the opposite side (§4.G step 3).
fn select_price(bid_i: Option<i64>, ask_i: Option<i64>, scale: i64, offset_ticks: i64, is_ask: bool) -> i64 {
    let offset = offset_ticks.max(0);
    let fallback = (25_000 * scale).max(1);

    if is_ask {
        let base = match ask_i.or(bid_i) {
            Some(b) => b,
            None => return fallback,
        };
        let mut price = base + offset;
        if let Some(bid) = bid_i {
            price = price.max(bid + 1);
        }
        price.max(1)
    } else {
        let base = match bid_i.or(ask_i) {
            Some(b) => b,
            None => return fallback,
        };
        let mut price = (base - offset).max(1);
        if let Some(ask) = ask_i {
            price = price.min((ask - 1).max(1));
        }
        price.max(1)
    }
}

/// Run the tracking-limit algorithm against one venue connector. Returns the
/// final order handle (which may be in any terminal state, or the last
/// attempt's handle if `max_attempts` was exhausted while still open).
pub async fn place_tracking_limit_order(
    connector: &dyn Connector,
    coi: &CoiAllocator,
    params: TrackingLimitParams,
) -> Result<Order, ExecError> {
    if params.base_amount_i <= 0 {
        return Err(ExecError::InvalidResponse {
            venue: connector.venue().to_string(),
            detail: "base_amount_i must be positive".to_string(),
        });
    }

    let start = Instant::now();
    let mut attempts: u32 = 0;
    let mut last_order: Option<Order> = None;

    loop {
        let elapsed = start.elapsed().as_secs_f64();
        let remaining = params.timeout_secs - elapsed;
        if remaining <= 0.0 {
            return Err(ExecError::TrackingLimitTimeout {
                venue: connector.venue().to_string(),
                symbol: params.symbol.clone(),
                attempts,
            });
        }

        let top = connector.get_top_of_book(&params.symbol).await;
        let (bid_i, ask_i, scale) = match top {
            Some(t) => (t.bid_i, t.ask_i, t.scale),
            None => (None, None, 1),
        };
        if bid_i.is_none() && ask_i.is_none() {
            return Err(ExecError::InvalidResponse {
                venue: connector.venue().to_string(),
                detail: format!("no top-of-book available for {}", params.symbol),
            });
        }

        let price_i = select_price(bid_i, ask_i, scale, params.price_offset_ticks, params.is_ask);
        let client_order_id = coi.next(connector.venue());

        info!(
            venue = connector.venue(),
            symbol = %params.symbol,
            attempt = attempts + 1,
            price_i,
            size_i = params.base_amount_i,
            "tracking-limit attempt"
        );

        let order = connector
            .place_limit(
                &params.symbol,
                client_order_id,
                params.base_amount_i,
                price_i,
                params.is_ask,
                params.post_only,
                params.reduce_only,
            )
            .await?;

        let wait_secs = params.interval_secs.min(remaining);
        let wait = if wait_secs > 0.0 { Some(Duration::from_secs_f64(wait_secs)) } else { None };
        order.wait_final(wait).await;

        attempts += 1;
        let state = order.state();

        if state == OrderState::Filled {
            return Ok(order);
        }
        if state == OrderState::Failed {
            return Ok(order);
        }
        if state == OrderState::Cancelled {
            last_order = Some(order);
            if let Some(max) = params.max_attempts {
                if attempts >= max {
                    return Ok(last_order.unwrap());
                }
            }
            continue;
        }

        // Still open/partially filled after the wait window — cancel and retry.
        let _ = connector.cancel_by_client_id(&params.symbol, client_order_id).await;
        let cancel_wait = Duration::from_secs_f64(params.cancel_wait_secs.max(0.0));
        order.wait_final(Some(cancel_wait)).await;
        last_order = Some(order);

        if let Some(max) = params.max_attempts {
            if attempts >= max {
                return Ok(last_order.unwrap());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_price_buy_clamps_below_ask() {
        let price = select_price(Some(100), Some(101), 1, 0, false);
        assert_eq!(price, 100);
    }

    #[test]
    fn select_price_buy_never_crosses_ask() {
        let price = select_price(Some(100), Some(101), 1, 5, false);
        assert_eq!(price, 100); // clamped to ask - 1
    }

    #[test]
    fn select_price_sell_clamps_above_bid() {
        let price = select_price(Some(99), Some(100), 1, 0, true);
        assert_eq!(price, 100);
    }

    #[test]
    fn select_price_sell_applies_positive_offset() {
        let price = select_price(Some(99), Some(100), 1, 3, true);
        assert_eq!(price, 103);
    }

    #[test]
    fn select_price_falls_back_when_both_sides_missing() {
        let price = select_price(None, None, 100, 0, false);
        assert_eq!(price, 2_500_000);
    }

    #[test]
    fn select_price_uses_available_side_when_one_missing() {
        let price = select_price(Some(100), None, 1, 2, false);
        assert_eq!(price, 98);
    }
}
