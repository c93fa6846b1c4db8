// =============================================================================
// Shared scalar types used across the execution core
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the book an order sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// `true` when this side is the ask (sell) side — the convention most
    /// venue wire formats use (`is_ask` flag) instead of a buy/sell enum.
    pub fn is_ask(self) -> bool {
        matches!(self, OrderSide::Sell)
    }

    pub fn from_is_ask(is_ask: bool) -> Self {
        if is_ask {
            OrderSide::Sell
        } else {
            OrderSide::Buy
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "buy"),
            OrderSide::Sell => write!(f, "sell"),
        }
    }
}

/// Market metadata for one (venue, symbol) pair, immutable after first fetch
/// (refetch replaces the whole entry — see `SymbolMapper::set_metadata`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketMetadata {
    pub price_decimals: u32,
    pub size_decimals: u32,
    pub tick_size: f64,
    pub step_size: f64,
    pub min_qty: f64,
}

impl MarketMetadata {
    pub fn price_scale(&self) -> i64 {
        10i64.pow(self.price_decimals)
    }

    pub fn size_scale(&self) -> i64 {
        10i64.pow(self.size_decimals)
    }

    /// Derive tick/step size from decimals when a venue omits them.
    pub fn with_defaults(price_decimals: u32, size_decimals: u32) -> Self {
        Self {
            price_decimals,
            size_decimals,
            tick_size: 1.0 / 10f64.powi(price_decimals as i32),
            step_size: 1.0 / 10f64.powi(size_decimals as i32),
            min_qty: 1.0 / 10f64.powi(size_decimals as i32),
        }
    }
}

/// A signed position held on one venue for one symbol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PositionRecord {
    pub symbol: String,
    pub base_qty: f64,
    pub entry_price: Option<f64>,
    pub liquidation_price: Option<f64>,
    pub unrealized_pnl: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_round_trips_through_is_ask() {
        assert_eq!(OrderSide::from_is_ask(OrderSide::Buy.is_ask()), OrderSide::Buy);
        assert_eq!(OrderSide::from_is_ask(OrderSide::Sell.is_ask()), OrderSide::Sell);
    }

    #[test]
    fn scale_is_power_of_ten() {
        let m = MarketMetadata::with_defaults(2, 6);
        assert_eq!(m.price_scale(), 100);
        assert_eq!(m.size_scale(), 1_000_000);
    }
}
