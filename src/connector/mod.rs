// =============================================================================
// Connector — venue adapter trait, event fan-out, local book
// =============================================================================
//
// A connector owns everything needed to trade one venue: a signed REST
// client, a streaming market-data/private-event client, a local order book
// per subscribed symbol, and the order tracker registry that the stream loop
// feeds. Concrete venues implement the `Connector` trait; optional
// capabilities a venue lacks return `ExecError::NotSupported` rather than
// being probed at runtime (§9 redesign flag).
// =============================================================================

pub mod book;
pub mod ed25519_venue;
pub mod nonce_venue;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::Serialize;

use crate::error::ExecError;
use crate::order::{Order, OrderEvent, OrderTracker};
use crate::types::{MarketMetadata, PositionRecord};

pub use book::{LocalOrderBook, TopOfBook};

/// Event kinds a connector fans out to registered listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectorEventType {
    Order,
    Trade,
    Position,
    Account,
    Book,
}

/// A typed event delivered to connector listeners.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectorEvent {
    #[serde(rename = "type")]
    pub kind: ConnectorEventType,
    pub payload: serde_json::Value,
    pub meta: Option<serde_json::Value>,
}

/// Subscriber interface for connector events. A single `on_event` method
/// replaces the legacy per-kind callback setters (§9 redesign flag).
pub trait Listener: Send + Sync {
    fn on_event(&self, event: &ConnectorEvent);
}

/// One book snapshot request's worth of depth.
#[derive(Debug, Clone, Serialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<(i64, i64)>,
    pub asks: Vec<(i64, i64)>,
    pub scale: i64,
}

/// The full venue adapter surface (§4.F). Every method that talks to the
/// network is expected to call into the connector's rate limiter first.
#[async_trait]
pub trait Connector: Send + Sync {
    fn venue(&self) -> &str;

    /// Load credentials, initialize the signer, open the HTTP session. No
    /// network calls are made here.
    async fn start(&self) -> Result<(), ExecError>;

    /// Prime a book snapshot per symbol and subscribe to public depth plus
    /// private order/position streams.
    async fn start_ws_state(&self, symbols: &[String]) -> Result<(), ExecError>;

    async fn stop_ws_state(&self);

    async fn close(&self);

    /// Fetch (or refetch) the venue's market catalog into the symbol mapper.
    async fn ensure_markets(&self) -> Result<(), ExecError>;

    async fn list_symbols(&self) -> Result<Vec<String>, ExecError>;

    async fn get_market_info(&self, symbol: &str) -> Result<MarketMetadata, ExecError>;

    /// Cached top-of-book, or a forced snapshot fetch if nothing cached yet.
    async fn get_top_of_book(&self, symbol: &str) -> Option<TopOfBook>;

    async fn get_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot, ExecError>;

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExecError>;

    async fn get_positions(&self) -> Result<Vec<PositionRecord>, ExecError>;

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExecError>;

    async fn get_balances(&self) -> Result<serde_json::Value, ExecError>;

    async fn get_collateral(&self) -> Result<f64, ExecError>;

    async fn get_account_overview(&self) -> Result<serde_json::Value, ExecError>;

    async fn place_limit(
        &self,
        symbol: &str,
        coi: u64,
        size_i: i64,
        price_i: i64,
        is_ask: bool,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<Order, ExecError>;

    async fn place_market(
        &self,
        symbol: &str,
        coi: u64,
        size_i: i64,
        is_ask: bool,
        reduce_only: bool,
        max_slippage: Option<f64>,
    ) -> Result<Order, ExecError>;

    async fn cancel_order(&self, exchange_id: &str, symbol: Option<&str>) -> Result<(), ExecError>;

    /// Prefer client-id cancel; connectors that cannot support it return
    /// `NotSupported` so the caller falls back to exchange-id lookup+cancel.
    async fn cancel_by_client_id(&self, symbol: &str, coi: u64) -> Result<(), ExecError>;

    /// Venue-level cancel-all; falls back to per-order cancel when the venue
    /// has no bulk endpoint.
    async fn cancel_all(&self, symbol: Option<&str>) -> Result<(), ExecError>;

    fn order_tracker(&self) -> &OrderTracker;

    fn register_listener(&self, listener: Arc<dyn Listener>);
}

/// Shared fan-out helper: broadcast `event` to every registered listener,
/// logging and swallowing any listener panic/error so one bad listener never
/// breaks the others.
pub(crate) fn broadcast(listeners: &parking_lot::RwLock<Vec<Arc<dyn Listener>>>, event: ConnectorEvent) {
    for listener in listeners.read().iter() {
        let listener = listener.clone();
        let event = event.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            listener.on_event(&event);
        }));
        if result.is_err() {
            tracing::warn!(kind = ?event.kind, "connector listener panicked — event dropped for that listener");
        }
    }
}

/// Translate a side string fragment into `is_ask`, per §4.F "Private event
/// normalization": `{ask, sell, s}` -> true, `{bid, buy, b}` -> false.
pub fn side_str_to_is_ask(side: &str) -> Option<bool> {
    match side.to_lowercase().as_str() {
        "ask" | "sell" | "s" => Some(true),
        "bid" | "buy" | "b" => Some(false),
        _ => None,
    }
}

pub(crate) fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Client-order-id aliases seen across both venue families' private event
/// streams (§4.F normalization table: `c` -> clientId).
pub fn extract_client_order_id(raw: &serde_json::Value) -> Option<u64> {
    ["clientId", "client_order_id", "c", "client_order_index"]
        .iter()
        .find_map(|k| raw.get(*k).and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))))
}

/// Normalize and dispatch one private order/position event (§4.F "Private
/// event normalization": `s` -> symbol, `S` -> side, `z` -> filledQuantity,
/// `l` -> remainingQuantity, `q` -> position, plus `X` -> status, `c` ->
/// clientId, `i` -> id already folded into `OrderEvent::from_raw`): update
/// the tracked order if the client id is known, then fan out to listeners.
pub(crate) fn dispatch_private_event(
    tracker: &OrderTracker,
    listeners: &parking_lot::RwLock<Vec<Arc<dyn Listener>>>,
    kind: ConnectorEventType,
    raw: serde_json::Value,
    now: f64,
) {
    if kind == ConnectorEventType::Order {
        if let Some(coi) = extract_client_order_id(&raw) {
            if let Some(order) = tracker.by_client(coi) {
                order.apply_update(OrderEvent::from_raw(&raw, "ws", now));
            }
        }
    }

    broadcast(
        listeners,
        ConnectorEvent {
            kind,
            payload: raw,
            meta: None,
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_str_mapping_matches_table() {
        assert_eq!(side_str_to_is_ask("ask"), Some(true));
        assert_eq!(side_str_to_is_ask("SELL"), Some(true));
        assert_eq!(side_str_to_is_ask("s"), Some(true));
        assert_eq!(side_str_to_is_ask("bid"), Some(false));
        assert_eq!(side_str_to_is_ask("buy"), Some(false));
        assert_eq!(side_str_to_is_ask("b"), Some(false));
        assert_eq!(side_str_to_is_ask("unknown"), None);
    }
}
