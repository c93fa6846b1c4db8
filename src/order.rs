// =============================================================================
// Order tracker — per-order state machine, history, and waiters
// =============================================================================
//
// `Order` is the single source of truth for one order's lifecycle. Updates
// arrive from REST responses and two different private event streams and
// must be reconciled against whatever the order already believes, including
// an explicit race rule for FILLED-vs-CANCELLED reordering. This module
// consolidates what the originating system split into a low-level tracker
// primitive plus a higher reconciliation service into one `apply_update`
// operation — see DESIGN.md for the rationale.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::types::OrderSide;

/// Lifecycle states an order can occupy. Terminal states never transition
/// away once entered (I2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    New,
    Submitting,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Failed)
    }

    /// Normalize a lowercased venue status string to an `OrderState`.
    /// Unknown strings default to `Open` (§4.E).
    pub fn from_venue_status(status: &str) -> Self {
        match status.to_lowercase().as_str() {
            "new" | "created" => OrderState::New,
            "pending" => OrderState::Submitting,
            "working" | "open" => OrderState::Open,
            "partiallyfilled" | "partially_filled" => OrderState::PartiallyFilled,
            "filled" => OrderState::Filled,
            "canceled" | "cancelled" | "expired" => OrderState::Cancelled,
            "rejected" | "failed" => OrderState::Failed,
            _ => OrderState::Open,
        }
    }
}

/// A single event applied to an order's history. `info` carries the raw
/// venue payload plus a `source` key (`"ws"` or `"rest"`) for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    pub state: OrderState,
    pub filled_base_i: Option<i64>,
    pub remaining_base_i: Option<i64>,
    pub engine_ts: Option<f64>,
    pub cancel_ack_ts: Option<f64>,
    pub ws_seq: Option<u64>,
    pub timestamp: f64,
    pub info: serde_json::Value,
}

impl OrderEvent {
    pub fn new(state: OrderState, timestamp: f64) -> Self {
        Self {
            state,
            filled_base_i: None,
            remaining_base_i: None,
            engine_ts: None,
            cancel_ack_ts: None,
            ws_seq: None,
            timestamp,
            info: serde_json::json!({}),
        }
    }

    /// Normalize ms-scale timestamps (> 10^12) down to seconds.
    fn normalize_ts(raw: f64) -> f64 {
        if raw > 1e12 {
            raw / 1000.0
        } else {
            raw
        }
    }

    /// Build an `OrderEvent` from a raw venue payload using the field alias
    /// table in §4.E. Missing fields are ignored, never an error.
    pub fn from_raw(raw: &serde_json::Value, source: &str, now: f64) -> Self {
        fn first_f64(raw: &serde_json::Value, keys: &[&str]) -> Option<f64> {
            keys.iter().find_map(|k| {
                raw.get(k).and_then(|v| {
                    v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
            })
        }
        fn first_i64(raw: &serde_json::Value, keys: &[&str]) -> Option<i64> {
            keys.iter().find_map(|k| {
                raw.get(k).and_then(|v| {
                    v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
                })
            })
        }

        let status_str = raw
            .get("status")
            .or_else(|| raw.get("state"))
            .or_else(|| raw.get("X"))
            .and_then(|v| v.as_str())
            .unwrap_or("open");
        let state = OrderState::from_venue_status(status_str);

        let mut info = raw.clone();
        if let serde_json::Value::Object(map) = &mut info {
            map.insert("source".to_string(), serde_json::Value::String(source.to_string()));

            // Abbreviated WS field normalization: s -> symbol, S -> side,
            // i -> exchange id, q -> position. X/z/l/c are handled above or
            // in `extract_client_order_id`.
            if !map.contains_key("symbol") {
                if let Some(s) = raw.get("s").and_then(|v| v.as_str()) {
                    map.insert("symbol".to_string(), serde_json::Value::String(s.to_string()));
                }
            }
            if !map.contains_key("side") {
                if let Some(s) = raw.get("S").and_then(|v| v.as_str()) {
                    map.insert("side".to_string(), serde_json::Value::String(s.to_string()));
                }
            }
            if !map.contains_key("exchange_order_id") {
                let exchange_id = raw
                    .get("i")
                    .or_else(|| raw.get("order_index"))
                    .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_u64().map(|n| n.to_string())));
                if let Some(id) = exchange_id {
                    map.insert("exchange_order_id".to_string(), serde_json::Value::String(id));
                }
            }
            if !map.contains_key("position") {
                if let Some(q) = raw.get("q") {
                    map.insert("position".to_string(), q.clone());
                }
            }
        }

        Self {
            state,
            filled_base_i: first_i64(raw, &["filled_base_i", "filledQuantity", "z", "filled_qty", "filled_base_amount"]),
            remaining_base_i: first_i64(raw, &["remaining_base_i", "remainingQuantity", "l", "remaining_qty", "remaining_base_amount"]),
            engine_ts: first_f64(raw, &["engine_ts", "timestamp", "E", "T", "transactTime"]).map(Self::normalize_ts),
            cancel_ack_ts: first_f64(raw, &["cancel_ack_ts"]).map(Self::normalize_ts),
            ws_seq: first_i64(raw, &["ws_seq"]).map(|v| v as u64),
            timestamp: now,
            info,
        }
    }
}

/// Human-readable timeline digest for the diagnostic harness (§4.E
/// supplement, §4.M).
#[derive(Debug, Clone, Serialize)]
pub struct TimelineSummary {
    pub order_id: String,
    pub venue: String,
    pub symbol: Option<String>,
    pub side: Option<OrderSide>,
    pub initial_state: Option<OrderState>,
    pub final_state: OrderState,
    pub event_count: usize,
    pub duration_ms: f64,
    pub engine_ts_first: Option<f64>,
    pub engine_ts_last: Option<f64>,
    pub cancel_ack_ts: Option<f64>,
    pub ws_seq_first: Option<u64>,
    pub ws_seq_last: Option<u64>,
}

struct OrderInner {
    id: String,
    venue: String,
    symbol: Option<String>,
    side: Option<OrderSide>,
    client_order_id: u64,
    exchange_order_id: Option<String>,
    price_i: Option<i64>,
    size_i: Option<i64>,
    state: OrderState,
    filled_base_i: i64,
    history: Vec<OrderEvent>,
}

impl OrderInner {
    fn snapshot(&self) -> OrderEvent {
        match self.history.last() {
            Some(ev) => ev.clone(),
            None => {
                let mut ev = OrderEvent::new(self.state, 0.0);
                ev.info = serde_json::json!({ "client_order_id": self.client_order_id });
                ev
            }
        }
    }
}

/// What to do with an incoming event, decided by the reconciliation rules.
enum Decision {
    /// Mutate `state` to the incoming event's state and append to history.
    Apply,
    /// Append to history but leave `state` untouched (I2 / rule 5).
    AppendOnly,
    /// Ignore entirely — not even recorded (rule 2, exact duplicate).
    Drop,
}

/// A handle to a tracked order. Cheap to clone — all clones share the same
/// underlying state and notification channels.
#[derive(Clone)]
pub struct Order {
    inner: Arc<Mutex<OrderInner>>,
    completion: Arc<Notify>,
    update: Arc<Notify>,
}

impl Order {
    pub fn create(
        venue: &str,
        client_order_id: u64,
        symbol: Option<String>,
        side: Option<OrderSide>,
        price_i: Option<i64>,
        size_i: Option<i64>,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OrderInner {
                id: format!("{venue}:{client_order_id}"),
                venue: venue.to_string(),
                symbol,
                side,
                client_order_id,
                exchange_order_id: None,
                price_i,
                size_i,
                state: OrderState::New,
                filled_base_i: 0,
                history: Vec::new(),
            })),
            completion: Arc::new(Notify::new()),
            update: Arc::new(Notify::new()),
        }
    }

    pub fn id(&self) -> String {
        self.inner.lock().id.clone()
    }

    pub fn client_order_id(&self) -> u64 {
        self.inner.lock().client_order_id
    }

    pub fn exchange_order_id(&self) -> Option<String> {
        self.inner.lock().exchange_order_id.clone()
    }

    pub fn state(&self) -> OrderState {
        self.inner.lock().state
    }

    pub fn filled_base_i(&self) -> i64 {
        self.inner.lock().filled_base_i
    }

    fn decide(inner: &OrderInner, update: &OrderEvent) -> Decision {
        if inner.history.is_empty() {
            return Decision::Apply; // rule 1
        }

        if inner.state.is_terminal() {
            if inner.state == OrderState::Filled && update.state == OrderState::Cancelled {
                let last_filled_ts = inner
                    .history
                    .iter()
                    .rev()
                    .find(|e| e.state == OrderState::Filled)
                    .and_then(|e| e.engine_ts);

                let race_accepted = match (update.engine_ts, last_filled_ts) {
                    (Some(new_ts), Some(last_ts)) => new_ts < last_ts,
                    _ => false, // missing timestamps: fill wins (rule 3)
                };

                if race_accepted {
                    return Decision::Apply;
                }
                warn!(order_id = %inner.id, "rejecting late CANCELLED event — FILLED wins race");
                return Decision::AppendOnly;
            }
            // I2 / rule 5: terminal state is frozen; still record history.
            return Decision::AppendOnly;
        }

        if update.state == inner.state {
            return Decision::Drop; // rule 2
        }

        Decision::Apply // rule 4
    }

    /// Merge `update` into this order per the reconciliation rules, append
    /// to history where applicable, and wake any waiters. Returns the
    /// resulting snapshot.
    pub fn apply_update(&self, update: OrderEvent) -> OrderEvent {
        let mut inner = self.inner.lock();
        let decision = Self::decide(&inner, &update);

        match decision {
            Decision::Drop => {
                debug!(order_id = %inner.id, state = ?inner.state, "dropping duplicate order event");
                return inner.snapshot();
            }
            Decision::Apply | Decision::AppendOnly => {
                if let Some(filled) = update.filled_base_i {
                    inner.filled_base_i = inner.filled_base_i.max(filled); // I1
                }
                if let Some(id) = update.info.get("exchange_order_id").and_then(|v| v.as_str()) {
                    inner.exchange_order_id = Some(id.to_string());
                }
                if let Some(sym) = update.info.get("symbol").and_then(|v| v.as_str()) {
                    inner.symbol = Some(sym.to_string());
                }
                if matches!(decision, Decision::Apply) {
                    inner.state = update.state;
                }
                inner.history.push(update);
            }
        }

        let snapshot = inner.snapshot();
        let became_terminal = inner.state.is_terminal();
        drop(inner);

        self.update.notify_waiters();
        if became_terminal {
            self.completion.notify_waiters();
        }
        snapshot
    }

    /// Record that the venue acknowledged this order with `exchange_order_id`
    /// (called by the connector on first ack, independent of state events).
    pub fn link_exchange_id(&self, exchange_order_id: &str) {
        self.inner.lock().exchange_order_id = Some(exchange_order_id.to_string());
    }

    /// Suspend until the order reaches a terminal state, or `timeout`
    /// elapses (returns `None` on timeout).
    pub async fn wait_final(&self, timeout: Option<Duration>) -> Option<OrderEvent> {
        loop {
            let notified = self.completion.notified();
            {
                let inner = self.inner.lock();
                if inner.state.is_terminal() {
                    return Some(inner.snapshot());
                }
            }
            match timeout {
                Some(d) => {
                    if tokio::time::timeout(d, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Suspend until the next event is applied, or `timeout` elapses.
    pub async fn next_update(&self, timeout: Option<Duration>) -> Option<OrderEvent> {
        let notified = self.update.notified();
        match timeout {
            Some(d) => tokio::time::timeout(d, notified).await.ok()?,
            None => notified.await,
        };
        Some(self.inner.lock().snapshot())
    }

    /// Last applied event, or a synthesized placeholder if none yet.
    pub fn snapshot(&self) -> OrderEvent {
        self.inner.lock().snapshot()
    }

    pub fn timeline_summary(&self) -> TimelineSummary {
        let inner = self.inner.lock();
        let first = inner.history.first();
        let last = inner.history.last();

        let duration_ms = match (first, last) {
            (Some(f), Some(l)) => (l.timestamp - f.timestamp) * 1000.0,
            _ => 0.0,
        };

        TimelineSummary {
            order_id: inner.id.clone(),
            venue: inner.venue.clone(),
            symbol: inner.symbol.clone(),
            side: inner.side,
            initial_state: first.map(|e| e.state),
            final_state: inner.state,
            event_count: inner.history.len(),
            duration_ms,
            engine_ts_first: first.and_then(|e| e.engine_ts),
            engine_ts_last: last.and_then(|e| e.engine_ts),
            cancel_ack_ts: inner.history.iter().find_map(|e| e.cancel_ack_ts),
            ws_seq_first: first.and_then(|e| e.ws_seq),
            ws_seq_last: last.and_then(|e| e.ws_seq),
        }
    }

    /// Scan history for FILLED -> CANCELLED transitions and describe them.
    pub fn detect_race_conditions(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let mut races = Vec::new();
        for pair in inner.history.windows(2) {
            if pair[0].state == OrderState::Filled && pair[1].state == OrderState::Cancelled {
                races.push(format!(
                    "order {} observed FILLED (engine_ts={:?}) followed by CANCELLED (engine_ts={:?})",
                    inner.id, pair[0].engine_ts, pair[1].engine_ts
                ));
            }
        }
        races
    }
}

/// Per-connector registry mapping both client and exchange ids to the same
/// `Order` handle.
pub struct OrderTracker {
    by_client_id: Mutex<std::collections::HashMap<u64, Order>>,
    by_exchange_id: Mutex<std::collections::HashMap<String, Order>>,
}

impl OrderTracker {
    pub fn new() -> Self {
        Self {
            by_client_id: Mutex::new(std::collections::HashMap::new()),
            by_exchange_id: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn create(
        &self,
        venue: &str,
        client_order_id: u64,
        symbol: Option<String>,
        side: Option<OrderSide>,
        price_i: Option<i64>,
        size_i: Option<i64>,
    ) -> Order {
        let order = Order::create(venue, client_order_id, symbol, side, price_i, size_i);
        self.by_client_id.lock().insert(client_order_id, order.clone());
        order
    }

    pub fn by_client(&self, client_order_id: u64) -> Option<Order> {
        self.by_client_id.lock().get(&client_order_id).cloned()
    }

    pub fn by_exchange(&self, exchange_order_id: &str) -> Option<Order> {
        self.by_exchange_id.lock().get(exchange_order_id).cloned()
    }

    /// All orders currently tracked by client-order-id, for dashboard/listing
    /// purposes. Order is unspecified.
    pub fn all(&self) -> Vec<Order> {
        self.by_client_id.lock().values().cloned().collect()
    }

    /// Make `order` reachable by its exchange id (first acknowledgement).
    pub fn link_exchange_id(&self, order: &Order, exchange_order_id: &str) {
        order.link_exchange_id(exchange_order_id);
        self.by_exchange_id
            .lock()
            .insert(exchange_order_id.to_string(), order.clone());
    }
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order_with_side() -> Order {
        Order::create("V", 1, Some("BTC-PERP".into()), Some(OrderSide::Buy), Some(100), Some(1_000_000))
    }

    #[test]
    fn p1_state_monotonicity_after_terminal() {
        let order = order_with_side();
        order.apply_update(OrderEvent::new(OrderState::Open, 1.0));
        order.apply_update(OrderEvent::new(OrderState::Filled, 2.0));
        assert_eq!(order.state(), OrderState::Filled);

        let mut extra = OrderEvent::new(OrderState::Cancelled, 3.0);
        extra.engine_ts = Some(100.0); // later than the fill, rejected
        order.apply_update(extra);
        assert_eq!(order.state(), OrderState::Filled);
        assert_eq!(order.inner.lock().history.len(), 3);
    }

    #[test]
    fn p2_fill_monotonicity() {
        let order = order_with_side();
        let mut e1 = OrderEvent::new(OrderState::PartiallyFilled, 1.0);
        e1.filled_base_i = Some(100);
        order.apply_update(e1);

        let mut e2 = OrderEvent::new(OrderState::Filled, 2.0);
        e2.filled_base_i = Some(50); // lower than before — must not regress
        order.apply_update(e2);

        assert_eq!(order.filled_base_i(), 100);
    }

    #[test]
    fn scenario_2_status_normalization() {
        let order = Order::create("V", 1, None, None, None, Some(1_000_000));
        let mut ev = OrderEvent::new(OrderState::from_venue_status("PartiallyFilled"), 1.0);
        ev.filled_base_i = Some(500_000);
        order.apply_update(ev);
        assert_eq!(order.state(), OrderState::PartiallyFilled);
        assert_eq!(order.filled_base_i(), 500_000);
    }

    #[test]
    fn scenario_4_race_preference() {
        let order = order_with_side();
        let mut filled = OrderEvent::new(OrderState::Filled, 1.0);
        filled.engine_ts = Some(10.0);
        order.apply_update(filled);

        let mut cancelled = OrderEvent::new(OrderState::Cancelled, 2.0);
        cancelled.engine_ts = Some(9.5);
        order.apply_update(cancelled);

        assert_eq!(order.state(), OrderState::Filled);
        assert_eq!(order.inner.lock().history.len(), 2);
    }

    #[test]
    fn p5_race_resolution_strictly_earlier_engine_ts_accepted() {
        let order = order_with_side();
        let mut filled = OrderEvent::new(OrderState::Filled, 1.0);
        filled.engine_ts = Some(10.0);
        order.apply_update(filled);

        let mut cancelled = OrderEvent::new(OrderState::Cancelled, 2.0);
        cancelled.engine_ts = Some(5.0); // strictly earlier — accepted
        order.apply_update(cancelled);

        assert_eq!(order.state(), OrderState::Cancelled);
    }

    #[test]
    fn duplicate_same_state_event_is_dropped() {
        let order = order_with_side();
        order.apply_update(OrderEvent::new(OrderState::Open, 1.0));
        order.apply_update(OrderEvent::new(OrderState::Open, 2.0));
        assert_eq!(order.inner.lock().history.len(), 1);
    }

    #[test]
    fn detect_race_conditions_flags_filled_then_cancelled() {
        let order = order_with_side();
        let mut filled = OrderEvent::new(OrderState::Filled, 1.0);
        filled.engine_ts = Some(10.0);
        order.apply_update(filled);
        let mut cancelled = OrderEvent::new(OrderState::Cancelled, 2.0);
        cancelled.engine_ts = Some(50.0); // rejected race, still appended
        order.apply_update(cancelled);

        let races = order.detect_race_conditions();
        assert_eq!(races.len(), 1);
    }

    #[test]
    fn from_raw_extracts_aliased_fields_and_normalizes_ms_timestamp() {
        let raw = serde_json::json!({ "status": "FILLED", "z": "500000", "E": 1_700_000_000_000i64 });
        let ev = OrderEvent::from_raw(&raw, "ws", 0.0);
        assert_eq!(ev.state, OrderState::Filled);
        assert_eq!(ev.filled_base_i, Some(500_000));
        assert!(ev.engine_ts.unwrap() < 1e11); // normalized to seconds
    }

    #[test]
    fn from_raw_normalizes_abbreviated_private_event_fields() {
        let raw = serde_json::json!({
            "X": "PartiallyFilled",
            "s": "BTC_USDC_PERP",
            "S": "Ask",
            "i": 555,
            "z": "250000",
            "l": "750000",
        });
        let ev = OrderEvent::from_raw(&raw, "ws", 0.0);
        assert_eq!(ev.state, OrderState::PartiallyFilled);
        assert_eq!(ev.filled_base_i, Some(250_000));
        assert_eq!(ev.remaining_base_i, Some(750_000));
        assert_eq!(ev.info.get("symbol").and_then(|v| v.as_str()), Some("BTC_USDC_PERP"));
        assert_eq!(ev.info.get("side").and_then(|v| v.as_str()), Some("Ask"));
        assert_eq!(ev.info.get("exchange_order_id").and_then(|v| v.as_str()), Some("555"));
    }

    #[test]
    fn timeline_summary_reports_event_count_and_states() {
        let order = order_with_side();
        order.apply_update(OrderEvent::new(OrderState::Open, 1.0));
        order.apply_update(OrderEvent::new(OrderState::Filled, 2.0));
        let summary = order.timeline_summary();
        assert_eq!(summary.event_count, 2);
        assert_eq!(summary.final_state, OrderState::Filled);
    }

    #[tokio::test]
    async fn wait_final_resolves_immediately_if_already_terminal() {
        let order = order_with_side();
        order.apply_update(OrderEvent::new(OrderState::Filled, 1.0));
        let result = order.wait_final(Some(Duration::from_millis(50))).await;
        assert!(result.is_some());
    }

    #[tokio::test]
    async fn wait_final_times_out_if_never_terminal() {
        let order = order_with_side();
        let result = order.wait_final(Some(Duration::from_millis(20))).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn wait_final_wakes_on_later_terminal_event() {
        let order = order_with_side();
        let waiter = order.clone();
        let handle = tokio::spawn(async move { waiter.wait_final(Some(Duration::from_secs(1))).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        order.apply_update(OrderEvent::new(OrderState::Filled, 1.0));
        let result = handle.await.unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn registry_links_exchange_id_after_ack() {
        let tracker = OrderTracker::new();
        let order = tracker.create("V", 7, None, None, None, None);
        tracker.link_exchange_id(&order, "ex-123");
        assert!(tracker.by_exchange("ex-123").is_some());
        assert!(tracker.by_client(7).is_some());
    }
}
