// =============================================================================
// Local order book — per-connector, per-symbol depth cache
// =============================================================================
//
// Two integer-keyed price-level maps plus a cached top-of-book tuple with a
// freshness horizon, exposed for fast strategy reads (§3). Snapshots
// initialize the maps; deltas apply in sequence order and trigger a forced
// resync when a gap is detected (§4.F "Depth handling").
// =============================================================================

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

/// Cached best-bid/best-ask snapshot with the scale factor applied on the
/// wire. `as_of` is used against a freshness horizon by callers.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TopOfBook {
    pub bid_i: Option<i64>,
    pub ask_i: Option<i64>,
    pub scale: i64,
}

struct BookState {
    bids: BTreeMap<i64, i64>,
    asks: BTreeMap<i64, i64>,
    last_update_id: i64,
    scale: i64,
    top: TopOfBook,
    top_as_of: Instant,
}

impl BookState {
    fn empty(scale: i64) -> Self {
        Self {
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            scale,
            top: TopOfBook { bid_i: None, ask_i: None, scale },
            top_as_of: Instant::now(),
        }
    }

    fn recompute_top(&mut self) {
        self.top = TopOfBook {
            bid_i: self.bids.keys().next_back().copied(),
            ask_i: self.asks.keys().next().copied(),
            scale: self.scale,
        };
        self.top_as_of = Instant::now();
    }

    fn apply_level(map: &mut BTreeMap<i64, i64>, price_i: i64, qty: i64) {
        if qty <= 0 {
            map.remove(&price_i);
        } else {
            map.insert(price_i, qty);
        }
    }
}

/// Result of applying a delta: whether it was accepted, dropped as stale, or
/// requires the caller to force a fresh snapshot.
#[derive(Debug, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied,
    DroppedStale,
    NeedsResync,
}

/// Per-symbol local order book registry for one connector.
pub struct LocalOrderBook {
    books: RwLock<HashMap<String, BookState>>,
    freshness_horizon: Duration,
}

impl LocalOrderBook {
    pub fn new(freshness_horizon_secs: f64) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            freshness_horizon: Duration::from_secs_f64(freshness_horizon_secs.max(0.0)),
        }
    }

    /// Apply a full snapshot for `symbol`, replacing any existing state.
    pub fn apply_snapshot(
        &self,
        symbol: &str,
        bids: &[(i64, i64)],
        asks: &[(i64, i64)],
        last_update_id: i64,
        scale: i64,
    ) {
        let mut state = BookState::empty(scale);
        for &(price_i, qty) in bids {
            BookState::apply_level(&mut state.bids, price_i, qty);
        }
        for &(price_i, qty) in asks {
            BookState::apply_level(&mut state.asks, price_i, qty);
        }
        state.last_update_id = last_update_id;
        state.recompute_top();
        self.books.write().insert(symbol.to_string(), state);
    }

    /// Apply a delta update. `first_id`/`last_id` bound the sequence range
    /// the delta covers (§4.F): drop if stale, signal resync on a gap.
    pub fn apply_delta(
        &self,
        symbol: &str,
        first_id: i64,
        last_id: i64,
        bid_updates: &[(i64, i64)],
        ask_updates: &[(i64, i64)],
    ) -> DeltaOutcome {
        let mut books = self.books.write();
        let Some(state) = books.get_mut(symbol) else {
            return DeltaOutcome::NeedsResync;
        };

        if last_id <= state.last_update_id {
            return DeltaOutcome::DroppedStale;
        }
        if first_id > state.last_update_id + 1 {
            return DeltaOutcome::NeedsResync;
        }

        for &(price_i, qty) in bid_updates {
            BookState::apply_level(&mut state.bids, price_i, qty);
        }
        for &(price_i, qty) in ask_updates {
            BookState::apply_level(&mut state.asks, price_i, qty);
        }
        state.last_update_id = last_id;
        state.recompute_top();
        DeltaOutcome::Applied
    }

    /// Cached top-of-book for `symbol`, or `None` if stale beyond the
    /// freshness horizon or never populated.
    pub fn top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        let books = self.books.read();
        let state = books.get(symbol)?;
        if state.top_as_of.elapsed() > self.freshness_horizon {
            return None;
        }
        Some(state.top)
    }

    /// Same as `top_of_book` but ignores the freshness horizon — used right
    /// after a forced resync snapshot.
    pub fn top_of_book_unchecked(&self, symbol: &str) -> Option<TopOfBook> {
        self.books.read().get(symbol).map(|s| s.top)
    }

    pub fn has_symbol(&self, symbol: &str) -> bool {
        self.books.read().contains_key(symbol)
    }
}

impl Default for LocalOrderBook {
    fn default() -> Self {
        Self::new(3.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_sets_best_bid_and_ask() {
        let book = LocalOrderBook::new(3.0);
        book.apply_snapshot("BTC-PERP", &[(100, 5), (99, 3)], &[(105, 2), (106, 4)], 10, 100);
        let top = book.top_of_book("BTC-PERP").unwrap();
        assert_eq!(top.bid_i, Some(100));
        assert_eq!(top.ask_i, Some(105));
    }

    #[test]
    fn zero_quantity_removes_level() {
        let book = LocalOrderBook::new(3.0);
        book.apply_snapshot("BTC-PERP", &[(100, 5)], &[(105, 2)], 1, 100);
        let outcome = book.apply_delta("BTC-PERP", 2, 2, &[(100, 0)], &[]);
        assert_eq!(outcome, DeltaOutcome::Applied);
        let top = book.top_of_book("BTC-PERP").unwrap();
        assert_eq!(top.bid_i, None);
    }

    #[test]
    fn p6_stale_delta_dropped() {
        let book = LocalOrderBook::new(3.0);
        book.apply_snapshot("BTC-PERP", &[(100, 5)], &[(105, 2)], 10, 100);
        let outcome = book.apply_delta("BTC-PERP", 5, 10, &[(101, 1)], &[]);
        assert_eq!(outcome, DeltaOutcome::DroppedStale);
        let top = book.top_of_book("BTC-PERP").unwrap();
        assert_eq!(top.bid_i, Some(100)); // untouched
    }

    #[test]
    fn p6_gap_triggers_resync() {
        let book = LocalOrderBook::new(3.0);
        book.apply_snapshot("BTC-PERP", &[(100, 5)], &[(105, 2)], 10, 100);
        let outcome = book.apply_delta("BTC-PERP", 15, 20, &[(101, 1)], &[]);
        assert_eq!(outcome, DeltaOutcome::NeedsResync);
    }

    #[test]
    fn stale_top_of_book_beyond_horizon_returns_none() {
        let book = LocalOrderBook::new(0.0);
        book.apply_snapshot("BTC-PERP", &[(100, 5)], &[(105, 2)], 1, 100);
        std::thread::sleep(Duration::from_millis(5));
        assert!(book.top_of_book("BTC-PERP").is_none());
        assert!(book.top_of_book_unchecked("BTC-PERP").is_some());
    }
}
