// =============================================================================
// Nonce-managed venue connector
// =============================================================================
//
// Implements the `Connector` trait for the zk-rollup-style venue family
// where every state-changing call carries an explicit per-API-key nonce
// instead of a timestamp window. Signing itself is delegated to a
// `TxSigner` the caller supplies at construction (the venue's signature
// scheme is proprietary binary-tx packing, not HTTP header signing) — this
// connector owns the nonce lifecycle, market-index bookkeeping, and retry
// policy around it, mirroring `_ensure_signer`/`place_limit`'s hard-refresh
// semantics.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::coi::CoiAllocator;
use crate::error::ExecError;
use crate::nonce::NonceManager;
use crate::order::{Order, OrderEvent, OrderState, OrderTracker};
use crate::rate_limiter::RateLimiter;
use crate::symbol::SymbolMapper;
use crate::types::{MarketMetadata, OrderSide, PositionRecord};

use super::{dispatch_private_event, now_secs, Connector, ConnectorEventType, Listener, LocalOrderBook, OrderBookSnapshot, TopOfBook};

const WS_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

/// Derive the venue's default streaming endpoint from its REST base url —
/// `mainnet.zklighter.elliot.ai` serves both REST and a `/stream` websocket.
fn derive_ws_url(base_url: &str) -> String {
    format!("{}/stream", base_url.replacen("https://", "wss://", 1).replacen("http://", "ws://", 1))
}

fn parse_depth_side(body: &serde_json::Value, key: &str) -> Vec<(i64, i64)> {
    body.get(key)
        .and_then(|v| v.as_array())
        .map(|levels| {
            levels
                .iter()
                .filter_map(|l| {
                    let price_str = l.get("price")?.as_str()?;
                    let size_str = l.get("remaining_base_amount")?.as_str()?;
                    let price_i: i64 = price_str.replace('.', "").parse().ok()?;
                    let size_i: i64 = size_str.replace('.', "").parse().ok()?;
                    Some((price_i, size_i))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Shared handles the spawned stream task needs, independent of any single
/// `&self` borrow.
struct StreamCtx {
    venue: String,
    book: Arc<LocalOrderBook>,
    tracker: Arc<OrderTracker>,
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
    ws_running: Arc<AtomicBool>,
}

/// Connect, subscribe per market, dispatch until the socket drops.
async fn run_stream_once(ctx: &StreamCtx, ws_url: &str, symbol_by_market: &HashMap<u32, String>, account_index: u32) {
    let market_ids: Vec<u32> = symbol_by_market.keys().copied().collect();
    let (ws_stream, _) = match tokio_tungstenite::connect_async(ws_url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(venue = %ctx.venue, error = %err, "ws connect failed");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    for market_id in &market_ids {
        let sub = serde_json::json!({ "type": "subscribe", "channel": format!("order_book/{market_id}") });
        if let Err(err) = write.send(Message::Text(sub.to_string())).await {
            warn!(venue = %ctx.venue, error = %err, "ws depth subscribe failed");
            return;
        }
    }
    let account_sub = serde_json::json!({ "type": "subscribe", "channel": format!("account_all/{account_index}") });
    if let Err(err) = write.send(Message::Text(account_sub.to_string())).await {
        warn!(venue = %ctx.venue, error = %err, "ws account subscribe failed");
        return;
    }

    while ctx.ws_running.load(Ordering::Relaxed) {
        let Some(msg) = read.next().await else {
            debug!(venue = %ctx.venue, "ws stream closed by peer");
            return;
        };
        let msg = match msg {
            Ok(m) => m,
            Err(err) => {
                warn!(venue = %ctx.venue, error = %err, "ws read error");
                return;
            }
        };
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => return,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) else {
            continue;
        };
        let Some(channel) = value.get("channel").and_then(|v| v.as_str()) else {
            continue; // subscribe ack / ping frames carry no `channel` field
        };

        if channel.starts_with("order_book") {
            let Some(market_id) = channel.rsplit('/').next().and_then(|s| s.parse::<u32>().ok()) else {
                continue;
            };
            let Some(symbol) = symbol_by_market.get(&market_id) else { continue };
            let Some(order_book) = value.get("order_book") else { continue };
            let bids = parse_depth_side(order_book, "bids");
            let asks = parse_depth_side(order_book, "asks");
            // The feed sends full snapshots per update rather than sequenced
            // deltas, so every message replaces the book outright.
            ctx.book.apply_snapshot(symbol, &bids, &asks, 0, 1);
        } else if channel.starts_with("account_") {
            if let Some(orders) = value.get("orders").and_then(|v| v.as_array()) {
                for entry in orders {
                    dispatch_private_event(&ctx.tracker, &ctx.listeners, ConnectorEventType::Order, entry.clone(), now_secs());
                }
            }
            if let Some(positions) = value.get("positions").and_then(|v| v.as_array()) {
                for entry in positions {
                    dispatch_private_event(&ctx.tracker, &ctx.listeners, ConnectorEventType::Position, entry.clone(), now_secs());
                }
            }
        }
    }
}

async fn run_stream_loop(ctx: Arc<StreamCtx>, ws_url: String, symbol_by_market: HashMap<u32, String>, account_index: u32) {
    while ctx.ws_running.load(Ordering::Relaxed) {
        run_stream_once(&ctx, &ws_url, &symbol_by_market, account_index).await;
        if !ctx.ws_running.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(WS_RECONNECT_BACKOFF).await;
    }
}

/// Outcome of a signed transaction submission, as returned by the venue.
pub struct TxResult {
    pub tx_hash: Option<String>,
    pub raw: serde_json::Value,
}

/// Abstracts the venue's binary transaction signing and submission so this
/// connector can stay focused on nonce/account bookkeeping. A concrete
/// implementation wraps the venue's native signer SDK.
#[async_trait]
pub trait TxSigner: Send + Sync {
    async fn create_order(
        &self,
        account_index: u32,
        api_key_index: u32,
        nonce: u64,
        market_index: u32,
        client_order_index: u64,
        base_amount: i64,
        price: i64,
        is_ask: bool,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<TxResult, ExecError>;

    async fn create_market_order(
        &self,
        account_index: u32,
        api_key_index: u32,
        nonce: u64,
        market_index: u32,
        client_order_index: u64,
        base_amount: i64,
        avg_execution_price: i64,
        is_ask: bool,
        reduce_only: bool,
    ) -> Result<TxResult, ExecError>;

    async fn cancel_order(
        &self,
        account_index: u32,
        api_key_index: u32,
        nonce: u64,
        market_index: u32,
        order_index: u64,
    ) -> Result<TxResult, ExecError>;

    async fn cancel_all(&self, account_index: u32, api_key_index: u32, nonce: u64) -> Result<TxResult, ExecError>;
}

struct MarketRegistry {
    symbol_to_market: HashMap<String, u32>,
    market_to_symbol: HashMap<u32, String>,
}

/// Nonce/API-key-scoped venue connector.
pub struct NonceVenueConnector {
    venue: String,
    account_index: u32,
    api_key_index: u32,
    client: reqwest::Client,
    base_url: String,
    ws_url: String,
    nonce_manager: Arc<NonceManager>,
    markets: RwLock<MarketRegistry>,
    order_index_by_coi: RwLock<HashMap<u64, u64>>,
    symbols: Arc<SymbolMapper>,
    book: Arc<LocalOrderBook>,
    rate_limiter: Arc<RateLimiter>,
    coi: Arc<CoiAllocator>,
    tracker: Arc<OrderTracker>,
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
    ws_running: Arc<AtomicBool>,
    signer: Box<dyn TxSigner>,
}

impl NonceVenueConnector {
    pub fn new(
        venue: impl Into<String>,
        base_url: impl Into<String>,
        account_index: u32,
        api_key_index: u32,
        signer: Box<dyn TxSigner>,
        nonce_manager: Arc<NonceManager>,
        symbols: Arc<SymbolMapper>,
        rate_limiter: Arc<RateLimiter>,
        coi: Arc<CoiAllocator>,
        book_freshness_horizon_secs: f64,
    ) -> Self {
        let base_url = base_url.into();
        let ws_url = derive_ws_url(&base_url);
        Self {
            venue: venue.into(),
            account_index,
            api_key_index,
            client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            base_url,
            ws_url,
            nonce_manager,
            markets: RwLock::new(MarketRegistry {
                symbol_to_market: HashMap::new(),
                market_to_symbol: HashMap::new(),
            }),
            order_index_by_coi: RwLock::new(HashMap::new()),
            symbols,
            book: Arc::new(LocalOrderBook::new(book_freshness_horizon_secs)),
            rate_limiter,
            coi,
            tracker: Arc::new(OrderTracker::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            ws_running: Arc::new(AtomicBool::new(false)),
            signer,
        }
    }

    fn market_index(&self, symbol: &str) -> Result<u32, ExecError> {
        self.markets
            .read()
            .symbol_to_market
            .get(symbol)
            .copied()
            .ok_or_else(|| ExecError::UnknownSymbol {
                venue: self.venue.clone(),
                symbol: symbol.to_string(),
            })
    }

    /// Allocate the next nonce, hard-refreshing once if the venue rejects it
    /// for being out of sync (mirrors `_ensure_signer`/`hard_refresh_nonce`).
    async fn next_nonce(&self) -> u64 {
        match self.nonce_manager.next(self.api_key_index) {
            Some(n) => n,
            None => {
                self.nonce_manager.refresh(self.api_key_index);
                self.nonce_manager.next(self.api_key_index).unwrap_or(0)
            }
        }
    }

    fn hard_refresh(&self) {
        info!(venue = %self.venue, api_key_index = self.api_key_index, "hard-refreshing nonce after rejection");
        self.nonce_manager.refresh(self.api_key_index);
    }

    async fn fetch_market_catalog(&self) -> Result<serde_json::Value, ExecError> {
        self.rate_limiter.acquire("market_data", 1).await;
        let url = format!("{}/api/v1/orderBooks", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        if !status.is_success() {
            return Err(ExecError::Http {
                venue: self.venue.clone(),
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl Connector for NonceVenueConnector {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn start(&self) -> Result<(), ExecError> {
        self.nonce_manager.refresh(self.api_key_index);
        Ok(())
    }

    async fn start_ws_state(&self, symbols: &[String]) -> Result<(), ExecError> {
        self.ensure_markets().await?;

        let symbol_by_market: HashMap<u32, String> = {
            let markets = self.markets.read();
            symbols
                .iter()
                .filter_map(|s| markets.symbol_to_market.get(s).map(|id| (*id, s.clone())))
                .collect()
        };

        self.ws_running.store(true, Ordering::Relaxed);
        let ctx = Arc::new(StreamCtx {
            venue: self.venue.clone(),
            book: self.book.clone(),
            tracker: self.tracker.clone(),
            listeners: self.listeners.clone(),
            ws_running: self.ws_running.clone(),
        });
        debug!(venue = %self.venue, ?symbol_by_market, "spawning ws stream loop");
        tokio::spawn(run_stream_loop(ctx, self.ws_url.clone(), symbol_by_market, self.account_index));
        Ok(())
    }

    async fn stop_ws_state(&self) {
        self.ws_running.store(false, Ordering::Relaxed);
    }

    async fn close(&self) {
        self.stop_ws_state().await;
    }

    async fn ensure_markets(&self) -> Result<(), ExecError> {
        if !self.markets.read().symbol_to_market.is_empty() {
            return Ok(());
        }
        let body = self.fetch_market_catalog().await?;
        let entries = body
            .get("order_books")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut markets = self.markets.write();
        for entry in &entries {
            let symbol = entry.get("symbol").and_then(|v| v.as_str());
            let market_id = entry.get("market_id").and_then(|v| v.as_u64()).map(|v| v as u32);
            let (Some(symbol), Some(market_id)) = (symbol, market_id) else {
                continue;
            };
            markets.symbol_to_market.insert(symbol.to_string(), market_id);
            markets.market_to_symbol.insert(market_id, symbol.to_string());

            let price_decimals = entry.get("supported_price_decimals").and_then(|v| v.as_u64()).unwrap_or(2) as u32;
            let size_decimals = entry.get("supported_size_decimals").and_then(|v| v.as_u64()).unwrap_or(4) as u32;
            self.symbols.register(symbol, &self.venue, symbol);
            self.symbols
                .set_metadata(&self.venue, symbol, MarketMetadata::with_defaults(price_decimals, size_decimals));
        }
        Ok(())
    }

    async fn list_symbols(&self) -> Result<Vec<String>, ExecError> {
        self.ensure_markets().await?;
        Ok(self.markets.read().symbol_to_market.keys().cloned().collect())
    }

    async fn get_market_info(&self, symbol: &str) -> Result<MarketMetadata, ExecError> {
        self.ensure_markets().await?;
        self.symbols.metadata(&self.venue, symbol).ok_or_else(|| ExecError::UnknownSymbol {
            venue: self.venue.clone(),
            symbol: symbol.to_string(),
        })
    }

    /// Cached top-of-book, or — if nothing is cached yet — a forced snapshot
    /// fetch (via `get_order_book`, which primes `self.book` as a side
    /// effect) before returning.
    async fn get_top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        if let Some(top) = self.book.top_of_book(symbol) {
            return Some(top);
        }
        if self.get_order_book(symbol, 50).await.is_err() {
            return None;
        }
        self.book.top_of_book_unchecked(symbol)
    }

    async fn get_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot, ExecError> {
        let market_index = self.market_index(symbol)?;
        self.rate_limiter.acquire("market_data", 1).await;
        let url = format!("{}/api/v1/orderBookOrders?market_index={market_index}&limit={depth}", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })?;
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);

        let bids = parse_depth_side(&body, "bids");
        let asks = parse_depth_side(&body, "asks");
        self.book.apply_snapshot(symbol, &bids, &asks, 0, 1);

        Ok(OrderBookSnapshot { bids, asks, scale: 1 })
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExecError> {
        let snapshot = self.get_order_book(symbol, 1).await?;
        let bid = snapshot.bids.first().map(|(p, _)| *p as f64);
        let ask = snapshot.asks.first().map(|(p, _)| *p as f64);
        match (bid, ask) {
            (Some(b), Some(a)) => Ok((b + a) / 2.0 / snapshot.scale as f64),
            _ => Err(ExecError::InvalidResponse {
                venue: self.venue.clone(),
                detail: format!("no book depth for {symbol}"),
            }),
        }
    }

    async fn get_positions(&self) -> Result<Vec<PositionRecord>, ExecError> {
        self.rate_limiter.acquire("account", 1).await;
        let url = format!("{}/api/v1/account?by=index&value={}", self.base_url, self.account_index);
        let resp = self.client.get(&url).send().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })?;
        let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
        let positions = body.get("positions").and_then(|v| v.as_array()).cloned().unwrap_or_default();

        Ok(positions
            .iter()
            .filter_map(|p| {
                let market_id = p.get("market_id")?.as_u64()? as u32;
                let symbol = self.markets.read().market_to_symbol.get(&market_id).cloned()?;
                let base_qty: f64 = p.get("position")?.as_str()?.parse().ok()?;
                Some(PositionRecord {
                    symbol,
                    base_qty,
                    entry_price: p.get("avg_entry_price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                    liquidation_price: p.get("liquidation_price").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                    unrealized_pnl: p.get("unrealized_pnl").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                })
            })
            .collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExecError> {
        let market_index = match symbol {
            Some(s) => Some(self.market_index(s)?),
            None => None,
        };
        self.rate_limiter.acquire("account", 1).await;

        let market_indices: Vec<u32> = match market_index {
            Some(m) => vec![m],
            None => self.markets.read().market_to_symbol.keys().copied().collect(),
        };

        let mut orders = Vec::new();
        for market in market_indices {
            let url = format!(
                "{}/api/v1/accountActiveOrders?account_index={}&market_index={market}",
                self.base_url, self.account_index
            );
            let resp = self.client.get(&url).send().await.map_err(|e| ExecError::Network {
                venue: self.venue.clone(),
                source: e,
            })?;
            let body: serde_json::Value = resp.json().await.unwrap_or(serde_json::Value::Null);
            let entries = body.get("orders").and_then(|v| v.as_array()).cloned().unwrap_or_default();
            for entry in entries {
                if let Some(coi) = entry.get("client_order_index").and_then(|v| v.as_u64()) {
                    if let Some(order) = self.tracker.by_client(coi) {
                        orders.push(order);
                    }
                }
            }
        }
        Ok(orders)
    }

    async fn get_balances(&self) -> Result<serde_json::Value, ExecError> {
        self.rate_limiter.acquire("account", 1).await;
        let url = format!("{}/api/v1/account?by=index&value={}", self.base_url, self.account_index);
        let resp = self.client.get(&url).send().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })?;
        resp.json().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })
    }

    async fn get_collateral(&self) -> Result<f64, ExecError> {
        let account = self.get_balances().await?;
        Ok(account
            .get("collateral")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0))
    }

    async fn get_account_overview(&self) -> Result<serde_json::Value, ExecError> {
        self.get_balances().await
    }

    async fn place_limit(
        &self,
        symbol: &str,
        coi: u64,
        size_i: i64,
        price_i: i64,
        is_ask: bool,
        post_only: bool,
        reduce_only: bool,
    ) -> Result<Order, ExecError> {
        let market_index = self.market_index(symbol)?;
        let order = self.tracker.create(
            &self.venue,
            coi,
            Some(symbol.to_string()),
            Some(OrderSide::from_is_ask(is_ask)),
            Some(price_i),
            Some(size_i),
        );
        order.apply_update(OrderEvent::new(OrderState::Submitting, 0.0));

        self.rate_limiter.acquire("order", 1).await;
        let mut nonce = self.next_nonce().await;

        let mut attempt = self
            .signer
            .create_order(
                self.account_index,
                self.api_key_index,
                nonce,
                market_index,
                coi,
                size_i,
                price_i,
                is_ask,
                post_only,
                reduce_only,
            )
            .await;

        if let Err(ref err) = attempt {
            if err.is_transient() {
                self.hard_refresh();
                nonce = self.next_nonce().await;
                attempt = self
                    .signer
                    .create_order(
                        self.account_index,
                        self.api_key_index,
                        nonce,
                        market_index,
                        coi,
                        size_i,
                        price_i,
                        is_ask,
                        post_only,
                        reduce_only,
                    )
                    .await;
            }
        }

        match attempt {
            Ok(result) => {
                if let Some(tx_hash) = &result.tx_hash {
                    self.tracker.link_exchange_id(&order, tx_hash);
                }
                let event = OrderEvent::from_raw(&result.raw, "rest", 0.0);
                order.apply_update(event);
                Ok(order)
            }
            Err(err) => {
                order.apply_update(OrderEvent::new(OrderState::Failed, 0.0));
                Err(err)
            }
        }
    }

    async fn place_market(
        &self,
        symbol: &str,
        coi: u64,
        size_i: i64,
        is_ask: bool,
        reduce_only: bool,
        max_slippage: Option<f64>,
    ) -> Result<Order, ExecError> {
        let market_index = self.market_index(symbol)?;
        let top = self.get_top_of_book(symbol).await;
        let ideal_price = match (is_ask, top) {
            (true, Some(t)) => t.bid_i,
            (false, Some(t)) => t.ask_i,
            _ => None,
        }
        .ok_or_else(|| ExecError::InvalidResponse {
            venue: self.venue.clone(),
            detail: "empty order book, cannot derive market execution price".to_string(),
        })?;

        let acceptable_price = match max_slippage {
            Some(slip) if slip > 0.0 => {
                let direction = if is_ask { -1.0 } else { 1.0 };
                (ideal_price as f64 * (1.0 + slip * direction)).round() as i64
            }
            _ => ideal_price,
        };

        let order = self.tracker.create(
            &self.venue,
            coi,
            Some(symbol.to_string()),
            Some(OrderSide::from_is_ask(is_ask)),
            None,
            Some(size_i),
        );
        order.apply_update(OrderEvent::new(OrderState::Submitting, 0.0));

        self.rate_limiter.acquire("order", 1).await;
        let nonce = self.next_nonce().await;

        let result = self
            .signer
            .create_market_order(
                self.account_index,
                self.api_key_index,
                nonce,
                market_index,
                coi,
                size_i,
                acceptable_price,
                is_ask,
                reduce_only,
            )
            .await;

        match result {
            Ok(result) => {
                if let Some(tx_hash) = &result.tx_hash {
                    self.tracker.link_exchange_id(&order, tx_hash);
                }
                let event = OrderEvent::from_raw(&result.raw, "rest", 0.0);
                order.apply_update(event);
                Ok(order)
            }
            Err(err) => {
                order.apply_update(OrderEvent::new(OrderState::Failed, 0.0));
                Err(err)
            }
        }
    }

    async fn cancel_order(&self, exchange_id: &str, symbol: Option<&str>) -> Result<(), ExecError> {
        let market_index = match symbol {
            Some(s) => self.market_index(s)?,
            None => return Err(ExecError::NotSupported {
                venue: self.venue.clone(),
                capability: "cancel by exchange id without a market hint".to_string(),
            }),
        };
        let order_index: u64 = exchange_id.parse().map_err(|_| ExecError::OrderNotFound {
            venue: self.venue.clone(),
            detail: format!("exchange id {exchange_id} is not a numeric order index"),
        })?;

        self.rate_limiter.acquire("order", 1).await;
        let nonce = self.next_nonce().await;
        self.signer
            .cancel_order(self.account_index, self.api_key_index, nonce, market_index, order_index)
            .await?;
        Ok(())
    }

    async fn cancel_by_client_id(&self, symbol: &str, coi: u64) -> Result<(), ExecError> {
        let order_index = self.order_index_by_coi.read().get(&coi).copied();
        match order_index {
            Some(idx) => self.cancel_order(&idx.to_string(), Some(symbol)).await,
            None => {
                warn!(venue = %self.venue, coi, "client order index not mapped to an order index, falling back to cancel_all");
                self.cancel_all(Some(symbol)).await
            }
        }
    }

    async fn cancel_all(&self, _symbol: Option<&str>) -> Result<(), ExecError> {
        self.rate_limiter.acquire("order", 1).await;
        let nonce = self.next_nonce().await;
        self.signer.cancel_all(self.account_index, self.api_key_index, nonce).await?;
        Ok(())
    }

    fn order_tracker(&self) -> &OrderTracker {
        &self.tracker
    }

    fn register_listener(&self, listener: Arc<dyn Listener>) {
        self.listeners.write().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSigner;

    #[async_trait]
    impl TxSigner for StubSigner {
        async fn create_order(
            &self,
            _account_index: u32,
            _api_key_index: u32,
            _nonce: u64,
            _market_index: u32,
            _client_order_index: u64,
            _base_amount: i64,
            _price: i64,
            _is_ask: bool,
            _post_only: bool,
            _reduce_only: bool,
        ) -> Result<TxResult, ExecError> {
            Ok(TxResult {
                tx_hash: Some("0xabc".to_string()),
                raw: serde_json::json!({ "status": "open" }),
            })
        }

        async fn create_market_order(
            &self,
            _account_index: u32,
            _api_key_index: u32,
            _nonce: u64,
            _market_index: u32,
            _client_order_index: u64,
            _base_amount: i64,
            _avg_execution_price: i64,
            _is_ask: bool,
            _reduce_only: bool,
        ) -> Result<TxResult, ExecError> {
            Ok(TxResult {
                tx_hash: Some("0xdef".to_string()),
                raw: serde_json::json!({ "status": "filled" }),
            })
        }

        async fn cancel_order(
            &self,
            _account_index: u32,
            _api_key_index: u32,
            _nonce: u64,
            _market_index: u32,
            _order_index: u64,
        ) -> Result<TxResult, ExecError> {
            Ok(TxResult {
                tx_hash: None,
                raw: serde_json::json!({}),
            })
        }

        async fn cancel_all(&self, _account_index: u32, _api_key_index: u32, _nonce: u64) -> Result<TxResult, ExecError> {
            Ok(TxResult {
                tx_hash: None,
                raw: serde_json::json!({}),
            })
        }
    }

    fn test_connector() -> NonceVenueConnector {
        let nonce_manager = Arc::new(NonceManager::new(|_key| 1));
        nonce_manager.refresh(0);
        let connector = NonceVenueConnector::new(
            "lighter",
            "https://mainnet.zklighter.elliot.ai",
            3,
            0,
            Box::new(StubSigner),
            nonce_manager,
            Arc::new(SymbolMapper::new()),
            Arc::new(RateLimiter::new(1200)),
            Arc::new(CoiAllocator::new()),
            3.0,
        );
        connector.markets.write().symbol_to_market.insert("BTC-PERP".to_string(), 1);
        connector.markets.write().market_to_symbol.insert(1, "BTC-PERP".to_string());
        connector
    }

    #[tokio::test]
    async fn place_limit_links_tx_hash_and_applies_event() {
        let connector = test_connector();
        let order = connector
            .place_limit("BTC-PERP", 42, 1_000_000, 100_000_000, false, true, false)
            .await
            .unwrap();
        assert_eq!(order.exchange_order_id(), Some("0xabc".to_string()));
        assert_eq!(order.state(), crate::order::OrderState::Open);
    }

    #[tokio::test]
    async fn place_market_without_top_of_book_errors() {
        let connector = test_connector();
        let result = connector.place_market("BTC-PERP", 1, 1_000_000, false, false, None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancel_by_client_id_falls_back_to_cancel_all_when_unmapped() {
        let connector = test_connector();
        let result = connector.cancel_by_client_id("BTC-PERP", 999).await;
        assert!(result.is_ok());
    }
}
