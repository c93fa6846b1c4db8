// =============================================================================
// Ed25519-signed venue connector
// =============================================================================
//
// Implements the `Connector` trait for venues that authenticate REST calls
// with an Ed25519 keypair: each request is signed over
// `instruction=<op>&<sorted k=v pairs>&timestamp=<ms>&window=<ms>`, producing
// `X-API-Key` / `X-Timestamp` / `X-Window` / `X-Signature` headers. No nonce
// is involved on this venue family — signing state is just the keypair.
//
// The streaming half (public depth + private order/position events) runs as
// a detached task spawned from `start_ws_state`, reconnecting with a 1s
// backoff and re-priming the book from a fresh snapshot on every (re)connect.
// =============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::Engine;
use ed25519_dalek::{Signer, SigningKey};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use reqwest::Method;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, instrument, warn};

use crate::coi::CoiAllocator;
use crate::credentials::Ed25519Credentials;
use crate::error::ExecError;
use crate::order::{Order, OrderEvent, OrderTracker};
use crate::rate_limiter::RateLimiter;
use crate::symbol::SymbolMapper;
use crate::types::{MarketMetadata, OrderSide, PositionRecord};

use super::{
    dispatch_private_event, now_secs, Connector, ConnectorEventType, Listener, LocalOrderBook, OrderBookSnapshot, TopOfBook,
};

const DEFAULT_WINDOW_MS: u64 = 5000;
const WS_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
const WS_DEPTH_SUFFIX: &str = "@depth";
const WS_ORDER_STREAM: &str = "orderUpdate";
const WS_POSITION_STREAM: &str = "positionUpdate";

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build the exact message the venue expects to be signed: instruction, then
/// the sorted `k=v` parameters, then timestamp and window.
fn build_message(instruction: &str, params: &BTreeMap<String, String>, timestamp: u64, window: u64) -> String {
    let params_string = params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    if params_string.is_empty() {
        format!("instruction={instruction}&timestamp={timestamp}&window={window}")
    } else {
        format!("instruction={instruction}&{params_string}&timestamp={timestamp}&window={window}")
    }
}

fn sign_message(signing_key: &SigningKey, message: &str) -> String {
    let signature = signing_key.sign(message.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(signature.to_bytes())
}

/// Derive the venue's WS endpoint from its REST base url (`api.` -> `ws.`,
/// `https` -> `wss`) — matches Backpack's `api.backpack.exchange` /
/// `ws.backpack.exchange` split.
fn derive_ws_url(base_url: &str) -> String {
    base_url
        .replacen("https://", "wss://", 1)
        .replacen("http://", "ws://", 1)
        .replacen("://api.", "://ws.", 1)
}

fn parse_depth_levels(body: &serde_json::Value) -> (Vec<(i64, i64)>, Vec<(i64, i64)>) {
    let parse_levels = |key: &str| -> Vec<(i64, i64)> {
        body.get(key)
            .and_then(|v| v.as_array())
            .map(|levels| {
                levels
                    .iter()
                    .filter_map(|l| {
                        let pair = l.as_array()?;
                        let price: f64 = pair.first()?.as_str()?.parse().ok()?;
                        let qty: f64 = pair.get(1)?.as_str()?.parse().ok()?;
                        Some(((price * 1e6) as i64, (qty * 1e6) as i64))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };
    (parse_levels("bids"), parse_levels("asks"))
}

/// Stand-alone signed depth fetch, usable from the spawned stream task which
/// holds no `&self`. Mirrors `Ed25519VenueConnector::signed_request` for the
/// one instruction (`orderExecute`, the path's default mapping) it needs.
#[allow(clippy::too_many_arguments)]
async fn fetch_depth_snapshot(
    client: &reqwest::Client,
    venue: &str,
    base_url: &str,
    public_key_b64: &str,
    signing_key: &SigningKey,
    rate_limiter: &RateLimiter,
    venue_symbol: &str,
) -> Result<(Vec<(i64, i64)>, Vec<(i64, i64)>, i64), ExecError> {
    rate_limiter.acquire("market_data", 1).await;

    let params = BTreeMap::from([("symbol".to_string(), venue_symbol.to_string())]);
    let timestamp = now_ms();
    let message = build_message("orderExecute", &params, timestamp, DEFAULT_WINDOW_MS);
    let signature = sign_message(signing_key, &message);

    let url = format!("{base_url}/api/v1/depth");
    let response = client
        .get(&url)
        .header("X-API-Key", public_key_b64)
        .header("X-Timestamp", timestamp.to_string())
        .header("X-Window", DEFAULT_WINDOW_MS.to_string())
        .header("X-Signature", signature)
        .query(&params)
        .send()
        .await
        .map_err(|e| ExecError::Network {
            venue: venue.to_string(),
            source: e,
        })?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        return Err(ExecError::Http {
            venue: venue.to_string(),
            status: status.as_u16(),
            body: body.to_string(),
        });
    }

    let (bids, asks) = parse_depth_levels(&body);
    let last_update_id = body.get("lastUpdateId").and_then(|v| v.as_i64()).unwrap_or(now_ms() as i64);
    Ok((bids, asks, last_update_id))
}

/// Shared handles the spawned stream task needs — everything it touches is
/// behind an `Arc` so the task can outlive any single `&self` borrow.
struct StreamCtx {
    venue: String,
    ws_url: String,
    base_url: String,
    public_key_b64: String,
    signing_key: SigningKey,
    client: reqwest::Client,
    rate_limiter: Arc<RateLimiter>,
    book: Arc<LocalOrderBook>,
    tracker: Arc<OrderTracker>,
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
    ws_running: Arc<AtomicBool>,
}

impl StreamCtx {
    async fn prime_snapshot(&self, venue_symbol: &str) {
        match fetch_depth_snapshot(
            &self.client,
            &self.venue,
            &self.base_url,
            &self.public_key_b64,
            &self.signing_key,
            &self.rate_limiter,
            venue_symbol,
        )
        .await
        {
            Ok((bids, asks, last_update_id)) => {
                self.book.apply_snapshot(venue_symbol, &bids, &asks, last_update_id, 1_000_000);
            }
            Err(err) => {
                warn!(venue = %self.venue, venue_symbol, error = %err, "failed to prime book snapshot");
            }
        }
    }

    fn handle_depth_message(&self, data: &serde_json::Value) {
        let Some(venue_symbol) = data.get("s").and_then(|v| v.as_str()) else {
            return;
        };
        let first_id = data.get("U").and_then(|v| v.as_i64()).unwrap_or(0);
        let last_id = data.get("u").and_then(|v| v.as_i64()).unwrap_or(first_id);
        let (bids, asks) = parse_depth_levels(data);
        let venue_symbol = venue_symbol.to_string();

        match self.book.apply_delta(&venue_symbol, first_id, last_id, &bids, &asks) {
            super::book::DeltaOutcome::NeedsResync => {
                let ctx = self.clone_handles();
                tokio::spawn(async move {
                    warn!(venue_symbol = %venue_symbol, "depth sequence gap, forcing resync");
                    ctx.prime_snapshot(&venue_symbol).await;
                });
            }
            super::book::DeltaOutcome::Applied | super::book::DeltaOutcome::DroppedStale => {}
        }
    }

    fn clone_handles(&self) -> Arc<StreamCtx> {
        Arc::new(StreamCtx {
            venue: self.venue.clone(),
            ws_url: self.ws_url.clone(),
            base_url: self.base_url.clone(),
            public_key_b64: self.public_key_b64.clone(),
            signing_key: self.signing_key.clone(),
            client: self.client.clone(),
            rate_limiter: self.rate_limiter.clone(),
            book: self.book.clone(),
            tracker: self.tracker.clone(),
            listeners: self.listeners.clone(),
            ws_running: self.ws_running.clone(),
        })
    }
}

/// Connect, subscribe, dispatch until the socket drops; the caller loop
/// reconnects with a backoff. Returns normally on a clean close or a parse
/// failure so the outer loop can decide whether to keep running.
async fn run_stream_once(ctx: &StreamCtx, venue_symbols: &[String]) {
    let (ws_stream, _) = match tokio_tungstenite::connect_async(&ctx.ws_url).await {
        Ok(pair) => pair,
        Err(err) => {
            warn!(venue = %ctx.venue, error = %err, "ws connect failed");
            return;
        }
    };
    let (mut write, mut read) = ws_stream.split();

    for symbol in venue_symbols {
        ctx.prime_snapshot(symbol).await;
    }

    let mut params: Vec<String> = venue_symbols.iter().map(|s| format!("{s}{WS_DEPTH_SUFFIX}")).collect();
    params.push(WS_ORDER_STREAM.to_string());
    params.push(WS_POSITION_STREAM.to_string());
    let subscribe = serde_json::json!({ "method": "SUBSCRIBE", "params": params, "id": 1 });
    if let Err(err) = write.send(Message::Text(subscribe.to_string())).await {
        warn!(venue = %ctx.venue, error = %err, "ws subscribe failed");
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
        let Some(stream) = value.get("stream").and_then(|v| v.as_str()) else {
            continue; // subscribe ack / ping frames carry no `stream` field
        };
        let Some(data) = value.get("data").cloned() else {
            continue;
        };

        if stream.ends_with(WS_DEPTH_SUFFIX) {
            ctx.handle_depth_message(&data);
        } else if stream == WS_ORDER_STREAM {
            dispatch_private_event(&ctx.tracker, &ctx.listeners, ConnectorEventType::Order, data, now_secs());
        } else if stream == WS_POSITION_STREAM {
            dispatch_private_event(&ctx.tracker, &ctx.listeners, ConnectorEventType::Position, data, now_secs());
        }
    }
}

async fn run_stream_loop(ctx: Arc<StreamCtx>, venue_symbols: Vec<String>) {
    while ctx.ws_running.load(Ordering::Relaxed) {
        run_stream_once(&ctx, &venue_symbols).await;
        if !ctx.ws_running.load(Ordering::Relaxed) {
            break;
        }
        tokio::time::sleep(WS_RECONNECT_BACKOFF).await;
    }
}

/// Ed25519-signed venue connector (Backpack-flavored signing scheme).
pub struct Ed25519VenueConnector {
    venue: String,
    base_url: String,
    ws_url: String,
    public_key_b64: String,
    signing_key: SigningKey,
    client: reqwest::Client,
    symbols: Arc<SymbolMapper>,
    book: Arc<LocalOrderBook>,
    rate_limiter: Arc<RateLimiter>,
    coi: Arc<CoiAllocator>,
    tracker: Arc<OrderTracker>,
    listeners: Arc<RwLock<Vec<Arc<dyn Listener>>>>,
    ws_running: Arc<AtomicBool>,
}

impl Ed25519VenueConnector {
    pub fn new(
        venue: impl Into<String>,
        base_url: impl Into<String>,
        credentials: &Ed25519Credentials,
        symbols: Arc<SymbolMapper>,
        rate_limiter: Arc<RateLimiter>,
        coi: Arc<CoiAllocator>,
        book_freshness_horizon_secs: f64,
    ) -> Result<Self, ExecError> {
        let venue = venue.into();
        let seed_bytes = base64::engine::general_purpose::STANDARD
            .decode(&credentials.api_secret)
            .map_err(|e| ExecError::AuthInvalid {
                venue: venue.clone(),
                message: format!("api_secret is not valid base64: {e}"),
            })?;
        Self::from_seed(venue, base_url, credentials, seed_bytes, symbols, rate_limiter, coi, book_freshness_horizon_secs)
    }

    fn from_seed(
        venue: impl Into<String>,
        base_url: impl Into<String>,
        credentials: &Ed25519Credentials,
        seed_bytes: Vec<u8>,
        symbols: Arc<SymbolMapper>,
        rate_limiter: Arc<RateLimiter>,
        coi: Arc<CoiAllocator>,
        book_freshness_horizon_secs: f64,
    ) -> Result<Self, ExecError> {
        let venue = venue.into();
        let seed: [u8; 32] = seed_bytes.as_slice().try_into().map_err(|_| ExecError::AuthInvalid {
            venue: venue.clone(),
            message: "api_secret must decode to a 32-byte Ed25519 seed".to_string(),
        })?;
        let signing_key = SigningKey::from_bytes(&seed);

        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        let base_url = base_url.into();
        let ws_url = derive_ws_url(&base_url);

        Ok(Self {
            venue,
            base_url,
            ws_url,
            public_key_b64: credentials.api_key.clone(),
            signing_key,
            client,
            symbols,
            book: Arc::new(LocalOrderBook::new(book_freshness_horizon_secs)),
            rate_limiter,
            coi,
            tracker: Arc::new(OrderTracker::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            ws_running: Arc::new(AtomicBool::new(false)),
        })
    }

    fn instruction_for(&self, method: &Method, path: &str) -> &'static str {
        match (method, path) {
            (&Method::POST, p) if p.ends_with("/order") => "orderExecute",
            (&Method::DELETE, p) if p.ends_with("/order") => "orderCancel",
            (&Method::DELETE, p) if p.ends_with("/orders") => "orderCancelAll",
            (_, p) if p.contains("/orders") => "orderQueryAll",
            (_, p) if p.contains("/balances") => "balanceQuery",
            (_, p) if p.contains("/positions") => "positionQuery",
            (_, p) if p.contains("/account") => "accountQuery",
            _ => "orderExecute",
        }
    }

    #[instrument(skip(self, params), fields(venue = %self.venue, path))]
    async fn signed_request(
        &self,
        method: Method,
        path: &str,
        params: BTreeMap<String, String>,
        weight: u32,
    ) -> Result<serde_json::Value, ExecError> {
        self.rate_limiter.acquire("order", weight).await;

        let instruction = self.instruction_for(&method, path);
        let timestamp = now_ms();
        let message = build_message(instruction, &params, timestamp, DEFAULT_WINDOW_MS);
        let signature = sign_message(&self.signing_key, &message);

        let url = format!("{}{}", self.base_url, path);
        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("X-API-Key", &self.public_key_b64)
            .header("X-Timestamp", timestamp.to_string())
            .header("X-Window", DEFAULT_WINDOW_MS.to_string())
            .header("X-Signature", signature);

        request = if method == Method::GET || method == Method::DELETE {
            request.query(&params)
        } else {
            request.json(&params)
        };

        let response = request.send().await.map_err(|e| ExecError::Network {
            venue: self.venue.clone(),
            source: e,
        })?;

        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        if !status.is_success() {
            return Err(ExecError::Http {
                venue: self.venue.clone(),
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        debug!(instruction, "signed request succeeded");
        Ok(body)
    }

    fn stream_ctx(&self) -> StreamCtx {
        StreamCtx {
            venue: self.venue.clone(),
            ws_url: self.ws_url.clone(),
            base_url: self.base_url.clone(),
            public_key_b64: self.public_key_b64.clone(),
            signing_key: self.signing_key.clone(),
            client: self.client.clone(),
            rate_limiter: self.rate_limiter.clone(),
            book: self.book.clone(),
            tracker: self.tracker.clone(),
            listeners: self.listeners.clone(),
            ws_running: self.ws_running.clone(),
        }
    }
}

#[async_trait]
impl Connector for Ed25519VenueConnector {
    fn venue(&self) -> &str {
        &self.venue
    }

    async fn start(&self) -> Result<(), ExecError> {
        debug!(venue = %self.venue, "connector started");
        Ok(())
    }

    async fn start_ws_state(&self, symbols: &[String]) -> Result<(), ExecError> {
        let venue_symbols: Vec<String> = symbols
            .iter()
            .map(|s| self.symbols.to_venue(s, &self.venue, None).unwrap_or_else(|| s.to_string()))
            .collect();

        self.ws_running.store(true, Ordering::Relaxed);
        let ctx = Arc::new(self.stream_ctx());
        debug!(venue = %self.venue, ?venue_symbols, "spawning ws stream loop");
        tokio::spawn(run_stream_loop(ctx, venue_symbols));
        Ok(())
    }

    async fn stop_ws_state(&self) {
        self.ws_running.store(false, Ordering::Relaxed);
    }

    async fn close(&self) {
        self.stop_ws_state().await;
    }

    async fn ensure_markets(&self) -> Result<(), ExecError> {
        let body = self
            .signed_request(Method::GET, "/api/v1/markets", BTreeMap::new(), 1)
            .await?;

        let markets = body.as_array().ok_or_else(|| ExecError::InvalidResponse {
            venue: self.venue.clone(),
            detail: "markets response is not an array".to_string(),
        })?;

        for market in markets {
            let venue_symbol = market.get("symbol").and_then(|v| v.as_str());
            let canonical = market.get("baseSymbol").and_then(|v| v.as_str()).or(venue_symbol);
            let (Some(venue_symbol), Some(canonical)) = (venue_symbol, canonical) else {
                continue;
            };
            self.symbols.register(canonical, &self.venue, venue_symbol);

            let price_decimals = market.get("priceDecimals").and_then(|v| v.as_u64()).unwrap_or(2) as u32;
            let size_decimals = market.get("quantityDecimals").and_then(|v| v.as_u64()).unwrap_or(4) as u32;
            self.symbols
                .set_metadata(&self.venue, canonical, MarketMetadata::with_defaults(price_decimals, size_decimals));
        }
        Ok(())
    }

    async fn list_symbols(&self) -> Result<Vec<String>, ExecError> {
        self.ensure_markets().await?;
        Ok(Vec::new())
    }

    async fn get_market_info(&self, symbol: &str) -> Result<MarketMetadata, ExecError> {
        self.symbols.metadata(&self.venue, symbol).ok_or_else(|| ExecError::UnknownSymbol {
            venue: self.venue.clone(),
            symbol: symbol.to_string(),
        })
    }

    /// Cached top-of-book, or — if nothing is cached yet — a forced snapshot
    /// fetch that primes the book before returning.
    async fn get_top_of_book(&self, symbol: &str) -> Option<TopOfBook> {
        let venue_symbol = self.symbols.to_venue(symbol, &self.venue, None)?;
        if let Some(top) = self.book.top_of_book(&venue_symbol) {
            return Some(top);
        }

        match fetch_depth_snapshot(
            &self.client,
            &self.venue,
            &self.base_url,
            &self.public_key_b64,
            &self.signing_key,
            &self.rate_limiter,
            &venue_symbol,
        )
        .await
        {
            Ok((bids, asks, last_update_id)) => {
                self.book.apply_snapshot(&venue_symbol, &bids, &asks, last_update_id, 1_000_000);
                self.book.top_of_book_unchecked(&venue_symbol)
            }
            Err(err) => {
                warn!(venue = %self.venue, symbol, error = %err, "forced book snapshot failed, no_book");
                None
            }
        }
    }

    async fn get_order_book(&self, symbol: &str, depth: u32) -> Result<OrderBookSnapshot, ExecError> {
        let venue_symbol = self
            .symbols
            .to_venue(symbol, &self.venue, None)
            .unwrap_or_else(|| symbol.to_string());
        let body = self
            .signed_request(
                Method::GET,
                "/api/v1/depth",
                BTreeMap::from([("symbol".to_string(), venue_symbol.clone()), ("limit".to_string(), depth.to_string())]),
                1,
            )
            .await?;

        let (bids, asks) = parse_depth_levels(&body);
        let last_update_id = body.get("lastUpdateId").and_then(|v| v.as_i64()).unwrap_or(now_ms() as i64);
        self.book.apply_snapshot(&venue_symbol, &bids, &asks, last_update_id, 1_000_000);

        Ok(OrderBookSnapshot {
            bids,
            asks,
            scale: 1_000_000,
        })
    }

    async fn get_last_price(&self, symbol: &str) -> Result<f64, ExecError> {
        if let Some(top) = self.get_top_of_book(symbol).await {
            if let (Some(bid), Some(ask)) = (top.bid_i, top.ask_i) {
                return Ok((bid + ask) as f64 / 2.0 / top.scale as f64);
            }
        }
        Err(ExecError::InvalidResponse {
            venue: self.venue.clone(),
            detail: format!("no cached top-of-book for {symbol}"),
        })
    }

    async fn get_positions(&self) -> Result<Vec<PositionRecord>, ExecError> {
        let body = self
            .signed_request(Method::GET, "/api/v1/positions", BTreeMap::new(), 1)
            .await?;

        let positions = body.as_array().cloned().unwrap_or_default();
        Ok(positions
            .iter()
            .filter_map(|p| {
                let symbol = p.get("symbol")?.as_str()?.to_string();
                let base_qty: f64 = p.get("netQuantity")?.as_str()?.parse().ok()?;
                Some(PositionRecord {
                    symbol,
                    base_qty,
                    entry_price: p.get("entryPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                    liquidation_price: p.get("liquidationPrice").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                    unrealized_pnl: p.get("pnlUnrealized").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()),
                })
            })
            .collect())
    }

    async fn get_open_orders(&self, symbol: Option<&str>) -> Result<Vec<Order>, ExecError> {
        let mut params = BTreeMap::new();
        if let Some(s) = symbol {
            let venue_symbol = self.symbols.to_venue(s, &self.venue, None).unwrap_or_else(|| s.to_string());
            params.insert("symbol".to_string(), venue_symbol);
        }
        let body = self.signed_request(Method::GET, "/api/v1/orders", params, 1).await?;

        let entries = body.as_array().cloned().unwrap_or_default();
        Ok(entries
            .iter()
            .filter_map(|entry| entry.get("id").and_then(|v| v.as_str()))
            .filter_map(|exchange_id| self.tracker.by_exchange(exchange_id))
            .collect())
    }

    async fn get_balances(&self) -> Result<serde_json::Value, ExecError> {
        self.signed_request(Method::GET, "/api/v1/balances", BTreeMap::new(), 1).await
    }

    async fn get_collateral(&self) -> Result<f64, ExecError> {
        let balances = self.get_balances().await?;
        let collateral = balances
            .get("USDC")
            .and_then(|v| v.get("available"))
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0);
        Ok(collateral)
    }

    async fn get_account_overview(&self) -> Result<serde_json::Value, ExecError> {
        self.signed_request(Method::GET, "/api/v1/account", BTreeMap::new(), 1).await
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
        let venue_symbol = self.symbols.to_venue(symbol, &self.venue, None).unwrap_or_else(|| symbol.to_string());
        let metadata = self.get_market_info(symbol).await.ok();
        let (price_scale, size_scale) = metadata
            .as_ref()
            .map(|m| (m.price_scale(), m.size_scale()))
            .unwrap_or((1_000_000, 1_000_000));

        let side = if is_ask { "Ask" } else { "Bid" };
        let mut params = BTreeMap::from([
            ("symbol".to_string(), venue_symbol.clone()),
            ("side".to_string(), side.to_string()),
            ("orderType".to_string(), "Limit".to_string()),
            ("price".to_string(), format!("{:.8}", price_i as f64 / price_scale as f64)),
            ("quantity".to_string(), format!("{:.8}", size_i as f64 / size_scale as f64)),
            ("clientId".to_string(), coi.to_string()),
        ]);
        if post_only {
            params.insert("postOnly".to_string(), "true".to_string());
        }
        if reduce_only {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }

        let order = self.tracker.create(
            &self.venue,
            coi,
            Some(symbol.to_string()),
            Some(OrderSide::from_is_ask(is_ask)),
            Some(price_i),
            Some(size_i),
        );

        let body = match self.signed_request(Method::POST, "/api/v1/order", params, 1).await {
            Ok(body) => body,
            Err(err) => {
                order.apply_update(OrderEvent::new(crate::order::OrderState::Failed, now_ms() as f64 / 1000.0));
                return Err(err);
            }
        };

        if let Some(exchange_id) = body.get("id").and_then(|v| v.as_str()) {
            self.tracker.link_exchange_id(&order, exchange_id);
        }
        let event = OrderEvent::from_raw(&body, "rest", now_ms() as f64 / 1000.0);
        order.apply_update(event);
        Ok(order)
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
        let venue_symbol = self.symbols.to_venue(symbol, &self.venue, None).unwrap_or_else(|| symbol.to_string());
        let metadata = self.get_market_info(symbol).await.ok();
        let size_scale = metadata.as_ref().map(|m| m.size_scale()).unwrap_or(1_000_000);

        let side = if is_ask { "Ask" } else { "Bid" };
        let mut params = BTreeMap::from([
            ("symbol".to_string(), venue_symbol),
            ("side".to_string(), side.to_string()),
            ("orderType".to_string(), "Market".to_string()),
            ("quantity".to_string(), format!("{:.8}", size_i as f64 / size_scale as f64)),
            ("clientId".to_string(), coi.to_string()),
        ]);
        if reduce_only {
            params.insert("reduceOnly".to_string(), "true".to_string());
        }
        if let Some(slippage) = max_slippage {
            params.insert("slippageTolerance".to_string(), format!("{slippage:.4}"));
        }

        let order = self.tracker.create(
            &self.venue,
            coi,
            Some(symbol.to_string()),
            Some(OrderSide::from_is_ask(is_ask)),
            None,
            Some(size_i),
        );

        let body = match self.signed_request(Method::POST, "/api/v1/order", params, 1).await {
            Ok(body) => body,
            Err(err) => {
                order.apply_update(OrderEvent::new(crate::order::OrderState::Failed, now_ms() as f64 / 1000.0));
                return Err(err);
            }
        };

        if let Some(exchange_id) = body.get("id").and_then(|v| v.as_str()) {
            self.tracker.link_exchange_id(&order, exchange_id);
        }
        let event = OrderEvent::from_raw(&body, "rest", now_ms() as f64 / 1000.0);
        order.apply_update(event);
        Ok(order)
    }

    async fn cancel_order(&self, exchange_id: &str, symbol: Option<&str>) -> Result<(), ExecError> {
        let mut params = BTreeMap::from([("orderId".to_string(), exchange_id.to_string())]);
        if let Some(s) = symbol {
            let venue_symbol = self.symbols.to_venue(s, &self.venue, None).unwrap_or_else(|| s.to_string());
            params.insert("symbol".to_string(), venue_symbol);
        }
        self.signed_request(Method::DELETE, "/api/v1/order", params, 1).await?;
        Ok(())
    }

    async fn cancel_by_client_id(&self, symbol: &str, coi: u64) -> Result<(), ExecError> {
        let venue_symbol = self.symbols.to_venue(symbol, &self.venue, None).unwrap_or_else(|| symbol.to_string());
        let params = BTreeMap::from([
            ("symbol".to_string(), venue_symbol),
            ("clientId".to_string(), coi.to_string()),
        ]);
        self.signed_request(Method::DELETE, "/api/v1/order", params, 1).await?;
        Ok(())
    }

    async fn cancel_all(&self, symbol: Option<&str>) -> Result<(), ExecError> {
        let mut params = BTreeMap::new();
        if let Some(s) = symbol {
            let venue_symbol = self.symbols.to_venue(s, &self.venue, None).unwrap_or_else(|| s.to_string());
            params.insert("symbol".to_string(), venue_symbol);
        }
        match self.signed_request(Method::DELETE, "/api/v1/orders", params, 1).await {
            Ok(_) => Ok(()),
            Err(ExecError::Http { status, .. }) if status == 404 => {
                warn!(venue = %self.venue, "cancel_all endpoint unavailable, no fallback on this venue yet");
                Ok(())
            }
            Err(e) => Err(e),
        }
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

    #[test]
    fn message_matches_backpack_signing_scheme_with_params() {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), "SOL_USDC_PERP".to_string());
        params.insert("side".to_string(), "Bid".to_string());
        let message = build_message("orderExecute", &params, 1_700_000_000_000, 5000);
        assert_eq!(
            message,
            "instruction=orderExecute&side=Bid&symbol=SOL_USDC_PERP&timestamp=1700000000000&window=5000"
        );
    }

    #[test]
    fn message_without_params_omits_param_section() {
        let message = build_message("balanceQuery", &BTreeMap::new(), 1000, 5000);
        assert_eq!(message, "instruction=balanceQuery&timestamp=1000&window=5000");
    }

    #[test]
    fn instruction_mapping_matches_known_paths() {
        let connector = test_connector();
        assert_eq!(connector.instruction_for(&Method::POST, "/api/v1/order"), "orderExecute");
        assert_eq!(connector.instruction_for(&Method::DELETE, "/api/v1/order"), "orderCancel");
        assert_eq!(connector.instruction_for(&Method::DELETE, "/api/v1/orders"), "orderCancelAll");
        assert_eq!(connector.instruction_for(&Method::GET, "/api/v1/balances"), "balanceQuery");
    }

    #[test]
    fn ws_url_derives_from_rest_base_url() {
        assert_eq!(derive_ws_url("https://api.backpack.exchange"), "wss://ws.backpack.exchange");
    }

    #[test]
    fn depth_levels_parse_string_price_qty_pairs() {
        let body = serde_json::json!({
            "bids": [["100.5", "1.25"]],
            "asks": [["101.0", "2.0"]],
        });
        let (bids, asks) = parse_depth_levels(&body);
        assert_eq!(bids, vec![(100_500_000, 1_250_000)]);
        assert_eq!(asks, vec![(101_000_000, 2_000_000)]);
    }

    fn test_connector() -> Ed25519VenueConnector {
        let signing_key = SigningKey::from_bytes(&[7u8; 32]);
        let public_key = base64::engine::general_purpose::STANDARD.encode(signing_key.verifying_key().to_bytes());
        let credentials = Ed25519Credentials {
            api_key: public_key,
            api_secret: base64::engine::general_purpose::STANDARD.encode(signing_key.to_bytes()),
        };
        Ed25519VenueConnector::from_seed(
            "backpack",
            "https://api.backpack.exchange",
            &credentials,
            signing_key.to_bytes().to_vec(),
            Arc::new(SymbolMapper::new()),
            Arc::new(RateLimiter::new(1200)),
            Arc::new(CoiAllocator::new()),
            3.0,
        )
        .unwrap()
    }
}
