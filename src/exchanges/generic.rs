// =============================================================================
// Generic signed-REST adapter — the shared path for the CEX venues
// =============================================================================
//
// One HTTP client, two signing styles, and per-venue REST profiles held as
// data. The venue dialects (paths, response envelopes, field names, symbol
// formats) live in `RestProfile`; nothing here is subclassed.
//
// SECURITY: the secret key is never logged or serialized. Signed requests
// carry the API key as a header only.
// =============================================================================

use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use crate::market_data::funding::{FundingRate, RateSource};
use crate::types::{OrderSide, OrderType};

use super::errors::{ExchangeError, ExchangeErrorKind};
use super::retry::{with_retry, AdapterHealth, HealthTracker};
use super::venues::VenueSpec;
use super::{
    Credentials, ExchangeAdapter, LiquidityData, OrderRequest, OrderResponse, PriceData,
    RawExchangeOrder, RawExchangePosition, Ticker, VenueBalanceData,
};

type HmacSha256 = Hmac<Sha256>;

/// Recv-window for venues that use one (milliseconds).
const RECV_WINDOW: u64 = 5000;
/// Pause between per-symbol order-book scans to respect venue rate limits.
const BOOK_SCAN_PAUSE_MS: u64 = 150;
/// Order-book levels summed into the depth figure.
const DEPTH_LEVELS: usize = 10;

// -----------------------------------------------------------------------------
// Per-venue REST profiles
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum SignStyle {
    /// Signature appended to the query string (Binance family).
    Query,
    /// Signature carried in headers over timestamp+payload (Bybit/OKX family).
    Headers,
}

#[derive(Debug, Clone, Copy)]
enum SymbolStyle {
    /// "BTCUSDT"
    Concatenated,
    /// "BTC-USDT-SWAP"
    DashedSwap,
    /// "BTC_USDT"
    Underscored,
    /// "BTCUSDTM"
    ConcatenatedM,
}

/// The venue dialect for the shared REST path.
struct RestProfile {
    funding_path: &'static str,
    ticker_path: &'static str,
    depth_path: &'static str,
    balance_path: &'static str,
    positions_path: &'static str,
    open_orders_path: &'static str,
    order_path: &'static str,
    /// JSON pointer to the payload list inside the response envelope
    /// ("" = root).
    list_pointer: &'static str,
    symbol_field: &'static str,
    rate_field: &'static str,
    next_time_field: &'static str,
    sign_style: SignStyle,
    symbol_style: SymbolStyle,
    api_key_header: &'static str,
}

fn profile_for(slug: &str) -> RestProfile {
    match slug {
        "bybit_futures" => RestProfile {
            funding_path: "/v5/market/tickers?category=linear",
            ticker_path: "/v5/market/tickers?category=linear&symbol={symbol}",
            depth_path: "/v5/market/orderbook?category=linear&symbol={symbol}&limit=25",
            balance_path: "/v5/account/wallet-balance?accountType=UNIFIED",
            positions_path: "/v5/position/list?category=linear&settleCoin=USDT",
            open_orders_path: "/v5/order/realtime?category=linear&settleCoin=USDT",
            order_path: "/v5/order/create",
            list_pointer: "/result/list",
            symbol_field: "symbol",
            rate_field: "fundingRate",
            next_time_field: "nextFundingTime",
            sign_style: SignStyle::Headers,
            symbol_style: SymbolStyle::Concatenated,
            api_key_header: "X-BAPI-API-KEY",
        },
        "okex_futures" => RestProfile {
            funding_path: "/api/v5/public/funding-rate?instId=ANY",
            ticker_path: "/api/v5/market/ticker?instId={symbol}",
            depth_path: "/api/v5/market/books?instId={symbol}&sz=25",
            balance_path: "/api/v5/account/balance",
            positions_path: "/api/v5/account/positions",
            open_orders_path: "/api/v5/trade/orders-pending",
            order_path: "/api/v5/trade/order",
            list_pointer: "/data",
            symbol_field: "instId",
            rate_field: "fundingRate",
            next_time_field: "nextFundingTime",
            sign_style: SignStyle::Headers,
            symbol_style: SymbolStyle::DashedSwap,
            api_key_header: "OK-ACCESS-KEY",
        },
        "gate_futures" => RestProfile {
            funding_path: "/api/v4/futures/usdt/contracts",
            ticker_path: "/api/v4/futures/usdt/tickers?contract={symbol}",
            depth_path: "/api/v4/futures/usdt/order_book?contract={symbol}&limit=25",
            balance_path: "/api/v4/futures/usdt/accounts",
            positions_path: "/api/v4/futures/usdt/positions",
            open_orders_path: "/api/v4/futures/usdt/orders?status=open",
            order_path: "/api/v4/futures/usdt/orders",
            list_pointer: "",
            symbol_field: "name",
            rate_field: "funding_rate",
            next_time_field: "funding_next_apply",
            sign_style: SignStyle::Headers,
            symbol_style: SymbolStyle::Underscored,
            api_key_header: "KEY",
        },
        "kucoin_futures" => RestProfile {
            funding_path: "/api/v1/contracts/active",
            ticker_path: "/api/v1/ticker?symbol={symbol}",
            depth_path: "/api/v1/level2/depth20?symbol={symbol}",
            balance_path: "/api/v1/account-overview?currency=USDT",
            positions_path: "/api/v1/positions",
            open_orders_path: "/api/v1/orders?status=active",
            order_path: "/api/v1/orders",
            list_pointer: "/data",
            symbol_field: "symbol",
            rate_field: "fundingFeeRate",
            next_time_field: "nextFundingRateTime",
            sign_style: SignStyle::Headers,
            symbol_style: SymbolStyle::ConcatenatedM,
            api_key_header: "KC-API-KEY",
        },
        "bitget_futures" => RestProfile {
            funding_path: "/api/v2/mix/market/tickers?productType=USDT-FUTURES",
            ticker_path: "/api/v2/mix/market/ticker?productType=USDT-FUTURES&symbol={symbol}",
            depth_path: "/api/v2/mix/market/orderbook?productType=USDT-FUTURES&symbol={symbol}",
            balance_path: "/api/v2/mix/account/accounts?productType=USDT-FUTURES",
            positions_path: "/api/v2/mix/position/all-position?productType=USDT-FUTURES",
            open_orders_path: "/api/v2/mix/order/orders-pending?productType=USDT-FUTURES",
            order_path: "/api/v2/mix/order/place-order",
            list_pointer: "/data",
            symbol_field: "symbol",
            rate_field: "fundingRate",
            next_time_field: "nextFundingTime",
            sign_style: SignStyle::Headers,
            symbol_style: SymbolStyle::Concatenated,
            api_key_header: "ACCESS-KEY",
        },
        // binance_futures and anything unrecognized take the Binance dialect.
        _ => RestProfile {
            funding_path: "/fapi/v1/premiumIndex",
            ticker_path: "/fapi/v1/ticker/price?symbol={symbol}",
            depth_path: "/fapi/v1/depth?symbol={symbol}&limit=20",
            balance_path: "/fapi/v2/account",
            positions_path: "/fapi/v2/positionRisk",
            open_orders_path: "/fapi/v1/openOrders",
            order_path: "/fapi/v1/order",
            list_pointer: "",
            symbol_field: "symbol",
            rate_field: "lastFundingRate",
            next_time_field: "nextFundingTime",
            sign_style: SignStyle::Query,
            symbol_style: SymbolStyle::Concatenated,
            api_key_header: "X-MBX-APIKEY",
        },
    }
}

// -----------------------------------------------------------------------------
// Adapter
// -----------------------------------------------------------------------------

/// Shared signed-REST adapter for binance/bybit/okx/gate/kucoin/bitget.
pub struct GenericAdapter {
    spec: &'static VenueSpec,
    credentials: Credentials,
    profile: RestProfile,
    http: reqwest::Client,
    semaphore: Semaphore,
    health: HealthTracker,
}

impl GenericAdapter {
    pub fn new(spec: &'static VenueSpec, credentials: Credentials, max_retries: u32) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            spec,
            credentials,
            profile: profile_for(spec.slug),
            http,
            semaphore: Semaphore::new(spec.request_permits),
            health: HealthTracker::new(spec.slug, max_retries),
        }
    }

    // -------------------------------------------------------------------------
    // Signing helpers
    // -------------------------------------------------------------------------

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.credentials.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// Venue symbol from the internal "BASE/USDT:USDT" form.
    fn raw_symbol(&self, symbol: &str) -> String {
        let base = crate::market_data::funding::ticker_from_symbol(symbol);
        match self.profile.symbol_style {
            SymbolStyle::Concatenated => format!("{base}USDT"),
            SymbolStyle::DashedSwap => format!("{base}-USDT-SWAP"),
            SymbolStyle::Underscored => format!("{base}_USDT"),
            SymbolStyle::ConcatenatedM => format!("{base}USDTM"),
        }
    }

    /// Internal symbol from the venue's raw form.
    fn normalized_symbol(&self, raw: &str) -> String {
        super::venues::perp_symbol(&crate::market_data::funding::ticker_from_symbol(
            &raw.replace("-USDT-SWAP", "").replace("_USDT", "").replace("USDTM", "USDT"),
        ))
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn get_public(&self, path: &str) -> Result<Value, ExchangeError> {
        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExchangeError::new(ExchangeErrorKind::Internal, self.spec.slug, "semaphore closed"))?;

        let url = format!("{}{}", self.spec.base_url, path);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ExchangeError::from_http(self.spec.slug, &e))?;

        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::from_http(self.spec.slug, &e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_status(
                self.spec.slug,
                status,
                &body,
                self.spec.error_codes,
            ));
        }
        Ok(body)
    }

    async fn request_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        params: &str,
        body: Option<Value>,
    ) -> Result<Value, ExchangeError> {
        if self.credentials.api_key.is_empty() {
            return Err(ExchangeError::new(
                ExchangeErrorKind::MissingCredentials,
                self.spec.slug,
                "no API key configured",
            ));
        }

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| ExchangeError::new(ExchangeErrorKind::Internal, self.spec.slug, "semaphore closed"))?;

        let ts = Self::timestamp_ms();
        let mut request = match self.profile.sign_style {
            SignStyle::Query => {
                // Binance style: timestamp + recvWindow + signature in the query.
                let qs = if params.is_empty() {
                    format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
                } else {
                    format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
                };
                let signature = self.sign(&qs);
                let url = format!("{}{}?{}&signature={}", self.spec.base_url, path, qs, signature);
                self.http.request(method, &url)
            }
            SignStyle::Headers => {
                // Header style: sign timestamp + method + path + payload.
                let body_str = body
                    .as_ref()
                    .map(|b| b.to_string())
                    .unwrap_or_default();
                let url = if params.is_empty() {
                    format!("{}{}", self.spec.base_url, path)
                } else {
                    format!("{}{}?{}", self.spec.base_url, path, params)
                };
                let prehash = format!("{ts}{method}{path}{body_str}");
                let signature = self.sign(&prehash);
                let mut req = self
                    .http
                    .request(method, &url)
                    .header("ACCESS-SIGN", signature)
                    .header("ACCESS-TIMESTAMP", ts.to_string());
                if !self.credentials.passphrase.is_empty() {
                    req = req.header("ACCESS-PASSPHRASE", self.credentials.passphrase.clone());
                }
                req
            }
        };

        request = request.header(self.profile.api_key_header, self.credentials.api_key.clone());
        if let Some(b) = body {
            request = request.json(&b);
        }

        let resp = request
            .send()
            .await
            .map_err(|e| ExchangeError::from_http(self.spec.slug, &e))?;

        let status = resp.status();
        let payload: Value = resp
            .json()
            .await
            .map_err(|e| ExchangeError::from_http(self.spec.slug, &e))?;

        if !status.is_success() {
            return Err(ExchangeError::from_status(
                self.spec.slug,
                status,
                &payload,
                self.spec.error_codes,
            ));
        }
        Ok(payload)
    }

    fn list_at<'a>(&self, body: &'a Value) -> &'a [Value] {
        let target = if self.profile.list_pointer.is_empty() {
            body
        } else {
            body.pointer(self.profile.list_pointer).unwrap_or(body)
        };
        target.as_array().map(|a| a.as_slice()).unwrap_or(&[])
    }
}

// -----------------------------------------------------------------------------
// Lenient JSON parsing helpers (CCXT-style normalization)
// -----------------------------------------------------------------------------

/// Parse a value that may arrive as string or number into Decimal.
pub(crate) fn as_decimal(value: &Value) -> Option<Decimal> {
    if let Some(s) = value.as_str() {
        Decimal::from_str(s).ok()
    } else if let Some(f) = value.as_f64() {
        Decimal::from_f64(f)
    } else {
        None
    }
}

/// First present field from `keys`, as Decimal; zero when absent.
pub(crate) fn first_decimal(obj: &Value, keys: &[&str]) -> Decimal {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .filter_map(as_decimal)
        .next()
        .unwrap_or(Decimal::ZERO)
}

pub(crate) fn first_str<'a>(obj: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().filter_map(|k| obj.get(*k)).filter_map(|v| v.as_str()).next()
}

fn millis_to_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let ms = value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))?;
    if ms <= 0 {
        return None;
    }
    Utc.timestamp_millis_opt(ms).single()
}

// -----------------------------------------------------------------------------
// Capability implementation
// -----------------------------------------------------------------------------

#[async_trait]
impl ExchangeAdapter for GenericAdapter {
    fn venue(&self) -> &'static VenueSpec {
        self.spec
    }

    fn health(&self) -> AdapterHealth {
        self.health.snapshot()
    }

    fn reliability_score(&self) -> f64 {
        self.health.reliability_score()
    }

    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn initialize(&self) -> Result<(), ExchangeError> {
        // Public reachability probe; credentials are exercised lazily.
        with_retry(&self.health, "initialize", || async {
            self.get_public(self.profile.funding_path).await.map(|_| ())
        })
        .await?;
        debug!(venue = self.spec.slug, "adapter initialised");
        Ok(())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
        // reqwest clients close their pools on drop; nothing venue-side to do.
        Ok(())
    }

    async fn recover(&self) -> bool {
        super::retry::attempt_recovery(
            &self.health,
            || async { self.close().await },
            || async { self.initialize().await },
        )
        .await
    }

    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, ExchangeError> {
        let body = with_retry(&self.health, "get_funding_rates", || async {
            self.get_public(self.profile.funding_path).await
        })
        .await?;

        let mut rates = Vec::new();
        for entry in self.list_at(&body) {
            let raw_symbol = match entry.get(self.profile.symbol_field).and_then(|v| v.as_str()) {
                Some(s) => s,
                None => continue,
            };
            // Only USDT-margined perps are comparable cross-venue.
            if !raw_symbol.to_uppercase().contains("USDT") {
                continue;
            }
            let rate = match entry.get(self.profile.rate_field).and_then(as_decimal) {
                Some(r) => r,
                None => continue,
            };

            let mut fr = FundingRate::new(
                self.spec.slug,
                self.normalized_symbol(raw_symbol),
                rate,
                self.spec.funding_interval_hours,
                RateSource::ExchangeApi,
            );
            fr.next_funding_time = entry
                .get(self.profile.next_time_field)
                .and_then(millis_to_datetime);
            rates.push(fr);
        }

        debug!(venue = self.spec.slug, count = rates.len(), "funding rates fetched");
        Ok(rates)
    }

    async fn get_prices(&self, symbols: &[String]) -> Result<Vec<PriceData>, ExchangeError> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            match self.get_ticker(symbol).await {
                Ok(t) => out.push(PriceData {
                    exchange: self.spec.slug.to_string(),
                    symbol: symbol.clone(),
                    price: t.last,
                    timestamp: t.timestamp,
                }),
                Err(e) if e.is_transient() => {
                    warn!(venue = self.spec.slug, symbol = %symbol, error = %e.message, "price fetch skipped");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(Duration::from_millis(BOOK_SCAN_PAUSE_MS)).await;
        }
        Ok(out)
    }

    async fn get_liquidity(&self, symbols: &[String]) -> Result<Vec<LiquidityData>, ExchangeError> {
        let mut out = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let path = self
                .profile
                .depth_path
                .replace("{symbol}", &self.raw_symbol(symbol));

            let body = match with_retry(&self.health, "get_liquidity", || async {
                self.get_public(&path).await
            })
            .await
            {
                Ok(b) => b,
                Err(e) if e.is_transient() => {
                    warn!(venue = self.spec.slug, symbol = %symbol, error = %e.message, "book scan skipped");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let root = if self.profile.list_pointer.is_empty() {
                &body
            } else {
                body.pointer(self.profile.list_pointer).unwrap_or(&body)
            };
            let bids = root.get("bids").or_else(|| root.get("b")).and_then(|v| v.as_array());
            let asks = root.get("asks").or_else(|| root.get("a")).and_then(|v| v.as_array());
            let (bids, asks) = match (bids, asks) {
                (Some(b), Some(a)) if !b.is_empty() && !a.is_empty() => (b, a),
                _ => continue,
            };

            let level = |lvl: &Value, idx: usize| -> Decimal {
                lvl.as_array()
                    .and_then(|a| a.get(idx))
                    .and_then(as_decimal)
                    .unwrap_or(Decimal::ZERO)
            };
            let best_bid = level(&bids[0], 0);
            let best_ask = level(&asks[0], 0);
            // Crossed books are bad data, not liquidity.
            if best_bid <= Decimal::ZERO || best_ask <= Decimal::ZERO || best_bid >= best_ask {
                warn!(venue = self.spec.slug, symbol = %symbol, "crossed or empty book dropped");
                continue;
            }

            let depth = |levels: &[Value]| -> Decimal {
                levels
                    .iter()
                    .take(DEPTH_LEVELS)
                    .map(|lvl| level(lvl, 0) * level(lvl, 1))
                    .sum()
            };

            out.push(LiquidityData {
                exchange: self.spec.slug.to_string(),
                symbol: symbol.clone(),
                best_bid,
                best_ask,
                bid_depth_usd: depth(bids),
                ask_depth_usd: depth(asks),
                timestamp: Utc::now(),
            });

            tokio::time::sleep(Duration::from_millis(BOOK_SCAN_PAUSE_MS)).await;
        }
        Ok(out)
    }

    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn get_balance(&self) -> Result<VenueBalanceData, ExchangeError> {
        let body = with_retry(&self.health, "get_balance", || async {
            self.request_signed(reqwest::Method::GET, self.profile.balance_path, "", None)
                .await
        })
        .await?;

        let mut data = VenueBalanceData::default();
        // Binance-style: totalWalletBalance + assets[]; envelope styles fall
        // back to scanning any array of {asset/currency, free/available, ...}.
        if let Some(total) = body.get("totalWalletBalance").and_then(as_decimal) {
            data.total_usd = total;
        }
        data.margin_available = first_decimal(&body, &["availableBalance", "available"]);

        let assets = body
            .get("assets")
            .and_then(|v| v.as_array())
            .or_else(|| self.list_at(&body).first().and_then(|v| v.get("coin")).and_then(|v| v.as_array()))
            .cloned()
            .unwrap_or_default();

        for entry in &assets {
            let asset = match first_str(entry, &["asset", "currency", "coin"]) {
                Some(a) => a.to_string(),
                None => continue,
            };
            let free = first_decimal(entry, &["availableBalance", "free", "available", "walletBalance"]);
            let used = first_decimal(entry, &["initialMargin", "used", "locked"]);
            let total = first_decimal(entry, &["walletBalance", "total", "equity"]);
            if free > Decimal::ZERO || used > Decimal::ZERO || total > Decimal::ZERO {
                if data.total_usd == Decimal::ZERO && matches!(asset.as_str(), "USDT" | "USDC" | "USD") {
                    data.total_usd += total.max(free + used);
                }
                data.margin_used += used;
                data.balances.insert(asset, super::AssetBalance { free, used, total });
            }
        }

        debug!(venue = self.spec.slug, total_usd = %data.total_usd, "balance fetched");
        Ok(data)
    }

    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn get_positions(&self) -> Result<Vec<RawExchangePosition>, ExchangeError> {
        let body = with_retry(&self.health, "get_positions", || async {
            self.request_signed(reqwest::Method::GET, self.profile.positions_path, "", None)
                .await
        })
        .await?;

        let mut positions = Vec::new();
        for entry in self.list_at(&body) {
            let size = first_decimal(entry, &["positionAmt", "size", "contracts", "pos"]);
            if size == Decimal::ZERO {
                continue;
            }

            let raw_symbol = first_str(entry, &["symbol", "instId", "contract"]).unwrap_or_default();
            let side = match first_str(entry, &["side", "posSide", "holdSide"]) {
                Some(s) => OrderSide::parse(s).unwrap_or(if size < Decimal::ZERO {
                    OrderSide::Short
                } else {
                    OrderSide::Long
                }),
                None => {
                    if size < Decimal::ZERO {
                        OrderSide::Short
                    } else {
                        OrderSide::Long
                    }
                }
            };

            let entry_price = first_decimal(entry, &["entryPrice", "avgPrice", "avgEntryPrice", "entry_price"]);
            let mark_price = first_decimal(entry, &["markPrice", "marketPrice", "mark_price"]);
            let notional = {
                let n = first_decimal(entry, &["notional", "notionalUsd", "positionValue", "value"]).abs();
                if n > Decimal::ZERO {
                    n
                } else {
                    size.abs() * mark_price.max(entry_price)
                }
            };
            let liq = first_decimal(entry, &["liquidationPrice", "liqPrice", "liq_price"]);

            positions.push(RawExchangePosition {
                symbol: self.normalized_symbol(raw_symbol),
                side,
                size: size.abs(),
                notional_usd: notional,
                entry_price,
                mark_price,
                unrealized_pnl: first_decimal(entry, &["unRealizedProfit", "unrealisedPnl", "upl", "unrealized_pnl"]),
                leverage: {
                    let l = first_decimal(entry, &["leverage", "lever"]);
                    if l > Decimal::ZERO { l } else { Decimal::ONE }
                },
                liquidation_price: if liq > Decimal::ZERO { Some(liq) } else { None },
                margin_mode: first_str(entry, &["marginType", "marginMode", "mgnMode"])
                    .unwrap_or("cross")
                    .to_string(),
            });
        }

        debug!(venue = self.spec.slug, count = positions.len(), "positions fetched");
        Ok(positions)
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<RawExchangeOrder>, ExchangeError> {
        let params = symbol
            .map(|s| format!("symbol={}", self.raw_symbol(s)))
            .unwrap_or_default();

        let body = with_retry(&self.health, "get_open_orders", || async {
            self.request_signed(
                reqwest::Method::GET,
                self.profile.open_orders_path,
                &params,
                None,
            )
            .await
        })
        .await?;

        let mut orders = Vec::new();
        for entry in self.list_at(&body) {
            let order_id = match first_str(entry, &["orderId", "ordId", "id", "order_id"]) {
                Some(id) => id.to_string(),
                None => match entry.get("orderId").and_then(|v| v.as_i64()) {
                    Some(id) => id.to_string(),
                    None => continue,
                },
            };
            let raw_symbol = first_str(entry, &["symbol", "instId", "contract"]).unwrap_or_default();
            orders.push(RawExchangeOrder {
                exchange_order_id: order_id,
                symbol: self.normalized_symbol(raw_symbol),
                side: first_str(entry, &["side"]).unwrap_or("").to_lowercase(),
                order_type: first_str(entry, &["type", "ordType", "orderType"])
                    .unwrap_or("limit")
                    .to_lowercase(),
                price: first_decimal(entry, &["price", "px"]),
                amount: first_decimal(entry, &["origQty", "qty", "sz", "size", "amount"]),
                filled: first_decimal(entry, &["executedQty", "cumExecQty", "accFillSz", "filled"]),
                remaining: first_decimal(entry, &["leavesQty", "remaining"]),
                status: first_str(entry, &["status", "state", "orderStatus"])
                    .unwrap_or("open")
                    .to_lowercase(),
                created_at: entry.get("time").or_else(|| entry.get("cTime")).and_then(millis_to_datetime),
            });
        }
        Ok(orders)
    }

    #[instrument(skip(self, request), fields(venue = self.spec.slug, symbol = %request.symbol, side = %request.side))]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        // Order placement is never retried: the operator decides on failure.
        let raw_symbol = self.raw_symbol(&request.symbol);
        let side_word = match request.side {
            OrderSide::Long => "BUY",
            OrderSide::Short => "SELL",
        };

        let result = match self.profile.sign_style {
            SignStyle::Query => {
                let mut params = format!(
                    "symbol={raw_symbol}&side={side_word}&type={}&quantity={}",
                    match request.order_type {
                        OrderType::Market => "MARKET",
                        OrderType::Limit => "LIMIT",
                    },
                    request.quantity
                );
                if let Some(price) = request.price {
                    params.push_str(&format!("&price={price}&timeInForce=GTC"));
                }
                if request.reduce_only {
                    params.push_str("&reduceOnly=true");
                }
                self.request_signed(reqwest::Method::POST, self.profile.order_path, &params, None)
                    .await
            }
            SignStyle::Headers => {
                let mut body = serde_json::json!({
                    "symbol": raw_symbol,
                    "side": side_word,
                    "orderType": match request.order_type {
                        OrderType::Market => "Market",
                        OrderType::Limit => "Limit",
                    },
                    "qty": request.quantity.to_string(),
                    "reduceOnly": request.reduce_only,
                });
                if let Some(price) = request.price {
                    body["price"] = Value::String(price.to_string());
                }
                self.request_signed(reqwest::Method::POST, self.profile.order_path, "", Some(body))
                    .await
            }
        };

        match result {
            Ok(body) => {
                self.health.record_success();
                let root = if self.profile.list_pointer.is_empty() {
                    &body
                } else {
                    body.pointer("/result").or_else(|| body.pointer("/data")).unwrap_or(&body)
                };
                let order_id = first_str(root, &["orderId", "ordId", "id", "order_id"])
                    .map(|s| s.to_string())
                    .or_else(|| root.get("orderId").and_then(|v| v.as_i64()).map(|i| i.to_string()))
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let fill_price = {
                    let p = first_decimal(root, &["avgPrice", "avgPx", "price"]);
                    if p > Decimal::ZERO { Some(p) } else { None }
                };

                debug!(venue = self.spec.slug, order_id = %order_id, "order placed");
                Ok(OrderResponse {
                    order_id,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    quantity: request.quantity,
                    fill_price,
                    status: first_str(root, &["status", "state"]).unwrap_or("new").to_lowercase(),
                })
            }
            Err(e) => {
                self.health.record_error(&e.message);
                Err(e)
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let params = format!("symbol={}&orderId={order_id}", self.raw_symbol(symbol));
        with_retry(&self.health, "cancel_order", || async {
            self.request_signed(reqwest::Method::DELETE, self.profile.order_path, &params, None)
                .await
        })
        .await?;
        debug!(venue = self.spec.slug, order_id, "order cancelled");
        Ok(())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let path = self
            .profile
            .ticker_path
            .replace("{symbol}", &self.raw_symbol(symbol));

        let body = with_retry(&self.health, "get_ticker", || async {
            self.get_public(&path).await
        })
        .await?;

        let root = {
            let at_pointer = if self.profile.list_pointer.is_empty() {
                body.clone()
            } else {
                body.pointer(self.profile.list_pointer).cloned().unwrap_or(body.clone())
            };
            match at_pointer.as_array().and_then(|a| a.first().cloned()) {
                Some(first) => first,
                None => at_pointer,
            }
        };

        let last = first_decimal(&root, &["price", "lastPrice", "last", "lastPr"]);
        if last <= Decimal::ZERO {
            return Err(ExchangeError::new(
                ExchangeErrorKind::InvalidSymbol,
                self.spec.slug,
                format!("no price for {symbol}"),
            ));
        }

        Ok(Ticker {
            symbol: symbol.to_string(),
            last,
            bid: first_decimal(&root, &["bidPrice", "bid1Price", "bidPx", "highest_bid"]),
            ask: first_decimal(&root, &["askPrice", "ask1Price", "askPx", "lowest_ask"]),
            volume: first_decimal(&root, &["volume", "volume24h", "vol24h", "baseVolume"]),
            timestamp: Utc::now(),
        })
    }

    async fn get_min_order_size(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        // Venue metadata endpoints differ too much to chase here; the
        // executor's min-notional clamp covers the common $5 floors.
        Ok(None)
    }
}

impl std::fmt::Debug for GenericAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenericAdapter")
            .field("venue", &self.spec.slug)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::venues::venue_by_slug;

    fn adapter(slug: &str) -> GenericAdapter {
        GenericAdapter::new(venue_by_slug(slug).unwrap(), Credentials::default(), 3)
    }

    #[test]
    fn raw_symbol_per_venue_style() {
        assert_eq!(adapter("binance_futures").raw_symbol("BTC/USDT:USDT"), "BTCUSDT");
        assert_eq!(adapter("okex_futures").raw_symbol("BTC/USDT:USDT"), "BTC-USDT-SWAP");
        assert_eq!(adapter("gate_futures").raw_symbol("BTC/USDT:USDT"), "BTC_USDT");
        assert_eq!(adapter("kucoin_futures").raw_symbol("BTC/USDT:USDT"), "BTCUSDTM");
    }

    #[test]
    fn normalized_symbol_reverses_venue_forms() {
        assert_eq!(adapter("binance_futures").normalized_symbol("BTCUSDT"), "BTC/USDT:USDT");
        assert_eq!(adapter("okex_futures").normalized_symbol("ETH-USDT-SWAP"), "ETH/USDT:USDT");
        assert_eq!(adapter("gate_futures").normalized_symbol("SOL_USDT"), "SOL/USDT:USDT");
    }

    #[test]
    fn as_decimal_handles_strings_and_numbers() {
        assert_eq!(as_decimal(&serde_json::json!("0.0001")), Decimal::from_str("0.0001").ok());
        assert_eq!(as_decimal(&serde_json::json!(2.5)), Decimal::from_f64(2.5));
        assert_eq!(as_decimal(&serde_json::json!(null)), None);
    }

    #[test]
    fn signed_request_without_key_is_missing_credentials() {
        let a = adapter("binance_futures");
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let err = rt
            .block_on(a.request_signed(reqwest::Method::GET, "/fapi/v2/account", "", None))
            .unwrap_err();
        assert_eq!(err.kind, ExchangeErrorKind::MissingCredentials);
    }

    #[test]
    fn signature_is_stable_hex() {
        let mut creds = Credentials::default();
        creds.api_secret = "secret".into();
        let a = GenericAdapter::new(venue_by_slug("binance_futures").unwrap(), creds, 3);
        let sig = a.sign("symbol=BTCUSDT&timestamp=1");
        assert_eq!(sig.len(), 64);
        assert_eq!(sig, a.sign("symbol=BTCUSDT&timestamp=1"));
    }
}
