// =============================================================================
// Hyperliquid native adapter
// =============================================================================
//
// Hyperliquid's info endpoint is plain JSON-over-POST; order placement needs
// an EIP-712 signature over the action payload. The signing primitive is an
// external concern: this adapter builds the action and hands it to an
// `Eip712Signer`, never re-deriving chain-id or message-layout logic itself.
// =============================================================================

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::market_data::funding::{ticker_from_symbol, FundingRate, RateSource};
use crate::types::{OrderSide, OrderType};

use super::errors::{ExchangeError, ExchangeErrorKind};
use super::generic::{as_decimal, first_decimal, first_str};
use super::retry::{with_retry, AdapterHealth, HealthTracker};
use super::venues::{perp_symbol, VenueSpec};
use super::{
    Credentials, ExchangeAdapter, LiquidityData, OrderRequest, OrderResponse, PriceData,
    RawExchangeOrder, RawExchangePosition, Ticker, VenueBalanceData,
};

/// An EIP-712 signature as (r, s, v).
#[derive(Debug, Clone)]
pub struct Eip712Signature {
    pub r: String,
    pub s: String,
    pub v: u64,
}

/// External signing primitive. Implementations wrap a wallet key; the adapter
/// only supplies domain, types and message.
pub trait Eip712Signer: Send + Sync {
    fn sign_typed_data(
        &self,
        domain: &Value,
        types: &Value,
        message: &Value,
    ) -> Result<Eip712Signature, ExchangeError>;

    fn address(&self) -> String;
}

/// Native adapter for Hyperliquid perpetuals.
pub struct HyperliquidAdapter {
    spec: &'static VenueSpec,
    credentials: Credentials,
    signer: Option<Arc<dyn Eip712Signer>>,
    http: reqwest::Client,
    semaphore: Semaphore,
    health: HealthTracker,
}

impl HyperliquidAdapter {
    pub fn new(spec: &'static VenueSpec, credentials: Credentials, max_retries: u32) -> Self {
        Self {
            spec,
            credentials,
            signer: None,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            semaphore: Semaphore::new(spec.request_permits),
            health: HealthTracker::new(spec.slug, max_retries),
        }
    }

    /// Attach the external signing primitive, enabling order placement.
    pub fn with_signer(mut self, signer: Arc<dyn Eip712Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    async fn info(&self, request: Value) -> Result<Value, ExchangeError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            ExchangeError::new(ExchangeErrorKind::Internal, self.spec.slug, "semaphore closed")
        })?;

        let url = format!("{}/info", self.spec.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&request)
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

    fn wallet(&self) -> Result<&str, ExchangeError> {
        if self.credentials.wallet_address.is_empty() {
            Err(ExchangeError::new(
                ExchangeErrorKind::MissingCredentials,
                self.spec.slug,
                "no wallet address configured",
            ))
        } else {
            Ok(&self.credentials.wallet_address)
        }
    }

    fn coin(symbol: &str) -> String {
        ticker_from_symbol(symbol)
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn venue(&self) -> &'static VenueSpec {
        self.spec
    }

    fn health(&self) -> AdapterHealth {
        self.health.snapshot()
    }

    fn reliability_score(&self) -> f64 {
        self.health.reliability_score()
    }

    async fn initialize(&self) -> Result<(), ExchangeError> {
        with_retry(&self.health, "initialize", || async {
            self.info(json!({"type": "meta"})).await.map(|_| ())
        })
        .await?;
        debug!(venue = self.spec.slug, "adapter initialised");
        Ok(())
    }

    async fn close(&self) -> Result<(), ExchangeError> {
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

    /// Funding rates come from metaAndAssetCtxs: universe names zipped with
    /// per-asset contexts carrying the hourly funding rate.
    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, ExchangeError> {
        let body = with_retry(&self.health, "get_funding_rates", || async {
            self.info(json!({"type": "metaAndAssetCtxs"})).await
        })
        .await?;

        let universe = body
            .pointer("/0/universe")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let contexts = body
            .get(1)
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut rates = Vec::with_capacity(universe.len());
        let now = Utc::now();
        // Hourly funding settles on the hour.
        let next_funding = Utc
            .timestamp_opt((now.timestamp() / 3600 + 1) * 3600, 0)
            .single();

        for (asset, ctx) in universe.iter().zip(contexts.iter()) {
            let coin = match asset.get("name").and_then(|v| v.as_str()) {
                Some(c) => c,
                None => continue,
            };
            let rate = match ctx.get("funding").and_then(as_decimal) {
                Some(r) => r,
                None => continue,
            };

            let mut fr = FundingRate::new(
                self.spec.slug,
                perp_symbol(coin),
                rate,
                self.spec.funding_interval_hours,
                RateSource::ExchangeApi,
            );
            fr.next_funding_time = next_funding;
            rates.push(fr);
        }

        debug!(venue = self.spec.slug, count = rates.len(), "funding rates fetched");
        Ok(rates)
    }

    async fn get_prices(&self, symbols: &[String]) -> Result<Vec<PriceData>, ExchangeError> {
        let body = with_retry(&self.health, "get_prices", || async {
            self.info(json!({"type": "allMids"})).await
        })
        .await?;

        let mids = body.as_object().cloned().unwrap_or_default();
        let now = Utc::now();
        let mut out = Vec::new();
        for symbol in symbols {
            let coin = Self::coin(symbol);
            if let Some(price) = mids.get(&coin).and_then(as_decimal) {
                out.push(PriceData {
                    exchange: self.spec.slug.to_string(),
                    symbol: symbol.clone(),
                    price,
                    timestamp: now,
                });
            }
        }
        Ok(out)
    }

    async fn get_liquidity(&self, symbols: &[String]) -> Result<Vec<LiquidityData>, ExchangeError> {
        let mut out = Vec::new();
        for symbol in symbols {
            let coin = Self::coin(symbol);
            let body = with_retry(&self.health, "get_liquidity", || async {
                self.info(json!({"type": "l2Book", "coin": coin})).await
            })
            .await?;

            let levels = body.get("levels").and_then(|v| v.as_array());
            let (bids, asks) = match levels {
                Some(l) if l.len() >= 2 => (
                    l[0].as_array().cloned().unwrap_or_default(),
                    l[1].as_array().cloned().unwrap_or_default(),
                ),
                _ => continue,
            };
            if bids.is_empty() || asks.is_empty() {
                continue;
            }

            let px = |lvl: &Value| first_decimal(lvl, &["px"]);
            let sz = |lvl: &Value| first_decimal(lvl, &["sz"]);
            let best_bid = px(&bids[0]);
            let best_ask = px(&asks[0]);
            if best_bid <= Decimal::ZERO || best_bid >= best_ask {
                continue;
            }

            let depth = |levels: &[Value]| -> Decimal {
                levels.iter().take(10).map(|l| px(l) * sz(l)).sum()
            };

            out.push(LiquidityData {
                exchange: self.spec.slug.to_string(),
                symbol: symbol.clone(),
                best_bid,
                best_ask,
                bid_depth_usd: depth(&bids),
                ask_depth_usd: depth(&asks),
                timestamp: Utc::now(),
            });

            tokio::time::sleep(Duration::from_millis(150)).await;
        }
        Ok(out)
    }

    async fn get_balance(&self) -> Result<VenueBalanceData, ExchangeError> {
        let user = self.wallet()?.to_string();
        let body = with_retry(&self.health, "get_balance", || async {
            self.info(json!({"type": "clearinghouseState", "user": user}))
                .await
        })
        .await?;

        let mut data = VenueBalanceData::default();
        data.total_usd = body
            .pointer("/marginSummary/accountValue")
            .and_then(as_decimal)
            .unwrap_or(Decimal::ZERO);
        data.margin_used = body
            .pointer("/marginSummary/totalMarginUsed")
            .and_then(as_decimal)
            .unwrap_or(Decimal::ZERO);
        data.margin_available = (data.total_usd - data.margin_used).max(Decimal::ZERO);
        data.balances.insert(
            "USDC".to_string(),
            super::AssetBalance {
                free: data.margin_available,
                used: data.margin_used,
                total: data.total_usd,
            },
        );
        Ok(data)
    }

    async fn get_positions(&self) -> Result<Vec<RawExchangePosition>, ExchangeError> {
        let user = self.wallet()?.to_string();
        let body = with_retry(&self.health, "get_positions", || async {
            self.info(json!({"type": "clearinghouseState", "user": user}))
                .await
        })
        .await?;

        let mut positions = Vec::new();
        let asset_positions = body
            .get("assetPositions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for wrapper in &asset_positions {
            let pos = wrapper.get("position").unwrap_or(wrapper);
            let size = first_decimal(pos, &["szi"]);
            if size == Decimal::ZERO {
                continue;
            }
            let coin = first_str(pos, &["coin"]).unwrap_or_default();
            let entry = first_decimal(pos, &["entryPx"]);
            let liq = first_decimal(pos, &["liquidationPx"]);

            positions.push(RawExchangePosition {
                symbol: perp_symbol(coin),
                side: if size < Decimal::ZERO {
                    OrderSide::Short
                } else {
                    OrderSide::Long
                },
                size: size.abs(),
                notional_usd: first_decimal(pos, &["positionValue"]).abs(),
                entry_price: entry,
                mark_price: entry,
                unrealized_pnl: first_decimal(pos, &["unrealizedPnl"]),
                leverage: {
                    let l = pos.pointer("/leverage/value").and_then(as_decimal).unwrap_or(Decimal::ONE);
                    if l > Decimal::ZERO { l } else { Decimal::ONE }
                },
                liquidation_price: if liq > Decimal::ZERO { Some(liq) } else { None },
                margin_mode: "cross".to_string(),
            });
        }
        Ok(positions)
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<RawExchangeOrder>, ExchangeError> {
        let user = self.wallet()?.to_string();
        let body = with_retry(&self.health, "get_open_orders", || async {
            self.info(json!({"type": "openOrders", "user": user})).await
        })
        .await?;

        let wanted_coin = symbol.map(Self::coin);
        let mut orders = Vec::new();
        for entry in body.as_array().cloned().unwrap_or_default() {
            let coin = first_str(&entry, &["coin"]).unwrap_or_default().to_string();
            if let Some(wanted) = &wanted_coin {
                if &coin != wanted {
                    continue;
                }
            }
            let oid = entry
                .get("oid")
                .and_then(|v| v.as_i64())
                .map(|i| i.to_string())
                .unwrap_or_default();
            let amount = first_decimal(&entry, &["sz"]);
            orders.push(RawExchangeOrder {
                exchange_order_id: oid,
                symbol: perp_symbol(&coin),
                side: match first_str(&entry, &["side"]) {
                    Some("B") => "buy".to_string(),
                    Some("A") => "sell".to_string(),
                    other => other.unwrap_or("").to_lowercase(),
                },
                order_type: "limit".to_string(),
                price: first_decimal(&entry, &["limitPx"]),
                amount,
                filled: Decimal::ZERO,
                remaining: amount,
                status: "open".to_string(),
                created_at: None,
            });
        }
        Ok(orders)
    }

    /// Builds the order action and delegates the EIP-712 signature to the
    /// external signer. Placement is not retried.
    #[instrument(skip(self, request), fields(venue = self.spec.slug, symbol = %request.symbol))]
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        let signer = self.signer.as_ref().ok_or_else(|| {
            ExchangeError::new(
                ExchangeErrorKind::MissingCredentials,
                self.spec.slug,
                "EIP-712 signer not configured",
            )
        })?;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64;

        let action = json!({
            "type": "order",
            "orders": [{
                "coin": Self::coin(&request.symbol),
                "isBuy": request.side == OrderSide::Long,
                "sz": request.quantity.to_string(),
                "limitPx": request.price.map(|p| p.to_string()).unwrap_or_default(),
                "orderType": match request.order_type {
                    OrderType::Market => json!({"market": {}}),
                    OrderType::Limit => json!({"limit": {"tif": "Gtc"}}),
                },
                "reduceOnly": request.reduce_only,
            }],
            "grouping": "na",
        });

        let domain = json!({"name": "Exchange", "version": "1", "chainId": 1337});
        let types = json!({"Agent": [
            {"name": "source", "type": "string"},
            {"name": "connectionId", "type": "bytes32"},
        ]});
        let signature = signer.sign_typed_data(&domain, &types, &action)?;

        let payload = json!({
            "action": action,
            "nonce": nonce,
            "signature": {"r": signature.r, "s": signature.s, "v": signature.v},
        });

        let url = format!("{}/exchange", self.spec.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                self.health.record_error(&e.to_string());
                ExchangeError::from_http(self.spec.slug, &e)
            })?;

        let status = resp.status();
        let body: Value = resp.json().await.map_err(|e| {
            self.health.record_error(&e.to_string());
            ExchangeError::from_http(self.spec.slug, &e)
        })?;

        if !status.is_success() || body.get("status").and_then(|v| v.as_str()) == Some("err") {
            let err = ExchangeError::from_status(self.spec.slug, status, &body, self.spec.error_codes);
            self.health.record_error(&err.message);
            return Err(err);
        }

        self.health.record_success();
        let oid = body
            .pointer("/response/data/statuses/0/resting/oid")
            .or_else(|| body.pointer("/response/data/statuses/0/filled/oid"))
            .and_then(|v| v.as_i64())
            .map(|i| i.to_string())
            .unwrap_or_else(|| nonce.to_string());
        let avg_px = body
            .pointer("/response/data/statuses/0/filled/avgPx")
            .and_then(as_decimal);

        Ok(OrderResponse {
            order_id: oid,
            symbol: request.symbol.clone(),
            side: request.side,
            quantity: request.quantity,
            fill_price: avg_px,
            status: "filled".to_string(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError> {
        let _ = (symbol, order_id);
        // Cancels require the same signed-action path as placement.
        match &self.signer {
            Some(_) => Err(ExchangeError::new(
                ExchangeErrorKind::Internal,
                self.spec.slug,
                "cancel via signed action not wired for this venue",
            )),
            None => Err(ExchangeError::new(
                ExchangeErrorKind::MissingCredentials,
                self.spec.slug,
                "EIP-712 signer not configured",
            )),
        }
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let prices = self.get_prices(&[symbol.to_string()]).await?;
        let price = prices.first().ok_or_else(|| {
            ExchangeError::new(
                ExchangeErrorKind::InvalidSymbol,
                self.spec.slug,
                format!("no mid price for {symbol}"),
            )
        })?;

        Ok(Ticker {
            symbol: symbol.to_string(),
            last: price.price,
            bid: price.price,
            ask: price.price,
            volume: Decimal::ZERO,
            timestamp: price.timestamp,
        })
    }

    async fn get_min_order_size(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
        Ok(None)
    }
}

impl std::fmt::Debug for HyperliquidAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperliquidAdapter")
            .field("venue", &self.spec.slug)
            .field("signer", &self.signer.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::venues::venue_by_slug;

    #[test]
    fn coin_extraction() {
        assert_eq!(HyperliquidAdapter::coin("BTC/USDT:USDT"), "BTC");
        assert_eq!(HyperliquidAdapter::coin("ETH"), "ETH");
    }

    #[tokio::test]
    async fn place_order_without_signer_is_missing_credentials() {
        let spec = venue_by_slug("hyperliquid_futures").unwrap();
        let adapter = HyperliquidAdapter::new(spec, Credentials::default(), 3);
        let request = OrderRequest {
            symbol: "BTC/USDT:USDT".into(),
            side: OrderSide::Long,
            order_type: OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
            reduce_only: false,
        };
        let err = adapter.place_order(&request).await.unwrap_err();
        assert_eq!(err.kind, ExchangeErrorKind::MissingCredentials);
    }

    #[tokio::test]
    async fn balance_without_wallet_is_missing_credentials() {
        let spec = venue_by_slug("hyperliquid_futures").unwrap();
        let adapter = HyperliquidAdapter::new(spec, Credentials::default(), 3);
        let err = adapter.get_balance().await.unwrap_err();
        assert_eq!(err.kind, ExchangeErrorKind::MissingCredentials);
    }
}
