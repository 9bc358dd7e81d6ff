// =============================================================================
// dYdX v4 native adapter
// =============================================================================
//
// Read paths go through the public indexer REST API. Order placement on v4 is
// a Cosmos-signed transaction — an external concern like Hyperliquid's EIP-712
// path — so trading calls surface `missing_credentials` until a signer module
// is wired in deployment.
// =============================================================================

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, instrument};

use crate::market_data::funding::{ticker_from_symbol, FundingRate, RateSource};
use crate::types::OrderSide;

use super::errors::{ExchangeError, ExchangeErrorKind};
use super::generic::{as_decimal, first_decimal, first_str};
use super::retry::{with_retry, AdapterHealth, HealthTracker};
use super::venues::{perp_symbol, VenueSpec};
use super::{
    Credentials, ExchangeAdapter, LiquidityData, OrderRequest, OrderResponse, PriceData,
    RawExchangeOrder, RawExchangePosition, Ticker, VenueBalanceData,
};

pub struct DydxAdapter {
    spec: &'static VenueSpec,
    credentials: Credentials,
    http: reqwest::Client,
    semaphore: Semaphore,
    health: HealthTracker,
}

impl DydxAdapter {
    pub fn new(spec: &'static VenueSpec, credentials: Credentials, max_retries: u32) -> Self {
        Self {
            spec,
            credentials,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("failed to build reqwest client"),
            semaphore: Semaphore::new(spec.request_permits),
            health: HealthTracker::new(spec.slug, max_retries),
        }
    }

    async fn get(&self, path: &str) -> Result<Value, ExchangeError> {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            ExchangeError::new(ExchangeErrorKind::Internal, self.spec.slug, "semaphore closed")
        })?;

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

    /// dYdX markets are "BTC-USD"; internal form is "BTC/USDT:USDT".
    fn market(symbol: &str) -> String {
        format!("{}-USD", ticker_from_symbol(symbol))
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

    fn no_signer(&self) -> ExchangeError {
        ExchangeError::new(
            ExchangeErrorKind::MissingCredentials,
            self.spec.slug,
            "dYdX order signing module not configured",
        )
    }
}

#[async_trait]
impl ExchangeAdapter for DydxAdapter {
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
            self.get("/v4/perpetualMarkets").await.map(|_| ())
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

    #[instrument(skip(self), fields(venue = self.spec.slug))]
    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, ExchangeError> {
        let body = with_retry(&self.health, "get_funding_rates", || async {
            self.get("/v4/perpetualMarkets").await
        })
        .await?;

        let markets = body
            .get("markets")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let mut rates = Vec::with_capacity(markets.len());
        for (market, info) in &markets {
            let rate = match info.get("nextFundingRate").and_then(as_decimal) {
                Some(r) => r,
                None => continue,
            };
            rates.push(FundingRate::new(
                self.spec.slug,
                perp_symbol(&market.replace("-USD", "")),
                rate,
                self.spec.funding_interval_hours,
                RateSource::ExchangeApi,
            ));
        }

        debug!(venue = self.spec.slug, count = rates.len(), "funding rates fetched");
        Ok(rates)
    }

    async fn get_prices(&self, symbols: &[String]) -> Result<Vec<PriceData>, ExchangeError> {
        let body = with_retry(&self.health, "get_prices", || async {
            self.get("/v4/perpetualMarkets").await
        })
        .await?;

        let markets = body
            .get("markets")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let now = Utc::now();

        let mut out = Vec::new();
        for symbol in symbols {
            let market = Self::market(symbol);
            if let Some(price) = markets.get(&market).and_then(|m| m.get("oraclePrice")).and_then(as_decimal) {
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
            let path = format!("/v4/orderbooks/perpetualMarket/{}", Self::market(symbol));
            let body = with_retry(&self.health, "get_liquidity", || async {
                self.get(&path).await
            })
            .await?;

            let parse_levels = |key: &str| -> Vec<(Decimal, Decimal)> {
                body.get(key)
                    .and_then(|v| v.as_array())
                    .map(|levels| {
                        levels
                            .iter()
                            .take(10)
                            .map(|l| (first_decimal(l, &["price"]), first_decimal(l, &["size"])))
                            .collect()
                    })
                    .unwrap_or_default()
            };
            let bids = parse_levels("bids");
            let asks = parse_levels("asks");
            let (best_bid, best_ask) = match (bids.first(), asks.first()) {
                (Some(b), Some(a)) => (b.0, a.0),
                _ => continue,
            };
            if best_bid <= Decimal::ZERO || best_bid >= best_ask {
                continue;
            }

            let depth = |levels: &[(Decimal, Decimal)]| -> Decimal {
                levels.iter().map(|(p, s)| *p * *s).sum()
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
        let address = self.wallet()?.to_string();
        let path = format!("/v4/addresses/{address}");
        let body = with_retry(&self.health, "get_balance", || async { self.get(&path).await }).await?;

        let equity = body
            .pointer("/subaccounts/0/equity")
            .and_then(as_decimal)
            .unwrap_or(Decimal::ZERO);
        let free = body
            .pointer("/subaccounts/0/freeCollateral")
            .and_then(as_decimal)
            .unwrap_or(Decimal::ZERO);

        let mut data = VenueBalanceData {
            total_usd: equity,
            margin_used: (equity - free).max(Decimal::ZERO),
            margin_available: free,
            ..Default::default()
        };
        data.balances.insert(
            "USDC".to_string(),
            super::AssetBalance {
                free,
                used: data.margin_used,
                total: equity,
            },
        );
        Ok(data)
    }

    async fn get_positions(&self) -> Result<Vec<RawExchangePosition>, ExchangeError> {
        let address = self.wallet()?.to_string();
        let path = format!("/v4/perpetualPositions?address={address}&subaccountNumber=0&status=OPEN");
        let body = with_retry(&self.health, "get_positions", || async { self.get(&path).await }).await?;

        let mut positions = Vec::new();
        for entry in body
            .get("positions")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default()
        {
            let size = first_decimal(&entry, &["size"]);
            if size == Decimal::ZERO {
                continue;
            }
            let market = first_str(&entry, &["market"]).unwrap_or_default();
            let entry_price = first_decimal(&entry, &["entryPrice"]);

            positions.push(RawExchangePosition {
                symbol: perp_symbol(&market.replace("-USD", "")),
                side: match first_str(&entry, &["side"]) {
                    Some("SHORT") => OrderSide::Short,
                    Some("LONG") => OrderSide::Long,
                    _ => {
                        if size < Decimal::ZERO {
                            OrderSide::Short
                        } else {
                            OrderSide::Long
                        }
                    }
                },
                size: size.abs(),
                notional_usd: size.abs() * entry_price,
                entry_price,
                mark_price: entry_price,
                unrealized_pnl: first_decimal(&entry, &["unrealizedPnl"]),
                leverage: Decimal::ONE,
                liquidation_price: None,
                margin_mode: "cross".to_string(),
            });
        }
        Ok(positions)
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<RawExchangeOrder>, ExchangeError> {
        let address = self.wallet()?.to_string();
        let mut path = format!("/v4/orders?address={address}&subaccountNumber=0&status=OPEN");
        if let Some(s) = symbol {
            path.push_str(&format!("&ticker={}", Self::market(s)));
        }
        let body = with_retry(&self.health, "get_open_orders", || async { self.get(&path).await })
            .await?;

        let mut orders = Vec::new();
        for entry in body.as_array().cloned().unwrap_or_default() {
            let id = match first_str(&entry, &["id", "clientId"]) {
                Some(i) => i.to_string(),
                None => continue,
            };
            let market = first_str(&entry, &["ticker"]).unwrap_or_default();
            let amount = first_decimal(&entry, &["size"]);
            let filled = first_decimal(&entry, &["totalFilled"]);
            orders.push(RawExchangeOrder {
                exchange_order_id: id,
                symbol: perp_symbol(&market.replace("-USD", "")),
                side: first_str(&entry, &["side"]).unwrap_or("").to_lowercase(),
                order_type: first_str(&entry, &["type"]).unwrap_or("limit").to_lowercase(),
                price: first_decimal(&entry, &["price"]),
                amount,
                filled,
                remaining: (amount - filled).max(Decimal::ZERO),
                status: "open".to_string(),
                created_at: None,
            });
        }
        Ok(orders)
    }

    async fn place_order(&self, _request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
        Err(self.no_signer())
    }

    async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
        Err(self.no_signer())
    }

    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
        let prices = self.get_prices(&[symbol.to_string()]).await?;
        let price = prices.first().ok_or_else(|| {
            ExchangeError::new(
                ExchangeErrorKind::InvalidSymbol,
                self.spec.slug,
                format!("no oracle price for {symbol}"),
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

impl std::fmt::Debug for DydxAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DydxAdapter")
            .field("venue", &self.spec.slug)
            .field("credentials", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::venues::venue_by_slug;

    #[test]
    fn market_format() {
        assert_eq!(DydxAdapter::market("BTC/USDT:USDT"), "BTC-USD");
        assert_eq!(DydxAdapter::market("ETHUSDT"), "ETH-USD");
    }

    #[tokio::test]
    async fn trading_calls_require_signer() {
        let spec = venue_by_slug("dydx_futures").unwrap();
        let adapter = DydxAdapter::new(spec, Credentials::default(), 3);
        let request = OrderRequest {
            symbol: "BTC/USDT:USDT".into(),
            side: OrderSide::Long,
            order_type: crate::types::OrderType::Market,
            quantity: Decimal::ONE,
            price: None,
            reduce_only: false,
        };
        assert_eq!(
            adapter.place_order(&request).await.unwrap_err().kind,
            ExchangeErrorKind::MissingCredentials
        );
    }
}
