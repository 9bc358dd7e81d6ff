// =============================================================================
// Exchange adapters — one capability interface, per-venue variants
// =============================================================================
//
// No inheritance hierarchy: each variant implements the capability set and the
// generic variant reads its per-venue specialization from the data tables in
// `venues.rs`. The factory picks the variant by the venue's api_type.
// =============================================================================

pub mod dydx;
pub mod errors;
pub mod generic;
pub mod hyperliquid;
pub mod retry;
pub mod venues;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market_data::funding::FundingRate;
use crate::types::{OrderSide, OrderType};
use errors::{ExchangeError, ExchangeErrorKind};
use retry::AdapterHealth;
use venues::{ApiType, VenueSpec};

// =============================================================================
// Wire-level data carried between adapters and the rest of the engine
// =============================================================================

/// Decrypted credentials for one venue. Never logged, never serialized.
#[derive(Clone, Default)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
    pub wallet_address: String,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.api_key.is_empty() && self.wallet_address.is_empty()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceData {
    pub exchange: String,
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// Top-of-book depth summary for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiquidityData {
    pub exchange: String,
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub bid_depth_usd: Decimal,
    pub ask_depth_usd: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssetBalance {
    pub free: Decimal,
    pub used: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueBalanceData {
    pub total_usd: Decimal,
    pub balances: std::collections::HashMap<String, AssetBalance>,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
}

/// A position as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExchangePosition {
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub notional_usd: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub margin_mode: String,
}

/// An open order as the exchange reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawExchangeOrder {
    pub exchange_order_id: String,
    pub symbol: String,
    pub side: String,
    pub order_type: String,
    pub price: Decimal,
    pub amount: Decimal,
    pub filled: Decimal,
    pub remaining: Decimal,
    pub status: String,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    /// Average fill price when the venue reports one.
    pub fill_price: Option<Decimal>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: String,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Capability interface
// =============================================================================

/// The capability set every venue variant implements.
///
/// All operations are wrapped in the retry contract by the implementations;
/// callers see either a value or a classified `ExchangeError`.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn venue(&self) -> &'static VenueSpec;
    fn health(&self) -> AdapterHealth;
    fn reliability_score(&self) -> f64;

    async fn initialize(&self) -> Result<(), ExchangeError>;
    async fn close(&self) -> Result<(), ExchangeError>;

    /// Bounded unhealthy-adapter recovery: close, back off, re-initialize.
    async fn recover(&self) -> bool;

    async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, ExchangeError>;
    async fn get_prices(&self, symbols: &[String]) -> Result<Vec<PriceData>, ExchangeError>;
    async fn get_liquidity(&self, symbols: &[String]) -> Result<Vec<LiquidityData>, ExchangeError>;
    async fn get_balance(&self) -> Result<VenueBalanceData, ExchangeError>;
    async fn get_positions(&self) -> Result<Vec<RawExchangePosition>, ExchangeError>;
    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<RawExchangeOrder>, ExchangeError>;
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), ExchangeError>;
    async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError>;
    async fn get_min_order_size(&self, symbol: &str) -> Result<Option<Decimal>, ExchangeError>;
}

/// Build the adapter variant for a venue.
pub fn build_adapter(
    spec: &'static VenueSpec,
    credentials: Credentials,
    max_retries: u32,
) -> Arc<dyn ExchangeAdapter> {
    match spec.api_type {
        ApiType::Generic => Arc::new(generic::GenericAdapter::new(spec, credentials, max_retries)),
        ApiType::Native => {
            if spec.slug == "hyperliquid_futures" {
                Arc::new(hyperliquid::HyperliquidAdapter::new(
                    spec,
                    credentials,
                    max_retries,
                ))
            } else {
                Arc::new(dydx::DydxAdapter::new(spec, credentials, max_retries))
            }
        }
    }
}

/// Resolve a venue by any name and build a connected adapter, or fail with a
/// classified error the execution engine can surface.
pub async fn connect_adapter(
    name: &str,
    credentials: Credentials,
    max_retries: u32,
) -> Result<Arc<dyn ExchangeAdapter>, ExchangeError> {
    let slug = venues::normalize_slug(name);
    let spec = venues::venue_by_slug(&slug).ok_or_else(|| {
        ExchangeError::new(
            ExchangeErrorKind::InvalidSymbol,
            slug.clone(),
            format!("unknown venue '{name}'"),
        )
    })?;

    let adapter = build_adapter(spec, credentials, max_retries);
    adapter.initialize().await.map_err(|e| {
        ExchangeError::new(
            ExchangeErrorKind::ConnectionFailed,
            spec.slug,
            format!("initialize failed: {}", e.message),
        )
    })?;
    Ok(adapter)
}
