// =============================================================================
// Execution Engine — two-leg atomic order placement with rollback
// =============================================================================
//
// The two legs live on independent exchanges, so true atomicity is
// impossible; the engine approximates it: if the hedge leg fails after the
// primary leg filled, it immediately submits a reduce-only market order
// opposite to the primary. A failed rollback escalates to
// requires_manual_intervention.
//
// Order placement itself is never retried — the operator decides what happens
// after a terminal order error.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::bus::{EventBus, PositionEvent, PositionEventKind};
use crate::detector::{Opportunity, OpportunityStatus};
use crate::exchanges::errors::{ExchangeError, ExchangeErrorKind};
use crate::exchanges::venues::{normalize_slug, perp_symbol};
use crate::exchanges::{connect_adapter, ExchangeAdapter, OrderRequest, OrderResponse};
use crate::positions::{HealthStatus, LegType, Position, PositionStatus};
use crate::risk::RiskManager;
use crate::runtime_config::RuntimeConfig;
use crate::store::positions::new_leg;
use crate::store::Store;
use crate::types::OrderType;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

/// Successful two-leg execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionOutcome {
    pub position_id: String,
    pub opportunity_id: String,
    pub symbol: String,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub capital_usd: Decimal,
    pub leverage: u32,
    pub primary_order_id: String,
    pub hedge_order_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    NotNeeded,
    Completed,
    Failed,
}

/// Classified execution failure with per-leg detail.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFailure {
    pub kind: ExchangeErrorKind,
    pub message: String,
    pub primary_order_id: Option<String>,
    pub hedge_error: Option<String>,
    pub rollback: RollbackStatus,
    pub rollback_order_id: Option<String>,
    pub requires_manual_intervention: bool,
}

impl ExecutionFailure {
    fn simple(kind: ExchangeErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            primary_order_id: None,
            hedge_error: None,
            rollback: RollbackStatus::NotNeeded,
            rollback_order_id: None,
            requires_manual_intervention: false,
        }
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    store: Store,
    bus: EventBus,
    risk: Arc<RiskManager>,
    config: Arc<RwLock<RuntimeConfig>>,
    encryption_key: String,
    /// Per-opportunity locks: concurrent execute calls on the same id
    /// serialize here, and the loser fails the status gate.
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExecutionEngine {
    pub fn new(
        store: Store,
        bus: EventBus,
        risk: Arc<RiskManager>,
        config: Arc<RwLock<RuntimeConfig>>,
        encryption_key: String,
    ) -> Self {
        Self {
            store,
            bus,
            risk,
            config,
            encryption_key,
            locks: SyncMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, opportunity_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(opportunity_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn log_phase(&self, opportunity_id: &str, phase: &str, detail: serde_json::Value) {
        if let Err(e) = self.store.insert_execution_log(opportunity_id, phase, detail).await {
            warn!(opportunity_id, phase, error = %e, "failed to write execution log");
        }
    }

    async fn reject(&self, opportunity: &Opportunity, failure: ExecutionFailure) -> ExecutionFailure {
        if let Err(e) = self
            .store
            .update_opportunity_status(&opportunity.id, OpportunityStatus::Rejected)
            .await
        {
            warn!(error = %e, "failed to persist rejected status");
        }
        self.risk.record_execution_failure();
        failure
    }

    /// Execute a scored opportunity: place the primary leg, then the hedge,
    /// rolling the primary back if the hedge fails.
    pub async fn execute_opportunity(
        &self,
        opportunity_id: &str,
        size_usd: Option<Decimal>,
        leverage: Option<u32>,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let lock = self.lock_for(opportunity_id);
        let _guard = lock.lock().await;

        self.log_phase(
            opportunity_id,
            "execution_requested",
            json!({"size_usd": size_usd.map(|s| s.to_string()), "leverage": leverage}),
        )
        .await;

        // --- 1. Load & gate ---------------------------------------------------
        let opportunities = self
            .store
            .load_active_opportunities(Utc::now())
            .await
            .map_err(|e| ExecutionFailure::simple(ExchangeErrorKind::Internal, e.to_string()))?;
        let opportunity = opportunities
            .into_iter()
            .find(|o| o.id == opportunity_id)
            .ok_or_else(|| {
                ExecutionFailure::simple(
                    ExchangeErrorKind::Internal,
                    format!("opportunity {opportunity_id} not found, expired or terminal"),
                )
            })?;

        if !opportunity.status.can_transition_to(OpportunityStatus::Executing) {
            return Err(ExecutionFailure::simple(
                ExchangeErrorKind::Internal,
                format!("opportunity is {}, not executable", opportunity.status),
            ));
        }

        // --- 2. Resolve venues & credentials ---------------------------------
        let long_slug = normalize_slug(&opportunity.long_leg.exchange);
        let short_slug = normalize_slug(&opportunity.short_leg.exchange);

        let long_creds = self
            .store
            .get_credentials(&long_slug, &self.encryption_key)
            .await
            .ok()
            .flatten();
        let short_creds = self
            .store
            .get_credentials(&short_slug, &self.encryption_key)
            .await
            .ok()
            .flatten();
        let (long_creds, short_creds) = match (long_creds, short_creds) {
            (Some(l), Some(s)) => (l, s),
            _ => {
                let failure = ExecutionFailure::simple(
                    ExchangeErrorKind::MissingCredentials,
                    format!("credentials missing for {long_slug} and/or {short_slug}"),
                );
                self.log_phase(opportunity_id, "rejected", json!({"reason": failure.message}))
                    .await;
                return Err(self.reject(&opportunity, failure).await);
            }
        };

        // --- 3. Capital & status -> executing ---------------------------------
        let config = self.config.read().clone();
        let capital = size_usd
            .or({
                if opportunity.recommended_size_usd > Decimal::ZERO {
                    Some(opportunity.recommended_size_usd)
                } else {
                    None
                }
            })
            .unwrap_or_else(|| {
                Decimal::try_from(config.default_position_size_usd)
                    .unwrap_or_else(|_| Decimal::from(100))
            });
        let leverage = leverage.unwrap_or(config.default_leverage).max(1);

        if let Err(e) = self
            .store
            .update_opportunity_status(opportunity_id, OpportunityStatus::Executing)
            .await
        {
            warn!(error = %e, "failed to persist executing status");
        }

        // --- 4. Connect adapters ----------------------------------------------
        let max_retries = config.max_retries;
        let primary_adapter = match connect_adapter(&long_slug, long_creds, max_retries).await {
            Ok(a) => a,
            Err(e) => {
                let failure = ExecutionFailure::simple(
                    ExchangeErrorKind::ConnectionFailed,
                    format!("{long_slug}: {}", e.message),
                );
                self.log_phase(opportunity_id, "rejected", json!({"reason": failure.message}))
                    .await;
                return Err(self.reject(&opportunity, failure).await);
            }
        };
        let hedge_adapter = match connect_adapter(&short_slug, short_creds, max_retries).await {
            Ok(a) => a,
            Err(e) => {
                let _ = primary_adapter.close().await;
                let failure = ExecutionFailure::simple(
                    ExchangeErrorKind::ConnectionFailed,
                    format!("{short_slug}: {}", e.message),
                );
                self.log_phase(opportunity_id, "rejected", json!({"reason": failure.message}))
                    .await;
                return Err(self.reject(&opportunity, failure).await);
            }
        };

        let result = self
            .run_protocol(
                &opportunity,
                capital,
                leverage,
                primary_adapter.clone(),
                hedge_adapter.clone(),
            )
            .await;

        let _ = primary_adapter.close().await;
        let _ = hedge_adapter.close().await;

        match result {
            Ok(outcome) => {
                self.risk.record_execution_success();
                Ok(outcome)
            }
            Err(failure) => Err(self.reject(&opportunity, failure).await),
        }
    }

    async fn run_protocol(
        &self,
        opportunity: &Opportunity,
        capital: Decimal,
        leverage: u32,
        primary_adapter: Arc<dyn ExchangeAdapter>,
        hedge_adapter: Arc<dyn ExchangeAdapter>,
    ) -> Result<ExecutionOutcome, ExecutionFailure> {
        let symbol = perp_symbol(&opportunity.symbol);
        let opportunity_id = opportunity.id.as_str();

        // --- 5. Size the order -------------------------------------------------
        let ticker = primary_adapter.get_ticker(&symbol).await.map_err(|e| {
            ExecutionFailure::simple(e.kind, format!("ticker failed: {}", e.message))
        })?;
        let current_price = ticker.last;
        if current_price <= Decimal::ZERO {
            return Err(ExecutionFailure::simple(
                ExchangeErrorKind::DataValidation,
                "non-positive ticker price",
            ));
        }

        let notional = capital * Decimal::from(leverage);
        let min_notional = Decimal::try_from(self.config.read().min_notional_usd)
            .unwrap_or_else(|_| Decimal::from(6));
        let effective_notional = notional.max(min_notional);
        let quantity = effective_notional / current_price;

        self.log_phase(
            opportunity_id,
            "sized",
            json!({
                "capital_usd": capital.to_string(),
                "leverage": leverage,
                "price": current_price.to_string(),
                "quantity": quantity.to_string(),
                "notional_usd": effective_notional.to_string(),
            }),
        )
        .await;

        // --- 6. Primary leg ----------------------------------------------------
        let primary_request = OrderRequest {
            symbol: symbol.clone(),
            side: opportunity.long_leg.side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
        };
        self.log_phase(
            opportunity_id,
            "placing_primary_order",
            json!({"exchange": primary_adapter.venue().slug, "side": primary_request.side, "quantity": quantity.to_string()}),
        )
        .await;

        let primary_order: OrderResponse = match primary_adapter.place_order(&primary_request).await
        {
            Ok(order) => {
                self.log_phase(
                    opportunity_id,
                    "primary_order_result",
                    json!({"success": true, "order_id": order.order_id}),
                )
                .await;
                order
            }
            Err(e) => {
                self.log_phase(
                    opportunity_id,
                    "primary_order_result",
                    json!({"success": false, "error": e.message, "kind": e.kind.to_string()}),
                )
                .await;
                error!(opportunity_id, error = %e.message, "primary leg failed");
                return Err(ExecutionFailure::simple(
                    e.kind,
                    format!("primary leg failed: {}", e.message),
                ));
            }
        };

        // --- 7. Hedge leg (+ rollback on failure) ------------------------------
        let hedge_request = OrderRequest {
            symbol: symbol.clone(),
            side: opportunity.short_leg.side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            reduce_only: false,
        };
        self.log_phase(
            opportunity_id,
            "placing_hedge_order",
            json!({"exchange": hedge_adapter.venue().slug, "side": hedge_request.side, "quantity": quantity.to_string()}),
        )
        .await;

        let hedge_order: OrderResponse = match hedge_adapter.place_order(&hedge_request).await {
            Ok(order) => {
                self.log_phase(
                    opportunity_id,
                    "hedge_order_result",
                    json!({"success": true, "order_id": order.order_id}),
                )
                .await;
                order
            }
            Err(hedge_err) => {
                self.log_phase(
                    opportunity_id,
                    "hedge_order_result",
                    json!({"success": false, "error": hedge_err.message, "kind": hedge_err.kind.to_string()}),
                )
                .await;
                error!(opportunity_id, error = %hedge_err.message, "hedge leg failed, rolling back primary");

                return Err(self
                    .rollback_primary(
                        opportunity_id,
                        &primary_adapter,
                        &primary_request,
                        &primary_order,
                        hedge_err,
                    )
                    .await);
            }
        };

        // --- 8. Persist position + legs, flip opportunity, announce ------------
        let entry_price = primary_order.fill_price.unwrap_or(current_price);
        let hedge_entry_price = hedge_order.fill_price.unwrap_or(current_price);

        let mut position = Position::new(symbol.clone(), Some(opportunity.id.clone()));
        position.status = PositionStatus::Active;
        position.health_status = HealthStatus::Healthy;
        position.total_capital_deployed = capital * Decimal::from(2);
        position.opened_at = Some(Utc::now());
        {
            let cfg = self.config.read();
            position.exit_policy.target_funding_rate_min =
                Decimal::try_from(cfg.target_funding_rate_min)
                    .unwrap_or(position.exit_policy.target_funding_rate_min);
            position.exit_policy.max_hold_periods = cfg.max_hold_periods;
        }

        let mut primary_leg = new_leg(
            &position.id,
            LegType::Primary,
            primary_adapter.venue().slug,
            &symbol,
            opportunity.long_leg.side,
            quantity,
            entry_price,
            quantity * entry_price,
            Decimal::from(leverage),
        );
        primary_leg.entry_order_ids.push(primary_order.order_id.clone());

        let mut hedge_leg = new_leg(
            &position.id,
            LegType::Hedge,
            hedge_adapter.venue().slug,
            &symbol,
            opportunity.short_leg.side,
            quantity,
            hedge_entry_price,
            quantity * hedge_entry_price,
            Decimal::from(leverage),
        );
        hedge_leg.entry_order_ids.push(hedge_order.order_id.clone());

        position.legs = vec![primary_leg, hedge_leg];
        position.update_metrics();

        // Position, legs and the opportunity's `executed` flip commit
        // together; if that write fails with both legs already filled, the
        // operator has to reconcile by hand.
        self.store
            .insert_position_with_opportunity(&position, opportunity_id)
            .await
            .map_err(|e| ExecutionFailure {
                kind: ExchangeErrorKind::Internal,
                message: format!("both legs filled but persisting the position failed: {e}"),
                primary_order_id: Some(primary_order.order_id.clone()),
                hedge_error: None,
                rollback: RollbackStatus::NotNeeded,
                rollback_order_id: None,
                requires_manual_intervention: true,
            })?;

        self.log_phase(
            opportunity_id,
            "position_created",
            json!({
                "position_id": position.id,
                "primary_order_id": primary_order.order_id,
                "hedge_order_id": hedge_order.order_id,
            }),
        )
        .await;

        let _ = self
            .store
            .insert_audit_action(
                "execution-engine",
                "open_position",
                "position",
                &position.id,
                json!({
                    "opportunity_id": opportunity_id,
                    "capital_usd": capital.to_string(),
                    "leverage": leverage,
                }),
            )
            .await;

        self.bus.publish_position(PositionEvent {
            kind: PositionEventKind::Opened,
            position_id: position.id.clone(),
            opportunity_id: Some(opportunity.id.clone()),
            symbol: opportunity.symbol.clone(),
            capital_usd: position.total_capital_deployed,
            long_exchange: primary_adapter.venue().slug.to_string(),
            short_exchange: hedge_adapter.venue().slug.to_string(),
            exit_reason: None,
            timestamp: Utc::now(),
        });

        info!(
            opportunity_id,
            position_id = %position.id,
            symbol = %symbol,
            quantity = %quantity,
            "two-leg position opened"
        );

        Ok(ExecutionOutcome {
            position_id: position.id,
            opportunity_id: opportunity.id.clone(),
            symbol: opportunity.symbol.clone(),
            quantity,
            entry_price,
            capital_usd: capital,
            leverage,
            primary_order_id: primary_order.order_id,
            hedge_order_id: hedge_order.order_id,
        })
    }

    /// Hedge failed after the primary filled: reduce-only opposite order on
    /// the primary exchange returns the book to flat.
    async fn rollback_primary(
        &self,
        opportunity_id: &str,
        primary_adapter: &Arc<dyn ExchangeAdapter>,
        primary_request: &OrderRequest,
        primary_order: &OrderResponse,
        hedge_err: ExchangeError,
    ) -> ExecutionFailure {
        self.log_phase(
            opportunity_id,
            "rollback_started",
            json!({"exchange": primary_adapter.venue().slug, "order_id": primary_order.order_id}),
        )
        .await;

        let rollback_request = OrderRequest {
            symbol: primary_request.symbol.clone(),
            side: primary_request.side.opposite(),
            order_type: OrderType::Market,
            quantity: primary_request.quantity,
            price: None,
            reduce_only: true,
        };

        match primary_adapter.place_order(&rollback_request).await {
            Ok(rollback_order) => {
                self.log_phase(
                    opportunity_id,
                    "rollback_result",
                    json!({"status": "completed", "order_id": rollback_order.order_id}),
                )
                .await;
                info!(opportunity_id, rollback_order_id = %rollback_order.order_id, "rollback completed");
                ExecutionFailure {
                    kind: hedge_err.kind,
                    message: format!("hedge leg failed: {}", hedge_err.message),
                    primary_order_id: Some(primary_order.order_id.clone()),
                    hedge_error: Some(hedge_err.message),
                    rollback: RollbackStatus::Completed,
                    rollback_order_id: Some(rollback_order.order_id),
                    requires_manual_intervention: false,
                }
            }
            Err(rollback_err) => {
                self.log_phase(
                    opportunity_id,
                    "rollback_result",
                    json!({"status": "failed", "error": rollback_err.message}),
                )
                .await;
                error!(
                    opportunity_id,
                    error = %rollback_err.message,
                    "ROLLBACK FAILED — manual intervention required"
                );
                ExecutionFailure {
                    kind: hedge_err.kind,
                    message: format!(
                        "hedge leg failed ({}) and rollback failed ({})",
                        hedge_err.message, rollback_err.message
                    ),
                    primary_order_id: Some(primary_order.order_id.clone()),
                    hedge_error: Some(hedge_err.message),
                    rollback: RollbackStatus::Failed,
                    rollback_order_id: None,
                    requires_manual_intervention: true,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::scorer::UosBreakdown;
    use crate::detector::OpportunityLeg;
    use crate::exchanges::retry::{AdapterHealth, HealthTracker};
    use crate::exchanges::venues::{venue_by_slug, VenueSpec};
    use crate::exchanges::{
        LiquidityData, PriceData, RawExchangeOrder, RawExchangePosition, Ticker, VenueBalanceData,
    };
    use crate::market_data::funding::{FundingRate, RateSource};
    use crate::risk::RiskLimits;
    use crate::types::OrderSide;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;

    #[test]
    fn failure_display_carries_kind_and_message() {
        let f = ExecutionFailure::simple(ExchangeErrorKind::InsufficientBalance, "margin too low");
        assert_eq!(f.to_string(), "insufficient_balance: margin too low");
        assert_eq!(f.rollback, RollbackStatus::NotNeeded);
        assert!(!f.requires_manual_intervention);
    }

    // -------------------------------------------------------------------------
    // Scripted adapter for protocol tests
    // -------------------------------------------------------------------------

    struct MockAdapter {
        spec: &'static VenueSpec,
        ticker_price: Decimal,
        order_results: SyncMutex<VecDeque<Result<OrderResponse, ExchangeError>>>,
        placed: SyncMutex<Vec<OrderRequest>>,
        health: HealthTracker,
    }

    impl MockAdapter {
        fn new(
            slug: &str,
            ticker_price: Decimal,
            order_results: Vec<Result<OrderResponse, ExchangeError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                spec: venue_by_slug(slug).unwrap(),
                ticker_price,
                order_results: SyncMutex::new(order_results.into()),
                placed: SyncMutex::new(Vec::new()),
                health: HealthTracker::new(slug, 3),
            })
        }

        fn order(id: &str, quantity: Decimal) -> OrderResponse {
            OrderResponse {
                order_id: id.to_string(),
                symbol: "BTC/USDT:USDT".into(),
                side: OrderSide::Long,
                quantity,
                fill_price: None,
                status: "filled".into(),
            }
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockAdapter {
        fn venue(&self) -> &'static VenueSpec {
            self.spec
        }
        fn health(&self) -> AdapterHealth {
            self.health.snapshot()
        }
        fn reliability_score(&self) -> f64 {
            1.0
        }
        async fn initialize(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn close(&self) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn recover(&self) -> bool {
            true
        }
        async fn get_funding_rates(&self) -> Result<Vec<FundingRate>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_prices(&self, _symbols: &[String]) -> Result<Vec<PriceData>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_liquidity(
            &self,
            _symbols: &[String],
        ) -> Result<Vec<LiquidityData>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_balance(&self) -> Result<VenueBalanceData, ExchangeError> {
            Ok(VenueBalanceData::default())
        }
        async fn get_positions(&self) -> Result<Vec<RawExchangePosition>, ExchangeError> {
            Ok(vec![])
        }
        async fn get_open_orders(
            &self,
            _symbol: Option<&str>,
        ) -> Result<Vec<RawExchangeOrder>, ExchangeError> {
            Ok(vec![])
        }
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderResponse, ExchangeError> {
            self.placed.lock().push(request.clone());
            self.order_results
                .lock()
                .pop_front()
                .unwrap_or_else(|| {
                    Err(ExchangeError::new(
                        ExchangeErrorKind::Internal,
                        self.spec.slug,
                        "no scripted result",
                    ))
                })
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), ExchangeError> {
            Ok(())
        }
        async fn get_ticker(&self, symbol: &str) -> Result<Ticker, ExchangeError> {
            Ok(Ticker {
                symbol: symbol.to_string(),
                last: self.ticker_price,
                bid: self.ticker_price,
                ask: self.ticker_price,
                volume: Decimal::ZERO,
                timestamp: Utc::now(),
            })
        }
        async fn get_min_order_size(&self, _symbol: &str) -> Result<Option<Decimal>, ExchangeError> {
            Ok(None)
        }
    }

    fn engine(store: Store) -> ExecutionEngine {
        ExecutionEngine::new(
            store,
            EventBus::new(),
            Arc::new(RiskManager::new(RiskLimits::default())),
            Arc::new(RwLock::new(RuntimeConfig::default())),
            "test-key".to_string(),
        )
    }

    fn opportunity() -> Opportunity {
        Opportunity {
            id: "opp-1".to_string(),
            symbol: "BTC".into(),
            base_asset: "BTC".into(),
            status: OpportunityStatus::Detected,
            long_leg: OpportunityLeg {
                exchange: "binance_futures".into(),
                side: OrderSide::Long,
                funding_rate: dec!(0.0001),
                estimated_slippage_pct: dec!(0.1),
            },
            short_leg: OpportunityLeg {
                exchange: "bybit_futures".into(),
                side: OrderSide::Short,
                funding_rate: dec!(0.0003),
                estimated_slippage_pct: dec!(0.1),
            },
            funding_spread: dec!(0.0002),
            funding_spread_pct: dec!(0.02),
            estimated_net_apr: dec!(21.9),
            uos: UosBreakdown {
                return_score: 20,
                risk_score: 25,
                execution_score: 20,
                timing_score: 12,
            },
            recommended_size_usd: dec!(1000),
            data_source: RateSource::ExchangeApi,
            detected_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn happy_path_opens_two_leg_position() {
        let store = Store::open_in_memory().unwrap();
        let engine = engine(store.clone());
        let opp = opportunity();
        store.upsert_opportunity(&opp).await.unwrap();

        let mut position_events = engine.bus.subscribe_position();

        let primary = MockAdapter::new(
            "binance_futures",
            dec!(30000),
            vec![Ok(MockAdapter::order("BIN-1", dec!(0.1)))],
        );
        let hedge = MockAdapter::new(
            "bybit_futures",
            dec!(30000),
            vec![Ok(MockAdapter::order("BYB-1", dec!(0.1)))],
        );

        let outcome = engine
            .run_protocol(&opp, dec!(1000), 3, primary.clone(), hedge.clone())
            .await
            .unwrap();

        // quantity = 1000 * 3 / 30000 = 0.1
        assert_eq!(outcome.quantity, dec!(0.1));
        assert_eq!(outcome.primary_order_id, "BIN-1");
        assert_eq!(outcome.hedge_order_id, "BYB-1");

        let position = store
            .load_position(&outcome.position_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(position.status, PositionStatus::Active);
        assert_eq!(position.legs.len(), 2);
        assert_ne!(position.legs[0].side, position.legs[1].side);
        assert_eq!(position.opportunity_id.as_deref(), Some("opp-1"));

        // Both orders were plain (not reduce-only) market orders.
        assert!(!primary.placed.lock()[0].reduce_only);
        assert!(!hedge.placed.lock()[0].reduce_only);

        let event = position_events.try_recv().unwrap();
        assert_eq!(event.kind, PositionEventKind::Opened);
        assert_eq!(event.opportunity_id.as_deref(), Some("opp-1"));

        // The opportunity flipped to executed in the same transaction as the
        // position insert, so it no longer loads as active.
        assert!(store
            .load_active_opportunities(Utc::now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn hedge_failure_rolls_back_primary_and_logs_the_protocol() {
        let store = Store::open_in_memory().unwrap();
        let engine = engine(store.clone());
        let opp = opportunity();
        store.upsert_opportunity(&opp).await.unwrap();

        // Primary: entry fill BIN-1, then rollback fill BIN-2.
        let primary = MockAdapter::new(
            "binance_futures",
            dec!(30000),
            vec![
                Ok(MockAdapter::order("BIN-1", dec!(0.1))),
                Ok(MockAdapter::order("BIN-2", dec!(0.1))),
            ],
        );
        let hedge = MockAdapter::new(
            "bybit_futures",
            dec!(30000),
            vec![Err(ExchangeError::new(
                ExchangeErrorKind::InsufficientBalance,
                "bybit_futures",
                "insufficient balance",
            ))],
        );

        let failure = engine
            .run_protocol(&opp, dec!(1000), 3, primary.clone(), hedge.clone())
            .await
            .unwrap_err();

        assert_eq!(failure.kind, ExchangeErrorKind::InsufficientBalance);
        assert_eq!(failure.primary_order_id.as_deref(), Some("BIN-1"));
        assert_eq!(failure.rollback, RollbackStatus::Completed);
        assert_eq!(failure.rollback_order_id.as_deref(), Some("BIN-2"));
        assert!(!failure.requires_manual_intervention);

        // The rollback order is reduce-only and opposite to the entry.
        let placed = primary.placed.lock();
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].side, OrderSide::Long);
        assert_eq!(placed[1].side, OrderSide::Short);
        assert!(placed[1].reduce_only);
        assert_eq!(placed[1].quantity, placed[0].quantity);
        drop(placed);

        // No position row was created.
        assert!(store.load_open_positions().await.unwrap().is_empty());

        // The execution log tells the whole story, in order.
        let logs = store.list_execution_logs("opp-1").await.unwrap();
        let phases: Vec<&str> = logs.iter().filter_map(|l| l["phase"].as_str()).collect();
        assert_eq!(
            phases,
            vec![
                "sized",
                "placing_primary_order",
                "primary_order_result",
                "placing_hedge_order",
                "hedge_order_result",
                "rollback_started",
                "rollback_result",
            ]
        );
        assert_eq!(logs[2]["detail"]["success"], true);
        assert_eq!(logs[4]["detail"]["success"], false);
        assert_eq!(logs[6]["detail"]["status"], "completed");
    }

    #[tokio::test]
    async fn failed_rollback_escalates_to_manual_intervention() {
        let store = Store::open_in_memory().unwrap();
        let engine = engine(store.clone());
        let opp = opportunity();
        store.upsert_opportunity(&opp).await.unwrap();

        let primary = MockAdapter::new(
            "binance_futures",
            dec!(30000),
            vec![
                Ok(MockAdapter::order("BIN-1", dec!(0.1))),
                Err(ExchangeError::transient("binance_futures", "timeout")),
            ],
        );
        let hedge = MockAdapter::new(
            "bybit_futures",
            dec!(30000),
            vec![Err(ExchangeError::new(
                ExchangeErrorKind::InsufficientBalance,
                "bybit_futures",
                "insufficient balance",
            ))],
        );

        let failure = engine
            .run_protocol(&opp, dec!(1000), 3, primary, hedge)
            .await
            .unwrap_err();

        assert_eq!(failure.rollback, RollbackStatus::Failed);
        assert!(failure.requires_manual_intervention);
    }

    #[tokio::test]
    async fn tiny_capital_is_clamped_to_min_notional() {
        let store = Store::open_in_memory().unwrap();
        let engine = engine(store.clone());
        let opp = opportunity();
        store.upsert_opportunity(&opp).await.unwrap();

        let primary = MockAdapter::new(
            "binance_futures",
            dec!(10),
            vec![Ok(MockAdapter::order("BIN-1", dec!(1)))],
        );
        let hedge = MockAdapter::new(
            "bybit_futures",
            dec!(10),
            vec![Ok(MockAdapter::order("BYB-1", dec!(1)))],
        );

        // 1 USD at 1x would be notional 1 — below the $6 floor, so the
        // quantity is sized up to 6/10 = 0.6.
        let outcome = engine
            .run_protocol(&opp, dec!(1), 1, primary.clone(), hedge)
            .await
            .unwrap();
        assert_eq!(outcome.quantity, dec!(0.6));
    }
}
