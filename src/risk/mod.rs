// =============================================================================
// Risk Manager — pre-trade validation and the circuit breaker
// =============================================================================
//
// validate_trade runs six checks against the active risk limits and the
// current portfolio exposure; any failure lands in `rejections` and the trade
// is refused. The circuit breaker can be thrown manually or trips on
// portfolio-level signals; while active every validation fails and the
// detector refuses to auto-execute.
// =============================================================================

pub mod stress;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

// -----------------------------------------------------------------------------
// Limits
// -----------------------------------------------------------------------------

/// Active risk limit row (singleton).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    #[serde(default = "default_max_position_size_usd")]
    pub max_position_size_usd: Decimal,
    /// Max position size as percent of total capital.
    #[serde(default = "default_max_position_size_pct")]
    pub max_position_size_pct: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default = "default_max_venue_exposure_pct")]
    pub max_venue_exposure_pct: Decimal,
    #[serde(default = "default_max_asset_exposure_pct")]
    pub max_asset_exposure_pct: Decimal,
    #[serde(default = "default_max_gross_exposure_pct")]
    pub max_gross_exposure_pct: Decimal,
    #[serde(default = "default_max_drawdown_pct")]
    pub max_drawdown_pct: Decimal,
    #[serde(default = "default_max_var_pct")]
    pub max_var_pct: Decimal,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Consecutive failed executions before the breaker trips.
    #[serde(default = "default_max_failed_executions")]
    pub max_consecutive_failed_executions: u32,
}

fn default_max_position_size_usd() -> Decimal {
    Decimal::from(5000)
}
fn default_max_position_size_pct() -> Decimal {
    Decimal::from(10)
}
fn default_max_leverage() -> Decimal {
    Decimal::from(5)
}
fn default_max_venue_exposure_pct() -> Decimal {
    Decimal::from(40)
}
fn default_max_asset_exposure_pct() -> Decimal {
    Decimal::from(25)
}
fn default_max_gross_exposure_pct() -> Decimal {
    Decimal::from(150)
}
fn default_max_drawdown_pct() -> Decimal {
    Decimal::from(10)
}
fn default_max_var_pct() -> Decimal {
    Decimal::from(5)
}
fn default_stop_loss_pct() -> Decimal {
    Decimal::from(2)
}
fn default_max_failed_executions() -> u32 {
    3
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: default_max_position_size_usd(),
            max_position_size_pct: default_max_position_size_pct(),
            max_leverage: default_max_leverage(),
            max_venue_exposure_pct: default_max_venue_exposure_pct(),
            max_asset_exposure_pct: default_max_asset_exposure_pct(),
            max_gross_exposure_pct: default_max_gross_exposure_pct(),
            max_drawdown_pct: default_max_drawdown_pct(),
            max_var_pct: default_max_var_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            max_consecutive_failed_executions: default_max_failed_executions(),
        }
    }
}

// -----------------------------------------------------------------------------
// Validation inputs / outputs
// -----------------------------------------------------------------------------

/// What the caller wants to trade.
#[derive(Debug, Clone)]
pub struct TradeCheck {
    pub opportunity_id: String,
    pub symbol: String,
    pub size_usd: Decimal,
    pub long_exchange: String,
    pub short_exchange: String,
    pub leverage: Decimal,
}

/// Portfolio exposure at validation time, built from the store by the caller.
#[derive(Debug, Clone, Default)]
pub struct ExposureContext {
    pub total_capital_usd: Decimal,
    /// Venue slug -> deployed notional.
    pub venue_exposure: HashMap<String, Decimal>,
    /// Base asset -> deployed notional.
    pub asset_exposure: HashMap<String, Decimal>,
    pub gross_exposure: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskDecision {
    pub approved: bool,
    pub rejections: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerState {
    pub active: bool,
    pub reason: Option<String>,
    pub activated_at: Option<DateTime<Utc>>,
}

struct BreakerInner {
    active: bool,
    reason: Option<String>,
    activated_at: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Manager
// -----------------------------------------------------------------------------

pub struct RiskManager {
    limits: RwLock<RiskLimits>,
    breaker: RwLock<BreakerInner>,
    consecutive_failed_executions: AtomicU32,
}

impl RiskManager {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits: RwLock::new(limits),
            breaker: RwLock::new(BreakerInner {
                active: false,
                reason: None,
                activated_at: None,
            }),
            consecutive_failed_executions: AtomicU32::new(0),
        }
    }

    pub fn limits(&self) -> RiskLimits {
        self.limits.read().clone()
    }

    pub fn set_limits(&self, limits: RiskLimits) {
        info!(max_position_size_usd = %limits.max_position_size_usd, "risk limits updated");
        *self.limits.write() = limits;
    }

    // -------------------------------------------------------------------------
    // Pre-trade validation
    // -------------------------------------------------------------------------

    pub fn validate_trade(&self, check: &TradeCheck, exposure: &ExposureContext) -> RiskDecision {
        let limits = self.limits.read().clone();
        let mut rejections = Vec::new();

        if self.circuit_breaker_active() {
            let reason = self
                .breaker
                .read()
                .reason
                .clone()
                .unwrap_or_else(|| "Circuit breaker active".to_string());
            rejections.push(format!("Circuit breaker active: {reason}"));
        }

        if check.size_usd > limits.max_position_size_usd {
            rejections.push(format!(
                "size {} exceeds max_position_size_usd {}",
                check.size_usd, limits.max_position_size_usd
            ));
        }

        let pct_cap = exposure.total_capital_usd * limits.max_position_size_pct / Decimal::from(100);
        if exposure.total_capital_usd > Decimal::ZERO && check.size_usd > pct_cap {
            rejections.push(format!(
                "size {} exceeds {}% of capital ({})",
                check.size_usd, limits.max_position_size_pct, pct_cap
            ));
        }

        // Each venue takes one leg: half of the gross notional.
        let venue_cap = exposure.total_capital_usd * limits.max_venue_exposure_pct / Decimal::from(100);
        if exposure.total_capital_usd > Decimal::ZERO {
            for venue in [&check.long_exchange, &check.short_exchange] {
                let current = exposure
                    .venue_exposure
                    .get(venue.as_str())
                    .copied()
                    .unwrap_or(Decimal::ZERO);
                if current + check.size_usd > venue_cap {
                    rejections.push(format!(
                        "venue exposure on {} would reach {} (cap {})",
                        venue,
                        current + check.size_usd,
                        venue_cap
                    ));
                }
            }

            let asset_cap =
                exposure.total_capital_usd * limits.max_asset_exposure_pct / Decimal::from(100);
            let asset_current = exposure
                .asset_exposure
                .get(&check.symbol)
                .copied()
                .unwrap_or(Decimal::ZERO);
            if asset_current + check.size_usd > asset_cap {
                rejections.push(format!(
                    "asset exposure on {} would reach {} (cap {})",
                    check.symbol,
                    asset_current + check.size_usd,
                    asset_cap
                ));
            }

            // Both legs add to gross exposure.
            let gross_cap =
                exposure.total_capital_usd * limits.max_gross_exposure_pct / Decimal::from(100);
            let new_gross = exposure.gross_exposure + check.size_usd * Decimal::from(2);
            if new_gross > gross_cap {
                rejections.push(format!(
                    "gross exposure would reach {new_gross} (cap {gross_cap})"
                ));
            }
        }

        if check.leverage > limits.max_leverage {
            rejections.push(format!(
                "leverage {} exceeds max {}",
                check.leverage, limits.max_leverage
            ));
        }

        if !rejections.is_empty() {
            warn!(
                opportunity_id = %check.opportunity_id,
                rejections = ?rejections,
                "trade rejected by risk checks"
            );
        }

        RiskDecision {
            approved: rejections.is_empty(),
            rejections,
        }
    }

    // -------------------------------------------------------------------------
    // Circuit breaker
    // -------------------------------------------------------------------------

    pub fn circuit_breaker_active(&self) -> bool {
        self.breaker.read().active
    }

    pub fn circuit_breaker_state(&self) -> CircuitBreakerState {
        let b = self.breaker.read();
        CircuitBreakerState {
            active: b.active,
            reason: b.reason.clone(),
            activated_at: b.activated_at,
        }
    }

    pub fn activate_circuit_breaker(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let mut b = self.breaker.write();
        if !b.active {
            warn!(reason = %reason, "circuit breaker ACTIVATED");
        }
        b.active = true;
        b.reason = Some(reason);
        b.activated_at = Some(Utc::now());
    }

    pub fn deactivate_circuit_breaker(&self) {
        let mut b = self.breaker.write();
        if b.active {
            info!("circuit breaker deactivated");
        }
        b.active = false;
        b.reason = None;
        b.activated_at = None;
        self.consecutive_failed_executions.store(0, Ordering::SeqCst);
    }

    /// Automatic trip: portfolio drawdown beyond the configured limit.
    pub fn check_drawdown(&self, drawdown_pct: Decimal) {
        let limit = self.limits.read().max_drawdown_pct;
        if drawdown_pct > limit {
            self.activate_circuit_breaker(format!(
                "portfolio drawdown {drawdown_pct}% exceeds limit {limit}%"
            ));
        }
    }

    /// Automatic trip: too many consecutive failed executions.
    pub fn record_execution_failure(&self) {
        let count = self.consecutive_failed_executions.fetch_add(1, Ordering::SeqCst) + 1;
        let limit = self.limits.read().max_consecutive_failed_executions;
        if count > limit {
            self.activate_circuit_breaker(format!(
                "{count} consecutive failed executions (limit {limit})"
            ));
        }
    }

    pub fn record_execution_success(&self) {
        self.consecutive_failed_executions.store(0, Ordering::SeqCst);
    }

    /// Automatic trip: unhealthy venues carrying too much of the capital.
    pub fn check_exchange_outage(
        &self,
        unhealthy_venues: &[String],
        venue_exposure: &HashMap<String, Decimal>,
        total_capital: Decimal,
    ) {
        if total_capital <= Decimal::ZERO || unhealthy_venues.is_empty() {
            return;
        }
        let affected: Decimal = unhealthy_venues
            .iter()
            .filter_map(|v| venue_exposure.get(v))
            .copied()
            .sum();
        let affected_pct = affected / total_capital * Decimal::from(100);
        if affected_pct > Decimal::from(30) {
            self.activate_circuit_breaker(format!(
                "exchange outage affecting {affected_pct}% of capital ({unhealthy_venues:?})"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn check(size: Decimal) -> TradeCheck {
        TradeCheck {
            opportunity_id: "opp-1".into(),
            symbol: "BTC".into(),
            size_usd: size,
            long_exchange: "binance_futures".into(),
            short_exchange: "bybit_futures".into(),
            leverage: dec!(3),
        }
    }

    fn exposure(total: Decimal) -> ExposureContext {
        ExposureContext {
            total_capital_usd: total,
            ..Default::default()
        }
    }

    #[test]
    fn clean_trade_is_approved() {
        let risk = RiskManager::new(RiskLimits::default());
        let decision = risk.validate_trade(&check(dec!(1000)), &exposure(dec!(100000)));
        assert!(decision.approved);
        assert!(decision.rejections.is_empty());
    }

    #[test]
    fn oversized_trade_is_rejected() {
        let risk = RiskManager::new(RiskLimits::default());
        let decision = risk.validate_trade(&check(dec!(6000)), &exposure(dec!(100000)));
        assert!(!decision.approved);
        assert!(decision.rejections.iter().any(|r| r.contains("max_position_size_usd")));
    }

    #[test]
    fn pct_of_capital_cap_applies() {
        let risk = RiskManager::new(RiskLimits::default());
        // 10% of 10_000 = 1000; 2000 exceeds it.
        let decision = risk.validate_trade(&check(dec!(2000)), &exposure(dec!(10000)));
        assert!(!decision.approved);
    }

    #[test]
    fn venue_exposure_cap_applies() {
        let risk = RiskManager::new(RiskLimits::default());
        let mut ctx = exposure(dec!(10000));
        // 40% cap = 4000; binance already carries 3500.
        ctx.venue_exposure.insert("binance_futures".into(), dec!(3500));
        let decision = risk.validate_trade(&check(dec!(1000)), &ctx);
        assert!(!decision.approved);
        assert!(decision.rejections.iter().any(|r| r.contains("binance_futures")));
    }

    #[test]
    fn excess_leverage_is_rejected() {
        let risk = RiskManager::new(RiskLimits::default());
        let mut c = check(dec!(1000));
        c.leverage = dec!(10);
        let decision = risk.validate_trade(&c, &exposure(dec!(100000)));
        assert!(!decision.approved);
        assert!(decision.rejections.iter().any(|r| r.contains("leverage")));
    }

    #[test]
    fn breaker_blocks_all_trades() {
        let risk = RiskManager::new(RiskLimits::default());
        risk.activate_circuit_breaker("manual");
        assert!(risk.circuit_breaker_active());

        let decision = risk.validate_trade(&check(dec!(100)), &exposure(dec!(100000)));
        assert!(!decision.approved);
        assert!(decision.rejections[0].contains("Circuit breaker"));

        risk.deactivate_circuit_breaker();
        assert!(!risk.circuit_breaker_active());
        let decision = risk.validate_trade(&check(dec!(100)), &exposure(dec!(100000)));
        assert!(decision.approved);
    }

    #[test]
    fn drawdown_trips_breaker() {
        let risk = RiskManager::new(RiskLimits::default());
        risk.check_drawdown(dec!(5));
        assert!(!risk.circuit_breaker_active());
        risk.check_drawdown(dec!(11));
        assert!(risk.circuit_breaker_active());
    }

    #[test]
    fn consecutive_failures_trip_breaker() {
        let risk = RiskManager::new(RiskLimits::default());
        for _ in 0..3 {
            risk.record_execution_failure();
        }
        assert!(!risk.circuit_breaker_active());
        risk.record_execution_failure();
        assert!(risk.circuit_breaker_active());
    }

    #[test]
    fn outage_over_capital_share_trips_breaker() {
        let risk = RiskManager::new(RiskLimits::default());
        let mut venue_exposure = HashMap::new();
        venue_exposure.insert("binance_futures".to_string(), dec!(4000));
        risk.check_exchange_outage(
            &["binance_futures".to_string()],
            &venue_exposure,
            dec!(10000),
        );
        assert!(risk.circuit_breaker_active());
    }
}
