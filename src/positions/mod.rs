// =============================================================================
// Position model — two-leg hedged positions with health and exit evaluation
// =============================================================================
//
// Life-cycle:
//   pending -> opening -> active -> closing -> closed
//   plus terminal branches: failed / emergency_close / cancelled
//
// Health walks healthy -> attention -> warning -> critical; the worst of the
// delta, margin and liquidation-distance checks wins.
// =============================================================================

pub mod manager;
pub mod reconcile;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::OrderSide;

// -----------------------------------------------------------------------------
// Status enums
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Pending,
    Opening,
    Active,
    Closing,
    Closed,
    Cancelled,
    Failed,
    EmergencyClose,
}

impl PositionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed | Self::Cancelled | Self::Failed | Self::EmergencyClose
        )
    }

    /// Allowed predecessor check for the single-writer transition guard.
    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Pending, Opening)
                | (Pending, Cancelled)
                | (Opening, Active)
                | (Opening, Failed)
                | (Active, Closing)
                | (Active, EmergencyClose)
                | (Closing, Closed)
                | (Closing, EmergencyClose)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Opening => "opening",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::EmergencyClose => "emergency_close",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "opening" => Some(Self::Opening),
            "active" => Some(Self::Active),
            "closing" => Some(Self::Closing),
            "closed" => Some(Self::Closed),
            "cancelled" => Some(Self::Cancelled),
            "failed" => Some(Self::Failed),
            "emergency_close" => Some(Self::EmergencyClose),
            _ => None,
        }
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Attention,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Attention => "attention",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "healthy" => Some(Self::Healthy),
            "attention" => Some(Self::Attention),
            "warning" => Some(Self::Warning),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Why a position was (or should be) closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    CriticalHealth,
    FundingBelowThreshold,
    StopLoss,
    TakeProfit,
    MaxHoldTime,
    AutoUnwind,
    Manual,
    MissingOnExchange,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CriticalHealth => "critical_health",
            Self::FundingBelowThreshold => "funding_below_threshold",
            Self::StopLoss => "stop_loss",
            Self::TakeProfit => "take_profit",
            Self::MaxHoldTime => "max_hold_time",
            Self::AutoUnwind => "auto_unwind",
            Self::Manual => "manual",
            Self::MissingOnExchange => "missing_on_exchange",
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// -----------------------------------------------------------------------------
// Leg
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegType {
    Primary,
    Hedge,
}

impl LegType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Hedge => "hedge",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "primary" => Some(Self::Primary),
            "hedge" => Some(Self::Hedge),
            _ => None,
        }
    }
}

/// One side of a hedged position on one exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    pub id: String,
    pub position_id: String,
    pub leg_type: LegType,
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub notional_usd: Decimal,
    pub leverage: Decimal,
    #[serde(default)]
    pub margin_used: Decimal,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
    #[serde(default)]
    pub funding_pnl: Decimal,
    #[serde(default)]
    pub liquidation_price: Option<Decimal>,
    #[serde(default)]
    pub entry_order_ids: Vec<String>,
    #[serde(default)]
    pub exit_order_ids: Vec<String>,
}

impl Leg {
    pub fn side_multiplier(&self) -> Decimal {
        Decimal::from(self.side.multiplier())
    }

    /// P&L from price movement since entry.
    pub fn price_pnl(&self) -> Decimal {
        (self.current_price - self.entry_price) * self.quantity * self.side_multiplier()
    }

    pub fn margin_utilization_pct(&self) -> Decimal {
        if self.margin_used == Decimal::ZERO || self.notional_usd == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.margin_used / self.notional_usd * Decimal::from(100)
    }

    /// Distance to liquidation as a percent of current price.
    pub fn distance_to_liquidation_pct(&self) -> Option<Decimal> {
        let liq = self.liquidation_price?;
        if self.current_price == Decimal::ZERO {
            return None;
        }
        Some((self.current_price - liq).abs() / self.current_price * Decimal::from(100))
    }
}

// -----------------------------------------------------------------------------
// Funding payments
// -----------------------------------------------------------------------------

/// A single funding settlement applied to one leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingPayment {
    pub id: String,
    pub position_id: String,
    pub leg_id: String,
    pub exchange: String,
    pub symbol: String,
    pub funding_rate: Decimal,
    /// Positive = received, negative = paid.
    pub payment_amount: Decimal,
    pub position_size: Decimal,
    pub timestamp: DateTime<Utc>,
}

// -----------------------------------------------------------------------------
// Position
// -----------------------------------------------------------------------------

/// Exit thresholds evaluated every manager tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitPolicy {
    /// Minimum acceptable funding P&L per period, percent of capital.
    pub target_funding_rate_min: Decimal,
    pub stop_loss_pct: Decimal,
    pub take_profit_pct: Option<Decimal>,
    pub max_hold_periods: u32,
}

impl Default for ExitPolicy {
    fn default() -> Self {
        Self {
            target_funding_rate_min: Decimal::new(5, 3), // 0.005
            stop_loss_pct: Decimal::from(2),
            take_profit_pct: None,
            max_hold_periods: 72,
        }
    }
}

/// Complete hedged position with both legs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub opportunity_id: Option<String>,
    /// "cross_exchange_perp" for detector-born pairs, "single_leg" for
    /// adopted leftovers.
    pub position_type: String,
    pub symbol: String,
    pub base_asset: String,
    pub status: PositionStatus,
    pub health_status: HealthStatus,

    pub total_capital_deployed: Decimal,
    #[serde(default)]
    pub entry_costs: Decimal,
    #[serde(default)]
    pub exit_costs: Decimal,
    #[serde(default)]
    pub funding_received: Decimal,
    #[serde(default)]
    pub funding_paid: Decimal,
    #[serde(default)]
    pub realized_pnl_funding: Decimal,
    #[serde(default)]
    pub realized_pnl_price: Decimal,

    #[serde(default)]
    pub net_delta: Decimal,
    #[serde(default)]
    pub delta_exposure_pct: Decimal,
    #[serde(default)]
    pub max_margin_utilization: Decimal,
    #[serde(default)]
    pub min_liquidation_distance: Option<Decimal>,

    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    #[serde(default)]
    pub funding_periods_collected: u32,
    #[serde(default)]
    pub exit_policy: ExitPolicy,

    pub legs: Vec<Leg>,
}

impl Position {
    pub fn new(symbol: impl Into<String>, opportunity_id: Option<String>) -> Self {
        let symbol = symbol.into();
        let base_asset = crate::market_data::funding::ticker_from_symbol(&symbol);
        Self {
            id: Uuid::new_v4().to_string(),
            opportunity_id,
            position_type: "cross_exchange_perp".to_string(),
            symbol,
            base_asset,
            status: PositionStatus::Pending,
            health_status: HealthStatus::Healthy,
            total_capital_deployed: Decimal::ZERO,
            entry_costs: Decimal::ZERO,
            exit_costs: Decimal::ZERO,
            funding_received: Decimal::ZERO,
            funding_paid: Decimal::ZERO,
            realized_pnl_funding: Decimal::ZERO,
            realized_pnl_price: Decimal::ZERO,
            net_delta: Decimal::ZERO,
            delta_exposure_pct: Decimal::ZERO,
            max_margin_utilization: Decimal::ZERO,
            min_liquidation_distance: None,
            opened_at: None,
            closed_at: None,
            exit_reason: None,
            funding_periods_collected: 0,
            exit_policy: ExitPolicy::default(),
            legs: Vec::new(),
        }
    }

    pub fn leg(&self, leg_type: LegType) -> Option<&Leg> {
        self.legs.iter().find(|l| l.leg_type == leg_type)
    }

    pub fn net_funding_pnl(&self) -> Decimal {
        self.funding_received - self.funding_paid
    }

    pub fn price_pnl(&self) -> Decimal {
        self.legs.iter().map(|l| l.price_pnl()).sum()
    }

    pub fn total_unrealized_pnl(&self) -> Decimal {
        self.net_funding_pnl() + self.price_pnl() - self.entry_costs
    }

    pub fn total_realized_pnl(&self) -> Decimal {
        self.realized_pnl_funding + self.realized_pnl_price - self.entry_costs - self.exit_costs
    }

    pub fn return_pct(&self) -> Decimal {
        if self.total_capital_deployed == Decimal::ZERO {
            return Decimal::ZERO;
        }
        let pnl = if self.status == PositionStatus::Closed {
            self.total_realized_pnl()
        } else {
            self.total_unrealized_pnl()
        };
        pnl / self.total_capital_deployed * Decimal::from(100)
    }

    pub fn hold_duration_hours(&self, now: DateTime<Utc>) -> Option<f64> {
        let opened = self.opened_at?;
        let end = self.closed_at.unwrap_or(now);
        Some((end - opened).num_seconds() as f64 / 3600.0)
    }

    /// Recompute delta, margin and liquidation metrics from the legs, then
    /// derive the health status.
    pub fn update_metrics(&mut self) {
        let total_delta: Decimal = self
            .legs
            .iter()
            .map(|l| l.notional_usd * l.side_multiplier())
            .sum();
        let total_notional: Decimal = self.legs.iter().map(|l| l.notional_usd).sum();

        self.net_delta = total_delta;
        self.delta_exposure_pct = if total_notional > Decimal::ZERO {
            total_delta.abs() / total_notional * Decimal::from(100)
        } else {
            Decimal::ZERO
        };

        self.max_margin_utilization = self
            .legs
            .iter()
            .map(|l| l.margin_utilization_pct())
            .max()
            .unwrap_or(Decimal::ZERO);

        self.min_liquidation_distance = self
            .legs
            .iter()
            .filter_map(|l| l.distance_to_liquidation_pct())
            .min();

        self.health_status = self.calculate_health();
    }

    /// Worst of delta (>5/3/1), margin (>85/70/50) and liquidation distance
    /// (<10/20/30) wins.
    pub fn calculate_health(&self) -> HealthStatus {
        let mut health = HealthStatus::Healthy;

        let delta = self.delta_exposure_pct;
        let delta_health = if delta > Decimal::from(5) {
            HealthStatus::Critical
        } else if delta > Decimal::from(3) {
            HealthStatus::Warning
        } else if delta > Decimal::from(1) {
            HealthStatus::Attention
        } else {
            HealthStatus::Healthy
        };
        health = health.max(delta_health);

        let margin = self.max_margin_utilization;
        let margin_health = if margin > Decimal::from(85) {
            HealthStatus::Critical
        } else if margin > Decimal::from(70) {
            HealthStatus::Warning
        } else if margin > Decimal::from(50) {
            HealthStatus::Attention
        } else {
            HealthStatus::Healthy
        };
        health = health.max(margin_health);

        if let Some(distance) = self.min_liquidation_distance {
            let liq_health = if distance < Decimal::from(10) {
                HealthStatus::Critical
            } else if distance < Decimal::from(20) {
                HealthStatus::Warning
            } else if distance < Decimal::from(30) {
                HealthStatus::Attention
            } else {
                HealthStatus::Healthy
            };
            health = health.max(liq_health);
        }

        health
    }

    /// Evaluate all exit triggers in priority order.
    pub fn should_exit(&self) -> Option<ExitReason> {
        if self.health_status == HealthStatus::Critical {
            return Some(ExitReason::CriticalHealth);
        }

        // Funding deterioration: after three collected periods the average
        // primary funding P&L per period must clear the floor.
        if self.funding_periods_collected >= 3 {
            if let Some(primary) = self.leg(LegType::Primary) {
                let periods = Decimal::from(self.funding_periods_collected.max(1));
                let per_period = primary.funding_pnl / periods;
                if per_period < self.exit_policy.target_funding_rate_min {
                    return Some(ExitReason::FundingBelowThreshold);
                }
            }
        }

        if self.return_pct() < -self.exit_policy.stop_loss_pct {
            return Some(ExitReason::StopLoss);
        }

        if let Some(tp) = self.exit_policy.take_profit_pct {
            if self.return_pct() > tp {
                return Some(ExitReason::TakeProfit);
            }
        }

        if self.funding_periods_collected >= self.exit_policy.max_hold_periods {
            return Some(ExitReason::MaxHoldTime);
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn leg(leg_type: LegType, side: OrderSide, notional: Decimal) -> Leg {
        Leg {
            id: Uuid::new_v4().to_string(),
            position_id: "pos-1".into(),
            leg_type,
            exchange: "binance_futures".into(),
            symbol: "BTC/USDT:USDT".into(),
            side,
            quantity: dec!(0.1),
            entry_price: dec!(30000),
            current_price: dec!(30000),
            notional_usd: notional,
            leverage: dec!(3),
            margin_used: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            funding_pnl: Decimal::ZERO,
            liquidation_price: None,
            entry_order_ids: vec![],
            exit_order_ids: vec![],
        }
    }

    fn hedged_position() -> Position {
        let mut pos = Position::new("BTC/USDT:USDT", None);
        pos.status = PositionStatus::Active;
        pos.total_capital_deployed = dec!(1000);
        pos.legs = vec![
            leg(LegType::Primary, OrderSide::Long, dec!(3000)),
            leg(LegType::Hedge, OrderSide::Short, dec!(3000)),
        ];
        pos.update_metrics();
        pos
    }

    #[test]
    fn status_transitions_follow_lifecycle() {
        use PositionStatus::*;
        assert!(Pending.can_transition_to(Opening));
        assert!(Opening.can_transition_to(Active));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Active.can_transition_to(Pending));
        assert!(Active.can_transition_to(EmergencyClose));
    }

    #[test]
    fn balanced_legs_have_zero_delta_and_healthy_status() {
        let pos = hedged_position();
        assert_eq!(pos.net_delta, Decimal::ZERO);
        assert_eq!(pos.delta_exposure_pct, Decimal::ZERO);
        assert_eq!(pos.health_status, HealthStatus::Healthy);
        assert_eq!(pos.legs.len(), 2);
        assert_ne!(pos.legs[0].side, pos.legs[1].side);
    }

    #[test]
    fn drifted_delta_degrades_health() {
        let mut pos = hedged_position();
        pos.legs[0].notional_usd = dec!(3300); // ~4.76% delta
        pos.update_metrics();
        assert_eq!(pos.health_status, HealthStatus::Warning);

        pos.legs[0].notional_usd = dec!(3400); // ~6.25% delta
        pos.update_metrics();
        assert_eq!(pos.health_status, HealthStatus::Critical);
    }

    #[test]
    fn margin_and_liquidation_follow_worst_case() {
        let mut pos = hedged_position();
        pos.legs[0].margin_used = dec!(2700); // 90% of 3000 notional
        pos.update_metrics();
        assert_eq!(pos.health_status, HealthStatus::Critical);

        let mut pos = hedged_position();
        pos.legs[1].liquidation_price = Some(dec!(37000));
        pos.legs[1].current_price = dec!(30000); // ~23% away -> warning? 23.3 -> attention band is <30
        pos.update_metrics();
        assert_eq!(pos.health_status, HealthStatus::Attention);
    }

    #[test]
    fn critical_health_triggers_exit() {
        let mut pos = hedged_position();
        pos.health_status = HealthStatus::Critical;
        assert_eq!(pos.should_exit(), Some(ExitReason::CriticalHealth));
    }

    #[test]
    fn funding_below_threshold_after_three_periods() {
        let mut pos = hedged_position();
        pos.funding_periods_collected = 3;
        pos.legs[0].funding_pnl = dec!(0.001); // 0.000333 per period < 0.005
        assert_eq!(pos.should_exit(), Some(ExitReason::FundingBelowThreshold));

        pos.legs[0].funding_pnl = dec!(1);
        assert_eq!(pos.should_exit(), None);
    }

    #[test]
    fn stop_loss_and_take_profit() {
        let mut pos = hedged_position();
        pos.legs[0].funding_pnl = dec!(1); // keep the funding gate quiet
        pos.funding_periods_collected = 3;

        pos.funding_paid = dec!(30); // -3% on 1000 capital
        assert_eq!(pos.should_exit(), Some(ExitReason::StopLoss));

        pos.funding_paid = Decimal::ZERO;
        pos.funding_received = dec!(60);
        pos.exit_policy.take_profit_pct = Some(dec!(5));
        assert_eq!(pos.should_exit(), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn max_hold_time_exit() {
        let mut pos = hedged_position();
        pos.legs[0].funding_pnl = dec!(1);
        pos.exit_policy.max_hold_periods = 10;
        pos.funding_periods_collected = 10;
        assert_eq!(pos.should_exit(), Some(ExitReason::MaxHoldTime));
    }

    #[test]
    fn return_pct_uses_realized_when_closed() {
        let mut pos = hedged_position();
        pos.status = PositionStatus::Closed;
        pos.realized_pnl_funding = dec!(25);
        assert_eq!(pos.return_pct(), dec!(2.5));
    }
}
