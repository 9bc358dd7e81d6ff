// =============================================================================
// Stress tester — offline what-if scenarios over the live portfolio
// =============================================================================
//
// Each scenario projects P&L per position, aggregates to portfolio level and
// produces rule-based recommendations. Hedged pairs lose only the basis that
// leaks between the two legs in a crash; an exchange outage turns the legs on
// the dark venue into naked exposure.
// =============================================================================

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioType {
    FlashCrash,
    FundingFlip,
    ExchangeOutage,
    LiquidityCrisis,
    CorrelationBreakdown,
    Combined,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioSeverity {
    Mild,
    Moderate,
    Severe,
    Extreme,
}

impl ScenarioSeverity {
    /// Basis slippage between hedged legs during a crash, as a fraction of
    /// the price move.
    fn basis_leak(&self) -> f64 {
        match self {
            Self::Mild => 0.05,
            Self::Moderate => 0.10,
            Self::Severe => 0.20,
            Self::Extreme => 0.30,
        }
    }

    fn recovery_hours(&self) -> f64 {
        match self {
            Self::Mild => 4.0,
            Self::Moderate => 12.0,
            Self::Severe => 48.0,
            Self::Extreme => 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressScenario {
    pub key: String,
    pub name: String,
    pub scenario_type: ScenarioType,
    pub severity: ScenarioSeverity,
    pub description: String,
    /// Market-wide price move, percent (negative = crash).
    pub price_move_pct: f64,
    /// Change applied to every funding spread, percent per period
    /// (negative = spreads compress or flip).
    pub spread_change: f64,
    pub volatility_multiplier: f64,
    pub offline_exchanges: Vec<String>,
}

impl StressScenario {
    fn new(
        key: &str,
        name: &str,
        scenario_type: ScenarioType,
        severity: ScenarioSeverity,
        description: &str,
    ) -> Self {
        Self {
            key: key.to_string(),
            name: name.to_string(),
            scenario_type,
            severity,
            description: description.to_string(),
            price_move_pct: 0.0,
            spread_change: 0.0,
            volatility_multiplier: 1.0,
            offline_exchanges: Vec::new(),
        }
    }
}

/// The built-in scenario set.
pub fn stress_scenarios() -> Vec<StressScenario> {
    let mut scenarios = Vec::new();

    for (key, name, severity, move_pct, vol) in [
        ("flash_crash_mild", "Mild Flash Crash", ScenarioSeverity::Mild, -5.0, 1.5),
        ("flash_crash_moderate", "Moderate Flash Crash", ScenarioSeverity::Moderate, -10.0, 2.0),
        ("flash_crash_severe", "Severe Flash Crash", ScenarioSeverity::Severe, -20.0, 3.0),
        ("flash_crash_extreme", "Extreme Flash Crash", ScenarioSeverity::Extreme, -35.0, 5.0),
    ] {
        let mut s = StressScenario::new(
            key,
            name,
            ScenarioType::FlashCrash,
            severity,
            "Sudden market-wide price drop; hedged pairs bleed basis",
        );
        s.price_move_pct = move_pct;
        s.volatility_multiplier = vol;
        scenarios.push(s);
    }

    for (key, name, severity, spread_change) in [
        ("funding_flip_mild", "Mild Funding Flip", ScenarioSeverity::Mild, -0.01),
        ("funding_flip_moderate", "Moderate Funding Flip", ScenarioSeverity::Moderate, -0.03),
        ("funding_flip_severe", "Severe Funding Flip", ScenarioSeverity::Severe, -0.08),
    ] {
        let mut s = StressScenario::new(
            key,
            name,
            ScenarioType::FundingFlip,
            severity,
            "Funding spreads compress or invert across venues",
        );
        s.spread_change = spread_change;
        scenarios.push(s);
    }

    let mut single = StressScenario::new(
        "exchange_outage_single",
        "Single Exchange Outage",
        ScenarioType::ExchangeOutage,
        ScenarioSeverity::Moderate,
        "One venue goes dark; its legs become unhedged exposure",
    );
    single.price_move_pct = -5.0;
    single.offline_exchanges = vec!["bybit_futures".to_string()];
    scenarios.push(single);

    let mut multiple = StressScenario::new(
        "exchange_outage_multiple",
        "Multiple Exchange Outage",
        ScenarioType::ExchangeOutage,
        ScenarioSeverity::Severe,
        "Several venues go dark at once",
    );
    multiple.price_move_pct = -8.0;
    multiple.offline_exchanges = vec![
        "bybit_futures".to_string(),
        "okex_futures".to_string(),
    ];
    scenarios.push(multiple);

    let mut liquidity = StressScenario::new(
        "liquidity_crisis",
        "Liquidity Crisis",
        ScenarioType::LiquidityCrisis,
        ScenarioSeverity::Severe,
        "Books thin out; every exit pays heavy slippage",
    );
    liquidity.volatility_multiplier = 3.0;
    scenarios.push(liquidity);

    let mut correlation = StressScenario::new(
        "correlation_breakdown",
        "Correlation Breakdown",
        ScenarioType::CorrelationBreakdown,
        ScenarioSeverity::Moderate,
        "Perp prices decouple across venues; basis widens",
    );
    correlation.volatility_multiplier = 2.0;
    scenarios.push(correlation);

    let mut combined = StressScenario::new(
        "combined_crisis",
        "Combined Crisis",
        ScenarioType::Combined,
        ScenarioSeverity::Extreme,
        "Crash, funding flip and liquidity crunch together",
    );
    combined.price_move_pct = -25.0;
    combined.spread_change = -0.05;
    combined.volatility_multiplier = 4.0;
    scenarios.push(combined);

    scenarios
}

// -----------------------------------------------------------------------------
// Inputs / outputs
// -----------------------------------------------------------------------------

/// A position as the stress tester sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StressPosition {
    pub position_id: String,
    pub symbol: String,
    pub size_usd: Decimal,
    pub long_exchange: String,
    pub short_exchange: String,
    /// Current funding spread, percent per period.
    pub current_spread: f64,
    pub unrealized_pnl: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionImpact {
    pub position_id: String,
    pub symbol: String,
    pub projected_pnl: Decimal,
    pub margin_call_risk: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StressTestResult {
    pub scenario_key: String,
    pub scenario_name: String,
    pub scenario_type: ScenarioType,
    pub severity: ScenarioSeverity,
    pub projected_pnl: Decimal,
    pub projected_pnl_pct: f64,
    pub max_drawdown_pct: f64,
    pub positions_affected: usize,
    pub margin_call_risk: bool,
    pub estimated_recovery_hours: f64,
    pub recommendations: Vec<String>,
    pub position_impacts: Vec<PositionImpact>,
}

// -----------------------------------------------------------------------------
// Tester
// -----------------------------------------------------------------------------

/// Funding periods a flipped spread is assumed to persist before exit.
const FLIP_HOLD_PERIODS: f64 = 6.0;
/// Baseline exit slippage in a liquidity crisis, percent.
const CRISIS_EXIT_SLIPPAGE_PCT: f64 = 0.5;

pub struct StressTester {
    positions: Vec<StressPosition>,
    total_capital: Decimal,
    current_exposure: Decimal,
}

impl StressTester {
    pub fn new(
        positions: Vec<StressPosition>,
        total_capital: Decimal,
        current_exposure: Decimal,
    ) -> Self {
        Self {
            positions,
            total_capital,
            current_exposure,
        }
    }

    pub fn run_scenario(&self, key: &str) -> anyhow::Result<StressTestResult> {
        let scenario = stress_scenarios()
            .into_iter()
            .find(|s| s.key == key)
            .ok_or_else(|| anyhow::anyhow!("Unknown scenario: {key}"))?;
        Ok(self.run(&scenario))
    }

    pub fn run_all_scenarios(&self) -> Vec<StressTestResult> {
        stress_scenarios().iter().map(|s| self.run(s)).collect()
    }

    /// Worst projected P&L across all scenarios.
    pub fn worst_case(&self) -> Option<StressTestResult> {
        self.run_all_scenarios()
            .into_iter()
            .min_by(|a, b| a.projected_pnl.cmp(&b.projected_pnl))
    }

    pub fn run(&self, scenario: &StressScenario) -> StressTestResult {
        let mut impacts = Vec::with_capacity(self.positions.len());
        let mut total_pnl = Decimal::ZERO;
        let mut any_margin_call = false;

        for position in &self.positions {
            let impact = self.project_position(position, scenario);
            total_pnl += impact.projected_pnl;
            any_margin_call |= impact.margin_call_risk;
            impacts.push(impact);
        }

        let capital = self.total_capital.to_f64().unwrap_or(0.0);
        let pnl_f = total_pnl.to_f64().unwrap_or(0.0);
        let pnl_pct = if capital > 0.0 { pnl_f / capital * 100.0 } else { 0.0 };

        StressTestResult {
            scenario_key: scenario.key.clone(),
            scenario_name: scenario.name.clone(),
            scenario_type: scenario.scenario_type,
            severity: scenario.severity,
            projected_pnl: total_pnl,
            projected_pnl_pct: pnl_pct,
            max_drawdown_pct: pnl_pct.abs(),
            positions_affected: impacts.len(),
            margin_call_risk: any_margin_call,
            estimated_recovery_hours: scenario.severity.recovery_hours()
                * scenario.volatility_multiplier.max(1.0),
            recommendations: self.recommendations(scenario, pnl_pct, any_margin_call),
            position_impacts: impacts,
        }
    }

    fn project_position(
        &self,
        position: &StressPosition,
        scenario: &StressScenario,
    ) -> PositionImpact {
        let size = position.size_usd.to_f64().unwrap_or(0.0);
        let mut pnl = 0.0;
        let mut margin_call = false;

        match scenario.scenario_type {
            ScenarioType::FlashCrash => {
                // Hedged: only the basis leak between the legs is lost.
                pnl -= size * (scenario.price_move_pct.abs() / 100.0)
                    * scenario.severity.basis_leak();
            }
            ScenarioType::FundingFlip => {
                pnl += size * (scenario.spread_change / 100.0) * FLIP_HOLD_PERIODS;
            }
            ScenarioType::ExchangeOutage => {
                let long_dark = scenario.offline_exchanges.contains(&position.long_exchange);
                let short_dark = scenario.offline_exchanges.contains(&position.short_exchange);
                if long_dark != short_dark {
                    // One leg dark: the surviving leg is naked directional
                    // exposure for the duration of the outage.
                    let naked = size / 2.0;
                    pnl -= naked * (scenario.price_move_pct.abs() / 100.0);
                    margin_call = true;
                } else if long_dark && short_dark {
                    // Both dark: frozen but still hedged; exit costs only.
                    pnl -= size * 0.002;
                    margin_call = true;
                }
            }
            ScenarioType::LiquidityCrisis => {
                pnl -= size * (CRISIS_EXIT_SLIPPAGE_PCT / 100.0) * scenario.volatility_multiplier;
            }
            ScenarioType::CorrelationBreakdown => {
                pnl -= size * 0.01 * scenario.volatility_multiplier;
            }
            ScenarioType::Combined => {
                pnl -= size * (scenario.price_move_pct.abs() / 100.0)
                    * scenario.severity.basis_leak();
                pnl += size * (scenario.spread_change / 100.0) * FLIP_HOLD_PERIODS;
                pnl -= size * (CRISIS_EXIT_SLIPPAGE_PCT / 100.0) * scenario.volatility_multiplier;
            }
        }

        PositionImpact {
            position_id: position.position_id.clone(),
            symbol: position.symbol.clone(),
            projected_pnl: Decimal::from_f64(pnl).unwrap_or(Decimal::ZERO),
            margin_call_risk: margin_call,
        }
    }

    fn recommendations(
        &self,
        scenario: &StressScenario,
        pnl_pct: f64,
        margin_call: bool,
    ) -> Vec<String> {
        let mut recs = Vec::new();

        if pnl_pct < -10.0 {
            recs.push("Projected loss exceeds 10% of capital: reduce gross exposure".to_string());
        } else if pnl_pct < -5.0 {
            recs.push("Projected loss exceeds 5% of capital: review position sizing".to_string());
        }

        if margin_call {
            recs.push("Margin call risk on offline venues: keep reserve pool funded".to_string());
        }

        if matches!(scenario.scenario_type, ScenarioType::ExchangeOutage) {
            let exposure = self.current_exposure.to_f64().unwrap_or(0.0);
            let capital = self.total_capital.to_f64().unwrap_or(0.0);
            if capital > 0.0 && exposure / capital > 0.5 {
                recs.push("More than half of capital deployed: diversify across venues".to_string());
            }
        }

        if matches!(scenario.severity, ScenarioSeverity::Severe | ScenarioSeverity::Extreme)
            && recs.is_empty()
        {
            recs.push("Portfolio holds up under this scenario; no action required".to_string());
        }

        recs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn positions() -> Vec<StressPosition> {
        vec![
            StressPosition {
                position_id: "pos_1".into(),
                symbol: "BTC".into(),
                size_usd: dec!(10000),
                long_exchange: "binance_futures".into(),
                short_exchange: "bybit_futures".into(),
                current_spread: 0.02,
                unrealized_pnl: dec!(50),
            },
            StressPosition {
                position_id: "pos_2".into(),
                symbol: "ETH".into(),
                size_usd: dec!(5000),
                long_exchange: "okex_futures".into(),
                short_exchange: "bybit_futures".into(),
                current_spread: 0.015,
                unrealized_pnl: dec!(-20),
            },
        ]
    }

    fn tester() -> StressTester {
        StressTester::new(positions(), dec!(100000), dec!(15000))
    }

    #[test]
    fn all_expected_scenarios_defined() {
        let keys: Vec<String> = stress_scenarios().iter().map(|s| s.key.clone()).collect();
        for expected in [
            "flash_crash_mild",
            "flash_crash_moderate",
            "flash_crash_severe",
            "flash_crash_extreme",
            "funding_flip_mild",
            "funding_flip_moderate",
            "funding_flip_severe",
            "exchange_outage_single",
            "exchange_outage_multiple",
            "liquidity_crisis",
            "correlation_breakdown",
            "combined_crisis",
        ] {
            assert!(keys.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn scenario_shapes_are_sane() {
        for scenario in stress_scenarios() {
            match scenario.scenario_type {
                ScenarioType::FlashCrash => assert!(scenario.price_move_pct < 0.0),
                ScenarioType::FundingFlip => assert!(scenario.spread_change < 0.0),
                ScenarioType::ExchangeOutage => assert!(!scenario.offline_exchanges.is_empty()),
                _ => {}
            }
        }
    }

    #[test]
    fn all_severities_represented() {
        let severities: Vec<ScenarioSeverity> =
            stress_scenarios().iter().map(|s| s.severity).collect();
        for wanted in [
            ScenarioSeverity::Mild,
            ScenarioSeverity::Moderate,
            ScenarioSeverity::Severe,
            ScenarioSeverity::Extreme,
        ] {
            assert!(severities.contains(&wanted));
        }
    }

    #[test]
    fn flash_crash_projects_loss_proportional_to_severity() {
        let t = tester();
        let mild = t.run_scenario("flash_crash_mild").unwrap();
        let extreme = t.run_scenario("flash_crash_extreme").unwrap();

        assert!(mild.projected_pnl < Decimal::ZERO);
        assert!(extreme.projected_pnl < mild.projected_pnl);
        assert_eq!(mild.positions_affected, 2);
        assert!(extreme.estimated_recovery_hours > mild.estimated_recovery_hours);
    }

    #[test]
    fn outage_flags_margin_call_on_affected_positions() {
        let t = tester();
        let result = t.run_scenario("exchange_outage_single").unwrap();
        // bybit is a leg of both test positions.
        assert!(result.margin_call_risk);
        assert!(result.projected_pnl < Decimal::ZERO);
    }

    #[test]
    fn unknown_scenario_errors() {
        let t = tester();
        assert!(t.run_scenario("nonexistent").is_err());
    }

    #[test]
    fn run_all_covers_every_scenario_and_worst_case_is_minimum() {
        let t = tester();
        let results = t.run_all_scenarios();
        assert_eq!(results.len(), stress_scenarios().len());

        let worst = t.worst_case().unwrap();
        let min = results
            .iter()
            .map(|r| r.projected_pnl)
            .min()
            .unwrap();
        assert_eq!(worst.projected_pnl, min);
    }

    #[test]
    fn drawdown_is_absolute_pnl_pct() {
        let t = tester();
        let result = t.run_scenario("flash_crash_severe").unwrap();
        assert!(result.max_drawdown_pct >= 0.0);
        assert!((result.max_drawdown_pct - result.projected_pnl_pct.abs()).abs() < 1e-9);
    }
}
