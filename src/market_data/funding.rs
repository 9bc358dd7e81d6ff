// =============================================================================
// Funding rate model & validation — dual-source normalized representation
// =============================================================================
//
// Every rate, regardless of source, is normalized into `FundingRate` before it
// enters the aggregator. Validation enforces hard bounds of ±1% per period
// (reject), warns beyond ±0.5% (extreme), and rejects data older than five
// minutes.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Where a funding rate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateSource {
    ExchangeApi,
    Reference,
}

impl std::fmt::Display for RateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ExchangeApi => write!(f, "exchange_api"),
            Self::Reference => write!(f, "reference"),
        }
    }
}

/// Funding rate information for a single asset on a single exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    /// Exchange slug (e.g. "binance_futures").
    pub exchange: String,
    /// Trading pair (e.g. "BTC/USDT:USDT").
    pub symbol: String,
    /// Base asset (e.g. "BTC"), derived from the symbol.
    pub ticker: String,
    /// Funding rate as a fraction per period (0.0001 = 0.01%).
    pub rate: Decimal,
    #[serde(default)]
    pub predicted_rate: Option<Decimal>,
    #[serde(default)]
    pub next_funding_time: Option<DateTime<Utc>>,
    /// Hours between funding settlements (1 or 8 on the tracked venues).
    pub funding_interval_hours: u32,
    pub source: RateSource,
    pub timestamp: DateTime<Utc>,
}

impl FundingRate {
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        rate: Decimal,
        funding_interval_hours: u32,
        source: RateSource,
    ) -> Self {
        let symbol = symbol.into();
        let ticker = ticker_from_symbol(&symbol);
        Self {
            exchange: exchange.into(),
            symbol,
            ticker,
            rate,
            predicted_rate: None,
            next_funding_time: None,
            funding_interval_hours,
            source,
            timestamp: Utc::now(),
        }
    }

    /// Annualized rate: rate × periods per day × 365.
    pub fn rate_annualized(&self) -> Decimal {
        let interval = self.funding_interval_hours.max(1);
        let periods_per_year = Decimal::from((24 / interval) as i64 * 365);
        self.rate * periods_per_year
    }

    /// Positive funding means longs pay shorts.
    pub fn is_positive(&self) -> bool {
        self.rate > Decimal::ZERO
    }

    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.timestamp).num_seconds()
    }

    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.age_seconds(now) > STALE_AFTER_SECONDS
    }

    /// Hours until the next funding settlement, if known.
    pub fn hours_to_next_funding(&self, now: DateTime<Utc>) -> Option<f64> {
        self.next_funding_time
            .map(|t| ((t - now).num_seconds().max(0)) as f64 / 3600.0)
    }
}

/// Extract the base asset from any of the symbol shapes the venues use:
/// "BTC/USDT:USDT", "BTCUSDT", "BTC-USD", "BTC".
pub fn ticker_from_symbol(symbol: &str) -> String {
    let cleaned = symbol.replace(":USDT", "").replace(":USD", "");
    let base = if let Some(idx) = cleaned.find('/') {
        &cleaned[..idx]
    } else if let Some(idx) = cleaned.find('-') {
        &cleaned[..idx]
    } else {
        let upper = cleaned.to_uppercase();
        for suffix in ["USDT", "USD", "PERP"] {
            if upper.ends_with(suffix) && upper.len() > suffix.len() {
                return upper[..upper.len() - suffix.len()].to_string();
            }
        }
        &cleaned
    };
    base.to_uppercase()
}

/// Data older than this is stale and dropped from the caches.
pub const STALE_AFTER_SECONDS: i64 = 300;

// =============================================================================
// Validation
// =============================================================================

/// Outcome of validating a single data point.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: String) {
        self.errors.push(msg);
    }

    fn warning(&mut self, msg: String) {
        self.warnings.push(msg);
    }
}

/// Validates funding rates for bounds, freshness and anomalies.
///
/// Rejected records are dropped by the caller; they never mark a source
/// unhealthy on their own.
pub struct FundingRateValidator {
    history: HashMap<(String, String), Vec<Decimal>>,
    history_window: usize,
}

/// Hard bounds: most venues clamp funding to ±1% per period.
const MIN_RATE_PCT: i64 = -1;
const MAX_RATE_PCT: i64 = 1;
/// Beyond ±0.5% the rate is flagged extreme but accepted.
const EXTREME_RATE_SCALED: i64 = 5; // 0.005 at scale 3

/// Z-score beyond which a rate is flagged as a potential anomaly.
const ANOMALY_ZSCORE_THRESHOLD: f64 = 3.0;

impl FundingRateValidator {
    pub fn new() -> Self {
        Self {
            history: HashMap::new(),
            history_window: 50,
        }
    }

    pub fn validate(&self, rate: &FundingRate, now: DateTime<Utc>) -> ValidationResult {
        let mut result = ValidationResult::default();

        let min_rate = Decimal::new(MIN_RATE_PCT, 2); // -0.01
        let max_rate = Decimal::new(MAX_RATE_PCT, 2); //  0.01
        if rate.rate < min_rate || rate.rate > max_rate {
            result.error(format!(
                "rate {} outside bounds [{}, {}]",
                rate.rate, min_rate, max_rate
            ));
            return result;
        }

        let extreme = Decimal::new(EXTREME_RATE_SCALED, 3); // 0.005
        if rate.rate.abs() > extreme {
            result.warning(format!("rate {} is extreme (beyond ±{})", rate.rate, extreme));
        }

        let age = rate.age_seconds(now);
        if age > STALE_AFTER_SECONDS {
            result.error(format!("data is stale: {age}s old (max {STALE_AFTER_SECONDS}s)"));
        } else if age > STALE_AFTER_SECONDS / 2 {
            result.warning(format!("data is getting stale: {age}s old"));
        }

        if let Some(z) = self.zscore(rate) {
            if z > ANOMALY_ZSCORE_THRESHOLD {
                result.warning(format!(
                    "potential anomaly: z-score {z:.2} (threshold {ANOMALY_ZSCORE_THRESHOLD})"
                ));
            }
        }

        if !result.is_valid() {
            warn!(
                exchange = %rate.exchange,
                symbol = %rate.symbol,
                rate = %rate.rate,
                errors = ?result.errors,
                "funding rate validation failed"
            );
        } else if !result.warnings.is_empty() {
            debug!(
                exchange = %rate.exchange,
                symbol = %rate.symbol,
                warnings = ?result.warnings,
                "funding rate validation warnings"
            );
        }

        result
    }

    pub fn update_history(&mut self, rate: &FundingRate) {
        let key = (rate.exchange.clone(), rate.symbol.clone());
        let history = self.history.entry(key).or_default();
        history.push(rate.rate);
        if history.len() > self.history_window {
            let excess = history.len() - self.history_window;
            history.drain(..excess);
        }
    }

    fn zscore(&self, rate: &FundingRate) -> Option<f64> {
        let key = (rate.exchange.clone(), rate.symbol.clone());
        let history = self.history.get(&key)?;
        if history.len() < 5 {
            return None;
        }

        let values: Vec<f64> = history.iter().filter_map(|r| r.to_f64()).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let std_dev = variance.sqrt();
        if std_dev == 0.0 {
            return None;
        }

        let current = rate.rate.to_f64()?;
        Some((current - mean).abs() / std_dev)
    }
}

impl Default for FundingRateValidator {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Snapshot & spreads
// =============================================================================

/// Complete snapshot of all unified funding rates, nested
/// symbol → exchange → rate. The output of dual-source reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnifiedFundingSnapshot {
    pub rates: HashMap<String, HashMap<String, FundingRate>>,
    pub fetched_at: DateTime<Utc>,
    pub total_symbols: usize,
    pub total_rates: usize,
    pub exchange_api_rates: usize,
    pub reference_rates: usize,
}

impl UnifiedFundingSnapshot {
    pub fn get_rate(&self, symbol: &str, exchange: &str) -> Option<&FundingRate> {
        self.rates.get(symbol).and_then(|m| m.get(exchange))
    }

    pub fn symbol_rates(&self, symbol: &str) -> Option<&HashMap<String, FundingRate>> {
        self.rates.get(symbol)
    }
}

/// A cross-exchange funding spread: the raw material of an opportunity.
///
/// `long_exchange` always carries the lower funding rate (the cheaper side to
/// be long), `short_exchange` the higher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Spread {
    pub symbol: String,
    pub long_exchange: String,
    pub short_exchange: String,
    pub long_rate: Decimal,
    pub short_rate: Decimal,
    /// Difference of fractional rates, always ≥ 0.
    pub spread: Decimal,
    /// spread × 100.
    pub spread_pct: Decimal,
    /// Percent per year, using the smaller funding interval of the two legs.
    pub annualized_apr: Decimal,
    pub long_funding_interval_hours: u32,
    pub short_funding_interval_hours: u32,
}

impl Spread {
    /// Build a spread from two rates for the same symbol, ordering the legs
    /// so the long side pays less.
    pub fn from_pair(symbol: &str, a: &FundingRate, b: &FundingRate) -> Self {
        let (low, high) = if a.rate <= b.rate { (a, b) } else { (b, a) };
        let spread = high.rate - low.rate;
        let spread_pct = spread * Decimal::from(100);
        let effective_interval = low
            .funding_interval_hours
            .min(high.funding_interval_hours)
            .max(1);
        let periods_per_year = Decimal::from((24 / effective_interval) as i64 * 365);
        Self {
            symbol: symbol.to_string(),
            long_exchange: low.exchange.clone(),
            short_exchange: high.exchange.clone(),
            long_rate: low.rate,
            short_rate: high.rate,
            spread,
            spread_pct,
            annualized_apr: spread_pct * periods_per_year,
            long_funding_interval_hours: low.funding_interval_hours,
            short_funding_interval_hours: high.funding_interval_hours,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn rate(exchange: &str, r: Decimal, interval: u32) -> FundingRate {
        FundingRate::new(exchange, "BTC/USDT:USDT", r, interval, RateSource::ExchangeApi)
    }

    #[test]
    fn ticker_derivation_handles_all_symbol_shapes() {
        assert_eq!(ticker_from_symbol("BTC/USDT:USDT"), "BTC");
        assert_eq!(ticker_from_symbol("BTCUSDT"), "BTC");
        assert_eq!(ticker_from_symbol("ETH-USD"), "ETH");
        assert_eq!(ticker_from_symbol("SOL"), "SOL");
        assert_eq!(ticker_from_symbol("DOGEPERP"), "DOGE");
    }

    #[test]
    fn annualized_rate_uses_interval() {
        let eight = rate("binance_futures", dec!(0.0001), 8);
        assert_eq!(eight.rate_annualized(), dec!(0.1095)); // 0.0001 * 3 * 365

        let hourly = rate("hyperliquid_futures", dec!(0.0001), 1);
        assert_eq!(hourly.rate_annualized(), dec!(0.876)); // 0.0001 * 24 * 365
    }

    #[test]
    fn validator_accepts_rate_at_hard_bound() {
        let validator = FundingRateValidator::new();
        let at_bound = rate("binance_futures", dec!(0.01), 8);
        assert!(validator.validate(&at_bound, Utc::now()).is_valid());

        let beyond = rate("binance_futures", dec!(0.0101), 8);
        assert!(!validator.validate(&beyond, Utc::now()).is_valid());

        let negative_bound = rate("binance_futures", dec!(-0.01), 8);
        assert!(validator.validate(&negative_bound, Utc::now()).is_valid());
    }

    #[test]
    fn validator_flags_extreme_rates() {
        let validator = FundingRateValidator::new();
        let extreme = rate("binance_futures", dec!(0.006), 8);
        let result = validator.validate(&extreme, Utc::now());
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }

    #[test]
    fn validator_rejects_stale_data() {
        let validator = FundingRateValidator::new();
        let mut old = rate("binance_futures", dec!(0.0001), 8);
        old.timestamp = Utc::now() - Duration::seconds(STALE_AFTER_SECONDS + 10);
        assert!(!validator.validate(&old, Utc::now()).is_valid());
    }

    #[test]
    fn spread_orders_long_leg_on_lower_rate() {
        let a = rate("bybit_futures", dec!(0.0003), 8);
        let b = rate("binance_futures", dec!(0.0001), 8);
        let spread = Spread::from_pair("BTC", &a, &b);

        assert_eq!(spread.long_exchange, "binance_futures");
        assert_eq!(spread.short_exchange, "bybit_futures");
        assert!(spread.long_rate <= spread.short_rate);
        assert_eq!(spread.spread, dec!(0.0002));
        assert_eq!(spread.spread_pct, dec!(0.02));
    }

    #[test]
    fn spread_apr_matches_expected_for_eight_hour_interval() {
        // binance 0.0001 vs bybit 0.0003, both 8h: spread_pct 0.02,
        // 1095 periods/year -> 21.9% APR.
        let a = rate("binance_futures", dec!(0.0001), 8);
        let b = rate("bybit_futures", dec!(0.0003), 8);
        let spread = Spread::from_pair("BTC", &a, &b);
        assert_eq!(spread.annualized_apr, dec!(21.90));
    }

    #[test]
    fn spread_apr_uses_smaller_interval() {
        let a = rate("binance_futures", dec!(0.0001), 8);
        let b = rate("hyperliquid_futures", dec!(0.0003), 1);
        let spread = Spread::from_pair("BTC", &a, &b);
        // 0.02% * 24 * 365 = 175.2
        assert_eq!(spread.annualized_apr, dec!(175.20));
    }

    #[test]
    fn funding_rate_json_roundtrip_preserves_fields() {
        let mut r = rate("binance_futures", dec!(0.0001), 8);
        r.predicted_rate = Some(dec!(0.0002));
        r.next_funding_time = Some(Utc::now() + Duration::hours(5));

        let json = serde_json::to_string(&r).unwrap();
        let back: FundingRate = serde_json::from_str(&json).unwrap();

        assert_eq!(back.exchange, r.exchange);
        assert_eq!(back.symbol, r.symbol);
        assert_eq!(back.ticker, r.ticker);
        assert_eq!(back.rate, r.rate);
        assert_eq!(back.predicted_rate, r.predicted_rate);
        assert_eq!(back.funding_interval_hours, r.funding_interval_hours);
        assert_eq!(back.rate_annualized(), r.rate_annualized());
    }
}
