// =============================================================================
// UOS Scorer — Unified Opportunity Score, 0–100
// =============================================================================
//
// Four components: return (0–30), risk (0–30), execution (0–25), timing
// (0–15). Scoring runs on f64 and clamps to integers at the boundary; money
// never flows through here.
// =============================================================================

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::exchanges::venues::tier_of;
use crate::market_data::funding::Spread;

/// Component breakdown of the Unified Opportunity Score.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UosBreakdown {
    pub return_score: u8,
    pub risk_score: u8,
    pub execution_score: u8,
    pub timing_score: u8,
}

impl UosBreakdown {
    pub fn total(&self) -> u8 {
        self.return_score + self.risk_score + self.execution_score + self.timing_score
    }

    pub fn quality(&self) -> &'static str {
        match self.total() {
            80..=u8::MAX => "exceptional",
            60..=79 => "strong",
            40..=59 => "moderate",
            20..=39 => "weak",
            _ => "poor",
        }
    }
}

/// Everything the scorer knows beyond the spread itself.
#[derive(Debug, Clone)]
pub struct ScoreContext {
    /// Reliability of the two data providers, 0..=1.
    pub long_reliability: f64,
    pub short_reliability: f64,
    /// Estimated entry slippage across both legs, percent.
    pub estimated_slippage_pct: f64,
    /// Top-of-book depth available on the thinner side, if known.
    pub available_depth_usd: Option<Decimal>,
    /// Size the detector intends to recommend, for the depth check.
    pub intended_size_usd: Decimal,
    /// Hours until the nearer funding settlement, if known.
    pub hours_to_next_funding: Option<f64>,
    /// Standard deviation of recent funding rates, as a fraction.
    pub rate_volatility: Option<f64>,
    /// True when the rates came from a single source (no cross-validation).
    pub single_source: bool,
}

impl Default for ScoreContext {
    fn default() -> Self {
        Self {
            long_reliability: 1.0,
            short_reliability: 1.0,
            estimated_slippage_pct: 0.1,
            available_depth_usd: None,
            intended_size_usd: Decimal::from(1000),
            hours_to_next_funding: None,
            rate_volatility: None,
            single_source: false,
        }
    }
}

pub struct UosScorer;

impl UosScorer {
    pub fn score(spread: &Spread, ctx: &ScoreContext) -> UosBreakdown {
        UosBreakdown {
            return_score: Self::return_score(spread),
            risk_score: Self::risk_score(spread, ctx),
            execution_score: Self::execution_score(ctx),
            timing_score: Self::timing_score(ctx.hours_to_next_funding),
        }
    }

    /// Monotone and saturating in annualized APR.
    /// ~7.5 at 10% APR, ~17 at 30%, ~23 at 50%, asymptote 30.
    fn return_score(spread: &Spread) -> u8 {
        let apr = spread.annualized_apr.to_f64().unwrap_or(0.0).max(0.0);
        let score = 30.0 * (1.0 - (-apr / 35.0).exp());
        clamp(score, 30)
    }

    /// Tier pairing sets the base; volatility erodes it; single-source data
    /// caps it. Tier-1/tier-1 pairs always outrank pairs with a tier-2 or
    /// DEX leg.
    fn risk_score(spread: &Spread, ctx: &ScoreContext) -> u8 {
        let long_tier = tier_of(&spread.long_exchange);
        let short_tier = tier_of(&spread.short_exchange);

        let mut score: f64 = match long_tier.max(short_tier) {
            1 => 26.0,
            2 => 20.0,
            _ => 14.0,
        };
        // Both legs on the better tier earn a little more than a mixed pair.
        if long_tier == 1 && short_tier == 1 {
            score += 2.0;
        }

        if let Some(vol) = ctx.rate_volatility {
            // 0.0005 of per-period volatility costs ~5 points.
            score -= (vol * 10_000.0).min(8.0);
        }

        if ctx.single_source {
            score = score.min(15.0);
        }

        clamp(score, 30)
    }

    /// Monotone in inverse slippage, scaled by the weaker provider's
    /// reliability, penalized when the book cannot absorb the intended size.
    fn execution_score(ctx: &ScoreContext) -> u8 {
        let slippage = ctx.estimated_slippage_pct.max(0.0);
        let mut score = 25.0 / (1.0 + slippage * 4.0);

        let reliability = ctx.long_reliability.min(ctx.short_reliability).clamp(0.0, 1.0);
        score *= reliability;

        if let Some(depth) = ctx.available_depth_usd {
            let needed = ctx.intended_size_usd * Decimal::from(3);
            if depth < needed {
                score -= 8.0;
            }
        }

        clamp(score, 25)
    }

    /// Peaks in the 4–6 h band: late enough to enter calmly, early enough
    /// that the rate is unlikely to flip before settlement.
    fn timing_score(hours_to_funding: Option<f64>) -> u8 {
        let score = match hours_to_funding {
            Some(h) if h < 0.5 => 2.0,
            Some(h) if h < 3.0 => 7.0,
            Some(h) if h < 4.0 => 10.0,
            Some(h) if h <= 6.0 => 15.0,
            Some(h) if h <= 7.0 => 10.0,
            Some(_) => 5.0,
            None => 8.0,
        };
        clamp(score, 15)
    }

    /// Position size recommendation from the total score and the configured
    /// maximum M: ≥80 → M, ≥70 → M/2, ≥60 → M/5, else M/10.
    pub fn recommended_size(total: u8, max_position_size_usd: Decimal) -> Decimal {
        if total >= 80 {
            max_position_size_usd
        } else if total >= 70 {
            max_position_size_usd * Decimal::new(5, 1)
        } else if total >= 60 {
            max_position_size_usd * Decimal::new(2, 1)
        } else {
            max_position_size_usd * Decimal::new(1, 1)
        }
    }
}

fn clamp(score: f64, max: u8) -> u8 {
    score.round().clamp(0.0, max as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::funding::{FundingRate, RateSource};
    use rust_decimal_macros::dec;

    fn spread(long: &str, short: &str, long_rate: Decimal, short_rate: Decimal) -> Spread {
        let a = FundingRate::new(long, "BTC/USDT:USDT", long_rate, 8, RateSource::ExchangeApi);
        let b = FundingRate::new(short, "BTC/USDT:USDT", short_rate, 8, RateSource::ExchangeApi);
        Spread::from_pair("BTC", &a, &b)
    }

    fn btc_spread(apr_driver: Decimal) -> Spread {
        spread("binance_futures", "bybit_futures", dec!(0.0), apr_driver)
    }

    #[test]
    fn total_is_sum_of_components_and_within_bands() {
        let s = btc_spread(dec!(0.0003));
        let scores = UosScorer::score(&s, &ScoreContext::default());

        assert_eq!(
            scores.total(),
            scores.return_score + scores.risk_score + scores.execution_score + scores.timing_score
        );
        assert!(scores.return_score <= 30);
        assert!(scores.risk_score <= 30);
        assert!(scores.execution_score <= 25);
        assert!(scores.timing_score <= 15);
        assert!(scores.total() <= 100);
    }

    #[test]
    fn higher_apr_scores_higher_return() {
        let low = UosScorer::score(&btc_spread(dec!(0.0001)), &ScoreContext::default());
        let high = UosScorer::score(&btc_spread(dec!(0.0005)), &ScoreContext::default());
        assert!(high.return_score > low.return_score);
    }

    #[test]
    fn return_score_saturates() {
        let huge = UosScorer::score(&btc_spread(dec!(0.009)), &ScoreContext::default());
        assert!(huge.return_score <= 30);
    }

    #[test]
    fn tier1_pair_outranks_mixed_pair() {
        let ctx = ScoreContext::default();
        let tier1 = UosScorer::score(
            &spread("binance_futures", "okex_futures", dec!(0.0001), dec!(0.0004)),
            &ctx,
        );
        let mixed = UosScorer::score(
            &spread("binance_futures", "gate_futures", dec!(0.0001), dec!(0.0004)),
            &ctx,
        );
        let dex = UosScorer::score(
            &spread("binance_futures", "hyperliquid_futures", dec!(0.0001), dec!(0.0004)),
            &ctx,
        );
        assert!(tier1.risk_score > mixed.risk_score);
        assert!(mixed.risk_score > dex.risk_score);
    }

    #[test]
    fn volatility_erodes_risk_score() {
        let s = btc_spread(dec!(0.0003));
        let calm = UosScorer::score(&s, &ScoreContext::default());
        let choppy = UosScorer::score(
            &s,
            &ScoreContext {
                rate_volatility: Some(0.0005),
                ..ScoreContext::default()
            },
        );
        assert!(choppy.risk_score < calm.risk_score);
    }

    #[test]
    fn single_source_data_is_capped() {
        let s = btc_spread(dec!(0.0003));
        let single = UosScorer::score(
            &s,
            &ScoreContext {
                single_source: true,
                ..ScoreContext::default()
            },
        );
        assert!(single.risk_score <= 15);
    }

    #[test]
    fn slippage_and_reliability_erode_execution_score() {
        let s = btc_spread(dec!(0.0003));
        let clean = UosScorer::score(&s, &ScoreContext::default());
        let slippy = UosScorer::score(
            &s,
            &ScoreContext {
                estimated_slippage_pct: 1.0,
                ..ScoreContext::default()
            },
        );
        let flaky = UosScorer::score(
            &s,
            &ScoreContext {
                short_reliability: 0.5,
                ..ScoreContext::default()
            },
        );
        assert!(slippy.execution_score < clean.execution_score);
        assert!(flaky.execution_score < clean.execution_score);
    }

    #[test]
    fn shallow_book_is_penalized() {
        let s = btc_spread(dec!(0.0003));
        let deep = UosScorer::score(
            &s,
            &ScoreContext {
                available_depth_usd: Some(dec!(100000)),
                intended_size_usd: dec!(1000),
                ..ScoreContext::default()
            },
        );
        let shallow = UosScorer::score(
            &s,
            &ScoreContext {
                available_depth_usd: Some(dec!(1500)),
                intended_size_usd: dec!(1000),
                ..ScoreContext::default()
            },
        );
        assert!(shallow.execution_score < deep.execution_score);
    }

    #[test]
    fn timing_peaks_in_four_to_six_hour_band() {
        let s = btc_spread(dec!(0.0003));
        let optimal = UosScorer::score(
            &s,
            &ScoreContext {
                hours_to_next_funding: Some(5.0),
                ..ScoreContext::default()
            },
        );
        assert!(optimal.timing_score >= 12);

        let imminent = UosScorer::score(
            &s,
            &ScoreContext {
                hours_to_next_funding: Some(0.2),
                ..ScoreContext::default()
            },
        );
        let distant = UosScorer::score(
            &s,
            &ScoreContext {
                hours_to_next_funding: Some(9.0),
                ..ScoreContext::default()
            },
        );
        assert!(imminent.timing_score < optimal.timing_score);
        assert!(distant.timing_score < optimal.timing_score);
    }

    #[test]
    fn quality_bands() {
        let exceptional = UosBreakdown {
            return_score: 28,
            risk_score: 26,
            execution_score: 18,
            timing_score: 12,
        };
        assert_eq!(exceptional.quality(), "exceptional");

        let weak = UosBreakdown {
            return_score: 8,
            risk_score: 8,
            execution_score: 4,
            timing_score: 2,
        };
        assert_eq!(weak.quality(), "weak");

        assert_eq!(UosBreakdown::default().quality(), "poor");
    }

    #[test]
    fn size_recommendation_tiers() {
        let max = dec!(5000);
        assert_eq!(UosScorer::recommended_size(85, max), dec!(5000));
        assert_eq!(UosScorer::recommended_size(80, max), dec!(5000));
        assert_eq!(UosScorer::recommended_size(72, max), dec!(2500.0));
        assert_eq!(UosScorer::recommended_size(63, max), dec!(1000.0));
        assert_eq!(UosScorer::recommended_size(50, max), dec!(500.0));
    }
}
