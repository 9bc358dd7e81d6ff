// =============================================================================
// Shared types used across the Helios funding arbitrage engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Side of a position or order leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Long,
    Short,
}

impl OrderSide {
    /// +1 for long, -1 for short. Used in P&L and delta calculations.
    pub fn multiplier(&self) -> i64 {
        match self {
            Self::Long => 1,
            Self::Short => -1,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "long" | "buy" => Some(Self::Long),
            "short" | "sell" => Some(Self::Short),
            _ => None,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "long"),
            Self::Short => write!(f, "short"),
        }
    }
}

/// Whether the engine hunts opportunities only or also trades them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemMode {
    /// Detect, score and execute.
    Standard,
    /// Detect and score only; no orders leave the engine.
    Discovery,
}

impl Default for SystemMode {
    fn default() -> Self {
        Self::Discovery
    }
}

impl std::fmt::Display for SystemMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Discovery => write!(f, "discovery"),
        }
    }
}

/// Market order vs. limit order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Market => write!(f, "market"),
            Self::Limit => write!(f, "limit"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_multiplier_signs() {
        assert_eq!(OrderSide::Long.multiplier(), 1);
        assert_eq!(OrderSide::Short.multiplier(), -1);
    }

    #[test]
    fn side_parse_accepts_order_verbs() {
        assert_eq!(OrderSide::parse("BUY"), Some(OrderSide::Long));
        assert_eq!(OrderSide::parse("sell"), Some(OrderSide::Short));
        assert_eq!(OrderSide::parse("short"), Some(OrderSide::Short));
        assert_eq!(OrderSide::parse("flat"), None);
    }

    #[test]
    fn default_mode_is_discovery() {
        assert_eq!(SystemMode::default(), SystemMode::Discovery);
    }
}
