// =============================================================================
// Venue specification tables
// =============================================================================
//
// All per-venue knowledge lives here as data, not subclasses: slug mapping,
// REST paths, request-semaphore width, error-code tables, and the risk tier
// used by the scorer. The generic adapter reads its venue's row; the native
// adapters (Hyperliquid, dYdX) have their own rows with ApiType::Native.
// =============================================================================

use super::errors::ExchangeErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiType {
    /// Generic signed-REST path shared by the CEX venues.
    Generic,
    /// Venue-specific protocol (Hyperliquid, dYdX).
    Native,
}

/// Static description of one venue.
#[derive(Debug, Clone)]
pub struct VenueSpec {
    /// Canonical slug used in the database and events ("binance_futures").
    pub slug: &'static str,
    /// Short name as it appears in market data ("binance").
    pub short_name: &'static str,
    pub display_name: &'static str,
    pub api_type: ApiType,
    pub base_url: &'static str,
    /// Risk tier: 1 = deep-liquidity CEX, 2 = smaller CEX, 3 = DEX.
    pub tier: u8,
    /// Width of the per-venue in-flight request semaphore.
    pub request_permits: usize,
    /// Default hours between funding settlements.
    pub funding_interval_hours: u32,
    /// Venue error codes mapped to the normalized taxonomy.
    pub error_codes: &'static [(&'static str, ExchangeErrorKind)],
}

const BINANCE_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("-1003", ExchangeErrorKind::RateLimited),
    ("-1013", ExchangeErrorKind::Precision),
    ("-1111", ExchangeErrorKind::Precision),
    ("-1121", ExchangeErrorKind::InvalidSymbol),
    ("-2010", ExchangeErrorKind::InsufficientBalance),
    ("-2019", ExchangeErrorKind::InsufficientBalance),
    ("-2015", ExchangeErrorKind::Auth),
    ("-4164", ExchangeErrorKind::NotionalTooSmall),
];

const BYBIT_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("10003", ExchangeErrorKind::Auth),
    ("10006", ExchangeErrorKind::RateLimited),
    ("110007", ExchangeErrorKind::InsufficientBalance),
    ("110017", ExchangeErrorKind::NotionalTooSmall),
    ("110009", ExchangeErrorKind::Precision),
    ("10001", ExchangeErrorKind::InvalidSymbol),
];

const OKX_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("50011", ExchangeErrorKind::RateLimited),
    ("50111", ExchangeErrorKind::Auth),
    ("51008", ExchangeErrorKind::InsufficientBalance),
    ("51020", ExchangeErrorKind::NotionalTooSmall),
    ("51000", ExchangeErrorKind::InvalidSymbol),
];

const GATE_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("INVALID_KEY", ExchangeErrorKind::Auth),
    ("BALANCE_NOT_ENOUGH", ExchangeErrorKind::InsufficientBalance),
    ("INVALID_PARAM_VALUE", ExchangeErrorKind::Precision),
    ("CONTRACT_NOT_FOUND", ExchangeErrorKind::InvalidSymbol),
    ("TOO_MANY_REQUESTS", ExchangeErrorKind::RateLimited),
];

const KUCOIN_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("400100", ExchangeErrorKind::Auth),
    ("200004", ExchangeErrorKind::InsufficientBalance),
    ("300003", ExchangeErrorKind::InsufficientBalance),
    ("429000", ExchangeErrorKind::RateLimited),
];

const BITGET_CODES: &[(&str, ExchangeErrorKind)] = &[
    ("40037", ExchangeErrorKind::Auth),
    ("43012", ExchangeErrorKind::InsufficientBalance),
    ("45110", ExchangeErrorKind::NotionalTooSmall),
    ("429", ExchangeErrorKind::RateLimited),
];

const HYPERLIQUID_CODES: &[(&str, ExchangeErrorKind)] = &[];
const DYDX_CODES: &[(&str, ExchangeErrorKind)] = &[];

/// The eight venues the engine tracks.
pub static VENUES: &[VenueSpec] = &[
    VenueSpec {
        slug: "binance_futures",
        short_name: "binance",
        display_name: "Binance Futures",
        api_type: ApiType::Generic,
        base_url: "https://fapi.binance.com",
        tier: 1,
        request_permits: 10,
        funding_interval_hours: 8,
        error_codes: BINANCE_CODES,
    },
    VenueSpec {
        slug: "bybit_futures",
        short_name: "bybit",
        display_name: "Bybit",
        api_type: ApiType::Generic,
        base_url: "https://api.bybit.com",
        tier: 1,
        request_permits: 10,
        funding_interval_hours: 8,
        error_codes: BYBIT_CODES,
    },
    VenueSpec {
        slug: "okex_futures",
        short_name: "okx",
        display_name: "OKX",
        api_type: ApiType::Generic,
        base_url: "https://www.okx.com",
        tier: 1,
        request_permits: 10,
        funding_interval_hours: 8,
        error_codes: OKX_CODES,
    },
    VenueSpec {
        slug: "gate_futures",
        short_name: "gate",
        display_name: "Gate.io",
        api_type: ApiType::Generic,
        base_url: "https://api.gateio.ws",
        tier: 2,
        request_permits: 5,
        funding_interval_hours: 8,
        error_codes: GATE_CODES,
    },
    VenueSpec {
        slug: "kucoin_futures",
        short_name: "kucoin",
        display_name: "KuCoin Futures",
        api_type: ApiType::Generic,
        base_url: "https://api-futures.kucoin.com",
        tier: 2,
        request_permits: 5,
        funding_interval_hours: 8,
        error_codes: KUCOIN_CODES,
    },
    VenueSpec {
        slug: "bitget_futures",
        short_name: "bitget",
        display_name: "Bitget",
        api_type: ApiType::Generic,
        base_url: "https://api.bitget.com",
        tier: 2,
        request_permits: 5,
        funding_interval_hours: 8,
        error_codes: BITGET_CODES,
    },
    VenueSpec {
        slug: "hyperliquid_futures",
        short_name: "hyperliquid",
        display_name: "Hyperliquid",
        api_type: ApiType::Native,
        base_url: "https://api.hyperliquid.xyz",
        tier: 3,
        request_permits: 5,
        funding_interval_hours: 1,
        error_codes: HYPERLIQUID_CODES,
    },
    VenueSpec {
        slug: "dydx_futures",
        short_name: "dydx",
        display_name: "dYdX v4",
        api_type: ApiType::Native,
        base_url: "https://indexer.dydx.trade",
        tier: 3,
        request_permits: 5,
        funding_interval_hours: 1,
        error_codes: DYDX_CODES,
    },
];

pub fn venue_by_slug(slug: &str) -> Option<&'static VenueSpec> {
    VENUES.iter().find(|v| v.slug == slug)
}

/// Normalize any exchange name (short or slug) to the canonical slug.
/// Unknown names pass through unchanged so they can be surfaced in errors.
pub fn normalize_slug(name: &str) -> String {
    let lower = name.to_lowercase();
    if let Some(v) = VENUES.iter().find(|v| v.slug == lower) {
        return v.slug.to_string();
    }
    if let Some(v) = VENUES
        .iter()
        .find(|v| v.short_name == lower || lower == format!("{}_futures", v.short_name))
    {
        return v.slug.to_string();
    }
    // A couple of common aliases.
    match lower.as_str() {
        "okex" => "okex_futures".to_string(),
        _ => lower,
    }
}

/// Risk tier for an exchange name in any form; unknown venues rank worst.
pub fn tier_of(name: &str) -> u8 {
    let slug = normalize_slug(name);
    venue_by_slug(&slug).map(|v| v.tier).unwrap_or(3)
}

/// The perpetual symbol format used across adapters: "BASE/USDT:USDT".
pub fn perp_symbol(base: &str) -> String {
    let mut b = base.to_uppercase();
    if let Some(idx) = b.find('/') {
        b.truncate(idx);
    }
    for suffix in ["USDT", "USD", "PERP"] {
        if b.ends_with(suffix) && b.len() > suffix.len() {
            b.truncate(b.len() - suffix.len());
            break;
        }
    }
    format!("{b}/USDT:USDT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eight_venues_tracked() {
        assert_eq!(VENUES.len(), 8);
    }

    #[test]
    fn normalize_short_names_to_slugs() {
        assert_eq!(normalize_slug("binance"), "binance_futures");
        assert_eq!(normalize_slug("BYBIT"), "bybit_futures");
        assert_eq!(normalize_slug("okx"), "okex_futures");
        assert_eq!(normalize_slug("okex"), "okex_futures");
        assert_eq!(normalize_slug("hyperliquid_futures"), "hyperliquid_futures");
        assert_eq!(normalize_slug("unlisted"), "unlisted");
    }

    #[test]
    fn tiers_rank_cex_above_dex() {
        assert_eq!(tier_of("binance"), 1);
        assert_eq!(tier_of("gate"), 2);
        assert_eq!(tier_of("hyperliquid"), 3);
        assert_eq!(tier_of("who_knows"), 3);
    }

    #[test]
    fn perp_symbol_normalizes_all_shapes() {
        assert_eq!(perp_symbol("BTC"), "BTC/USDT:USDT");
        assert_eq!(perp_symbol("btcusdt"), "BTC/USDT:USDT");
        assert_eq!(perp_symbol("ETH/USDT"), "ETH/USDT:USDT");
    }

    #[test]
    fn binance_insufficient_margin_code_is_mapped() {
        let venue = venue_by_slug("binance_futures").unwrap();
        let kind = venue
            .error_codes
            .iter()
            .find(|(c, _)| *c == "-2019")
            .map(|(_, k)| *k);
        assert_eq!(kind, Some(ExchangeErrorKind::InsufficientBalance));
    }
}
