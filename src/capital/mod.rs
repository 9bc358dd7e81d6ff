// =============================================================================
// Capital model — pools, allocations, conservation
// =============================================================================
//
// Total capital splits across four pools: reserve (emergency margin), active
// (deployed in positions), pending (reserved for opportunities awaiting
// execution) and transit (moving between venues). Whatever is in no pool is
// free. Every reserve/confirm/release keeps the sum of pools plus free equal
// to total capital.
// =============================================================================

pub mod allocator;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolType {
    Reserve,
    Active,
    Pending,
    Transit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Reserved,
    Deployed,
    Releasing,
    Released,
}

impl AllocationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Deployed => "deployed",
            Self::Releasing => "releasing",
            Self::Released => "released",
        }
    }
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One segment of total capital, tracked per venue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapitalPool {
    pub pool_type: PoolType,
    pub total_value_usd: Decimal,
    /// Venue -> amount.
    pub allocations: HashMap<String, Decimal>,
}

impl CapitalPool {
    pub fn new(pool_type: PoolType) -> Self {
        Self {
            pool_type,
            total_value_usd: Decimal::ZERO,
            allocations: HashMap::new(),
        }
    }

    pub fn add(&mut self, venue: &str, amount: Decimal) {
        *self.allocations.entry(venue.to_string()).or_insert(Decimal::ZERO) += amount;
        self.total_value_usd += amount;
    }

    /// Remove up to `amount` from a venue; fails when the venue holds less.
    pub fn remove(&mut self, venue: &str, amount: Decimal) -> bool {
        let current = self.allocations.get(venue).copied().unwrap_or(Decimal::ZERO);
        if amount > current {
            return false;
        }
        let remaining = current - amount;
        if remaining == Decimal::ZERO {
            self.allocations.remove(venue);
        } else {
            self.allocations.insert(venue.to_string(), remaining);
        }
        self.total_value_usd -= amount;
        true
    }
}

/// Record of capital committed to an opportunity/position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Allocation {
    pub id: String,
    pub opportunity_id: Option<String>,
    pub position_id: Option<String>,
    pub venue: String,
    pub symbol: String,
    pub amount_usd: Decimal,
    pub status: AllocationStatus,
    pub allocated_at: DateTime<Utc>,
    pub deployed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    /// Reserved allocations expire when not confirmed before this time.
    pub expiry: Option<DateTime<Utc>>,
    pub realized_funding_pnl: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
}

impl Allocation {
    pub fn reserved(
        opportunity_id: &str,
        venue: &str,
        symbol: &str,
        amount_usd: Decimal,
        ttl_secs: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            opportunity_id: Some(opportunity_id.to_string()),
            position_id: None,
            venue: venue.to_string(),
            symbol: symbol.to_string(),
            amount_usd,
            status: AllocationStatus::Reserved,
            allocated_at: Utc::now(),
            deployed_at: None,
            released_at: None,
            expiry: Some(Utc::now() + chrono::Duration::seconds(ttl_secs)),
            realized_funding_pnl: None,
            unrealized_pnl: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, AllocationStatus::Reserved)
            && self.expiry.map(|e| now > e).unwrap_or(false)
    }
}

/// Per-venue balance as the balance monitor sees it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VenueBalance {
    pub venue: String,
    pub total_usd: Decimal,
    pub margin_used: Decimal,
    pub margin_available: Decimal,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReserveHealth {
    Healthy,
    Low,
    Critical,
}

/// Global view of capital across pools and venues.
#[derive(Debug, Clone, Serialize)]
pub struct CapitalState {
    pub total_capital_usd: Decimal,
    pub reserve_pool: CapitalPool,
    pub active_pool: CapitalPool,
    pub pending_pool: CapitalPool,
    pub transit_pool: CapitalPool,
    pub venue_balances: HashMap<String, VenueBalance>,
    /// Target share of total capital kept in reserve, percent.
    pub reserve_target_pct: Decimal,
    pub updated_at: DateTime<Utc>,
}

impl CapitalState {
    pub fn new(reserve_target_pct: Decimal) -> Self {
        Self {
            total_capital_usd: Decimal::ZERO,
            reserve_pool: CapitalPool::new(PoolType::Reserve),
            active_pool: CapitalPool::new(PoolType::Active),
            pending_pool: CapitalPool::new(PoolType::Pending),
            transit_pool: CapitalPool::new(PoolType::Transit),
            venue_balances: HashMap::new(),
            reserve_target_pct,
            updated_at: Utc::now(),
        }
    }

    pub fn committed(&self) -> Decimal {
        self.reserve_pool.total_value_usd
            + self.active_pool.total_value_usd
            + self.pending_pool.total_value_usd
            + self.transit_pool.total_value_usd
    }

    /// Free capital = total − reserve target − committed (excluding the
    /// reserve pool itself, which counts toward the target).
    pub fn available_for_allocation(&self) -> Decimal {
        let reserve_min = self.total_capital_usd * self.reserve_target_pct / Decimal::from(100);
        let reserve_shortfall = (reserve_min - self.reserve_pool.total_value_usd).max(Decimal::ZERO);
        let used = self.active_pool.total_value_usd
            + self.pending_pool.total_value_usd
            + self.transit_pool.total_value_usd;
        (self.total_capital_usd - self.reserve_pool.total_value_usd - reserve_shortfall - used)
            .max(Decimal::ZERO)
    }

    pub fn reserve_health(&self) -> ReserveHealth {
        let target = self.total_capital_usd * self.reserve_target_pct / Decimal::from(100);
        if self.reserve_pool.total_value_usd >= target {
            ReserveHealth::Healthy
        } else if self.reserve_pool.total_value_usd >= target * Decimal::new(7, 1) {
            ReserveHealth::Low
        } else {
            ReserveHealth::Critical
        }
    }

    /// Refresh total capital and per-venue figures from adapter balances.
    pub fn refresh_from_venues(&mut self, balances: Vec<VenueBalance>) {
        let mut total = Decimal::ZERO;
        self.venue_balances.clear();
        for balance in balances {
            total += balance.total_usd;
            self.venue_balances.insert(balance.venue.clone(), balance);
        }
        self.total_capital_usd = total;
        self.updated_at = Utc::now();
    }

    /// Conservation check: no pool negative and committed capital never
    /// exceeds the total.
    pub fn mass_is_conserved(&self) -> bool {
        let pools = [
            &self.reserve_pool,
            &self.active_pool,
            &self.pending_pool,
            &self.transit_pool,
        ];
        pools.iter().all(|p| p.total_value_usd >= Decimal::ZERO)
            && pools
                .iter()
                .all(|p| p.allocations.values().all(|v| *v >= Decimal::ZERO))
            && self.committed() <= self.total_capital_usd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn state_with_capital(total: Decimal) -> CapitalState {
        let mut state = CapitalState::new(dec!(20));
        state.refresh_from_venues(vec![VenueBalance {
            venue: "binance_futures".into(),
            total_usd: total,
            ..Default::default()
        }]);
        state
    }

    #[test]
    fn pool_add_remove_conserves() {
        let mut pool = CapitalPool::new(PoolType::Pending);
        pool.add("binance_futures", dec!(1000));
        pool.add("bybit_futures", dec!(500));
        assert_eq!(pool.total_value_usd, dec!(1500));

        assert!(pool.remove("binance_futures", dec!(1000)));
        assert_eq!(pool.total_value_usd, dec!(500));
        assert!(!pool.allocations.contains_key("binance_futures"));

        // Cannot remove more than a venue holds.
        assert!(!pool.remove("bybit_futures", dec!(600)));
        assert_eq!(pool.total_value_usd, dec!(500));
    }

    #[test]
    fn available_respects_reserve_target() {
        let state = state_with_capital(dec!(10000));
        // 20% reserve target, nothing reserved yet: 10000 - 2000 = 8000.
        assert_eq!(state.available_for_allocation(), dec!(8000));
    }

    #[test]
    fn reserve_and_deploy_conserve_mass() {
        let mut state = state_with_capital(dec!(10000));

        state.pending_pool.add("binance_futures", dec!(1000));
        assert!(state.mass_is_conserved());
        let before = state.committed();

        // confirm: pending -> active
        assert!(state.pending_pool.remove("binance_futures", dec!(1000)));
        state.active_pool.add("binance_futures", dec!(1000));
        assert_eq!(state.committed(), before);
        assert!(state.mass_is_conserved());

        // release: active -> free
        assert!(state.active_pool.remove("binance_futures", dec!(1000)));
        assert_eq!(state.committed(), before - dec!(1000));
        assert!(state.mass_is_conserved());
    }

    #[test]
    fn reserve_health_bands() {
        let mut state = state_with_capital(dec!(10000));
        state.reserve_pool.add("binance_futures", dec!(2000));
        assert_eq!(state.reserve_health(), ReserveHealth::Healthy);

        assert!(state.reserve_pool.remove("binance_futures", dec!(500)));
        assert_eq!(state.reserve_health(), ReserveHealth::Low);

        assert!(state.reserve_pool.remove("binance_futures", dec!(500)));
        assert_eq!(state.reserve_health(), ReserveHealth::Critical);
    }

    #[test]
    fn reserved_allocation_expires() {
        let alloc = Allocation::reserved("opp-1", "binance_futures", "BTC", dec!(1000), 300);
        assert!(!alloc.is_expired(Utc::now()));
        assert!(alloc.is_expired(Utc::now() + chrono::Duration::seconds(301)));

        let mut deployed = alloc.clone();
        deployed.status = AllocationStatus::Deployed;
        assert!(!deployed.is_expired(Utc::now() + chrono::Duration::seconds(400)));
    }
}
