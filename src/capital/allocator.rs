// =============================================================================
// Capital Allocator — pools, reservations, the concurrent-coin cap
// =============================================================================
//
// reserve/confirm/release move amounts between the free capital, the pending
// pool and the active pool; reserved amounts expire if execution never
// confirms them. Every enforcement cycle re-reads the authoritative active
// coin count from the store and, when over the cap, unwinds the weakest
// positions first.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{ActivityEvent, EventBus, ExecutionRequest};
use crate::detector::Opportunity;
use crate::positions::manager::PendingCloses;
use crate::positions::{ExitReason, Position};
use crate::risk::{ExposureContext, RiskManager, TradeCheck};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

use super::{Allocation, AllocationStatus, CapitalState, VenueBalance};

const COMPONENT: &str = "capital-allocator";

/// An auto-execute handoff awaiting its position_opened confirmation.
#[derive(Debug, Clone)]
struct PendingConfirm {
    allocation_id: String,
    deadline: chrono::DateTime<Utc>,
}

pub struct CapitalAllocator {
    store: Store,
    bus: EventBus,
    risk: Arc<RiskManager>,
    config: Arc<RwLock<RuntimeConfig>>,
    pending_closes: PendingCloses,

    allocations: RwLock<HashMap<String, Allocation>>,
    capital: RwLock<CapitalState>,
    /// opportunity_id -> pending confirmation.
    pending_confirms: RwLock<HashMap<String, PendingConfirm>>,
}

impl CapitalAllocator {
    pub fn new(
        store: Store,
        bus: EventBus,
        risk: Arc<RiskManager>,
        config: Arc<RwLock<RuntimeConfig>>,
        pending_closes: PendingCloses,
    ) -> Self {
        let reserve_target = {
            let cfg = config.read();
            Decimal::try_from(cfg.reserve_target_pct).unwrap_or(Decimal::from(20))
        };
        Self {
            store,
            bus,
            risk,
            config,
            pending_closes,
            allocations: RwLock::new(HashMap::new()),
            capital: RwLock::new(CapitalState::new(reserve_target)),
            pending_confirms: RwLock::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Core operations
    // -------------------------------------------------------------------------

    /// Reserve capital for an opportunity. Fails when the free pool cannot
    /// cover the amount.
    pub fn reserve(
        &self,
        opportunity_id: &str,
        venue: &str,
        symbol: &str,
        amount_usd: Decimal,
        ttl_secs: i64,
    ) -> Result<Allocation, String> {
        let mut capital = self.capital.write();
        let available = capital.available_for_allocation();
        if amount_usd > available {
            return Err(format!(
                "requested {amount_usd} exceeds available {available}"
            ));
        }

        capital.pending_pool.add(venue, amount_usd);
        drop(capital);

        let allocation = Allocation::reserved(opportunity_id, venue, symbol, amount_usd, ttl_secs);
        info!(
            allocation_id = %allocation.id,
            opportunity_id,
            venue,
            amount = %amount_usd,
            "capital reserved"
        );
        self.allocations
            .write()
            .insert(allocation.id.clone(), allocation.clone());
        Ok(allocation)
    }

    /// Reserved -> deployed; the amount moves pending -> active.
    pub fn confirm(&self, allocation_id: &str, position_id: &str) -> Result<(), String> {
        let mut allocations = self.allocations.write();
        let allocation = allocations
            .get_mut(allocation_id)
            .ok_or_else(|| format!("unknown allocation {allocation_id}"))?;

        if allocation.status != AllocationStatus::Reserved {
            return Err(format!(
                "allocation {allocation_id} is {}, not reserved",
                allocation.status
            ));
        }

        let mut capital = self.capital.write();
        if !capital
            .pending_pool
            .remove(&allocation.venue, allocation.amount_usd)
        {
            return Err("pending pool does not hold the reserved amount".to_string());
        }
        capital.active_pool.add(&allocation.venue, allocation.amount_usd);
        drop(capital);

        allocation.status = AllocationStatus::Deployed;
        allocation.position_id = Some(position_id.to_string());
        allocation.deployed_at = Some(Utc::now());
        info!(allocation_id, position_id, "allocation deployed");
        Ok(())
    }

    /// Reserved or deployed -> released; the amount returns to free capital.
    pub fn release(&self, allocation_id: &str) -> Result<(), String> {
        let mut allocations = self.allocations.write();
        let allocation = allocations
            .get_mut(allocation_id)
            .ok_or_else(|| format!("unknown allocation {allocation_id}"))?;

        let mut capital = self.capital.write();
        let removed = match allocation.status {
            AllocationStatus::Reserved => capital
                .pending_pool
                .remove(&allocation.venue, allocation.amount_usd),
            AllocationStatus::Deployed | AllocationStatus::Releasing => capital
                .active_pool
                .remove(&allocation.venue, allocation.amount_usd),
            AllocationStatus::Released => return Err("allocation already released".to_string()),
        };
        drop(capital);

        if !removed {
            warn!(allocation_id, "pool did not hold the allocated amount");
        }

        allocation.status = AllocationStatus::Released;
        allocation.released_at = Some(Utc::now());
        info!(allocation_id, "allocation released");
        Ok(())
    }

    /// Release reserved allocations past their expiry and pending confirms
    /// past their deadline. Runs every minute.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let expired: Vec<String> = self
            .allocations
            .read()
            .values()
            .filter(|a| a.is_expired(now))
            .map(|a| a.id.clone())
            .collect();

        for id in &expired {
            if let Err(e) = self.release(id) {
                warn!(allocation_id = %id, error = %e, "failed to release expired allocation");
            }
        }

        // Auto-execute handoffs that never produced a position.
        let timed_out: Vec<(String, String)> = self
            .pending_confirms
            .read()
            .iter()
            .filter(|(_, p)| now > p.deadline)
            .map(|(opp, p)| (opp.clone(), p.allocation_id.clone()))
            .collect();

        for (opportunity_id, allocation_id) in &timed_out {
            self.pending_confirms.write().remove(opportunity_id);
            if let Err(e) = self.release(allocation_id) {
                debug!(allocation_id = %allocation_id, error = %e, "timed-out allocation already settled");
            } else {
                warn!(opportunity_id = %opportunity_id, "execution confirmation timed out, capital released");
            }
        }

        expired.len() + timed_out.len()
    }

    // -------------------------------------------------------------------------
    // Balance refresh
    // -------------------------------------------------------------------------

    pub fn apply_balances(&self, balances: Vec<VenueBalance>) {
        let mut capital = self.capital.write();
        capital.refresh_from_venues(balances);
    }

    pub fn capital_state(&self) -> CapitalState {
        self.capital.read().clone()
    }

    pub fn allocations_snapshot(&self) -> Vec<Allocation> {
        self.allocations.read().values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Auto-execute flow
    // -------------------------------------------------------------------------

    /// Capital-side gate for an opportunity the detector wants executed:
    /// skip same-symbol doubles and cap overflow, reserve, risk-validate,
    /// then publish the execution request.
    ///
    /// Ok(true) = request published; Ok(false) = skipped quietly;
    /// Err = declined with a reason worth logging.
    pub async fn request_auto_execute(&self, opportunity: &Opportunity) -> Result<bool, String> {
        let config = self.config.read().clone();

        if self.is_symbol_active(&opportunity.symbol).await {
            debug!(symbol = %opportunity.symbol, "symbol already active, skipping");
            return Ok(false);
        }

        // At the cap new allocations are denied; periodic enforcement deals
        // with overflow, never a mid-cycle pre-emption.
        let active_coins = self
            .store
            .count_active_symbols()
            .await
            .map_err(|e| e.to_string())?;
        if active_coins >= config.max_concurrent_coins {
            self.bus.publish_activity(ActivityEvent::info(
                COMPONENT,
                "allocation_skipped",
                format!(
                    "{}: at concurrent coin cap ({active_coins}/{})",
                    opportunity.symbol, config.max_concurrent_coins
                ),
                json!({
                    "opportunity_id": opportunity.id,
                    "symbol": opportunity.symbol,
                    "active_coins": active_coins,
                    "max_concurrent_coins": config.max_concurrent_coins,
                }),
            ));
            return Ok(false);
        }

        let size = opportunity.recommended_size_usd;
        let allocation = self.reserve(
            &opportunity.id,
            &opportunity.long_leg.exchange,
            &opportunity.symbol,
            size,
            config.reservation_ttl_secs,
        )?;

        // Risk validation; on rejection the reservation is returned.
        let exposure = self.build_exposure_context().await;
        let check = TradeCheck {
            opportunity_id: opportunity.id.clone(),
            symbol: opportunity.symbol.clone(),
            size_usd: size,
            long_exchange: opportunity.long_leg.exchange.clone(),
            short_exchange: opportunity.short_leg.exchange.clone(),
            leverage: Decimal::from(config.default_leverage),
        };
        let decision = self.risk.validate_trade(&check, &exposure);
        if !decision.approved {
            let _ = self.release(&allocation.id);
            return Err(decision.rejections.join("; "));
        }

        self.pending_confirms.write().insert(
            opportunity.id.clone(),
            PendingConfirm {
                allocation_id: allocation.id.clone(),
                deadline: Utc::now() + chrono::Duration::seconds(config.reservation_ttl_secs),
            },
        );

        self.bus.publish_execution_request(ExecutionRequest {
            opportunity_id: opportunity.id.clone(),
            symbol: opportunity.symbol.clone(),
            position_size_usd: size,
            long_exchange: opportunity.long_leg.exchange.clone(),
            short_exchange: opportunity.short_leg.exchange.clone(),
            uos_score: opportunity.uos_score(),
            auto_executed: true,
            timestamp: Utc::now(),
        });

        Ok(true)
    }

    async fn is_symbol_active(&self, symbol: &str) -> bool {
        let in_allocations = self
            .allocations
            .read()
            .values()
            .any(|a| !a.status.is_terminal() && a.symbol.eq_ignore_ascii_case(symbol));
        if in_allocations {
            return true;
        }

        match self.store.load_open_positions().await {
            Ok(positions) => positions
                .iter()
                .any(|p| p.base_asset.eq_ignore_ascii_case(symbol)),
            Err(_) => false,
        }
    }

    pub async fn build_exposure_context(&self) -> ExposureContext {
        let total_capital_usd = self.capital.read().total_capital_usd;
        let mut venue_exposure: HashMap<String, Decimal> = HashMap::new();
        let mut asset_exposure: HashMap<String, Decimal> = HashMap::new();
        let mut gross = Decimal::ZERO;

        if let Ok(positions) = self.store.load_open_positions().await {
            for position in &positions {
                for leg in &position.legs {
                    *venue_exposure
                        .entry(leg.exchange.clone())
                        .or_insert(Decimal::ZERO) += leg.notional_usd;
                    gross += leg.notional_usd;
                }
                *asset_exposure
                    .entry(position.base_asset.clone())
                    .or_insert(Decimal::ZERO) += position.total_capital_deployed;
            }
        }

        ExposureContext {
            total_capital_usd,
            venue_exposure,
            asset_exposure,
            gross_exposure: gross,
        }
    }

    /// position_opened arrived: confirm the matching reservation.
    pub fn on_position_opened(&self, opportunity_id: &str, position_id: &str) {
        let pending = self.pending_confirms.write().remove(opportunity_id);
        if let Some(p) = pending {
            if let Err(e) = self.confirm(&p.allocation_id, position_id) {
                warn!(opportunity_id, error = %e, "failed to confirm allocation");
            }
        }
    }

    /// position_closed arrived: release the deployed capital.
    pub fn on_position_closed(&self, position_id: &str) {
        let allocation_id = self
            .allocations
            .read()
            .values()
            .find(|a| {
                a.status == AllocationStatus::Deployed
                    && a.position_id.as_deref() == Some(position_id)
            })
            .map(|a| a.id.clone());

        if let Some(id) = allocation_id {
            if let Err(e) = self.release(&id) {
                warn!(position_id, error = %e, "failed to release allocation on close");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Concurrent-coin cap enforcement
    // -------------------------------------------------------------------------

    /// Weakness score: higher = closed first. Profitable positions go
    /// negative and survive.
    pub fn weakness_score(position: &Position, now: chrono::DateTime<Utc>) -> f64 {
        let funding = position.net_funding_pnl().to_f64().unwrap_or(0.0);
        let unrealized = position.total_unrealized_pnl().to_f64().unwrap_or(0.0);
        let return_pct = position.return_pct().to_f64().unwrap_or(0.0);
        let hours_open = position.hold_duration_hours(now).unwrap_or(0.0);

        let mut score = 0.0;
        // Bleeding funding is the whole strategy failing: heaviest weight.
        score -= funding * 3.0;
        score -= unrealized * 2.0;
        // Held long while losing.
        score += hours_open * (-return_pct).max(0.0) * 0.5;
        // Funding run-rate vs. the configured floor.
        if position.funding_periods_collected > 0 {
            let per_period = funding / position.funding_periods_collected as f64;
            let target = position
                .exit_policy
                .target_funding_rate_min
                .to_f64()
                .unwrap_or(0.005);
            if target > 0.0 {
                let ratio = per_period / target;
                if ratio < 1.0 {
                    score += (1.0 - ratio).min(2.0) * 10.0;
                }
            }
        }
        score
    }

    /// Query the authoritative coin count and unwind the weakest positions
    /// when over the limit.
    pub async fn enforce_coin_limit(&self) {
        let max_coins = self.config.read().max_concurrent_coins;
        let active = match self.store.count_active_symbols().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to count active coins");
                return;
            }
        };

        if active <= max_coins {
            return;
        }
        let excess = active - max_coins;

        let positions = match self.store.load_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to load positions for enforcement");
                return;
            }
        };

        let now = Utc::now();
        let mut ranked: Vec<&Position> = positions
            .iter()
            .filter(|p| p.status == crate::positions::PositionStatus::Active)
            .collect();
        ranked.sort_by(|a, b| {
            Self::weakness_score(b, now)
                .partial_cmp(&Self::weakness_score(a, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        info!(
            active,
            max_coins, excess, "concurrent coin cap exceeded, unwinding weakest positions"
        );

        for position in ranked.into_iter().take(excess) {
            self.pending_closes.lock().insert(position.id.clone());

            let event = ActivityEvent::warning(
                COMPONENT,
                "auto_unwind",
                format!(
                    "closing weakest position {} ({}) to respect the coin cap",
                    position.symbol, position.id
                ),
                json!({
                    "position_id": position.id,
                    "symbol": position.symbol,
                    "weakness_score": Self::weakness_score(position, now),
                    "exit_reason": ExitReason::AutoUnwind.as_str(),
                    "active_coins": active,
                    "max_concurrent_coins": max_coins,
                }),
            );
            if let Err(e) = self.store.insert_activity_event(&event).await {
                warn!(error = %e, "failed to persist auto_unwind event");
            }
            self.bus.publish_activity(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::manager::new_pending_closes;
    use crate::positions::{LegType, PositionStatus};
    use crate::risk::RiskLimits;
    use crate::store::positions::new_leg;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn allocator() -> CapitalAllocator {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let risk = Arc::new(RiskManager::new(RiskLimits::default()));
        let config = Arc::new(RwLock::new(RuntimeConfig::default()));
        CapitalAllocator::new(store, bus, risk, config, new_pending_closes())
    }

    fn fund(alloc: &CapitalAllocator, total: Decimal) {
        alloc.apply_balances(vec![VenueBalance {
            venue: "binance_futures".into(),
            total_usd: total,
            ..Default::default()
        }]);
    }

    #[test]
    fn reserve_confirm_release_conserves_mass() {
        let alloc = allocator();
        fund(&alloc, dec!(10000));

        let total_before = alloc.capital_state().total_capital_usd;
        let a = alloc
            .reserve("opp-1", "binance_futures", "BTC", dec!(1000), 300)
            .unwrap();
        {
            let state = alloc.capital_state();
            assert_eq!(state.pending_pool.total_value_usd, dec!(1000));
            assert!(state.mass_is_conserved());
        }

        alloc.confirm(&a.id, "pos-1").unwrap();
        {
            let state = alloc.capital_state();
            assert_eq!(state.pending_pool.total_value_usd, Decimal::ZERO);
            assert_eq!(state.active_pool.total_value_usd, dec!(1000));
            assert!(state.mass_is_conserved());
        }

        alloc.release(&a.id).unwrap();
        {
            let state = alloc.capital_state();
            assert_eq!(state.active_pool.total_value_usd, Decimal::ZERO);
            assert_eq!(state.total_capital_usd, total_before);
            assert!(state.mass_is_conserved());
        }
    }

    #[test]
    fn reserve_fails_beyond_available() {
        let alloc = allocator();
        fund(&alloc, dec!(1000));
        // 20% reserve target leaves 800 available.
        assert!(alloc.reserve("opp-1", "binance_futures", "BTC", dec!(900), 300).is_err());
        assert!(alloc.reserve("opp-1", "binance_futures", "BTC", dec!(800), 300).is_ok());
    }

    #[test]
    fn double_confirm_is_rejected() {
        let alloc = allocator();
        fund(&alloc, dec!(10000));
        let a = alloc
            .reserve("opp-1", "binance_futures", "BTC", dec!(500), 300)
            .unwrap();
        alloc.confirm(&a.id, "pos-1").unwrap();
        assert!(alloc.confirm(&a.id, "pos-1").is_err());
    }

    #[test]
    fn expired_reservations_are_released_by_cleanup() {
        let alloc = allocator();
        fund(&alloc, dec!(10000));
        let a = alloc
            .reserve("opp-1", "binance_futures", "BTC", dec!(500), -1)
            .unwrap();
        assert_eq!(alloc.cleanup_expired(), 1);
        let state = alloc.capital_state();
        assert_eq!(state.pending_pool.total_value_usd, Decimal::ZERO);
        assert_eq!(
            alloc.allocations_snapshot()[0].status,
            AllocationStatus::Released
        );
        drop(a);
    }

    fn losing_position(symbol: &str, funding: Decimal, hours_ago: i64) -> Position {
        let mut pos = Position::new(format!("{symbol}/USDT:USDT"), None);
        pos.status = PositionStatus::Active;
        pos.total_capital_deployed = dec!(1000);
        pos.funding_received = if funding > Decimal::ZERO { funding } else { Decimal::ZERO };
        pos.funding_paid = if funding < Decimal::ZERO { -funding } else { Decimal::ZERO };
        pos.opened_at = Some(Utc::now() - chrono::Duration::hours(hours_ago));
        pos.legs = vec![new_leg(
            &pos.id,
            LegType::Primary,
            "binance_futures",
            "BTC/USDT:USDT",
            OrderSide::Long,
            dec!(0.1),
            dec!(30000),
            dec!(3000),
            dec!(3),
        )];
        pos
    }

    #[test]
    fn weakness_ranks_bleeders_above_earners() {
        let now = Utc::now();
        let winner = losing_position("BTC", dec!(50), 2);
        let bleeder = losing_position("DOGE", dec!(-10), 24);

        let winner_score = CapitalAllocator::weakness_score(&winner, now);
        let bleeder_score = CapitalAllocator::weakness_score(&bleeder, now);

        assert!(bleeder_score > winner_score);
        assert!(winner_score < 0.0);
    }

    #[test]
    fn longer_held_losses_rank_weaker() {
        let now = Utc::now();
        let fresh = losing_position("ETH", dec!(-10), 1);
        let stale = losing_position("SOL", dec!(-10), 24);
        assert!(
            CapitalAllocator::weakness_score(&stale, now)
                > CapitalAllocator::weakness_score(&fresh, now)
        );
    }

    #[tokio::test]
    async fn enforcement_queues_weakest_for_close() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let risk = Arc::new(RiskManager::new(RiskLimits::default()));
        let config = Arc::new(RwLock::new(RuntimeConfig {
            max_concurrent_coins: 3,
            ..RuntimeConfig::default()
        }));
        let pending = new_pending_closes();
        let alloc = CapitalAllocator::new(
            store.clone(),
            bus,
            risk,
            config,
            pending.clone(),
        );

        // Four active coins; DOGE is the clear bleeder.
        for (symbol, funding, hours) in [
            ("BTC", dec!(40), 2),
            ("ETH", dec!(25), 4),
            ("SOL", dec!(10), 6),
            ("DOGE", dec!(-10), 24),
        ] {
            let pos = losing_position(symbol, funding, hours);
            store.insert_position(&pos).await.unwrap();
        }

        alloc.enforce_coin_limit().await;

        let queued = pending.lock().clone();
        assert_eq!(queued.len(), 1);

        let positions = store.load_open_positions().await.unwrap();
        let doge = positions.iter().find(|p| p.base_asset == "DOGE").unwrap();
        assert!(queued.contains(&doge.id));
    }

    #[tokio::test]
    async fn auto_execute_denied_exactly_at_cap() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let risk = Arc::new(RiskManager::new(RiskLimits::default()));
        let config = Arc::new(RwLock::new(RuntimeConfig {
            max_concurrent_coins: 3,
            ..RuntimeConfig::default()
        }));
        let alloc = CapitalAllocator::new(
            store.clone(),
            bus.clone(),
            risk,
            config,
            new_pending_closes(),
        );
        fund(&alloc, dec!(100000));

        for symbol in ["BTC", "ETH", "SOL"] {
            let pos = losing_position(symbol, dec!(5), 2);
            store.insert_position(&pos).await.unwrap();
        }

        let opportunity = crate::detector::Opportunity {
            id: "opp-avax".into(),
            symbol: "AVAX".into(),
            base_asset: "AVAX".into(),
            status: crate::detector::OpportunityStatus::Detected,
            long_leg: crate::detector::OpportunityLeg {
                exchange: "binance_futures".into(),
                side: OrderSide::Long,
                funding_rate: dec!(0.0001),
                estimated_slippage_pct: dec!(0.1),
            },
            short_leg: crate::detector::OpportunityLeg {
                exchange: "bybit_futures".into(),
                side: OrderSide::Short,
                funding_rate: dec!(0.0004),
                estimated_slippage_pct: dec!(0.1),
            },
            funding_spread: dec!(0.0003),
            funding_spread_pct: dec!(0.03),
            estimated_net_apr: dec!(32.85),
            uos: crate::detector::scorer::UosBreakdown {
                return_score: 25,
                risk_score: 28,
                execution_score: 20,
                timing_score: 12,
            },
            recommended_size_usd: dec!(1000),
            data_source: crate::market_data::funding::RateSource::ExchangeApi,
            detected_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::minutes(30),
        };

        // Exactly at the cap: skipped, no capital reserved, no request sent.
        let mut requests = bus.subscribe_execution_request();
        let published = alloc.request_auto_execute(&opportunity).await.unwrap();
        assert!(!published);
        assert!(requests.try_recv().is_err());
        assert_eq!(alloc.capital_state().pending_pool.total_value_usd, Decimal::ZERO);

        // An operator closes SOL; the next attempt goes through.
        let positions = store.load_open_positions().await.unwrap();
        let mut sol = positions
            .into_iter()
            .find(|p| p.base_asset == "SOL")
            .unwrap();
        sol.status = crate::positions::PositionStatus::Closing;
        store.update_position(&sol).await.unwrap();
        sol.status = crate::positions::PositionStatus::Closed;
        sol.closed_at = Some(Utc::now());
        store.update_position(&sol).await.unwrap();

        let published = alloc.request_auto_execute(&opportunity).await.unwrap();
        assert!(published);
        let request = requests.try_recv().unwrap();
        assert_eq!(request.symbol, "AVAX");
        assert_eq!(alloc.capital_state().pending_pool.total_value_usd, dec!(1000));
    }

    #[tokio::test]
    async fn enforcement_noop_at_or_under_cap() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let risk = Arc::new(RiskManager::new(RiskLimits::default()));
        let config = Arc::new(RwLock::new(RuntimeConfig {
            max_concurrent_coins: 3,
            ..RuntimeConfig::default()
        }));
        let pending = new_pending_closes();
        let alloc = CapitalAllocator::new(store.clone(), bus, risk, config, pending.clone());

        for symbol in ["BTC", "ETH", "SOL"] {
            let pos = losing_position(symbol, dec!(-5), 5);
            store.insert_position(&pos).await.unwrap();
        }

        alloc.enforce_coin_limit().await;
        assert!(pending.lock().is_empty());
    }
}
