// =============================================================================
// Opportunity Detector — pairwise spread enumeration, scoring, lifecycle
// =============================================================================
//
// Consumes the cached spread list, scores each spread, and owns the
// opportunity lifecycle: detection is idempotent over the identity key
// (symbol, long_exchange, short_exchange) among non-terminal opportunities.
// Detection cycles are debounced so a snapshot arrival and the periodic timer
// never double-run within five seconds.
// =============================================================================

pub mod scorer;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app_state::ControlState;
use crate::bus::{ActivityEvent, EventBus, OpportunityEvent, OpportunityEventKind};
use crate::cache::{TtlCache, KEY_FUNDING_SPREADS, KEY_UNIFIED_SNAPSHOT};
use crate::capital::allocator::CapitalAllocator;
use crate::exchanges::venues::normalize_slug;
use crate::market_data::funding::{RateSource, Spread, UnifiedFundingSnapshot};
use crate::risk::RiskManager;
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;
use crate::types::{OrderSide, SystemMode};
use scorer::{ScoreContext, UosBreakdown, UosScorer};

const COMPONENT: &str = "opportunity-detector";
const DEBOUNCE_SECONDS: u64 = 5;

// -----------------------------------------------------------------------------
// Model
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityStatus {
    Detected,
    Validated,
    Scored,
    Allocated,
    Executing,
    Executed,
    Closed,
    Expired,
    Rejected,
}

impl OpportunityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Executed | Self::Closed | Self::Expired | Self::Rejected)
    }

    pub fn can_transition_to(&self, next: OpportunityStatus) -> bool {
        use OpportunityStatus::*;
        if self.is_terminal() {
            return matches!((self, next), (Executed, Closed));
        }
        match next {
            Expired | Rejected => true,
            Validated => matches!(self, Detected),
            Scored => matches!(self, Detected | Validated),
            Allocated => matches!(self, Detected | Validated | Scored),
            Executing => matches!(self, Detected | Validated | Scored | Allocated | Executing),
            Executed => matches!(self, Executing),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Detected => "detected",
            Self::Validated => "validated",
            Self::Scored => "scored",
            Self::Allocated => "allocated",
            Self::Executing => "executing",
            Self::Executed => "executed",
            Self::Closed => "closed",
            Self::Expired => "expired",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "detected" => Some(Self::Detected),
            "validated" => Some(Self::Validated),
            "scored" => Some(Self::Scored),
            "allocated" => Some(Self::Allocated),
            "executing" => Some(Self::Executing),
            "executed" => Some(Self::Executed),
            "closed" => Some(Self::Closed),
            "expired" => Some(Self::Expired),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }
}

impl std::fmt::Display for OpportunityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One side of an opportunity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpportunityLeg {
    pub exchange: String,
    pub side: OrderSide,
    pub funding_rate: Decimal,
    pub estimated_slippage_pct: Decimal,
}

/// A scored funding-arbitrage setup between two venues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: String,
    pub symbol: String,
    pub base_asset: String,
    pub status: OpportunityStatus,
    pub long_leg: OpportunityLeg,
    pub short_leg: OpportunityLeg,
    pub funding_spread: Decimal,
    pub funding_spread_pct: Decimal,
    pub estimated_net_apr: Decimal,
    pub uos: UosBreakdown,
    pub recommended_size_usd: Decimal,
    pub data_source: RateSource,
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn uos_score(&self) -> u8 {
        self.uos.total()
    }

    /// Identity key: unique among non-terminal opportunities.
    pub fn identity_key(&self) -> String {
        identity_key(&self.symbol, &self.long_leg.exchange, &self.short_leg.exchange)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

pub fn identity_key(symbol: &str, long_exchange: &str, short_exchange: &str) -> String {
    format!("{symbol}:{long_exchange}:{short_exchange}")
}

// -----------------------------------------------------------------------------
// Stats
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct DetectorStats {
    pub detection_cycles: u64,
    pub opportunities_detected: u64,
    pub opportunities_updated: u64,
    pub opportunities_expired: u64,
    pub skipped_blacklisted: u64,
    pub skipped_no_credentials: u64,
    pub skipped_below_spread: u64,
    pub skipped_below_score: u64,
    pub auto_executions_triggered: u64,
}

// -----------------------------------------------------------------------------
// Detector
// -----------------------------------------------------------------------------

pub struct OpportunityDetector {
    store: Store,
    bus: EventBus,
    cache: TtlCache,
    risk: Arc<RiskManager>,
    allocator: Arc<CapitalAllocator>,
    control: Arc<ControlState>,
    config: Arc<RwLock<RuntimeConfig>>,
    /// venue -> reliability score, maintained by the collector loops.
    reliability: Arc<RwLock<HashMap<String, f64>>>,

    opportunities: RwLock<HashMap<String, Opportunity>>,
    credentialed_exchanges: RwLock<HashSet<String>>,
    blacklist: RwLock<HashSet<String>>,
    max_position_size_usd: RwLock<Decimal>,
    last_detection: Mutex<Option<Instant>>,
    stats: RwLock<DetectorStats>,
}

impl OpportunityDetector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Store,
        bus: EventBus,
        cache: TtlCache,
        risk: Arc<RiskManager>,
        allocator: Arc<CapitalAllocator>,
        control: Arc<ControlState>,
        config: Arc<RwLock<RuntimeConfig>>,
        reliability: Arc<RwLock<HashMap<String, f64>>>,
    ) -> Self {
        Self {
            store,
            bus,
            cache,
            risk,
            allocator,
            control,
            config,
            reliability,
            opportunities: RwLock::new(HashMap::new()),
            credentialed_exchanges: RwLock::new(HashSet::new()),
            blacklist: RwLock::new(HashSet::new()),
            max_position_size_usd: RwLock::new(Decimal::from(5000)),
            last_detection: Mutex::new(None),
            stats: RwLock::new(DetectorStats::default()),
        }
    }

    // -------------------------------------------------------------------------
    // Startup
    // -------------------------------------------------------------------------

    /// Recover non-terminal unexpired opportunities from the store and load
    /// credentials, blacklist and risk limits.
    pub async fn start(&self) {
        self.refresh_credentials().await;
        self.refresh_blacklist().await;
        self.refresh_risk_limits().await;

        match self.store.load_active_opportunities(Utc::now()).await {
            Ok(recovered) => {
                let count = recovered.len();
                let mut map = self.opportunities.write();
                for opp in recovered {
                    map.insert(opp.id.clone(), opp);
                }
                info!(count, active = map.len(), "recovered opportunities from store");
            }
            Err(e) => warn!(error = %e, "failed to recover opportunities"),
        }
    }

    pub async fn refresh_credentials(&self) {
        match self.store.list_credentialed_exchanges().await {
            Ok(slugs) => {
                let mut set = HashSet::new();
                for slug in slugs {
                    set.insert(slug.replace("_futures", ""));
                    set.insert(slug);
                }
                debug!(count = set.len(), "exchange credential set refreshed");
                *self.credentialed_exchanges.write() = set;
            }
            Err(e) => warn!(error = %e, "failed to load exchange credentials"),
        }
    }

    pub async fn refresh_blacklist(&self) {
        match self.store.list_blacklist().await {
            Ok(entries) => {
                let set: HashSet<String> =
                    entries.into_iter().map(|e| e.symbol.to_uppercase()).collect();
                debug!(count = set.len(), "symbol blacklist refreshed");
                *self.blacklist.write() = set;
            }
            Err(e) => warn!(error = %e, "failed to load blacklist"),
        }
    }

    pub async fn refresh_risk_limits(&self) {
        match self.store.load_risk_limits().await {
            Ok(limits) => {
                *self.max_position_size_usd.write() = limits.max_position_size_usd;
            }
            Err(e) => warn!(error = %e, "failed to load risk limits"),
        }
    }

    // -------------------------------------------------------------------------
    // Detection cycle
    // -------------------------------------------------------------------------

    /// Run one detection cycle. Debounced: two triggers within five seconds
    /// collapse into one cycle.
    pub async fn run_detection_cycle(&self) {
        {
            let mut last = self.last_detection.lock();
            if let Some(prev) = *last {
                if prev.elapsed().as_secs() < DEBOUNCE_SECONDS {
                    debug!("detection cycle debounced");
                    return;
                }
            }
            *last = Some(Instant::now());
        }

        self.stats.write().detection_cycles += 1;

        let spreads: Vec<Spread> = self.cache.get_json(KEY_FUNDING_SPREADS).unwrap_or_default();
        let snapshot: Option<UnifiedFundingSnapshot> = self.cache.get_json(KEY_UNIFIED_SNAPSHOT);

        for spread in &spreads {
            if let Err(e) = self.process_spread(spread, snapshot.as_ref()).await {
                error!(symbol = %spread.symbol, error = %e, "failed to process spread");
            }
        }

        debug!(
            spreads = spreads.len(),
            opportunities = self.opportunities.read().len(),
            "detection cycle complete"
        );
    }

    fn is_exchange_executable(&self, exchange: &str) -> bool {
        let set = self.credentialed_exchanges.read();
        set.contains(&exchange.to_lowercase()) || set.contains(&normalize_slug(exchange))
    }

    async fn process_spread(
        &self,
        spread: &Spread,
        snapshot: Option<&UnifiedFundingSnapshot>,
    ) -> anyhow::Result<()> {
        let config = self.config.read().clone();
        let symbol = spread.symbol.to_uppercase();

        if self.blacklist.read().contains(&symbol) {
            self.stats.write().skipped_blacklisted += 1;
            return Ok(());
        }

        // Threshold is exclusive: a spread exactly at the minimum is dropped.
        let min_spread = Decimal::try_from(config.min_spread_pct).unwrap_or(Decimal::ZERO);
        if spread.spread_pct <= min_spread {
            self.stats.write().skipped_below_spread += 1;
            return Ok(());
        }

        if config.only_executable
            && (!self.is_exchange_executable(&spread.long_exchange)
                || !self.is_exchange_executable(&spread.short_exchange))
        {
            self.stats.write().skipped_no_credentials += 1;
            return Ok(());
        }

        let max_size = *self.max_position_size_usd.read();
        let (ctx, data_source) = self.build_score_context(spread, snapshot, max_size);
        let scores = UosScorer::score(spread, &ctx);
        let total = scores.total();

        let key = identity_key(&symbol, &spread.long_exchange, &spread.short_exchange);
        let existing_id = self
            .opportunities
            .read()
            .values()
            .find(|o| !o.status.is_terminal() && o.identity_key() == key)
            .map(|o| o.id.clone());

        // Score threshold is inclusive: exactly at the minimum is kept.
        if total < config.min_uos_score {
            self.stats.write().skipped_below_score += 1;
            if let Some(id) = existing_id {
                self.expire_opportunity(&id, "score_below_threshold").await;
            }
            return Ok(());
        }

        let recommended = UosScorer::recommended_size(total, max_size);
        let expires_at = Utc::now() + Duration::minutes(config.opportunity_ttl_minutes);

        match existing_id {
            Some(id) => {
                let event = {
                    let mut map = self.opportunities.write();
                    let opp = match map.get_mut(&id) {
                        Some(o) => o,
                        None => return Ok(()),
                    };
                    opp.funding_spread = spread.spread;
                    opp.funding_spread_pct = spread.spread_pct;
                    opp.estimated_net_apr = spread.annualized_apr;
                    opp.uos = scores;
                    opp.recommended_size_usd = recommended;
                    opp.long_leg.funding_rate = spread.long_rate;
                    opp.short_leg.funding_rate = spread.short_rate;
                    opp.data_source = data_source;
                    opp.expires_at = expires_at;
                    opp.clone()
                };
                self.store.upsert_opportunity(&event).await?;
                self.stats.write().opportunities_updated += 1;
                self.bus.publish_opportunity(OpportunityEvent {
                    kind: OpportunityEventKind::Updated,
                    opportunity_id: event.id.clone(),
                    symbol: event.symbol.clone(),
                    long_exchange: event.long_leg.exchange.clone(),
                    short_exchange: event.short_leg.exchange.clone(),
                    uos_score: total,
                    spread_pct: event.funding_spread_pct,
                    timestamp: Utc::now(),
                });

                // A refreshed score may have crossed the auto-execute
                // threshold since the opportunity was first detected.
                self.check_auto_execute(&event).await;
            }
            None => {
                let opportunity = Opportunity {
                    id: Uuid::new_v4().to_string(),
                    symbol: symbol.clone(),
                    base_asset: symbol.clone(),
                    status: OpportunityStatus::Detected,
                    long_leg: OpportunityLeg {
                        exchange: spread.long_exchange.clone(),
                        side: OrderSide::Long,
                        funding_rate: spread.long_rate,
                        estimated_slippage_pct: Decimal::new(1, 1),
                    },
                    short_leg: OpportunityLeg {
                        exchange: spread.short_exchange.clone(),
                        side: OrderSide::Short,
                        funding_rate: spread.short_rate,
                        estimated_slippage_pct: Decimal::new(1, 1),
                    },
                    funding_spread: spread.spread,
                    funding_spread_pct: spread.spread_pct,
                    estimated_net_apr: spread.annualized_apr,
                    uos: scores,
                    recommended_size_usd: recommended,
                    data_source,
                    detected_at: Utc::now(),
                    expires_at,
                };

                self.store.upsert_opportunity(&opportunity).await?;
                self.opportunities
                    .write()
                    .insert(opportunity.id.clone(), opportunity.clone());
                self.stats.write().opportunities_detected += 1;

                info!(
                    id = %opportunity.id,
                    symbol = %opportunity.symbol,
                    score = total,
                    spread_pct = %opportunity.funding_spread_pct,
                    "new opportunity detected"
                );

                self.bus.publish_opportunity(OpportunityEvent {
                    kind: OpportunityEventKind::Detected,
                    opportunity_id: opportunity.id.clone(),
                    symbol: opportunity.symbol.clone(),
                    long_exchange: opportunity.long_leg.exchange.clone(),
                    short_exchange: opportunity.short_leg.exchange.clone(),
                    uos_score: total,
                    spread_pct: opportunity.funding_spread_pct,
                    timestamp: Utc::now(),
                });

                self.check_auto_execute(&opportunity).await;
            }
        }

        Ok(())
    }

    fn build_score_context(
        &self,
        spread: &Spread,
        snapshot: Option<&UnifiedFundingSnapshot>,
        max_size: Decimal,
    ) -> (ScoreContext, RateSource) {
        let reliability = self.reliability.read();
        let long_rel = reliability
            .get(&normalize_slug(&spread.long_exchange))
            .copied()
            .unwrap_or(1.0);
        let short_rel = reliability
            .get(&normalize_slug(&spread.short_exchange))
            .copied()
            .unwrap_or(1.0);
        drop(reliability);

        let now = Utc::now();
        let mut hours_to_funding = None;
        let mut data_source = RateSource::ExchangeApi;
        if let Some(snap) = snapshot {
            for exchange in [&spread.long_exchange, &spread.short_exchange] {
                if let Some(rate) = snap.get_rate(&spread.symbol, exchange) {
                    if let Some(h) = rate.hours_to_next_funding(now) {
                        hours_to_funding =
                            Some(hours_to_funding.map_or(h, |prev: f64| prev.min(h)));
                    }
                    if rate.source == RateSource::Reference {
                        data_source = RateSource::Reference;
                    }
                }
            }
        }

        (
            ScoreContext {
                long_reliability: long_rel,
                short_reliability: short_rel,
                estimated_slippage_pct: 0.1,
                available_depth_usd: None,
                intended_size_usd: max_size,
                hours_to_next_funding: hours_to_funding,
                rate_volatility: None,
                single_source: data_source == RateSource::Reference,
            },
            data_source,
        )
    }

    // -------------------------------------------------------------------------
    // Auto-execute gating
    // -------------------------------------------------------------------------

    /// All gates must hold: system running, auto-execute on, mode is not
    /// discovery, circuit breaker clear, score at or above the threshold.
    /// Capital and risk approval then run through the allocator.
    pub async fn check_auto_execute(&self, opportunity: &Opportunity) {
        // Only pre-allocation statuses are eligible; an opportunity already
        // handed to the allocator or executor must not fire twice.
        if !matches!(
            opportunity.status,
            OpportunityStatus::Detected | OpportunityStatus::Validated | OpportunityStatus::Scored
        ) {
            return;
        }

        let config = self.config.read().clone();
        let score = opportunity.uos_score();

        let blocked_reason = if !self.control.is_running() {
            Some("System is stopped")
        } else if !config.auto_execute {
            Some("Auto-execution disabled")
        } else if config.mode == SystemMode::Discovery {
            Some("System in discovery mode")
        } else if self.risk.circuit_breaker_active() {
            Some("Circuit breaker active")
        } else {
            None
        };

        if let Some(reason) = blocked_reason {
            if score >= 70 {
                self.bus.publish_activity(ActivityEvent::info(
                    COMPONENT,
                    "opportunity_not_executed",
                    format!("{}: {}", opportunity.symbol, reason),
                    json!({
                        "opportunity_id": opportunity.id,
                        "symbol": opportunity.symbol,
                        "uos_score": score,
                        "reason": reason,
                    }),
                ));
            }
            return;
        }

        // Boundary is inclusive: exactly at the threshold auto-executes.
        if score < config.min_uos_auto_execute {
            if score >= 60 {
                self.bus.publish_activity(ActivityEvent::info(
                    COMPONENT,
                    "opportunity_below_threshold",
                    format!(
                        "{}: score {} below auto-execute threshold {}",
                        opportunity.symbol, score, config.min_uos_auto_execute
                    ),
                    json!({
                        "opportunity_id": opportunity.id,
                        "uos_score": score,
                        "threshold": config.min_uos_auto_execute,
                    }),
                ));
            }
            return;
        }

        match self.allocator.request_auto_execute(opportunity).await {
            Ok(true) => {
                self.stats.write().auto_executions_triggered += 1;
                if let Some(opp) = self.opportunities.write().get_mut(&opportunity.id) {
                    opp.status = OpportunityStatus::Executing;
                }
                if let Err(e) = self
                    .store
                    .update_opportunity_status(&opportunity.id, OpportunityStatus::Executing)
                    .await
                {
                    warn!(error = %e, "failed to persist executing status");
                }
                info!(
                    id = %opportunity.id,
                    symbol = %opportunity.symbol,
                    score,
                    "auto-execution triggered"
                );
            }
            Ok(false) => {}
            Err(reason) => {
                debug!(id = %opportunity.id, reason = %reason, "auto-execution declined");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Lifecycle maintenance
    // -------------------------------------------------------------------------

    /// Sweep expired opportunities; runs every 60 s.
    pub async fn cleanup_expired(&self) {
        let now = Utc::now();
        let expired: Vec<String> = self
            .opportunities
            .read()
            .values()
            .filter(|o| !o.status.is_terminal() && o.is_expired(now))
            .map(|o| o.id.clone())
            .collect();

        for id in expired {
            self.expire_opportunity(&id, "expired").await;
            self.stats.write().opportunities_expired += 1;
        }
    }

    async fn expire_opportunity(&self, id: &str, reason: &str) {
        let removed = self.opportunities.write().remove(id);
        if let Some(opp) = removed {
            if let Err(e) = self
                .store
                .update_opportunity_status(id, OpportunityStatus::Expired)
                .await
            {
                warn!(error = %e, "failed to persist expiry");
            }
            self.bus.publish_opportunity(OpportunityEvent {
                kind: OpportunityEventKind::Expired {
                    reason: reason.to_string(),
                },
                opportunity_id: opp.id,
                symbol: opp.symbol,
                long_exchange: opp.long_leg.exchange,
                short_exchange: opp.short_leg.exchange,
                uos_score: opp.uos.total(),
                spread_pct: opp.funding_spread_pct,
                timestamp: Utc::now(),
            });
        }
    }

    /// A symbol joined the blacklist: expire its live opportunities.
    pub async fn on_blacklist_added(&self, symbol: &str) {
        let symbol = symbol.to_uppercase();
        self.blacklist.write().insert(symbol.clone());

        let doomed: Vec<String> = self
            .opportunities
            .read()
            .values()
            .filter(|o| o.symbol.eq_ignore_ascii_case(&symbol))
            .map(|o| o.id.clone())
            .collect();

        for id in doomed {
            self.expire_opportunity(&id, "blacklisted").await;
        }
        info!(symbol = %symbol, "symbol blacklisted, opportunities expired");
    }

    pub fn on_blacklist_removed(&self, symbol: &str) {
        self.blacklist.write().remove(&symbol.to_uppercase());
    }

    /// position_opened arrived for one of our opportunities.
    pub async fn on_position_opened(&self, opportunity_id: &str) {
        let known = {
            let mut map = self.opportunities.write();
            match map.get_mut(opportunity_id) {
                Some(opp) => {
                    opp.status = OpportunityStatus::Executed;
                    true
                }
                None => false,
            }
        };
        if known {
            if let Err(e) = self
                .store
                .update_opportunity_status(opportunity_id, OpportunityStatus::Executed)
                .await
            {
                warn!(error = %e, "failed to persist executed status");
            }
            info!(opportunity_id, "opportunity marked executed");
        }
    }

    /// The executor rejected an execution attempt.
    pub async fn on_execution_rejected(&self, opportunity_id: &str) {
        let removed = self.opportunities.write().remove(opportunity_id).is_some();
        if removed {
            if let Err(e) = self
                .store
                .update_opportunity_status(opportunity_id, OpportunityStatus::Rejected)
                .await
            {
                warn!(error = %e, "failed to persist rejected status");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Queries (API read path)
    // -------------------------------------------------------------------------

    pub fn get_opportunities(
        &self,
        min_score: u8,
        symbol: Option<&str>,
        status: Option<OpportunityStatus>,
        exchange: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Vec<Opportunity> {
        let mut out: Vec<Opportunity> = self
            .opportunities
            .read()
            .values()
            .filter(|o| o.uos_score() >= min_score)
            .filter(|o| {
                symbol
                    .map(|s| o.symbol.to_uppercase().contains(&s.to_uppercase()))
                    .unwrap_or(true)
            })
            .filter(|o| status.map(|s| o.status == s).unwrap_or(true))
            .filter(|o| {
                exchange
                    .map(|e| {
                        let slug = normalize_slug(e);
                        normalize_slug(&o.long_leg.exchange) == slug
                            || normalize_slug(&o.short_leg.exchange) == slug
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        out.sort_by(|a, b| b.uos_score().cmp(&a.uos_score()));
        out.into_iter().skip(offset).take(limit).collect()
    }

    pub fn get_top(&self, n: usize) -> Vec<Opportunity> {
        self.get_opportunities(0, None, None, None, n, 0)
    }

    pub fn get_by_id(&self, id: &str) -> Option<Opportunity> {
        self.opportunities.read().get(id).cloned()
    }

    pub fn active_count(&self) -> usize {
        self.opportunities.read().len()
    }

    pub fn stats(&self) -> DetectorStats {
        self.stats.read().clone()
    }

    /// Periodic status narrative for the activity stream.
    pub fn publish_status_summary(&self) {
        let config = self.config.read().clone();
        let map = self.opportunities.read();
        let high = map.values().filter(|o| o.uos_score() >= 75).count();
        let medium = map
            .values()
            .filter(|o| {
                let s = o.uos_score();
                (60..75).contains(&s)
            })
            .count();
        let best = map.values().map(|o| o.uos_score()).max().unwrap_or(0);
        let total = map.len();
        drop(map);

        let (status, action) = if !self.control.is_running() {
            ("System is stopped", "Start the system to enable trading".to_string())
        } else if !config.auto_execute {
            (
                "Auto-execution is disabled",
                "Enable auto-execute to allow automatic trading".to_string(),
            )
        } else if config.mode == SystemMode::Discovery {
            ("System in discovery mode", "Switch to standard mode to enable trading".to_string())
        } else if self.risk.circuit_breaker_active() {
            ("Circuit breaker active", "Review risk alerts and reset the breaker".to_string())
        } else if high == 0 {
            (
                "No high-quality opportunities",
                format!("Waiting for opportunities with UOS >= 75 (best current: {best})"),
            )
        } else {
            ("Ready to trade", format!("{high} opportunities ready for execution"))
        };

        self.bus.publish_activity(ActivityEvent::info(
            COMPONENT,
            "system_status",
            status,
            json!({
                "status": status,
                "action": action,
                "auto_execute": config.auto_execute,
                "mode": config.mode.to_string(),
                "total_opportunities": total,
                "high_score_opportunities": high,
                "medium_score_opportunities": medium,
            }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_shape() {
        assert_eq!(
            identity_key("BTC", "binance_futures", "bybit_futures"),
            "BTC:binance_futures:bybit_futures"
        );
    }

    #[test]
    fn status_transitions() {
        use OpportunityStatus::*;
        assert!(Detected.can_transition_to(Scored));
        assert!(Scored.can_transition_to(Allocated));
        assert!(Allocated.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Executed));
        assert!(Detected.can_transition_to(Expired));
        assert!(Executing.can_transition_to(Rejected));

        // Once terminal, only executed -> closed is allowed.
        assert!(!Expired.can_transition_to(Detected));
        assert!(!Rejected.can_transition_to(Executing));
        assert!(Executed.can_transition_to(Closed));
        assert!(!Expired.can_transition_to(Expired));
    }

    #[test]
    fn expiry_is_after_detection() {
        let now = Utc::now();
        let opp = Opportunity {
            id: "o-1".into(),
            symbol: "BTC".into(),
            base_asset: "BTC".into(),
            status: OpportunityStatus::Detected,
            long_leg: OpportunityLeg {
                exchange: "binance_futures".into(),
                side: OrderSide::Long,
                funding_rate: Decimal::ZERO,
                estimated_slippage_pct: Decimal::ZERO,
            },
            short_leg: OpportunityLeg {
                exchange: "bybit_futures".into(),
                side: OrderSide::Short,
                funding_rate: Decimal::ZERO,
                estimated_slippage_pct: Decimal::ZERO,
            },
            funding_spread: Decimal::ZERO,
            funding_spread_pct: Decimal::ZERO,
            estimated_net_apr: Decimal::ZERO,
            uos: UosBreakdown::default(),
            recommended_size_usd: Decimal::ZERO,
            data_source: RateSource::ExchangeApi,
            detected_at: now,
            expires_at: now + Duration::minutes(30),
        };
        assert!(opp.expires_at > opp.detected_at);
        assert!(!opp.is_expired(now));
        assert!(opp.is_expired(now + Duration::minutes(31)));
    }

    // -------------------------------------------------------------------------
    // Detection flow
    // -------------------------------------------------------------------------

    use crate::app_state::ControlState;
    use crate::capital::allocator::CapitalAllocator;
    use crate::capital::VenueBalance;
    use crate::cache::TtlCache;
    use crate::market_data::funding::FundingRate;
    use crate::positions::manager::new_pending_closes;
    use crate::risk::{RiskLimits, RiskManager};
    use crate::runtime_config::RuntimeConfig;
    use crate::store::Store;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;

    struct Harness {
        detector: OpportunityDetector,
        bus: EventBus,
        risk: Arc<RiskManager>,
        config: Arc<RwLock<RuntimeConfig>>,
        allocator: Arc<CapitalAllocator>,
    }

    fn harness(configure: impl FnOnce(&mut RuntimeConfig)) -> Harness {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let cache = TtlCache::new();
        let risk = Arc::new(RiskManager::new(RiskLimits::default()));
        let mut runtime_config = RuntimeConfig {
            only_executable: false,
            ..RuntimeConfig::default()
        };
        configure(&mut runtime_config);
        let config = Arc::new(RwLock::new(runtime_config));
        let control = Arc::new(ControlState::new());
        let allocator = Arc::new(CapitalAllocator::new(
            store.clone(),
            bus.clone(),
            risk.clone(),
            config.clone(),
            new_pending_closes(),
        ));
        let reliability = Arc::new(RwLock::new(HashMap::new()));
        let detector = OpportunityDetector::new(
            store,
            bus.clone(),
            cache,
            risk.clone(),
            allocator.clone(),
            control,
            config.clone(),
            reliability,
        );
        Harness {
            detector,
            bus,
            risk,
            config,
            allocator,
        }
    }

    fn btc_spread() -> Spread {
        let a = FundingRate::new(
            "binance_futures",
            "BTC/USDT:USDT",
            dec!(0.0001),
            8,
            RateSource::ExchangeApi,
        );
        let b = FundingRate::new(
            "bybit_futures",
            "BTC/USDT:USDT",
            dec!(0.0003),
            8,
            RateSource::ExchangeApi,
        );
        Spread::from_pair("BTC", &a, &b)
    }

    #[tokio::test]
    async fn detection_is_idempotent_over_identity_key() {
        let h = harness(|_| {});
        let spread = btc_spread();

        h.detector.process_spread(&spread, None).await.unwrap();
        let first: Vec<Opportunity> = h.detector.get_top(10);
        assert_eq!(first.len(), 1);
        let first_id = first[0].id.clone();

        // Same identity key again: the row is updated, the id is stable.
        h.detector.process_spread(&spread, None).await.unwrap();
        let second = h.detector.get_top(10);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first_id);
    }

    #[tokio::test]
    async fn spread_exactly_at_minimum_is_dropped() {
        let h = harness(|c| c.min_spread_pct = 0.02);
        let spread = btc_spread();
        assert_eq!(spread.spread_pct, dec!(0.02));

        h.detector.process_spread(&spread, None).await.unwrap();
        assert_eq!(h.detector.active_count(), 0);
        assert_eq!(h.detector.stats().skipped_below_spread, 1);
    }

    #[tokio::test]
    async fn score_exactly_at_minimum_is_kept() {
        // Probe the score the default context produces for this spread.
        let probe = harness(|c| c.min_uos_score = 0);
        probe.detector.process_spread(&btc_spread(), None).await.unwrap();
        let score = probe.detector.get_top(1)[0].uos_score();

        let inclusive = harness(|c| c.min_uos_score = score);
        inclusive.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert_eq!(inclusive.detector.active_count(), 1);

        let exclusive = harness(|c| c.min_uos_score = score + 1);
        exclusive.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert_eq!(exclusive.detector.active_count(), 0);
    }

    #[tokio::test]
    async fn blacklisted_symbol_is_skipped_and_live_opportunities_expire() {
        let h = harness(|_| {});
        h.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert_eq!(h.detector.active_count(), 1);

        let mut events = h.bus.subscribe_opportunity();
        h.detector.on_blacklist_added("btc").await;
        assert_eq!(h.detector.active_count(), 0);

        let event = events.try_recv().unwrap();
        match event.kind {
            OpportunityEventKind::Expired { reason } => assert_eq!(reason, "blacklisted"),
            other => panic!("unexpected event kind {other:?}"),
        }

        // While blacklisted nothing is created.
        h.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert_eq!(h.detector.active_count(), 0);
        assert_eq!(h.detector.stats().skipped_blacklisted, 1);

        h.detector.on_blacklist_removed("BTC");
        h.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert_eq!(h.detector.active_count(), 1);
    }

    #[tokio::test]
    async fn score_at_auto_execute_threshold_publishes_request() {
        let h = harness(|c| {
            c.auto_execute = true;
            c.mode = SystemMode::Standard;
            c.min_uos_score = 0;
            c.min_uos_auto_execute = 0; // adjusted below once the score is known
        });
        // Fund the allocator so the reservation succeeds.
        h.allocator.apply_balances(vec![VenueBalance {
            venue: "binance_futures".into(),
            total_usd: dec!(10000),
            ..Default::default()
        }]);

        // Learn the score, then pin the threshold exactly on it.
        let probe = harness(|c| c.min_uos_score = 0);
        probe.detector.process_spread(&btc_spread(), None).await.unwrap();
        let score = probe.detector.get_top(1)[0].uos_score();
        h.config.write().min_uos_auto_execute = score;

        let mut requests = h.bus.subscribe_execution_request();
        h.detector.process_spread(&btc_spread(), None).await.unwrap();

        let request = requests.try_recv().unwrap();
        assert_eq!(request.symbol, "BTC");
        assert!(request.auto_executed);
        assert_eq!(request.uos_score, score);
        assert_eq!(h.detector.stats().auto_executions_triggered, 1);

        // One point above the score: no request.
        let below = harness(|c| {
            c.auto_execute = true;
            c.mode = SystemMode::Standard;
            c.min_uos_score = 0;
            c.min_uos_auto_execute = score + 1;
        });
        below.allocator.apply_balances(vec![VenueBalance {
            venue: "binance_futures".into(),
            total_usd: dec!(10000),
            ..Default::default()
        }]);
        let mut below_requests = below.bus.subscribe_execution_request();
        below.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert!(below_requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn circuit_breaker_blocks_auto_execution() {
        let h = harness(|c| {
            c.auto_execute = true;
            c.mode = SystemMode::Standard;
            c.min_uos_score = 0;
            c.min_uos_auto_execute = 0;
        });
        h.allocator.apply_balances(vec![VenueBalance {
            venue: "binance_futures".into(),
            total_usd: dec!(10000),
            ..Default::default()
        }]);
        h.risk.activate_circuit_breaker("manual");

        let mut requests = h.bus.subscribe_execution_request();
        h.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert!(requests.try_recv().is_err());
        assert_eq!(h.detector.stats().auto_executions_triggered, 0);

        // Deactivation re-enables the path: the next cycle takes the update
        // branch for the same opportunity and auto-executes it.
        h.risk.deactivate_circuit_breaker();
        h.detector
            .process_spread(&btc_spread(), None)
            .await
            .unwrap();
        let request = requests.try_recv().unwrap();
        assert_eq!(request.symbol, "BTC");
        assert_eq!(h.detector.stats().auto_executions_triggered, 1);

        // The opportunity is now executing; further updates must not fire a
        // second request for the same identity key.
        h.detector.process_spread(&btc_spread(), None).await.unwrap();
        assert!(requests.try_recv().is_err());
    }

    #[tokio::test]
    async fn expiry_sweep_publishes_expired_events() {
        let h = harness(|c| c.opportunity_ttl_minutes = -1);
        h.detector.process_spread(&btc_spread(), None).await.unwrap();

        let mut events = h.bus.subscribe_opportunity();
        h.detector.cleanup_expired().await;
        assert_eq!(h.detector.active_count(), 0);

        let event = events.try_recv().unwrap();
        assert!(matches!(event.kind, OpportunityEventKind::Expired { .. }));
        assert_eq!(h.detector.stats().opportunities_expired, 1);
    }
}
