// =============================================================================
// Central Application State — Helios Funding Arbitrage Engine
// =============================================================================
//
// The single source of truth for the engine. All subsystems hold Arc
// references to what they consume; AppState ties them together for the loops
// in main and the API handlers.
//
// Thread safety:
//   - Atomic counters for lock-free version/run-state tracking.
//   - parking_lot::RwLock for mutable shared collections.
//   - Arc wrappers for subsystem engines that manage their own interior
//     mutability.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::bus::{ActivityEvent, EventBus};
use crate::cache::TtlCache;
use crate::capital::allocator::CapitalAllocator;
use crate::detector::OpportunityDetector;
use crate::execution::ExecutionEngine;
use crate::market_data::aggregator::FundingAggregator;
use crate::positions::manager::{new_pending_closes, PendingCloses, PositionManager};
use crate::risk::{RiskLimits, RiskManager};
use crate::runtime_config::RuntimeConfig;
use crate::store::Store;

/// Maximum number of recent activity events retained in memory.
const MAX_RECENT_ACTIVITY: usize = 200;

/// Venue slug -> provider reliability score, fed by the collector loops.
pub type ReliabilityMap = Arc<RwLock<HashMap<String, f64>>>;

// =============================================================================
// ControlState
// =============================================================================

/// Run-state shared with every gate that must stop trading instantly.
pub struct ControlState {
    running: AtomicBool,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Monotonically increasing version counter, bumped on every meaningful
    /// state mutation.
    pub state_version: AtomicU64,
    pub start_time: std::time::Instant,

    pub config: Arc<RwLock<RuntimeConfig>>,
    pub control: Arc<ControlState>,
    pub encryption_key: String,

    pub bus: EventBus,
    pub cache: TtlCache,
    pub store: Store,
    pub reliability: ReliabilityMap,

    pub risk: Arc<RiskManager>,
    pub aggregator: Arc<FundingAggregator>,
    pub allocator: Arc<CapitalAllocator>,
    pub detector: Arc<OpportunityDetector>,
    pub executor: Arc<ExecutionEngine>,
    pub position_manager: Arc<PositionManager>,
    pub pending_closes: PendingCloses,

    pub recent_activity: RwLock<Vec<ActivityEvent>>,
}

impl AppState {
    pub fn new(
        config: RuntimeConfig,
        store: Store,
        encryption_key: String,
        risk_limits: RiskLimits,
    ) -> Arc<Self> {
        let config = Arc::new(RwLock::new(config));
        let control = Arc::new(ControlState::new());
        let bus = EventBus::new();
        let cache = TtlCache::new();
        let reliability: ReliabilityMap = Arc::new(RwLock::new(HashMap::new()));
        let pending_closes = new_pending_closes();

        let risk = Arc::new(RiskManager::new(risk_limits));
        let aggregator = Arc::new(FundingAggregator::new(
            bus.clone(),
            cache.clone(),
            store.clone(),
        ));
        let allocator = Arc::new(CapitalAllocator::new(
            store.clone(),
            bus.clone(),
            risk.clone(),
            config.clone(),
            pending_closes.clone(),
        ));
        let detector = Arc::new(OpportunityDetector::new(
            store.clone(),
            bus.clone(),
            cache.clone(),
            risk.clone(),
            allocator.clone(),
            control.clone(),
            config.clone(),
            reliability.clone(),
        ));
        let executor = Arc::new(ExecutionEngine::new(
            store.clone(),
            bus.clone(),
            risk.clone(),
            config.clone(),
            encryption_key.clone(),
        ));
        let position_manager = Arc::new(PositionManager::new(
            store.clone(),
            bus.clone(),
            cache.clone(),
            config.clone(),
            pending_closes.clone(),
            encryption_key.clone(),
        ));

        Arc::new(Self {
            state_version: AtomicU64::new(1),
            start_time: std::time::Instant::now(),
            config,
            control,
            encryption_key,
            bus,
            cache,
            store,
            reliability,
            risk,
            aggregator,
            allocator,
            detector,
            executor,
            position_manager,
            pending_closes,
            recent_activity: RwLock::new(Vec::new()),
        })
    }

    // ── Version management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Activity ring buffer ────────────────────────────────────────────

    /// Retain the most recent activity events for the API feed; the full
    /// stream also lands in the audit table via the activity listener.
    pub fn push_activity(&self, event: ActivityEvent) {
        let mut activity = self.recent_activity.write();
        activity.push(event);
        while activity.len() > MAX_RECENT_ACTIVITY {
            activity.remove(0);
        }
        self.increment_version();
    }

    // ── Health snapshot ─────────────────────────────────────────────────

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: if self.control.is_running() { "ok" } else { "stopped" },
            state_version: self.current_state_version(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mode: self.config.read().mode.to_string(),
            auto_execute: self.config.read().auto_execute,
            circuit_breaker_active: self.risk.circuit_breaker_active(),
            active_opportunities: self.detector.active_count(),
            server_time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub state_version: u64,
    pub uptime_seconds: u64,
    pub mode: String,
    pub auto_execute: bool,
    pub circuit_breaker_active: bool,
    pub active_opportunities: usize,
    pub server_time: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> Arc<AppState> {
        AppState::new(
            RuntimeConfig::default(),
            Store::open_in_memory().unwrap(),
            "test-key".to_string(),
            RiskLimits::default(),
        )
    }

    #[tokio::test]
    async fn state_builds_and_versions_increment() {
        let state = state();
        assert_eq!(state.current_state_version(), 1);
        state.increment_version();
        assert_eq!(state.current_state_version(), 2);
        assert!(state.control.is_running());
    }

    #[tokio::test]
    async fn activity_ring_is_capped() {
        let state = state();
        for i in 0..(MAX_RECENT_ACTIVITY + 10) {
            state.push_activity(ActivityEvent::info(
                "test",
                "tick",
                format!("event {i}"),
                serde_json::json!({}),
            ));
        }
        assert_eq!(state.recent_activity.read().len(), MAX_RECENT_ACTIVITY);
    }

    #[tokio::test]
    async fn health_snapshot_reflects_control_state() {
        let state = state();
        let snapshot = state.health_snapshot();
        assert_eq!(snapshot.status, "ok");
        assert!(!snapshot.circuit_breaker_active);

        state.control.set_running(false);
        assert_eq!(state.health_snapshot().status, "stopped");
    }
}
