// =============================================================================
// Event bus — typed in-process pub/sub topics
// =============================================================================
//
// One broadcast channel per topic family. Delivery is at-least-once within the
// process; handlers must be idempotent on entity ids. Lagged subscribers lose
// the oldest messages (broadcast semantics), which is acceptable because every
// authoritative record lives in the store, not on the bus.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::market_data::funding::{FundingRate, UnifiedFundingSnapshot};

const TOPIC_CAPACITY: usize = 1024;

// -----------------------------------------------------------------------------
// Payloads
// -----------------------------------------------------------------------------

/// Lightweight opportunity reference events.
#[derive(Debug, Clone, Serialize)]
pub struct OpportunityEvent {
    pub kind: OpportunityEventKind,
    pub opportunity_id: String,
    pub symbol: String,
    pub long_exchange: String,
    pub short_exchange: String,
    pub uos_score: u8,
    pub spread_pct: Decimal,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityEventKind {
    Detected,
    Updated,
    Expired { reason: String },
}

/// Request for the execution engine to open a two-leg position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub opportunity_id: String,
    pub symbol: String,
    pub position_size_usd: Decimal,
    pub long_exchange: String,
    pub short_exchange: String,
    pub uos_score: u8,
    pub auto_executed: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionEvent {
    pub kind: PositionEventKind,
    pub position_id: String,
    pub opportunity_id: Option<String>,
    pub symbol: String,
    pub capital_usd: Decimal,
    pub long_exchange: String,
    pub short_exchange: String,
    pub exit_reason: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEventKind {
    Opened,
    Closed,
}

#[derive(Debug, Clone, Serialize)]
pub struct BalanceUpdate {
    pub total_usd: Decimal,
    pub venues: HashMap<String, Decimal>,
    pub timestamp: DateTime<Utc>,
}

/// Configuration refresh signals.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConfigEvent {
    RiskLimitsUpdated,
    BlacklistChanged {
        action: BlacklistAction,
        symbol: String,
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistAction {
    Added,
    Removed,
}

/// Operational alerts (source health, reconciliation findings).
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SystemAlert {
    AggregatorHealth {
        source: String,
        health: String,
    },
    ReconciliationAlert {
        requires_review: usize,
        message: String,
    },
}

/// Human-readable narrative event for the UI activity stream.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub activity_type: String,
    pub component: String,
    pub level: String,
    pub message: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn info(
        component: &str,
        activity_type: &str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            activity_type: activity_type.to_string(),
            component: component.to_string(),
            level: "info".to_string(),
            message: message.into(),
            details,
            timestamp: Utc::now(),
        }
    }

    pub fn warning(
        component: &str,
        activity_type: &str,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        let mut ev = Self::info(component, activity_type, message, details);
        ev.level = "warning".to_string();
        ev
    }
}

// -----------------------------------------------------------------------------
// Bus
// -----------------------------------------------------------------------------

/// All topics of the engine. Cheap to clone; channels are shared.
#[derive(Clone)]
pub struct EventBus {
    funding_rate: broadcast::Sender<FundingRate>,
    snapshot: broadcast::Sender<Arc<UnifiedFundingSnapshot>>,
    opportunity: broadcast::Sender<OpportunityEvent>,
    execution_request: broadcast::Sender<ExecutionRequest>,
    position: broadcast::Sender<PositionEvent>,
    balance: broadcast::Sender<BalanceUpdate>,
    config: broadcast::Sender<ConfigEvent>,
    alert: broadcast::Sender<SystemAlert>,
    activity: broadcast::Sender<ActivityEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            funding_rate: broadcast::channel(TOPIC_CAPACITY).0,
            snapshot: broadcast::channel(64).0,
            opportunity: broadcast::channel(TOPIC_CAPACITY).0,
            execution_request: broadcast::channel(64).0,
            position: broadcast::channel(256).0,
            balance: broadcast::channel(64).0,
            config: broadcast::channel(64).0,
            alert: broadcast::channel(256).0,
            activity: broadcast::channel(TOPIC_CAPACITY).0,
        }
    }

    // Publishing never fails: a topic without subscribers simply drops the
    // message, same as a pub/sub broker with no listeners.

    pub fn publish_funding_rate(&self, rate: FundingRate) {
        let _ = self.funding_rate.send(rate);
    }

    pub fn publish_snapshot(&self, snapshot: Arc<UnifiedFundingSnapshot>) {
        let _ = self.snapshot.send(snapshot);
    }

    pub fn publish_opportunity(&self, event: OpportunityEvent) {
        let _ = self.opportunity.send(event);
    }

    pub fn publish_execution_request(&self, request: ExecutionRequest) {
        let _ = self.execution_request.send(request);
    }

    pub fn publish_position(&self, event: PositionEvent) {
        let _ = self.position.send(event);
    }

    pub fn publish_balance(&self, update: BalanceUpdate) {
        let _ = self.balance.send(update);
    }

    pub fn publish_config(&self, event: ConfigEvent) {
        let _ = self.config.send(event);
    }

    pub fn publish_alert(&self, alert: SystemAlert) {
        let _ = self.alert.send(alert);
    }

    pub fn publish_activity(&self, event: ActivityEvent) {
        let _ = self.activity.send(event);
    }

    pub fn subscribe_funding_rate(&self) -> broadcast::Receiver<FundingRate> {
        self.funding_rate.subscribe()
    }

    pub fn subscribe_snapshot(&self) -> broadcast::Receiver<Arc<UnifiedFundingSnapshot>> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_opportunity(&self) -> broadcast::Receiver<OpportunityEvent> {
        self.opportunity.subscribe()
    }

    pub fn subscribe_execution_request(&self) -> broadcast::Receiver<ExecutionRequest> {
        self.execution_request.subscribe()
    }

    pub fn subscribe_position(&self) -> broadcast::Receiver<PositionEvent> {
        self.position.subscribe()
    }

    pub fn subscribe_config(&self) -> broadcast::Receiver<ConfigEvent> {
        self.config.subscribe()
    }

    pub fn subscribe_alert(&self) -> broadcast::Receiver<SystemAlert> {
        self.alert.subscribe()
    }

    pub fn subscribe_activity(&self) -> broadcast::Receiver<ActivityEvent> {
        self.activity.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::funding::RateSource;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.publish_funding_rate(FundingRate::new(
            "binance_futures",
            "BTC/USDT:USDT",
            dec!(0.0001),
            8,
            RateSource::ExchangeApi,
        ));
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe_execution_request();

        bus.publish_execution_request(ExecutionRequest {
            opportunity_id: "opp-1".into(),
            symbol: "BTC".into(),
            position_size_usd: dec!(1000),
            long_exchange: "binance_futures".into(),
            short_exchange: "bybit_futures".into(),
            uos_score: 82,
            auto_executed: true,
            timestamp: Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.opportunity_id, "opp-1");
        assert_eq!(received.uos_score, 82);
    }
}
