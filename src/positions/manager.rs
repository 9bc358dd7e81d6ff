// =============================================================================
// Position Manager — sync, health, funding collection, exits
// =============================================================================
//
// Background loops (wired in main):
//   - sync every 30 s (initial 10 s delay): exchange positions/orders into the
//     mirror tables, orphan adoption, then health + exit evaluation
//   - reconciliation at startup and every 5 min
//
// Per-position evaluation holds an async lock keyed on the position id so a
// manual close and the exit monitor can never double-exit the same position.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{ActivityEvent, EventBus, PositionEvent, PositionEventKind};
use crate::cache::{TtlCache, KEY_UNIFIED_SNAPSHOT};
use crate::exchanges::{connect_adapter, ExchangeAdapter, OrderRequest};
use crate::market_data::funding::{ticker_from_symbol, UnifiedFundingSnapshot};
use crate::runtime_config::RuntimeConfig;
use crate::store::positions::ExchangePositionRecord;
use crate::store::Store;
use crate::types::{OrderSide, OrderType};

use super::reconcile;
use super::{ExitReason, FundingPayment, Position, PositionStatus};

const COMPONENT: &str = "position-manager";
const WORKER: &str = "position-sync";

/// Positions queued for close by the allocator's cap enforcement or the API.
pub type PendingCloses = Arc<SyncMutex<HashSet<String>>>;

pub fn new_pending_closes() -> PendingCloses {
    Arc::new(SyncMutex::new(HashSet::new()))
}

/// Per-position async locks preventing concurrent evaluation/exit.
#[derive(Default)]
pub struct PositionLocks {
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PositionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, position_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .entry(position_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn acquire(&self, position_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        self.handle(position_id).lock_owned().await
    }

    pub fn forget(&self, position_id: &str) {
        self.locks.lock().remove(position_id);
    }
}

pub struct PositionManager {
    store: Store,
    bus: EventBus,
    cache: TtlCache,
    config: Arc<RwLock<RuntimeConfig>>,
    pending_closes: PendingCloses,
    locks: PositionLocks,
    encryption_key: String,
}

impl PositionManager {
    pub fn new(
        store: Store,
        bus: EventBus,
        cache: TtlCache,
        config: Arc<RwLock<RuntimeConfig>>,
        pending_closes: PendingCloses,
        encryption_key: String,
    ) -> Self {
        Self {
            store,
            bus,
            cache,
            config,
            pending_closes,
            locks: PositionLocks::new(),
            encryption_key,
        }
    }

    async fn adapter_for(&self, slug: &str) -> anyhow::Result<Arc<dyn ExchangeAdapter>> {
        let credentials = self
            .store
            .get_credentials(slug, &self.encryption_key)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no credentials for {slug}"))?;
        let max_retries = self.config.read().max_retries;
        let adapter = connect_adapter(slug, credentials, max_retries)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        Ok(adapter)
    }

    // -------------------------------------------------------------------------
    // Sync cycle
    // -------------------------------------------------------------------------

    /// One sync pass: mirror every credentialed venue's positions and orders,
    /// adopt orphans, then evaluate every active position.
    pub async fn sync_cycle(&self) {
        let slugs = match self.store.list_credentialed_exchanges().await {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "failed to list credentialed exchanges");
                return;
            }
        };

        let mut total_positions = 0usize;
        let mut total_orders = 0usize;
        let mut synced = Vec::new();

        for slug in &slugs {
            match self.sync_exchange(slug).await {
                Ok((positions, orders)) => {
                    total_positions += positions;
                    total_orders += orders;
                    synced.push(slug.clone());
                }
                Err(e) => {
                    warn!(exchange = %slug, error = %e, "exchange sync failed");
                }
            }
        }

        self.bus.publish_activity(ActivityEvent::info(
            COMPONENT,
            "sync_complete",
            format!(
                "synced {total_positions} positions and {total_orders} orders from {} venues",
                synced.len()
            ),
            json!({
                "total_positions": total_positions,
                "total_orders": total_orders,
                "exchanges": synced,
            }),
        ));

        match reconcile::adopt_untracked_positions(&self.store, &self.bus).await {
            Ok((adopted, unpaired)) if adopted > 0 || unpaired > 0 => {
                info!(adopted, unpaired, "orphan adoption complete");
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "orphan adoption failed"),
        }

        self.evaluate_positions().await;
    }

    async fn sync_exchange(&self, slug: &str) -> anyhow::Result<(usize, usize)> {
        let adapter = self.adapter_for(slug).await?;

        let positions = adapter
            .get_positions()
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        let mut live_symbols = Vec::with_capacity(positions.len());
        for raw in &positions {
            live_symbols.push(raw.symbol.clone());
            let record = ExchangePositionRecord {
                exchange: slug.to_string(),
                symbol: raw.symbol.clone(),
                side: raw.side,
                size: raw.size,
                notional_usd: raw.notional_usd,
                entry_price: raw.entry_price,
                mark_price: raw.mark_price,
                unrealized_pnl: raw.unrealized_pnl,
                leverage: raw.leverage,
                liquidation_price: raw.liquidation_price,
                margin_mode: raw.margin_mode.clone(),
                updated_at: Utc::now(),
            };
            self.store.upsert_exchange_position(&record).await?;
        }
        self.store.prune_exchange_positions(slug, &live_symbols).await?;

        let orders = adapter
            .get_open_orders(None)
            .await
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        for order in &orders {
            self.store.upsert_exchange_order(slug, order).await?;
        }

        let _ = adapter.close().await;
        debug!(exchange = %slug, positions = positions.len(), orders = orders.len(), "exchange synced");
        Ok((positions.len(), orders.len()))
    }

    // -------------------------------------------------------------------------
    // Evaluation: prices, funding, health, exits
    // -------------------------------------------------------------------------

    async fn evaluate_positions(&self) {
        let positions = match self.store.load_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to load open positions");
                return;
            }
        };

        let mirrors = self.store.list_exchange_positions().await.unwrap_or_default();
        let snapshot: Option<UnifiedFundingSnapshot> = self.cache.get_json(KEY_UNIFIED_SNAPSHOT);

        for mut position in positions {
            if position.status != PositionStatus::Active {
                continue;
            }
            let _guard = self.locks.acquire(&position.id).await;

            // Refresh leg marks from the mirror rows.
            for leg in &mut position.legs {
                if let Some(mirror) = mirrors
                    .iter()
                    .find(|m| m.exchange == leg.exchange && m.symbol == leg.symbol)
                {
                    if mirror.mark_price > Decimal::ZERO {
                        leg.current_price = mirror.mark_price;
                        leg.notional_usd = mirror.notional_usd;
                    }
                    leg.unrealized_pnl = mirror.unrealized_pnl;
                    leg.liquidation_price = mirror.liquidation_price;
                }
            }

            self.collect_funding(&mut position, snapshot.as_ref()).await;

            let previous_health = position.health_status;
            position.update_metrics();
            if position.health_status != previous_health {
                info!(
                    position_id = %position.id,
                    from = %previous_health,
                    to = %position.health_status,
                    "position health changed"
                );
            }

            let _ = self
                .store
                .insert_interaction(
                    &position.id,
                    "health_check",
                    WORKER,
                    position.health_status.as_str(),
                    &format!(
                        "delta {}%, margin {}%, liq distance {:?}",
                        position.delta_exposure_pct,
                        position.max_margin_utilization,
                        position.min_liquidation_distance
                    ),
                    json!({
                        "delta_exposure_pct": position.delta_exposure_pct.to_string(),
                        "max_margin_utilization": position.max_margin_utilization.to_string(),
                        "return_pct": position.return_pct().to_string(),
                    }),
                )
                .await;

            if let Err(e) = self.store.update_position(&position).await {
                warn!(position_id = %position.id, error = %e, "failed to persist evaluation");
            }

            // Exit decision: operator/allocator queue first, then triggers.
            let queued = self.pending_closes.lock().remove(&position.id);
            let exit_reason = if queued {
                Some(ExitReason::AutoUnwind)
            } else {
                position.should_exit()
            };

            let _ = self
                .store
                .insert_interaction(
                    &position.id,
                    "exit_evaluation",
                    WORKER,
                    exit_reason.map(|r| r.as_str()).unwrap_or("hold"),
                    &match exit_reason {
                        Some(r) => format!("exit triggered: {r}"),
                        None => "no exit trigger".to_string(),
                    },
                    json!({
                        "funding_periods_collected": position.funding_periods_collected,
                        "health": position.health_status.as_str(),
                    }),
                )
                .await;

            drop(_guard);
            if let Some(reason) = exit_reason {
                if let Err(e) = self.close_position(&position.id, reason).await {
                    error!(position_id = %position.id, error = %e, "exit failed");
                }
            } else if self.config.read().enable_rebalancing {
                self.maybe_rebalance(&position).await;
            }
        }
    }

    /// Accrue funding once per elapsed interval: longs pay positive rates,
    /// shorts receive them.
    async fn collect_funding(
        &self,
        position: &mut Position,
        snapshot: Option<&UnifiedFundingSnapshot>,
    ) {
        let Some(snapshot) = snapshot else { return };
        let Some(opened_at) = position.opened_at else { return };

        let interval_hours = position
            .legs
            .iter()
            .filter_map(|l| {
                crate::exchanges::venues::venue_by_slug(&l.exchange)
                    .map(|v| v.funding_interval_hours)
            })
            .min()
            .unwrap_or(8)
            .max(1);

        let hours_open = (Utc::now() - opened_at).num_seconds() as f64 / 3600.0;
        let expected_periods = (hours_open / interval_hours as f64).floor() as u32;
        if expected_periods <= position.funding_periods_collected {
            return;
        }

        let base = ticker_from_symbol(&position.symbol);
        let mut collected_any = false;

        // Snapshot legs first; payments are applied after to keep the borrow
        // checker and the accounting both happy.
        let leg_snapshot: Vec<(String, String, String, Decimal)> = position
            .legs
            .iter()
            .map(|l| (l.id.clone(), l.exchange.clone(), l.symbol.clone(), l.notional_usd))
            .collect();

        for (leg_id, exchange, symbol, notional) in leg_snapshot {
            let Some(rate) = snapshot.get_rate(&base, &exchange) else {
                continue;
            };
            let leg = position.legs.iter_mut().find(|l| l.id == leg_id);
            let Some(leg) = leg else { continue };

            // Positive rate: longs pay, shorts receive.
            let payment = rate.rate * notional * Decimal::from(-leg.side.multiplier());
            leg.funding_pnl += payment;

            if payment >= Decimal::ZERO {
                position.funding_received += payment;
            } else {
                position.funding_paid += -payment;
            }
            position.realized_pnl_funding += payment;
            collected_any = true;

            let record = FundingPayment {
                id: Uuid::new_v4().to_string(),
                position_id: position.id.clone(),
                leg_id,
                exchange,
                symbol,
                funding_rate: rate.rate,
                payment_amount: payment,
                position_size: notional,
                timestamp: Utc::now(),
            };
            if let Err(e) = self.store.insert_funding_payment(&record).await {
                warn!(position_id = %position.id, error = %e, "failed to persist funding payment");
            }
        }

        if collected_any {
            position.funding_periods_collected += 1;
            let _ = self
                .store
                .insert_interaction(
                    &position.id,
                    "funding_collected",
                    WORKER,
                    "collected",
                    &format!(
                        "period {} collected, net funding {}",
                        position.funding_periods_collected,
                        position.net_funding_pnl()
                    ),
                    json!({
                        "periods": position.funding_periods_collected,
                        "net_funding_pnl": position.net_funding_pnl().to_string(),
                    }),
                )
                .await;
        }
    }

    /// Bring a drifted delta back inside tolerance by trimming the heavier
    /// side with a reduce-only order.
    async fn maybe_rebalance(&self, position: &Position) {
        let tolerance =
            Decimal::try_from(self.config.read().delta_tolerance_pct).unwrap_or(Decimal::from(2));
        if position.delta_exposure_pct <= tolerance || position.legs.len() != 2 {
            return;
        }

        let heavier = position
            .legs
            .iter()
            .max_by(|a, b| a.notional_usd.cmp(&b.notional_usd))
            .expect("two legs present");
        let lighter_notional = position
            .legs
            .iter()
            .map(|l| l.notional_usd)
            .min()
            .unwrap_or(Decimal::ZERO);
        let excess_notional = heavier.notional_usd - lighter_notional;
        if heavier.current_price <= Decimal::ZERO {
            return;
        }
        let trim_quantity = excess_notional / heavier.current_price;

        info!(
            position_id = %position.id,
            exchange = %heavier.exchange,
            delta_pct = %position.delta_exposure_pct,
            trim = %trim_quantity,
            "rebalancing drifted delta"
        );

        match self.adapter_for(&heavier.exchange).await {
            Ok(adapter) => {
                let request = OrderRequest {
                    symbol: heavier.symbol.clone(),
                    side: heavier.side.opposite(),
                    order_type: OrderType::Market,
                    quantity: trim_quantity,
                    price: None,
                    reduce_only: true,
                };
                match adapter.place_order(&request).await {
                    Ok(response) => {
                        let _ = self
                            .store
                            .insert_interaction(
                                &position.id,
                                "rebalance",
                                WORKER,
                                "trimmed",
                                &format!(
                                    "trimmed {} on {} to restore delta tolerance",
                                    trim_quantity, heavier.exchange
                                ),
                                json!({"order_id": response.order_id, "quantity": trim_quantity.to_string()}),
                            )
                            .await;
                    }
                    Err(e) => {
                        warn!(position_id = %position.id, error = %e.message, "rebalance order failed")
                    }
                }
                let _ = adapter.close().await;
            }
            Err(e) => warn!(position_id = %position.id, error = %e, "rebalance adapter unavailable"),
        }
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position with reduce-only market orders mirroring the entry.
    pub async fn close_position(&self, position_id: &str, reason: ExitReason) -> anyhow::Result<()> {
        let _guard = self.locks.acquire(position_id).await;

        let Some(mut position) = self.store.load_position(position_id).await? else {
            anyhow::bail!("position {position_id} not found");
        };
        if position.status.is_terminal() {
            debug!(position_id, "close requested on terminal position, ignoring");
            return Ok(());
        }
        if !position.status.can_transition_to(PositionStatus::Closing) {
            anyhow::bail!(
                "position {position_id} is {}, cannot close",
                position.status
            );
        }

        position.status = PositionStatus::Closing;
        self.store.update_position(&position).await?;

        let mut failures = Vec::new();
        for leg in &mut position.legs {
            match self.adapter_for(&leg.exchange).await {
                Ok(adapter) => {
                    let request = OrderRequest {
                        symbol: leg.symbol.clone(),
                        side: leg.side.opposite(),
                        order_type: OrderType::Market,
                        quantity: leg.quantity,
                        price: None,
                        reduce_only: true,
                    };
                    match adapter.place_order(&request).await {
                        Ok(response) => {
                            leg.exit_order_ids.push(response.order_id.clone());
                            if let Some(fill) = response.fill_price {
                                leg.current_price = fill;
                            }
                            info!(
                                position_id,
                                exchange = %leg.exchange,
                                order_id = %response.order_id,
                                "exit leg filled"
                            );
                        }
                        Err(e) => failures.push(format!("{}: {}", leg.exchange, e.message)),
                    }
                    let _ = adapter.close().await;
                }
                Err(e) => failures.push(format!("{}: {}", leg.exchange, e)),
            }
        }

        if !failures.is_empty() {
            self.store.update_position(&position).await?;
            self.bus.publish_activity(ActivityEvent::warning(
                COMPONENT,
                "exit_incomplete",
                format!("position {position_id} exit incomplete: {}", failures.join("; ")),
                json!({"position_id": position_id, "failures": failures}),
            ));
            anyhow::bail!("exit orders failed: {}", failures.join("; "));
        }

        position.realized_pnl_price = position.price_pnl();
        position.realized_pnl_funding = position.net_funding_pnl();
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());
        position.exit_reason = Some(reason.as_str().to_string());
        self.store.update_position(&position).await?;

        let _ = self
            .store
            .insert_interaction(
                position_id,
                "exit",
                WORKER,
                reason.as_str(),
                &format!("position closed: {reason}"),
                json!({
                    "realized_pnl_price": position.realized_pnl_price.to_string(),
                    "realized_pnl_funding": position.realized_pnl_funding.to_string(),
                }),
            )
            .await;

        let (long_exchange, short_exchange) = (
            position
                .legs
                .iter()
                .find(|l| l.side == OrderSide::Long)
                .map(|l| l.exchange.clone())
                .unwrap_or_default(),
            position
                .legs
                .iter()
                .find(|l| l.side == OrderSide::Short)
                .map(|l| l.exchange.clone())
                .unwrap_or_default(),
        );

        self.bus.publish_position(PositionEvent {
            kind: PositionEventKind::Closed,
            position_id: position.id.clone(),
            opportunity_id: position.opportunity_id.clone(),
            symbol: position.symbol.clone(),
            capital_usd: position.total_capital_deployed,
            long_exchange,
            short_exchange,
            exit_reason: Some(reason.as_str().to_string()),
            timestamp: Utc::now(),
        });

        info!(
            position_id,
            reason = %reason,
            realized_funding = %position.realized_pnl_funding,
            realized_price = %position.realized_pnl_price,
            "position closed"
        );

        self.locks.forget(position_id);
        Ok(())
    }

    /// Startup + periodic reconciliation.
    pub async fn reconcile(&self) {
        let auto_adopt = self.config.read().auto_adopt_orphans;
        if let Err(e) =
            reconcile::reconcile_once(&self.store, &self.bus, &self.cache, auto_adopt).await
        {
            error!(error = %e, "reconciliation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn position_locks_serialize_access() {
        let locks = PositionLocks::new();
        let first = locks.acquire("pos-1").await;

        // A second acquire on the same id must wait.
        let handle = locks.handle("pos-1");
        assert!(handle.try_lock().is_err());

        drop(first);
        assert!(handle.try_lock().is_ok());

        // Different ids do not contend.
        let _a = locks.acquire("pos-2").await;
        let other = locks.handle("pos-3");
        assert!(other.try_lock().is_ok());
    }

    #[test]
    fn pending_closes_dedupe() {
        let pending = new_pending_closes();
        pending.lock().insert("pos-1".to_string());
        pending.lock().insert("pos-1".to_string());
        assert_eq!(pending.lock().len(), 1);
        assert!(pending.lock().remove("pos-1"));
        assert!(!pending.lock().remove("pos-1"));
    }
}
