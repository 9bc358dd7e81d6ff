// =============================================================================
// Reconciliation — authoritative Position+Legs vs. on-exchange truth
// =============================================================================
//
// SAFETY POLICY: reconciliation updates the database toward exchange truth for
// small drifts and alerts for anything critical; it never places or cancels
// orders on the exchange by itself.
//
// Difference classes: orphan_on_exchange, missing_on_exchange, size_mismatch,
// price_mismatch, state_mismatch. Running twice against unchanged state
// produces zero new actions the second time.
// =============================================================================

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::bus::{ActivityEvent, EventBus, SystemAlert};
use crate::cache::{TtlCache, KEY_RECONCILIATION_REPORT};
use crate::store::positions::ExchangePositionRecord;
use crate::store::Store;

use super::{ExitReason, PositionStatus};

const COMPONENT: &str = "position-manager";

/// Positions smaller than this notional are dust, not orphans.
const DUST_NOTIONAL_USD: i64 = 1;
/// Relative size drift tolerated before the DB is corrected, 1%.
const SIZE_TOLERANCE: f64 = 0.01;
/// Relative size drift beyond which only an alert is raised, 50%.
const SIZE_CRITICAL: f64 = 0.50;
/// Relative entry/mark price drift that triggers an alert, 2%.
const PRICE_TOLERANCE: f64 = 0.02;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceKind {
    OrphanOnExchange,
    MissingOnExchange,
    SizeMismatch,
    PriceMismatch,
    StateMismatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct Difference {
    pub kind: DifferenceKind,
    pub exchange: String,
    pub symbol: String,
    pub detail: String,
    pub critical: bool,
    pub action_taken: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationReport {
    pub positions_checked: usize,
    pub differences_found: usize,
    pub resolved: usize,
    pub requires_review: usize,
    pub actions: Vec<String>,
    pub unresolved: Vec<Difference>,
    pub timestamp: chrono::DateTime<Utc>,
}

fn rel_diff(a: Decimal, b: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    let a = a.to_f64().unwrap_or(0.0);
    let b = b.to_f64().unwrap_or(0.0);
    let base = a.abs().max(b.abs());
    if base == 0.0 {
        0.0
    } else {
        (a - b).abs() / base
    }
}

/// Run one reconciliation pass. `auto_adopt` decides whether orphans are left
/// to the adoption pass or alerted for manual review.
pub async fn reconcile_once(
    store: &Store,
    bus: &EventBus,
    cache: &TtlCache,
    auto_adopt: bool,
) -> anyhow::Result<ReconciliationReport> {
    let positions = store.load_open_positions().await?;
    let mirrors = store.list_exchange_positions().await?;

    let mut differences: Vec<Difference> = Vec::new();
    let mut actions: Vec<String> = Vec::new();
    let mut resolved = 0usize;

    // --- DB -> exchange direction -------------------------------------------
    for position in &positions {
        if !matches!(position.status, PositionStatus::Active | PositionStatus::Closing) {
            continue;
        }

        let mut legs_found = 0;
        for leg in &position.legs {
            let mirror = mirrors
                .iter()
                .find(|m| m.exchange == leg.exchange && m.symbol == leg.symbol);

            match mirror {
                None => continue,
                Some(m) => {
                    legs_found += 1;

                    if m.side != leg.side {
                        differences.push(Difference {
                            kind: DifferenceKind::StateMismatch,
                            exchange: leg.exchange.clone(),
                            symbol: leg.symbol.clone(),
                            detail: format!(
                                "leg side {} but exchange reports {}",
                                leg.side, m.side
                            ),
                            critical: true,
                            action_taken: None,
                        });
                        continue;
                    }

                    let size_drift = rel_diff(leg.quantity, m.size);
                    if size_drift > SIZE_CRITICAL {
                        differences.push(Difference {
                            kind: DifferenceKind::SizeMismatch,
                            exchange: leg.exchange.clone(),
                            symbol: leg.symbol.clone(),
                            detail: format!(
                                "size drift {:.1}%: db {} vs exchange {}",
                                size_drift * 100.0,
                                leg.quantity,
                                m.size
                            ),
                            critical: true,
                            action_taken: None,
                        });
                    } else if size_drift > SIZE_TOLERANCE {
                        // Non-critical: take the exchange's number.
                        let mut updated = position.clone();
                        if let Some(l) =
                            updated.legs.iter_mut().find(|l| l.id == leg.id)
                        {
                            l.quantity = m.size;
                            l.notional_usd = m.notional_usd;
                            l.current_price = m.mark_price;
                        }
                        store.update_position(&updated).await?;
                        resolved += 1;
                        let action = format!(
                            "updated {} leg size on {} from {} to {}",
                            position.symbol, leg.exchange, leg.quantity, m.size
                        );
                        info!(position_id = %position.id, %action, "reconcile action");
                        actions.push(action.clone());
                        differences.push(Difference {
                            kind: DifferenceKind::SizeMismatch,
                            exchange: leg.exchange.clone(),
                            symbol: leg.symbol.clone(),
                            detail: format!("size drift {:.1}% corrected", size_drift * 100.0),
                            critical: false,
                            action_taken: Some(action),
                        });
                    }

                    let price_drift = rel_diff(leg.current_price, m.mark_price);
                    if price_drift > PRICE_TOLERANCE {
                        differences.push(Difference {
                            kind: DifferenceKind::PriceMismatch,
                            exchange: leg.exchange.clone(),
                            symbol: leg.symbol.clone(),
                            detail: format!(
                                "price drift {:.1}%: db {} vs mark {}",
                                price_drift * 100.0,
                                leg.current_price,
                                m.mark_price
                            ),
                            critical: false,
                            action_taken: None,
                        });
                    }
                }
            }
        }

        // DB says active, exchange shows neither leg: mark closed.
        if legs_found == 0 && !position.legs.is_empty() {
            let mut updated = position.clone();
            updated.status = PositionStatus::Closed;
            updated.closed_at = Some(Utc::now());
            updated.exit_reason = Some(ExitReason::MissingOnExchange.as_str().to_string());
            store.update_position(&updated).await?;
            resolved += 1;
            let action = format!(
                "marked position {} ({}) closed: no legs on exchange",
                position.id, position.symbol
            );
            warn!(position_id = %position.id, "position missing on exchange, marked closed");
            actions.push(action.clone());
            differences.push(Difference {
                kind: DifferenceKind::MissingOnExchange,
                exchange: position
                    .legs
                    .first()
                    .map(|l| l.exchange.clone())
                    .unwrap_or_default(),
                symbol: position.symbol.clone(),
                detail: "db active, exchange empty".to_string(),
                critical: false,
                action_taken: Some(action),
            });
        }
    }

    // --- Exchange -> DB direction -------------------------------------------
    let dust = Decimal::from(DUST_NOTIONAL_USD);
    for mirror in &mirrors {
        if mirror.notional_usd <= dust {
            continue;
        }
        let tracked = positions.iter().any(|p| {
            p.legs
                .iter()
                .any(|l| l.exchange == mirror.exchange && l.symbol == mirror.symbol)
        });
        if !tracked {
            differences.push(Difference {
                kind: DifferenceKind::OrphanOnExchange,
                exchange: mirror.exchange.clone(),
                symbol: mirror.symbol.clone(),
                detail: format!(
                    "untracked {} {} notional {}",
                    mirror.side, mirror.symbol, mirror.notional_usd
                ),
                critical: false,
                action_taken: if auto_adopt {
                    Some("queued for adoption".to_string())
                } else {
                    None
                },
            });
        }
    }

    let unresolved: Vec<Difference> = differences
        .iter()
        .filter(|d| d.action_taken.is_none())
        .cloned()
        .collect();
    let requires_review = unresolved.iter().filter(|d| d.critical).count();

    let report = ReconciliationReport {
        positions_checked: positions.len(),
        differences_found: differences.len(),
        resolved,
        requires_review,
        actions,
        unresolved,
        timestamp: Utc::now(),
    };

    cache.set_json(KEY_RECONCILIATION_REPORT, &report, None);

    if report.requires_review > 0 {
        bus.publish_alert(SystemAlert::ReconciliationAlert {
            requires_review: report.requires_review,
            message: format!(
                "{} reconciliation differences need review",
                report.requires_review
            ),
        });
        bus.publish_activity(ActivityEvent::warning(
            COMPONENT,
            "reconciliation_alert",
            format!("{} differences require review", report.requires_review),
            json!({
                "requires_review": report.requires_review,
                "differences_found": report.differences_found,
            }),
        ));
    }

    info!(
        checked = report.positions_checked,
        found = report.differences_found,
        resolved = report.resolved,
        requires_review = report.requires_review,
        "reconciliation cycle complete"
    );

    Ok(report)
}

/// Adopt orphans: pair untracked longs with shorts per symbol (FIFO),
/// leftovers become single-leg positions flagged for attention.
pub async fn adopt_untracked_positions(
    store: &Store,
    bus: &EventBus,
) -> anyhow::Result<(usize, usize)> {
    use crate::positions::{HealthStatus, LegType, Position};
    use crate::store::positions::new_leg;
    use crate::types::OrderSide;
    use std::collections::HashMap;

    let positions = store.load_open_positions().await?;
    let mirrors = store.list_exchange_positions().await?;
    let dust = Decimal::from(DUST_NOTIONAL_USD);

    let mut untracked: Vec<&ExchangePositionRecord> = mirrors
        .iter()
        .filter(|m| m.notional_usd > dust)
        .filter(|m| {
            !positions.iter().any(|p| {
                p.legs
                    .iter()
                    .any(|l| l.exchange == m.exchange && l.symbol == m.symbol)
            })
        })
        .collect();
    untracked.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.exchange.cmp(&b.exchange)));

    if untracked.is_empty() {
        return Ok((0, 0));
    }

    let mut by_symbol: HashMap<String, Vec<&ExchangePositionRecord>> = HashMap::new();
    for record in untracked {
        by_symbol.entry(record.symbol.clone()).or_default().push(record);
    }

    let mut adopted = 0usize;
    let mut unpaired = 0usize;
    let mut adopted_details = Vec::new();

    for (symbol, records) in by_symbol {
        let mut longs: Vec<&ExchangePositionRecord> = records
            .iter()
            .copied()
            .filter(|r| r.side == OrderSide::Long)
            .collect();
        let mut shorts: Vec<&ExchangePositionRecord> = records
            .iter()
            .copied()
            .filter(|r| r.side == OrderSide::Short)
            .collect();

        // Pair FIFO: earliest discovered long with earliest short.
        while !longs.is_empty() && !shorts.is_empty() {
            let long = longs.remove(0);
            let short = shorts.remove(0);

            let mut position = Position::new(symbol.clone(), None);
            position.status = PositionStatus::Active;
            position.health_status = HealthStatus::Attention;
            position.total_capital_deployed = long.notional_usd + short.notional_usd;
            position.opened_at = Some(long.updated_at.min(short.updated_at));

            let mut primary = new_leg(
                &position.id,
                LegType::Primary,
                &long.exchange,
                &symbol,
                OrderSide::Long,
                long.size,
                long.entry_price,
                long.notional_usd,
                long.leverage,
            );
            primary.current_price = long.mark_price;
            primary.liquidation_price = long.liquidation_price;

            let mut hedge = new_leg(
                &position.id,
                LegType::Hedge,
                &short.exchange,
                &symbol,
                OrderSide::Short,
                short.size,
                short.entry_price,
                short.notional_usd,
                short.leverage,
            );
            hedge.current_price = short.mark_price;
            hedge.liquidation_price = short.liquidation_price;

            position.legs = vec![primary, hedge];
            position.update_metrics();
            position.health_status = position.health_status.max(HealthStatus::Attention);

            store.insert_position(&position).await?;
            adopted += 1;
            adopted_details.push(json!({
                "position_id": position.id,
                "symbol": symbol,
                "long_exchange": long.exchange,
                "short_exchange": short.exchange,
                "notional": position.total_capital_deployed.to_string(),
            }));
            info!(
                symbol = %symbol,
                long = %long.exchange,
                short = %short.exchange,
                "adopted orphan position pair"
            );
        }

        // Leftovers: single-leg positions, flagged warning.
        for leftover in longs.into_iter().chain(shorts.into_iter()) {
            let mut position = Position::new(symbol.clone(), None);
            position.position_type = "single_leg".to_string();
            position.status = PositionStatus::Active;
            position.health_status = HealthStatus::Warning;
            position.total_capital_deployed = leftover.notional_usd;
            position.opened_at = Some(leftover.updated_at);

            let leg_type = if leftover.side == OrderSide::Long {
                LegType::Primary
            } else {
                LegType::Hedge
            };
            let mut leg = new_leg(
                &position.id,
                leg_type,
                &leftover.exchange,
                &symbol,
                leftover.side,
                leftover.size,
                leftover.entry_price,
                leftover.notional_usd,
                leftover.leverage,
            );
            leg.current_price = leftover.mark_price;
            position.legs = vec![leg];

            store.insert_position(&position).await?;
            unpaired += 1;
            warn!(
                symbol = %symbol,
                exchange = %leftover.exchange,
                side = %leftover.side,
                "adopted unpaired single-leg position"
            );
        }
    }

    bus.publish_activity(ActivityEvent::info(
        COMPONENT,
        "positions_adopted",
        format!("adopted {adopted} pairs and {unpaired} single legs into tracking"),
        json!({
            "adopted_pairs": adopted,
            "unpaired_positions": unpaired,
            "positions": adopted_details,
        }),
    ));

    Ok((adopted, unpaired))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::positions::LegType;
    use crate::store::positions::new_leg;
    use crate::types::OrderSide;
    use rust_decimal_macros::dec;

    fn mirror(
        exchange: &str,
        symbol: &str,
        side: OrderSide,
        size: Decimal,
        notional: Decimal,
    ) -> ExchangePositionRecord {
        ExchangePositionRecord {
            exchange: exchange.into(),
            symbol: symbol.into(),
            side,
            size,
            notional_usd: notional,
            entry_price: dec!(30000),
            mark_price: dec!(30000),
            unrealized_pnl: Decimal::ZERO,
            leverage: dec!(3),
            liquidation_price: None,
            margin_mode: "cross".into(),
            updated_at: Utc::now(),
        }
    }

    async fn tracked_position(store: &Store) -> crate::positions::Position {
        let mut pos = crate::positions::Position::new("BTC/USDT:USDT", None);
        pos.status = PositionStatus::Active;
        pos.total_capital_deployed = dec!(6000);
        pos.opened_at = Some(Utc::now());
        pos.legs = vec![
            new_leg(
                &pos.id,
                LegType::Primary,
                "binance_futures",
                "BTC/USDT:USDT",
                OrderSide::Long,
                dec!(0.1),
                dec!(30000),
                dec!(3000),
                dec!(3),
            ),
            new_leg(
                &pos.id,
                LegType::Hedge,
                "bybit_futures",
                "BTC/USDT:USDT",
                OrderSide::Short,
                dec!(0.1),
                dec!(30000),
                dec!(3000),
                dec!(3),
            ),
        ];
        store.insert_position(&pos).await.unwrap();
        pos
    }

    #[tokio::test]
    async fn clean_state_yields_empty_report() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let cache = TtlCache::new();
        tracked_position(&store).await;
        for side_mirror in [
            mirror("binance_futures", "BTC/USDT:USDT", OrderSide::Long, dec!(0.1), dec!(3000)),
            mirror("bybit_futures", "BTC/USDT:USDT", OrderSide::Short, dec!(0.1), dec!(3000)),
        ] {
            store.upsert_exchange_position(&side_mirror).await.unwrap();
        }

        let report = reconcile_once(&store, &bus, &cache, true).await.unwrap();
        assert_eq!(report.differences_found, 0);
        assert_eq!(report.requires_review, 0);
    }

    #[tokio::test]
    async fn missing_on_exchange_closes_db_position() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let cache = TtlCache::new();
        let pos = tracked_position(&store).await;

        let report = reconcile_once(&store, &bus, &cache, true).await.unwrap();
        assert_eq!(report.resolved, 1);

        let loaded = store.load_position(&pos.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Closed);
        assert_eq!(loaded.exit_reason.as_deref(), Some("missing_on_exchange"));
    }

    #[tokio::test]
    async fn small_size_drift_is_corrected_critical_is_alerted() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();
        let cache = TtlCache::new();
        tracked_position(&store).await;

        // 5% drift on binance leg (corrected), 60% on bybit leg (alert only).
        store
            .upsert_exchange_position(&mirror(
                "binance_futures",
                "BTC/USDT:USDT",
                OrderSide::Long,
                dec!(0.105),
                dec!(3150),
            ))
            .await
            .unwrap();
        store
            .upsert_exchange_position(&mirror(
                "bybit_futures",
                "BTC/USDT:USDT",
                OrderSide::Short,
                dec!(0.04),
                dec!(1200),
            ))
            .await
            .unwrap();

        let report = reconcile_once(&store, &bus, &cache, true).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.requires_review, 1);

        // Second run: corrected drift is gone, critical drift remains
        // unresolved but produces no new actions.
        let second = reconcile_once(&store, &bus, &cache, true).await.unwrap();
        assert_eq!(second.resolved, 0);
        assert!(second.actions.is_empty());
        assert_eq!(second.requires_review, 1);
    }

    #[tokio::test]
    async fn adoption_pairs_longs_with_shorts_and_flags_leftovers() {
        let store = Store::open_in_memory().unwrap();
        let bus = EventBus::new();

        for m in [
            mirror("binance_futures", "ETH/USDT:USDT", OrderSide::Long, dec!(1), dec!(2000)),
            mirror("bybit_futures", "ETH/USDT:USDT", OrderSide::Short, dec!(1), dec!(2000)),
            mirror("okex_futures", "ETH/USDT:USDT", OrderSide::Long, dec!(0.5), dec!(1000)),
        ] {
            store.upsert_exchange_position(&m).await.unwrap();
        }

        let (adopted, unpaired) = adopt_untracked_positions(&store, &bus).await.unwrap();
        assert_eq!(adopted, 1);
        assert_eq!(unpaired, 1);

        let positions = store.load_open_positions().await.unwrap();
        assert_eq!(positions.len(), 2);

        let pair = positions.iter().find(|p| p.legs.len() == 2).unwrap();
        assert_eq!(pair.health_status, crate::positions::HealthStatus::Attention);
        assert_ne!(pair.legs[0].side, pair.legs[1].side);

        let single = positions.iter().find(|p| p.legs.len() == 1).unwrap();
        assert_eq!(single.position_type, "single_leg");
        assert_eq!(single.health_status, crate::positions::HealthStatus::Warning);

        // Idempotence: a second adoption pass finds nothing untracked.
        let (again_adopted, again_unpaired) =
            adopt_untracked_positions(&store, &bus).await.unwrap();
        assert_eq!(again_adopted, 0);
        assert_eq!(again_unpaired, 0);
    }
}
