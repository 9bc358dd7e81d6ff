// =============================================================================
// Store: positions, legs, exchange mirrors, funding payments, interactions
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;
use rust_decimal::Decimal;
use serde::Serialize;
use uuid::Uuid;

use crate::positions::{
    ExitPolicy, FundingPayment, HealthStatus, Leg, LegType, Position, PositionStatus,
};
use crate::types::OrderSide;

use super::{
    dec_to_sql, opt_dec_to_sql, sql_to_dec, sql_to_opt_dec, sql_to_opt_ts, sql_to_ts, ts_to_sql,
    Store,
};

/// Mirror of one exchange-reported position, keyed (exchange, symbol).
#[derive(Debug, Clone, Serialize)]
pub struct ExchangePositionRecord {
    pub exchange: String,
    pub symbol: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub notional_usd: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: Decimal,
    pub liquidation_price: Option<Decimal>,
    pub margin_mode: String,
    pub updated_at: DateTime<Utc>,
}

/// Shared insert statements so both open paths run inside one transaction.
fn insert_position_stmts(conn: &rusqlite::Connection, position: &Position) -> Result<()> {
    conn.execute(
        "INSERT INTO positions_active (
            id, opportunity_id, position_type, symbol, base_asset,
            status, health_status, total_capital_deployed,
            entry_costs, exit_costs, funding_received, funding_paid,
            realized_pnl_funding, realized_pnl_price, funding_periods_collected,
            target_funding_rate_min, stop_loss_pct, take_profit_pct, max_hold_periods,
            opened_at, closed_at, exit_reason, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                  ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            position.id,
            position.opportunity_id,
            position.position_type,
            position.symbol,
            position.base_asset,
            position.status.as_str(),
            position.health_status.as_str(),
            dec_to_sql(position.total_capital_deployed),
            dec_to_sql(position.entry_costs),
            dec_to_sql(position.exit_costs),
            dec_to_sql(position.funding_received),
            dec_to_sql(position.funding_paid),
            dec_to_sql(position.realized_pnl_funding),
            dec_to_sql(position.realized_pnl_price),
            position.funding_periods_collected as i64,
            dec_to_sql(position.exit_policy.target_funding_rate_min),
            dec_to_sql(position.exit_policy.stop_loss_pct),
            opt_dec_to_sql(position.exit_policy.take_profit_pct),
            position.exit_policy.max_hold_periods as i64,
            position.opened_at.map(ts_to_sql),
            position.closed_at.map(ts_to_sql),
            position.exit_reason,
            ts_to_sql(Utc::now()),
        ],
    )
    .context("insert position")?;

    for leg in &position.legs {
        conn.execute(
            "INSERT INTO positions_legs (
                id, position_id, leg_type, exchange, symbol, side,
                quantity, entry_price, current_price, notional_usd, leverage,
                margin_used, unrealized_pnl, funding_pnl, liquidation_price,
                entry_order_ids, exit_order_ids
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                      ?12, ?13, ?14, ?15, ?16, ?17)",
            params![
                leg.id,
                leg.position_id,
                leg.leg_type.as_str(),
                leg.exchange,
                leg.symbol,
                leg.side.to_string(),
                dec_to_sql(leg.quantity),
                dec_to_sql(leg.entry_price),
                dec_to_sql(leg.current_price),
                dec_to_sql(leg.notional_usd),
                dec_to_sql(leg.leverage),
                dec_to_sql(leg.margin_used),
                dec_to_sql(leg.unrealized_pnl),
                dec_to_sql(leg.funding_pnl),
                opt_dec_to_sql(leg.liquidation_price),
                serde_json::to_string(&leg.entry_order_ids)?,
                serde_json::to_string(&leg.exit_order_ids)?,
            ],
        )
        .context("insert leg")?;
    }

    Ok(())
}

impl Store {
    // -------------------------------------------------------------------------
    // Positions + legs
    // -------------------------------------------------------------------------

    /// Insert a position and its legs in one transaction.
    pub async fn insert_position(&self, position: &Position) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction().context("begin insert_position")?;
        insert_position_stmts(&tx, position)?;
        tx.commit().context("commit insert_position")?;
        Ok(())
    }

    /// Open a position and flip its opportunity to `executed` in a single
    /// transaction, so a crash can never leave one without the other.
    pub async fn insert_position_with_opportunity(
        &self,
        position: &Position,
        opportunity_id: &str,
    ) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn
            .transaction()
            .context("begin insert_position_with_opportunity")?;
        insert_position_stmts(&tx, position)?;
        tx.execute(
            "UPDATE opportunities_detected
             SET status = 'executed', executed_at = ?2 WHERE id = ?1",
            params![opportunity_id, ts_to_sql(Utc::now())],
        )
        .context("mark opportunity executed")?;
        tx.commit().context("commit insert_position_with_opportunity")?;
        Ok(())
    }

    /// Persist the mutable fields of a position and its legs.
    pub async fn update_position(&self, position: &Position) -> Result<()> {
        let mut conn = self.lock().await;
        let tx = conn.transaction().context("begin update_position")?;

        tx.execute(
            "UPDATE positions_active SET
                status = ?2, health_status = ?3,
                entry_costs = ?4, exit_costs = ?5,
                funding_received = ?6, funding_paid = ?7,
                realized_pnl_funding = ?8, realized_pnl_price = ?9,
                funding_periods_collected = ?10,
                opened_at = ?11, closed_at = ?12, exit_reason = ?13,
                updated_at = ?14
             WHERE id = ?1",
            params![
                position.id,
                position.status.as_str(),
                position.health_status.as_str(),
                dec_to_sql(position.entry_costs),
                dec_to_sql(position.exit_costs),
                dec_to_sql(position.funding_received),
                dec_to_sql(position.funding_paid),
                dec_to_sql(position.realized_pnl_funding),
                dec_to_sql(position.realized_pnl_price),
                position.funding_periods_collected as i64,
                position.opened_at.map(ts_to_sql),
                position.closed_at.map(ts_to_sql),
                position.exit_reason,
                ts_to_sql(Utc::now()),
            ],
        )
        .context("update position")?;

        for leg in &position.legs {
            tx.execute(
                "UPDATE positions_legs SET
                    quantity = ?2, current_price = ?3, notional_usd = ?4,
                    margin_used = ?5, unrealized_pnl = ?6, funding_pnl = ?7,
                    liquidation_price = ?8, exit_order_ids = ?9
                 WHERE id = ?1",
                params![
                    leg.id,
                    dec_to_sql(leg.quantity),
                    dec_to_sql(leg.current_price),
                    dec_to_sql(leg.notional_usd),
                    dec_to_sql(leg.margin_used),
                    dec_to_sql(leg.unrealized_pnl),
                    dec_to_sql(leg.funding_pnl),
                    opt_dec_to_sql(leg.liquidation_price),
                    serde_json::to_string(&leg.exit_order_ids)?,
                ],
            )
            .context("update leg")?;
        }

        tx.commit().context("commit update_position")?;
        Ok(())
    }

    pub async fn load_position(&self, id: &str) -> Result<Option<Position>> {
        let positions = self.load_positions_where("p.id = ?1", vec![id.to_string()]).await?;
        Ok(positions.into_iter().next())
    }

    /// Positions in any non-terminal status, legs attached.
    pub async fn load_open_positions(&self) -> Result<Vec<Position>> {
        self.load_positions_where(
            "p.status IN ('pending', 'opening', 'active', 'closing')",
            vec![],
        )
        .await
    }

    pub async fn load_closed_positions(&self, limit: usize) -> Result<Vec<Position>> {
        let mut positions = self
            .load_positions_where("p.status = 'closed'", vec![])
            .await?;
        positions.sort_by(|a, b| b.closed_at.cmp(&a.closed_at));
        positions.truncate(limit);
        Ok(positions)
    }

    async fn load_positions_where(
        &self,
        predicate: &str,
        binds: Vec<String>,
    ) -> Result<Vec<Position>> {
        let conn = self.lock().await;
        let sql = format!(
            "SELECT p.id, p.opportunity_id, p.position_type, p.symbol, p.base_asset,
                    p.status, p.health_status, p.total_capital_deployed,
                    p.entry_costs, p.exit_costs, p.funding_received, p.funding_paid,
                    p.realized_pnl_funding, p.realized_pnl_price, p.funding_periods_collected,
                    p.target_funding_rate_min, p.stop_loss_pct, p.take_profit_pct,
                    p.max_hold_periods, p.opened_at, p.closed_at, p.exit_reason
             FROM positions_active p
             WHERE {predicate}"
        );

        let mut stmt = conn.prepare(&sql).context("prepare position query")?;
        let bind_refs: Vec<&dyn rusqlite::ToSql> =
            binds.iter().map(|b| b as &dyn rusqlite::ToSql).collect();

        let rows = stmt
            .query_map(&bind_refs[..], |row| {
                let status: String = row.get(5)?;
                let health: String = row.get(6)?;
                Ok(Position {
                    id: row.get(0)?,
                    opportunity_id: row.get(1)?,
                    position_type: row.get(2)?,
                    symbol: row.get(3)?,
                    base_asset: row.get(4)?,
                    status: PositionStatus::parse(&status).unwrap_or(PositionStatus::Active),
                    health_status: HealthStatus::parse(&health).unwrap_or(HealthStatus::Healthy),
                    total_capital_deployed: sql_to_dec(&row.get::<_, String>(7)?),
                    entry_costs: sql_to_dec(&row.get::<_, String>(8)?),
                    exit_costs: sql_to_dec(&row.get::<_, String>(9)?),
                    funding_received: sql_to_dec(&row.get::<_, String>(10)?),
                    funding_paid: sql_to_dec(&row.get::<_, String>(11)?),
                    realized_pnl_funding: sql_to_dec(&row.get::<_, String>(12)?),
                    realized_pnl_price: sql_to_dec(&row.get::<_, String>(13)?),
                    funding_periods_collected: row.get::<_, i64>(14)? as u32,
                    exit_policy: ExitPolicy {
                        target_funding_rate_min: sql_to_dec(&row.get::<_, String>(15)?),
                        stop_loss_pct: sql_to_dec(&row.get::<_, String>(16)?),
                        take_profit_pct: sql_to_opt_dec(row.get::<_, Option<String>>(17)?),
                        max_hold_periods: row.get::<_, i64>(18)? as u32,
                    },
                    net_delta: Decimal::ZERO,
                    delta_exposure_pct: Decimal::ZERO,
                    max_margin_utilization: Decimal::ZERO,
                    min_liquidation_distance: None,
                    opened_at: sql_to_opt_ts(row.get::<_, Option<String>>(19)?),
                    closed_at: sql_to_opt_ts(row.get::<_, Option<String>>(20)?),
                    exit_reason: row.get(21)?,
                    legs: Vec::new(),
                })
            })
            .context("query positions")?;

        let mut positions = Vec::new();
        for row in rows {
            positions.push(row.context("map position row")?);
        }

        // Attach legs.
        let mut leg_stmt = conn
            .prepare_cached(
                "SELECT id, position_id, leg_type, exchange, symbol, side,
                        quantity, entry_price, current_price, notional_usd, leverage,
                        margin_used, unrealized_pnl, funding_pnl, liquidation_price,
                        entry_order_ids, exit_order_ids
                 FROM positions_legs WHERE position_id = ?1",
            )
            .context("prepare leg query")?;

        for position in &mut positions {
            let legs = leg_stmt
                .query_map(params![position.id], |row| {
                    let leg_type: String = row.get(2)?;
                    let side: String = row.get(5)?;
                    let entry_ids: String = row.get(15)?;
                    let exit_ids: String = row.get(16)?;
                    Ok(Leg {
                        id: row.get(0)?,
                        position_id: row.get(1)?,
                        leg_type: LegType::parse(&leg_type).unwrap_or(LegType::Primary),
                        exchange: row.get(3)?,
                        symbol: row.get(4)?,
                        side: OrderSide::parse(&side).unwrap_or(OrderSide::Long),
                        quantity: sql_to_dec(&row.get::<_, String>(6)?),
                        entry_price: sql_to_dec(&row.get::<_, String>(7)?),
                        current_price: sql_to_dec(&row.get::<_, String>(8)?),
                        notional_usd: sql_to_dec(&row.get::<_, String>(9)?),
                        leverage: sql_to_dec(&row.get::<_, String>(10)?),
                        margin_used: sql_to_dec(&row.get::<_, String>(11)?),
                        unrealized_pnl: sql_to_dec(&row.get::<_, String>(12)?),
                        funding_pnl: sql_to_dec(&row.get::<_, String>(13)?),
                        liquidation_price: sql_to_opt_dec(row.get::<_, Option<String>>(14)?),
                        entry_order_ids: serde_json::from_str(&entry_ids).unwrap_or_default(),
                        exit_order_ids: serde_json::from_str(&exit_ids).unwrap_or_default(),
                    })
                })
                .context("query legs")?;

            for leg in legs {
                position.legs.push(leg.context("map leg row")?);
            }
            position.update_metrics();
        }

        Ok(positions)
    }

    /// Distinct symbols with a non-terminal position: the authoritative
    /// active-coin count for the allocator.
    pub async fn count_active_symbols(&self) -> Result<usize> {
        let conn = self.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(DISTINCT symbol) FROM positions_active
                 WHERE status IN ('pending', 'opening', 'active', 'closing')",
                [],
                |row| row.get(0),
            )
            .context("count active symbols")?;
        Ok(count as usize)
    }

    // -------------------------------------------------------------------------
    // Exchange mirrors
    // -------------------------------------------------------------------------

    pub async fn upsert_exchange_position(&self, record: &ExchangePositionRecord) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO exchange_positions (
                exchange, symbol, side, size, notional_usd, entry_price,
                mark_price, unrealized_pnl, leverage, liquidation_price,
                margin_mode, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (exchange, symbol) DO UPDATE SET
                side = excluded.side,
                size = excluded.size,
                notional_usd = excluded.notional_usd,
                entry_price = excluded.entry_price,
                mark_price = excluded.mark_price,
                unrealized_pnl = excluded.unrealized_pnl,
                leverage = excluded.leverage,
                liquidation_price = excluded.liquidation_price,
                margin_mode = excluded.margin_mode,
                updated_at = excluded.updated_at",
            params![
                record.exchange,
                record.symbol,
                record.side.to_string(),
                dec_to_sql(record.size),
                dec_to_sql(record.notional_usd),
                dec_to_sql(record.entry_price),
                dec_to_sql(record.mark_price),
                dec_to_sql(record.unrealized_pnl),
                dec_to_sql(record.leverage),
                opt_dec_to_sql(record.liquidation_price),
                record.margin_mode,
                ts_to_sql(record.updated_at),
            ],
        )
        .context("upsert exchange position")?;
        Ok(())
    }

    /// Drop mirror rows for an exchange that are not in `live_symbols`
    /// (positions closed venue-side since the last sync).
    pub async fn prune_exchange_positions(
        &self,
        exchange: &str,
        live_symbols: &[String],
    ) -> Result<usize> {
        let conn = self.lock().await;
        let existing: Vec<String> = {
            let mut stmt = conn
                .prepare_cached("SELECT symbol FROM exchange_positions WHERE exchange = ?1")
                .context("prepare prune query")?;
            let rows = stmt
                .query_map(params![exchange], |row| row.get::<_, String>(0))
                .context("query mirror symbols")?;
            let mut out = Vec::new();
            for row in rows {
                out.push(row.context("map symbol")?);
            }
            out
        };

        let mut pruned = 0;
        for symbol in existing {
            if !live_symbols.contains(&symbol) {
                conn.execute(
                    "DELETE FROM exchange_positions WHERE exchange = ?1 AND symbol = ?2",
                    params![exchange, symbol],
                )
                .context("prune exchange position")?;
                pruned += 1;
            }
        }
        Ok(pruned)
    }

    pub async fn list_exchange_positions(&self) -> Result<Vec<ExchangePositionRecord>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT exchange, symbol, side, size, notional_usd, entry_price,
                        mark_price, unrealized_pnl, leverage, liquidation_price,
                        margin_mode, updated_at
                 FROM exchange_positions ORDER BY symbol, exchange",
            )
            .context("prepare exchange positions query")?;

        let rows = stmt
            .query_map([], |row| {
                let side: String = row.get(2)?;
                Ok(ExchangePositionRecord {
                    exchange: row.get(0)?,
                    symbol: row.get(1)?,
                    side: OrderSide::parse(&side).unwrap_or(OrderSide::Long),
                    size: sql_to_dec(&row.get::<_, String>(3)?),
                    notional_usd: sql_to_dec(&row.get::<_, String>(4)?),
                    entry_price: sql_to_dec(&row.get::<_, String>(5)?),
                    mark_price: sql_to_dec(&row.get::<_, String>(6)?),
                    unrealized_pnl: sql_to_dec(&row.get::<_, String>(7)?),
                    leverage: sql_to_dec(&row.get::<_, String>(8)?),
                    liquidation_price: sql_to_opt_dec(row.get::<_, Option<String>>(9)?),
                    margin_mode: row.get(10)?,
                    updated_at: sql_to_ts(&row.get::<_, String>(11)?),
                })
            })
            .context("query exchange positions")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map exchange position")?);
        }
        Ok(out)
    }

    pub async fn upsert_exchange_order(
        &self,
        exchange: &str,
        order: &crate::exchanges::RawExchangeOrder,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO exchange_orders (
                exchange, exchange_order_id, symbol, side, order_type,
                price, amount, filled, remaining, status, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (exchange, exchange_order_id) DO UPDATE SET
                filled = excluded.filled,
                remaining = excluded.remaining,
                status = excluded.status,
                updated_at = excluded.updated_at",
            params![
                exchange,
                order.exchange_order_id,
                order.symbol,
                order.side,
                order.order_type,
                dec_to_sql(order.price),
                dec_to_sql(order.amount),
                dec_to_sql(order.filled),
                dec_to_sql(order.remaining),
                order.status,
                order.created_at.map(ts_to_sql),
                ts_to_sql(Utc::now()),
            ],
        )
        .context("upsert exchange order")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Funding payments & interaction log
    // -------------------------------------------------------------------------

    pub async fn insert_funding_payment(&self, payment: &FundingPayment) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO funding_payments (
                id, position_id, leg_id, exchange, symbol,
                funding_rate, payment_amount, position_size, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                payment.id,
                payment.position_id,
                payment.leg_id,
                payment.exchange,
                payment.symbol,
                dec_to_sql(payment.funding_rate),
                dec_to_sql(payment.payment_amount),
                dec_to_sql(payment.position_size),
                ts_to_sql(payment.timestamp),
            ],
        )
        .context("insert funding payment")?;
        Ok(())
    }

    /// Interaction log row: the "why did it do that" audit behind every
    /// health check, exit evaluation and funding event.
    pub async fn insert_interaction(
        &self,
        position_id: &str,
        interaction_type: &str,
        worker: &str,
        decision: &str,
        narrative: &str,
        metrics: serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO position_interactions (
                position_id, interaction_type, worker, decision, narrative, metrics, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                position_id,
                interaction_type,
                worker,
                decision,
                narrative,
                metrics.to_string(),
                ts_to_sql(Utc::now()),
            ],
        )
        .context("insert interaction")?;
        Ok(())
    }

    pub async fn list_interactions(
        &self,
        position_id: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT interaction_type, worker, decision, narrative, metrics, ts
                 FROM position_interactions
                 WHERE position_id = ?1 ORDER BY id DESC LIMIT ?2",
            )
            .context("prepare interactions query")?;

        let rows = stmt
            .query_map(params![position_id, limit as i64], |row| {
                let metrics: String = row.get(4)?;
                Ok(serde_json::json!({
                    "interaction_type": row.get::<_, String>(0)?,
                    "worker": row.get::<_, String>(1)?,
                    "decision": row.get::<_, String>(2)?,
                    "narrative": row.get::<_, String>(3)?,
                    "metrics": serde_json::from_str::<serde_json::Value>(&metrics)
                        .unwrap_or(serde_json::Value::Null),
                    "ts": row.get::<_, String>(5)?,
                }))
            })
            .context("query interactions")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map interaction")?);
        }
        Ok(out)
    }
}

/// Builder used by orphan adoption and the executor.
pub fn new_leg(
    position_id: &str,
    leg_type: LegType,
    exchange: &str,
    symbol: &str,
    side: OrderSide,
    quantity: Decimal,
    entry_price: Decimal,
    notional_usd: Decimal,
    leverage: Decimal,
) -> Leg {
    Leg {
        id: Uuid::new_v4().to_string(),
        position_id: position_id.to_string(),
        leg_type,
        exchange: exchange.to_string(),
        symbol: symbol.to_string(),
        side,
        quantity,
        entry_price,
        current_price: entry_price,
        notional_usd,
        leverage,
        margin_used: Decimal::ZERO,
        unrealized_pnl: Decimal::ZERO,
        funding_pnl: Decimal::ZERO,
        liquidation_price: None,
        entry_order_ids: Vec::new(),
        exit_order_ids: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample_position() -> Position {
        let mut position = Position::new("BTC/USDT:USDT", Some("opp-1".to_string()));
        position.status = PositionStatus::Active;
        position.total_capital_deployed = dec!(1000);
        position.opened_at = Some(Utc::now());
        position.legs = vec![
            new_leg(
                &position.id,
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
                &position.id,
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
        position
    }

    #[tokio::test]
    async fn position_roundtrip_with_legs() {
        let store = Store::open_in_memory().unwrap();
        let position = sample_position();
        store.insert_position(&position).await.unwrap();

        let loaded = store.load_position(&position.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, position.id);
        assert_eq!(loaded.legs.len(), 2);
        assert_eq!(loaded.status, PositionStatus::Active);
        assert_ne!(loaded.legs[0].side, loaded.legs[1].side);
        assert_eq!(loaded.total_capital_deployed, dec!(1000));
    }

    #[tokio::test]
    async fn open_with_opportunity_commits_both_or_neither() {
        use crate::detector::scorer::UosBreakdown;
        use crate::detector::{Opportunity, OpportunityLeg, OpportunityStatus};
        use crate::market_data::funding::RateSource;

        let store = Store::open_in_memory().unwrap();
        let now = Utc::now();
        let opportunity = Opportunity {
            id: "opp-1".into(),
            symbol: "BTC".into(),
            base_asset: "BTC".into(),
            status: OpportunityStatus::Detected,
            long_leg: OpportunityLeg {
                exchange: "binance_futures".into(),
                side: OrderSide::Long,
                funding_rate: dec!(0.0001),
                estimated_slippage_pct: dec!(0.1),
            },
            short_leg: OpportunityLeg {
                exchange: "bybit_futures".into(),
                side: OrderSide::Short,
                funding_rate: dec!(0.0003),
                estimated_slippage_pct: dec!(0.1),
            },
            funding_spread: dec!(0.0002),
            funding_spread_pct: dec!(0.02),
            estimated_net_apr: dec!(21.9),
            uos: UosBreakdown::default(),
            recommended_size_usd: dec!(1000),
            data_source: RateSource::ExchangeApi,
            detected_at: now,
            expires_at: now + chrono::Duration::minutes(30),
        };
        store.upsert_opportunity(&opportunity).await.unwrap();

        let position = sample_position();
        store
            .insert_position_with_opportunity(&position, "opp-1")
            .await
            .unwrap();

        assert!(store.load_position(&position.id).await.unwrap().is_some());
        // The opportunity left the active set in the same commit.
        assert!(store.load_active_opportunities(now).await.unwrap().is_empty());

        // A failing insert rolls the whole transaction back: re-arm the
        // opportunity, then collide on the existing position id.
        store.upsert_opportunity(&opportunity).await.unwrap();
        let duplicate = position.clone();
        assert!(store
            .insert_position_with_opportunity(&duplicate, "opp-1")
            .await
            .is_err());
        let active = store.load_active_opportunities(now).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].status, OpportunityStatus::Detected);
    }

    #[tokio::test]
    async fn count_active_symbols_is_distinct_non_terminal() {
        let store = Store::open_in_memory().unwrap();

        let btc = sample_position();
        store.insert_position(&btc).await.unwrap();

        // Second BTC position: same symbol counts once.
        let btc2 = sample_position();
        store.insert_position(&btc2).await.unwrap();

        let mut eth = sample_position();
        eth.id = Uuid::new_v4().to_string();
        eth.symbol = "ETH/USDT:USDT".into();
        eth.legs.clear();
        store.insert_position(&eth).await.unwrap();

        let mut closed = sample_position();
        closed.id = Uuid::new_v4().to_string();
        closed.symbol = "SOL/USDT:USDT".into();
        closed.status = PositionStatus::Closed;
        closed.legs.clear();
        store.insert_position(&closed).await.unwrap();

        assert_eq!(store.count_active_symbols().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn exchange_position_upsert_and_prune() {
        let store = Store::open_in_memory().unwrap();
        let mut record = ExchangePositionRecord {
            exchange: "binance_futures".into(),
            symbol: "BTC/USDT:USDT".into(),
            side: OrderSide::Long,
            size: dec!(0.1),
            notional_usd: dec!(3000),
            entry_price: dec!(30000),
            mark_price: dec!(30100),
            unrealized_pnl: dec!(10),
            leverage: dec!(3),
            liquidation_price: None,
            margin_mode: "cross".into(),
            updated_at: Utc::now(),
        };
        store.upsert_exchange_position(&record).await.unwrap();

        record.size = dec!(0.2);
        store.upsert_exchange_position(&record).await.unwrap();

        let listed = store.list_exchange_positions().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, dec!(0.2));

        let pruned = store
            .prune_exchange_positions("binance_futures", &[])
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.list_exchange_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interactions_append_and_list() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_interaction(
                "pos-1",
                "health_check",
                "position-sync",
                "healthy",
                "delta 0.2% within tolerance",
                serde_json::json!({"delta_pct": 0.2}),
            )
            .await
            .unwrap();

        let rows = store.list_interactions("pos-1", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["interaction_type"], "health_check");
    }
}
