// =============================================================================
// Store: opportunity persistence
// =============================================================================
//
// Upsert keyed on id; mutable scoring fields and expiry are refreshed on
// conflict so repeated detection of the same identity key never duplicates a
// row.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::detector::scorer::UosBreakdown;
use crate::detector::{Opportunity, OpportunityLeg, OpportunityStatus};
use crate::market_data::funding::RateSource;
use crate::types::OrderSide;

use super::{dec_to_sql, sql_to_dec, sql_to_ts, ts_to_sql, Store};

impl Store {
    pub async fn upsert_opportunity(&self, opp: &Opportunity) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO opportunities_detected (
                id, symbol, base_asset, status,
                long_exchange, long_rate, short_exchange, short_rate,
                funding_spread, funding_spread_pct, estimated_net_apr,
                uos_score, return_score, risk_score, execution_score, timing_score,
                quality, recommended_size_usd, data_source, detected_at, expires_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11,
                      ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21)
            ON CONFLICT (id) DO UPDATE SET
                status = excluded.status,
                long_rate = excluded.long_rate,
                short_rate = excluded.short_rate,
                funding_spread = excluded.funding_spread,
                funding_spread_pct = excluded.funding_spread_pct,
                estimated_net_apr = excluded.estimated_net_apr,
                uos_score = excluded.uos_score,
                return_score = excluded.return_score,
                risk_score = excluded.risk_score,
                execution_score = excluded.execution_score,
                timing_score = excluded.timing_score,
                quality = excluded.quality,
                recommended_size_usd = excluded.recommended_size_usd,
                data_source = excluded.data_source,
                expires_at = excluded.expires_at",
            params![
                opp.id,
                opp.symbol,
                opp.base_asset,
                opp.status.as_str(),
                opp.long_leg.exchange,
                dec_to_sql(opp.long_leg.funding_rate),
                opp.short_leg.exchange,
                dec_to_sql(opp.short_leg.funding_rate),
                dec_to_sql(opp.funding_spread),
                dec_to_sql(opp.funding_spread_pct),
                dec_to_sql(opp.estimated_net_apr),
                opp.uos.total() as i64,
                opp.uos.return_score as i64,
                opp.uos.risk_score as i64,
                opp.uos.execution_score as i64,
                opp.uos.timing_score as i64,
                opp.uos.quality(),
                dec_to_sql(opp.recommended_size_usd),
                opp.data_source.to_string(),
                ts_to_sql(opp.detected_at),
                ts_to_sql(opp.expires_at),
            ],
        )
        .context("upsert opportunity")?;
        Ok(())
    }

    pub async fn update_opportunity_status(
        &self,
        id: &str,
        status: OpportunityStatus,
    ) -> Result<()> {
        let conn = self.lock().await;
        if status == OpportunityStatus::Executed {
            conn.execute(
                "UPDATE opportunities_detected
                 SET status = ?2, executed_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), ts_to_sql(Utc::now())],
            )
        } else {
            conn.execute(
                "UPDATE opportunities_detected SET status = ?2 WHERE id = ?1",
                params![id, status.as_str()],
            )
        }
        .context("update opportunity status")?;
        Ok(())
    }

    /// Non-terminal opportunities whose expiry is still in the future.
    pub async fn load_active_opportunities(&self, now: DateTime<Utc>) -> Result<Vec<Opportunity>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, symbol, base_asset, status,
                        long_exchange, long_rate, short_exchange, short_rate,
                        funding_spread, funding_spread_pct, estimated_net_apr,
                        return_score, risk_score, execution_score, timing_score,
                        recommended_size_usd, data_source, detected_at, expires_at
                 FROM opportunities_detected
                 WHERE status IN ('detected', 'validated', 'scored', 'allocated', 'executing')
                   AND expires_at > ?1
                 ORDER BY uos_score DESC
                 LIMIT 200",
            )
            .context("prepare opportunity recovery")?;

        let rows = stmt
            .query_map(params![ts_to_sql(now)], |row| {
                let status: String = row.get(3)?;
                let data_source: String = row.get(16)?;
                Ok(Opportunity {
                    id: row.get(0)?,
                    symbol: row.get(1)?,
                    base_asset: row.get(2)?,
                    status: OpportunityStatus::parse(&status)
                        .unwrap_or(OpportunityStatus::Detected),
                    long_leg: OpportunityLeg {
                        exchange: row.get(4)?,
                        side: OrderSide::Long,
                        funding_rate: sql_to_dec(&row.get::<_, String>(5)?),
                        estimated_slippage_pct: rust_decimal::Decimal::new(1, 1),
                    },
                    short_leg: OpportunityLeg {
                        exchange: row.get(6)?,
                        side: OrderSide::Short,
                        funding_rate: sql_to_dec(&row.get::<_, String>(7)?),
                        estimated_slippage_pct: rust_decimal::Decimal::new(1, 1),
                    },
                    funding_spread: sql_to_dec(&row.get::<_, String>(8)?),
                    funding_spread_pct: sql_to_dec(&row.get::<_, String>(9)?),
                    estimated_net_apr: sql_to_dec(&row.get::<_, String>(10)?),
                    uos: UosBreakdown {
                        return_score: row.get::<_, i64>(11)? as u8,
                        risk_score: row.get::<_, i64>(12)? as u8,
                        execution_score: row.get::<_, i64>(13)? as u8,
                        timing_score: row.get::<_, i64>(14)? as u8,
                    },
                    recommended_size_usd: sql_to_dec(&row.get::<_, String>(15)?),
                    data_source: if data_source == "reference" {
                        RateSource::Reference
                    } else {
                        RateSource::ExchangeApi
                    },
                    detected_at: sql_to_ts(&row.get::<_, String>(17)?),
                    expires_at: sql_to_ts(&row.get::<_, String>(18)?),
                })
            })
            .context("query opportunities")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map opportunity row")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::identity_key;
    use chrono::Duration;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn opportunity() -> Opportunity {
        let now = Utc::now();
        Opportunity {
            id: Uuid::new_v4().to_string(),
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
            uos: UosBreakdown {
                return_score: 20,
                risk_score: 25,
                execution_score: 20,
                timing_score: 12,
            },
            recommended_size_usd: dec!(2500),
            data_source: RateSource::ExchangeApi,
            detected_at: now,
            expires_at: now + Duration::minutes(30),
        }
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_id() {
        let store = Store::open_in_memory().unwrap();
        let mut opp = opportunity();

        store.upsert_opportunity(&opp).await.unwrap();
        opp.funding_spread_pct = dec!(0.03);
        store.upsert_opportunity(&opp).await.unwrap();

        let recovered = store.load_active_opportunities(Utc::now()).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, opp.id);
        assert_eq!(recovered[0].funding_spread_pct, dec!(0.03));
        assert_eq!(
            recovered[0].identity_key(),
            identity_key("BTC", "binance_futures", "bybit_futures")
        );
    }

    #[tokio::test]
    async fn recovery_skips_expired_and_terminal() {
        let store = Store::open_in_memory().unwrap();

        let live = opportunity();
        store.upsert_opportunity(&live).await.unwrap();

        let mut stale = opportunity();
        stale.expires_at = Utc::now() - Duration::minutes(1);
        store.upsert_opportunity(&stale).await.unwrap();

        let executed = opportunity();
        store.upsert_opportunity(&executed).await.unwrap();
        store
            .update_opportunity_status(&executed.id, OpportunityStatus::Executed)
            .await
            .unwrap();

        let recovered = store.load_active_opportunities(Utc::now()).await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].id, live.id);
    }

    #[tokio::test]
    async fn scores_survive_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let opp = opportunity();
        store.upsert_opportunity(&opp).await.unwrap();

        let recovered = store.load_active_opportunities(Utc::now()).await.unwrap();
        assert_eq!(recovered[0].uos.total(), opp.uos.total());
        assert_eq!(recovered[0].uos.return_score, 20);
        assert_eq!(recovered[0].long_leg.funding_rate, dec!(0.0001));
        assert_eq!(recovered[0].recommended_size_usd, Decimal::from(2500));
    }
}
