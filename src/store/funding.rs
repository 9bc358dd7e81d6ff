// =============================================================================
// Store: funding rates, spread history, venue balances
// =============================================================================

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use rusqlite::params;

use crate::capital::VenueBalance;
use crate::market_data::funding::{FundingRate, Spread};

use super::{dec_to_sql, sql_to_dec, sql_to_opt_ts, ts_to_sql, Store};

impl Store {
    /// Latest unified rate per (exchange, symbol).
    pub async fn upsert_funding_rate(&self, rate: &FundingRate) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO funding_rates (exchange, symbol, rate, funding_interval_hours, source, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (exchange, symbol) DO UPDATE SET
                rate = excluded.rate,
                funding_interval_hours = excluded.funding_interval_hours,
                source = excluded.source,
                ts = excluded.ts",
            params![
                rate.exchange,
                rate.symbol,
                dec_to_sql(rate.rate),
                rate.funding_interval_hours as i64,
                rate.source.to_string(),
                ts_to_sql(rate.timestamp),
            ],
        )
        .context("upsert funding rate")?;
        Ok(())
    }

    /// Append-only spread capture for offline analysis and model training.
    pub async fn insert_spread_history(&self, spread: &Spread, source: &str) -> Result<()> {
        let conn = self.lock().await;
        // spread_annualized is stored as a fraction, not percent.
        let annualized_fraction = spread.annualized_apr / rust_decimal::Decimal::from(100);
        conn.execute(
            "INSERT INTO spread_history (
                symbol, long_exchange, short_exchange, long_rate, short_rate,
                spread, spread_annualized, data_source, ts
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                spread.symbol,
                spread.long_exchange,
                spread.short_exchange,
                dec_to_sql(spread.long_rate),
                dec_to_sql(spread.short_rate),
                dec_to_sql(spread.spread),
                dec_to_sql(annualized_fraction),
                source,
                ts_to_sql(Utc::now()),
            ],
        )
        .context("insert spread history")?;
        Ok(())
    }

    /// Drop spread history older than `days`; returns rows deleted.
    pub async fn cleanup_spread_history(&self, days: i64) -> Result<usize> {
        let conn = self.lock().await;
        let cutoff = ts_to_sql(Utc::now() - Duration::days(days));
        let deleted = conn
            .execute("DELETE FROM spread_history WHERE ts < ?1", params![cutoff])
            .context("cleanup spread history")?;
        Ok(deleted)
    }

    pub async fn spread_history_for_symbol(
        &self,
        symbol: &str,
        limit: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT symbol, long_exchange, short_exchange, long_rate, short_rate,
                        spread, spread_annualized, data_source, ts
                 FROM spread_history WHERE symbol = ?1 ORDER BY ts DESC LIMIT ?2",
            )
            .context("prepare spread history query")?;

        let rows = stmt
            .query_map(params![symbol, limit as i64], |row| {
                Ok(serde_json::json!({
                    "symbol": row.get::<_, String>(0)?,
                    "long_exchange": row.get::<_, String>(1)?,
                    "short_exchange": row.get::<_, String>(2)?,
                    "long_rate": row.get::<_, String>(3)?,
                    "short_rate": row.get::<_, String>(4)?,
                    "spread": row.get::<_, String>(5)?,
                    "spread_annualized": row.get::<_, String>(6)?,
                    "data_source": row.get::<_, String>(7)?,
                    "ts": row.get::<_, String>(8)?,
                }))
            })
            .context("query spread history")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map spread history row")?);
        }
        Ok(out)
    }

    pub async fn upsert_venue_balance(&self, balance: &VenueBalance) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO venue_balances (venue, total_usd, margin_used, margin_available, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (venue) DO UPDATE SET
                total_usd = excluded.total_usd,
                margin_used = excluded.margin_used,
                margin_available = excluded.margin_available,
                updated_at = excluded.updated_at",
            params![
                balance.venue,
                dec_to_sql(balance.total_usd),
                dec_to_sql(balance.margin_used),
                dec_to_sql(balance.margin_available),
                ts_to_sql(Utc::now()),
            ],
        )
        .context("upsert venue balance")?;
        Ok(())
    }

    pub async fn list_venue_balances(&self) -> Result<Vec<VenueBalance>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT venue, total_usd, margin_used, margin_available, updated_at
                 FROM venue_balances",
            )
            .context("prepare venue balances query")?;

        let rows = stmt
            .query_map([], |row| {
                Ok(VenueBalance {
                    venue: row.get(0)?,
                    total_usd: sql_to_dec(&row.get::<_, String>(1)?),
                    margin_used: sql_to_dec(&row.get::<_, String>(2)?),
                    margin_available: sql_to_dec(&row.get::<_, String>(3)?),
                    last_updated: sql_to_opt_ts(row.get::<_, Option<String>>(4)?),
                })
            })
            .context("query venue balances")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map venue balance")?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::funding::RateSource;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn spread_history_insert_and_cleanup() {
        let store = Store::open_in_memory().unwrap();
        let a = FundingRate::new("binance_futures", "BTC/USDT:USDT", dec!(0.0001), 8, RateSource::ExchangeApi);
        let b = FundingRate::new("bybit_futures", "BTC/USDT:USDT", dec!(0.0003), 8, RateSource::ExchangeApi);
        let spread = Spread::from_pair("BTC", &a, &b);

        store.insert_spread_history(&spread, "aggregator").await.unwrap();
        let rows = store.spread_history_for_symbol("BTC", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        // 21.9% APR stored as 0.219 fraction.
        let stored = sql_to_dec(rows[0]["spread_annualized"].as_str().unwrap());
        assert_eq!(stored, dec!(0.219));

        // Nothing old enough to purge yet.
        assert_eq!(store.cleanup_spread_history(90).await.unwrap(), 0);
        // Everything is older than "-1 days" from now.
        assert_eq!(store.cleanup_spread_history(-1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn venue_balance_upsert() {
        let store = Store::open_in_memory().unwrap();
        let balance = VenueBalance {
            venue: "binance_futures".into(),
            total_usd: dec!(10000),
            margin_used: dec!(2000),
            margin_available: dec!(8000),
            last_updated: None,
        };
        store.upsert_venue_balance(&balance).await.unwrap();
        store.upsert_venue_balance(&balance).await.unwrap();

        let listed = store.list_venue_balances().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].total_usd, dec!(10000));
    }
}
