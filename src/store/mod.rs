// =============================================================================
// Durable store — SQLite-backed authoritative records
// =============================================================================
//
// Holds everything the engine must not lose: opportunities, positions and
// legs, exchange mirrors, funding history, configuration (including encrypted
// credentials) and the audit trail. Caches and events stay in memory; this is
// the record of truth.
//
// Monetary values are stored as TEXT to keep decimal precision through SQLite.
// =============================================================================

pub mod audit;
pub mod config;
pub mod funding;
pub mod opportunities;
pub mod positions;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::info;

/// Shared handle to the engine database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        Self::init_schema(&conn)?;
        info!(path = %path.display(), "store opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        conn.pragma_update(None, "foreign_keys", "ON").ok();
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS opportunities_detected (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                status TEXT NOT NULL,
                long_exchange TEXT NOT NULL,
                long_rate TEXT NOT NULL,
                short_exchange TEXT NOT NULL,
                short_rate TEXT NOT NULL,
                funding_spread TEXT NOT NULL,
                funding_spread_pct TEXT NOT NULL,
                estimated_net_apr TEXT NOT NULL,
                uos_score INTEGER NOT NULL,
                return_score INTEGER NOT NULL,
                risk_score INTEGER NOT NULL,
                execution_score INTEGER NOT NULL,
                timing_score INTEGER NOT NULL,
                quality TEXT NOT NULL,
                recommended_size_usd TEXT NOT NULL,
                data_source TEXT NOT NULL,
                detected_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                executed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_opportunities_status
                ON opportunities_detected(status, expires_at);

            CREATE TABLE IF NOT EXISTS positions_active (
                id TEXT PRIMARY KEY,
                opportunity_id TEXT,
                position_type TEXT NOT NULL,
                symbol TEXT NOT NULL,
                base_asset TEXT NOT NULL,
                status TEXT NOT NULL,
                health_status TEXT NOT NULL,
                total_capital_deployed TEXT NOT NULL,
                entry_costs TEXT NOT NULL,
                exit_costs TEXT NOT NULL,
                funding_received TEXT NOT NULL,
                funding_paid TEXT NOT NULL,
                realized_pnl_funding TEXT NOT NULL,
                realized_pnl_price TEXT NOT NULL,
                funding_periods_collected INTEGER NOT NULL,
                target_funding_rate_min TEXT NOT NULL,
                stop_loss_pct TEXT NOT NULL,
                take_profit_pct TEXT,
                max_hold_periods INTEGER NOT NULL,
                opened_at TEXT,
                closed_at TEXT,
                exit_reason TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_positions_status ON positions_active(status);

            CREATE TABLE IF NOT EXISTS positions_legs (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL REFERENCES positions_active(id) ON DELETE CASCADE,
                leg_type TEXT NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                quantity TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                current_price TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                leverage TEXT NOT NULL,
                margin_used TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                funding_pnl TEXT NOT NULL,
                liquidation_price TEXT,
                entry_order_ids TEXT NOT NULL,
                exit_order_ids TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_legs_position ON positions_legs(position_id);
            CREATE INDEX IF NOT EXISTS idx_legs_exchange_symbol ON positions_legs(exchange, symbol);

            CREATE TABLE IF NOT EXISTS exchange_positions (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                size TEXT NOT NULL,
                notional_usd TEXT NOT NULL,
                entry_price TEXT NOT NULL,
                mark_price TEXT NOT NULL,
                unrealized_pnl TEXT NOT NULL,
                leverage TEXT NOT NULL,
                liquidation_price TEXT,
                margin_mode TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (exchange, symbol)
            );

            CREATE TABLE IF NOT EXISTS exchange_orders (
                exchange TEXT NOT NULL,
                exchange_order_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                side TEXT NOT NULL,
                order_type TEXT NOT NULL,
                price TEXT NOT NULL,
                amount TEXT NOT NULL,
                filled TEXT NOT NULL,
                remaining TEXT NOT NULL,
                status TEXT NOT NULL,
                created_at TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (exchange, exchange_order_id)
            );

            CREATE TABLE IF NOT EXISTS funding_payments (
                id TEXT PRIMARY KEY,
                position_id TEXT NOT NULL,
                leg_id TEXT NOT NULL,
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                funding_rate TEXT NOT NULL,
                payment_amount TEXT NOT NULL,
                position_size TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_funding_payments_position
                ON funding_payments(position_id, ts DESC);

            CREATE TABLE IF NOT EXISTS funding_rates (
                exchange TEXT NOT NULL,
                symbol TEXT NOT NULL,
                rate TEXT NOT NULL,
                funding_interval_hours INTEGER NOT NULL,
                source TEXT NOT NULL,
                ts TEXT NOT NULL,
                PRIMARY KEY (exchange, symbol)
            );

            CREATE TABLE IF NOT EXISTS spread_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                symbol TEXT NOT NULL,
                long_exchange TEXT NOT NULL,
                short_exchange TEXT NOT NULL,
                long_rate TEXT NOT NULL,
                short_rate TEXT NOT NULL,
                spread TEXT NOT NULL,
                spread_annualized TEXT NOT NULL,
                data_source TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_spread_history_ts ON spread_history(ts);
            CREATE INDEX IF NOT EXISTS idx_spread_history_symbol
                ON spread_history(symbol, ts DESC);

            CREATE TABLE IF NOT EXISTS venue_balances (
                venue TEXT PRIMARY KEY,
                total_usd TEXT NOT NULL,
                margin_used TEXT NOT NULL,
                margin_available TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config_exchanges (
                slug TEXT PRIMARY KEY,
                display_name TEXT NOT NULL,
                api_type TEXT NOT NULL,
                tier INTEGER NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                api_key_enc TEXT,
                api_secret_enc TEXT,
                passphrase_enc TEXT,
                wallet_address_enc TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config_risk_limits (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                is_active INTEGER NOT NULL DEFAULT 1,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS config_strategy (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS symbol_blacklist (
                symbol TEXT PRIMARY KEY,
                reason TEXT,
                blacklisted_by TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS activity_events (
                id TEXT PRIMARY KEY,
                activity_type TEXT NOT NULL,
                component TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL,
                details TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_activity_ts ON activity_events(ts DESC);

            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                opportunity_id TEXT NOT NULL,
                phase TEXT NOT NULL,
                detail TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_execution_logs_opportunity
                ON execution_logs(opportunity_id, id);

            CREATE TABLE IF NOT EXISTS audit_actions (
                id TEXT PRIMARY KEY,
                actor TEXT NOT NULL,
                action TEXT NOT NULL,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                detail TEXT NOT NULL,
                ts TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS position_interactions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                interaction_type TEXT NOT NULL,
                worker TEXT NOT NULL,
                decision TEXT NOT NULL,
                narrative TEXT NOT NULL,
                metrics TEXT NOT NULL,
                ts TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_interactions_position
                ON position_interactions(position_id, id DESC);
            ",
        )
        .context("initialise schema")?;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Column conversion helpers
// -----------------------------------------------------------------------------

pub(crate) fn dec_to_sql(value: Decimal) -> String {
    value.to_string()
}

pub(crate) fn sql_to_dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap_or(Decimal::ZERO)
}

pub(crate) fn opt_dec_to_sql(value: Option<Decimal>) -> Option<String> {
    value.map(|v| v.to_string())
}

pub(crate) fn sql_to_opt_dec(value: Option<String>) -> Option<Decimal> {
    value.and_then(|s| Decimal::from_str(&s).ok())
}

pub(crate) fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub(crate) fn sql_to_ts(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

pub(crate) fn sql_to_opt_ts(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn schema_initialises_in_memory() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(count >= 15);
    }

    #[test]
    fn decimal_roundtrip_preserves_precision() {
        let d = dec!(0.000123456789);
        assert_eq!(sql_to_dec(&dec_to_sql(d)), d);
    }

    #[test]
    fn timestamp_roundtrip() {
        let now = Utc::now();
        let back = sql_to_ts(&ts_to_sql(now));
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
