// =============================================================================
// Store: audit trail — activity events, execution logs, actions
// =============================================================================

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use crate::bus::ActivityEvent;

use super::{ts_to_sql, Store};

impl Store {
    pub async fn insert_activity_event(&self, event: &ActivityEvent) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO activity_events (id, activity_type, component, level, message, details, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                event.activity_type,
                event.component,
                event.level,
                event.message,
                event.details.to_string(),
                ts_to_sql(event.timestamp),
            ],
        )
        .context("insert activity event")?;
        Ok(())
    }

    pub async fn list_activity_events(&self, limit: usize) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT activity_type, component, level, message, details, ts
                 FROM activity_events ORDER BY ts DESC LIMIT ?1",
            )
            .context("prepare activity query")?;

        let rows = stmt
            .query_map(params![limit as i64], |row| {
                let details: String = row.get(4)?;
                Ok(serde_json::json!({
                    "activity_type": row.get::<_, String>(0)?,
                    "component": row.get::<_, String>(1)?,
                    "level": row.get::<_, String>(2)?,
                    "message": row.get::<_, String>(3)?,
                    "details": serde_json::from_str::<serde_json::Value>(&details)
                        .unwrap_or(serde_json::Value::Null),
                    "ts": row.get::<_, String>(5)?,
                }))
            })
            .context("query activity events")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map activity row")?);
        }
        Ok(out)
    }

    /// Append one phase of an execution attempt to the per-opportunity log.
    pub async fn insert_execution_log(
        &self,
        opportunity_id: &str,
        phase: &str,
        detail: serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO execution_logs (opportunity_id, phase, detail, ts)
             VALUES (?1, ?2, ?3, ?4)",
            params![opportunity_id, phase, detail.to_string(), ts_to_sql(Utc::now())],
        )
        .context("insert execution log")?;
        Ok(())
    }

    pub async fn list_execution_logs(&self, opportunity_id: &str) -> Result<Vec<serde_json::Value>> {
        let conn = self.lock().await;
        let mut stmt = conn
            .prepare_cached(
                "SELECT phase, detail, ts FROM execution_logs
                 WHERE opportunity_id = ?1 ORDER BY id",
            )
            .context("prepare execution log query")?;

        let rows = stmt
            .query_map(params![opportunity_id], |row| {
                let detail: String = row.get(1)?;
                Ok(serde_json::json!({
                    "phase": row.get::<_, String>(0)?,
                    "detail": serde_json::from_str::<serde_json::Value>(&detail)
                        .unwrap_or(serde_json::Value::Null),
                    "ts": row.get::<_, String>(2)?,
                }))
            })
            .context("query execution logs")?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("map execution log row")?);
        }
        Ok(out)
    }

    pub async fn insert_audit_action(
        &self,
        actor: &str,
        action: &str,
        entity_type: &str,
        entity_id: &str,
        detail: serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock().await;
        conn.execute(
            "INSERT INTO audit_actions (id, actor, action, entity_type, entity_id, detail, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                Uuid::new_v4().to_string(),
                actor,
                action,
                entity_type,
                entity_id,
                detail.to_string(),
                ts_to_sql(Utc::now()),
            ],
        )
        .context("insert audit action")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn execution_logs_preserve_order() {
        let store = Store::open_in_memory().unwrap();
        for phase in [
            "execution_requested",
            "placing_primary_order",
            "primary_order_result",
            "placing_hedge_order",
            "hedge_order_result",
            "rollback_started",
            "rollback_result",
        ] {
            store
                .insert_execution_log("opp-1", phase, serde_json::json!({}))
                .await
                .unwrap();
        }

        let logs = store.list_execution_logs("opp-1").await.unwrap();
        assert_eq!(logs.len(), 7);
        assert_eq!(logs[0]["phase"], "execution_requested");
        assert_eq!(logs[5]["phase"], "rollback_started");
        assert_eq!(logs[6]["phase"], "rollback_result");
    }

    #[tokio::test]
    async fn activity_events_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let event = ActivityEvent::info(
            "capital-allocator",
            "auto_unwind",
            "closing weakest position DOGE",
            serde_json::json!({"symbol": "DOGE"}),
        );
        store.insert_activity_event(&event).await.unwrap();

        let rows = store.list_activity_events(10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["activity_type"], "auto_unwind");
        assert_eq!(rows[0]["details"]["symbol"], "DOGE");
    }
}
