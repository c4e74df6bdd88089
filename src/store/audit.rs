//! Audit trail: per-order sync logs, per-tenant cron snapshots, tenant
//! notifications.

use anyhow::Result;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::{dt, ts, Database};
use crate::models::{CronJobStatus, Notification, OrderSyncLog, SyncOrigin};

impl Database {
    pub fn append_sync_log(&self, log: &OrderSyncLog) -> Result<()> {
        self.conn().execute(
            "INSERT INTO order_sync_logs (id, order_id, action, origin, target_platform,
                                          success, error_message, external_id, changed_fields,
                                          previous_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                log.id,
                log.order_id,
                log.action,
                log.origin.as_str(),
                log.target_platform,
                log.success,
                log.error_message,
                log.external_id,
                serde_json::to_string(&log.changed_fields)?,
                log.previous_state,
                ts(log.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_sync_logs(&self, order_id: &str) -> Result<Vec<OrderSyncLog>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, order_id, action, origin, target_platform, success, error_message,
                    external_id, changed_fields, previous_state, created_at
             FROM order_sync_logs WHERE order_id = ?1 ORDER BY created_at, id",
        )?;
        let rows = stmt
            .query_map(params![order_id], sync_log_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Last run wins; one row per `(client_id, job_name)`.
    pub fn upsert_cron_status(&self, status: &CronJobStatus) -> Result<()> {
        self.conn().execute(
            "INSERT INTO cron_job_status (client_id, job_name, last_run_at, success,
                                          duration_ms, details, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(client_id, job_name) DO UPDATE SET
                 last_run_at = excluded.last_run_at,
                 success = excluded.success,
                 duration_ms = excluded.duration_ms,
                 details = excluded.details,
                 error = excluded.error",
            params![
                status.client_id,
                status.job_name,
                ts(status.last_run_at),
                status.success,
                status.duration_ms,
                status.details.to_string(),
                status.error,
            ],
        )?;
        Ok(())
    }

    pub fn get_cron_status(&self, client_id: &str, job_name: &str) -> Result<Option<CronJobStatus>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT client_id, job_name, last_run_at, success, duration_ms, details, error
             FROM cron_job_status WHERE client_id = ?1 AND job_name = ?2",
        )?;
        let row = stmt
            .query_row(params![client_id, job_name], |row| {
                let details: String = row.get(5)?;
                Ok(CronJobStatus {
                    client_id: row.get(0)?,
                    job_name: row.get(1)?,
                    last_run_at: dt(row.get(2)?),
                    success: row.get(3)?,
                    duration_ms: row.get(4)?,
                    details: serde_json::from_str(&details)
                        .unwrap_or(serde_json::Value::Null),
                    error: row.get(6)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    pub fn add_notification(&self, client_id: &str, kind: &str, message: &str) -> Result<()> {
        self.conn().execute(
            "INSERT INTO notifications (id, client_id, kind, message, read, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                Uuid::new_v4().to_string(),
                client_id,
                kind,
                message,
                ts(Utc::now())
            ],
        )?;
        Ok(())
    }

    pub fn list_unread_notifications(&self, client_id: &str) -> Result<Vec<Notification>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, kind, message, read, created_at
             FROM notifications WHERE client_id = ?1 AND read = 0 ORDER BY created_at",
        )?;
        let rows = stmt
            .query_map(params![client_id], |row| {
                Ok(Notification {
                    id: row.get(0)?,
                    client_id: row.get(1)?,
                    kind: row.get(2)?,
                    message: row.get(3)?,
                    read: row.get(4)?,
                    created_at: dt(row.get(5)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn sync_log_from_row(row: &Row<'_>) -> rusqlite::Result<OrderSyncLog> {
    let origin: String = row.get(3)?;
    let changed_fields: String = row.get(8)?;
    Ok(OrderSyncLog {
        id: row.get(0)?,
        order_id: row.get(1)?,
        action: row.get(2)?,
        origin: SyncOrigin::parse(&origin).unwrap_or(SyncOrigin::Internal),
        target_platform: row.get(4)?,
        success: row.get(5)?,
        error_message: row.get(6)?,
        external_id: row.get(7)?,
        changed_fields: serde_json::from_str(&changed_fields).unwrap_or_default(),
        previous_state: row.get(9)?,
        created_at: dt(row.get(10)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    #[test]
    fn sync_log_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let log = OrderSyncLog {
            id: Uuid::new_v4().to_string(),
            order_id: "order-1".into(),
            action: "create".into(),
            origin: SyncOrigin::Internal,
            target_platform: "ffn".into(),
            success: true,
            error_message: None,
            external_id: Some("OB-1".into()),
            changed_fields: vec!["ffn_outbound_id".into(), "sync_status".into()],
            previous_state: Some("PENDING".into()),
            created_at: Utc::now(),
        };
        db.append_sync_log(&log).unwrap();

        let logs = db.list_sync_logs("order-1").unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "create");
        assert_eq!(logs[0].changed_fields.len(), 2);
    }

    #[test]
    fn cron_status_last_run_wins() {
        let db = Database::open_in_memory().unwrap();
        let mut status = CronJobStatus {
            client_id: "tenant-1".into(),
            job_name: "sync-inc".into(),
            last_run_at: Utc::now(),
            success: false,
            duration_ms: 1200,
            details: json!({"orders": 0}),
            error: Some("boom".into()),
        };
        db.upsert_cron_status(&status).unwrap();

        status.success = true;
        status.error = None;
        status.details = json!({"orders": 7});
        db.upsert_cron_status(&status).unwrap();

        let loaded = db.get_cron_status("tenant-1", "sync-inc").unwrap().unwrap();
        assert!(loaded.success);
        assert!(loaded.error.is_none());
        assert_eq!(loaded.details["orders"], 7);
    }

    #[test]
    fn notifications() {
        let db = Database::open_in_memory().unwrap();
        db.add_notification("tenant-1", "token_revoked", "FFN refresh token was revoked")
            .unwrap();
        let unread = db.list_unread_notifications("tenant-1").unwrap();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].kind, "token_revoked");
    }
}
