//! Return persistence. Refund webhooks create returns; the FFN sync job
//! mirrors them into the fulfillment network.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};

use super::{dt, ts, Database};
use crate::models::{ReturnItem, ReturnRecord, ReturnStatus};

const RETURN_COLUMNS: &str =
    "id, client_id, order_id, external_refund_id, status, reason, ffn_return_id, created_at";

impl Database {
    /// Insert a return with its items. Idempotent by
    /// `(client_id, external_refund_id)`; redelivered refund webhooks return
    /// `false` untouched.
    pub fn insert_return(&self, ret: &ReturnRecord) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO returns (id, client_id, order_id, external_refund_id,
                                            status, reason, ffn_return_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ret.id,
                ret.client_id,
                ret.order_id,
                ret.external_refund_id,
                ret.status.as_str(),
                ret.reason,
                ret.ffn_return_id,
                ts(ret.created_at),
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        for item in &ret.items {
            tx.execute(
                "INSERT INTO return_items (id, return_id, sku, quantity) VALUES (?1, ?2, ?3, ?4)",
                params![item.id, ret.id, item.sku, item.quantity],
            )?;
        }

        tx.commit().context("commit return insert")?;
        Ok(true)
    }

    pub fn get_return(&self, id: &str) -> Result<Option<ReturnRecord>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {RETURN_COLUMNS} FROM returns WHERE id = ?1"))?;
        let ret = stmt.query_row(params![id], return_from_row).optional()?;
        drop(stmt);
        match ret {
            Some(mut ret) => {
                ret.items = load_return_items(&conn, &ret.id)?;
                Ok(Some(ret))
            }
            None => Ok(None),
        }
    }

    pub fn set_return_ffn_link(&self, return_id: &str, ffn_return_id: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE returns SET ffn_return_id = ?2 WHERE id = ?1",
            params![return_id, ffn_return_id],
        )?;
        Ok(())
    }

    pub fn set_return_status(&self, return_id: &str, status: ReturnStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE returns SET status = ?2 WHERE id = ?1",
            params![return_id, status.as_str()],
        )?;
        Ok(())
    }

    pub fn get_return_by_ffn_id(&self, ffn_return_id: &str) -> Result<Option<ReturnRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {RETURN_COLUMNS} FROM returns WHERE ffn_return_id = ?1"
        ))?;
        let ret = stmt
            .query_row(params![ffn_return_id], return_from_row)
            .optional()?;
        drop(stmt);
        match ret {
            Some(mut ret) => {
                ret.items = load_return_items(&conn, &ret.id)?;
                Ok(Some(ret))
            }
            None => Ok(None),
        }
    }
}

fn load_return_items(conn: &rusqlite::Connection, return_id: &str) -> Result<Vec<ReturnItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, return_id, sku, quantity FROM return_items WHERE return_id = ?1 ORDER BY id",
    )?;
    let items = stmt
        .query_map(params![return_id], |row| {
            Ok(ReturnItem {
                id: row.get(0)?,
                return_id: row.get(1)?,
                sku: row.get(2)?,
                quantity: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

fn return_from_row(row: &Row<'_>) -> rusqlite::Result<ReturnRecord> {
    let status: String = row.get(4)?;
    Ok(ReturnRecord {
        id: row.get(0)?,
        client_id: row.get(1)?,
        order_id: row.get(2)?,
        external_refund_id: row.get(3)?,
        status: ReturnStatus::parse(&status).unwrap_or(ReturnStatus::Received),
        reason: row.get(5)?,
        ffn_return_id: row.get(6)?,
        items: Vec::new(),
        created_at: dt(row.get(7)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::orders::tests::test_order;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn return_insert_is_idempotent_by_refund_id() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        let order = test_order(&tenant.id, "77");
        db.insert_order(&order).unwrap();

        let ret_id = Uuid::new_v4().to_string();
        let ret = ReturnRecord {
            id: ret_id.clone(),
            client_id: tenant.id.clone(),
            order_id: order.id.clone(),
            external_refund_id: Some("refund-1".into()),
            status: ReturnStatus::Received,
            reason: Some("damaged".into()),
            ffn_return_id: None,
            items: vec![ReturnItem {
                id: Uuid::new_v4().to_string(),
                return_id: ret_id.clone(),
                sku: "ABC".into(),
                quantity: 1,
            }],
            created_at: Utc::now(),
        };

        assert!(db.insert_return(&ret).unwrap());
        let mut dup = ret.clone();
        dup.id = Uuid::new_v4().to_string();
        assert!(!db.insert_return(&dup).unwrap());

        let loaded = db.get_return(&ret_id).unwrap().unwrap();
        assert_eq!(loaded.items.len(), 1);

        db.set_return_ffn_link(&ret_id, "RET-9").unwrap();
        db.set_return_status(&ret_id, ReturnStatus::Accepted).unwrap();
        let updated = db.get_return_by_ffn_id("RET-9").unwrap().unwrap();
        assert_eq!(updated.status, ReturnStatus::Accepted);
    }
}
