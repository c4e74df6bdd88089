//! Order persistence. The unique key `(client_id, external_order_id)` makes
//! webhook redelivery and poll/webhook races collapse into no-ops.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{dt, ts, Database};
use crate::models::{
    Address, FulfillmentState, HoldReason, Order, OrderItem, OrderOrigin, OrderStatus, SyncOrigin,
    SyncStatus, TrackingInfo,
};

const ORDER_COLUMNS: &str = "id, client_id, channel_id, order_number, external_order_id, \
     order_origin, status, fulfillment_state, payment_status, is_on_hold, hold_reason, \
     hold_placed_at, hold_placed_by, hold_released_at, hold_released_by, payment_hold_override, \
     shipping_address, billing_address, total, currency, ffn_outbound_id, last_ffn_sync_at, \
     ffn_sync_error, commerce_sync_error, last_synced_to_commerce, sync_status, shipped_at, \
     delivered_at, tracking_number, carrier, tracking_url, tracking_packages, priority_level, \
     is_cancelled, cancelled_at, cancelled_by, cancellation_reason, is_replacement, \
     last_operational_update_by, last_operational_update_at, created_at, updated_at";

impl Database {
    /// Insert an order with its items in one transaction. Returns `false`
    /// without touching anything when the external id is already known.
    pub fn insert_order(&self, order: &Order) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO orders (id, client_id, channel_id, order_number,
                external_order_id, order_origin, status, fulfillment_state, payment_status,
                is_on_hold, hold_reason, hold_placed_at, hold_placed_by, hold_released_at,
                hold_released_by, payment_hold_override, shipping_address, billing_address,
                total, currency, ffn_outbound_id, last_ffn_sync_at, ffn_sync_error,
                commerce_sync_error, last_synced_to_commerce, sync_status, shipped_at,
                delivered_at, tracking_number, carrier, tracking_url, tracking_packages,
                priority_level, is_cancelled, cancelled_at, cancelled_by, cancellation_reason,
                is_replacement, last_operational_update_by, last_operational_update_at,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29, ?30,
                     ?31, ?32, ?33, ?34, ?35, ?36, ?37, ?38, ?39, ?40, ?41, ?42)",
            params![
                order.id,
                order.client_id,
                order.channel_id,
                order.order_number,
                order.external_order_id,
                order.order_origin.as_str(),
                order.status.as_str(),
                order.fulfillment_state.as_str(),
                order.payment_status,
                order.is_on_hold,
                order.hold_reason.map(|r| r.as_str()),
                order.hold_placed_at.map(ts),
                order.hold_placed_by,
                order.hold_released_at.map(ts),
                order.hold_released_by,
                order.payment_hold_override,
                serde_json::to_string(&order.shipping_address)?,
                order
                    .billing_address
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                order.total,
                order.currency,
                order.ffn_outbound_id,
                order.last_ffn_sync_at.map(ts),
                order.ffn_sync_error,
                order.commerce_sync_error,
                order.last_synced_to_commerce.map(ts),
                order.sync_status.as_str(),
                order.shipped_at.map(ts),
                order.delivered_at.map(ts),
                order.tracking_number,
                order.carrier,
                order.tracking_url,
                serde_json::to_string(&order.tracking_packages)?,
                order.priority_level,
                order.is_cancelled,
                order.cancelled_at.map(ts),
                order.cancelled_by,
                order.cancellation_reason,
                order.is_replacement,
                order.last_operational_update_by.map(|o| o.as_str()),
                order.last_operational_update_at.map(ts),
                ts(order.created_at),
                ts(order.updated_at),
            ],
        )?;

        if inserted == 0 {
            return Ok(false);
        }

        for item in &order.items {
            tx.execute(
                "INSERT INTO order_items (id, order_id, product_id, sku, product_name,
                                          quantity, unit_price, line_total)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    item.id,
                    order.id,
                    item.product_id,
                    item.sku,
                    item.product_name,
                    item.quantity,
                    item.unit_price,
                    item.line_total,
                ],
            )?;
        }

        tx.commit().context("commit order insert")?;
        Ok(true)
    }

    pub fn get_order(&self, id: &str) -> Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"))?;
        let order = stmt.query_row(params![id], order_from_row).optional()?;
        drop(stmt);
        match order {
            Some(mut order) => {
                order.items = load_items(&conn, &order.id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    pub fn get_order_by_external(
        &self,
        client_id: &str,
        external_order_id: &str,
    ) -> Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE client_id = ?1 AND external_order_id = ?2"
        ))?;
        let order = stmt
            .query_row(params![client_id, external_order_id], order_from_row)
            .optional()?;
        drop(stmt);
        match order {
            Some(mut order) => {
                order.items = load_items(&conn, &order.id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    pub fn get_order_by_ffn_outbound(&self, outbound_id: &str) -> Result<Option<Order>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE ffn_outbound_id = ?1"
        ))?;
        let order = stmt
            .query_row(params![outbound_id], order_from_row)
            .optional()?;
        drop(stmt);
        match order {
            Some(mut order) => {
                order.items = load_items(&conn, &order.id)?;
                Ok(Some(order))
            }
            None => Ok(None),
        }
    }

    /// Patch the commerce-owned axis of an order. Fields last written by the
    /// warehouse flow or an operator (`last_operational_update_by` set to
    /// INTERNAL/FFN) keep their shipping snapshot; status and payment always
    /// follow the platform.
    pub fn patch_order_from_commerce(
        &self,
        order_id: &str,
        status: OrderStatus,
        payment_status: Option<&str>,
        shipping_address: Option<&Address>,
        total: Option<f64>,
    ) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let guarded: Option<String> = tx
            .query_row(
                "SELECT last_operational_update_by FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let preserve_snapshot = matches!(guarded.as_deref(), Some("INTERNAL") | Some("FFN"));

        tx.execute(
            "UPDATE orders SET status = ?2, payment_status = COALESCE(?3, payment_status),
                               total = COALESCE(?4, total), updated_at = ?5
             WHERE id = ?1",
            params![
                order_id,
                status.as_str(),
                payment_status,
                total,
                ts(Utc::now())
            ],
        )?;

        if !preserve_snapshot {
            if let Some(address) = shipping_address {
                tx.execute(
                    "UPDATE orders SET shipping_address = ?2 WHERE id = ?1",
                    params![order_id, serde_json::to_string(address)?],
                )?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    pub fn set_payment_status(&self, order_id: &str, payment_status: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET payment_status = ?2, updated_at = ?3 WHERE id = ?1",
            params![order_id, payment_status, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn set_order_status(&self, order_id: &str, status: OrderStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![order_id, status.as_str(), ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn place_hold(
        &self,
        order_id: &str,
        reason: HoldReason,
        placed_by: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET is_on_hold = 1, hold_reason = ?2, hold_placed_at = ?3,
                               hold_placed_by = ?4, status = 'ON_HOLD', updated_at = ?3
             WHERE id = ?1",
            params![order_id, reason.as_str(), ts(at), placed_by],
        )?;
        Ok(())
    }

    pub fn release_hold(
        &self,
        order_id: &str,
        released_by: &str,
        at: DateTime<Utc>,
        payment_hold_override: bool,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET is_on_hold = 0, hold_reason = NULL, hold_released_at = ?2,
                               hold_released_by = ?3,
                               payment_hold_override = payment_hold_override OR ?4,
                               status = CASE status WHEN 'ON_HOLD' THEN 'PROCESSING' ELSE status END,
                               updated_at = ?2
             WHERE id = ?1",
            params![order_id, ts(at), released_by, payment_hold_override],
        )?;
        Ok(())
    }

    /// Record a successful outbound creation (or attachment of one that
    /// already existed at the FFN). Creation resets the warehouse axis to
    /// PENDING; attachment leaves it alone.
    pub fn attach_ffn_outbound(
        &self,
        order_id: &str,
        outbound_id: &str,
        at: DateTime<Utc>,
        created: bool,
    ) -> Result<()> {
        if created {
            self.conn().execute(
                "UPDATE orders SET ffn_outbound_id = ?2, last_ffn_sync_at = ?3,
                                   sync_status = 'SYNCED', ffn_sync_error = NULL,
                                   fulfillment_state = 'PENDING', updated_at = ?3
                 WHERE id = ?1",
                params![order_id, outbound_id, ts(at)],
            )?;
        } else {
            self.conn().execute(
                "UPDATE orders SET ffn_outbound_id = ?2, last_ffn_sync_at = ?3,
                                   sync_status = 'SYNCED', ffn_sync_error = NULL, updated_at = ?3
                 WHERE id = ?1",
                params![order_id, outbound_id, ts(at)],
            )?;
        }
        Ok(())
    }

    pub fn set_ffn_sync_error(&self, order_id: &str, message: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET ffn_sync_error = ?2, sync_status = 'ERROR', updated_at = ?3
             WHERE id = ?1",
            params![order_id, message, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Advance the warehouse axis. The caller has already validated the
    /// transition; this records the new state plus writer provenance.
    pub fn set_fulfillment_state(
        &self,
        order_id: &str,
        state: FulfillmentState,
        by: SyncOrigin,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET fulfillment_state = ?2,
                               delivered_at = CASE WHEN ?2 = 'DELIVERED' THEN ?4 ELSE delivered_at END,
                               last_operational_update_by = ?3,
                               last_operational_update_at = ?4,
                               updated_at = ?4
             WHERE id = ?1",
            params![order_id, state.as_str(), by.as_str(), ts(at)],
        )?;
        Ok(())
    }

    pub fn set_tracking(
        &self,
        order_id: &str,
        packages: &[TrackingInfo],
        shipped_at: DateTime<Utc>,
    ) -> Result<()> {
        let first = packages.first();
        self.conn().execute(
            "UPDATE orders SET tracking_number = ?2, carrier = ?3, tracking_url = ?4,
                               tracking_packages = ?5, shipped_at = ?6, updated_at = ?6
             WHERE id = ?1",
            params![
                order_id,
                first.map(|p| p.tracking_number.clone()),
                first.and_then(|p| p.carrier.clone()),
                first.and_then(|p| p.tracking_url.clone()),
                serde_json::to_string(packages)?,
                ts(shipped_at),
            ],
        )?;
        Ok(())
    }

    pub fn mark_cancelled(
        &self,
        order_id: &str,
        cancelled_by: &str,
        reason: Option<&str>,
        at: DateTime<Utc>,
        warehouse_confirmed: bool,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET is_cancelled = 1, status = 'CANCELLED', cancelled_at = ?2,
                               cancelled_by = ?3, cancellation_reason = ?4,
                               fulfillment_state = CASE WHEN ?5 THEN 'CANCELED' ELSE fulfillment_state END,
                               updated_at = ?2
             WHERE id = ?1",
            params![order_id, ts(at), cancelled_by, reason, warehouse_confirmed],
        )?;
        Ok(())
    }

    pub fn set_payment_hold_override(&self, order_id: &str, value: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET payment_hold_override = ?2, updated_at = ?3 WHERE id = ?1",
            params![order_id, value, ts(Utc::now())],
        )?;
        Ok(())
    }

    pub fn set_priority(&self, order_id: &str, priority: i8, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET priority_level = ?2, last_operational_update_by = 'INTERNAL',
                               last_operational_update_at = ?3, updated_at = ?3
             WHERE id = ?1",
            params![order_id, priority, ts(at)],
        )?;
        Ok(())
    }

    /// Operator-side in-flight update of the canonical projection.
    pub fn apply_operational_update(
        &self,
        order_id: &str,
        priority: Option<i8>,
        carrier: Option<&str>,
        shipping_address: Option<&Address>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET priority_level = COALESCE(?2, priority_level),
                               carrier = COALESCE(?3, carrier),
                               shipping_address = COALESCE(?4, shipping_address),
                               last_operational_update_by = 'INTERNAL',
                               last_operational_update_at = ?5,
                               updated_at = ?5
             WHERE id = ?1",
            params![
                order_id,
                priority,
                carrier,
                shipping_address.map(serde_json::to_string).transpose()?,
                ts(at),
            ],
        )?;
        Ok(())
    }

    pub fn set_commerce_fulfilled(&self, order_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET commerce_sync_error = NULL, last_synced_to_commerce = ?2,
                               updated_at = ?2
             WHERE id = ?1",
            params![order_id, ts(at)],
        )?;
        Ok(())
    }

    pub fn set_commerce_sync_error(&self, order_id: &str, message: &str) -> Result<()> {
        self.conn().execute(
            "UPDATE orders SET commerce_sync_error = ?2, sync_status = 'ERROR', updated_at = ?3
             WHERE id = ?1",
            params![order_id, message, ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Shipped orders whose commerce propagation failed and was never
    /// completed. Oldest first so one poisoned order cannot starve the rest.
    pub fn find_commerce_reconcile_candidates(&self, limit: usize) -> Result<Vec<Order>> {
        self.query_orders(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE fulfillment_state = 'SHIPPED'
                   AND commerce_sync_error IS NOT NULL
                   AND last_synced_to_commerce IS NULL
                 ORDER BY created_at ASC, rowid ASC LIMIT {limit}"
            ),
            [],
        )
    }

    /// Shipped orders that were never handed to commerce at all (no error,
    /// no success); the stuck-fulfillment pass re-enqueues them.
    pub fn find_shipped_unpropagated(
        &self,
        client_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Order>> {
        self.query_orders(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE client_id = ?1
                   AND fulfillment_state = 'SHIPPED'
                   AND last_synced_to_commerce IS NULL
                   AND commerce_sync_error IS NULL
                   AND shipped_at IS NOT NULL AND shipped_at <= ?2
                 ORDER BY shipped_at ASC"
            ),
            params![client_id, ts(older_than)],
        )
    }

    /// The paid-but-unsynced sweep predicate: orders that cleared the payment
    /// gate but never reached the FFN, excluding replacements, cancellations
    /// and the hold reasons the sweep must respect.
    pub fn find_paid_unsynced(&self, limit: usize) -> Result<Vec<Order>> {
        let placeholders: Vec<String> = crate::models::SAFE_PAYMENT_STATUSES
            .iter()
            .map(|s| format!("'{s}'"))
            .collect();
        let safe_set = placeholders.join(", ");
        self.query_orders(
            &format!(
                "SELECT {ORDER_COLUMNS} FROM orders
                 WHERE ffn_outbound_id IS NULL
                   AND is_replacement = 0
                   AND is_cancelled = 0
                   AND (
                        (payment_status IN ({safe_set})
                         AND NOT (is_on_hold = 1
                                  AND hold_reason IN ('AWAITING_PAYMENT', 'SHIPPING_METHOD_MISMATCH')))
                        OR payment_hold_override = 1
                   )
                 ORDER BY created_at ASC, rowid ASC LIMIT {limit}"
            ),
            [],
        )
    }

    fn query_orders<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<Order>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let mut orders = stmt
            .query_map(params, order_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);
        for order in &mut orders {
            order.items = load_items(&conn, &order.id)?;
        }
        Ok(orders)
    }
}

fn load_items(conn: &rusqlite::Connection, order_id: &str) -> Result<Vec<OrderItem>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, sku, product_name, quantity, unit_price, line_total
         FROM order_items WHERE order_id = ?1 ORDER BY id",
    )?;
    let items = stmt
        .query_map(params![order_id], |row| {
            Ok(OrderItem {
                id: row.get(0)?,
                order_id: row.get(1)?,
                product_id: row.get(2)?,
                sku: row.get(3)?,
                product_name: row.get(4)?,
                quantity: row.get(5)?,
                unit_price: row.get(6)?,
                line_total: row.get(7)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(items)
}

fn order_from_row(row: &Row<'_>) -> rusqlite::Result<Order> {
    let origin: String = row.get(5)?;
    let status: String = row.get(6)?;
    let state: String = row.get(7)?;
    let hold_reason: Option<String> = row.get(10)?;
    let shipping_address: String = row.get(16)?;
    let billing_address: Option<String> = row.get(17)?;
    let sync_status: String = row.get(25)?;
    let tracking_packages: Option<String> = row.get(31)?;
    let op_by: Option<String> = row.get(38)?;

    Ok(Order {
        id: row.get(0)?,
        client_id: row.get(1)?,
        channel_id: row.get(2)?,
        order_number: row.get(3)?,
        external_order_id: row.get(4)?,
        order_origin: OrderOrigin::parse(&origin).unwrap_or(OrderOrigin::Internal),
        status: OrderStatus::parse(&status).unwrap_or(OrderStatus::Pending),
        fulfillment_state: FulfillmentState::parse(&state).unwrap_or(FulfillmentState::Pending),
        payment_status: row.get(8)?,
        is_on_hold: row.get(9)?,
        hold_reason: hold_reason.as_deref().and_then(HoldReason::parse),
        hold_placed_at: row.get::<_, Option<i64>>(11)?.map(dt),
        hold_placed_by: row.get(12)?,
        hold_released_at: row.get::<_, Option<i64>>(13)?.map(dt),
        hold_released_by: row.get(14)?,
        payment_hold_override: row.get(15)?,
        shipping_address: serde_json::from_str(&shipping_address).unwrap_or_default(),
        billing_address: billing_address
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok()),
        total: row.get(18)?,
        currency: row.get(19)?,
        items: Vec::new(),
        ffn_outbound_id: row.get(20)?,
        last_ffn_sync_at: row.get::<_, Option<i64>>(21)?.map(dt),
        ffn_sync_error: row.get(22)?,
        commerce_sync_error: row.get(23)?,
        last_synced_to_commerce: row.get::<_, Option<i64>>(24)?.map(dt),
        sync_status: SyncStatus::parse(&sync_status).unwrap_or(SyncStatus::Pending),
        shipped_at: row.get::<_, Option<i64>>(26)?.map(dt),
        delivered_at: row.get::<_, Option<i64>>(27)?.map(dt),
        tracking_number: row.get(28)?,
        carrier: row.get(29)?,
        tracking_url: row.get(30)?,
        tracking_packages: tracking_packages
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        priority_level: row.get::<_, i64>(32)? as i8,
        is_cancelled: row.get(33)?,
        cancelled_at: row.get::<_, Option<i64>>(34)?.map(dt),
        cancelled_by: row.get(35)?,
        cancellation_reason: row.get(36)?,
        is_replacement: row.get(37)?,
        last_operational_update_by: op_by.as_deref().and_then(SyncOrigin::parse),
        last_operational_update_at: row.get::<_, Option<i64>>(39)?.map(dt),
        created_at: dt(row.get(40)?),
        updated_at: dt(row.get(41)?),
    })
}
