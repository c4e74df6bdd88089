//! Product persistence. Products are tenant-owned and keyed by merchant SKU;
//! channels attach through `product_channels` rows carrying the platform-side
//! product id.

use anyhow::{Context, Result};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::Database;
use crate::models::{Product, SyncStatus};

impl Database {
    /// Upsert by `(client_id, merchant_sku)`. Keeps FFN linkage and stock
    /// counters on update; those belong to the warehouse flow, not the
    /// commerce payload.
    pub fn upsert_product(&self, product: &Product) -> Result<Product> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO products (id, client_id, merchant_sku, name, description, price,
                                   weight, stock_available, stock_reserved, ffn_product_id,
                                   sync_status, image_url, is_bundle)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(client_id, merchant_sku) DO UPDATE SET
                 name = excluded.name,
                 description = excluded.description,
                 price = excluded.price,
                 weight = excluded.weight,
                 image_url = excluded.image_url,
                 is_bundle = excluded.is_bundle",
            params![
                product.id,
                product.client_id,
                product.merchant_sku,
                product.name,
                product.description,
                product.price,
                product.weight,
                product.stock_available,
                product.stock_reserved,
                product.ffn_product_id,
                product.sync_status.as_str(),
                product.image_url,
                product.is_bundle,
            ],
        )?;

        let stored = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {PRODUCT_COLUMNS} FROM products WHERE client_id = ?1 AND merchant_sku = ?2"
            ))?;
            stmt.query_row(
                params![product.client_id, product.merchant_sku],
                product_from_row,
            )?
        };

        tx.commit().context("commit product upsert")?;
        Ok(stored)
    }

    pub fn get_product(&self, id: &str) -> Result<Option<Product>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {PRODUCT_COLUMNS} FROM products WHERE id = ?1"))?;
        Ok(stmt.query_row(params![id], product_from_row).optional()?)
    }

    pub fn get_product_by_sku(&self, client_id: &str, merchant_sku: &str) -> Result<Option<Product>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE client_id = ?1 AND merchant_sku = ?2"
        ))?;
        Ok(stmt
            .query_row(params![client_id, merchant_sku], product_from_row)
            .optional()?)
    }

    pub fn link_product_channel(
        &self,
        product_id: &str,
        channel_id: &str,
        external_product_id: &str,
    ) -> Result<()> {
        self.conn().execute(
            "INSERT INTO product_channels (product_id, channel_id, external_product_id)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(product_id, channel_id) DO UPDATE SET
                 external_product_id = excluded.external_product_id",
            params![product_id, channel_id, external_product_id],
        )?;
        Ok(())
    }

    pub fn find_product_by_channel_external_id(
        &self,
        channel_id: &str,
        external_product_id: &str,
    ) -> Result<Option<Product>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM products p
             JOIN product_channels pc ON pc.product_id = p.id
             WHERE pc.channel_id = ?1 AND pc.external_product_id = ?2",
            PRODUCT_COLUMNS_QUALIFIED
        ))?;
        Ok(stmt
            .query_row(params![channel_id, external_product_id], product_from_row)
            .optional()?)
    }

    /// Drop one channel link. When it was the last link the product itself is
    /// removed. Returns whether the product was deleted.
    pub fn unlink_product_channel(&self, product_id: &str, channel_id: &str) -> Result<bool> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            "DELETE FROM product_channels WHERE product_id = ?1 AND channel_id = ?2",
            params![product_id, channel_id],
        )?;

        let remaining: i64 = tx.query_row(
            "SELECT COUNT(*) FROM product_channels WHERE product_id = ?1",
            params![product_id],
            |row| row.get(0),
        )?;

        let deleted = if remaining == 0 {
            tx.execute("DELETE FROM products WHERE id = ?1", params![product_id])?;
            true
        } else {
            false
        };

        tx.commit()?;
        Ok(deleted)
    }

    pub fn set_product_ffn_link(
        &self,
        product_id: &str,
        ffn_product_id: &str,
        sync_status: SyncStatus,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE products SET ffn_product_id = ?2, sync_status = ?3 WHERE id = ?1",
            params![product_id, ffn_product_id, sync_status.as_str()],
        )?;
        Ok(())
    }

    pub fn set_product_sync_status(&self, product_id: &str, sync_status: SyncStatus) -> Result<()> {
        self.conn().execute(
            "UPDATE products SET sync_status = ?2 WHERE id = ?1",
            params![product_id, sync_status.as_str()],
        )?;
        Ok(())
    }

    /// Stock reconciliation write path (FFN is authoritative for stock).
    pub fn update_product_stock(
        &self,
        client_id: &str,
        merchant_sku: &str,
        available: i64,
        reserved: i64,
    ) -> Result<bool> {
        let changed = self.conn().execute(
            "UPDATE products SET stock_available = ?3, stock_reserved = ?4
             WHERE client_id = ?1 AND merchant_sku = ?2",
            params![client_id, merchant_sku, available, reserved],
        )?;
        Ok(changed > 0)
    }

    pub fn list_products(&self, client_id: &str) -> Result<Vec<Product>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {PRODUCT_COLUMNS} FROM products WHERE client_id = ?1 ORDER BY merchant_sku"
        ))?;
        let rows = stmt
            .query_map(params![client_id], product_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

const PRODUCT_COLUMNS: &str = "id, client_id, merchant_sku, name, description, price, weight, \
     stock_available, stock_reserved, ffn_product_id, sync_status, image_url, is_bundle";

const PRODUCT_COLUMNS_QUALIFIED: &str =
    "p.id, p.client_id, p.merchant_sku, p.name, p.description, p.price, p.weight, \
     p.stock_available, p.stock_reserved, p.ffn_product_id, p.sync_status, p.image_url, p.is_bundle";

fn product_from_row(row: &Row<'_>) -> rusqlite::Result<Product> {
    let sync_status: String = row.get(10)?;
    Ok(Product {
        id: row.get(0)?,
        client_id: row.get(1)?,
        merchant_sku: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        price: row.get(5)?,
        weight: row.get(6)?,
        stock_available: row.get(7)?,
        stock_reserved: row.get(8)?,
        ffn_product_id: row.get(9)?,
        sync_status: SyncStatus::parse(&sync_status).unwrap_or(SyncStatus::Pending),
        image_url: row.get(11)?,
        is_bundle: row.get(12)?,
    })
}

pub(crate) fn new_product(client_id: &str, merchant_sku: &str, name: &str, price: f64) -> Product {
    Product {
        id: Uuid::new_v4().to_string(),
        client_id: client_id.to_string(),
        merchant_sku: merchant_sku.to_string(),
        name: name.to_string(),
        description: None,
        price,
        weight: None,
        stock_available: 0,
        stock_reserved: 0,
        ffn_product_id: None,
        sync_status: SyncStatus::Pending,
        image_url: None,
        is_bundle: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;
    use crate::store::tests::test_channel;

    #[test]
    fn upsert_preserves_ffn_link_and_stock() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();

        let first = new_product(&tenant.id, "ABC", "Widget", 19.99);
        let stored = db.upsert_product(&first).unwrap();
        db.set_product_ffn_link(&stored.id, "JF-123", SyncStatus::Synced)
            .unwrap();
        db.update_product_stock(&tenant.id, "ABC", 42, 3).unwrap();

        // Same SKU again with fresher commerce data.
        let mut second = new_product(&tenant.id, "ABC", "Widget v2", 24.99);
        second.is_bundle = true;
        let after = db.upsert_product(&second).unwrap();

        assert_eq!(after.id, stored.id);
        assert_eq!(after.name, "Widget v2");
        assert_eq!(after.price, 24.99);
        assert!(after.is_bundle);
        assert_eq!(after.ffn_product_id.as_deref(), Some("JF-123"));
        assert_eq!(after.stock_available, 42);
        assert_eq!(after.stock_reserved, 3);
    }

    #[test]
    fn channel_links_and_last_link_deletion() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        let a = test_channel(&tenant.id, ChannelType::Webshop);
        let b = test_channel(&tenant.id, ChannelType::Storefront);
        db.insert_channel(&a).unwrap();
        db.insert_channel(&b).unwrap();

        let product = db
            .upsert_product(&new_product(&tenant.id, "XYZ", "Gadget", 5.0))
            .unwrap();
        db.link_product_channel(&product.id, &a.id, "1001").unwrap();
        db.link_product_channel(&product.id, &b.id, "2002").unwrap();

        let found = db
            .find_product_by_channel_external_id(&a.id, "1001")
            .unwrap()
            .unwrap();
        assert_eq!(found.id, product.id);

        assert!(!db.unlink_product_channel(&product.id, &a.id).unwrap());
        assert!(db.get_product(&product.id).unwrap().is_some());

        assert!(db.unlink_product_channel(&product.id, &b.id).unwrap());
        assert!(db.get_product(&product.id).unwrap().is_none());
    }
}
