//! Canonical relational store.
//!
//! One SQLite file is the sole source of truth for the order lifecycle. The
//! webhook processor, the lifecycle engine, and the scheduler are the only
//! writers; every multi-row mutation runs inside a single transaction on the
//! shared connection.

pub(crate) mod audit;
pub(crate) mod orders;
pub(crate) mod products;
pub(crate) mod returns;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::models::{Channel, ChannelType, FfnConfig, FfnEnvironment, Tenant};

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path).context("open canonical store")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.pragma_update(None, "foreign_keys", "ON").ok();

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::open(":memory:")
    }

    pub(crate) fn conn(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn();
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS clients (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                channel_type TEXT NOT NULL,
                base_url TEXT NOT NULL,
                api_credentials TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                sync_enabled INTEGER NOT NULL DEFAULT 1,
                last_order_poll_at INTEGER,
                last_product_poll_at INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_channels_client ON channels(client_id);

            CREATE TABLE IF NOT EXISTS jtl_configs (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL UNIQUE REFERENCES clients(id),
                oauth_client_id TEXT NOT NULL,
                oauth_client_secret TEXT NOT NULL,
                access_token TEXT,
                refresh_token TEXT,
                token_expires_at INTEGER,
                environment TEXT NOT NULL DEFAULT 'sandbox',
                fulfiller_id TEXT,
                warehouse_id TEXT,
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS products (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                merchant_sku TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT,
                price REAL NOT NULL DEFAULT 0,
                weight REAL,
                stock_available INTEGER NOT NULL DEFAULT 0,
                stock_reserved INTEGER NOT NULL DEFAULT 0,
                ffn_product_id TEXT,
                sync_status TEXT NOT NULL DEFAULT 'PENDING',
                image_url TEXT,
                is_bundle INTEGER NOT NULL DEFAULT 0,
                UNIQUE(client_id, merchant_sku)
            );

            CREATE TABLE IF NOT EXISTS product_channels (
                product_id TEXT NOT NULL REFERENCES products(id),
                channel_id TEXT NOT NULL REFERENCES channels(id),
                external_product_id TEXT NOT NULL,
                UNIQUE(product_id, channel_id)
            );
            CREATE INDEX IF NOT EXISTS idx_product_channels_external
                ON product_channels(channel_id, external_product_id);

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                channel_id TEXT,
                order_number TEXT,
                external_order_id TEXT NOT NULL,
                order_origin TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                fulfillment_state TEXT NOT NULL DEFAULT 'PENDING',
                payment_status TEXT,
                is_on_hold INTEGER NOT NULL DEFAULT 0,
                hold_reason TEXT,
                hold_placed_at INTEGER,
                hold_placed_by TEXT,
                hold_released_at INTEGER,
                hold_released_by TEXT,
                payment_hold_override INTEGER NOT NULL DEFAULT 0,
                shipping_address TEXT NOT NULL,
                billing_address TEXT,
                total REAL NOT NULL DEFAULT 0,
                currency TEXT NOT NULL DEFAULT 'EUR',
                ffn_outbound_id TEXT,
                last_ffn_sync_at INTEGER,
                ffn_sync_error TEXT,
                commerce_sync_error TEXT,
                last_synced_to_commerce INTEGER,
                sync_status TEXT NOT NULL DEFAULT 'PENDING',
                shipped_at INTEGER,
                delivered_at INTEGER,
                tracking_number TEXT,
                carrier TEXT,
                tracking_url TEXT,
                tracking_packages TEXT,
                priority_level INTEGER NOT NULL DEFAULT 0,
                is_cancelled INTEGER NOT NULL DEFAULT 0,
                cancelled_at INTEGER,
                cancelled_by TEXT,
                cancellation_reason TEXT,
                is_replacement INTEGER NOT NULL DEFAULT 0,
                last_operational_update_by TEXT,
                last_operational_update_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(client_id, external_order_id)
            );
            CREATE INDEX IF NOT EXISTS idx_orders_ffn_outbound ON orders(ffn_outbound_id);
            CREATE INDEX IF NOT EXISTS idx_orders_client_created ON orders(client_id, created_at);

            CREATE TABLE IF NOT EXISTS order_items (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id),
                product_id TEXT,
                sku TEXT NOT NULL,
                product_name TEXT NOT NULL,
                quantity INTEGER NOT NULL,
                unit_price REAL NOT NULL,
                line_total REAL NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

            CREATE TABLE IF NOT EXISTS returns (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL REFERENCES clients(id),
                order_id TEXT NOT NULL REFERENCES orders(id),
                external_refund_id TEXT,
                status TEXT NOT NULL DEFAULT 'RECEIVED',
                reason TEXT,
                ffn_return_id TEXT,
                created_at INTEGER NOT NULL,
                UNIQUE(client_id, external_refund_id)
            );

            CREATE TABLE IF NOT EXISTS return_items (
                id TEXT PRIMARY KEY,
                return_id TEXT NOT NULL REFERENCES returns(id),
                sku TEXT NOT NULL,
                quantity INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS order_sync_logs (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                action TEXT NOT NULL,
                origin TEXT NOT NULL,
                target_platform TEXT NOT NULL,
                success INTEGER NOT NULL,
                error_message TEXT,
                external_id TEXT,
                changed_fields TEXT NOT NULL DEFAULT '[]',
                previous_state TEXT,
                created_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_order ON order_sync_logs(order_id, created_at);

            CREATE TABLE IF NOT EXISTS cron_job_status (
                client_id TEXT NOT NULL,
                job_name TEXT NOT NULL,
                last_run_at INTEGER NOT NULL,
                success INTEGER NOT NULL,
                duration_ms INTEGER NOT NULL,
                details TEXT NOT NULL DEFAULT '{}',
                error TEXT,
                UNIQUE(client_id, job_name)
            );

            CREATE TABLE IF NOT EXISTS notifications (
                id TEXT PRIMARY KEY,
                client_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                message TEXT NOT NULL,
                read INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS sync_cursors (
                client_id TEXT NOT NULL,
                cursor_name TEXT NOT NULL,
                value INTEGER NOT NULL,
                UNIQUE(client_id, cursor_name)
            );
            ",
        )
        .context("init canonical schema")?;
        Ok(())
    }

    // ---- tenants ----

    pub fn insert_tenant(&self, name: &str) -> Result<Tenant> {
        let tenant = Tenant {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        self.conn().execute(
            "INSERT INTO clients (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![tenant.id, tenant.name, ts(tenant.created_at)],
        )?;
        Ok(tenant)
    }

    pub fn list_tenants(&self) -> Result<Vec<Tenant>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT id, name, created_at FROM clients ORDER BY created_at")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(Tenant {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_at: dt(row.get(2)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ---- channels ----

    pub fn insert_channel(&self, channel: &Channel) -> Result<()> {
        self.conn().execute(
            "INSERT INTO channels (id, client_id, channel_type, base_url, api_credentials,
                                   is_active, sync_enabled, last_order_poll_at, last_product_poll_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                channel.id,
                channel.client_id,
                channel.channel_type.as_str(),
                channel.base_url,
                channel.api_credentials,
                channel.is_active,
                channel.sync_enabled,
                channel.last_order_poll_at.map(ts),
                channel.last_product_poll_at.map(ts),
            ],
        )?;
        Ok(())
    }

    pub fn get_channel(&self, id: &str) -> Result<Option<Channel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, channel_type, base_url, api_credentials, is_active,
                    sync_enabled, last_order_poll_at, last_product_poll_at
             FROM channels WHERE id = ?1",
        )?;
        let row = stmt.query_row(params![id], channel_from_row).optional()?;
        Ok(row)
    }

    /// Channels eligible for scheduled sync: active, enabled, tenant exists.
    pub fn list_syncable_channels(&self) -> Result<Vec<Channel>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, channel_type, base_url, api_credentials, is_active,
                    sync_enabled, last_order_poll_at, last_product_poll_at
             FROM channels WHERE is_active = 1 AND sync_enabled = 1",
        )?;
        let rows = stmt
            .query_map([], channel_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn set_channel_active(&self, id: &str, active: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE channels SET is_active = ?2 WHERE id = ?1",
            params![id, active],
        )?;
        Ok(())
    }

    pub fn set_channel_order_cursor(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE channels SET last_order_poll_at = ?2 WHERE id = ?1",
            params![id, ts(at)],
        )?;
        Ok(())
    }

    pub fn set_channel_product_cursor(&self, id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "UPDATE channels SET last_product_poll_at = ?2 WHERE id = ?1",
            params![id, ts(at)],
        )?;
        Ok(())
    }

    // ---- FFN configs ----

    pub fn upsert_ffn_config(&self, config: &FfnConfig) -> Result<()> {
        self.conn().execute(
            "INSERT INTO jtl_configs (id, client_id, oauth_client_id, oauth_client_secret,
                                      access_token, refresh_token, token_expires_at,
                                      environment, fulfiller_id, warehouse_id, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(client_id) DO UPDATE SET
                 oauth_client_id = excluded.oauth_client_id,
                 oauth_client_secret = excluded.oauth_client_secret,
                 access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token,
                 token_expires_at = excluded.token_expires_at,
                 environment = excluded.environment,
                 fulfiller_id = excluded.fulfiller_id,
                 warehouse_id = excluded.warehouse_id,
                 is_active = excluded.is_active",
            params![
                config.id,
                config.client_id,
                config.oauth_client_id,
                config.oauth_client_secret,
                config.access_token,
                config.refresh_token,
                config.token_expires_at.map(ts),
                config.environment.as_str(),
                config.fulfiller_id,
                config.warehouse_id,
                config.is_active,
            ],
        )?;
        Ok(())
    }

    pub fn get_ffn_config(&self, client_id: &str) -> Result<Option<FfnConfig>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, oauth_client_id, oauth_client_secret, access_token,
                    refresh_token, token_expires_at, environment, fulfiller_id,
                    warehouse_id, is_active
             FROM jtl_configs WHERE client_id = ?1",
        )?;
        let row = stmt
            .query_row(params![client_id], ffn_config_from_row)
            .optional()?;
        Ok(row)
    }

    pub fn list_active_ffn_configs(&self) -> Result<Vec<FfnConfig>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, client_id, oauth_client_id, oauth_client_secret, access_token,
                    refresh_token, token_expires_at, environment, fulfiller_id,
                    warehouse_id, is_active
             FROM jtl_configs WHERE is_active = 1",
        )?;
        let rows = stmt
            .query_map([], ffn_config_from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Persist rotated OAuth material in one statement; tokens arrive already
    /// encrypted by the vault.
    pub fn update_ffn_tokens(
        &self,
        config_id: &str,
        access_token_enc: &str,
        refresh_token_enc: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn().execute(
            "UPDATE jtl_configs
             SET access_token = ?2,
                 refresh_token = COALESCE(?3, refresh_token),
                 token_expires_at = ?4
             WHERE id = ?1",
            params![config_id, access_token_enc, refresh_token_enc, ts(expires_at)],
        )?;
        Ok(())
    }

    pub fn set_ffn_config_active(&self, client_id: &str, active: bool) -> Result<()> {
        self.conn().execute(
            "UPDATE jtl_configs SET is_active = ?2 WHERE client_id = ?1",
            params![client_id, active],
        )?;
        Ok(())
    }

    // ---- generic sync cursors (FFN polling) ----

    pub fn get_cursor(&self, client_id: &str, name: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn();
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM sync_cursors WHERE client_id = ?1 AND cursor_name = ?2",
                params![client_id, name],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(dt))
    }

    pub fn set_cursor(&self, client_id: &str, name: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn().execute(
            "INSERT INTO sync_cursors (client_id, cursor_name, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(client_id, cursor_name) DO UPDATE SET value = excluded.value",
            params![client_id, name, ts(at)],
        )?;
        Ok(())
    }
}

fn channel_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Channel> {
    let channel_type: String = row.get(2)?;
    Ok(Channel {
        id: row.get(0)?,
        client_id: row.get(1)?,
        channel_type: ChannelType::parse(&channel_type).unwrap_or(ChannelType::Webshop),
        base_url: row.get(3)?,
        api_credentials: row.get(4)?,
        is_active: row.get(5)?,
        sync_enabled: row.get(6)?,
        last_order_poll_at: row.get::<_, Option<i64>>(7)?.map(dt),
        last_product_poll_at: row.get::<_, Option<i64>>(8)?.map(dt),
    })
}

fn ffn_config_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FfnConfig> {
    let environment: String = row.get(7)?;
    Ok(FfnConfig {
        id: row.get(0)?,
        client_id: row.get(1)?,
        oauth_client_id: row.get(2)?,
        oauth_client_secret: row.get(3)?,
        access_token: row.get(4)?,
        refresh_token: row.get(5)?,
        token_expires_at: row.get::<_, Option<i64>>(6)?.map(dt),
        environment: FfnEnvironment::parse(&environment).unwrap_or(FfnEnvironment::Sandbox),
        fulfiller_id: row.get(8)?,
        warehouse_id: row.get(9)?,
        is_active: row.get(10)?,
    })
}

pub(crate) fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp()
}

pub(crate) fn dt(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;

    pub(crate) fn test_channel(client_id: &str, channel_type: ChannelType) -> Channel {
        Channel {
            id: Uuid::new_v4().to_string(),
            client_id: client_id.to_string(),
            channel_type,
            base_url: "https://shop.example".into(),
            api_credentials: "plain-key:plain-secret".into(),
            is_active: true,
            sync_enabled: true,
            last_order_poll_at: None,
            last_product_poll_at: None,
        }
    }

    #[test]
    fn tenant_and_channel_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        let channel = test_channel(&tenant.id, ChannelType::Webshop);
        db.insert_channel(&channel).unwrap();

        let listed = db.list_syncable_channels().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, channel.id);

        db.set_channel_active(&channel.id, false).unwrap();
        assert!(db.list_syncable_channels().unwrap().is_empty());
    }

    #[test]
    fn ffn_config_upsert_and_token_rotation() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        let config = FfnConfig {
            id: Uuid::new_v4().to_string(),
            client_id: tenant.id.clone(),
            oauth_client_id: "client".into(),
            oauth_client_secret: "enc-secret".into(),
            access_token: None,
            refresh_token: Some("enc-refresh".into()),
            token_expires_at: None,
            environment: FfnEnvironment::Sandbox,
            fulfiller_id: Some("F1".into()),
            warehouse_id: Some("W1".into()),
            is_active: true,
        };
        db.upsert_ffn_config(&config).unwrap();

        let expires = Utc::now();
        db.update_ffn_tokens(&config.id, "enc-access", None, expires)
            .unwrap();

        let loaded = db.get_ffn_config(&tenant.id).unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("enc-access"));
        // Absent rotation keeps the previous refresh token.
        assert_eq!(loaded.refresh_token.as_deref(), Some("enc-refresh"));
        assert_eq!(loaded.token_expires_at.map(ts), Some(ts(expires)));

        db.set_ffn_config_active(&tenant.id, false).unwrap();
        assert!(db.list_active_ffn_configs().unwrap().is_empty());
    }

    #[test]
    fn cursors_upsert() {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        assert!(db.get_cursor(&tenant.id, "jtl-poll").unwrap().is_none());

        let now = Utc::now();
        db.set_cursor(&tenant.id, "jtl-poll", now).unwrap();
        let got = db.get_cursor(&tenant.id, "jtl-poll").unwrap().unwrap();
        assert_eq!(ts(got), ts(now));
    }
}
