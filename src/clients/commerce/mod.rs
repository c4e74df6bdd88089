//! Commerce platform clients.
//!
//! Two platform flavors behind one capability trait: the storefront API
//! (token auth, cursor pagination, fulfillment-order handshake) and the
//! webshop REST API (basic auth, offset pagination, status-transition
//! fulfillment). Both project platform payloads into the canonical types at
//! the edge; nothing downstream sees raw platform JSON.

mod storefront;
mod webshop;

pub use storefront::StorefrontClient;
pub use webshop::WebshopClient;

pub(crate) use storefront::{parse_storefront_order, parse_storefront_product};
pub(crate) use webshop::{parse_webshop_order, parse_webshop_product};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SyncError;
use crate::models::{Address, Channel, OrderStatus};

/// A platform order projected into canonical form at the client edge.
#[derive(Debug, Clone)]
pub struct CommerceOrder {
    pub external_id: String,
    pub order_number: Option<String>,
    pub status: OrderStatus,
    pub payment_status: Option<String>,
    pub currency: String,
    pub total: f64,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub items: Vec<CommerceOrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CommerceOrderItem {
    pub external_product_id: Option<String>,
    pub sku: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub line_total: f64,
}

#[derive(Debug, Clone)]
pub struct CommerceProduct {
    pub external_id: String,
    pub sku: Option<String>,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub weight: Option<f64>,
    pub image_url: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct FulfillmentRequest {
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub notify_customer: bool,
}

/// The capability set both platform flavors provide. List methods paginate
/// internally (native protocol per platform, 200 ms between pages) and are
/// restartable from the `since` bound; the caller owns the overlap window.
#[async_trait]
pub trait CommerceApi: Send + Sync {
    async fn list_orders_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceOrder>, SyncError>;

    async fn get_order(&self, external_id: &str) -> Result<Option<CommerceOrder>, SyncError>;

    async fn list_products_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceProduct>, SyncError>;

    async fn get_product(&self, external_id: &str) -> Result<Option<CommerceProduct>, SyncError>;

    /// Idempotent: pushing the status an order already has is a no-op on the
    /// platform side.
    async fn update_order_status(
        &self,
        external_id: &str,
        status: OrderStatus,
    ) -> Result<(), SyncError>;

    /// Make the shipment visible to the customer. Returns the platform-side
    /// fulfillment id when the platform models one.
    async fn create_fulfillment(
        &self,
        external_order_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<Option<String>, SyncError>;

    async fn update_tracking(
        &self,
        fulfillment_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<(), SyncError>;

    async fn cancel_order(
        &self,
        external_id: &str,
        reason: &str,
        restock: bool,
    ) -> Result<(), SyncError>;

    async fn apply_hold(&self, external_id: &str) -> Result<(), SyncError>;
}

/// Builds a client for one channel from its decrypted credentials.
pub trait CommerceFactory: Send + Sync {
    fn client_for(&self, channel: &Channel) -> Result<Arc<dyn CommerceApi>, SyncError>;
}

pub(crate) const PAGE_SIZE: usize = 50;
pub(crate) const PAGE_DELAY_MS: u64 = 200;

/// Platform money fields arrive as strings about as often as numbers.
pub(crate) fn money(value: &serde_json::Value) -> f64 {
    match value {
        serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
        serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn money_parses_strings_and_numbers() {
        assert_eq!(money(&json!("19.99")), 19.99);
        assert_eq!(money(&json!(5)), 5.0);
        assert_eq!(money(&json!(5.25)), 5.25);
        assert_eq!(money(&json!(null)), 0.0);
        assert_eq!(money(&json!("not-a-price")), 0.0);
    }
}
