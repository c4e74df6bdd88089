//! Webshop REST client (WooCommerce-flavored).
//!
//! Basic auth from `consumer_key:consumer_secret`, offset pagination,
//! fulfillment expressed as a transition to `completed` plus tracking meta on
//! the order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use super::{
    money, CommerceApi, CommerceOrder, CommerceOrderItem, CommerceProduct, FulfillmentRequest,
    PAGE_DELAY_MS, PAGE_SIZE,
};
use crate::clients::truncate_body;
use crate::error::SyncError;
use crate::models::{webshop_payment_status, Address, OrderStatus};

pub struct WebshopClient {
    http: Client,
    base_url: String,
    consumer_key: String,
    consumer_secret: String,
}

impl WebshopClient {
    /// `credentials` is the decrypted `consumer_key:consumer_secret` pair.
    pub fn new(base_url: &str, credentials: &str) -> Result<Self, SyncError> {
        let (key, secret) = credentials.split_once(':').ok_or_else(|| {
            SyncError::MissingCredentials(
                "webshop credentials must be consumer_key:consumer_secret".into(),
            )
        })?;

        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("orderbridge/1.0")
            .build()
            .map_err(|e| SyncError::Transient(format!("build webshop http client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            consumer_key: key.to_string(),
            consumer_secret: secret.to_string(),
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, SyncError> {
        let url = format!("{}/wp-json/wc/v3{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, url)
            .basic_auth(&self.consumer_key, Some(&self.consumer_secret));
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("webshop resource {path}")));
        }
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommerceApi {
                status: status.as_u16(),
                body: truncate_body(&text, 500),
            });
        }
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Validation(format!("malformed webshop response: {e}")))
    }

    async fn list_paged(
        &self,
        path: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, SyncError> {
        let mut all = Vec::new();
        let mut page = 1u32;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("per_page", PAGE_SIZE.to_string()),
                ("page", page.to_string()),
                ("orderby", "date".to_string()),
                ("order", "asc".to_string()),
            ];
            if let Some(since) = since {
                query.push(("modified_after", since.to_rfc3339()));
            }

            let value = self.call(Method::GET, path, &query, None).await?;
            let items = match value {
                Value::Array(items) => items,
                _ => Vec::new(),
            };
            let count = items.len();
            all.extend(items);
            if count < PAGE_SIZE {
                break;
            }
            page += 1;
            tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
        }
        Ok(all)
    }
}

pub(crate) fn parse_webshop_order(value: &Value) -> Result<CommerceOrder, SyncError> {
    let external_id = value
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| SyncError::Validation("webshop order without id".into()))?;

    let status_token = value
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("pending");

    let items = value
        .get("line_items")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_webshop_item).collect())
        .unwrap_or_default();

    Ok(CommerceOrder {
        external_id,
        order_number: value
            .get("number")
            .and_then(Value::as_str)
            .map(String::from),
        status: OrderStatus::from_webshop(status_token),
        payment_status: Some(webshop_payment_status(status_token).to_string()),
        currency: value
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("EUR")
            .to_string(),
        total: value.get("total").map(money).unwrap_or(0.0),
        shipping_address: parse_webshop_address(value.get("shipping"), value.get("billing")),
        billing_address: value.get("billing").map(|b| parse_webshop_address(Some(b), None)),
        items,
        created_at: parse_date(value.get("date_created_gmt")),
        updated_at: parse_date(value.get("date_modified_gmt")),
    })
}

fn parse_webshop_item(item: &Value) -> CommerceOrderItem {
    let quantity = item.get("quantity").and_then(Value::as_i64).unwrap_or(1);
    let line_total = item.get("total").map(money).unwrap_or(0.0);
    let unit_price = item
        .get("price")
        .map(money)
        .filter(|p| *p > 0.0)
        .unwrap_or(if quantity > 0 {
            line_total / quantity as f64
        } else {
            0.0
        });
    CommerceOrderItem {
        external_product_id: item
            .get("product_id")
            .and_then(Value::as_i64)
            .map(|id| id.to_string()),
        sku: item
            .get("sku")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        name: item
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string(),
        quantity,
        unit_price,
        line_total,
    }
}

/// The shipping block is frequently empty on digital-ish orders; fall back
/// to billing for the contact fields.
fn parse_webshop_address(shipping: Option<&Value>, billing: Option<&Value>) -> Address {
    let empty = Value::Null;
    let s = shipping.unwrap_or(&empty);
    let b = billing.unwrap_or(&empty);
    let field = |key: &str| -> Option<String> {
        s.get(key)
            .and_then(Value::as_str)
            .filter(|v| !v.is_empty())
            .or_else(|| b.get(key).and_then(Value::as_str).filter(|v| !v.is_empty()))
            .map(String::from)
    };
    Address {
        firstname: field("first_name").unwrap_or_default(),
        lastname: field("last_name").unwrap_or_default(),
        company: field("company"),
        street: field("address_1").unwrap_or_default(),
        addition: field("address_2"),
        city: field("city").unwrap_or_default(),
        zip: field("postcode").unwrap_or_default(),
        country: field("country").unwrap_or_default(),
        phone: field("phone"),
        email: field("email"),
    }
}

pub(crate) fn parse_webshop_product(value: &Value) -> Result<CommerceProduct, SyncError> {
    let external_id = value
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| SyncError::Validation("webshop product without id".into()))?;
    Ok(CommerceProduct {
        external_id,
        sku: value
            .get("sku")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        name: value
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string(),
        description: value
            .get("description")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        price: value.get("price").map(money).unwrap_or(0.0),
        weight: value
            .get("weight")
            .map(money)
            .filter(|w| *w > 0.0),
        image_url: value
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .and_then(|image| image.get("src"))
            .and_then(Value::as_str)
            .map(String::from),
        updated_at: value
            .get("date_modified_gmt")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(&format!("{s}Z")).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn parse_date(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|s| {
            // Woo GMT dates come without an offset suffix.
            DateTime::parse_from_rfc3339(s)
                .or_else(|_| DateTime::parse_from_rfc3339(&format!("{s}Z")))
                .ok()
        })
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl CommerceApi for WebshopClient {
    async fn list_orders_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceOrder>, SyncError> {
        let values = self.list_paged("/orders", since).await?;
        debug!(count = values.len(), "Fetched webshop orders");
        values.iter().map(parse_webshop_order).collect()
    }

    async fn get_order(&self, external_id: &str) -> Result<Option<CommerceOrder>, SyncError> {
        match self
            .call(Method::GET, &format!("/orders/{external_id}"), &[], None)
            .await
        {
            Ok(value) => Ok(Some(parse_webshop_order(&value)?)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_products_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceProduct>, SyncError> {
        let values = self.list_paged("/products", since).await?;
        values.iter().map(parse_webshop_product).collect()
    }

    async fn get_product(&self, external_id: &str) -> Result<Option<CommerceProduct>, SyncError> {
        match self
            .call(Method::GET, &format!("/products/{external_id}"), &[], None)
            .await
        {
            Ok(value) => Ok(Some(parse_webshop_product(&value)?)),
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_order_status(
        &self,
        external_id: &str,
        status: OrderStatus,
    ) -> Result<(), SyncError> {
        self.call(
            Method::PUT,
            &format!("/orders/{external_id}"),
            &[],
            Some(json!({ "status": status.to_webshop() })),
        )
        .await?;
        Ok(())
    }

    /// The webshop has no fulfillment object: completing the order plus
    /// tracking meta is what the customer sees.
    async fn create_fulfillment(
        &self,
        external_order_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<Option<String>, SyncError> {
        let meta = json!([
            { "key": "_tracking_number", "value": tracking.tracking_number },
            { "key": "_tracking_carrier", "value": tracking.carrier },
            { "key": "_tracking_url", "value": tracking.tracking_url },
        ]);
        self.call(
            Method::PUT,
            &format!("/orders/{external_order_id}"),
            &[],
            Some(json!({ "status": "completed", "meta_data": meta })),
        )
        .await?;
        Ok(None)
    }

    async fn update_tracking(
        &self,
        fulfillment_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<(), SyncError> {
        // Fulfillment id is the order id here; tracking lives in order meta.
        self.create_fulfillment(fulfillment_id, tracking).await?;
        Ok(())
    }

    async fn cancel_order(
        &self,
        external_id: &str,
        reason: &str,
        _restock: bool,
    ) -> Result<(), SyncError> {
        self.call(
            Method::PUT,
            &format!("/orders/{external_id}"),
            &[],
            Some(json!({
                "status": "cancelled",
                "customer_note": format!("Cancelled: {reason}"),
            })),
        )
        .await?;
        Ok(())
    }

    async fn apply_hold(&self, external_id: &str) -> Result<(), SyncError> {
        self.update_order_status(external_id, OrderStatus::OnHold).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_order() -> Value {
        json!({
            "id": 15990,
            "number": "15990",
            "status": "processing",
            "currency": "EUR",
            "total": "29.99",
            "date_created_gmt": "2024-03-01T10:00:00",
            "date_modified_gmt": "2024-03-01T10:05:00",
            "billing": {
                "first_name": "Max", "last_name": "Muster",
                "address_1": "Torstr. 1", "city": "Berlin", "postcode": "10115",
                "country": "DE", "email": "max@example.com"
            },
            "shipping": {
                "first_name": "Max", "last_name": "Muster",
                "address_1": "Torstr. 1", "city": "Berlin", "postcode": "10115",
                "country": "DE"
            },
            "line_items": [
                {"id": 1, "name": "Widget", "sku": "ABC", "product_id": 77,
                 "quantity": 1, "price": "19.99", "total": "19.99"},
                {"id": 2, "name": "Gadget", "sku": "XYZ", "product_id": 78,
                 "quantity": 2, "price": 5.0, "total": "10.00"}
            ]
        })
    }

    #[test]
    fn order_projection() {
        let order = parse_webshop_order(&sample_order()).unwrap();
        assert_eq!(order.external_id, "15990");
        assert_eq!(order.status, OrderStatus::Processing);
        // processing means paid on this platform.
        assert_eq!(order.payment_status.as_deref(), Some("paid"));
        assert_eq!(order.total, 29.99);
        assert_eq!(order.items.len(), 2);
        assert_eq!(order.items[0].sku.as_deref(), Some("ABC"));
        assert_eq!(order.items[1].quantity, 2);
        assert_eq!(order.shipping_address.city, "Berlin");
        assert_eq!(order.shipping_address.zip, "10115");
        // Email only exists on billing; it backfills the shipping contact.
        assert_eq!(order.shipping_address.email.as_deref(), Some("max@example.com"));
    }

    #[test]
    fn cancelled_order_maps_to_cancelled() {
        let mut value = sample_order();
        value["status"] = json!("refunded");
        let order = parse_webshop_order(&value).unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert_eq!(order.payment_status.as_deref(), Some("refunded"));
    }

    #[test]
    fn product_projection() {
        let product = parse_webshop_product(&json!({
            "id": 77,
            "sku": "ABC",
            "name": "Widget",
            "description": "A widget",
            "price": "19.99",
            "images": [{"src": "https://img.example/widget.png"}]
        }))
        .unwrap();
        assert_eq!(product.external_id, "77");
        assert_eq!(product.sku.as_deref(), Some("ABC"));
        assert_eq!(product.price, 19.99);
        assert_eq!(
            product.image_url.as_deref(),
            Some("https://img.example/widget.png")
        );
    }

    #[test]
    fn missing_sku_is_none_not_empty() {
        let product = parse_webshop_product(&json!({"id": 1, "name": "x", "sku": ""})).unwrap();
        assert!(product.sku.is_none());
    }
}
