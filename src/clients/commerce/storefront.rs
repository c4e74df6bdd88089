//! Storefront API client (Shopify-flavored admin REST).
//!
//! Token-header auth, cursor pagination via the `Link` response header, and
//! fulfillment through the fulfillment-order request/accept handshake.

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
use crate::models::{Address, OrderStatus};

const ACCESS_TOKEN_HEADER: &str = "X-Storefront-Access-Token";
const API_VERSION: &str = "2024-01";

pub struct StorefrontClient {
    http: Client,
    base_url: String,
    access_token: String,
}

impl StorefrontClient {
    /// `credentials` is the decrypted admin access token.
    pub fn new(shop_domain: &str, credentials: &str) -> Result<Self, SyncError> {
        if credentials.trim().is_empty() {
            return Err(SyncError::MissingCredentials(
                "storefront access token is empty".into(),
            ));
        }
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("orderbridge/1.0")
            .build()
            .map_err(|e| SyncError::Transient(format!("build storefront http client: {e}")))?;

        let base = shop_domain.trim_end_matches('/');
        let base_url = if base.starts_with("http") {
            base.to_string()
        } else {
            format!("https://{base}")
        };

        Ok(Self {
            http,
            base_url,
            access_token: credentials.trim().to_string(),
        })
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<(Value, Option<String>), SyncError> {
        let url = format!("{}/admin/api/{API_VERSION}{}", self.base_url, path);
        let mut request = self
            .http
            .request(method, url)
            .header(ACCESS_TOKEN_HEADER, &self.access_token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(SyncError::NotFound(format!("storefront resource {path}")));
        }
        let next_cursor = response
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(next_page_info);
        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::CommerceApi {
                status: status.as_u16(),
                body: truncate_body(&text, 500),
            });
        }
        let value = serde_json::from_str(&text)
            .map_err(|e| SyncError::Validation(format!("malformed storefront response: {e}")))?;
        Ok((value, next_cursor))
    }

    /// Cursor-paged listing: follow `page_info` from the `Link` header until
    /// it runs out.
    async fn list_paged(
        &self,
        path: &str,
        collection: &str,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<Value>, SyncError> {
        let mut all = Vec::new();
        let mut page_info: Option<String> = None;
        loop {
            // Filters are only legal on the first request; page_info carries
            // them forward.
            let query: Vec<(&str, String)> = match &page_info {
                Some(cursor) => vec![
                    ("limit", PAGE_SIZE.to_string()),
                    ("page_info", cursor.clone()),
                ],
                None => {
                    let mut q = vec![
                        ("limit", PAGE_SIZE.to_string()),
                        ("status", "any".to_string()),
                    ];
                    if let Some(since) = since {
                        q.push(("updated_at_min", since.to_rfc3339()));
                    }
                    q
                }
            };

            let (value, next) = self.call(Method::GET, path, &query, None).await?;
            if let Some(items) = value.get(collection).and_then(Value::as_array) {
                all.extend(items.iter().cloned());
            }
            match next {
                Some(cursor) => {
                    page_info = Some(cursor);
                    tokio::time::sleep(Duration::from_millis(PAGE_DELAY_MS)).await;
                }
                None => break,
            }
        }
        Ok(all)
    }

    /// First half of the fulfillment handshake: find the open fulfillment
    /// order behind a storefront order.
    async fn open_fulfillment_order_id(&self, external_order_id: &str) -> Result<String, SyncError> {
        let (value, _) = self
            .call(
                Method::GET,
                &format!("/orders/{external_order_id}/fulfillment_orders.json"),
                &[],
                None,
            )
            .await?;
        value
            .get("fulfillment_orders")
            .and_then(Value::as_array)
            .and_then(|orders| {
                orders.iter().find(|fo| {
                    matches!(
                        fo.get("status").and_then(Value::as_str),
                        Some("open") | Some("in_progress") | Some("scheduled") | Some("on_hold")
                    )
                })
            })
            .and_then(|fo| fo.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string())
            .ok_or_else(|| {
                SyncError::NotFound(format!(
                    "no open fulfillment order for storefront order {external_order_id}"
                ))
            })
    }
}

/// Pull the rel="next" page_info out of a Link header.
fn next_page_info(link: &str) -> Option<String> {
    link.split(',').find_map(|part| {
        if !part.contains("rel=\"next\"") {
            return None;
        }
        let url = part.split('<').nth(1)?.split('>').next()?;
        url.split("page_info=")
            .nth(1)
            .map(|rest| rest.split('&').next().unwrap_or(rest).to_string())
    })
}

pub(crate) fn parse_storefront_order(value: &Value) -> Result<CommerceOrder, SyncError> {
    let external_id = value
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| SyncError::Validation("storefront order without id".into()))?;

    let cancelled = value
        .get("cancelled_at")
        .map(|v| !v.is_null())
        .unwrap_or(false);
    let financial_status = value
        .get("financial_status")
        .and_then(Value::as_str)
        .unwrap_or("pending");

    let status = if cancelled {
        OrderStatus::Cancelled
    } else {
        match financial_status {
            "pending" | "authorized" => OrderStatus::Pending,
            _ => OrderStatus::Processing,
        }
    };

    let items = value
        .get("line_items")
        .and_then(Value::as_array)
        .map(|items| items.iter().map(parse_storefront_item).collect())
        .unwrap_or_default();

    let email = value.get("email").and_then(Value::as_str).map(String::from);
    let mut shipping_address = parse_storefront_address(value.get("shipping_address"));
    if shipping_address.email.is_none() {
        shipping_address.email = email;
    }

    Ok(CommerceOrder {
        external_id,
        order_number: value
            .get("name")
            .and_then(Value::as_str)
            .map(|name| name.trim_start_matches('#').to_string()),
        status,
        // Storefront financial statuses line up with the canonical payment
        // token set as-is.
        payment_status: Some(financial_status.to_string()),
        currency: value
            .get("currency")
            .and_then(Value::as_str)
            .unwrap_or("EUR")
            .to_string(),
        total: value.get("total_price").map(money).unwrap_or(0.0),
        shipping_address,
        billing_address: value
            .get("billing_address")
            .filter(|v| !v.is_null())
            .map(|v| parse_storefront_address(Some(v))),
        items,
        created_at: parse_date(value.get("created_at")),
        updated_at: parse_date(value.get("updated_at")),
    })
}

fn parse_storefront_item(item: &Value) -> CommerceOrderItem {
    let quantity = item.get("quantity").and_then(Value::as_i64).unwrap_or(1);
    let unit_price = item.get("price").map(money).unwrap_or(0.0);
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
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string(),
        quantity,
        unit_price,
        line_total: unit_price * quantity as f64,
    }
}

fn parse_storefront_address(value: Option<&Value>) -> Address {
    let empty = Value::Null;
    let v = value.unwrap_or(&empty);
    let field = |key: &str| -> Option<String> {
        v.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from)
    };
    Address {
        firstname: field("first_name").unwrap_or_default(),
        lastname: field("last_name").unwrap_or_default(),
        company: field("company"),
        street: field("address1").unwrap_or_default(),
        addition: field("address2"),
        city: field("city").unwrap_or_default(),
        zip: field("zip").unwrap_or_default(),
        country: field("country_code").unwrap_or_default(),
        phone: field("phone"),
        email: None,
    }
}

pub(crate) fn parse_storefront_product(value: &Value) -> Result<CommerceProduct, SyncError> {
    let external_id = value
        .get("id")
        .and_then(Value::as_i64)
        .map(|id| id.to_string())
        .ok_or_else(|| SyncError::Validation("storefront product without id".into()))?;

    // The first variant carries SKU and price.
    let variant = value
        .get("variants")
        .and_then(Value::as_array)
        .and_then(|v| v.first());

    Ok(CommerceProduct {
        external_id,
        sku: variant
            .and_then(|v| v.get("sku"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        name: value
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("(unnamed)")
            .to_string(),
        description: value
            .get("body_html")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(String::from),
        price: variant
            .and_then(|v| v.get("price"))
            .map(money)
            .unwrap_or(0.0),
        weight: variant
            .and_then(|v| v.get("grams"))
            .and_then(Value::as_f64)
            .map(|grams| grams / 1000.0)
            .filter(|kg| *kg > 0.0),
        image_url: value
            .get("image")
            .and_then(|image| image.get("src"))
            .and_then(Value::as_str)
            .map(String::from),
        updated_at: value
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

fn parse_date(value: Option<&Value>) -> DateTime<Utc> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl CommerceApi for StorefrontClient {
    async fn list_orders_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceOrder>, SyncError> {
        let values = self.list_paged("/orders.json", "orders", since).await?;
        debug!(count = values.len(), "Fetched storefront orders");
        values.iter().map(parse_storefront_order).collect()
    }

    async fn get_order(&self, external_id: &str) -> Result<Option<CommerceOrder>, SyncError> {
        match self
            .call(Method::GET, &format!("/orders/{external_id}.json"), &[], None)
            .await
        {
            Ok((value, _)) => {
                let order = value
                    .get("order")
                    .ok_or_else(|| SyncError::Validation("missing order envelope".into()))?;
                Ok(Some(parse_storefront_order(order)?))
            }
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_products_since(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<CommerceProduct>, SyncError> {
        let values = self.list_paged("/products.json", "products", since).await?;
        values.iter().map(parse_storefront_product).collect()
    }

    async fn get_product(&self, external_id: &str) -> Result<Option<CommerceProduct>, SyncError> {
        match self
            .call(
                Method::GET,
                &format!("/products/{external_id}.json"),
                &[],
                None,
            )
            .await
        {
            Ok((value, _)) => {
                let product = value
                    .get("product")
                    .ok_or_else(|| SyncError::Validation("missing product envelope".into()))?;
                Ok(Some(parse_storefront_product(product)?))
            }
            Err(SyncError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// The storefront derives most visible status from fulfillments and
    /// payments on its own; only cancellation is an explicit push.
    async fn update_order_status(
        &self,
        external_id: &str,
        status: OrderStatus,
    ) -> Result<(), SyncError> {
        match status {
            OrderStatus::Cancelled => self.cancel_order(external_id, "cancelled", true).await,
            _ => Ok(()),
        }
    }

    async fn create_fulfillment(
        &self,
        external_order_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<Option<String>, SyncError> {
        let fulfillment_order_id = self.open_fulfillment_order_id(external_order_id).await?;

        let (value, _) = self
            .call(
                Method::POST,
                "/fulfillments.json",
                &[],
                Some(json!({
                    "fulfillment": {
                        "line_items_by_fulfillment_order": [
                            { "fulfillment_order_id": fulfillment_order_id }
                        ],
                        "tracking_info": {
                            "number": tracking.tracking_number,
                            "company": tracking.carrier,
                            "url": tracking.tracking_url,
                        },
                        "notify_customer": tracking.notify_customer,
                    }
                })),
            )
            .await?;

        Ok(value
            .get("fulfillment")
            .and_then(|f| f.get("id"))
            .and_then(Value::as_i64)
            .map(|id| id.to_string()))
    }

    async fn update_tracking(
        &self,
        fulfillment_id: &str,
        tracking: &FulfillmentRequest,
    ) -> Result<(), SyncError> {
        self.call(
            Method::POST,
            &format!("/fulfillments/{fulfillment_id}/update_tracking.json"),
            &[],
            Some(json!({
                "fulfillment": {
                    "tracking_info": {
                        "number": tracking.tracking_number,
                        "company": tracking.carrier,
                        "url": tracking.tracking_url,
                    },
                    "notify_customer": tracking.notify_customer,
                }
            })),
        )
        .await?;
        Ok(())
    }

    async fn cancel_order(
        &self,
        external_id: &str,
        reason: &str,
        restock: bool,
    ) -> Result<(), SyncError> {
        self.call(
            Method::POST,
            &format!("/orders/{external_id}/cancel.json"),
            &[],
            Some(json!({ "reason": reason, "restock": restock })),
        )
        .await?;
        Ok(())
    }

    async fn apply_hold(&self, external_id: &str) -> Result<(), SyncError> {
        let fulfillment_order_id = self.open_fulfillment_order_id(external_id).await?;
        self.call(
            Method::POST,
            &format!("/fulfillment_orders/{fulfillment_order_id}/hold.json"),
            &[],
            Some(json!({
                "fulfillment_hold": { "reason": "other", "reason_notes": "held by sync engine" }
            })),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn link_header_cursor_extraction() {
        let link = "<https://shop.example/admin/api/2024-01/orders.json?limit=50&page_info=abc123>; rel=\"next\"";
        assert_eq!(next_page_info(link).as_deref(), Some("abc123"));

        let both = "<https://x/orders.json?page_info=prev1>; rel=\"previous\", <https://x/orders.json?page_info=next2&limit=50>; rel=\"next\"";
        assert_eq!(next_page_info(both).as_deref(), Some("next2"));

        assert!(next_page_info("<https://x/orders.json?page_info=p>; rel=\"previous\"").is_none());
    }

    #[test]
    fn order_projection_uses_financial_status() {
        let order = parse_storefront_order(&json!({
            "id": 450789469,
            "name": "#1001",
            "financial_status": "paid",
            "cancelled_at": null,
            "currency": "EUR",
            "total_price": "52.00",
            "created_at": "2024-03-01T10:00:00+00:00",
            "updated_at": "2024-03-01T10:05:00+00:00",
            "email": "max@example.com",
            "shipping_address": {
                "first_name": "Max", "last_name": "Muster", "address1": "Torstr. 1",
                "city": "Berlin", "zip": "10115", "country_code": "DE"
            },
            "line_items": [
                {"id": 1, "sku": "ABC", "title": "Widget", "product_id": 99,
                 "quantity": 2, "price": "26.00"}
            ]
        }))
        .unwrap();

        assert_eq!(order.external_id, "450789469");
        assert_eq!(order.order_number.as_deref(), Some("1001"));
        assert_eq!(order.status, OrderStatus::Processing);
        assert_eq!(order.payment_status.as_deref(), Some("paid"));
        assert_eq!(order.items[0].line_total, 52.0);
        assert_eq!(order.shipping_address.country, "DE");
        assert_eq!(order.shipping_address.email.as_deref(), Some("max@example.com"));
    }

    #[test]
    fn cancelled_at_wins_over_financial_status() {
        let order = parse_storefront_order(&json!({
            "id": 1,
            "financial_status": "paid",
            "cancelled_at": "2024-03-02T00:00:00+00:00",
            "line_items": []
        }))
        .unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
    }

    #[test]
    fn product_projection_reads_first_variant() {
        let product = parse_storefront_product(&json!({
            "id": 632910392,
            "title": "Widget",
            "body_html": "<p>nice</p>",
            "updated_at": "2024-03-01T10:00:00+00:00",
            "variants": [
                {"sku": "ABC", "price": "19.99", "grams": 250.0},
                {"sku": "ABC-2", "price": "24.99"}
            ],
            "image": {"src": "https://img.example/widget.png"}
        }))
        .unwrap();
        assert_eq!(product.sku.as_deref(), Some("ABC"));
        assert_eq!(product.price, 19.99);
        assert_eq!(product.weight, Some(0.25));
    }
}
