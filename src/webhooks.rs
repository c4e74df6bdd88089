//! Webhook processor and ingress.
//!
//! Commerce platforms push here; the processor projects payloads into
//! canonical rows and enqueues the downstream sync jobs. Handlers never talk
//! to external APIs directly, so a webhook burst turns into queue depth, not
//! outbound traffic. Every handler is idempotent keyed by the external id:
//! redelivery converges on the same end state.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit::{job_id, JOB_WEBHOOK};
use crate::clients::commerce::{
    parse_storefront_order, parse_storefront_product, parse_webshop_order, parse_webshop_product,
    CommerceOrder, CommerceProduct,
};
use crate::error::SyncError;
use crate::lifecycle::ffn_sync_key;
use crate::models::{
    is_payment_safe, Channel, ChannelType, FulfillmentState, HoldReason, Order, OrderItem,
    OrderOrigin, OrderStatus, ReturnItem, ReturnRecord, ReturnStatus, SyncStatus,
};
use crate::queue::{Enqueuer, JobOptions, JobQueue, ORDER_SYNC_TO_FFN, PRODUCT_SYNC_TO_FFN, RETURN_SYNC_TO_FFN};
use crate::store::Database;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resource {
    Product,
    Order,
    Refund,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
    Cancel,
    Paid,
    Fulfilled,
}

/// A validated ingress event. Platform payloads are parsed into typed
/// variants right here; downstream code never touches raw topic strings.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub tenant_id: String,
    pub channel_id: String,
    pub channel_type: ChannelType,
    pub topic: String,
    pub payload: Value,
}

/// What the platform gets told about its delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed(String),
    Skipped(String),
}

/// Topic grammar differs per platform: `resource/action` on the storefront,
/// `resource-action` on the webshop.
pub fn parse_topic(channel_type: ChannelType, topic: &str) -> Result<(Resource, Action), SyncError> {
    let (resource_token, action_token) = match channel_type {
        ChannelType::Storefront => topic.split_once('/'),
        ChannelType::Webshop => topic.split_once('-'),
    }
    .ok_or_else(|| SyncError::Validation(format!("unparseable topic '{topic}'")))?;

    let resource = match resource_token {
        "product" | "products" => Resource::Product,
        "order" | "orders" => Resource::Order,
        "refund" | "refunds" => Resource::Refund,
        other => {
            return Err(SyncError::Validation(format!(
                "unknown webhook resource '{other}'"
            )))
        }
    };

    let action = match action_token {
        "create" | "created" => Action::Create,
        "update" | "updated" => Action::Update,
        "delete" | "deleted" => Action::Delete,
        "cancel" | "cancelled" => Action::Cancel,
        "paid" => Action::Paid,
        "fulfilled" => Action::Fulfilled,
        other => {
            return Err(SyncError::Validation(format!(
                "unknown webhook action '{other}'"
            )))
        }
    };

    Ok((resource, action))
}

pub struct WebhookProcessor {
    db: Database,
    enqueuer: Arc<dyn Enqueuer>,
}

impl WebhookProcessor {
    pub fn new(db: Database, enqueuer: Arc<dyn Enqueuer>) -> Self {
        Self { db, enqueuer }
    }

    /// Process one delivery. `Err` means the platform should retry;
    /// `Skipped` means we accept the delivery but did nothing with it
    /// (malformed or already processed).
    pub async fn process(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let correlation = job_id(JOB_WEBHOOK);
        let parsed = parse_topic(event.channel_type, &event.topic);

        let (resource, action) = match parsed {
            Ok(pair) => pair,
            Err(e) => {
                warn!(job_id = %correlation, topic = %event.topic, error = %e, "Skipping unparseable webhook");
                return Ok(WebhookOutcome::Skipped(e.to_string()));
            }
        };

        let result = match (resource, action) {
            (Resource::Product, Action::Create | Action::Update) => self.upsert_product(event),
            (Resource::Product, Action::Delete) => self.delete_product(event),
            (Resource::Order, Action::Create | Action::Update) => self.upsert_order(event),
            (Resource::Order, Action::Cancel | Action::Delete) => self.cancel_order(event),
            (Resource::Order, Action::Paid) => self.order_paid(event),
            (Resource::Order, Action::Fulfilled) => {
                // Fulfillment is driven from the FFN side; the platform
                // echoing it back is nothing to act on.
                Ok(WebhookOutcome::Skipped("fulfillment originates here".into()))
            }
            (Resource::Refund, Action::Create) => self.create_return(event),
            (Resource::Refund, _) => {
                Ok(WebhookOutcome::Skipped("refund action not handled".into()))
            }
            (Resource::Product, _) => {
                Ok(WebhookOutcome::Skipped("product action not handled".into()))
            }
        };

        match result {
            Ok(outcome) => {
                info!(
                    job_id = %correlation,
                    topic = %event.topic,
                    channel_id = %event.channel_id,
                    outcome = ?outcome,
                    "Webhook processed"
                );
                Ok(outcome)
            }
            // Bad payloads must not be redelivered forever.
            Err(SyncError::Validation(message)) => {
                warn!(job_id = %correlation, topic = %event.topic, %message, "Skipping invalid webhook payload");
                Ok(WebhookOutcome::Skipped(message))
            }
            Err(e) => {
                warn!(job_id = %correlation, topic = %event.topic, error = %e, "Webhook processing failed");
                Err(e)
            }
        }
    }

    fn parse_order(&self, event: &WebhookEvent) -> Result<CommerceOrder, SyncError> {
        match event.channel_type {
            ChannelType::Storefront => parse_storefront_order(&event.payload),
            ChannelType::Webshop => parse_webshop_order(&event.payload),
        }
    }

    fn parse_product(&self, event: &WebhookEvent) -> Result<CommerceProduct, SyncError> {
        match event.channel_type {
            ChannelType::Storefront => parse_storefront_product(&event.payload),
            ChannelType::Webshop => parse_webshop_product(&event.payload),
        }
    }

    // ---- products ----

    fn upsert_product(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let incoming = self.parse_product(event)?;
        let sku = self
            .ingest_product(&event.tenant_id, &event.channel_id, &incoming)?;
        Ok(WebhookOutcome::Processed(format!("product {sku} upserted")))
    }

    /// Materialize one platform product. Shared by webhook delivery and the
    /// scheduler's product polls. Returns the merchant SKU.
    pub fn ingest_product(
        &self,
        tenant_id: &str,
        channel_id: &str,
        incoming: &CommerceProduct,
    ) -> Result<String, SyncError> {
        let sku = incoming.sku.clone().ok_or_else(|| {
            SyncError::Validation(format!(
                "product {} has no SKU; cannot map to canonical product",
                incoming.external_id
            ))
        })?;

        let product = crate::models::Product {
            id: Uuid::new_v4().to_string(),
            client_id: tenant_id.to_string(),
            merchant_sku: sku,
            name: incoming.name.clone(),
            description: incoming.description.clone(),
            price: incoming.price,
            weight: incoming.weight,
            stock_available: 0,
            stock_reserved: 0,
            ffn_product_id: None,
            sync_status: SyncStatus::Pending,
            image_url: incoming.image_url.clone(),
            is_bundle: false,
        };
        let stored = self
            .db
            .upsert_product(&product)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        self.db
            .link_product_channel(&stored.id, channel_id, &incoming.external_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        self.enqueuer.enqueue(
            PRODUCT_SYNC_TO_FFN,
            json!({ "product_id": stored.id }),
            JobOptions::singleton(format!("product-sync-{}", stored.id)),
        )?;

        Ok(stored.merchant_sku)
    }

    fn delete_product(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let external_id = external_id_of(&event.payload)?;
        let Some(product) = self
            .db
            .find_product_by_channel_external_id(&event.channel_id, &external_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(WebhookOutcome::Skipped(format!(
                "product {external_id} unknown on this channel"
            )));
        };

        let deleted = self
            .db
            .unlink_product_channel(&product.id, &event.channel_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(WebhookOutcome::Processed(if deleted {
            format!("product {} removed with last channel link", product.merchant_sku)
        } else {
            format!("product {} unlinked from channel", product.merchant_sku)
        }))
    }

    // ---- orders ----

    fn upsert_order(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let incoming = self.parse_order(event)?;
        self.ingest_order(
            &event.tenant_id,
            &event.channel_id,
            event.channel_type,
            incoming,
        )
    }

    /// Materialize one platform order, creating or patching the canonical
    /// row. Shared by webhook delivery and the scheduler's order polls.
    pub fn ingest_order(
        &self,
        tenant_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
        incoming: CommerceOrder,
    ) -> Result<WebhookOutcome, SyncError> {
        let existing = self
            .db
            .get_order_by_external(tenant_id, &incoming.external_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        match existing {
            None => self.create_order(tenant_id, channel_id, channel_type, incoming),
            Some(order) => self.update_order(order, incoming),
        }
    }

    fn create_order(
        &self,
        tenant_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
        incoming: CommerceOrder,
    ) -> Result<WebhookOutcome, SyncError> {
        let order = self.canonical_order(tenant_id, channel_id, channel_type, &incoming)?;
        let inserted = self
            .db
            .insert_order(&order)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if !inserted {
            // Lost a race against the scheduler's poll; the row exists and
            // carries the same data.
            return Ok(WebhookOutcome::Skipped(format!(
                "order {} already processed",
                incoming.external_id
            )));
        }

        if !order.is_cancelled {
            self.enqueuer.enqueue(
                ORDER_SYNC_TO_FFN,
                json!({ "order_id": order.id, "operation": "create" }),
                JobOptions {
                    singleton_key: Some(ffn_sync_key(&order.id)),
                    retry_limit: 3,
                    retry_delay_secs: 60,
                    retry_backoff: true,
                    ..Default::default()
                },
            )?;
        }

        Ok(WebhookOutcome::Processed(format!(
            "order {} created",
            incoming.external_id
        )))
    }

    fn update_order(
        &self,
        existing: Order,
        incoming: CommerceOrder,
    ) -> Result<WebhookOutcome, SyncError> {
        if incoming.status == OrderStatus::Cancelled && !existing.is_cancelled {
            return self.cancel_existing(existing, "platform webhook");
        }

        self.db
            .patch_order_from_commerce(
                &existing.id,
                incoming.status,
                incoming.payment_status.as_deref(),
                Some(&incoming.shipping_address),
                Some(incoming.total),
            )
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        // A payment transition into the safe set releases the payment hold
        // and finally lets the order through the gate.
        let now_safe = is_payment_safe(incoming.payment_status.as_deref());
        if now_safe
            && existing.is_on_hold
            && existing.hold_reason == Some(HoldReason::AwaitingPayment)
        {
            self.release_payment_hold_and_requeue(&existing)?;
        }

        Ok(WebhookOutcome::Processed(format!(
            "order {} updated",
            incoming.external_id
        )))
    }

    fn order_paid(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let external_id = external_id_of(&event.payload)?;
        let Some(order) = self
            .db
            .get_order_by_external(&event.tenant_id, &external_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(WebhookOutcome::Skipped(format!("order {external_id} unknown")));
        };

        self.db
            .set_payment_status(&order.id, "paid")
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if order.is_on_hold && order.hold_reason == Some(HoldReason::AwaitingPayment) {
            self.release_payment_hold_and_requeue(&order)?;
        } else if order.ffn_outbound_id.is_none() && !order.is_cancelled {
            self.enqueuer.enqueue(
                ORDER_SYNC_TO_FFN,
                json!({ "order_id": order.id, "operation": "create" }),
                JobOptions {
                    singleton_key: Some(ffn_sync_key(&order.id)),
                    retry_limit: 3,
                    retry_delay_secs: 60,
                    retry_backoff: true,
                    ..Default::default()
                },
            )?;
        }

        Ok(WebhookOutcome::Processed(format!("order {external_id} paid")))
    }

    /// Payment arrived: drop the hold (no override involved) and queue the
    /// FFN dispatch that the gate was blocking.
    fn release_payment_hold_and_requeue(&self, order: &Order) -> Result<(), SyncError> {
        self.db
            .release_hold(&order.id, "payment-webhook", Utc::now(), false)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if order.ffn_outbound_id.is_none() && !order.is_cancelled {
            self.enqueuer.enqueue(
                ORDER_SYNC_TO_FFN,
                json!({ "order_id": order.id, "operation": "create" }),
                JobOptions {
                    singleton_key: Some(ffn_sync_key(&order.id)),
                    retry_limit: 3,
                    retry_delay_secs: 60,
                    retry_backoff: true,
                    ..Default::default()
                },
            )?;
        }
        Ok(())
    }

    fn cancel_order(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let external_id = external_id_of(&event.payload)?;
        let Some(order) = self
            .db
            .get_order_by_external(&event.tenant_id, &external_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(WebhookOutcome::Skipped(format!("order {external_id} unknown")));
        };
        if order.is_cancelled {
            return Ok(WebhookOutcome::Skipped(format!(
                "order {external_id} already cancelled"
            )));
        }
        self.cancel_existing(order, "platform webhook")
    }

    fn cancel_existing(&self, order: Order, reason: &str) -> Result<WebhookOutcome, SyncError> {
        self.db
            .mark_cancelled(&order.id, "commerce", Some(reason), Utc::now(), false)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if order.ffn_outbound_id.is_some() {
            self.enqueuer.enqueue(
                ORDER_SYNC_TO_FFN,
                json!({ "order_id": order.id, "operation": "cancel", "reason": reason }),
                JobOptions {
                    singleton_key: Some(format!("ffn-cancel-{}", order.id)),
                    retry_limit: 3,
                    retry_delay_secs: 60,
                    retry_backoff: true,
                    ..Default::default()
                },
            )?;
        }

        Ok(WebhookOutcome::Processed(format!(
            "order {} cancelled",
            order.external_order_id
        )))
    }

    // ---- refunds ----

    fn create_return(&self, event: &WebhookEvent) -> Result<WebhookOutcome, SyncError> {
        let payload = &event.payload;
        let refund_id = external_id_of(payload)?;
        let order_external = payload
            .get("order_id")
            .or_else(|| payload.get("parent_id"))
            .and_then(value_as_id)
            .ok_or_else(|| {
                SyncError::Validation(format!("refund {refund_id} carries no order reference"))
            })?;

        let Some(order) = self
            .db
            .get_order_by_external(&event.tenant_id, &order_external)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(WebhookOutcome::Skipped(format!(
                "refund {refund_id} references unknown order {order_external}"
            )));
        };

        let return_id = Uuid::new_v4().to_string();
        let items = parse_refund_items(payload, &return_id, &order);
        let record = ReturnRecord {
            id: return_id.clone(),
            client_id: event.tenant_id.clone(),
            order_id: order.id.clone(),
            external_refund_id: Some(refund_id.clone()),
            status: ReturnStatus::Received,
            reason: payload
                .get("reason")
                .or_else(|| payload.get("note"))
                .and_then(Value::as_str)
                .map(String::from),
            ffn_return_id: None,
            items,
            created_at: Utc::now(),
        };

        let inserted = self
            .db
            .insert_return(&record)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if !inserted {
            return Ok(WebhookOutcome::Skipped(format!(
                "refund {refund_id} already processed"
            )));
        }

        self.enqueuer.enqueue(
            RETURN_SYNC_TO_FFN,
            json!({ "return_id": record.id }),
            JobOptions::singleton(format!("return-sync-{}", record.id)),
        )?;

        Ok(WebhookOutcome::Processed(format!("return created for refund {refund_id}")))
    }

    /// Project a platform order into the canonical aggregate, resolving item
    /// product links by SKU and minting `NO-SKU-<n>` placeholders where the
    /// platform sent none.
    fn canonical_order(
        &self,
        tenant_id: &str,
        channel_id: &str,
        channel_type: ChannelType,
        incoming: &CommerceOrder,
    ) -> Result<Order, SyncError> {
        if incoming.items.is_empty() {
            return Err(SyncError::Validation(format!(
                "order {} has no line items",
                incoming.external_id
            )));
        }

        let order_id = Uuid::new_v4().to_string();
        let mut items = Vec::with_capacity(incoming.items.len());
        for (n, item) in incoming.items.iter().enumerate() {
            let sku = item
                .sku
                .clone()
                .unwrap_or_else(|| format!("NO-SKU-{}", n + 1));
            let product_id = self
                .db
                .get_product_by_sku(tenant_id, &sku)
                .map_err(|e| SyncError::Storage(e.to_string()))?
                .map(|p| p.id);
            items.push(OrderItem {
                id: Uuid::new_v4().to_string(),
                order_id: order_id.clone(),
                product_id,
                sku,
                product_name: item.name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
                line_total: item.line_total,
            });
        }

        let cancelled = incoming.status == OrderStatus::Cancelled;
        let needs_payment_hold =
            !cancelled && !is_payment_safe(incoming.payment_status.as_deref());
        let now = Utc::now();

        Ok(Order {
            id: order_id,
            client_id: tenant_id.to_string(),
            channel_id: Some(channel_id.to_string()),
            order_number: incoming.order_number.clone(),
            external_order_id: incoming.external_id.clone(),
            order_origin: OrderOrigin::from_channel(channel_type),
            status: if needs_payment_hold {
                OrderStatus::OnHold
            } else {
                incoming.status
            },
            fulfillment_state: FulfillmentState::Pending,
            payment_status: incoming.payment_status.clone(),
            is_on_hold: needs_payment_hold,
            hold_reason: needs_payment_hold.then_some(HoldReason::AwaitingPayment),
            hold_placed_at: needs_payment_hold.then_some(now),
            hold_placed_by: needs_payment_hold.then(|| "system".to_string()),
            hold_released_at: None,
            hold_released_by: None,
            payment_hold_override: false,
            shipping_address: incoming.shipping_address.clone(),
            billing_address: incoming.billing_address.clone(),
            total: incoming.total,
            currency: incoming.currency.clone(),
            items,
            ffn_outbound_id: None,
            last_ffn_sync_at: None,
            ffn_sync_error: None,
            commerce_sync_error: None,
            last_synced_to_commerce: None,
            sync_status: SyncStatus::Pending,
            shipped_at: None,
            delivered_at: None,
            tracking_number: None,
            carrier: None,
            tracking_url: None,
            tracking_packages: Vec::new(),
            priority_level: 0,
            is_cancelled: cancelled,
            cancelled_at: cancelled.then_some(now),
            cancelled_by: cancelled.then(|| "commerce".to_string()),
            cancellation_reason: None,
            is_replacement: false,
            last_operational_update_by: None,
            last_operational_update_at: None,
            created_at: incoming.created_at,
            updated_at: incoming.updated_at,
        })
    }
}

fn external_id_of(payload: &Value) -> Result<String, SyncError> {
    payload
        .get("id")
        .and_then(value_as_id)
        .ok_or_else(|| SyncError::Validation("payload has no id".into()))
}

fn value_as_id(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn parse_refund_items(payload: &Value, return_id: &str, order: &Order) -> Vec<ReturnItem> {
    let lines = payload
        .get("line_items")
        .or_else(|| payload.get("refund_line_items"))
        .and_then(Value::as_array);

    let Some(lines) = lines else {
        // No line detail: mirror the full order.
        return order
            .items
            .iter()
            .map(|item| ReturnItem {
                id: Uuid::new_v4().to_string(),
                return_id: return_id.to_string(),
                sku: item.sku.clone(),
                quantity: item.quantity,
            })
            .collect();
    };

    lines
        .iter()
        .filter_map(|line| {
            let sku = line
                .get("sku")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .or_else(|| {
                    line.get("line_item")
                        .and_then(|li| li.get("sku"))
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                })?;
            let quantity = line
                .get("quantity")
                .and_then(Value::as_i64)
                .map(i64::abs)
                .filter(|q| *q > 0)
                .unwrap_or(1);
            Some(ReturnItem {
                id: Uuid::new_v4().to_string(),
                return_id: return_id.to_string(),
                sku,
                quantity,
            })
        })
        .collect()
}

// ---- ingress ----

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub queue: Arc<JobQueue>,
    pub processor: Arc<WebhookProcessor>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/:channel_id", post(receive_webhook))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Response {
    let queues = state.queue.depth().unwrap_or_default();
    let depth: serde_json::Map<String, Value> = queues
        .into_iter()
        .map(|(queue, count)| (queue, json!(count)))
        .collect();
    Json(json!({ "status": "ok", "queues": depth })).into_response()
}

/// Platform pushes land here. The platform's signature check happens at the
/// edge proxy; by the time a request reaches this handler it is trusted.
async fn receive_webhook(
    State(state): State<AppState>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> Response {
    let channel = match state.db.get_channel(&channel_id) {
        Ok(Some(channel)) if channel.is_active => channel,
        Ok(_) => {
            return (StatusCode::NOT_FOUND, Json(json!({ "error": "unknown or inactive channel" })))
                .into_response()
        }
        Err(e) => {
            warn!(channel_id, error = %e, "Channel lookup failed");
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "storage" })))
                .into_response();
        }
    };

    let Some(topic) = topic_from_headers(&channel, &headers) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing topic header" })),
        )
            .into_response();
    };

    let event = WebhookEvent {
        tenant_id: channel.client_id.clone(),
        channel_id: channel.id.clone(),
        channel_type: channel.channel_type,
        topic,
        payload,
    };

    match state.processor.process(&event).await {
        Ok(WebhookOutcome::Processed(detail)) => {
            Json(json!({ "action": "processed", "detail": detail })).into_response()
        }
        Ok(WebhookOutcome::Skipped(detail)) => {
            Json(json!({ "action": "skipped", "detail": detail })).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

fn topic_from_headers(channel: &Channel, headers: &HeaderMap) -> Option<String> {
    let header = match channel.channel_type {
        ChannelType::Storefront => "x-storefront-topic",
        ChannelType::Webshop => "x-wc-webhook-topic",
    };
    headers
        .get(header)
        .or_else(|| headers.get("x-webhook-topic"))
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobQueue;
    use serde_json::json;

    fn setup() -> (Database, Arc<JobQueue>, WebhookProcessor, WebhookEvent) {
        let db = Database::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db.clone()).unwrap());
        let tenant = db.insert_tenant("acme").unwrap();
        let channel = crate::models::Channel {
            id: Uuid::new_v4().to_string(),
            client_id: tenant.id.clone(),
            channel_type: ChannelType::Webshop,
            base_url: "https://shop.example".into(),
            api_credentials: "k:s".into(),
            is_active: true,
            sync_enabled: true,
            last_order_poll_at: None,
            last_product_poll_at: None,
        };
        db.insert_channel(&channel).unwrap();

        let processor = WebhookProcessor::new(db.clone(), queue.clone());
        let event = WebhookEvent {
            tenant_id: tenant.id,
            channel_id: channel.id,
            channel_type: ChannelType::Webshop,
            topic: String::new(),
            payload: Value::Null,
        };
        (db, queue, processor, event)
    }

    fn order_created_payload() -> Value {
        json!({
            "id": 15990,
            "number": "15990",
            "status": "processing",
            "currency": "EUR",
            "total": "29.99",
            "date_created_gmt": "2024-03-01T10:00:00",
            "date_modified_gmt": "2024-03-01T10:00:00",
            "shipping": {
                "first_name": "Max", "last_name": "Muster",
                "address_1": "Torstr. 1", "city": "Berlin",
                "postcode": "10115", "country": "DE"
            },
            "billing": { "email": "max@example.com" },
            "line_items": [
                {"id": 1, "name": "Widget", "sku": "ABC", "product_id": 77,
                 "quantity": 1, "price": "19.99", "total": "19.99"},
                {"id": 2, "name": "Gadget", "sku": "XYZ", "product_id": 78,
                 "quantity": 2, "price": "5.00", "total": "10.00"}
            ]
        })
    }

    #[test]
    fn topic_grammar_per_platform() {
        assert_eq!(
            parse_topic(ChannelType::Storefront, "orders/create").unwrap(),
            (Resource::Order, Action::Create)
        );
        assert_eq!(
            parse_topic(ChannelType::Storefront, "orders/paid").unwrap(),
            (Resource::Order, Action::Paid)
        );
        assert_eq!(
            parse_topic(ChannelType::Webshop, "order-created").unwrap(),
            (Resource::Order, Action::Create)
        );
        assert_eq!(
            parse_topic(ChannelType::Webshop, "product-deleted").unwrap(),
            (Resource::Product, Action::Delete)
        );
        assert!(parse_topic(ChannelType::Webshop, "garbage").is_err());
        assert!(parse_topic(ChannelType::Storefront, "orders/explode").is_err());
    }

    #[tokio::test]
    async fn order_created_materializes_and_enqueues() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "order-created".into();
        event.payload = order_created_payload();

        let outcome = processor.process(&event).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed(_)));

        let order = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();
        assert_eq!(order.order_origin, OrderOrigin::Webshop);
        assert_eq!(order.payment_status.as_deref(), Some("paid"));
        assert_eq!(order.fulfillment_state, FulfillmentState::Pending);
        assert!(!order.is_on_hold);
        assert_eq!(order.items.len(), 2);

        let job = queue.fetch_next(ORDER_SYNC_TO_FFN).unwrap().unwrap();
        assert_eq!(job.payload["order_id"], json!(order.id));
        assert_eq!(job.payload["operation"], json!("create"));
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "order-created".into();
        event.payload = order_created_payload();

        processor.process(&event).await.unwrap();
        let first = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();

        // Deliver the identical payload twice more.
        for _ in 0..2 {
            let outcome = processor.process(&event).await.unwrap();
            assert!(matches!(outcome, WebhookOutcome::Processed(_) | WebhookOutcome::Skipped(_)));
        }

        let after = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();
        assert_eq!(after.id, first.id);
        assert_eq!(after.items.len(), first.items.len());
        assert_eq!(after.total, first.total);

        // The singleton key kept it to one live job.
        assert_eq!(queue.live_count(&ffn_sync_key(&first.id)).unwrap(), 1);
    }

    #[tokio::test]
    async fn unpaid_order_gets_payment_hold_then_paid_releases_it() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "order-created".into();
        let mut payload = order_created_payload();
        payload["status"] = json!("pending");
        event.payload = payload;

        processor.process(&event).await.unwrap();
        let order = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();
        assert!(order.is_on_hold);
        assert_eq!(order.hold_reason, Some(HoldReason::AwaitingPayment));
        assert_eq!(order.payment_status.as_deref(), Some("pending"));
        assert_eq!(order.status, OrderStatus::OnHold);

        // Payment arrives as an order update into the safe set.
        let mut paid_event = event.clone();
        paid_event.topic = "order-updated".into();
        paid_event.payload["status"] = json!("processing");
        processor.process(&paid_event).await.unwrap();

        let released = db.get_order(&order.id).unwrap().unwrap();
        assert!(!released.is_on_hold);
        assert_eq!(released.payment_status.as_deref(), Some("paid"));
        assert!(!released.payment_hold_override);
        assert_eq!(queue.live_count(&ffn_sync_key(&order.id)).unwrap(), 1);
    }

    #[tokio::test]
    async fn cancel_webhook_enqueues_ffn_cancel_only_when_dispatched() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "order-created".into();
        event.payload = order_created_payload();
        processor.process(&event).await.unwrap();

        let order = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();

        // Not yet at the FFN: cancel is purely canonical.
        let mut cancel = event.clone();
        cancel.topic = "order-deleted".into();
        cancel.payload = json!({ "id": 15990 });
        processor.process(&cancel).await.unwrap();

        let cancelled = db.get_order(&order.id).unwrap().unwrap();
        assert!(cancelled.is_cancelled);
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert_eq!(queue.live_count(&format!("ffn-cancel-{}", order.id)).unwrap(), 0);

        // Now with an outbound attached a second cancel would mirror to FFN,
        // but redelivery of the same cancel is a skip.
        let outcome = processor.process(&cancel).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn product_upsert_links_channel_and_enqueues() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "product-created".into();
        event.payload = json!({
            "id": 77, "sku": "ABC", "name": "Widget", "price": "19.99"
        });

        processor.process(&event).await.unwrap();
        let product = db.get_product_by_sku(&event.tenant_id, "ABC").unwrap().unwrap();
        assert_eq!(product.name, "Widget");

        let linked = db
            .find_product_by_channel_external_id(&event.channel_id, "77")
            .unwrap()
            .unwrap();
        assert_eq!(linked.id, product.id);

        let job = queue.fetch_next(PRODUCT_SYNC_TO_FFN).unwrap().unwrap();
        assert_eq!(job.payload["product_id"], json!(product.id));

        // Delete unlinks and, as the last link, removes the product.
        let mut delete = event.clone();
        delete.topic = "product-deleted".into();
        delete.payload = json!({ "id": 77 });
        processor.process(&delete).await.unwrap();
        assert!(db.get_product_by_sku(&event.tenant_id, "ABC").unwrap().is_none());
    }

    #[tokio::test]
    async fn product_without_sku_is_skipped_not_failed() {
        let (_db, _queue, processor, mut event) = setup();
        event.topic = "product-created".into();
        event.payload = json!({ "id": 78, "name": "No SKU", "price": "1.00" });

        let outcome = processor.process(&event).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped(_)));
    }

    #[tokio::test]
    async fn refund_creates_return_and_enqueues() {
        let (db, queue, processor, mut event) = setup();
        event.topic = "order-created".into();
        event.payload = order_created_payload();
        processor.process(&event).await.unwrap();
        let order = db
            .get_order_by_external(&event.tenant_id, "15990")
            .unwrap()
            .unwrap();

        let mut refund = event.clone();
        refund.topic = "refund-created".into();
        refund.payload = json!({
            "id": 555,
            "order_id": 15990,
            "reason": "damaged in transit",
            "line_items": [ {"sku": "ABC", "quantity": 1} ]
        });

        let outcome = processor.process(&refund).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed(_)));

        let job = queue.fetch_next(RETURN_SYNC_TO_FFN).unwrap().unwrap();
        let return_id = job.payload["return_id"].as_str().unwrap().to_string();
        let ret = db.get_return(&return_id).unwrap().unwrap();
        assert_eq!(ret.order_id, order.id);
        assert_eq!(ret.items.len(), 1);
        assert_eq!(ret.items[0].sku, "ABC");

        // Redelivery: skip, no duplicate return.
        let outcome = processor.process(&refund).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Skipped(_)));
    }
}
