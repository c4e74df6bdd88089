//! Queue handlers: the glue between the durable queue and the lifecycle
//! engine. Payloads are parsed into typed structs here; a payload that does
//! not parse is a validation failure and dead-letters immediately.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::SyncError;
use crate::lifecycle::OrderLifecycle;
use crate::queue::worker::JobHandler;
use crate::queue::Job;

fn parse_payload<T: serde::de::DeserializeOwned>(job: &Job) -> Result<T, SyncError> {
    serde_json::from_value(job.payload.clone())
        .map_err(|e| SyncError::Validation(format!("malformed job payload: {e}")))
}

#[derive(Debug, Deserialize)]
struct OrderSyncPayload {
    order_id: String,
    #[serde(default)]
    operation: Option<String>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// `order-sync-to-ffn`: create or cancel outbounds.
pub struct FfnOrderSyncHandler {
    lifecycle: Arc<OrderLifecycle>,
}

impl FfnOrderSyncHandler {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for FfnOrderSyncHandler {
    async fn handle(&self, job: &Job) -> Result<(), SyncError> {
        let payload: OrderSyncPayload = parse_payload(job)?;
        match payload.operation.as_deref().unwrap_or("create") {
            "create" => {
                self.lifecycle
                    .sync_order_to_ffn(&payload.order_id, payload.force, &job.id)
                    .await?;
                Ok(())
            }
            "cancel" => {
                self.lifecycle
                    .cancel_order_in_ffn(
                        &payload.order_id,
                        "commerce",
                        payload.reason.as_deref().unwrap_or("cancelled upstream"),
                        &job.id,
                    )
                    .await
            }
            other => Err(SyncError::Validation(format!(
                "unknown FFN sync operation '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CommerceSyncPayload {
    order_id: String,
    #[serde(default)]
    operation: Option<String>,
}

/// `order-sync-to-commerce`: fulfillment and tracking back-propagation.
pub struct CommerceOrderSyncHandler {
    lifecycle: Arc<OrderLifecycle>,
}

impl CommerceOrderSyncHandler {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for CommerceOrderSyncHandler {
    async fn handle(&self, job: &Job) -> Result<(), SyncError> {
        let payload: CommerceSyncPayload = parse_payload(job)?;
        match payload.operation.as_deref().unwrap_or("fulfill") {
            "fulfill" | "update_tracking" => {
                self.lifecycle
                    .sync_shipment_to_commerce(&payload.order_id, &job.id)
                    .await
            }
            other => Err(SyncError::Validation(format!(
                "unknown commerce sync operation '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProductSyncPayload {
    product_id: String,
}

/// `product-sync-to-ffn`.
pub struct ProductSyncHandler {
    lifecycle: Arc<OrderLifecycle>,
}

impl ProductSyncHandler {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for ProductSyncHandler {
    async fn handle(&self, job: &Job) -> Result<(), SyncError> {
        let payload: ProductSyncPayload = parse_payload(job)?;
        self.lifecycle
            .sync_product_to_ffn(&payload.product_id, &job.id)
            .await
    }
}

#[derive(Debug, Deserialize)]
struct ReturnSyncPayload {
    return_id: String,
}

/// `return-sync-to-ffn`.
pub struct ReturnSyncHandler {
    lifecycle: Arc<OrderLifecycle>,
}

impl ReturnSyncHandler {
    pub fn new(lifecycle: Arc<OrderLifecycle>) -> Self {
        Self { lifecycle }
    }
}

#[async_trait]
impl JobHandler for ReturnSyncHandler {
    async fn handle(&self, job: &Job) -> Result<(), SyncError> {
        let payload: ReturnSyncPayload = parse_payload(job)?;
        self.lifecycle
            .sync_return_to_ffn(&payload.return_id, &job.id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn job_with(payload: serde_json::Value) -> Job {
        Job {
            id: "job-1".into(),
            queue: "order-sync-to-ffn".into(),
            payload,
            priority: 0,
            state: crate::queue::JobState::Active,
            retry_count: 0,
            retry_limit: 2,
            retry_delay_secs: 60,
            retry_backoff: false,
            expire_in_secs: 900,
            singleton_key: None,
            start_after: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn payload_parsing_defaults() {
        let payload: OrderSyncPayload =
            parse_payload(&job_with(json!({ "order_id": "o1" }))).unwrap();
        assert_eq!(payload.order_id, "o1");
        assert!(payload.operation.is_none());
        assert!(!payload.force);

        let err = parse_payload::<OrderSyncPayload>(&job_with(json!({ "oops": true })))
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }
}
