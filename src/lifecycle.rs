//! Order lifecycle engine.
//!
//! Owns every transition of the canonical order: the payment gate in front
//! of FFN dispatch, outbound creation with both idempotency checks, cancel,
//! in-flight operational updates, application of polled FFN updates (the only
//! path that writes `fulfillment_state` from the warehouse side), hold and
//! release, and shipment back-propagation to the commerce platform.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::commerce::{CommerceFactory, FulfillmentRequest};
use crate::clients::ffn::{
    FfnAddress, FfnApi, FfnFactory, FfnProduct, OutboundItemPayload, OutboundPayload,
    OutboundUpdate, OutboundUpdateRequest, ReturnPayload, ReturnUpdate, UpdatesQuery,
};
use crate::error::SyncError;
use crate::models::{
    is_payment_safe, Address, FfnConfig, FulfillmentState, HoldReason, Order, OrderSyncLog,
    ReturnStatus, SyncOrigin, TrackingInfo,
};
use crate::queue::{Enqueuer, JobOptions, ORDER_SYNC_TO_COMMERCE, ORDER_SYNC_TO_FFN};
use crate::store::Database;

/// Overlap subtracted from poll cursors to absorb clock skew.
const POLL_OVERLAP: i64 = 600;
/// Updates younger than this are left for the next poll; the FFN view may
/// still be settling.
const POLL_LAG_SECS: i64 = 5;

pub fn ffn_sync_key(order_id: &str) -> String {
    format!("ffn-sync-{order_id}")
}

pub fn commerce_fulfill_key(order_id: &str) -> String {
    format!("commerce-fulfill-{order_id}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FfnSyncOutcome {
    /// A fresh outbound was created.
    Created(String),
    /// The order already carried an outbound id; nothing to do.
    AlreadyLinked(String),
    /// The FFN already knew the merchant number; we attached it.
    AttachedExisting(String),
}

#[derive(Debug, Clone, Default)]
pub struct OperationalUpdate {
    pub priority: Option<i8>,
    pub shipping_method_id: Option<String>,
    pub carrier: Option<String>,
    pub shipping_address: Option<Address>,
    pub warehouse_notes: Option<String>,
    pub picking_instructions: Option<String>,
    pub packing_instructions: Option<String>,
}

/// Evaluate the payment gate. `Ok` means FFN dispatch may proceed.
pub fn payment_gate(order: &Order, force: bool) -> Result<(), SyncError> {
    if force {
        return Ok(());
    }
    if order.is_cancelled {
        return Err(SyncError::BlockedByPaymentGate {
            reason: "order is cancelled".into(),
        });
    }
    if order.is_on_hold && order.hold_reason == Some(HoldReason::AwaitingPayment) {
        return Err(SyncError::BlockedByPaymentGate {
            reason: "on hold awaiting payment".into(),
        });
    }
    if !is_payment_safe(order.payment_status.as_deref()) && !order.payment_hold_override {
        return Err(SyncError::BlockedByPaymentGate {
            reason: format!(
                "payment status '{}' is not safe",
                order.payment_status.as_deref().unwrap_or("none")
            ),
        });
    }
    Ok(())
}

pub struct OrderLifecycle {
    db: Database,
    enqueuer: Arc<dyn Enqueuer>,
    ffn_factory: Arc<dyn FfnFactory>,
    commerce_factory: Arc<dyn CommerceFactory>,
}

impl OrderLifecycle {
    pub fn new(
        db: Database,
        enqueuer: Arc<dyn Enqueuer>,
        ffn_factory: Arc<dyn FfnFactory>,
        commerce_factory: Arc<dyn CommerceFactory>,
    ) -> Self {
        Self {
            db,
            enqueuer,
            ffn_factory,
            commerce_factory,
        }
    }

    fn ffn_for_tenant(&self, client_id: &str) -> Result<(FfnConfig, Arc<dyn FfnApi>), SyncError> {
        let config = self
            .db
            .get_ffn_config(client_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .filter(|c| c.is_active)
            .ok_or_else(|| {
                SyncError::MissingCredentials(format!("tenant {client_id} has no active FFN config"))
            })?;
        let client = self.ffn_factory.client_for(&config)?;
        Ok((config, client))
    }

    fn load_order(&self, order_id: &str) -> Result<Order, SyncError> {
        self.db
            .get_order(order_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or_else(|| SyncError::NotFound(format!("order {order_id}")))
    }

    fn log(&self, log: OrderSyncLog) {
        if let Err(e) = self.db.append_sync_log(&log) {
            warn!(order_id = %log.order_id, error = %e, "Failed to append sync log");
        }
    }

    fn order_log(
        order_id: &str,
        action: &str,
        target: &str,
        success: bool,
        error: Option<String>,
        external_id: Option<String>,
        changed_fields: Vec<String>,
        previous_state: Option<String>,
    ) -> OrderSyncLog {
        OrderSyncLog {
            id: Uuid::new_v4().to_string(),
            order_id: order_id.to_string(),
            action: action.to_string(),
            origin: SyncOrigin::Internal,
            target_platform: target.to_string(),
            success,
            error_message: error,
            external_id,
            changed_fields,
            previous_state,
            created_at: Utc::now(),
        }
    }

    // ---- FFN dispatch ----

    /// Create the outbound for an order, gated on payment state. `force` is
    /// reserved for administrative manual syncs.
    pub async fn sync_order_to_ffn(
        &self,
        order_id: &str,
        force: bool,
        job_id: &str,
    ) -> Result<FfnSyncOutcome, SyncError> {
        let order = self.load_order(order_id)?;

        // Idempotency check A: an attached outbound means a previous attempt
        // succeeded, whatever happened to the job afterwards.
        if let Some(existing) = &order.ffn_outbound_id {
            debug!(job_id, order_id, outbound_id = %existing, "Order already synced to FFN");
            return Ok(FfnSyncOutcome::AlreadyLinked(existing.clone()));
        }

        // The caller may have pre-filtered, but the gate is re-evaluated here
        // as defense in depth.
        payment_gate(&order, force)?;

        let (config, ffn) = self.ffn_for_tenant(&order.client_id)?;
        let warehouse_id = config.warehouse_id.clone().ok_or_else(|| {
            let _ = self.db.add_notification(
                &order.client_id,
                "missing_warehouse",
                "FFN configuration has no warehouse; orders cannot be dispatched",
            );
            SyncError::MissingWarehouse(order.client_id.clone())
        })?;
        let fulfiller_id = config.fulfiller_id.clone().unwrap_or_default();

        let merchant_number = order
            .order_number
            .clone()
            .unwrap_or_else(|| order.id.clone());

        // Idempotency check B: the outbound may exist from a crashed earlier
        // attempt whose success never landed in our store.
        if let Some(existing) = ffn.get_outbound_by_merchant_number(&merchant_number).await? {
            self.db
                .attach_ffn_outbound(&order.id, &existing.outbound_id, Utc::now(), false)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            self.log(Self::order_log(
                &order.id,
                "update",
                "ffn",
                true,
                Some("outbound already existed at FFN".into()),
                Some(existing.outbound_id.clone()),
                vec!["ffn_outbound_id".into(), "sync_status".into()],
                None,
            ));
            info!(job_id, order_id, outbound_id = %existing.outbound_id, "Attached existing FFN outbound");
            return Ok(FfnSyncOutcome::AttachedExisting(existing.outbound_id));
        }

        let (payload, has_bundle) =
            self.build_outbound_payload(&order, &merchant_number, &warehouse_id, &fulfiller_id)?;

        match ffn.create_outbound(&payload, true, has_bundle).await {
            Ok(outbound) => {
                self.db
                    .attach_ffn_outbound(&order.id, &outbound.outbound_id, Utc::now(), true)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                self.log(Self::order_log(
                    &order.id,
                    "create",
                    "ffn",
                    true,
                    None,
                    Some(outbound.outbound_id.clone()),
                    vec![
                        "ffn_outbound_id".into(),
                        "last_ffn_sync_at".into(),
                        "sync_status".into(),
                        "fulfillment_state".into(),
                    ],
                    Some(order.fulfillment_state.as_str().to_string()),
                ));
                info!(job_id, order_id, outbound_id = %outbound.outbound_id, "Created FFN outbound");
                Ok(FfnSyncOutcome::Created(outbound.outbound_id))
            }
            Err(e) => {
                let message = e.to_string();
                let _ = self.db.set_ffn_sync_error(&order.id, &message);
                self.log(Self::order_log(
                    &order.id,
                    "create",
                    "ffn",
                    false,
                    Some(message),
                    None,
                    Vec::new(),
                    None,
                ));
                Err(e)
            }
        }
    }

    fn build_outbound_payload(
        &self,
        order: &Order,
        merchant_number: &str,
        warehouse_id: &str,
        fulfiller_id: &str,
    ) -> Result<(OutboundPayload, bool), SyncError> {
        if order.items.is_empty() {
            return Err(SyncError::Validation(format!(
                "order {} has no items",
                order.id
            )));
        }

        let mut has_bundle = false;
        let mut items = Vec::with_capacity(order.items.len());
        for item in &order.items {
            let product = self
                .db
                .get_product_by_sku(&order.client_id, &item.sku)
                .map_err(|e| SyncError::Storage(e.to_string()))?;
            if let Some(product) = &product {
                if product.is_bundle {
                    has_bundle = true;
                }
            }
            items.push(OutboundItemPayload {
                merchant_sku: item.sku.clone(),
                jfsku: product.and_then(|p| p.ffn_product_id),
                outbound_item_id: item.id.clone(),
                name: item.product_name.clone(),
                quantity: item.quantity,
                unit_price: item.unit_price,
            });
        }

        let address = &order.shipping_address;
        let payload = OutboundPayload {
            merchant_outbound_number: merchant_number.to_string(),
            warehouse_id: warehouse_id.to_string(),
            fulfiller_id: fulfiller_id.to_string(),
            currency: order.currency.clone(),
            customer_order_number: merchant_number.to_string(),
            order_date: order.created_at,
            shipping_address: FfnAddress {
                firstname: address.firstname.clone(),
                lastname: address.lastname.clone(),
                company: address.company.clone(),
                street: address.street.clone(),
                addition: address.addition.clone(),
                city: address.city.clone(),
                zip: address.zip.clone(),
                country: address.country.clone(),
                phone: address.phone.clone(),
                email: address.email.clone(),
            },
            items,
            shipping_method_id: None,
            shipping_type: Some("Standard".to_string()),
            priority: order.priority_level,
            note: None,
            attributes: None,
        };
        Ok((payload, has_bundle))
    }

    /// Cancel an order at the FFN. The warehouse axis only flips to CANCELED
    /// when the FFN confirms the outbound is terminally cancelled.
    pub async fn cancel_order_in_ffn(
        &self,
        order_id: &str,
        cancelled_by: &str,
        reason: &str,
        job_id: &str,
    ) -> Result<(), SyncError> {
        let order = self.load_order(order_id)?;
        let outbound_id = order.ffn_outbound_id.clone().ok_or_else(|| {
            SyncError::Validation(format!("order {order_id} has no FFN outbound to cancel"))
        })?;

        let (_, ffn) = self.ffn_for_tenant(&order.client_id)?;

        match ffn.cancel_outbound(&outbound_id, reason).await {
            Ok(()) => {
                let confirmed = match ffn.get_outbound(&outbound_id).await {
                    Ok(outbound) => outbound.status == "CANCELLED",
                    Err(e) => {
                        debug!(job_id, order_id, error = %e, "Could not confirm FFN cancel state");
                        false
                    }
                };
                self.db
                    .mark_cancelled(&order.id, cancelled_by, Some(reason), Utc::now(), confirmed)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                self.log(Self::order_log(
                    &order.id,
                    "cancel",
                    "ffn",
                    true,
                    None,
                    Some(outbound_id),
                    vec!["is_cancelled".into(), "fulfillment_state".into()],
                    Some(order.fulfillment_state.as_str().to_string()),
                ));
                info!(job_id, order_id, confirmed, "Cancelled order in FFN");
                Ok(())
            }
            Err(e) => {
                self.log(Self::order_log(
                    &order.id,
                    "cancel",
                    "ffn",
                    false,
                    Some(e.to_string()),
                    Some(outbound_id),
                    Vec::new(),
                    None,
                ));
                Err(e)
            }
        }
    }

    /// In-flight update of outbound parameters. Refused once the outbound
    /// passed SHIPPED.
    pub async fn update_outbound_operational(
        &self,
        order_id: &str,
        update: OperationalUpdate,
        job_id: &str,
    ) -> Result<(), SyncError> {
        let order = self.load_order(order_id)?;

        let past_update_window = matches!(
            order.fulfillment_state,
            FulfillmentState::Shipped
                | FulfillmentState::InTransit
                | FulfillmentState::Delivered
                | FulfillmentState::FailedDelivery
                | FulfillmentState::ReturnedToSender
                | FulfillmentState::Canceled
        );
        if past_update_window {
            return Err(SyncError::NotUpdateable {
                current_state: order.fulfillment_state,
            });
        }

        if let Some(outbound_id) = &order.ffn_outbound_id {
            let (_, ffn) = self.ffn_for_tenant(&order.client_id)?;
            let request = OutboundUpdateRequest {
                priority: update.priority,
                shipping_method_id: update.shipping_method_id.clone(),
                internal_note: update.warehouse_notes.clone(),
                external_note: None,
                shipping_address: update.shipping_address.as_ref().map(|a| FfnAddress {
                    firstname: a.firstname.clone(),
                    lastname: a.lastname.clone(),
                    company: a.company.clone(),
                    street: a.street.clone(),
                    addition: a.addition.clone(),
                    city: a.city.clone(),
                    zip: a.zip.clone(),
                    country: a.country.clone(),
                    phone: a.phone.clone(),
                    email: a.email.clone(),
                }),
                picking_instructions: update.picking_instructions.clone(),
                packing_instructions: update.packing_instructions.clone(),
            };
            ffn.update_outbound(outbound_id, &request).await?;
        }

        self.db
            .apply_operational_update(
                &order.id,
                update.priority,
                update.carrier.as_deref(),
                update.shipping_address.as_ref(),
                Utc::now(),
            )
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        self.log(Self::order_log(
            &order.id,
            "update",
            "ffn",
            true,
            None,
            order.ffn_outbound_id.clone(),
            vec!["operational_fields".into()],
            None,
        ));
        debug!(job_id, order_id, "Applied operational update");
        Ok(())
    }

    // ---- poll-driven updates from FFN ----

    /// Drain outbound updates for one tenant and apply them. Returns the
    /// number of updates applied.
    pub async fn poll_outbound_updates(
        &self,
        client_id: &str,
        ffn: &dyn FfnApi,
        job_id: &str,
    ) -> Result<usize, SyncError> {
        let now = Utc::now();
        let cursor = self
            .db
            .get_cursor(client_id, "jtl-poll")
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .unwrap_or(now - Duration::hours(24));

        let mut query = UpdatesQuery {
            from: cursor - Duration::seconds(POLL_OVERLAP),
            to: now - Duration::seconds(POLL_LAG_SECS),
            page: 1,
        };

        let mut applied = 0usize;
        loop {
            let page = ffn.get_outbound_updates(&query).await?;
            for update in &page.data {
                if self.apply_ffn_update(update, ffn, job_id).await? {
                    applied += 1;
                }
            }
            if !page.more_data_available {
                break;
            }
            query.page += 1;
        }

        self.db
            .set_cursor(client_id, "jtl-poll", query.to)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(applied)
    }

    /// Apply one polled update. This is the only path that writes
    /// `fulfillment_state` on behalf of the warehouse. Returns whether the
    /// order changed.
    pub async fn apply_ffn_update(
        &self,
        update: &OutboundUpdate,
        ffn: &dyn FfnApi,
        job_id: &str,
    ) -> Result<bool, SyncError> {
        let Some(order) = self
            .db
            .get_order_by_ffn_outbound(&update.outbound_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            debug!(job_id, outbound_id = %update.outbound_id, "Update for unknown outbound, skipping");
            return Ok(false);
        };

        let next = FulfillmentState::from_ffn_status(&update.status);
        if !order.fulfillment_state.can_transition_to(next) {
            debug!(
                job_id,
                order_id = %order.id,
                current = %order.fulfillment_state,
                next = %next,
                "Dropping non-advancing FFN update"
            );
            return Ok(false);
        }

        let now = update.updated_at.unwrap_or_else(Utc::now);
        self.db
            .set_fulfillment_state(&order.id, next, SyncOrigin::Ffn, now)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        let mut changed = vec!["fulfillment_state".into()];

        if next == FulfillmentState::Shipped {
            let packages = self.fetch_tracking(&update.outbound_id, ffn).await;
            let shipped_at = packages
                .first()
                .and_then(|(at, _)| *at)
                .unwrap_or(now);
            let infos: Vec<TrackingInfo> = packages.into_iter().map(|(_, info)| info).collect();
            if !infos.is_empty() {
                self.db
                    .set_tracking(&order.id, &infos, shipped_at)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                changed.extend([
                    "tracking_number".into(),
                    "carrier".into(),
                    "shipped_at".into(),
                ]);
            }

            // Make the shipment visible on the commerce side.
            let enqueued = self.enqueuer.enqueue(
                ORDER_SYNC_TO_COMMERCE,
                json!({ "order_id": order.id, "operation": "fulfill" }),
                JobOptions {
                    singleton_key: Some(commerce_fulfill_key(&order.id)),
                    retry_limit: 3,
                    retry_delay_secs: 30,
                    retry_backoff: true,
                    ..Default::default()
                },
            )?;
            if enqueued.is_none() {
                debug!(job_id, order_id = %order.id, "Commerce fulfill already queued, skipped");
            }
        }

        let mut log = Self::order_log(
            &order.id,
            "update",
            "internal",
            true,
            None,
            Some(update.outbound_id.clone()),
            changed,
            Some(order.fulfillment_state.as_str().to_string()),
        );
        log.origin = SyncOrigin::Ffn;
        self.log(log);

        info!(
            job_id,
            order_id = %order.id,
            from = %order.fulfillment_state,
            to = %next,
            "Applied FFN outbound update"
        );
        Ok(true)
    }

    /// Shipping notifications for one outbound, one entry per parcel.
    async fn fetch_tracking(
        &self,
        outbound_id: &str,
        ffn: &dyn FfnApi,
    ) -> Vec<(Option<DateTime<Utc>>, TrackingInfo)> {
        match ffn.get_shipping_notifications(outbound_id).await {
            Ok(notifications) => notifications
                .into_iter()
                .filter_map(|n| {
                    let tracking_number = n.tracking_id()?.to_string();
                    Some((
                        n.created_at,
                        TrackingInfo {
                            tracking_number,
                            carrier: n.freight_option.clone(),
                            tracking_url: n.tracking_url.clone(),
                            estimated_delivery: n.estimated_delivery_date,
                        },
                    ))
                })
                .collect(),
            Err(e) => {
                warn!(outbound_id, error = %e, "Failed to fetch shipping notifications");
                Vec::new()
            }
        }
    }

    /// Drain return updates for one tenant.
    pub async fn poll_return_updates(
        &self,
        client_id: &str,
        ffn: &dyn FfnApi,
        job_id: &str,
    ) -> Result<usize, SyncError> {
        let now = Utc::now();
        let cursor = self
            .db
            .get_cursor(client_id, "return-poll")
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .unwrap_or(now - Duration::hours(24));

        let mut query = UpdatesQuery {
            from: cursor - Duration::seconds(POLL_OVERLAP),
            to: now - Duration::seconds(POLL_LAG_SECS),
            page: 1,
        };

        let mut applied = 0usize;
        loop {
            let page = ffn.get_return_updates(&query).await?;
            for update in &page.data {
                if self.apply_return_update(update, job_id)? {
                    applied += 1;
                }
            }
            if !page.more_data_available {
                break;
            }
            query.page += 1;
        }

        self.db
            .set_cursor(client_id, "return-poll", query.to)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        Ok(applied)
    }

    fn apply_return_update(&self, update: &ReturnUpdate, job_id: &str) -> Result<bool, SyncError> {
        let Some(ret) = self
            .db
            .get_return_by_ffn_id(&update.return_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
        else {
            return Ok(false);
        };

        let status = map_ffn_return_status(&update.status);
        if status == ret.status {
            return Ok(false);
        }
        self.db
            .set_return_status(&ret.id, status)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        info!(job_id, return_id = %ret.id, status = status.as_str(), "Applied FFN return update");
        Ok(true)
    }

    // ---- commerce back-propagation ----

    /// Push the shipment to the commerce platform so the customer sees
    /// "fulfilled" plus tracking.
    pub async fn sync_shipment_to_commerce(
        &self,
        order_id: &str,
        job_id: &str,
    ) -> Result<(), SyncError> {
        let order = self.load_order(order_id)?;
        let channel_id = order
            .channel_id
            .clone()
            .ok_or_else(|| SyncError::NotFound(format!("order {order_id} has no channel")))?;
        let channel = self
            .db
            .get_channel(&channel_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or_else(|| SyncError::NotFound(format!("channel {channel_id}")))?;

        let client = self.commerce_factory.client_for(&channel)?;
        let tracking = FulfillmentRequest {
            tracking_number: order.tracking_number.clone(),
            carrier: order.carrier.clone(),
            tracking_url: order.tracking_url.clone(),
            notify_customer: true,
        };

        match client
            .create_fulfillment(&order.external_order_id, &tracking)
            .await
        {
            Ok(fulfillment_id) => {
                self.db
                    .set_commerce_fulfilled(&order.id, Utc::now())
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                let mut log = Self::order_log(
                    &order.id,
                    "fulfill",
                    channel.channel_type.as_str(),
                    true,
                    None,
                    fulfillment_id,
                    vec!["last_synced_to_commerce".into()],
                    None,
                );
                log.origin = SyncOrigin::Internal;
                self.log(log);
                info!(job_id, order_id, "Propagated shipment to commerce");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                let _ = self.db.set_commerce_sync_error(&order.id, &message);
                self.log(Self::order_log(
                    &order.id,
                    "fulfill",
                    channel.channel_type.as_str(),
                    false,
                    Some(message),
                    None,
                    Vec::new(),
                    None,
                ));
                Err(e)
            }
        }
    }

    // ---- holds ----

    /// Park an order, both canonically and (when dispatched) at the FFN by
    /// dropping its priority to the floor.
    pub async fn hold_order(
        &self,
        order_id: &str,
        reason: HoldReason,
        placed_by: &str,
        notes: Option<&str>,
        job_id: &str,
    ) -> Result<(), SyncError> {
        let order = self.load_order(order_id)?;
        self.db
            .place_hold(&order.id, reason, placed_by, Utc::now())
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if let Some(outbound_id) = &order.ffn_outbound_id {
            let (_, ffn) = self.ffn_for_tenant(&order.client_id)?;
            ffn.hold_outbound(outbound_id, reason.as_str(), notes).await?;
            self.db
                .set_priority(&order.id, -5, Utc::now())
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        self.log(Self::order_log(
            &order.id,
            "hold",
            "ffn",
            true,
            None,
            order.ffn_outbound_id.clone(),
            vec!["is_on_hold".into(), "hold_reason".into()],
            None,
        ));
        info!(job_id, order_id, reason = reason.as_str(), "Order placed on hold");
        Ok(())
    }

    /// Release a hold. `manual` marks an operator action: releasing an
    /// AWAITING_PAYMENT hold manually sets the payment override and, when the
    /// order never reached the FFN, queues a dispatch right away.
    pub async fn release_order(
        &self,
        order_id: &str,
        released_by: &str,
        manual: bool,
        job_id: &str,
    ) -> Result<(), SyncError> {
        let order = self.load_order(order_id)?;
        if !order.is_on_hold {
            return Err(SyncError::Validation(format!(
                "order {order_id} is not on hold"
            )));
        }
        let was_awaiting_payment = order.hold_reason == Some(HoldReason::AwaitingPayment);
        let override_payment = was_awaiting_payment && manual;

        self.db
            .release_hold(&order.id, released_by, Utc::now(), override_payment)
            .map_err(|e| SyncError::Storage(e.to_string()))?;

        if let Some(outbound_id) = &order.ffn_outbound_id {
            let (_, ffn) = self.ffn_for_tenant(&order.client_id)?;
            ffn.release_outbound(outbound_id, 0).await?;
            self.db
                .set_priority(&order.id, 0, Utc::now())
                .map_err(|e| SyncError::Storage(e.to_string()))?;
        }

        if override_payment {
            self.log(Self::order_log(
                &order.id,
                "payment_hold_manually_released",
                "internal",
                true,
                None,
                None,
                vec![
                    "is_on_hold".into(),
                    "payment_hold_override".into(),
                    "hold_released_by".into(),
                ],
                Some(format!(
                    "payment_status={}",
                    order.payment_status.as_deref().unwrap_or("none")
                )),
            ));

            if order.ffn_outbound_id.is_none() {
                let queued = self.enqueuer.enqueue(
                    ORDER_SYNC_TO_FFN,
                    json!({ "order_id": order.id, "operation": "create" }),
                    JobOptions {
                        singleton_key: Some(ffn_sync_key(&order.id)),
                        priority: 1,
                        retry_limit: 3,
                        retry_delay_secs: 60,
                        retry_backoff: true,
                        ..Default::default()
                    },
                )?;
                debug!(job_id, order_id, queued = queued.is_some(), "Queued FFN sync after manual release");
            }
        }

        self.log(Self::order_log(
            &order.id,
            "release_hold",
            "ffn",
            true,
            None,
            order.ffn_outbound_id.clone(),
            vec!["is_on_hold".into(), "hold_released_at".into()],
            None,
        ));
        info!(job_id, order_id, manual, "Order hold released");
        Ok(())
    }

    // ---- products & returns toward FFN ----

    /// Mirror a canonical product into the FFN: create when unknown, update
    /// when already there.
    pub async fn sync_product_to_ffn(&self, product_id: &str, job_id: &str) -> Result<(), SyncError> {
        let product = self
            .db
            .get_product(product_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or_else(|| SyncError::NotFound(format!("product {product_id}")))?;

        let (_, ffn) = self.ffn_for_tenant(&product.client_id)?;

        let payload = FfnProduct {
            jfsku: product.ffn_product_id.clone(),
            merchant_sku: product.merchant_sku.clone(),
            name: product.name.clone(),
            description: product.description.clone(),
            unit_price: product.price,
            weight: product.weight,
        };

        let result = async {
            if let Some(jfsku) = &product.ffn_product_id {
                ffn.update_product(jfsku, &payload).await?;
                return Ok(jfsku.clone());
            }
            if let Some(existing) = ffn.get_product_by_merchant_sku(&product.merchant_sku).await? {
                if let Some(jfsku) = existing.jfsku {
                    return Ok(jfsku);
                }
            }
            let created = ffn.create_product(&payload).await?;
            created.jfsku.ok_or_else(|| {
                SyncError::Validation("FFN product response without jfsku".into())
            })
        }
        .await;

        match result {
            Ok(jfsku) => {
                self.db
                    .set_product_ffn_link(&product.id, &jfsku, crate::models::SyncStatus::Synced)
                    .map_err(|e| SyncError::Storage(e.to_string()))?;
                info!(job_id, product_id, jfsku = %jfsku, "Product synced to FFN");
                Ok(())
            }
            Err(e) => {
                let _ = self
                    .db
                    .set_product_sync_status(&product.id, crate::models::SyncStatus::Error);
                Err(e)
            }
        }
    }

    /// Announce a return to the FFN.
    pub async fn sync_return_to_ffn(&self, return_id: &str, job_id: &str) -> Result<(), SyncError> {
        let ret = self
            .db
            .get_return(return_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?
            .ok_or_else(|| SyncError::NotFound(format!("return {return_id}")))?;

        if ret.ffn_return_id.is_some() {
            debug!(job_id, return_id, "Return already announced to FFN");
            return Ok(());
        }

        let order = self.load_order(&ret.order_id)?;
        let (config, ffn) = self.ffn_for_tenant(&ret.client_id)?;
        let warehouse_id = config
            .warehouse_id
            .clone()
            .ok_or_else(|| SyncError::MissingWarehouse(ret.client_id.clone()))?;

        let payload = ReturnPayload {
            merchant_return_number: format!(
                "R-{}",
                ret.external_refund_id.as_deref().unwrap_or(&ret.id)
            ),
            warehouse_id,
            outbound_id: order.ffn_outbound_id.clone(),
            items: ret
                .items
                .iter()
                .map(|item| crate::clients::ffn::InboundItemPayload {
                    merchant_sku: item.sku.clone(),
                    quantity: item.quantity,
                })
                .collect(),
            note: ret.reason.clone(),
        };

        let created = ffn.create_return(&payload).await?;
        self.db
            .set_return_ffn_link(&ret.id, &created.return_id)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        info!(job_id, return_id, ffn_return_id = %created.return_id, "Return announced to FFN");
        Ok(())
    }

    /// All parcels of an order's shipment.
    pub fn get_all_tracking_info(&self, order_id: &str) -> Result<Vec<TrackingInfo>, SyncError> {
        Ok(self.load_order(order_id)?.tracking_packages)
    }
}

fn map_ffn_return_status(status: &str) -> ReturnStatus {
    match status {
        "INSPECTED" | "IN_REVIEW" => ReturnStatus::Inspected,
        "ACCEPTED" | "COMPLETED" => ReturnStatus::Accepted,
        "REFUNDED" => ReturnStatus::Refunded,
        _ => ReturnStatus::Received,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, SyncStatus};
    use crate::store::orders::tests::test_order;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // A scripted FFN fake; unused surface answers with empty defaults.
    #[derive(Default)]
    struct FakeFfn {
        created: AtomicUsize,
        known_numbers: Mutex<HashMap<String, String>>,
        notifications: Mutex<HashMap<String, Vec<crate::clients::ffn::ShippingNotification>>>,
        outbound_status: Mutex<HashMap<String, String>>,
        fail_create: Mutex<Option<u16>>,
        holds: AtomicUsize,
        releases: AtomicUsize,
    }

    #[async_trait]
    impl FfnApi for FakeFfn {
        async fn create_outbound(
            &self,
            payload: &OutboundPayload,
            _oversale: bool,
            _auto_complete: bool,
        ) -> Result<crate::clients::ffn::Outbound, SyncError> {
            if let Some(status) = *self.fail_create.lock() {
                return Err(SyncError::FfnApi {
                    status,
                    body: "scripted failure".into(),
                });
            }
            let n = self.created.fetch_add(1, Ordering::SeqCst);
            Ok(crate::clients::ffn::Outbound {
                outbound_id: format!("OB-{n}"),
                merchant_outbound_number: payload.merchant_outbound_number.clone(),
                status: "NEW".into(),
                priority: payload.priority,
            })
        }

        async fn get_outbound(
            &self,
            outbound_id: &str,
        ) -> Result<crate::clients::ffn::Outbound, SyncError> {
            let status = self
                .outbound_status
                .lock()
                .get(outbound_id)
                .cloned()
                .unwrap_or_else(|| "NEW".into());
            Ok(crate::clients::ffn::Outbound {
                outbound_id: outbound_id.to_string(),
                merchant_outbound_number: String::new(),
                status,
                priority: 0,
            })
        }

        async fn get_outbound_by_merchant_number(
            &self,
            merchant_number: &str,
        ) -> Result<Option<crate::clients::ffn::Outbound>, SyncError> {
            Ok(self.known_numbers.lock().get(merchant_number).map(|id| {
                crate::clients::ffn::Outbound {
                    outbound_id: id.clone(),
                    merchant_outbound_number: merchant_number.to_string(),
                    status: "NEW".into(),
                    priority: 0,
                }
            }))
        }

        async fn update_outbound(
            &self,
            _outbound_id: &str,
            _update: &OutboundUpdateRequest,
        ) -> Result<(), SyncError> {
            Ok(())
        }

        async fn cancel_outbound(&self, outbound_id: &str, _reason: &str) -> Result<(), SyncError> {
            self.outbound_status
                .lock()
                .insert(outbound_id.to_string(), "CANCELLED".into());
            Ok(())
        }

        async fn get_outbound_updates(
            &self,
            _query: &UpdatesQuery,
        ) -> Result<crate::clients::ffn::UpdatesPage<OutboundUpdate>, SyncError> {
            Ok(Default::default())
        }

        async fn get_shipping_notifications(
            &self,
            outbound_id: &str,
        ) -> Result<Vec<crate::clients::ffn::ShippingNotification>, SyncError> {
            Ok(self
                .notifications
                .lock()
                .get(outbound_id)
                .cloned()
                .unwrap_or_default())
        }

        async fn create_product(&self, product: &FfnProduct) -> Result<FfnProduct, SyncError> {
            let mut created = product.clone();
            created.jfsku = Some(format!("JF-{}", product.merchant_sku));
            Ok(created)
        }

        async fn update_product(&self, _jfsku: &str, _product: &FfnProduct) -> Result<(), SyncError> {
            Ok(())
        }

        async fn get_product_by_merchant_sku(
            &self,
            _merchant_sku: &str,
        ) -> Result<Option<FfnProduct>, SyncError> {
            Ok(None)
        }

        async fn get_all_products_with_stock(
            &self,
        ) -> Result<Vec<crate::clients::ffn::StockLevel>, SyncError> {
            Ok(Vec::new())
        }

        async fn create_return(
            &self,
            payload: &ReturnPayload,
        ) -> Result<crate::clients::ffn::FfnReturn, SyncError> {
            Ok(crate::clients::ffn::FfnReturn {
                return_id: format!("RET-{}", payload.merchant_return_number),
                status: "RECEIVED".into(),
            })
        }

        async fn get_return_updates(
            &self,
            _query: &UpdatesQuery,
        ) -> Result<crate::clients::ffn::UpdatesPage<ReturnUpdate>, SyncError> {
            Ok(Default::default())
        }

        async fn get_inbound_updates(
            &self,
            _query: &UpdatesQuery,
        ) -> Result<crate::clients::ffn::UpdatesPage<crate::clients::ffn::InboundUpdate>, SyncError>
        {
            Ok(Default::default())
        }

        async fn hold_outbound(
            &self,
            _outbound_id: &str,
            _reason: &str,
            _notes: Option<&str>,
        ) -> Result<(), SyncError> {
            self.holds.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn release_outbound(&self, _outbound_id: &str, _priority: i8) -> Result<(), SyncError> {
            self.releases.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn force_refresh(&self) -> Result<(), SyncError> {
            Ok(())
        }
    }

    struct FakeFfnFactory {
        ffn: Arc<FakeFfn>,
    }

    impl FfnFactory for FakeFfnFactory {
        fn client_for(&self, _config: &FfnConfig) -> Result<Arc<dyn FfnApi>, SyncError> {
            Ok(self.ffn.clone())
        }
    }

    struct NoCommerce;
    impl CommerceFactory for NoCommerce {
        fn client_for(
            &self,
            _channel: &crate::models::Channel,
        ) -> Result<Arc<dyn crate::clients::commerce::CommerceApi>, SyncError> {
            Err(SyncError::NotFound("no commerce in this test".into()))
        }
    }

    #[derive(Default)]
    struct RecordingEnqueuer {
        jobs: Mutex<Vec<(String, serde_json::Value, JobOptions)>>,
    }

    impl Enqueuer for RecordingEnqueuer {
        fn enqueue(
            &self,
            queue: &str,
            payload: serde_json::Value,
            opts: JobOptions,
        ) -> Result<Option<String>, SyncError> {
            self.jobs.lock().push((queue.to_string(), payload, opts));
            Ok(Some(Uuid::new_v4().to_string()))
        }
    }

    struct Harness {
        db: Database,
        ffn: Arc<FakeFfn>,
        enqueuer: Arc<RecordingEnqueuer>,
        engine: OrderLifecycle,
        tenant_id: String,
    }

    fn harness() -> Harness {
        let db = Database::open_in_memory().unwrap();
        let tenant = db.insert_tenant("acme").unwrap();
        let config = FfnConfig {
            id: Uuid::new_v4().to_string(),
            client_id: tenant.id.clone(),
            oauth_client_id: "cid".into(),
            oauth_client_secret: "sec".into(),
            access_token: None,
            refresh_token: Some("r".into()),
            token_expires_at: None,
            environment: crate::models::FfnEnvironment::Sandbox,
            fulfiller_id: Some("F1".into()),
            warehouse_id: Some("W1".into()),
            is_active: true,
        };
        db.upsert_ffn_config(&config).unwrap();

        let ffn = Arc::new(FakeFfn::default());
        let enqueuer = Arc::new(RecordingEnqueuer::default());
        let engine = OrderLifecycle::new(
            db.clone(),
            enqueuer.clone(),
            Arc::new(FakeFfnFactory { ffn: ffn.clone() }),
            Arc::new(NoCommerce),
        );
        Harness {
            db,
            ffn,
            enqueuer,
            engine,
            tenant_id: tenant.id,
        }
    }

    #[test]
    fn gate_blocks_unsafe_payment() {
        let mut order = test_order("t", "1");
        order.payment_status = Some("pending".into());
        assert!(payment_gate(&order, false).is_err());
        assert!(payment_gate(&order, true).is_ok());

        order.payment_hold_override = true;
        assert!(payment_gate(&order, false).is_ok());
    }

    #[test]
    fn gate_blocks_payment_holds_and_cancelled_orders() {
        let mut order = test_order("t", "1");
        order.is_on_hold = true;
        order.hold_reason = Some(HoldReason::AwaitingPayment);
        assert!(payment_gate(&order, false).is_err());

        // A non-payment hold does not block dispatch by itself.
        order.hold_reason = Some(HoldReason::ManualReview);
        assert!(payment_gate(&order, false).is_ok());

        let mut cancelled = test_order("t", "2");
        cancelled.is_cancelled = true;
        assert!(payment_gate(&cancelled, false).is_err());
    }

    #[tokio::test]
    async fn create_outbound_happy_path() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();

        let outcome = h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();
        assert_eq!(outcome, FfnSyncOutcome::Created("OB-0".into()));

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.ffn_outbound_id.as_deref(), Some("OB-0"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert_eq!(stored.fulfillment_state, FulfillmentState::Pending);

        let logs = h.db.list_sync_logs(&order.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "create");
        assert!(logs[0].success);
    }

    #[tokio::test]
    async fn second_sync_is_a_noop() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();

        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();
        let again = h.engine.sync_order_to_ffn(&order.id, false, "job-2").await.unwrap();
        assert_eq!(again, FfnSyncOutcome::AlreadyLinked("OB-0".into()));
        assert_eq!(h.ffn.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn existing_merchant_number_attaches_without_create() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.ffn.known_numbers
            .lock()
            .insert("15990".into(), "OB-EXISTING".into());

        let outcome = h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();
        assert_eq!(outcome, FfnSyncOutcome::AttachedExisting("OB-EXISTING".into()));
        assert_eq!(h.ffn.created.load(Ordering::SeqCst), 0);

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.ffn_outbound_id.as_deref(), Some("OB-EXISTING"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn gate_blocks_inside_the_engine_too() {
        let h = harness();
        let mut order = test_order(&h.tenant_id, "15990");
        order.payment_status = Some("pending".into());
        h.db.insert_order(&order).unwrap();

        let err = h
            .engine
            .sync_order_to_ffn(&order.id, false, "job-1")
            .await
            .unwrap_err();
        assert!(err.is_gate_block());
        assert_eq!(h.ffn.created.load(Ordering::SeqCst), 0);
        assert!(h.db.get_order(&order.id).unwrap().unwrap().ffn_outbound_id.is_none());
    }

    #[tokio::test]
    async fn create_failure_records_error_state() {
        let h = harness();
        *h.ffn.fail_create.lock() = Some(500);
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();

        let err = h
            .engine
            .sync_order_to_ffn(&order.id, false, "job-1")
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Error);
        assert!(stored.ffn_sync_error.is_some());
        let logs = h.db.list_sync_logs(&order.id).unwrap();
        assert!(!logs[0].success);
    }

    #[tokio::test]
    async fn missing_warehouse_notifies_tenant() {
        let h = harness();
        let mut config = h.db.get_ffn_config(&h.tenant_id).unwrap().unwrap();
        config.warehouse_id = None;
        h.db.upsert_ffn_config(&config).unwrap();

        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();

        let err = h
            .engine
            .sync_order_to_ffn(&order.id, false, "job-1")
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::MissingWarehouse(_)));
        assert!(!err.is_retryable());
        assert_eq!(h.db.list_unread_notifications(&h.tenant_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn shipped_update_captures_tracking_and_queues_commerce_fulfill() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();

        h.ffn.notifications.lock().insert(
            "OB-0".into(),
            vec![crate::clients::ffn::ShippingNotification {
                freight_option: Some("DHL".into()),
                estimated_delivery_date: None,
                tracking_url: Some("https://dhl/00340123456789".into()),
                identifiers: vec![crate::clients::ffn::ShippingIdentifier {
                    kind: "TrackingId".into(),
                    value: "00340123456789".into(),
                    name: None,
                }],
                created_at: None,
            }],
        );

        let update = OutboundUpdate {
            outbound_id: "OB-0".into(),
            status: "SHIPPED".into(),
            updated_at: Some(Utc::now()),
        };
        let changed = h
            .engine
            .apply_ffn_update(&update, h.ffn.as_ref(), "job-2")
            .await
            .unwrap();
        assert!(changed);

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert_eq!(stored.fulfillment_state, FulfillmentState::Shipped);
        assert_eq!(stored.tracking_number.as_deref(), Some("00340123456789"));
        assert_eq!(stored.carrier.as_deref(), Some("DHL"));
        assert_eq!(
            stored.tracking_url.as_deref(),
            Some("https://dhl/00340123456789")
        );
        assert!(stored.shipped_at.is_some());
        assert_eq!(stored.last_operational_update_by, Some(SyncOrigin::Ffn));

        let jobs = h.enqueuer.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, ORDER_SYNC_TO_COMMERCE);
        assert_eq!(jobs[0].1["operation"], "fulfill");
        assert_eq!(
            jobs[0].2.singleton_key.as_deref(),
            Some(commerce_fulfill_key(&order.id).as_str())
        );
    }

    #[tokio::test]
    async fn regressive_updates_are_dropped() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();

        let ship = OutboundUpdate {
            outbound_id: "OB-0".into(),
            status: "SHIPPED".into(),
            updated_at: None,
        };
        assert!(h.engine.apply_ffn_update(&ship, h.ffn.as_ref(), "job-2").await.unwrap());

        // A late IN_PICK replay must not rewind the state.
        let stale = OutboundUpdate {
            outbound_id: "OB-0".into(),
            status: "IN_PICK".into(),
            updated_at: None,
        };
        assert!(!h.engine.apply_ffn_update(&stale, h.ffn.as_ref(), "job-3").await.unwrap());
        assert_eq!(
            h.db.get_order(&order.id).unwrap().unwrap().fulfillment_state,
            FulfillmentState::Shipped
        );
    }

    #[tokio::test]
    async fn cancel_confirms_terminality() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();

        h.engine
            .cancel_order_in_ffn(&order.id, "admin", "customer request", "job-2")
            .await
            .unwrap();

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert!(stored.is_cancelled);
        assert_eq!(stored.status, OrderStatus::Cancelled);
        // The fake flips the outbound to CANCELLED on cancel, so terminality
        // was confirmed.
        assert_eq!(stored.fulfillment_state, FulfillmentState::Canceled);
    }

    #[tokio::test]
    async fn operational_update_refused_after_shipped() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();
        h.db.set_fulfillment_state(&order.id, FulfillmentState::Shipped, SyncOrigin::Ffn, Utc::now())
            .unwrap();

        let err = h
            .engine
            .update_outbound_operational(
                &order.id,
                OperationalUpdate {
                    priority: Some(3),
                    ..Default::default()
                },
                "job-2",
            )
            .await
            .unwrap_err();
        match err {
            SyncError::NotUpdateable { current_state } => {
                assert_eq!(current_state, FulfillmentState::Shipped)
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn manual_payment_release_sets_override_and_queues_sync() {
        let h = harness();
        let mut order = test_order(&h.tenant_id, "15990");
        order.payment_status = Some("pending".into());
        h.db.insert_order(&order).unwrap();
        h.db.place_hold(&order.id, HoldReason::AwaitingPayment, "webhook", Utc::now())
            .unwrap();

        h.engine
            .release_order(&order.id, "admin", true, "job-1")
            .await
            .unwrap();

        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert!(!stored.is_on_hold);
        assert!(stored.payment_hold_override);

        let logs = h.db.list_sync_logs(&order.id).unwrap();
        assert!(logs.iter().any(|l| l.action == "payment_hold_manually_released"));
        assert!(logs.iter().any(|l| l.action == "release_hold"));

        let jobs = h.enqueuer.jobs.lock();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].0, ORDER_SYNC_TO_FFN);
        assert_eq!(jobs[0].2.priority, 1);
        assert_eq!(jobs[0].2.retry_limit, 3);
        assert_eq!(jobs[0].2.retry_delay_secs, 60);
        assert!(jobs[0].2.retry_backoff);
    }

    #[tokio::test]
    async fn hold_mirrors_to_ffn_when_dispatched() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();

        h.engine
            .hold_order(&order.id, HoldReason::AddressIssue, "admin", Some("bad zip"), "job-2")
            .await
            .unwrap();
        assert_eq!(h.ffn.holds.load(Ordering::SeqCst), 1);
        let stored = h.db.get_order(&order.id).unwrap().unwrap();
        assert!(stored.is_on_hold);
        assert_eq!(stored.priority_level, -5);

        h.engine
            .release_order(&order.id, "admin", true, "job-3")
            .await
            .unwrap();
        assert_eq!(h.ffn.releases.load(Ordering::SeqCst), 1);
        let released = h.db.get_order(&order.id).unwrap().unwrap();
        assert_eq!(released.priority_level, 0);
        // Not an AWAITING_PAYMENT hold, so no override and no queued sync.
        assert!(!released.payment_hold_override);
        assert!(h.enqueuer.jobs.lock().is_empty());
    }

    #[tokio::test]
    async fn product_sync_creates_and_links() {
        let h = harness();
        let product = h
            .db
            .upsert_product(&crate::store::products::new_product(
                &h.tenant_id,
                "ABC",
                "Widget",
                19.99,
            ))
            .unwrap();

        h.engine.sync_product_to_ffn(&product.id, "job-1").await.unwrap();

        let stored = h.db.get_product(&product.id).unwrap().unwrap();
        assert_eq!(stored.ffn_product_id.as_deref(), Some("JF-ABC"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn return_sync_announces_once() {
        let h = harness();
        let order = test_order(&h.tenant_id, "15990");
        h.db.insert_order(&order).unwrap();
        h.engine.sync_order_to_ffn(&order.id, false, "job-1").await.unwrap();

        let ret_id = Uuid::new_v4().to_string();
        let ret = crate::models::ReturnRecord {
            id: ret_id.clone(),
            client_id: h.tenant_id.clone(),
            order_id: order.id.clone(),
            external_refund_id: Some("refund-1".into()),
            status: ReturnStatus::Received,
            reason: Some("damaged".into()),
            ffn_return_id: None,
            items: vec![crate::models::ReturnItem {
                id: Uuid::new_v4().to_string(),
                return_id: ret_id.clone(),
                sku: "ABC".into(),
                quantity: 1,
            }],
            created_at: Utc::now(),
        };
        h.db.insert_return(&ret).unwrap();

        h.engine.sync_return_to_ffn(&ret_id, "job-2").await.unwrap();
        let stored = h.db.get_return(&ret_id).unwrap().unwrap();
        assert_eq!(stored.ffn_return_id.as_deref(), Some("RET-R-refund-1"));

        // Second run is a no-op.
        h.engine.sync_return_to_ffn(&ret_id, "job-3").await.unwrap();
    }
}
