//! Canonical domain model shared across the sync engine.
//!
//! Everything the broker persists is a projection of Commerce/FFN payloads
//! into these types plus provenance fields; raw platform payloads are never
//! stored verbatim.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which commerce platform a channel binds to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Storefront,
    Webshop,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Storefront => "storefront",
            ChannelType::Webshop => "webshop",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "storefront" => Some(ChannelType::Storefront),
            "webshop" => Some(ChannelType::Webshop),
            _ => None,
        }
    }
}

/// Where an order originally entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderOrigin {
    Storefront,
    Webshop,
    Internal,
}

impl OrderOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderOrigin::Storefront => "STOREFRONT",
            OrderOrigin::Webshop => "WEBSHOP",
            OrderOrigin::Internal => "INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STOREFRONT" => Some(OrderOrigin::Storefront),
            "WEBSHOP" => Some(OrderOrigin::Webshop),
            "INTERNAL" => Some(OrderOrigin::Internal),
            _ => None,
        }
    }

    pub fn from_channel(channel_type: ChannelType) -> Self {
        match channel_type {
            ChannelType::Storefront => OrderOrigin::Storefront,
            ChannelType::Webshop => OrderOrigin::Webshop,
        }
    }
}

/// Who performed a sync action. Superset of `OrderOrigin`: the fulfillment
/// network also writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncOrigin {
    Internal,
    Storefront,
    Webshop,
    Ffn,
}

impl SyncOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOrigin::Internal => "INTERNAL",
            SyncOrigin::Storefront => "STOREFRONT",
            SyncOrigin::Webshop => "WEBSHOP",
            SyncOrigin::Ffn => "FFN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INTERNAL" => Some(SyncOrigin::Internal),
            "STOREFRONT" => Some(SyncOrigin::Storefront),
            "WEBSHOP" => Some(SyncOrigin::Webshop),
            "FFN" => Some(SyncOrigin::Ffn),
            _ => None,
        }
    }
}

/// Commerce-visible order lifecycle. Independent of `FulfillmentState`,
/// which tracks warehouse progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::OnHold => "ON_HOLD",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(OrderStatus::Pending),
            "PROCESSING" => Some(OrderStatus::Processing),
            "ON_HOLD" => Some(OrderStatus::OnHold),
            "DELIVERED" => Some(OrderStatus::Delivered),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            _ => None,
        }
    }

    /// Webshop status tokens → canonical status.
    pub fn from_webshop(token: &str) -> Self {
        match token {
            "pending" => OrderStatus::Pending,
            "processing" => OrderStatus::Processing,
            "on-hold" => OrderStatus::OnHold,
            "completed" => OrderStatus::Delivered,
            "cancelled" | "refunded" | "failed" => OrderStatus::Cancelled,
            _ => OrderStatus::Pending,
        }
    }

    /// Canonical status → webshop token, for back-propagation.
    pub fn to_webshop(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Processing => "processing",
            OrderStatus::OnHold => "on-hold",
            OrderStatus::Delivered => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }
}

/// Warehouse progress of an order. Advances monotonically except for the
/// explicit cancel arms, and terminal states are sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentState {
    Pending,
    Preparation,
    Acknowledged,
    Locked,
    Pickprocess,
    PartiallyShipped,
    Shipped,
    InTransit,
    Delivered,
    FailedDelivery,
    ReturnedToSender,
    Canceled,
    PartiallyCanceled,
}

impl FulfillmentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentState::Pending => "PENDING",
            FulfillmentState::Preparation => "PREPARATION",
            FulfillmentState::Acknowledged => "ACKNOWLEDGED",
            FulfillmentState::Locked => "LOCKED",
            FulfillmentState::Pickprocess => "PICKPROCESS",
            FulfillmentState::PartiallyShipped => "PARTIALLY_SHIPPED",
            FulfillmentState::Shipped => "SHIPPED",
            FulfillmentState::InTransit => "IN_TRANSIT",
            FulfillmentState::Delivered => "DELIVERED",
            FulfillmentState::FailedDelivery => "FAILED_DELIVERY",
            FulfillmentState::ReturnedToSender => "RETURNED_TO_SENDER",
            FulfillmentState::Canceled => "CANCELED",
            FulfillmentState::PartiallyCanceled => "PARTIALLY_CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(FulfillmentState::Pending),
            "PREPARATION" => Some(FulfillmentState::Preparation),
            "ACKNOWLEDGED" => Some(FulfillmentState::Acknowledged),
            "LOCKED" => Some(FulfillmentState::Locked),
            "PICKPROCESS" => Some(FulfillmentState::Pickprocess),
            "PARTIALLY_SHIPPED" => Some(FulfillmentState::PartiallyShipped),
            "SHIPPED" => Some(FulfillmentState::Shipped),
            "IN_TRANSIT" => Some(FulfillmentState::InTransit),
            "DELIVERED" => Some(FulfillmentState::Delivered),
            "FAILED_DELIVERY" => Some(FulfillmentState::FailedDelivery),
            "RETURNED_TO_SENDER" => Some(FulfillmentState::ReturnedToSender),
            "CANCELED" => Some(FulfillmentState::Canceled),
            "PARTIALLY_CANCELED" => Some(FulfillmentState::PartiallyCanceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FulfillmentState::Delivered
                | FulfillmentState::FailedDelivery
                | FulfillmentState::ReturnedToSender
                | FulfillmentState::Canceled
        )
    }

    /// Position on the forward axis. Cancel states sit outside it.
    fn rank(&self) -> Option<u8> {
        match self {
            FulfillmentState::Pending => Some(0),
            FulfillmentState::Preparation => Some(1),
            FulfillmentState::Acknowledged => Some(2),
            FulfillmentState::Locked => Some(3),
            FulfillmentState::Pickprocess => Some(4),
            FulfillmentState::PartiallyShipped => Some(5),
            FulfillmentState::Shipped => Some(6),
            FulfillmentState::InTransit => Some(7),
            FulfillmentState::Delivered
            | FulfillmentState::FailedDelivery
            | FulfillmentState::ReturnedToSender => Some(8),
            FulfillmentState::Canceled | FulfillmentState::PartiallyCanceled => None,
        }
    }

    /// Monotonic advance, cancel arms from any non-terminal state, terminal
    /// states are sinks.
    pub fn can_transition_to(&self, next: FulfillmentState) -> bool {
        if *self == next || self.is_terminal() {
            return false;
        }
        if matches!(
            next,
            FulfillmentState::Canceled | FulfillmentState::PartiallyCanceled
        ) {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(a), Some(b)) => b > a,
            // Out of a partial cancel only the full cancel arms apply.
            _ => false,
        }
    }

    /// FFN outbound status token → canonical state. Unknown tokens park the
    /// order at PENDING rather than inventing progress.
    pub fn from_ffn_status(status: &str) -> Self {
        match status {
            "NEW" => FulfillmentState::Preparation,
            "OPEN" => FulfillmentState::Acknowledged,
            "IN_PICK" | "PICKED" | "PACKING" => FulfillmentState::Pickprocess,
            "PACKED" => FulfillmentState::Locked,
            "SHIPPED" => FulfillmentState::Shipped,
            "DELIVERED" => FulfillmentState::Delivered,
            "CANCELLED" => FulfillmentState::Canceled,
            "FAILED" => FulfillmentState::FailedDelivery,
            "RETURNED" => FulfillmentState::ReturnedToSender,
            _ => FulfillmentState::Pending,
        }
    }
}

impl std::fmt::Display for FulfillmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an order is parked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldReason {
    AwaitingPayment,
    ShippingMethodMismatch,
    AddressIssue,
    ManualReview,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::AwaitingPayment => "AWAITING_PAYMENT",
            HoldReason::ShippingMethodMismatch => "SHIPPING_METHOD_MISMATCH",
            HoldReason::AddressIssue => "ADDRESS_ISSUE",
            HoldReason::ManualReview => "MANUAL_REVIEW",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "AWAITING_PAYMENT" => Some(HoldReason::AwaitingPayment),
            "SHIPPING_METHOD_MISMATCH" => Some(HoldReason::ShippingMethodMismatch),
            "ADDRESS_ISSUE" => Some(HoldReason::AddressIssue),
            "MANUAL_REVIEW" => Some(HoldReason::ManualReview),
            _ => None,
        }
    }
}

/// Result of the last sync attempt against an external platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Pending,
    Synced,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "PENDING",
            SyncStatus::Synced => "SYNCED",
            SyncStatus::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(SyncStatus::Pending),
            "SYNCED" => Some(SyncStatus::Synced),
            "ERROR" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Payment-status tokens that clear the payment gate. Anything else,
/// including an absent status, blocks FFN dispatch unless the manual
/// override is set.
pub const SAFE_PAYMENT_STATUSES: [&str; 7] = [
    "paid",
    "completed",
    "processing",
    "refunded",
    "partially_refunded",
    "authorized",
    "partially_paid",
];

pub fn is_payment_safe(payment_status: Option<&str>) -> bool {
    payment_status
        .map(|s| SAFE_PAYMENT_STATUSES.contains(&s))
        .unwrap_or(false)
}

/// Webshop order status token → payment status token. The webshop has no
/// separate payment object; a processing/completed order has been paid.
pub fn webshop_payment_status(order_status: &str) -> &'static str {
    match order_status {
        "processing" | "completed" => "paid",
        "refunded" => "refunded",
        "on-hold" | "pending" => "pending",
        "cancelled" | "failed" => "failed",
        _ => "pending",
    }
}

/// Return lifecycle at the warehouse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReturnStatus {
    Received,
    Inspected,
    Accepted,
    Refunded,
}

impl ReturnStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnStatus::Received => "RECEIVED",
            ReturnStatus::Inspected => "INSPECTED",
            ReturnStatus::Accepted => "ACCEPTED",
            ReturnStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RECEIVED" => Some(ReturnStatus::Received),
            "INSPECTED" => Some(ReturnStatus::Inspected),
            "ACCEPTED" => Some(ReturnStatus::Accepted),
            "REFUNDED" => Some(ReturnStatus::Refunded),
            _ => None,
        }
    }
}

/// A merchant account. Owns channels and at most one FFN configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// Binding to one commerce endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub client_id: String,
    pub channel_type: ChannelType,
    pub base_url: String,
    /// Encrypted at rest; format depends on the platform
    /// (`token` for storefront, `consumer_key:consumer_secret` for webshop).
    pub api_credentials: String,
    pub is_active: bool,
    pub sync_enabled: bool,
    pub last_order_poll_at: Option<DateTime<Utc>>,
    pub last_product_poll_at: Option<DateTime<Utc>>,
}

/// FFN environment tag; picks the API base URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FfnEnvironment {
    Sandbox,
    Production,
}

impl FfnEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            FfnEnvironment::Sandbox => "sandbox",
            FfnEnvironment::Production => "production",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sandbox" => Some(FfnEnvironment::Sandbox),
            "production" => Some(FfnEnvironment::Production),
            _ => None,
        }
    }
}

/// Per-tenant fulfillment-network configuration. Secret fields hold vault
/// ciphertext; decryption happens inside the FFN client construction path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FfnConfig {
    pub id: String,
    pub client_id: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub access_token: Option<String>,
    /// Absent means refresh is impossible.
    pub refresh_token: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub environment: FfnEnvironment,
    pub fulfiller_id: Option<String>,
    pub warehouse_id: Option<String>,
    pub is_active: bool,
}

/// Canonical product, unique per tenant by merchant SKU.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub client_id: String,
    pub merchant_sku: String,
    pub name: String,
    pub description: Option<String>,
    pub price: f64,
    pub weight: Option<f64>,
    pub stock_available: i64,
    pub stock_reserved: i64,
    pub ffn_product_id: Option<String>,
    pub sync_status: SyncStatus,
    pub image_url: Option<String>,
    pub is_bundle: bool,
}

/// Channel-side identity of a product.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductChannel {
    pub product_id: String,
    pub channel_id: String,
    pub external_product_id: String,
}

/// Shipping/billing snapshot carried on the order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Address {
    pub firstname: String,
    pub lastname: String,
    pub company: Option<String>,
    pub street: String,
    pub addition: Option<String>,
    pub city: String,
    pub zip: String,
    /// ISO-2.
    pub country: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// The central aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub client_id: String,
    pub channel_id: Option<String>,
    pub order_number: Option<String>,
    pub external_order_id: String,
    pub order_origin: OrderOrigin,
    pub status: OrderStatus,
    pub fulfillment_state: FulfillmentState,
    pub payment_status: Option<String>,
    pub is_on_hold: bool,
    pub hold_reason: Option<HoldReason>,
    pub hold_placed_at: Option<DateTime<Utc>>,
    pub hold_placed_by: Option<String>,
    pub hold_released_at: Option<DateTime<Utc>>,
    pub hold_released_by: Option<String>,
    pub payment_hold_override: bool,
    pub shipping_address: Address,
    pub billing_address: Option<Address>,
    pub total: f64,
    pub currency: String,
    pub items: Vec<OrderItem>,
    pub ffn_outbound_id: Option<String>,
    pub last_ffn_sync_at: Option<DateTime<Utc>>,
    pub ffn_sync_error: Option<String>,
    pub commerce_sync_error: Option<String>,
    pub last_synced_to_commerce: Option<DateTime<Utc>>,
    pub sync_status: SyncStatus,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    /// All parcels of a multi-package shipment, first package first.
    pub tracking_packages: Vec<TrackingInfo>,
    pub priority_level: i8,
    pub is_cancelled: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<String>,
    pub cancellation_reason: Option<String>,
    pub is_replacement: bool,
    pub last_operational_update_by: Option<SyncOrigin>,
    pub last_operational_update_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: String,
    pub order_id: String,
    pub product_id: Option<String>,
    /// SKU snapshot; may be a synthetic `NO-SKU-<n>` pending resolution.
    pub sku: String,
    pub product_name: String,
    pub quantity: i64,
    pub unit_price: f64,
    pub line_total: f64,
}

/// Tenant-scoped return record tied to an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnRecord {
    pub id: String,
    pub client_id: String,
    pub order_id: String,
    pub external_refund_id: Option<String>,
    pub status: ReturnStatus,
    pub reason: Option<String>,
    pub ffn_return_id: Option<String>,
    pub items: Vec<ReturnItem>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReturnItem {
    pub id: String,
    pub return_id: String,
    pub sku: String,
    pub quantity: i64,
}

/// Immutable audit record of one sync attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSyncLog {
    pub id: String,
    pub order_id: String,
    pub action: String,
    pub origin: SyncOrigin,
    pub target_platform: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub external_id: Option<String>,
    pub changed_fields: Vec<String>,
    pub previous_state: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Last-run snapshot of one scheduler loop for one tenant. Upsert-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CronJobStatus {
    pub client_id: String,
    pub job_name: String,
    pub last_run_at: DateTime<Utc>,
    pub success: bool,
    pub duration_ms: i64,
    pub details: serde_json::Value,
    pub error: Option<String>,
}

/// Tenant-facing event (token revoked, configuration gap).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub client_id: String,
    pub kind: String,
    pub message: String,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// One parcel's tracking data extracted from an FFN shipping notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingInfo {
    pub tracking_number: String,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub estimated_delivery: Option<DateTime<Utc>>,
}

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub encryption_key: String,
    pub ffn_env: FfnEnvironment,
    /// Only one process per deployment should host the scheduler.
    pub run_scheduler: bool,
    pub port: u16,
    pub incremental_sync_secs: u64,
    pub full_sync_secs: u64,
    pub ffn_poll_secs: u64,
    pub token_refresh_secs: u64,
    pub stock_sync_secs: u64,
    pub inbound_poll_secs: u64,
    pub commerce_reconcile_secs: u64,
    pub paid_sweep_secs: u64,
    pub max_concurrent_syncs: usize,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;

        let encryption_key = std::env::var("ENCRYPTION_KEY")
            .map_err(|_| anyhow::anyhow!("ENCRYPTION_KEY is required"))?;

        let ffn_env = std::env::var("FFN_ENV")
            .ok()
            .and_then(|v| FfnEnvironment::parse(&v))
            .unwrap_or(FfnEnvironment::Sandbox);

        let run_scheduler = std::env::var("PROCESS_ROLE")
            .map(|v| matches!(v.as_str(), "scheduler" | "all"))
            .unwrap_or(true);

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        Ok(Self {
            database_url,
            encryption_key,
            ffn_env,
            run_scheduler,
            port,
            incremental_sync_secs: env_u64("INCREMENTAL_SYNC_SECS", 300),
            full_sync_secs: env_u64("FULL_SYNC_SECS", 86_400),
            ffn_poll_secs: env_u64("FFN_POLL_SECS", 120),
            token_refresh_secs: env_u64("TOKEN_REFRESH_SECS", 43_200),
            stock_sync_secs: env_u64("STOCK_SYNC_SECS", 900),
            inbound_poll_secs: env_u64("INBOUND_POLL_SECS", 120),
            commerce_reconcile_secs: env_u64("COMMERCE_RECONCILE_SECS", 1_800),
            paid_sweep_secs: env_u64("PAID_SWEEP_SECS", 600),
            max_concurrent_syncs: env_u64("MAX_CONCURRENT_SYNCS", 3) as usize,
        })
    }
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATES: [FulfillmentState; 13] = [
        FulfillmentState::Pending,
        FulfillmentState::Preparation,
        FulfillmentState::Acknowledged,
        FulfillmentState::Locked,
        FulfillmentState::Pickprocess,
        FulfillmentState::PartiallyShipped,
        FulfillmentState::Shipped,
        FulfillmentState::InTransit,
        FulfillmentState::Delivered,
        FulfillmentState::FailedDelivery,
        FulfillmentState::ReturnedToSender,
        FulfillmentState::Canceled,
        FulfillmentState::PartiallyCanceled,
    ];

    #[test]
    fn terminal_states_are_sinks() {
        for t in ALL_STATES.iter().filter(|s| s.is_terminal()) {
            for next in ALL_STATES {
                assert!(
                    !t.can_transition_to(next),
                    "{t:?} must not transition to {next:?}"
                );
            }
        }
    }

    #[test]
    fn forward_progress_is_monotonic() {
        assert!(FulfillmentState::Pending.can_transition_to(FulfillmentState::Preparation));
        assert!(FulfillmentState::Pending.can_transition_to(FulfillmentState::Shipped));
        assert!(FulfillmentState::Pickprocess.can_transition_to(FulfillmentState::Shipped));
        assert!(FulfillmentState::Shipped.can_transition_to(FulfillmentState::Delivered));
        // No going back.
        assert!(!FulfillmentState::Shipped.can_transition_to(FulfillmentState::Pickprocess));
        assert!(!FulfillmentState::Pickprocess.can_transition_to(FulfillmentState::Locked));
    }

    #[test]
    fn cancel_is_reachable_from_any_non_terminal() {
        for s in ALL_STATES.iter().filter(|s| !s.is_terminal()) {
            assert!(
                *s == FulfillmentState::Canceled || s.can_transition_to(FulfillmentState::Canceled),
                "{s:?} should reach CANCELED"
            );
        }
        assert!(!FulfillmentState::Delivered.can_transition_to(FulfillmentState::Canceled));
    }

    #[test]
    fn ffn_status_mapping() {
        assert_eq!(
            FulfillmentState::from_ffn_status("NEW"),
            FulfillmentState::Preparation
        );
        assert_eq!(
            FulfillmentState::from_ffn_status("IN_PICK"),
            FulfillmentState::Pickprocess
        );
        assert_eq!(
            FulfillmentState::from_ffn_status("PACKED"),
            FulfillmentState::Locked
        );
        assert_eq!(
            FulfillmentState::from_ffn_status("CANCELLED"),
            FulfillmentState::Canceled
        );
        assert_eq!(
            FulfillmentState::from_ffn_status("SOMETHING_ODD"),
            FulfillmentState::Pending
        );
    }

    #[test]
    fn webshop_status_mapping() {
        assert_eq!(OrderStatus::from_webshop("processing"), OrderStatus::Processing);
        assert_eq!(OrderStatus::from_webshop("completed"), OrderStatus::Delivered);
        assert_eq!(OrderStatus::from_webshop("refunded"), OrderStatus::Cancelled);
        assert_eq!(webshop_payment_status("processing"), "paid");
        assert_eq!(webshop_payment_status("pending"), "pending");
    }

    #[test]
    fn payment_safe_set() {
        assert!(is_payment_safe(Some("paid")));
        assert!(is_payment_safe(Some("partially_refunded")));
        assert!(!is_payment_safe(Some("pending")));
        assert!(!is_payment_safe(Some("PAID")));
        assert!(!is_payment_safe(None));
    }
}
