//! Fulfillment-network client (JTL FFN merchant API).
//!
//! Owns the OAuth2 token lifecycle for one tenant and the typed REST surface
//! the engine talks to. Token state lives behind an async mutex so concurrent
//! callers serialize on a single refresh; rotated tokens are pushed back to
//! the config row through a `TokenSink` so a restart picks up where we left.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::truncate_body;
use crate::error::SyncError;
use crate::models::{FfnConfig, FfnEnvironment};

const SANDBOX_API_BASE: &str = "https://ffn-sandbox.api.jtl-software.com";
const PRODUCTION_API_BASE: &str = "https://ffn.api.jtl-software.com";
const SANDBOX_AUTH_URL: &str = "https://oauth-sandbox.api.jtl-software.com/oauth2/token";
const PRODUCTION_AUTH_URL: &str = "https://oauth.api.jtl-software.com/oauth2/token";

const PAGE_SIZE: usize = 50;
const PAGE_DELAY: Duration = Duration::from_millis(200);
/// Refresh this long before the token actually expires.
const EXPIRY_MARGIN_SECS: i64 = 300;

/// Persists rotated OAuth material (encrypted) back to the config row.
pub trait TokenSink: Send + Sync {
    fn persist(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Default)]
pub struct TokenState {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

// ---- wire types ----

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FfnAddress {
    pub firstname: String,
    pub lastname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    pub street: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addition: Option<String>,
    pub city: String,
    pub zip: String,
    pub country: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundItemPayload {
    pub merchant_sku: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jfsku: Option<String>,
    pub outbound_item_id: String,
    pub name: String,
    pub quantity: i64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundPayload {
    pub merchant_outbound_number: String,
    pub warehouse_id: String,
    pub fulfiller_id: String,
    pub currency: String,
    pub customer_order_number: String,
    pub order_date: DateTime<Utc>,
    pub shipping_address: FfnAddress,
    pub items: Vec<OutboundItemPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_method_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_type: Option<String>,
    pub priority: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attributes: Option<Vec<KeyValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Outbound {
    #[serde(alias = "id")]
    pub outbound_id: String,
    #[serde(default)]
    pub merchant_outbound_number: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub priority: i8,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_method_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shipping_address: Option<FfnAddress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub picking_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packing_instructions: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundUpdate {
    pub outbound_id: String,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatesPage<T> {
    #[serde(default = "Vec::new")]
    pub data: Vec<T>,
    #[serde(default)]
    pub more_data_available: bool,
    #[serde(default)]
    pub next_chunk_url: Option<String>,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl<T> Default for UpdatesPage<T> {
    fn default() -> Self {
        Self {
            data: Vec::new(),
            more_data_available: false,
            next_chunk_url: None,
            from: None,
            to: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingNotification {
    #[serde(default)]
    pub freight_option: Option<String>,
    #[serde(default)]
    pub estimated_delivery_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tracking_url: Option<String>,
    #[serde(default = "Vec::new")]
    pub identifiers: Vec<ShippingIdentifier>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl ShippingNotification {
    /// The carrier-assigned tracking number is the first `TrackingId`
    /// identifier.
    pub fn tracking_id(&self) -> Option<&str> {
        self.identifiers
            .iter()
            .find(|i| i.kind == "TrackingId")
            .map(|i| i.value.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FfnProduct {
    #[serde(default)]
    pub jfsku: Option<String>,
    pub merchant_sku: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockLevel {
    #[serde(default)]
    pub jfsku: Option<String>,
    pub merchant_sku: String,
    #[serde(default)]
    pub stock_level: i64,
    #[serde(default)]
    pub stock_level_reserved: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InboundItemPayload {
    pub merchant_sku: String,
    pub quantity: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    #[serde(alias = "id")]
    pub inbound_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundUpdate {
    pub inbound_id: String,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnPayload {
    pub merchant_return_number: String,
    pub warehouse_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outbound_id: Option<String>,
    pub items: Vec<InboundItemPayload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FfnReturn {
    #[serde(alias = "id")]
    pub return_id: String,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReturnUpdate {
    pub return_id: String,
    pub status: String,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fulfiller {
    pub fulfiller_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "Vec::new")]
    pub warehouses: Vec<Warehouse>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warehouse {
    pub warehouse_id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingMethod {
    pub shipping_method_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub carrier: Option<String>,
}

#[derive(Debug, Clone)]
pub struct UpdatesQuery {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub page: u32,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    3600
}

// ---- the capability seam the engine and scheduler consume ----

#[async_trait]
pub trait FfnApi: Send + Sync {
    async fn create_outbound(
        &self,
        payload: &OutboundPayload,
        oversale: bool,
        auto_complete_bill_of_materials: bool,
    ) -> Result<Outbound, SyncError>;
    async fn get_outbound(&self, outbound_id: &str) -> Result<Outbound, SyncError>;
    async fn get_outbound_by_merchant_number(
        &self,
        merchant_number: &str,
    ) -> Result<Option<Outbound>, SyncError>;
    async fn update_outbound(
        &self,
        outbound_id: &str,
        update: &OutboundUpdateRequest,
    ) -> Result<(), SyncError>;
    async fn cancel_outbound(&self, outbound_id: &str, reason: &str) -> Result<(), SyncError>;
    async fn get_outbound_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<OutboundUpdate>, SyncError>;
    async fn get_shipping_notifications(
        &self,
        outbound_id: &str,
    ) -> Result<Vec<ShippingNotification>, SyncError>;

    async fn create_product(&self, product: &FfnProduct) -> Result<FfnProduct, SyncError>;
    async fn update_product(&self, jfsku: &str, product: &FfnProduct) -> Result<(), SyncError>;
    async fn get_product_by_merchant_sku(
        &self,
        merchant_sku: &str,
    ) -> Result<Option<FfnProduct>, SyncError>;
    async fn get_all_products_with_stock(&self) -> Result<Vec<StockLevel>, SyncError>;

    async fn create_return(&self, payload: &ReturnPayload) -> Result<FfnReturn, SyncError>;
    async fn get_return_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<ReturnUpdate>, SyncError>;

    async fn get_inbound_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<InboundUpdate>, SyncError>;

    async fn hold_outbound(
        &self,
        outbound_id: &str,
        reason: &str,
        notes: Option<&str>,
    ) -> Result<(), SyncError>;
    async fn release_outbound(&self, outbound_id: &str, priority: i8) -> Result<(), SyncError>;

    /// Proactive refresh for the scheduler's token loop.
    async fn force_refresh(&self) -> Result<(), SyncError>;
}

/// Builds per-tenant FFN clients from (decrypted) config rows. The engine
/// depends on this seam so tests can hand out fakes.
pub trait FfnFactory: Send + Sync {
    fn client_for(&self, config: &FfnConfig) -> Result<Arc<dyn FfnApi>, SyncError>;
}

// ---- concrete client ----

pub struct FfnClient {
    http: Client,
    auth_http: Client,
    api_base: String,
    auth_url: String,
    oauth_client_id: String,
    oauth_client_secret: String,
    token: Mutex<TokenState>,
    token_sink: Option<Arc<dyn TokenSink>>,
    tenant_ref: String,
}

pub struct FfnClientParams {
    pub api_base: String,
    pub auth_url: String,
    pub oauth_client_id: String,
    pub oauth_client_secret: String,
    pub initial_token: TokenState,
    pub token_sink: Option<Arc<dyn TokenSink>>,
    pub tenant_ref: String,
}

impl FfnClient {
    pub fn new(params: FfnClientParams) -> Result<Self, SyncError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("orderbridge/1.0")
            .build()
            .map_err(|e| SyncError::Transient(format!("build FFN http client: {e}")))?;
        let auth_http = Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("orderbridge/1.0")
            .build()
            .map_err(|e| SyncError::Transient(format!("build FFN auth client: {e}")))?;

        Ok(Self {
            http,
            auth_http,
            api_base: params.api_base,
            auth_url: params.auth_url,
            oauth_client_id: params.oauth_client_id,
            oauth_client_secret: params.oauth_client_secret,
            token: Mutex::new(params.initial_token),
            token_sink: params.token_sink,
            tenant_ref: params.tenant_ref,
        })
    }

    pub fn bases_for(environment: FfnEnvironment) -> (&'static str, &'static str) {
        match environment {
            FfnEnvironment::Sandbox => (SANDBOX_API_BASE, SANDBOX_AUTH_URL),
            FfnEnvironment::Production => (PRODUCTION_API_BASE, PRODUCTION_AUTH_URL),
        }
    }

    /// Hand out a bearer token, refreshing when it is inside the expiry
    /// margin. The mutex stays held across the refresh so a stampede of
    /// callers produces exactly one refresh request.
    async fn ensure_valid_token(&self) -> Result<String, SyncError> {
        let mut state = self.token.lock().await;

        let fresh = state
            .expires_at
            .map(|at| (at - Utc::now()).num_seconds() > EXPIRY_MARGIN_SECS)
            .unwrap_or(false);
        if fresh {
            if let Some(token) = &state.access_token {
                return Ok(token.clone());
            }
        }

        self.refresh_locked(&mut state).await?;
        state.access_token.clone().ok_or_else(|| {
            SyncError::MissingCredentials("token refresh yielded no access token".into())
        })
    }

    async fn refresh_locked(&self, state: &mut TokenState) -> Result<(), SyncError> {
        let refresh_token = state.refresh_token.clone().ok_or_else(|| {
            SyncError::MissingCredentials(format!(
                "tenant {} has no FFN refresh token",
                self.tenant_ref
            ))
        })?;

        debug!(tenant_id = %self.tenant_ref, "Refreshing FFN access token");
        let basic = base64::engine::general_purpose::STANDARD.encode(format!(
            "{}:{}",
            self.oauth_client_id, self.oauth_client_secret
        ));

        let response = self
            .auth_http
            .post(&self.auth_url)
            .header("Authorization", format!("Basic {basic}"))
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            if is_revocation_signal(&body) {
                warn!(tenant_id = %self.tenant_ref, "FFN refresh token revoked");
                return Err(SyncError::TokenRevoked(truncate_body(&body, 200)));
            }
            return Err(SyncError::FfnApi {
                status: status.as_u16(),
                body: truncate_body(&body, 500),
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| SyncError::Validation(format!("malformed token response: {e}")))?;

        let expires_at = Utc::now() + chrono::Duration::seconds(token.expires_in);
        state.access_token = Some(token.access_token.clone());
        if token.refresh_token.is_some() {
            state.refresh_token = token.refresh_token.clone();
        }
        state.expires_at = Some(expires_at);

        if let Some(sink) = &self.token_sink {
            sink.persist(&token.access_token, token.refresh_token.as_deref(), expires_at)?;
        }
        info!(tenant_id = %self.tenant_ref, "FFN token refreshed");
        Ok(())
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, SyncError> {
        let token = self.ensure_valid_token().await?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(token);
        if !query.is_empty() {
            request = request.query(query);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(json!({}));
        }

        let text = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(SyncError::FfnApi {
                status: status.as_u16(),
                body: truncate_body(&text, 500),
            });
        }
        if text.trim().is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text)
            .map_err(|e| SyncError::Validation(format!("malformed FFN response: {e}")))
    }

    fn parse<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, SyncError> {
        serde_json::from_value(value)
            .map_err(|e| SyncError::Validation(format!("unexpected FFN payload shape: {e}")))
    }

    /// Sequential OData paging: 50 per page, 200 ms between pages, stop on a
    /// short page.
    async fn get_paged(&self, path: &str, filter: Option<String>) -> Result<Vec<serde_json::Value>, SyncError> {
        let mut all = Vec::new();
        let mut skip = 0usize;
        loop {
            let mut query: Vec<(&str, String)> = vec![
                ("$top", PAGE_SIZE.to_string()),
                ("$skip", skip.to_string()),
            ];
            if let Some(filter) = &filter {
                query.push(("$filter", filter.clone()));
            }
            let value = self.call(Method::GET, path, &query, None).await?;
            let items = page_items(value);
            let count = items.len();
            all.extend(items);
            if count < PAGE_SIZE {
                break;
            }
            skip += PAGE_SIZE;
            tokio::time::sleep(PAGE_DELAY).await;
        }
        Ok(all)
    }
}

/// Page payloads come either as a bare array or wrapped in `{"items": []}`.
fn page_items(value: serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items,
        serde_json::Value::Object(mut map) => match map.remove("items") {
            Some(serde_json::Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

fn is_revocation_signal(body: &str) -> bool {
    body.contains("refresh token is invalid")
        || body.contains("Token has been revoked")
        || body.contains("invalid_request")
}

fn updates_query(query: &UpdatesQuery) -> Vec<(&'static str, String)> {
    vec![
        ("fromDate", query.from.to_rfc3339()),
        ("toDate", query.to.to_rfc3339()),
        ("page", query.page.to_string()),
        ("ignoreOwnApplicationId", "true".to_string()),
        ("ignoreOwnUserId", "true".to_string()),
    ]
}

#[async_trait]
impl FfnApi for FfnClient {
    async fn create_outbound(
        &self,
        payload: &OutboundPayload,
        oversale: bool,
        auto_complete_bill_of_materials: bool,
    ) -> Result<Outbound, SyncError> {
        let value = self
            .call(
                Method::POST,
                "/api/v1/merchant/outbounds",
                &[
                    ("oversale", oversale.to_string()),
                    (
                        "autoCompleteBillOfMaterials",
                        auto_complete_bill_of_materials.to_string(),
                    ),
                ],
                Some(serde_json::to_value(payload).map_err(|e| {
                    SyncError::Validation(format!("serialize outbound payload: {e}"))
                })?),
            )
            .await?;
        Self::parse(value)
    }

    async fn get_outbound(&self, outbound_id: &str) -> Result<Outbound, SyncError> {
        let value = self
            .call(
                Method::GET,
                &format!("/api/v1/merchant/outbounds/{outbound_id}"),
                &[],
                None,
            )
            .await?;
        Self::parse(value)
    }

    async fn get_outbound_by_merchant_number(
        &self,
        merchant_number: &str,
    ) -> Result<Option<Outbound>, SyncError> {
        let filter = format!("merchantOutboundNumber eq '{merchant_number}'");
        let value = self
            .call(
                Method::GET,
                "/api/v1/merchant/outbounds",
                &[
                    ("$top", PAGE_SIZE.to_string()),
                    ("$skip", "0".to_string()),
                    ("$filter", filter),
                ],
                None,
            )
            .await?;
        let outbounds: Vec<Outbound> = page_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        Ok(outbounds
            .into_iter()
            .find(|o| o.merchant_outbound_number == merchant_number))
    }

    async fn update_outbound(
        &self,
        outbound_id: &str,
        update: &OutboundUpdateRequest,
    ) -> Result<(), SyncError> {
        self.call(
            Method::PATCH,
            &format!("/api/v1/merchant/outbounds/{outbound_id}"),
            &[],
            Some(serde_json::to_value(update).map_err(|e| {
                SyncError::Validation(format!("serialize outbound update: {e}"))
            })?),
        )
        .await?;
        Ok(())
    }

    async fn cancel_outbound(&self, outbound_id: &str, reason: &str) -> Result<(), SyncError> {
        self.call(
            Method::POST,
            &format!("/api/v1/merchant/outbounds/{outbound_id}/cancel"),
            &[],
            Some(json!({ "reason": reason })),
        )
        .await?;
        Ok(())
    }

    async fn get_outbound_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<OutboundUpdate>, SyncError> {
        let value = self
            .call(
                Method::GET,
                "/api/v1/merchant/outbounds/updates",
                &updates_query(query),
                None,
            )
            .await?;
        Self::parse(value)
    }

    async fn get_shipping_notifications(
        &self,
        outbound_id: &str,
    ) -> Result<Vec<ShippingNotification>, SyncError> {
        let value = self
            .call(
                Method::GET,
                &format!("/api/v1/merchant/outbounds/{outbound_id}/shipping-notifications"),
                &[],
                None,
            )
            .await?;
        let notifications = page_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect();
        Ok(notifications)
    }

    async fn create_product(&self, product: &FfnProduct) -> Result<FfnProduct, SyncError> {
        let value = self
            .call(
                Method::POST,
                "/api/v1/merchant/products",
                &[],
                Some(serde_json::to_value(product).map_err(|e| {
                    SyncError::Validation(format!("serialize product payload: {e}"))
                })?),
            )
            .await?;
        Self::parse(value)
    }

    async fn update_product(&self, jfsku: &str, product: &FfnProduct) -> Result<(), SyncError> {
        self.call(
            Method::PUT,
            &format!("/api/v1/merchant/products/{jfsku}"),
            &[],
            Some(serde_json::to_value(product).map_err(|e| {
                SyncError::Validation(format!("serialize product payload: {e}"))
            })?),
        )
        .await?;
        Ok(())
    }

    /// The server-side SKU filter is unreliable, so scan pages client-side
    /// and stop as soon as the SKU shows up. Amortized across background
    /// jobs, so the extra pages are acceptable.
    async fn get_product_by_merchant_sku(
        &self,
        merchant_sku: &str,
    ) -> Result<Option<FfnProduct>, SyncError> {
        let mut skip = 0usize;
        loop {
            let value = self
                .call(
                    Method::GET,
                    "/api/v1/merchant/products",
                    &[("$top", PAGE_SIZE.to_string()), ("$skip", skip.to_string())],
                    None,
                )
                .await?;
            let products: Vec<FfnProduct> = page_items(value)
                .into_iter()
                .filter_map(|v| serde_json::from_value(v).ok())
                .collect();
            let count = products.len();

            if let Some(hit) = products.into_iter().find(|p| p.merchant_sku == merchant_sku) {
                return Ok(Some(hit));
            }
            if count < PAGE_SIZE {
                return Ok(None);
            }
            skip += PAGE_SIZE;
            tokio::time::sleep(PAGE_DELAY).await;
        }
    }

    async fn get_all_products_with_stock(&self) -> Result<Vec<StockLevel>, SyncError> {
        let items = self.get_paged("/api/v1/merchant/stocks", None).await?;
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    async fn create_return(&self, payload: &ReturnPayload) -> Result<FfnReturn, SyncError> {
        let value = self
            .call(
                Method::POST,
                "/api/v1/merchant/returns",
                &[],
                Some(serde_json::to_value(payload).map_err(|e| {
                    SyncError::Validation(format!("serialize return payload: {e}"))
                })?),
            )
            .await?;
        Self::parse(value)
    }

    async fn get_return_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<ReturnUpdate>, SyncError> {
        let value = self
            .call(
                Method::GET,
                "/api/v1/merchant/returns/updates",
                &updates_query(query),
                None,
            )
            .await?;
        Self::parse(value)
    }

    async fn get_inbound_updates(
        &self,
        query: &UpdatesQuery,
    ) -> Result<UpdatesPage<InboundUpdate>, SyncError> {
        let value = self
            .call(
                Method::GET,
                "/api/v1/merchant/inbounds/updates",
                &updates_query(query),
                None,
            )
            .await?;
        Self::parse(value)
    }

    async fn hold_outbound(
        &self,
        outbound_id: &str,
        reason: &str,
        notes: Option<&str>,
    ) -> Result<(), SyncError> {
        let note = match notes {
            Some(notes) => format!("HOLD: {reason} ({notes})"),
            None => format!("HOLD: {reason}"),
        };
        self.update_outbound(
            outbound_id,
            &OutboundUpdateRequest {
                priority: Some(-5),
                internal_note: Some(note),
                ..Default::default()
            },
        )
        .await
    }

    async fn release_outbound(&self, outbound_id: &str, priority: i8) -> Result<(), SyncError> {
        self.update_outbound(
            outbound_id,
            &OutboundUpdateRequest {
                priority: Some(priority),
                internal_note: Some("HOLD released".to_string()),
                ..Default::default()
            },
        )
        .await
    }

    async fn force_refresh(&self) -> Result<(), SyncError> {
        let mut state = self.token.lock().await;
        self.refresh_locked(&mut state).await
    }
}

impl FfnClient {
    /// Extra surface not needed by the engine seam but used by operations
    /// tooling: fulfillers, their warehouses, shipping methods, inbound CRUD.
    pub async fn get_fulfillers(&self) -> Result<Vec<Fulfiller>, SyncError> {
        let value = self
            .call(Method::GET, "/api/v1/merchant/fulfillers", &[], None)
            .await?;
        Ok(page_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    /// Warehouses are derived from the fulfiller listing.
    pub async fn get_warehouses(&self) -> Result<Vec<Warehouse>, SyncError> {
        let fulfillers = self.get_fulfillers().await?;
        Ok(fulfillers.into_iter().flat_map(|f| f.warehouses).collect())
    }

    pub async fn get_shipping_methods(&self) -> Result<Vec<ShippingMethod>, SyncError> {
        let value = self
            .call(Method::GET, "/api/v1/merchant/shipping-methods", &[], None)
            .await?;
        Ok(page_items(value)
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn create_inbound(
        &self,
        merchant_inbound_number: &str,
        warehouse_id: &str,
        items: &[InboundItemPayload],
    ) -> Result<Inbound, SyncError> {
        let value = self
            .call(
                Method::POST,
                "/api/v1/merchant/inbounds",
                &[],
                Some(json!({
                    "merchantInboundNumber": merchant_inbound_number,
                    "warehouseId": warehouse_id,
                    "items": items,
                })),
            )
            .await?;
        Self::parse(value)
    }

    pub async fn get_inbounds(&self) -> Result<Vec<Inbound>, SyncError> {
        let items = self.get_paged("/api/v1/merchant/inbounds", None).await?;
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn cancel_inbound(&self, inbound_id: &str) -> Result<(), SyncError> {
        self.call(
            Method::POST,
            &format!("/api/v1/merchant/inbounds/{inbound_id}/cancel"),
            &[],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn get_returns(&self) -> Result<Vec<FfnReturn>, SyncError> {
        let items = self.get_paged("/api/v1/merchant/returns", None).await?;
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }

    pub async fn update_return(&self, return_id: &str, status: &str) -> Result<(), SyncError> {
        self.call(
            Method::PATCH,
            &format!("/api/v1/merchant/returns/{return_id}"),
            &[],
            Some(json!({ "status": status })),
        )
        .await?;
        Ok(())
    }

    pub async fn get_all_outbounds(&self, filter: Option<String>) -> Result<Vec<Outbound>, SyncError> {
        let items = self.get_paged("/api/v1/merchant/outbounds", filter).await?;
        Ok(items
            .into_iter()
            .filter_map(|v| serde_json::from_value(v).ok())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer, token: TokenState) -> FfnClient {
        FfnClient::new(FfnClientParams {
            api_base: server.uri(),
            auth_url: format!("{}/oauth2/token", server.uri()),
            oauth_client_id: "client-id".into(),
            oauth_client_secret: "client-secret".into(),
            initial_token: token,
            token_sink: None,
            tenant_ref: "tenant-1".into(),
        })
        .unwrap()
    }

    fn valid_token() -> TokenState {
        TokenState {
            access_token: Some("valid-token".into()),
            refresh_token: Some("refresh-token".into()),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        }
    }

    fn expired_token() -> TokenState {
        TokenState {
            access_token: Some("stale-token".into()),
            refresh_token: Some("refresh-token".into()),
            expires_at: Some(Utc::now() - chrono::Duration::minutes(1)),
        }
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh-token",
                "refresh_token": "next-refresh",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/outbounds/OB-1"))
            .and(header("authorization", "Bearer fresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "outboundId": "OB-1",
                "merchantOutboundNumber": "15990",
                "status": "NEW"
            })))
            .mount(&server)
            .await;

        let client = Arc::new(client(&server, expired_token()));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let c = client.clone();
            handles.push(tokio::spawn(async move { c.get_outbound("OB-1").await }));
        }
        for handle in handles {
            let outbound = handle.await.unwrap().unwrap();
            assert_eq!(outbound.outbound_id, "OB-1");
        }
        // expect(1) on the token mock asserts the single refresh.
    }

    #[tokio::test]
    async fn revocation_body_raises_token_revoked() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/oauth2/token"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_string(r#"{"error":"invalid_grant","error_description":"Token has been revoked"}"#),
            )
            .mount(&server)
            .await;

        let client = client(&server, expired_token());
        let err = client.get_outbound("OB-1").await.unwrap_err();
        assert!(matches!(err, SyncError::TokenRevoked(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn missing_refresh_token_is_a_credentials_gap() {
        let server = MockServer::start().await;
        let client = client(
            &server,
            TokenState {
                access_token: None,
                refresh_token: None,
                expires_at: None,
            },
        );
        let err = client.get_outbound("OB-1").await.unwrap_err();
        assert!(matches!(err, SyncError::MissingCredentials(_)));
    }

    #[tokio::test]
    async fn non_2xx_maps_to_ffn_api_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/outbounds/OB-404"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let client = client(&server, valid_token());
        let err = client.get_outbound("OB-404").await.unwrap_err();
        match err {
            SyncError::FfnApi { status, body } => {
                assert_eq!(status, 404);
                assert_eq!(body, "not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_handles_204_no_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/merchant/outbounds/OB-1/cancel"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let client = client(&server, valid_token());
        client.cancel_outbound("OB-1", "customer request").await.unwrap();
    }

    #[tokio::test]
    async fn merchant_sku_scan_stops_on_match() {
        let server = MockServer::start().await;

        // Full first page without the SKU.
        let first_page: Vec<_> = (0..PAGE_SIZE)
            .map(|n| serde_json::json!({"merchantSku": format!("OTHER-{n}"), "name": "x"}))
            .collect();
        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/products"))
            .and(query_param("$skip", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&first_page))
            .mount(&server)
            .await;

        // Second page carries the match.
        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/products"))
            .and(query_param("$skip", PAGE_SIZE.to_string()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"jfsku": "JF-1", "merchantSku": "ABC", "name": "Widget"}
            ])))
            .mount(&server)
            .await;

        let client = client(&server, valid_token());
        let found = client.get_product_by_merchant_sku("ABC").await.unwrap().unwrap();
        assert_eq!(found.jfsku.as_deref(), Some("JF-1"));
    }

    #[tokio::test]
    async fn warehouses_are_derived_from_fulfillers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/fulfillers"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "fulfillerId": "F1",
                    "name": "Main Fulfiller",
                    "warehouses": [
                        {"warehouseId": "W1", "name": "Berlin"},
                        {"warehouseId": "W2", "name": "Leipzig"}
                    ]
                }
            ])))
            .mount(&server)
            .await;

        let client = client(&server, valid_token());
        let warehouses = client.get_warehouses().await.unwrap();
        assert_eq!(warehouses.len(), 2);
        assert_eq!(warehouses[0].warehouse_id, "W1");
    }

    #[tokio::test]
    async fn shipping_notifications_expose_tracking_id() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/merchant/outbounds/OB-1/shipping-notifications"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {
                    "freightOption": "DHL",
                    "trackingUrl": "https://dhl/00340123456789",
                    "identifiers": [
                        {"type": "ParcelNumber", "value": "P-1"},
                        {"type": "TrackingId", "value": "00340123456789"}
                    ]
                }
            ])))
            .mount(&server)
            .await;

        let client = client(&server, valid_token());
        let notifications = client.get_shipping_notifications("OB-1").await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].tracking_id(), Some("00340123456789"));
        assert_eq!(notifications[0].freight_option.as_deref(), Some("DHL"));
    }
}
