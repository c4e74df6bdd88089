//! Periodic loops: the poll-driven half of the engine.
//!
//! One process per deployment owns these. Each loop runs on its own tokio
//! task with its own interval, mints a fresh correlation job id per tick,
//! records a per-tenant `cron_job_status` snapshot, and honors the shutdown
//! signal between batches so `stop()` drains instead of killing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::audit::{
    job_id, JOB_COMMERCE_RECONCILE, JOB_FFN_POLL, JOB_FULL_SYNC, JOB_INBOUND_POLL,
    JOB_INCREMENTAL_SYNC, JOB_PAID_SWEEP, JOB_STOCK_SYNC, JOB_TOKEN_REFRESH,
};
use crate::clients::commerce::CommerceFactory;
use crate::clients::ffn::{FfnApi, FfnFactory, UpdatesQuery};
use crate::error::SyncError;
use crate::lifecycle::{commerce_fulfill_key, ffn_sync_key, OrderLifecycle};
use crate::models::{Channel, Config, CronJobStatus, FfnConfig};
use crate::queue::{Enqueuer, JobOptions, ORDER_SYNC_TO_COMMERCE, ORDER_SYNC_TO_FFN};
use crate::store::Database;
use crate::webhooks::WebhookProcessor;

/// Cursor overlap for incremental commerce polls.
const CURSOR_OVERLAP_MINS: i64 = 10;
/// Pause between channel batches, to be gentle with external APIs.
const BATCH_GAP: StdDuration = StdDuration::from_secs(2);
/// A SHIPPED order with no commerce propagation after this long is stuck.
const STUCK_FULFILLMENT_AGE_MINS: i64 = 60;

struct ChannelState {
    channel: Channel,
    /// Set when the platform rejected our credentials; cleared when the
    /// credentials row changes (re-authorization).
    revoked: bool,
}

struct Core {
    db: Database,
    enqueuer: Arc<dyn Enqueuer>,
    lifecycle: Arc<OrderLifecycle>,
    processor: Arc<WebhookProcessor>,
    ffn_factory: Arc<dyn FfnFactory>,
    commerce_factory: Arc<dyn CommerceFactory>,
    config: Config,
    channel_states: Mutex<HashMap<String, ChannelState>>,
}

pub struct Scheduler {
    core: Arc<Core>,
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: Database,
        enqueuer: Arc<dyn Enqueuer>,
        lifecycle: Arc<OrderLifecycle>,
        processor: Arc<WebhookProcessor>,
        ffn_factory: Arc<dyn FfnFactory>,
        commerce_factory: Arc<dyn CommerceFactory>,
        config: Config,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            core: Arc::new(Core {
                db,
                enqueuer,
                lifecycle,
                processor,
                ffn_factory,
                commerce_factory,
                config,
                channel_states: Mutex::new(HashMap::new()),
            }),
            shutdown_tx,
            handles: Vec::new(),
        }
    }

    pub fn start(&mut self) {
        let config = self.core.config.clone();
        self.spawn_loop(config.incremental_sync_secs, |core, jid| async move {
            run_channel_sync(&core, &jid, false).await
        }, JOB_INCREMENTAL_SYNC);
        self.spawn_loop(config.full_sync_secs, |core, jid| async move {
            run_channel_sync(&core, &jid, true).await
        }, JOB_FULL_SYNC);
        self.spawn_loop(config.ffn_poll_secs, |core, jid| async move {
            run_ffn_poll(&core, &jid).await
        }, JOB_FFN_POLL);
        self.spawn_loop(config.token_refresh_secs, |core, jid| async move {
            run_token_refresh(&core, &jid).await
        }, JOB_TOKEN_REFRESH);
        self.spawn_loop(config.stock_sync_secs, |core, jid| async move {
            run_stock_sync(&core, &jid).await
        }, JOB_STOCK_SYNC);
        self.spawn_loop(config.inbound_poll_secs, |core, jid| async move {
            run_inbound_poll(&core, &jid).await
        }, JOB_INBOUND_POLL);
        self.spawn_loop(config.commerce_reconcile_secs, |core, jid| async move {
            run_commerce_reconcile(&core, &jid).await
        }, JOB_COMMERCE_RECONCILE);
        self.spawn_loop(config.paid_sweep_secs, |core, jid| async move {
            run_paid_sweep(&core, &jid).await
        }, JOB_PAID_SWEEP);

        info!(loops = self.handles.len(), "Scheduler started");
    }

    fn spawn_loop<F, Fut>(&mut self, period_secs: u64, tick: F, prefix: &'static str)
    where
        F: Fn(Arc<Core>, String) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let core = self.core.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        self.handles.push(tokio::spawn(async move {
            let mut ticker = interval(StdDuration::from_secs(period_secs.max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => break,
                }
                let jid = job_id(prefix);
                let started = std::time::Instant::now();
                match tick(core.clone(), jid.clone()).await {
                    Ok(()) => debug!(
                        job_id = %jid,
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Scheduler tick done"
                    ),
                    Err(e) => error!(job_id = %jid, error = %e, "Scheduler tick failed"),
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            debug!(prefix, "Scheduler loop stopped");
        }));
    }

    /// Signal all loops and wait for in-flight batches to drain.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
        info!("Scheduler drained");
    }
}

fn record_status(
    core: &Core,
    client_id: &str,
    job_name: &str,
    started: DateTime<Utc>,
    success: bool,
    details: serde_json::Value,
    error: Option<String>,
) {
    let status = CronJobStatus {
        client_id: client_id.to_string(),
        job_name: job_name.to_string(),
        last_run_at: started,
        success,
        duration_ms: (Utc::now() - started).num_milliseconds(),
        details,
        error: error.map(|e| crate::clients::truncate_body(&e, 200)),
    };
    if let Err(e) = core.db.upsert_cron_status(&status) {
        warn!(client_id, job_name, error = %e, "Failed to record cron status");
    }
}

/// Diff the DB channel set against the in-memory state map: newcomers join,
/// deactivated channels drop out, credential rotations clear the revoked
/// sentinel.
fn refresh_channel_states(core: &Core) -> anyhow::Result<Vec<Channel>> {
    let channels = core.db.list_syncable_channels()?;
    let mut states = core.channel_states.lock();

    let live_ids: HashSet<String> = channels.iter().map(|c| c.id.clone()).collect();
    states.retain(|id, _| {
        let keep = live_ids.contains(id);
        if !keep {
            info!(channel_id = %id, "Channel left the sync set");
        }
        keep
    });

    let mut active = Vec::new();
    for channel in channels {
        match states.get_mut(&channel.id) {
            None => {
                info!(channel_id = %channel.id, channel_type = channel.channel_type.as_str(), "Channel joined the sync set");
                states.insert(
                    channel.id.clone(),
                    ChannelState {
                        channel: channel.clone(),
                        revoked: false,
                    },
                );
                active.push(channel);
            }
            Some(state) => {
                if state.channel.api_credentials != channel.api_credentials {
                    info!(channel_id = %channel.id, "Channel credentials rotated, clearing revoked flag");
                    state.revoked = false;
                }
                state.channel = channel.clone();
                if state.revoked {
                    debug!(channel_id = %channel.id, "Skipping channel with revoked credentials");
                } else {
                    active.push(channel);
                }
            }
        }
    }
    Ok(active)
}

fn mark_channel_revoked(core: &Core, channel_id: &str) {
    if let Some(state) = core.channel_states.lock().get_mut(channel_id) {
        state.revoked = true;
    }
}

/// Incremental (and, with `full`, the daily drift-repairing) commerce sync.
async fn run_channel_sync(core: &Arc<Core>, jid: &str, full: bool) -> anyhow::Result<()> {
    let channels = refresh_channel_states(core)?;
    if channels.is_empty() {
        return Ok(());
    }
    let job_name = if full { JOB_FULL_SYNC } else { JOB_INCREMENTAL_SYNC };

    // Per-tenant tallies across the channel batches.
    let mut tenant_counts: HashMap<String, (usize, usize, Option<String>)> = HashMap::new();
    let started = Utc::now();

    for batch in channels.chunks(core.config.max_concurrent_syncs.max(1)) {
        let mut handles = Vec::with_capacity(batch.len());
        for channel in batch {
            let core = core.clone();
            let channel = channel.clone();
            let jid = jid.to_string();
            handles.push(tokio::spawn(async move {
                let result = sync_one_channel(&core, &channel, full, &jid).await;
                (channel, result)
            }));
        }

        for handle in handles {
            let Ok((channel, result)) = handle.await else {
                continue;
            };
            let entry = tenant_counts
                .entry(channel.client_id.clone())
                .or_insert((0, 0, None));
            match result {
                Ok((orders, products)) => {
                    entry.0 += orders;
                    entry.1 += products;
                }
                Err(e) => {
                    if matches!(
                        &e,
                        SyncError::CommerceApi { status: 401, .. }
                            | SyncError::CommerceApi { status: 403, .. }
                    ) {
                        warn!(job_id = %jid, channel_id = %channel.id, "Commerce credentials rejected, marking channel revoked");
                        mark_channel_revoked(core, &channel.id);
                    }
                    warn!(job_id = %jid, channel_id = %channel.id, error = %e, "Channel sync failed");
                    entry.2 = Some(e.to_string());
                }
            }
        }

        tokio::time::sleep(BATCH_GAP).await;
    }

    for (client_id, (orders, products, error)) in tenant_counts {
        record_status(
            core,
            &client_id,
            job_name,
            started,
            error.is_none(),
            json!({ "orders": orders, "products": products, "full": full }),
            error,
        );
    }
    Ok(())
}

async fn sync_one_channel(
    core: &Core,
    channel: &Channel,
    full: bool,
    jid: &str,
) -> Result<(usize, usize), SyncError> {
    let client = core.commerce_factory.client_for(channel)?;
    let poll_started = Utc::now();

    let order_since = if full {
        None
    } else {
        channel
            .last_order_poll_at
            .map(|at| at - Duration::minutes(CURSOR_OVERLAP_MINS))
    };
    let orders = client.list_orders_since(order_since).await?;
    let mut order_count = 0usize;
    for order in orders {
        match core
            .processor
            .ingest_order(&channel.client_id, &channel.id, channel.channel_type, order)
        {
            Ok(_) => order_count += 1,
            Err(SyncError::Validation(message)) => {
                debug!(job_id = %jid, channel_id = %channel.id, %message, "Skipping unmappable polled order");
            }
            Err(e) => return Err(e),
        }
    }
    if !full {
        core.db
            .set_channel_order_cursor(&channel.id, poll_started)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
    }

    let product_since = if full {
        None
    } else {
        channel
            .last_product_poll_at
            .map(|at| at - Duration::minutes(CURSOR_OVERLAP_MINS))
    };
    let products = client.list_products_since(product_since).await?;
    let mut product_count = 0usize;
    for product in products {
        match core
            .processor
            .ingest_product(&channel.client_id, &channel.id, &product)
        {
            Ok(_) => product_count += 1,
            Err(SyncError::Validation(message)) => {
                debug!(job_id = %jid, channel_id = %channel.id, %message, "Skipping unmappable polled product");
            }
            Err(e) => return Err(e),
        }
    }
    if !full {
        core.db
            .set_channel_product_cursor(&channel.id, poll_started)
            .map_err(|e| SyncError::Storage(e.to_string()))?;
    }

    info!(
        job_id = %jid,
        channel_id = %channel.id,
        orders = order_count,
        products = product_count,
        full,
        "Channel sync finished"
    );
    Ok((order_count, product_count))
}

fn active_ffn_tenants(core: &Core) -> anyhow::Result<Vec<(FfnConfig, Arc<dyn FfnApi>)>> {
    let mut tenants = Vec::new();
    for config in core.db.list_active_ffn_configs()? {
        match core.ffn_factory.client_for(&config) {
            Ok(client) => tenants.push((config, client)),
            Err(e) => warn!(client_id = %config.client_id, error = %e, "Cannot build FFN client"),
        }
    }
    Ok(tenants)
}

/// React to a TokenRevoked surfacing from any FFN call: deactivate the
/// config and tell the tenant. The config dropping out of the active set is
/// what stops all further FFN work.
fn handle_token_revoked(core: &Core, client_id: &str) {
    warn!(client_id, "FFN refresh token revoked, deactivating configuration");
    if let Err(e) = core.db.set_ffn_config_active(client_id, false) {
        error!(client_id, error = %e, "Failed to deactivate FFN config");
    }
    let _ = core.db.add_notification(
        client_id,
        "token_revoked",
        "The fulfillment network rejected the stored refresh token. Re-authorize the integration to resume syncing.",
    );
}

/// Drain outbound and return updates for every active tenant.
async fn run_ffn_poll(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    for (config, client) in active_ffn_tenants(core)? {
        let started = Utc::now();
        let outbound = core
            .lifecycle
            .poll_outbound_updates(&config.client_id, client.as_ref(), jid)
            .await;
        let returns = match &outbound {
            Err(SyncError::TokenRevoked(_)) => Ok(0),
            _ => {
                core.lifecycle
                    .poll_return_updates(&config.client_id, client.as_ref(), jid)
                    .await
            }
        };

        match (&outbound, &returns) {
            (Ok(outbounds), Ok(rets)) => record_status(
                core,
                &config.client_id,
                JOB_FFN_POLL,
                started,
                true,
                json!({ "outbound_updates": outbounds, "return_updates": rets }),
                None,
            ),
            _ => {
                let error = outbound
                    .as_ref()
                    .err()
                    .or(returns.as_ref().err())
                    .map(|e| e.to_string());
                if matches!(&outbound, Err(SyncError::TokenRevoked(_)))
                    || matches!(&returns, Err(SyncError::TokenRevoked(_)))
                {
                    handle_token_revoked(core, &config.client_id);
                }
                record_status(
                    core,
                    &config.client_id,
                    JOB_FFN_POLL,
                    started,
                    false,
                    json!({}),
                    error,
                );
            }
        }
    }
    Ok(())
}

/// Proactive token refresh so access tokens never expire mid-batch.
async fn run_token_refresh(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    for (config, client) in active_ffn_tenants(core)? {
        if config.refresh_token.is_none() {
            debug!(job_id = %jid, client_id = %config.client_id, "No refresh token, skipping proactive refresh");
            continue;
        }
        let started = Utc::now();
        match client.force_refresh().await {
            Ok(()) => {
                record_status(
                    core,
                    &config.client_id,
                    JOB_TOKEN_REFRESH,
                    started,
                    true,
                    json!({}),
                    None,
                );
            }
            Err(SyncError::TokenRevoked(message)) => {
                handle_token_revoked(core, &config.client_id);
                record_status(
                    core,
                    &config.client_id,
                    JOB_TOKEN_REFRESH,
                    started,
                    false,
                    json!({ "revoked": true }),
                    Some(message),
                );
            }
            Err(e) => {
                warn!(job_id = %jid, client_id = %config.client_id, error = %e, "Token refresh failed");
                record_status(
                    core,
                    &config.client_id,
                    JOB_TOKEN_REFRESH,
                    started,
                    false,
                    json!({}),
                    Some(e.to_string()),
                );
            }
        }
    }
    Ok(())
}

/// Safety net: reconcile FFN stock levels into canonical products.
async fn run_stock_sync(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    for (config, client) in active_ffn_tenants(core)? {
        let started = Utc::now();
        match sync_tenant_stock(core, &config.client_id, client.as_ref()).await {
            Ok((matched, unknown)) => record_status(
                core,
                &config.client_id,
                JOB_STOCK_SYNC,
                started,
                true,
                json!({ "updated": matched, "unknown_skus": unknown }),
                None,
            ),
            Err(e) => {
                if matches!(&e, SyncError::TokenRevoked(_)) {
                    handle_token_revoked(core, &config.client_id);
                }
                warn!(job_id = %jid, client_id = %config.client_id, error = %e, "Stock sync failed");
                record_status(
                    core,
                    &config.client_id,
                    JOB_STOCK_SYNC,
                    started,
                    false,
                    json!({}),
                    Some(e.to_string()),
                );
            }
        }
    }
    Ok(())
}

async fn sync_tenant_stock(
    core: &Core,
    client_id: &str,
    client: &dyn FfnApi,
) -> Result<(usize, usize), SyncError> {
    let stocks = client.get_all_products_with_stock().await?;
    let mut matched = 0usize;
    let mut unknown = 0usize;
    for stock in stocks {
        let updated = core
            .db
            .update_product_stock(
                client_id,
                &stock.merchant_sku,
                stock.stock_level,
                stock.stock_level_reserved,
            )
            .map_err(|e| SyncError::Storage(e.to_string()))?;
        if updated {
            matched += 1;
        } else {
            unknown += 1;
        }
    }
    Ok((matched, unknown))
}

/// Watch for inbounds closing; a closed inbound means stock changed, so the
/// affected tenant gets an immediate stock sync instead of waiting for the
/// 15-minute net.
async fn run_inbound_poll(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    for (config, client) in active_ffn_tenants(core)? {
        let started = Utc::now();
        let now = Utc::now();
        let cursor = core
            .db
            .get_cursor(&config.client_id, "inbound-poll")?
            .unwrap_or(now - Duration::hours(24));

        let mut query = UpdatesQuery {
            from: cursor - Duration::minutes(CURSOR_OVERLAP_MINS),
            to: now,
            page: 1,
        };

        let mut closed = 0usize;
        let mut failed: Option<String> = None;
        loop {
            match client.get_inbound_updates(&query).await {
                Ok(page) => {
                    closed += page
                        .data
                        .iter()
                        .filter(|u| u.status == "Closed" || u.status == "CLOSED")
                        .count();
                    if !page.more_data_available {
                        break;
                    }
                    query.page += 1;
                }
                Err(e) => {
                    if matches!(&e, SyncError::TokenRevoked(_)) {
                        handle_token_revoked(core, &config.client_id);
                    }
                    failed = Some(e.to_string());
                    break;
                }
            }
        }

        if failed.is_none() {
            core.db.set_cursor(&config.client_id, "inbound-poll", now)?;
            if closed > 0 {
                info!(job_id = %jid, client_id = %config.client_id, closed, "Inbounds closed, triggering stock sync");
                if let Err(e) = sync_tenant_stock(core, &config.client_id, client.as_ref()).await {
                    warn!(job_id = %jid, client_id = %config.client_id, error = %e, "Triggered stock sync failed");
                }
            }
        }

        let success = failed.is_none();
        record_status(
            core,
            &config.client_id,
            JOB_INBOUND_POLL,
            started,
            success,
            json!({ "closed_inbounds": closed }),
            failed,
        );
    }
    Ok(())
}

/// Repair commerce propagation: shipped orders whose fulfill attempt failed,
/// plus shipped orders nothing ever picked up.
async fn run_commerce_reconcile(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    let started = Utc::now();
    let candidates = core.db.find_commerce_reconcile_candidates(20)?;
    let mut per_tenant: HashMap<String, usize> = HashMap::new();

    for order in &candidates {
        let enqueued = core.enqueuer.enqueue(
            ORDER_SYNC_TO_COMMERCE,
            json!({ "order_id": order.id, "operation": "fulfill" }),
            JobOptions {
                singleton_key: Some(commerce_fulfill_key(&order.id)),
                priority: -1,
                retry_limit: 5,
                retry_delay_secs: 30,
                retry_backoff: true,
                ..Default::default()
            },
        );
        match enqueued {
            Ok(Some(_)) => {
                *per_tenant.entry(order.client_id.clone()).or_default() += 1;
            }
            Ok(None) => {
                debug!(job_id = %jid, order_id = %order.id, "Reconcile enqueue skipped, job already live");
            }
            Err(e) => warn!(job_id = %jid, order_id = %order.id, error = %e, "Reconcile enqueue failed"),
        }
    }

    // Stuck-fulfillment pass per tenant: shipped, never propagated, no error
    // recorded, old enough that the normal path clearly missed it.
    let cutoff = Utc::now() - Duration::minutes(STUCK_FULFILLMENT_AGE_MINS);
    for tenant in core.db.list_tenants()? {
        let stuck = core.db.find_shipped_unpropagated(&tenant.id, cutoff)?;
        for order in &stuck {
            let enqueued = core.enqueuer.enqueue(
                ORDER_SYNC_TO_COMMERCE,
                json!({ "order_id": order.id, "operation": "fulfill" }),
                JobOptions {
                    singleton_key: Some(commerce_fulfill_key(&order.id)),
                    priority: -1,
                    retry_limit: 5,
                    retry_delay_secs: 30,
                    retry_backoff: true,
                    ..Default::default()
                },
            );
            if let Ok(Some(_)) = enqueued {
                *per_tenant.entry(order.client_id.clone()).or_default() += 1;
            }
        }
    }

    for (client_id, requeued) in per_tenant {
        record_status(
            core,
            &client_id,
            JOB_COMMERCE_RECONCILE,
            started,
            true,
            json!({ "requeued": requeued }),
            None,
        );
    }
    Ok(())
}

/// Safety net behind the payment gate: paid orders that never reached the
/// FFN get re-enqueued, webhook or no webhook.
async fn run_paid_sweep(core: &Arc<Core>, jid: &str) -> anyhow::Result<()> {
    let started = Utc::now();
    let orders = core.db.find_paid_unsynced(50)?;
    if orders.is_empty() {
        return Ok(());
    }

    let mut per_tenant: HashMap<String, usize> = HashMap::new();
    for order in &orders {
        let enqueued = core.enqueuer.enqueue(
            ORDER_SYNC_TO_FFN,
            json!({ "order_id": order.id, "operation": "create" }),
            JobOptions {
                singleton_key: Some(ffn_sync_key(&order.id)),
                priority: -1,
                retry_limit: 3,
                retry_delay_secs: 60,
                retry_backoff: true,
                expire_in_secs: 3600,
                start_after: None,
            },
        );
        match enqueued {
            Ok(Some(_)) => {
                *per_tenant.entry(order.client_id.clone()).or_default() += 1;
            }
            Ok(None) => {
                debug!(job_id = %jid, order_id = %order.id, "Sweep enqueue skipped, job already live");
            }
            Err(e) => warn!(job_id = %jid, order_id = %order.id, error = %e, "Sweep enqueue failed"),
        }
    }

    for (client_id, swept) in per_tenant {
        info!(job_id = %jid, client_id = %client_id, swept, "Paid-order sweep enqueued syncs");
        record_status(
            core,
            &client_id,
            JOB_PAID_SWEEP,
            started,
            true,
            json!({ "swept": swept }),
            None,
        );
    }
    Ok(())
}
