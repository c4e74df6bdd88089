//! OrderBridge - commerce to fulfillment-network sync broker.
//!
//! Composition root: configuration, store, durable queue, worker pool,
//! scheduler loops, and the webhook ingress. One process per deployment
//! should run with the scheduler role; additional web-only replicas may
//! serve ingress.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use orderbridge_backend::clients::commerce::CommerceFactory;
use orderbridge_backend::clients::ffn::FfnFactory;
use orderbridge_backend::factories::{LiveCommerceFactory, LiveFfnFactory};
use orderbridge_backend::jobs::{
    CommerceOrderSyncHandler, FfnOrderSyncHandler, ProductSyncHandler, ReturnSyncHandler,
};
use orderbridge_backend::lifecycle::OrderLifecycle;
use orderbridge_backend::models::Config;
use orderbridge_backend::queue::worker::WorkerPool;
use orderbridge_backend::queue::{
    Enqueuer, JobQueue, ORDER_SYNC_TO_COMMERCE, ORDER_SYNC_TO_FFN, PRODUCT_SYNC_TO_FFN,
    RETURN_SYNC_TO_FFN,
};
use orderbridge_backend::scheduler::Scheduler;
use orderbridge_backend::webhooks::{router, AppState, WebhookProcessor};
use orderbridge_backend::{CredentialVault, Database};

#[derive(Parser, Debug)]
#[command(name = "orderbridge", about = "Order-fulfillment sync broker")]
struct Args {
    /// Override PROCESS_ROLE (web | scheduler | all).
    #[arg(long)]
    role: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,orderbridge_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    if let Some(role) = args.role {
        std::env::set_var("PROCESS_ROLE", role);
    }

    let config = Config::from_env().context("load configuration")?;
    let vault = CredentialVault::from_hex_key(&config.encryption_key)
        .map_err(|e| anyhow::anyhow!("{e}"))
        .context("load encryption key")?;

    let db = Database::open(&config.database_url).context("open canonical store")?;
    let queue = Arc::new(JobQueue::new(db.clone()).context("init job queue")?);
    let enqueuer: Arc<dyn Enqueuer> = queue.clone();

    let ffn_factory: Arc<dyn FfnFactory> =
        Arc::new(LiveFfnFactory::new(db.clone(), vault.clone()));
    let commerce_factory: Arc<dyn CommerceFactory> = Arc::new(LiveCommerceFactory::new(vault));

    let lifecycle = Arc::new(OrderLifecycle::new(
        db.clone(),
        enqueuer.clone(),
        ffn_factory.clone(),
        commerce_factory.clone(),
    ));
    let processor = Arc::new(WebhookProcessor::new(db.clone(), enqueuer.clone()));

    // Workers: 3 per sync queue, 1 for the low-volume return queue.
    let mut pool = WorkerPool::new(queue.clone());
    pool.register(
        ORDER_SYNC_TO_FFN,
        3,
        Arc::new(FfnOrderSyncHandler::new(lifecycle.clone())),
    );
    pool.register(
        ORDER_SYNC_TO_COMMERCE,
        3,
        Arc::new(CommerceOrderSyncHandler::new(lifecycle.clone())),
    );
    pool.register(
        PRODUCT_SYNC_TO_FFN,
        3,
        Arc::new(ProductSyncHandler::new(lifecycle.clone())),
    );
    pool.register(
        RETURN_SYNC_TO_FFN,
        1,
        Arc::new(ReturnSyncHandler::new(lifecycle.clone())),
    );
    pool.start();

    let scheduler = if config.run_scheduler {
        let mut scheduler = Scheduler::new(
            db.clone(),
            enqueuer.clone(),
            lifecycle.clone(),
            processor.clone(),
            ffn_factory,
            commerce_factory,
            config.clone(),
        );
        scheduler.start();
        Some(scheduler)
    } else {
        info!("PROCESS_ROLE excludes the scheduler; running ingress + workers only");
        None
    };

    let state = AppState {
        db,
        queue: queue.clone(),
        processor,
    };
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("bind port {}", config.port))?;
    info!(port = config.port, "Webhook ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve ingress")?;

    // Drain before exit: scheduler first (stops producing), then workers.
    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    pool.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Shutdown signal received");
}
