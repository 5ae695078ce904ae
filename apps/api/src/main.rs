use std::sync::Arc;

use anyhow::Context;
use chrono::Duration;
use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::trace::{self, TraceLayer};
use tracing::{Level, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use coordinator_cell::{
    BookingCoordinator, CoordinatorSettings, EscalationLedger, HttpCalendarClient, HttpMessagingClient,
    InMemoryEscalationLedger, RedisEscalationLedger, SessionReaper,
};
use negotiation_cell::{connect_redis_pool, InMemorySessionStore, RedisSessionStore, SessionStore};
use shared_config::AppConfig;

const REAPER_STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting follow-up scheduler");

    // Load configuration
    let config = AppConfig::from_env();
    if !config.is_gateway_configured() {
        warn!("Integration gateway is not configured; calendar and messaging calls will fail");
    }

    let audit_retention = Duration::days(config.scheduling.audit_retention_days);
    let (store, ledger): (Arc<dyn SessionStore>, Arc<dyn EscalationLedger>) = match &config.redis_url {
        Some(redis_url) => {
            let pool = connect_redis_pool(redis_url)
                .await
                .context("Failed to connect to Redis")?;
            info!("Using Redis session store");
            (
                Arc::new(RedisSessionStore::from_pool(
                    pool.clone(),
                    config.redis_key_prefix.clone(),
                    audit_retention,
                )) as Arc<dyn SessionStore>,
                Arc::new(RedisEscalationLedger::new(pool, &config.redis_key_prefix)) as Arc<dyn EscalationLedger>,
            )
        }
        None => {
            warn!("REDIS_URL not set, sessions will not survive a restart");
            (
                Arc::new(InMemorySessionStore::new(audit_retention)) as Arc<dyn SessionStore>,
                Arc::new(InMemoryEscalationLedger::new()) as Arc<dyn EscalationLedger>,
            )
        }
    };

    let settings = CoordinatorSettings::from_config(&config);
    let reaper_interval = settings.reaper_interval;
    let coordinator = Arc::new(BookingCoordinator::new(
        store,
        Arc::new(HttpCalendarClient::new(&config)),
        Arc::new(HttpMessagingClient::new(&config)),
        ledger,
        settings,
    ));

    // Background expiry sweep
    let reaper = SessionReaper::new(coordinator.clone(), reaper_interval);
    let mut reaper_task = {
        let reaper = reaper.clone();
        tokio::spawn(async move { reaper.start().await })
    };

    // Build the application router
    let app = router::create_router(coordinator)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new()
                    .level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new()
                    .level(Level::INFO)),
        );

    // Run the server
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_address))?;
    info!("Listening on {}", config.bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Stopping session reaper");
    reaper.shutdown().await;
    // The loop only sees the flag on its next tick.
    if tokio::time::timeout(REAPER_STOP_GRACE, &mut reaper_task).await.is_err() {
        reaper_task.abort();
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
