use anyhow::Result;
use std::sync::Arc;
use tether_core::{
    advisory::{AdvisoryRefresher, AdvisoryStore},
    audit::TracingAuditSink,
    client::{ConnectionManager, SessionContext},
    config::AppConfig,
    metrics::ProxyMetrics,
    registry::HealthRegistry,
};
use tokio::{net::TcpListener, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod admin;

/// Initializes the logging system based on the configuration.
fn init_logging(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,tether_core={level},server={level},audit=info",
            level = config.logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format.as_str() == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer().pretty().with_target(false)).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load().map_err(|e| anyhow::anyhow!("configuration error: {e}"))?;
    init_logging(&config);
    info!(uplinks = config.uplinks.len(), "starting tether proxy");

    let advisory = Arc::new(AdvisoryStore::new());
    AdvisoryRefresher::new(advisory.clone(), config.advisory.clone()).spawn();

    let ctx = SessionContext {
        registry: Arc::new(HealthRegistry::new(config.penalty.clone())),
        advisory,
        audit: Arc::new(TracingAuditSink),
        metrics: Arc::new(ProxyMetrics::new()),
        config: Arc::new(config),
    };
    let manager = ConnectionManager::new(ctx.clone());

    let proxy_addr = ctx.config.socket_addr().map_err(|e| anyhow::anyhow!(e))?;
    let proxy_listener = TcpListener::bind(proxy_addr).await?;
    info!(%proxy_addr, "proxy listener bound");
    tokio::spawn(manager.clone().serve(proxy_listener));

    let admin_addr = ctx.config.admin_addr().map_err(|e| anyhow::anyhow!(e))?;
    let admin_listener = TcpListener::bind(admin_addr).await?;
    info!(%admin_addr, "admin listener bound");
    let admin_router = admin::router(manager);
    tokio::spawn(async move {
        if let Err(error) = axum::serve(admin_listener, admin_router).await {
            tracing::error!(%error, "admin server failed");
        }
    });

    signal::ctrl_c().await?;
    info!("shutdown signal received");
    Ok(())
}
