//! epinet-agg - Epinet aggregation microservice
//!
//! Serves hourly funnel aggregates over HTTP + SSE and keeps them fresh with a
//! background refresh ticker.

use anyhow::{Context, Result};
use clap::Parser;
use epinet_common::config::{load_config, TomlConfig};
use epinet_common::events::EventBus;
use epinet_common::time::SystemClock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use epinet_agg::db::{connect_readonly, SqliteSourceProvider};
use epinet_agg::orchestrator::LoadOrchestrator;
use epinet_agg::store::MemoryStore;
use epinet_agg::AppState;

/// Command-line arguments for epinet-agg
#[derive(Parser, Debug)]
#[command(name = "epinet-agg")]
#[command(about = "Hourly funnel aggregation service")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "EPINET_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on (overrides the config file)
    #[arg(short, long, env = "EPINET_PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(port) = args.port {
        config.port = port;
    }

    let level = config.logging.level.clone();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("epinet_agg={level},epinet_common={level},tower_http=info").into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting epinet-agg on port {}", config.port);
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let sources = open_tenant_sources(&config).await?;
    let event_bus = EventBus::new(100);

    let orchestrator = Arc::new(LoadOrchestrator::new(
        Arc::new(sources),
        Arc::new(MemoryStore::new()),
        Arc::new(SystemClock),
        event_bus.clone(),
        config.aggregation.clone(),
    ));

    spawn_refresh_ticker(Arc::clone(&orchestrator), config.aggregation.tenants.clone(), &config);

    let state = AppState::new(orchestrator, event_bus, config.sankey.max_nodes);
    let app = epinet_agg::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.bind_address, config.port)
        .parse()
        .context("Invalid bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on http://{}", addr);
    info!("Health check: http://{}/health", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");
    Ok(())
}

/// Open one read-only pool per configured tenant
async fn open_tenant_sources(config: &TomlConfig) -> Result<SqliteSourceProvider> {
    let mut provider = SqliteSourceProvider::new();
    for tenant in &config.aggregation.tenants {
        let path = config.database_path_for(tenant);
        let pool = connect_readonly(path)
            .await
            .with_context(|| format!("Failed to open database for tenant {tenant}"))?;
        info!(tenant_id = %tenant, "Database: {}", path.display());
        provider = provider.with_tenant(tenant.clone(), pool);
    }
    Ok(provider)
}

/// Refresh every tenant on a fixed interval; throttling absorbs extra ticks
fn spawn_refresh_ticker(orchestrator: Arc<LoadOrchestrator>, tenants: Vec<String>, config: &TomlConfig) {
    let period = config.aggregation.refresh_interval();
    info!(?period, tenants = tenants.len(), "Background refresh ticker started");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            for tenant in &tenants {
                orchestrator.trigger_refresh(tenant);
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to install terminate handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
