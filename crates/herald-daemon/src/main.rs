use std::sync::Arc;

use clap::Parser;
use herald_channels::{ChannelRegistry, DeliveryManager, InAppChannel};
use herald_core::HeraldConfig;
use herald_scheduler::{Repositories, Scheduler, SectionResolver, SqliteStore, TeraRenderer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Content type whose templates render from the base data alone.
const STATIC_CONTENT_TYPE: &str = "static";

#[derive(Debug, Parser)]
#[command(name = "herald-daemon", version, about = "Cron-driven notification delivery")]
struct Cli {
    /// Path to herald.toml (defaults to $HERALD_CONFIG, then ~/.herald/herald.toml).
    #[arg(long, short)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald_daemon=info,herald_scheduler=info,herald_channels=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > HERALD_CONFIG env > ~/.herald/herald.toml
    let config_path = cli.config.or_else(|| std::env::var("HERALD_CONFIG").ok());
    let config = HeraldConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(error = %e, "config load failed, using defaults");
        HeraldConfig::default()
    });

    let db_path = &config.database.path;
    ensure_parent_dir(db_path);
    info!(path = %db_path, "opening SQLite database");
    let store = Arc::new(SqliteStore::open(db_path)?);

    // channels: HTTP transports share one client, in-app writes to the store
    let client = reqwest::Client::builder()
        .user_agent(concat!("herald/", env!("CARGO_PKG_VERSION")))
        .build()?;
    let mut registry = ChannelRegistry::with_http_channels(client);
    registry.register(Arc::new(InAppChannel::new(store.clone())));
    warn!("no mail transport configured, email channel disabled");
    info!(channels = ?registry.names(), "delivery channels ready");

    let manager = Arc::new(DeliveryManager::new(Arc::new(registry), &config.delivery));

    let mut resolver =
        SectionResolver::new().with_server(&config.content.server_name, &config.content.server_url);
    resolver.register_type(STATIC_CONTENT_TYPE);

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        Repositories::from_store(store),
        manager,
        Arc::new(resolver),
        Arc::new(TeraRenderer::new()),
    );

    let shutdown = CancellationToken::new();
    scheduler.start(&shutdown)?;

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    scheduler.stop().await;
    shutdown.cancel();
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
