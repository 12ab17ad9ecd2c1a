use std::sync::Arc;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use breach_wire::aggregator::{start_background_refresh, Aggregator};
use breach_wire::config::Config;
use breach_wire::db::Database;
use breach_wire::fetcher::HttpFetcher;
use breach_wire::routes::{self, AppState};
use breach_wire::store::{ItemStore, MemoryStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "breach_wire=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::var("FEEDS_CONFIG").unwrap_or_else(|_| "feeds.toml".to_string());
    let config = Config::load(&config_path)?;
    info!("Loaded {} sources from {}", config.sources.len(), config_path);

    let store: Arc<dyn ItemStore> = if config.demo_data {
        info!("Serving built-in demo data");
        Arc::new(MemoryStore::with_demo_data().await?)
    } else {
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:breach_wire.db?mode=rwc".to_string());
        let db = Database::new(&database_url).await?;
        db.initialize().await?;
        db.sync_sources(&config.sources).await?;
        info!("Database initialized");
        Arc::new(db)
    };

    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let aggregator = Arc::new(Aggregator::new(
        store.clone(),
        fetcher,
        config.fetch.clone(),
        config.ingest.clone(),
    ));

    // Start background refresh task
    if config.refresh_interval > 0 {
        let bg_aggregator = aggregator.clone();
        let refresh_interval = config.refresh_interval;
        tokio::spawn(async move {
            start_background_refresh(bg_aggregator, refresh_interval).await;
        });
    }

    let state = Arc::new(AppState { store, aggregator });
    let app = routes::router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!("Server starting on http://{}", config.server.bind);

    axum::serve(listener, app).await?;

    Ok(())
}
