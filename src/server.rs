/// Server setup and initialization
///
/// Wires together all components: database pool, entity and history stores,
/// the flow engine, and the HTTP routes. Provides the main application
/// factory function for creating the axum app.

use crate::{
    api::{ingest::create_ingest_routes, AppState},
    config::Config,
    engine::FlowEngine,
    flow::{presence::DevicePresence, store::EntityStore},
    history::store::HistoryStore,
};
use anyhow::Result;
use axum::{routing::get, Router};
use sqlx::sqlite::SqlitePoolOptions;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Create the main axum application with all routes and state
///
/// Initializes the database schema, builds the engine with the configured
/// execution budgets, and wires everything into a router.
pub async fn create_app(config: Config) -> Result<Router> {
    tracing::info!("🗄️ Connecting to database: {}", config.database.url);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database.url)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open database '{}': {}", config.database.url, e))?;

    tracing::info!("📋 Initializing entity store");
    let store = Arc::new(EntityStore::new(pool.clone()));
    store.init_schema().await?;

    tracing::info!("🧾 Initializing history store");
    let history = Arc::new(HistoryStore::new(pool));
    history.init_schema().await?;

    tracing::info!(
        "⚙️ Initializing flow engine (script budget {}ms, http {}s, mqtt {}s)",
        config.engine.script_timeout_ms,
        config.engine.http_timeout_secs,
        config.engine.mqtt_timeout_secs
    );
    let engine = Arc::new(FlowEngine::new(
        Arc::clone(&store),
        Arc::clone(&history),
        config.engine.script_timeout(),
        config.engine.http_timeout(),
        config.engine.mqtt_timeout(),
    ));

    let state = AppState {
        store,
        history,
        engine,
        presence: Arc::new(DevicePresence::new()),
        api_key: config.auth.api_key.clone(),
    };

    if state.api_key.is_empty() {
        tracing::warn!("🔓 FIELDFLOW_API_KEY is not set, all ingest requests will be rejected");
    }

    tracing::info!("📡 Creating HTTP router");
    let app = Router::new()
        .route("/healthz", get(health_check))
        .merge(create_ingest_routes().with_state(state));

    tracing::info!("✅ Application initialized successfully");

    Ok(app)
}

/// Start the HTTP server with the given configuration
pub async fn start_server(config: Config) -> Result<()> {
    // Initialize tracing subscriber for logging
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    tracing::info!("Starting fieldflow server...");

    let app = create_app(config.clone()).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;

    tracing::info!("Server listening on http://{}", bind_addr);

    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}

/// Health check endpoint handler
async fn health_check() -> &'static str {
    "ok"
}
