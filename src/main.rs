/// Fieldflow: telemetry ingestion and flow automation engine
///
/// Main entry point for the fieldflow server. Initializes configuration and
/// starts the HTTP server with the ingest endpoint and flow execution engine.

use fieldflow::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Telemetry ingest at /api/v1/ingest/chirpstack
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
