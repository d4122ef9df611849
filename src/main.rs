/// Pulseboard: presence-driven widget script engine for live dashboards
///
/// Main entry point for the Pulseboard server. Initializes configuration and
/// starts the HTTP server.

use pulseboard::{config::Config, server::start_server};

/// Application entry point
///
/// The server provides:
/// - Viewer WebSocket sessions at /ws
/// - Operational endpoints at /api/*
/// - Health check at /healthz
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration (defaults to 0.0.0.0:3004 and ./data/pulseboard.db)
    let config = Config::default();

    start_server(config).await?;

    Ok(())
}
