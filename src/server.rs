/// Server setup and initialization
///
/// Wires together all components: store, sandbox, worker pool, scheduler,
/// presence registry, and HTTP routes.

use crate::{
    api::{create_dashboard_routes, create_socket_routes, AppState},
    config::{Config, EngineConfig},
    presence::{EventBus, PresenceRegistry},
    runtime::{ExecutionPool, OutcomeProcessor, ResultAwaiter, WidgetScheduler},
    sandbox::{PassthroughCodec, ReqwestHttp, SandboxCapabilities, SandboxRunner, SecretCodec},
    store::{SqliteWidgetStore, WidgetStore},
};
use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Assemble the engine around a store
///
/// Everything shares one shutdown token; cancelling it stops every schedule
/// and every in-flight await.
pub fn build_state(
    engine: &EngineConfig,
    store: Arc<dyn WidgetStore>,
    codec: Arc<dyn SecretCodec>,
    capabilities: SandboxCapabilities,
) -> AppState {
    let shutdown = CancellationToken::new();
    let events = Arc::new(EventBus::default());

    tracing::info!("🧪 Initializing sandbox runner");
    let runner = SandboxRunner::new(codec, capabilities).with_memory_limit(engine.script_memory_limit);
    let pool = Arc::new(ExecutionPool::new(Arc::new(runner), engine.worker_pool_size));

    let outcomes = Arc::new(OutcomeProcessor::new(Arc::clone(&store), Arc::clone(&events)));
    let awaiter = Arc::new(ResultAwaiter::new(
        outcomes.clone(),
        engine.min_timeout(),
        engine.max_process_attempts,
        shutdown.clone(),
    ));

    tracing::info!("⏰ Initializing widget scheduler");
    let scheduler = WidgetScheduler::new(Arc::clone(&store), pool, awaiter, shutdown);

    tracing::info!("👀 Initializing presence registry");
    let presence = Arc::new(PresenceRegistry::new(
        Arc::clone(&store),
        Arc::new(scheduler.clone()),
        Arc::clone(&events),
    ));

    AppState {
        store,
        presence,
        scheduler,
        outcomes,
        events,
    }
}

/// Create the main Axum router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(create_dashboard_routes())
        .merge(create_socket_routes())
        .with_state(state)
}

/// Create the application backed by the SQLite store
pub async fn create_app(config: &Config) -> Result<(Router, AppState)> {
    tracing::info!("📁 Opening data directory: {}", config.database.data_dir);
    let store = SqliteWidgetStore::connect(&config.database.data_dir)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open widget database: {}", e))?;

    tracing::info!("🌐 Initializing script HTTP capability");
    let http = ReqwestHttp::new(config.engine.http_timeout())
        .map_err(|e| anyhow::anyhow!("Failed to initialize HTTP capability: {}", e))?;

    // Secrets are stored in clear until the CRUD layer provides its codec
    let codec: Arc<dyn SecretCodec> = Arc::new(PassthroughCodec);

    let state = build_state(
        &config.engine,
        Arc::new(store),
        codec,
        SandboxCapabilities::with_http(Arc::new(http)),
    );

    tracing::info!("✅ Application initialized successfully");
    Ok((create_router(state.clone()), state))
}

/// Initialize the tracing subscriber (`RUST_LOG`, default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .try_init();
}

/// Start the HTTP server with the given configuration
///
/// Stops every schedule when the process receives Ctrl-C.
pub async fn start_server(config: Config) -> Result<()> {
    init_tracing();
    tracing::info!("Starting Pulseboard server...");

    let (app, state) = create_app(&config).await?;

    let bind_addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on http://{}", bind_addr);

    let scheduler = state.scheduler.clone();
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("❌ Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
            scheduler.shutdown();
        })
        .await?;

    Ok(())
}
