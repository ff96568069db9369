//! Main Entrypoint for the Concierge Relay Service
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment.
//! 2. Initializing logging.
//! 3. Building the tool registry and the session manager.
//! 4. Constructing the Axum router and applying middleware.
//! 5. Starting the web server and draining live sessions on shutdown.

use anyhow::Context;
use concierge_api::{
    config::Config,
    router::create_router,
    state::AppState,
    ws::{
        SessionManager,
        provider::{RealtimeConnector, openai::RealtimeEndpoint},
        session::SessionSettings,
    },
};
use concierge_core::{
    SessionConfig, ToolRegistry,
    catalog::{CatalogStore, register_catalog_tools},
};
use std::{collections::HashMap, fs, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

/// Listens for the `Ctrl+C` signal to gracefully shut down the server.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// A helper function to load prompts from a directory.
fn load_prompts(prompts_path: &std::path::Path) -> anyhow::Result<HashMap<String, String>> {
    let mut prompts = HashMap::new();
    for entry in std::fs::read_dir(prompts_path)
        .with_context(|| format!("Failed to read prompts from {}", prompts_path.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some("md") {
            let prompt_key = path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Could not get file stem")?
                .to_string();
            let content = fs::read_to_string(&path)?;
            prompts.insert(prompt_key, content);
        }
    }
    Ok(prompts)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .init();
    info!("Configuration loaded. Initializing application state...");

    // --- 3. Initialize Tools and Sessions ---
    let prompts = load_prompts(&config.prompts_path)?;
    let instructions = prompts
        .get("system_prompt")
        .context("system_prompt.md not found in prompts directory")?
        .clone();

    let catalog = Arc::new(CatalogStore::demo());
    let registry = Arc::new(
        register_catalog_tools(ToolRegistry::builder(), catalog)
            .timeout(config.tool_timeout)
            .build()
            .context("Failed to build the tool registry")?,
    );
    info!(tools = registry.len(), "Tool registry ready.");

    let mut session_config = SessionConfig::new(instructions, registry.specs().to_vec());
    session_config.voice = config.voice.clone();
    let settings = Arc::new(SessionSettings {
        connect_timeout: config.connect_timeout,
        configure_timeout: config.configure_timeout,
        drain_grace: config.drain_grace,
        config: session_config,
    });

    let endpoint = RealtimeEndpoint::from_config(&config)?;
    info!(provider = ?config.provider, url = %endpoint.url(), "Upstream realtime endpoint configured.");
    let sessions = SessionManager::new(
        settings,
        Arc::clone(&registry),
        Arc::new(RealtimeConnector::new(endpoint)),
        config.max_sessions,
    );

    let app_state = Arc::new(AppState {
        config: Arc::new(config.clone()),
        registry,
        sessions: Arc::clone(&sessions),
    });

    // --- 4. Create Router and Apply Middleware ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(app_state).layer(cors);

    // --- 5. Start Server ---
    info!(
        provider = ?config.provider,
        bind_address = %config.bind_address,
        max_sessions = config.max_sessions,
        "Service configured. Starting server..."
    );
    let listener = tokio::net::TcpListener::bind(config.bind_address).await?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!(live = sessions.live_count(), "Listener stopped. Draining sessions...");
    sessions.shutdown().await;

    info!("Server has shut down.");
    Ok(())
}
