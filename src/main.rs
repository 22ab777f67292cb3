use std::{
    sync::Arc,
    time::Instant,
};

use axum::{
    routing::{delete, get, post, put},
    Router,
};
use tracing_subscriber::EnvFilter;

mod agents;
mod config;
mod error;
mod forwarder;
mod git;
mod hub;
mod mcp;
mod preview;
mod projects;
mod protocol;
mod rest;
mod runner;
mod sessions;
mod ws;

use agents::AgentStore;
use config::BridgeConfig;
use hub::ClientHub;
use mcp::McpStore;
use preview::PreviewManager;
use projects::ProjectConfigStore;
use runner::TurnRunner;
use sessions::SessionStore;

pub struct AppState {
    pub config: Arc<BridgeConfig>,
    pub started_at: Instant,
    pub hub: Arc<ClientHub>,
    pub sessions: Arc<SessionStore>,
    pub runner: Arc<TurnRunner>,
    pub previews: Arc<PreviewManager>,
    pub agents: Arc<AgentStore>,
    pub mcp: Arc<McpStore>,
    pub projects: Arc<ProjectConfigStore>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_dir = std::env::var("BRIDGE_CONFIG_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| BridgeConfig::default_dir());
    let config = match BridgeConfig::load(config_dir) {
        Ok(config) => Arc::new(config),
        Err(error) => {
            eprintln!("failed to load config: {error}");
            std::process::exit(1);
        }
    };

    let sessions = match SessionStore::load(config.sessions_file(), config.history_dir()) {
        Ok(sessions) => Arc::new(sessions),
        Err(error) => {
            eprintln!("failed to load sessions: {error}");
            std::process::exit(1);
        }
    };
    let mcp = match McpStore::load(config.mcp_servers_file()) {
        Ok(mcp) => Arc::new(mcp),
        Err(error) => {
            eprintln!("failed to load mcp servers: {error}");
            std::process::exit(1);
        }
    };

    let hub = Arc::new(ClientHub::new());
    let project_configs = Arc::new(ProjectConfigStore::new(config.projects_config_dir()));
    let runner = Arc::new(TurnRunner::new(
        config.clone(),
        sessions.clone(),
        mcp.clone(),
        project_configs.clone(),
        hub.clone(),
    ));
    let previews = Arc::new(PreviewManager::new());
    let agents = Arc::new(AgentStore::new(config.agents_dir()));

    let state = Arc::new(AppState {
        config: config.clone(),
        started_at: Instant::now(),
        hub,
        sessions,
        runner: runner.clone(),
        previews: previews.clone(),
        agents,
        mcp,
        projects: project_configs,
    });

    let app = Router::new()
        .route("/ws/chat", get(ws::ws_handler))
        .route("/health", get(rest::health))
        .route("/conversations", get(rest::list_conversations))
        .route("/conversations/active", get(rest::active_conversations))
        .route("/conversations/{id}", delete(rest::delete_conversation))
        .route("/conversations/{id}/history", get(rest::conversation_history))
        .route("/projects", get(rest::list_projects).post(rest::create_project))
        .route(
            "/projects/config",
            get(rest::get_project_config).put(rest::update_project_config),
        )
        .route("/preview/check/{id}", get(rest::preview_check))
        .route("/preview/start", post(rest::preview_start))
        .route("/preview/stop", post(rest::preview_stop))
        .route("/preview/restart", post(rest::preview_restart))
        .route("/preview/status", get(rest::preview_status))
        .route("/agents", get(rest::list_agents).post(rest::create_agent))
        .route(
            "/agents/{name}",
            get(rest::get_agent)
                .put(rest::update_agent)
                .delete(rest::delete_agent),
        )
        .route(
            "/mcp/servers",
            get(rest::list_mcp_servers).post(rest::add_mcp_server),
        )
        .route(
            "/mcp/servers/{name}",
            put(rest::update_mcp_server).delete(rest::delete_mcp_server),
        )
        .route("/mcp/servers/{name}/toggle", post(rest::toggle_mcp_server))
        .with_state(state);

    let bind_addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(error) => {
            eprintln!("failed to bind {bind_addr}: {error}");
            std::process::exit(1);
        }
    };

    let token_prefix: String = config.auth_token.chars().take(8).collect();
    tracing::info!(
        addr = %bind_addr,
        workdir = %config.working_dir.display(),
        token_prefix,
        "agent-bridge listening"
    );

    let serve = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });
    if let Err(error) = serve.await {
        eprintln!("server error: {error}");
        std::process::exit(1);
    }

    // Shut down child processes before exiting so dev servers and agent
    // turns do not outlive the bridge.
    previews.stop_all().await;
    runner.cancel_all().await;
}
