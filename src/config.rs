use std::{
    env, fs,
    path::{Path, PathBuf},
};

use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_AGENT_BIN: &str = "claude";

/// Persisted server configuration, generated on first run.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredConfig {
    auth_token: String,
    host: String,
    port: u16,
    working_dir: String,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    /// Projects root; conversations without an explicit working dir run here.
    pub working_dir: PathBuf,
    /// Agent CLI binary, e.g. `claude`.
    pub agent_bin: String,
    pub auth_token: String,
    config_dir: PathBuf,
}

impl BridgeConfig {
    /// Loads `<config_dir>/config.json`, generating it (with a fresh auth
    /// token) on first run. Environment variables override the stored values.
    pub fn load(config_dir: PathBuf) -> Result<Self, BridgeError> {
        fs::create_dir_all(&config_dir)?;
        let config_file = config_dir.join("config.json");

        let stored = if config_file.exists() {
            serde_json::from_str::<StoredConfig>(&fs::read_to_string(&config_file)?)?
        } else {
            let stored = StoredConfig {
                auth_token: uuid::Uuid::new_v4().simple().to_string(),
                host: DEFAULT_HOST.to_string(),
                port: DEFAULT_PORT,
                working_dir: env::current_dir()
                    .unwrap_or_else(|_| PathBuf::from("."))
                    .to_string_lossy()
                    .to_string(),
            };
            fs::write(&config_file, serde_json::to_string_pretty(&stored)?)?;
            tracing::info!(path = %config_file.display(), "generated new config");
            stored
        };

        let host = env::var("BRIDGE_HOST").unwrap_or(stored.host);
        let port = env::var("BRIDGE_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(stored.port);
        let working_dir = env::var("BRIDGE_WORKDIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(stored.working_dir));
        let agent_bin =
            env::var("BRIDGE_AGENT_BIN").unwrap_or_else(|_| DEFAULT_AGENT_BIN.to_string());

        fs::create_dir_all(config_dir.join("history"))?;
        fs::create_dir_all(config_dir.join("worktrees"))?;

        Ok(Self {
            host,
            port,
            working_dir,
            agent_bin,
            auth_token: stored.auth_token,
            config_dir,
        })
    }

    pub fn default_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-bridge")
    }

    pub fn verify_token(&self, token: &str) -> bool {
        token == self.auth_token
    }

    /// Checks the `Authorization: Bearer` header for REST endpoints.
    /// Missing/malformed header is 401; a wrong token is 403.
    pub fn require_bearer(&self, headers: &HeaderMap) -> Result<(), BridgeError> {
        let raw = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                BridgeError::Unauthorized("Missing or invalid Authorization header".to_string())
            })?;
        let token = raw.strip_prefix("Bearer ").ok_or_else(|| {
            BridgeError::Unauthorized("Missing or invalid Authorization header".to_string())
        })?;
        if !self.verify_token(token.trim()) {
            return Err(BridgeError::Forbidden("Invalid token".to_string()));
        }
        Ok(())
    }

    pub fn sessions_file(&self) -> PathBuf {
        self.config_dir.join("sessions.json")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.config_dir.join("history")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.config_dir.join("worktrees")
    }

    pub fn agents_dir(&self) -> PathBuf {
        self.config_dir.join("agents")
    }

    pub fn mcp_servers_file(&self) -> PathBuf {
        self.config_dir.join("mcp_servers.json")
    }

    pub fn projects_config_dir(&self) -> PathBuf {
        self.config_dir.join("projects")
    }
}

/// Resolves a conversation's effective working directory: isolation worktree
/// first, then its own working dir, then the global default.
pub fn effective_working_dir(
    worktree_path: Option<&str>,
    working_dir: Option<&str>,
    global: &Path,
) -> PathBuf {
    if let Some(wt) = worktree_path {
        return PathBuf::from(wt);
    }
    if let Some(wd) = working_dir {
        return PathBuf::from(wd);
    }
    global.to_path_buf()
}
