use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::BridgeError;

const VALID_TRANSPORTS: &[&str] = &["stdio", "http", "sse"];

/// A registered MCP server. stdio transports use `command`/`args`/`env`;
/// http and sse transports use `url`/`headers`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    pub transport: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Serialize, Deserialize, Default)]
struct StoredServers {
    servers: Vec<McpServer>,
}

pub struct McpStore {
    path: PathBuf,
    servers: Mutex<HashMap<String, McpServer>>,
}

impl McpStore {
    pub fn load(path: PathBuf) -> Result<Self, BridgeError> {
        let mut servers = HashMap::new();
        if path.exists() {
            let data: StoredServers = serde_json::from_str(&fs::read_to_string(&path)?)?;
            for server in data.servers {
                servers.insert(server.name.clone(), server);
            }
        }
        Ok(Self {
            path,
            servers: Mutex::new(servers),
        })
    }

    fn save(&self, servers: &HashMap<String, McpServer>) -> Result<(), BridgeError> {
        let data = StoredServers {
            servers: servers.values().cloned().collect(),
        };
        fs::write(&self.path, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }

    /// Servers sorted by name, with env values masked for display.
    pub fn list(&self) -> Vec<McpServer> {
        let map = self.servers.lock().expect("mcp lock");
        let mut all: Vec<McpServer> = map.values().cloned().map(mask_env).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn server_names(&self) -> Vec<String> {
        let map = self.servers.lock().expect("mcp lock");
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.servers.lock().expect("mcp lock").contains_key(name)
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        self.servers
            .lock()
            .expect("mcp lock")
            .get(name)
            .is_some_and(|server| server.enabled)
    }

    pub fn add(&self, server: McpServer) -> Result<(), BridgeError> {
        validate_server(&server)?;
        let mut map = self.servers.lock().expect("mcp lock");
        if map.contains_key(&server.name) {
            return Err(BridgeError::Conflict(format!(
                "MCP server '{}' already exists",
                server.name
            )));
        }
        map.insert(server.name.clone(), server);
        self.save(&map)
    }

    pub fn update(&self, name: &str, server: McpServer) -> Result<(), BridgeError> {
        if server.name != name {
            return Err(BridgeError::InvalidRequest(
                "MCP server name cannot be changed".to_string(),
            ));
        }
        validate_server(&server)?;
        let mut map = self.servers.lock().expect("mcp lock");
        if !map.contains_key(name) {
            return Err(BridgeError::NotFound(format!(
                "MCP server '{name}' not found"
            )));
        }
        map.insert(name.to_string(), server);
        self.save(&map)
    }

    pub fn remove(&self, name: &str) -> Result<(), BridgeError> {
        let mut map = self.servers.lock().expect("mcp lock");
        if map.remove(name).is_none() {
            return Err(BridgeError::NotFound(format!(
                "MCP server '{name}' not found"
            )));
        }
        self.save(&map)
    }

    /// Flips the enabled flag; returns the new state.
    pub fn toggle(&self, name: &str) -> Result<bool, BridgeError> {
        let mut map = self.servers.lock().expect("mcp lock");
        let server = map
            .get_mut(name)
            .ok_or_else(|| BridgeError::NotFound(format!("MCP server '{name}' not found")))?;
        server.enabled = !server.enabled;
        let enabled = server.enabled;
        self.save(&map)?;
        Ok(enabled)
    }

    /// Writes the agent CLI's `--mcp-config` file for the named servers.
    /// Disabled and unknown names are skipped; None when nothing is left.
    /// The caller owns the returned temp file and removes it after the run.
    pub fn write_config_file(&self, names: &[String]) -> Result<Option<PathBuf>, BridgeError> {
        let map = self.servers.lock().expect("mcp lock");
        let mut entries = serde_json::Map::new();
        for name in names {
            let Some(server) = map.get(name) else {
                tracing::warn!(name, "unknown MCP server requested, skipping");
                continue;
            };
            if !server.enabled {
                continue;
            }
            entries.insert(name.clone(), server_config_entry(server));
        }
        if entries.is_empty() {
            return Ok(None);
        }
        let path = std::env::temp_dir().join(format!(
            "bridge-mcp-{}.json",
            uuid::Uuid::new_v4().simple()
        ));
        fs::write(&path, serde_json::to_string_pretty(&json!({ "mcpServers": entries }))?)?;
        Ok(Some(path))
    }
}

fn server_config_entry(server: &McpServer) -> Value {
    match server.transport.as_str() {
        "stdio" => {
            let mut entry = json!({
                "command": server.command.clone().unwrap_or_default(),
                "args": server.args.clone().unwrap_or_default(),
            });
            if let Some(env) = &server.env {
                entry["env"] = json!(env);
            }
            entry
        }
        transport => {
            let mut entry = json!({
                "type": transport,
                "url": server.url.clone().unwrap_or_default(),
            });
            if let Some(headers) = &server.headers {
                entry["headers"] = json!(headers);
            }
            entry
        }
    }
}

fn validate_server(server: &McpServer) -> Result<(), BridgeError> {
    if server.name.is_empty()
        || !server
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BridgeError::InvalidRequest(format!(
            "Invalid MCP server name '{}': must be alphanumeric with hyphens or underscores",
            server.name
        )));
    }
    if !VALID_TRANSPORTS.contains(&server.transport.as_str()) {
        return Err(BridgeError::InvalidRequest(format!(
            "Invalid transport '{}': must be one of {VALID_TRANSPORTS:?}",
            server.transport
        )));
    }
    match server.transport.as_str() {
        "stdio" => {
            if server.command.as_deref().unwrap_or("").is_empty() {
                return Err(BridgeError::InvalidRequest(
                    "stdio transport requires a command".to_string(),
                ));
            }
        }
        _ => {
            if server.url.as_deref().unwrap_or("").is_empty() {
                return Err(BridgeError::InvalidRequest(format!(
                    "{} transport requires a url",
                    server.transport
                )));
            }
        }
    }
    Ok(())
}

/// Masks secret env values for listings: short values are fully hidden,
/// longer ones keep the first and last four characters.
fn mask_env(mut server: McpServer) -> McpServer {
    if let Some(env) = &mut server.env {
        for value in env.values_mut() {
            *value = mask_value(value);
        }
    }
    server
}

fn mask_value(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= 8 {
        "***".to_string()
    } else {
        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }
}
