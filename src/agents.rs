use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

const VALID_MODELS: &[&str] = &["sonnet", "opus", "haiku", "inherit"];
const VALID_PERMISSION_MODES: &[&str] =
    &["default", "plan", "acceptEdits", "dontAsk", "bypassPermissions"];

/// An agent definition: markdown file with a flat `key: value` frontmatter
/// block and the system prompt as the body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
}

pub struct AgentStore {
    dir: PathBuf,
}

impl AgentStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// All parseable agent files, sorted by name. Malformed files are
    /// skipped with a warning rather than blocking the listing.
    pub fn list(&self) -> Vec<AgentInfo> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut agents: Vec<AgentInfo> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "md"))
            .filter_map(|entry| {
                let content = fs::read_to_string(entry.path()).ok()?;
                match parse_agent_file(&content) {
                    Ok(agent) => Some(agent),
                    Err(error) => {
                        tracing::warn!(path = %entry.path().display(), %error, "skipping malformed agent file");
                        None
                    }
                }
            })
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    pub fn get(&self, name: &str) -> Result<AgentInfo, BridgeError> {
        validate_agent_name(name)?;
        let path = self.agent_file(name);
        let content = fs::read_to_string(&path)
            .map_err(|_| BridgeError::NotFound(format!("Agent '{name}' not found")))?;
        parse_agent_file(&content)
    }

    pub fn exists(&self, name: &str) -> bool {
        validate_agent_name(name).is_ok() && self.agent_file(name).exists()
    }

    pub fn create(&self, agent: &AgentInfo) -> Result<(), BridgeError> {
        validate_agent(agent)?;
        if self.agent_file(&agent.name).exists() {
            return Err(BridgeError::Conflict(format!(
                "Agent '{}' already exists",
                agent.name
            )));
        }
        self.write_agent(agent)
    }

    pub fn update(&self, name: &str, agent: &AgentInfo) -> Result<(), BridgeError> {
        validate_agent_name(name)?;
        if agent.name != name {
            return Err(BridgeError::InvalidRequest(
                "Agent name cannot be changed".to_string(),
            ));
        }
        if !self.agent_file(name).exists() {
            return Err(BridgeError::NotFound(format!("Agent '{name}' not found")));
        }
        validate_agent(agent)?;
        self.write_agent(agent)
    }

    pub fn delete(&self, name: &str) -> Result<(), BridgeError> {
        validate_agent_name(name)?;
        let path = self.agent_file(name);
        if !path.exists() {
            return Err(BridgeError::NotFound(format!("Agent '{name}' not found")));
        }
        fs::remove_file(path)?;
        Ok(())
    }

    fn write_agent(&self, agent: &AgentInfo) -> Result<(), BridgeError> {
        fs::create_dir_all(&self.dir)?;
        fs::write(self.agent_file(&agent.name), serialize_agent_file(agent))?;
        Ok(())
    }

    fn agent_file(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.md"))
    }
}

/// Agent names become CLI flag values and file names: lowercase letter
/// first, then lowercase alphanumeric or hyphen, at most 64 chars.
pub fn validate_agent_name(name: &str) -> Result<(), BridgeError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_lowercase() => {
            name.len() <= 64
                && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidRequest(format!(
            "Invalid agent name '{name}': must start with a lowercase letter and contain only lowercase letters, digits, and hyphens"
        )))
    }
}

fn validate_agent(agent: &AgentInfo) -> Result<(), BridgeError> {
    validate_agent_name(&agent.name)?;
    if agent.description.trim().is_empty() {
        return Err(BridgeError::InvalidRequest(
            "Agent description cannot be empty".to_string(),
        ));
    }
    if agent.prompt.trim().is_empty() {
        return Err(BridgeError::InvalidRequest(
            "Agent prompt cannot be empty".to_string(),
        ));
    }
    if let Some(model) = &agent.model {
        if !VALID_MODELS.contains(&model.as_str()) {
            return Err(BridgeError::InvalidRequest(format!(
                "Invalid model '{model}': must be one of {VALID_MODELS:?}"
            )));
        }
    }
    if let Some(mode) = &agent.permission_mode {
        if !VALID_PERMISSION_MODES.contains(&mode.as_str()) {
            return Err(BridgeError::InvalidRequest(format!(
                "Invalid permission mode '{mode}': must be one of {VALID_PERMISSION_MODES:?}"
            )));
        }
    }
    Ok(())
}

fn parse_agent_file(content: &str) -> Result<AgentInfo, BridgeError> {
    let rest = content
        .strip_prefix("---\n")
        .ok_or_else(|| BridgeError::InvalidRequest("missing frontmatter".to_string()))?;
    let (frontmatter, body) = rest
        .split_once("\n---\n")
        .ok_or_else(|| BridgeError::InvalidRequest("unterminated frontmatter".to_string()))?;

    let mut agent = AgentInfo {
        name: String::new(),
        description: String::new(),
        prompt: body.trim().to_string(),
        model: None,
        tools: None,
        disallowed_tools: None,
        permission_mode: None,
        mcp_servers: None,
        max_turns: None,
    };
    for line in frontmatter.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "name" => agent.name = value.to_string(),
            "description" => agent.description = value.to_string(),
            "model" => agent.model = Some(value.to_string()),
            "tools" => agent.tools = Some(parse_list(value)),
            "disallowedTools" => agent.disallowed_tools = Some(parse_list(value)),
            "permissionMode" => agent.permission_mode = Some(value.to_string()),
            "mcpServers" => agent.mcp_servers = Some(parse_list(value)),
            "maxTurns" => agent.max_turns = value.parse().ok(),
            _ => {}
        }
    }
    if agent.name.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "frontmatter missing name".to_string(),
        ));
    }
    Ok(agent)
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

fn serialize_agent_file(agent: &AgentInfo) -> String {
    let mut out = String::from("---\n");
    out.push_str(&format!("name: {}\n", agent.name));
    out.push_str(&format!("description: {}\n", agent.description));
    if let Some(model) = &agent.model {
        out.push_str(&format!("model: {model}\n"));
    }
    if let Some(tools) = &agent.tools {
        out.push_str(&format!("tools: {}\n", tools.join(", ")));
    }
    if let Some(tools) = &agent.disallowed_tools {
        out.push_str(&format!("disallowedTools: {}\n", tools.join(", ")));
    }
    if let Some(mode) = &agent.permission_mode {
        out.push_str(&format!("permissionMode: {mode}\n"));
    }
    if let Some(servers) = &agent.mcp_servers {
        out.push_str(&format!("mcpServers: {}\n", servers.join(", ")));
    }
    if let Some(turns) = agent.max_turns {
        out.push_str(&format!("maxTurns: {turns}\n"));
    }
    out.push_str("---\n\n");
    out.push_str(&agent.prompt);
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> AgentInfo {
        AgentInfo {
            name: "code-reviewer".to_string(),
            description: "Reviews code for defects".to_string(),
            prompt: "You are a meticulous code reviewer.".to_string(),
            model: Some("sonnet".to_string()),
            tools: Some(vec!["Read".to_string(), "Grep".to_string()]),
            disallowed_tools: None,
            permission_mode: Some("plan".to_string()),
            mcp_servers: None,
            max_turns: Some(25),
        }
    }

    #[test]
    fn roundtrips_through_file_format() {
        let agent = sample();
        let parsed = parse_agent_file(&serialize_agent_file(&agent)).expect("parse");
        assert_eq!(parsed.name, agent.name);
        assert_eq!(parsed.prompt, agent.prompt);
        assert_eq!(parsed.tools, agent.tools);
        assert_eq!(parsed.max_turns, Some(25));
    }

    #[test]
    fn crud_and_validation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AgentStore::new(dir.path().to_path_buf());
        assert!(store.list().is_empty());

        store.create(&sample()).expect("create");
        assert!(matches!(
            store.create(&sample()),
            Err(BridgeError::Conflict(_))
        ));
        assert!(store.exists("code-reviewer"));

        let mut bad = sample();
        bad.model = Some("gpt-5".to_string());
        assert!(store.update("code-reviewer", &bad).is_err());

        let mut renamed = sample();
        renamed.name = "other".to_string();
        assert!(store.update("code-reviewer", &renamed).is_err());

        store.delete("code-reviewer").expect("delete");
        assert!(matches!(
            store.get("code-reviewer"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn listing_skips_malformed_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AgentStore::new(dir.path().to_path_buf());
        store.create(&sample()).expect("create");
        fs::write(dir.path().join("broken.md"), "no frontmatter here").expect("write");

        let agents = store.list();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].name, "code-reviewer");
    }

    #[test]
    fn rejects_bad_names() {
        for bad in ["", "Upper", "1num", "has space", "dot.name", "-lead"] {
            assert!(validate_agent_name(bad).is_err(), "{bad:?}");
        }
        assert!(validate_agent_name("code-reviewer-2").is_ok());
    }
}
