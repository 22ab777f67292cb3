use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::Mutex,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// A tracked conversation with the agent. `session_id` is the opaque
/// resumption token returned by the agent CLI; `worktree_path` and
/// `original_working_dir` are set together when the conversation runs in an
/// isolated git worktree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub last_message_at: String,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default)]
    pub mcp_servers: Option<Vec<String>>,
    #[serde(default)]
    pub worktree_path: Option<String>,
    #[serde(default)]
    pub original_working_dir: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewConversation {
    pub working_dir: Option<String>,
    pub allowed_tools: Option<Vec<String>>,
    pub mcp_servers: Option<Vec<String>>,
    pub model: Option<String>,
    pub agent: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_paths: Option<Vec<String>>,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Serialize, Deserialize, Default)]
struct StoredSessions {
    conversations: Vec<Conversation>,
}

/// File-backed conversation store: one JSON file for the records, one JSONL
/// file per conversation for message history.
pub struct SessionStore {
    sessions_file: PathBuf,
    history_dir: PathBuf,
    conversations: Mutex<HashMap<String, Conversation>>,
}

impl SessionStore {
    pub fn load(sessions_file: PathBuf, history_dir: PathBuf) -> Result<Self, BridgeError> {
        let mut conversations = HashMap::new();
        if sessions_file.exists() {
            let data: StoredSessions =
                serde_json::from_str(&fs::read_to_string(&sessions_file)?)?;
            for conv in data.conversations {
                conversations.insert(conv.id.clone(), conv);
            }
        }
        Ok(Self {
            sessions_file,
            history_dir,
            conversations: Mutex::new(conversations),
        })
    }

    fn save(&self, conversations: &HashMap<String, Conversation>) -> Result<(), BridgeError> {
        let data = StoredSessions {
            conversations: conversations.values().cloned().collect(),
        };
        fs::write(&self.sessions_file, serde_json::to_string_pretty(&data)?)?;
        Ok(())
    }

    /// Conversations sorted by last activity, most recent first.
    pub fn list(&self) -> Vec<Conversation> {
        let map = self.conversations.lock().expect("sessions lock");
        let mut all: Vec<Conversation> = map.values().cloned().collect();
        all.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        all
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.conversations
            .lock()
            .expect("sessions lock")
            .get(conversation_id)
            .cloned()
    }

    /// Idempotent creation: a repeated request for an existing id returns the
    /// existing record unchanged, so client retries never clobber the stored
    /// session id or worktree.
    pub fn create(
        &self,
        conversation_id: &str,
        name: &str,
        params: NewConversation,
    ) -> Result<Conversation, BridgeError> {
        validate_conversation_id(conversation_id)?;
        let mut map = self.conversations.lock().expect("sessions lock");
        if let Some(existing) = map.get(conversation_id) {
            return Ok(existing.clone());
        }
        let now = iso_now();
        let conv = Conversation {
            id: conversation_id.to_string(),
            name: name.to_string(),
            session_id: None,
            created_at: now.clone(),
            last_message_at: now,
            working_dir: params.working_dir,
            allowed_tools: params.allowed_tools,
            mcp_servers: params.mcp_servers,
            worktree_path: None,
            original_working_dir: None,
            model: params.model,
            agent: params.agent,
        };
        map.insert(conversation_id.to_string(), conv.clone());
        self.save(&map)?;
        Ok(conv)
    }

    /// Stores (or clears) the resumption token and bumps activity.
    pub fn update_session_id(&self, conversation_id: &str, session_id: Option<&str>) {
        let mut map = self.conversations.lock().expect("sessions lock");
        if let Some(conv) = map.get_mut(conversation_id) {
            conv.session_id = session_id.map(str::to_string);
            conv.last_message_at = iso_now();
            if let Err(error) = self.save(&map) {
                tracing::error!(%error, "failed to persist sessions");
            }
        }
    }

    pub fn update_allowed_tools(&self, conversation_id: &str, allowed_tools: Vec<String>) -> bool {
        self.update_with(conversation_id, |conv| conv.allowed_tools = Some(allowed_tools))
    }

    pub fn update_mcp_servers(&self, conversation_id: &str, mcp_servers: Vec<String>) -> bool {
        self.update_with(conversation_id, |conv| conv.mcp_servers = Some(mcp_servers))
    }

    pub fn update_worktree(
        &self,
        conversation_id: &str,
        worktree_path: Option<String>,
        original_dir: Option<String>,
    ) -> bool {
        self.update_with(conversation_id, |conv| {
            conv.worktree_path = worktree_path;
            conv.original_working_dir = original_dir;
        })
    }

    pub fn rename(&self, conversation_id: &str, new_name: &str) -> bool {
        let name = new_name.to_string();
        self.update_with(conversation_id, |conv| conv.name = name)
    }

    fn update_with(&self, conversation_id: &str, apply: impl FnOnce(&mut Conversation)) -> bool {
        let mut map = self.conversations.lock().expect("sessions lock");
        let Some(conv) = map.get_mut(conversation_id) else {
            return false;
        };
        apply(conv);
        if let Err(error) = self.save(&map) {
            tracing::error!(%error, "failed to persist sessions");
        }
        true
    }

    /// Removes the record and its history file. Returns false when no such
    /// conversation exists.
    pub fn delete(&self, conversation_id: &str) -> bool {
        let mut map = self.conversations.lock().expect("sessions lock");
        if map.remove(conversation_id).is_none() {
            return false;
        }
        if let Err(error) = self.save(&map) {
            tracing::error!(%error, "failed to persist sessions");
        }
        let history_file = self.history_file(conversation_id);
        if history_file.exists() {
            let _ = fs::remove_file(history_file);
        }
        true
    }

    pub fn append_history(
        &self,
        conversation_id: &str,
        mut entry: HistoryEntry,
    ) -> Result<(), BridgeError> {
        validate_conversation_id(conversation_id)?;
        fs::create_dir_all(&self.history_dir)?;
        entry.timestamp = iso_now();
        let line = serde_json::to_string(&entry)?;
        use std::io::Write;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_file(conversation_id))?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    pub fn history(&self, conversation_id: &str) -> Vec<HistoryEntry> {
        let history_file = self.history_file(conversation_id);
        let Ok(content) = fs::read_to_string(history_file) else {
            return Vec::new();
        };
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    fn history_file(&self, conversation_id: &str) -> PathBuf {
        self.history_dir.join(format!("{conversation_id}.jsonl"))
    }
}

/// Conversation ids are embedded in file paths and git branch names, so the
/// accepted alphabet is strict: alphanumeric first char, then alphanumeric,
/// hyphen, or underscore, at most 128 chars.
pub fn validate_conversation_id(conversation_id: &str) -> Result<(), BridgeError> {
    let mut chars = conversation_id.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            conversation_id.len() <= 128
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(BridgeError::InvalidRequest(format!(
            "Invalid conversation ID '{conversation_id}': must be 1-128 alphanumeric characters, hyphens, or underscores"
        )))
    }
}

fn iso_now() -> String {
    Utc::now().to_rfc3339()
}
