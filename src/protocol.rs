use serde::{Deserialize, Serialize};

/// Messages sent server -> client over the WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthOk,
    Error {
        detail: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Busy {
        detail: String,
        conversation_id: String,
    },
    TextDelta {
        text: String,
        conversation_id: String,
    },
    ToolStart {
        tool: String,
        input_summary: String,
        conversation_id: String,
    },
    ToolDone {
        conversation_id: String,
    },
    Image {
        path: String,
        conversation_id: String,
    },
    MessageComplete {
        conversation_id: String,
        session_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        git_branch: Option<String>,
    },
    ConversationCreated {
        conversation_id: String,
        name: String,
    },
    ConversationRenamed {
        conversation_id: String,
        name: String,
    },
    PermissionsUpdated {
        conversation_id: String,
        allowed_tools: Vec<String>,
    },
    McpServersUpdated {
        conversation_id: String,
        mcp_servers: Vec<String>,
    },
    Cancelled {
        conversation_id: String,
    },
    PreviewAvailable {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        port: u16,
    },
    PreviewStopped {
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    Ping,
}

impl ServerEvent {
    pub fn error(detail: impl Into<String>) -> Self {
        Self::Error {
            detail: detail.into(),
            conversation_id: None,
        }
    }
}

/// Messages accepted client -> server over the WebSocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: String,
    },
    Message {
        #[serde(default)]
        text: String,
        #[serde(default)]
        conversation_id: String,
        #[serde(default)]
        image_paths: Vec<String>,
    },
    NewConversation {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        working_dir: Option<String>,
        #[serde(default)]
        allowed_tools: Option<Vec<String>>,
        #[serde(default)]
        mcp_servers: Option<Vec<String>>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        agent: Option<String>,
    },
    UpdatePermissions {
        #[serde(default)]
        conversation_id: String,
        #[serde(default)]
        allowed_tools: Vec<String>,
    },
    UpdateMcpServers {
        #[serde(default)]
        conversation_id: String,
        #[serde(default)]
        mcp_servers: Vec<String>,
    },
    Cancel {
        #[serde(default)]
        conversation_id: Option<String>,
    },
    Pong,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_events_use_type_tag() {
        let event = ServerEvent::TextDelta {
            text: "hi".to_string(),
            conversation_id: "c1".to_string(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "text_delta");
        assert_eq!(value["text"], "hi");
        assert_eq!(value["conversation_id"], "c1");
    }

    #[test]
    fn message_complete_omits_missing_branch() {
        let event = ServerEvent::MessageComplete {
            conversation_id: "c1".to_string(),
            session_id: Some("s1".to_string()),
            git_branch: None,
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert!(value.get("git_branch").is_none());
    }

    #[test]
    fn client_messages_parse_with_defaults() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"message","text":"hello","conversation_id":"c1"}"#)
                .expect("parse");
        match msg {
            ClientMessage::Message {
                text,
                conversation_id,
                image_paths,
            } => {
                assert_eq!(text, "hello");
                assert_eq!(conversation_id, "c1");
                assert!(image_paths.is_empty());
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let cancel: ClientMessage =
            serde_json::from_str(r#"{"type":"cancel"}"#).expect("parse cancel");
        assert!(matches!(cancel, ClientMessage::Cancel { conversation_id: None }));
    }
}
