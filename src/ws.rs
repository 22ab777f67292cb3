use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::{
    config::effective_working_dir,
    error::BridgeError,
    git,
    protocol::{ClientMessage, ServerEvent},
    sessions::{validate_conversation_id, NewConversation},
    AppState,
};

const PING_INTERVAL: Duration = Duration::from_secs(15);

/// Close code sent when the first message is not a valid `auth`.
const CLOSE_UNAUTHORIZED: u16 = 4001;

const VALID_TOOL_NAMES: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch",
];

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut socket_tx, mut socket_rx) = socket.split();

    // Authentication must be the first frame; anything else closes the
    // socket with a dedicated code so clients can distinguish bad tokens
    // from network drops.
    let authed = match socket_rx.next().await {
        Some(Ok(Message::Text(text))) => matches!(
            serde_json::from_str::<ClientMessage>(&text),
            Ok(ClientMessage::Auth { token }) if state.config.verify_token(&token)
        ),
        _ => false,
    };
    if !authed {
        let detail = serde_json::to_string(&ServerEvent::error("Authentication failed"))
            .unwrap_or_default();
        let _ = socket_tx.send(Message::Text(detail.into())).await;
        let _ = socket_tx
            .send(Message::Close(Some(axum::extract::ws::CloseFrame {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".into(),
            })))
            .await;
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let client_id = state.hub.add_client(tx.clone()).await;
    tracing::info!(client_id, "websocket client authenticated");

    let writer_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if socket_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    state.hub.send(client_id, &ServerEvent::AuthOk).await;

    // Application-level keepalive; mobile clients miss protocol pings
    // behind some proxies.
    let ping_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        loop {
            interval.tick().await;
            let Ok(text) = serde_json::to_string(&ServerEvent::Ping) else {
                break;
            };
            if tx.send(Message::Text(text.into())).is_err() {
                break;
            }
        }
    });

    while let Some(message) = socket_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                handle_client_message(client_id, &text, &state).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_)) => {}
            Err(error) => {
                tracing::info!(client_id, %error, "websocket read error");
                break;
            }
        }
    }

    tracing::info!(client_id, "websocket client disconnected");
    state.hub.remove_client(client_id).await;
    ping_task.abort();
    writer_task.abort();
}

async fn handle_client_message(client_id: u64, text: &str, state: &Arc<AppState>) {
    let message = match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => message,
        Err(error) => {
            state
                .hub
                .send(
                    client_id,
                    &ServerEvent::error(format!("Invalid message: {error}")),
                )
                .await;
            return;
        }
    };

    match message {
        // Repeated auth on an authenticated socket is harmless.
        ClientMessage::Auth { .. } | ClientMessage::Pong => {}

        ClientMessage::Message {
            text,
            conversation_id,
            image_paths,
        } => {
            if text.is_empty() && image_paths.is_empty() {
                state
                    .hub
                    .send(client_id, &ServerEvent::error("Empty message"))
                    .await;
                return;
            }
            if let Err(error) = validate_conversation_id(&conversation_id) {
                state
                    .hub
                    .send(client_id, &ServerEvent::error(error.to_string()))
                    .await;
                return;
            }
            let runner = state.runner.clone();
            tokio::spawn(async move {
                runner
                    .submit_turn(client_id, text, image_paths, conversation_id)
                    .await;
            });
        }

        ClientMessage::NewConversation {
            conversation_id,
            name,
            working_dir,
            allowed_tools,
            mcp_servers,
            model,
            agent,
        } => {
            let result = handle_new_conversation(
                state,
                conversation_id,
                name,
                working_dir,
                allowed_tools,
                mcp_servers,
                model,
                agent,
            )
            .await;
            match result {
                Ok(event) => state.hub.send(client_id, &event).await,
                Err(error) => {
                    state
                        .hub
                        .send(client_id, &ServerEvent::error(error.to_string()))
                        .await
                }
            }
        }

        ClientMessage::UpdatePermissions {
            conversation_id,
            allowed_tools,
        } => {
            if let Some(bad) = allowed_tools.iter().find(|t| !valid_tool_spec(t)) {
                state
                    .hub
                    .send(
                        client_id,
                        &ServerEvent::error(format!("Unknown tool: {bad}")),
                    )
                    .await;
                return;
            }
            if state
                .sessions
                .update_allowed_tools(&conversation_id, allowed_tools.clone())
            {
                state
                    .hub
                    .send(
                        client_id,
                        &ServerEvent::PermissionsUpdated {
                            conversation_id,
                            allowed_tools,
                        },
                    )
                    .await;
            } else {
                state
                    .hub
                    .send(client_id, &ServerEvent::error("Conversation not found"))
                    .await;
            }
        }

        ClientMessage::UpdateMcpServers {
            conversation_id,
            mcp_servers,
        } => {
            if let Some(bad) = mcp_servers.iter().find(|name| !state.mcp.contains(name)) {
                state
                    .hub
                    .send(
                        client_id,
                        &ServerEvent::error(format!("Unknown MCP server: {bad}")),
                    )
                    .await;
                return;
            }
            if state
                .sessions
                .update_mcp_servers(&conversation_id, mcp_servers.clone())
            {
                state
                    .hub
                    .send(
                        client_id,
                        &ServerEvent::McpServersUpdated {
                            conversation_id,
                            mcp_servers,
                        },
                    )
                    .await;
            } else {
                state
                    .hub
                    .send(client_id, &ServerEvent::error("Conversation not found"))
                    .await;
            }
        }

        ClientMessage::Cancel { conversation_id } => match conversation_id {
            Some(conversation_id) => {
                if state.runner.cancel(&conversation_id).await {
                    state
                        .hub
                        .send(client_id, &ServerEvent::Cancelled { conversation_id })
                        .await;
                } else {
                    state
                        .hub
                        .send(
                            client_id,
                            &ServerEvent::Error {
                                detail: "No active process for this conversation".to_string(),
                                conversation_id: Some(conversation_id),
                            },
                        )
                        .await;
                }
            }
            None => {
                // Cancel without an id cancels everything.
                let ids = state.runner.active_conversations();
                let mut cancelled_any = false;
                for conversation_id in ids {
                    if state.runner.cancel(&conversation_id).await {
                        cancelled_any = true;
                        state
                            .hub
                            .send(client_id, &ServerEvent::Cancelled { conversation_id })
                            .await;
                    }
                }
                if !cancelled_any {
                    state
                        .hub
                        .send(client_id, &ServerEvent::error("No active processes"))
                        .await;
                }
            }
        },
    }
}

/// Tool specs may carry an argument pattern (`Bash(npm install)`); only the
/// base name is validated.
fn valid_tool_spec(spec: &str) -> bool {
    let base = spec.split('(').next().unwrap_or(spec);
    VALID_TOOL_NAMES.contains(&base)
}

#[allow(clippy::too_many_arguments)]
async fn handle_new_conversation(
    state: &Arc<AppState>,
    conversation_id: Option<String>,
    name: Option<String>,
    working_dir: Option<String>,
    allowed_tools: Option<Vec<String>>,
    mcp_servers: Option<Vec<String>>,
    model: Option<String>,
    agent: Option<String>,
) -> Result<ServerEvent, BridgeError> {
    let conversation_id = conversation_id
        .unwrap_or_else(|| format!("conv_{}", chrono::Utc::now().timestamp()));
    let name = name.unwrap_or_else(|| "New conversation".to_string());

    if let Some(tools) = &allowed_tools {
        if let Some(bad) = tools.iter().find(|t| !valid_tool_spec(t)) {
            return Err(BridgeError::InvalidRequest(format!("Unknown tool: {bad}")));
        }
    }
    if let Some(servers) = &mcp_servers {
        if let Some(bad) = servers.iter().find(|name| !state.mcp.contains(name)) {
            return Err(BridgeError::InvalidRequest(format!(
                "Unknown MCP server: {bad}"
            )));
        }
    }
    if let Some(agent) = &agent {
        if !state.agents.exists(agent) {
            return Err(BridgeError::InvalidRequest(format!(
                "Unknown agent: {agent}"
            )));
        }
    }

    let conv = state.sessions.create(
        &conversation_id,
        &name,
        NewConversation {
            working_dir: working_dir.clone(),
            allowed_tools,
            mcp_servers,
            model,
            agent,
        },
    )?;

    // When another conversation is already running in the same git project,
    // isolate this one in its own worktree so the two do not interfere.
    if let Some(dir) = &working_dir {
        if git::is_git_repo(std::path::Path::new(dir)).await
            && has_active_conversation_in(state, dir)
        {
            match git::create_worktree(
                std::path::Path::new(dir),
                &conversation_id,
                &state.config.worktrees_dir(),
            )
            .await
            {
                Some(path) => {
                    state.sessions.update_worktree(
                        &conversation_id,
                        Some(path.to_string_lossy().to_string()),
                        Some(dir.clone()),
                    );
                    tracing::info!(conversation_id, path = %path.display(), "isolated in worktree");
                }
                None => {
                    tracing::warn!(conversation_id, "worktree creation failed, sharing directory");
                }
            }
        }
    }

    tracing::info!(conversation_id = %conv.id, name = %conv.name, "conversation created");
    Ok(ServerEvent::ConversationCreated {
        conversation_id: conv.id,
        name: conv.name,
    })
}

fn has_active_conversation_in(state: &Arc<AppState>, working_dir: &str) -> bool {
    state.runner.active_conversations().iter().any(|cid| {
        state.sessions.get(cid).is_some_and(|conv| {
            effective_working_dir(
                None,
                conv.working_dir
                    .as_deref()
                    .or(conv.original_working_dir.as_deref()),
                &state.config.working_dir,
            ) == std::path::Path::new(working_dir)
        })
    })
}
