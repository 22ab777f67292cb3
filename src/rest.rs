use std::{collections::HashMap, path::Path, sync::Arc};

use axum::{
    extract::{Path as UrlPath, Query, State},
    http::HeaderMap,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::{
    agents::AgentInfo,
    config::effective_working_dir,
    error::BridgeError,
    git,
    mcp::McpServer,
    preview::PreviewManager,
    protocol::ServerEvent,
    AppState,
};

type RestResult = Result<Json<Value>, BridgeError>;

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn list_conversations(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let conversations = state.sessions.list();

    // Branch lookups hit git once per distinct directory, not per record.
    let mut branch_cache: HashMap<String, Option<String>> = HashMap::new();
    let mut out = Vec::with_capacity(conversations.len());
    for conv in conversations {
        let git_branch = if conv.worktree_path.is_some() {
            Some(git::worktree_branch(&conv.id))
        } else {
            let dir = effective_working_dir(
                None,
                conv.working_dir.as_deref(),
                &state.config.working_dir,
            );
            let key = dir.to_string_lossy().to_string();
            match branch_cache.get(&key) {
                Some(cached) => cached.clone(),
                None => {
                    let branch = git::current_branch(&dir).await;
                    branch_cache.insert(key, branch.clone());
                    branch
                }
            }
        };
        let mut value = serde_json::to_value(&conv)?;
        value["git_branch"] = json!(git_branch);
        value["active"] = json!(state.runner.is_active(&conv.id));
        out.push(value);
    }
    Ok(Json(json!({ "conversations": out })))
}

pub async fn active_conversations(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(json!({
        "active": state.runner.active_conversations(),
    })))
}

pub async fn delete_conversation(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(conversation_id): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let conv = state
        .sessions
        .get(&conversation_id)
        .ok_or_else(|| BridgeError::NotFound("Conversation not found".to_string()))?;

    state.runner.cancel(&conversation_id).await;

    if let (Some(worktree), Some(original)) = (&conv.worktree_path, &conv.original_working_dir) {
        git::remove_worktree(Path::new(original), Path::new(worktree), &conversation_id).await;
    }

    let dir = effective_working_dir(
        conv.worktree_path.as_deref(),
        conv.working_dir.as_deref(),
        &state.config.working_dir,
    );
    state.previews.stop(&dir.to_string_lossy()).await;

    state.sessions.delete(&conversation_id);
    tracing::info!(conversation_id, "conversation deleted");
    Ok(Json(json!({ "deleted": conversation_id })))
}

pub async fn conversation_history(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(conversation_id): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    if state.sessions.get(&conversation_id).is_none() {
        return Err(BridgeError::NotFound("Conversation not found".to_string()));
    }
    Ok(Json(json!({
        "history": state.sessions.history(&conversation_id),
    })))
}

pub async fn list_projects(headers: HeaderMap, State(state): State<Arc<AppState>>) -> RestResult {
    state.config.require_bearer(&headers)?;
    let root = &state.config.working_dir;
    if !root.is_dir() {
        return Ok(Json(json!({ "projects": [] })));
    }
    let mut projects = vec![json!({
        "name": "All Projects",
        "path": root,
        "git_branch": git::current_branch(root).await,
    })];
    let mut entries: Vec<_> = std::fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().is_dir() && !e.file_name().to_string_lossy().starts_with('.')
        })
        .collect();
    entries.sort_by_key(|e| e.file_name());
    for entry in entries {
        let path = entry.path();
        projects.push(json!({
            "name": entry.file_name().to_string_lossy(),
            "path": path,
            "git_branch": git::current_branch(&path).await,
        }));
    }
    Ok(Json(json!({ "projects": projects })))
}

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    name: String,
}

pub async fn create_project(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateProjectRequest>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let name = request.name.trim();
    if name.is_empty() {
        return Err(BridgeError::InvalidRequest(
            "Project name is required".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name.contains("..") || name.starts_with('.') {
        return Err(BridgeError::InvalidRequest(
            "Invalid project name".to_string(),
        ));
    }
    let path = state.config.working_dir.join(name);
    if path.exists() {
        return Err(BridgeError::Conflict("Project already exists".to_string()));
    }
    std::fs::create_dir_all(&path)?;
    tracing::info!(name, path = %path.display(), "created project directory");
    Ok(Json(json!({ "name": name, "path": path })))
}

#[derive(Deserialize)]
pub struct ProjectConfigQuery {
    path: String,
}

pub async fn get_project_config(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProjectConfigQuery>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(serde_json::to_value(state.projects.get(&query.path))?))
}

#[derive(Deserialize)]
pub struct UpdateProjectConfigRequest {
    path: String,
    custom_instructions: String,
}

pub async fn update_project_config(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<UpdateProjectConfigRequest>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let config = state
        .projects
        .set(&request.path, &request.custom_instructions)?;
    tracing::info!(path = request.path, "project custom instructions updated");
    Ok(Json(serde_json::to_value(config)?))
}

#[derive(Deserialize)]
pub struct PreviewRequest {
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    working_dir: Option<String>,
}

/// Resolves a preview request to the directory it targets: an explicit
/// directory wins, else the conversation's effective directory.
fn resolve_preview_dir(
    state: &AppState,
    request: &PreviewRequest,
) -> Result<String, BridgeError> {
    if let Some(dir) = &request.working_dir {
        return Ok(dir.clone());
    }
    let conversation_id = request.conversation_id.as_deref().ok_or_else(|| {
        BridgeError::InvalidRequest("conversation_id or working_dir is required".to_string())
    })?;
    let conv = state
        .sessions
        .get(conversation_id)
        .ok_or_else(|| BridgeError::NotFound("Conversation not found".to_string()))?;
    Ok(effective_working_dir(
        conv.worktree_path.as_deref(),
        conv.working_dir.as_deref(),
        &state.config.working_dir,
    )
    .to_string_lossy()
    .to_string())
}

pub async fn preview_check(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(conversation_id): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let request = PreviewRequest {
        conversation_id: Some(conversation_id),
        working_dir: None,
    };
    let dir = resolve_preview_dir(&state, &request)?;
    Ok(Json(json!({
        "can_preview": PreviewManager::can_preview(Path::new(&dir)),
        "working_dir": dir,
    })))
}

pub async fn preview_start(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let dir = resolve_preview_dir(&state, &request)?;
    let info = state
        .previews
        .start(&dir, request.conversation_id.clone())
        .await?;
    state
        .hub
        .broadcast(&ServerEvent::PreviewAvailable {
            conversation_id: info.conversation_id.clone(),
            port: info.port,
        })
        .await;
    Ok(Json(serde_json::to_value(&info)?))
}

pub async fn preview_stop(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let dir = resolve_preview_dir(&state, &request)?;
    if !state.previews.stop(&dir).await {
        return Err(BridgeError::NotFound(
            "No preview running for this directory".to_string(),
        ));
    }
    state
        .hub
        .broadcast(&ServerEvent::PreviewStopped {
            conversation_id: request.conversation_id.clone(),
        })
        .await;
    Ok(Json(json!({ "stopped": dir })))
}

pub async fn preview_restart(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PreviewRequest>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let dir = resolve_preview_dir(&state, &request)?;
    let info = state
        .previews
        .restart(&dir, request.conversation_id.clone())
        .await?;
    state
        .hub
        .broadcast(&ServerEvent::PreviewAvailable {
            conversation_id: info.conversation_id.clone(),
            port: info.port,
        })
        .await;
    Ok(Json(serde_json::to_value(&info)?))
}

pub async fn preview_status(headers: HeaderMap, State(state): State<Arc<AppState>>) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(json!({ "previews": state.previews.list().await })))
}

pub async fn list_agents(headers: HeaderMap, State(state): State<Arc<AppState>>) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(json!({ "agents": state.agents.list() })))
}

pub async fn get_agent(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(serde_json::to_value(state.agents.get(&name)?)?))
}

pub async fn create_agent(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(agent): Json<AgentInfo>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    state.agents.create(&agent)?;
    tracing::info!(name = %agent.name, "agent created");
    Ok(Json(serde_json::to_value(&agent)?))
}

pub async fn update_agent(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
    Json(agent): Json<AgentInfo>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    state.agents.update(&name, &agent)?;
    Ok(Json(serde_json::to_value(&agent)?))
}

pub async fn delete_agent(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    state.agents.delete(&name)?;
    Ok(Json(json!({ "deleted": name })))
}

pub async fn list_mcp_servers(headers: HeaderMap, State(state): State<Arc<AppState>>) -> RestResult {
    state.config.require_bearer(&headers)?;
    Ok(Json(json!({ "servers": state.mcp.list() })))
}

pub async fn add_mcp_server(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    Json(server): Json<McpServer>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let name = server.name.clone();
    state.mcp.add(server)?;
    tracing::info!(name, "mcp server added");
    Ok(Json(json!({ "added": name })))
}

pub async fn update_mcp_server(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
    Json(server): Json<McpServer>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    state.mcp.update(&name, server)?;
    Ok(Json(json!({ "updated": name })))
}

pub async fn delete_mcp_server(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    state.mcp.remove(&name)?;
    Ok(Json(json!({ "deleted": name })))
}

pub async fn toggle_mcp_server(
    headers: HeaderMap,
    State(state): State<Arc<AppState>>,
    UrlPath(name): UrlPath<String>,
) -> RestResult {
    state.config.require_bearer(&headers)?;
    let enabled = state.mcp.toggle(&name)?;
    Ok(Json(json!({ "name": name, "enabled": enabled })))
}
