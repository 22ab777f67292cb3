use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::Command,
    sync::{watch, Mutex as TokioMutex},
    time::timeout,
};

use crate::{
    config::{effective_working_dir, BridgeConfig},
    error::BridgeError,
    forwarder::EventForwarder,
    git,
    hub::ClientHub,
    mcp::McpStore,
    projects::ProjectConfigStore,
    protocol::ServerEvent,
    sessions::{Conversation, HistoryEntry, NewConversation, SessionStore},
};

const DEFAULT_ALLOWED_TOOLS: &[&str] = &[
    "Read", "Write", "Edit", "Bash", "Glob", "Grep", "WebSearch", "WebFetch",
];

/// Grace period between SIGTERM and SIGKILL when cancelling a turn, and the
/// bound on waiting for a held conversation lock to release.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

const TITLE_TIMEOUT: Duration = Duration::from_secs(30);

/// Platform rules appended to every turn's system prompt. The client is a
/// mobile app, so the agent must not block its shell on dev servers or use
/// interactive question tools.
const PLATFORM_PROMPT: &str = "\
The user is communicating with you remotely from a mobile app connected to \
this machine. They cannot see your full terminal output or interact with \
files directly. Keep responses concise and focused on actionable results.\n\n\
WEB APP PREVIEW RULES:\n\
1. NEVER start long-running dev servers via the Bash tool. Running 'npm run \
dev', 'python -m http.server', 'flask run', or ANY process that does not \
exit will hang your Bash tool and freeze the conversation.\n\
2. You CAN use Bash for short-lived build commands: npm install, npm run \
build, pip install, etc.\n\
3. When you finish building or modifying a web app, tell the user to use the \
Start Preview action in the app to view it; the server auto-detects the \
project type and starts the right dev server on a free port.\n\n\
QUESTIONS:\n\
NEVER use the AskUserQuestion tool; it is not supported here and fails \
silently. When you need to ask the user something, write the question in \
your response text as numbered options and the user will reply with a \
choice.";

/// A registered running turn. `exited` flips to true (or closes) when the
/// subprocess has been reaped, so cancellation can wait without competing
/// for the child's wait handle.
#[derive(Clone)]
struct ActiveProcess {
    pid: u32,
    exited: watch::Receiver<bool>,
}

struct TurnOutcome {
    result_is_error: bool,
    transcript: String,
    session_id: Option<String>,
    image_paths: Vec<String>,
}

/// Orchestrates agent subprocess turns: per-conversation serialization,
/// cancel-in-favor-of-newer, stale-token retry, transcript persistence.
pub struct TurnRunner {
    config: Arc<BridgeConfig>,
    sessions: Arc<SessionStore>,
    mcp: Arc<McpStore>,
    projects: Arc<ProjectConfigStore>,
    hub: Arc<ClientHub>,
    locks: StdMutex<HashMap<String, Arc<TokioMutex<()>>>>,
    active: StdMutex<HashMap<String, ActiveProcess>>,
}

impl TurnRunner {
    pub fn new(
        config: Arc<BridgeConfig>,
        sessions: Arc<SessionStore>,
        mcp: Arc<McpStore>,
        projects: Arc<ProjectConfigStore>,
        hub: Arc<ClientHub>,
    ) -> Self {
        Self {
            config,
            sessions,
            mcp,
            projects,
            hub,
            locks: StdMutex::new(HashMap::new()),
            active: StdMutex::new(HashMap::new()),
        }
    }

    /// Conversation ids with a live subprocess right now.
    pub fn active_conversations(&self) -> Vec<String> {
        self.active
            .lock()
            .expect("active lock")
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_active(&self, conversation_id: &str) -> bool {
        self.active
            .lock()
            .expect("active lock")
            .contains_key(conversation_id)
    }

    fn conversation_lock(&self, conversation_id: &str) -> Arc<TokioMutex<()>> {
        self.locks
            .lock()
            .expect("locks lock")
            .entry(conversation_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops lock entries nobody references; called after each turn so the
    /// table does not grow with every conversation ever seen. An entry whose
    /// Arc has outstanding clones stays put even when unlocked, because a
    /// submit that already fetched it may be about to lock it and a removed
    /// entry would let a later submit run concurrently on the same id.
    fn gc_locks(&self) {
        self.locks
            .lock()
            .expect("locks lock")
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Runs one client turn end to end. A turn already running on the same
    /// conversation is cancelled first; if its lock still does not release
    /// within the grace period the caller gets `busy` and nothing runs.
    pub async fn submit_turn(
        self: Arc<Self>,
        client_id: u64,
        text: String,
        image_paths: Vec<String>,
        conversation_id: String,
    ) {
        let lock = self.conversation_lock(&conversation_id);
        let guard = match lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::info!(conversation_id, "lock held, cancelling previous turn");
                self.cancel(&conversation_id).await;
                match timeout(CANCEL_GRACE, lock.lock_owned()).await {
                    Ok(guard) => guard,
                    Err(_) => {
                        self.hub
                            .send(
                                client_id,
                                &ServerEvent::Busy {
                                    detail: "Conversation is still finishing".to_string(),
                                    conversation_id,
                                },
                            )
                            .await;
                        return;
                    }
                }
            }
        };

        if let Err(error) = self.run_turn(&text, &image_paths, &conversation_id).await {
            tracing::error!(conversation_id, %error, "turn failed");
            self.hub
                .send_latest(&ServerEvent::Error {
                    detail: error.to_string(),
                    conversation_id: Some(conversation_id.clone()),
                })
                .await;
        }
        drop(guard);
        self.gc_locks();
    }

    async fn run_turn(
        self: &Arc<Self>,
        text: &str,
        image_paths: &[String],
        conversation_id: &str,
    ) -> Result<(), BridgeError> {
        let conv = match self.sessions.get(conversation_id) {
            Some(conv) => conv,
            None => {
                let name: String = text.chars().take(50).collect();
                self.sessions.create(
                    conversation_id,
                    if name.is_empty() { "New conversation" } else { &name },
                    NewConversation::default(),
                )?
            }
        };
        let is_first_turn = conv.session_id.is_none();

        self.sessions.append_history(
            conversation_id,
            HistoryEntry {
                role: "user".to_string(),
                text: if text.is_empty() { "[image]".to_string() } else { text.to_string() },
                image_paths: None,
                timestamp: String::new(),
            },
        )?;

        // Title generation runs detached so it lands while streaming.
        if is_first_turn {
            self.clone().spawn_title_task(
                conversation_id.to_string(),
                if text.is_empty() { "[image]".to_string() } else { text.to_string() },
            );
        }

        let cwd = effective_working_dir(
            conv.worktree_path.as_deref(),
            conv.working_dir.as_deref(),
            &self.config.working_dir,
        );
        let prompt = build_prompt(text, image_paths);

        let mut resume = conv.session_id.clone();
        let mut attempts = 0u8;
        let outcome = loop {
            let outcome = self
                .run_once(conversation_id, &conv, &prompt, resume.as_deref(), &cwd)
                .await?;
            // A failed resume surfaces as an error result with nothing
            // produced; one retry without the token, never more.
            if outcome.result_is_error
                && resume.is_some()
                && outcome.transcript.is_empty()
                && attempts == 0
            {
                tracing::info!(conversation_id, "resume failed, clearing token and retrying");
                self.sessions.update_session_id(conversation_id, None);
                self.hub
                    .send_latest(&ServerEvent::Error {
                        detail: "Session expired, retrying...".to_string(),
                        conversation_id: Some(conversation_id.to_string()),
                    })
                    .await;
                resume = None;
                attempts += 1;
                continue;
            }
            break outcome;
        };

        if outcome.session_id.is_some() {
            self.sessions
                .update_session_id(conversation_id, outcome.session_id.as_deref());
        }

        if !outcome.transcript.trim().is_empty() || !outcome.image_paths.is_empty() {
            self.sessions.append_history(
                conversation_id,
                HistoryEntry {
                    role: "assistant".to_string(),
                    text: outcome.transcript.clone(),
                    image_paths: if outcome.image_paths.is_empty() {
                        None
                    } else {
                        Some(outcome.image_paths.clone())
                    },
                    timestamp: String::new(),
                },
            )?;
        }

        let git_branch = if conv.worktree_path.is_some() {
            Some(git::worktree_branch(conversation_id))
        } else {
            git::current_branch(&cwd).await
        };
        self.hub
            .send_latest(&ServerEvent::MessageComplete {
                conversation_id: conversation_id.to_string(),
                session_id: outcome.session_id,
                git_branch,
            })
            .await;
        Ok(())
    }

    /// One subprocess invocation: spawn, stream stdout events, reap.
    async fn run_once(
        &self,
        conversation_id: &str,
        conv: &Conversation,
        prompt: &str,
        resume: Option<&str>,
        cwd: &Path,
    ) -> Result<TurnOutcome, BridgeError> {
        let (args, mcp_config) = self.build_invocation(conv, prompt, resume, cwd)?;
        tracing::info!(
            conversation_id,
            cwd = %cwd.display(),
            resume = resume.is_some(),
            "spawning agent turn"
        );

        let mut child = Command::new(&self.config.agent_bin)
            .args(&args)
            .current_dir(cwd)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| BridgeError::Internal("agent process exited at spawn".to_string()))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        self.active.lock().expect("active lock").insert(
            conversation_id.to_string(),
            ActiveProcess { pid, exited: exit_rx },
        );

        // All streaming happens inside this block so unregistration below
        // runs on every path, error or not.
        let result: Result<TurnOutcome, BridgeError> = async {
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| BridgeError::Internal("agent stdout not captured".to_string()))?;
            let stderr = child.stderr.take();

            let mut forwarder = EventForwarder::new(cwd.to_path_buf());
            let mut transcript = String::new();
            let mut in_tool_use = false;
            let mut saw_streaming_text = false;
            let mut result_is_error = false;
            let mut session_id: Option<String> = resume.map(str::to_string);

            // Single stream-json lines can carry megabytes (base64 tool
            // results), far past default line-buffer sizing.
            let mut lines = BufReader::with_capacity(1024 * 1024, stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let Ok(event) = serde_json::from_str::<Value>(line) else {
                    continue;
                };

                for out in forwarder.handle(&event, conversation_id) {
                    self.hub.send_latest(&out).await;
                }

                // Transcript uses exactly one text source per turn:
                // streaming deltas if any arrived, else the aggregate.
                match event.get("type").and_then(Value::as_str) {
                    Some("content_block_delta") => {
                        let delta = &event["delta"];
                        if delta.get("type").and_then(Value::as_str) == Some("text_delta") {
                            saw_streaming_text = true;
                            if in_tool_use && !transcript.is_empty() {
                                transcript.push_str("\n\n");
                            }
                            in_tool_use = false;
                            transcript.push_str(
                                delta.get("text").and_then(Value::as_str).unwrap_or_default(),
                            );
                        }
                    }
                    Some("content_block_start") => {
                        if event["content_block"].get("type").and_then(Value::as_str)
                            == Some("tool_use")
                        {
                            in_tool_use = true;
                        }
                    }
                    Some("assistant") if !saw_streaming_text => {
                        for block in event["message"]
                            .get("content")
                            .and_then(Value::as_array)
                            .into_iter()
                            .flatten()
                        {
                            if block.get("type").and_then(Value::as_str) == Some("text") {
                                transcript.push_str(
                                    block.get("text").and_then(Value::as_str).unwrap_or_default(),
                                );
                            }
                        }
                    }
                    Some("result") => {
                        result_is_error = event
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false);
                        if result_is_error {
                            tracing::warn!(conversation_id, errors = ?event.get("errors"), "agent result error");
                            // A token from a failed result could poison
                            // future resume attempts.
                        } else if let Some(sid) = event.get("session_id").and_then(Value::as_str) {
                            session_id = Some(sid.to_string());
                        }
                        if transcript.is_empty() {
                            if let Some(text) = event.get("result").and_then(Value::as_str) {
                                transcript.push_str(text);
                                self.hub
                                    .send_latest(&ServerEvent::TextDelta {
                                        text: text.to_string(),
                                        conversation_id: conversation_id.to_string(),
                                    })
                                    .await;
                            }
                        }
                    }
                    _ => {}
                }
            }

            let status = child.wait().await?;
            if let Some(mut stderr) = stderr {
                let mut buf = String::new();
                if stderr.read_to_string(&mut buf).await.is_ok() && !buf.trim().is_empty() {
                    tracing::warn!(conversation_id, stderr = %buf.trim(), "agent stderr");
                }
            }
            tracing::info!(conversation_id, code = ?status.code(), "agent turn exited");

            Ok(TurnOutcome {
                result_is_error,
                transcript,
                session_id,
                image_paths: forwarder.image_paths,
            })
        }
        .await;

        self.active.lock().expect("active lock").remove(conversation_id);
        let _ = exit_tx.send(true);
        if let Some(path) = mcp_config {
            let _ = std::fs::remove_file(path);
        }
        result
    }

    /// Assembles the agent CLI argument list for a turn. Agent mode hands
    /// tools/model/MCP to the agent definition; manual mode passes them
    /// explicitly from the conversation record.
    fn build_invocation(
        &self,
        conv: &Conversation,
        prompt: &str,
        resume: Option<&str>,
        cwd: &Path,
    ) -> Result<(Vec<String>, Option<PathBuf>), BridgeError> {
        let mut system_prompt = PLATFORM_PROMPT.to_string();
        if let Some(custom) = self.projects.custom_instructions(&cwd.to_string_lossy()) {
            system_prompt.push_str(
                "\n\nPROJECT CUSTOM INSTRUCTIONS (set by the user for this project):\n",
            );
            system_prompt.push_str(&custom);
        }

        let mut args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--max-turns".to_string(),
            "200".to_string(),
            "--append-system-prompt".to_string(),
            system_prompt,
        ];
        let mut mcp_config = None;

        if let Some(agent) = &conv.agent {
            args.push("--agent".to_string());
            args.push(agent.clone());
        } else {
            let mut tools: Vec<String> = conv
                .allowed_tools
                .clone()
                .unwrap_or_else(|| DEFAULT_ALLOWED_TOOLS.iter().map(|s| s.to_string()).collect());
            if let Some(model) = &conv.model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            if let Some(servers) = &conv.mcp_servers {
                if let Some(path) = self.mcp.write_config_file(servers)? {
                    args.push("--mcp-config".to_string());
                    args.push(path.to_string_lossy().to_string());
                    // Disabled servers are dropped from the config file, so
                    // their tool patterns must not be granted either.
                    tools.extend(
                        servers
                            .iter()
                            .filter(|name| self.mcp.is_enabled(name))
                            .map(|name| format!("mcp__{name}__*")),
                    );
                    mcp_config = Some(path);
                }
            }
            args.push("--allowedTools".to_string());
            args.push(tools.join(","));
        }

        if let Some(token) = resume {
            args.push("--resume".to_string());
            args.push(token.to_string());
        }
        Ok((args, mcp_config))
    }

    /// Terminates the active subprocess for a conversation: SIGTERM, then
    /// SIGKILL if it has not been reaped within the grace period. Returns
    /// false when nothing was running.
    pub async fn cancel(&self, conversation_id: &str) -> bool {
        let process = self
            .active
            .lock()
            .expect("active lock")
            .get(conversation_id)
            .cloned();
        let Some(mut process) = process else {
            return false;
        };
        tracing::info!(conversation_id, pid = process.pid, "terminating agent turn");
        signal_pid(process.pid, libc::SIGTERM);
        let reaped = timeout(CANCEL_GRACE, async {
            while !*process.exited.borrow() {
                if process.exited.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .is_ok();
        if !reaped {
            signal_pid(process.pid, libc::SIGKILL);
        }
        true
    }

    pub async fn cancel_all(&self) -> bool {
        let ids = self.active_conversations();
        let mut any = false;
        for id in ids {
            any |= self.cancel(&id).await;
        }
        any
    }

    /// Detached short title generation via a one-shot agent call; failures
    /// are logged and never affect the turn itself.
    fn spawn_title_task(self: Arc<Self>, conversation_id: String, first_message: String) {
        tokio::spawn(async move {
            let prompt = format!(
                "Generate a short title (3-6 words, no quotes, no punctuation at \
                 the end) for a coding conversation that starts with this \
                 message: {first_message}"
            );
            let output = timeout(
                TITLE_TIMEOUT,
                Command::new(&self.config.agent_bin)
                    .args(["-p", &prompt, "--output-format", "text", "--max-turns", "0"])
                    .env_remove("CLAUDECODE")
                    .current_dir(std::env::temp_dir())
                    .output(),
            )
            .await;
            let title = match output {
                Ok(Ok(out)) => String::from_utf8_lossy(&out.stdout).trim().to_string(),
                Ok(Err(error)) => {
                    tracing::warn!(conversation_id, %error, "title generation failed");
                    return;
                }
                Err(_) => {
                    tracing::warn!(conversation_id, "title generation timed out");
                    return;
                }
            };
            if title.is_empty()
                || title.chars().count() >= 80
                || title.to_lowercase().starts_with("error")
            {
                tracing::warn!(conversation_id, title, "title rejected");
                return;
            }
            if self.sessions.rename(&conversation_id, &title) {
                tracing::info!(conversation_id, title, "conversation renamed");
                self.hub
                    .send_latest(&ServerEvent::ConversationRenamed {
                        conversation_id,
                        name: title,
                    })
                    .await;
            }
        });
    }
}

fn signal_pid(pid: u32, signal: libc::c_int) {
    unsafe {
        libc::kill(pid as libc::pid_t, signal);
    }
}

/// Prepends attached-image references so the agent reads them with its file
/// tools; an image-only message gets a describe-this framing instead.
fn build_prompt(text: &str, image_paths: &[String]) -> String {
    if image_paths.is_empty() {
        return text.to_string();
    }
    let block: Vec<String> = image_paths
        .iter()
        .map(|path| {
            if text.is_empty() {
                format!("[The user sent you an image. View and describe it by reading this file: {path}]")
            } else {
                format!("[The user attached an image. View it by reading this file: {path}]")
            }
        })
        .collect();
    let block = block.join("\n");
    if text.is_empty() {
        block
    } else {
        format!("{block}\n\n{text}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_includes_image_references() {
        assert_eq!(build_prompt("hi", &[]), "hi");

        let with_image = build_prompt("look at this", &["/tmp/a.png".to_string()]);
        assert!(with_image.starts_with("[The user attached an image"));
        assert!(with_image.ends_with("look at this"));
        assert!(with_image.contains("/tmp/a.png"));

        let image_only = build_prompt("", &["/tmp/a.png".to_string()]);
        assert!(image_only.contains("View and describe it"));
        assert!(!image_only.contains("\n\n"));
    }

    fn runner_for_test(dir: &std::path::Path) -> Arc<TurnRunner> {
        std::env::remove_var("BRIDGE_HOST");
        let config =
            Arc::new(BridgeConfig::load(dir.join("cfg")).expect("config"));
        let sessions = Arc::new(
            SessionStore::load(config.sessions_file(), config.history_dir()).expect("sessions"),
        );
        let mcp = Arc::new(McpStore::load(config.mcp_servers_file()).expect("mcp"));
        let projects = Arc::new(ProjectConfigStore::new(config.projects_config_dir()));
        Arc::new(TurnRunner::new(
            config,
            sessions,
            mcp,
            projects,
            Arc::new(ClientHub::new()),
        ))
    }

    fn with_agent_bin(base: &Arc<TurnRunner>, agent_bin: String) -> Arc<TurnRunner> {
        let mut config = (*base.config).clone();
        config.agent_bin = agent_bin;
        Arc::new(TurnRunner::new(
            Arc::new(config),
            base.sessions.clone(),
            base.mcp.clone(),
            base.projects.clone(),
            base.hub.clone(),
        ))
    }

    #[tokio::test]
    async fn invocation_for_manual_mode() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let conv = runner
            .sessions
            .create("c1", "test", NewConversation {
                allowed_tools: Some(vec!["Read".to_string(), "Bash".to_string()]),
                model: Some("sonnet".to_string()),
                ..Default::default()
            })
            .expect("create");

        let (args, mcp_config) = runner
            .build_invocation(&conv, "do it", Some("tok-1"), Path::new("/tmp"))
            .expect("invocation");
        assert!(mcp_config.is_none());
        assert_eq!(args[0..2], ["-p", "do it"]);

        let tools_idx = args.iter().position(|a| a == "--allowedTools").expect("flag");
        assert_eq!(args[tools_idx + 1], "Read,Bash");
        let model_idx = args.iter().position(|a| a == "--model").expect("flag");
        assert_eq!(args[model_idx + 1], "sonnet");
        let resume_idx = args.iter().position(|a| a == "--resume").expect("flag");
        assert_eq!(args[resume_idx + 1], "tok-1");
        assert!(!args.iter().any(|a| a == "--agent"));
    }

    #[tokio::test]
    async fn invocation_for_agent_mode_skips_manual_flags() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let conv = runner
            .sessions
            .create("c2", "test", NewConversation {
                agent: Some("code-reviewer".to_string()),
                allowed_tools: Some(vec!["Read".to_string()]),
                model: Some("opus".to_string()),
                ..Default::default()
            })
            .expect("create");

        let (args, _) = runner
            .build_invocation(&conv, "go", None, Path::new("/tmp"))
            .expect("invocation");
        let agent_idx = args.iter().position(|a| a == "--agent").expect("flag");
        assert_eq!(args[agent_idx + 1], "code-reviewer");
        assert!(!args.iter().any(|a| a == "--allowedTools"));
        assert!(!args.iter().any(|a| a == "--model"));
        assert!(!args.iter().any(|a| a == "--resume"));
    }

    #[tokio::test]
    async fn cancel_without_active_process_is_false() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        assert!(!runner.cancel("nope").await);
        assert!(!runner.cancel_all().await);
        assert!(runner.active_conversations().is_empty());
    }

    fn write_agent_script(dir: &std::path::Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("chmod");
        path.to_string_lossy().to_string()
    }

    async fn attach_client(
        runner: &Arc<TurnRunner>,
    ) -> (u64, tokio::sync::mpsc::UnboundedReceiver<axum::extract::ws::Message>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = runner.hub.add_client(tx).await;
        (id, rx)
    }

    fn drain_events(
        rx: &mut tokio::sync::mpsc::UnboundedReceiver<axum::extract::ws::Message>,
    ) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let axum::extract::ws::Message::Text(text) = message {
                if let Ok(value) = serde_json::from_str::<Value>(&text) {
                    events.push(value);
                }
            }
        }
        events
    }

    #[tokio::test]
    async fn successful_turn_persists_token_and_history() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let script = write_agent_script(
            dir.path(),
            r#"printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"hello there"}]}}'
printf '%s\n' '{"type":"result","is_error":false,"session_id":"sess-42","result":"hello there"}'"#,
        );
        let runner = with_agent_bin(&runner, script);
        let workdir = tempfile::tempdir().expect("tempdir");
        runner
            .sessions
            .create("c1", "test", NewConversation {
                working_dir: Some(workdir.path().to_string_lossy().to_string()),
                ..Default::default()
            })
            .expect("create");
        let (client_id, mut rx) = attach_client(&runner).await;

        runner
            .clone()
            .submit_turn(client_id, "hello".to_string(), vec![], "c1".to_string())
            .await;

        let conv = runner.sessions.get("c1").expect("conversation");
        assert_eq!(conv.session_id, Some("sess-42".to_string()));

        let history = runner.sessions.history("c1");
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert_eq!(history[1].text, "hello there");

        let events = drain_events(&mut rx);
        let complete = events
            .iter()
            .find(|e| e["type"] == "message_complete")
            .expect("message_complete");
        assert_eq!(complete["session_id"], "sess-42");
    }

    #[tokio::test]
    async fn stale_token_clears_and_retries_once() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = runner_for_test(dir.path());
        // The fake agent fails any resumed turn and succeeds fresh ones.
        let script = write_agent_script(
            dir.path(),
            r#"for a in "$@"; do
  if [ "$a" = "--resume" ]; then
    printf '%s\n' '{"type":"result","is_error":true,"errors":["invalid session"]}'
    exit 0
  fi
done
printf '%s\n' '{"type":"result","is_error":false,"session_id":"sess-new","result":"fresh start"}'"#,
        );
        let runner = with_agent_bin(&base, script);
        let workdir = tempfile::tempdir().expect("tempdir");
        runner
            .sessions
            .create("c1", "test", NewConversation {
                working_dir: Some(workdir.path().to_string_lossy().to_string()),
                ..Default::default()
            })
            .expect("create");
        runner.sessions.update_session_id("c1", Some("stale-token"));
        let (client_id, mut rx) = attach_client(&runner).await;

        runner
            .clone()
            .submit_turn(client_id, "continue".to_string(), vec![], "c1".to_string())
            .await;

        let conv = runner.sessions.get("c1").expect("conversation");
        assert_eq!(conv.session_id, Some("sess-new".to_string()));

        let events = drain_events(&mut rx);
        assert!(events
            .iter()
            .any(|e| e["type"] == "error"
                && e["detail"].as_str().unwrap_or("").contains("retrying")));
        let complete = events
            .iter()
            .find(|e| e["type"] == "message_complete")
            .expect("message_complete");
        assert_eq!(complete["session_id"], "sess-new");

        let history = runner.sessions.history("c1");
        assert_eq!(history.last().expect("entry").text, "fresh start");
    }

    #[tokio::test]
    async fn cancel_terminates_a_running_turn() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = runner_for_test(dir.path());
        let script = write_agent_script(dir.path(), "exec sleep 30");
        let runner = with_agent_bin(&base, script);
        let workdir = tempfile::tempdir().expect("tempdir");
        runner
            .sessions
            .create("c1", "test", NewConversation {
                working_dir: Some(workdir.path().to_string_lossy().to_string()),
                ..Default::default()
            })
            .expect("create");
        let (client_id, _rx) = attach_client(&runner).await;

        let handle = tokio::spawn(
            runner
                .clone()
                .submit_turn(client_id, "spin".to_string(), vec![], "c1".to_string()),
        );
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !runner.is_active("c1") {
            assert!(tokio::time::Instant::now() < deadline, "turn never registered");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        assert!(runner.cancel("c1").await);
        handle.await.expect("join");
        assert!(!runner.is_active("c1"));
    }

    #[tokio::test]
    async fn lock_table_is_garbage_collected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let lock = runner.conversation_lock("c1");
        let guard = lock.clone().try_lock_owned().expect("lock");
        runner.gc_locks();
        // Held locks survive collection.
        assert!(runner.locks.lock().expect("locks").contains_key("c1"));

        drop(guard);
        drop(lock);
        runner.gc_locks();
        assert!(runner.locks.lock().expect("locks").is_empty());
    }

    #[tokio::test]
    async fn gc_keeps_a_lock_already_handed_out() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        // A submit can fetch the lock and get preempted before locking it.
        // Collection in that window must not mint a second lock for the id,
        // or two turns could run the same conversation at once.
        let first = runner.conversation_lock("c1");
        runner.gc_locks();
        let second = runner.conversation_lock("c1");
        assert!(Arc::ptr_eq(&first, &second));

        let _guard = first.try_lock().expect("first");
        assert!(second.try_lock().is_err());
    }

    #[tokio::test]
    async fn newer_turn_terminates_the_running_one_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let base = runner_for_test(dir.path());
        let log = dir.path().join("turns.log");
        // The first turn hangs until signalled; every invocation logs its
        // start so ordering against the termination is observable.
        let script = write_agent_script(
            dir.path(),
            &format!(
                r#"LOG="{log}"
if [ "$2" = "first" ]; then
  trap 'echo "term first" >> "$LOG"; exit 0' TERM
fi
echo "start $2" >> "$LOG"
if [ "$2" = "first" ]; then
  sleep 30 > /dev/null 2>&1 &
  wait $!
fi
printf '%s\n' '{{"type":"result","is_error":false,"session_id":"sess-b","result":"done"}}'"#,
                log = log.display()
            ),
        );
        let runner = with_agent_bin(&base, script);
        let workdir = tempfile::tempdir().expect("tempdir");
        runner
            .sessions
            .create("c1", "test", NewConversation {
                working_dir: Some(workdir.path().to_string_lossy().to_string()),
                ..Default::default()
            })
            .expect("create");
        let (client_id, _rx) = attach_client(&runner).await;

        let first = tokio::spawn(runner.clone().submit_turn(
            client_id,
            "first".to_string(),
            vec![],
            "c1".to_string(),
        ));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let content = std::fs::read_to_string(&log).unwrap_or_default();
            if content.contains("start first") && runner.is_active("c1") {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "first turn never started");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        runner
            .clone()
            .submit_turn(client_id, "second".to_string(), vec![], "c1".to_string())
            .await;
        first.await.expect("join");

        let lines = std::fs::read_to_string(&log).expect("log");
        let lines: Vec<&str> = lines.lines().collect();
        let term = lines
            .iter()
            .position(|l| *l == "term first")
            .expect("first was terminated");
        let second = lines
            .iter()
            .position(|l| *l == "start second")
            .expect("second ran");
        assert!(term < second, "first must die before the second starts: {lines:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn busy_when_the_conversation_never_frees() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let (client_id, mut rx) = attach_client(&runner).await;
        // Stands in for a turn that outlives the grace period after cancel.
        let _guard = runner
            .conversation_lock("c1")
            .try_lock_owned()
            .expect("hold");

        runner
            .clone()
            .submit_turn(client_id, "hi".to_string(), vec![], "c1".to_string())
            .await;

        let events = drain_events(&mut rx);
        let busy = events.iter().find(|e| e["type"] == "busy").expect("busy event");
        assert_eq!(busy["conversation_id"], "c1");
        assert!(runner.sessions.get("c1").is_none(), "no turn ran");
    }

    #[tokio::test]
    async fn disabled_mcp_servers_get_no_tool_grants() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let stdio = |name: &str| crate::mcp::McpServer {
            name: name.to_string(),
            display_name: String::new(),
            transport: "stdio".to_string(),
            command: Some("server-bin".to_string()),
            args: None,
            url: None,
            headers: None,
            env: None,
            enabled: true,
        };
        runner.mcp.add(stdio("alpha")).expect("add");
        runner.mcp.add(stdio("beta")).expect("add");
        runner.mcp.toggle("beta").expect("disable");

        let conv = runner
            .sessions
            .create("c1", "test", NewConversation {
                mcp_servers: Some(vec!["alpha".to_string(), "beta".to_string()]),
                ..Default::default()
            })
            .expect("create");

        let (args, mcp_config) = runner
            .build_invocation(&conv, "go", None, Path::new("/tmp"))
            .expect("invocation");
        let tools_idx = args.iter().position(|a| a == "--allowedTools").expect("flag");
        assert!(args[tools_idx + 1].contains("mcp__alpha__*"));
        assert!(!args[tools_idx + 1].contains("mcp__beta__*"));
        if let Some(path) = mcp_config {
            let _ = std::fs::remove_file(path);
        }
    }

    #[tokio::test]
    async fn project_instructions_append_to_system_prompt() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = runner_for_test(dir.path());
        let workdir = tempfile::tempdir().expect("tempdir");
        runner
            .projects
            .set(&workdir.path().to_string_lossy(), "Use Czech in UI strings.")
            .expect("set");
        let conv = runner
            .sessions
            .create("c1", "test", NewConversation::default())
            .expect("create");

        let (args, _) = runner
            .build_invocation(&conv, "go", None, workdir.path())
            .expect("invocation");
        let idx = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .expect("flag");
        assert!(args[idx + 1].contains("PROJECT CUSTOM INSTRUCTIONS"));
        assert!(args[idx + 1].ends_with("Use Czech in UI strings."));

        // Other directories keep the plain platform prompt.
        let (args, _) = runner
            .build_invocation(&conv, "go", None, Path::new("/tmp/elsewhere"))
            .expect("invocation");
        let idx = args
            .iter()
            .position(|a| a == "--append-system-prompt")
            .expect("flag");
        assert!(!args[idx + 1].contains("PROJECT CUSTOM INSTRUCTIONS"));
    }
}
