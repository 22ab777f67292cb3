use std::{
    collections::HashMap,
    net::TcpListener,
    path::Path,
    process::Stdio,
    time::Duration,
};

use serde::Serialize;
use serde_json::Value;
use tokio::{
    net::TcpStream,
    process::{Child, Command},
    sync::Mutex,
    time::timeout,
};

use crate::error::BridgeError;

pub const PREVIEW_PORT_MIN: u16 = 8100;
pub const PREVIEW_PORT_MAX: u16 = 8199;

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize)]
pub struct PreviewInfo {
    pub port: u16,
    pub pid: u32,
    pub working_dir: String,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

struct PreviewEntry {
    info: PreviewInfo,
    child: Child,
}

/// Background dev servers for web previews, keyed by project directory.
/// One server per directory; repeated starts return the existing record.
pub struct PreviewManager {
    previews: Mutex<HashMap<String, PreviewEntry>>,
}

impl PreviewManager {
    pub fn new() -> Self {
        Self {
            previews: Mutex::new(HashMap::new()),
        }
    }

    /// Whether the directory looks like a servable web project.
    pub fn can_preview(working_dir: &Path) -> bool {
        if let Some(scripts) = package_scripts(working_dir) {
            if scripts.get("dev").is_some() || scripts.get("start").is_some() {
                return true;
            }
        }
        working_dir.join("manage.py").exists()
            || working_dir.join("app.py").exists()
            || working_dir.join("dist/index.html").exists()
            || working_dir.join("index.html").exists()
    }

    /// Starts a dev server for the directory, or returns the live record if
    /// one is already running there.
    pub async fn start(
        &self,
        working_dir: &str,
        conversation_id: Option<String>,
    ) -> Result<PreviewInfo, BridgeError> {
        let mut previews = self.previews.lock().await;

        if let Some(entry) = previews.get_mut(working_dir) {
            match entry.child.try_wait() {
                Ok(None) => return Ok(entry.info.clone()),
                // Exited; drop the stale record and start fresh.
                _ => {
                    previews.remove(working_dir);
                }
            }
        }

        let taken: Vec<u16> = previews.values().map(|e| e.info.port).collect();
        let port = allocate_port(working_dir, &taken)?;
        let command = detect_command(Path::new(working_dir), port)?;
        let command_str = command.join(" ");
        tracing::info!(working_dir, port, command = %command_str, "starting preview");

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..])
            .current_dir(working_dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        // Own process group so the server survives agent subprocess cleanup
        // and can be stopped wholesale with killpg.
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }
        let child = cmd.spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| BridgeError::Internal("preview process exited at spawn".to_string()))?;

        let info = PreviewInfo {
            port,
            pid,
            working_dir: working_dir.to_string(),
            command: command_str,
            conversation_id,
        };
        previews.insert(working_dir.to_string(), PreviewEntry { info: info.clone(), child });
        drop(previews);

        if !wait_for_port(port).await {
            let mut previews = self.previews.lock().await;
            let exited = previews
                .get_mut(working_dir)
                .and_then(|entry| entry.child.try_wait().ok().flatten());
            if let Some(status) = exited {
                previews.remove(working_dir);
                return Err(BridgeError::Internal(format!(
                    "Preview server exited immediately ({status})"
                )));
            }
            // Slow startup is not a failure as long as the process lives.
            tracing::warn!(port, "preview not responding yet, process still running");
        }
        tracing::info!(port, pid, "preview ready");
        Ok(info)
    }

    /// Stops the server for a directory. False when none was running.
    pub async fn stop(&self, working_dir: &str) -> bool {
        let entry = self.previews.lock().await.remove(working_dir);
        let Some(mut entry) = entry else {
            return false;
        };
        if entry.child.try_wait().ok().flatten().is_some() {
            return true;
        }
        tracing::info!(working_dir, pid = entry.info.pid, "stopping preview");
        kill_group(entry.info.pid, libc::SIGTERM);
        if timeout(STOP_GRACE, entry.child.wait()).await.is_err() {
            kill_group(entry.info.pid, libc::SIGKILL);
            let _ = entry.child.kill().await;
        }
        true
    }

    pub async fn restart(
        &self,
        working_dir: &str,
        conversation_id: Option<String>,
    ) -> Result<PreviewInfo, BridgeError> {
        self.stop(working_dir).await;
        self.start(working_dir, conversation_id).await
    }

    pub async fn stop_all(&self) {
        let dirs: Vec<String> = self.previews.lock().await.keys().cloned().collect();
        for dir in dirs {
            self.stop(&dir).await;
        }
    }

    /// Live preview for a directory; reaps a dead record lazily.
    pub async fn get(&self, working_dir: &str) -> Option<PreviewInfo> {
        let mut previews = self.previews.lock().await;
        let entry = previews.get_mut(working_dir)?;
        if entry.child.try_wait().ok().flatten().is_some() {
            previews.remove(working_dir);
            return None;
        }
        Some(entry.info.clone())
    }

    pub async fn list(&self) -> Vec<PreviewInfo> {
        let mut previews = self.previews.lock().await;
        previews.retain(|_, entry| matches!(entry.child.try_wait(), Ok(None)));
        let mut all: Vec<PreviewInfo> = previews.values().map(|e| e.info.clone()).collect();
        all.sort_by_key(|info| info.port);
        all
    }
}

fn kill_group(pid: u32, signal: libc::c_int) {
    unsafe {
        // Negative pid addresses the process group created by setsid.
        libc::kill(-(pid as libc::pid_t), signal);
    }
}

/// Stable FNV-1a over the directory path, so the same project keeps landing
/// on the same preferred port across bridge restarts.
fn fnv1a64(data: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in data.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

pub fn preferred_port(working_dir: &str) -> u16 {
    let range = u64::from(PREVIEW_PORT_MAX - PREVIEW_PORT_MIN + 1);
    PREVIEW_PORT_MIN + (fnv1a64(working_dir) % range) as u16
}

/// Preferred port first, then linear probe with wraparound, skipping ports
/// already recorded or not bindable.
fn allocate_port(working_dir: &str, taken: &[u16]) -> Result<u16, BridgeError> {
    let range = PREVIEW_PORT_MAX - PREVIEW_PORT_MIN + 1;
    let start = preferred_port(working_dir);
    for offset in 0..range {
        let port = PREVIEW_PORT_MIN + (start - PREVIEW_PORT_MIN + offset) % range;
        if taken.contains(&port) {
            continue;
        }
        if TcpListener::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(BridgeError::Internal(
        "No free ports available in preview range".to_string(),
    ))
}

fn package_scripts(working_dir: &Path) -> Option<serde_json::Map<String, Value>> {
    let content = std::fs::read_to_string(working_dir.join("package.json")).ok()?;
    let pkg: Value = serde_json::from_str(&content).ok()?;
    pkg.get("scripts")?.as_object().cloned()
}

/// Picks a dev-server command from the project layout. An unrecognized
/// layout is a declared failure, not a silent no-op.
fn detect_command(working_dir: &Path, port: u16) -> Result<Vec<String>, BridgeError> {
    let arg = |s: &str| s.to_string();

    if let Some(scripts) = package_scripts(working_dir) {
        if scripts.contains_key("dev") {
            return Ok(vec![
                arg("npm"), arg("run"), arg("dev"), arg("--"),
                arg("--host"), arg("0.0.0.0"), arg("--port"), port.to_string(),
            ]);
        }
        if scripts.contains_key("start") {
            return Ok(vec![arg("npm"), arg("start")]);
        }
    }
    if working_dir.join("manage.py").exists() {
        return Ok(vec![
            arg("python3"), arg("manage.py"), arg("runserver"),
            format!("0.0.0.0:{port}"),
        ]);
    }
    if working_dir.join("app.py").exists() {
        return Ok(vec![
            arg("python3"), arg("-m"), arg("flask"), arg("run"),
            arg("--host"), arg("0.0.0.0"), arg("--port"), port.to_string(),
        ]);
    }
    for dir in ["dist", "."] {
        if working_dir.join(dir).join("index.html").exists() {
            return Ok(vec![
                arg("python3"), arg("-m"), arg("http.server"), port.to_string(),
                arg("--directory"), working_dir.join(dir).to_string_lossy().to_string(),
                arg("--bind"), arg("0.0.0.0"),
            ]);
        }
    }
    Err(BridgeError::Internal(format!(
        "Could not detect project type in {}",
        working_dir.display()
    )))
}

/// Polls the port until it accepts a TCP connection. A false return means
/// "not ready yet", not "failed"; the caller decides based on whether the
/// process is still alive.
async fn wait_for_port(port: u16) -> bool {
    let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if timeout(Duration::from_secs(1), TcpStream::connect(("127.0.0.1", port)))
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    false
}
