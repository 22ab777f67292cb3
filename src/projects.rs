use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Per-project settings, keyed by the project directory's name. Custom
/// instructions get appended to the agent's system prompt for every turn
/// run inside that project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub path: String,
    #[serde(default)]
    pub custom_instructions: String,
}

pub struct ProjectConfigStore {
    dir: PathBuf,
}

impl ProjectConfigStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn config_file(&self, project_path: &str) -> PathBuf {
        let name = std::path::Path::new(project_path)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        self.dir.join(format!("{name}.json"))
    }

    /// Config for a project; an unset project yields empty instructions.
    pub fn get(&self, project_path: &str) -> ProjectConfig {
        let file = self.config_file(project_path);
        if let Ok(data) = fs::read_to_string(&file) {
            if let Ok(config) = serde_json::from_str::<ProjectConfig>(&data) {
                return config;
            }
            tracing::warn!(path = %file.display(), "unreadable project config, ignoring");
        }
        ProjectConfig {
            path: project_path.to_string(),
            custom_instructions: String::new(),
        }
    }

    /// Trimmed custom instructions, or None when unset or blank.
    pub fn custom_instructions(&self, project_path: &str) -> Option<String> {
        let instructions = self.get(project_path).custom_instructions;
        let trimmed = instructions.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    }

    pub fn set(
        &self,
        project_path: &str,
        instructions: &str,
    ) -> Result<ProjectConfig, BridgeError> {
        fs::create_dir_all(&self.dir)?;
        let config = ProjectConfig {
            path: project_path.to_string(),
            custom_instructions: instructions.to_string(),
        };
        fs::write(
            self.config_file(project_path),
            serde_json::to_string_pretty(&config)?,
        )?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_project_yields_empty_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProjectConfigStore::new(dir.path().join("projects"));
        let config = store.get("/home/user/my-app");
        assert_eq!(config.path, "/home/user/my-app");
        assert_eq!(config.custom_instructions, "");
        assert!(store.custom_instructions("/home/user/my-app").is_none());
    }

    #[test]
    fn set_then_get_round_trips_by_directory_name() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProjectConfigStore::new(dir.path().join("projects"));
        store
            .set("/home/user/my-app", "Always use tabs.")
            .expect("set");

        // The same project reached through a different parent path shares
        // the config, it is keyed by directory name.
        assert_eq!(
            store.custom_instructions("/mnt/other/my-app").as_deref(),
            Some("Always use tabs.")
        );
        assert_eq!(store.get("/home/user/my-app").custom_instructions, "Always use tabs.");
    }

    #[test]
    fn blank_instructions_read_as_unset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ProjectConfigStore::new(dir.path().join("projects"));
        store.set("/home/user/app", "   \n  ").expect("set");
        assert!(store.custom_instructions("/home/user/app").is_none());
    }
}
