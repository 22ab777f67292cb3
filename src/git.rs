use std::{path::{Path, PathBuf}, time::Duration};

use tokio::{process::Command, time::timeout};

/// Runs a git subcommand in `dir`, returning trimmed stdout on success.
/// Any failure (git missing, not a repo, timeout) yields None; callers treat
/// git information as best-effort decoration.
async fn git_output(dir: &Path, args: &[&str], limit: Duration) -> Option<String> {
    let result = timeout(
        limit,
        Command::new("git")
            .args(args)
            .current_dir(dir)
            .kill_on_drop(true)
            .output(),
    )
    .await;
    match result {
        Ok(Ok(output)) if output.status.success() => {
            Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
        }
        Ok(Ok(_)) | Ok(Err(_)) => None,
        Err(_) => {
            tracing::warn!(?args, dir = %dir.display(), "git command timed out");
            None
        }
    }
}

pub async fn is_git_repo(dir: &Path) -> bool {
    git_output(dir, &["rev-parse", "--is-inside-work-tree"], Duration::from_secs(5))
        .await
        .as_deref()
        == Some("true")
}

pub async fn current_branch(dir: &Path) -> Option<String> {
    git_output(dir, &["branch", "--show-current"], Duration::from_secs(5))
        .await
        .filter(|branch| !branch.is_empty())
}

/// Branch name used for a conversation's isolated worktree.
pub fn worktree_branch(conversation_id: &str) -> String {
    format!("bridge/{conversation_id}")
}

/// Creates a detached worktree for the conversation on a fresh branch.
/// Returns the worktree path, or None when the repo or git refuses.
pub async fn create_worktree(
    repo_dir: &Path,
    conversation_id: &str,
    worktrees_dir: &Path,
) -> Option<PathBuf> {
    if !is_git_repo(repo_dir).await {
        return None;
    }
    if tokio::fs::create_dir_all(worktrees_dir).await.is_err() {
        return None;
    }
    let worktree_path = worktrees_dir.join(conversation_id);
    if worktree_path.exists() {
        return Some(worktree_path);
    }
    let branch = worktree_branch(conversation_id);
    let path_arg = worktree_path.to_string_lossy().to_string();
    let created = git_output(
        repo_dir,
        &["worktree", "add", "-b", &branch, &path_arg],
        Duration::from_secs(30),
    )
    .await
    .is_some();
    if created {
        tracing::info!(conversation_id, path = %worktree_path.display(), "created worktree");
        Some(worktree_path)
    } else {
        tracing::warn!(conversation_id, "failed to create worktree");
        None
    }
}

/// Removes a conversation's worktree and its branch. An already-missing
/// worktree counts as success.
pub async fn remove_worktree(repo_dir: &Path, worktree_path: &Path, conversation_id: &str) -> bool {
    if !worktree_path.exists() {
        return true;
    }
    let path_arg = worktree_path.to_string_lossy().to_string();
    let removed = git_output(
        repo_dir,
        &["worktree", "remove", "--force", &path_arg],
        Duration::from_secs(30),
    )
    .await
    .is_some();
    // Branch deletion is cleanup only; a failure here leaves a dangling
    // branch but no dangling files.
    let branch = worktree_branch(conversation_id);
    let _ = git_output(repo_dir, &["branch", "-D", &branch], Duration::from_secs(10)).await;
    if !removed {
        tracing::warn!(conversation_id, "failed to remove worktree");
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn init_repo(dir: &Path) {
        for args in [
            vec!["init", "-b", "main"],
            vec!["config", "user.email", "test@test"],
            vec!["config", "user.name", "test"],
            vec!["commit", "--allow-empty", "-m", "init"],
        ] {
            let status = Command::new("git")
                .args(&args)
                .current_dir(dir)
                .status()
                .await
                .expect("git");
            assert!(status.success(), "git {args:?} failed");
        }
    }

    #[tokio::test]
    async fn detects_repos_and_branches() {
        let repo = tempfile::tempdir().expect("tempdir");
        let plain = tempfile::tempdir().expect("tempdir");
        init_repo(repo.path()).await;

        assert!(is_git_repo(repo.path()).await);
        assert!(!is_git_repo(plain.path()).await);
        assert_eq!(current_branch(repo.path()).await.as_deref(), Some("main"));
        assert_eq!(current_branch(plain.path()).await, None);
    }

    #[tokio::test]
    async fn worktree_roundtrip() {
        let repo = tempfile::tempdir().expect("tempdir");
        let worktrees = tempfile::tempdir().expect("tempdir");
        init_repo(repo.path()).await;

        let path = create_worktree(repo.path(), "conv-1", worktrees.path())
            .await
            .expect("worktree");
        assert!(path.exists());
        assert_eq!(
            current_branch(&path).await.as_deref(),
            Some("bridge/conv-1")
        );

        // Idempotent: an existing worktree is returned as-is.
        let again = create_worktree(repo.path(), "conv-1", worktrees.path())
            .await
            .expect("worktree");
        assert_eq!(again, path);

        assert!(remove_worktree(repo.path(), &path, "conv-1").await);
        assert!(!path.exists());
        // Removing again is a no-op success.
        assert!(remove_worktree(repo.path(), &path, "conv-1").await);
    }
}
