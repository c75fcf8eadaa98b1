//! Git-backed recipe-tree source.
//!
//! In remote mode the recipe tree is a clone of a configured repository.
//! Every refresh discards local drift with `reset --hard` (once a revision
//! is known) and fast-forwards from `origin/master`.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{error, info};

/// Errors raised while syncing the recipe repository.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    /// The git binary could not be spawned.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A git command exited non-zero.
    #[error("git {op} failed: {output}")]
    Command { op: String, output: String },
}

/// A clone of the remote recipe repository.
#[derive(Debug)]
pub struct GitRepository {
    base_dir: PathBuf,
    url: String,
    revision: Option<String>,
}

impl GitRepository {
    pub fn new(base_dir: &Path, url: &str) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            url: url.to_owned(),
            revision: None,
        }
    }

    /// Commit hash captured after the last sync.
    pub fn revision(&self) -> Option<&str> {
        self.revision.as_deref()
    }

    /// Clone the repository into the base directory.
    pub async fn clone_repo(&mut self) -> Result<(), GitError> {
        run_git(
            "clone",
            Command::new("git")
                .arg("clone")
                .arg(&self.url)
                .arg(&self.base_dir),
        )
        .await?;

        self.capture_revision().await;

        Ok(())
    }

    /// Discard local drift and fast-forward from origin/master.
    pub async fn pull(&mut self) -> Result<(), GitError> {
        if self.revision.is_some() {
            let output = run_git(
                "reset",
                Command::new("git")
                    .args(["reset", "--hard", "origin/master"])
                    .current_dir(&self.base_dir),
            )
            .await?;
            info!("git reset --hard origin/master\n{}", output);
        }

        let output = run_git(
            "pull",
            Command::new("git")
                .args(["pull", "origin", "master"])
                .current_dir(&self.base_dir),
        )
        .await?;
        info!("git pull origin master\n{}", output);

        self.capture_revision().await;

        Ok(())
    }

    async fn capture_revision(&mut self) {
        let result = run_git(
            "rev-parse",
            Command::new("git")
                .args(["rev-parse", "HEAD"])
                .current_dir(&self.base_dir),
        )
        .await;

        match result {
            Ok(hash) => {
                let hash = hash.trim().to_owned();
                info!("recipe tree at commit {}", hash);
                self.revision = Some(hash);
            }
            Err(err) => error!("failed to capture recipe tree revision: {}", err),
        }
    }
}

async fn run_git(op: &str, command: &mut Command) -> Result<String, GitError> {
    let output = command.output().await?;
    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        error!("git {} failed:\n{}", op, combined);
        return Err(GitError::Command {
            op: op.to_owned(),
            output: combined,
        });
    }

    Ok(combined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pull_outside_a_repository_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = GitRepository::new(&dir.path().join("missing"), "file:///nowhere");
        assert!(repo.pull().await.is_err());
        assert!(repo.revision().is_none());
    }
}
