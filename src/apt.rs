//! Debian repository maintenance.
//!
//! Built `.deb` files are folded into a reprepro-managed repository that is
//! served over HTTP. After a successful include the source file is removed;
//! the artifact lives on inside the repository pool.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::info;

const REPREPRO: &str = "reprepro";
const CODE_NAME: &str = "trusty";

/// Errors raised while maintaining the repository.
#[derive(Debug, thiserror::Error)]
pub enum AptError {
    /// reprepro could not be spawned or the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// reprepro exited non-zero.
    #[error("reprepro {0} failed with status {1}")]
    Command(&'static str, i32),
}

/// A reprepro-managed apt repository on disk.
#[derive(Debug, Clone)]
pub struct AptRepository {
    base_dir: PathBuf,
}

impl AptRepository {
    /// Open the repository directory, creating it if missing.
    pub fn new(base_dir: &Path) -> Result<Self, AptError> {
        if !base_dir.exists() {
            std::fs::create_dir_all(base_dir)?;
        }

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
        })
    }

    /// Repository root, served at `/apt/*`.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Fold a `.deb` into the repository, then delete the source file.
    pub async fn add_package(&self, deb_path: &Path) -> Result<(), AptError> {
        self.run("includedeb", &include_args(&self.base_dir, deb_path))
            .await?;

        std::fs::remove_file(deb_path)?;

        Ok(())
    }

    /// Drop a package from the repository index.
    pub async fn remove_package(&self, package_name: &str) -> Result<(), AptError> {
        info!("remove from repository: {}", package_name);
        self.run("remove", &remove_args(&self.base_dir, package_name))
            .await
    }

    async fn run(&self, op: &'static str, args: &[String]) -> Result<(), AptError> {
        let status = Command::new(REPREPRO)
            .args(args)
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await?;

        if !status.success() {
            return Err(AptError::Command(op, status.code().unwrap_or(-1)));
        }

        Ok(())
    }
}

fn include_args(base_dir: &Path, deb_path: &Path) -> Vec<String> {
    vec![
        "-b".to_owned(),
        base_dir.display().to_string(),
        "includedeb".to_owned(),
        CODE_NAME.to_owned(),
        deb_path.display().to_string(),
    ]
}

fn remove_args(base_dir: &Path, package_name: &str) -> Vec<String> {
    vec![
        "-b".to_owned(),
        base_dir.display().to_string(),
        "remove".to_owned(),
        CODE_NAME.to_owned(),
        package_name.to_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn include_command_shape() {
        let args = include_args(Path::new("/srv/apt_repository"), Path::new("/srv/packages/gcc-7.3.0.deb"));
        assert_eq!(
            args,
            vec!["-b", "/srv/apt_repository", "includedeb", "trusty", "/srv/packages/gcc-7.3.0.deb"]
        );
    }

    #[test]
    fn remove_command_shape() {
        let args = remove_args(Path::new("/srv/apt_repository"), "gcc");
        assert_eq!(args, vec!["-b", "/srv/apt_repository", "remove", "trusty", "gcc"]);
    }

    #[test]
    fn new_creates_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("apt_repository");
        let repo = AptRepository::new(&base).unwrap();
        assert!(base.is_dir());
        assert_eq!(repo.base_dir(), base);
    }
}
