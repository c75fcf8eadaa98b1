//! The recipe graph: discovery and parsing of the on-disk recipe tree.
//!
//! The tree is laid out as `<base>/<package>/package_config.json` with
//! language subdirectories one level down, each carrying a `config.json`
//! and a `profile_templates/` subtree.

pub mod language;
pub mod package;
pub mod source;
pub mod template;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::info;

pub use language::LanguageRecipe;
pub use package::{load_package_set, BuildConfig, PackageRecipe, PackageRecipeSet};
pub use source::{GitError, GitRepository};
pub use template::{ExecSection, ProfileGenerator, ProfilePatch, ProfileTemplate};

use crate::registry::{AvailablePackages, RegistryError};

/// Errors raised while loading or refreshing the recipe tree.
#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    /// IO error while walking or reading the tree.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// A JSON config file failed to parse.
    #[error("failed to parse {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    /// A YAML template file failed to parse.
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    /// A config file is missing a required field.
    #[error("{path}: required field '{field}' is missing or empty")]
    MissingField { path: PathBuf, field: &'static str },
    /// A profile template violates the section requirements.
    #[error("invalid template {path}: {reason}")]
    InvalidTemplate { path: PathBuf, reason: String },
    /// Local source mode with a base directory that does not exist.
    #[error("recipe base directory {0} not found")]
    MissingBaseDir(PathBuf),
    /// No recipe set with the requested name.
    #[error("there are no recipes for {0}")]
    UnknownPackage(String),
    /// The recipe set has no recipe for the requested version.
    #[error("{name} has no recipe for version {version}")]
    UnknownVersion { name: String, version: String },
    /// The dependency artifact for a pinned build is not available.
    #[error("dependency not available: {0}")]
    DepUnavailable(#[from] RegistryError),
    /// Syncing the remote repository failed.
    #[error("git error: {0}")]
    Git(#[from] GitError),
}

fn list_has_prefix(a: &[String], b: &[String]) -> bool {
    for (index, segment) in a.iter().enumerate() {
        match b.get(index) {
            None => return true,
            Some(other) if segment != other => return false,
            Some(_) => {}
        }
    }
    true
}

fn collect_dirs(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), std::io::Error> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        if entry.file_type()?.is_dir() {
            let path = entry.path();
            out.push(path.clone());
            collect_dirs(&path, out)?;
        }
    }

    Ok(())
}

fn path_segments(path: &Path) -> Vec<String> {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect()
}

/// Yield the shallowest config-carrying directories under `base`: walk the
/// tree in lexical order, let every visited directory shadow its
/// descendants (segment-wise prefix test, not substring), and keep the
/// survivors whose names do not start with `_` or `.`.
pub fn glob_config_paths(base: &Path) -> Result<Vec<PathBuf>, std::io::Error> {
    let mut all = Vec::new();
    collect_dirs(base, &mut all)?;

    let mut seen: Vec<Vec<String>> = Vec::new();
    let mut targets = Vec::new();

    for path in all {
        let segments = path_segments(&path);
        if seen.iter().any(|prefix| list_has_prefix(&segments, prefix)) {
            continue;
        }
        seen.push(segments);

        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('_') || name.starts_with('.') {
            continue;
        }

        targets.push(path);
    }

    Ok(targets)
}

/// How the recipe tree is sourced.
#[derive(Debug, Clone)]
pub struct RecipeSourceConfig {
    /// Sync the tree from a git remote instead of using a plain directory.
    pub remote: bool,
    /// On-disk location of the tree.
    pub base_dir: PathBuf,
    /// Clone URL, remote mode only.
    pub repository: String,
}

/// The parsed recipe graph plus its source.
///
/// Refreshes are atomic: the map is only replaced once the whole tree has
/// parsed successfully, so a broken push to the recipe repository cannot
/// take down a working graph.
#[derive(Debug)]
pub struct RecipeTree {
    base_dir: PathBuf,
    repo: Option<tokio::sync::Mutex<GitRepository>>,
    map: Mutex<BTreeMap<String, PackageRecipeSet>>,
}

impl RecipeTree {
    /// Open the tree, cloning it first in remote mode if it is not on disk
    /// yet.
    pub async fn open(config: &RecipeSourceConfig) -> Result<Self, RecipeError> {
        let repo = config
            .remote
            .then(|| tokio::sync::Mutex::new(GitRepository::new(&config.base_dir, &config.repository)));

        if !config.base_dir.exists() {
            match &repo {
                Some(repo) => repo.lock().await.clone_repo().await?,
                None => return Err(RecipeError::MissingBaseDir(config.base_dir.clone())),
            }
        }

        let tree = Self {
            base_dir: config.base_dir.clone(),
            repo,
            map: Mutex::new(BTreeMap::new()),
        };
        tree.reload()?;

        Ok(tree)
    }

    /// Root of the on-disk tree, bind-mounted into build containers.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Commit hash of the last sync, remote mode only.
    pub async fn revision(&self) -> Option<String> {
        match &self.repo {
            Some(repo) => repo.lock().await.revision().map(str::to_owned),
            None => None,
        }
    }

    /// Sync the source (remote mode) and re-parse the whole tree.
    pub async fn refresh(&self) -> Result<(), RecipeError> {
        if let Some(repo) = &self.repo {
            repo.lock().await.pull().await?;
        }

        self.reload()
    }

    fn reload(&self) -> Result<(), RecipeError> {
        let paths = glob_config_paths(&self.base_dir)?;
        info!(
            "package config glob: {:?}",
            paths.iter().filter_map(|p| p.file_name()).collect::<Vec<_>>()
        );

        let mut new_map = BTreeMap::new();
        for path in paths {
            let set = load_package_set(&path)?;
            new_map.insert(set.name.clone(), set);
        }

        *self.map.lock().unwrap() = new_map;

        Ok(())
    }

    /// Clone of the whole parsed graph.
    pub fn map(&self) -> BTreeMap<String, PackageRecipeSet> {
        self.map.lock().unwrap().clone()
    }

    /// Look up the bare recipe for `(name, version)`.
    pub fn find(&self, name: &str, version: &str) -> Result<PackageRecipe, RecipeError> {
        let map = self.map.lock().unwrap();
        let set = map
            .get(name)
            .ok_or_else(|| RecipeError::UnknownPackage(name.to_owned()))?;
        set.recipes
            .get(version)
            .cloned()
            .ok_or_else(|| RecipeError::UnknownVersion {
                name: name.to_owned(),
                version: version.to_owned(),
            })
    }

    /// Look up a recipe paired with the built artifact it is pinned
    /// against.
    pub fn find_with_dep(
        &self,
        name: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
        registry: &AvailablePackages,
    ) -> Result<BuildConfig, RecipeError> {
        let recipe = self.find(name, version)?;
        let dep = registry.find(dep_name, dep_version)?;

        Ok(BuildConfig::WithDep { recipe, dep })
    }
}
