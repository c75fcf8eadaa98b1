//! Per-package build recipes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::recipes::language::{load_language_recipe, LanguageRecipe};
use crate::recipes::{glob_config_paths, RecipeError};
use crate::registry::AvailablePackage;

const DEFAULT_TARGET_SYSTEM: &str = "x86_64-linux-gnu";
const DEFAULT_TARGET_ARCH: &str = "x86_64";

/// One buildable `(package, version)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRecipe {
    pub name: String,
    pub version: String,
    pub target_system: String,
    pub target_arch: String,
    pub base_path: PathBuf,
    pub queue_with: Vec<String>,
}

/// All recipes of one package name, plus its language sub-recipes.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageRecipeSet {
    pub name: String,
    pub versions: Vec<String>,
    pub kind: String,
    pub queue_with: Vec<String>,
    pub dep_pkgs: BTreeMap<String, Vec<String>>,
    pub recipes: BTreeMap<String, PackageRecipe>,
    pub languages: BTreeMap<String, LanguageRecipe>,
}

#[derive(Debug, Deserialize)]
struct PackageConfigFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default, rename = "type")]
    kind: String,
    #[serde(default)]
    queue_with: Vec<String>,
    #[serde(default)]
    dep_pkgs: BTreeMap<String, Vec<String>>,
}

/// The input consumed by one container build: a bare recipe, or a recipe
/// paired with the concrete artifact it is pinned against.
#[derive(Debug, Clone)]
pub enum BuildConfig {
    Bare(PackageRecipe),
    WithDep {
        recipe: PackageRecipe,
        dep: AvailablePackage,
    },
}

impl BuildConfig {
    pub fn recipe(&self) -> &PackageRecipe {
        match self {
            BuildConfig::Bare(recipe) => recipe,
            BuildConfig::WithDep { recipe, .. } => recipe,
        }
    }

    pub fn name(&self) -> &str {
        &self.recipe().name
    }

    pub fn version(&self) -> &str {
        &self.recipe().version
    }

    pub fn target_system(&self) -> &str {
        &self.recipe().target_system
    }

    pub fn target_arch(&self) -> &str {
        &self.recipe().target_arch
    }

    pub fn base_path(&self) -> &Path {
        &self.recipe().base_path
    }

    pub fn queue_with(&self) -> &[String] {
        &self.recipe().queue_with
    }

    pub fn dep_package(&self) -> Option<&AvailablePackage> {
        match self {
            BuildConfig::Bare(_) => None,
            BuildConfig::WithDep { dep, .. } => Some(dep),
        }
    }

    pub fn dep_name(&self) -> &str {
        self.dep_package().map(|dep| dep.name.as_str()).unwrap_or("")
    }

    pub fn dep_version(&self) -> &str {
        self.dep_package()
            .map(|dep| dep.version.as_str())
            .unwrap_or("")
    }

    /// Name of the package the container generates. Dep-pinned builds get a
    /// distinct name so both artifacts can coexist in the repository.
    pub fn gen_pkg_name(&self) -> String {
        match self {
            BuildConfig::Bare(recipe) => recipe.name.clone(),
            BuildConfig::WithDep { recipe, dep } => {
                format!("{}--with-{}.{}-", recipe.name, dep.name, dep.version)
            }
        }
    }

    /// Host work-directory name; unique per build key so repeat builds
    /// against different deps never collide.
    pub fn work_dir_name(&self) -> String {
        let recipe = self.recipe();
        match self {
            BuildConfig::Bare(_) => format!(
                "{}-{}-{}",
                recipe.name, recipe.target_system, recipe.version
            ),
            BuildConfig::WithDep { dep, .. } => format!(
                "{}-{}-{}-with-{}-{}",
                recipe.name, recipe.target_system, recipe.version, dep.name, dep.version
            ),
        }
    }

    /// Final path component of the in-container install prefix.
    pub fn package_path_name(&self) -> String {
        let recipe = self.recipe();
        match self {
            BuildConfig::Bare(_) => format!("{}.{}", recipe.name, recipe.version),
            BuildConfig::WithDep { dep, .. } => format!(
                "{}.{}<with.{}.{}>",
                recipe.name, recipe.version, dep.name, dep.version
            ),
        }
    }
}

/// Load one package directory: `package_config.json` plus any language
/// subdirectories.
pub fn load_package_set(base_dir: &Path) -> Result<PackageRecipeSet, RecipeError> {
    let config_path = base_dir.join("package_config.json");
    let buffer = std::fs::read_to_string(&config_path)?;
    let file: PackageConfigFile =
        serde_json::from_str(&buffer).map_err(|source| RecipeError::Json {
            path: config_path.clone(),
            source,
        })?;

    if file.name.is_empty() {
        return Err(RecipeError::MissingField {
            path: config_path,
            field: "name",
        });
    }
    if file.versions.is_empty() {
        return Err(RecipeError::MissingField {
            path: config_path,
            field: "versions",
        });
    }

    let recipes = file
        .versions
        .iter()
        .map(|version| {
            (
                version.clone(),
                PackageRecipe {
                    name: file.name.clone(),
                    version: version.clone(),
                    target_system: DEFAULT_TARGET_SYSTEM.to_owned(),
                    target_arch: DEFAULT_TARGET_ARCH.to_owned(),
                    base_path: base_dir.to_path_buf(),
                    queue_with: file.queue_with.clone(),
                },
            )
        })
        .collect();

    let mut languages = BTreeMap::new();
    for language_dir in glob_config_paths(base_dir)? {
        let language = load_language_recipe(&language_dir)?;
        languages.insert(language.name.clone(), language);
    }

    Ok(PackageRecipeSet {
        name: file.name,
        versions: file.versions,
        kind: file.kind,
        queue_with: file.queue_with,
        dep_pkgs: file.dep_pkgs,
        recipes,
        languages,
    })
}
