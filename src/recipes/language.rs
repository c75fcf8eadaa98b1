//! Per-language sub-recipes.
//!
//! A package may expose several language front-ends (the `g++` front-end of
//! a `gcc` package, say). Each lives in its own subdirectory with a
//! `config.json` and an optional `profile_templates/` tree.

use std::path::Path;

use serde::Deserialize;

use crate::recipes::template::{
    read_profile_patch, read_profile_template, ProfilePatch, ProfileTemplate,
};
use crate::recipes::RecipeError;

/// One language variant exposed by a package.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageRecipe {
    pub name: String,
    pub kind: String,
    pub versions: Vec<String>,
    pub template: Option<ProfileTemplate>,
    pub patches: Vec<ProfilePatch>,
}

#[derive(Debug, Deserialize)]
struct LanguageConfigFile {
    #[serde(default)]
    name: String,
    #[serde(default)]
    versions: Vec<String>,
    #[serde(default, rename = "type")]
    kind: String,
}

/// Load one language directory: `config.json` plus its profile templates.
pub fn load_language_recipe(base_dir: &Path) -> Result<LanguageRecipe, RecipeError> {
    let config_path = base_dir.join("config.json");
    let buffer = std::fs::read_to_string(&config_path)?;
    let file: LanguageConfigFile =
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

    let templates_dir = base_dir.join("profile_templates");

    let template_path = templates_dir.join("template.yml");
    let template = if template_path.exists() {
        Some(read_profile_template(&template_path)?)
    } else {
        None
    };

    let mut patches = Vec::new();
    if templates_dir.is_dir() {
        let mut entries: Vec<_> = std::fs::read_dir(&templates_dir)?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            if !entry.file_type()?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if file_name.starts_with('_') || file_name.starts_with('.') {
                continue;
            }
            if file_name.starts_with("patch_") {
                patches.push(read_profile_patch(&entry.path())?);
            }
        }
    }

    Ok(LanguageRecipe {
        name: file.name,
        kind: file.kind,
        versions: file.versions,
        template,
        patches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL_TEMPLATE: &str = r#"
display_version: "%{display_version}"
exec:
  commands: ["./prog"]
  cpu_limit: 4
  memory_limit: 268435456
"#;

    const BOOST_PATCH: &str = r#"
from:
  versions: ["1.66"]
to:
  name: cpp
  versions: ["7.3.0"]
append:
  compile:
    commands: ["-I%{install_prefix}/include"]
"#;

    fn language_dir(with_template: bool) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"name": "cpp", "versions": ["7.3.0"], "type": "compiler"}"#,
        )
        .unwrap();

        let templates = dir.path().join("profile_templates");
        std::fs::create_dir(&templates).unwrap();
        if with_template {
            std::fs::write(templates.join("template.yml"), MINIMAL_TEMPLATE).unwrap();
        }
        dir
    }

    #[test]
    fn loads_config_and_template() {
        let dir = language_dir(true);
        let language = load_language_recipe(dir.path()).unwrap();

        assert_eq!(language.name, "cpp");
        assert_eq!(language.kind, "compiler");
        assert_eq!(language.versions, vec!["7.3.0"]);
        assert!(language.template.is_some());
        assert!(language.patches.is_empty());
    }

    #[test]
    fn template_is_optional() {
        let dir = language_dir(false);
        let language = load_language_recipe(dir.path()).unwrap();
        assert!(language.template.is_none());
    }

    #[test]
    fn discovers_patches_by_prefix() {
        let dir = language_dir(true);
        let templates = dir.path().join("profile_templates");
        std::fs::write(templates.join("patch_boost.yml"), BOOST_PATCH).unwrap();
        std::fs::write(templates.join("_ignored.yml"), BOOST_PATCH).unwrap();
        std::fs::write(templates.join(".hidden.yml"), BOOST_PATCH).unwrap();
        std::fs::write(templates.join("notes.txt"), "not a patch").unwrap();

        let language = load_language_recipe(dir.path()).unwrap();
        assert_eq!(language.patches.len(), 1);
        assert_eq!(language.patches[0].to.name, "cpp");
    }

    #[test]
    fn missing_profile_templates_dir_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.json"),
            r#"{"name": "cpp", "versions": ["7.3.0"]}"#,
        )
        .unwrap();

        let language = load_language_recipe(dir.path()).unwrap();
        assert!(language.template.is_none());
        assert!(language.patches.is_empty());
    }

    #[test]
    fn broken_template_fails_the_language() {
        let dir = language_dir(false);
        std::fs::write(
            dir.path().join("profile_templates").join("template.yml"),
            "compile:\n  commands: []\n",
        )
        .unwrap();

        assert!(load_language_recipe(dir.path()).is_err());
    }
}
