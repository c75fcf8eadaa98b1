//! Profile templates and patches.
//!
//! Each language recipe may carry one `template.yml` (the seed that fills a
//! profile from scratch) and any number of `patch_*` files (additive
//! fragments applied on top of an already-seeded profile, possibly owned by
//! a different package).

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::placeholder::{
    expand, expand_list, expand_list_map, expand_map, expand_nested_list, PlaceholderError,
};
use crate::profiles::Profile;
use crate::recipes::RecipeError;
use crate::registry::AvailablePackage;

/// One command-execution block of a profile: how to compile, link or run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub envs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fixed_commands: Vec<Vec<String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selectable_options: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub cpu_limit: u64,
    #[serde(default)]
    pub memory_limit: u64,
}

/// The seed declaration for a language's profiles.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileTemplate {
    #[serde(default)]
    pub display_version: String,
    #[serde(default)]
    pub is_build_required: bool,
    #[serde(default)]
    pub is_link_independent: bool,

    #[serde(default)]
    pub compile: Option<ExecSection>,
    #[serde(default)]
    pub link: Option<ExecSection>,
    #[serde(default)]
    pub exec: Option<ExecSection>,
}

/// Version selector on the patch-owning language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchFrom {
    #[serde(default)]
    pub versions: Vec<String>,
}

/// The language and versions a patch extends.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchTo {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub versions: Vec<String>,
}

/// Sections a patch appends to the target profile.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchAppend {
    #[serde(default)]
    pub compile: Option<ExecSection>,
    #[serde(default)]
    pub link: Option<ExecSection>,
    #[serde(default)]
    pub exec: Option<ExecSection>,
}

/// An additive cross-package profile fragment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfilePatch {
    #[serde(default)]
    pub from: PatchFrom,
    #[serde(default)]
    pub to: PatchTo,
    #[serde(default)]
    pub append: PatchAppend,
}

/// Anything that can contribute to a profile: a seed template or a patch.
///
/// `ctx` is the artifact the contribution is rendered against. For patches
/// this is the artifact of the *patch-owning* package, so its placeholders
/// expand to the contributor's install paths rather than the target's.
pub trait ProfileGenerator {
    fn apply(&self, profile: &mut Profile, ctx: &AvailablePackage) -> Result<(), PlaceholderError>;
}

impl ProfileGenerator for ProfileTemplate {
    fn apply(&self, profile: &mut Profile, ctx: &AvailablePackage) -> Result<(), PlaceholderError> {
        profile.display_version = expand(&self.display_version, ctx)?;
        profile.is_build_required = self.is_build_required;
        profile.is_link_independent = self.is_link_independent;

        profile.compile = render_section(self.compile.as_ref(), ctx)?;
        profile.link = render_section(self.link.as_ref(), ctx)?;
        profile.exec = render_section(self.exec.as_ref(), ctx)?;

        Ok(())
    }
}

impl ProfileGenerator for ProfilePatch {
    fn apply(&self, profile: &mut Profile, ctx: &AvailablePackage) -> Result<(), PlaceholderError> {
        append_rendered(&mut profile.compile, self.append.compile.as_ref(), ctx)?;
        append_rendered(&mut profile.link, self.append.link.as_ref(), ctx)?;
        append_rendered(&mut profile.exec, self.append.exec.as_ref(), ctx)?;

        Ok(())
    }
}

fn render_section(
    section: Option<&ExecSection>,
    ctx: &AvailablePackage,
) -> Result<Option<ExecSection>, PlaceholderError> {
    let Some(section) = section else {
        return Ok(None);
    };

    Ok(Some(ExecSection {
        extension: section
            .extension
            .as_deref()
            .map(|e| expand(e, ctx))
            .transpose()?,
        commands: expand_list(&section.commands, ctx)?,
        envs: expand_map(&section.envs, ctx)?,
        fixed_commands: expand_nested_list(&section.fixed_commands, ctx)?,
        selectable_options: expand_list_map(&section.selectable_options, ctx)?,
        cpu_limit: section.cpu_limit,
        memory_limit: section.memory_limit,
    }))
}

/// Render a patch section and merge it into `base`. A missing patch section
/// leaves the base untouched.
fn append_rendered(
    base: &mut Option<ExecSection>,
    patch: Option<&ExecSection>,
    ctx: &AvailablePackage,
) -> Result<(), PlaceholderError> {
    let Some(rendered) = render_section(patch, ctx)? else {
        return Ok(());
    };

    let target = base.get_or_insert_with(ExecSection::default);

    target.commands.extend(rendered.commands);
    target.fixed_commands.extend(rendered.fixed_commands);

    for (key, value) in rendered.envs {
        target
            .envs
            .entry(key)
            .and_modify(|existing| existing.push_str(&value))
            .or_insert(value);
    }

    for (key, values) in rendered.selectable_options {
        target
            .selectable_options
            .entry(key)
            .and_modify(|existing| existing.extend(values.iter().cloned()))
            .or_insert(values);
    }

    Ok(())
}

/// Load and validate a `template.yml`.
pub fn read_profile_template(path: &Path) -> Result<ProfileTemplate, RecipeError> {
    let buffer = std::fs::read_to_string(path)?;
    let template: ProfileTemplate =
        serde_yaml::from_str(&buffer).map_err(|source| RecipeError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

    validate_section(path, "compile", template.compile.as_ref())?;
    validate_section(path, "link", template.link.as_ref())?;

    if template.exec.is_none() {
        return Err(RecipeError::InvalidTemplate {
            path: path.to_path_buf(),
            reason: "must contain an 'exec' section".to_owned(),
        });
    }
    validate_section(path, "exec", template.exec.as_ref())?;

    Ok(template)
}

/// Load a `patch_*` file. Patch sections are additive fragments and are not
/// held to the seed-section requirements.
pub fn read_profile_patch(path: &Path) -> Result<ProfilePatch, RecipeError> {
    let buffer = std::fs::read_to_string(path)?;
    serde_yaml::from_str(&buffer).map_err(|source| RecipeError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

fn validate_section(
    path: &Path,
    label: &str,
    section: Option<&ExecSection>,
) -> Result<(), RecipeError> {
    let Some(section) = section else {
        return Ok(());
    };

    let reject = |reason: String| RecipeError::InvalidTemplate {
        path: path.to_path_buf(),
        reason,
    };

    if section.commands.is_empty() {
        return Err(reject(format!("{} section must contain 'commands'", label)));
    }
    if section.cpu_limit == 0 {
        return Err(reject(format!(
            "{} section must contain a nonzero 'cpu_limit'",
            label
        )));
    }
    if section.memory_limit == 0 {
        return Err(reject(format!(
            "{} section must contain a nonzero 'memory_limit'",
            label
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;

    const TEMPLATE_YML: &str = r#"
display_version: "%{display_version}"
is_build_required: true
compile:
  extension: cpp
  commands: ["g++", "$src"]
  envs:
    CPLUS_INCLUDE_PATH: "%{install_prefix}/include"
  cpu_limit: 10
  memory_limit: 536870912
exec:
  commands: ["./a.out"]
  cpu_limit: 4
  memory_limit: 268435456
"#;

    fn write_template(content: &str) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("template.yml");
        std::fs::write(&path, content).unwrap();
        (dir, path)
    }

    fn gcc_context() -> AvailablePackage {
        AvailablePackage {
            name: "gcc".to_owned(),
            version: "7.3.0".to_owned(),
            display_version: "7.3.0".to_owned(),
            install_base: "/usr/local/torigoya".to_owned(),
            install_prefix: "/usr/local/torigoya/gcc.7.3.0".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn template_parses_and_renders() {
        let (_dir, path) = write_template(TEMPLATE_YML);
        let template = read_profile_template(&path).unwrap();

        let mut profile = Profile::default();
        template.apply(&mut profile, &gcc_context()).unwrap();

        assert_eq!(profile.display_version, "7.3.0");
        assert!(profile.is_build_required);
        let compile = profile.compile.unwrap();
        assert_eq!(compile.commands, vec!["g++", "$src"]);
        assert_eq!(
            compile.envs["CPLUS_INCLUDE_PATH"],
            "/usr/local/torigoya/gcc.7.3.0/include"
        );
        assert_eq!(compile.cpu_limit, 10);
        assert!(profile.link.is_none());
    }

    #[test]
    fn template_without_exec_is_rejected() {
        let (_dir, path) = write_template(
            r#"
compile:
  commands: ["g++"]
  cpu_limit: 1
  memory_limit: 1
"#,
        );
        assert!(matches!(
            read_profile_template(&path),
            Err(RecipeError::InvalidTemplate { .. })
        ));
    }

    #[test]
    fn empty_commands_are_rejected() {
        let (_dir, path) = write_template(
            r#"
exec:
  commands: []
  cpu_limit: 1
  memory_limit: 1
"#,
        );
        assert!(read_profile_template(&path).is_err());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let (_dir, path) = write_template(
            r#"
exec:
  commands: ["./a.out"]
  cpu_limit: 0
  memory_limit: 1
"#,
        );
        assert!(read_profile_template(&path).is_err());

        let (_dir, path) = write_template(
            r#"
exec:
  commands: ["./a.out"]
  cpu_limit: 1
"#,
        );
        assert!(read_profile_template(&path).is_err());
    }

    #[test]
    fn patch_appends_commands_after_base() {
        let mut profile = Profile {
            compile: Some(ExecSection {
                commands: vec!["A".to_owned(), "B".to_owned()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = ProfilePatch {
            append: PatchAppend {
                compile: Some(ExecSection {
                    commands: vec!["C".to_owned()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        patch.apply(&mut profile, &gcc_context()).unwrap();
        assert_eq!(profile.compile.unwrap().commands, vec!["A", "B", "C"]);
    }

    #[test]
    fn patch_env_collision_concatenates() {
        let mut profile = Profile {
            exec: Some(ExecSection {
                envs: btreemap! { "K".to_owned() => "x".to_owned() },
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = ProfilePatch {
            append: PatchAppend {
                exec: Some(ExecSection {
                    envs: btreemap! {
                        "K".to_owned() => "y".to_owned(),
                        "J".to_owned() => "z".to_owned(),
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        patch.apply(&mut profile, &gcc_context()).unwrap();
        let envs = profile.exec.unwrap().envs;
        assert_eq!(envs["K"], "xy");
        assert_eq!(envs["J"], "z");
    }

    #[test]
    fn patch_selectable_collision_concatenates_lists() {
        let mut profile = Profile {
            compile: Some(ExecSection {
                selectable_options: btreemap! {
                    "std".to_owned() => vec!["-std=c++14".to_owned()],
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = ProfilePatch {
            append: PatchAppend {
                compile: Some(ExecSection {
                    selectable_options: btreemap! {
                        "std".to_owned() => vec!["-std=c++17".to_owned()],
                    },
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        patch.apply(&mut profile, &gcc_context()).unwrap();
        assert_eq!(
            profile.compile.unwrap().selectable_options["std"],
            vec!["-std=c++14", "-std=c++17"]
        );
    }

    #[test]
    fn patch_renders_with_its_own_context() {
        let boost = AvailablePackage {
            name: "boost".to_owned(),
            version: "1.66".to_owned(),
            install_prefix: "/opt/boost/1.66".to_owned(),
            ..Default::default()
        };

        let mut profile = Profile {
            compile: Some(ExecSection {
                commands: vec!["g++".to_owned(), "$src".to_owned()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = ProfilePatch {
            append: PatchAppend {
                compile: Some(ExecSection {
                    commands: vec!["-I%{install_prefix}/include".to_owned()],
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        patch.apply(&mut profile, &boost).unwrap();
        assert_eq!(
            profile.compile.unwrap().commands,
            vec!["g++", "$src", "-I/opt/boost/1.66/include"]
        );
    }

    #[test]
    fn patch_without_section_is_a_noop_on_it() {
        let mut profile = Profile {
            link: Some(ExecSection {
                commands: vec!["ld".to_owned()],
                ..Default::default()
            }),
            ..Default::default()
        };

        let patch = ProfilePatch::default();
        patch.apply(&mut profile, &gcc_context()).unwrap();
        assert_eq!(profile.link.unwrap().commands, vec!["ld"]);
    }

    #[test]
    fn patch_file_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patch_boost.yml");
        std::fs::write(
            &path,
            r#"
from:
  versions: ["1.66"]
to:
  name: gcc
  versions: ["7.3.0", "8.1.0"]
append:
  compile:
    commands: ["-I%{install_prefix}/include"]
"#,
        )
        .unwrap();

        let patch = read_profile_patch(&path).unwrap();
        assert_eq!(patch.from.versions, vec!["1.66"]);
        assert_eq!(patch.to.name, "gcc");
        assert_eq!(patch.to.versions.len(), 2);
        assert!(patch.append.compile.is_some());
        assert!(patch.append.exec.is_none());
    }
}
