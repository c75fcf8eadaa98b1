//! Profile synthesis.
//!
//! Profiles are the execution specifications handed to downstream runtime
//! sandboxes: one per `(language, version)`, derived from the artifacts the
//! factory has actually built, the language templates, and any
//! cross-package patches.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::persist;
use crate::placeholder::PlaceholderError;
use crate::recipes::{ExecSection, PackageRecipeSet, ProfileGenerator};
use crate::registry::{AvailablePackage, AvailablePackages};

/// Errors raised while synthesizing profiles.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Two seed templates claim the same `(language, version)`.
    #[error("profiles for ({0}, {1}) are already registered")]
    DuplicateSeed(String, String),
    /// The registry references a package the recipe tree does not know.
    #[error("there is no recipe set for package {0}")]
    UnknownPackage(String),
    /// A template string failed to expand.
    #[error(transparent)]
    Placeholder(#[from] PlaceholderError),
    /// IO error on the backing file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The synthesized execution specification for one `(language, version)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub version: String,
    pub display_version: String,
    pub is_build_required: bool,
    pub is_link_independent: bool,

    pub compile: Option<ExecSection>,
    pub link: Option<ExecSection>,
    pub exec: Option<ExecSection>,
}

/// One contribution to a profile: a seed template or a patch, paired with
/// the artifact its placeholders are rendered against.
///
/// A seed with no generator marks a `(language, version)` that exists
/// without a template: it emits no profile of its own, but patches may
/// still key off it.
struct Contribution {
    generator: Option<Box<dyn ProfileGenerator>>,
    ref_pkg: AvailablePackage,
}

type GeneratorMap = BTreeMap<(String, String), Vec<Contribution>>;

/// Compute the full profile list from the registry and the recipe graph.
pub fn generate_profiles(
    registry: &AvailablePackages,
    recipe_map: &BTreeMap<String, PackageRecipeSet>,
) -> Result<Vec<Profile>, ProfileError> {
    let mut generators: GeneratorMap = BTreeMap::new();

    // Seed pass: one template per (language, version), contributed by the
    // artifact that owns the language.
    registry.walk(|name, version, _dep_name, _dep_version, ap| {
        let set = recipe_map
            .get(name)
            .ok_or_else(|| ProfileError::UnknownPackage(name.to_owned()))?;

        for (language_name, language) in &set.languages {
            if !language.versions.iter().any(|v| v == version) {
                continue;
            }

            let generator = match &language.template {
                Some(template) => {
                    Some(Box::new(template.clone()) as Box<dyn ProfileGenerator>)
                }
                None => {
                    info!("template for ({}, {}) is nil", language_name, version);
                    None
                }
            };

            let key = (language_name.clone(), version.to_owned());
            if generators.contains_key(&key) {
                return Err(ProfileError::DuplicateSeed(key.0, key.1));
            }

            generators.insert(
                key,
                vec![Contribution {
                    generator,
                    ref_pkg: ap.clone(),
                }],
            );
        }

        Ok(())
    })?;

    // Patch pass: patches append to already-seeded targets, rendered with
    // the placeholder context of the patch-owning artifact.
    registry.walk(|name, _version, _dep_name, _dep_version, ap| {
        let set = recipe_map
            .get(name)
            .ok_or_else(|| ProfileError::UnknownPackage(name.to_owned()))?;

        for (language_name, language) in &set.languages {
            for patch in &language.patches {
                for from_version in &patch.from.versions {
                    let from_key = (language_name.clone(), from_version.clone());
                    if !generators.contains_key(&from_key) {
                        info!("no patch source ({}, {})", language_name, from_version);
                        continue;
                    }

                    for to_version in &patch.to.versions {
                        let to_key = (patch.to.name.clone(), to_version.clone());
                        let Some(target) = generators.get_mut(&to_key) else {
                            info!("no patch target ({}, {})", patch.to.name, to_version);
                            continue;
                        };

                        info!(
                            "patch from ({}, {}) to ({}, {})",
                            language_name, from_version, patch.to.name, to_version
                        );
                        target.push(Contribution {
                            generator: Some(Box::new(patch.clone())),
                            ref_pkg: ap.clone(),
                        });
                    }
                }
            }
        }

        Ok::<(), ProfileError>(())
    })?;

    // Generate: seed first, then every patch in registration order. A key
    // holding only a nil seed emits nothing.
    let mut profiles = Vec::with_capacity(generators.len());
    for ((name, version), contributions) in &generators {
        if contributions.len() == 1 && contributions[0].generator.is_none() {
            info!("profile ({}, {}) skipped", name, version);
            continue;
        }

        let mut profile = Profile {
            name: name.clone(),
            version: version.clone(),
            ..Default::default()
        };

        for contribution in contributions {
            let Some(generator) = &contribution.generator else {
                continue;
            };
            generator.apply(&mut profile, &contribution.ref_pkg)?;
        }

        profiles.push(profile);
    }

    Ok(profiles)
}

/// The persistent list of synthesized profiles.
#[derive(Debug)]
pub struct ProfilesHolder {
    profiles: Mutex<Vec<Profile>>,
    file_path: PathBuf,
}

impl ProfilesHolder {
    /// Load the profile list from `path`, starting empty if absent.
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        let profiles: Vec<Profile> = persist::load_or_default(path)?;
        Ok(Self {
            profiles: Mutex::new(profiles),
            file_path: path.to_path_buf(),
        })
    }

    /// Persist the profile list.
    pub fn save(&self) -> Result<(), ProfileError> {
        let profiles = self.profiles.lock().unwrap();
        persist::save_json(&self.file_path, &*profiles)?;
        Ok(())
    }

    /// Recompute the whole list. The previous list is kept on failure.
    pub fn regenerate(
        &self,
        registry: &AvailablePackages,
        recipe_map: &BTreeMap<String, PackageRecipeSet>,
    ) -> Result<(), ProfileError> {
        let fresh = generate_profiles(registry, recipe_map)?;
        *self.profiles.lock().unwrap() = fresh;
        Ok(())
    }

    /// Current profile list.
    pub fn list(&self) -> Vec<Profile> {
        self.profiles.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recipes::template::{PatchAppend, PatchFrom, PatchTo};
    use crate::recipes::{LanguageRecipe, ProfilePatch, ProfileTemplate};

    fn artifact(name: &str, version: &str, install_prefix: &str) -> AvailablePackage {
        AvailablePackage {
            name: name.to_owned(),
            version: version.to_owned(),
            display_version: version.to_owned(),
            install_base: "/usr/local/torigoya".to_owned(),
            install_prefix: install_prefix.to_owned(),
            ..Default::default()
        }
    }

    fn cpp_template() -> ProfileTemplate {
        ProfileTemplate {
            display_version: "%{display_version}".to_owned(),
            compile: Some(ExecSection {
                commands: vec!["g++".to_owned(), "$src".to_owned()],
                cpu_limit: 10,
                memory_limit: 1024,
                ..Default::default()
            }),
            exec: Some(ExecSection {
                commands: vec!["./a.out".to_owned()],
                cpu_limit: 4,
                memory_limit: 512,
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn language(name: &str, versions: &[&str], template: Option<ProfileTemplate>, patches: Vec<ProfilePatch>) -> LanguageRecipe {
        LanguageRecipe {
            name: name.to_owned(),
            kind: String::new(),
            versions: versions.iter().map(|v| (*v).to_owned()).collect(),
            template,
            patches,
        }
    }

    fn package_set(name: &str, versions: &[&str], languages: Vec<LanguageRecipe>) -> PackageRecipeSet {
        PackageRecipeSet {
            name: name.to_owned(),
            versions: versions.iter().map(|v| (*v).to_owned()).collect(),
            kind: String::new(),
            queue_with: Vec::new(),
            dep_pkgs: BTreeMap::new(),
            recipes: BTreeMap::new(),
            languages: languages
                .into_iter()
                .map(|l| (l.name.clone(), l))
                .collect(),
        }
    }

    fn empty_registry() -> AvailablePackages {
        let dir = tempfile::tempdir().unwrap();
        let registry = AvailablePackages::load(&dir.path().join("r.json")).unwrap();
        registry
    }

    fn boost_patch() -> ProfilePatch {
        ProfilePatch {
            from: PatchFrom {
                versions: vec!["1.66".to_owned()],
            },
            to: PatchTo {
                name: "cpp".to_owned(),
                versions: vec!["7.3.0".to_owned()],
            },
            append: PatchAppend {
                compile: Some(ExecSection {
                    commands: vec!["-I%{install_prefix}/include".to_owned()],
                    ..Default::default()
                }),
                ..Default::default()
            },
        }
    }

    /// Registry with gcc 7.3.0 + boost 1.66; boost's header-only language
    /// carries a patch extending the C++ compile command line.
    fn patched_setup() -> (AvailablePackages, BTreeMap<String, PackageRecipeSet>) {
        let registry = empty_registry();
        registry.update(artifact("gcc", "7.3.0", "/usr/local/torigoya/gcc.7.3.0"));
        registry.update(artifact("boost", "1.66", "/opt/boost/1.66"));

        let mut map = BTreeMap::new();
        map.insert(
            "gcc".to_owned(),
            package_set(
                "gcc",
                &["7.3.0"],
                vec![language("cpp", &["7.3.0"], Some(cpp_template()), Vec::new())],
            ),
        );
        map.insert(
            "boost".to_owned(),
            package_set(
                "boost",
                &["1.66"],
                vec![language("boost", &["1.66"], None, vec![boost_patch()])],
            ),
        );

        (registry, map)
    }

    #[test]
    fn seed_produces_one_profile_per_language_version() {
        let registry = empty_registry();
        registry.update(artifact("gcc", "7.3.0", "/usr/local/torigoya/gcc.7.3.0"));

        let mut map = BTreeMap::new();
        map.insert(
            "gcc".to_owned(),
            package_set(
                "gcc",
                &["7.3.0"],
                vec![language("cpp", &["7.3.0"], Some(cpp_template()), Vec::new())],
            ),
        );

        let profiles = generate_profiles(&registry, &map).unwrap();
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "cpp");
        assert_eq!(profiles[0].version, "7.3.0");
        assert_eq!(profiles[0].display_version, "7.3.0");
    }

    #[test]
    fn language_without_matching_version_is_skipped() {
        let registry = empty_registry();
        registry.update(artifact("gcc", "9.9.9", "/usr/local/torigoya/gcc.9.9.9"));

        let mut map = BTreeMap::new();
        map.insert(
            "gcc".to_owned(),
            package_set(
                "gcc",
                &["9.9.9"],
                vec![language("cpp", &["7.3.0"], Some(cpp_template()), Vec::new())],
            ),
        );

        assert!(generate_profiles(&registry, &map).unwrap().is_empty());
    }

    #[test]
    fn language_without_template_is_skipped() {
        let registry = empty_registry();
        registry.update(artifact("boost", "1.66", "/opt/boost/1.66"));

        let mut map = BTreeMap::new();
        map.insert(
            "boost".to_owned(),
            package_set(
                "boost",
                &["1.66"],
                vec![language("boost", &["1.66"], None, Vec::new())],
            ),
        );

        assert!(generate_profiles(&registry, &map).unwrap().is_empty());
    }

    #[test]
    fn patch_extends_the_target_with_its_own_context() {
        let (registry, map) = patched_setup();

        let profiles = generate_profiles(&registry, &map).unwrap();
        let cpp = profiles.iter().find(|p| p.name == "cpp").unwrap();

        assert_eq!(
            cpp.compile.as_ref().unwrap().commands,
            vec!["g++", "$src", "-I/opt/boost/1.66/include"]
        );
        // The boost language itself has no template, so no boost profile.
        assert_eq!(profiles.len(), 1);
    }

    #[test]
    fn generation_is_deterministic() {
        let (registry, map) = patched_setup();

        let first = generate_profiles(&registry, &map).unwrap();
        let second = generate_profiles(&registry, &map).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn duplicate_seed_fails_generation() {
        let registry = empty_registry();
        registry.update(artifact("gcc", "7.3.0", "/usr/local/torigoya/gcc.7.3.0"));
        registry.update(artifact("clang", "7.3.0", "/usr/local/torigoya/clang.7.3.0"));

        // Both packages claim the cpp language at the same version.
        let mut map = BTreeMap::new();
        map.insert(
            "gcc".to_owned(),
            package_set(
                "gcc",
                &["7.3.0"],
                vec![language("cpp", &["7.3.0"], Some(cpp_template()), Vec::new())],
            ),
        );
        map.insert(
            "clang".to_owned(),
            package_set(
                "clang",
                &["7.3.0"],
                vec![language("cpp", &["7.3.0"], Some(cpp_template()), Vec::new())],
            ),
        );

        assert!(matches!(
            generate_profiles(&registry, &map),
            Err(ProfileError::DuplicateSeed(_, _))
        ));
    }

    #[test]
    fn artifact_without_recipe_set_fails() {
        let registry = empty_registry();
        registry.update(artifact("gone", "1.0", "/opt/gone/1.0"));

        let map = BTreeMap::new();
        assert!(matches!(
            generate_profiles(&registry, &map),
            Err(ProfileError::UnknownPackage(_))
        ));
    }

    #[test]
    fn holder_keeps_previous_list_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let holder = ProfilesHolder::load(&dir.path().join("proc_profiles.json")).unwrap();

        let (registry, map) = patched_setup();
        holder.regenerate(&registry, &map).unwrap();
        assert_eq!(holder.list().len(), 1);

        // An artifact with no recipe set fails regeneration; the previous
        // list must survive.
        registry.update(artifact("gone", "1.0", "/opt/gone/1.0"));
        assert!(holder.regenerate(&registry, &map).is_err());
        assert_eq!(holder.list().len(), 1);
    }

    #[test]
    fn holder_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proc_profiles.json");

        let holder = ProfilesHolder::load(&path).unwrap();
        let (registry, map) = patched_setup();
        holder.regenerate(&registry, &map).unwrap();
        holder.save().unwrap();

        let reloaded = ProfilesHolder::load(&path).unwrap();
        assert_eq!(reloaded.list(), holder.list());
    }
}
