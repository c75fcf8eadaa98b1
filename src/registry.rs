//! Registry of successfully built artifacts.
//!
//! The registry is the source of truth for what the factory has produced.
//! Entries are keyed by `(name, version, dep_name, dep_version)`; the dep
//! components are empty strings for packages built without a dependency pin.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::persist;

/// Errors raised by registry operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The requested package name has no entries.
    #[error("no available package named {0}")]
    NotFound(String),
    /// IO error while loading or saving the backing file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Serialization error on the backing file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One successfully built artifact.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailablePackage {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub dep_name: String,
    #[serde(default)]
    pub dep_version: String,
    pub display_version: String,
    pub generated_package_file_name: String,
    pub generated_package_name: String,
    pub generated_package_version: String,
    pub install_base: String,
    pub install_prefix: String,
}

type DepVersionMap = BTreeMap<String, AvailablePackage>;
type DepNameMap = BTreeMap<String, DepVersionMap>;
type VersionMap = BTreeMap<String, DepNameMap>;
type NameMap = BTreeMap<String, VersionMap>;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RegistryState {
    last_updated: i64,
    packages: NameMap,
}

/// Persistent map of built artifacts, serialized behind one mutex.
#[derive(Debug)]
pub struct AvailablePackages {
    state: Mutex<RegistryState>,
    file_path: PathBuf,
}

impl AvailablePackages {
    /// Load the registry from `path`, starting empty if the file is absent.
    pub fn load(path: &Path) -> Result<Self, RegistryError> {
        let state: RegistryState = persist::load_or_default(path)?;
        Ok(Self {
            state: Mutex::new(state),
            file_path: path.to_path_buf(),
        })
    }

    /// Persist the registry to its backing file.
    pub fn save(&self) -> Result<(), RegistryError> {
        let state = self.state.lock().unwrap();
        persist::save_json(&self.file_path, &*state)?;
        Ok(())
    }

    /// Unix timestamp of the last mutation.
    pub fn last_updated(&self) -> i64 {
        self.state.lock().unwrap().last_updated
    }

    /// Upsert an artifact at its 4-tuple key. Intermediate levels are
    /// materialized as needed; an existing entry at the key is overwritten.
    pub fn update(&self, ap: AvailablePackage) {
        let mut state = self.state.lock().unwrap();

        state
            .packages
            .entry(ap.name.clone())
            .or_default()
            .entry(ap.version.clone())
            .or_default()
            .entry(ap.dep_name.clone())
            .or_default()
            .insert(ap.dep_version.clone(), ap);

        state.last_updated = Utc::now().timestamp();
    }

    /// Delete the entry at the 4-tuple key, pruning levels left empty.
    pub fn remove(
        &self,
        name: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
    ) -> Result<(), RegistryError> {
        let mut state = self.state.lock().unwrap();

        let versions = state
            .packages
            .get_mut(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))?;

        if let Some(dep_names) = versions.get_mut(version) {
            if let Some(dep_versions) = dep_names.get_mut(dep_name) {
                dep_versions.remove(dep_version);
                if dep_versions.is_empty() {
                    dep_names.remove(dep_name);
                }
            }
            if dep_names.is_empty() {
                versions.remove(version);
            }
        }
        if versions.is_empty() {
            state.packages.remove(name);
        }

        state.last_updated = Utc::now().timestamp();

        Ok(())
    }

    /// Look up the artifact built without a dependency pin.
    pub fn find(&self, name: &str, version: &str) -> Result<AvailablePackage, RegistryError> {
        self.find_dep(name, version, "", "")
    }

    /// Look up the artifact at the full 4-tuple key.
    pub fn find_dep(
        &self,
        name: &str,
        version: &str,
        dep_name: &str,
        dep_version: &str,
    ) -> Result<AvailablePackage, RegistryError> {
        let state = self.state.lock().unwrap();

        state
            .packages
            .get(name)
            .and_then(|versions| versions.get(version))
            .and_then(|dep_names| dep_names.get(dep_name))
            .and_then(|dep_versions| dep_versions.get(dep_version))
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(name.to_owned()))
    }

    /// Invoke `f` for every leaf entry, stopping at the first error.
    ///
    /// The walk runs over a snapshot taken under the lock, so callbacks may
    /// re-enter the registry without deadlocking.
    pub fn walk<E, F>(&self, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, &str, &str, &str, &AvailablePackage) -> Result<(), E>,
    {
        let packages = self.state.lock().unwrap().packages.clone();

        for (name, versions) in &packages {
            for (version, dep_names) in versions {
                for (dep_name, dep_versions) in dep_names {
                    for (dep_version, ap) in dep_versions {
                        f(name, version, dep_name, dep_version, ap)?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Snapshot of the full nested map, for display purposes.
    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, BTreeMap<String, BTreeMap<String, AvailablePackage>>>> {
        self.state.lock().unwrap().packages.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(name: &str, version: &str, dep_name: &str, dep_version: &str) -> AvailablePackage {
        AvailablePackage {
            name: name.to_owned(),
            version: version.to_owned(),
            dep_name: dep_name.to_owned(),
            dep_version: dep_version.to_owned(),
            display_version: version.to_owned(),
            generated_package_file_name: format!("{}-{}.deb", name, version),
            generated_package_name: name.to_owned(),
            generated_package_version: version.to_owned(),
            install_base: "/usr/local/torigoya".to_owned(),
            install_prefix: format!("/usr/local/torigoya/{}.{}", name, version),
        }
    }

    fn empty_registry() -> AvailablePackages {
        let dir = tempfile::tempdir().unwrap();
        AvailablePackages::load(&dir.path().join("available_packages.json")).unwrap()
    }

    #[test]
    fn update_then_find() {
        let registry = empty_registry();
        registry.update(ap("gcc", "7.3.0", "", ""));

        let found = registry.find("gcc", "7.3.0").unwrap();
        assert_eq!(found.generated_package_file_name, "gcc-7.3.0.deb");
        assert!(registry.last_updated() > 0);
    }

    #[test]
    fn duplicate_key_overwrites() {
        let registry = empty_registry();
        registry.update(ap("gcc", "7.3.0", "", ""));

        let mut second = ap("gcc", "7.3.0", "", "");
        second.display_version = "7.3.0-r2".to_owned();
        registry.update(second);

        assert_eq!(registry.find("gcc", "7.3.0").unwrap().display_version, "7.3.0-r2");

        let mut count = 0;
        registry
            .walk(|_, _, _, _, _| -> Result<(), ()> {
                count += 1;
                Ok(())
            })
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn dep_keys_are_distinct() {
        let registry = empty_registry();
        registry.update(ap("gcc", "7.3.0", "", ""));
        registry.update(ap("gcc", "7.3.0", "boost", "1.66"));

        assert!(registry.find("gcc", "7.3.0").is_ok());
        assert!(registry.find_dep("gcc", "7.3.0", "boost", "1.66").is_ok());

        let mut keys = Vec::new();
        registry
            .walk(|name, version, dep_name, dep_version, _| -> Result<(), ()> {
                keys.push(format!("{}/{}/{}/{}", name, version, dep_name, dep_version));
                Ok(())
            })
            .unwrap();
        assert_eq!(keys, vec!["gcc/7.3.0//".to_owned(), "gcc/7.3.0/boost/1.66".to_owned()]);
    }

    #[test]
    fn remove_prunes_empty_levels() {
        let registry = empty_registry();
        registry.update(ap("gcc", "7.3.0", "", ""));
        registry.update(ap("gcc", "8.1.0", "", ""));

        registry.remove("gcc", "7.3.0", "", "").unwrap();

        assert!(registry.find("gcc", "7.3.0").is_err());
        assert!(registry.find("gcc", "8.1.0").is_ok());
        assert!(registry.snapshot().contains_key("gcc"));

        registry.remove("gcc", "8.1.0", "", "").unwrap();
        assert!(!registry.snapshot().contains_key("gcc"));
    }

    #[test]
    fn remove_unknown_name_fails() {
        let registry = empty_registry();
        assert!(matches!(
            registry.remove("gcc", "7.3.0", "", ""),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn walk_stops_on_error() {
        let registry = empty_registry();
        registry.update(ap("gcc", "7.3.0", "", ""));
        registry.update(ap("ruby", "2.5.0", "", ""));

        let mut seen = 0;
        let result = registry.walk(|_, _, _, _, _| {
            seen += 1;
            Err("stop")
        });
        assert_eq!(result, Err("stop"));
        assert_eq!(seen, 1);
    }

    #[test]
    fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("available_packages.json");

        let registry = AvailablePackages::load(&path).unwrap();
        registry.update(ap("gcc", "7.3.0", "boost", "1.66"));
        registry.save().unwrap();

        let reloaded = AvailablePackages::load(&path).unwrap();
        assert!(reloaded.find_dep("gcc", "7.3.0", "boost", "1.66").is_ok());
    }
}
