//! Service configuration, read from `config.yml` in the working directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Errors raised while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The config file did not parse.
    #[error("failed to parse {path}: {source}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    /// A required section is absent.
    #[error("config section '{0}' is missing")]
    MissingSection(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSection {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CronSection {
    #[serde(default)]
    pub hour: u32,
    #[serde(default)]
    pub minute: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthSection {
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuilderSection {
    #[serde(default)]
    pub package_prefix: String,
    #[serde(default)]
    pub install_base_prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigSetsSection {
    #[serde(default)]
    pub remote: bool,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub repository: String,
    #[serde(default)]
    pub webhook_secret: String,
}

/// The operator-provided service configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub notification: NotificationSection,
    #[serde(default)]
    pub cron: CronSection,
    #[serde(default)]
    pub auth: AuthSection,
    pub builder: Option<BuilderSection>,
    #[serde(default)]
    pub config_sets: ConfigSetsSection,
}

impl UserConfig {
    /// Load the configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let buffer = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_yaml::from_str(&buffer).map_err(|source| ConfigError::Yaml {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The builder section is mandatory; fail loudly if it is absent.
    pub fn builder(&self) -> Result<&BuilderSection, ConfigError> {
        self.builder
            .as_ref()
            .ok_or(ConfigError::MissingSection("builder"))
    }

    /// Resolve the recipe-tree path relative to `cwd` unless absolute.
    pub fn config_sets_path(&self, cwd: &Path) -> PathBuf {
        let path = Path::new(&self.config_sets.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            cwd.join(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 8000
notification:
  url: http://example.com/notify
  secret: notify-secret
cron:
  hour: 3
  minute: 0
auth:
  user: admin
  password: hunter2
builder:
  package_prefix: torigoya
  install_base_prefix: /usr/local/torigoya
config_sets:
  remote: true
  path: proc_configs
  repository: https://example.com/configs.git
  webhook_secret: hook-secret
"#;

    #[test]
    fn parses_a_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(&path, SAMPLE).unwrap();

        let config = UserConfig::load(&path).unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.notification.url, "http://example.com/notify");
        assert_eq!(config.cron.hour, 3);
        assert_eq!(config.auth.user, "admin");
        assert_eq!(config.builder().unwrap().package_prefix, "torigoya");
        assert!(config.config_sets.remote);
        assert_eq!(config.config_sets.webhook_secret, "hook-secret");
    }

    #[test]
    fn config_sets_path_resolution() {
        let config: UserConfig = serde_yaml::from_str("config_sets:\n  path: proc_configs\n").unwrap();
        assert_eq!(
            config.config_sets_path(Path::new("/srv/factory")),
            Path::new("/srv/factory/proc_configs")
        );

        let config: UserConfig = serde_yaml::from_str("config_sets:\n  path: /etc/configs\n").unwrap();
        assert_eq!(config.config_sets_path(Path::new("/srv/factory")), Path::new("/etc/configs"));
    }

    #[test]
    fn missing_builder_section_is_an_error() {
        let config: UserConfig = serde_yaml::from_str("server:\n  port: 80\n").unwrap();
        assert!(matches!(
            config.builder(),
            Err(ConfigError::MissingSection("builder"))
        ));
    }
}
