//! Runtime configuration.
//!
//! Values come from an optional JSON file, overridden by environment
//! variables. Command line flags override both in `masque-ctl`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::paths::translate_path_for_environment;

pub const ENV_ROOT: &str = "MASQUE_ROOT";
pub const ENV_BUNDLE_ID: &str = "MASQUE_BUNDLE_ID";
pub const ENV_CONFIG: &str = "MASQUE_CONFIG";

pub const DEFAULT_ROOT: &str = "/var/mobile/Library/Masque";
pub const DEFAULT_CONFIG_PATH: &str = "/Library/Masque/config.json";

/// Contents of `config.json`. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub root: Option<PathBuf>,
    pub bundle_id: Option<String>,
    /// Bundles treated like Apple's own apps and never redirected.
    pub system_apps: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Directory holding `profiles/`, `profiles.json` and `state.json`.
    pub root: PathBuf,
    /// Bundle id of the host application.
    pub bundle_id: String,
    pub system_apps: Vec<String>,
}

impl Config {
    /// Load from the process environment and the config file it points at.
    pub fn load() -> Result<Self> {
        Self::from_sources(|key| std::env::var(key).ok())
    }

    /// Like [`load`](Self::load), reading variables through `env`.
    pub fn from_sources(env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let config_path = env(ENV_CONFIG)
            .map(PathBuf::from)
            .unwrap_or_else(|| translate_path_for_environment(DEFAULT_CONFIG_PATH));
        let file = Self::read_file(&config_path)?;

        let root = env(ENV_ROOT)
            .map(PathBuf::from)
            .or(file.root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let bundle_id = env(ENV_BUNDLE_ID)
            .or(file.bundle_id)
            .unwrap_or_else(executable_name);

        let config = Config {
            root,
            bundle_id,
            system_apps: file.system_apps,
        };
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// A missing file is an empty configuration; a malformed one is an error.
    pub fn read_file(path: &Path) -> Result<FileConfig> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(FileConfig::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read config file: {:?}", path));
            }
        };
        serde_json::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

fn executable_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn env_of(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_without_file_or_env() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("none.json");
        let config =
            Config::from_sources(env_of(&[(ENV_CONFIG, missing.to_str().unwrap())])).unwrap();
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT));
        assert!(!config.bundle_id.is_empty());
        assert!(config.system_apps.is_empty());
    }

    #[test]
    fn environment_overrides_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"root": "/from/file", "bundle_id": "com.file.app", "system_apps": ["com.example.launcher"]}"#,
        )
        .unwrap();

        let from_file = Config::from_sources(env_of(&[(ENV_CONFIG, path.to_str().unwrap())])).unwrap();
        assert_eq!(from_file.root, PathBuf::from("/from/file"));
        assert_eq!(from_file.bundle_id, "com.file.app");
        assert_eq!(from_file.system_apps, vec!["com.example.launcher".to_string()]);

        let overridden = Config::from_sources(env_of(&[
            (ENV_CONFIG, path.to_str().unwrap()),
            (ENV_ROOT, "/from/env"),
            (ENV_BUNDLE_ID, "com.env.app"),
        ]))
        .unwrap();
        assert_eq!(overridden.root, PathBuf::from("/from/env"));
        assert_eq!(overridden.bundle_id, "com.env.app");
        assert_eq!(overridden.system_apps, from_file.system_apps);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        std::fs::write(&path, "{ root: ").unwrap();
        let err = Config::from_sources(env_of(&[(ENV_CONFIG, path.to_str().unwrap())])).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
