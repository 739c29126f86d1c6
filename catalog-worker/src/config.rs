use anyhow::{Context, Result};
use catalog_orchestrator::OrchestratorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,

    /// How long DELETED records are kept before the janitor purges them.
    #[serde(default = "default_deleted_retention")]
    pub deleted_retention_secs: u64,

    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
}

fn default_db_path() -> PathBuf {
    if let Ok(path) = std::env::var("CATALOG_DB_PATH") {
        return PathBuf::from(path);
    }

    if cfg!(windows) {
        let appdata = std::env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(appdata).join("catalog").join("catalog.db")
    } else {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".catalog").join("catalog.db")
    }
}

fn default_janitor_interval() -> u64 {
    std::env::var("CATALOG_JANITOR_INTERVAL")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(300) // 5 minutes
}

fn default_deleted_retention() -> u64 {
    std::env::var("CATALOG_DELETED_RETENTION")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(7 * 24 * 3600) // one week
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            janitor_interval_secs: default_janitor_interval(),
            deleted_retention_secs: default_deleted_retention(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Read the YAML file named by `CATALOG_CONFIG`, or fall back to the
    /// environment alone.
    pub fn load() -> Result<Self> {
        match std::env::var("CATALOG_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path)),
            Err(_) => Ok(Self::from_env()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_yaml_ng::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}
