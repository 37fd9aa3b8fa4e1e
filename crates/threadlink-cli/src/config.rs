use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use threadlink_core::PathNormalizer;
use threadlink_storage::DEFAULT_LOCK_TIMEOUT;

const INDEX_FILE_NAME: &str = "thread_index.json";
const CONFIG_FILE_NAME: &str = "config.json";
const DEFAULT_LOG_LEVEL: &str = "warn";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadlinkConfig {
    #[serde(default)]
    pub index_path: Option<String>,
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    #[serde(default)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub index_path: PathBuf,
    pub lock_timeout: Duration,
    pub log_level: String,
}

impl Settings {
    /// Flags (and their env vars), then `THREADLINK_HOME`, then the config file.
    pub fn resolve(index_flag: Option<PathBuf>, lock_timeout_flag: Option<u64>) -> Self {
        let home_override = std::env::var("THREADLINK_HOME")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from);
        let base_dir = home_override.clone().unwrap_or_else(default_base_dir);
        let config = load_config(&base_dir.join(CONFIG_FILE_NAME)).unwrap_or_default();
        Self::from_sources(
            index_flag,
            lock_timeout_flag,
            home_override,
            &base_dir,
            config,
            &PathNormalizer::from_env(),
        )
    }

    fn from_sources(
        index_flag: Option<PathBuf>,
        lock_timeout_flag: Option<u64>,
        home_override: Option<PathBuf>,
        base_dir: &Path,
        config: ThreadlinkConfig,
        normalizer: &PathNormalizer,
    ) -> Self {
        let index_path = if let Some(path) = index_flag {
            path
        } else if let Some(home) = home_override {
            home.join(INDEX_FILE_NAME)
        } else if let Some(path) = config.index_path.filter(|path| !path.trim().is_empty()) {
            PathBuf::from(normalizer.normalize(&path))
        } else {
            base_dir.join(INDEX_FILE_NAME)
        };

        let lock_timeout = lock_timeout_flag
            .or(config.lock_timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_LOCK_TIMEOUT);

        let log_level = config
            .log_level
            .filter(|level| !level.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string());

        Self {
            index_path,
            lock_timeout,
            log_level,
        }
    }
}

fn default_base_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".threadlink")
}

fn load_config(path: &Path) -> Option<ThreadlinkConfig> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str::<ThreadlinkConfig>(&content) {
        Ok(config) => Some(config),
        Err(err) => {
            eprintln!("Warning: failed to parse {}: {}", path.display(), err);
            None
        }
    }
}
