use std::{
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    schema::HarborConfig,
};

const CONFIG_FILENAME: &str = "harbor.toml";

static CONFIG_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);
static DATA_DIR_OVERRIDE: Mutex<Option<PathBuf>> = Mutex::new(None);

/// Load config from the given TOML file.
pub fn load_config(path: &Path) -> Result<HarborConfig> {
    let raw = std::fs::read_to_string(path).map_err(|e| Error::read(path, e))?;
    toml::from_str(&raw).map_err(|e| Error::parse(path, e))
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./harbor.toml` (project-local)
/// 2. `<config_dir>/harbor.toml` (user-global)
///
/// Returns `HarborConfig::default()` if no config file is found or the file
/// cannot be parsed.
pub fn discover_and_load() -> HarborConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    HarborConfig::default()
}

fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILENAME);
    if local.exists() {
        return Some(local);
    }
    let global = config_dir().join(CONFIG_FILENAME);
    global.exists().then_some(global)
}

/// Apply `HARBOR_*` environment overrides on top of a loaded config.
pub fn apply_env_overrides(mut config: HarborConfig) -> HarborConfig {
    apply_overrides_from(&mut config, |key| std::env::var(key).ok());
    config
}

fn apply_overrides_from(config: &mut HarborConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(root) = lookup("HARBOR_PLUGINS_DIR").filter(|v| !v.trim().is_empty()) {
        config.plugins.root = Some(PathBuf::from(root));
    }
    if let Some(dir) = lookup("HARBOR_PREINSTALL_DIR").filter(|v| !v.trim().is_empty()) {
        config.plugins.preinstall_dir = Some(PathBuf::from(dir));
    }
    if let Some(url) = lookup("HARBOR_REGISTRY_URL").filter(|v| !v.trim().is_empty()) {
        config.plugins.registry_url = url.trim_end_matches('/').to_string();
    }
    if let Some(port) = lookup("HARBOR_PORT") {
        match port.parse() {
            Ok(port) => config.server.port = port,
            Err(_) => warn!(value = %port, "ignoring invalid HARBOR_PORT"),
        }
    }
}

/// Override the user-global config directory for this process.
pub fn set_config_dir(path: PathBuf) {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.lock() {
        *guard = Some(path);
    }
}

pub fn clear_config_dir() {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.lock() {
        *guard = None;
    }
}

/// Override the data directory for this process.
pub fn set_data_dir(path: PathBuf) {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.lock() {
        *guard = Some(path);
    }
}

pub fn clear_data_dir() {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.lock() {
        *guard = None;
    }
}

/// Returns the user-global config directory (`~/.config/harbor/`).
pub fn config_dir() -> PathBuf {
    if let Some(dir) = CONFIG_DIR_OVERRIDE.lock().ok().and_then(|g| g.clone()) {
        return dir;
    }
    directories::ProjectDirs::from("", "", "harbor")
        .map(|d| d.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".harbor"))
}

/// Returns the data directory holding plugins and persisted state.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = DATA_DIR_OVERRIDE.lock().ok().and_then(|g| g.clone()) {
        return dir;
    }
    directories::ProjectDirs::from("", "", "harbor")
        .map(|d| d.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".harbor"))
}
