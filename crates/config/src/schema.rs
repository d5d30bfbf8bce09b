/// Config schema types (plugins, server).
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_REGISTRY_URL: &str = "https://registry.npmjs.org";
pub const DEFAULT_PORT: u16 = 17391;

/// Root config document (`harbor.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HarborConfig {
    pub plugins: PluginsConfig,
    pub server: ServerConfig,
}

/// `[plugins]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginsConfig {
    /// Plugins root directory. Defaults to `<data_dir>/plugins`.
    pub root: Option<PathBuf>,
    /// Base URL of the package registry.
    pub registry_url: String,
    /// Prompt before `harbor plugins install` unless `--yes` is given.
    pub confirm_installs: bool,
    /// Per-request timeout for registry and archive downloads.
    pub request_timeout_secs: u64,
    /// Directory of bundled `.tgz` plugins installed into a fresh root.
    pub preinstall_dir: Option<PathBuf>,
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            root: None,
            registry_url: DEFAULT_REGISTRY_URL.into(),
            confirm_installs: true,
            request_timeout_secs: 60,
            preinstall_dir: None,
        }
    }
}

impl PluginsConfig {
    /// The configured root, or `<data_dir>/plugins`.
    pub fn resolved_root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| crate::loader::data_dir().join("plugins"))
    }
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}
