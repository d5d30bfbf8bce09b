use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize, Serializer};

pub const DEFAULT_ENTRY_POINT: &str = "index.js";

// ── Plugin record ────────────────────────────────────────────────────────────

/// Durable fields of a plugin: one manifest entry, and the shape returned to
/// the presentation process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    /// Package name. Empty until the plugin has been installed.
    #[serde(default)]
    pub name: String,
    /// Installed semantic version, empty if not yet resolved.
    #[serde(default)]
    pub version: String,
    /// Specifier used to (re)install: registry name or archive URL.
    pub source: String,
    #[serde(default)]
    pub active: bool,
    /// Absolute path to the unpacked plugin directory.
    #[serde(default)]
    pub installed_path: PathBuf,
    /// Entry point, relative to `installed_path`.
    #[serde(default = "default_entry_point")]
    pub main: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_name: Option<String>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.into()
}

impl PluginRecord {
    /// A record for a plugin that has not been installed yet.
    pub fn pending(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            main: default_entry_point(),
            ..Default::default()
        }
    }

    pub fn is_installed(&self) -> bool {
        !self.name.is_empty() && !self.installed_path.as_os_str().is_empty()
    }

    /// Absolute path of the module the presentation process loads.
    pub fn entry_point(&self) -> Option<PathBuf> {
        self.is_installed()
            .then(|| self.installed_path.join(&self.main))
    }

    /// Field-level checks applied to records read back from disk.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("record has an empty name".into());
        }
        crate::resolver::validate_package_name(&self.name)
            .map_err(|reason| format!("record '{}': {reason}", self.name))?;
        if self.source.trim().is_empty() {
            return Err(format!("record '{}' has an empty source", self.name));
        }
        if !self.installed_path.as_os_str().is_empty() && !self.installed_path.is_absolute() {
            return Err(format!(
                "record '{}' has a relative installedPath: {}",
                self.name,
                self.installed_path.display()
            ));
        }
        if self.active && self.installed_path.as_os_str().is_empty() {
            return Err(format!(
                "record '{}' is active but has no installedPath",
                self.name
            ));
        }
        if Path::new(&self.main).is_absolute() || self.main.split('/').any(|c| c == "..") {
            return Err(format!(
                "record '{}' has an entry point outside its directory",
                self.name
            ));
        }
        Ok(())
    }
}

// ── Manifest document ────────────────────────────────────────────────────────

/// On-disk layout of `plugins.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsManifest {
    pub version: u32,
    #[serde(default)]
    pub plugins: Vec<PluginRecord>,
}

impl Default for PluginsManifest {
    fn default() -> Self {
        Self {
            version: 1,
            plugins: Vec::new(),
        }
    }
}

// ── Package metadata ─────────────────────────────────────────────────────────

/// Subset of `package.json` read from an unpacked archive.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub product_name: Option<String>,
}

impl PackageJson {
    pub fn entry_point(&self) -> &str {
        self.main
            .as_deref()
            .map(|m| m.trim_start_matches("./"))
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_ENTRY_POINT)
    }
}

/// Registry metadata for one published version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub name: String,
    pub version: String,
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Result of an update check for one plugin. Serializes as the version
/// metadata when an update exists, otherwise as `false`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateStatus {
    Available(VersionInfo),
    UpToDate,
}

impl Serialize for UpdateStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Available(info) => info.serialize(serializer),
            Self::UpToDate => serializer.serialize_bool(false),
        }
    }
}

impl From<Option<VersionInfo>> for UpdateStatus {
    fn from(value: Option<VersionInfo>) -> Self {
        value.map_or(Self::UpToDate, Self::Available)
    }
}

/// Whether `candidate` should replace `installed`.
///
/// Uses semver precedence, so `1.2.0-beta` is older than `1.2.0`. When either
/// side is not valid semver the versions are compared as plain strings.
pub fn is_newer(candidate: &str, installed: &str) -> bool {
    let candidate = candidate.trim().trim_start_matches('v');
    let installed = installed.trim().trim_start_matches('v');
    if installed.is_empty() {
        return !candidate.is_empty();
    }
    match (
        semver::Version::parse(candidate),
        semver::Version::parse(installed),
    ) {
        (Ok(c), Ok(i)) => c > i,
        _ => candidate != installed,
    }
}
