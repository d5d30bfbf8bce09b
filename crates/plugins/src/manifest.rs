use std::{
    collections::HashSet,
    io,
    path::{Path, PathBuf},
};

use {serde_json::Value, tokio::io::AsyncWriteExt, tracing::debug};

use crate::{
    error::{Error, Result},
    types::{PluginRecord, PluginsManifest},
};

pub const MANIFEST_FILE_NAME: &str = "plugins.json";
pub const MANIFEST_VERSION: u32 = 1;

/// Persistent plugin manifest with atomic writes.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    path: PathBuf,
}

impl ManifestStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record. A missing file is a first run and yields nothing.
    pub async fn load(&self) -> Result<Vec<PluginRecord>> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no plugin manifest yet");
                return Ok(Vec::new());
            },
            Err(e) => return Err(Error::manifest_corrupt(&self.path, e)),
        };
        parse_manifest(&raw).map_err(|reason| Error::manifest_corrupt(&self.path, reason))
    }

    /// Rewrite the whole manifest via temp file + rename.
    pub async fn save(&self, records: &[PluginRecord]) -> Result<()> {
        let tmp = self.write_temp(records).await?;
        commit_temp_file(&tmp, &self.path).await
    }

    pub(crate) async fn write_temp(&self, records: &[PluginRecord]) -> Result<PathBuf> {
        let manifest = PluginsManifest {
            version: MANIFEST_VERSION,
            plugins: records.to_vec(),
        };
        let data = serde_json::to_vec_pretty(&manifest)?;
        write_temp_file(&self.path, &data).await
    }
}

fn parse_manifest(raw: &str) -> std::result::Result<Vec<PluginRecord>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|e| e.to_string())?;
    let records: Vec<PluginRecord> = match value {
        Value::Array(_) => serde_json::from_value(value).map_err(|e| e.to_string())?,
        Value::Object(ref map) if map.contains_key("plugins") => {
            let manifest: PluginsManifest =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            if manifest.version > MANIFEST_VERSION {
                return Err(format!(
                    "manifest version {} is newer than supported version {MANIFEST_VERSION}",
                    manifest.version
                ));
            }
            manifest.plugins
        },
        // Object keyed by plugin name.
        Value::Object(map) => {
            let mut records = Vec::with_capacity(map.len());
            for (key, entry) in map {
                let mut record: PluginRecord =
                    serde_json::from_value(entry).map_err(|e| format!("entry '{key}': {e}"))?;
                if record.name.is_empty() {
                    record.name = key;
                } else if record.name != key {
                    return Err(format!(
                        "entry '{key}' records a different name '{}'",
                        record.name
                    ));
                }
                records.push(record);
            }
            records
        },
        other => return Err(format!("expected an array or object, found {other}")),
    };

    let mut seen = HashSet::new();
    for record in &records {
        record.validate()?;
        if !seen.insert(record.name.as_str()) {
            return Err(format!("plugin '{}' is listed more than once", record.name));
        }
    }
    Ok(records)
}

/// Write `data` next to `path` and fsync it. The destination is untouched
/// until [`commit_temp_file`] runs.
pub(crate) async fn write_temp_file(path: &Path, data: &[u8]) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::write(parent, e))?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = tokio::fs::File::create(&tmp)
        .await
        .map_err(|e| Error::write(&tmp, e))?;
    file.write_all(data)
        .await
        .map_err(|e| Error::write(&tmp, e))?;
    file.sync_all().await.map_err(|e| Error::write(&tmp, e))?;
    Ok(tmp)
}

pub(crate) async fn commit_temp_file(tmp: &Path, path: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(tmp, path).await {
        let _ = tokio::fs::remove_file(tmp).await;
        return Err(Error::write(path, e));
    }
    Ok(())
}
