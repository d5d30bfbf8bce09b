//! Process-wide key/value state that lives outside the plugins root.

use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
};

use crate::{
    error::{Error, Result},
    manifest::{commit_temp_file, write_temp_file},
};

pub const STATE_FILE_NAME: &str = "state.json";

/// Small JSON map persisted with the same temp-then-rename discipline as
/// the plugin manifest.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_all().await?.remove(key))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut values = self.read_all().await?;
        values.insert(key.to_string(), value.to_string());
        let data = serde_json::to_vec_pretty(&values)?;
        let tmp = write_temp_file(&self.path, &data).await?;
        commit_temp_file(&tmp, &self.path).await
    }

    async fn read_all(&self) -> Result<BTreeMap<String, String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str(&raw).map_err(|e| Error::manifest_corrupt(&self.path, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(Error::manifest_corrupt(&self.path, e)),
        }
    }
}
