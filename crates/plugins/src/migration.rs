use std::{io, path::PathBuf};

use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    state::StateStore,
};

pub const MIGRATED_VERSION_KEY: &str = "plugins.migrated_version";

/// Clears installed plugins whenever the host application version changes.
///
/// Must run before the manifest is read, since the manifest lives inside the
/// directory being removed.
pub struct MigrationGuard {
    state: StateStore,
    plugins_root: PathBuf,
}

impl MigrationGuard {
    pub fn new(state: StateStore, plugins_root: PathBuf) -> Self {
        Self {
            state,
            plugins_root,
        }
    }

    /// Returns whether the plugins root was wiped.
    pub async fn run_if_needed(&self, current_version: &str) -> Result<bool> {
        let stored = self.state.get(MIGRATED_VERSION_KEY).await?;
        if stored.as_deref() == Some(current_version) {
            debug!(version = %current_version, "plugins already migrated");
            return Ok(false);
        }

        match tokio::fs::remove_dir_all(&self.plugins_root).await {
            Ok(()) => {},
            Err(e) if e.kind() == io::ErrorKind::NotFound => {},
            Err(e) => return Err(Error::write(&self.plugins_root, e)),
        }
        self.state
            .set(MIGRATED_VERSION_KEY, current_version)
            .await?;

        info!(
            previous = stored.as_deref().unwrap_or("none"),
            current = %current_version,
            root = %self.plugins_root.display(),
            "host version changed, cleared installed plugins"
        );
        Ok(true)
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::state::STATE_FILE_NAME};

    fn guard(tmp: &tempfile::TempDir) -> (MigrationGuard, StateStore, PathBuf) {
        let state = StateStore::new(tmp.path().join(STATE_FILE_NAME));
        let root = tmp.path().join("plugins");
        (MigrationGuard::new(state.clone(), root.clone()), state, root)
    }

    #[tokio::test]
    async fn version_change_wipes_root_once() {
        let tmp = tempfile::tempdir().unwrap();
        let (guard, state, root) = guard(&tmp);
        state.set(MIGRATED_VERSION_KEY, "1.0.0").await.unwrap();
        std::fs::create_dir_all(root.join("a")).unwrap();
        std::fs::write(root.join("a/index.js"), "").unwrap();

        assert!(guard.run_if_needed("1.1.0").await.unwrap());
        assert!(!root.exists());
        assert_eq!(
            state.get(MIGRATED_VERSION_KEY).await.unwrap().as_deref(),
            Some("1.1.0")
        );

        std::fs::create_dir_all(root.join("b")).unwrap();
        assert!(!guard.run_if_needed("1.1.0").await.unwrap());
        assert!(root.join("b").exists());
    }

    #[tokio::test]
    async fn first_run_records_version() {
        let tmp = tempfile::tempdir().unwrap();
        let (guard, state, root) = guard(&tmp);

        assert!(guard.run_if_needed("0.3.2").await.unwrap());
        assert!(!root.exists());
        assert_eq!(
            state.get(MIGRATED_VERSION_KEY).await.unwrap().as_deref(),
            Some("0.3.2")
        );
    }
}
