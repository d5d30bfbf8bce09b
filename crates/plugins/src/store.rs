//! The session's authoritative set of plugins.

use std::sync::{Arc, RwLock, Weak};

use {
    async_trait::async_trait,
    futures::future::join_all,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    manifest::ManifestStore,
    plugin::{ListenerId, Plugin, PluginEnv, PluginEvent, PluginListener},
    types::PluginRecord,
};

/// One failed item of a batch operation.
#[derive(Debug)]
pub struct BatchFailure {
    /// Specifier or plugin name the failure belongs to.
    pub item: String,
    pub error: Error,
}

#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failures: Vec<BatchFailure>,
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
        }
    }
}

struct Entry {
    plugin: Plugin,
    listener: ListenerId,
}

struct StoreInner {
    env: PluginEnv,
    manifest: ManifestStore,
    entries: RwLock<Vec<Entry>>,
    persist_lock: tokio::sync::Mutex<()>,
}

/// Plugin registry backed by the on-disk manifest.
///
/// Registered plugins persist the manifest whenever their durable fields
/// change and remove themselves once uninstalled.
#[derive(Clone)]
pub struct PluginStore {
    inner: Arc<StoreInner>,
}

/// Subscribed to every registered plugin.
struct PersistOnChange {
    store: Weak<StoreInner>,
}

#[async_trait]
impl PluginListener for PersistOnChange {
    async fn on_event(&self, event: PluginEvent, record: &PluginRecord) {
        let Some(inner) = self.store.upgrade() else {
            return;
        };
        let store = PluginStore { inner };
        let result = match event {
            PluginEvent::Changed => store.persist_plugins().await,
            PluginEvent::Uninstalled => store.remove_plugin(&record.name, true).await,
        };
        if let Err(e) = result {
            warn!(name = %record.name, ?event, error = %e, "failed to persist plugin change");
        }
    }
}

impl PluginStore {
    /// An empty store rooted at `env`, without reading the manifest.
    pub fn new(env: PluginEnv) -> Self {
        let manifest = ManifestStore::new(env.manifest_path());
        Self {
            inner: Arc::new(StoreInner {
                env,
                manifest,
                entries: RwLock::new(Vec::new()),
                persist_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Rebuild every plugin recorded in the manifest. No network access.
    pub async fn load(env: PluginEnv) -> Result<Self> {
        let store = Self::new(env);
        let records = store.inner.manifest.load().await?;
        let count = records.len();
        for mut record in records {
            if record.is_installed() && !record.installed_path.is_dir() {
                warn!(
                    name = %record.name,
                    path = %record.installed_path.display(),
                    was_active = record.active,
                    "plugin directory is missing, deactivating"
                );
                record.active = false;
            }
            let plugin = Plugin::from_record(store.inner.env.clone(), record);
            store.add_plugin(plugin, false).await?;
        }
        info!(count, manifest = %store.inner.manifest.path().display(), "loaded plugins");
        Ok(store)
    }

    pub fn env(&self) -> &PluginEnv {
        &self.inner.env
    }

    pub fn manifest(&self) -> &ManifestStore {
        &self.inner.manifest
    }

    /// Insert or replace by name, optionally rewriting the manifest.
    pub async fn add_plugin(&self, plugin: Plugin, persist: bool) -> Result<()> {
        let name = plugin.name();
        if name.is_empty() {
            return Err(Error::install(
                plugin.record().source,
                "cannot register a plugin that has not been installed",
            ));
        }

        let listener = plugin.subscribe(Arc::new(PersistOnChange {
            store: Arc::downgrade(&self.inner),
        }));
        let replaced = {
            let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
            let entry = Entry { plugin, listener };
            match entries.iter_mut().find(|e| e.plugin.name() == name) {
                Some(existing) => Some(std::mem::replace(existing, entry)),
                None => {
                    entries.push(entry);
                    None
                },
            }
        };
        if let Some(old) = replaced {
            old.plugin.unsubscribe(old.listener);
            debug!(%name, "replaced registered plugin");
        }

        if persist {
            self.persist_plugins().await?;
        }
        Ok(())
    }

    /// Remove by name. Unknown names are ignored.
    pub async fn remove_plugin(&self, name: &str, persist: bool) -> Result<()> {
        let removed = {
            let mut entries = self.inner.entries.write().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .position(|e| e.plugin.name() == name)
                .map(|idx| entries.remove(idx))
        };
        let Some(entry) = removed else {
            return Ok(());
        };
        entry.plugin.unsubscribe(entry.listener);
        debug!(%name, "removed plugin from registry");

        if persist {
            self.persist_plugins().await?;
        }
        Ok(())
    }

    pub fn get_plugin(&self, name: &str) -> Result<Plugin> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.plugin.name() == name)
            .map(|e| e.plugin.clone())
            .ok_or_else(|| Error::not_found(name))
    }

    /// Every registered plugin, in registration order.
    pub fn all_plugins(&self) -> Vec<Plugin> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|e| e.plugin.clone())
            .collect()
    }

    pub fn active_plugins(&self) -> Vec<Plugin> {
        self.all_plugins()
            .into_iter()
            .filter(Plugin::is_active)
            .collect()
    }

    /// Rewrite the manifest from the current registry contents.
    pub async fn persist_plugins(&self) -> Result<()> {
        // Snapshot under the lock so the last writer always carries the
        // latest state.
        let _guard = self.inner.persist_lock.lock().await;
        let records: Vec<PluginRecord> = self
            .all_plugins()
            .iter()
            .map(Plugin::record)
            .filter(|r| !r.name.is_empty())
            .collect();
        self.inner.manifest.save(&records).await?;
        debug!(count = records.len(), "persisted plugin manifest");
        Ok(())
    }

    /// Install each specifier independently, register the successes, then
    /// persist once after every install has settled.
    pub async fn install_plugins(
        &self,
        specifiers: &[String],
        cancel: &CancellationToken,
    ) -> BatchOutcome<Plugin> {
        let installs = specifiers.iter().map(|spec| async move {
            let plugin = Plugin::new(self.inner.env.clone(), spec.as_str());
            match plugin.install(cancel).await {
                Ok(()) => Ok(plugin),
                Err(error) => Err(BatchFailure {
                    item: spec.clone(),
                    error,
                }),
            }
        });
        let results = join_all(installs).await;

        let mut outcome = BatchOutcome::default();
        for result in results {
            match result {
                Ok(plugin) => match self.add_plugin(plugin.clone(), false).await {
                    Ok(()) => outcome.succeeded.push(plugin),
                    Err(error) => outcome.failures.push(BatchFailure {
                        item: plugin.record().source,
                        error,
                    }),
                },
                Err(failure) => {
                    warn!(specifier = %failure.item, error = %failure.error, "plugin install failed");
                    outcome.failures.push(failure);
                },
            }
        }

        if !outcome.succeeded.is_empty()
            && let Err(error) = self.persist_plugins().await
        {
            warn!(error = %error, "failed to persist plugin manifest after install");
            outcome.failures.push(BatchFailure {
                item: self.inner.manifest.path().display().to_string(),
                error,
            });
        }
        outcome
    }
}

impl std::fmt::Debug for PluginStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginStore")
            .field("root", &self.inner.env.root())
            .field("plugins", &self.all_plugins().len())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::test_support::Registry, std::path::Path};

    fn record(root: &Path, name: &str, version: &str, active: bool) -> PluginRecord {
        PluginRecord {
            name: name.into(),
            version: version.into(),
            source: name.into(),
            active,
            installed_path: root.join(name),
            main: "index.js".into(),
            description: None,
            product_name: None,
        }
    }

    #[tokio::test]
    async fn persisted_plugins_round_trip() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());

        let store = PluginStore::new(env.clone());
        let originals = vec![
            record(tmp.path(), "a", "1.0.0", true),
            record(tmp.path(), "@s/b", "0.2.0-rc.1", false),
            record(tmp.path(), "c", "3.1.4", true),
        ];
        for r in &originals {
            std::fs::create_dir_all(&r.installed_path).unwrap();
            store
                .add_plugin(Plugin::from_record(env.clone(), r.clone()), false)
                .await
                .unwrap();
        }
        store.persist_plugins().await.unwrap();

        let reloaded = PluginStore::load(env).await.unwrap();
        let records: Vec<PluginRecord> = reloaded.all_plugins().iter().map(Plugin::record).collect();
        assert_eq!(records, originals);
        assert_eq!(reloaded.active_plugins().len(), 2);
    }

    #[tokio::test]
    async fn add_replaces_by_name_and_remove_ignores_unknown() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());
        let store = PluginStore::new(env.clone());

        store
            .add_plugin(
                Plugin::from_record(env.clone(), record(tmp.path(), "a", "1.0.0", false)),
                false,
            )
            .await
            .unwrap();
        store
            .add_plugin(
                Plugin::from_record(env.clone(), record(tmp.path(), "a", "2.0.0", false)),
                true,
            )
            .await
            .unwrap();
        assert_eq!(store.all_plugins().len(), 1);
        assert_eq!(store.get_plugin("a").unwrap().record().version, "2.0.0");

        store.remove_plugin("missing", true).await.unwrap();
        assert!(matches!(
            store.get_plugin("missing").unwrap_err(),
            Error::NotFound { .. }
        ));
        assert_eq!(store.manifest().load().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unnamed_plugins_are_not_registered() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());
        let store = PluginStore::new(env.clone());
        assert!(store.add_plugin(Plugin::new(env, "a"), false).await.is_err());
        assert!(store.all_plugins().is_empty());
    }

    #[tokio::test]
    async fn batch_install_isolates_failures() {
        let mut registry = Registry::start().await;
        registry.publish("valid-a", &["1.0.0"], "1.0.0").await;
        registry.missing("does-not-exist").await;
        registry.publish("valid-b", &["2.0.0"], "2.0.0").await;
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(registry.env(tmp.path()));

        let specs: Vec<String> = ["valid-a", "does-not-exist", "valid-b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let outcome = store
            .install_plugins(&specs, &CancellationToken::new())
            .await;

        let names: Vec<String> = outcome.succeeded.iter().map(Plugin::name).collect();
        assert_eq!(names, vec!["valid-a", "valid-b"]);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item, "does-not-exist");
        assert!(matches!(
            outcome.failures[0].error,
            Error::PackageNotFound { .. }
        ));

        assert!(store.get_plugin("valid-a").is_ok());
        assert!(store.get_plugin("valid-b").is_ok());
        let persisted = store.manifest().load().await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn entity_changes_persist_and_uninstall_unregisters() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();
        let store = PluginStore::new(registry.env(tmp.path()));
        store
            .install_plugins(&["widget".to_string()], &CancellationToken::new())
            .await;

        let plugin = store.get_plugin("widget").unwrap();
        assert!(store.manifest().load().await.unwrap()[0].active);
        plugin.set_active(false).await.unwrap();
        let persisted = store.manifest().load().await.unwrap();
        assert!(!persisted[0].active);

        plugin.uninstall().await.unwrap();
        assert!(store.get_plugin("widget").is_err());
        assert!(store.manifest().load().await.unwrap().is_empty());
        assert!(!tmp.path().join("widget").exists());

        // A second uninstall of the detached entity is harmless.
        plugin.uninstall().await.unwrap();
    }

    #[tokio::test]
    async fn active_plugin_with_missing_directory_loads_inactive() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());
        let present = record(env.root(), "present", "1.0.0", true);
        std::fs::create_dir_all(&present.installed_path).unwrap();
        ManifestStore::new(env.manifest_path())
            .save(&[present, record(env.root(), "gone", "1.0.0", true)])
            .await
            .unwrap();

        let store = PluginStore::load(env).await.unwrap();
        let active: Vec<String> = store.active_plugins().iter().map(Plugin::name).collect();
        assert_eq!(active, vec!["present"]);
        assert!(!store.get_plugin("gone").unwrap().is_active());
    }

    #[tokio::test]
    async fn active_record_without_path_is_corrupt() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());
        std::fs::write(
            env.manifest_path(),
            r#"{"version":1,"plugins":[{"name":"nopath","source":"nopath","active":true}]}"#,
        )
        .unwrap();
        assert!(matches!(
            PluginStore::load(env).await.unwrap_err(),
            Error::ManifestCorrupt { .. }
        ));
    }

    #[tokio::test]
    async fn corrupt_manifest_fails_load() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let env = registry.env(tmp.path());
        std::fs::write(env.manifest_path(), "[{").unwrap();
        assert!(matches!(
            PluginStore::load(env).await.unwrap_err(),
            Error::ManifestCorrupt { .. }
        ));
    }
}
