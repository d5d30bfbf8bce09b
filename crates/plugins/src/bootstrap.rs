use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::{Error, Result},
    migration::MigrationGuard,
    plugin::PluginEnv,
    resolver::{ARCHIVE_EXTENSION, PackageResolver},
    state::StateStore,
    store::PluginStore,
};

pub struct BootstrapOptions {
    pub plugins_root: PathBuf,
    /// Key/value state file; must live outside `plugins_root`.
    pub state_path: PathBuf,
    pub app_version: String,
    pub resolver: Arc<dyn PackageResolver>,
    /// Directory of bundled `.tgz` archives installed into a fresh root.
    pub preinstall_dir: Option<PathBuf>,
}

pub struct Bootstrapped {
    pub store: PluginStore,
    /// Whether the migration guard cleared previously installed plugins.
    pub wiped: bool,
    /// Bundled plugins installed during this bootstrap.
    pub preinstalled: usize,
}

/// Migration guard, staging cleanup, manifest load, then bundled installs,
/// in that order.
///
/// Bundled archives are installed only into a fresh root: one the guard just
/// wiped or one without a manifest. A root whose manifest lists no plugins is
/// left alone, so uninstalled bundled plugins stay uninstalled.
///
/// Errors are fatal to this bootstrap only; the host is expected to keep
/// running with an empty plugin set and surface the error.
pub async fn bootstrap(options: BootstrapOptions) -> Result<Bootstrapped> {
    let BootstrapOptions {
        plugins_root,
        state_path,
        app_version,
        resolver,
        preinstall_dir,
    } = options;

    let guard = MigrationGuard::new(StateStore::new(state_path), plugins_root.clone());
    let wiped = guard.run_if_needed(&app_version).await?;

    let env = PluginEnv::new(plugins_root, resolver);
    tokio::fs::create_dir_all(env.root())
        .await
        .map_err(|e| Error::write(env.root(), e))?;

    // Leftovers from an interrupted install or update.
    let staging = env.staging_root();
    match tokio::fs::remove_dir_all(&staging).await {
        Ok(()) => info!(path = %staging.display(), "removed stale staging directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(e) => warn!(path = %staging.display(), error = %e, "failed to clear staging directory"),
    }

    let fresh = wiped
        || !tokio::fs::try_exists(env.manifest_path())
            .await
            .unwrap_or(true);
    let store = PluginStore::load(env).await?;

    let preinstalled = match preinstall_dir {
        Some(dir) if fresh => preinstall(&store, &dir).await,
        _ => 0,
    };
    Ok(Bootstrapped {
        store,
        wiped,
        preinstalled,
    })
}

/// Install every bundled archive in `dir`; failures are logged and skipped.
async fn preinstall(store: &PluginStore, dir: &Path) -> usize {
    let specifiers = match bundled_archives(dir).await {
        Ok(specifiers) => specifiers,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %dir.display(), "no bundled plugins directory");
            return 0;
        },
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "failed to read bundled plugins");
            return 0;
        },
    };
    if specifiers.is_empty() {
        return 0;
    }

    let outcome = store
        .install_plugins(&specifiers, &CancellationToken::new())
        .await;
    for failure in &outcome.failures {
        warn!(archive = %failure.item, error = %failure.error, "bundled plugin install failed");
    }
    info!(
        path = %dir.display(),
        installed = outcome.succeeded.len(),
        failed = outcome.failures.len(),
        "installed bundled plugins"
    );
    outcome.succeeded.len()
}

/// Absolute paths of the `.tgz` files directly inside `dir`, sorted.
async fn bundled_archives(dir: &Path) -> io::Result<Vec<String>> {
    let dir = std::path::absolute(dir)?;
    let mut entries = tokio::fs::read_dir(&dir).await?;
    let mut archives = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == ARCHIVE_EXTENSION)
            && entry.file_type().await?.is_file()
        {
            archives.push(path.to_string_lossy().into_owned());
        }
    }
    archives.sort();
    Ok(archives)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            manifest::MANIFEST_FILE_NAME,
            migration::MIGRATED_VERSION_KEY,
            state::STATE_FILE_NAME,
            test_support::{Registry, package_tgz},
        },
    };

    fn options(registry: &Registry, tmp: &tempfile::TempDir, version: &str) -> BootstrapOptions {
        BootstrapOptions {
            plugins_root: tmp.path().join("plugins"),
            state_path: tmp.path().join(STATE_FILE_NAME),
            app_version: version.into(),
            resolver: registry.resolver(),
            preinstall_dir: None,
        }
    }

    fn bundled(tmp: &tempfile::TempDir) -> PathBuf {
        let dir = tmp.path().join("bundled");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("widget-1.0.0.tgz"), package_tgz("widget", "1.0.0")).unwrap();
        std::fs::write(dir.join("gadget-2.0.0.tgz"), package_tgz("gadget", "2.0.0")).unwrap();
        std::fs::write(dir.join("README.txt"), "not a plugin").unwrap();
        dir
    }

    #[tokio::test]
    async fn same_version_keeps_installed_plugins() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let first = bootstrap(options(&registry, &tmp, "1.0.0")).await.unwrap();
        assert!(first.wiped);
        first
            .store
            .install_plugins(&["widget".into()], &CancellationToken::new())
            .await;
        std::fs::create_dir_all(tmp.path().join("plugins/.staging/leftover")).unwrap();

        let second = bootstrap(options(&registry, &tmp, "1.0.0")).await.unwrap();
        assert!(!second.wiped);
        assert!(second.store.get_plugin("widget").is_ok());
        assert!(!tmp.path().join("plugins/.staging").exists());
    }

    #[tokio::test]
    async fn version_change_starts_empty() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let first = bootstrap(options(&registry, &tmp, "1.0.0")).await.unwrap();
        first
            .store
            .install_plugins(&["widget".into()], &CancellationToken::new())
            .await;

        let second = bootstrap(options(&registry, &tmp, "1.1.0")).await.unwrap();
        assert!(second.wiped);
        assert!(second.store.all_plugins().is_empty());
        assert!(!tmp.path().join("plugins/widget").exists());

        let state = StateStore::new(tmp.path().join(STATE_FILE_NAME));
        assert_eq!(
            state.get(MIGRATED_VERSION_KEY).await.unwrap().as_deref(),
            Some("1.1.0")
        );
    }

    #[tokio::test]
    async fn corrupt_manifest_fails_bootstrap() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        bootstrap(options(&registry, &tmp, "1.0.0")).await.unwrap();
        std::fs::write(tmp.path().join("plugins").join(MANIFEST_FILE_NAME), "{oops").unwrap();

        let err = bootstrap(options(&registry, &tmp, "1.0.0"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::ManifestCorrupt { .. }));
    }

    #[tokio::test]
    async fn bundled_plugins_fill_a_fresh_root() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let dir = bundled(&tmp);
        let with_bundled = |version: &str| BootstrapOptions {
            preinstall_dir: Some(dir.clone()),
            ..options(&registry, &tmp, version)
        };

        let first = bootstrap(with_bundled("1.0.0")).await.unwrap();
        assert!(first.wiped);
        assert_eq!(first.preinstalled, 2);
        let mut active: Vec<String> = first
            .store
            .active_plugins()
            .iter()
            .map(|p| p.name())
            .collect();
        active.sort();
        assert_eq!(active, ["gadget", "widget"]);
        assert!(tmp.path().join("plugins/widget/index.js").is_file());

        // An emptied manifest is the user's choice and is not refilled.
        first.store.remove_plugin("widget", false).await.unwrap();
        first.store.remove_plugin("gadget", true).await.unwrap();
        let second = bootstrap(with_bundled("1.0.0")).await.unwrap();
        assert_eq!(second.preinstalled, 0);
        assert!(second.store.all_plugins().is_empty());

        // A version change wipes the root and restores the bundled set.
        let third = bootstrap(with_bundled("1.1.0")).await.unwrap();
        assert!(third.wiped);
        assert_eq!(third.preinstalled, 2);
        assert!(third.store.get_plugin("widget").unwrap().is_active());
        let persisted = third.store.manifest().load().await.unwrap();
        assert_eq!(persisted.len(), 2);
    }

    #[tokio::test]
    async fn missing_bundle_directory_is_not_an_error() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let booted = bootstrap(BootstrapOptions {
            preinstall_dir: Some(tmp.path().join("absent")),
            ..options(&registry, &tmp, "1.0.0")
        })
        .await
        .unwrap();
        assert_eq!(booted.preinstalled, 0);
        assert!(booted.store.all_plugins().is_empty());
    }
}
