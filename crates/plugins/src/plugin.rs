//! A single plugin and its lifecycle.
//!
//! Lifecycle operations on one [`Plugin`] are mutually exclusive: while an
//! install, update, uninstall or activation toggle is running, any other of
//! them fails fast with [`Error::OperationInProgress`]. Distinct plugins never
//! share files, so operations on different plugins run concurrently.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    async_trait::async_trait,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    archive,
    error::{Error, Result},
    manifest::MANIFEST_FILE_NAME,
    resolver::{PackageResolver, PackageSpecifier, unscoped_name, validate_package_name},
    types::{PluginRecord, VersionInfo, is_newer},
};

/// Scratch space for downloads and unpacking, inside the plugins root so the
/// final move is a same-filesystem rename.
pub const STAGING_DIR: &str = ".staging";

const UNPACKED_DIR: &str = "package";
const PREVIOUS_DIR: &str = "previous";

// ── Environment ──────────────────────────────────────────────────────────────

/// Where plugins live and how they are fetched. Shared by every plugin and
/// the store.
#[derive(Clone)]
pub struct PluginEnv {
    root: PathBuf,
    resolver: Arc<dyn PackageResolver>,
}

impl PluginEnv {
    pub fn new(root: impl Into<PathBuf>, resolver: Arc<dyn PackageResolver>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        Self { root, resolver }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolver(&self) -> &Arc<dyn PackageResolver> {
        &self.resolver
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE_NAME)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Install directory for a package; scoped names nest under `@scope/`.
    pub fn plugin_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn new_staging_dir(&self) -> PathBuf {
        self.staging_root().join(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Debug for PluginEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEnv")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginEvent {
    /// Durable fields changed (installed, updated, toggled).
    Changed,
    /// Files are gone; the plugin should leave the registry.
    Uninstalled,
}

#[async_trait]
pub trait PluginListener: Send + Sync {
    async fn on_event(&self, event: PluginEvent, record: &PluginRecord);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

// ── State machine ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Uninstalled,
    Installing,
    Installed,
    Updating,
    Uninstalling,
}

impl PluginState {
    pub fn is_transient(self) -> bool {
        matches!(self, Self::Installing | Self::Updating | Self::Uninstalling)
    }
}

// ── Plugin ───────────────────────────────────────────────────────────────────

/// Cheaply cloneable handle; clones share state.
#[derive(Clone)]
pub struct Plugin {
    inner: Arc<PluginInner>,
}

struct PluginInner {
    env: PluginEnv,
    record: RwLock<PluginRecord>,
    state: Mutex<PluginState>,
    busy: tokio::sync::Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, Arc<dyn PluginListener>)>>,
    next_listener: AtomicU64,
}

/// Holds the per-plugin lock for one operation and puts the state machine
/// back into a stable state when dropped.
struct OpGuard<'a> {
    inner: &'a PluginInner,
    _busy: tokio::sync::MutexGuard<'a, ()>,
    settle_to: PluginState,
}

impl OpGuard<'_> {
    fn settle(mut self, state: PluginState) {
        self.settle_to = state;
    }
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = self.settle_to;
    }
}

impl Plugin {
    /// A not-yet-installed plugin for `source`.
    pub fn new(env: PluginEnv, source: impl Into<String>) -> Self {
        Self::build(env, PluginRecord::pending(source), PluginState::Uninstalled)
    }

    /// Rebuild a plugin from a persisted record without touching the network.
    pub fn from_record(env: PluginEnv, record: PluginRecord) -> Self {
        let state = if record.is_installed() {
            PluginState::Installed
        } else {
            PluginState::Uninstalled
        };
        Self::build(env, record, state)
    }

    fn build(env: PluginEnv, record: PluginRecord, state: PluginState) -> Self {
        Self {
            inner: Arc::new(PluginInner {
                env,
                record: RwLock::new(record),
                state: Mutex::new(state),
                busy: tokio::sync::Mutex::new(()),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Snapshot of the durable fields.
    pub fn record(&self) -> PluginRecord {
        self.inner
            .record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn name(&self) -> String {
        self.inner
            .record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .name
            .clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner
            .record
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .active
    }

    pub fn state(&self) -> PluginState {
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn env(&self) -> &PluginEnv {
        &self.inner.env
    }

    pub fn same_as(&self, other: &Plugin) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── Subscriptions ────────────────────────────────────────────────────

    pub fn subscribe(&self, listener: Arc<dyn PluginListener>) -> ListenerId {
        let id = ListenerId(self.inner.next_listener.fetch_add(1, Ordering::Relaxed));
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, listener));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(existing, _)| *existing != id);
    }

    async fn notify(&self, event: PluginEvent) {
        let listeners: Vec<Arc<dyn PluginListener>> = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        if listeners.is_empty() {
            return;
        }
        let record = self.record();
        for listener in listeners {
            listener.on_event(event, &record).await;
        }
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    fn label(&self) -> String {
        let record = self.inner.record.read().unwrap_or_else(|e| e.into_inner());
        if record.name.is_empty() {
            record.source.clone()
        } else {
            record.name.clone()
        }
    }

    fn begin(&self, transient: PluginState) -> Result<OpGuard<'_>> {
        let busy = self
            .inner
            .busy
            .try_lock()
            .map_err(|_| Error::in_progress(self.label()))?;
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        let settle_to = *state;
        *state = transient;
        drop(state);
        Ok(OpGuard {
            inner: &self.inner,
            _busy: busy,
            settle_to,
        })
    }

    fn replace_record(&self, record: PluginRecord) {
        *self.inner.record.write().unwrap_or_else(|e| e.into_inner()) = record;
    }

    /// Download, unpack and move into `<root>/<name>`. An existing install of
    /// the same name is swapped out atomically.
    pub async fn install(&self, cancel: &CancellationToken) -> Result<()> {
        let guard = self.begin(PluginState::Installing)?;
        let source = self.record().source;
        let spec = PackageSpecifier::parse(&source)?;

        let staging = self.inner.env.new_staging_dir();
        let result = self.install_staged(&spec, &staging, cancel).await;
        remove_staging(&staging).await;
        let mut record = result?;
        // A fresh install is loaded right away.
        record.active = true;

        info!(
            name = %record.name,
            version = %record.version,
            %source,
            "installed plugin"
        );
        self.replace_record(record);
        guard.settle(PluginState::Installed);
        self.notify(PluginEvent::Changed).await;
        Ok(())
    }

    async fn install_staged(
        &self,
        spec: &PackageSpecifier,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<PluginRecord> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| Error::write(staging, e))?;
        let archive = self
            .inner
            .env
            .resolver
            .resolve(spec, staging, cancel)
            .await?;
        let expected = match spec {
            PackageSpecifier::Registry { name, .. } => Some(name.as_str()),
            _ => None,
        };
        self.unpack_and_swap(&archive, staging, expected, &spec.to_string())
            .await
    }

    /// Unpack into staging, validate, then swap into the package's directory.
    /// Returns the record describing the new install.
    async fn unpack_and_swap(
        &self,
        archive_path: &Path,
        staging: &Path,
        expected_name: Option<&str>,
        label: &str,
    ) -> Result<PluginRecord> {
        let unpacked = staging.join(UNPACKED_DIR);
        archive::unpack_archive(archive_path, &unpacked).await?;

        let package = archive::read_package_json(&unpacked).await?;
        validate_package_name(&package.name).map_err(|reason| Error::install(label, reason))?;
        if let Some(expected) = expected_name
            && expected != package.name
        {
            return Err(Error::install(
                label,
                format!("archive contains package '{}'", package.name),
            ));
        }
        archive::check_entry_point(&unpacked, &package).await?;

        let target = self.inner.env.plugin_dir(&package.name);
        swap_into_place(&unpacked, &target, &staging.join(PREVIOUS_DIR)).await?;

        let mut record = self.record();
        record.main = package.entry_point().to_string();
        record.name = package.name;
        record.version = package.version;
        record.installed_path = target;
        record.description = package.description;
        record.product_name = package.product_name;
        Ok(record)
    }

    /// Delete the installed files. Calling it again, or on a plugin whose
    /// directory is already gone, succeeds.
    pub async fn uninstall(&self) -> Result<()> {
        let guard = self.begin(PluginState::Uninstalling)?;
        let record = self.record();
        let path = &record.installed_path;

        if !path.as_os_str().is_empty() {
            if path.starts_with(self.inner.env.root()) && path != self.inner.env.root() {
                remove_dir_if_present(path).await?;
                self.prune_scope_dir(path).await;
            } else {
                warn!(
                    name = %record.name,
                    path = %path.display(),
                    "refusing to delete plugin directory outside the plugins root"
                );
            }
        }

        {
            let mut current = self.inner.record.write().unwrap_or_else(|e| e.into_inner());
            current.installed_path = PathBuf::new();
            current.active = false;
        }
        info!(name = %record.name, "uninstalled plugin");
        guard.settle(PluginState::Uninstalled);
        self.notify(PluginEvent::Uninstalled).await;
        Ok(())
    }

    async fn prune_scope_dir(&self, path: &Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        let is_scope = parent
            .file_name()
            .is_some_and(|n| n.to_string_lossy().starts_with('@'));
        if is_scope && parent != self.inner.env.root() {
            // Fails harmlessly while other plugins of the scope remain.
            let _ = tokio::fs::remove_dir(parent).await;
        }
    }

    /// Replace the installed files with the registry's latest version when it
    /// is strictly newer. Returns whether anything changed.
    pub async fn update(&self, cancel: &CancellationToken) -> Result<bool> {
        let guard = self.begin(PluginState::Updating)?;
        let record = self.record();
        if !record.is_installed() {
            return Err(Error::install(self.label(), "plugin is not installed"));
        }

        let spec = PackageSpecifier::parse(&record.source)?.latest();
        let Some(latest) = self.inner.env.resolver.lookup(&spec).await? else {
            debug!(name = %record.name, "source has no registry metadata, skipping update");
            return Ok(false);
        };
        if !is_newer(&latest.version, &record.version) {
            debug!(name = %record.name, version = %record.version, "plugin is up to date");
            return Ok(false);
        }

        let staging = self.inner.env.new_staging_dir();
        let result = self.update_staged(&latest, &staging, cancel).await;
        remove_staging(&staging).await;
        let mut updated = result?;
        updated.installed_path = record.installed_path.clone();

        info!(
            name = %record.name,
            from = %record.version,
            to = %updated.version,
            "updated plugin"
        );
        self.replace_record(updated);
        guard.settle(PluginState::Installed);
        self.notify(PluginEvent::Changed).await;
        Ok(true)
    }

    async fn update_staged(
        &self,
        latest: &VersionInfo,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> Result<PluginRecord> {
        tokio::fs::create_dir_all(staging)
            .await
            .map_err(|e| Error::write(staging, e))?;
        let archive = staging.join(format!("{}.tgz", unscoped_name(&latest.name)));
        self.inner
            .env
            .resolver
            .download(&latest.tarball, &archive, cancel)
            .await?;
        let label = format!("{}@{}", latest.name, latest.version);
        self.unpack_and_swap(&archive, staging, Some(&latest.name), &label)
            .await
    }

    /// Registry lookup only; never downloads and never waits on a running
    /// operation.
    pub async fn is_update_available(&self) -> Result<Option<VersionInfo>> {
        let record = self.record();
        let spec = PackageSpecifier::parse(&record.source)?.latest();
        let latest = self.inner.env.resolver.lookup(&spec).await?;
        Ok(latest.filter(|info| is_newer(&info.version, &record.version)))
    }

    /// Toggle whether the presentation process should load this plugin.
    /// Activation requires the installed directory to exist.
    pub async fn set_active(&self, active: bool) -> Result<bool> {
        let busy = self
            .inner
            .busy
            .try_lock()
            .map_err(|_| Error::in_progress(self.label()))?;

        let record = self.record();
        if active {
            if record.installed_path.as_os_str().is_empty() {
                return Err(Error::activation(self.label(), "plugin is not installed"));
            }
            let present = tokio::fs::metadata(&record.installed_path)
                .await
                .is_ok_and(|m| m.is_dir());
            if !present {
                return Err(Error::activation(
                    self.label(),
                    format!(
                        "installed directory {} is missing",
                        record.installed_path.display()
                    ),
                ));
            }
        }
        if record.active == active {
            return Ok(active);
        }

        self.inner
            .record
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .active = active;
        drop(busy);

        debug!(name = %record.name, active, "plugin activation changed");
        self.notify(PluginEvent::Changed).await;
        Ok(active)
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("record", &self.record())
            .field("state", &self.state())
            .finish()
    }
}

async fn remove_dir_if_present(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::write(path, e)),
    }
}

async fn remove_staging(staging: &Path) {
    if let Err(e) = remove_dir_if_present(staging).await {
        warn!(path = %staging.display(), error = %e, "failed to clean staging directory");
    }
}

/// Move `new_dir` to `target`. A previous install at `target` is parked in
/// `backup` first and restored if the final rename fails.
async fn swap_into_place(new_dir: &Path, target: &Path, backup: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::write(parent, e))?;
    }

    let had_previous = tokio::fs::try_exists(target).await.unwrap_or(false);
    if had_previous {
        tokio::fs::rename(target, backup)
            .await
            .map_err(|e| Error::write(target, e))?;
    }

    if let Err(e) = tokio::fs::rename(new_dir, target).await {
        if had_previous && let Err(restore) = tokio::fs::rename(backup, target).await {
            warn!(
                target = %target.display(),
                error = %restore,
                "failed to restore previous plugin version"
            );
        }
        return Err(Error::write(target, e));
    }
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {super::*, crate::test_support::Registry, std::sync::atomic::AtomicUsize};

    #[derive(Default)]
    struct Recorder {
        changed: AtomicUsize,
        uninstalled: AtomicUsize,
    }

    #[async_trait]
    impl PluginListener for Recorder {
        async fn on_event(&self, event: PluginEvent, _record: &PluginRecord) {
            match event {
                PluginEvent::Changed => self.changed.fetch_add(1, Ordering::SeqCst),
                PluginEvent::Uninstalled => self.uninstalled.fetch_add(1, Ordering::SeqCst),
            };
        }
    }

    async fn installed(registry: &Registry, root: &Path, source: &str) -> Plugin {
        let plugin = Plugin::new(registry.env(root), source);
        plugin.install(&CancellationToken::new()).await.unwrap();
        plugin
    }

    #[tokio::test]
    async fn install_populates_record_and_notifies() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let plugin = Plugin::new(registry.env(tmp.path()), "widget");
        let recorder = Arc::new(Recorder::default());
        plugin.subscribe(recorder.clone());
        assert_eq!(plugin.state(), PluginState::Uninstalled);

        plugin.install(&CancellationToken::new()).await.unwrap();

        let record = plugin.record();
        assert_eq!(record.name, "widget");
        assert_eq!(record.version, "1.0.0");
        assert_eq!(record.source, "widget");
        assert_eq!(record.installed_path, tmp.path().join("widget"));
        assert_eq!(record.product_name.as_deref(), Some("WIDGET"));
        assert!(record.active);
        assert!(record.entry_point().unwrap().is_file());
        assert_eq!(plugin.state(), PluginState::Installed);
        assert_eq!(recorder.changed.load(Ordering::SeqCst), 1);
        // Staging is cleaned up.
        assert_eq!(
            std::fs::read_dir(tmp.path().join(STAGING_DIR)).unwrap().count(),
            0
        );
    }

    #[tokio::test]
    async fn scoped_packages_nest_under_scope_dir() {
        let mut registry = Registry::start().await;
        registry.publish("@acme/charts", &["2.0.0"], "2.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let plugin = installed(&registry, tmp.path(), "@acme/charts").await;
        assert_eq!(plugin.record().installed_path, tmp.path().join("@acme/charts"));

        plugin.uninstall().await.unwrap();
        assert!(!tmp.path().join("@acme").exists());
    }

    #[tokio::test]
    async fn failed_install_leaves_nothing_behind() {
        let mut registry = Registry::start().await;
        registry.missing("ghost").await;
        let tmp = tempfile::tempdir().unwrap();

        let plugin = Plugin::new(registry.env(tmp.path()), "ghost");
        let err = plugin.install(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::PackageNotFound { .. }));
        assert_eq!(plugin.state(), PluginState::Uninstalled);
        assert!(plugin.name().is_empty());
        assert!(!tmp.path().join("ghost").exists());
    }

    #[tokio::test]
    async fn archive_without_entry_point_is_rejected() {
        let mut registry = Registry::start().await;
        let archive = crate::test_support::tgz(&[(
            "package/package.json",
            r#"{"name":"hollow","version":"1.0.0","main":"lib/main.js"}"#,
        )]);
        registry.serve_raw("/hollow.tgz", archive).await;
        let tmp = tempfile::tempdir().unwrap();

        let url = format!("{}/hollow.tgz", registry.url());
        let plugin = Plugin::new(registry.env(tmp.path()), url);
        let err = plugin.install(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::Install { .. }));
        assert!(!tmp.path().join("hollow").exists());
    }

    #[tokio::test]
    async fn uninstall_is_idempotent() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let plugin = installed(&registry, tmp.path(), "widget").await;
        let recorder = Arc::new(Recorder::default());
        plugin.subscribe(recorder.clone());

        plugin.uninstall().await.unwrap();
        plugin.uninstall().await.unwrap();

        assert!(!tmp.path().join("widget").exists());
        assert_eq!(plugin.state(), PluginState::Uninstalled);
        assert_eq!(recorder.uninstalled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn uninstall_tolerates_missing_directory() {
        let registry = Registry::start().await;
        let tmp = tempfile::tempdir().unwrap();
        let record = PluginRecord {
            name: "gone".into(),
            version: "1.0.0".into(),
            source: "gone".into(),
            active: true,
            installed_path: tmp.path().join("gone"),
            main: "index.js".into(),
            description: None,
            product_name: None,
        };
        let plugin = Plugin::from_record(registry.env(tmp.path()), record);
        plugin.uninstall().await.unwrap();
        assert!(!plugin.is_active());
    }

    #[tokio::test]
    async fn update_available_follows_semver() {
        let mut registry = Registry::start().await;
        registry
            .publish("widget", &["1.2.0", "1.3.0"], "1.3.0")
            .await;
        registry
            .publish("beta-only", &["1.2.0", "1.2.0-beta"], "1.2.0-beta")
            .await;
        let tmp = tempfile::tempdir().unwrap();

        let widget = installed(&registry, tmp.path(), "widget@1.2.0").await;
        let info = widget.is_update_available().await.unwrap().unwrap();
        assert_eq!(info.version, "1.3.0");

        let beta = installed(&registry, tmp.path(), "beta-only@1.2.0").await;
        assert!(beta.is_update_available().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_swaps_in_newer_version() {
        let mut registry = Registry::start().await;
        registry
            .publish("widget", &["1.2.0", "1.3.0"], "1.3.0")
            .await;
        let tmp = tempfile::tempdir().unwrap();

        let plugin = installed(&registry, tmp.path(), "widget@1.2.0").await;
        plugin.set_active(false).await.unwrap();
        let cancel = CancellationToken::new();

        assert!(plugin.update(&cancel).await.unwrap());
        let record = plugin.record();
        assert_eq!(record.version, "1.3.0");
        assert!(!record.active);
        assert_eq!(record.installed_path, tmp.path().join("widget"));
        let on_disk: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(tmp.path().join("widget/package.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(on_disk["version"], "1.3.0");

        assert!(!plugin.update(&cancel).await.unwrap());
    }

    #[tokio::test]
    async fn failed_update_keeps_previous_version() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();
        let plugin = installed(&registry, tmp.path(), "widget").await;

        // Point the plugin at a registry whose newer tarball is broken.
        let mut broken = Registry::start().await;
        let doc_url = broken.url();
        broken
            .serve_raw("/widget.tgz", b"garbage".to_vec())
            .await;
        broken
            .serve_raw(
                "/widget",
                serde_json::json!({
                    "name": "widget",
                    "dist-tags": { "latest": "2.0.0" },
                    "versions": { "2.0.0": { "dist": { "tarball": format!("{doc_url}/widget.tgz") } } },
                })
                .to_string()
                .into_bytes(),
            )
            .await;
        let moved = Plugin::from_record(broken.env(tmp.path()), plugin.record());

        assert!(moved.update(&CancellationToken::new()).await.is_err());
        assert_eq!(moved.record().version, "1.0.0");
        assert_eq!(moved.state(), PluginState::Installed);
        assert!(tmp.path().join("widget/index.js").is_file());
    }

    #[tokio::test]
    async fn direct_archives_never_report_updates() {
        let mut registry = Registry::start().await;
        registry
            .serve_raw(
                "/dl/widget-1.0.0.tgz",
                crate::test_support::package_tgz("widget", "1.0.0"),
            )
            .await;
        let tmp = tempfile::tempdir().unwrap();
        let url = format!("{}/dl/widget-1.0.0.tgz", registry.url());

        let plugin = installed(&registry, tmp.path(), &url).await;
        assert_eq!(plugin.name(), "widget");
        assert!(plugin.is_update_available().await.unwrap().is_none());
        assert!(!plugin.update(&CancellationToken::new()).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_operations_on_one_plugin_are_rejected() {
        let mut registry = Registry::start().await;
        registry
            .publish("widget", &["1.0.0", "1.1.0"], "1.1.0")
            .await;
        let tmp = tempfile::tempdir().unwrap();
        let plugin = installed(&registry, tmp.path(), "widget@1.0.0").await;
        let cancel = CancellationToken::new();

        let (updated, uninstalled) = tokio::join!(plugin.update(&cancel), plugin.uninstall());

        assert!(updated.unwrap());
        let err = uninstalled.unwrap_err();
        assert!(matches!(err, Error::OperationInProgress { .. }));
        assert!(err.is_retryable());

        let record = plugin.record();
        assert_eq!(record.version, "1.1.0");
        assert!(tmp.path().join("widget/index.js").is_file());
        assert_eq!(plugin.state(), PluginState::Installed);
    }

    #[tokio::test]
    async fn activation_requires_installed_directory() {
        let mut registry = Registry::start().await;
        registry.publish("widget", &["1.0.0"], "1.0.0").await;
        let tmp = tempfile::tempdir().unwrap();

        let pending = Plugin::new(registry.env(tmp.path()), "widget");
        assert!(matches!(
            pending.set_active(true).await.unwrap_err(),
            Error::Activation { .. }
        ));

        let plugin = installed(&registry, tmp.path(), "widget").await;
        let recorder = Arc::new(Recorder::default());
        let id = plugin.subscribe(recorder.clone());
        assert!(plugin.is_active());
        assert!(!plugin.set_active(false).await.unwrap());
        assert!(!plugin.set_active(false).await.unwrap());
        assert_eq!(recorder.changed.load(Ordering::SeqCst), 1);
        assert!(plugin.set_active(true).await.unwrap());
        assert_eq!(recorder.changed.load(Ordering::SeqCst), 2);

        plugin.unsubscribe(id);
        std::fs::remove_dir_all(tmp.path().join("widget")).unwrap();
        assert!(!plugin.set_active(false).await.unwrap());
        assert!(plugin.set_active(true).await.is_err());
        assert_eq!(recorder.changed.load(Ordering::SeqCst), 2);
    }
}
