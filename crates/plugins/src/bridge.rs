//! The command surface exposed to the presentation process.
//!
//! Every method checks that [`PluginBridge::setup`] has run, delegates to the
//! store and returns plain serializable records. Batch methods never fail
//! because of one bad item; per-item failures are logged and pushed as
//! events instead.

use std::{
    collections::BTreeMap,
    sync::{Arc, OnceLock},
};

use {
    async_trait::async_trait,
    futures::future::join_all,
    harbor_protocol::{PROTOCOL_VERSION, events},
    serde::Serialize,
    serde_json::{Value, json},
    tokio::sync::broadcast,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

use crate::{
    error::{Error, Result},
    plugin::Plugin,
    store::PluginStore,
    types::{PluginRecord, UpdateStatus},
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A side-channel notification for the presentation process.
#[derive(Debug, Clone, Serialize)]
pub struct BridgeEvent {
    pub event: &'static str,
    pub payload: Value,
}

/// Gate installs behind user confirmation.
#[async_trait]
pub trait InstallConfirmer: Send + Sync {
    async fn confirm_install(&self, specifiers: &[String]) -> bool;
}

/// Confirms everything.
pub struct AutoConfirm;

#[async_trait]
impl InstallConfirmer for AutoConfirm {
    async fn confirm_install(&self, _specifiers: &[String]) -> bool {
        true
    }
}

pub struct PluginBridge {
    store: OnceLock<PluginStore>,
    failure: OnceLock<String>,
    confirmer: Arc<dyn InstallConfirmer>,
    events: broadcast::Sender<BridgeEvent>,
    shutdown: CancellationToken,
}

impl Default for PluginBridge {
    fn default() -> Self {
        Self::new(Arc::new(AutoConfirm))
    }
}

impl PluginBridge {
    pub fn new(confirmer: Arc<dyn InstallConfirmer>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store: OnceLock::new(),
            failure: OnceLock::new(),
            confirmer,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// Attach the store. Allowed exactly once per process.
    pub fn setup(&self, store: PluginStore) -> Result<()> {
        self.store
            .set(store)
            .map_err(|_| Error::AlreadyInitialized)?;
        info!("plugin bridge ready");
        Ok(())
    }

    /// Record that bootstrap failed. Listing then yields nothing and every
    /// mutating call reports the reason.
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        let _ = self.failure.set(reason.into());
    }

    pub fn is_ready(&self) -> bool {
        self.store.get().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Abort in-flight downloads.
    pub fn cancel_all(&self) {
        self.shutdown.cancel();
    }

    pub fn store(&self) -> Result<&PluginStore> {
        if let Some(store) = self.store.get() {
            return Ok(store);
        }
        match self.failure.get() {
            Some(reason) => Err(Error::unavailable(reason.clone())),
            None => Err(Error::NotInitialized),
        }
    }

    fn emit(&self, event: &'static str, payload: Value) {
        // No subscribers is fine.
        let _ = self.events.send(BridgeEvent { event, payload });
    }

    fn emit_failure(&self, operation: &str, item: &str, error: &Error) {
        warn!(operation, item, error = %error, "plugin operation failed");
        let event = if operation == "install" {
            events::INSTALL_FAILED
        } else {
            events::OPERATION_FAILED
        };
        self.emit(
            event,
            json!({
                "operation": operation,
                "item": item,
                "code": error.code(),
                "message": error.to_string(),
                "retryable": error.is_retryable(),
            }),
        );
    }

    fn emit_reload(&self, reload: bool) {
        if reload {
            self.emit(events::RELOAD, json!({}));
        }
    }

    pub fn version(&self) -> u32 {
        PROTOCOL_VERSION
    }

    /// Install new plugins. Returns the records that installed; a declined
    /// confirmation installs nothing and is not an error.
    pub async fn install(&self, specifiers: Vec<String>) -> Result<Vec<PluginRecord>> {
        let store = self.store()?;
        if specifiers.is_empty() {
            return Ok(Vec::new());
        }
        if !self.confirmer.confirm_install(&specifiers).await {
            info!(count = specifiers.len(), "plugin install declined");
            return Ok(Vec::new());
        }

        let cancel = self.shutdown.child_token();
        let outcome = store.install_plugins(&specifiers, &cancel).await;
        for failure in &outcome.failures {
            self.emit_failure("install", &failure.item, &failure.error);
        }
        Ok(outcome.succeeded.iter().map(Plugin::record).collect())
    }

    pub async fn uninstall(&self, names: Vec<String>, reload: bool) -> Result<bool> {
        let store = self.store()?;
        let results = join_all(names.iter().map(|name| async move {
            let plugin = store.get_plugin(name)?;
            plugin.uninstall().await
        }))
        .await;

        for (name, result) in names.iter().zip(results) {
            if let Err(e) = result {
                self.emit_failure("uninstall", name, &e);
            }
        }
        self.emit_reload(reload);
        Ok(true)
    }

    /// Update the named plugins; returns the ones that actually changed.
    pub async fn update(&self, names: Vec<String>, reload: bool) -> Result<Vec<PluginRecord>> {
        let store = self.store()?;
        let cancel = self.shutdown.child_token();
        let cancel = &cancel;
        let results = join_all(names.iter().map(|name| async move {
            let plugin = store.get_plugin(name)?;
            let changed = plugin.update(cancel).await?;
            Ok::<_, Error>(changed.then(|| plugin.record()))
        }))
        .await;

        let mut updated = Vec::new();
        for (name, result) in names.iter().zip(results) {
            match result {
                Ok(Some(record)) => {
                    self.emit(
                        events::UPDATED,
                        json!({ "name": record.name, "version": record.version }),
                    );
                    updated.push(record);
                },
                Ok(None) => {},
                Err(e) => self.emit_failure("update", name, &e),
            }
        }
        self.emit_reload(reload);
        Ok(updated)
    }

    /// Check the named plugins, or every registered plugin when `names` is
    /// `None`. Lookup failures report as "no update" and emit a failure event.
    pub async fn check_updates(
        &self,
        names: Option<Vec<String>>,
    ) -> Result<BTreeMap<String, UpdateStatus>> {
        let store = self.store()?;
        let plugins: Vec<Plugin> = match names {
            Some(names) => names
                .iter()
                .filter_map(|name| match store.get_plugin(name) {
                    Ok(plugin) => Some(plugin),
                    Err(e) => {
                        self.emit_failure("checkUpdates", name, &e);
                        None
                    },
                })
                .collect(),
            None => store.all_plugins(),
        };

        let checks = join_all(plugins.iter().map(|plugin| async move {
            (plugin.name(), plugin.is_update_available().await)
        }))
        .await;

        let mut statuses = BTreeMap::new();
        for (name, result) in checks {
            let status = match result {
                Ok(info) => UpdateStatus::from(info),
                Err(e) => {
                    self.emit_failure("checkUpdates", &name, &e);
                    UpdateStatus::UpToDate
                },
            };
            statuses.insert(name, status);
        }
        Ok(statuses)
    }

    pub fn list_active(&self) -> Result<Vec<PluginRecord>> {
        Ok(self
            .listable()?
            .map(|store| store.active_plugins().iter().map(Plugin::record).collect())
            .unwrap_or_default())
    }

    pub fn list_all(&self) -> Result<Vec<PluginRecord>> {
        Ok(self
            .listable()?
            .map(|store| store.all_plugins().iter().map(Plugin::record).collect())
            .unwrap_or_default())
    }

    /// Listing keeps working after a failed bootstrap, with an empty set.
    fn listable(&self) -> Result<Option<&PluginStore>> {
        match self.store() {
            Ok(store) => Ok(Some(store)),
            Err(Error::Unavailable { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn set_active(&self, name: &str, active: bool) -> Result<PluginRecord> {
        let plugin = self.store()?.get_plugin(name)?;
        plugin.set_active(active).await?;
        Ok(plugin.record())
    }
}
