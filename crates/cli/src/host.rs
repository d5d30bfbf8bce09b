//! Host-side plugin startup shared by `serve` and the `plugins` commands.

use std::{path::PathBuf, sync::Arc, time::Duration};

use {
    harbor_config::HarborConfig,
    harbor_plugins::{
        BootstrapOptions, InstallConfirmer, PluginBridge, RegistryResolver, bootstrap,
        state::STATE_FILE_NAME,
    },
    tracing::{error, info},
};

pub struct Host {
    pub bridge: Arc<PluginBridge>,
    pub plugins_root: PathBuf,
}

/// Run the plugin bootstrap and wire the result into a bridge.
///
/// A failed bootstrap does not abort the process: the bridge is marked
/// unavailable so listing returns an empty set and commands report why.
pub async fn start_host(
    config: &HarborConfig,
    confirmer: Arc<dyn InstallConfirmer>,
) -> anyhow::Result<Host> {
    let plugins_root = config.plugins.resolved_root();
    let resolver = RegistryResolver::new(
        &config.plugins.registry_url,
        Duration::from_secs(config.plugins.request_timeout_secs),
    )?;
    let bridge = Arc::new(PluginBridge::new(confirmer));

    let booted = bootstrap(BootstrapOptions {
        plugins_root: plugins_root.clone(),
        state_path: harbor_config::data_dir().join(STATE_FILE_NAME),
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        resolver: Arc::new(resolver),
        preinstall_dir: config.plugins.preinstall_dir.clone(),
    })
    .await;

    match booted {
        Ok(booted) => {
            if booted.wiped {
                info!(root = %plugins_root.display(), "host version changed, plugins reset");
            }
            if booted.preinstalled > 0 {
                info!(count = booted.preinstalled, "bundled plugins installed");
            }
            info!(
                root = %plugins_root.display(),
                count = booted.store.all_plugins().len(),
                registry = %config.plugins.registry_url,
                "plugins loaded"
            );
            bridge.setup(booted.store)?;
        },
        Err(e) => {
            error!(root = %plugins_root.display(), error = %e, "plugin bootstrap failed");
            bridge.mark_unavailable(e.to_string());
        },
    }

    Ok(Host {
        bridge,
        plugins_root,
    })
}
