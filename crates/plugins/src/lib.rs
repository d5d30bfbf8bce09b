//! Plugin lifecycle management: resolving packages from a registry,
//! installing and updating them under a single plugins root, tracking them
//! in an atomically written manifest, and exposing a narrow command bridge to
//! the presentation process.
//!
//! Plugins live in `<root>/<name>` (scoped packages in `<root>/@scope/name`)
//! and are recorded in `<root>/plugins.json`.

pub mod archive;
pub mod bootstrap;
pub mod bridge;
pub mod error;
pub mod manifest;
pub mod migration;
pub mod plugin;
pub mod resolver;
pub mod resource;
pub mod state;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_support;

pub use {
    bootstrap::{BootstrapOptions, Bootstrapped, bootstrap},
    bridge::{AutoConfirm, BridgeEvent, InstallConfirmer, PluginBridge},
    error::{Error, Result},
    plugin::{Plugin, PluginEnv, PluginEvent, PluginListener, PluginState},
    resolver::{PackageResolver, PackageSpecifier, RegistryResolver},
    resource::ResourceResolver,
    store::{BatchFailure, BatchOutcome, PluginStore},
    types::{PluginRecord, UpdateStatus, VersionInfo},
};
