//! Configuration loading and directory resolution.
//!
//! Config file: `harbor.toml`, searched in `./` then `~/.config/harbor/`.
//! A handful of `HARBOR_*` environment variables override file values.

pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{
        apply_env_overrides, clear_config_dir, clear_data_dir, config_dir, data_dir,
        discover_and_load, load_config, set_config_dir, set_data_dir,
    },
    schema::{HarborConfig, PluginsConfig, ServerConfig},
};
