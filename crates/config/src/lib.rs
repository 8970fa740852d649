//! Configuration loading and env substitution.
//!
//! Config files: `toolstream.toml`, `toolstream.yaml`/`.yml`, or
//! `toolstream.json`, searched in `./` then the user config directory.
//! `${ENV_VAR}` references are expanded before parsing.

pub mod env_subst;
pub mod error;
pub mod loader;
pub mod schema;

pub use {
    error::{Error, Result},
    loader::{CONFIG_FILENAMES, config_dir, discover_and_load, load_config},
    schema::{ChatConfig, ProviderConfig, ToolsConfig, ToolstreamConfig},
};
