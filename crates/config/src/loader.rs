use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{
    env_subst::substitute_env,
    error::{Context, Error, Result},
    schema::ToolstreamConfig,
};

/// Config file names, checked in order in each search directory.
pub const CONFIG_FILENAMES: &[&str] = &[
    "toolstream.toml",
    "toolstream.yaml",
    "toolstream.yml",
    "toolstream.json",
];

/// Read, env-substitute and parse the config file at `path`.
///
/// The format follows the file extension.
pub fn load_config(path: &Path) -> Result<ToolstreamConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&substitute_env(&raw), path)
}

fn parse_config(raw: &str, path: &Path) -> Result<ToolstreamConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");
    let shown = path.display();
    match ext {
        "toml" => toml::from_str::<ToolstreamConfig>(raw)
            .with_context(|| format!("invalid TOML in {shown}")),
        "yaml" | "yml" => serde_yaml::from_str::<ToolstreamConfig>(raw)
            .with_context(|| format!("invalid YAML in {shown}")),
        "json" => serde_json::from_str::<ToolstreamConfig>(raw)
            .with_context(|| format!("invalid JSON in {shown}")),
        _ => Err(Error::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}

/// Load the first config file found, or defaults.
///
/// Search order:
/// 1. `./toolstream.{toml,yaml,yml,json}`
/// 2. the user config directory (`~/.config/toolstream/` on Linux)
///
/// A file that fails to load is reported and defaults are used instead.
pub fn discover_and_load() -> ToolstreamConfig {
    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return ToolstreamConfig::default();
    };
    debug!(path = %path.display(), "loading config");
    load_config(&path).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
        ToolstreamConfig::default()
    })
}

/// User-global config directory.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "toolstream").map(|d| d.config_dir().to_path_buf())
}

fn find_config_file() -> Option<PathBuf> {
    first_existing(Path::new(".")).or_else(|| config_dir().and_then(|dir| first_existing(&dir)))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}
