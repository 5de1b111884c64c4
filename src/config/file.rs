//! Config file loading
//!
//! The config lives in a single TOML file. A handful of knobs can be
//! overridden from the environment so containers can tweak deployments
//! without editing the file.

use std::path::Path;

use crate::{Error, Result};

use super::Config;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "SWITCHBOARD_CONFIG";

/// Default config file name, resolved relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "switchboard.toml";

/// Load the config from an explicit path, the env override, or the default
/// location. A missing file yields the built-in defaults.
///
/// # Errors
///
/// Returns an error when the file exists but cannot be read or parsed, or
/// when validation fails.
pub fn load(path: Option<&Path>) -> Result<Config> {
    let resolved = path.map(Path::to_path_buf).or_else(|| {
        std::env::var(CONFIG_PATH_ENV)
            .ok()
            .map(std::path::PathBuf::from)
    });

    let mut config = match resolved {
        Some(p) if p.exists() => parse_file(&p)?,
        Some(p) => {
            return Err(Error::Config(format!(
                "config file not found: {}",
                p.display()
            )))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.exists() {
                parse_file(default)?
            } else {
                Config::default()
            }
        }
    };

    apply_env_overrides(&mut config);
    resolve_key_refs(&mut config);
    config.validate()?;
    Ok(config)
}

/// Parse a TOML config file
fn parse_file(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)?;
    tracing::info!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Overlay environment variables onto the parsed config
fn apply_env_overrides(config: &mut Config) {
    if let Ok(dir) = std::env::var("SWITCHBOARD_DATA_DIR") {
        config.data_dir = dir.into();
    }
    if let Ok(port) = std::env::var("SWITCHBOARD_PORT") {
        if let Ok(port) = port.parse() {
            config.rpc.port = port;
        }
    }
    if let Ok(agent) = std::env::var("SWITCHBOARD_DEFAULT_AGENT") {
        config.default_agent = Some(agent);
    }
}

/// Resolve `env:VAR` references in provider API keys
fn resolve_key_refs(config: &mut Config) {
    for profile in &mut config.providers {
        if let Some(var) = profile.api_key.strip_prefix("env:") {
            match std::env::var(var) {
                Ok(value) => profile.api_key = value,
                Err(_) => {
                    tracing::warn!(
                        profile = %profile.id,
                        var,
                        "provider key env var not set"
                    );
                    profile.api_key.clear();
                }
            }
        }
    }
}
