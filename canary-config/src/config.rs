//! Configuration loading
//!
//! Loading hierarchy: environment > file > defaults.

use std::path::{Path, PathBuf};

use crate::env::apply_env_overrides;
use crate::schema::{validate_config, CanaryConfig, ConfigError};

/// Name of the configuration file searched for in the working
/// directory
pub const CONFIG_FILE: &str = "canary.toml";

/// Load configuration, optionally from an explicit file path.
///
/// With no explicit path, `canary.toml` in the current directory is
/// used when present, otherwise defaults apply.  Environment
/// variables (`CANARY_*`) override either source.
pub fn load_config(path: Option<&Path>) -> Result<CanaryConfig, ConfigError> {
    let mut config = match path {
        Some(file) => load_from_file(file)?,
        None => {
            let default = PathBuf::from(CONFIG_FILE);
            if default.exists() {
                load_from_file(&default)?
            } else {
                CanaryConfig::default()
            }
        }
    };
    apply_env_overrides(&mut config)?;
    validate_config(&config)?;
    Ok(config)
}

/// Load configuration from a TOML file
pub fn load_from_file(path: &Path) -> Result<CanaryConfig, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&text).map_err(|e| ConfigError::Parse(format!("{}: {}", path.display(), e)))
}
