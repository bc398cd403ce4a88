pub mod parse;
pub mod types;

use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

pub use parse::{load_config, parse_config, ConfigError};
pub use types::{
    ApiConfig, Config, ConnectivityConfig, LongRangeConfig, PowerOffConfig, RateLimitConfig,
    ServiceConfig, StoreConfig, UploadConfig,
};

pub const CONFIG_DIR_NAME: &str = "event-reporter";

pub(crate) fn env_var_pattern() -> Result<&'static Regex, regex::Error> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    if let Some(re) = PATTERN.get() {
        return Ok(re);
    }
    let re = Regex::new(r"\$env\{([A-Za-z_][A-Za-z0-9_]*)\}")?;
    Ok(PATTERN.get_or_init(|| re))
}

/// Expands `$env{VAR_NAME}` references. Unset variables are left unchanged.
pub fn expand_env_vars(text: &str) -> Result<String, regex::Error> {
    let re = env_var_pattern()?;

    Ok(re
        .replace_all(text, |caps: &regex::Captures| {
            let whole = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            caps.get(1)
                .and_then(|name| std::env::var(name.as_str()).ok())
                .unwrap_or_else(|| whole.to_string())
        })
        .to_string())
}

/// Expands a leading `~` to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir.join(rest);
        }
    } else if path_str == "~" {
        if let Some(home_dir) = dirs::home_dir() {
            return home_dir;
        }
    }

    path.to_path_buf()
}

/// Resolves the config file path. Returns the first existing path from:
/// 1. Explicit path (if provided, with tilde expansion)
/// 2. ~/.config/event-reporter/config.yml
/// 3. /etc/event-reporter/config.yml
pub fn resolve_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(expand_tilde(path));
    }

    if let Some(config_dir) = dirs::config_dir() {
        let user_config = config_dir.join(CONFIG_DIR_NAME).join("config.yml");
        if user_config.exists() {
            return Some(user_config);
        }
    }

    let system_config = PathBuf::from("/etc").join(CONFIG_DIR_NAME).join("config.yml");
    if system_config.exists() {
        return Some(system_config);
    }

    None
}
