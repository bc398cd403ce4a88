use super::types::*;
use crate::config::{env_var_pattern, expand_env_vars, expand_tilde};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("validation failed:\n{}", .0.join("\n"))]
    ValidationList(Vec<String>),

    #[error("validation failed: {0}")]
    Validation(String),
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    use std::io::Read;

    let mut file = File::open(path).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open config file '{}': {}", path.display(), e),
        ))
    })?;

    let mut yaml_string = String::new();
    file.read_to_string(&mut yaml_string).map_err(|e| {
        ConfigError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to read config file '{}': {}", path.display(), e),
        ))
    })?;

    parse_config(&yaml_string).map_err(|e| match e {
        ConfigError::YamlParse(e) => ConfigError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("in file '{}': {}", path.display(), e),
        )),
        other => other,
    })
}

/// Parse and validate config text, expanding `$env{VAR}` and `~` first.
pub fn parse_config(yaml: &str) -> Result<Config, ConfigError> {
    let yaml_string = expand_env_vars(yaml)?;
    check_unexpanded_vars(&yaml_string)?;

    let mut config: Config = if yaml_string.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(&yaml_string)?
    };

    expand_paths(&mut config);
    validate_config(&config)?;

    Ok(config)
}

fn check_unexpanded_vars(yaml_string: &str) -> Result<(), ConfigError> {
    let re = env_var_pattern()?;
    let mut unexpanded_vars: Vec<String> = re
        .captures_iter(yaml_string)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect();

    if unexpanded_vars.is_empty() {
        return Ok(());
    }

    unexpanded_vars.sort();
    unexpanded_vars.dedup();

    let error_msg = if unexpanded_vars.len() == 1 {
        format!(
            "Environment variable $env{{{0}}} is not set.\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variable: export {0}=...\n\
             2. Replace $env{{{0}}} in the config file with an actual value",
            unexpanded_vars[0]
        )
    } else {
        format!(
            "Environment variables are not set: {}\n\
             \n\
             To fix this, either:\n\
             1. Set the environment variables\n\
             2. Replace the variables in the config file with actual values",
            unexpanded_vars.join(", ")
        )
    };

    Err(ConfigError::Validation(error_msg))
}

fn expand_paths(config: &mut Config) {
    config.store.path = expand_tilde(&config.store.path);
    config.power_off.marker_file = expand_tilde(&config.power_off.marker_file);
    if let Some(path) = config.rate_limit.environment_file.as_mut() {
        *path = expand_tilde(path);
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    let mut errors = Vec::new();

    if config.upload.interval.is_zero() {
        errors.push("upload.interval must be greater than zero".to_string());
    }
    if config.upload.batch_size == 0 {
        errors.push("upload.batch_size must be at least 1".to_string());
    }

    if config.rate_limit.threshold == 0 {
        errors.push("rate_limit.threshold must be at least 1".to_string());
    }
    if config.rate_limit.window.is_zero() {
        errors.push("rate_limit.window must be greater than zero".to_string());
    }

    if !config.service.listen.ip().is_loopback() {
        errors.push(format!(
            "service.listen must be a loopback address, got {}",
            config.service.listen
        ));
    }

    if let Some(api) = &config.api {
        if !(api.server_url.starts_with("http://") || api.server_url.starts_with("https://")) {
            errors.push(format!(
                "api.server_url must be an http(s) URL, got '{}'",
                api.server_url
            ));
        }
        if api.password.is_empty() {
            errors.push("api.password cannot be empty".to_string());
        }
        if matches!(&api.device_name, Some(name) if name.is_empty()) {
            errors.push("api.device_name cannot be empty".to_string());
        }
    }

    if config.connectivity.ping_hosts.is_empty() {
        errors.push("connectivity.ping_hosts must contain at least one host".to_string());
    }
    if config.connectivity.wifi_interface.is_empty() {
        errors.push("connectivity.wifi_interface cannot be empty".to_string());
    }

    if let Some(long_range) = &config.long_range {
        if long_range.url.is_empty() {
            errors.push("long_range.url cannot be empty".to_string());
        }
        if long_range.poll_interval.is_zero() {
            errors.push("long_range.poll_interval must be greater than zero".to_string());
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::ValidationList(errors))
    }
}
