use crate::config::{load_config, CONFIG_DIR_NAME};
use std::fs;
use std::path::{Path, PathBuf};

pub const SAMPLE_CONFIG: &str = include_str!("../../samples/config.yml");

pub fn init(stdout: bool) -> Result<(), Box<dyn std::error::Error>> {
    if stdout {
        print!("{}", SAMPLE_CONFIG);
        return Ok(());
    }

    let config_path = default_write_path();

    if config_path.exists() {
        return Err(format!(
            "Config file already exists at {}. Remove it first or use --stdout to print the config",
            config_path.display()
        )
        .into());
    }

    write_config(SAMPLE_CONFIG, &config_path)?;
    println!("Config file written to {}", config_path.display());
    Ok(())
}

/// `~/.config/event-reporter/config.yml` when its directory can be created,
/// otherwise `/etc/event-reporter/config.yml`.
fn default_write_path() -> PathBuf {
    let system_config = PathBuf::from("/etc").join(CONFIG_DIR_NAME).join("config.yml");

    let user_dir = match dirs::config_dir() {
        Some(dir) => dir.join(CONFIG_DIR_NAME),
        None => return system_config,
    };

    match fs::create_dir_all(&user_dir) {
        Ok(()) => user_dir.join("config.yml"),
        Err(_) => {
            eprintln!("Warning: Could not create directory {}", user_dir.display());
            eprintln!("Falling back to {}", system_config.display());
            system_config
        }
    }
}

pub fn write_config(content: &str, path: &Path) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content)
}

pub fn validate(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let path = config_path.ok_or("No config file found. Use --config to specify a path.")?;

    println!("Validating config file: {}", path.display());
    load_config(&path)?;
    println!("Config is valid");
    Ok(())
}
