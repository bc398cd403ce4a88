use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use event_reporter::cli::run::RunOverrides;
use event_reporter::config::{load_config, resolve_config_path, ServiceConfig};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "event-reporter")]
#[command(version)]
#[command(about = "Store-and-forward event reporting daemon", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to the event database
    #[arg(short, long, global = true)]
    db: Option<PathBuf>,

    /// Time between upload cycles, e.g. 30m
    #[arg(long, global = true, value_parser = parse_duration)]
    interval: Option<Duration>,

    /// Log filter, e.g. debug or event_reporter=trace
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Base URL of the running event service
    #[arg(long, global = true)]
    service_url: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Queue an event through the running service
    Add {
        #[arg(long = "type")]
        event_type: String,
        /// JSON object with the event details
        #[arg(long)]
        details: Option<String>,
        /// RFC 3339 time; defaults to now
        #[arg(long)]
        timestamp: Option<DateTime<Utc>>,
    },
    Get {
        key: u64,
    },
    Keys,
    Delete {
        key: u64,
    },
    UploadNow,
}

#[derive(Subcommand)]
enum ConfigAction {
    Init {
        #[arg(long)]
        stdout: bool,
    },
    Validate,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(value).map_err(|e| e.to_string())
}

/// Explicit URL, then the config file's listen address, then the default.
fn resolve_service_url(explicit: Option<String>, config_path: Option<&Path>) -> String {
    explicit.unwrap_or_else(|| {
        config_path
            .and_then(|path| load_config(path).ok())
            .map(|config| config.service.url())
            .unwrap_or_else(|| ServiceConfig::default().url())
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::try_new(level)?,
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "event_reporter=info".into()),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path = resolve_config_path(cli.config.as_deref());
    let service_url = || resolve_service_url(cli.service_url.clone(), config_path.as_deref());

    match cli.command {
        Some(Commands::Run) | None => {
            let overrides = RunOverrides {
                db: cli.db,
                interval: cli.interval,
            };
            event_reporter::cli::run::run(config_path.clone(), overrides).await?;
        }
        Some(Commands::Config { action }) => match action {
            ConfigAction::Init { stdout } => event_reporter::cli::config::init(stdout)?,
            ConfigAction::Validate => event_reporter::cli::config::validate(config_path.clone())?,
        },
        Some(Commands::Add {
            event_type,
            details,
            timestamp,
        }) => {
            event_reporter::cli::events::add(&service_url(), &event_type, details.as_deref(), timestamp)
                .await?
        }
        Some(Commands::Get { key }) => event_reporter::cli::events::get(&service_url(), key).await?,
        Some(Commands::Keys) => event_reporter::cli::events::keys(&service_url()).await?,
        Some(Commands::Delete { key }) => {
            event_reporter::cli::events::delete(&service_url(), key).await?
        }
        Some(Commands::UploadNow) => event_reporter::cli::events::upload_now(&service_url()).await?,
    }

    Ok(())
}
