use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nostr_view::{replay, Config, ReplayOptions};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "nostr-view")]
#[command(about = "Verified, memory-bounded local view of Nostr relay traffic")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long, default_value = "nostr-view.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Feed a JSONL capture of relay messages through the view and print a summary
    Replay {
        /// One `{"relay": ..., "message": [...]}` record per line
        file: PathBuf,
        /// Unix time to trim against instead of the wall clock
        #[arg(long)]
        now: Option<u64>,
        /// Skip the trim pass after replay
        #[arg(long)]
        no_trim: bool,
    },
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load_from_file(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config))?;
    config.expand_paths();

    init_logging(&config.logging.level)?;

    config
        .validate()
        .with_context(|| "Configuration validation failed")?;

    match cli.command {
        Commands::Replay { file, now, no_trim } => {
            let options = ReplayOptions {
                now,
                skip_trim: no_trim,
            };
            let summary = replay(&config, &file, &options)
                .await
                .with_context(|| format!("Replay of {} failed", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Commands::CheckConfig => check_config(&config),
    }
}

fn check_config(config: &Config) -> Result<()> {
    for line in config.describe()? {
        println!("{line}");
    }
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = match level.to_lowercase().as_str() {
        "error" => tracing::Level::ERROR,
        "warn" => tracing::Level::WARN,
        "info" => tracing::Level::INFO,
        "debug" => tracing::Level::DEBUG,
        "trace" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter.to_string())),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialise logging: {}", e))?;

    Ok(())
}
