//! K2CH CLI - Kafka to ClickHouse streaming ingestion tool.

use anyhow::Result;
use clap::{Parser, Subcommand};
use k2ch_core::config::{LogFormat, LogLevel};
use k2ch_core::Config;
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit codes for CLI operations.
///
/// Following Unix conventions:
/// - 0: Success
/// - 1-127: Application errors
/// - 128+N: Signal N received (e.g., 130 = SIGINT)
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    /// Successful execution
    Success = 0,
    /// Configuration error (invalid config file, missing required settings)
    ConfigError = 1,
    /// Kafka-related error (connection, partition discovery, fatal consumer error)
    KafkaError = 2,
    /// ClickHouse-related error (connection, describe, request failures)
    ClickHouseError = 3,
    /// Schema inference or provisioning error
    SchemaError = 4,
    /// General runtime error
    RuntimeError = 10,
    /// Signal interrupt (SIGINT = 2, so 128 + 2 = 130)
    SignalInterrupt = 130,
}

impl ExitCode {
    /// Map an error to an exit code by the core error it wraps.
    fn from_error(error: &anyhow::Error) -> Self {
        match error.downcast_ref::<k2ch_core::Error>() {
            Some(k2ch_core::Error::Config(_)) => ExitCode::ConfigError,
            Some(k2ch_core::Error::Kafka(_)) => ExitCode::KafkaError,
            Some(k2ch_core::Error::Store(_)) => ExitCode::ClickHouseError,
            Some(k2ch_core::Error::Schema(_)) => ExitCode::SchemaError,
            Some(_) => ExitCode::RuntimeError,
            None => ExitCode::RuntimeError,
        }
    }
}

mod commands;
mod server;

#[derive(Parser)]
#[command(name = "k2ch")]
#[command(about = "Kafka to ClickHouse streaming ingestion CLI", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to an optional TOML configuration file
    #[arg(short, long, global = true, env = "K2CH_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the ingestion pipeline
    Ingest {
        /// Override Kafka bootstrap servers
        #[arg(long)]
        bootstrap_servers: Option<String>,

        /// Override Kafka topic
        #[arg(long)]
        topic: Option<String>,

        /// Override batch size
        #[arg(long)]
        batch_size: Option<usize>,
    },

    /// Show status and health of a running pipeline
    Status {
        /// Health endpoint URL
        #[arg(long, default_value = "http://localhost:8080")]
        url: String,
    },

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() {
    let exit_code = run_cli().await;
    std::process::exit(exit_code as i32);
}

async fn run_cli() -> ExitCode {
    let cli = Cli::parse();

    // Logging is configured from the loaded config when it loads; a broken
    // config is still reported through the default JSON subscriber.
    let loaded = Config::load(cli.config.as_deref());
    let (log_level, log_format) = match &loaded {
        Ok(config) => (
            config.monitoring.log_level.clone(),
            config.monitoring.log_format.clone(),
        ),
        Err(_) => (LogLevel::Info, LogFormat::Json),
    };
    init_logging(cli.verbose, &log_level, &log_format);

    let result = match loaded {
        Ok(config) => execute_command(cli.command, config, cli.config.as_deref()).await,
        // Unreadable or unparsable files are configuration errors too.
        Err(k2ch_core::Error::Config(msg)) => Err(k2ch_core::Error::Config(msg).into()),
        Err(e) => Err(k2ch_core::Error::Config(format!("Failed to load configuration: {}", e)).into()),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            ExitCode::from_error(&e)
        }
    }
}

fn init_logging(verbose: u8, level: &LogLevel, format: &LogFormat) {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        match verbose {
            0 => EnvFilter::new(level.as_str()),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(fmt::layer().json())
                .with(filter)
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(fmt::layer())
                .with(filter)
                .init();
        }
    }
}

async fn execute_command(
    command: Commands,
    config: Config,
    config_path: Option<&Path>,
) -> Result<ExitCode> {
    match command {
        Commands::Ingest {
            bootstrap_servers,
            topic,
            batch_size,
        } => {
            let overrides = commands::ingest::Overrides {
                bootstrap_servers,
                topic,
                batch_size,
            };
            commands::ingest::run(config, overrides).await
        }

        Commands::Status { url } => {
            commands::status::run(&url).await?;
            Ok(ExitCode::Success)
        }

        Commands::Validate => {
            config.validate()?;
            match config_path {
                Some(path) => println!("Configuration is valid ({})", path.display()),
                None => println!("Configuration is valid (environment only)"),
            }
            Ok(ExitCode::Success)
        }
    }
}
