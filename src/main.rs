use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "proxypulse",
    about = "Scheduled proxy pool speed testing and IP reputation monitoring",
    version,
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + scheduler + jobs)
    Serve {
        /// Path to the TOML config file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// Bind address
        #[arg(long, default_value = "0.0.0.0:8080")]
        bind: String,
    },

    /// Run one speed-check pass and exit
    Check {
        /// Path to the TOML config file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Run one IP-quality check and exit
    IpCheck {
        /// Path to the TOML config file
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Classify a fraud score into a risk level
    Classify {
        /// Fraud score (0-100)
        #[arg(long)]
        score: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, bind } => {
            tracing::info!(%bind, config = %config.display(), "Starting proxypulse daemon");
            proxypulse::serve(&config, &bind).await?;
        }
        Commands::Check { config } => {
            tracing::info!(config = %config.display(), "Running one speed-check pass");
            proxypulse::run_check_once(&config).await?;
        }
        Commands::IpCheck { config } => {
            tracing::info!(config = %config.display(), "Running one IP-quality check");
            proxypulse::run_ip_check_once(&config).await?;
        }
        Commands::Classify { score } => {
            let level = proxypulse::ipquality::classify(Some(score));
            println!("{score} -> {level}");
        }
    }

    Ok(())
}
