#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use oobprov::{gateway, Config, ConfigCommands};
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// `oobprov` - out-of-band device provisioning and maintenance.
#[derive(Parser, Debug)]
#[command(name = "oobprov")]
#[command(version)]
#[command(about = "Provisioning and maintenance service for out-of-band device management engines.", long_about = None)]
struct Cli {
    /// Path to config.toml (default: ~/.oobprov/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway (device sockets, assistant socket, trigger API)
    #[command(long_about = "\
Start the gateway.

Devices connect to /ws/device?guid=<guid>, the enrollment assistant to
/ws/assistant, and workflows are triggered with POST /api/v1/workflows.

Examples:
  oobprov serve
  oobprov serve --port 9000
  oobprov serve --host 0.0.0.0 --config /etc/oobprov/config.toml")]
    Serve {
        /// Port to listen on; defaults to [gateway] port
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to; defaults to [gateway] host
        #[arg(long)]
        host: Option<String>,
    },

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Print service and protocol versions
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Schema and version output must stay clean stdout, so they skip logging and config.
    match &cli.command {
        Commands::Config {
            config_command: ConfigCommands::Schema,
        } => {
            let schema = schemars::schema_for!(Config);
            println!(
                "{}",
                serde_json::to_string_pretty(&schema).context("failed to serialize JSON Schema")?
            );
            return Ok(());
        }
        Commands::Version => {
            println!(
                "oobprov {} (protocol {})",
                env!("CARGO_PKG_VERSION"),
                oobprov::envelope::PROTOCOL_VERSION
            );
            return Ok(());
        }
        _ => {}
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;

    let config = Config::load_or_init(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Serve { port, host } => {
            let port = port.unwrap_or(config.gateway.port);
            let host = host.unwrap_or_else(|| config.gateway.host.clone());
            if host.trim().is_empty() {
                bail!("--host cannot be empty");
            }
            tracing::info!("Starting oobprov gateway on {host}:{port}");
            gateway::run_gateway(&host, port, config).await
        }
        Commands::Config {
            config_command: ConfigCommands::Show,
        } => {
            let rendered =
                toml::to_string_pretty(&config).context("failed to render configuration")?;
            println!("{rendered}");
            Ok(())
        }
        Commands::Config {
            config_command: ConfigCommands::Schema,
        }
        | Commands::Version => Ok(()),
    }
}
