//! echorelay CLI

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use echorelay::auth::TokenService;
use echorelay::config::Config;
use std::path::PathBuf;
use tracing_subscriber::{fmt, EnvFilter};

/// Authenticated WebSocket echo relay
#[derive(Parser)]
#[command(name = "echorelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config.toml (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay (default)
    Serve {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (0 picks a free port)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Mint a bearer token for a username without a login round-trip
    IssueToken {
        /// Token subject
        subject: String,
    },

    /// Print shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn init_logging(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Completions { shell }) = &cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(*shell, &mut cmd, "echorelay", &mut std::io::stdout());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&config.logging.filter);

    match cli.command {
        Some(Commands::IssueToken { subject }) => {
            let tokens = TokenService::from_config(&config.auth)?;
            let token = tokens
                .issue(&subject)
                .map_err(|e| anyhow::anyhow!("Failed to issue token: {e}"))?;
            println!("{token}");
            Ok(())
        }
        Some(Commands::Serve { host, port }) => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            echorelay::gateway::run_gateway(config).await
        }
        None => echorelay::gateway::run_gateway(config).await,
        Some(Commands::Completions { .. }) => Ok(()),
    }
}
