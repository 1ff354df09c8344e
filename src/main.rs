use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use logrelay::config::{Config, DEFAULT_MEILI_HOST, DEFAULT_PORT};
use logrelay::engine::EngineClient;

#[derive(Parser)]
#[command(
    name = "logrelay",
    about = "Real-time multi-project log collection and query gateway"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Server port
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Search engine host
        #[arg(long, env = "MEILI_HOST", default_value = DEFAULT_MEILI_HOST)]
        meili_host: String,

        /// Search engine API key
        #[arg(long, env = "MEILI_KEY", default_value = "")]
        meili_key: String,
    },

    /// Create and configure the engine index
    Init {
        /// Search engine host
        #[arg(long, env = "MEILI_HOST", default_value = DEFAULT_MEILI_HOST)]
        meili_host: String,

        /// Search engine API key
        #[arg(long, env = "MEILI_KEY", default_value = "")]
        meili_key: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            let _ = e.print();
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(1);
        }
    };

    match cli.command {
        Commands::Serve {
            port,
            meili_host,
            meili_key,
        } => match logrelay::server::run(Config::new(port, meili_host, meili_key)).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!("{e:#}");
                ExitCode::from(1)
            }
        },
        Commands::Init {
            meili_host,
            meili_key,
        } => {
            let client = match EngineClient::new(&meili_host, &meili_key) {
                Ok(client) => client,
                Err(e) => {
                    tracing::error!("{e:#}");
                    return ExitCode::from(1);
                }
            };
            match client.ensure_index().await {
                Ok(()) => {
                    tracing::info!("engine index configured");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    tracing::error!(error = %e, "index initialization failed");
                    ExitCode::from(2)
                }
            }
        }
    }
}
