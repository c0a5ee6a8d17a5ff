use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use adwd::config::ServerConfig;
use adwd::server::start_server;

#[derive(Parser)]
#[command(name = "adwd")]
#[command(version, about = "ADW trigger server - launch AI developer workflows and stream their progress")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the trigger server (default)
    Serve {
        /// Listen port (overrides BACKEND_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// SQLite database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Repository root workers are launched from
        #[arg(long)]
        repo_root: Option<PathBuf>,

        /// Permissive CORS for local UI development
        #[arg(long)]
        dev: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Server-side .env; workers get their own sanitized copy at launch.
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::from_env();

    if let Some(Commands::Serve {
        port,
        db_path,
        repo_root,
        dev,
    }) = cli.command
    {
        if let Some(port) = port {
            config.port = port;
        }
        if let Some(db_path) = db_path {
            config.db_path = db_path;
        }
        if let Some(repo_root) = repo_root {
            config.repo_root = repo_root;
        }
        config.dev_mode = dev;
    }

    start_server(config).await
}
