use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rmcp::transport::stdio;
use rmcp::ServiceExt;

use gdrive_mcp::auth::{build_hub, run_auth_flow};
use gdrive_mcp::config::Config;
use gdrive_mcp::drive::{DriveClient, GoogleDrive};
use gdrive_mcp::tools::DriveService;

#[derive(Parser)]
#[command(name = "gdrive-mcp", about = "MCP server for Google Drive")]
struct Cli {
    /// Directory holding gcp-oauth.keys.json and tokens.json (default: ~/.gdrive-mcp)
    #[arg(long, global = true, env = "GDRIVE_MCP_DIR")]
    credentials_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the MCP server (default)
    Serve,
    /// Authenticate with Google and save tokens
    Auth,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // Tracing to stderr; stdout carries the MCP stdio transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::with_dir(cli.credentials_dir.filter(|d| !d.as_os_str().is_empty()))?;
    tracing::info!("Credentials directory: {}", config.credentials_dir().display());

    match cli.command.unwrap_or(Command::Serve) {
        Command::Auth => {
            run_auth_flow(&config).await?;
        }
        Command::Serve => {
            let hub = build_hub(&config).await?;
            let drive = Arc::new(DriveClient::new(Arc::new(GoogleDrive::new(hub))));
            let service = DriveService::new(drive);

            tracing::info!("Starting MCP server on stdio...");
            let server = service.serve(stdio()).await?;
            server.waiting().await?;
        }
    }

    Ok(())
}
