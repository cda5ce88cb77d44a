use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gp_domain::config::AppConfig;
use gp_gateway::{api, bootstrap, cli};

#[derive(Parser)]
#[command(name = "graphpilot", about = "Conversational agent for node-graph image generation")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP/WebSocket server (default).
    Serve,
    /// Interactive chat in the terminal.
    Chat,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            let config = AppConfig::load(&cli.config)?;
            run_server(config, cli.config).await
        }
        Some(Command::Chat) => {
            // Keep the terminal clean: log warnings and errors only.
            tracing_subscriber::fmt()
                .with_env_filter(
                    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
                )
                .init();
            let config = AppConfig::load(&cli.config)?;
            let state = bootstrap::build_state(config, cli.config).await?;
            cli::run_chat(state).await
        }
        Some(Command::Version) => {
            println!("graphpilot {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,gp_gateway=debug")),
        )
        .init();
}

async fn run_server(config: AppConfig, config_path: PathBuf) -> anyhow::Result<()> {
    tracing::info!("GraphPilot starting");

    let host = config.server.host.clone();
    let port = config.server.port;

    let state = bootstrap::build_state(config, config_path).await?;
    let app = api::router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;

    tracing::info!(addr = %addr, "GraphPilot listening");

    axum::serve(listener, app).await.context("server error")?;
    Ok(())
}
