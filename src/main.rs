mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use courier::config::Settings;
use courier::create_app;
use courier::history::HistoryStore;
use courier::registry::DownloadRegistry;
use courier::state::AppState;
use local_ip_address::local_ip;
use std::net::SocketAddr;
use tracing::info;

use crate::cli::Command;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let settings = Settings::new().context("Failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(&settings.log_level)
        .init();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(settings).await,
        Command::List { server } => cli::list(&client(&server, &settings)?).await,
        Command::Fetch { file, server, out } => {
            cli::fetch(&client(&server, &settings)?, &file, &out).await
        }
        Command::History { server, clear } => {
            cli::history(&client(&server, &settings)?, clear).await
        }
    }
}

fn client(server: &str, settings: &Settings) -> Result<DownloadRegistry> {
    Ok(DownloadRegistry::new(server)?.with_attempts(settings.retry_attempts))
}

async fn serve(settings: Settings) -> Result<()> {
    info!("Starting Courier...");

    if !settings.files_dir.exists() {
        std::fs::create_dir_all(&settings.files_dir).context("Failed to create files directory")?;
    }
    let history = HistoryStore::open(&settings.database_path())
        .context("Failed to open download history")?;

    let local_ip = local_ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = settings.server_port;
    let app = create_app(AppState::new(settings, history));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Listening on http://{}", addr);
    info!("Network address: http://{}:{}", local_ip, port);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutting down");
        })
        .await?;
    Ok(())
}
