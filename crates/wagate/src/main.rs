use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use wagate::client::SubprocessClient;
use wagate::commands::CommandRouter;
use wagate::config::Config;
use wagate::credentials::FileCredentialStore;
use wagate::server::{self, AppState};
use wagate::supervisor::Supervisor;
use wagate::switch::SystemSwitch;

#[derive(Parser, Debug)]
#[command(author, version, about = "HTTP-to-WhatsApp gateway", long_about = None)]
struct Cli {
    /// Path to the YAML config file; a missing file means defaults
    #[arg(long, default_value = "wagate.yaml")]
    config: PathBuf,

    /// Port to listen on (overrides config and PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)
        .await
        .with_context(|| format!("failed to load config from {}", cli.config.display()))?;
    config.apply_env(std::env::var("PORT").ok().as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let credentials = Arc::new(FileCredentialStore::new(&config.session.path));
    let client = Arc::new(SubprocessClient::new(config.bridge.clone()));
    let (supervisor, inbound) = Supervisor::spawn(
        config.connection.clone(),
        client,
        credentials,
        SystemSwitch::new(),
    );
    tokio::spawn(CommandRouter::new(supervisor.clone()).run(inbound));

    let app = server::build_app(
        AppState::new(supervisor.clone()),
        config.server.request_timeout_seconds,
    );
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "Server listening");
    for (path, description) in server::ENDPOINTS {
        info!("GET  http://localhost:{}{} - {}", config.server.port, path, description);
    }
    info!(
        max_retries = config.connection.max_retries,
        retry_interval_ms = config.connection.retry_interval_ms,
        "Auto restart: session is cleared and re-paired after {} failed attempts",
        config.connection.max_retries
    );
    info!("Bot control: send STOP/START/STATUS/HELP privately or mention the bot in a group");

    supervisor.connect().await?;

    server::serve(listener, app, supervisor, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
