use anyhow::Context;
use clap::Parser;
use kos_api::{AppState, Server};
use kos_core::Settings;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "kos-server", version, about = "Knowledge OS RAG-light caching and batching API")]
struct Cli {
    /// Directory holding default.toml, {env}.toml and local.toml
    #[arg(long, env = "KOS_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Configuration environment name
    #[arg(long, env = "APP_ENV")]
    env: Option<String>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut settings =
        Settings::load(cli.config_dir, cli.env).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "kos_api={level},kos_vector={level},kos_cache={level},kos_concurrent={level},tower_http=info",
                    level = settings.logging.level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting kos-server (env: {})", settings.env);
    let state = AppState::new(settings).context("failed to build application state")?;
    Server::new(state).run().await?;
    Ok(())
}
