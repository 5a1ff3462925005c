use std::sync::Arc;

use clap::Parser;
use libdiz::archive::Archive;
use libdiz::compression::DeflateWorkers;
use tokio::signal;
use tracing_subscriber::EnvFilter;
use utils::cli::{Cli, Command};
use utils::state::AppState;

use crate::config::ServeConfig;

mod api;
mod commands;
mod config;
mod error;
mod service;
mod utils;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    // stdout may carry an archive or a tar.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let compression = cli.compression.to_config()?;

    match cli.command {
        Command::Create { output, tar, tags } => {
            commands::create(&output, &tar, &tags, compression)
        }
        Command::Update { archive, tar, tags } => {
            commands::update(&archive, &tar, &tags, compression)
        }
        Command::Restore {
            archive,
            output,
            tags,
        } => commands::restore(&archive, output.as_deref(), &tags),
        Command::List { archive, tags } => commands::list(&archive, &tags),
        Command::Serve {
            archive,
            host,
            port,
        } => {
            let config = ServeConfig {
                host,
                port,
                archive,
                compression,
            };
            tokio::runtime::Runtime::new()?.block_on(serve(config))
        }
    }
}

async fn serve(config: ServeConfig) -> anyhow::Result<()> {
    let workers = Arc::new(DeflateWorkers::new(config.compression)?);
    let path = config.archive.clone();
    let state = tokio::task::spawn_blocking(move || -> libdiz::Result<AppState> {
        let archive = Arc::new(Archive::open_file(&path)?);
        AppState::new(archive, workers)
    })
    .await??;

    let app = api::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(format!("{}:{}", config.host, config.port)).await?;
    tracing::info!(
        "serving {} on {}",
        config.archive.display(),
        listener.local_addr()?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to install Ctrl+C handler: {e}");
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
                tracing::error!("failed to install signal handler: {e}");
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

    tracing::info!("Shutting down...");
}
