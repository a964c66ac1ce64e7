use std::net::SocketAddr;

use anyhow::{Context, Result};
use callbox_server::{
    config::{Cli, Commands, ServerConfig},
    probe,
    telemetry::{self, Telemetry},
    AppState,
};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(Commands::Probe(args)) = cli.command {
        telemetry::init_tracing()?;
        return probe::run(args).await;
    }

    let telemetry = Telemetry::init()?;
    let config = ServerConfig::try_from(cli.server)?;
    info!(
        listen_addr = %config.listen_addr,
        max_pending_candidates = config.max_pending_candidates,
        outbound_buffer = config.outbound_buffer,
        "starting callbox server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState::new(&config, metrics);
    let app = callbox_server::app(state.clone(), &config.allowed_origins);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!("callbox listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    let calls_ended = state.router.shutdown();
    info!(
        calls_ended,
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; letting writers flush"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
