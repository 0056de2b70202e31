use std::path::Path;
use std::sync::Arc;

use agent_dispatch::api::{ApiState, api_routes};
use agent_dispatch::completion::CompletionHandler;
use agent_dispatch::config::{GatewayConfig, ServerConfig};
use agent_dispatch::dispatch::{DispatchSettings, Dispatcher, retry_channel, spawn_retry_worker};
use agent_dispatch::gateway::{AgentGateway, HttpGateway};
use agent_dispatch::store::{Database, LibSqlBackend};
use tower_http::cors::CorsLayer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (server_config, gateway_config) = load_config()?;

    // Held for the process lifetime so buffered log lines are flushed.
    let _log_guard = init_tracing(server_config.log_dir.as_deref());

    eprintln!("🛰  Agent Dispatch v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/api", server_config.port);
    eprintln!("   Webhook: {}", server_config.completion_webhook_url());
    eprintln!("   Gateway: {}", gateway_config.url);
    eprintln!("   Database: {}\n", server_config.db_path.display());

    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&server_config.db_path).await?);

    let gateway = Arc::new(HttpGateway::new(&gateway_config)?);
    if let Err(e) = gateway.connect().await {
        tracing::warn!(error = %e, "Agent gateway not reachable yet, will connect on first dispatch");
    }

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        gateway.clone(),
        DispatchSettings::from_config(&server_config),
    ));

    let (retry_tx, retry_rx) = retry_channel();
    let _retry_worker = spawn_retry_worker(dispatcher.clone(), retry_rx);
    let completions = Arc::new(CompletionHandler::new(db.clone(), retry_tx));

    let app = api_routes(ApiState {
        db,
        dispatcher,
        completions,
    })
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", server_config.port)).await?;
    tracing::info!(port = server_config.port, "HTTP server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.disconnect().await;
    tracing::info!("Shut down");
    Ok(())
}

fn load_config() -> agent_dispatch::error::Result<(ServerConfig, GatewayConfig)> {
    Ok((ServerConfig::from_env()?, GatewayConfig::from_env()?))
}

/// Stderr logging plus an optional daily-rolling file.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "agent-dispatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
