use std::time::Duration;

use tokio_util::sync::CancellationToken;

use ingest_api_server::AppState;
use tickstore_api::RecordBuffer;

use super::Stack;
use crate::config::{ServeArgs, ServerConfig};
use crate::error::ServerError;

/// Сколько ждать завершения начатого drain-цикла при остановке.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("tickstore-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(config = %args.config, "loaded config");

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    let stack = Stack::build(&config)?;

    // --- Drainer ---
    let drainer = stack.drainer(&config);
    tracing::info!(consumer = %drainer.consumer(), "spawning drainer");
    let drain_handle = tokio::spawn(drainer.run(token.clone()));

    // --- API server (HTTP) ---
    let state = AppState {
        buffer: stack.backend.buffer.clone(),
        monitor: stack.monitor.clone(),
        reader: stack.reader.clone(),
        retry_after_secs: config.retry_after_secs,
    };
    let api_port = config.api_port;
    let api_token = token.clone();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = ingest_api_server::run(api_port, state, api_token).await {
            tracing::error!(error = %e, "api server error");
        }
    });

    tracing::info!("server ready");

    // --- Ожидание Ctrl+C ---
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down...");

    // Producer'ы отрезаны первыми, drainer доводит текущий цикл.
    token.cancel();
    let _ = api_handle.await;

    match tokio::time::timeout(SHUTDOWN_GRACE, drain_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "drainer task failed"),
        Err(_) => {
            // Неподтверждённые записи остаются in-flight и вернутся при старте.
            tracing::warn!(grace_s = SHUTDOWN_GRACE.as_secs(), "drainer did not stop in time");
        }
    }

    match stack.backend.buffer.stats().await {
        Ok(stats) => tracing::info!(
            pending = stats.pending,
            in_flight = stats.in_flight,
            dead_letters = stats.dead_letters,
            committed_total = stats.committed_total,
            "shutdown complete"
        ),
        Err(e) => tracing::warn!(error = %e, "shutdown complete, buffer stats unavailable"),
    }
    Ok(())
}
