//! HTTP граница: приём записей от producer'ов, статистика и чтение
//! закоммиченных данных.

mod http;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tokio_util::sync::CancellationToken;

use pipeline::DrainMonitor;
use store_engine::StoreReader;
use tickstore_api::RecordBuffer;

#[derive(Clone)]
pub struct AppState {
    pub buffer: Arc<dyn RecordBuffer>,
    pub monitor: Arc<DrainMonitor>,
    pub reader: StoreReader,
    /// Значение `Retry-After` при переполнении буфера.
    pub retry_after_secs: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/records", post(http::handle_push_records))
        .route("/api/stats", get(http::handle_stats))
        .route("/api/dead-letters", get(http::handle_dead_letters))
        .route("/api/health", get(http::handle_health))
        .route("/api/stores", get(http::handle_list_stores))
        .route("/api/stores/{file}", get(http::handle_describe_store))
        .route("/api/stores/{file}/{table}", get(http::handle_read_table))
        .with_state(state)
}

/// Ingest HTTP API сервер.
pub async fn run(port: u16, state: AppState, shutdown: CancellationToken) -> Result<(), String> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}"))
        .await
        .map_err(|e| format!("bind api :{port}: {e}"))?;
    tracing::info!(port, "ingest api listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| format!("axum serve: {e}"))?;

    Ok(())
}
