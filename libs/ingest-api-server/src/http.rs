use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::json;

use store_engine::StoreError;
use tickstore_api::{BufferError, EntryId, Record};

use super::AppState;

const DEFAULT_DEAD_LETTERS: usize = 100;
const DEFAULT_ROWS: usize = 1_000;
const MAX_ROWS: usize = 100_000;

fn error(status: StatusCode, message: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": message.to_string() }))).into_response()
}

fn store_error(e: StoreError) -> Response {
    let status = match &e {
        StoreError::NotFound(_) => StatusCode::NOT_FOUND,
        StoreError::InvalidName { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error(status, e)
}

/// Блокирующее чтение store-файла вне async worker'а.
async fn read_store<T, F>(f: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Json(value).into_response(),
        Ok(Err(e)) => store_error(e),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("reader task: {e}")),
    }
}

// ═══════════════════════════════════════════════════════════════
//  POST /api/records — одна запись или массив
// ═══════════════════════════════════════════════════════════════

#[derive(Serialize)]
struct PushResponse {
    accepted: Vec<EntryId>,
    /// Элементы, не ставшие `Record`: приняты как есть и уйдут в dead-letter.
    malformed: usize,
}

pub(crate) async fn handle_push_records(State(state): State<AppState>, body: Bytes) -> Response {
    let items = match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Array(items)) => items,
        Ok(single) => vec![single],
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid json: {e}")),
    };

    let mut response = PushResponse { accepted: Vec::with_capacity(items.len()), malformed: 0 };
    for item in items {
        let pushed = match serde_json::from_value::<Record>(item.clone()) {
            Ok(record) => state.buffer.enqueue(&record).await,
            Err(_) => {
                response.malformed += 1;
                state.buffer.enqueue_raw(item.to_string().into_bytes()).await
            }
        };
        match pushed {
            Ok(id) => response.accepted.push(id),
            Err(e @ BufferError::Full { .. }) => {
                // Принятое остаётся в буфере, producer повторяет остаток.
                tracing::debug!(accepted = response.accepted.len(), "buffer full, rejecting push");
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    [(header::RETRY_AFTER, state.retry_after_secs.to_string())],
                    Json(json!({ "error": e.to_string(), "accepted": response.accepted })),
                )
                    .into_response();
            }
            Err(e) => {
                tracing::error!(error = %e, "enqueue failed");
                return error(StatusCode::INTERNAL_SERVER_ERROR, e);
            }
        }
    }

    (StatusCode::ACCEPTED, Json(response)).into_response()
}

// ═══════════════════════════════════════════════════════════════
//  Observability
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_stats(State(state): State<AppState>) -> Response {
    match state.buffer.stats().await {
        Ok(buffer) => Json(json!({
            "buffer": buffer,
            "depth": buffer.depth(),
            "drainer": state.monitor.snapshot(),
        }))
        .into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

#[derive(Deserialize)]
pub(crate) struct LimitParams {
    limit: Option<usize>,
}

pub(crate) async fn handle_dead_letters(
    State(state): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Response {
    let limit = params.limit.unwrap_or(DEFAULT_DEAD_LETTERS);
    match state.buffer.dead_letters(limit).await {
        Ok(dead) => Json(dead).into_response(),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

pub(crate) async fn handle_health(State(state): State<AppState>) -> Response {
    Json(json!({
        "status": "ok",
        "drainer": state.monitor.state(),
        "leader": state.monitor.is_leader(),
    }))
    .into_response()
}

// ═══════════════════════════════════════════════════════════════
//  Reader: GET /api/stores[/{file}[/{table}?from=&to=&limit=]]
// ═══════════════════════════════════════════════════════════════

pub(crate) async fn handle_list_stores(State(state): State<AppState>) -> Response {
    let reader = state.reader.clone();
    read_store(move || reader.files()).await
}

pub(crate) async fn handle_describe_store(
    State(state): State<AppState>,
    Path(file): Path<String>,
) -> Response {
    let reader = state.reader.clone();
    read_store(move || {
        Ok(json!({
            "file": file,
            "tables": reader.tables(&file)?,
            "meta": reader.meta(&file)?,
            "stats": reader.table_stats(&file)?,
        }))
    })
    .await
}

#[derive(Deserialize)]
pub(crate) struct RangeParams {
    from: Option<i64>,
    to: Option<i64>,
    limit: Option<usize>,
}

pub(crate) async fn handle_read_table(
    State(state): State<AppState>,
    Path((file, table)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> Response {
    let reader = state.reader.clone();
    let limit = params.limit.unwrap_or(DEFAULT_ROWS).min(MAX_ROWS);
    read_store(move || reader.read_range(&file, &table, params.from, params.to, Some(limit))).await
}
