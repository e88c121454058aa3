use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior, params, params_from_iter};

use tickstore_api::{
    Batch, BatchSink, FailureKind, Record, RowFailure, WriteError, WriteResult, date_from_ms,
    is_identifier, now_ms,
};

use crate::schema::is_reserved;
use crate::{ColumnType, SchemaRegistry, StoreRegistry, TableSchema};

const HOUSEKEEPING: &str = "
CREATE TABLE IF NOT EXISTS __meta__ (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS __schema__ (
    table_name  TEXT PRIMARY KEY,
    version     INTEGER NOT NULL,
    columns     TEXT    NOT NULL,
    updated_ms  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS __table_stats__ (
    table_name  TEXT PRIMARY KEY,
    row_count   INTEGER NOT NULL,
    min_ts_ms   INTEGER,
    max_ts_ms   INTEGER,
    min_date    TEXT,
    max_date    TEXT,
    updated_ms  INTEGER NOT NULL
);
";

fn unavailable(file: &str, detail: impl std::fmt::Display) -> WriteError {
    WriteError::StoreUnavailable { file: file.to_string(), detail: detail.to_string() }
}

// ═══════════════════════════════════════════════════════════════
//  SqliteBatchWriter
// ═══════════════════════════════════════════════════════════════

/// Транзакционная запись batch'ей в store-файлы.
///
/// Один batch = одна IMMEDIATE транзакция; каждая строка — в своём
/// SAVEPOINT, так что нарушение ограничения откатывает только её.
/// Upsert по `(ticker, ts_ms)`: повторная доставка не меняет данных.
pub struct SqliteBatchWriter {
    registry: StoreRegistry,
    schemas: Arc<SchemaRegistry>,
    write_timeout: Duration,
}

impl SqliteBatchWriter {
    pub fn new(registry: StoreRegistry, schemas: Arc<SchemaRegistry>, write_timeout: Duration) -> Self {
        Self { registry, schemas, write_timeout }
    }

    pub fn registry(&self) -> &StoreRegistry {
        &self.registry
    }

    async fn write_batch(&self, batch: Batch) -> Result<WriteResult, WriteError> {
        let file = batch.target.file.clone();
        if !is_identifier(&batch.target.table) {
            return Err(unavailable(&file, format!("invalid table name '{}'", batch.target.table)));
        }
        let schema = self
            .schemas
            .resolve(batch.shape.as_deref(), batch.items.iter().map(|i| &i.record))
            .map_err(|e| unavailable(&file, e))?;

        let mut handle = self.registry.acquire(&file).await.map_err(|e| unavailable(&file, e))?;
        let interrupt = handle.interrupt_handle();

        // Handle уезжает в blocking-поток и освобождается там же, даже
        // если этот future уже отменён таймаутом.
        let task = tokio::task::spawn_blocking(move || {
            let result = commit_batch(handle.connection(), &batch, &schema);
            drop(handle);
            result
        });

        match tokio::time::timeout(self.write_timeout, task).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(e))) => Err(unavailable(&file, e)),
            Ok(Err(e)) => Err(unavailable(&file, format!("write task: {e}"))),
            Err(_) => {
                // Прерванный запрос откатывает всю транзакцию.
                interrupt.interrupt();
                Err(WriteError::Timeout {
                    file,
                    timeout_ms: self.write_timeout.as_millis() as u64,
                })
            }
        }
    }
}

impl BatchSink for SqliteBatchWriter {
    fn write(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = Result<WriteResult, WriteError>> + Send + '_>>
    {
        Box::pin(self.write_batch(batch))
    }

    fn close_idle(&self) -> Pin<Box<dyn Future<Output = usize> + Send + '_>> {
        Box::pin(async move { self.registry.close_idle() })
    }

    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(self.registry.shutdown())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Transaction body (blocking)
// ═══════════════════════════════════════════════════════════════

enum RowOutcome {
    Inserted,
    Updated,
    Unchanged,
}

fn commit_batch(
    conn: &mut Connection,
    batch: &Batch,
    schema: &TableSchema,
) -> rusqlite::Result<WriteResult> {
    let table = batch.target.table.as_str();
    let mut tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(HOUSEKEEPING)?;
    seed_meta(&tx, batch)?;
    let columns = ensure_table(&tx, table, schema)?;

    let mut result = WriteResult::default();
    for item in &batch.items {
        if let Err(reason) = validate_row(&item.record, &columns) {
            result.rows_failed.push(RowFailure {
                entry_id: item.entry_id,
                record: item.record.clone(),
                kind: FailureKind::Malformed,
                reason,
            });
            continue;
        }

        let sp = tx.savepoint()?;
        match upsert_row(&sp, table, &item.record) {
            Ok(outcome) => {
                sp.commit()?;
                match outcome {
                    RowOutcome::Inserted => result.rows_inserted += 1,
                    RowOutcome::Updated => result.rows_updated += 1,
                    RowOutcome::Unchanged => result.rows_unchanged += 1,
                }
            }
            Err(e) if is_row_error(&e) => {
                // Drop savepoint'а = ROLLBACK TO + RELEASE.
                drop(sp);
                result.rows_failed.push(RowFailure {
                    entry_id: item.entry_id,
                    record: item.record.clone(),
                    kind: FailureKind::WriteConflict,
                    reason: e.to_string(),
                });
            }
            Err(e) => return Err(e),
        }
    }
    result.rows_committed = result.rows_inserted + result.rows_updated + result.rows_unchanged;

    if result.rows_committed > 0 {
        update_table_stats(&tx, table)?;
    }
    tx.commit()?;

    tracing::debug!(
        batch = %batch.id,
        target = %batch.target,
        inserted = result.rows_inserted,
        updated = result.rows_updated,
        unchanged = result.rows_unchanged,
        failed = result.rows_failed.len(),
        "batch committed"
    );
    Ok(result)
}

fn is_row_error(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation)
}

fn validate_row(record: &Record, columns: &HashMap<String, ColumnType>) -> Result<(), String> {
    for name in record.fields.keys() {
        if !is_identifier(name) {
            return Err(format!("invalid field name '{name}'"));
        }
        if is_reserved(name) {
            return Err(format!("field '{name}' collides with a reserved column"));
        }
        if !columns.contains_key(name) {
            return Err(format!("field '{name}' has no column"));
        }
    }
    Ok(())
}

fn seed_meta(tx: &Transaction<'_>, batch: &Batch) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT OR IGNORE INTO __meta__ (key, value) VALUES ('created_ms', ?1)",
        params![now_ms().to_string()],
    )?;
    let mut stmt = tx.prepare_cached("INSERT OR REPLACE INTO __meta__ (key, value) VALUES (?1, ?2)")?;
    stmt.execute(params!["file_id", batch.target.file])?;
    for (key, value) in &batch.meta {
        stmt.execute(params![key, value])?;
    }
    Ok(())
}

fn table_columns(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<HashMap<String, ColumnType>> {
    let mut stmt = tx.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let rows = stmt.query_map([], |r| {
        let name: String = r.get(1)?;
        let decl: String = r.get(2)?;
        Ok((name, ColumnType::from_sql(&decl)))
    })?;
    rows.collect()
}

/// Создать таблицу или добавить недостающие колонки. Возвращает
/// итоговый набор колонок.
fn ensure_table(
    tx: &Transaction<'_>,
    table: &str,
    schema: &TableSchema,
) -> rusqlite::Result<HashMap<String, ColumnType>> {
    let existing = table_columns(tx, table)?;

    if existing.is_empty() {
        let mut defs = vec![
            "\"ticker\" TEXT NOT NULL".to_string(),
            "\"ts_ms\" INTEGER NOT NULL".to_string(),
        ];
        for col in &schema.columns {
            let not_null = if col.required { " NOT NULL" } else { "" };
            defs.push(format!("\"{}\" {}{not_null}", col.name, col.column_type.sql()));
        }
        defs.push("\"provider\" TEXT".into());
        defs.push("\"job_id\" TEXT".into());
        defs.push("\"sequence\" INTEGER".into());
        defs.push("PRIMARY KEY (\"ticker\", \"ts_ms\")".into());
        tx.execute_batch(&format!("CREATE TABLE \"{table}\" ({}) STRICT;", defs.join(", ")))?;

        let columns = table_columns(tx, table)?;
        record_schema(tx, table, schema.version, &columns, false)?;
        tracing::info!(table, version = schema.version, columns = schema.columns.len(), "created table");
        return Ok(columns);
    }

    let widened: Vec<&str> = schema
        .columns
        .iter()
        .filter(|c| {
            c.column_type == ColumnType::Real && existing.get(&c.name) == Some(&ColumnType::Integer)
        })
        .map(|c| c.name.as_str())
        .collect();
    let missing: Vec<_> = schema
        .columns
        .iter()
        .filter(|c| !existing.contains_key(&c.name))
        .collect();
    if missing.is_empty() && widened.is_empty() {
        return Ok(existing);
    }
    if !widened.is_empty() {
        widen_to_real(tx, table, &widened)?;
    }
    for col in &missing {
        tx.execute_batch(&format!(
            "ALTER TABLE \"{table}\" ADD COLUMN \"{}\" {};",
            col.name,
            col.column_type.sql()
        ))?;
    }
    let columns = table_columns(tx, table)?;
    record_schema(tx, table, schema.version, &columns, true)?;
    tracing::info!(
        table,
        added = ?missing.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
        widened = ?widened,
        "schema evolved"
    );
    Ok(columns)
}

/// STRICT-колонку не поменять через ALTER: таблица пересоздаётся с
/// REAL на месте INTEGER, строки копируются (целые приводятся к REAL).
fn widen_to_real(tx: &Transaction<'_>, table: &str, widened: &[&str]) -> rusqlite::Result<()> {
    let defs = tx
        .prepare(&format!("PRAGMA table_info(\"{table}\")"))?
        .query_map([], |r| {
            let name: String = r.get(1)?;
            let decl: String = r.get(2)?;
            let not_null: bool = r.get(3)?;
            Ok((name, decl, not_null))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut cols: Vec<String> = defs
        .iter()
        .map(|(name, decl, not_null)| {
            let decl = if widened.contains(&name.as_str()) { "REAL" } else { decl.as_str() };
            let not_null = if *not_null { " NOT NULL" } else { "" };
            format!("\"{name}\" {decl}{not_null}")
        })
        .collect();
    cols.push("PRIMARY KEY (\"ticker\", \"ts_ms\")".into());

    let tmp = format!("{table}__widen");
    tx.execute_batch(&format!(
        "CREATE TABLE \"{tmp}\" ({}) STRICT;
         INSERT INTO \"{tmp}\" SELECT * FROM \"{table}\";
         DROP TABLE \"{table}\";
         ALTER TABLE \"{tmp}\" RENAME TO \"{table}\";",
        cols.join(", ")
    ))?;
    tracing::info!(table, columns = ?widened, "widened INTEGER columns to REAL");
    Ok(())
}

fn record_schema(
    tx: &Transaction<'_>,
    table: &str,
    version: u32,
    columns: &HashMap<String, ColumnType>,
    bump: bool,
) -> rusqlite::Result<()> {
    let mut described: Vec<(&String, &ColumnType)> = columns.iter().collect();
    described.sort_by(|a, b| a.0.cmp(b.0));
    let described = serde_json::to_string(&described).unwrap_or_default();
    let sql = if bump {
        "INSERT INTO __schema__ (table_name, version, columns, updated_ms) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (table_name) DO UPDATE
         SET version = version + 1, columns = excluded.columns, updated_ms = excluded.updated_ms"
    } else {
        "INSERT OR REPLACE INTO __schema__ (table_name, version, columns, updated_ms)
         VALUES (?1, ?2, ?3, ?4)"
    };
    tx.execute(sql, params![table, version, described, now_ms()])?;
    Ok(())
}

fn sql_value(value: &serde_json::Value) -> SqlValue {
    match value {
        serde_json::Value::Null => SqlValue::Null,
        serde_json::Value::Bool(b) => SqlValue::Integer(*b as i64),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// INSERT ... DO NOTHING; при конфликте — UPDATE только если данные
/// отличаются. Так точный дубликат не пишет ничего.
fn upsert_row(conn: &Connection, table: &str, record: &Record) -> rusqlite::Result<RowOutcome> {
    let names: Vec<&String> = record.fields.keys().collect();

    let mut values = vec![
        SqlValue::Text(record.ticker.clone()),
        SqlValue::Integer(record.ts_ms),
        SqlValue::Text(record.provenance.provider.clone()),
        SqlValue::Text(record.provenance.job_id.clone()),
        SqlValue::Integer(record.provenance.sequence as i64),
    ];
    values.extend(record.fields.values().map(sql_value));

    let mut cols = vec!["\"ticker\"", "\"ts_ms\"", "\"provider\"", "\"job_id\"", "\"sequence\""]
        .into_iter()
        .map(String::from)
        .collect::<Vec<_>>();
    cols.extend(names.iter().map(|n| format!("\"{n}\"")));
    let placeholders: Vec<String> = (1..=cols.len()).map(|i| format!("?{i}")).collect();

    let insert = format!(
        "INSERT INTO \"{table}\" ({}) VALUES ({}) ON CONFLICT (\"ticker\", \"ts_ms\") DO NOTHING",
        cols.join(", "),
        placeholders.join(", ")
    );
    if conn.prepare_cached(&insert)?.execute(params_from_iter(values.iter()))? == 1 {
        return Ok(RowOutcome::Inserted);
    }
    if names.is_empty() {
        return Ok(RowOutcome::Unchanged);
    }

    let sets: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, n)| format!("\"{n}\" = ?{}", i + 6))
        .collect();
    let differs: Vec<String> = names
        .iter()
        .enumerate()
        .map(|(i, n)| format!("\"{n}\" IS NOT ?{}", i + 6))
        .collect();
    let update = format!(
        "UPDATE \"{table}\" SET \"provider\" = ?3, \"job_id\" = ?4, \"sequence\" = ?5, {}
         WHERE \"ticker\" = ?1 AND \"ts_ms\" = ?2 AND ({})",
        sets.join(", "),
        differs.join(" OR ")
    );
    let changed = conn.prepare_cached(&update)?.execute(params_from_iter(values.iter()))?;
    Ok(if changed == 1 { RowOutcome::Updated } else { RowOutcome::Unchanged })
}

fn update_table_stats(tx: &Transaction<'_>, table: &str) -> rusqlite::Result<()> {
    let (count, min_ts, max_ts): (i64, Option<i64>, Option<i64>) = tx.query_row(
        &format!("SELECT COUNT(*), MIN(\"ts_ms\"), MAX(\"ts_ms\") FROM \"{table}\""),
        [],
        |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
    )?;
    tx.execute(
        "INSERT INTO __table_stats__
             (table_name, row_count, min_ts_ms, max_ts_ms, min_date, max_date, updated_ms)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (table_name) DO UPDATE SET
             row_count = excluded.row_count,
             min_ts_ms = excluded.min_ts_ms,
             max_ts_ms = excluded.max_ts_ms,
             min_date = excluded.min_date,
             max_date = excluded.max_date,
             updated_ms = excluded.updated_ms",
        params![
            table,
            count,
            min_ts,
            max_ts,
            min_ts.map(date_from_ms),
            max_ts.map(date_from_ms),
            now_ms()
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use tickstore_api::{BatchId, BatchItem, EntryId, Fields, Provenance, RouteTarget};

    use super::*;
    use crate::{ShapeConfig, StoreConfig, StoreReader};

    fn record(ticker: &str, ts_ms: i64, fields: serde_json::Value) -> Record {
        let fields: Fields = serde_json::from_value(fields).unwrap();
        Record::new(ticker, ts_ms, fields, Provenance {
            provider: "polygon".into(),
            job_id: "backfill-1".into(),
            sequence: ts_ms as u64,
        })
    }

    fn batch(id: u64, shape: Option<&str>, records: Vec<Record>) -> Batch {
        Batch {
            id: BatchId(id),
            target: RouteTarget { file: "intraday_polygon_XNAS".into(), table: "AAPL".into() },
            shape: shape.map(String::from),
            meta: BTreeMap::from([("provider".to_string(), "polygon".to_string())]),
            items: records
                .into_iter()
                .enumerate()
                .map(|(i, record)| BatchItem { entry_id: EntryId(i as u64 + 1), record })
                .collect(),
        }
    }

    fn setup(dir: &std::path::Path) -> (SqliteBatchWriter, StoreReader) {
        let config = StoreConfig { data_dir: dir.to_path_buf(), ..StoreConfig::default() };
        let shape: ShapeConfig = serde_json::from_value(json!({
            "name": "ohlcv",
            "columns": [
                {"name": "open", "type": "real"},
                {"name": "close", "type": "real"},
                {"name": "volume", "type": "integer"}
            ]
        }))
        .unwrap();
        let schemas = Arc::new(SchemaRegistry::new(vec![shape]).unwrap());
        let registry = StoreRegistry::new(&config).unwrap();
        let writer = SqliteBatchWriter::new(registry, schemas, Duration::from_secs(5));
        (writer, StoreReader::new(&config))
    }

    #[tokio::test]
    async fn redelivery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());
        let rows = vec![
            record("AAPL", 1000, json!({"open": 1.0, "close": 2.0, "volume": 10})),
            record("AAPL", 2000, json!({"open": 2.0, "close": 3.0, "volume": 20})),
        ];

        let first = writer.write(batch(1, Some("ohlcv"), rows.clone())).await.unwrap();
        assert_eq!(first.rows_inserted, 2);

        let second = writer.write(batch(2, Some("ohlcv"), rows)).await.unwrap();
        assert_eq!(second.rows_committed, 2);
        assert_eq!(second.rows_unchanged, 2);
        assert_eq!(second.rows_inserted + second.rows_updated, 0);

        assert_eq!(reader.count("intraday_polygon_XNAS", "AAPL").unwrap(), 2);
        let stored = reader.read_range("intraday_polygon_XNAS", "AAPL", None, None, None).unwrap();
        assert_eq!(stored[1].fields["close"], json!(3.0));
        assert_eq!(stored[1].provider.as_deref(), Some("polygon"));
    }

    #[tokio::test]
    async fn changed_values_update_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());
        writer
            .write(batch(1, Some("ohlcv"), vec![record("AAPL", 1000, json!({"close": 2.0}))]))
            .await
            .unwrap();
        let result = writer
            .write(batch(2, Some("ohlcv"), vec![record("AAPL", 1000, json!({"close": 2.5}))]))
            .await
            .unwrap();
        assert_eq!(result.rows_updated, 1);

        let stored = reader.read_range("intraday_polygon_XNAS", "AAPL", None, None, None).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].fields["close"], json!(2.5));
    }

    #[tokio::test]
    async fn bad_row_is_isolated_from_the_rest_of_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());
        let result = writer
            .write(batch(1, Some("ohlcv"), vec![
                record("AAPL", 1000, json!({"volume": 10})),
                // STRICT: текст в INTEGER колонку — нарушение ограничения.
                record("AAPL", 2000, json!({"volume": "lots"})),
                record("AAPL", 3000, json!({"sequence": 5})),
                record("AAPL", 4000, json!({"volume": 40})),
            ]))
            .await
            .unwrap();

        assert_eq!(result.rows_committed, 2);
        assert_eq!(result.rows_failed.len(), 2);
        assert_eq!(result.rows_failed[0].entry_id, EntryId(2));
        assert_eq!(result.rows_failed[0].kind, FailureKind::WriteConflict);
        assert_eq!(result.rows_failed[1].entry_id, EntryId(3));
        assert_eq!(result.rows_failed[1].kind, FailureKind::Malformed);

        let ts: Vec<i64> = reader
            .read_range("intraday_polygon_XNAS", "AAPL", None, None, None)
            .unwrap()
            .iter()
            .map(|r| r.ts_ms)
            .collect();
        assert_eq!(ts, [1000, 4000]);
    }

    #[tokio::test]
    async fn new_fields_evolve_the_table() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());
        writer.write(batch(1, None, vec![record("AAPL", 1, json!({"bid": 1.5}))])).await.unwrap();
        writer
            .write(batch(2, None, vec![record("AAPL", 2, json!({"bid": 1.6, "ask": 1.7, "halted": false}))]))
            .await
            .unwrap();

        let stored = reader.read_range("intraday_polygon_XNAS", "AAPL", None, None, None).unwrap();
        assert_eq!(stored[0].fields["ask"], json!(null));
        assert_eq!(stored[1].fields["ask"], json!(1.7));
        assert_eq!(stored[1].fields["halted"], json!(0));

        let stats = reader.table_stats("intraday_polygon_XNAS").unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].row_count, stats[0].min_ts_ms, stats[0].max_ts_ms), (2, Some(1), Some(2)));

        let meta = reader.meta("intraday_polygon_XNAS").unwrap();
        assert_eq!(meta.get("provider").map(String::as_str), Some("polygon"));
        assert!(meta.contains_key("created_ms"));
    }

    #[tokio::test]
    async fn unavailable_store_fails_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, _) = setup(dir.path());
        // Каталог на месте файла: SQLite не откроет его.
        std::fs::create_dir(dir.path().join("intraday_polygon_XNAS.db")).unwrap();
        let err = writer
            .write(batch(1, None, vec![record("AAPL", 1, json!({"bid": 1.0}))]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), FailureKind::StoreUnavailable);
    }

    #[tokio::test]
    async fn whole_then_fractional_numbers_share_a_column() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());

        let same_batch = writer
            .write(batch(1, None, vec![
                record("AAPL", 1, json!({"close": 100})),
                record("AAPL", 2, json!({"close": 100.5})),
            ]))
            .await
            .unwrap();
        assert_eq!(same_batch.rows_committed, 2);
        assert!(same_batch.rows_failed.is_empty());

        let next_batch = writer
            .write(batch(2, None, vec![record("AAPL", 3, json!({"close": 101.25}))]))
            .await
            .unwrap();
        assert_eq!(next_batch.rows_committed, 1);
        assert!(next_batch.rows_failed.is_empty());

        let closes: Vec<serde_json::Value> = reader
            .read_range("intraday_polygon_XNAS", "AAPL", None, None, None)
            .unwrap()
            .into_iter()
            .map(|r| r.fields["close"].clone())
            .collect();
        assert_eq!(closes, [json!(100.0), json!(100.5), json!(101.25)]);
    }

    #[tokio::test]
    async fn integer_column_widens_to_real_across_batches() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader) = setup(dir.path());
        writer.write(batch(1, None, vec![record("AAPL", 1, json!({"halted": true}))])).await.unwrap();

        let result = writer
            .write(batch(2, None, vec![record("AAPL", 2, json!({"halted": 0.5}))]))
            .await
            .unwrap();
        assert_eq!(result.rows_committed, 1);
        assert!(result.rows_failed.is_empty());

        let stored = reader.read_range("intraday_polygon_XNAS", "AAPL", None, None, None).unwrap();
        assert_eq!(stored[0].fields["halted"], json!(1.0));
        assert_eq!(stored[1].fields["halted"], json!(0.5));
        assert_eq!(reader.tables("intraday_polygon_XNAS").unwrap(), ["AAPL"]);

        let conn = rusqlite::Connection::open(dir.path().join("intraday_polygon_XNAS.db")).unwrap();
        let (version, columns): (u32, String) = conn
            .query_row("SELECT version, columns FROM __schema__ WHERE table_name = 'AAPL'", [], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(version, 2);
        assert!(columns.contains(r#"["halted","real"]"#));
    }
}
