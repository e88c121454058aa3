use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;

use tickstore_api::{Fields, is_identifier};

use crate::{StoreConfig, StoreError};

/// Строка тикер-таблицы в виде, пригодном для отдачи наружу.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRow {
    pub ticker: String,
    pub ts_ms: i64,
    pub fields: Fields,
    pub provider: Option<String>,
    pub job_id: Option<String>,
    pub sequence: Option<i64>,
}

/// Запись `__table_stats__`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableStats {
    pub table: String,
    pub row_count: i64,
    pub min_ts_ms: Option<i64>,
    pub max_ts_ms: Option<i64>,
    pub min_date: Option<String>,
    pub max_date: Option<String>,
    pub updated_ms: i64,
}

// ═══════════════════════════════════════════════════════════════
//  StoreReader
// ═══════════════════════════════════════════════════════════════

/// Read-only доступ к store-файлам, мимо registry.
///
/// Каждый вызов открывает своё соединение с `query_only`: WAL позволяет
/// читать параллельно с writer'ом. Все методы блокирующие.
#[derive(Debug, Clone)]
pub struct StoreReader {
    data_dir: PathBuf,
    busy_timeout: Duration,
}

impl StoreReader {
    pub fn new(config: &StoreConfig) -> Self {
        Self { data_dir: config.data_dir.clone(), busy_timeout: config.busy_timeout() }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Идентификаторы store-файлов в `data_dir`, по алфавиту.
    pub fn files(&self) -> Result<Vec<String>, StoreError> {
        let io = |source| StoreError::Io { path: self.data_dir.display().to_string(), source };
        let entries = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io(e)),
        };
        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(io)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("db") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                files.push(stem.to_string());
            }
        }
        files.sort();
        Ok(files)
    }

    /// Тикер-таблицы файла (служебные `__*__` не включаются).
    pub fn tables(&self, file: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.open(file)?;
        list_tables(&conn).map_err(|e| StoreError::sqlite(file, e))
    }

    pub fn count(&self, file: &str, table: &str) -> Result<i64, StoreError> {
        let conn = self.open_table(file, table)?;
        conn.query_row(&format!("SELECT COUNT(*) FROM \"{table}\""), [], |r| r.get(0))
            .map_err(|e| StoreError::sqlite(file, e))
    }

    /// Строки с `from <= ts_ms < to`, по возрастанию времени.
    pub fn read_range(
        &self,
        file: &str,
        table: &str,
        from: Option<i64>,
        to: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<StoredRow>, StoreError> {
        let conn = self.open_table(file, table)?;
        let limit = limit.map(|l| l.min(i64::MAX as usize) as i64).unwrap_or(-1);
        query_rows(&conn, table, from.unwrap_or(i64::MIN), to.unwrap_or(i64::MAX), limit)
            .map_err(|e| StoreError::sqlite(file, e))
    }

    pub fn table_stats(&self, file: &str) -> Result<Vec<TableStats>, StoreError> {
        let conn = self.open(file)?;
        let sqlite = |e| StoreError::sqlite(file, e);
        if !has_table(&conn, "__table_stats__").map_err(sqlite)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(
                "SELECT table_name, row_count, min_ts_ms, max_ts_ms, min_date, max_date, updated_ms
                 FROM __table_stats__ ORDER BY table_name",
            )
            .map_err(sqlite)?;
        let rows = stmt
            .query_map([], |r| {
                Ok(TableStats {
                    table: r.get(0)?,
                    row_count: r.get(1)?,
                    min_ts_ms: r.get(2)?,
                    max_ts_ms: r.get(3)?,
                    min_date: r.get(4)?,
                    max_date: r.get(5)?,
                    updated_ms: r.get(6)?,
                })
            })
            .map_err(sqlite)?;
        rows.collect::<Result<_, _>>().map_err(sqlite)
    }

    /// Содержимое `__meta__`.
    pub fn meta(&self, file: &str) -> Result<BTreeMap<String, String>, StoreError> {
        let conn = self.open(file)?;
        let sqlite = |e| StoreError::sqlite(file, e);
        if !has_table(&conn, "__meta__").map_err(sqlite)? {
            return Ok(BTreeMap::new());
        }
        let mut stmt = conn.prepare("SELECT key, value FROM __meta__").map_err(sqlite)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))
            .map_err(sqlite)?;
        rows.collect::<Result<_, _>>().map_err(sqlite)
    }

    fn open(&self, file: &str) -> Result<Connection, StoreError> {
        if !is_identifier(file) {
            return Err(StoreError::InvalidName { context: "file", name: file.to_string() });
        }
        let path = self.data_dir.join(format!("{file}.db"));
        if !path.is_file() {
            return Err(StoreError::NotFound(file.to_string()));
        }
        let sqlite = |e| StoreError::sqlite(file, e);
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(sqlite)?;
        conn.busy_timeout(self.busy_timeout).map_err(sqlite)?;
        conn.execute_batch("PRAGMA query_only = ON;").map_err(sqlite)?;
        Ok(conn)
    }

    fn open_table(&self, file: &str, table: &str) -> Result<Connection, StoreError> {
        if !is_identifier(table) {
            return Err(StoreError::InvalidName { context: "table", name: table.to_string() });
        }
        let conn = self.open(file)?;
        if !has_table(&conn, table).map_err(|e| StoreError::sqlite(file, e))? {
            return Err(StoreError::NotFound(format!("{file}/{table}")));
        }
        Ok(conn)
    }
}

fn has_table(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |_| Ok(()),
    )
    .optional()
    .map(|found| found.is_some())
}

fn list_tables(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master
         WHERE type = 'table' AND name NOT LIKE '\\_\\_%' ESCAPE '\\' AND name NOT LIKE 'sqlite\\_%' ESCAPE '\\'
         ORDER BY name",
    )?;
    let rows = stmt.query_map([], |r| r.get(0))?;
    rows.collect()
}

fn json_value(value: ValueRef<'_>) -> serde_json::Value {
    match value {
        ValueRef::Null => serde_json::Value::Null,
        ValueRef::Integer(i) => i.into(),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
        ValueRef::Blob(b) => b.to_vec().into(),
    }
}

fn query_rows(
    conn: &Connection,
    table: &str,
    from: i64,
    to: i64,
    limit: i64,
) -> rusqlite::Result<Vec<StoredRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM \"{table}\" WHERE \"ts_ms\" >= ?1 AND \"ts_ms\" < ?2
         ORDER BY \"ts_ms\", \"ticker\" LIMIT ?3"
    ))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    let mut rows = stmt.query(params![from, to, limit])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut stored = StoredRow {
            ticker: String::new(),
            ts_ms: 0,
            fields: Fields::new(),
            provider: None,
            job_id: None,
            sequence: None,
        };
        for (i, name) in names.iter().enumerate() {
            match name.as_str() {
                "ticker" => stored.ticker = row.get(i)?,
                "ts_ms" => stored.ts_ms = row.get(i)?,
                "provider" => stored.provider = row.get(i)?,
                "job_id" => stored.job_id = row.get(i)?,
                "sequence" => stored.sequence = row.get(i)?,
                _ => {
                    stored.fields.insert(name.clone(), json_value(row.get_ref(i)?));
                }
            }
        }
        out.push(stored);
    }
    Ok(out)
}
