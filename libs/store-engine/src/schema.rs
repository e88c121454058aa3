use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use tickstore_api::{Record, is_identifier};

use crate::StoreError;

/// Системные колонки каждой тикер-таблицы. Поля записи с такими
/// именами отклоняются.
pub const RESERVED_COLUMNS: [&str; 5] = ["ticker", "ts_ms", "provider", "job_id", "sequence"];

pub(crate) fn is_reserved(name: &str) -> bool {
    RESERVED_COLUMNS.iter().any(|r| r.eq_ignore_ascii_case(name))
}

// ════════════════════════════════════════════════════════════════
//  Column Type
// ════════════════════════════════════════════════════════════════

/// Типы колонок STRICT-таблиц SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Integer,
    Real,
    Text,
    Blob,
    /// Тип не удалось вывести (только null'ы) — колонка без ограничения.
    Any,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
            ColumnType::Blob => "BLOB",
            ColumnType::Any => "ANY",
        }
    }

    /// Из `PRAGMA table_info(...).type`.
    pub fn from_sql(decl: &str) -> Self {
        match decl.to_ascii_uppercase().as_str() {
            "INTEGER" | "INT" => ColumnType::Integer,
            "REAL" => ColumnType::Real,
            "TEXT" => ColumnType::Text,
            "BLOB" => ColumnType::Blob,
            _ => ColumnType::Any,
        }
    }

    /// Вывести тип по значению: bool → INTEGER, любое число → REAL,
    /// string/object/array → TEXT, null → ANY.
    ///
    /// JSON не различает `100` и `100.0`, поэтому выведенная числовая
    /// колонка всегда REAL. INTEGER для чисел задаётся только формой.
    pub fn infer(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ColumnType::Any,
            serde_json::Value::Bool(_) => ColumnType::Integer,
            serde_json::Value::Number(_) => ColumnType::Real,
            serde_json::Value::String(_)
            | serde_json::Value::Array(_)
            | serde_json::Value::Object(_) => ColumnType::Text,
        }
    }
}

impl ColumnType {
    /// Общий тип для двух выведенных значений одной колонки. `Any`
    /// уступает любому типу, INTEGER расширяется до REAL; прочие
    /// сочетания оставляют первый тип.
    pub fn widen(self, other: ColumnType) -> ColumnType {
        match (self, other) {
            (ColumnType::Any, t) => t,
            (ColumnType::Integer, ColumnType::Real) => ColumnType::Real,
            (t, _) => t,
        }
    }
}

impl std::fmt::Display for ColumnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.sql())
    }
}

// ════════════════════════════════════════════════════════════════
//  Shapes
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub column_type: ColumnType,
    /// NOT NULL. Применяется только при создании таблицы.
    #[serde(default)]
    pub required: bool,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self { name: name.into(), column_type, required: false }
    }
}

/// Объявленная форма записей (`[[schemas]]` в конфиге), например `ohlcv`.
#[derive(Debug, Clone, Deserialize)]
pub struct ShapeConfig {
    pub name: String,
    #[serde(default = "default_shape_version")]
    pub version: u32,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
}

fn default_shape_version() -> u32 {
    1
}

/// Колонки данных для конкретного batch'а: объявленные формой плюс
/// выведенные из полей записей.
#[derive(Debug, Clone, PartialEq)]
pub struct TableSchema {
    pub version: u32,
    pub columns: Vec<ColumnDef>,
}

// ════════════════════════════════════════════════════════════════
//  Schema Registry
// ════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    shapes: HashMap<String, ShapeConfig>,
}

impl SchemaRegistry {
    pub fn new(shapes: Vec<ShapeConfig>) -> Result<Self, StoreError> {
        let mut map = HashMap::new();
        for shape in shapes {
            for col in &shape.columns {
                if !is_identifier(&col.name) {
                    return Err(StoreError::InvalidName { context: "column", name: col.name.clone() });
                }
                if is_reserved(&col.name) {
                    return Err(StoreError::Schema(format!(
                        "shape '{}': column '{}' is reserved",
                        shape.name, col.name
                    )));
                }
            }
            if map.contains_key(&shape.name) {
                return Err(StoreError::Schema(format!("duplicate shape '{}'", shape.name)));
            }
            map.insert(shape.name.clone(), shape);
        }
        Ok(Self { shapes: map })
    }

    pub fn get(&self, name: &str) -> Option<&ShapeConfig> {
        self.shapes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.shapes.contains_key(name)
    }

    /// Собрать схему таблицы для набора записей.
    ///
    /// Недопустимые и зарезервированные имена полей пропускаются: такие
    /// записи отклонит writer построчно.
    pub fn resolve<'a>(
        &self,
        shape: Option<&str>,
        records: impl IntoIterator<Item = &'a Record>,
    ) -> Result<TableSchema, StoreError> {
        let (version, mut columns) = match shape {
            Some(name) => {
                let shape = self
                    .get(name)
                    .ok_or_else(|| StoreError::Schema(format!("unknown shape '{name}'")))?;
                (shape.version, shape.columns.clone())
            }
            None => (1, Vec::new()),
        };
        let declared = columns.len();
        let mut index: HashMap<String, usize> =
            columns.iter().enumerate().map(|(i, c)| (c.name.clone(), i)).collect();

        for record in records {
            for (name, value) in &record.fields {
                if !is_identifier(name) || is_reserved(name) {
                    continue;
                }
                let inferred = ColumnType::infer(value);
                match index.get(name) {
                    // Выведенная по null'ам колонка уточняется первым непустым значением.
                    Some(&i) if i >= declared => {
                        columns[i].column_type = columns[i].column_type.widen(inferred);
                    }
                    Some(_) => {}
                    None => {
                        index.insert(name.clone(), columns.len());
                        columns.push(ColumnDef::new(name.clone(), inferred));
                    }
                }
            }
        }

        Ok(TableSchema { version, columns })
    }
}
