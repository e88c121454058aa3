use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ════════════════════════════════════════════════════════════════
//  Record
// ════════════════════════════════════════════════════════════════

/// Упорядоченный набор полей записи (порядок вставки сохраняется).
pub type Fields = serde_json::Map<String, serde_json::Value>;

/// Происхождение записи: какой провайдер и какая задача её произвели.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub provider: String,
    pub job_id: String,
    /// Порядковый номер внутри задачи-производителя.
    #[serde(default)]
    pub sequence: u64,
}

/// Одна нормализованная точка данных по инструменту.
///
/// Неизменяема после создания. Натуральный ключ — `(ticker, ts_ms)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub ticker: String,
    /// Timestamp в миллисекундах (Unix epoch).
    #[serde(alias = "timestamp")]
    pub ts_ms: i64,
    #[serde(default)]
    pub fields: Fields,
    pub provenance: Provenance,
}

impl Record {
    pub fn new(ticker: impl Into<String>, ts_ms: i64, fields: Fields, provenance: Provenance) -> Self {
        Self {
            ticker: ticker.into(),
            ts_ms,
            fields,
            provenance,
        }
    }

    /// Сериализация в wire-формат буфера (JSON).
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Десериализация из wire-формата буфера.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

// ════════════════════════════════════════════════════════════════
//  Buffer Entry
// ════════════════════════════════════════════════════════════════

/// Идентификатор записи в буфере. Монотонно растёт в порядке enqueue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Состояние доставки. Переходы только вперёд:
/// `Pending → InFlight → Committed`; откат `InFlight → Pending`
/// возможен только через requeue или recover.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Committed,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::InFlight => "in_flight",
            DeliveryState::Committed => "committed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DeliveryState::Pending),
            "in_flight" => Some(DeliveryState::InFlight),
            "committed" => Some(DeliveryState::Committed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Запись, выданная drainer'у из буфера.
#[derive(Clone, Debug)]
pub struct BufferEntry {
    pub id: EntryId,
    pub record: Record,
    pub enqueued_ms: i64,
    pub state: DeliveryState,
    /// Количество неудачных попыток записи до текущей выдачи.
    pub attempts: u32,
    pub claimed_by: Option<String>,
}

/// Какие in-flight записи вернуть в pending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RecoverScope {
    /// Все in-flight (старт единственного процесса).
    All,
    /// Взятые раньше указанного момента (lease-timeout детектор).
    ClaimedBefore(i64),
    /// Взятые кем угодно, кроме указанного consumer'а (takeover).
    NotClaimedBy(String),
    /// Конкретные записи, до которых цикл не дошёл.
    Entries(Vec<EntryId>),
}

// ════════════════════════════════════════════════════════════════
//  Failures & Retry
// ════════════════════════════════════════════════════════════════

/// Категория сбоя. Определяет, повторять ли запись или сразу
/// отправить её в dead-letter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Payload не десериализуется или нарушает формат записи.
    Malformed,
    /// Router не знает, куда писать запись.
    Unroutable,
    /// Строка нарушила ограничение таблицы.
    WriteConflict,
    /// Файл, блокировка или диск недоступны.
    StoreUnavailable,
    /// Запись или цикл не уложились в таймаут.
    Timeout,
}

impl FailureKind {
    /// Malformed и Unroutable не лечатся повтором.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, FailureKind::Malformed | FailureKind::Unroutable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Malformed => "malformed",
            FailureKind::Unroutable => "unroutable",
            FailureKind::WriteConflict => "write_conflict",
            FailureKind::StoreUnavailable => "store_unavailable",
            FailureKind::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "malformed" => Some(FailureKind::Malformed),
            "unroutable" => Some(FailureKind::Unroutable),
            "write_conflict" => Some(FailureKind::WriteConflict),
            "store_unavailable" => Some(FailureKind::StoreUnavailable),
            "timeout" => Some(FailureKind::Timeout),
            _ => None,
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Сбой обработки конкретной записи буфера.
#[derive(Clone, Debug)]
pub struct Failure {
    pub entry_id: EntryId,
    pub kind: FailureKind,
    pub reason: String,
}

impl Failure {
    pub fn new(entry_id: EntryId, kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            entry_id,
            kind,
            reason: reason.into(),
        }
    }
}

/// Политика повторов: экспоненциальный backoff с потолком.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// После стольких неудач запись уходит в dead-letter.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    /// Задержка перед следующей выдачей после `attempts` неудач.
    pub fn backoff_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(20);
        self.base_backoff_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_backoff_ms)
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 200,
            max_backoff_ms: 10_000,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RequeueOutcome {
    pub requeued: usize,
    pub dead_lettered: usize,
}

/// Запись dead-letter трассы. Payload хранится как есть (для malformed
/// это единственная копия исходных байтов).
#[derive(Clone, Debug, Serialize)]
pub struct DeadLetter {
    pub entry_id: EntryId,
    pub kind: FailureKind,
    pub reason: String,
    pub attempts: u32,
    pub enqueued_ms: i64,
    pub recorded_ms: i64,
    pub payload: String,
}

/// Снимок состояния буфера для мониторинга.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    pub pending: u64,
    pub in_flight: u64,
    pub dead_letters: u64,
    pub committed_total: u64,
    pub capacity: u64,
}

impl BufferStats {
    /// Глубина буфера: всё, что ещё не подтверждено.
    pub fn depth(&self) -> u64 {
        self.pending + self.in_flight
    }
}

// ════════════════════════════════════════════════════════════════
//  Batch
// ════════════════════════════════════════════════════════════════

/// Цель записи: store-file и таблица внутри него.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RouteTarget {
    pub file: String,
    pub table: String,
}

impl std::fmt::Display for RouteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.file, self.table)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub u64);

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct BatchItem {
    pub entry_id: EntryId,
    pub record: Record,
}

/// Группа записей для одной `(file, table)`, коммитится одной транзакцией.
/// Существует только в рамках drain-цикла.
#[derive(Clone, Debug)]
pub struct Batch {
    pub id: BatchId,
    pub target: RouteTarget,
    /// Имя формы (shape) в schema registry. None — схема выводится из значений.
    pub shape: Option<String>,
    /// Метаданные группы для `__meta__` store-файла (provider, exchange, ...).
    pub meta: BTreeMap<String, String>,
    /// В порядке enqueue.
    pub items: Vec<BatchItem>,
}

impl Batch {
    pub fn entry_ids(&self) -> Vec<EntryId> {
        self.items.iter().map(|i| i.entry_id).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Строка, изолированная внутри транзакции.
#[derive(Clone, Debug)]
pub struct RowFailure {
    pub entry_id: EntryId,
    pub record: Record,
    pub kind: FailureKind,
    pub reason: String,
}

/// Итог записи batch'а. `rows_committed = inserted + updated + unchanged`.
#[derive(Clone, Debug, Default)]
pub struct WriteResult {
    pub rows_committed: usize,
    pub rows_inserted: usize,
    pub rows_updated: usize,
    /// Точные дубликаты: строка уже была с теми же значениями.
    pub rows_unchanged: usize,
    pub rows_failed: Vec<RowFailure>,
}
