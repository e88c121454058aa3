use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use tickstore_api::RetryPolicy;

pub use store_engine::{ShapeConfig, StoreConfig};

// ═══════════════════════════════════════════════════════════════
//  Buffer Config
// ═══════════════════════════════════════════════════════════════

/// Backend буфера.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferKind {
    /// Volatile, теряется при остановке. Тесты и dev.
    #[default]
    Memory,
    /// Журнал на диске, переживает падение процесса.
    Sqlite,
}

/// Секция `[buffer]`.
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    #[serde(default)]
    pub backend: BufferKind,
    /// Файл журнала (только `sqlite`).
    #[serde(default = "default_buffer_path")]
    pub path: PathBuf,
    /// Максимум неподтверждённых записей. Сверх — `BufferError::Full`.
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
}

fn default_buffer_path() -> PathBuf {
    PathBuf::from("data/buffer.db")
}
fn default_buffer_capacity() -> usize {
    100_000
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            backend: BufferKind::default(),
            path: default_buffer_path(),
            capacity: default_buffer_capacity(),
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("buffer.capacity must be > 0".into());
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Drainer Config
// ═══════════════════════════════════════════════════════════════

/// Секция `[drainer]`: размер и ритм drain-циклов, повторы, lease.
#[derive(Debug, Clone, Deserialize)]
pub struct DrainerConfig {
    /// Имя consumer'а и holder'а lease. По умолчанию уникально на процесс.
    #[serde(default = "default_consumer")]
    pub consumer: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Сколько ждать добора batch'а.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Верхняя граница dispatch-фазы одного цикла.
    #[serde(default = "default_cycle_timeout_ms")]
    pub cycle_timeout_ms: u64,
    /// TTL leader lease. Должен покрывать самый длинный цикл.
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    /// In-flight дольше этого считается брошенной и возвращается в pending.
    #[serde(default = "default_claim_timeout_ms")]
    pub claim_timeout_ms: u64,
    /// Период recover + close_idle.
    #[serde(default = "default_maintenance_every_ms")]
    pub maintenance_every_ms: u64,
    /// Период лога статистики буфера.
    #[serde(default = "default_stats_every_ms")]
    pub stats_every_ms: u64,
}

fn default_consumer() -> String {
    format!("drainer-{}", uuid::Uuid::new_v4())
}
fn default_batch_size() -> usize {
    500
}
fn default_max_wait_ms() -> u64 {
    1_000
}
fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}
fn default_base_backoff_ms() -> u64 {
    RetryPolicy::default().base_backoff_ms
}
fn default_max_backoff_ms() -> u64 {
    RetryPolicy::default().max_backoff_ms
}
fn default_cycle_timeout_ms() -> u64 {
    30_000
}
fn default_lease_ttl_ms() -> u64 {
    60_000
}
fn default_claim_timeout_ms() -> u64 {
    120_000
}
fn default_maintenance_every_ms() -> u64 {
    10_000
}
fn default_stats_every_ms() -> u64 {
    30_000
}

impl Default for DrainerConfig {
    fn default() -> Self {
        Self {
            consumer: default_consumer(),
            batch_size: default_batch_size(),
            max_wait_ms: default_max_wait_ms(),
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            cycle_timeout_ms: default_cycle_timeout_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            claim_timeout_ms: default_claim_timeout_ms(),
            maintenance_every_ms: default_maintenance_every_ms(),
            stats_every_ms: default_stats_every_ms(),
        }
    }
}

impl DrainerConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_backoff_ms: self.base_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_millis(self.cycle_timeout_ms)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn maintenance_every(&self) -> Duration {
        Duration::from_millis(self.maintenance_every_ms)
    }

    pub fn stats_every(&self) -> Duration {
        Duration::from_millis(self.stats_every_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.consumer.is_empty() {
            return Err("drainer.consumer must not be empty".into());
        }
        if self.batch_size == 0 {
            return Err("drainer.batch_size must be > 0".into());
        }
        if self.max_attempts == 0 {
            return Err("drainer.max_attempts must be > 0".into());
        }
        if self.cycle_timeout_ms == 0 {
            return Err("drainer.cycle_timeout_ms must be > 0".into());
        }
        // Lease продлевается раз в цикл: цикл = добор + dispatch.
        if self.lease_ttl_ms <= self.cycle_timeout_ms + self.max_wait_ms {
            return Err(format!(
                "drainer.lease_ttl_ms ({}) must exceed cycle_timeout_ms + max_wait_ms ({})",
                self.lease_ttl_ms,
                self.cycle_timeout_ms + self.max_wait_ms
            ));
        }
        if self.claim_timeout_ms <= self.cycle_timeout_ms + self.max_wait_ms {
            return Err(format!(
                "drainer.claim_timeout_ms ({}) must exceed cycle_timeout_ms + max_wait_ms ({})",
                self.claim_timeout_ms,
                self.cycle_timeout_ms + self.max_wait_ms
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  Group Config
// ═══════════════════════════════════════════════════════════════

/// Разбиение store-файлов группы по дате записи (UTC).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    #[default]
    None,
    Year,
    Month,
    Day,
}

/// `[[groups]]`: логическая группа тикеров одного провайдера.
///
/// Store file группы: `{name}_{provider}_{exchange}[_{YYYY}[_{MM}[_{DD}]]]`.
#[derive(Debug, Clone, Deserialize)]
pub struct GroupConfig {
    /// Тип данных, e.g. "historical_intraday".
    pub name: String,
    pub provider: String,
    pub exchange: String,
    #[serde(default)]
    pub partition: Partition,
    /// Форма из `[[schemas]]`. Без неё колонки выводятся из значений.
    #[serde(default)]
    pub shape: Option<String>,
    /// Пустой список — группа принимает любой тикер провайдера.
    #[serde(default)]
    pub tickers: Vec<String>,
}
