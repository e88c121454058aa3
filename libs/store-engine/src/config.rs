use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

// ════════════════════════════════════════════════════════════════
//  Store Config
// ════════════════════════════════════════════════════════════════

/// Секция `[store]`: где лежат store-файлы и как живут их handles.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Каталог store-файлов: `{data_dir}/{file_id}.db`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Максимум одновременно открытых handles (LRU вытеснение сверх).
    #[serde(default = "default_max_open")]
    pub max_open: usize,
    /// Handle без записи дольше этого закрывается.
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Сколько ждать эксклюзивный доступ к файлу.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Верхняя граница одной транзакции batch'а.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// SQLite busy_timeout для writer и reader соединений.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_max_open() -> usize {
    64
}
fn default_idle_timeout_ms() -> u64 {
    60_000
}
fn default_acquire_timeout_ms() -> u64 {
    5_000
}
fn default_write_timeout_ms() -> u64 {
    10_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_open: default_max_open(),
            idle_timeout_ms: default_idle_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_open == 0 {
            return Err("store.max_open must be > 0".into());
        }
        if self.write_timeout_ms == 0 {
            return Err("store.write_timeout_ms must be > 0".into());
        }
        Ok(())
    }
}
