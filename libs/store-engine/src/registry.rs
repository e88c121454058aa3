use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use rusqlite::{Connection, InterruptHandle};
use serde::Serialize;
use tokio::sync::OwnedMutexGuard;

use tickstore_api::is_identifier;

use crate::{StoreConfig, StoreError};

// ═══════════════════════════════════════════════════════════════
//  StoreRegistry
// ═══════════════════════════════════════════════════════════════

struct Slot {
    path: PathBuf,
    conn: Arc<tokio::sync::Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    /// Выданные handles + ожидающие acquire. Слот с leases > 0 не вытесняется.
    leases: usize,
    last_used: Instant,
}

#[derive(Default)]
struct PoolCounters {
    opened: AtomicU64,
    evicted: AtomicU64,
    idle_closed: AtomicU64,
}

struct RegistryInner {
    data_dir: PathBuf,
    max_open: usize,
    idle_timeout: Duration,
    acquire_timeout: Duration,
    busy_timeout: Duration,
    slots: Mutex<LruCache<String, Slot>>,
    counters: PoolCounters,
}

impl RegistryInner {
    fn unlease(&self, file_id: &str) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.peek_mut(file_id) {
            slot.leases = slot.leases.saturating_sub(1);
            slot.last_used = Instant::now();
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryStats {
    pub open: usize,
    pub leased: usize,
    pub opened_total: u64,
    pub evicted_total: u64,
    pub idle_closed_total: u64,
}

/// Реестр write-handles store-файлов.
///
/// - один writer на файл: эксклюзивный mutex на соединение;
/// - не больше `max_open` открытых файлов, сверх — вытеснение LRU
///   среди незанятых;
/// - `close_idle()` закрывает файлы без записи дольше `idle_timeout`.
///
/// Handle освобождается в `Drop`, поэтому ошибка или паника посреди
/// записи не оставляет файл занятым.
#[derive(Clone)]
pub struct StoreRegistry {
    inner: Arc<RegistryInner>,
}

impl StoreRegistry {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.data_dir).map_err(|e| StoreError::Io {
            path: config.data_dir.display().to_string(),
            source: e,
        })?;
        Ok(Self {
            inner: Arc::new(RegistryInner {
                data_dir: config.data_dir.clone(),
                max_open: config.max_open.max(1),
                idle_timeout: config.idle_timeout(),
                acquire_timeout: config.acquire_timeout(),
                busy_timeout: config.busy_timeout(),
                slots: Mutex::new(LruCache::unbounded()),
                counters: PoolCounters::default(),
            }),
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.inner.data_dir
    }

    /// Путь store-файла: `{data_dir}/{file_id}.db`.
    pub fn path_for(&self, file_id: &str) -> PathBuf {
        self.inner.data_dir.join(format!("{file_id}.db"))
    }

    /// Получить эксклюзивный handle на файл, открыв его при необходимости.
    /// Ждёт текущего владельца не дольше `acquire_timeout`.
    pub async fn acquire(&self, file_id: &str) -> Result<StoreHandle, StoreError> {
        if !is_identifier(file_id) {
            return Err(StoreError::InvalidName { context: "store file", name: file_id.to_string() });
        }
        // Если этот future отменят во время ожидания, `lease` снимется в drop.
        let lease = self.lease_slot(file_id)?;

        match tokio::time::timeout(self.inner.acquire_timeout, lease.conn.clone().lock_owned()).await {
            Ok(conn) => Ok(StoreHandle { conn, lease }),
            Err(_) => Err(StoreError::Busy {
                file: file_id.to_string(),
                timeout_ms: self.inner.acquire_timeout.as_millis() as u64,
            }),
        }
    }

    /// Явно вернуть handle. Эквивалентно drop.
    pub fn release(&self, handle: StoreHandle) {
        drop(handle);
    }

    fn lease_slot(&self, file_id: &str) -> Result<SlotLease, StoreError> {
        let mut slots = self.inner.slots.lock();

        if let Some(slot) = slots.get_mut(file_id) {
            slot.leases += 1;
            slot.last_used = Instant::now();
            return Ok(SlotLease {
                file_id: file_id.to_string(),
                path: slot.path.clone(),
                conn: slot.conn.clone(),
                interrupt: slot.interrupt.clone(),
                inner: self.inner.clone(),
            });
        }

        while slots.len() >= self.inner.max_open {
            let victim = slots
                .iter()
                .rev()
                .find(|(_, s)| s.leases == 0)
                .map(|(k, _)| k.clone());
            let Some(key) = victim else {
                return Err(StoreError::PoolExhausted { max_open: self.inner.max_open });
            };
            if let Some(slot) = slots.pop(&key) {
                self.inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(file = %key, "evicted store handle");
                close_slot(&key, slot, false);
            }
        }

        let path = self.path_for(file_id);
        let conn = open_store(&path, self.inner.busy_timeout)
            .map_err(|e| StoreError::sqlite(file_id, e))?;
        let interrupt = Arc::new(conn.get_interrupt_handle());
        let conn = Arc::new(tokio::sync::Mutex::new(conn));

        slots.put(
            file_id.to_string(),
            Slot {
                path: path.clone(),
                conn: conn.clone(),
                interrupt: interrupt.clone(),
                leases: 1,
                last_used: Instant::now(),
            },
        );
        self.inner.counters.opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(file = %file_id, path = %path.display(), "opened store file");

        Ok(SlotLease { file_id: file_id.to_string(), path, conn, interrupt, inner: self.inner.clone() })
    }

    /// Закрыть незанятые handles старше `idle_timeout`.
    pub fn close_idle(&self) -> usize {
        let idle: Vec<(String, Slot)> = {
            let mut slots = self.inner.slots.lock();
            let keys: Vec<String> = slots
                .iter()
                .filter(|(_, s)| s.leases == 0 && s.last_used.elapsed() >= self.inner.idle_timeout)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| slots.pop(&k).map(|s| (k, s)))
                .collect()
        };

        let closed = idle.len();
        for (key, slot) in idle {
            close_slot(&key, slot, true);
        }
        if closed > 0 {
            self.inner.counters.idle_closed.fetch_add(closed as u64, Ordering::Relaxed);
            tracing::info!(closed, "closed idle store files");
        }
        closed
    }

    /// Дождаться текущих writer'ов и закрыть все файлы с checkpoint WAL.
    pub async fn shutdown(&self) {
        let all: Vec<(String, Slot)> = {
            let mut slots = self.inner.slots.lock();
            std::iter::from_fn(|| slots.pop_lru()).collect()
        };
        for (key, slot) in all {
            // Ждём, пока текущая транзакция закоммитится или откатится.
            drop(slot.conn.lock().await);
            close_slot(&key, slot, true);
        }
        tracing::info!("store registry closed");
    }

    pub fn open_files(&self) -> Vec<String> {
        self.inner.slots.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn stats(&self) -> RegistryStats {
        let slots = self.inner.slots.lock();
        let c = &self.inner.counters;
        RegistryStats {
            open: slots.len(),
            leased: slots.iter().filter(|(_, s)| s.leases > 0).count(),
            opened_total: c.opened.load(Ordering::Relaxed),
            evicted_total: c.evicted.load(Ordering::Relaxed),
            idle_closed_total: c.idle_closed.load(Ordering::Relaxed),
        }
    }
}

fn open_store(path: &Path, busy_timeout: Duration) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA wal_autocheckpoint = 1000;",
    )?;
    Ok(conn)
}

fn close_slot(file_id: &str, slot: Slot, checkpoint: bool) {
    // Соединение ещё держит уходящий handle — закроется вместе с ним.
    let Ok(mutex) = Arc::try_unwrap(slot.conn) else { return };
    let conn = mutex.into_inner();
    if checkpoint {
        if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            tracing::warn!(file = %file_id, error = %e, "wal checkpoint failed");
        }
    }
    if let Err((_, e)) = conn.close() {
        tracing::warn!(file = %file_id, error = %e, "store close failed");
    }
}

// ═══════════════════════════════════════════════════════════════
//  StoreHandle
// ═══════════════════════════════════════════════════════════════

/// Учтённая аренда слота: держит его от вытеснения, пока жива.
struct SlotLease {
    file_id: String,
    path: PathBuf,
    conn: Arc<tokio::sync::Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    inner: Arc<RegistryInner>,
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        self.inner.unlease(&self.file_id);
    }
}

/// Эксклюзивный доступ к соединению store-файла.
pub struct StoreHandle {
    // Порядок полей = порядок drop: сначала отпускается соединение, потом аренда.
    conn: OwnedMutexGuard<Connection>,
    lease: SlotLease,
}

impl StoreHandle {
    pub fn file_id(&self) -> &str {
        &self.lease.file_id
    }

    pub fn path(&self) -> &Path {
        &self.lease.path
    }

    pub fn connection(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Прервать текущий запрос с другого потока (таймаут записи).
    pub fn interrupt_handle(&self) -> Arc<InterruptHandle> {
        self.lease.interrupt.clone()
    }
}
