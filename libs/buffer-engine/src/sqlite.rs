use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, Transaction, TransactionBehavior, params};
use tokio::sync::Notify;

use tickstore_api::{
    BufferEntry, BufferError, BufferStats, DeadLetter, DeliveryState, EntryId, Failure,
    FailureKind, LeaseError, LeaseStore, Record, RecordBuffer, RecoverScope, RequeueOutcome,
    RetryPolicy, now_ms,
};

use crate::wait::collect_until;

const BUSY_TIMEOUT_MS: u64 = 5000;

const SCHEMA: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = FULL;
CREATE TABLE IF NOT EXISTS buffer_entries (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    payload       BLOB    NOT NULL,
    enqueued_ms   INTEGER NOT NULL,
    state         TEXT    NOT NULL DEFAULT 'pending',
    attempts      INTEGER NOT NULL DEFAULT 0,
    available_ms  INTEGER NOT NULL DEFAULT 0,
    claimed_by    TEXT,
    claimed_ms    INTEGER,
    last_error    TEXT
);
CREATE INDEX IF NOT EXISTS ix_buffer_entries_ready
    ON buffer_entries (state, available_ms, id);
CREATE TABLE IF NOT EXISTS dead_letters (
    entry_id     INTEGER PRIMARY KEY,
    payload      BLOB    NOT NULL,
    kind         TEXT    NOT NULL,
    reason       TEXT    NOT NULL,
    attempts     INTEGER NOT NULL,
    enqueued_ms  INTEGER NOT NULL,
    recorded_ms  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS buffer_counters (
    name   TEXT PRIMARY KEY,
    value  INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS leader_lease (
    id          INTEGER PRIMARY KEY CHECK (id = 1),
    holder      TEXT    NOT NULL,
    expires_ms  INTEGER NOT NULL
);
";

fn db(e: rusqlite::Error) -> BufferError {
    BufferError::Storage(e.to_string())
}

// ═══════════════════════════════════════════════════════════════
//  SqliteBuffer
// ═══════════════════════════════════════════════════════════════

/// Буфер на SQLite-журнале.
///
/// Каждая операция — одна IMMEDIATE транзакция в `spawn_blocking`.
/// Журнал можно открыть из нескольких процессов: lease и claim
/// сериализуются блокировкой записи SQLite.
pub struct SqliteBuffer {
    conn: Arc<Mutex<Connection>>,
    notify: Notify,
    capacity: u64,
    path: PathBuf,
}

impl SqliteBuffer {
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, BufferError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| BufferError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(&path).map_err(db)?;
        conn.busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS)).map_err(db)?;
        conn.execute_batch(SCHEMA).map_err(db)?;
        // Глубина пересчитывается при открытии: журнал мог быть создан
        // до появления счётчика.
        conn.execute(
            "INSERT OR REPLACE INTO buffer_counters (name, value)
             SELECT 'depth', COUNT(*) FROM buffer_entries",
            [],
        )
        .map_err(db)?;

        tracing::info!(path = %path.display(), capacity, "opened buffer journal");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            notify: Notify::new(),
            capacity: capacity as u64,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, BufferError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, BufferError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| BufferError::Storage("journal connection poisoned".into()))?;
            f(&mut guard)
        })
        .await
        .map_err(|e| BufferError::Storage(format!("journal task: {e}")))?
    }

    async fn push(&self, payload: Vec<u8>) -> Result<EntryId, BufferError> {
        let capacity = self.capacity;
        let id = self
            .blocking(move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db)?;
                let depth: i64 = tx
                    .query_row("SELECT value FROM buffer_counters WHERE name = 'depth'", [], |r| r.get(0))
                    .optional()
                    .map_err(db)?
                    .unwrap_or(0);
                if depth as u64 >= capacity {
                    return Err(BufferError::Full { capacity });
                }
                tx.execute(
                    "INSERT INTO buffer_entries (payload, enqueued_ms) VALUES (?1, ?2)",
                    params![payload, now_ms()],
                )
                .map_err(db)?;
                let id = tx.last_insert_rowid();
                add_counter(&tx, "depth", 1)?;
                tx.commit().map_err(db)?;
                Ok(EntryId(id as u64))
            })
            .await?;
        self.notify.notify_one();
        Ok(id)
    }

    async fn claim(&self, consumer: &str, n: usize) -> Result<Vec<BufferEntry>, BufferError> {
        let consumer = consumer.to_string();
        self.blocking(move |conn| {
            let now = now_ms();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut out = Vec::new();

            while out.len() < n {
                let rows: Vec<(i64, Vec<u8>, i64, u32)> = {
                    let mut stmt = tx
                        .prepare_cached(
                            "SELECT id, payload, enqueued_ms, attempts FROM buffer_entries
                             WHERE state = 'pending' AND available_ms <= ?1
                             ORDER BY id LIMIT ?2",
                        )
                        .map_err(db)?;
                    let rows = stmt
                        .query_map(params![now, (n - out.len()) as i64], |r| {
                            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
                        })
                        .map_err(db)?;
                    rows.collect::<Result<_, _>>().map_err(db)?
                };
                if rows.is_empty() {
                    break;
                }

                for (id, payload, enqueued_ms, attempts) in rows {
                    match Record::decode(&payload) {
                        Ok(record) => {
                            tx.execute(
                                "UPDATE buffer_entries
                                 SET state = 'in_flight', claimed_by = ?2, claimed_ms = ?3
                                 WHERE id = ?1",
                                params![id, consumer, now],
                            )
                            .map_err(db)?;
                            out.push(BufferEntry {
                                id: EntryId(id as u64),
                                record,
                                enqueued_ms,
                                state: DeliveryState::InFlight,
                                attempts,
                                claimed_by: Some(consumer.clone()),
                            });
                        }
                        Err(e) => {
                            tracing::warn!(entry = id, error = %e, "malformed entry quarantined");
                            let reason = e.to_string();
                            bury(&tx, id, FailureKind::Malformed, &reason, attempts + 1, now)?;
                        }
                    }
                }
            }

            tx.commit().map_err(db)?;
            Ok(out)
        })
        .await
    }
}

/// Перенести запись в dead_letters (в рамках транзакции вызывающего).
fn bury(
    tx: &Transaction<'_>,
    id: i64,
    kind: FailureKind,
    reason: &str,
    attempts: u32,
    now: i64,
) -> Result<bool, BufferError> {
    let moved = tx
        .execute(
            "INSERT OR REPLACE INTO dead_letters
                 (entry_id, payload, kind, reason, attempts, enqueued_ms, recorded_ms)
             SELECT id, payload, ?2, ?3, ?4, enqueued_ms, ?5 FROM buffer_entries WHERE id = ?1",
            params![id, kind.as_str(), reason, attempts, now],
        )
        .map_err(db)?;
    let deleted = tx
        .execute("DELETE FROM buffer_entries WHERE id = ?1", params![id])
        .map_err(db)?;
    add_counter(tx, "depth", -(deleted as i64))?;
    Ok(moved > 0)
}

fn add_counter(tx: &Transaction<'_>, name: &str, delta: i64) -> Result<(), BufferError> {
    tx.execute(
        "INSERT INTO buffer_counters (name, value) VALUES (?1, ?2)
         ON CONFLICT (name) DO UPDATE SET value = value + excluded.value",
        params![name, delta],
    )
    .map_err(db)?;
    Ok(())
}

impl RecordBuffer for SqliteBuffer {
    fn enqueue(&self, record: &Record)
        -> Pin<Box<dyn Future<Output = Result<EntryId, BufferError>> + Send + '_>>
    {
        let payload = record.encode();
        Box::pin(async move { self.push(payload?).await })
    }

    fn enqueue_raw(&self, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<EntryId, BufferError>> + Send + '_>>
    {
        Box::pin(self.push(payload))
    }

    fn dequeue_batch<'a>(
        &'a self,
        consumer: &'a str,
        max_n: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BufferEntry>, BufferError>> + Send + 'a>> {
        Box::pin(collect_until(&self.notify, max_n, max_wait, move |need| {
            self.claim(consumer, need)
        }))
    }

    fn ack(&self, ids: &[EntryId])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        let ids: Vec<i64> = ids.iter().map(|id| id.0 as i64).collect();
        Box::pin(self.blocking(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut acked = 0usize;
            {
                let mut stmt = tx
                    .prepare_cached("DELETE FROM buffer_entries WHERE id = ?1 AND state = 'in_flight'")
                    .map_err(db)?;
                for id in ids {
                    acked += stmt.execute(params![id]).map_err(db)?;
                }
            }
            add_counter(&tx, "committed_total", acked as i64)?;
            add_counter(&tx, "depth", -(acked as i64))?;
            tx.commit().map_err(db)?;
            Ok(acked)
        }))
    }

    fn requeue<'a>(&'a self, failures: &'a [Failure], policy: &'a RetryPolicy)
        -> Pin<Box<dyn Future<Output = Result<RequeueOutcome, BufferError>> + Send + 'a>>
    {
        let failures = failures.to_vec();
        let policy = policy.clone();
        Box::pin(self.blocking(move |conn| {
            let now = now_ms();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut outcome = RequeueOutcome::default();

            for f in &failures {
                let id = f.entry_id.0 as i64;
                let attempts: Option<u32> = tx
                    .query_row(
                        "SELECT attempts FROM buffer_entries WHERE id = ?1 AND state = 'in_flight'",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db)?;
                let Some(attempts) = attempts.map(|a| a + 1) else { continue };

                if !f.kind.is_retryable() || policy.exhausted(attempts) {
                    bury(&tx, id, f.kind, &f.reason, attempts, now)?;
                    outcome.dead_lettered += 1;
                } else {
                    let available_ms = now + policy.backoff_ms(attempts) as i64;
                    tx.execute(
                        "UPDATE buffer_entries
                         SET state = 'pending', attempts = ?2, available_ms = ?3,
                             claimed_by = NULL, claimed_ms = NULL, last_error = ?4
                         WHERE id = ?1",
                        params![id, attempts, available_ms, f.reason],
                    )
                    .map_err(db)?;
                    outcome.requeued += 1;
                }
            }

            tx.commit().map_err(db)?;
            Ok(outcome)
        }))
    }

    fn quarantine(&self, failures: &[Failure])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        let failures = failures.to_vec();
        Box::pin(self.blocking(move |conn| {
            let now = now_ms();
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(db)?;
            let mut buried = 0;
            for f in &failures {
                let id = f.entry_id.0 as i64;
                let attempts: Option<u32> = tx
                    .query_row(
                        "SELECT attempts FROM buffer_entries WHERE id = ?1",
                        params![id],
                        |r| r.get(0),
                    )
                    .optional()
                    .map_err(db)?;
                let Some(attempts) = attempts else { continue };
                if bury(&tx, id, f.kind, &f.reason, attempts + 1, now)? {
                    buried += 1;
                }
            }
            tx.commit().map_err(db)?;
            Ok(buried)
        }))
    }

    fn recover(&self, scope: RecoverScope)
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        Box::pin(async move {
            let recovered = self
                .blocking(move |conn| {
                    const RESET: &str = "UPDATE buffer_entries
                        SET state = 'pending', claimed_by = NULL, claimed_ms = NULL
                        WHERE state = 'in_flight'";
                    match scope {
                        RecoverScope::All => conn.execute(RESET, []).map_err(db),
                        RecoverScope::ClaimedBefore(ts) => conn
                            .execute(&format!("{RESET} AND claimed_ms < ?1"), params![ts])
                            .map_err(db),
                        RecoverScope::NotClaimedBy(holder) => conn
                            .execute(
                                &format!("{RESET} AND (claimed_by IS NULL OR claimed_by <> ?1)"),
                                params![holder],
                            )
                            .map_err(db),
                        RecoverScope::Entries(ids) => {
                            let tx = conn
                                .transaction_with_behavior(TransactionBehavior::Immediate)
                                .map_err(db)?;
                            let mut n = 0;
                            {
                                let mut stmt =
                                    tx.prepare_cached(&format!("{RESET} AND id = ?1")).map_err(db)?;
                                for id in ids {
                                    n += stmt.execute(params![id.0 as i64]).map_err(db)?;
                                }
                            }
                            tx.commit().map_err(db)?;
                            Ok(n)
                        }
                    }
                })
                .await?;
            if recovered > 0 {
                self.notify.notify_one();
            }
            Ok(recovered)
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<BufferStats, BufferError>> + Send + '_>> {
        let capacity = self.capacity;
        Box::pin(self.blocking(move |conn| {
            let mut stats = BufferStats { capacity, ..Default::default() };
            {
                let mut stmt = conn
                    .prepare_cached("SELECT state, COUNT(*) FROM buffer_entries GROUP BY state")
                    .map_err(db)?;
                let rows = stmt
                    .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
                    .map_err(db)?;
                for row in rows {
                    let (state, count) = row.map_err(db)?;
                    match DeliveryState::parse(&state) {
                        Some(DeliveryState::Pending) => stats.pending = count as u64,
                        Some(DeliveryState::InFlight) => stats.in_flight = count as u64,
                        _ => {}
                    }
                }
            }
            stats.dead_letters = conn
                .query_row("SELECT COUNT(*) FROM dead_letters", [], |r| r.get::<_, i64>(0))
                .map_err(db)? as u64;
            stats.committed_total = conn
                .query_row(
                    "SELECT value FROM buffer_counters WHERE name = 'committed_total'",
                    [],
                    |r| r.get::<_, i64>(0),
                )
                .optional()
                .map_err(db)?
                .unwrap_or(0) as u64;
            Ok(stats)
        }))
    }

    fn dead_letters(&self, limit: usize)
        -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, BufferError>> + Send + '_>>
    {
        Box::pin(self.blocking(move |conn| {
            let mut stmt = conn
                .prepare_cached(
                    "SELECT entry_id, kind, reason, attempts, enqueued_ms, recorded_ms, payload
                     FROM dead_letters ORDER BY recorded_ms DESC, entry_id DESC LIMIT ?1",
                )
                .map_err(db)?;
            let rows = stmt
                .query_map(params![limit as i64], |r| {
                    let kind: String = r.get(1)?;
                    let payload: Vec<u8> = r.get(6)?;
                    Ok(DeadLetter {
                        entry_id: EntryId(r.get::<_, i64>(0)? as u64),
                        kind: FailureKind::parse(&kind).unwrap_or(FailureKind::Malformed),
                        reason: r.get(2)?,
                        attempts: r.get(3)?,
                        enqueued_ms: r.get(4)?,
                        recorded_ms: r.get(5)?,
                        payload: String::from_utf8_lossy(&payload).into_owned(),
                    })
                })
                .map_err(db)?;
            rows.collect::<Result<Vec<_>, _>>().map_err(db)
        }))
    }
}

impl LeaseStore for SqliteBuffer {
    fn try_acquire<'a>(&'a self, holder: &'a str, ttl: Duration)
        -> Pin<Box<dyn Future<Output = Result<bool, LeaseError>> + Send + 'a>>
    {
        let holder = holder.to_string();
        Box::pin(async move {
            self.blocking(move |conn| {
                let now = now_ms();
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(db)?;
                let current: Option<(String, i64)> = tx
                    .query_row("SELECT holder, expires_ms FROM leader_lease WHERE id = 1", [], |r| {
                        Ok((r.get(0)?, r.get(1)?))
                    })
                    .optional()
                    .map_err(db)?;
                let free = match current {
                    None => true,
                    Some((current, expires_ms)) => current == holder || expires_ms <= now,
                };
                if free {
                    tx.execute(
                        "INSERT INTO leader_lease (id, holder, expires_ms) VALUES (1, ?1, ?2)
                         ON CONFLICT (id) DO UPDATE
                         SET holder = excluded.holder, expires_ms = excluded.expires_ms",
                        params![holder, now + ttl.as_millis() as i64],
                    )
                    .map_err(db)?;
                }
                tx.commit().map_err(db)?;
                Ok(free)
            })
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))
        })
    }

    fn release<'a>(&'a self, holder: &'a str)
        -> Pin<Box<dyn Future<Output = Result<(), LeaseError>> + Send + 'a>>
    {
        let holder = holder.to_string();
        Box::pin(async move {
            self.blocking(move |conn| {
                conn.execute("DELETE FROM leader_lease WHERE id = 1 AND holder = ?1", params![holder])
                    .map_err(db)?;
                Ok(())
            })
            .await
            .map_err(|e| LeaseError::Storage(e.to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use tickstore_api::{Fields, Provenance};

    use super::*;

    fn record(ticker: &str, ts_ms: i64) -> Record {
        let mut fields = Fields::new();
        fields.insert("close".into(), serde_json::json!(100.5));
        Record::new(
            ticker,
            ts_ms,
            fields,
            Provenance { provider: "test".into(), job_id: "job".into(), sequence: ts_ms as u64 },
        )
    }

    #[tokio::test]
    async fn in_flight_entries_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffer.db");

        {
            let buf = SqliteBuffer::open(&path, 100).unwrap();
            for ts in 1..=3 {
                buf.enqueue(&record("AAPL", ts)).await.unwrap();
            }
            let claimed = buf.dequeue_batch("crashed", 2, Duration::ZERO).await.unwrap();
            assert_eq!(claimed.len(), 2);
        }

        let buf = SqliteBuffer::open(&path, 100).unwrap();
        let stats = buf.stats().await.unwrap();
        assert_eq!((stats.pending, stats.in_flight), (1, 2));

        let recovered = buf.recover(RecoverScope::NotClaimedBy("fresh".into())).await.unwrap();
        assert_eq!(recovered, 2);

        let batch = buf.dequeue_batch("fresh", 10, Duration::ZERO).await.unwrap();
        let ts: Vec<i64> = batch.iter().map(|e| e.record.ts_ms).collect();
        assert_eq!(ts, [1, 2, 3]);
        assert_eq!(batch[0].record.fields["close"], serde_json::json!(100.5));
    }

    #[tokio::test]
    async fn capacity_counts_pending_and_in_flight() {
        let dir = tempfile::tempdir().unwrap();
        let buf = SqliteBuffer::open(dir.path().join("b.db"), 2).unwrap();
        buf.enqueue(&record("AAPL", 1)).await.unwrap();
        buf.enqueue(&record("AAPL", 2)).await.unwrap();
        buf.dequeue_batch("c", 1, Duration::ZERO).await.unwrap();
        assert!(matches!(
            buf.enqueue(&record("AAPL", 3)).await,
            Err(BufferError::Full { capacity: 2 })
        ));
    }

    #[tokio::test]
    async fn ack_and_dead_letter_trail_are_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.db");
        {
            let buf = SqliteBuffer::open(&path, 100).unwrap();
            buf.enqueue_raw(br#"{"ts_ms":1,"provenance":{"provider":"p","job_id":"j"}}"#.to_vec())
                .await
                .unwrap();
            let ok = buf.enqueue(&record("MSFT", 5)).await.unwrap();
            let batch = buf.dequeue_batch("c", 10, Duration::from_millis(10)).await.unwrap();
            assert_eq!(batch.len(), 1);
            assert_eq!(buf.ack(&[ok]).await.unwrap(), 1);
        }

        let buf = SqliteBuffer::open(&path, 100).unwrap();
        let stats = buf.stats().await.unwrap();
        assert_eq!(stats.committed_total, 1);
        assert_eq!(stats.dead_letters, 1);
        assert_eq!(stats.depth(), 0);

        let dead = buf.dead_letters(5).await.unwrap();
        assert_eq!(dead[0].kind, FailureKind::Malformed);
        assert!(dead[0].reason.contains("ticker"));
    }

    #[tokio::test]
    async fn requeue_exhausts_into_dead_letters() {
        let dir = tempfile::tempdir().unwrap();
        let buf = SqliteBuffer::open(dir.path().join("b.db"), 100).unwrap();
        let id = buf.enqueue(&record("AAPL", 1)).await.unwrap();
        let policy = RetryPolicy { max_attempts: 1, base_backoff_ms: 0, max_backoff_ms: 0 };

        buf.dequeue_batch("c", 1, Duration::ZERO).await.unwrap();
        let out = buf
            .requeue(&[Failure::new(id, FailureKind::WriteConflict, "CHECK failed")], &policy)
            .await
            .unwrap();
        assert_eq!(out.dead_lettered, 1);
        let dead = buf.dead_letters(1).await.unwrap();
        assert_eq!(dead[0].kind, FailureKind::WriteConflict);
        assert_eq!(dead[0].attempts, 1);
    }

    #[tokio::test]
    async fn lease_is_shared_between_handles_on_one_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.db");
        let a = SqliteBuffer::open(&path, 10).unwrap();
        let b = SqliteBuffer::open(&path, 10).unwrap();

        assert!(a.try_acquire("node-a", Duration::from_secs(30)).await.unwrap());
        assert!(!b.try_acquire("node-b", Duration::from_secs(30)).await.unwrap());
        a.release("node-a").await.unwrap();
        assert!(b.try_acquire("node-b", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn depth_counter_follows_push_ack_and_bury() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("b.db");
        {
            let buf = SqliteBuffer::open(&path, 3).unwrap();
            let a = buf.enqueue(&record("AAPL", 1)).await.unwrap();
            let b = buf.enqueue(&record("AAPL", 2)).await.unwrap();
            buf.enqueue(&record("AAPL", 3)).await.unwrap();
            assert!(matches!(buf.enqueue(&record("AAPL", 4)).await, Err(BufferError::Full { .. })));

            buf.dequeue_batch("c", 3, Duration::ZERO).await.unwrap();
            assert_eq!(buf.ack(&[a]).await.unwrap(), 1);
            let buried = buf
                .quarantine(&[Failure::new(b, FailureKind::Unroutable, "unknown provider")])
                .await
                .unwrap();
            assert_eq!(buried, 1);

            buf.enqueue(&record("AAPL", 4)).await.unwrap();
            buf.enqueue(&record("AAPL", 5)).await.unwrap();
            assert!(matches!(buf.enqueue(&record("AAPL", 6)).await, Err(BufferError::Full { .. })));
        }

        let buf = SqliteBuffer::open(&path, 3).unwrap();
        assert_eq!(buf.stats().await.unwrap().depth(), 3);
        assert!(matches!(buf.enqueue(&record("AAPL", 6)).await, Err(BufferError::Full { .. })));
    }

    #[tokio::test]
    async fn released_entries_keep_their_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let buf = SqliteBuffer::open(dir.path().join("b.db"), 10).unwrap();
        let a = buf.enqueue(&record("AAPL", 1)).await.unwrap();
        buf.enqueue(&record("AAPL", 2)).await.unwrap();
        buf.dequeue_batch("c", 2, Duration::ZERO).await.unwrap();

        assert_eq!(buf.recover(RecoverScope::Entries(vec![a])).await.unwrap(), 1);
        let stats = buf.stats().await.unwrap();
        assert_eq!((stats.pending, stats.in_flight), (1, 1));

        let again = buf.dequeue_batch("c", 2, Duration::ZERO).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!((again[0].id, again[0].attempts), (a, 0));
    }
}
