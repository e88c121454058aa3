use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use tickstore_api::{
    BufferEntry, BufferError, BufferStats, DeadLetter, DeliveryState, EntryId, Failure,
    FailureKind, LeaseError, LeaseStore, Record, RecordBuffer, RecoverScope, RequeueOutcome,
    RetryPolicy, now_ms,
};

use crate::wait::collect_until;

// ═══════════════════════════════════════════════════════════════
//  MemoryBuffer
// ═══════════════════════════════════════════════════════════════

struct Slot {
    payload: Vec<u8>,
    enqueued_ms: i64,
    state: DeliveryState,
    attempts: u32,
    available_ms: i64,
    claimed_by: Option<String>,
    claimed_ms: i64,
}

impl Slot {
    /// in-flight → pending без счёта попытки.
    fn release(&mut self) -> bool {
        if self.state != DeliveryState::InFlight {
            return false;
        }
        self.state = DeliveryState::Pending;
        self.claimed_by = None;
        self.claimed_ms = 0;
        true
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    entries: BTreeMap<u64, Slot>,
    dead: Vec<DeadLetter>,
    committed_total: u64,
    lease: Option<(String, i64)>,
}

impl State {
    fn bury(&mut self, id: u64, kind: FailureKind, reason: &str, attempts: u32) -> bool {
        let Some(slot) = self.entries.remove(&id) else {
            return false;
        };
        self.dead.push(DeadLetter {
            entry_id: EntryId(id),
            kind,
            reason: reason.to_string(),
            attempts,
            enqueued_ms: slot.enqueued_ms,
            recorded_ms: now_ms(),
            payload: String::from_utf8_lossy(&slot.payload).into_owned(),
        });
        true
    }
}

/// In-memory буфер. Содержимое теряется при остановке процесса,
/// поэтому годится только для тестов и dev-конфигураций.
pub struct MemoryBuffer {
    state: Mutex<State>,
    notify: Notify,
    capacity: u64,
}

impl MemoryBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            capacity: capacity as u64,
        }
    }

    async fn push(&self, payload: Vec<u8>) -> Result<EntryId, BufferError> {
        let mut st = self.state.lock().await;
        if st.entries.len() as u64 >= self.capacity {
            return Err(BufferError::Full { capacity: self.capacity });
        }
        st.next_id += 1;
        let id = st.next_id;
        st.entries.insert(
            id,
            Slot {
                payload,
                enqueued_ms: now_ms(),
                state: DeliveryState::Pending,
                attempts: 0,
                available_ms: 0,
                claimed_by: None,
                claimed_ms: 0,
            },
        );
        drop(st);
        self.notify.notify_one();
        Ok(EntryId(id))
    }

    async fn claim(&self, consumer: &str, n: usize) -> Vec<BufferEntry> {
        let now = now_ms();
        let mut guard = self.state.lock().await;
        let st = &mut *guard;

        let ready: Vec<u64> = st
            .entries
            .iter()
            .filter(|(_, s)| s.state == DeliveryState::Pending && s.available_ms <= now)
            .map(|(id, _)| *id)
            .collect();

        let mut out = Vec::new();
        for id in ready {
            if out.len() >= n {
                break;
            }
            let Some(slot) = st.entries.get_mut(&id) else { continue };
            match Record::decode(&slot.payload) {
                Ok(record) => {
                    slot.state = DeliveryState::InFlight;
                    slot.claimed_by = Some(consumer.to_string());
                    slot.claimed_ms = now;
                    out.push(BufferEntry {
                        id: EntryId(id),
                        record,
                        enqueued_ms: slot.enqueued_ms,
                        state: DeliveryState::InFlight,
                        attempts: slot.attempts,
                        claimed_by: slot.claimed_by.clone(),
                    });
                }
                Err(e) => {
                    let attempts = slot.attempts + 1;
                    tracing::warn!(entry = id, error = %e, "malformed entry quarantined");
                    st.bury(id, FailureKind::Malformed, &e.to_string(), attempts);
                }
            }
        }
        out
    }
}

impl RecordBuffer for MemoryBuffer {
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
        Box::pin(collect_until(&self.notify, max_n, max_wait, move |need| async move {
            Ok(self.claim(consumer, need).await)
        }))
    }

    fn ack(&self, ids: &[EntryId])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        let ids = ids.to_vec();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            let mut acked = 0;
            for id in ids {
                let in_flight = st
                    .entries
                    .get(&id.0)
                    .is_some_and(|s| s.state == DeliveryState::InFlight);
                if in_flight {
                    st.entries.remove(&id.0);
                    acked += 1;
                }
            }
            st.committed_total += acked as u64;
            Ok(acked)
        })
    }

    fn requeue<'a>(&'a self, failures: &'a [Failure], policy: &'a RetryPolicy)
        -> Pin<Box<dyn Future<Output = Result<RequeueOutcome, BufferError>> + Send + 'a>>
    {
        Box::pin(async move {
            let now = now_ms();
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let mut outcome = RequeueOutcome::default();

            for f in failures {
                let Some(slot) = st.entries.get_mut(&f.entry_id.0) else { continue };
                if slot.state != DeliveryState::InFlight {
                    continue;
                }
                slot.attempts += 1;
                let attempts = slot.attempts;
                if !f.kind.is_retryable() || policy.exhausted(attempts) {
                    st.bury(f.entry_id.0, f.kind, &f.reason, attempts);
                    outcome.dead_lettered += 1;
                } else {
                    slot.state = DeliveryState::Pending;
                    slot.available_ms = now + policy.backoff_ms(attempts) as i64;
                    slot.claimed_by = None;
                    slot.claimed_ms = 0;
                    outcome.requeued += 1;
                }
            }
            Ok(outcome)
        })
    }

    fn quarantine(&self, failures: &[Failure])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        let failures = failures.to_vec();
        Box::pin(async move {
            let mut st = self.state.lock().await;
            let mut buried = 0;
            for f in failures {
                let attempts = match st.entries.get(&f.entry_id.0) {
                    Some(slot) => slot.attempts + 1,
                    None => continue,
                };
                if st.bury(f.entry_id.0, f.kind, &f.reason, attempts) {
                    buried += 1;
                }
            }
            Ok(buried)
        })
    }

    fn recover(&self, scope: RecoverScope)
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>
    {
        Box::pin(async move {
            let mut st = self.state.lock().await;
            let mut recovered = 0;
            if let RecoverScope::Entries(ids) = &scope {
                for id in ids {
                    if let Some(slot) = st.entries.get_mut(&id.0) {
                        recovered += slot.release() as usize;
                    }
                }
            } else {
                for slot in st.entries.values_mut() {
                    let hit = match &scope {
                        RecoverScope::ClaimedBefore(ts) => slot.claimed_ms < *ts,
                        RecoverScope::NotClaimedBy(holder) => {
                            slot.claimed_by.as_deref() != Some(holder.as_str())
                        }
                        _ => true,
                    };
                    if hit {
                        recovered += slot.release() as usize;
                    }
                }
            }
            drop(st);
            if recovered > 0 {
                self.notify.notify_one();
            }
            Ok(recovered)
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<BufferStats, BufferError>> + Send + '_>> {
        Box::pin(async move {
            let st = self.state.lock().await;
            let in_flight = st
                .entries
                .values()
                .filter(|s| s.state == DeliveryState::InFlight)
                .count() as u64;
            Ok(BufferStats {
                pending: st.entries.len() as u64 - in_flight,
                in_flight,
                dead_letters: st.dead.len() as u64,
                committed_total: st.committed_total,
                capacity: self.capacity,
            })
        })
    }

    fn dead_letters(&self, limit: usize)
        -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, BufferError>> + Send + '_>>
    {
        Box::pin(async move {
            let st = self.state.lock().await;
            Ok(st.dead.iter().rev().take(limit).cloned().collect())
        })
    }
}

impl LeaseStore for MemoryBuffer {
    fn try_acquire<'a>(&'a self, holder: &'a str, ttl: Duration)
        -> Pin<Box<dyn Future<Output = Result<bool, LeaseError>> + Send + 'a>>
    {
        Box::pin(async move {
            let now = now_ms();
            let mut st = self.state.lock().await;
            let free = match &st.lease {
                None => true,
                Some((current, expires_ms)) => current == holder || *expires_ms <= now,
            };
            if free {
                st.lease = Some((holder.to_string(), now + ttl.as_millis() as i64));
            }
            Ok(free)
        })
    }

    fn release<'a>(&'a self, holder: &'a str)
        -> Pin<Box<dyn Future<Output = Result<(), LeaseError>> + Send + 'a>>
    {
        Box::pin(async move {
            let mut st = self.state.lock().await;
            if st.lease.as_ref().is_some_and(|(current, _)| current == holder) {
                st.lease = None;
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Instant;

    use tickstore_api::{Fields, Provenance};

    use super::*;

    fn record(ticker: &str, ts_ms: i64) -> Record {
        Record::new(
            ticker,
            ts_ms,
            Fields::new(),
            Provenance { provider: "test".into(), job_id: "job".into(), sequence: ts_ms as u64 },
        )
    }

    #[tokio::test]
    async fn full_buffer_rejects_without_blocking() {
        let buf = MemoryBuffer::new(2);
        buf.enqueue(&record("AAPL", 1)).await.unwrap();
        buf.enqueue(&record("AAPL", 2)).await.unwrap();
        let err = buf.enqueue(&record("AAPL", 3)).await.unwrap_err();
        assert!(matches!(err, BufferError::Full { capacity: 2 }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn dequeue_returns_early_when_batch_is_full() {
        let buf = MemoryBuffer::new(100);
        for ts in 0..5 {
            buf.enqueue(&record("AAPL", ts)).await.unwrap();
        }
        let started = Instant::now();
        let batch = buf.dequeue_batch("c1", 5, Duration::from_secs(10)).await.unwrap();
        assert_eq!(batch.len(), 5);
        assert!(started.elapsed() < Duration::from_secs(5));
        let ts: Vec<i64> = batch.iter().map(|e| e.record.ts_ms).collect();
        assert_eq!(ts, [0, 1, 2, 3, 4]);
        assert!(batch.iter().all(|e| e.state == DeliveryState::InFlight));
    }

    #[tokio::test]
    async fn dequeue_waits_for_late_producer() {
        let buf = Arc::new(MemoryBuffer::new(100));
        let producer = buf.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.enqueue(&record("MSFT", 1)).await.unwrap();
        });
        let batch = buf.dequeue_batch("c1", 1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn dequeue_gives_up_after_max_wait() {
        let buf = MemoryBuffer::new(100);
        buf.enqueue(&record("AAPL", 1)).await.unwrap();
        let batch = buf.dequeue_batch("c1", 10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn malformed_payload_does_not_block_later_entries() {
        let buf = MemoryBuffer::new(100);
        buf.enqueue_raw(b"{not json".to_vec()).await.unwrap();
        buf.enqueue(&record("AAPL", 1)).await.unwrap();

        let batch = buf.dequeue_batch("c1", 10, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].record.ticker, "AAPL");

        let dead = buf.dead_letters(10).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].kind, FailureKind::Malformed);
        assert_eq!(dead[0].payload, "{not json");
    }

    #[tokio::test]
    async fn requeue_applies_backoff_then_dead_letters() {
        let buf = MemoryBuffer::new(100);
        let id = buf.enqueue(&record("AAPL", 1)).await.unwrap();
        let policy = RetryPolicy { max_attempts: 2, base_backoff_ms: 10, max_backoff_ms: 10 };
        let failure = [Failure::new(id, FailureKind::StoreUnavailable, "disk gone")];

        buf.dequeue_batch("c1", 1, Duration::ZERO).await.unwrap();
        let out = buf.requeue(&failure, &policy).await.unwrap();
        assert_eq!(out, RequeueOutcome { requeued: 1, dead_lettered: 0 });

        let again = buf.dequeue_batch("c1", 1, Duration::from_secs(2)).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].attempts, 1);

        let out = buf.requeue(&failure, &policy).await.unwrap();
        assert_eq!(out, RequeueOutcome { requeued: 0, dead_lettered: 1 });

        let stats = buf.stats().await.unwrap();
        assert_eq!(stats.depth(), 0);
        assert_eq!(stats.dead_letters, 1);
        let dead = buf.dead_letters(1).await.unwrap();
        assert_eq!(dead[0].reason, "disk gone");
        assert_eq!(dead[0].attempts, 2);
    }

    #[tokio::test]
    async fn ack_only_touches_in_flight_entries() {
        let buf = MemoryBuffer::new(100);
        let a = buf.enqueue(&record("AAPL", 1)).await.unwrap();
        let b = buf.enqueue(&record("AAPL", 2)).await.unwrap();
        buf.dequeue_batch("c1", 1, Duration::ZERO).await.unwrap();

        assert_eq!(buf.ack(&[a, b]).await.unwrap(), 1);
        let stats = buf.stats().await.unwrap();
        assert_eq!(stats.committed_total, 1);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn recover_scopes() {
        let buf = MemoryBuffer::new(100);
        for ts in 0..4 {
            buf.enqueue(&record("AAPL", ts)).await.unwrap();
        }
        buf.dequeue_batch("old", 2, Duration::ZERO).await.unwrap();
        buf.dequeue_batch("new", 2, Duration::ZERO).await.unwrap();

        let n = buf.recover(RecoverScope::NotClaimedBy("new".into())).await.unwrap();
        assert_eq!(n, 2);
        let n = buf.recover(RecoverScope::ClaimedBefore(now_ms() + 1)).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(buf.stats().await.unwrap().pending, 4);
    }

    #[tokio::test]
    async fn lease_is_exclusive_until_expiry() {
        let buf = MemoryBuffer::new(1);
        assert!(buf.try_acquire("a", Duration::from_millis(30)).await.unwrap());
        assert!(!buf.try_acquire("b", Duration::from_millis(30)).await.unwrap());
        assert!(buf.try_acquire("a", Duration::from_millis(30)).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(buf.try_acquire("b", Duration::from_secs(5)).await.unwrap());
        buf.release("a").await.unwrap();
        assert!(!buf.try_acquire("a", Duration::from_secs(5)).await.unwrap());
        buf.release("b").await.unwrap();
        assert!(buf.try_acquire("a", Duration::from_secs(5)).await.unwrap());
    }
}
