use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use buffer_engine::{MemoryBuffer, SqliteBuffer};
use pipeline::config::{DrainerConfig, GroupConfig, Partition};
use pipeline::{DrainState, Drainer, Router};
use store_engine::{SchemaRegistry, SqliteBatchWriter, StoreConfig, StoreReader, StoreRegistry};
use tickstore_api::{
    Batch, BatchSink, FailureKind, Fields, LeaseStore, Provenance, Record, RecordBuffer,
    RowFailure, WriteError, WriteResult,
};

const FILE: &str = "intraday_sim_XTST";

fn record(ticker: &str, ts_ms: i64, price: f64) -> Record {
    let mut fields = Fields::new();
    fields.insert("price".into(), json!(price));
    Record::new(ticker, ts_ms, fields, Provenance {
        provider: "sim".into(),
        job_id: "test".into(),
        sequence: ts_ms as u64,
    })
}

fn router() -> Arc<Router> {
    let groups = [GroupConfig {
        name: "intraday".into(),
        provider: "sim".into(),
        exchange: "XTST".into(),
        partition: Partition::None,
        shape: None,
        tickers: vec![],
    }];
    Arc::new(Router::new(&groups, &SchemaRegistry::default()).unwrap())
}

fn drainer_config(consumer: &str) -> DrainerConfig {
    DrainerConfig {
        consumer: consumer.into(),
        batch_size: 128,
        max_wait_ms: 20,
        max_attempts: 3,
        base_backoff_ms: 0,
        max_backoff_ms: 0,
        cycle_timeout_ms: 5_000,
        lease_ttl_ms: 10_000,
        ..DrainerConfig::default()
    }
}

fn store(dir: &std::path::Path) -> (Arc<SqliteBatchWriter>, StoreReader) {
    let config = StoreConfig { data_dir: dir.join("stores"), ..StoreConfig::default() };
    let registry = StoreRegistry::new(&config).unwrap();
    let writer = SqliteBatchWriter::new(registry, Arc::new(SchemaRegistry::default()), config.write_timeout());
    (Arc::new(writer), StoreReader::new(&config))
}

fn total_rows(reader: &StoreReader) -> i64 {
    reader
        .tables(FILE)
        .unwrap()
        .iter()
        .map(|t| reader.count(FILE, t).unwrap())
        .sum()
}

async fn drain_all(drainer: &mut Drainer, buffer: &dyn RecordBuffer) {
    for _ in 0..200 {
        drainer.run_cycle().await.unwrap();
        if buffer.stats().await.unwrap().depth() == 0 {
            return;
        }
    }
    panic!("buffer did not drain");
}

/// Запоминает batch'и и "коммитит" всё.
#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Batch>>,
}

impl BatchSink for RecordingSink {
    fn write(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = Result<WriteResult, WriteError>> + Send + '_>>
    {
        Box::pin(async move {
            let n = batch.len();
            self.batches.lock().unwrap().push(batch);
            Ok(WriteResult { rows_committed: n, rows_inserted: n, ..WriteResult::default() })
        })
    }
}

/// Коммитит batch, кроме строк с `ts_ms == rejected_ts`: те отклоняются
/// как конфликт ограничения.
struct RejectingSink {
    rejected_ts: i64,
    seen: Mutex<Vec<Vec<i64>>>,
}

impl BatchSink for RejectingSink {
    fn write(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = Result<WriteResult, WriteError>> + Send + '_>>
    {
        Box::pin(async move {
            self.seen.lock().unwrap().push(batch.items.iter().map(|i| i.record.ts_ms).collect());
            let mut result = WriteResult::default();
            for item in batch.items {
                if item.record.ts_ms == self.rejected_ts {
                    result.rows_failed.push(RowFailure {
                        entry_id: item.entry_id,
                        record: item.record,
                        kind: FailureKind::WriteConflict,
                        reason: "CHECK constraint failed: price > 0".into(),
                    });
                } else {
                    result.rows_inserted += 1;
                }
            }
            result.rows_committed = result.rows_inserted;
            Ok(result)
        })
    }
}

/// Store недоступен или отвечает дольше `delay`.
struct BrokenSink {
    delay: Duration,
}

impl BatchSink for BrokenSink {
    fn write(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = Result<WriteResult, WriteError>> + Send + '_>>
    {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            Err(WriteError::StoreUnavailable { file: batch.target.file, detail: "disk I/O error".into() })
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_commit_each_record_once() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(SqliteBuffer::open(dir.path().join("buffer.db"), 100_000).unwrap());
    let (writer, reader) = store(dir.path());
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), writer, router(), drainer_config("d1"));
    assert!(drainer.ensure_leader().await.unwrap());

    let producers: Vec<_> = (0..10)
        .map(|p| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for i in 0..100 {
                    buffer.enqueue(&record(&format!("T{p}"), i, i as f64)).await.unwrap();
                }
            })
        })
        .collect();

    let mut committed = 0;
    for _ in 0..500 {
        committed += drainer.run_cycle().await.unwrap().committed;
        if committed == 1000 {
            break;
        }
    }
    for p in producers {
        p.await.unwrap();
    }

    assert_eq!(committed, 1000);
    assert_eq!(total_rows(&reader), 1000);
    assert_eq!(reader.tables(FILE).unwrap().len(), 10);
    let stats = buffer.stats().await.unwrap();
    assert_eq!((stats.depth(), stats.dead_letters, stats.committed_total), (0, 0, 1000));
}

#[tokio::test]
async fn redelivered_records_leave_store_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let (writer, reader) = store(dir.path());
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), writer, router(), drainer_config("d1"));

    for round in 0..2 {
        for ts in 0..5 {
            buffer.enqueue(&record("AAPL", ts, 100.0 + ts as f64)).await.unwrap();
        }
        drain_all(&mut drainer, &*buffer).await;
        assert_eq!(reader.count(FILE, "AAPL").unwrap(), 5, "round {round}");
    }

    let rows = reader.read_range(FILE, "AAPL", None, None, None).unwrap();
    let prices: Vec<_> = rows.iter().map(|r| r.fields["price"].clone()).collect();
    assert_eq!(prices, [json!(100.0), json!(101.0), json!(102.0), json!(103.0), json!(104.0)]);
    assert_eq!(buffer.stats().await.unwrap().committed_total, 10);
}

#[tokio::test]
async fn malformed_and_unroutable_records_are_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let (writer, reader) = store(dir.path());
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), writer, router(), drainer_config("d1"));

    buffer.enqueue(&record("AAPL", 1, 1.0)).await.unwrap();
    // Без ticker: не десериализуется.
    buffer
        .enqueue_raw(br#"{"ts_ms": 2, "provenance": {"provider": "sim", "job_id": "t"}}"#.to_vec())
        .await
        .unwrap();
    buffer.enqueue(&record("AAPL", 3, 3.0)).await.unwrap();
    let mut foreign = record("AAPL", 4, 4.0);
    foreign.provenance.provider = "unknown".into();
    buffer.enqueue(&foreign).await.unwrap();

    let report = drainer.run_cycle().await.unwrap();
    assert_eq!(report.dequeued, 3);
    assert_eq!(report.committed, 2);
    assert_eq!(report.quarantined, 1);
    assert_eq!(reader.count(FILE, "AAPL").unwrap(), 2);

    let dead = buffer.dead_letters(10).await.unwrap();
    let mut kinds: Vec<_> = dead.iter().map(|d| d.kind).collect();
    kinds.sort_by_key(|k| k.as_str());
    assert_eq!(kinds, [FailureKind::Malformed, FailureKind::Unroutable]);
    assert!(dead.iter().any(|d| d.payload.contains("\"ts_ms\": 2")));
    assert_eq!(buffer.stats().await.unwrap().depth(), 0);
}

#[tokio::test]
async fn interleaved_tickers_split_into_ordered_batches() {
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let sink = Arc::new(RecordingSink::default());
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), sink.clone(), router(), drainer_config("d1"));

    for (ticker, ts) in [("AAPL", 1), ("MSFT", 1), ("AAPL", 2), ("MSFT", 2), ("AAPL", 3)] {
        buffer.enqueue(&record(ticker, ts, 0.0)).await.unwrap();
    }
    let report = drainer.run_cycle().await.unwrap();
    assert_eq!((report.batches, report.committed), (2, 5));

    let batches = sink.batches.lock().unwrap();
    let seen: Vec<(String, Vec<i64>)> = batches
        .iter()
        .map(|b| (b.target.table.clone(), b.items.iter().map(|i| i.record.ts_ms).collect()))
        .collect();
    assert_eq!(seen, [("AAPL".to_string(), vec![1, 2, 3]), ("MSFT".to_string(), vec![1, 2])]);
    assert!(batches.iter().all(|b| b.target.file == FILE && b.meta["exchange"] == "XTST"));
}

#[tokio::test]
async fn unavailable_store_retries_then_dead_letters() {
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let sink = Arc::new(BrokenSink { delay: Duration::ZERO });
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), sink, router(), drainer_config("d1"));
    buffer.enqueue(&record("AAPL", 1, 1.0)).await.unwrap();

    let first = drainer.run_cycle().await.unwrap();
    assert_eq!((first.requeued, first.dead_lettered), (1, 0));
    let second = drainer.run_cycle().await.unwrap();
    assert_eq!((second.requeued, second.dead_lettered), (1, 0));
    let third = drainer.run_cycle().await.unwrap();
    assert_eq!((third.requeued, third.dead_lettered), (0, 1));

    let dead = buffer.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].kind, FailureKind::StoreUnavailable);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].reason.contains("disk I/O error"));
    assert_eq!(drainer.monitor().snapshot().dead_lettered, 1);
}

#[tokio::test]
async fn rejected_row_is_retried_alone_then_dead_lettered() {
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let sink = Arc::new(RejectingSink { rejected_ts: 2, seen: Mutex::default() });
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), sink.clone(), router(), drainer_config("d1"));
    for ts in 1..=3 {
        buffer.enqueue(&record("AAPL", ts, ts as f64)).await.unwrap();
    }

    let first = drainer.run_cycle().await.unwrap();
    assert_eq!((first.committed, first.requeued, first.dead_lettered), (2, 1, 0));
    let stats = buffer.stats().await.unwrap();
    assert_eq!((stats.committed_total, stats.pending, stats.in_flight), (2, 1, 0));

    let second = drainer.run_cycle().await.unwrap();
    assert_eq!((second.dequeued, second.committed, second.requeued), (1, 0, 1));
    let third = drainer.run_cycle().await.unwrap();
    assert_eq!((third.dequeued, third.dead_lettered), (1, 1));

    assert_eq!(*sink.seen.lock().unwrap(), [vec![1, 2, 3], vec![2], vec![2]]);
    let dead = buffer.dead_letters(10).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].kind, FailureKind::WriteConflict);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].reason.contains("CHECK constraint"));
    let stats = buffer.stats().await.unwrap();
    assert_eq!((stats.depth(), stats.committed_total, stats.dead_letters), (0, 2, 1));
}

#[tokio::test]
async fn slow_cycle_is_requeued_with_timeout() {
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let sink = Arc::new(BrokenSink { delay: Duration::from_secs(5) });
    let config = DrainerConfig { cycle_timeout_ms: 50, ..drainer_config("d1") };
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), sink, router(), config);
    buffer.enqueue(&record("AAPL", 1, 1.0)).await.unwrap();
    buffer.enqueue(&record("MSFT", 1, 1.0)).await.unwrap();

    let report = drainer.run_cycle().await.unwrap();
    assert!(report.timed_out);
    // AAPL успел уйти в store и считается попыткой, MSFT не отправлялся.
    assert_eq!((report.requeued, report.released), (1, 1));
    let stats = buffer.stats().await.unwrap();
    assert_eq!((stats.pending, stats.in_flight), (2, 0));

    let redelivered = buffer.dequeue_batch("d1", 10, Duration::ZERO).await.unwrap();
    let attempts: Vec<(String, u32)> =
        redelivered.iter().map(|e| (e.record.ticker.clone(), e.attempts)).collect();
    assert_eq!(attempts, [("AAPL".to_string(), 1), ("MSFT".to_string(), 0)]);
}

#[tokio::test]
async fn entries_of_a_crashed_drainer_are_recovered() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffer.db");
    {
        let buffer = SqliteBuffer::open(&path, 1000).unwrap();
        for ts in 0..3 {
            buffer.enqueue(&record("AAPL", ts, 1.0)).await.unwrap();
        }
        let claimed = buffer.dequeue_batch("crashed", 10, Duration::ZERO).await.unwrap();
        assert_eq!(claimed.len(), 3);
        // Процесс падает до ack.
    }

    let buffer = Arc::new(SqliteBuffer::open(&path, 1000).unwrap());
    assert_eq!(buffer.stats().await.unwrap().in_flight, 3);
    let (writer, reader) = store(dir.path());
    let mut drainer = Drainer::new(buffer.clone(), buffer.clone(), writer, router(), drainer_config("d2"));

    assert!(drainer.ensure_leader().await.unwrap());
    let report = drainer.run_cycle().await.unwrap();
    assert_eq!(report.committed, 3);
    assert_eq!(reader.count(FILE, "AAPL").unwrap(), 3);
}

#[tokio::test]
async fn standby_drainer_takes_over_a_lapsed_lease() {
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let sink = Arc::new(RecordingSink::default());
    let short = DrainerConfig { lease_ttl_ms: 50, ..drainer_config("a") };
    let mut a = Drainer::new(buffer.clone(), buffer.clone(), sink.clone(), router(), short);
    let mut b = Drainer::new(buffer.clone(), buffer.clone(), sink.clone(), router(), drainer_config("b"));

    assert!(a.ensure_leader().await.unwrap());
    assert!(!b.ensure_leader().await.unwrap());

    // `a` забрал записи и завис.
    for ts in 0..4 {
        buffer.enqueue(&record("AAPL", ts, 1.0)).await.unwrap();
    }
    let claimed = buffer.dequeue_batch(a.consumer(), 10, Duration::ZERO).await.unwrap();
    assert_eq!(claimed.len(), 4);

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(b.ensure_leader().await.unwrap());
    assert!(b.monitor().is_leader());
    assert!(!a.ensure_leader().await.unwrap());

    let report = b.run_cycle().await.unwrap();
    assert_eq!(report.committed, 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn run_loop_drains_until_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let buffer = Arc::new(MemoryBuffer::new(1000));
    let (writer, reader) = store(dir.path());
    let drainer = Drainer::new(buffer.clone(), buffer.clone(), writer, router(), drainer_config("d1"));
    let monitor = drainer.monitor();

    let token = CancellationToken::new();
    let handle = tokio::spawn(drainer.run(token.clone()));

    for ts in 0..50 {
        buffer.enqueue(&record("MSFT", ts, 1.0)).await.unwrap();
    }
    for _ in 0..250 {
        if buffer.stats().await.unwrap().committed_total == 50 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    token.cancel();
    handle.await.unwrap();

    assert_eq!(reader.count(FILE, "MSFT").unwrap(), 50);
    let snap = monitor.snapshot();
    assert_eq!(snap.state, DrainState::Stopped);
    assert!(!snap.leader);
    assert!(snap.last_batch_id.is_some());

    // Lease отпущен: следующий кандидат становится лидером сразу.
    let leases: Arc<dyn LeaseStore> = buffer;
    assert!(leases.try_acquire("next", Duration::from_secs(1)).await.unwrap());
}
