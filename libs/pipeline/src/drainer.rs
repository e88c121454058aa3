use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use tickstore_api::{
    Batch, BatchId, BatchItem, BatchSink, BufferEntry, EntryId, Failure, FailureKind, LeaseStore,
    RecordBuffer, RecoverScope, RetryPolicy, RouteTarget, WriteResult, now_ms,
};

use crate::config::DrainerConfig;
use crate::{DrainMonitor, LeaderLease, PipelineError, Router};

/// Пауза после неудачного цикла или проверки lease.
const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Фаза drainer'а: `Idle → Draining → Grouping → Dispatching → (Acking | Requeueing) → Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DrainState {
    Idle = 0,
    Draining,
    Grouping,
    Dispatching,
    Acking,
    Requeueing,
    /// Lease у другого процесса.
    Standby,
    Stopped,
}

impl DrainState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => DrainState::Draining,
            2 => DrainState::Grouping,
            3 => DrainState::Dispatching,
            4 => DrainState::Acking,
            5 => DrainState::Requeueing,
            6 => DrainState::Standby,
            7 => DrainState::Stopped,
            _ => DrainState::Idle,
        }
    }
}

/// Итог одного drain-цикла.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub dequeued: usize,
    pub batches: usize,
    pub committed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub quarantined: usize,
    /// Не отправленные до таймаута цикла: вернулись в pending без попытки.
    pub released: usize,
    /// Цикл упёрся в `cycle_timeout`, остаток вернулся в буфер.
    pub timed_out: bool,
}

// ═══════════════════════════════════════════════════════════════
//  Drainer
// ═══════════════════════════════════════════════════════════════

/// Единственный потребитель буфера: забирает записи, группирует по
/// `(file, table)`, пишет batch'и и подтверждает только закоммиченное.
///
/// Активен только при удержании `LeaderLease`.
pub struct Drainer {
    buffer: Arc<dyn RecordBuffer>,
    sink: Arc<dyn BatchSink>,
    router: Arc<Router>,
    lease: LeaderLease,
    config: DrainerConfig,
    policy: RetryPolicy,
    monitor: Arc<DrainMonitor>,
    next_batch: u64,
    leader: bool,
    /// Lease ещё ни разу не был нашим в этом процессе.
    first_term: bool,
}

impl Drainer {
    pub fn new(
        buffer: Arc<dyn RecordBuffer>,
        leases: Arc<dyn LeaseStore>,
        sink: Arc<dyn BatchSink>,
        router: Arc<Router>,
        config: DrainerConfig,
    ) -> Self {
        let lease = LeaderLease::new(leases, config.consumer.clone(), config.lease_ttl());
        Self {
            buffer,
            sink,
            router,
            lease,
            policy: config.retry_policy(),
            config,
            monitor: Arc::new(DrainMonitor::new()),
            next_batch: 0,
            leader: false,
            first_term: true,
        }
    }

    /// Подставить общий монитор (его читает HTTP слой).
    pub fn with_monitor(mut self, monitor: Arc<DrainMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn monitor(&self) -> Arc<DrainMonitor> {
        self.monitor.clone()
    }

    pub fn consumer(&self) -> &str {
        &self.config.consumer
    }

    /// Взять или продлить lease. При переходе в лидеры возвращает в
    /// pending чужие in-flight записи (takeover после истёкшего lease).
    pub async fn ensure_leader(&mut self) -> Result<bool, PipelineError> {
        let won = self.lease.renew().await?;
        if won && !self.leader {
            // В первый срок свои in-flight записи тоже осиротели: они от
            // прошлого запуска с тем же именем consumer'а.
            let scope = if self.first_term {
                RecoverScope::All
            } else {
                RecoverScope::NotClaimedBy(self.config.consumer.clone())
            };
            let reverted = self.buffer.recover(scope).await?;
            self.first_term = false;
            tracing::info!(consumer = %self.config.consumer, reverted, "leadership acquired");
        } else if !won && self.leader {
            tracing::warn!(consumer = %self.config.consumer, "leadership lost");
        }
        self.leader = won;
        self.monitor.set_leader(won);
        Ok(won)
    }

    /// Главный цикл до отмены `token`. Начатый цикл всегда доводится до
    /// ack/requeue, отмена проверяется между циклами.
    pub async fn run(mut self, token: CancellationToken) {
        tracing::info!(
            consumer = %self.config.consumer,
            batch_size = self.config.batch_size,
            max_wait_ms = self.config.max_wait_ms,
            "drainer started"
        );
        let standby_poll = (self.config.lease_ttl() / 4).max(Duration::from_millis(50));
        let mut last_maintenance = Instant::now();
        let mut last_stats = Instant::now();

        while !token.is_cancelled() {
            match self.ensure_leader().await {
                Ok(true) => {}
                Ok(false) => {
                    self.monitor.set_state(DrainState::Standby);
                    if sleep_or_cancel(&token, standby_poll).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "lease check failed");
                    self.leader = false;
                    self.monitor.set_leader(false);
                    if sleep_or_cancel(&token, ERROR_BACKOFF).await {
                        break;
                    }
                    continue;
                }
            }

            if last_maintenance.elapsed() >= self.config.maintenance_every() {
                self.maintenance().await;
                last_maintenance = Instant::now();
            }
            if last_stats.elapsed() >= self.config.stats_every() {
                self.log_stats().await;
                last_stats = Instant::now();
            }

            if let Err(e) = self.run_cycle().await {
                tracing::error!(error = %e, "drain cycle failed");
                self.monitor.set_state(DrainState::Idle);
                if sleep_or_cancel(&token, ERROR_BACKOFF).await {
                    break;
                }
            }
        }

        self.monitor.set_state(DrainState::Stopped);
        self.sink.shutdown().await;
        if self.leader {
            if let Err(e) = self.lease.release().await {
                tracing::warn!(error = %e, "lease release failed");
            }
        }
        self.monitor.set_leader(false);
        self.log_stats().await;
        tracing::info!(consumer = %self.config.consumer, "drainer stopped");
    }

    /// Один цикл: dequeue → group → dispatch → ack/requeue.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        let mut report = CycleReport::default();

        self.monitor.set_state(DrainState::Draining);
        let entries = self
            .buffer
            .dequeue_batch(&self.config.consumer, self.config.batch_size, self.config.max_wait())
            .await?;
        if entries.is_empty() {
            self.monitor.set_state(DrainState::Idle);
            return Ok(report);
        }
        report.dequeued = entries.len();

        self.monitor.set_state(DrainState::Grouping);
        let (batches, unroutable) = self.group(entries);
        if !unroutable.is_empty() {
            for f in &unroutable {
                tracing::warn!(entry = %f.entry_id, reason = %f.reason, "unroutable record quarantined");
            }
            report.quarantined = self.buffer.quarantine(&unroutable).await?;
            self.monitor.failures(0, 0, report.quarantined);
        }

        self.monitor.set_state(DrainState::Dispatching);
        let deadline = Instant::now() + self.config.cycle_timeout();
        let mut batches = batches.into_iter();
        while let Some(batch) = batches.next() {
            report.batches += 1;
            let id = batch.id;
            let target = batch.target.clone();
            let ids = batch.entry_ids();

            match tokio::time::timeout_at(deadline, self.sink.write(batch)).await {
                Ok(Ok(result)) => self.settle(id, &target, &ids, result, &mut report).await?,
                Ok(Err(e)) => {
                    tracing::warn!(batch = %id, %target, rows = ids.len(), error = %e, "batch failed, requeueing");
                    let reason = e.to_string();
                    let failures: Vec<Failure> =
                        ids.iter().map(|i| Failure::new(*i, e.kind(), reason.clone())).collect();
                    self.requeue(&failures, &mut report).await?;
                }
                Err(_) => {
                    // Прерванный batch считается попыткой, неотправленные - нет.
                    let reason = format!("drain cycle exceeded {} ms", self.config.cycle_timeout_ms);
                    let failures: Vec<Failure> = ids
                        .iter()
                        .map(|i| Failure::new(*i, FailureKind::Timeout, reason.clone()))
                        .collect();
                    let untouched: Vec<EntryId> = batches.by_ref().flat_map(|b| b.entry_ids()).collect();
                    tracing::warn!(
                        batch = %id,
                        %target,
                        requeued = failures.len(),
                        released = untouched.len(),
                        "drain cycle timed out"
                    );
                    report.timed_out = true;
                    self.requeue(&failures, &mut report).await?;
                    if !untouched.is_empty() {
                        report.released = self.buffer.recover(RecoverScope::Entries(untouched)).await?;
                    }
                    break;
                }
            }
        }

        if report.dead_lettered > 0 {
            tracing::error!(
                dead_lettered = report.dead_lettered,
                "entries exhausted retries and moved to dead-letter"
            );
        }
        self.monitor.cycle_done();
        self.monitor.set_state(DrainState::Idle);
        tracing::debug!(
            dequeued = report.dequeued,
            batches = report.batches,
            committed = report.committed,
            requeued = report.requeued,
            "drain cycle done"
        );
        Ok(report)
    }

    /// Разбить записи по `(file, table)`. Порядок batch'ей — по первой
    /// записи, порядок внутри batch'а — порядок enqueue.
    fn group(&mut self, entries: Vec<BufferEntry>) -> (Vec<Batch>, Vec<Failure>) {
        let mut batches: Vec<Batch> = Vec::new();
        let mut index: HashMap<RouteTarget, usize> = HashMap::new();
        let mut unroutable = Vec::new();

        for entry in entries {
            let route = match self.router.route(&entry.record) {
                Ok(route) => route,
                Err(e) => {
                    unroutable.push(Failure::new(entry.id, FailureKind::Unroutable, e.to_string()));
                    continue;
                }
            };
            let slot = match index.get(&route.target) {
                Some(&slot) => slot,
                None => {
                    self.next_batch += 1;
                    index.insert(route.target.clone(), batches.len());
                    batches.push(Batch {
                        id: BatchId(self.next_batch),
                        target: route.target,
                        shape: route.shape,
                        meta: route.meta,
                        items: Vec::new(),
                    });
                    batches.len() - 1
                }
            };
            batches[slot].items.push(BatchItem { entry_id: entry.id, record: entry.record });
        }

        (batches, unroutable)
    }

    async fn settle(
        &self,
        id: BatchId,
        target: &RouteTarget,
        ids: &[EntryId],
        result: WriteResult,
        report: &mut CycleReport,
    ) -> Result<(), PipelineError> {
        let failed: HashSet<EntryId> = result.rows_failed.iter().map(|f| f.entry_id).collect();
        let committed: Vec<EntryId> = ids.iter().copied().filter(|i| !failed.contains(i)).collect();

        self.monitor.set_state(DrainState::Acking);
        let acked = self.buffer.ack(&committed).await?;
        report.committed += acked;
        self.monitor.batch_done(id, now_ms(), acked);
        tracing::debug!(
            batch = %id,
            %target,
            inserted = result.rows_inserted,
            updated = result.rows_updated,
            unchanged = result.rows_unchanged,
            failed = failed.len(),
            "batch acked"
        );

        if result.rows_failed.is_empty() {
            return Ok(());
        }
        for f in &result.rows_failed {
            tracing::warn!(
                entry = %f.entry_id,
                kind = %f.kind,
                ticker = %f.record.ticker,
                ts_ms = f.record.ts_ms,
                reason = %f.reason,
                "row rejected"
            );
        }
        let failures: Vec<Failure> = result
            .rows_failed
            .iter()
            .map(|f| Failure::new(f.entry_id, f.kind, f.reason.clone()))
            .collect();
        self.requeue(&failures, report).await
    }

    /// Повторяемые сбои — обратно в pending с backoff, остальные и
    /// исчерпавшие попытки — в dead-letter (решает буфер).
    async fn requeue(&self, failures: &[Failure], report: &mut CycleReport) -> Result<(), PipelineError> {
        self.monitor.set_state(DrainState::Requeueing);
        let outcome = self.buffer.requeue(failures, &self.policy).await?;
        report.requeued += outcome.requeued;
        report.dead_lettered += outcome.dead_lettered;
        self.monitor.failures(outcome.requeued, outcome.dead_lettered, 0);
        Ok(())
    }

    async fn maintenance(&self) {
        let cutoff = now_ms() - self.config.claim_timeout_ms as i64;
        match self.buffer.recover(RecoverScope::ClaimedBefore(cutoff)).await {
            Ok(0) => {}
            Ok(reverted) => tracing::warn!(reverted, "stale in-flight entries reverted to pending"),
            Err(e) => tracing::error!(error = %e, "stale claim recovery failed"),
        }
        let closed = self.sink.close_idle().await;
        if closed > 0 {
            tracing::debug!(closed, "idle store handles closed");
        }
    }

    async fn log_stats(&self) {
        match self.buffer.stats().await {
            Ok(s) => tracing::info!(
                pending = s.pending,
                in_flight = s.in_flight,
                dead_letters = s.dead_letters,
                committed_total = s.committed_total,
                capacity = s.capacity,
                "buffer stats"
            ),
            Err(e) => tracing::warn!(error = %e, "buffer stats unavailable"),
        }
    }
}

/// `true`, если токен отменён раньше, чем истекла пауза.
async fn sleep_or_cancel(token: &CancellationToken, pause: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(pause) => false,
        _ = token.cancelled() => true,
    }
}
