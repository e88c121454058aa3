use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::{
    BufferEntry, BufferError, BufferStats, DeadLetter, EntryId, Failure, LeaseError, Record,
    RecoverScope, RequeueOutcome, RetryPolicy,
};

// ════════════════════════════════════════════════════════════════
//  Buffer Traits
// ════════════════════════════════════════════════════════════════

/// Промежуточная очередь между producer'ами и единственным drainer'ом.
///
/// `enqueue*` безопасны при любой конкуренции и никогда не ждут места:
/// при переполнении сразу возвращают `BufferError::Full`.
/// Остальные методы предназначены для одного активного drainer'а.
///
/// Реализации: `MemoryBuffer` (volatile), `SqliteBuffer` (журнал на диске).
pub trait RecordBuffer: Send + Sync {
    /// Поставить типизированную запись в очередь.
    fn enqueue(&self, record: &Record)
        -> Pin<Box<dyn Future<Output = Result<EntryId, BufferError>> + Send + '_>>;

    /// Поставить сырой payload (JSON) без проверки. Запись, которая не
    /// десериализуется, уйдёт в dead-letter при dequeue.
    fn enqueue_raw(&self, payload: Vec<u8>)
        -> Pin<Box<dyn Future<Output = Result<EntryId, BufferError>> + Send + '_>>;

    /// Забрать до `max_n` pending записей в порядке enqueue.
    ///
    /// Возвращает, как только набрано `max_n` или истёк `max_wait`.
    /// Выданные записи переходят в in-flight с пометкой `consumer`.
    fn dequeue_batch<'a>(
        &'a self,
        consumer: &'a str,
        max_n: usize,
        max_wait: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<BufferEntry>, BufferError>> + Send + 'a>>;

    /// Подтвердить коммит: in-flight → committed → удалить.
    fn ack(&self, ids: &[EntryId])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>;

    /// Вернуть записи в pending с attempts+1 и backoff. Исчерпавшие
    /// `max_attempts` уходят в dead-letter с причиной сбоя.
    fn requeue<'a>(&'a self, failures: &'a [Failure], policy: &'a RetryPolicy)
        -> Pin<Box<dyn Future<Output = Result<RequeueOutcome, BufferError>> + Send + 'a>>;

    /// Сразу в dead-letter, без повторов (malformed, unroutable).
    fn quarantine(&self, failures: &[Failure])
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>;

    /// Вернуть зависшие in-flight записи в pending. Attempts не растут.
    fn recover(&self, scope: RecoverScope)
        -> Pin<Box<dyn Future<Output = Result<usize, BufferError>> + Send + '_>>;

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<BufferStats, BufferError>> + Send + '_>>;

    /// Последние `limit` записей dead-letter трассы, новые первыми.
    fn dead_letters(&self, limit: usize)
        -> Pin<Box<dyn Future<Output = Result<Vec<DeadLetter>, BufferError>> + Send + '_>>;
}

/// Хранилище leader lease. Живёт рядом с буфером, чтобы все
/// кандидаты в drainer'ы видели один и тот же lease.
pub trait LeaseStore: Send + Sync {
    /// Взять или продлить lease до `now + ttl`. `false` — lease держит
    /// другой holder и он ещё не истёк.
    fn try_acquire<'a>(&'a self, holder: &'a str, ttl: Duration)
        -> Pin<Box<dyn Future<Output = Result<bool, LeaseError>> + Send + 'a>>;

    /// Отпустить lease, если он принадлежит `holder`.
    fn release<'a>(&'a self, holder: &'a str)
        -> Pin<Box<dyn Future<Output = Result<(), LeaseError>> + Send + 'a>>;
}
