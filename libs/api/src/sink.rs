use std::future::Future;
use std::pin::Pin;

use crate::{Batch, WriteError, WriteResult};

/// Получатель batch'ей drainer'а — транзакционная запись в store.
///
/// Реализация: `SqliteBatchWriter`. Тесты подставляют свои заглушки.
pub trait BatchSink: Send + Sync {
    /// Закоммитить batch. Строчные сбои → `WriteResult.rows_failed`,
    /// сбой всего batch'а → `WriteError`.
    fn write(&self, batch: Batch)
        -> Pin<Box<dyn Future<Output = Result<WriteResult, WriteError>> + Send + '_>>;

    /// Закрыть простаивающие handles. Возвращает число закрытых.
    fn close_idle(&self) -> Pin<Box<dyn Future<Output = usize> + Send + '_>> {
        Box::pin(async { 0 })
    }

    /// Дождаться текущей записи и закрыть всё.
    fn shutdown(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}
