use std::future::Future;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use tickstore_api::{BufferEntry, BufferError};

/// Как часто перепроверять очередь без уведомления: записи с истёкшим
/// backoff и enqueue из других процессов (SqliteBuffer) не будят Notify.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Bounded-latency батчинг: добирать записи через `claim(need)` до
/// `max_n` или до истечения `max_wait`, что наступит раньше.
pub(crate) async fn collect_until<F, Fut>(
    notify: &Notify,
    max_n: usize,
    max_wait: Duration,
    mut claim: F,
) -> Result<Vec<BufferEntry>, BufferError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<Vec<BufferEntry>, BufferError>>,
{
    let mut out = Vec::new();
    if max_n == 0 {
        return Ok(out);
    }
    let deadline = Instant::now() + max_wait;

    loop {
        out.extend(claim(max_n - out.len()).await?);
        if out.len() >= max_n {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        let nap = (deadline - now).min(POLL_INTERVAL);
        let _ = tokio::time::timeout(nap, notify.notified()).await;
    }

    Ok(out)
}
