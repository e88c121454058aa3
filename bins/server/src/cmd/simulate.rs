use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use tickstore_api::{BufferError, Fields, Provenance, Record, RecordBuffer, now_ms};

use super::Stack;
use crate::config::{ServerConfig, SimulateArgs};
use crate::error::ServerError;

const FULL_BACKOFF_START: Duration = Duration::from_millis(10);
const FULL_BACKOFF_MAX: Duration = Duration::from_secs(1);

// ═══════════════════════════════════════════════════════════════
//  Instrument
// ═══════════════════════════════════════════════════════════════

struct Instrument {
    ticker: String,
    price: f64,
    step: f64,
}

impl Instrument {
    fn new(ticker: &str, rng: &mut Rng) -> Self {
        let price = 10.0 + rng.next_f64() * 490.0;
        Self { ticker: ticker.to_string(), price, step: price * 0.002 }
    }

    fn tick(&mut self, rng: &mut Rng) {
        let delta = (rng.next_f64() * 2.0 - 1.0) * self.step;
        self.price += delta;
        if self.price < self.step {
            self.price = self.step;
        }
    }

    /// OHLCV бар из четырёх тиков.
    fn bar(&mut self, rng: &mut Rng, ts_ms: i64, provenance: Provenance) -> Record {
        let open = self.price;
        let (mut high, mut low) = (open, open);
        for _ in 0..4 {
            self.tick(rng);
            high = high.max(self.price);
            low = low.min(self.price);
        }
        let volume = rng.next_intn(10_000) as i64 + 1;

        let mut fields = Fields::new();
        fields.insert("open".into(), json!(open));
        fields.insert("high".into(), json!(high));
        fields.insert("low".into(), json!(low));
        fields.insert("close".into(), json!(self.price));
        fields.insert("volume".into(), json!(volume));
        Record::new(self.ticker.clone(), ts_ms, fields, provenance)
    }
}

// ═══════════════════════════════════════════════════════════════
//  RNG (xorshift64)
// ═══════════════════════════════════════════════════════════════

struct Rng {
    state: u64,
}

impl Rng {
    fn new(seed: i64) -> Self {
        let state = if seed == 0 {
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
                | 1
        } else {
            seed as u64
        };
        Self { state }
    }

    fn next_u64(&mut self) -> u64 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        self.state
    }

    /// [0, 1)
    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / ((1u64 << 53) as f64)
    }

    fn next_intn(&mut self, n: usize) -> usize {
        (self.next_u64() % n as u64) as usize
    }
}

// ═══════════════════════════════════════════════════════════════
//  Run
// ═══════════════════════════════════════════════════════════════

/// Тикеры провайдера из `[[groups]]`. Для catch-all групп — синтетические.
fn tickers_for(config: &ServerConfig, provider: &str, producers: usize) -> Result<Vec<String>, ServerError> {
    let groups: Vec<_> = config.groups.iter().filter(|g| g.provider == provider).collect();
    if groups.is_empty() {
        return Err(ServerError::Simulate(format!("no [[groups]] for provider '{provider}'")));
    }
    let mut tickers: Vec<String> = groups.iter().flat_map(|g| g.tickers.iter().cloned()).collect();
    if groups.iter().any(|g| g.tickers.is_empty()) {
        tickers.extend((0..producers).map(|i| format!("SIM{i}")));
    }
    tickers.sort();
    tickers.dedup();
    Ok(tickers)
}

struct ProducerReport {
    pushed: usize,
    full_retries: usize,
}

/// Producer: `bars` баров своего тикера, повтор с backoff на `Full`.
async fn produce(
    buffer: Arc<dyn RecordBuffer>,
    mut instrument: Instrument,
    mut rng: Rng,
    timestamps: Vec<i64>,
    provider: String,
    job_id: String,
) -> Result<ProducerReport, BufferError> {
    let mut report = ProducerReport { pushed: 0, full_retries: 0 };
    for (sequence, ts_ms) in timestamps.into_iter().enumerate() {
        let record = instrument.bar(&mut rng, ts_ms, Provenance {
            provider: provider.clone(),
            job_id: job_id.clone(),
            sequence: sequence as u64,
        });
        let mut backoff = FULL_BACKOFF_START;
        loop {
            match buffer.enqueue(&record).await {
                Ok(_) => break,
                Err(e) if e.is_transient() => {
                    report.full_retries += 1;
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(FULL_BACKOFF_MAX);
                }
                Err(e) => return Err(e),
            }
        }
        report.pushed += 1;
    }
    Ok(report)
}

pub async fn run(args: SimulateArgs) -> Result<(), ServerError> {
    if args.producers == 0 || args.bars == 0 || args.interval_ms <= 0 {
        return Err(ServerError::Simulate("--producers, --bars and --interval-ms must be > 0".into()));
    }
    let config = ServerConfig::load(&args.config)?;
    let provider = match &args.provider {
        Some(p) => p.clone(),
        None => config.groups[0].provider.clone(),
    };
    let tickers = tickers_for(&config, &provider, args.producers)?;

    let token = CancellationToken::new();
    let stack = Stack::build(&config)?;
    let drain_handle = tokio::spawn(stack.drainer(&config).run(token.clone()));

    let total_bars = (args.bars * args.producers) as i64;
    let start_ms = now_ms() - total_bars * args.interval_ms;
    let started = std::time::Instant::now();
    tracing::info!(
        producers = args.producers,
        bars = args.bars,
        provider = %provider,
        tickers = tickers.len(),
        "simulation started"
    );

    let mut seed_rng = Rng::new(args.seed);
    let mut producers = Vec::with_capacity(args.producers);
    for p in 0..args.producers {
        let rng = Rng::new((seed_rng.next_u64() | 1) as i64);
        let instrument = Instrument::new(&tickers[p % tickers.len()], &mut seed_rng);
        // Producer'ы одного тикера чередуют свои бары, ключи не пересекаются.
        let timestamps = (0..args.bars)
            .map(|i| start_ms + ((i * args.producers + p) as i64) * args.interval_ms)
            .collect();
        producers.push(tokio::spawn(produce(
            stack.backend.buffer.clone(),
            instrument,
            rng,
            timestamps,
            provider.clone(),
            format!("simulate-{p}"),
        )));
    }

    let (mut pushed, mut full_retries) = (0, 0);
    for handle in producers {
        let report = handle
            .await
            .map_err(|e| ServerError::Simulate(format!("producer task: {e}")))?
            .map_err(|e| ServerError::Simulate(format!("producer: {e}")))?;
        pushed += report.pushed;
        full_retries += report.full_retries;
    }
    tracing::info!(pushed, full_retries, elapsed_ms = started.elapsed().as_millis() as u64, "producers done");

    // --- Ждём, пока drainer разберёт буфер ---
    let deadline = tokio::time::Instant::now() + Duration::from_secs(args.drain_timeout_secs);
    loop {
        let stats = stack.backend.buffer.stats().await.map_err(|e| ServerError::Simulate(e.to_string()))?;
        if stats.depth() == 0 {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            tracing::warn!(pending = stats.pending, in_flight = stats.in_flight, "drain timeout, stopping");
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    token.cancel();
    drain_handle
        .await
        .map_err(|e| ServerError::Simulate(format!("drainer task: {e}")))?;

    let stats = stack.backend.buffer.stats().await.map_err(|e| ServerError::Simulate(e.to_string()))?;
    let summary = json!({
        "pushed": pushed,
        "full_retries": full_retries,
        "elapsed_ms": started.elapsed().as_millis() as u64,
        "buffer": stats,
        "drainer": stack.monitor.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary).unwrap_or_default());
    Ok(())
}
