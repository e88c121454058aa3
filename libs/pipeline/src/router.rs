use std::collections::{BTreeMap, HashMap};

use tickstore_api::{
    Record, RouteTarget, UnroutableError, date_parts_from_ms, sanitize_identifier,
};
use store_engine::SchemaRegistry;

use crate::PipelineError;
use crate::config::{GroupConfig, Partition};

/// Куда писать запись.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub target: RouteTarget,
    pub shape: Option<String>,
    /// Метаданные группы для `__meta__`.
    pub meta: BTreeMap<String, String>,
}

struct Group {
    /// `{name}_{provider}_{exchange}`, уже санитизированный.
    prefix: String,
    partition: Partition,
    shape: Option<String>,
    meta: BTreeMap<String, String>,
}

// ═══════════════════════════════════════════════════════════════
//  Router
// ═══════════════════════════════════════════════════════════════

/// Отображение запись → (store file, table).
///
/// Чистая функция от конфигурации: без I/O, без состояния между вызовами.
/// Две сборки из одного конфига маршрутизируют одинаково.
pub struct Router {
    groups: Vec<Group>,
    /// (provider, ticker) → group.
    exact: HashMap<(String, String), usize>,
    /// provider → group с пустым списком тикеров.
    catch_all: HashMap<String, usize>,
}

impl Router {
    pub fn new(configs: &[GroupConfig], schemas: &SchemaRegistry) -> Result<Self, PipelineError> {
        let mut groups = Vec::with_capacity(configs.len());
        let mut exact = HashMap::new();
        let mut catch_all = HashMap::new();

        for (idx, cfg) in configs.iter().enumerate() {
            for (field, value) in [("name", &cfg.name), ("provider", &cfg.provider), ("exchange", &cfg.exchange)] {
                if value.trim().is_empty() {
                    return Err(PipelineError::RouteTable(format!("group #{idx}: empty {field}")));
                }
            }
            if let Some(shape) = &cfg.shape {
                if !schemas.contains(shape) {
                    return Err(PipelineError::RouteTable(format!(
                        "group '{}': unknown shape '{shape}'",
                        cfg.name
                    )));
                }
            }

            if cfg.tickers.is_empty() {
                if let Some(prev) = catch_all.insert(cfg.provider.clone(), idx) {
                    return Err(PipelineError::RouteTable(format!(
                        "provider '{}' has two catch-all groups ('{}' and '{}')",
                        cfg.provider, configs[prev].name, cfg.name
                    )));
                }
            }
            for ticker in &cfg.tickers {
                if ticker.trim().is_empty() {
                    return Err(PipelineError::RouteTable(format!("group '{}': empty ticker", cfg.name)));
                }
                if let Some(prev) = exact.insert((cfg.provider.clone(), ticker.clone()), idx) {
                    return Err(PipelineError::RouteTable(format!(
                        "ticker '{ticker}' of provider '{}' is in groups '{}' and '{}'",
                        cfg.provider, configs[prev].name, cfg.name
                    )));
                }
            }

            groups.push(Group {
                prefix: sanitize_identifier(&format!("{}_{}_{}", cfg.name, cfg.provider, cfg.exchange)),
                partition: cfg.partition,
                shape: cfg.shape.clone(),
                meta: BTreeMap::from([
                    ("data_type".to_string(), cfg.name.clone()),
                    ("provider".to_string(), cfg.provider.clone()),
                    ("exchange".to_string(), cfg.exchange.clone()),
                ]),
            });
        }

        tracing::debug!(groups = groups.len(), tickers = exact.len(), "route table built");
        Ok(Self { groups, exact, catch_all })
    }

    pub fn route(&self, record: &Record) -> Result<Route, UnroutableError> {
        let provider = &record.provenance.provider;
        let unroutable = |reason: &str| UnroutableError {
            ticker: record.ticker.clone(),
            provider: provider.clone(),
            reason: reason.to_string(),
        };

        if record.ticker.trim().is_empty() {
            return Err(unroutable("empty ticker"));
        }
        let idx = match self.exact.get(&(provider.clone(), record.ticker.clone())) {
            Some(&idx) => idx,
            None => match self.catch_all.get(provider) {
                Some(&idx) => idx,
                None if self.knows_provider(provider) => {
                    return Err(unroutable("ticker is not configured for this provider"));
                }
                None => return Err(unroutable("unknown provider")),
            },
        };
        let group = &self.groups[idx];

        Ok(Route {
            target: RouteTarget {
                file: file_id(&group.prefix, group.partition, record.ts_ms),
                table: sanitize_identifier(&record.ticker),
            },
            shape: group.shape.clone(),
            meta: group.meta.clone(),
        })
    }

    fn knows_provider(&self, provider: &str) -> bool {
        self.exact.keys().any(|(p, _)| p == provider)
    }
}

fn file_id(prefix: &str, partition: Partition, ts_ms: i64) -> String {
    let (y, m, d) = date_parts_from_ms(ts_ms);
    match partition {
        Partition::None => prefix.to_string(),
        Partition::Year => format!("{prefix}_{y:04}"),
        Partition::Month => format!("{prefix}_{y:04}_{m:02}"),
        Partition::Day => format!("{prefix}_{y:04}_{m:02}_{d:02}"),
    }
}
