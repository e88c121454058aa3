use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

pub use pipeline::config::{BufferConfig, DrainerConfig, GroupConfig, ShapeConfig, StoreConfig};

use crate::error::ServerError;

#[derive(Parser)]
#[command(name = "tickstore-server", about = "Буферизованная запись временных рядов инструментов")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Запустить сервер
    Serve(ServeArgs),
    /// Прогнать синтетические OHLCV записи через буфер и drainer
    Simulate(SimulateArgs),
}

#[derive(Args, Clone, Debug)]
pub struct ServeArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,
}

#[derive(Args, Clone, Debug)]
pub struct SimulateArgs {
    /// Путь к TOML конфиг файлу
    #[arg(long, default_value = "config.toml", env = "CONFIG_PATH")]
    pub config: String,

    /// Число параллельных producer'ов
    #[arg(long, default_value_t = 4)]
    pub producers: usize,

    /// Баров на producer'а
    #[arg(long, default_value_t = 1_000)]
    pub bars: usize,

    /// Провайдер из [[groups]] (по умолчанию первый)
    #[arg(long)]
    pub provider: Option<String>,

    /// Интервал бара, мс
    #[arg(long, default_value_t = 60_000)]
    pub interval_ms: i64,

    /// Seed генератора (0 = от времени)
    #[arg(long, default_value_t = 0)]
    pub seed: i64,

    /// Сколько ждать опустошения буфера после producer'ов, сек
    #[arg(long, default_value_t = 60)]
    pub drain_timeout_secs: u64,
}

// ---- TOML Config ----

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// `Retry-After` (сек) в ответ на переполнение буфера.
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub drainer: DrainerConfig,
    #[serde(default)]
    pub schemas: Vec<ShapeConfig>,
    #[serde(default)]
    pub groups: Vec<GroupConfig>,
}

fn default_api_port() -> u16 {
    9200
}
fn default_retry_after_secs() -> u64 {
    1
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, ServerError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config { context: "read", detail: format!("'{path}': {e}") })?;
        Self::parse(&content)
            .map_err(|e| match e {
                ServerError::Config { context, detail } => {
                    ServerError::Config { context, detail: format!("'{path}': {detail}") }
                }
                other => other,
            })
    }

    pub fn parse(content: &str) -> Result<Self, ServerError> {
        let config: Self = toml::from_str(content)
            .map_err(|e| ServerError::Config { context: "parse", detail: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ServerError> {
        self.buffer
            .validate()
            .map_err(|detail| ServerError::Config { context: "buffer", detail })?;
        self.store
            .validate()
            .map_err(|detail| ServerError::Config { context: "store", detail })?;
        self.drainer
            .validate()
            .map_err(|detail| ServerError::Config { context: "drainer", detail })?;
        if self.groups.is_empty() {
            return Err(ServerError::NoComponents("[[groups]]"));
        }
        Ok(())
    }
}
