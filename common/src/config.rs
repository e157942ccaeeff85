use crate::util::{parse_bool, parse_list, SerdeLevelFilter};
use anyhow::{anyhow, Context};
use log::LevelFilter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    env::{self, VarError},
    fmt::Display,
    fs,
    path::Path,
    str::FromStr,
};
use time::UtcOffset;

const KEY_ID_ENV_VAR: &str = "APCA_API_KEY_ID";
const SECRET_KEY_ENV_VAR: &str = "APCA_API_SECRET_KEY";
const CONFIG_PATH_ENV_VAR: &str = "CONFIG_PATH";
const DEFAULT_CONFIG_PATH: &str = "./config.json";

pub struct Config {
    pub keys: ApiKeys,
    pub urls: Urls,
    pub trading: TradingConfig,
    pub strategy: StrategyConfig,
    pub storage: StorageConfig,
    pub stream: StreamConfig,
    pub utc_offset: UtcOffset,
    pub log_level_filter: LevelFilter,
}

impl Config {
    /// Loads the on-disk config (creating it with defaults if it does not exist yet) and layers
    /// the process environment on top of it.
    pub fn load() -> anyhow::Result<Self> {
        // This has to happen before any other thread is spawned, otherwise the local offset
        // cannot be determined soundly on unix.
        let local_offset = UtcOffset::current_local_offset().ok();

        let config_path = read_opt_env_var(CONFIG_PATH_ENV_VAR)?
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_owned());
        let on_disk_config = OnDiskConfig::read_or_create(Path::new(&config_path))?;

        Self::from_sources(on_disk_config, local_offset, read_opt_env_var)
    }

    pub fn from_sources<F>(
        mut on_disk_config: OnDiskConfig,
        local_offset: Option<UtcOffset>,
        lookup: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> anyhow::Result<Option<String>>,
    {
        let keys = ApiKeys::from_lookup(&lookup)?;
        on_disk_config.apply_env(&lookup)?;

        let utc_offset = local_offset
            .or(on_disk_config.utc_offset)
            .unwrap_or(UtcOffset::UTC);

        let me = Self {
            keys,
            urls: on_disk_config.urls,
            trading: on_disk_config.trading,
            strategy: on_disk_config.strategy,
            storage: on_disk_config.storage,
            stream: on_disk_config.stream,
            utc_offset,
            log_level_filter: on_disk_config.log_level_filter,
        };

        me.validate()?;
        Ok(me)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let strategy = &self.strategy;

        if strategy.short_window == 0 || strategy.short_window >= strategy.long_window {
            return Err(anyhow!(
                "Short window ({}) must be positive and smaller than the long window ({})",
                strategy.short_window,
                strategy.long_window
            ));
        }

        if strategy.stop_loss <= Decimal::ZERO || strategy.take_profit <= Decimal::ZERO {
            return Err(anyhow!(
                "Stop-loss ({}) and take-profit ({}) must be positive fractions",
                strategy.stop_loss,
                strategy.take_profit
            ));
        }

        let utilization = self.trading.capital_utilization;
        if utilization <= Decimal::ZERO || utilization > Decimal::ONE {
            return Err(anyhow!(
                "Capital utilization must be within (0, 1], got {utilization}"
            ));
        }

        if self.trading.quantity <= Decimal::ZERO {
            return Err(anyhow!(
                "Order quantity must be positive, got {}",
                self.trading.quantity
            ));
        }

        if self.trading.symbol.is_empty() {
            return Err(anyhow!("Trading symbol cannot be empty"));
        }

        Ok(())
    }
}

pub struct ApiKeys {
    pub alpaca_key_id: String,
    pub alpaca_secret_key: String,
}

impl ApiKeys {
    fn from_lookup<F>(lookup: &F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> anyhow::Result<Option<String>>,
    {
        let required = |env_var: &str| {
            lookup(env_var)?.ok_or_else(|| anyhow!("Missing required env var {env_var}"))
        };

        Ok(Self {
            alpaca_key_id: required(KEY_ID_ENV_VAR)?,
            alpaca_secret_key: required(SECRET_KEY_ENV_VAR)?,
        })
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Urls {
    pub alpaca_api_base: String,
    pub alpaca_data_api: String,
    pub alpaca_stream_url: String,
    /// Equity data feed, `iex` or `sip`.
    pub alpaca_stream_endpoint: String,
    pub crypto_location: String,
}

impl Default for Urls {
    fn default() -> Self {
        Self {
            alpaca_api_base: "https://paper-api.alpaca.markets/v2".to_owned(),
            alpaca_data_api: "https://data.alpaca.markets".to_owned(),
            alpaca_stream_url: "wss://stream.data.alpaca.markets".to_owned(),
            alpaca_stream_endpoint: "iex".to_owned(),
            crypto_location: "us".to_owned(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarSize {
    Minute,
    Day,
}

impl BarSize {
    /// The timeframe parameter understood by the historical bars endpoints.
    pub fn timeframe(&self) -> &'static str {
        match self {
            Self::Minute => "1Min",
            Self::Day => "1Day",
        }
    }
}

impl FromStr for BarSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "min" | "1min" => Ok(Self::Minute),
            "day" | "1day" => Ok(Self::Day),
            other => Err(format!("unsupported bar size \"{other}\"")),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbol: String,
    pub bar_size: BarSize,
    pub crypto_symbols: Vec<String>,
    pub allowed_crypto_exchanges: Vec<String>,
    /// Fixed order size used by strategies that do not size from available cash.
    pub quantity: Decimal,
    pub capital_utilization: Decimal,
    pub history_lookback_hours: u32,
}

impl TradingConfig {
    pub fn is_crypto(&self) -> bool {
        self.is_crypto_symbol(&self.symbol)
    }

    pub fn is_crypto_symbol(&self, symbol: &str) -> bool {
        symbol.contains('/')
            || self
                .crypto_symbols
                .iter()
                .any(|crypto| crypto.eq_ignore_ascii_case(symbol))
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: "AAPL".to_owned(),
            bar_size: BarSize::Minute,
            crypto_symbols: ["BTC/USD", "ETH/USD", "LTC/USD", "BCH/USD"]
                .into_iter()
                .map(ToOwned::to_owned)
                .collect(),
            allowed_crypto_exchanges: vec!["CBSE".to_owned()],
            quantity: Decimal::new(100, 0),
            capital_utilization: Decimal::new(8, 1),
            history_lookback_hours: 24,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Crossover,
    Average,
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "crossover" | "cross" => Ok(Self::Crossover),
            "average" | "sma" => Ok(Self::Average),
            other => Err(format!("unknown strategy \"{other}\"")),
        }
    }
}

/// When buying is allowed again after a stop-loss or take-profit exit.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RearmPolicy {
    Never,
    CrossDown,
    AfterBars(u32),
}

impl FromStr for RearmPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_ascii_lowercase();
        match lowered.as_str() {
            "never" => Ok(Self::Never),
            "cross-down" | "crossdown" => Ok(Self::CrossDown),
            _ => match lowered.strip_prefix("bars:") {
                Some(count) => count
                    .parse::<u32>()
                    .map(Self::AfterBars)
                    .map_err(|error| format!("invalid bar count: {error}")),
                None => Err(format!("unknown re-arm policy \"{s}\"")),
            },
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub kind: StrategyKind,
    pub short_window: usize,
    pub long_window: usize,
    /// Fractional loss from the entry price that forces an exit.
    pub stop_loss: Decimal,
    /// Fractional gain from the entry price that forces an exit.
    pub take_profit: Decimal,
    pub rearm: RearmPolicy,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            kind: StrategyKind::Crossover,
            short_window: 20,
            long_window: 50,
            stop_loss: Decimal::new(2, 2),
            take_profit: Decimal::new(5, 2),
            rearm: RearmPolicy::CrossDown,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub save_data: bool,
    pub database_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_addr: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            save_data: false,
            database_url: "sqlite://market-data.db".to_owned(),
            http_addr: None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub max_reconnect_attempts: u32,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: 5,
        }
    }
}

#[derive(Serialize, Deserialize)]
pub struct OnDiskConfig {
    #[serde(default)]
    urls: Urls,
    #[serde(default)]
    trading: TradingConfig,
    #[serde(default)]
    strategy: StrategyConfig,
    #[serde(default)]
    storage: StorageConfig,
    #[serde(default)]
    stream: StreamConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    utc_offset: Option<UtcOffset>,
    #[serde(with = "SerdeLevelFilter", default = "default_level_filter")]
    log_level_filter: LevelFilter,
}

fn default_level_filter() -> LevelFilter {
    LevelFilter::Info
}

impl OnDiskConfig {
    fn read_or_create(config_path: &Path) -> anyhow::Result<Self> {
        if config_path.exists() {
            let buf = fs::read_to_string(config_path).context("Failed to read config file")?;
            serde_json::from_str(&buf).with_context(|| {
                format!("Failed to parse config file {}", config_path.display())
            })
        } else {
            let default = Self::default();
            let buf = serde_json::to_string_pretty(&default)
                .context("Failed to serialize default config")?;
            fs::write(config_path, buf.as_bytes()).context("Failed to write default config")?;
            Ok(default)
        }
    }

    fn apply_env<F>(&mut self, lookup: &F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> anyhow::Result<Option<String>>,
    {
        let urls = &mut self.urls;
        override_with(lookup, "APCA_API_BASE_URL", &mut urls.alpaca_api_base, text)?;
        override_with(lookup, "APCA_API_DATA_URL", &mut urls.alpaca_data_api, text)?;
        override_with(lookup, "APCA_API_STREAM_URL", &mut urls.alpaca_stream_url, text)?;
        override_with(lookup, "DATA_FEED", &mut urls.alpaca_stream_endpoint, text)?;

        let trading = &mut self.trading;
        override_with(lookup, "SYMBOL", &mut trading.symbol, |raw| {
            Ok(raw.to_ascii_uppercase())
        })?;
        override_with(lookup, "BAR_SIZE", &mut trading.bar_size, parsed)?;
        override_with(lookup, "CRYPTO_SYMBOLS", &mut trading.crypto_symbols, list)?;
        override_with(
            lookup,
            "ALLOWED_CRYPTO_EXCHANGES",
            &mut trading.allowed_crypto_exchanges,
            list,
        )?;
        override_with(lookup, "QUANTITY", &mut trading.quantity, parsed)?;
        override_with(
            lookup,
            "CAPITAL_UTILIZATION",
            &mut trading.capital_utilization,
            parsed,
        )?;
        override_with(
            lookup,
            "HISTORY_LOOKBACK_HOURS",
            &mut trading.history_lookback_hours,
            parsed,
        )?;

        let strategy = &mut self.strategy;
        override_with(lookup, "STRATEGY", &mut strategy.kind, parsed)?;
        override_with(lookup, "SHORT_WINDOW", &mut strategy.short_window, parsed)?;
        // WINDOW_SIZE is the older name of the long window
        override_with(lookup, "WINDOW_SIZE", &mut strategy.long_window, parsed)?;
        override_with(lookup, "LONG_WINDOW", &mut strategy.long_window, parsed)?;
        override_with(lookup, "STOP_LOSS", &mut strategy.stop_loss, parsed)?;
        override_with(lookup, "TAKE_PROFIT", &mut strategy.take_profit, parsed)?;
        override_with(lookup, "REARM_POLICY", &mut strategy.rearm, parsed)?;

        let storage = &mut self.storage;
        override_with(lookup, "SAVE_DATA", &mut storage.save_data, |raw| {
            parse_bool(raw).ok_or_else(|| anyhow!("expected a boolean"))
        })?;
        override_with(lookup, "DATABASE_URL", &mut storage.database_url, text)?;
        override_with(lookup, "HTTP_ADDR", &mut storage.http_addr, |raw| {
            Ok((!raw.is_empty()).then(|| raw.to_owned()))
        })?;

        override_with(
            lookup,
            "MAX_RECONNECT_ATTEMPTS",
            &mut self.stream.max_reconnect_attempts,
            parsed,
        )?;
        override_with(lookup, "LOG_LEVEL", &mut self.log_level_filter, parsed)?;

        Ok(())
    }
}

impl Default for OnDiskConfig {
    fn default() -> Self {
        Self {
            urls: Urls::default(),
            trading: TradingConfig::default(),
            strategy: StrategyConfig::default(),
            storage: StorageConfig::default(),
            stream: StreamConfig::default(),
            utc_offset: None,
            log_level_filter: default_level_filter(),
        }
    }
}

fn override_with<T, F, P>(lookup: &F, env_var: &str, target: &mut T, parse: P) -> anyhow::Result<()>
where
    F: Fn(&str) -> anyhow::Result<Option<String>>,
    P: FnOnce(&str) -> anyhow::Result<T>,
{
    if let Some(raw) = lookup(env_var)? {
        *target = parse(raw.trim())
            .with_context(|| format!("Invalid value for env var {env_var}: {raw}"))?;
    }

    Ok(())
}

fn text(raw: &str) -> anyhow::Result<String> {
    Ok(raw.to_owned())
}

fn list(raw: &str) -> anyhow::Result<Vec<String>> {
    Ok(parse_list(raw))
}

fn parsed<T>(raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|error| anyhow!("{error}"))
}

fn read_opt_env_var(env_var: &str) -> anyhow::Result<Option<String>> {
    match env::var(env_var) {
        Ok(var) => Ok(Some(var)),
        Err(VarError::NotPresent) => Ok(None),
        Err(error @ VarError::NotUnicode(_)) => {
            Err(anyhow!("Failed to parse env var {env_var}: {error}"))
        }
    }
}
