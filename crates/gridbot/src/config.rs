//! Application configuration.
//!
//! Loaded from a TOML file. Scalar settings can be overridden from the
//! environment as `GRIDBOT__<SECTION>__<KEY>`, e.g.
//! `GRIDBOT__ENGINE__TICK_INTERVAL_MS=1000`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use gridbot_core::{split_symbol, BotId};
use gridbot_engine::EngineSettings;
use gridbot_exchange::{BinanceConfig, RetryPolicy};
use gridbot_persistence::Bot;
use gridbot_risk::CircuitBreakerConfig;
use gridbot_strategy::StrategyConfig;
use gridbot_telemetry::LoggingConfig;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::error::{AppError, AppResult};

/// Root configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineSettings,

    /// Retry policy for venue calls.
    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    #[serde(default)]
    pub bots: Vec<BotConfig>,
}

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    /// Append-only JSON-lines file, replayed on start.
    #[default]
    Journal,
    /// Nothing survives a restart.
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub kind: StoreKind,
    #[serde(default = "default_journal_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            kind: StoreKind::default(),
            path: default_journal_path(),
        }
    }
}

fn default_journal_path() -> PathBuf {
    PathBuf::from("data/gridbot.jsonl")
}

// ============================================================================
// Accounts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueKind {
    Binance,
    Paper,
}

/// One exchange account. Bots naming the same account share its connector.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub name: String,
    pub venue: VenueKind,

    #[serde(default)]
    pub testnet: bool,
    /// Overrides the venue's REST base URL.
    #[serde(default)]
    pub rest_url: Option<String>,
    /// Overrides the venue's websocket base URL.
    #[serde(default)]
    pub stream_url: Option<String>,

    /// Environment variable holding the API key. Secrets never live in the file.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_api_secret_env")]
    pub api_secret_env: String,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub paper: PaperConfig,
}

impl AccountConfig {
    pub fn binance_config(&self) -> BinanceConfig {
        let mut config = if self.testnet {
            BinanceConfig::testnet()
        } else {
            BinanceConfig::default()
        };
        if let Some(url) = &self.rest_url {
            config.rest_url = url.clone();
        }
        if let Some(url) = &self.stream_url {
            config.stream.url = url.clone();
        }
        config
    }
}

fn default_api_key_env() -> String {
    "BINANCE_API_KEY".to_string()
}

fn default_api_secret_env() -> String {
    "BINANCE_API_SECRET".to_string()
}

/// Request budget shared by every bot on the account.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_secs: default_window_secs(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

fn default_max_requests() -> u32 {
    1200
}

fn default_window_secs() -> u64 {
    60
}

/// Paper venue seed state.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaperConfig {
    /// Starting free balance per asset.
    #[serde(default)]
    pub balances: HashMap<String, Decimal>,
    /// Starting price per symbol.
    #[serde(default)]
    pub prices: HashMap<String, Decimal>,
    #[serde(default)]
    pub fee_rate: Option<Decimal>,
    /// Name of a live account whose public ticker drives paper prices.
    #[serde(default)]
    pub price_source: Option<String>,
}

// ============================================================================
// Bots
// ============================================================================

/// A bot declared in the file. Created in the store on first start; the
/// stored record is authoritative afterwards.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    pub id: BotId,
    pub name: String,
    #[serde(default = "default_owner")]
    pub owner: String,
    pub account: String,
    pub symbol: String,
    pub strategy: StrategyConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Start the bot when the supervisor starts, if it is stopped.
    #[serde(default)]
    pub autostart: bool,
}

fn default_owner() -> String {
    "default".to_string()
}

impl BotConfig {
    pub fn to_bot(&self) -> Bot {
        let mut bot = Bot::new(
            &self.name,
            &self.owner,
            &self.account,
            &self.symbol,
            self.strategy.clone(),
        );
        bot.id = self.id;
        bot.circuit_breaker = self.circuit_breaker.clone();
        bot
    }
}

// ============================================================================
// Loading
// ============================================================================

impl AppConfig {
    /// Load from a TOML file, apply environment overrides, validate.
    pub fn from_file(path: &str) -> AppResult<Self> {
        if !Path::new(path).exists() {
            return Err(AppError::Config(format!("Config file not found: {path}")));
        }

        let settings = config::Config::builder()
            .add_source(config::File::new(path, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("GRIDBOT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate without environment overrides.
    pub fn from_toml_str(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn account(&self, name: &str) -> Option<&AccountConfig> {
        self.accounts.iter().find(|a| a.name == name)
    }

    /// Reject a configuration before any bot is created from it.
    ///
    /// Strategy parameters are checked without venue minimums here; the
    /// venue's own rules are applied again when a bot starts.
    pub fn validate(&self) -> AppResult<()> {
        if self.engine.tick_interval_ms == 0 {
            return Err(AppError::Config("engine.tick_interval_ms must be > 0".to_string()));
        }
        if self.engine.reconcile_interval_secs == 0 {
            return Err(AppError::Config(
                "engine.reconcile_interval_secs must be > 0".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(AppError::Config("retry.max_attempts must be > 0".to_string()));
        }

        let mut accounts = HashSet::new();
        for account in &self.accounts {
            if !accounts.insert(account.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate account '{}'",
                    account.name
                )));
            }
            if account.rate_limit.max_requests == 0 || account.rate_limit.window_secs == 0 {
                return Err(AppError::Config(format!(
                    "account '{}': rate_limit values must be > 0",
                    account.name
                )));
            }
        }

        for account in &self.accounts {
            let Some(source) = &account.paper.price_source else {
                continue;
            };
            if account.venue != VenueKind::Paper {
                return Err(AppError::Config(format!(
                    "account '{}': price_source is only valid for paper accounts",
                    account.name
                )));
            }
            match self.account(source) {
                Some(s) if s.venue == VenueKind::Binance => {}
                Some(_) => {
                    return Err(AppError::Config(format!(
                        "account '{}': price_source '{source}' must be a live account",
                        account.name
                    )))
                }
                None => {
                    return Err(AppError::Config(format!(
                        "account '{}': unknown price_source '{source}'",
                        account.name
                    )))
                }
            }
        }

        let mut ids = HashSet::new();
        for bot in &self.bots {
            if !ids.insert(bot.id) {
                return Err(AppError::Config(format!("duplicate bot id {}", bot.id)));
            }
            if !accounts.contains(bot.account.as_str()) {
                return Err(AppError::Config(format!(
                    "bot '{}': unknown account '{}'",
                    bot.name, bot.account
                )));
            }
            split_symbol(&bot.symbol)
                .map_err(|e| AppError::Config(format!("bot '{}': {e}", bot.name)))?;
            bot.strategy
                .validate(Decimal::ZERO)
                .map_err(|e| AppError::Config(format!("bot '{}': {e}", bot.name)))?;
            bot.circuit_breaker
                .validate()
                .map_err(|e| AppError::Config(format!("bot '{}': {e}", bot.name)))?;
        }

        Ok(())
    }
}
