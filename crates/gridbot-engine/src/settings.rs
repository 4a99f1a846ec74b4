//! `[engine]` configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Engine cadence and venue call bounds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Tick interval per bot (ms). Default: 5,000.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Reconciliation sweep interval (s). Default: 60.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// How far back reconciliation reads venue trade history (min). Default: 1440.
    #[serde(default = "default_reconcile_lookback_minutes")]
    pub reconcile_lookback_minutes: i64,
    /// Trades fetched per reconciliation pass. Default: 100.
    #[serde(default = "default_trade_fetch_limit")]
    pub trade_fetch_limit: u32,
    /// Bound on every venue call (ms). Default: 10,000.
    #[serde(default = "default_venue_timeout_ms")]
    pub venue_timeout_ms: u64,
    /// How long a (side, rung) stays blocked after the venue refused an
    /// order for it or its retries ran out (s). Default: 300.
    #[serde(default = "default_failed_order_cooldown_secs")]
    pub failed_order_cooldown_secs: u64,
}

fn default_tick_interval_ms() -> u64 {
    5_000
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_reconcile_lookback_minutes() -> i64 {
    1440
}

fn default_trade_fetch_limit() -> u32 {
    100
}

fn default_venue_timeout_ms() -> u64 {
    10_000
}

fn default_failed_order_cooldown_secs() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_lookback_minutes: default_reconcile_lookback_minutes(),
            trade_fetch_limit: default_trade_fetch_limit(),
            venue_timeout_ms: default_venue_timeout_ms(),
            failed_order_cooldown_secs: default_failed_order_cooldown_secs(),
        }
    }
}

impl EngineSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn reconcile_lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.reconcile_lookback_minutes)
    }

    pub fn venue_timeout(&self) -> Duration {
        Duration::from_millis(self.venue_timeout_ms)
    }

    pub fn failed_order_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.failed_order_cooldown_secs as i64)
    }
}
