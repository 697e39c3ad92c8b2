//! Application configuration.
//!
//! All knobs are injected through the environment (with a `.env` file picked
//! up via dotenv) and carry the defaults of the production strategy config.
//! Nothing in the engine reads the environment directly.

use crate::models::{Millis, MILLIS_PER_DAY, MILLIS_PER_HOUR};

/// Strategy parameters for the volume engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Buy-side z-score threshold.
    pub buy_threshold: f64,
    /// Sell-side z-score threshold.
    pub sell_threshold: f64,
    /// z-score at which the buy sizing fraction saturates at 1.
    pub z_max: f64,
    /// Width of one volume accumulation interval.
    pub flush_interval: Millis,
    /// Lookback of the short rolling buffers.
    pub short_horizon: Millis,
    /// Lookback of the long rolling buffers.
    pub long_horizon: Millis,
    /// Ring size of the mid-price oscillator.
    pub oscillator_window: usize,
    /// Fraction of available cash the buy sizing may commit.
    pub cash_fraction: f64,
    /// Slippage tolerance passed through to order submission.
    pub slippage_tolerance: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buy_threshold: 1.75,
            sell_threshold: 1.75,
            z_max: 6.0,
            flush_interval: 300_000,
            short_horizon: MILLIS_PER_HOUR,
            long_horizon: 5 * MILLIS_PER_DAY,
            oscillator_window: 14,
            cash_fraction: 1.0,
            slippage_tolerance: 0.01,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            buy_threshold: env_f64("TAPEBOT_BUY_THRESHOLD", defaults.buy_threshold),
            sell_threshold: env_f64("TAPEBOT_SELL_THRESHOLD", defaults.sell_threshold),
            z_max: env_f64("TAPEBOT_Z_MAX", defaults.z_max),
            flush_interval: env_i64("TAPEBOT_FLUSH_INTERVAL_MS", defaults.flush_interval),
            short_horizon: env_i64("TAPEBOT_SHORT_HORIZON_MS", defaults.short_horizon),
            long_horizon: env_i64("TAPEBOT_LONG_HORIZON_MS", defaults.long_horizon),
            oscillator_window: env_usize("TAPEBOT_OSCILLATOR_WINDOW", defaults.oscillator_window),
            cash_fraction: env_f64("TAPEBOT_CASH_FRACTION", defaults.cash_fraction),
            slippage_tolerance: env_f64("TAPEBOT_SLIPPAGE_TOLERANCE", defaults.slippage_tolerance),
        }
    }

    /// Capacity of the short rolling buffers, in flush intervals.
    pub fn short_capacity(&self) -> usize {
        horizon_capacity(self.short_horizon, self.flush_interval)
    }

    /// Capacity of the long rolling buffers, in flush intervals.
    pub fn long_capacity(&self) -> usize {
        horizon_capacity(self.long_horizon, self.flush_interval)
    }
}

fn horizon_capacity(horizon: Millis, flush_interval: Millis) -> usize {
    if flush_interval <= 0 {
        return 1;
    }
    ((horizon / flush_interval).max(1)) as usize
}

/// Application-level configuration for the run driver.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: String,
    pub ws_url: String,
    pub venue_api_url: String,
    pub instrument: String,
    pub starting_cash: f64,
    pub engine: EngineConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("TAPEBOT_DATABASE_PATH").unwrap_or_else(|_| "./tapebot.db".to_string());

        let ws_url = std::env::var("TAPEBOT_WS_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:9001/ws".to_string());

        let venue_api_url = std::env::var("TAPEBOT_VENUE_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:9002".to_string());

        let instrument = std::env::var("TAPEBOT_INSTRUMENT").unwrap_or_else(|_| "BTC".to_string());

        let starting_cash = env_f64("TAPEBOT_STARTING_CASH", 1_000.0);

        Ok(Self {
            database_path,
            ws_url,
            venue_api_url,
            instrument,
            starting_cash,
            engine: EngineConfig::from_env(),
        })
    }
}

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
