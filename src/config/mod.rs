//! Configuration management for the spread hedger.
//!
//! Loads settings from an optional `config.toml` and `HEDGE__*` environment
//! variables (e.g. `HEDGE__STRATEGY__OPEN_THRESHOLD=120`).

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Venue taking the A side of the spread
    #[serde(default = "default_venue_a")]
    pub venue_a: VenueConfig,
    /// Venue taking the B side of the spread
    #[serde(default = "default_venue_b")]
    pub venue_b: VenueConfig,
    /// Spread thresholds and sizing
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Order routing and timing
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Stop-loss / trailing-stop parameters
    #[serde(default)]
    pub protection: ProtectionConfig,
    /// Ledger location and reconciliation cadence
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueConfig {
    /// Display name used in logs
    pub name: String,
    /// Instrument symbol in the venue's native format
    #[serde(default = "default_symbol")]
    pub symbol: String,
    /// Binance-compatible futures REST base URL
    pub rest_url: String,
    /// WebSocket base URL for book ticker streams
    pub ws_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Taker fee rate; unknown fees are recorded as zero
    #[serde(default)]
    pub taker_fee_rate: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// |spread| strictly above this opens a hedge
    #[serde(default = "default_open_threshold")]
    pub open_threshold: Decimal,
    /// |spread| at or below this closes every leg
    #[serde(default = "default_close_threshold")]
    pub close_threshold: Decimal,
    /// Extra spread required per existing leg before adding another
    #[serde(default = "default_add_step")]
    pub add_step: Decimal,
    #[serde(default = "default_max_legs")]
    pub max_legs: usize,
    /// Cap on the summed amount of open legs
    #[serde(default = "default_max_size")]
    pub max_size: Decimal,
    /// Fixed quantity per leg
    #[serde(default = "default_unit_amount")]
    pub unit_amount: Decimal,
    #[serde(default = "default_eval_interval_ms")]
    pub eval_interval_ms: u64,
    /// Quotes older than this are invalid
    #[serde(default = "default_staleness_secs")]
    pub staleness_secs: u64,
    /// Close-all stops once |spread| exceeds close_threshold + this buffer
    #[serde(default = "default_close_recheck_buffer")]
    pub close_recheck_buffer: Decimal,
    /// Fetch a REST ticker when a push feed is invalid
    #[serde(default = "default_true")]
    pub rest_price_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Bound on a single venue call
    #[serde(default = "default_leg_timeout_ms")]
    pub leg_timeout_ms: u64,
    /// Delay before re-reading an order whose average price was zero
    #[serde(default = "default_fill_poll_delay_ms")]
    pub fill_poll_delay_ms: u64,
    /// Window for confirming compensation after a failed open
    #[serde(default = "default_open_monitor_window_ms")]
    pub open_monitor_window_ms: u64,
    /// Window for confirming compensation after a failed close
    #[serde(default = "default_close_monitor_window_ms")]
    pub close_monitor_window_ms: u64,
    #[serde(default = "default_monitor_poll_interval_ms")]
    pub monitor_poll_interval_ms: u64,
    /// Order-type locks force-release after this long. Must cover
    /// [`ExecutionConfig::market_hold_budget`].
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    #[serde(default = "default_qty_step")]
    pub qty_step: Decimal,
    #[serde(default = "default_price_tick")]
    pub price_tick: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Per-leg unrealized loss (quote currency) that forces a market close
    #[serde(default = "default_loss_limit")]
    pub loss_limit: Decimal,
    /// Profit (quote currency) at which the trailing stop activates
    #[serde(default = "default_trailing_profit")]
    pub trailing_profit: Decimal,
    /// Trailing callback rate in percent
    #[serde(default = "default_trailing_callback_rate")]
    pub trailing_callback_rate: Decimal,
    /// Profit above which the stop ratchets to breakeven plus buffer
    #[serde(default = "default_profit_bootstrap")]
    pub profit_bootstrap: Decimal,
    #[serde(default = "default_breakeven_buffer")]
    pub breakeven_buffer: Decimal,
    /// Live stops within this distance of the target are left alone
    #[serde(default = "default_stop_replace_tolerance")]
    pub stop_replace_tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    /// Absolute amount difference tolerated before a mismatch is reported
    #[serde(default = "default_reconcile_tolerance")]
    pub reconcile_tolerance: Decimal,
}

// Default value functions
fn default_venue_a() -> VenueConfig {
    VenueConfig {
        name: "aster".to_string(),
        symbol: default_symbol(),
        rest_url: "https://fapi.asterdex.com".to_string(),
        ws_url: "wss://fstream.asterdex.com".to_string(),
        api_key: String::new(),
        secret_key: String::new(),
        taker_fee_rate: None,
    }
}

fn default_venue_b() -> VenueConfig {
    VenueConfig {
        name: "binance".to_string(),
        symbol: default_symbol(),
        rest_url: "https://fapi.binance.com".to_string(),
        ws_url: "wss://fstream.binance.com".to_string(),
        api_key: String::new(),
        secret_key: String::new(),
        taker_fee_rate: None,
    }
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_true() -> bool {
    true
}

fn default_open_threshold() -> Decimal {
    Decimal::new(120, 0) // 120 USDT on BTC
}

fn default_close_threshold() -> Decimal {
    Decimal::new(80, 0)
}

fn default_add_step() -> Decimal {
    Decimal::new(40, 0)
}

fn default_max_legs() -> usize {
    1
}

fn default_max_size() -> Decimal {
    Decimal::new(2, 2) // 0.02 BTC
}

fn default_unit_amount() -> Decimal {
    Decimal::new(2, 2) // 0.02 BTC
}

fn default_eval_interval_ms() -> u64 {
    3_000
}

fn default_staleness_secs() -> u64 {
    30
}

fn default_close_recheck_buffer() -> Decimal {
    Decimal::new(5, 0)
}

fn default_leg_timeout_ms() -> u64 {
    2_500
}

fn default_fill_poll_delay_ms() -> u64 {
    1_000
}

fn default_open_monitor_window_ms() -> u64 {
    5_000
}

fn default_close_monitor_window_ms() -> u64 {
    3_000
}

fn default_monitor_poll_interval_ms() -> u64 {
    500
}

fn default_lock_timeout_ms() -> u64 {
    15_000
}

fn default_qty_step() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_price_tick() -> Decimal {
    Decimal::new(1, 1) // 0.1
}

fn default_loss_limit() -> Decimal {
    Decimal::new(5, 1) // 0.5 USDT
}

fn default_trailing_profit() -> Decimal {
    Decimal::new(5, 1) // 0.5 USDT
}

fn default_trailing_callback_rate() -> Decimal {
    Decimal::new(3, 1) // 0.3%
}

fn default_profit_bootstrap() -> Decimal {
    Decimal::new(1, 1) // 0.1 USDT
}

fn default_breakeven_buffer() -> Decimal {
    Decimal::new(5, 2) // 0.05 USDT
}

fn default_stop_replace_tolerance() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_db_path() -> String {
    "data/ledger.db".to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    300
}

fn default_reconcile_tolerance() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("HEDGE"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.strategy.close_threshold < self.strategy.open_threshold,
            "close_threshold must be below open_threshold"
        );

        anyhow::ensure!(
            self.strategy.unit_amount > Decimal::ZERO
                && self.strategy.unit_amount <= self.strategy.max_size,
            "unit_amount must be positive and no larger than max_size"
        );

        anyhow::ensure!(self.strategy.max_legs >= 1, "max_legs must be at least 1");

        anyhow::ensure!(
            self.protection.loss_limit > Decimal::ZERO,
            "loss_limit must be positive"
        );

        anyhow::ensure!(
            self.execution.leg_timeout_ms < self.execution.lock_timeout_ms,
            "leg_timeout_ms must be below lock_timeout_ms"
        );

        anyhow::ensure!(
            self.execution.market_hold_budget() <= self.execution.lock_timeout(),
            "lock_timeout_ms ({}) must cover a full paired operation ({}ms)",
            self.execution.lock_timeout_ms,
            self.execution.market_hold_budget().as_millis()
        );

        anyhow::ensure!(
            self.execution.monitor_poll_interval_ms > 0
                && self.execution.monitor_poll_interval_ms
                    <= self.execution.close_monitor_window_ms,
            "monitor_poll_interval_ms must fit inside the monitor window"
        );

        Ok(())
    }
}

impl StrategyConfig {
    pub fn eval_interval(&self) -> Duration {
        Duration::from_millis(self.eval_interval_ms)
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.staleness_secs)
    }
}

impl ExecutionConfig {
    pub fn leg_timeout(&self) -> Duration {
        Duration::from_millis(self.leg_timeout_ms)
    }

    pub fn fill_poll_delay(&self) -> Duration {
        Duration::from_millis(self.fill_poll_delay_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    /// How long one paired operation holds the market locks at most: the
    /// race, a fill-price re-read, then one compensating order placed and
    /// monitored over the longer window.
    pub fn market_hold_budget(&self) -> Duration {
        let window = self.open_monitor_window_ms.max(self.close_monitor_window_ms);
        Duration::from_millis(3 * self.leg_timeout_ms + self.fill_poll_delay_ms + window)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            venue_a: default_venue_a(),
            venue_b: default_venue_b(),
            strategy: StrategyConfig::default(),
            execution: ExecutionConfig::default(),
            protection: ProtectionConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            open_threshold: default_open_threshold(),
            close_threshold: default_close_threshold(),
            add_step: default_add_step(),
            max_legs: default_max_legs(),
            max_size: default_max_size(),
            unit_amount: default_unit_amount(),
            eval_interval_ms: default_eval_interval_ms(),
            staleness_secs: default_staleness_secs(),
            close_recheck_buffer: default_close_recheck_buffer(),
            rest_price_fallback: true,
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            leg_timeout_ms: default_leg_timeout_ms(),
            fill_poll_delay_ms: default_fill_poll_delay_ms(),
            open_monitor_window_ms: default_open_monitor_window_ms(),
            close_monitor_window_ms: default_close_monitor_window_ms(),
            monitor_poll_interval_ms: default_monitor_poll_interval_ms(),
            lock_timeout_ms: default_lock_timeout_ms(),
            qty_step: default_qty_step(),
            price_tick: default_price_tick(),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            loss_limit: default_loss_limit(),
            trailing_profit: default_trailing_profit(),
            trailing_callback_rate: default_trailing_callback_rate(),
            profit_bootstrap: default_profit_bootstrap(),
            breakeven_buffer: default_breakeven_buffer(),
            stop_replace_tolerance: default_stop_replace_tolerance(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            reconcile_tolerance: default_reconcile_tolerance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_lock_outlives_a_paired_operation() {
        let execution = ExecutionConfig::default();
        assert!(execution.leg_timeout() < execution.lock_timeout());
        assert!(execution.market_hold_budget() <= execution.lock_timeout());
    }

    #[test]
    fn test_leg_timeout_longer_than_lock_is_rejected() {
        let mut config = Config::default();
        config.execution.leg_timeout_ms = 10_000;
        config.execution.lock_timeout_ms = 3_000;
        assert!(config.validate().is_err());

        // Below the lock, but the lock no longer covers the hold.
        config.execution.leg_timeout_ms = 2_500;
        assert!(config.validate().is_err());

        config.execution.lock_timeout_ms = 15_000;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_thresholds_are_rejected() {
        let mut config = Config::default();
        config.strategy.close_threshold = dec!(150);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unit_larger_than_cap_is_rejected() {
        let mut config = Config::default();
        config.strategy.unit_amount = dec!(0.05);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let source = r#"
            [strategy]
            open_threshold = "150"
            max_legs = 3
            max_size = "0.06"
        "#;
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.strategy.open_threshold, dec!(150));
        assert_eq!(config.strategy.max_legs, 3);
        assert_eq!(config.strategy.close_threshold, dec!(80));
        assert_eq!(config.protection.loss_limit, dec!(0.5));
        assert_eq!(config.venue_a.symbol, "BTCUSDT");
        assert!(config.validate().is_ok());
    }
}
