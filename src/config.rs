//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::{EngineSettings, EvaluatorSettings, ExecutionSettings};
use crate::task::{AutoSellRule, SniperFilter, TaskLimits, Tolerance};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub pumpportal: PumpPortalConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub sniper: SniperDefaults,
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_fire_queue_capacity")]
    pub fire_queue_capacity: usize,
    #[serde(default = "default_limit_poll_interval_secs")]
    pub limit_poll_interval_secs: u64,
    /// Events parked per busy task
    #[serde(default = "default_backlog_capacity")]
    pub backlog_capacity: usize,
    /// Ledger signatures remembered for duplicate suppression
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_quote_timeout_ms")]
    pub quote_timeout_ms: u64,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Default slippage for new tasks
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
    /// Default price impact ceiling for new tasks
    #[serde(default = "default_max_price_impact_pct")]
    pub max_price_impact_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_registry_path")]
    pub path: PathBuf,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_market_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpPortalConfig {
    #[serde(default = "default_pumpportal_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// 0 retries forever
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_min_trade_sol")]
    pub min_trade_sol: f64,
    #[serde(default = "default_max_buy_sol")]
    pub max_buy_sol: f64,
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: u32,
    #[serde(default = "default_max_copy_multiplier")]
    pub max_copy_multiplier: f64,
}

/// Defaults applied to sniper tasks created without explicit values
#[derive(Debug, Clone, Deserialize)]
pub struct SniperDefaults {
    #[serde(default = "default_sniper_buy_sol")]
    pub buy_amount_sol: f64,
    #[serde(default = "default_min_liquidity_sol")]
    pub min_liquidity_sol: f64,
    #[serde(default = "default_max_tax_pct")]
    pub max_buy_tax_pct: f64,
    #[serde(default = "default_max_tax_pct")]
    pub max_sell_tax_pct: f64,
    #[serde(default = "default_true")]
    pub auto_sell: bool,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    #[serde(default = "default_starting_balance_sol")]
    pub starting_balance_sol: f64,
    #[serde(default = "default_fee_bps")]
    pub fee_bps: u32,
    #[serde(default = "default_paper_price_impact")]
    pub price_impact_pct: f64,
}

fn default_worker_count() -> usize {
    4
}

fn default_fire_queue_capacity() -> usize {
    256
}

fn default_limit_poll_interval_secs() -> u64 {
    10
}

fn default_backlog_capacity() -> usize {
    64
}

fn default_dedupe_window() -> usize {
    4096
}

fn default_quote_timeout_ms() -> u64 {
    10_000
}

fn default_submit_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_backoff_max_ms() -> u64 {
    8_000
}

fn default_slippage_bps() -> u32 {
    500
}

fn default_max_price_impact_pct() -> f64 {
    10.0
}

fn default_registry_path() -> PathBuf {
    PathBuf::from("data/tasks.json")
}

fn default_flush_interval_ms() -> u64 {
    5_000
}

fn default_event_capacity() -> usize {
    1024
}

fn default_dexscreener_url() -> String {
    "https://api.dexscreener.com".to_string()
}

fn default_market_timeout_ms() -> u64 {
    10_000
}

fn default_pumpportal_ws_url() -> String {
    "wss://pumpportal.fun/api/data".to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    1000
}

fn default_min_trade_sol() -> f64 {
    0.001
}

fn default_max_buy_sol() -> f64 {
    100.0
}

fn default_max_slippage_bps() -> u32 {
    10_000
}

fn default_max_copy_multiplier() -> f64 {
    10.0
}

fn default_sniper_buy_sol() -> f64 {
    0.1
}

fn default_min_liquidity_sol() -> f64 {
    5.0
}

fn default_max_tax_pct() -> f64 {
    10.0
}

fn default_take_profit_pct() -> f64 {
    100.0
}

fn default_stop_loss_pct() -> f64 {
    50.0
}

fn default_starting_balance_sol() -> f64 {
    10.0
}

fn default_fee_bps() -> u32 {
    100
}

fn default_paper_price_impact() -> f64 {
    0.5
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("engine.worker_count", default_worker_count() as i64)?
            .set_default("registry.path", default_registry_path().display().to_string())?
            .set_default("pumpportal.ws_url", default_pumpportal_ws_url())?
            .set_default("market_data.dexscreener_url", default_dexscreener_url())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TRIGGER_)
            .add_source(
                config::Environment::with_prefix("TRIGGER")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.engine.worker_count == 0 {
            anyhow::bail!("engine.worker_count must be at least 1");
        }
        if self.engine.fire_queue_capacity == 0 {
            anyhow::bail!("engine.fire_queue_capacity must be at least 1");
        }
        if self.engine.limit_poll_interval_secs == 0 {
            anyhow::bail!("engine.limit_poll_interval_secs must be positive");
        }

        if self.execution.backoff_multiplier < 1.0 {
            anyhow::bail!("execution.backoff_multiplier must be >= 1.0");
        }
        if self.execution.backoff_max_ms < self.execution.backoff_initial_ms {
            anyhow::bail!("execution.backoff_max_ms cannot be below backoff_initial_ms");
        }

        // Trading limits
        if self.limits.min_trade_sol <= 0.0 {
            anyhow::bail!("limits.min_trade_sol must be positive");
        }
        if self.limits.max_buy_sol < self.limits.min_trade_sol {
            anyhow::bail!("limits.max_buy_sol cannot be below min_trade_sol");
        }
        if self.limits.max_slippage_bps > 10_000 {
            anyhow::bail!("limits.max_slippage_bps cannot exceed 10000 (100%)");
        }

        // Task defaults must pass the limits they will be validated against
        let limits = self.task_limits();
        self.default_tolerance()
            .validate(&limits)
            .context("Invalid execution defaults")?;
        self.sniper_filter()
            .validate()
            .context("Invalid sniper defaults")?;
        if self.sniper.buy_amount_sol < limits.min_trade_amount
            || self.sniper.buy_amount_sol > limits.max_buy_amount
        {
            anyhow::bail!(
                "sniper.buy_amount_sol must be between {} and {}",
                limits.min_trade_amount,
                limits.max_buy_amount
            );
        }
        if self.sniper.auto_sell {
            AutoSellRule {
                take_profit_pct: self.sniper.take_profit_pct,
                stop_loss_pct: self.sniper.stop_loss_pct,
            }
            .validate()
            .context("Invalid sniper auto-sell defaults")?;
        }

        if self.paper.starting_balance_sol < 0.0 {
            anyhow::bail!("paper.starting_balance_sol cannot be negative");
        }
        if self.paper.fee_bps >= 10_000 {
            anyhow::bail!("paper.fee_bps must be below 10000");
        }

        if self.pumpportal.ping_interval_secs == 0 {
            anyhow::bail!("pumpportal.ping_interval_secs must be positive");
        }

        Ok(())
    }

    pub fn task_limits(&self) -> TaskLimits {
        TaskLimits {
            min_trade_amount: self.limits.min_trade_sol,
            max_buy_amount: self.limits.max_buy_sol,
            max_slippage_bps: self.limits.max_slippage_bps,
            max_copy_multiplier: self.limits.max_copy_multiplier,
        }
    }

    pub fn default_tolerance(&self) -> Tolerance {
        Tolerance {
            slippage_bps: self.execution.slippage_bps,
            max_price_impact_pct: self.execution.max_price_impact_pct,
        }
    }

    pub fn sniper_filter(&self) -> SniperFilter {
        SniperFilter {
            min_liquidity: self.sniper.min_liquidity_sol,
            max_buy_tax: self.sniper.max_buy_tax_pct,
            max_sell_tax: self.sniper.max_sell_tax_pct,
        }
    }

    pub fn sniper_auto_sell(&self) -> Option<AutoSellRule> {
        self.sniper.auto_sell.then_some(AutoSellRule {
            take_profit_pct: self.sniper.take_profit_pct,
            stop_loss_pct: self.sniper.stop_loss_pct,
        })
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            worker_count: self.engine.worker_count,
            fire_queue_capacity: self.engine.fire_queue_capacity,
            flush_interval: Duration::from_millis(self.registry.flush_interval_ms),
            evaluator: EvaluatorSettings {
                limit_poll_interval: Duration::from_secs(self.engine.limit_poll_interval_secs),
                metric_timeout: Duration::from_millis(self.market_data.timeout_ms),
                backlog_capacity: self.engine.backlog_capacity,
                dedupe_window: self.engine.dedupe_window,
            },
            execution: ExecutionSettings {
                quote_timeout: Duration::from_millis(self.execution.quote_timeout_ms),
                submit_timeout: Duration::from_millis(self.execution.submit_timeout_ms),
                max_retries: self.execution.max_retries,
                backoff_initial: Duration::from_millis(self.execution.backoff_initial_ms),
                backoff_multiplier: self.execution.backoff_multiplier,
                backoff_max: Duration::from_millis(self.execution.backoff_max_ms),
            },
        }
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Engine:
    workers: {}
    fire_queue: {}
    limit_poll: {}s
    backlog: {} per task
  Execution:
    quote_timeout: {}ms
    submit_timeout: {}ms
    max_retries: {}
    backoff: {}ms x{} (max {}ms)
    default_slippage: {}bps
    default_max_price_impact: {}%
  Registry:
    path: {}
    flush_interval: {}ms
  Market Data:
    dexscreener: {}
    pumpportal: {}
  Limits:
    trade_range: {} - {} SOL
    max_slippage: {}bps
    max_copy_multiplier: {}x
  Sniper Defaults:
    buy_amount: {} SOL
    min_liquidity: {} SOL
    max_taxes: {}% / {}%
    auto_sell: {} (+{}% / -{}%)
  Paper:
    starting_balance: {} SOL
    fee: {}bps
"#,
            self.engine.worker_count,
            self.engine.fire_queue_capacity,
            self.engine.limit_poll_interval_secs,
            self.engine.backlog_capacity,
            self.execution.quote_timeout_ms,
            self.execution.submit_timeout_ms,
            self.execution.max_retries,
            self.execution.backoff_initial_ms,
            self.execution.backoff_multiplier,
            self.execution.backoff_max_ms,
            self.execution.slippage_bps,
            self.execution.max_price_impact_pct,
            self.registry.path.display(),
            self.registry.flush_interval_ms,
            mask_url(&self.market_data.dexscreener_url),
            mask_url(&self.pumpportal.ws_url),
            self.limits.min_trade_sol,
            self.limits.max_buy_sol,
            self.limits.max_slippage_bps,
            self.limits.max_copy_multiplier,
            self.sniper.buy_amount_sol,
            self.sniper.min_liquidity_sol,
            self.sniper.max_buy_tax_pct,
            self.sniper.max_sell_tax_pct,
            self.sniper.auto_sell,
            self.sniper.take_profit_pct,
            self.sniper.stop_loss_pct,
            self.paper.starting_balance_sol,
            self.paper.fee_bps,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            fire_queue_capacity: default_fire_queue_capacity(),
            limit_poll_interval_secs: default_limit_poll_interval_secs(),
            backlog_capacity: default_backlog_capacity(),
            dedupe_window: default_dedupe_window(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            quote_timeout_ms: default_quote_timeout_ms(),
            submit_timeout_ms: default_submit_timeout_ms(),
            max_retries: default_max_retries(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            backoff_max_ms: default_backoff_max_ms(),
            slippage_bps: default_slippage_bps(),
            max_price_impact_pct: default_max_price_impact_pct(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            path: default_registry_path(),
            flush_interval_ms: default_flush_interval_ms(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            dexscreener_url: default_dexscreener_url(),
            timeout_ms: default_market_timeout_ms(),
        }
    }
}

impl Default for PumpPortalConfig {
    fn default() -> Self {
        Self {
            ws_url: default_pumpportal_ws_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            min_trade_sol: default_min_trade_sol(),
            max_buy_sol: default_max_buy_sol(),
            max_slippage_bps: default_max_slippage_bps(),
            max_copy_multiplier: default_max_copy_multiplier(),
        }
    }
}

impl Default for SniperDefaults {
    fn default() -> Self {
        Self {
            buy_amount_sol: default_sniper_buy_sol(),
            min_liquidity_sol: default_min_liquidity_sol(),
            max_buy_tax_pct: default_max_tax_pct(),
            max_sell_tax_pct: default_max_tax_pct(),
            auto_sell: true,
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            starting_balance_sol: default_starting_balance_sol(),
            fee_bps: default_fee_bps(),
            price_impact_pct: default_paper_price_impact(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            execution: ExecutionConfig::default(),
            registry: RegistryConfig::default(),
            market_data: MarketDataConfig::default(),
            pumpportal: PumpPortalConfig::default(),
            limits: LimitsConfig::default(),
            sniper: SniperDefaults::default(),
            paper: PaperConfig::default(),
        }
    }
}
