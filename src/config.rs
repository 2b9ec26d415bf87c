//! Bot configuration
//!
//! Loaded from a TOML file; every key can be overridden from the environment
//! with the `APP__` prefix, e.g. `APP__BOT__ACCOUNT=trader`.
//! Decimal values are best written as strings (`upper_limit = "75"`).

use std::collections::HashMap;
use std::path::PathBuf;

use config::{Config, Environment, File, FileFormat};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::errors::{BotError, BotResult};
use crate::market::OrderSide;

/// Main configuration struct
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bot: BotSettings,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub gateway: GatewaySettings,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub notifications: NotificationSettings,
    #[serde(default)]
    pub paper: PaperSettings,
    #[serde(default)]
    pub grid: Option<GridSettings>,
    #[serde(default)]
    pub spike: Option<SpikeSettings>,
    #[serde(default)]
    pub market_maker: Option<MarketMakerSettings>,
    #[serde(default)]
    pub swap: Option<SwapSettings>,
}

/// Strategy selected at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyType {
    Grid,
    Spike,
    Swap,
    MarketMaker,
}

impl StrategyType {
    /// Key used in logs and in the persisted record
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyType::Grid => "grid",
            StrategyType::Spike => "spike",
            StrategyType::Swap => "swap",
            StrategyType::MarketMaker => "market_maker",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    #[default]
    Paper,
    Live,
}

impl TradingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradingMode::Paper => "paper",
            TradingMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BotSettings {
    /// Exchange account name
    pub account: String,
    pub strategy: StrategyType,
    #[serde(default)]
    pub mode: TradingMode,
    /// Identifies this running instance; persistence is disabled without it
    #[serde(default)]
    pub instance_id: Option<String>,
    /// Directory for the tracked-order record and order-state snapshot
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    10
}

/// Market-data REST API
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub base_url: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: "https://dex.api.mainnet.metalx.com".to_string(),
            timeout_secs: 10,
            max_retries: 3,
            retry_base_delay_ms: 500,
        }
    }
}

/// Remote signer used by the live order gateway
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Required in live mode
    pub signer_url: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            signer_url: None,
            timeout_secs: 30,
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

/// Submission pacing
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Orders per submitted transaction
    pub batch_size: usize,
    /// Pause after every batch, including the last one
    pub batch_pause_ms: u64,
    /// Pause after a cancel-all and withdraw before placing a new ladder
    pub rebalance_pause_ms: u64,
    pub order_book_depth: usize,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            batch_size: 10,
            batch_pause_ms: 2000,
            rebalance_pause_ms: 3000,
            order_book_depth: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Log level: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Notification sink; disabled without an endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationSettings {
    pub endpoint: Option<String>,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub flush_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            endpoint: None,
            queue_capacity: 256,
            batch_size: 20,
            flush_interval_secs: 5,
            max_retries: 3,
            retry_base_delay_ms: 500,
            timeout_secs: 5,
        }
    }
}

/// Paper trading starting balances
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PaperSettings {
    /// Token code -> starting balance
    pub balances: HashMap<String, Decimal>,
}

impl PaperSettings {
    /// Balances keyed by upper-cased token code
    pub fn normalized_balances(&self) -> Vec<(String, Decimal)> {
        let mut balances: Vec<(String, Decimal)> = self
            .balances
            .iter()
            .map(|(code, amount)| (code.to_uppercase(), *amount))
            .collect();
        balances.sort();
        balances
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GridSettings {
    /// Always price counters off the filled order instead of the live book
    #[serde(default)]
    pub force_grid_placement: bool,
    #[serde(default)]
    pub pairs: Vec<GridPairConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GridPairConfig {
    pub symbol: String,
    /// Top of the ladder, in bid-token base units (price * 10^bid_precision)
    pub upper_limit: Decimal,
    /// Bottom of the ladder, same units as `upper_limit`
    pub lower_limit: Decimal,
    pub grid_levels: u32,
    /// Bid-token amount per rung
    pub bid_amount_per_level: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpikeSettings {
    #[serde(default = "default_ma_window")]
    pub ma_window: usize,
    /// Moving-average drift, in percent, that tears the ladder down
    #[serde(default = "default_rebalance_threshold_pct")]
    pub rebalance_threshold_pct: Decimal,
    #[serde(default)]
    pub pairs: Vec<SpikePairConfig>,
}

fn default_ma_window() -> usize {
    20
}

fn default_rebalance_threshold_pct() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpikePairConfig {
    pub symbol: String,
    /// Distance between levels, in percent of the moving average
    pub deviation_pct: Decimal,
    pub levels: u32,
    /// Bid-token amount per order
    pub order_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketMakerSettings {
    #[serde(default)]
    pub pairs: Vec<MarketMakerPairConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MarketMakerPairConfig {
    pub symbol: String,
    pub levels: u32,
    /// Offset of the innermost quote from mid, in percent
    pub spread_pct: Decimal,
    /// Additional offset per level, in percent
    pub step_pct: Decimal,
    /// Bid-token amount per quote
    pub order_amount: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwapSettings {
    #[serde(default)]
    pub pairs: Vec<SwapPairConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SwapPairConfig {
    pub symbol: String,
    pub side: OrderSide,
    /// Bid-token amount converted per poll
    pub amount_per_poll: Decimal,
    /// Worst acceptable price
    pub limit_price: Decimal,
    /// Bid-token amount to convert in total
    pub total_amount: Decimal,
}

fn invalid(message: impl Into<String>) -> BotError {
    BotError::Config(message.into())
}

fn require_symbol(section: &str, symbol: &str) -> BotResult<()> {
    if symbol.trim().is_empty() {
        return Err(invalid(format!("{}: pair with empty symbol", section)));
    }
    Ok(())
}

fn require_positive(section: &str, symbol: &str, field: &str, value: Decimal) -> BotResult<()> {
    if value <= Decimal::ZERO {
        return Err(invalid(format!("{}.{}: {} must be positive", section, symbol, field)));
    }
    Ok(())
}

impl Settings {
    /// Load settings from a configuration file, with `APP__*` environment overrides
    pub fn new(config_path: &str) -> BotResult<Self> {
        let s = Config::builder()
            .add_source(File::with_name(config_path))
            // e.g. APP__GATEWAY__SIGNER_URL=...
            .add_source(Environment::with_prefix("APP").prefix_separator("__").separator("__"))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Load settings from TOML text
    pub fn from_toml(content: &str) -> BotResult<Self> {
        let s = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Reject configurations the bot must not start trading with
    pub fn validate(&self) -> BotResult<()> {
        if self.bot.account.trim().is_empty() {
            return Err(invalid("bot.account is required"));
        }
        if self.bot.poll_interval_secs == 0 {
            return Err(invalid("bot.poll_interval_secs must be at least 1"));
        }
        if self.execution.batch_size == 0 {
            return Err(invalid("execution.batch_size must be at least 1"));
        }
        if self.bot.mode == TradingMode::Live && self.gateway.signer_url.is_none() {
            return Err(invalid("gateway.signer_url is required in live mode"));
        }

        match self.bot.strategy {
            StrategyType::Grid => self.validate_grid(),
            StrategyType::Spike => self.validate_spike(),
            StrategyType::MarketMaker => self.validate_market_maker(),
            StrategyType::Swap => self.validate_swap(),
        }
    }

    fn validate_grid(&self) -> BotResult<()> {
        let grid = self.grid.as_ref().ok_or_else(|| invalid("[grid] section is required"))?;
        if grid.pairs.is_empty() {
            return Err(invalid("grid: at least one pair is required"));
        }
        for pair in &grid.pairs {
            require_symbol("grid", &pair.symbol)?;
            require_positive("grid", &pair.symbol, "bid_amount_per_level", pair.bid_amount_per_level)?;
            if pair.lower_limit < Decimal::ZERO || pair.upper_limit <= pair.lower_limit {
                return Err(invalid(format!(
                    "grid.{}: upper_limit must be above a non-negative lower_limit",
                    pair.symbol
                )));
            }
            if pair.grid_levels == 0 {
                return Err(invalid(format!("grid.{}: grid_levels must be at least 1", pair.symbol)));
            }
        }
        Ok(())
    }

    fn validate_spike(&self) -> BotResult<()> {
        let spike = self.spike.as_ref().ok_or_else(|| invalid("[spike] section is required"))?;
        if spike.ma_window == 0 {
            return Err(invalid("spike.ma_window must be at least 1"));
        }
        if spike.rebalance_threshold_pct <= Decimal::ZERO {
            return Err(invalid("spike.rebalance_threshold_pct must be positive"));
        }
        if spike.pairs.is_empty() {
            return Err(invalid("spike: at least one pair is required"));
        }
        for pair in &spike.pairs {
            require_symbol("spike", &pair.symbol)?;
            require_positive("spike", &pair.symbol, "deviation_pct", pair.deviation_pct)?;
            require_positive("spike", &pair.symbol, "order_amount", pair.order_amount)?;
            if pair.levels == 0 {
                return Err(invalid(format!("spike.{}: levels must be at least 1", pair.symbol)));
            }
        }
        Ok(())
    }

    fn validate_market_maker(&self) -> BotResult<()> {
        let mm = self
            .market_maker
            .as_ref()
            .ok_or_else(|| invalid("[market_maker] section is required"))?;
        if mm.pairs.is_empty() {
            return Err(invalid("market_maker: at least one pair is required"));
        }
        for pair in &mm.pairs {
            require_symbol("market_maker", &pair.symbol)?;
            require_positive("market_maker", &pair.symbol, "order_amount", pair.order_amount)?;
            require_positive("market_maker", &pair.symbol, "spread_pct", pair.spread_pct)?;
            if pair.step_pct < Decimal::ZERO {
                return Err(invalid(format!("market_maker.{}: step_pct must not be negative", pair.symbol)));
            }
            if pair.levels == 0 {
                return Err(invalid(format!("market_maker.{}: levels must be at least 1", pair.symbol)));
            }
        }
        Ok(())
    }

    fn validate_swap(&self) -> BotResult<()> {
        let swap = self.swap.as_ref().ok_or_else(|| invalid("[swap] section is required"))?;
        if swap.pairs.is_empty() {
            return Err(invalid("swap: at least one pair is required"));
        }
        for pair in &swap.pairs {
            require_symbol("swap", &pair.symbol)?;
            require_positive("swap", &pair.symbol, "amount_per_poll", pair.amount_per_poll)?;
            require_positive("swap", &pair.symbol, "limit_price", pair.limit_price)?;
            require_positive("swap", &pair.symbol, "total_amount", pair.total_amount)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const GRID: &str = r#"
        [bot]
        account = "trader"
        strategy = "grid"
        instance_id = "grid-1"
        state_dir = "/tmp/dex-bot"

        [paper.balances]
        xpr = "100000"
        XUSDC = "500"

        [grid]
        force_grid_placement = true

        [[grid.pairs]]
        symbol = "XPR_XUSDC"
        upper_limit = "75"
        lower_limit = "30"
        grid_levels = 248
        bid_amount_per_level = "5250"
    "#;

    #[test]
    fn test_parse_grid_settings() {
        let settings = Settings::from_toml(GRID).unwrap();
        settings.validate().unwrap();

        assert_eq!(settings.bot.strategy, StrategyType::Grid);
        assert_eq!(settings.bot.mode, TradingMode::Paper);
        assert_eq!(settings.bot.poll_interval_secs, 10);
        assert_eq!(settings.execution.batch_size, 10);
        assert_eq!(settings.log.level, "info");

        let grid = settings.grid.as_ref().unwrap();
        assert!(grid.force_grid_placement);
        assert_eq!(grid.pairs[0].upper_limit, dec!(75));
        assert_eq!(grid.pairs[0].grid_levels, 248);

        let balances = settings.paper.normalized_balances();
        assert!(balances.contains(&("XPR".to_string(), dec!(100000))));
        assert!(balances.contains(&("XUSDC".to_string(), dec!(500))));
    }

    #[test]
    fn test_missing_strategy_section() {
        let settings = Settings::from_toml(
            r#"
            [bot]
            account = "trader"
            strategy = "spike"
            "#,
        )
        .unwrap();
        assert!(matches!(settings.validate(), Err(BotError::Config(_))));
    }

    #[test]
    fn test_inverted_grid_bounds_rejected() {
        let toml = GRID.replace(r#"lower_limit = "30""#, r#"lower_limit = "80""#);
        let settings = Settings::from_toml(&toml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_live_mode_requires_signer() {
        let toml = GRID.replace(r#"strategy = "grid""#, "strategy = \"grid\"\nmode = \"live\"");
        let settings = Settings::from_toml(&toml).unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_spike_defaults() {
        let settings = Settings::from_toml(
            r#"
            [bot]
            account = "trader"
            strategy = "spike"

            [[spike.pairs]]
            symbol = "XPR_XUSDC"
            deviation_pct = "0.5"
            levels = 3
            order_amount = "1000"
            "#,
        )
        .unwrap();
        settings.validate().unwrap();

        let spike = settings.spike.unwrap();
        assert_eq!(spike.ma_window, 20);
        assert_eq!(spike.rebalance_threshold_pct, dec!(1));
    }

    #[test]
    fn test_swap_side() {
        let settings = Settings::from_toml(
            r#"
            [bot]
            account = "trader"
            strategy = "swap"

            [[swap.pairs]]
            symbol = "XPR_XUSDC"
            side = "sell"
            amount_per_poll = "100"
            limit_price = "0.005"
            total_amount = "1000"
            "#,
        )
        .unwrap();
        settings.validate().unwrap();
        assert_eq!(settings.swap.unwrap().pairs[0].side, OrderSide::Sell);
    }
}
