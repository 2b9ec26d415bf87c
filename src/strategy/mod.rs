//! Trading strategies
//!
//! Every strategy implements the same capability interface ([`Strategy`]):
//! the runner calls `initialize` once, `trade` once per poll interval and
//! `cancel_own_orders` on shutdown. Within a poll each strategy walks its
//! configured pairs in order; an error aborts only the pair it came from.
//!
//! The set of strategies is closed and selected once at startup through
//! [`StrategyKind`]:
//!
//! - **Grid**: a ladder of limit orders between two bounds; fills are detected
//!   by diffing tracked orders against the live open orders and replaced with
//!   counter-orders one grid step away.
//! - **Spike**: BUY/SELL pairs at fixed deviations around a rolling moving
//!   average; filled spikes get a take-profit at the average, and the ladder is
//!   rebuilt once the average drifts past a threshold.
//! - **MarketMaker**: symmetric quotes around the book mid, re-quoted after any fill.
//! - **Swap**: converts a fixed amount in slices, only at an acceptable price.
//!
//! # Example
//!
//! ```ignore
//! let mut strategy = StrategyKind::from_settings(&settings, store)?;
//! strategy.initialize(&ctx).await?;
//! loop {
//!     interval.tick().await;
//!     strategy.trade(&ctx).await?;
//! }
//! ```

mod common;
mod grid;
mod market_maker;
mod spike;
mod swap;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{ExecutionSettings, Settings, StrategyType};
use crate::errors::{BotError, BotResult};
use crate::market::{Market, MarketDataProvider, MarketRegistry, OrderGateway};
use crate::notify::Notifier;
use crate::tracking::TrackedOrderStore;

pub use grid::{plan_ladder, reconcile_fills, GridStrategy, LadderPlan, Reconciliation};
pub use market_maker::MarketMakerStrategy;
pub use spike::{PriceWindow, SpikeStrategy};
pub use swap::SwapStrategy;

/// Process-wide collaborators shared by every strategy, built once at startup
pub struct BotContext {
    /// Exchange account the bot trades for
    pub account: String,
    pub markets: Arc<MarketRegistry>,
    pub provider: Arc<dyn MarketDataProvider>,
    pub gateway: Arc<dyn OrderGateway>,
    pub notifier: Notifier,
    pub execution: ExecutionSettings,
}

impl BotContext {
    pub fn market(&self, symbol: &str) -> BotResult<&Market> {
        self.markets.require(symbol)
    }

    /// Let the exchange settle cancellations and withdrawals
    pub async fn rebalance_pause(&self) {
        if self.execution.rebalance_pause_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.execution.rebalance_pause_ms)).await;
        }
    }
}

/// Capability interface shared by all strategies
#[async_trait]
pub trait Strategy: Send {
    /// Strategy key, also written into the persisted record
    fn name(&self) -> &'static str;

    /// Pairs this strategy trades, in processing order
    fn symbols(&self) -> Vec<String>;

    /// Restore persisted state; called once before the first poll
    async fn initialize(&mut self, ctx: &BotContext) -> BotResult<()>;

    /// Run one poll over every configured pair
    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()>;

    /// Cancel every order this instance is tracking
    async fn cancel_own_orders(&mut self, ctx: &BotContext) -> BotResult<()>;
}

/// The closed set of strategies
pub enum StrategyKind {
    Grid(GridStrategy),
    Spike(SpikeStrategy),
    Swap(SwapStrategy),
    MarketMaker(MarketMakerStrategy),
}

impl StrategyKind {
    /// Build the strategy named in `[bot] strategy` from its config section
    pub fn from_settings(settings: &Settings, store: TrackedOrderStore) -> BotResult<Self> {
        let missing = |section: &str| BotError::Config(format!("[{}] section is required", section));

        Ok(match settings.bot.strategy {
            StrategyType::Grid => {
                let grid = settings.grid.clone().ok_or_else(|| missing("grid"))?;
                StrategyKind::Grid(GridStrategy::new(grid, store))
            }
            StrategyType::Spike => {
                let spike = settings.spike.clone().ok_or_else(|| missing("spike"))?;
                StrategyKind::Spike(SpikeStrategy::new(spike, store))
            }
            StrategyType::Swap => {
                let swap = settings.swap.clone().ok_or_else(|| missing("swap"))?;
                StrategyKind::Swap(SwapStrategy::new(swap))
            }
            StrategyType::MarketMaker => {
                let mm = settings.market_maker.clone().ok_or_else(|| missing("market_maker"))?;
                StrategyKind::MarketMaker(MarketMakerStrategy::new(mm, store))
            }
        })
    }

    fn inner(&mut self) -> &mut dyn Strategy {
        match self {
            StrategyKind::Grid(s) => s,
            StrategyKind::Spike(s) => s,
            StrategyKind::Swap(s) => s,
            StrategyKind::MarketMaker(s) => s,
        }
    }
}

#[async_trait]
impl Strategy for StrategyKind {
    fn name(&self) -> &'static str {
        match self {
            StrategyKind::Grid(s) => s.name(),
            StrategyKind::Spike(s) => s.name(),
            StrategyKind::Swap(s) => s.name(),
            StrategyKind::MarketMaker(s) => s.name(),
        }
    }

    fn symbols(&self) -> Vec<String> {
        match self {
            StrategyKind::Grid(s) => s.symbols(),
            StrategyKind::Spike(s) => s.symbols(),
            StrategyKind::Swap(s) => s.symbols(),
            StrategyKind::MarketMaker(s) => s.symbols(),
        }
    }

    async fn initialize(&mut self, ctx: &BotContext) -> BotResult<()> {
        self.inner().initialize(ctx).await
    }

    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()> {
        self.inner().trade(ctx).await
    }

    async fn cancel_own_orders(&mut self, ctx: &BotContext) -> BotResult<()> {
        self.inner().cancel_own_orders(ctx).await
    }
}
