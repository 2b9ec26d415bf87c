//! Market data source abstraction - enables mocking for tests

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::types::{Market, OpenOrder, OrderBook};
use crate::errors::BotResult;

/// Read-only exchange data consumed by the strategies
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Full market listing, used once at startup to build the registry
    async fn fetch_markets(&self) -> BotResult<Vec<Market>>;

    /// Last trade price of a pair
    async fn fetch_latest_price(&self, symbol: &str) -> BotResult<Decimal>;

    /// Aggregated order book, at most `depth` levels per side
    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> BotResult<OrderBook>;

    /// The account's resting orders on one pair
    async fn fetch_pair_open_orders(&self, account: &str, symbol: &str) -> BotResult<Vec<OpenOrder>>;

    /// Available (unlocked) balance of a token
    async fn fetch_token_balance(&self, account: &str, contract: &str, code: &str) -> BotResult<Decimal>;
}
