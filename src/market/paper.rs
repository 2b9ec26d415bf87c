//! Paper trading exchange
//!
//! Takes prices from an optional upstream provider but simulates order
//! execution locally: a resting BUY fills once the latest price is at or below
//! its limit, a SELL once it is at or above. Balances are locked when an order
//! is accepted, released on cancel and credited on fill.
//!
//! Without a feed the exchange is fully in-memory and doubles as the mock used
//! by strategy tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use rust_decimal::Decimal;
use tokio::sync::Mutex;

use super::gateway::OrderGateway;
use super::provider::MarketDataProvider;
use super::types::{Market, OpenOrder, OrderBook, OrderSide, TradeOrder};
use crate::decimal::round_to;
use crate::errors::{BotError, BotResult};

/// A simulated resting order
#[derive(Debug, Clone)]
struct PaperOrder {
    order_id: String,
    order: TradeOrder,
    /// Token code and amount held back while the order rests
    locked_token: String,
    locked: Decimal,
}

impl PaperOrder {
    /// Check if this order should be filled at the given price
    fn should_fill(&self, price: Decimal) -> bool {
        match self.order.side {
            OrderSide::Buy => price <= self.order.price,
            OrderSide::Sell => price >= self.order.price,
        }
    }

    fn to_open_order(&self) -> OpenOrder {
        OpenOrder {
            order_id: self.order_id.clone(),
            symbol: self.order.symbol.clone(),
            side: self.order.side,
            price: self.order.price,
            quantity: self.order.quantity,
        }
    }
}

#[derive(Debug, Default)]
struct PaperBook {
    markets: HashMap<String, Market>,
    prices: HashMap<String, Decimal>,
    books: HashMap<String, OrderBook>,
    resting: Vec<PaperOrder>,
    /// Available (unlocked) balance by token code
    balances: HashMap<String, Decimal>,
    submitted: Vec<Vec<TradeOrder>>,
    cancelled: Vec<String>,
    withdrawals: u32,
    should_fail: bool,
    /// Submissions still accepted before every later one is rejected
    accept_batches: Option<usize>,
}

impl PaperBook {
    fn market(&self, symbol: &str) -> BotResult<&Market> {
        self.markets
            .get(symbol)
            .ok_or_else(|| BotError::MarketNotFound(symbol.to_string()))
    }

    fn available(&self, code: &str) -> Decimal {
        self.balances.get(code).copied().unwrap_or(Decimal::ZERO)
    }

    fn credit(&mut self, code: &str, amount: Decimal) {
        *self.balances.entry(code.to_string()).or_insert(Decimal::ZERO) += amount;
    }

    /// Token and amount an order commits: the ask token for a BUY (spend),
    /// the bid token for a SELL (size)
    fn commitment(&self, order: &TradeOrder) -> BotResult<(String, Decimal)> {
        let market = self.market(&order.symbol)?;
        let code = match order.side {
            OrderSide::Buy => market.ask_token.code.clone(),
            OrderSide::Sell => market.bid_token.code.clone(),
        };
        Ok((code, order.quantity))
    }

    fn release(&mut self, order: &PaperOrder) {
        let (code, amount) = (order.locked_token.clone(), order.locked);
        self.credit(&code, amount);
    }

    /// Settle a fill at the order's limit price
    fn settle(&mut self, order: &PaperOrder) -> BotResult<()> {
        let market = self.market(&order.order.symbol)?.clone();
        let price = order.order.price;
        match order.order.side {
            OrderSide::Buy => {
                let received = order
                    .order
                    .quantity
                    .checked_div(price)
                    .map(|q| round_to(q, market.bid_token.precision))
                    .ok_or_else(|| BotError::DataIntegrity("zero fill price".into()))?;
                self.credit(&market.bid_token.code, received);
            }
            OrderSide::Sell => {
                let received = round_to(order.order.quantity * price, market.ask_token.precision);
                self.credit(&market.ask_token.code, received);
            }
        }
        info!(
            "Paper fill: {} {} {} @ {} (order {})",
            order.order.side, order.order.quantity, order.order.symbol, price, order.order_id
        );
        Ok(())
    }

    /// Record a new price and fill every crossing order on that pair
    fn apply_price(&mut self, symbol: &str, price: Decimal, auto_fill: bool) -> BotResult<()> {
        self.prices.insert(symbol.to_string(), price);
        if !auto_fill {
            return Ok(());
        }

        let (filled, resting): (Vec<PaperOrder>, Vec<PaperOrder>) = std::mem::take(&mut self.resting)
            .into_iter()
            .partition(|o| o.order.symbol == symbol && o.should_fill(price));
        self.resting = resting;

        for order in &filled {
            self.settle(order)?;
        }
        Ok(())
    }
}

/// Paper trading gateway and provider
pub struct PaperExchange {
    feed: Option<Arc<dyn MarketDataProvider>>,
    auto_fill: bool,
    state: Mutex<PaperBook>,
    next_order_id: AtomicU64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    /// Fully in-memory exchange; orders only fill through [`fill_order`](Self::fill_order)
    pub fn new() -> Self {
        Self {
            feed: None,
            auto_fill: false,
            state: Mutex::new(PaperBook::default()),
            next_order_id: AtomicU64::new(1),
        }
    }

    /// Paper exchange priced by a live provider, filling on price crosses
    pub fn with_feed(feed: Arc<dyn MarketDataProvider>) -> Self {
        Self {
            feed: Some(feed),
            auto_fill: true,
            ..Self::new()
        }
    }

    pub fn with_auto_fill(mut self, auto_fill: bool) -> Self {
        self.auto_fill = auto_fill;
        self
    }

    pub fn with_markets(mut self, markets: Vec<Market>) -> Self {
        {
            let book = self.state.get_mut();
            for market in markets {
                book.markets.insert(market.symbol.clone(), market);
            }
        }
        self
    }

    pub async fn set_balance(&self, code: &str, amount: Decimal) {
        self.state.lock().await.balances.insert(code.to_string(), amount);
    }

    pub async fn balance(&self, code: &str) -> Decimal {
        self.state.lock().await.available(code)
    }

    /// Set the latest trade price, filling crossing orders when auto-fill is on
    pub async fn set_price(&self, symbol: &str, price: Decimal) -> BotResult<()> {
        self.state.lock().await.apply_price(symbol, price, self.auto_fill)
    }

    /// Override the order book returned for a pair when no feed is attached
    pub async fn set_order_book(&self, symbol: &str, book: OrderBook) {
        self.state.lock().await.books.insert(symbol.to_string(), book);
    }

    /// Reject every submission, or accept them all again
    pub async fn set_should_fail(&self, fail: bool) {
        let mut book = self.state.lock().await;
        book.should_fail = fail;
        book.accept_batches = None;
    }

    /// Accept the next `batches` submissions, then reject every later one
    pub async fn fail_after_batches(&self, batches: usize) {
        self.state.lock().await.accept_batches = Some(batches);
    }

    /// Fill a resting order at its limit price. Returns `false` if the id is unknown.
    pub async fn fill_order(&self, order_id: &str) -> BotResult<bool> {
        let mut book = self.state.lock().await;
        let Some(pos) = book.resting.iter().position(|o| o.order_id == order_id) else {
            return Ok(false);
        };
        let order = book.resting.remove(pos);
        book.settle(&order)?;
        Ok(true)
    }

    /// Fill the resting order at exactly this price and side
    pub async fn fill_at(&self, symbol: &str, side: OrderSide, price: Decimal) -> BotResult<bool> {
        let order_id = {
            let book = self.state.lock().await;
            book.resting
                .iter()
                .find(|o| o.order.symbol == symbol && o.order.side == side && o.order.price == price)
                .map(|o| o.order_id.clone())
        };
        match order_id {
            Some(id) => self.fill_order(&id).await,
            None => Ok(false),
        }
    }

    pub async fn open_orders(&self) -> Vec<OpenOrder> {
        self.state.lock().await.resting.iter().map(PaperOrder::to_open_order).collect()
    }

    pub async fn submitted_batches(&self) -> Vec<Vec<TradeOrder>> {
        self.state.lock().await.submitted.clone()
    }

    pub async fn submitted_orders(&self) -> Vec<TradeOrder> {
        self.state.lock().await.submitted.iter().flatten().cloned().collect()
    }

    pub async fn cancelled_ids(&self) -> Vec<String> {
        self.state.lock().await.cancelled.clone()
    }

    pub async fn withdraw_count(&self) -> u32 {
        self.state.lock().await.withdrawals
    }
}

#[async_trait]
impl MarketDataProvider for PaperExchange {
    async fn fetch_markets(&self) -> BotResult<Vec<Market>> {
        if let Some(feed) = &self.feed {
            let markets = feed.fetch_markets().await?;
            let mut book = self.state.lock().await;
            for market in &markets {
                book.markets.insert(market.symbol.clone(), market.clone());
            }
            return Ok(markets);
        }

        let book = self.state.lock().await;
        let mut markets: Vec<Market> = book.markets.values().cloned().collect();
        markets.sort_by_key(|m| m.market_id);
        Ok(markets)
    }

    async fn fetch_latest_price(&self, symbol: &str) -> BotResult<Decimal> {
        if let Some(feed) = &self.feed {
            let price = feed.fetch_latest_price(symbol).await?;
            self.state.lock().await.apply_price(symbol, price, self.auto_fill)?;
            return Ok(price);
        }

        self.state
            .lock()
            .await
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| BotError::MarketData(format!("no price for {}", symbol)))
    }

    async fn fetch_order_book(&self, symbol: &str, depth: usize) -> BotResult<OrderBook> {
        if let Some(feed) = &self.feed {
            return feed.fetch_order_book(symbol, depth).await;
        }

        let book = self.state.lock().await;
        if let Some(stored) = book.books.get(symbol) {
            return Ok(stored.clone());
        }
        let own: Vec<OpenOrder> = book
            .resting
            .iter()
            .filter(|o| o.order.symbol == symbol)
            .map(PaperOrder::to_open_order)
            .collect();
        Ok(OrderBook::from_open_orders(&own, depth))
    }

    async fn fetch_pair_open_orders(&self, _account: &str, symbol: &str) -> BotResult<Vec<OpenOrder>> {
        let book = self.state.lock().await;
        Ok(book
            .resting
            .iter()
            .filter(|o| o.order.symbol == symbol)
            .map(PaperOrder::to_open_order)
            .collect())
    }

    async fn fetch_token_balance(&self, _account: &str, _contract: &str, code: &str) -> BotResult<Decimal> {
        Ok(self.state.lock().await.available(code))
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn submit_orders(&self, orders: &[TradeOrder]) -> BotResult<()> {
        let mut book = self.state.lock().await;
        if book.should_fail || book.accept_batches == Some(0) {
            return Err(BotError::Gateway("paper exchange rejected submission".into()));
        }
        if let Some(remaining) = book.accept_batches.as_mut() {
            *remaining -= 1;
        }

        // Validate the whole transaction before touching any balance
        let mut required: HashMap<String, Decimal> = HashMap::new();
        for order in orders {
            if order.price <= Decimal::ZERO || order.quantity <= Decimal::ZERO {
                return Err(BotError::DataIntegrity(format!(
                    "non-positive price or quantity in {:?}",
                    order
                )));
            }
            let (code, amount) = book.commitment(order)?;
            *required.entry(code).or_insert(Decimal::ZERO) += amount;
        }
        for (code, amount) in &required {
            let available = book.available(code);
            if *amount > available {
                return Err(BotError::InsufficientBalance {
                    token: code.clone(),
                    required: *amount,
                    available,
                });
            }
        }

        for order in orders {
            let (code, amount) = book.commitment(order)?;
            book.credit(&code, -amount);
            let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst).to_string();
            debug!(
                "Paper order {}: {} {} {} @ {}",
                order_id, order.side, order.quantity, order.symbol, order.price
            );
            book.resting.push(PaperOrder {
                order_id,
                order: order.clone(),
                locked_token: code,
                locked: amount,
            });
        }
        book.submitted.push(orders.to_vec());

        // Orders that already cross the last known price fill immediately
        if self.auto_fill {
            let symbols: Vec<String> = orders.iter().map(|o| o.symbol.clone()).collect();
            for symbol in symbols {
                if let Some(price) = book.prices.get(&symbol).copied() {
                    book.apply_price(&symbol, price, true)?;
                }
            }
        }
        Ok(())
    }

    async fn cancel_order(&self, order_id: &str) -> BotResult<()> {
        let mut book = self.state.lock().await;
        let pos = book
            .resting
            .iter()
            .position(|o| o.order_id == order_id)
            .ok_or_else(|| BotError::Gateway(format!("order {} is not resting", order_id)))?;
        let order = book.resting.remove(pos);
        book.release(&order);
        book.cancelled.push(order.order_id);
        Ok(())
    }

    async fn cancel_all_orders(&self) -> BotResult<()> {
        let mut book = self.state.lock().await;
        let resting = std::mem::take(&mut book.resting);
        for order in resting {
            book.release(&order);
            book.cancelled.push(order.order_id);
        }
        Ok(())
    }

    async fn withdraw_all(&self) -> BotResult<()> {
        self.state.lock().await.withdrawals += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::types::Token;
    use rust_decimal_macros::dec;

    fn market() -> Market {
        Market {
            market_id: 1,
            symbol: "XPR_XUSDC".into(),
            maker_fee: dec!(0.001),
            taker_fee: dec!(0.002),
            bid_token: Token::new("XPR", 4, "eosio.token"),
            ask_token: Token::new("XUSDC", 6, "xtokens"),
        }
    }

    async fn funded() -> PaperExchange {
        let exchange = PaperExchange::new().with_markets(vec![market()]);
        exchange.set_balance("XPR", dec!(10000)).await;
        exchange.set_balance("XUSDC", dec!(100)).await;
        exchange
    }

    #[tokio::test]
    async fn test_submit_locks_and_cancel_releases() {
        let exchange = funded().await;
        exchange
            .submit_orders(&[
                TradeOrder::sell("XPR_XUSDC", dec!(0.0052), dec!(1000)),
                TradeOrder::buy("XPR_XUSDC", dec!(0.0050), dec!(5)),
            ])
            .await
            .unwrap();

        assert_eq!(exchange.balance("XPR").await, dec!(9000));
        assert_eq!(exchange.balance("XUSDC").await, dec!(95));

        let open = exchange.fetch_pair_open_orders("acct", "XPR_XUSDC").await.unwrap();
        assert_eq!(open.len(), 2);
        assert_ne!(open[0].order_id, open[1].order_id);

        exchange.cancel_order(&open[0].order_id).await.unwrap();
        assert_eq!(exchange.balance("XPR").await, dec!(10000));
        assert_eq!(exchange.cancelled_ids().await, vec![open[0].order_id.clone()]);
        assert!(exchange.cancel_order(&open[0].order_id).await.is_err());
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejects_whole_batch() {
        let exchange = funded().await;
        let result = exchange
            .submit_orders(&[
                TradeOrder::sell("XPR_XUSDC", dec!(0.0052), dec!(6000)),
                TradeOrder::sell("XPR_XUSDC", dec!(0.0053), dec!(6000)),
            ])
            .await;

        assert!(matches!(result, Err(BotError::InsufficientBalance { .. })));
        assert!(exchange.open_orders().await.is_empty());
        assert_eq!(exchange.balance("XPR").await, dec!(10000));
    }

    #[tokio::test]
    async fn test_auto_fill_on_price_cross() {
        let exchange = funded().await.with_auto_fill(true);
        exchange
            .submit_orders(&[
                TradeOrder::buy("XPR_XUSDC", dec!(0.0050), dec!(5)),
                TradeOrder::sell("XPR_XUSDC", dec!(0.0060), dec!(100)),
            ])
            .await
            .unwrap();

        exchange.set_price("XPR_XUSDC", dec!(0.0049)).await.unwrap();

        let open = exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, OrderSide::Sell);
        // 5 XUSDC at 0.0050 buys 1000 XPR
        assert_eq!(exchange.balance("XPR").await, dec!(10900));
    }

    #[tokio::test]
    async fn test_manual_fill_credits_quote() {
        let exchange = funded().await;
        exchange
            .submit_orders(&[TradeOrder::sell("XPR_XUSDC", dec!(0.0052), dec!(1000))])
            .await
            .unwrap();

        assert!(exchange.fill_at("XPR_XUSDC", OrderSide::Sell, dec!(0.0052)).await.unwrap());
        assert_eq!(exchange.balance("XUSDC").await, dec!(105.2));
        assert!(!exchange.fill_order("999").await.unwrap());
    }

    #[tokio::test]
    async fn test_should_fail() {
        let exchange = funded().await;
        exchange.set_should_fail(true).await;
        let result = exchange
            .submit_orders(&[TradeOrder::buy("XPR_XUSDC", dec!(0.005), dec!(1))])
            .await;
        assert!(matches!(result, Err(BotError::Gateway(_))));
    }
}
