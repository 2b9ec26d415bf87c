//! Swap strategy: converts a fixed amount in per-poll slices, only while the
//! best opposite price satisfies the configured limit

use async_trait::async_trait;
use log::{debug, info};
use rust_decimal::Decimal;
use serde_json::json;

use super::common::{ensure_balance, report_pair_error, size_order};
use super::{BotContext, Strategy};
use crate::config::{SwapPairConfig, SwapSettings};
use crate::errors::{BotError, BotResult};
use crate::market::{submit_in_batches, OrderBook, OrderSide};
use crate::notify::EventKind;

struct SwapPair {
    config: SwapPairConfig,
    /// Bid-token units still to convert
    remaining: Decimal,
}

/// Best price on the side a swap would trade against, if it satisfies `limit`
fn acceptable_price(book: &OrderBook, side: OrderSide, limit: Decimal) -> BotResult<Option<Decimal>> {
    let best = match side {
        OrderSide::Buy => book.best_ask(),
        OrderSide::Sell => book.best_bid(),
    };
    let Some(best) = best else {
        return Ok(None);
    };
    if best <= Decimal::ZERO {
        return Err(BotError::DataIntegrity(format!("best {} price is {}", side.opposite(), best)));
    }

    let acceptable = match side {
        OrderSide::Buy => best <= limit,
        OrderSide::Sell => best >= limit,
    };
    Ok(acceptable.then_some(best))
}

pub struct SwapStrategy {
    pairs: Vec<SwapPair>,
}

impl SwapStrategy {
    pub fn new(settings: SwapSettings) -> Self {
        let pairs = settings
            .pairs
            .into_iter()
            .map(|config| SwapPair {
                remaining: config.total_amount,
                config,
            })
            .collect();
        Self { pairs }
    }

    /// Amount still to convert on a pair
    pub fn remaining(&self, symbol: &str) -> Option<Decimal> {
        self.pairs
            .iter()
            .find(|p| p.config.symbol == symbol)
            .map(|p| p.remaining)
    }
}

impl SwapPair {
    async fn poll(&mut self, ctx: &BotContext) -> BotResult<()> {
        let config = &self.config;
        if self.remaining <= Decimal::ZERO {
            debug!("[swap] {}: complete", config.symbol);
            return Ok(());
        }

        let market = ctx.market(&config.symbol)?.clone();
        let book = ctx
            .provider
            .fetch_order_book(&config.symbol, ctx.execution.order_book_depth)
            .await?;
        let Some(price) = acceptable_price(&book, config.side, config.limit_price)? else {
            debug!(
                "[swap] {}: no {} price within limit {}",
                config.symbol,
                config.side.opposite(),
                config.limit_price
            );
            return Ok(());
        };

        let amount = config.amount_per_poll.min(self.remaining);
        let order = size_order(&market, config.side, price, amount);
        if !ensure_balance(ctx, &market, std::slice::from_ref(&order)).await? {
            return Ok(());
        }

        submit_in_batches(ctx.gateway.as_ref(), std::slice::from_ref(&order), &ctx.execution).await?;
        self.remaining -= amount;

        info!(
            "[swap] {}: {} {} @ {}, {} left",
            config.symbol, config.side, amount, price, self.remaining
        );
        ctx.notifier.emit(
            EventKind::OrderPlaced,
            json!({
                "symbol": config.symbol,
                "orders": [order],
                "remaining": self.remaining.to_string(),
            }),
        );
        Ok(())
    }
}

#[async_trait]
impl Strategy for SwapStrategy {
    fn name(&self) -> &'static str {
        "swap"
    }

    fn symbols(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.config.symbol.clone()).collect()
    }

    async fn initialize(&mut self, _ctx: &BotContext) -> BotResult<()> {
        for pair in &self.pairs {
            info!(
                "[swap] {}: converting {} via {} slices of {}",
                pair.config.symbol, pair.remaining, pair.config.side, pair.config.amount_per_poll
            );
        }
        Ok(())
    }

    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()> {
        for pair in self.pairs.iter_mut() {
            if let Err(e) = pair.poll(ctx).await {
                report_pair_error(ctx, "swap", &pair.config.symbol, &e);
            }
        }
        Ok(())
    }

    /// Swap slices are fire-and-forget, nothing is tracked
    async fn cancel_own_orders(&mut self, _ctx: &BotContext) -> BotResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::BookLevel;
    use crate::strategy::test_support::{context, paper_exchange, SYMBOL};
    use rust_decimal_macros::dec;

    fn level(price: Decimal) -> BookLevel {
        BookLevel {
            price,
            quantity: dec!(1000),
        }
    }

    fn book(bid: Decimal, ask: Decimal) -> OrderBook {
        OrderBook {
            bids: vec![level(bid)],
            asks: vec![level(ask)],
        }
    }

    fn sell_settings() -> SwapSettings {
        SwapSettings {
            pairs: vec![SwapPairConfig {
                symbol: SYMBOL.to_string(),
                side: OrderSide::Sell,
                amount_per_poll: dec!(400),
                limit_price: dec!(0.0050),
                total_amount: dec!(1000),
            }],
        }
    }

    #[test]
    fn test_acceptable_price_by_side() {
        let book = book(dec!(0.0049), dec!(0.0051));

        assert_eq!(acceptable_price(&book, OrderSide::Buy, dec!(0.0051)).unwrap(), Some(dec!(0.0051)));
        assert_eq!(acceptable_price(&book, OrderSide::Buy, dec!(0.0050)).unwrap(), None);
        assert_eq!(acceptable_price(&book, OrderSide::Sell, dec!(0.0049)).unwrap(), Some(dec!(0.0049)));
        assert_eq!(acceptable_price(&book, OrderSide::Sell, dec!(0.0050)).unwrap(), None);
        assert_eq!(acceptable_price(&OrderBook::default(), OrderSide::Sell, dec!(0.0050)).unwrap(), None);

        let zero = acceptable_price(&self::book(Decimal::ZERO, dec!(0.0051)), OrderSide::Sell, dec!(0));
        assert!(zero.unwrap_err().is_skip_condition());
    }

    #[tokio::test]
    async fn test_sells_in_slices_until_done() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(5000)).await;
        exchange.set_order_book(SYMBOL, book(dec!(0.0052), dec!(0.0053))).await;
        let (ctx, _queue) = context(exchange.clone());
        let mut strategy = SwapStrategy::new(sell_settings());

        for _ in 0..4 {
            strategy.trade(&ctx).await.unwrap();
        }

        let quantities: Vec<Decimal> = exchange.submitted_orders().await.iter().map(|o| o.quantity).collect();
        assert_eq!(quantities, vec![dec!(400), dec!(400), dec!(200)]);
        assert!(exchange
            .submitted_orders()
            .await
            .iter()
            .all(|o| o.side == OrderSide::Sell && o.price == dec!(0.0052)));
        assert_eq!(strategy.remaining(SYMBOL), Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_skips_outside_limit() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(5000)).await;
        exchange.set_order_book(SYMBOL, book(dec!(0.0049), dec!(0.0053))).await;
        let (ctx, _queue) = context(exchange.clone());
        let mut strategy = SwapStrategy::new(sell_settings());

        strategy.trade(&ctx).await.unwrap();

        assert!(exchange.submitted_batches().await.is_empty());
        assert_eq!(strategy.remaining(SYMBOL), Some(dec!(1000)));
    }

    #[tokio::test]
    async fn test_low_balance_skips_slice() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(100)).await;
        exchange.set_order_book(SYMBOL, book(dec!(0.0052), dec!(0.0053))).await;
        let (ctx, mut queue) = context(exchange.clone());
        let mut strategy = SwapStrategy::new(sell_settings());

        strategy.trade(&ctx).await.unwrap();

        assert!(exchange.submitted_batches().await.is_empty());
        assert_eq!(queue.try_next_event().unwrap().kind, EventKind::BalanceLow);
        assert_eq!(strategy.remaining(SYMBOL), Some(dec!(1000)));
    }
}
