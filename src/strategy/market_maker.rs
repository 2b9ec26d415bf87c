//! Market-maker strategy
//!
//! Quotes `levels` BUY/SELL pairs around the order-book mid. Any fill pulls the
//! remaining quotes and re-quotes the whole ladder around the new mid.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde_json::json;

use super::common::{cancel_tracked_orders, ensure_balance, fetch_live, place_tracked, report_pair_error, size_order};
use super::{BotContext, Strategy};
use crate::config::{MarketMakerPairConfig, MarketMakerSettings};
use crate::errors::{BotError, BotResult};
use crate::market::{Market, OrderSide, TradeOrder};
use crate::notify::EventKind;
use crate::tracking::{TrackedOrder, TrackedOrderStore, TrackedRole};

/// Quote ladder at `spread_pct + step_pct * L` percent around `mid`
fn quote_ladder(market: &Market, pair: &MarketMakerPairConfig, mid: Decimal) -> Vec<TradeOrder> {
    let mut orders = Vec::with_capacity(pair.levels as usize * 2);
    for level in 0..pair.levels {
        let offset = (pair.spread_pct + pair.step_pct * Decimal::from(level)) / Decimal::ONE_HUNDRED;
        let bid = market.round_price(mid * (Decimal::ONE - offset));
        let ask = market.round_price(mid * (Decimal::ONE + offset));

        if bid > Decimal::ZERO {
            orders.push(size_order(market, OrderSide::Buy, bid, pair.order_amount));
        }
        orders.push(size_order(market, OrderSide::Sell, ask, pair.order_amount));
    }
    orders
}

pub struct MarketMakerStrategy {
    pairs: Vec<MarketMakerPairConfig>,
    store: TrackedOrderStore,
    quotes: HashMap<String, Vec<TrackedOrder>>,
}

impl MarketMakerStrategy {
    pub fn new(settings: MarketMakerSettings, store: TrackedOrderStore) -> Self {
        Self {
            pairs: settings.pairs,
            store,
            quotes: HashMap::new(),
        }
    }

    pub fn quotes(&self, symbol: &str) -> &[TrackedOrder] {
        self.quotes.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    fn all_tracked(&self) -> Vec<TrackedOrder> {
        self.pairs
            .iter()
            .flat_map(|p| self.quotes(&p.symbol).iter().cloned())
            .collect()
    }

    async fn mid_price(ctx: &BotContext, symbol: &str) -> BotResult<Decimal> {
        let book = ctx
            .provider
            .fetch_order_book(symbol, ctx.execution.order_book_depth)
            .await?;
        let mid = match book.mid() {
            Some(mid) => mid,
            None => ctx.provider.fetch_latest_price(symbol).await?,
        };
        if mid <= Decimal::ZERO {
            return Err(BotError::DataIntegrity(format!("{}: non-positive mid {}", symbol, mid)));
        }
        Ok(mid)
    }

    async fn quote_pair(&mut self, ctx: &BotContext, pair: &MarketMakerPairConfig) -> BotResult<()> {
        let market = ctx.market(&pair.symbol)?.clone();

        if !self.quotes(&pair.symbol).is_empty() {
            let live = fetch_live(ctx, &pair.symbol).await?;
            let (mut resting, filled): (Vec<_>, Vec<_>) = self
                .quotes(&pair.symbol)
                .iter()
                .cloned()
                .partition(|q| q.is_resting_in(&live));
            if filled.is_empty() {
                debug!("[market_maker] {}: {} quotes resting", pair.symbol, resting.len());
                return Ok(());
            }

            for quote in &filled {
                info!(
                    "[market_maker] {}: {} quote filled at {}",
                    pair.symbol, quote.order.side, quote.order.price
                );
                ctx.notifier.emit(
                    EventKind::OrderFilled,
                    json!({
                        "symbol": pair.symbol,
                        "side": quote.order.side,
                        "price": quote.order.price.to_string(),
                        "quantity": quote.order.quantity.to_string(),
                        "order_id": quote.order_id,
                    }),
                );
            }

            // Pull what is left before re-quoting around the new mid
            if !cancel_tracked_orders(ctx, &mut resting).await {
                self.quotes.insert(pair.symbol.clone(), resting);
                return Err(BotError::Gateway(format!("{}: could not pull remaining quotes", pair.symbol)));
            }
            self.quotes.remove(&pair.symbol);
            ctx.gateway.withdraw_all().await?;
            ctx.rebalance_pause().await;
        }

        let mid = Self::mid_price(ctx, &pair.symbol).await?;
        let orders = quote_ladder(&market, pair, mid);
        if !ensure_balance(ctx, &market, &orders).await? {
            return Ok(());
        }

        // Quotes accepted before a failing batch are tracked and pulled on the next fill
        let mut placed = Vec::new();
        let outcome = place_tracked(ctx, TrackedRole::Quote, orders, &HashSet::new(), &mut placed).await;
        info!("[market_maker] {}: quoted {} orders around {}", pair.symbol, placed.len(), mid);
        if !placed.is_empty() {
            self.quotes.insert(pair.symbol.clone(), placed);
        }
        outcome.map(|_| ())
    }
}

#[async_trait]
impl Strategy for MarketMakerStrategy {
    fn name(&self) -> &'static str {
        "market_maker"
    }

    fn symbols(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.symbol.clone()).collect()
    }

    async fn initialize(&mut self, _ctx: &BotContext) -> BotResult<()> {
        for order in self.store.load() {
            if order.role != TrackedRole::Quote || !self.pairs.iter().any(|p| p.symbol == order.symbol()) {
                warn!("[market_maker] ignoring persisted {:?} order on {}", order.role, order.symbol());
                continue;
            }
            self.quotes.entry(order.symbol().to_string()).or_default().push(order);
        }
        Ok(())
    }

    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()> {
        let pairs = self.pairs.clone();
        for pair in &pairs {
            if let Err(e) = self.quote_pair(ctx, pair).await {
                report_pair_error(ctx, self.name(), &pair.symbol, &e);
            }
        }
        self.store.save(self.name(), &self.all_tracked());
        Ok(())
    }

    async fn cancel_own_orders(&mut self, ctx: &BotContext) -> BotResult<()> {
        let mut all = self.all_tracked();
        let all_cancelled = cancel_tracked_orders(ctx, &mut all).await;
        self.quotes.clear();

        if all_cancelled {
            self.store.cleanup();
            Ok(())
        } else {
            Err(BotError::Gateway("some quotes could not be cancelled".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::test_support::{context, paper_exchange, xpr_market, SYMBOL};
    use rust_decimal_macros::dec;

    fn settings() -> MarketMakerSettings {
        MarketMakerSettings {
            pairs: vec![MarketMakerPairConfig {
                symbol: SYMBOL.to_string(),
                levels: 2,
                spread_pct: dec!(1),
                step_pct: dec!(0.5),
                order_amount: dec!(1),
            }],
        }
    }

    fn prices(orders: &[TradeOrder]) -> Vec<(OrderSide, Decimal)> {
        orders.iter().map(|o| (o.side, o.price)).collect()
    }

    #[test]
    fn test_quote_ladder_offsets() {
        let orders = quote_ladder(&xpr_market(), &settings().pairs[0], dec!(100));
        assert_eq!(
            prices(&orders),
            vec![
                (OrderSide::Buy, dec!(99)),
                (OrderSide::Sell, dec!(101)),
                (OrderSide::Buy, dec!(98.5)),
                (OrderSide::Sell, dec!(101.5)),
            ]
        );
    }

    #[tokio::test]
    async fn test_fill_requotes_around_new_mid() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(1000)).await;
        exchange.set_balance("XUSDC", dec!(10000)).await;
        exchange.set_price(SYMBOL, dec!(100)).await.unwrap();
        let (ctx, mut queue) = context(exchange.clone());
        let mut strategy = MarketMakerStrategy::new(settings(), TrackedOrderStore::disabled());

        strategy.trade(&ctx).await.unwrap();
        assert_eq!(strategy.quotes(SYMBOL).len(), 4);

        // Resting quotes are left alone
        strategy.trade(&ctx).await.unwrap();
        assert_eq!(exchange.submitted_batches().await.len(), 1);

        assert!(exchange.fill_at(SYMBOL, OrderSide::Buy, dec!(99)).await.unwrap());
        exchange.set_price(SYMBOL, dec!(98)).await.unwrap();
        strategy.trade(&ctx).await.unwrap();

        assert_eq!(exchange.cancelled_ids().await.len(), 3);
        let batches = exchange.submitted_batches().await;
        assert_eq!(batches.len(), 2);
        assert_eq!(
            prices(&batches[1]),
            vec![
                (OrderSide::Buy, dec!(97.02)),
                (OrderSide::Sell, dec!(98.98)),
                (OrderSide::Buy, dec!(96.53)),
                (OrderSide::Sell, dec!(99.47)),
            ]
        );
        assert!(strategy.quotes(SYMBOL).iter().all(|q| q.order_id.is_some()));

        let kinds: Vec<EventKind> = queue.drain_events().into_iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EventKind::OrderFilled));
        assert!(kinds.contains(&EventKind::OrderCancelled));
    }

    #[tokio::test]
    async fn test_quotes_need_balance() {
        let exchange = paper_exchange();
        exchange.set_balance("XUSDC", dec!(10000)).await;
        exchange.set_price(SYMBOL, dec!(100)).await.unwrap();
        let (ctx, mut queue) = context(exchange.clone());
        let mut strategy = MarketMakerStrategy::new(settings(), TrackedOrderStore::disabled());

        strategy.trade(&ctx).await.unwrap();

        assert!(exchange.submitted_batches().await.is_empty());
        assert!(strategy.quotes(SYMBOL).is_empty());
        assert_eq!(queue.try_next_event().unwrap().kind, EventKind::BalanceLow);
    }
}
