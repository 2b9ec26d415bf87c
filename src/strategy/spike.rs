//! Spike strategy
//!
//! Places BUY/SELL pairs at fixed percentage deviations around a rolling
//! moving average. A filled spike order is answered by a take-profit on the
//! opposite side priced at the average; the whole ladder is torn down and
//! rebuilt once the average drifts past the rebalance threshold.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde_json::json;

use super::common::{
    cancel_tracked_orders, clear_pair, ensure_balance, fetch_live, place_tracked, report_pair_error, size_order,
};
use super::{BotContext, Strategy};
use crate::config::{SpikePairConfig, SpikeSettings};
use crate::decimal::percent_drift;
use crate::errors::{BotError, BotResult};
use crate::market::{Market, OpenOrder, OrderSide, TradeOrder};
use crate::notify::EventKind;
use crate::tracking::{tracked_ids, TrackedOrder, TrackedOrderStore, TrackedRole};

/// Fixed-capacity FIFO of recent prices
#[derive(Debug, Clone)]
pub struct PriceWindow {
    prices: VecDeque<Decimal>,
    capacity: usize,
}

impl PriceWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            prices: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a price, evicting the oldest once at capacity
    pub fn push(&mut self, price: Decimal) {
        if self.prices.len() == self.capacity {
            self.prices.pop_front();
        }
        self.prices.push_back(price);
    }

    pub fn len(&self) -> usize {
        self.prices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prices.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.prices.len() == self.capacity
    }

    /// Simple average of the window; `None` while empty
    pub fn average(&self) -> Option<Decimal> {
        let sum: Decimal = self.prices.iter().sum();
        sum.checked_div(Decimal::from(self.prices.len()))
    }
}

/// Whether the average moved more than `threshold_pct` away from `reference`
fn drift_exceeds(current: Decimal, reference: Decimal, threshold_pct: Decimal) -> BotResult<bool> {
    let drift = percent_drift(current, reference)
        .ok_or_else(|| BotError::DataIntegrity("ladder reference average is zero".into()))?;
    Ok(drift > threshold_pct)
}

/// BUY/SELL pairs at `deviation_pct * L` percent around `ma`, for L in 1..=levels
fn spike_ladder(market: &Market, config: &SpikePairConfig, ma: Decimal) -> Vec<TradeOrder> {
    let mut orders = Vec::with_capacity(config.levels as usize * 2);
    for level in 1..=config.levels {
        let deviation = config.deviation_pct * Decimal::from(level) / Decimal::ONE_HUNDRED;
        let buy = market.round_price(ma * (Decimal::ONE - deviation));
        let sell = market.round_price(ma * (Decimal::ONE + deviation));

        if buy > Decimal::ZERO {
            orders.push(size_order(market, OrderSide::Buy, buy, config.order_amount));
        } else {
            warn!("[spike] {}: level {} BUY price is not positive, skipped", config.symbol, level);
        }
        orders.push(size_order(market, OrderSide::Sell, sell, config.order_amount));
    }
    orders
}

struct PairState {
    config: SpikePairConfig,
    window: PriceWindow,
    current_ma: Option<Decimal>,
    /// Average the live ladder was placed around
    last_order_ma: Option<Decimal>,
    spike: Vec<TrackedOrder>,
    take_profit: Vec<TrackedOrder>,
}

impl PairState {
    fn new(config: SpikePairConfig, ma_window: usize) -> Self {
        Self {
            config,
            window: PriceWindow::new(ma_window),
            current_ma: None,
            last_order_ma: None,
            spike: Vec::new(),
            take_profit: Vec::new(),
        }
    }

    fn symbol(&self) -> &str {
        &self.config.symbol
    }

    /// Live orders of the pair restricted to the ones this instance tracks.
    ///
    /// With no ids tracked yet the unfiltered list is returned, so orders from a
    /// previous run stay visible.
    fn own_orders(&self, live: Vec<OpenOrder>) -> Vec<OpenOrder> {
        let tracked = || self.spike.iter().chain(self.take_profit.iter());
        let ids = tracked_ids(tracked());
        if ids.is_empty() {
            return live;
        }
        live.into_iter()
            .filter(|open| {
                ids.contains(&open.order_id) || tracked().any(|t| t.order_id.is_none() && t.matches(open))
            })
            .collect()
    }

    async fn poll(&mut self, ctx: &BotContext, rebalance_threshold_pct: Decimal) -> BotResult<()> {
        let symbol = self.symbol().to_string();
        let market = ctx.market(&symbol)?.clone();

        let price = ctx.provider.fetch_latest_price(&symbol).await?;
        if price <= Decimal::ZERO {
            return Err(BotError::DataIntegrity(format!("{}: non-positive price {}", symbol, price)));
        }
        self.window.push(price);
        if !self.window.is_full() {
            debug!(
                "[spike] {}: warming up ({}/{})",
                symbol,
                self.window.len(),
                self.window.capacity
            );
            return Ok(());
        }
        let ma = self
            .window
            .average()
            .ok_or_else(|| BotError::DataIntegrity(format!("{}: empty price window", symbol)))?;

        let live = self.own_orders(fetch_live(ctx, &symbol).await?);
        self.settle_fills(ctx, &market, ma, &live).await?;

        let mut rebuilt = false;
        if let Some(reference) = self.last_order_ma {
            if !self.spike.is_empty() && drift_exceeds(ma, reference, rebalance_threshold_pct)? {
                info!(
                    "[spike] {}: average moved from {} to {}, rebuilding ladder",
                    symbol, reference, ma
                );
                clear_pair(ctx, &symbol, &HashSet::new()).await?;
                self.spike.clear();
                self.take_profit.clear();
                self.last_order_ma = None;
                ctx.notifier.emit(
                    EventKind::GridAdjusted,
                    json!({
                        "symbol": symbol,
                        "previous_ma": reference.to_string(),
                        "current_ma": ma.to_string(),
                    }),
                );
                rebuilt = true;
            }
        }

        if self.spike.is_empty() {
            if !rebuilt {
                let keep = tracked_ids(&self.take_profit);
                clear_pair(ctx, &symbol, &keep).await?;
            }
            self.place_ladder(ctx, &market, ma).await?;
        }

        self.current_ma = Some(ma);
        Ok(())
    }

    /// Detect spike and take-profit fills and place the take-profit counters.
    ///
    /// A filled spike order stays tracked until its take-profit reaches the book.
    async fn settle_fills(&mut self, ctx: &BotContext, market: &Market, ma: Decimal, live: &[OpenOrder]) -> BotResult<()> {
        let (spike_resting, spike_filled): (Vec<_>, Vec<_>) =
            self.spike.iter().cloned().partition(|t| t.is_resting_in(live));
        let (tp_resting, tp_filled): (Vec<_>, Vec<_>) =
            self.take_profit.iter().cloned().partition(|t| t.is_resting_in(live));

        if spike_filled.is_empty() && tp_filled.is_empty() {
            return Ok(());
        }

        let target = market.round_price(ma);
        let counters: Vec<TradeOrder> = spike_filled
            .iter()
            .map(|filled| size_order(market, filled.side().opposite(), target, self.config.order_amount))
            .collect();

        // A take-profit at an unchanged average shares price and side with one
        // already resting, so ids held by either list are never handed out again
        let held = tracked_ids(self.spike.iter().chain(self.take_profit.iter()));
        let mut placed = Vec::new();
        let outcome = place_tracked(ctx, TrackedRole::TakeProfit, counters, &held, &mut placed).await;

        // Spike fills whose take-profit never reached the book are retried next poll
        let settled = placed.len();
        let unsettled = spike_filled[settled..].to_vec();

        for (filled, role) in spike_filled[..settled]
            .iter()
            .map(|t| (t, "spike"))
            .chain(tp_filled.iter().map(|t| (t, "take_profit")))
        {
            info!(
                "[spike] {}: {} {} filled at {}",
                self.config.symbol, role, filled.order.side, filled.order.price
            );
            ctx.notifier.emit(
                EventKind::OrderFilled,
                json!({
                    "symbol": self.config.symbol,
                    "role": role,
                    "side": filled.order.side,
                    "price": filled.order.price.to_string(),
                    "quantity": filled.order.quantity.to_string(),
                    "order_id": filled.order_id,
                }),
            );
        }

        self.spike = spike_resting;
        self.spike.extend(unsettled);
        self.take_profit = tp_resting;
        self.take_profit.extend(placed);
        outcome.map(|_| ())
    }

    async fn place_ladder(&mut self, ctx: &BotContext, market: &Market, ma: Decimal) -> BotResult<()> {
        let orders = spike_ladder(market, &self.config, ma);
        if !ensure_balance(ctx, market, &orders).await? {
            return Ok(());
        }

        let held = tracked_ids(&self.take_profit);
        let outcome = place_tracked(ctx, TrackedRole::Spike, orders, &held, &mut self.spike).await;
        if !self.spike.is_empty() {
            self.last_order_ma = Some(ma);
        }
        outcome?;
        info!(
            "[spike] {}: placed {} orders around {}",
            self.config.symbol,
            self.spike.len(),
            ma
        );
        ctx.notifier.emit(
            EventKind::GridPlaced,
            json!({
                "symbol": self.config.symbol,
                "orders": self.spike.len(),
                "moving_average": ma.to_string(),
            }),
        );
        Ok(())
    }
}

/// Spike strategy over every configured pair
pub struct SpikeStrategy {
    rebalance_threshold_pct: Decimal,
    store: TrackedOrderStore,
    pairs: Vec<PairState>,
}

impl SpikeStrategy {
    pub fn new(settings: SpikeSettings, store: TrackedOrderStore) -> Self {
        let pairs = settings
            .pairs
            .into_iter()
            .map(|config| PairState::new(config, settings.ma_window))
            .collect();
        Self {
            rebalance_threshold_pct: settings.rebalance_threshold_pct,
            store,
            pairs,
        }
    }

    fn pair(&self, symbol: &str) -> Option<&PairState> {
        self.pairs.iter().find(|p| p.symbol() == symbol)
    }

    pub fn spike_orders(&self, symbol: &str) -> &[TrackedOrder] {
        self.pair(symbol).map(|p| p.spike.as_slice()).unwrap_or(&[])
    }

    pub fn take_profit_orders(&self, symbol: &str) -> &[TrackedOrder] {
        self.pair(symbol).map(|p| p.take_profit.as_slice()).unwrap_or(&[])
    }

    /// Average from the last completed poll
    pub fn moving_average(&self, symbol: &str) -> Option<Decimal> {
        self.pair(symbol).and_then(|p| p.current_ma)
    }

    fn all_tracked(&self) -> Vec<TrackedOrder> {
        self.pairs
            .iter()
            .flat_map(|p| p.spike.iter().chain(p.take_profit.iter()).cloned())
            .collect()
    }
}

#[async_trait]
impl Strategy for SpikeStrategy {
    fn name(&self) -> &'static str {
        "spike"
    }

    fn symbols(&self) -> Vec<String> {
        self.pairs.iter().map(|p| p.config.symbol.clone()).collect()
    }

    async fn initialize(&mut self, _ctx: &BotContext) -> BotResult<()> {
        let mut restored = 0;
        for order in self.store.load() {
            let Some(pair) = self.pairs.iter_mut().find(|p| p.config.symbol == order.symbol()) else {
                warn!("[spike] ignoring persisted order on unconfigured pair {}", order.symbol());
                continue;
            };
            match order.role {
                TrackedRole::Spike => pair.spike.push(order),
                TrackedRole::TakeProfit => pair.take_profit.push(order),
                other => {
                    warn!("[spike] ignoring persisted {:?} order on {}", other, order.symbol());
                    continue;
                }
            }
            restored += 1;
        }
        info!("[spike] restored {} tracked orders", restored);
        Ok(())
    }

    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()> {
        let threshold = self.rebalance_threshold_pct;
        for pair in self.pairs.iter_mut() {
            if let Err(e) = pair.poll(ctx, threshold).await {
                report_pair_error(ctx, "spike", &pair.config.symbol, &e);
            }
        }
        self.store.save(self.name(), &self.all_tracked());
        Ok(())
    }

    async fn cancel_own_orders(&mut self, ctx: &BotContext) -> BotResult<()> {
        let mut all = self.all_tracked();
        let all_cancelled = cancel_tracked_orders(ctx, &mut all).await;
        for pair in self.pairs.iter_mut() {
            pair.spike.clear();
            pair.take_profit.clear();
            pair.last_order_ma = None;
        }

        if all_cancelled {
            self.store.cleanup();
            Ok(())
        } else {
            Err(BotError::Gateway("some spike orders could not be cancelled".into()))
        }
    }
}
