//! Grid strategy
//!
//! Each pair moves between two states:
//!
//! - **uninitialized**: nothing tracked; the next poll places the full ladder
//! - **ladder placed**: orders are tracked; whenever at least one but not every
//!   level is still resting on the book, the missing ones are treated as filled
//!   and replaced with counter-orders one grid step away on the other side
//!
//! There is no way back to uninitialized while the process runs. If every
//! tracked level fills so that nothing rests on the book, the pair only logs a
//! warning each poll and is not re-laddered; a restart after clearing the state
//! file places a fresh ladder. A ladder cut short by a failed batch stays at the
//! levels that reached the book.
//!
//! Ladder bounds are configured in bid-token base units (price scaled by the bid
//! token's multiplier) and every price is rounded to the ask token's precision.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use log::{debug, info, warn};
use rust_decimal::Decimal;
use serde_json::json;

use super::common::{
    cancel_tracked_orders, ensure_balance, fetch_live, report_pair_error, resolve_tracked_ids, size_order,
};
use super::{BotContext, Strategy};
use crate::config::{GridPairConfig, GridSettings};
use crate::errors::{BotError, BotResult};
use crate::market::{submit_in_batches, Market, OpenOrder, OrderSide, TradeOrder};
use crate::notify::EventKind;
use crate::tracking::{TrackedOrder, TrackedOrderStore, TrackedRole};

/// Spread assumed to be already covered by one grid step, in percent
const BASE_SPREAD_PCT: Decimal = Decimal::from_parts(1, 0, 0, false, 1);

/// Ladder spacing of one pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GridGeometry {
    /// Level spacing in bid-token base units
    grid_size: Decimal,
    /// Bid-token multiplier converting base units to prices
    scale: Decimal,
    /// Level spacing as a price, rounded to the ask precision
    grid_price: Decimal,
}

impl GridGeometry {
    fn new(market: &Market, pair: &GridPairConfig) -> BotResult<Self> {
        let grid_size = (pair.upper_limit - pair.lower_limit)
            .checked_div(Decimal::from(pair.grid_levels))
            .ok_or_else(|| BotError::DataIntegrity(format!("{}: grid_levels is zero", pair.symbol)))?;
        let scale = market.bid_token.multiplier;
        let grid_price = grid_size
            .checked_div(scale)
            .map(|p| market.round_price(p))
            .ok_or_else(|| BotError::DataIntegrity(format!("{}: zero bid multiplier", pair.symbol)))?;
        if grid_price <= Decimal::ZERO {
            return Err(BotError::DataIntegrity(format!(
                "{}: grid step rounds to zero at precision {}",
                pair.symbol, market.ask_token.precision
            )));
        }
        Ok(Self {
            grid_size,
            scale,
            grid_price,
        })
    }

    /// Price of level `index`, counted down from the upper limit
    fn level_price(&self, market: &Market, upper_limit: Decimal, index: u32) -> Decimal {
        market.round_price((upper_limit - self.grid_size * Decimal::from(index)) / self.scale)
    }
}

/// Initial ladder for one pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderPlan {
    pub orders: Vec<TradeOrder>,
    /// Upper bound on the number of orders this ladder may hold
    pub max_grids: usize,
    pub grid_price: Decimal,
}

/// Compute the initial ladder around `last_sale`.
///
/// Levels within half a grid step of the last sale are skipped; the rest are
/// SELLs above it and BUYs below it. A level exactly at the last sale is dropped.
pub fn plan_ladder(market: &Market, pair: &GridPairConfig, last_sale: Decimal) -> BotResult<LadderPlan> {
    if last_sale <= Decimal::ZERO {
        return Err(BotError::DataIntegrity(format!(
            "{}: non-positive last sale {}",
            pair.symbol, last_sale
        )));
    }
    let geometry = GridGeometry::new(market, pair)?;
    let last_sale = market.round_price(last_sale);
    let half_step = geometry.grid_price / Decimal::TWO;

    let upper_price = pair.upper_limit / geometry.scale;
    let lower_price = pair.lower_limit / geometry.scale;

    let mut max_grids = pair.grid_levels;
    let mut start = 0;
    if last_sale > upper_price && last_sale > lower_price {
        max_grids -= 1;
    }
    if last_sale < upper_price && last_sale < lower_price {
        start = 1;
    }

    let mut orders = Vec::new();
    for index in start..max_grids {
        let price = geometry.level_price(market, pair.upper_limit, index);
        if price <= Decimal::ZERO || (price - last_sale).abs() < half_step {
            continue;
        }
        let side = match price.cmp(&last_sale) {
            std::cmp::Ordering::Greater => OrderSide::Sell,
            std::cmp::Ordering::Less => OrderSide::Buy,
            std::cmp::Ordering::Equal => continue,
        };
        orders.push(size_order(market, side, price, pair.bid_amount_per_level));
    }

    Ok(LadderPlan {
        orders,
        max_grids: max_grids as usize,
        grid_price: geometry.grid_price,
    })
}

/// Outcome of one fill-detection pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Tracked orders no longer resting on the book
    pub filled: Vec<TrackedOrder>,
    /// Counter-orders to submit, one per fill with a valid price
    pub counters: Vec<TradeOrder>,
    /// Index into `filled` of the fill each counter answers
    pub countered: Vec<usize>,
    /// Live orders plus the counters: the pair's tracked state after submission
    pub working: Vec<TrackedOrder>,
}

/// Diff tracked orders against the live book and synthesize counter-orders.
///
/// A filled BUY is countered by a SELL one step inside the lowest working ask
/// (or one step above the fill when forced or no ask rests). A filled SELL is
/// countered by a BUY one step inside the highest working bid (or one step
/// below the fill), with its amount inflated by the spread adjustment.
/// Every counter joins the working set before the next fill is examined.
pub fn reconcile_fills(
    market: &Market,
    pair: &GridPairConfig,
    force_grid_placement: bool,
    tracked: &[TrackedOrder],
    live: &[OpenOrder],
) -> BotResult<Reconciliation> {
    let geometry = GridGeometry::new(market, pair)?;

    let mut working: Vec<TrackedOrder> = live
        .iter()
        .map(|open| {
            let mut order = TrackedOrder::from_open(TrackedRole::Grid, open);
            if let Some(known) = tracked.iter().find(|t| t.matches(open)) {
                order.placed_at = known.placed_at;
            }
            order
        })
        .collect();
    let mut filled = Vec::new();
    let mut counters = Vec::new();
    let mut countered = Vec::new();

    for order in tracked {
        if order.is_resting_in(live) {
            continue;
        }
        filled.push(order.clone());

        match counter_order(market, pair, force_grid_placement, geometry.grid_price, &order.order, &working)? {
            Some(counter) => {
                working.push(TrackedOrder::new(TrackedRole::Grid, counter.clone()));
                counters.push(counter);
                countered.push(filled.len() - 1);
            }
            None => warn!(
                "[grid] {}: no valid counter for {} filled at {}",
                pair.symbol, order.order.side, order.order.price
            ),
        }
    }

    Ok(Reconciliation {
        filled,
        counters,
        countered,
        working,
    })
}

fn counter_order(
    market: &Market,
    pair: &GridPairConfig,
    force_grid_placement: bool,
    grid_price: Decimal,
    filled: &TradeOrder,
    working: &[TrackedOrder],
) -> BotResult<Option<TradeOrder>> {
    let (side, price, amount) = match filled.side {
        OrderSide::Buy => {
            let lowest_ask = working
                .iter()
                .filter(|t| t.side() == OrderSide::Sell)
                .map(|t| t.order.price)
                .min();
            let price = match lowest_ask {
                Some(ask) if !force_grid_placement => ask - grid_price,
                _ => filled.price + grid_price,
            };
            (OrderSide::Sell, price, pair.bid_amount_per_level)
        }
        OrderSide::Sell => {
            let highest_bid = working
                .iter()
                .filter(|t| t.side() == OrderSide::Buy)
                .map(|t| t.order.price)
                .max();
            let price = match highest_bid {
                Some(bid) if !force_grid_placement => bid + grid_price,
                _ => filled.price - grid_price,
            };
            let amount = spread_adjusted_amount(pair.bid_amount_per_level, grid_price, filled.price)?;
            (OrderSide::Buy, price, amount)
        }
    };

    let price = market.round_price(price);
    if price <= Decimal::ZERO {
        return Ok(None);
    }
    Ok(Some(size_order(market, side, price, amount)))
}

/// Inflate a buy-back amount by `(spread% - 0.1) / 2 + 0.1` percent, where
/// `spread% = grid_price / filled_price * 100`
fn spread_adjusted_amount(base: Decimal, grid_price: Decimal, filled_price: Decimal) -> BotResult<Decimal> {
    let spread_pct = grid_price
        .checked_div(filled_price)
        .map(|r| r * Decimal::ONE_HUNDRED)
        .ok_or_else(|| BotError::DataIntegrity("filled order has zero price".into()))?;
    let adjustment_pct = (spread_pct - BASE_SPREAD_PCT) / Decimal::TWO + BASE_SPREAD_PCT;
    Ok(base * (Decimal::ONE + adjustment_pct / Decimal::ONE_HUNDRED))
}

/// Grid strategy over every configured pair
pub struct GridStrategy {
    settings: GridSettings,
    store: TrackedOrderStore,
    /// Tracked orders by pair symbol
    tracked: HashMap<String, Vec<TrackedOrder>>,
}

impl GridStrategy {
    pub fn new(settings: GridSettings, store: TrackedOrderStore) -> Self {
        Self {
            settings,
            store,
            tracked: HashMap::new(),
        }
    }

    /// Tracked orders of one pair
    pub fn tracked(&self, symbol: &str) -> &[TrackedOrder] {
        self.tracked.get(symbol).map(Vec::as_slice).unwrap_or(&[])
    }

    fn all_tracked(&self) -> Vec<TrackedOrder> {
        self.settings
            .pairs
            .iter()
            .flat_map(|p| self.tracked(&p.symbol).iter().cloned())
            .collect()
    }

    fn persist(&self) {
        self.store.save(self.name(), &self.all_tracked());
    }

    async fn trade_pair(&mut self, ctx: &BotContext, pair: &GridPairConfig) -> BotResult<()> {
        let market = ctx.market(&pair.symbol)?.clone();

        if self.tracked(&pair.symbol).is_empty() {
            return self.place_ladder(ctx, &market, pair).await;
        }

        let live = fetch_live(ctx, &pair.symbol).await?;
        if live.is_empty() {
            warn!(
                "[grid] {}: no open orders on the book while {} are tracked",
                pair.symbol,
                self.tracked(&pair.symbol).len()
            );
            return Ok(());
        }
        if live.len() >= pair.grid_levels as usize {
            debug!("[grid] {}: all {} levels resting", pair.symbol, live.len());
            return Ok(());
        }

        self.adjust_grid(ctx, &market, pair, &live).await
    }

    async fn place_ladder(&mut self, ctx: &BotContext, market: &Market, pair: &GridPairConfig) -> BotResult<()> {
        let last_sale = ctx.provider.fetch_latest_price(&pair.symbol).await?;
        let plan = plan_ladder(market, pair, last_sale)?;

        if plan.orders.is_empty() {
            warn!("[grid] {}: no levels survive around last sale {}", pair.symbol, last_sale);
            return Ok(());
        }
        if !ensure_balance(ctx, market, &plan.orders).await? {
            return Ok(());
        }
        if plan.orders.len() > plan.max_grids {
            warn!(
                "[grid] {}: {} orders exceed {} grid levels, not placing",
                pair.symbol,
                plan.orders.len(),
                plan.max_grids
            );
            return Ok(());
        }

        let outcome = submit_in_batches(ctx.gateway.as_ref(), &plan.orders, &ctx.execution).await;
        let accepted = match &outcome {
            Ok(()) => plan.orders.len(),
            Err(partial) => partial.accepted,
        };
        let mut placed: Vec<TrackedOrder> = plan
            .orders
            .into_iter()
            .take(accepted)
            .map(|o| TrackedOrder::new(TrackedRole::Grid, o))
            .collect();
        resolve_tracked_ids(ctx, &mut placed, &HashSet::new()).await;

        // Levels already on the book stay tracked so the ladder is never placed twice
        if let Err(partial) = outcome {
            warn!(
                "[grid] {}: ladder stopped after {} of {} levels",
                pair.symbol, accepted, plan.max_grids
            );
            if !placed.is_empty() {
                self.tracked.insert(pair.symbol.clone(), placed);
            }
            return Err(partial.into());
        }

        info!(
            "[grid] {}: placed {} levels around {} (step {})",
            pair.symbol,
            placed.len(),
            last_sale,
            plan.grid_price
        );
        ctx.notifier.emit(
            EventKind::GridPlaced,
            json!({
                "symbol": pair.symbol,
                "orders": placed.len(),
                "last_sale": last_sale.to_string(),
                "grid_price": plan.grid_price.to_string(),
            }),
        );
        self.tracked.insert(pair.symbol.clone(), placed);
        Ok(())
    }

    async fn adjust_grid(
        &mut self,
        ctx: &BotContext,
        market: &Market,
        pair: &GridPairConfig,
        live: &[OpenOrder],
    ) -> BotResult<()> {
        let Reconciliation {
            mut filled,
            mut counters,
            countered,
            mut working,
        } = reconcile_fills(
            market,
            pair,
            self.settings.force_grid_placement,
            self.tracked(&pair.symbol),
            live,
        )?;
        if filled.is_empty() {
            return Ok(());
        }

        // Tracked state only moves for counters that reached the book; fills
        // whose counter was rejected stay tracked and are retried next poll
        let outcome = submit_in_batches(ctx.gateway.as_ref(), &counters, &ctx.execution).await;
        let accepted = match &outcome {
            Ok(()) => counters.len(),
            Err(partial) => partial.accepted,
        };
        if outcome.is_err() && accepted == 0 {
            return outcome.map_err(BotError::from);
        }
        let mut retry = Vec::new();
        if accepted < counters.len() {
            working.truncate(working.len() - (counters.len() - accepted));
            counters.truncate(accepted);

            let unanswered: HashSet<usize> = countered[accepted..].iter().copied().collect();
            let (pending, answered): (Vec<_>, Vec<_>) = filled
                .into_iter()
                .enumerate()
                .partition(|(index, _)| unanswered.contains(index));
            retry = pending.into_iter().map(|(_, order)| order).collect();
            filled = answered.into_iter().map(|(_, order)| order).collect();
        }
        resolve_tracked_ids(ctx, &mut working, &HashSet::new()).await;

        for order in &filled {
            info!(
                "[grid] {}: {} filled at {} (qty {})",
                pair.symbol, order.order.side, order.order.price, order.order.quantity
            );
            ctx.notifier.emit(
                EventKind::OrderFilled,
                json!({
                    "symbol": pair.symbol,
                    "side": order.order.side,
                    "price": order.order.price.to_string(),
                    "quantity": order.order.quantity.to_string(),
                    "order_id": order.order_id,
                }),
            );
        }
        if !filled.is_empty() {
            ctx.notifier.emit(
                EventKind::GridAdjusted,
                json!({
                    "symbol": pair.symbol,
                    "filled": filled.len(),
                    "counters": counters,
                }),
            );
        }

        working.extend(retry);
        self.tracked.insert(pair.symbol.clone(), working);
        outcome.map_err(BotError::from)
    }
}

#[async_trait]
impl Strategy for GridStrategy {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn symbols(&self) -> Vec<String> {
        self.settings.pairs.iter().map(|p| p.symbol.clone()).collect()
    }

    async fn initialize(&mut self, _ctx: &BotContext) -> BotResult<()> {
        for order in self.store.load() {
            if order.role != TrackedRole::Grid {
                warn!("[grid] ignoring persisted {:?} order on {}", order.role, order.symbol());
                continue;
            }
            if !self.settings.pairs.iter().any(|p| p.symbol == order.symbol()) {
                warn!("[grid] ignoring persisted order on unconfigured pair {}", order.symbol());
                continue;
            }
            self.tracked.entry(order.symbol().to_string()).or_default().push(order);
        }

        for pair in &self.settings.pairs {
            info!(
                "[grid] {}: restored {} tracked orders",
                pair.symbol,
                self.tracked(&pair.symbol).len()
            );
        }
        Ok(())
    }

    async fn trade(&mut self, ctx: &BotContext) -> BotResult<()> {
        let pairs = self.settings.pairs.clone();
        for pair in &pairs {
            if let Err(e) = self.trade_pair(ctx, pair).await {
                report_pair_error(ctx, self.name(), &pair.symbol, &e);
            }
        }
        self.persist();
        Ok(())
    }

    async fn cancel_own_orders(&mut self, ctx: &BotContext) -> BotResult<()> {
        let mut all = self.all_tracked();
        let all_cancelled = cancel_tracked_orders(ctx, &mut all).await;
        self.tracked.clear();

        if all_cancelled {
            self.store.cleanup();
            Ok(())
        } else {
            Err(BotError::Gateway("some grid orders could not be cancelled".into()))
        }
    }
}
