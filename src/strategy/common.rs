//! Building blocks shared by the strategies

use std::collections::{BTreeSet, HashSet};

use log::{error, info, warn};
use rust_decimal::Decimal;
use serde_json::json;

use super::BotContext;
use crate::decimal::quantity_and_adjusted_total;
use crate::errors::{BotError, BotResult};
use crate::market::{submit_in_batches, Market, OpenOrder, OrderSide, TradeOrder};
use crate::notify::EventKind;
use crate::tracking::{resolve_order_ids, TrackedOrder, TrackedRole};

/// Size an order of `amount` bid-token units at `price`.
///
/// A SELL commits the bid-token quantity, a BUY the adjusted ask-token spend.
pub(crate) fn size_order(market: &Market, side: OrderSide, price: Decimal, amount: Decimal) -> TradeOrder {
    let sized = quantity_and_adjusted_total(
        price,
        amount,
        market.bid_token.precision,
        market.ask_token.precision,
    );
    let quantity = match side {
        OrderSide::Buy => sized.adjusted_total,
        OrderSide::Sell => sized.quantity,
    };
    TradeOrder::new(market.symbol.clone(), side, price, quantity)
}

pub(crate) async fn fetch_live(ctx: &BotContext, symbol: &str) -> BotResult<Vec<OpenOrder>> {
    ctx.provider.fetch_pair_open_orders(&ctx.account, symbol).await
}

/// Check the account can fund `orders`: SELL size against the bid token,
/// BUY spend against the ask token.
///
/// Emits `BALANCE_LOW` and returns `false` on the first shortfall.
pub(crate) async fn ensure_balance(ctx: &BotContext, market: &Market, orders: &[TradeOrder]) -> BotResult<bool> {
    let (sell_total, buy_total) = orders.iter().fold((Decimal::ZERO, Decimal::ZERO), |(sell, buy), o| {
        match o.side {
            OrderSide::Sell => (sell + o.quantity, buy),
            OrderSide::Buy => (sell, buy + o.quantity),
        }
    });

    for (token, required) in [(&market.bid_token, sell_total), (&market.ask_token, buy_total)] {
        if required.is_zero() {
            continue;
        }
        let available = ctx
            .provider
            .fetch_token_balance(&ctx.account, &token.contract, &token.code)
            .await?;
        if required > available {
            let shortfall = BotError::InsufficientBalance {
                token: token.code.clone(),
                required,
                available,
            };
            warn!("[{}] {}", market.symbol, shortfall);
            ctx.notifier.emit(
                EventKind::BalanceLow,
                json!({
                    "symbol": market.symbol,
                    "token": token.code,
                    "requested": required.to_string(),
                    "available": available.to_string(),
                }),
            );
            return Ok(false);
        }
    }
    Ok(true)
}

/// Submit `orders` and append every one that reached the book to `tracked`
/// under `role`.
///
/// Ids are resolved against the open orders reported right after submission,
/// never reusing an id in `held`. When a batch fails, the orders of the earlier
/// batches are tracked before the error is returned, so nothing accepted is
/// placed twice. Returns the number of orders tracked.
pub(crate) async fn place_tracked(
    ctx: &BotContext,
    role: TrackedRole,
    orders: Vec<TradeOrder>,
    held: &HashSet<String>,
    tracked: &mut Vec<TrackedOrder>,
) -> BotResult<usize> {
    if orders.is_empty() {
        return Ok(0);
    }
    let outcome = submit_in_batches(ctx.gateway.as_ref(), &orders, &ctx.execution).await;
    let accepted = match &outcome {
        Ok(()) => orders.len(),
        Err(partial) => partial.accepted,
    };

    let mut placed: Vec<TrackedOrder> = orders
        .into_iter()
        .take(accepted)
        .map(|o| TrackedOrder::new(role, o))
        .collect();
    resolve_tracked_ids(ctx, &mut placed, held).await;

    if !placed.is_empty() {
        let symbols: BTreeSet<&str> = placed.iter().map(|t| t.symbol()).collect();
        ctx.notifier.emit(
            EventKind::OrderPlaced,
            json!({
                "role": role,
                "symbols": symbols,
                "orders": placed.iter().map(|t| &t.order).collect::<Vec<_>>(),
            }),
        );
    }
    tracked.extend(placed);

    if let Err(partial) = outcome {
        warn!("{} of the {:?} orders reached the book before a batch failed", accepted, role);
        return Err(partial.into());
    }
    Ok(accepted)
}

/// Best-effort id resolution; a failed lookup leaves ids unresolved for the
/// price and side fallback
pub(crate) async fn resolve_tracked_ids(ctx: &BotContext, tracked: &mut [TrackedOrder], held: &HashSet<String>) {
    let symbols: BTreeSet<String> = tracked
        .iter()
        .filter(|t| t.order_id.is_none())
        .map(|t| t.symbol().to_string())
        .collect();

    for symbol in symbols {
        match fetch_live(ctx, &symbol).await {
            Ok(live) => resolve_order_ids(tracked, &live, held),
            Err(e) => warn!("[{}] could not resolve order ids: {}", symbol, e),
        }
    }
}

/// Cancel the pair's live orders except those in `keep`, withdraw, and pause
pub(crate) async fn clear_pair(ctx: &BotContext, symbol: &str, keep: &HashSet<String>) -> BotResult<usize> {
    let live = fetch_live(ctx, symbol).await?;
    let mut cancelled = 0;
    for order in live.iter().filter(|o| !keep.contains(&o.order_id)) {
        ctx.gateway.cancel_order(&order.order_id).await?;
        cancelled += 1;
    }
    if cancelled > 0 {
        info!("[{}] cancelled {} orders", symbol, cancelled);
        ctx.notifier.emit(
            EventKind::OrderCancelled,
            json!({ "symbol": symbol, "count": cancelled }),
        );
    }

    ctx.gateway.withdraw_all().await?;
    ctx.rebalance_pause().await;
    Ok(cancelled)
}

/// Cancel every tracked order that is still live.
///
/// Returns `true` only if every cancellation and lookup succeeded.
pub(crate) async fn cancel_tracked_orders(ctx: &BotContext, tracked: &mut [TrackedOrder]) -> bool {
    let symbols: BTreeSet<String> = tracked.iter().map(|t| t.symbol().to_string()).collect();
    let mut all_ok = true;

    for symbol in symbols {
        let live = match fetch_live(ctx, &symbol).await {
            Ok(live) => live,
            Err(e) => {
                error!("[{}] could not list open orders for cancellation: {}", symbol, e);
                all_ok = false;
                continue;
            }
        };
        resolve_order_ids(tracked, &live, &HashSet::new());

        for entry in tracked.iter().filter(|t| t.symbol() == symbol) {
            let Some(order_id) = entry.order_id.as_deref() else {
                continue;
            };
            if !live.iter().any(|o| o.order_id == order_id) {
                continue;
            }
            match ctx.gateway.cancel_order(order_id).await {
                Ok(()) => ctx.notifier.emit(
                    EventKind::OrderCancelled,
                    json!({ "symbol": symbol, "order_id": order_id, "price": entry.order.price.to_string() }),
                ),
                Err(e) => {
                    error!("[{}] failed to cancel order {}: {}", symbol, order_id, e);
                    all_ok = false;
                }
            }
        }
    }
    all_ok
}

/// Per-pair error policy: data anomalies skip the pair quietly, everything
/// else is logged and reported
pub(crate) fn report_pair_error(ctx: &BotContext, strategy: &str, symbol: &str, err: &BotError) {
    if err.is_skip_condition() {
        warn!("[{}] skipping {}: {}", strategy, symbol, err);
        return;
    }
    error!("[{}] {} failed: {}", strategy, symbol, err);
    ctx.notifier.emit(
        EventKind::BotError,
        json!({ "strategy": strategy, "symbol": symbol, "error": err.to_string() }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::OrderGateway;
    use crate::strategy::test_support::{context, paper_exchange, xpr_market, SYMBOL};
    use rust_decimal_macros::dec;

    #[test]
    fn test_size_order_by_side() {
        let market = xpr_market();
        let sell = size_order(&market, OrderSide::Sell, dec!(0.005159), dec!(5250));
        let buy = size_order(&market, OrderSide::Buy, dec!(0.005141), dec!(5250));

        assert_eq!(sell.quantity, dec!(5250));
        assert_eq!(buy.quantity, dec!(26.99025));
    }

    #[tokio::test]
    async fn test_ensure_balance_emits_balance_low() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(100)).await;
        let (ctx, mut queue) = context(exchange);
        let market = xpr_market();

        let ok = ensure_balance(&ctx, &market, &[TradeOrder::sell(SYMBOL, dec!(0.0052), dec!(150))])
            .await
            .unwrap();

        assert!(!ok);
        let event = queue.try_next_event().unwrap();
        assert_eq!(event.kind, EventKind::BalanceLow);
        assert_eq!(event.payload["requested"], "150");
        assert_eq!(event.payload["available"], "100");
    }

    #[tokio::test]
    async fn test_clear_pair_keeps_listed_ids() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(1000)).await;
        exchange
            .submit_orders(&[
                TradeOrder::sell(SYMBOL, dec!(0.0052), dec!(10)),
                TradeOrder::sell(SYMBOL, dec!(0.0053), dec!(10)),
            ])
            .await
            .unwrap();
        let keep_id = exchange.open_orders().await[1].order_id.clone();
        let (ctx, _queue) = context(exchange.clone());

        let keep: HashSet<String> = [keep_id.clone()].into_iter().collect();
        let cancelled = clear_pair(&ctx, SYMBOL, &keep).await.unwrap();

        assert_eq!(cancelled, 1);
        assert_eq!(exchange.open_orders().await[0].order_id, keep_id);
        assert_eq!(exchange.withdraw_count().await, 1);
    }

    #[tokio::test]
    async fn test_place_tracked_keeps_accepted_batches_on_failure() {
        let exchange = paper_exchange();
        exchange.set_balance("XPR", dec!(1000)).await;
        exchange.fail_after_batches(1).await;
        let (ctx, _queue) = context(exchange.clone());

        let orders: Vec<TradeOrder> = (1..=15)
            .map(|i| TradeOrder::sell(SYMBOL, dec!(0.005) + Decimal::new(i, 6), dec!(10)))
            .collect();
        let mut tracked = Vec::new();
        let result = place_tracked(&ctx, TrackedRole::Quote, orders, &HashSet::new(), &mut tracked).await;

        assert!(matches!(result, Err(BotError::Gateway(_))));
        assert_eq!(tracked.len(), 10);
        assert!(tracked.iter().all(|t| t.order_id.is_some()));
        assert_eq!(exchange.open_orders().await.len(), 10);
    }

    #[tokio::test]
    async fn test_report_pair_error_policy() {
        let (ctx, mut queue) = context(paper_exchange());

        report_pair_error(&ctx, "grid", SYMBOL, &BotError::MarketNotFound(SYMBOL.into()));
        assert!(queue.try_next_event().is_none());

        report_pair_error(&ctx, "grid", SYMBOL, &BotError::MarketData("timeout".into()));
        assert_eq!(queue.try_next_event().unwrap().kind, EventKind::BotError);
    }
}
