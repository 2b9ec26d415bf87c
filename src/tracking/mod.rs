//! Orders this process believes are resting on the book, and their persistence

mod snapshot;
mod store;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::BotResult;
use crate::market::{OpenOrder, OrderSide, TradeOrder};

pub use snapshot::{MarketOrderState, OrderStateSnapshot, OrderStateWriter};
pub use store::{TrackedOrderRecord, TrackedOrderStore};

/// Which engine placed a tracked order, and why
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedRole {
    /// A rung of the grid ladder, or a counter-order replacing one
    Grid,
    /// Deviation order around the moving average
    Spike,
    /// Counter to a filled spike order, priced at the moving average
    TakeProfit,
    /// Market-maker quote
    Quote,
}

/// A submitted order plus its exchange id once resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedOrder {
    pub role: TrackedRole,
    #[serde(flatten)]
    pub order: TradeOrder,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Placement time, ms since epoch
    pub placed_at: u64,
}

impl TrackedOrder {
    pub fn new(role: TrackedRole, order: TradeOrder) -> Self {
        Self {
            role,
            order,
            order_id: None,
            placed_at: now_millis(),
        }
    }

    /// Adopt an order reported by the exchange
    pub fn from_open(role: TrackedRole, open: &OpenOrder) -> Self {
        Self {
            role,
            order: TradeOrder::new(open.symbol.clone(), open.side, open.price, open.quantity),
            order_id: Some(open.order_id.clone()),
            placed_at: now_millis(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.order.symbol
    }

    pub fn side(&self) -> OrderSide {
        self.order.side
    }

    /// Same order: by id when known, otherwise by exact price and side
    pub fn matches(&self, open: &OpenOrder) -> bool {
        match &self.order_id {
            Some(id) => *id == open.order_id,
            None => open.price == self.order.price && open.side == self.order.side,
        }
    }

    /// Still present in the live open-order list
    pub fn is_resting_in(&self, live: &[OpenOrder]) -> bool {
        live.iter().any(|open| self.matches(open))
    }
}

/// Fill in missing order ids by matching live orders on symbol, price and side.
///
/// A live id already claimed by another entry of `tracked`, or listed in
/// `held` (ids the caller tracks elsewhere), is never assigned.
pub fn resolve_order_ids(tracked: &mut [TrackedOrder], live: &[OpenOrder], held: &HashSet<String>) {
    let mut claimed: HashSet<String> = tracked.iter().filter_map(|t| t.order_id.clone()).collect();
    claimed.extend(held.iter().cloned());

    for entry in tracked.iter_mut().filter(|t| t.order_id.is_none()) {
        let found = live.iter().find(|open| {
            open.symbol == entry.order.symbol
                && open.side == entry.order.side
                && open.price == entry.order.price
                && !claimed.contains(&open.order_id)
        });
        if let Some(open) = found {
            claimed.insert(open.order_id.clone());
            entry.order_id = Some(open.order_id.clone());
        }
    }
}

/// Ids of every tracked order whose id is known
pub fn tracked_ids<'a>(tracked: impl IntoIterator<Item = &'a TrackedOrder>) -> HashSet<String> {
    tracked.into_iter().filter_map(|t| t.order_id.clone()).collect()
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}

/// Serialize `value` to `path` atomically: write a sibling `.tmp`, then rename over the target
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> BotResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");
    let temp_path = Path::new(&temp);

    let content = serde_json::to_string_pretty(value)?;
    fs::write(temp_path, content)?;
    fs::rename(temp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn open(id: &str, side: OrderSide, price: Decimal) -> OpenOrder {
        OpenOrder {
            order_id: id.into(),
            symbol: "XPR_XUSDC".into(),
            side,
            price,
            quantity: dec!(1),
        }
    }

    fn tracked(side: OrderSide, price: Decimal) -> TrackedOrder {
        TrackedOrder::new(TrackedRole::Grid, TradeOrder::new("XPR_XUSDC", side, price, dec!(1)))
    }

    #[test]
    fn test_matches_prefers_id() {
        let mut order = tracked(OrderSide::Sell, dec!(0.005159));
        assert!(order.matches(&open("9", OrderSide::Sell, dec!(0.005159))));
        assert!(!order.matches(&open("9", OrderSide::Buy, dec!(0.005159))));

        order.order_id = Some("7".into());
        assert!(!order.matches(&open("9", OrderSide::Sell, dec!(0.005159))));
        assert!(order.matches(&open("7", OrderSide::Sell, dec!(0.004))));
    }

    #[test]
    fn test_resolve_ids_never_claims_twice() {
        let mut orders = vec![
            tracked(OrderSide::Buy, dec!(0.005141)),
            tracked(OrderSide::Buy, dec!(0.005141)),
            tracked(OrderSide::Sell, dec!(0.005159)),
        ];
        orders[2].order_id = Some("3".into());
        let live = vec![
            open("1", OrderSide::Buy, dec!(0.005141)),
            open("3", OrderSide::Sell, dec!(0.005159)),
        ];

        resolve_order_ids(&mut orders, &live, &HashSet::new());

        assert_eq!(orders[0].order_id.as_deref(), Some("1"));
        assert_eq!(orders[1].order_id, None);
        assert_eq!(orders[2].order_id.as_deref(), Some("3"));
        assert_eq!(tracked_ids(&orders).len(), 2);
    }

    #[test]
    fn test_resolve_ids_skips_held_ids() {
        let mut orders = vec![tracked(OrderSide::Sell, dec!(100))];
        let live = vec![
            open("5", OrderSide::Sell, dec!(100)),
            open("8", OrderSide::Sell, dec!(100)),
        ];
        let held: HashSet<String> = ["5".to_string()].into_iter().collect();

        resolve_order_ids(&mut orders, &live, &held);

        assert_eq!(orders[0].order_id.as_deref(), Some("8"));
    }

    #[test]
    fn test_tracked_order_json_shape() {
        let mut order = tracked(OrderSide::Buy, dec!(0.005141));
        order.role = TrackedRole::TakeProfit;
        let json = serde_json::to_value(&order).unwrap();

        assert_eq!(json["role"], "take_profit");
        assert_eq!(json["side"], "buy");
        assert_eq!(json["symbol"], "XPR_XUSDC");
        assert!(json.get("order_id").is_none());
    }

    #[test]
    fn test_write_json_atomic_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_json_atomic(&path, &vec![1, 2, 3]).unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap().replace(char::is_whitespace, ""), "[1,2,3]");
        assert!(!dir.path().join("nested").join("state.json.tmp").exists());
    }
}
