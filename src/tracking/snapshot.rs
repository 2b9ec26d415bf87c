//! Informational dump of exchange-reported open orders, for external observers.
//! Never read back by the bot.

use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::{now_millis, write_json_atomic};
use crate::market::{MarketDataProvider, OpenOrder};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOrderState {
    pub symbol: String,
    pub open_orders: Vec<OpenOrder>,
    /// Set when the open orders of this market could not be fetched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStateSnapshot {
    pub instance_id: String,
    pub account: String,
    pub saved_at: u64,
    pub markets: Vec<MarketOrderState>,
}

/// Writes `{state_dir}/{instance_id}-order-state.json`
#[derive(Debug, Clone)]
pub struct OrderStateWriter {
    target: Option<(String, PathBuf)>,
}

impl OrderStateWriter {
    pub fn new(state_dir: Option<&Path>, instance_id: Option<&str>) -> Self {
        let target = match (state_dir, instance_id) {
            (Some(dir), Some(id)) if !id.is_empty() => {
                Some((id.to_string(), dir.join(format!("{}-order-state.json", id))))
            }
            _ => None,
        };
        Self { target }
    }

    pub fn path(&self) -> Option<&Path> {
        self.target.as_ref().map(|(_, path)| path.as_path())
    }

    /// Fetch and dump the open orders of every symbol. Failures are logged only.
    pub async fn record(&self, provider: &dyn MarketDataProvider, account: &str, symbols: &[String]) {
        let Some((instance_id, path)) = &self.target else {
            return;
        };

        let mut markets = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let state = match provider.fetch_pair_open_orders(account, symbol).await {
                Ok(open_orders) => MarketOrderState {
                    symbol: symbol.clone(),
                    open_orders,
                    error: None,
                },
                Err(e) => MarketOrderState {
                    symbol: symbol.clone(),
                    open_orders: Vec::new(),
                    error: Some(e.to_string()),
                },
            };
            markets.push(state);
        }

        let snapshot = OrderStateSnapshot {
            instance_id: instance_id.clone(),
            account: account.to_string(),
            saved_at: now_millis(),
            markets,
        };
        match write_json_atomic(path, &snapshot) {
            Ok(()) => debug!("Wrote order-state snapshot {:?}", path),
            Err(e) => warn!("Failed to write order-state snapshot {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{OrderGateway, PaperExchange, TradeOrder};
    use crate::strategy::test_support::xpr_market;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_snapshot_lists_open_orders_per_market() {
        let dir = tempfile::tempdir().unwrap();
        let exchange = PaperExchange::new().with_markets(vec![xpr_market()]);
        exchange.set_balance("XPR", dec!(10000)).await;
        exchange
            .submit_orders(&[TradeOrder::sell("XPR_XUSDC", dec!(0.005159), dec!(5250))])
            .await
            .unwrap();

        let writer = OrderStateWriter::new(Some(dir.path()), Some("bot-1"));
        writer
            .record(&exchange, "trader", &["XPR_XUSDC".to_string()])
            .await;

        let content = std::fs::read_to_string(dir.path().join("bot-1-order-state.json")).unwrap();
        let snapshot: OrderStateSnapshot = serde_json::from_str(&content).unwrap();
        assert_eq!(snapshot.account, "trader");
        assert_eq!(snapshot.markets.len(), 1);
        assert_eq!(snapshot.markets[0].open_orders.len(), 1);
        assert_eq!(snapshot.markets[0].open_orders[0].price, dec!(0.005159));
    }

    #[tokio::test]
    async fn test_disabled_writer() {
        let writer = OrderStateWriter::new(None, Some("bot-1"));
        assert!(writer.path().is_none());
        writer.record(&PaperExchange::new(), "trader", &[]).await;
    }
}
