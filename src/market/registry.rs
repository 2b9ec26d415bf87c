//! Read-only market metadata lookup, populated once at startup

use std::collections::HashMap;

use log::info;

use super::provider::MarketDataProvider;
use super::types::Market;
use crate::errors::{BotError, BotResult};

/// In-memory map of every listed market, keyed by symbol and by id
#[derive(Debug, Clone, Default)]
pub struct MarketRegistry {
    by_symbol: HashMap<String, Market>,
    symbol_by_id: HashMap<u64, String>,
}

impl MarketRegistry {
    pub fn new(markets: Vec<Market>) -> Self {
        let mut registry = Self::default();
        for market in markets {
            registry.symbol_by_id.insert(market.market_id, market.symbol.clone());
            registry.by_symbol.insert(market.symbol.clone(), market);
        }
        registry
    }

    /// Fetch the full market listing from the provider
    pub async fn load(provider: &dyn MarketDataProvider) -> BotResult<Self> {
        let markets = provider.fetch_markets().await?;
        if markets.is_empty() {
            return Err(BotError::MarketData("market listing is empty".into()));
        }
        info!("Loaded {} markets", markets.len());
        Ok(Self::new(markets))
    }

    pub fn get_market_by_symbol(&self, symbol: &str) -> Option<&Market> {
        self.by_symbol.get(symbol)
    }

    pub fn get_market_by_id(&self, market_id: u64) -> Option<&Market> {
        self.symbol_by_id
            .get(&market_id)
            .and_then(|symbol| self.by_symbol.get(symbol))
    }

    /// Like [`get_market_by_symbol`](Self::get_market_by_symbol) but a missing
    /// market is an error
    pub fn require(&self, symbol: &str) -> BotResult<&Market> {
        self.get_market_by_symbol(symbol)
            .ok_or_else(|| BotError::MarketNotFound(symbol.to_string()))
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}
