//! Core data types for markets and orders

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::decimal::{multiplier, round_to};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Returns the opposite side
    pub fn opposite(&self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    /// Exchange side string
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token descriptor of one side of a market
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    /// Token code (e.g., "XPR")
    pub code: String,
    /// Native decimal precision
    pub precision: u32,
    /// On-chain contract account
    pub contract: String,
    /// `10^precision`
    pub multiplier: Decimal,
}

impl Token {
    pub fn new(code: impl Into<String>, precision: u32, contract: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            precision,
            contract: contract.into(),
            multiplier: multiplier(precision),
        }
    }

    /// Round an amount of this token to its native precision
    pub fn round(&self, amount: Decimal) -> Decimal {
        round_to(amount, self.precision)
    }
}

/// Static per-pair market metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Market {
    pub market_id: u64,
    /// Pair symbol (e.g., "XPR_XUSDC")
    pub symbol: String,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    /// Base token, in which SELL quantities are expressed
    pub bid_token: Token,
    /// Quote token, in which prices and BUY totals are expressed
    pub ask_token: Token,
}

impl Market {
    /// Round a price to the quote token's precision
    pub fn round_price(&self, price: Decimal) -> Decimal {
        self.ask_token.round(price)
    }
}

/// A desired limit order.
///
/// `quantity` is the bid-token amount for a SELL and the ask-token spend for a BUY.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub quantity: Decimal,
}

impl TradeOrder {
    pub fn new(symbol: impl Into<String>, side: OrderSide, price: Decimal, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            price,
            quantity,
        }
    }

    pub fn buy(symbol: impl Into<String>, price: Decimal, quantity: Decimal) -> Self {
        Self::new(symbol, OrderSide::Buy, price, quantity)
    }

    pub fn sell(symbol: impl Into<String>, price: Decimal, quantity: Decimal) -> Self {
        Self::new(symbol, OrderSide::Sell, price, quantity)
    }
}

/// An order the exchange reports as resting on the book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenOrder {
    /// Opaque exchange-assigned id
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub price: Decimal,
    /// Remaining quantity, in the same units as `TradeOrder::quantity`
    pub quantity: Decimal,
}

/// One aggregated price level of the order book
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Order book snapshot: bids best-first (descending), asks best-first (ascending)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBook {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Midpoint of the best bid and ask, if both sides are present
    pub fn mid(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Aggregate open orders into a book limited to `depth` levels per side
    pub fn from_open_orders(orders: &[OpenOrder], depth: usize) -> Self {
        fn aggregate(orders: &[&OpenOrder], depth: usize) -> Vec<BookLevel> {
            let mut levels: Vec<BookLevel> = Vec::new();
            for order in orders {
                match levels.last_mut() {
                    Some(level) if level.price == order.price => level.quantity += order.quantity,
                    _ => levels.push(BookLevel {
                        price: order.price,
                        quantity: order.quantity,
                    }),
                }
            }
            levels.truncate(depth);
            levels
        }

        let mut bids: Vec<&OpenOrder> = orders.iter().filter(|o| o.side == OrderSide::Buy).collect();
        let mut asks: Vec<&OpenOrder> = orders.iter().filter(|o| o.side == OrderSide::Sell).collect();
        bids.sort_by(|a, b| b.price.cmp(&a.price));
        asks.sort_by(|a, b| a.price.cmp(&b.price));

        Self {
            bids: aggregate(&bids, depth),
            asks: aggregate(&asks, depth),
        }
    }
}
